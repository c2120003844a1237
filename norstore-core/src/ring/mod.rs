//! Append-only frame ring buffer over raw NOR flash.
//!
//! User data is packed into frames (4-byte header + payload) written
//! sequentially through the data area of each sector; the last 8 bytes
//! of every sector hold a trailer used for crash recovery. Three
//! cursors order the buffer: `tail` (oldest surviving frame),
//! `unread_tail` (oldest frame not yet marked read) and `head` (write
//! position), with `tail <= unread_tail <= head`. Positions are
//! monotonically increasing byte counts; `pos % size` maps a position
//! to a flash offset, and position arithmetic steps over the trailers.
//!
//! The next sector in write order is erased proactively whenever the
//! erased window ahead of the head runs short, advancing the tail past
//! whatever the erase destroys. Headers are written speculatively
//! (CRC/length erased) when a frame starts and completed in place,
//! which NOR flash permits because completing only clears bits.

mod recovery;

use embedded_storage::nor_flash::MultiwriteNorFlash;

use crate::codec::{
    FrameHeader, FrameHeaderKind, SectorMeta, DATA_SIZE_PER_SECTOR, FRAME_HEADER_SIZE,
    FRAME_PAYLOAD_MAX, PAGE_SIZE, SECTOR_META_SIZE, SECTOR_SIZE,
};
use crate::crc::crc8_update;
use crate::error::RingError;
use crate::partition::FlashRegion;

/// Smallest usable ring: proactive erase needs a sector ahead of the
/// one being written.
pub const RING_MIN_SIZE: u32 = 2 * SECTOR_SIZE as u32;

/// Handle to a stored frame, returned by the cursor queries and
/// consumed by [`FlashRingBuffer::read_payload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FrameInfo {
    /// Monotonic position of the frame header.
    pub start_pos: u64,
    /// Sequence number of the frame.
    pub index: u32,
    /// Payload length in bytes.
    pub length: u16,
}

impl FrameInfo {
    const fn zero() -> Self {
        FrameInfo {
            start_pos: 0,
            index: 0,
            length: 0,
        }
    }
}

/// Write-side state: the frame being assembled at the head.
#[derive(Debug, Clone, Copy)]
struct WriteState {
    start_pos: u64,
    index: u32,
    /// Bytes of the current frame already in flash, header included.
    written: u16,
    /// Running payload CRC.
    crc: u8,
}

/// Byte and frame counts for a span of the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RingStats {
    /// Payload bytes available, frame headers excluded.
    pub data_bytes: u64,
    /// Number of complete frames.
    pub frames: u32,
}

pub struct FlashRingBuffer<S> {
    flash: S,
    region: FlashRegion,
    head: WriteState,
    tail: FrameInfo,
    unread_tail: FrameInfo,
    last_frame: FrameInfo,
    /// Cached trailer of the sector the head writes into.
    cur_meta: SectorMeta,
    next_erase_index: u32,
    /// Erased data bytes between the write position and the sector at
    /// `next_erase_index`. Tracked explicitly: the two boundaries
    /// coincide both on an empty window and on a fully erased ring.
    erased_bytes: u64,
}

const SECTOR: u64 = SECTOR_SIZE as u64;
const DATA_PER_SECTOR: u64 = DATA_SIZE_PER_SECTOR as u64;
const META: u64 = SECTOR_META_SIZE as u64;
const HEADER: u64 = FRAME_HEADER_SIZE as u64;

/// Advance a position, stepping over sector trailers.
fn move_pos(pos: u64, bytes: u64) -> u64 {
    let off = pos % SECTOR;
    debug_assert!(off < DATA_PER_SECTOR);
    let trailers = (off + bytes) / DATA_PER_SECTOR;
    pos + bytes + META * trailers
}

fn sector_base(off: u32) -> u32 {
    off & !(SECTOR_SIZE as u32 - 1)
}

fn offset_in_sector(pos: u64) -> u32 {
    (pos % SECTOR) as u32
}

fn meta_offset_from(off: u32) -> u32 {
    sector_base(off) + DATA_SIZE_PER_SECTOR as u32
}

/// Data bytes between two flash offsets in write order, trailers
/// excluded. Wraps when `end` is behind `start`.
fn data_len_between(size: u64, start: u32, end: u32) -> u64 {
    let s = start as u64;
    let mut e = end as u64;
    if s > e {
        e += size;
    }
    ((e / SECTOR - s / SECTOR) * DATA_PER_SECTOR)
        .wrapping_add(e % SECTOR)
        .wrapping_sub(s % SECTOR)
}

impl<S: MultiwriteNorFlash> FlashRingBuffer<S> {
    /// Open a ring buffer over `region`. With `load_from_flash` the
    /// cursors are reconstructed from flash contents; corruption or an
    /// empty region falls back to a fresh, erased buffer. Without it
    /// the region is reset immediately.
    pub fn new(flash: S, region: FlashRegion, load_from_flash: bool) -> Result<Self, RingError> {
        if !region.is_sector_aligned()
            || region.size < RING_MIN_SIZE
            || region.end() as usize > flash.capacity()
        {
            return Err(RingError::BadParams);
        }

        let mut ring = Self {
            flash,
            region,
            head: WriteState {
                start_pos: 0,
                index: 0,
                written: 0,
                crc: 0,
            },
            tail: FrameInfo::zero(),
            unread_tail: FrameInfo::zero(),
            last_frame: FrameInfo::zero(),
            cur_meta: SectorMeta::ERASED,
            next_erase_index: 1,
            erased_bytes: 0,
        };
        if load_from_flash {
            ring.init_from_flash()?;
        } else {
            ring.reset()?;
        }
        Ok(ring)
    }

    /// Give the flash device back.
    pub fn into_flash(self) -> S {
        self.flash
    }

    /// Direct access to the flash device. Mutating the buffer's region
    /// behind its back invalidates the cursors.
    pub fn flash_mut(&mut self) -> &mut S {
        &mut self.flash
    }

    pub fn region(&self) -> FlashRegion {
        self.region
    }

    fn size(&self) -> u64 {
        self.region.size as u64
    }

    fn sectors(&self) -> u32 {
        self.region.size / SECTOR_SIZE as u32
    }

    fn offset_of(&self, pos: u64) -> u32 {
        (pos % self.size()) as u32
    }

    fn sector_index(&self, pos: u64) -> u32 {
        self.offset_of(pos) / SECTOR_SIZE as u32
    }

    fn next_sector_offset(&self, pos: u64) -> u32 {
        ((sector_base(self.offset_of(pos)) as u64 + SECTOR) % self.size()) as u32
    }

    fn meta_offset(&self, pos: u64) -> u32 {
        meta_offset_from(self.offset_of(pos))
    }

    pub fn is_empty(&self) -> bool {
        self.head.start_pos == self.tail.start_pos
    }

    fn write_pos(&self) -> u64 {
        move_pos(self.head.start_pos, self.head.written as u64)
    }

    fn pos_in_range(&self, pos: u64) -> bool {
        self.tail.start_pos <= pos && pos <= self.head.start_pos
    }

    // --- raw flash access, region relative ---

    fn flash_read(&mut self, off: u32, buf: &mut [u8]) -> Result<(), RingError> {
        self.flash
            .read(self.region.offset + off, buf)
            .map_err(RingError::flash)
    }

    fn flash_write(&mut self, off: u32, buf: &[u8]) -> Result<(), RingError> {
        self.flash
            .write(self.region.offset + off, buf)
            .map_err(RingError::flash)
    }

    fn flash_erase(&mut self, off: u32, len: u32) -> Result<(), RingError> {
        self.flash
            .erase(self.region.offset + off, self.region.offset + off + len)
            .map_err(RingError::flash)
    }

    /// Read from a position, stepping over sector trailers.
    fn read_data(&mut self, mut pos: u64, buf: &mut [u8]) -> Result<(), RingError> {
        let mut done = 0;
        while done < buf.len() {
            let off = self.offset_of(pos);
            let in_sector = offset_in_sector(pos) as usize;
            let chunk = (buf.len() - done).min(DATA_SIZE_PER_SECTOR - in_sector);
            self.flash_read(off, &mut buf[done..done + chunk])?;
            done += chunk;
            pos = move_pos(pos, chunk as u64);
        }
        Ok(())
    }

    /// Write at a position, stepping over the sector trailer. At most
    /// one sector's worth of data.
    fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<(), RingError> {
        if buf.len() > DATA_SIZE_PER_SECTOR {
            return Err(RingError::FrameLimit);
        }
        let room = DATA_SIZE_PER_SECTOR - offset_in_sector(pos) as usize;
        let off = self.offset_of(pos);
        if buf.len() <= room {
            self.flash_write(off, buf)
        } else {
            self.flash_write(off, &buf[..room])?;
            let next = self.next_sector_offset(pos);
            self.flash_write(next, &buf[room..])
        }
    }

    /// Append at the head, erasing ahead when the window runs short.
    fn write_data(&mut self, buf: &[u8]) -> Result<(), RingError> {
        if buf.len() > DATA_SIZE_PER_SECTOR {
            return Err(RingError::FrameLimit);
        }
        if buf.len() as u64 >= self.erased_bytes {
            self.erase_next_sector()?;
        }
        self.write_at(self.write_pos(), buf)?;
        self.head.written += buf.len() as u16;
        self.erased_bytes -= buf.len() as u64;
        Ok(())
    }

    fn data_length_from(&self, pos: u64) -> u64 {
        let trailers = self.head.start_pos / SECTOR - pos / SECTOR;
        self.head.start_pos - pos - META * trailers
    }

    // --- sector trailer maintenance ---

    /// Record the first frame starting in the head's sector. Written
    /// once per sector.
    fn set_sector_meta(&mut self, frame_index: u32, frame_offset: u16) -> Result<(), RingError> {
        if !self.cur_meta.index_unset() {
            return Err(RingError::WrongState);
        }
        let moff = self.meta_offset(self.head.start_pos);
        let mut raw = [0u8; SECTOR_META_SIZE];
        self.flash_read(moff, &mut raw)?;
        let mut meta = SectorMeta::decode(&raw);
        meta.frame_index = frame_index;
        meta.frame_offset = frame_offset;
        self.flash_write(moff, &meta.encode())?;
        self.cur_meta.frame_index = frame_index;
        self.cur_meta.frame_offset = frame_offset;
        Ok(())
    }

    fn write_page_bitmap(&mut self, bitmap: u16) -> Result<(), RingError> {
        if !bitmap & self.cur_meta.page_bitmap != 0 {
            let bitmap = bitmap & self.cur_meta.page_bitmap;
            let off = self.meta_offset(self.head.start_pos) + 6;
            self.flash_write(off, &bitmap.to_le_bytes())?;
            self.cur_meta.page_bitmap = bitmap;
        }
        Ok(())
    }

    /// Clear bitmap bits for pages the head has fully written past.
    fn update_page_bitmap(&mut self) -> Result<(), RingError> {
        let pages = offset_in_sector(self.head.start_pos) / PAGE_SIZE as u32;
        self.write_page_bitmap(((0xFFFFu32 << pages) & 0xFFFF) as u16)
    }

    fn forward_head(&mut self, bytes: u64) -> Result<(), RingError> {
        let new_head = move_pos(self.head.start_pos, bytes);
        if self.sector_index(self.head.start_pos) != self.sector_index(new_head) {
            // Leaving the sector: its pages are all complete.
            self.write_page_bitmap(0)?;
            self.cur_meta = SectorMeta::ERASED;
        }
        self.head.start_pos = new_head;
        self.update_page_bitmap()
    }

    /// Erase the next sector in write order, advancing the tail past
    /// it first when needed.
    fn erase_next_sector(&mut self) -> Result<(), RingError> {
        if self.next_erase_index == self.sector_index(self.tail.start_pos) {
            // The erase eats the tail's sector; resynchronize the tail
            // from the following sector's trailer.
            let next_off = self.next_sector_offset(self.tail.start_pos);
            let mut raw = [0u8; SECTOR_META_SIZE];
            self.flash_read(meta_offset_from(next_off), &mut raw)?;
            let meta = SectorMeta::decode(&raw);
            if !meta.offset_valid() {
                return Err(RingError::Corrupt);
            }
            let forward = data_len_between(
                self.size(),
                self.offset_of(self.tail.start_pos),
                next_off + meta.frame_offset as u32,
            );
            self.tail.index = meta.frame_index;
            self.tail.start_pos = move_pos(self.tail.start_pos, forward);
            self.tail.length = match self.read_frame_length(self.tail.start_pos) {
                Ok(len) => len,
                Err(RingError::NoBytes) => 0,
                Err(e) => return Err(e),
            };
            if !self.pos_in_range(self.unread_tail.start_pos) {
                self.unread_tail = self.tail;
            }
        }

        self.flash_erase(self.next_erase_index * SECTOR_SIZE as u32, SECTOR_SIZE as u32)?;
        self.next_erase_index = (self.next_erase_index + 1) % self.sectors();
        self.erased_bytes += DATA_PER_SECTOR;
        Ok(())
    }

    // --- frame plumbing ---

    /// Complete the speculative header in place once the payload length
    /// is known.
    fn complete_frame_header(&mut self) -> Result<(), RingError> {
        let length = self.head.written - FRAME_HEADER_SIZE as u16;
        self.head.crc = FrameHeader::finish_crc(self.head.crc, length);
        let header = FrameHeader {
            crc: self.head.crc,
            length,
            unread: true,
        };
        self.write_at(self.head.start_pos, &header.encode())
    }

    fn finish_frame(&mut self) -> Result<(), RingError> {
        let payload_len = self.head.written - FRAME_HEADER_SIZE as u16;
        if self.tail.start_pos == self.head.start_pos {
            self.tail.index = self.head.index;
            self.tail.length = payload_len;
        }
        if self.unread_tail.start_pos == self.head.start_pos {
            self.unread_tail.index = self.head.index;
            self.unread_tail.length = payload_len;
        }
        self.last_frame = FrameInfo {
            start_pos: self.head.start_pos,
            index: self.head.index,
            length: payload_len,
        };

        self.forward_head(self.head.written as u64)?;
        self.head.index += 1;
        self.head.written = 0;
        self.head.crc = 0;

        // First frame starting in a freshly entered sector: record it
        // in the trailer. This also covers frames that straddled the
        // boundary over several calls.
        if self.cur_meta.index_unset() {
            self.set_sector_meta(
                self.head.index,
                offset_in_sector(self.head.start_pos) as u16,
            )?;
        }
        Ok(())
    }

    fn read_header(&mut self, pos: u64) -> Result<FrameHeaderKind, RingError> {
        let mut raw = [0u8; FRAME_HEADER_SIZE];
        self.read_data(pos, &mut raw)?;
        Ok(FrameHeader::decode(&raw))
    }

    /// Check that `pos` holds the frame described by `header`: the
    /// frame fits the window, and whatever follows it starts with a
    /// frame magic unless the frame is the last one.
    fn is_frame_start(&mut self, pos: u64, header: FrameHeader) -> Result<bool, RingError> {
        let end = move_pos(pos, header.length as u64 + HEADER);
        if !self.pos_in_range(end) {
            return Ok(false);
        }
        if self.pos_in_range(move_pos(pos, header.length as u64 + 2 * HEADER + 1)) {
            let mut raw = [0u8; FRAME_HEADER_SIZE];
            self.read_data(end, &mut raw)?;
            if raw[0] != crate::codec::FRAME_MAGIC {
                return Ok(false);
            }
        } else if end != self.head.start_pos {
            return Ok(false);
        }
        Ok(true)
    }

    fn read_frame_length(&mut self, pos: u64) -> Result<u16, RingError> {
        if !self.pos_in_range(pos) {
            return Err(RingError::BadPosition);
        }
        if pos == self.head.start_pos {
            return Err(RingError::NoBytes);
        }
        let header = match self.read_header(pos)? {
            FrameHeaderKind::Complete(h) => h,
            _ => return Err(RingError::BadFrameInfo),
        };
        if !self.is_frame_start(pos, header)? {
            return Err(RingError::BadFrameInfo);
        }
        Ok(header.length)
    }

    // --- public API ---

    /// Erase the first sectors and reset all cursors to an empty
    /// buffer; remaining sectors are erased lazily in write order.
    pub fn reset(&mut self) -> Result<(), RingError> {
        self.flash_erase(0, 2 * SECTOR_SIZE as u32)?;
        if self.region.size > RING_MIN_SIZE {
            self.flash_erase(self.region.size - SECTOR_SIZE as u32, SECTOR_SIZE as u32)?;
        }
        self.head = WriteState {
            start_pos: 0,
            index: 0,
            written: 0,
            crc: 0,
        };
        self.tail = FrameInfo::zero();
        self.unread_tail = FrameInfo::zero();
        self.last_frame = FrameInfo::zero();
        self.cur_meta = SectorMeta::ERASED;
        self.next_erase_index = 2 % self.sectors();
        self.erased_bytes = 2 * DATA_PER_SECTOR;
        self.set_sector_meta(0, 0)
    }

    /// Erase the whole region and start empty.
    pub fn erase_all(&mut self) -> Result<(), RingError> {
        self.flash_erase(0, self.region.size)?;
        self.reset()
    }

    /// Append frame payload. A frame may be split over several calls;
    /// the final part passes `complete = true`, at which point the
    /// header is finalized and the frame becomes visible to readers.
    /// An empty `data` with `complete = true` just closes the current
    /// frame. Returns the number of payload bytes written.
    pub fn write_payload(&mut self, data: &[u8], complete: bool) -> Result<usize, RingError> {
        let started = self.head.written > 0;
        if !started && data.is_empty() {
            return Err(RingError::BadParams);
        }
        let payload_so_far = if started {
            self.head.written as usize - FRAME_HEADER_SIZE
        } else {
            0
        };
        if payload_so_far + data.len() > FRAME_PAYLOAD_MAX {
            return Err(RingError::FrameLimit);
        }

        let mut write_size = data.len();
        if !started {
            write_size += FRAME_HEADER_SIZE;
        }
        if write_size as u64 >= self.erased_bytes {
            self.erase_next_sector()?;
        }

        // The header always goes down speculatively and is completed in
        // place after the payload, so a cut mid-payload leaves a header
        // that can never validate.
        if !started {
            self.head.crc = 0;
            self.write_data(&FrameHeader::speculative())?;
        }
        if !data.is_empty() {
            self.write_data(data)?;
            self.head.crc = crc8_update(self.head.crc, data);
        }
        if complete {
            self.complete_frame_header()?;
            self.finish_frame()?;
        }
        Ok(data.len())
    }

    /// Oldest frame in the buffer, read or unread.
    pub fn first_frame_info(&self) -> Result<FrameInfo, RingError> {
        if self.is_empty() {
            return Err(RingError::NoBytes);
        }
        Ok(self.tail)
    }

    /// Most recently completed frame.
    pub fn last_frame_info(&self) -> Result<FrameInfo, RingError> {
        if self.is_empty() || self.last_frame.length == 0 {
            return Err(RingError::NoBytes);
        }
        Ok(self.last_frame)
    }

    /// Oldest frame not yet marked read.
    pub fn first_unread_frame_info(&self) -> Result<FrameInfo, RingError> {
        if self.is_empty() || self.unread_tail.length == 0 {
            return Err(RingError::NoBytes);
        }
        Ok(self.unread_tail)
    }

    /// Frame following `cur`. Resynchronizes against the sector trailer
    /// when the step crosses into a new sector.
    pub fn next_frame_info(&mut self, cur: &FrameInfo) -> Result<FrameInfo, RingError> {
        if cur.length == 0 {
            return Err(RingError::BadParams);
        }
        if !self.pos_in_range(cur.start_pos) {
            return Err(RingError::BadPosition);
        }
        if cur.start_pos == self.head.start_pos || cur.start_pos == self.last_frame.start_pos {
            return Err(RingError::NoBytes);
        }

        let mut pos = move_pos(cur.start_pos, cur.length as u64 + HEADER);
        if !self.pos_in_range(pos) {
            return Err(RingError::BadPosition);
        }

        let mut index = cur.index;
        let meta_off = self.meta_offset(pos);
        if self.meta_offset(cur.start_pos) != meta_off {
            // First frame of a new sector; cross-check the trailer.
            let mut raw = [0u8; SECTOR_META_SIZE];
            self.flash_read(meta_off, &mut raw)?;
            let meta = SectorMeta::decode(&raw);
            if !meta.offset_valid() {
                return Err(RingError::Corrupt);
            }
            if meta.frame_index != cur.index + 1
                || meta.frame_offset as u32 != offset_in_sector(pos)
            {
                // Trailer wins; a frame boundary was lost somewhere.
                index = meta.frame_index.wrapping_sub(1);
                pos = pos - offset_in_sector(pos) as u64 + meta.frame_offset as u64;
            }
        }

        let length = self.read_frame_length(pos)?;
        Ok(FrameInfo {
            start_pos: pos,
            index: index + 1,
            length,
        })
    }

    /// Random-access read within a frame's payload. The stored header
    /// is validated against `info` on every call. Returns the number
    /// of bytes read, which may be short.
    pub fn read_payload(
        &mut self,
        info: &FrameInfo,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<usize, RingError> {
        let pos = move_pos(info.start_pos, offset as u64 + HEADER);
        if !self.pos_in_range(pos) {
            return Err(RingError::BadPosition);
        }
        if (info.length as u32) < offset {
            return Err(RingError::BadParams);
        }
        if info.length as u32 == offset {
            return Ok(0);
        }
        let available = self.data_length_from(info.start_pos);
        if available == 0 {
            return Err(RingError::NoBytes);
        }

        match self.read_header(info.start_pos)? {
            FrameHeaderKind::Complete(h) if h.length == info.length => {}
            _ => return Err(RingError::BadFrameInfo),
        }

        let n = (buf.len() as u64)
            .min(available)
            .min(info.length as u64 - offset as u64) as usize;
        self.read_data(pos, &mut buf[..n])?;
        Ok(n)
    }

    /// Clear the unread flag of every frame before `pos`, advancing
    /// the unread tail.
    pub fn mark_read_before(&mut self, pos: u64) -> Result<(), RingError> {
        if !self.pos_in_range(pos) {
            return Err(RingError::BadPosition);
        }
        if self.is_empty() {
            return Ok(());
        }

        let mut info = match self.first_unread_frame_info() {
            Ok(info) => info,
            Err(RingError::NoBytes) => return Ok(()),
            Err(e) => return Err(e),
        };
        while info.start_pos < pos && info.start_pos < self.head.start_pos {
            self.mark_read_flag(&info)?;
            match self.next_frame_info(&info) {
                Ok(next) => {
                    info = next;
                    self.unread_tail = info;
                }
                Err(RingError::NoBytes) => {
                    self.unread_tail = FrameInfo {
                        start_pos: self.head.start_pos,
                        index: self.head.index,
                        length: 0,
                    };
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn mark_read_flag(&mut self, info: &FrameInfo) -> Result<(), RingError> {
        let mut header = match self.read_header(info.start_pos)? {
            FrameHeaderKind::Complete(h) => h,
            _ => return Err(RingError::BadFrameInfo),
        };
        if !self.is_frame_start(info.start_pos, header)? {
            return Err(RingError::BadFrameInfo);
        }
        header.unread = false;
        self.write_at(info.start_pos, &header.encode())
    }

    /// Erase whole sectors before `pos`. The sector containing `pos`
    /// is never touched.
    pub fn erase_before(&mut self, pos: u64) -> Result<(), RingError> {
        if !self.pos_in_range(pos) {
            return Err(RingError::BadPosition);
        }
        while self.sector_index(self.tail.start_pos) != self.sector_index(pos) {
            self.erase_next_sector()?;
        }
        Ok(())
    }

    /// Free payload capacity, accounting for one more frame header.
    pub fn free_size(&self) -> u64 {
        let total = self.sectors() as u64 * DATA_PER_SECTOR;
        let used = self.data_length_from(self.tail.start_pos)
            + offset_in_sector(self.tail.start_pos) as u64;
        let free = total.saturating_sub(used);
        free.saturating_sub(HEADER)
    }

    /// Total payload capacity of the region, trailers excluded.
    pub fn total_data_size(&self) -> u64 {
        self.sectors() as u64 * DATA_PER_SECTOR
    }

    /// Bytes and frames stored in the buffer.
    pub fn stats(&self) -> RingStats {
        self.stats_from_raw(self.tail.start_pos, self.tail.index)
    }

    /// Bytes and frames from `info` (inclusive) to the head.
    pub fn stats_from(&self, info: &FrameInfo) -> Result<RingStats, RingError> {
        if !self.pos_in_range(info.start_pos) {
            return Err(RingError::BadPosition);
        }
        Ok(self.stats_from_raw(info.start_pos, info.index))
    }

    fn stats_from_raw(&self, pos: u64, index: u32) -> RingStats {
        let frames = self.head.index - index;
        let raw = self.data_length_from(pos);
        RingStats {
            data_bytes: raw.saturating_sub(HEADER * frames as u64),
            frames,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use norstore_sim::SimFlash;

    fn ring(sectors: usize) -> FlashRingBuffer<SimFlash> {
        let flash = SimFlash::new(sectors);
        FlashRingBuffer::new(
            flash,
            FlashRegion::new(0, (sectors * SECTOR_SIZE) as u32),
            false,
        )
        .unwrap()
    }

    fn payload(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn test_empty_buffer_has_no_frames() {
        let ring = ring(2);
        assert_eq!(ring.first_frame_info(), Err(RingError::NoBytes));
        assert_eq!(ring.last_frame_info(), Err(RingError::NoBytes));
        assert_eq!(ring.first_unread_frame_info(), Err(RingError::NoBytes));
        assert_eq!(ring.stats(), RingStats { data_bytes: 0, frames: 0 });
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let mut ring = ring(2);
        let data = payload(300, 1);
        assert_eq!(ring.write_payload(&data, true).unwrap(), 300);

        let info = ring.first_frame_info().unwrap();
        assert_eq!(info.index, 0);
        assert_eq!(info.length, 300);

        let mut buf = vec![0u8; 300];
        assert_eq!(ring.read_payload(&info, 0, &mut buf).unwrap(), 300);
        assert_eq!(buf, data);
    }

    #[test]
    fn test_partial_read_with_offset() {
        let mut ring = ring(2);
        let data = payload(100, 3);
        ring.write_payload(&data, true).unwrap();
        let info = ring.first_frame_info().unwrap();

        let mut buf = [0u8; 30];
        assert_eq!(ring.read_payload(&info, 50, &mut buf).unwrap(), 30);
        assert_eq!(&buf[..], &data[50..80]);

        // Reading at the end yields zero bytes.
        assert_eq!(ring.read_payload(&info, 100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_multi_call_frame() {
        let mut ring = ring(2);
        let a = payload(120, 7);
        let b = payload(200, 9);
        ring.write_payload(&a, false).unwrap();
        ring.write_payload(&b, true).unwrap();

        let info = ring.last_frame_info().unwrap();
        assert_eq!(info.length, 320);
        let mut buf = vec![0u8; 320];
        ring.read_payload(&info, 0, &mut buf).unwrap();
        assert_eq!(&buf[..120], &a[..]);
        assert_eq!(&buf[120..], &b[..]);
    }

    #[test]
    fn test_close_frame_with_empty_complete() {
        let mut ring = ring(2);
        ring.write_payload(&payload(64, 2), false).unwrap();
        ring.write_payload(&[], true).unwrap();
        assert_eq!(ring.last_frame_info().unwrap().length, 64);
    }

    #[test]
    fn test_empty_write_at_frame_start_rejected() {
        let mut ring = ring(2);
        assert_eq!(ring.write_payload(&[], true), Err(RingError::BadParams));
    }

    #[test]
    fn test_frame_limit() {
        let mut ring = ring(4);
        let too_big = vec![0u8; FRAME_PAYLOAD_MAX + 1];
        assert_eq!(
            ring.write_payload(&too_big, true),
            Err(RingError::FrameLimit)
        );

        ring.write_payload(&payload(4000, 1), false).unwrap();
        let overflow = vec![0u8; FRAME_PAYLOAD_MAX - 4000 + 1];
        assert_eq!(
            ring.write_payload(&overflow, true),
            Err(RingError::FrameLimit)
        );
    }

    #[test]
    fn test_back_to_back_max_frames_in_min_ring() {
        // Each frame plus header fills a sector exactly, so every write
        // lands on the erase-window boundary of the two-sector ring.
        let mut ring = ring(2);
        for seed in 0..3u8 {
            let data = payload(FRAME_PAYLOAD_MAX, seed);
            ring.write_payload(&data, true).unwrap();

            let info = ring.last_frame_info().unwrap();
            assert_eq!(info.length as usize, FRAME_PAYLOAD_MAX);
            let mut buf = vec![0u8; FRAME_PAYLOAD_MAX];
            ring.read_payload(&info, 0, &mut buf).unwrap();
            assert_eq!(buf, data);
        }
    }

    #[test]
    fn test_next_frame_advances_index_by_one() {
        let mut ring = ring(4);
        for i in 0..12u8 {
            ring.write_payload(&payload(700, i), true).unwrap();
        }

        let mut info = ring.first_frame_info().unwrap();
        let mut count = 1;
        loop {
            match ring.next_frame_info(&info) {
                Ok(next) => {
                    assert_eq!(next.index, info.index + 1);
                    info = next;
                    count += 1;
                }
                Err(RingError::NoBytes) => break,
                Err(e) => panic!("unexpected error {e:?}"),
            }
        }
        assert_eq!(count, 12);
        assert_eq!(ring.stats().frames, 12);
    }

    #[test]
    fn test_wrap_reclaims_oldest_frames() {
        let mut ring = ring(2);
        // Frames of 450 bytes: a 2-sector ring holds 8176 data bytes,
        // so well before 30 frames the oldest must be reclaimed.
        for i in 0..30u8 {
            ring.write_payload(&payload(450, i), true).unwrap();
        }
        let first = ring.first_frame_info().unwrap();
        assert!(first.index > 0);

        // Every surviving frame reads back intact, in write order.
        let mut info = first;
        let mut buf = vec![0u8; 450];
        loop {
            ring.read_payload(&info, 0, &mut buf).unwrap();
            assert_eq!(buf, payload(450, info.index as u8));
            match ring.next_frame_info(&info) {
                Ok(next) => info = next,
                Err(RingError::NoBytes) => break,
                Err(e) => panic!("unexpected error {e:?}"),
            }
        }
        assert_eq!(info.index, 29);
    }

    #[test]
    fn test_mark_read_moves_unread_tail() {
        let mut ring = ring(2);
        for i in 0..4u8 {
            ring.write_payload(&payload(100, i), true).unwrap();
        }
        let first = ring.first_unread_frame_info().unwrap();
        assert_eq!(first.index, 0);

        let third = {
            let second = ring.next_frame_info(&first).unwrap();
            ring.next_frame_info(&second).unwrap()
        };
        ring.mark_read_before(third.start_pos).unwrap();
        assert_eq!(ring.first_unread_frame_info().unwrap().index, 2);

        // First frame is still readable, just marked read.
        let mut buf = [0u8; 100];
        ring.read_payload(&first, 0, &mut buf).unwrap();
        assert_eq!(&buf[..], &payload(100, 0)[..]);

        // Mark everything read.
        ring.mark_read_before(ring.head.start_pos).unwrap();
        assert_eq!(ring.first_unread_frame_info(), Err(RingError::NoBytes));
    }

    #[test]
    fn test_erase_before_keeps_target_sector() {
        let mut ring = ring(4);
        for i in 0..10u8 {
            ring.write_payload(&payload(900, i), true).unwrap();
        }
        // Pick a frame a couple of sectors in.
        let mut info = ring.first_frame_info().unwrap();
        for _ in 0..6 {
            info = ring.next_frame_info(&info).unwrap();
        }
        ring.erase_before(info.start_pos).unwrap();

        let first = ring.first_frame_info().unwrap();
        // Tail moved forward but not past the target position.
        assert!(first.start_pos <= info.start_pos);
        assert_eq!(
            ring.sector_index(first.start_pos),
            ring.sector_index(info.start_pos)
        );

        // The target frame still reads back.
        let mut buf = vec![0u8; 900];
        ring.read_payload(&info, 0, &mut buf).unwrap();
        assert_eq!(buf, payload(900, info.index as u8));
    }

    #[test]
    fn test_erase_all_resets() {
        let mut ring = ring(2);
        ring.write_payload(&payload(128, 5), true).unwrap();
        ring.erase_all().unwrap();
        assert!(ring.is_empty());
        assert_eq!(ring.first_frame_info(), Err(RingError::NoBytes));
        ring.write_payload(&payload(128, 6), true).unwrap();
        assert_eq!(ring.first_frame_info().unwrap().index, 0);
    }

    #[test]
    fn test_free_size_shrinks_with_writes() {
        let mut ring = ring(4);
        let before = ring.free_size();
        ring.write_payload(&payload(1000, 1), true).unwrap();
        let after = ring.free_size();
        assert_eq!(before - after, 1000 + HEADER);
    }

    #[test]
    fn test_stale_frame_info_rejected() {
        let mut ring = ring(2);
        ring.write_payload(&payload(100, 1), true).unwrap();
        let mut info = ring.first_frame_info().unwrap();
        info.length = 55;
        let mut buf = [0u8; 10];
        assert_eq!(
            ring.read_payload(&info, 0, &mut buf),
            Err(RingError::BadFrameInfo)
        );
    }

    #[test]
    fn test_region_validation() {
        let flash = SimFlash::new(2);
        assert!(matches!(
            FlashRingBuffer::new(flash.clone(), FlashRegion::new(0, SECTOR_SIZE as u32), false),
            Err(RingError::BadParams)
        ));
        assert!(matches!(
            FlashRingBuffer::new(flash.clone(), FlashRegion::new(100, RING_MIN_SIZE), false),
            Err(RingError::BadParams)
        ));
        assert!(matches!(
            FlashRingBuffer::new(flash, FlashRegion::new(SECTOR_SIZE as u32, RING_MIN_SIZE), false),
            Err(RingError::BadParams)
        ));
    }
}
