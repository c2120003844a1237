//! Cursor reconstruction after power loss.
//!
//! The sector trailers carry enough to find the write sector without
//! scanning the whole region: the head's sector is the only one whose
//! page bitmap is neither erased nor fully cleared. From the trailer's
//! first-frame offset the frame chain is walked to the exact write
//! position, the tail is found by backing up over full sectors, and the
//! unread tail by a binary search over the read flags of first-in-sector
//! frames.

use embedded_storage::nor_flash::MultiwriteNorFlash;

use super::{
    meta_offset_from, move_pos, offset_in_sector, sector_base, FlashRingBuffer, FrameInfo,
    WriteState, DATA_PER_SECTOR, HEADER, SECTOR,
};
use crate::codec::{
    is_erased, FrameHeader, FrameHeaderKind, SectorMeta, FRAME_HEADER_SIZE, SECTOR_META_SIZE,
    SECTOR_SIZE,
};
use crate::crc::crc8_update;
use crate::error::RingError;

impl<S: MultiwriteNorFlash> FlashRingBuffer<S> {
    /// Rebuild all cursors from flash. Corruption and a fully erased
    /// region both degrade to a fresh, empty buffer.
    pub(super) fn init_from_flash(&mut self) -> Result<(), RingError> {
        match self.init_head().and_then(|_| self.init_tail()) {
            Ok(()) => Ok(()),
            Err(RingError::NoBytes) | Err(RingError::Corrupt) => self.reset(),
            Err(e) => Err(e),
        }
    }

    fn read_meta_at(&mut self, off: u32) -> Result<SectorMeta, RingError> {
        let mut raw = [0u8; SECTOR_META_SIZE];
        self.flash_read(meta_offset_from(off), &mut raw)?;
        Ok(SectorMeta::decode(&raw))
    }

    fn init_head(&mut self) -> Result<(), RingError> {
        let size = self.region.size;

        // First programmed trailer; a fully erased region has none.
        let mut off = 0u32;
        loop {
            if off >= size {
                return Err(RingError::NoBytes);
            }
            let mut raw = [0u8; SECTOR_META_SIZE];
            self.flash_read(meta_offset_from(off), &mut raw)?;
            if !is_erased(&raw) {
                break;
            }
            off += SECTOR_SIZE as u32;
        }

        // The write sector is the first one from here whose page bitmap
        // still has bits set; fully written sectors read 0.
        let mut meta;
        loop {
            meta = self.read_meta_at(off)?;
            if meta.page_bitmap != 0 {
                break;
            }
            off += SECTOR_SIZE as u32;
            if off >= size {
                off = 0;
                meta = self.read_meta_at(0)?;
                if meta.page_bitmap == 0 {
                    return Err(RingError::Corrupt);
                }
                break;
            }
        }
        if !meta.offset_valid() {
            return Err(RingError::Corrupt);
        }

        self.head = WriteState {
            start_pos: self.size() + off as u64 + meta.frame_offset as u64,
            index: meta.frame_index,
            written: 0,
            crc: 0,
        };
        self.search_end_in_last_sector()?;
        if self.head.written != 0 {
            return Err(RingError::Corrupt);
        }
        self.cur_meta = meta;
        self.next_erase_index = (self.sector_index(self.head.start_pos) + 1) % self.sectors();
        // Writes resume into the erased remainder of the write sector.
        self.erased_bytes = DATA_PER_SECTOR - offset_in_sector(self.head.start_pos) as u64;
        Ok(())
    }

    /// Walk the frame chain through the write sector, leaving the head
    /// after the last complete frame. An interrupted speculative header
    /// counts as end-of-data only when nothing beyond it was programmed;
    /// a dirty remainder means a torn payload we cannot append over.
    fn search_end_in_last_sector(&mut self) -> Result<(), RingError> {
        let mut off = self.offset_of(self.head.start_pos);
        let end_off = meta_offset_from(off);
        let sector_pos = self.head.start_pos - offset_in_sector(self.head.start_pos) as u64;

        let mut delta: u64 = 0;
        let mut index = self.head.index;
        let mut final_header: Option<FrameHeader> = None;
        let mut raw = [0u8; FRAME_HEADER_SIZE];
        while off < end_off {
            self.read_data(off as u64, &mut raw)?;
            match FrameHeader::decode(&raw) {
                FrameHeaderKind::Erased => break,
                FrameHeaderKind::Incomplete => {
                    if !self.blank_between(off + FRAME_HEADER_SIZE as u32, end_off)? {
                        return Err(RingError::Corrupt);
                    }
                    break;
                }
                FrameHeaderKind::Invalid => return Err(RingError::Corrupt),
                FrameHeaderKind::Complete(h) => {
                    // A torn write can only sit in this sector, so this
                    // is the one place payloads are checked against the
                    // frame CRC.
                    if !self.frame_crc_ok(off as u64, h)? {
                        return Err(RingError::Corrupt);
                    }
                    self.last_frame = FrameInfo {
                        start_pos: sector_pos + (off % SECTOR_SIZE as u32) as u64,
                        index,
                        length: h.length,
                    };
                    if off + h.length as u32 >= end_off {
                        final_header = Some(h);
                        break;
                    }
                    off += h.length as u32 + FRAME_HEADER_SIZE as u32;
                    delta += h.length as u64 + HEADER;
                    index += 1;
                    if off >= end_off {
                        final_header = Some(h);
                        break;
                    }
                }
            }
        }

        self.head.start_pos = move_pos(self.head.start_pos, delta);
        self.head.index = index;
        match final_header {
            // A frame running to the sector's end would have cleared the
            // bitmap; finding one here is reported upstream as corrupt.
            Some(h) => {
                self.head.written = h.length + FRAME_HEADER_SIZE as u16;
                self.head.crc = h.crc;
            }
            None => {
                self.head.written = 0;
                self.head.crc = 0;
            }
        }
        Ok(())
    }

    fn frame_crc_ok(&mut self, pos: u64, header: FrameHeader) -> Result<bool, RingError> {
        let mut crc = 0u8;
        let mut pos = move_pos(pos, HEADER);
        let mut remaining = header.length as usize;
        let mut buf = [0u8; 64];
        while remaining > 0 {
            let n = remaining.min(buf.len());
            self.read_data(pos, &mut buf[..n])?;
            crc = crc8_update(crc, &buf[..n]);
            pos = move_pos(pos, n as u64);
            remaining -= n;
        }
        Ok(FrameHeader::finish_crc(crc, header.length) == header.crc)
    }

    fn blank_between(&mut self, mut off: u32, end: u32) -> Result<bool, RingError> {
        let mut buf = [0u8; 64];
        while off < end {
            let n = ((end - off) as usize).min(buf.len());
            self.flash_read(off, &mut buf[..n])?;
            if !is_erased(&buf[..n]) {
                return Ok(false);
            }
            off += n as u32;
        }
        Ok(true)
    }

    /// Find the oldest surviving frame by backing up over fully written
    /// sectors, then stepping forward to the first complete frame head.
    fn init_tail(&mut self) -> Result<(), RingError> {
        let size = self.size();
        let head_sector_off = sector_base(self.offset_of(self.head.start_pos));

        let mut off = ((head_sector_off as u64 + size - SECTOR) % size) as u32;
        for _ in 0..self.sectors() {
            if self.read_meta_at(off)?.page_bitmap != 0 {
                break;
            }
            off = ((off as u64 + size - SECTOR) % size) as u32;
        }

        let (meta, header) = loop {
            off = ((sector_base(off) as u64 + SECTOR) % size) as u32;
            let meta = self.read_meta_at(off)?;
            if !meta.offset_valid() {
                return Err(RingError::Corrupt);
            }
            if size + off as u64 + meta.frame_offset as u64 == self.head.start_pos {
                // Nothing between tail and head.
                let info = FrameInfo {
                    start_pos: self.head.start_pos,
                    index: self.head.index,
                    length: 0,
                };
                self.tail = info;
                self.unread_tail = info;
                return Ok(());
            }
            let mut raw = [0u8; FRAME_HEADER_SIZE];
            self.read_data(off as u64 + meta.frame_offset as u64, &mut raw)?;
            match FrameHeader::decode(&raw) {
                FrameHeaderKind::Complete(h) => break (meta, h),
                _ if off == head_sector_off => return Err(RingError::Corrupt),
                _ => {}
            }
        };

        let mut pos = size + off as u64 + meta.frame_offset as u64;
        if pos > self.head.start_pos {
            pos -= size;
        }
        self.tail = FrameInfo {
            start_pos: pos,
            index: meta.frame_index,
            length: header.length,
        };
        self.unread_tail = self.tail;
        self.search_unread_tail()
    }

    /// Locate the oldest unread frame. Frames are marked read strictly
    /// in order, so the read flags of first-in-sector frames are sorted
    /// and binary searchable; the last read sector is then walked
    /// linearly.
    fn search_unread_tail(&mut self) -> Result<(), RingError> {
        let header = match self.read_header(self.tail.start_pos)? {
            FrameHeaderKind::Complete(h) => h,
            _ => return Err(RingError::Corrupt),
        };
        if header.unread {
            self.unread_tail = self.tail;
            return Ok(());
        }

        let mut left_pos = self.tail.start_pos;
        let mut left_index = self.tail.index;
        let mut left_sector = self.tail.start_pos & !(SECTOR - 1);
        let mut right_sector = self.head.start_pos & !(SECTOR - 1);
        while left_sector + SECTOR < right_sector {
            let mid_sector = ((left_sector + right_sector) / 2) & !(SECTOR - 1);
            let meta = self.read_meta_at(self.offset_of(mid_sector))?;
            if !meta.offset_valid() {
                return Err(RingError::Corrupt);
            }
            let mid_pos = mid_sector + meta.frame_offset as u64;
            let h = match self.read_header(mid_pos)? {
                FrameHeaderKind::Complete(h) => h,
                _ => return Err(RingError::Corrupt),
            };
            if h.unread {
                right_sector = mid_sector;
            } else {
                left_sector = mid_sector;
                left_pos = mid_pos;
                left_index = meta.frame_index;
            }
        }

        self.search_first_unread_frame(left_pos, left_index)
    }

    fn search_first_unread_frame(&mut self, mut pos: u64, mut index: u32) -> Result<(), RingError> {
        while pos < self.head.start_pos {
            let h = match self.read_header(pos)? {
                FrameHeaderKind::Complete(h) => h,
                _ => return Err(RingError::Corrupt),
            };
            if h.unread {
                self.unread_tail = FrameInfo {
                    start_pos: pos,
                    index,
                    length: h.length,
                };
                return Ok(());
            }
            index += 1;
            pos = move_pos(pos, h.length as u64 + HEADER);
        }
        if index != self.head.index || pos != self.head.start_pos {
            return Err(RingError::Corrupt);
        }
        self.unread_tail = FrameInfo {
            start_pos: pos,
            index,
            length: 0,
        };
        Ok(())
    }
}
