//! Byte-exact encode/decode for the four on-flash records.
//!
//! Everything on flash is little-endian and packed. Erased flash reads
//! 0xFF, and several records exploit that: reserved bits are written as
//! ones so a record program only clears the bits it owns, and fields
//! that are filled in later (frame CRC/length, entry CRCs) are held at
//! all-ones until their final in-place overwrite.
//!
//! Ring buffer sector layout:
//!
//! ```text
//! 0 --------------------------4088----------4096
//! ...|frame header|payload|...|sector trailer|
//! ```
//!
//! Frame header (4 bytes):
//!
//! ```text
//! | magic 0xF5 | crc8 | length:12  unread:1  reserved:3 (u16 LE) |
//! ```
//!
//! Sector trailer (8 bytes at offset 4088):
//!
//! ```text
//! | frame_index u32 LE | frame_offset:12 reserved:4 (u16 LE) | page_bitmap u16 LE |
//! ```
//!
//! Key/value records are documented on their types below.

use crate::crc::{crc16_update, crc8_update};

/// Flash sector size. Erases happen in whole sectors.
pub const SECTOR_SIZE: usize = 4096;
/// Flash page size; the sector trailer tracks fully written pages.
pub const PAGE_SIZE: usize = 256;
/// Pages per sector.
pub const PAGES_PER_SECTOR: usize = SECTOR_SIZE / PAGE_SIZE;
/// Sector trailer size, at the end of every ring sector.
pub const SECTOR_META_SIZE: usize = 8;
/// Data bytes per ring sector, excluding the trailer.
pub const DATA_SIZE_PER_SECTOR: usize = SECTOR_SIZE - SECTOR_META_SIZE;
/// Frame header size.
pub const FRAME_HEADER_SIZE: usize = 4;
/// Maximum frame payload: one sector's data capacity minus the header.
pub const FRAME_PAYLOAD_MAX: usize = DATA_SIZE_PER_SECTOR - FRAME_HEADER_SIZE;

/// Frame header magic byte.
pub const FRAME_MAGIC: u8 = 0xF5;

// A frame never spans more than two sectors.
const _: () = assert!(FRAME_HEADER_SIZE + FRAME_PAYLOAD_MAX <= DATA_SIZE_PER_SECTOR);

/// Key/value record magic byte, used for both partition headers and
/// entry metadata.
pub const KVS_MAGIC: u8 = 0xC4;
/// Byte closing every key/value entry.
pub const KVS_TERMINATOR: u8 = 0xDB;
/// AES-CTR nonce length stored in partition headers.
pub const NONCE_LEN: usize = 12;
/// Partition header size.
pub const PARTITION_HEADER_SIZE: usize = 18;
/// Entry metadata size.
pub const ENTRY_META_SIZE: usize = 9;
/// Entry metadata bytes covered by the meta CRC (everything before it).
pub const ENTRY_META_CRC_LEN: usize = 7;
/// Entry metadata bytes written up front; the two CRCs follow later.
pub const ENTRY_META_NO_CRC_LEN: usize = 5;

/// Maximum namespace length in bytes.
pub const MAX_NAMESPACE_LEN: usize = 16;
/// Maximum key length in bytes.
pub const MAX_KEY_LEN: usize = 48;
/// Maximum value length in bytes.
pub const MAX_VALUE_LEN: usize = 7680;

/// Partition header tag marking an initialized, active partition.
pub const KVS_ACTIVE_TAG: u32 = (KVS_MAGIC as u32) << 24;

/// True when every byte still reads erased.
pub fn is_erased(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == 0xFF)
}

/// Ring sector trailer.
///
/// `frame_index`/`frame_offset` name the first frame that starts in the
/// sector; `page_bitmap` has bit n cleared once page n is fully covered
/// by completed frames (0 means the sector is full).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SectorMeta {
    pub frame_index: u32,
    pub frame_offset: u16,
    pub page_bitmap: u16,
}

impl SectorMeta {
    pub const ERASED: SectorMeta = SectorMeta {
        frame_index: 0xFFFF_FFFF,
        frame_offset: 0x0FFF,
        page_bitmap: 0xFFFF,
    };

    pub fn encode(&self) -> [u8; SECTOR_META_SIZE] {
        let mut out = [0u8; SECTOR_META_SIZE];
        out[0..4].copy_from_slice(&self.frame_index.to_le_bytes());
        // Reserved bits stay erased.
        let word = (self.frame_offset & 0x0FFF) | 0xF000;
        out[4..6].copy_from_slice(&word.to_le_bytes());
        out[6..8].copy_from_slice(&self.page_bitmap.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; SECTOR_META_SIZE]) -> SectorMeta {
        let word = u16::from_le_bytes([bytes[4], bytes[5]]);
        SectorMeta {
            frame_index: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            frame_offset: word & 0x0FFF,
            page_bitmap: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    /// The frame index field has never been programmed.
    pub fn index_unset(&self) -> bool {
        self.frame_index == 0xFFFF_FFFF
    }

    /// Offset field points inside the sector's data area.
    pub fn offset_valid(&self) -> bool {
        (self.frame_offset as usize) < DATA_SIZE_PER_SECTOR
    }
}

/// A fully written frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FrameHeader {
    pub crc: u8,
    pub length: u16,
    pub unread: bool,
}

/// What a 4-byte header slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameHeaderKind {
    /// Slot never written; no frame here.
    Erased,
    /// Magic programmed but CRC/length still erased: a write was
    /// interrupted before the frame completed.
    Incomplete,
    /// A complete header.
    Complete(FrameHeader),
    /// Bytes that are neither erased nor a plausible header.
    Invalid,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        // Unread defaults to 1 (erased) and is cleared in place later;
        // reserved bits stay erased.
        let word = (self.length & 0x0FFF) | if self.unread { 0x1000 } else { 0 } | 0xE000;
        let w = word.to_le_bytes();
        [FRAME_MAGIC, self.crc, w[0], w[1]]
    }

    /// Header written at frame start before the payload length is known.
    pub fn speculative() -> [u8; FRAME_HEADER_SIZE] {
        [FRAME_MAGIC, 0xFF, 0xFF, 0xFF]
    }

    pub fn decode(bytes: &[u8; FRAME_HEADER_SIZE]) -> FrameHeaderKind {
        if is_erased(bytes) {
            return FrameHeaderKind::Erased;
        }
        if bytes[0] != FRAME_MAGIC {
            return FrameHeaderKind::Invalid;
        }
        if bytes[1] == 0xFF && bytes[2] == 0xFF && bytes[3] == 0xFF {
            return FrameHeaderKind::Incomplete;
        }
        let word = u16::from_le_bytes([bytes[2], bytes[3]]);
        let length = word & 0x0FFF;
        if length as usize > FRAME_PAYLOAD_MAX {
            return FrameHeaderKind::Invalid;
        }
        FrameHeaderKind::Complete(FrameHeader {
            crc: bytes[1],
            length,
            unread: word & 0x1000 != 0,
        })
    }

    /// Finish the frame CRC: the payload CRC accumulator is extended
    /// with the length field so a truncated payload cannot validate.
    pub fn finish_crc(payload_crc: u8, length: u16) -> u8 {
        crc8_update(payload_crc, &length.to_le_bytes())
    }
}

/// Key/value partition header (18 bytes).
///
/// ```text
/// | nonce[12] | tag u32 LE | crc16 LE |
/// ```
///
/// The tag is [`KVS_ACTIVE_TAG`] on a live partition. On the backup
/// region it instead holds the flash offset of the partition being
/// compacted, which doubles as the compaction commit mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PartitionHeader {
    pub nonce: [u8; NONCE_LEN],
    pub tag: u32,
}

impl PartitionHeader {
    pub fn active(nonce: [u8; NONCE_LEN]) -> Self {
        Self {
            nonce,
            tag: KVS_ACTIVE_TAG,
        }
    }

    pub fn backup(nonce: [u8; NONCE_LEN], restore_offset: u32) -> Self {
        Self {
            nonce,
            tag: restore_offset,
        }
    }

    pub fn encode(&self) -> [u8; PARTITION_HEADER_SIZE] {
        let mut out = [0u8; PARTITION_HEADER_SIZE];
        out[0..NONCE_LEN].copy_from_slice(&self.nonce);
        out[NONCE_LEN..16].copy_from_slice(&self.tag.to_le_bytes());
        let crc = crc16_update(0, &out[..16]);
        out[16..18].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Decode, returning `None` when the CRC does not match.
    pub fn decode(bytes: &[u8; PARTITION_HEADER_SIZE]) -> Option<PartitionHeader> {
        let crc = u16::from_le_bytes([bytes[16], bytes[17]]);
        if crc != crc16_update(0, &bytes[..16]) {
            return None;
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[0..NONCE_LEN]);
        Some(PartitionHeader {
            nonce,
            tag: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        })
    }

    /// Tag marks an active partition rather than a pending restore.
    pub fn is_active(&self) -> bool {
        self.tag >> 24 == KVS_MAGIC as u32
    }
}

/// Key/value entry metadata (9 bytes).
///
/// ```text
/// | magic 0xC4 | ns_len:5 key_len:6 value_len:13 enc:1 valid:1 r:6 (u32 LE) | value_crc LE | meta_crc LE |
/// ```
///
/// `meta_crc` covers the first 7 bytes with the valid bit forced to 1,
/// so clearing the valid bit in place does not break the checksum.
/// `value_crc` covers namespace + key + stored value + terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EntryMeta {
    pub namespace_len: u8,
    pub key_len: u8,
    pub value_len: u16,
    pub encrypted: bool,
    pub valid: bool,
    pub value_crc: u16,
    pub meta_crc: u16,
}

impl EntryMeta {
    pub fn encode(&self) -> [u8; ENTRY_META_SIZE] {
        let mut out = [0u8; ENTRY_META_SIZE];
        out[0] = KVS_MAGIC;
        let word = (self.namespace_len as u32 & 0x1F)
            | ((self.key_len as u32 & 0x3F) << 5)
            | ((self.value_len as u32 & 0x1FFF) << 11)
            | ((self.encrypted as u32) << 24)
            | ((self.valid as u32) << 25);
        out[1..5].copy_from_slice(&word.to_le_bytes());
        out[5..7].copy_from_slice(&self.value_crc.to_le_bytes());
        out[7..9].copy_from_slice(&self.meta_crc.to_le_bytes());
        out
    }

    /// Decode, returning `None` on a wrong magic byte. CRCs are not
    /// checked here; use [`EntryMeta::meta_crc_ok`].
    pub fn decode(bytes: &[u8; ENTRY_META_SIZE]) -> Option<EntryMeta> {
        if bytes[0] != KVS_MAGIC {
            return None;
        }
        let word = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        Some(EntryMeta {
            namespace_len: (word & 0x1F) as u8,
            key_len: ((word >> 5) & 0x3F) as u8,
            value_len: ((word >> 11) & 0x1FFF) as u16,
            encrypted: word & (1 << 24) != 0,
            valid: word & (1 << 25) != 0,
            value_crc: u16::from_le_bytes([bytes[5], bytes[6]]),
            meta_crc: u16::from_le_bytes([bytes[7], bytes[8]]),
        })
    }

    /// Expected meta CRC: first 7 encoded bytes with valid forced to 1.
    pub fn compute_meta_crc(&self) -> u16 {
        let mut normalized = *self;
        normalized.valid = true;
        crc16_update(0, &normalized.encode()[..ENTRY_META_CRC_LEN])
    }

    pub fn meta_crc_ok(&self) -> bool {
        self.meta_crc == self.compute_meta_crc()
    }

    /// Namespace + key bytes stored after the metadata.
    pub fn header_len(&self) -> usize {
        self.namespace_len as usize + self.key_len as usize
    }

    /// Whole record size: metadata, namespace, key, value, terminator.
    pub fn entry_len(&self) -> usize {
        ENTRY_META_SIZE + self.header_len() + self.value_len as usize + 1
    }
}
