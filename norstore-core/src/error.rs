//! Error types for the ring buffer and key/value store engines.

use embedded_storage::nor_flash::{NorFlashError, NorFlashErrorKind};

/// Errors reported by [`crate::ring::FlashRingBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RingError {
    /// Invalid arguments (region geometry, empty write at frame start).
    BadParams,
    /// Position outside the current tail..=head window.
    BadPosition,
    /// Frame info does not match what is stored at its position.
    BadFrameInfo,
    /// Payload exceeds the maximum frame size.
    FrameLimit,
    /// No frame available (empty buffer, or end of data reached).
    NoBytes,
    /// Operation not valid in the current buffer state.
    WrongState,
    /// On-flash structures are damaged beyond recovery.
    Corrupt,
    /// The underlying flash driver failed.
    Flash(NorFlashErrorKind),
}

impl RingError {
    pub(crate) fn flash<E: NorFlashError>(e: E) -> Self {
        RingError::Flash(e.kind())
    }
}

/// Errors reported by [`crate::kvs::KeyValueStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KvsError {
    /// Namespace, key, value or layout constraints violated.
    InvalidArgument,
    /// No entry for the requested namespace/key.
    NotFound,
    /// The partition cannot hold the entry, even after compaction.
    NoSpace,
    /// A stored entry failed its integrity checks.
    BadData,
    /// Mutation attempted on a read-only partition.
    ReadOnly,
    /// The underlying flash driver failed.
    Flash(NorFlashErrorKind),
}

impl KvsError {
    pub(crate) fn flash<E: NorFlashError>(e: E) -> Self {
        KvsError::Flash(e.kind())
    }
}
