//! Crash-safe storage engines for raw NOR flash.
//!
//! Two engines share a common on-flash vocabulary (CRC-guarded records
//! that exploit NOR's clear-bits-only programming):
//!
//! - [`ring::FlashRingBuffer`]: an append-only frame log for telemetry
//!   and diagnostics. Frames are packed through 4 KiB sectors, each
//!   sector ending in an 8-byte trailer that lets recovery find the
//!   write position without replaying the whole region.
//! - [`kvs::KeyValueStore`]: namespaced key/value records over a set of
//!   flash partitions, with optional AES-CTR value encryption and
//!   crash-safe compaction staged through a backup partition.
//!
//! Both engines sit on the blocking [`embedded_storage`] traits and
//! assume a `MultiwriteNorFlash` part (byte-granular programs, repeated
//! programs to the same bytes allowed). Flash geometry is fixed at
//! 4096-byte sectors and 256-byte pages.
//!
//! The engines take `&mut self` and hold no interior locks; wrap them
//! in [`lock::Shared`] to use one instance from several tasks.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

pub mod codec;
mod crc;
pub mod error;
pub mod kvs;
pub mod lock;
pub mod partition;
pub mod ring;

pub use error::{KvsError, RingError};
pub use kvs::KeyValueStore;
pub use partition::{FlashRegion, KvsLayout, PartitionSpec};
pub use ring::{FlashRingBuffer, FrameInfo};
