//! AES-128-CTR for values stored in encrypted partitions.
//!
//! The IV concatenates the partition nonce with the absolute flash
//! address of the value's first byte, so every value gets its own
//! keystream while the nonce lives. Compaction rewrites values under a
//! fresh nonce, which keeps the address-based IVs safe across moves.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;

use crate::codec::NONCE_LEN;

/// AES-128 key length.
pub const KEY_LEN: usize = 16;

pub(crate) type ValueCipher = Ctr128BE<Aes128>;

/// Cipher positioned at the start of one value. Feed the value through
/// [`StreamCipher::apply_keystream`] in order; chunking is fine as long
/// as the same instance is used for the whole value.
pub(crate) fn value_cipher(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    address: u32,
) -> ValueCipher {
    let mut iv = [0u8; 16];
    iv[..NONCE_LEN].copy_from_slice(nonce);
    iv[NONCE_LEN..].copy_from_slice(&address.to_le_bytes());
    ValueCipher::new(key.into(), (&iv).into())
}
