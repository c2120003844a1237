//! Resumable CRC helpers for the on-flash records.
//!
//! Both algorithms have no output XOR and no reflection, so a finalized
//! value can be fed back in as the initial register to continue a
//! checksum across scattered byte ranges.

use crc::{Crc, CRC_16_XMODEM, CRC_8_SMBUS};

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Continue a CRC-8/SMBUS checksum over `data`. Start with 0.
pub fn crc8_update(crc: u8, data: &[u8]) -> u8 {
    let mut digest = CRC8.digest_with_initial(crc);
    digest.update(data);
    digest.finalize()
}

/// Continue a CRC-16/XMODEM checksum over `data`. Start with 0.
pub fn crc16_update(crc: u16, data: &[u8]) -> u16 {
    let mut digest = CRC16.digest_with_initial(crc);
    digest.update(data);
    digest.finalize()
}
