//! In-memory NOR flash simulator for host-side testing.
//!
//! Models the properties the storage engines rely on:
//!
//! - byte-granular programs that can only clear bits (`mem &= data`)
//! - whole-sector erases back to 0xFF
//! - power loss in the middle of a program or erase, leaving a
//!   partially applied operation behind
//!
//! Power loss is injected with [`SimFlash::power_cut_after`]: the budget
//! counts programmed bytes (an erase costs one sector's worth per sector).
//! Once the budget is spent the current operation stops mid-way and every
//! later mutation fails with [`SimError::PowerCut`] until [`SimFlash::revive`].

#![deny(unsafe_code)]

use embedded_storage::nor_flash::{
    ErrorType, MultiwriteNorFlash, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

/// Sector size of the simulated part.
pub const SECTOR_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SimError {
    /// Access past the end of the device.
    OutOfBounds,
    /// Erase bounds not sector aligned.
    NotAligned,
    /// The injected power budget ran out.
    PowerCut,
}

impl NorFlashError for SimError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            SimError::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            SimError::NotAligned => NorFlashErrorKind::NotAligned,
            SimError::PowerCut => NorFlashErrorKind::Other,
        }
    }
}

/// Simulated NOR flash device.
#[derive(Debug, Clone)]
pub struct SimFlash {
    mem: Vec<u8>,
    budget: Option<u64>,
    dead: bool,
    /// Total bytes programmed over the device lifetime.
    pub program_count: u64,
    /// Total sectors erased over the device lifetime.
    pub erase_count: u64,
}

impl SimFlash {
    /// Create a fully erased device of `sectors` sectors.
    pub fn new(sectors: usize) -> Self {
        Self {
            mem: vec![0xFF; sectors * SECTOR_SIZE],
            budget: None,
            dead: false,
            program_count: 0,
            erase_count: 0,
        }
    }

    /// Build a device from a raw image. The image length must be a
    /// multiple of the sector size.
    pub fn from_image(image: Vec<u8>) -> Self {
        assert!(image.len() % SECTOR_SIZE == 0);
        Self {
            mem: image,
            budget: None,
            dead: false,
            program_count: 0,
            erase_count: 0,
        }
    }

    /// Raw flash contents.
    pub fn image(&self) -> &[u8] {
        &self.mem
    }

    /// Arm the power-cut injector: after `bytes` more mutated bytes the
    /// device dies, possibly mid-operation.
    pub fn power_cut_after(&mut self, bytes: u64) {
        self.budget = Some(bytes);
        self.dead = false;
    }

    /// Clear a pending or tripped power cut, as if the device rebooted.
    pub fn revive(&mut self) {
        self.budget = None;
        self.dead = false;
    }

    /// Whether the injected power cut has tripped.
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    fn spend(&mut self, n: u64) -> u64 {
        match self.budget {
            None => n,
            Some(left) => {
                let granted = left.min(n);
                self.budget = Some(left - granted);
                if granted < n {
                    self.dead = true;
                }
                granted
            }
        }
    }
}

impl ErrorType for SimFlash {
    type Error = SimError;
}

impl ReadNorFlash for SimFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let start = offset as usize;
        let end = start
            .checked_add(bytes.len())
            .ok_or(SimError::OutOfBounds)?;
        if end > self.mem.len() {
            return Err(SimError::OutOfBounds);
        }
        bytes.copy_from_slice(&self.mem[start..end]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.mem.len()
    }
}

impl NorFlash for SimFlash {
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        let (from, to) = (from as usize, to as usize);
        if from % SECTOR_SIZE != 0 || to % SECTOR_SIZE != 0 {
            return Err(SimError::NotAligned);
        }
        if from > to || to > self.mem.len() {
            return Err(SimError::OutOfBounds);
        }
        if self.dead {
            return Err(SimError::PowerCut);
        }
        for sector in (from..to).step_by(SECTOR_SIZE) {
            let granted = self.spend(SECTOR_SIZE as u64) as usize;
            self.mem[sector..sector + granted].fill(0xFF);
            if granted < SECTOR_SIZE {
                return Err(SimError::PowerCut);
            }
            self.erase_count += 1;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let start = offset as usize;
        let end = start
            .checked_add(bytes.len())
            .ok_or(SimError::OutOfBounds)?;
        if end > self.mem.len() {
            return Err(SimError::OutOfBounds);
        }
        if self.dead {
            return Err(SimError::PowerCut);
        }
        let granted = self.spend(bytes.len() as u64) as usize;
        for (dst, src) in self.mem[start..start + granted].iter_mut().zip(bytes) {
            // NOR programs can only clear bits.
            *dst &= *src;
        }
        self.program_count += granted as u64;
        if granted < bytes.len() {
            return Err(SimError::PowerCut);
        }
        Ok(())
    }
}

impl MultiwriteNorFlash for SimFlash {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_clears_bits_only() {
        let mut flash = SimFlash::new(1);
        flash.write(0, &[0xF0]).unwrap();
        flash.write(0, &[0x0F]).unwrap();
        assert_eq!(flash.image()[0], 0x00);

        flash.write(1, &[0x12]).unwrap();
        flash.write(1, &[0xFF]).unwrap();
        assert_eq!(flash.image()[1], 0x12);
    }

    #[test]
    fn test_erase_restores_ff() {
        let mut flash = SimFlash::new(2);
        flash.write(100, &[0x00; 16]).unwrap();
        flash.erase(0, SECTOR_SIZE as u32).unwrap();
        assert!(flash.image()[..SECTOR_SIZE].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_erase_requires_alignment() {
        let mut flash = SimFlash::new(2);
        assert_eq!(flash.erase(1, SECTOR_SIZE as u32), Err(SimError::NotAligned));
    }

    #[test]
    fn test_power_cut_leaves_partial_write() {
        let mut flash = SimFlash::new(1);
        flash.power_cut_after(3);
        assert_eq!(flash.write(0, &[0x00; 8]), Err(SimError::PowerCut));
        assert_eq!(&flash.image()[..4], &[0x00, 0x00, 0x00, 0xFF]);

        // Dead until revived.
        assert_eq!(flash.write(8, &[0x00]), Err(SimError::PowerCut));
        flash.revive();
        flash.write(8, &[0x00]).unwrap();
    }

    #[test]
    fn test_power_cut_mid_erase() {
        let mut flash = SimFlash::new(2);
        flash.write(0, &[0x00; SECTOR_SIZE]).unwrap();
        flash.power_cut_after(10);
        assert_eq!(flash.erase(0, SECTOR_SIZE as u32), Err(SimError::PowerCut));
        assert!(flash.image()[..10].iter().all(|&b| b == 0xFF));
        assert!(flash.image()[10..SECTOR_SIZE].iter().all(|&b| b == 0x00));
    }
}
