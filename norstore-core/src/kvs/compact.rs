//! Crash-safe compaction through the backup region.
//!
//! A full partition is rebuilt in two phases. First the surviving
//! records are migrated into the erased backup region; only then is the
//! backup header written, with its tag set to the target partition's
//! device offset. That header is the commit mark: once it is on flash
//! the target is erased, the staged body copied back, a fresh active
//! header written and the backup header invalidated by zeroing its tag
//! in place. A power cut before the mark leaves the target untouched; a
//! cut after it leaves a backup that [`KeyValueStore::new`] replays on
//! the next boot, so the rebuild is idempotent from either side.
//!
//! Encrypted values are re-ciphered during migration under a fresh
//! nonce, using the address each record will occupy after the copy
//! back. Records whose payload no longer matches its CRC are dropped.

use ctr::cipher::StreamCipher;
use embedded_storage::nor_flash::MultiwriteNorFlash;
use rand_core::RngCore;

use super::{cipher, EntryScan, KeyValueStore, PartRef, PartState};
use crate::codec::{
    EntryMeta, PartitionHeader, ENTRY_META_NO_CRC_LEN, ENTRY_META_SIZE, KVS_TERMINATOR, NONCE_LEN,
    PARTITION_HEADER_SIZE,
};
use crate::crc::crc16_update;
use crate::error::KvsError;
use crate::partition::FlashRegion;

/// A same-key replacement folded into the compaction pass: the old
/// record is dropped during migration and the new value staged in its
/// stead, which lets a replacement land in a partition too full to
/// hold both copies.
pub(super) struct PendingReplace<'a> {
    pub(super) old_offset: u32,
    pub(super) namespace: &'a [u8],
    pub(super) key: &'a [u8],
    pub(super) value: &'a [u8],
    pub(super) encrypt: bool,
}

impl<S: MultiwriteNorFlash, R: RngCore, const N: usize> KeyValueStore<S, R, N> {
    pub(super) fn compact(
        &mut self,
        p: PartRef,
        pending: Option<PendingReplace<'_>>,
    ) -> Result<(), KvsError> {
        let target = self.region_of(p);
        let backup = self.layout.backup;
        let src_state = self.ensure_initialized(p)?;
        self.erase_region(backup)?;

        let mut new_nonce = [0u8; NONCE_LEN];
        self.rng.fill_bytes(&mut new_nonce);

        let mut pending = pending;
        let mut dst_off = PARTITION_HEADER_SIZE as u32;
        let mut src_off = PARTITION_HEADER_SIZE as u32;
        loop {
            match self.scan_entry(p, src_off)? {
                EntryScan::End(_) => break,
                EntryScan::Entry(e_off, meta) => {
                    src_off = e_off + meta.entry_len() as u32;
                    if let Some(pr) = pending.take_if(|pr| pr.old_offset == e_off) {
                        dst_off += self.stage_pending(target, backup, dst_off, &new_nonce, &pr)?;
                        continue;
                    }
                    if !meta.valid {
                        continue;
                    }
                    if self.body_crc(target, e_off, &meta)? != meta.value_crc {
                        continue;
                    }
                    dst_off += self.migrate_entry(
                        target,
                        backup,
                        e_off,
                        dst_off,
                        &meta,
                        &src_state.nonce,
                        &new_nonce,
                    )?;
                }
            }
        }
        if let Some(pr) = pending.take() {
            dst_off += self.stage_pending(target, backup, dst_off, &new_nonce, &pr)?;
        }

        // Commit mark: from here on the rebuild completes, now or on
        // the next boot.
        let commit = PartitionHeader::backup(new_nonce, target.offset);
        self.region_write(backup, 0, &commit.encode())?;

        let body = dst_off - PARTITION_HEADER_SIZE as u32;
        self.erase_region(target)?;
        self.copy_bytes(backup, PARTITION_HEADER_SIZE as u32, target, PARTITION_HEADER_SIZE as u32, body)?;
        self.region_write(target, 0, &PartitionHeader::active(new_nonce).encode())?;
        if !self.bytes_match(backup, target, PARTITION_HEADER_SIZE as u32, body)? {
            return Err(KvsError::BadData);
        }
        // Retire the backup by breaking its header CRC in place.
        self.region_write(backup, NONCE_LEN as u32, &[0, 0, 0, 0])?;

        *self.state_mut(p) = Some(PartState {
            write_offset: dst_off,
            nonce: new_nonce,
        });
        Ok(())
    }

    /// Replay an interrupted compaction whose commit mark made it to
    /// flash. Called once when the store is opened.
    pub(super) fn recover_backup(&mut self) -> Result<(), KvsError> {
        let backup = self.layout.backup;
        let mut raw = [0u8; PARTITION_HEADER_SIZE];
        self.region_read(backup, 0, &mut raw)?;
        let header = match PartitionHeader::decode(&raw) {
            Some(h) => h,
            None => return Ok(()),
        };
        if header.tag == 0 || header.is_active() {
            return Ok(());
        }
        let target = match self.region_for_offset(header.tag) {
            Some(r) => r,
            None => return Ok(()),
        };

        self.erase_region(target)?;
        self.copy_bytes(
            backup,
            PARTITION_HEADER_SIZE as u32,
            target,
            PARTITION_HEADER_SIZE as u32,
            target.size - PARTITION_HEADER_SIZE as u32,
        )?;
        self.region_write(target, 0, &PartitionHeader::active(header.nonce).encode())?;
        self.region_write(backup, NONCE_LEN as u32, &[0, 0, 0, 0])?;
        Ok(())
    }

    fn region_for_offset(&self, offset: u32) -> Option<FlashRegion> {
        if self.layout.shared.offset == offset {
            return Some(self.layout.shared);
        }
        self.layout
            .dedicated
            .iter()
            .map(|p| p.region)
            .find(|r| r.offset == offset)
    }

    fn stage_pending(
        &mut self,
        target: FlashRegion,
        backup: FlashRegion,
        dst_off: u32,
        nonce: &[u8; NONCE_LEN],
        pr: &PendingReplace<'_>,
    ) -> Result<u32, KvsError> {
        self.write_entry(
            backup,
            target.offset,
            dst_off,
            nonce,
            pr.namespace,
            pr.key,
            pr.value,
            pr.encrypt,
        )
    }

    /// Stage one surviving record into the backup region. Plain records
    /// copy verbatim; encrypted ones are re-ciphered under the new
    /// nonce at the address they will occupy after the copy back.
    /// Returns the staged length, 0 when the record had to be dropped.
    #[allow(clippy::too_many_arguments)]
    fn migrate_entry(
        &mut self,
        target: FlashRegion,
        backup: FlashRegion,
        src_off: u32,
        dst_off: u32,
        meta: &EntryMeta,
        src_nonce: &[u8; NONCE_LEN],
        new_nonce: &[u8; NONCE_LEN],
    ) -> Result<u32, KvsError> {
        let entry_len = meta.entry_len() as u32;
        if !meta.encrypted {
            self.copy_bytes(target, src_off, backup, dst_off, entry_len)?;
            return Ok(entry_len);
        }
        let key_material = match self.key {
            // Without key material the record cannot follow the nonce.
            None => return Ok(0),
            Some(k) => k,
        };

        let mut out = *meta;
        out.value_crc = 0;
        out.meta_crc = 0;
        let encoded = out.encode();
        self.region_write(backup, dst_off, &encoded[..ENTRY_META_NO_CRC_LEN])?;

        let hdr = meta.header_len() as u32;
        let mut crc = 0u16;
        {
            // namespace and key move unchanged
            let mut buf = [0u8; 64];
            let n = hdr as usize;
            self.region_read(target, src_off + ENTRY_META_SIZE as u32, &mut buf[..n])?;
            crc = crc16_update(crc, &buf[..n]);
            self.region_write(backup, dst_off + ENTRY_META_SIZE as u32, &buf[..n])?;
        }

        let src_value = src_off + ENTRY_META_SIZE as u32 + hdr;
        let dst_value = dst_off + ENTRY_META_SIZE as u32 + hdr;
        let mut decrypt = cipher::value_cipher(&key_material, src_nonce, target.offset + src_value);
        let mut encrypt = cipher::value_cipher(&key_material, new_nonce, target.offset + dst_value);
        let mut chunk = [0u8; 256];
        let mut done = 0u32;
        while done < meta.value_len as u32 {
            let n = ((meta.value_len as u32 - done) as usize).min(chunk.len());
            self.region_read(target, src_value + done, &mut chunk[..n])?;
            decrypt.apply_keystream(&mut chunk[..n]);
            encrypt.apply_keystream(&mut chunk[..n]);
            crc = crc16_update(crc, &chunk[..n]);
            self.region_write(backup, dst_value + done, &chunk[..n])?;
            done += n as u32;
        }
        let term = [KVS_TERMINATOR];
        crc = crc16_update(crc, &term);
        self.region_write(backup, dst_value + meta.value_len as u32, &term)?;

        out.value_crc = crc;
        out.meta_crc = out.compute_meta_crc();
        self.region_write(backup, dst_off, &out.encode())?;
        Ok(entry_len)
    }

    fn copy_bytes(
        &mut self,
        src: FlashRegion,
        src_off: u32,
        dst: FlashRegion,
        dst_off: u32,
        len: u32,
    ) -> Result<(), KvsError> {
        let mut chunk = [0u8; 256];
        let mut done = 0u32;
        while done < len {
            let n = ((len - done) as usize).min(chunk.len());
            self.region_read(src, src_off + done, &mut chunk[..n])?;
            self.region_write(dst, dst_off + done, &chunk[..n])?;
            done += n as u32;
        }
        Ok(())
    }

    fn bytes_match(
        &mut self,
        a: FlashRegion,
        b: FlashRegion,
        off: u32,
        len: u32,
    ) -> Result<bool, KvsError> {
        let mut ca = [0u8; 256];
        let mut cb = [0u8; 256];
        let mut done = 0u32;
        while done < len {
            let n = ((len - done) as usize).min(ca.len());
            self.region_read(a, off + done, &mut ca[..n])?;
            self.region_read(b, off + done, &mut cb[..n])?;
            if ca[..n] != cb[..n] {
                return Ok(false);
            }
            done += n as u32;
        }
        Ok(true)
    }
}
