//! Namespaced key/value store over flash partitions.
//!
//! Entries are appended to a partition as self-describing records
//! (metadata, namespace, key, value, terminator), each carrying two
//! CRCs written after the payload so a torn write never validates.
//! Updating a key appends a new record and then clears the valid bit of
//! the older copies in place; deleted space is reclaimed by compaction
//! through the backup region (see [`compact`]).
//!
//! Namespaces whose name matches a dedicated partition are routed
//! there, with the namespace bytes elided from every record. All other
//! entries land in the shared partition. Values can be encrypted with
//! AES-CTR under a per-partition nonce stored in the partition header.

mod cipher;
mod compact;

pub use cipher::KEY_LEN;

use ctr::cipher::StreamCipher;
use embedded_storage::nor_flash::MultiwriteNorFlash;
use rand_core::RngCore;

use crate::codec::{
    is_erased, EntryMeta, PartitionHeader, ENTRY_META_NO_CRC_LEN, ENTRY_META_SIZE, KVS_MAGIC,
    KVS_TERMINATOR, MAX_KEY_LEN, MAX_NAMESPACE_LEN, MAX_VALUE_LEN, NONCE_LEN,
    PARTITION_HEADER_SIZE,
};
use crate::crc::crc16_update;
use crate::error::KvsError;
use crate::partition::{FlashRegion, KvsLayout};

/// Cached runtime state of an initialized partition.
#[derive(Debug, Clone, Copy)]
struct PartState {
    /// Offset of the first erased byte, where the next record goes.
    write_offset: u32,
    /// Nonce from the partition header, for value encryption.
    nonce: [u8; NONCE_LEN],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartRef {
    Shared,
    Dedicated(usize),
}

/// What an offset in the record log holds.
enum EntryScan {
    /// A structurally sound record (magic, meta CRC, bounds).
    Entry(u32, EntryMeta),
    /// End of the log: first erased metadata slot, or no room left.
    End(u32),
}

pub struct KeyValueStore<S, R, const N: usize> {
    flash: S,
    rng: R,
    layout: KvsLayout<N>,
    key: Option<[u8; KEY_LEN]>,
    shared: Option<PartState>,
    dedicated: [Option<PartState>; N],
}

impl<S: MultiwriteNorFlash, R: RngCore, const N: usize> KeyValueStore<S, R, N> {
    /// Open a store over `layout`. An interrupted compaction found
    /// staged in the backup region is replayed before first use.
    /// `key` enables value encryption; without it encrypted entries
    /// can be neither written nor read.
    pub fn new(
        flash: S,
        rng: R,
        layout: KvsLayout<N>,
        key: Option<[u8; KEY_LEN]>,
    ) -> Result<Self, KvsError> {
        layout.validate(flash.capacity() as u32)?;
        let mut store = Self {
            flash,
            rng,
            layout,
            key,
            shared: None,
            dedicated: [None; N],
        };
        store.recover_backup()?;
        Ok(store)
    }

    /// Give the flash device back.
    pub fn into_flash(self) -> S {
        self.flash
    }

    /// Store `value` under `namespace`/`key`, replacing any older copy.
    /// With `encrypt` (or in a partition that forces it) the value is
    /// ciphered on flash. Triggers compaction when the partition is
    /// full of retired records.
    pub fn set(
        &mut self,
        namespace: Option<&str>,
        key: &str,
        value: &[u8],
        encrypt: bool,
    ) -> Result<(), KvsError> {
        let (p, ns) = self.resolve(namespace)?;
        if key.is_empty() || key.len() > MAX_KEY_LEN || value.is_empty() || value.len() > MAX_VALUE_LEN
        {
            return Err(KvsError::InvalidArgument);
        }
        if self.is_read_only(p) {
            return Err(KvsError::ReadOnly);
        }
        let encrypt = encrypt || self.forced_encryption(p);
        if encrypt && self.key.is_none() {
            return Err(KvsError::InvalidArgument);
        }

        let mut state = self.ensure_initialized(p)?;
        let size = self.region_of(p).size;
        let new_len = (ENTRY_META_SIZE + ns.len() + key.len() + value.len() + 1) as u32;

        if state.write_offset + new_len > size {
            // Out of room. When replacing an existing key, compaction
            // can swap the new value in during migration, which is the
            // only way a replacement of similar size ever fits.
            if let Some((old_off, old_meta)) = self.find_entry(p, ns, key.as_bytes())? {
                if state.write_offset + new_len <= size + old_meta.entry_len() as u32 {
                    return self.compact(
                        p,
                        Some(compact::PendingReplace {
                            old_offset: old_off,
                            namespace: ns,
                            key: key.as_bytes(),
                            value,
                            encrypt,
                        }),
                    );
                }
            }
            self.compact(p, None)?;
            state = self.ensure_initialized(p)?;
            if state.write_offset + new_len > size {
                return Err(KvsError::NoSpace);
            }
        }

        let region = self.region_of(p);
        let off = state.write_offset;
        self.write_entry(region, region.offset, off, &state.nonce, ns, key.as_bytes(), value, encrypt)?;
        if !self.verify_entry(region, off)? {
            let meta = self.meta_at(region, off)?;
            self.invalidate_entry(region, off, &meta)?;
            return Err(KvsError::BadData);
        }
        // Retire older copies only once the new record verified.
        self.delete_matches_before(p, off, ns, key.as_bytes())?;
        if let Some(s) = self.state_mut(p).as_mut() {
            s.write_offset = off + new_len;
        }
        Ok(())
    }

    /// Read the value under `namespace`/`key` into `buf`, decrypting
    /// as needed. `buf` must hold the whole value; use
    /// [`KeyValueStore::get_size`] to size it. Returns the value length.
    pub fn get(
        &mut self,
        namespace: Option<&str>,
        key: &str,
        buf: &mut [u8],
    ) -> Result<usize, KvsError> {
        let (p, ns) = self.resolve(namespace)?;
        let state = self.ensure_initialized(p)?;
        let region = self.region_of(p);
        let (off, meta) = self
            .find_entry(p, ns, key.as_bytes())?
            .ok_or(KvsError::NotFound)?;
        let len = meta.value_len as usize;
        if buf.len() < len {
            return Err(KvsError::InvalidArgument);
        }

        if self.body_crc(region, off, &meta)? != meta.value_crc {
            self.invalidate_entry(region, off, &meta)?;
            return Err(KvsError::BadData);
        }
        let value_off = off + (ENTRY_META_SIZE + meta.header_len()) as u32;
        self.region_read(region, value_off, &mut buf[..len])?;
        if meta.encrypted {
            let key_material = self.key.ok_or(KvsError::InvalidArgument)?;
            let address = region.offset + value_off;
            cipher::value_cipher(&key_material, &state.nonce, address)
                .apply_keystream(&mut buf[..len]);
        }
        Ok(len)
    }

    /// Stored value length for `namespace`/`key`.
    pub fn get_size(&mut self, namespace: Option<&str>, key: &str) -> Result<usize, KvsError> {
        let (p, ns) = self.resolve(namespace)?;
        self.ensure_initialized(p)?;
        let (_, meta) = self
            .find_entry(p, ns, key.as_bytes())?
            .ok_or(KvsError::NotFound)?;
        Ok(meta.value_len as usize)
    }

    /// Remove `namespace`/`key` by clearing its valid bit in place.
    pub fn delete(&mut self, namespace: Option<&str>, key: &str) -> Result<(), KvsError> {
        let (p, ns) = self.resolve(namespace)?;
        if self.is_read_only(p) {
            return Err(KvsError::ReadOnly);
        }
        self.ensure_initialized(p)?;
        let region = self.region_of(p);
        let (off, meta) = self
            .find_entry(p, ns, key.as_bytes())?
            .ok_or(KvsError::NotFound)?;
        self.invalidate_entry(region, off, &meta)
    }

    /// Remove every entry in a namespace. A dedicated partition is
    /// erased outright; in the shared partition entries are invalidated
    /// one by one. `None` clears the entries stored without namespace.
    pub fn delete_namespace(&mut self, namespace: Option<&str>) -> Result<(), KvsError> {
        let (p, ns) = self.resolve(namespace)?;
        if self.is_read_only(p) {
            return Err(KvsError::ReadOnly);
        }
        if let PartRef::Dedicated(_) = p {
            let region = self.region_of(p);
            self.erase_region(region)?;
            // Reinitialized with a fresh header on next use.
            *self.state_mut(p) = None;
            return Ok(());
        }

        self.ensure_initialized(p)?;
        let region = self.region_of(p);
        let mut off = PARTITION_HEADER_SIZE as u32;
        loop {
            match self.scan_entry(p, off)? {
                EntryScan::End(_) => return Ok(()),
                EntryScan::Entry(e_off, meta) => {
                    off = e_off + meta.entry_len() as u32;
                    if meta.valid && self.namespace_matches(p, e_off, &meta, ns)? {
                        self.invalidate_entry(region, e_off, &meta)?;
                    }
                }
            }
        }
    }

    /// Compact the partition backing `namespace`, physically dropping
    /// every retired record. Writes do this on their own when they run
    /// out of room; calling it directly reclaims the space early.
    pub fn cleanup(&mut self, namespace: Option<&str>) -> Result<(), KvsError> {
        let (p, _) = self.resolve(namespace)?;
        if self.is_read_only(p) {
            return Err(KvsError::ReadOnly);
        }
        self.compact(p, None)
    }

    /// Call `f` with every key stored under `namespace`, in record
    /// order. Keys that are not valid UTF-8 are skipped.
    pub fn for_each_key<F: FnMut(&str)>(
        &mut self,
        namespace: Option<&str>,
        mut f: F,
    ) -> Result<(), KvsError> {
        let (p, ns) = self.resolve(namespace)?;
        self.ensure_initialized(p)?;
        let mut off = PARTITION_HEADER_SIZE as u32;
        loop {
            match self.scan_entry(p, off)? {
                EntryScan::End(_) => return Ok(()),
                EntryScan::Entry(e_off, meta) => {
                    off = e_off + meta.entry_len() as u32;
                    if !meta.valid || meta.namespace_len as usize != ns.len() {
                        continue;
                    }
                    let mut buf = [0u8; MAX_NAMESPACE_LEN + MAX_KEY_LEN];
                    let n = meta.header_len();
                    self.region_read(self.region_of(p), e_off + ENTRY_META_SIZE as u32, &mut buf[..n])?;
                    if &buf[..ns.len()] != ns {
                        continue;
                    }
                    if let Ok(k) = core::str::from_utf8(&buf[ns.len()..n]) {
                        f(k);
                    }
                }
            }
        }
    }

    /// Call `f` with every namespace known to the store: the dedicated
    /// partition names, then each distinct namespace found in the
    /// shared partition.
    pub fn for_each_namespace<F: FnMut(&str)>(&mut self, mut f: F) -> Result<(), KvsError> {
        let mut names = heapless::Vec::<&'static str, N>::new();
        for part in &self.layout.dedicated {
            let _ = names.push(part.name);
        }
        for name in &names {
            f(name);
        }

        let p = PartRef::Shared;
        self.ensure_initialized(p)?;
        let mut off = PARTITION_HEADER_SIZE as u32;
        loop {
            match self.scan_entry(p, off)? {
                EntryScan::End(_) => return Ok(()),
                EntryScan::Entry(e_off, meta) => {
                    off = e_off + meta.entry_len() as u32;
                    if !meta.valid || meta.namespace_len == 0 {
                        continue;
                    }
                    let mut nsbuf = [0u8; MAX_NAMESPACE_LEN];
                    let n = meta.namespace_len as usize;
                    self.region_read(self.region_of(p), e_off + ENTRY_META_SIZE as u32, &mut nsbuf[..n])?;
                    // Emit each namespace at its first valid occurrence.
                    if self.seen_namespace_before(e_off, &nsbuf[..n])? {
                        continue;
                    }
                    if let Ok(s) = core::str::from_utf8(&nsbuf[..n]) {
                        f(s);
                    }
                }
            }
        }
    }

    // --- partition plumbing ---

    fn resolve<'a>(&self, namespace: Option<&'a str>) -> Result<(PartRef, &'a [u8]), KvsError> {
        match namespace {
            None => Ok((PartRef::Shared, &[])),
            Some(ns) => {
                if ns.is_empty() || ns.len() > MAX_NAMESPACE_LEN {
                    return Err(KvsError::InvalidArgument);
                }
                for (i, part) in self.layout.dedicated.iter().enumerate() {
                    if part.name == ns {
                        return Ok((PartRef::Dedicated(i), &[]));
                    }
                }
                Ok((PartRef::Shared, ns.as_bytes()))
            }
        }
    }

    fn region_of(&self, p: PartRef) -> FlashRegion {
        match p {
            PartRef::Shared => self.layout.shared,
            PartRef::Dedicated(i) => self.layout.dedicated[i].region,
        }
    }

    fn is_read_only(&self, p: PartRef) -> bool {
        match p {
            PartRef::Shared => false,
            PartRef::Dedicated(i) => self.layout.dedicated[i].read_only,
        }
    }

    fn forced_encryption(&self, p: PartRef) -> bool {
        match p {
            PartRef::Shared => false,
            PartRef::Dedicated(i) => self.layout.dedicated[i].encrypted,
        }
    }

    fn state_mut(&mut self, p: PartRef) -> &mut Option<PartState> {
        match p {
            PartRef::Shared => &mut self.shared,
            PartRef::Dedicated(i) => &mut self.dedicated[i],
        }
    }

    fn region_read(&mut self, region: FlashRegion, off: u32, buf: &mut [u8]) -> Result<(), KvsError> {
        self.flash.read(region.offset + off, buf).map_err(KvsError::flash)
    }

    fn region_write(&mut self, region: FlashRegion, off: u32, buf: &[u8]) -> Result<(), KvsError> {
        self.flash.write(region.offset + off, buf).map_err(KvsError::flash)
    }

    fn erase_region(&mut self, region: FlashRegion) -> Result<(), KvsError> {
        self.flash
            .erase(region.offset, region.end())
            .map_err(KvsError::flash)
    }

    /// Partition state, scanning the log on first touch. A missing or
    /// damaged header means first use: the partition is wiped and given
    /// a fresh header (never for read-only partitions).
    fn ensure_initialized(&mut self, p: PartRef) -> Result<PartState, KvsError> {
        if let Some(state) = *self.state_mut(p) {
            return Ok(state);
        }
        let region = self.region_of(p);
        let mut raw = [0u8; PARTITION_HEADER_SIZE];
        self.region_read(region, 0, &mut raw)?;
        let header = match PartitionHeader::decode(&raw).filter(|h| h.is_active()) {
            Some(h) => h,
            None => {
                if self.is_read_only(p) {
                    return Err(KvsError::BadData);
                }
                self.erase_region(region)?;
                let mut nonce = [0u8; NONCE_LEN];
                self.rng.fill_bytes(&mut nonce);
                let h = PartitionHeader::active(nonce);
                self.region_write(region, 0, &h.encode())?;
                h
            }
        };
        let write_offset = self.find_write_offset(p)?;
        let state = PartState {
            write_offset,
            nonce: header.nonce,
        };
        *self.state_mut(p) = Some(state);
        Ok(state)
    }

    fn find_write_offset(&mut self, p: PartRef) -> Result<u32, KvsError> {
        let mut off = PARTITION_HEADER_SIZE as u32;
        loop {
            match self.scan_entry(p, off)? {
                EntryScan::Entry(e_off, meta) => off = e_off + meta.entry_len() as u32,
                EntryScan::End(end) => return Ok(end),
            }
        }
    }

    /// Next record at or after `off`. Skips over torn or garbled bytes
    /// until a record that checks out structurally, or the erased log
    /// end, is found.
    fn scan_entry(&mut self, p: PartRef, mut off: u32) -> Result<EntryScan, KvsError> {
        let region = self.region_of(p);
        let size = region.size;
        while off + ENTRY_META_SIZE as u32 <= size {
            let mut raw = [0u8; ENTRY_META_SIZE];
            self.region_read(region, off, &mut raw)?;
            if raw[0] == KVS_MAGIC {
                if let Some(meta) = EntryMeta::decode(&raw) {
                    if meta.meta_crc_ok()
                        && (1..=MAX_KEY_LEN).contains(&(meta.key_len as usize))
                        && meta.namespace_len as usize <= MAX_NAMESPACE_LEN
                        && (1..=MAX_VALUE_LEN).contains(&(meta.value_len as usize))
                        && off as usize + meta.entry_len() <= size as usize
                    {
                        return Ok(EntryScan::Entry(off, meta));
                    }
                }
                off += 1;
            } else if is_erased(&raw) {
                return Ok(EntryScan::End(off));
            } else {
                off += 1;
            }
        }
        Ok(EntryScan::End(off.min(size)))
    }

    fn meta_at(&mut self, region: FlashRegion, off: u32) -> Result<EntryMeta, KvsError> {
        let mut raw = [0u8; ENTRY_META_SIZE];
        self.region_read(region, off, &mut raw)?;
        EntryMeta::decode(&raw).ok_or(KvsError::BadData)
    }

    /// Newest valid record matching `ns`/`key`, if any.
    fn find_entry(
        &mut self,
        p: PartRef,
        ns: &[u8],
        key: &[u8],
    ) -> Result<Option<(u32, EntryMeta)>, KvsError> {
        let mut off = PARTITION_HEADER_SIZE as u32;
        let mut found = None;
        loop {
            match self.scan_entry(p, off)? {
                EntryScan::End(_) => return Ok(found),
                EntryScan::Entry(e_off, meta) => {
                    off = e_off + meta.entry_len() as u32;
                    if meta.valid && self.entry_matches(p, e_off, &meta, ns, key)? {
                        found = Some((e_off, meta));
                    }
                }
            }
        }
    }

    fn entry_matches(
        &mut self,
        p: PartRef,
        off: u32,
        meta: &EntryMeta,
        ns: &[u8],
        key: &[u8],
    ) -> Result<bool, KvsError> {
        if meta.namespace_len as usize != ns.len() || meta.key_len as usize != key.len() {
            return Ok(false);
        }
        let mut buf = [0u8; MAX_NAMESPACE_LEN + MAX_KEY_LEN];
        let n = meta.header_len();
        self.region_read(self.region_of(p), off + ENTRY_META_SIZE as u32, &mut buf[..n])?;
        Ok(&buf[..ns.len()] == ns && &buf[ns.len()..n] == key)
    }

    fn namespace_matches(
        &mut self,
        p: PartRef,
        off: u32,
        meta: &EntryMeta,
        ns: &[u8],
    ) -> Result<bool, KvsError> {
        if meta.namespace_len as usize != ns.len() {
            return Ok(false);
        }
        if ns.is_empty() {
            return Ok(true);
        }
        let mut buf = [0u8; MAX_NAMESPACE_LEN];
        self.region_read(self.region_of(p), off + ENTRY_META_SIZE as u32, &mut buf[..ns.len()])?;
        Ok(&buf[..ns.len()] == ns)
    }

    fn seen_namespace_before(&mut self, limit: u32, ns: &[u8]) -> Result<bool, KvsError> {
        let p = PartRef::Shared;
        let mut off = PARTITION_HEADER_SIZE as u32;
        loop {
            match self.scan_entry(p, off)? {
                EntryScan::End(_) => return Ok(false),
                EntryScan::Entry(e_off, meta) => {
                    if e_off >= limit {
                        return Ok(false);
                    }
                    off = e_off + meta.entry_len() as u32;
                    if meta.valid && self.namespace_matches(p, e_off, &meta, ns)? {
                        return Ok(true);
                    }
                }
            }
        }
    }

    fn delete_matches_before(
        &mut self,
        p: PartRef,
        limit: u32,
        ns: &[u8],
        key: &[u8],
    ) -> Result<(), KvsError> {
        let region = self.region_of(p);
        let mut off = PARTITION_HEADER_SIZE as u32;
        loop {
            match self.scan_entry(p, off)? {
                EntryScan::End(_) => return Ok(()),
                EntryScan::Entry(e_off, meta) => {
                    if e_off >= limit {
                        return Ok(());
                    }
                    off = e_off + meta.entry_len() as u32;
                    if meta.valid && self.entry_matches(p, e_off, &meta, ns, key)? {
                        self.invalidate_entry(region, e_off, &meta)?;
                    }
                }
            }
        }
    }

    // --- record plumbing ---

    /// Append a record at `off` in `dst`. The two CRC slots stay erased
    /// until the payload is on flash, so a power cut leaves a record
    /// that can never validate. `addr_base` is the device offset of the
    /// record's final home, which seeds the value cipher; it differs
    /// from `dst.offset` only while staging into the backup region.
    #[allow(clippy::too_many_arguments)]
    fn write_entry(
        &mut self,
        dst: FlashRegion,
        addr_base: u32,
        off: u32,
        nonce: &[u8; NONCE_LEN],
        ns: &[u8],
        key: &[u8],
        value: &[u8],
        encrypt: bool,
    ) -> Result<u32, KvsError> {
        let mut meta = EntryMeta {
            namespace_len: ns.len() as u8,
            key_len: key.len() as u8,
            value_len: value.len() as u16,
            encrypted: encrypt,
            valid: true,
            value_crc: 0,
            meta_crc: 0,
        };
        let encoded = meta.encode();
        self.region_write(dst, off, &encoded[..ENTRY_META_NO_CRC_LEN])?;

        let mut body_off = off + ENTRY_META_SIZE as u32;
        let mut crc = crc16_update(0, ns);
        crc = crc16_update(crc, key);
        self.region_write(dst, body_off, ns)?;
        self.region_write(dst, body_off + ns.len() as u32, key)?;
        body_off += (ns.len() + key.len()) as u32;

        if encrypt {
            let key_material = self.key.ok_or(KvsError::InvalidArgument)?;
            let address = addr_base + body_off;
            let mut cipher = cipher::value_cipher(&key_material, nonce, address);
            let mut chunk = [0u8; 256];
            let mut done = 0;
            while done < value.len() {
                let n = (value.len() - done).min(chunk.len());
                chunk[..n].copy_from_slice(&value[done..done + n]);
                cipher.apply_keystream(&mut chunk[..n]);
                crc = crc16_update(crc, &chunk[..n]);
                self.region_write(dst, body_off + done as u32, &chunk[..n])?;
                done += n;
            }
        } else {
            crc = crc16_update(crc, value);
            self.region_write(dst, body_off, value)?;
        }
        let term = [KVS_TERMINATOR];
        crc = crc16_update(crc, &term);
        self.region_write(dst, body_off + value.len() as u32, &term)?;

        meta.value_crc = crc;
        meta.meta_crc = meta.compute_meta_crc();
        // Full re-program: the already written bytes AND identically,
        // only the CRC slots change.
        self.region_write(dst, off, &meta.encode())?;
        Ok(meta.entry_len() as u32)
    }

    /// Re-read a freshly written record and check both CRCs.
    fn verify_entry(&mut self, region: FlashRegion, off: u32) -> Result<bool, KvsError> {
        let mut raw = [0u8; ENTRY_META_SIZE];
        self.region_read(region, off, &mut raw)?;
        let meta = match EntryMeta::decode(&raw) {
            Some(m) => m,
            None => return Ok(false),
        };
        if !meta.meta_crc_ok() {
            return Ok(false);
        }
        Ok(self.body_crc(region, off, &meta)? == meta.value_crc)
    }

    /// CRC over namespace, key, stored value and terminator as they
    /// sit on flash.
    fn body_crc(&mut self, region: FlashRegion, off: u32, meta: &EntryMeta) -> Result<u16, KvsError> {
        let mut crc = 0u16;
        let mut pos = off + ENTRY_META_SIZE as u32;
        let mut remaining = meta.header_len() + meta.value_len as usize + 1;
        let mut chunk = [0u8; 256];
        while remaining > 0 {
            let n = remaining.min(chunk.len());
            self.region_read(region, pos, &mut chunk[..n])?;
            crc = crc16_update(crc, &chunk[..n]);
            pos += n as u32;
            remaining -= n;
        }
        Ok(crc)
    }

    /// Clear a record's valid bit in place. The meta CRC is computed
    /// with the bit forced set, so it keeps matching.
    fn invalidate_entry(
        &mut self,
        region: FlashRegion,
        off: u32,
        meta: &EntryMeta,
    ) -> Result<(), KvsError> {
        let mut dead = *meta;
        dead.valid = false;
        self.region_write(region, off, &dead.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SECTOR_SIZE;
    use crate::partition::PartitionSpec;
    use norstore_sim::SimFlash;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    const KEY_MATERIAL: [u8; KEY_LEN] = [0x5A; KEY_LEN];

    fn region(sector: u32, sectors: u32) -> FlashRegion {
        FlashRegion::new(sector * SECTOR_SIZE as u32, sectors * SECTOR_SIZE as u32)
    }

    fn layout() -> KvsLayout<1> {
        let mut dedicated = heapless::Vec::new();
        dedicated
            .push(PartitionSpec {
                name: "wifi",
                region: region(3, 2),
                encrypted: false,
                read_only: false,
            })
            .unwrap();
        KvsLayout {
            shared: region(1, 2),
            dedicated,
            backup: region(5, 2),
        }
    }

    fn store() -> KeyValueStore<SimFlash, SmallRng, 1> {
        KeyValueStore::new(
            SimFlash::new(8),
            SmallRng::seed_from_u64(7),
            layout(),
            Some(KEY_MATERIAL),
        )
        .unwrap()
    }

    #[test]
    fn test_set_get_roundtrip() {
        let mut kvs = store();
        kvs.set(None, "boot-count", b"41", false).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(kvs.get(None, "boot-count", &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"41");
        assert_eq!(kvs.get_size(None, "boot-count").unwrap(), 2);
    }

    #[test]
    fn test_missing_key() {
        let mut kvs = store();
        let mut buf = [0u8; 8];
        assert_eq!(kvs.get(None, "nope", &mut buf), Err(KvsError::NotFound));
        assert_eq!(kvs.get_size(None, "nope"), Err(KvsError::NotFound));
        assert_eq!(kvs.delete(None, "nope"), Err(KvsError::NotFound));
    }

    #[test]
    fn test_overwrite_returns_newest() {
        let mut kvs = store();
        kvs.set(Some("cfg"), "mode", b"first", false).unwrap();
        kvs.set(Some("cfg"), "mode", b"second-longer", false).unwrap();
        let mut buf = [0u8; 32];
        let n = kvs.get(Some("cfg"), "mode", &mut buf).unwrap();
        assert_eq!(&buf[..n], b"second-longer");
    }

    #[test]
    fn test_delete() {
        let mut kvs = store();
        kvs.set(None, "tmp", b"x1", false).unwrap();
        kvs.delete(None, "tmp").unwrap();
        assert_eq!(kvs.get_size(None, "tmp"), Err(KvsError::NotFound));
        // Deleting twice reports the absence.
        assert_eq!(kvs.delete(None, "tmp"), Err(KvsError::NotFound));
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let mut kvs = store();
        kvs.set(Some("alpha"), "k", b"from-alpha", false).unwrap();
        kvs.set(Some("beta"), "k", b"from-beta", false).unwrap();
        kvs.set(None, "k", b"bare", false).unwrap();

        let mut buf = [0u8; 32];
        let n = kvs.get(Some("alpha"), "k", &mut buf).unwrap();
        assert_eq!(&buf[..n], b"from-alpha");
        let n = kvs.get(Some("beta"), "k", &mut buf).unwrap();
        assert_eq!(&buf[..n], b"from-beta");
        let n = kvs.get(None, "k", &mut buf).unwrap();
        assert_eq!(&buf[..n], b"bare");
    }

    #[test]
    fn test_dedicated_partition_routing() {
        let mut kvs = store();
        kvs.set(Some("wifi"), "ssid", b"cave-of-wonders", false).unwrap();
        kvs.set(Some("other"), "ssid", b"shared-copy", false).unwrap();

        // Wiping the dedicated namespace erases its partition without
        // touching shared entries.
        kvs.delete_namespace(Some("wifi")).unwrap();
        assert_eq!(kvs.get_size(Some("wifi"), "ssid"), Err(KvsError::NotFound));
        assert_eq!(kvs.get_size(Some("other"), "ssid").unwrap(), 11);

        // The partition comes back on the next write.
        kvs.set(Some("wifi"), "ssid", b"again", false).unwrap();
        assert_eq!(kvs.get_size(Some("wifi"), "ssid").unwrap(), 5);
    }

    #[test]
    fn test_delete_shared_namespace() {
        let mut kvs = store();
        kvs.set(Some("net"), "a", b"1", false).unwrap();
        kvs.set(Some("net"), "b", b"2", false).unwrap();
        kvs.set(Some("app"), "a", b"3", false).unwrap();
        kvs.set(None, "a", b"4", false).unwrap();

        kvs.delete_namespace(Some("net")).unwrap();
        assert_eq!(kvs.get_size(Some("net"), "a"), Err(KvsError::NotFound));
        assert_eq!(kvs.get_size(Some("net"), "b"), Err(KvsError::NotFound));
        assert_eq!(kvs.get_size(Some("app"), "a").unwrap(), 1);
        assert_eq!(kvs.get_size(None, "a").unwrap(), 1);

        kvs.delete_namespace(None).unwrap();
        assert_eq!(kvs.get_size(None, "a"), Err(KvsError::NotFound));
        assert_eq!(kvs.get_size(Some("app"), "a").unwrap(), 1);
    }

    #[test]
    fn test_encrypted_value_not_plaintext_on_flash() {
        let mut kvs = store();
        let secret = b"super-secret-password";
        kvs.set(Some("creds"), "pw", secret, true).unwrap();

        let mut buf = [0u8; 64];
        let n = kvs.get(Some("creds"), "pw", &mut buf).unwrap();
        assert_eq!(&buf[..n], secret);

        let image = kvs.into_flash();
        let hit = image
            .image()
            .windows(secret.len())
            .any(|w| w == &secret[..]);
        assert!(!hit, "plaintext secret leaked to flash");
    }

    #[test]
    fn test_partition_forces_encryption() {
        let mut dedicated = heapless::Vec::new();
        dedicated
            .push(PartitionSpec {
                name: "creds",
                region: region(3, 2),
                encrypted: true,
                read_only: false,
            })
            .unwrap();
        let layout = KvsLayout {
            shared: region(1, 2),
            dedicated,
            backup: region(5, 2),
        };
        let mut kvs: KeyValueStore<SimFlash, SmallRng, 1> = KeyValueStore::new(
            SimFlash::new(8),
            SmallRng::seed_from_u64(11),
            layout,
            Some(KEY_MATERIAL),
        )
        .unwrap();

        let secret = b"implicitly-encrypted";
        kvs.set(Some("creds"), "pw", secret, false).unwrap();
        let mut buf = [0u8; 64];
        let n = kvs.get(Some("creds"), "pw", &mut buf).unwrap();
        assert_eq!(&buf[..n], secret);

        let image = kvs.into_flash();
        assert!(!image.image().windows(secret.len()).any(|w| w == &secret[..]));
    }

    #[test]
    fn test_encrypt_without_key_material() {
        let mut kvs: KeyValueStore<SimFlash, SmallRng, 0> = KeyValueStore::new(
            SimFlash::new(8),
            SmallRng::seed_from_u64(3),
            KvsLayout {
                shared: region(1, 2),
                dedicated: heapless::Vec::new(),
                backup: region(5, 2),
            },
            None,
        )
        .unwrap();
        assert_eq!(
            kvs.set(None, "k", b"v", true),
            Err(KvsError::InvalidArgument)
        );
        kvs.set(None, "k", b"v", false).unwrap();
    }

    #[test]
    fn test_read_only_partition() {
        // Populate through a writable layout first.
        let mut kvs = store();
        kvs.set(Some("wifi"), "ssid", b"frozen", false).unwrap();
        let image = kvs.into_flash();

        let mut dedicated = heapless::Vec::new();
        dedicated
            .push(PartitionSpec {
                name: "wifi",
                region: region(3, 2),
                encrypted: false,
                read_only: true,
            })
            .unwrap();
        let layout = KvsLayout {
            shared: region(1, 2),
            dedicated,
            backup: region(5, 2),
        };
        let mut kvs: KeyValueStore<SimFlash, SmallRng, 1> =
            KeyValueStore::new(image, SmallRng::seed_from_u64(5), layout, None).unwrap();

        let mut buf = [0u8; 16];
        let n = kvs.get(Some("wifi"), "ssid", &mut buf).unwrap();
        assert_eq!(&buf[..n], b"frozen");
        assert_eq!(
            kvs.set(Some("wifi"), "ssid", b"thawed", false),
            Err(KvsError::ReadOnly)
        );
        assert_eq!(kvs.delete(Some("wifi"), "ssid"), Err(KvsError::ReadOnly));
        assert_eq!(
            kvs.delete_namespace(Some("wifi")),
            Err(KvsError::ReadOnly)
        );
        assert_eq!(kvs.cleanup(Some("wifi")), Err(KvsError::ReadOnly));
    }

    #[test]
    fn test_argument_limits() {
        let mut kvs = store();
        let long_key = core::str::from_utf8(&[b'k'; MAX_KEY_LEN + 1]).unwrap().to_string();
        let long_ns = core::str::from_utf8(&[b'n'; MAX_NAMESPACE_LEN + 1]).unwrap().to_string();
        let big = vec![0u8; MAX_VALUE_LEN + 1];

        assert_eq!(kvs.set(None, "", b"v", false), Err(KvsError::InvalidArgument));
        assert_eq!(
            kvs.set(None, &long_key, b"v", false),
            Err(KvsError::InvalidArgument)
        );
        assert_eq!(
            kvs.set(Some(&long_ns), "k", b"v", false),
            Err(KvsError::InvalidArgument)
        );
        assert_eq!(kvs.set(None, "k", b"", false), Err(KvsError::InvalidArgument));
        assert_eq!(
            kvs.set(None, "k", &big, false),
            Err(KvsError::InvalidArgument)
        );

        // At-limit values are fine.
        let max_key = core::str::from_utf8(&[b'k'; MAX_KEY_LEN]).unwrap().to_string();
        kvs.set(None, &max_key, &big[..MAX_VALUE_LEN], false).unwrap();
        assert_eq!(kvs.get_size(None, &max_key).unwrap(), MAX_VALUE_LEN);
    }

    #[test]
    fn test_small_buffer_rejected() {
        let mut kvs = store();
        kvs.set(None, "k", b"0123456789", false).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(kvs.get(None, "k", &mut buf), Err(KvsError::InvalidArgument));
    }

    #[test]
    fn test_compaction_reclaims_deleted_space() {
        let mut kvs = store();
        // Shared partition holds 2 sectors; overwriting the same key
        // far past that forces compaction along the way.
        let value = [0x33u8; 200];
        for i in 0..80u8 {
            let mut v = value;
            v[0] = i;
            kvs.set(None, "big", &v, false).unwrap();
        }
        let mut buf = [0u8; 200];
        kvs.get(None, "big", &mut buf).unwrap();
        assert_eq!(buf[0], 79);
        assert_eq!(&buf[1..], &value[1..]);
    }

    #[test]
    fn test_compaction_preserves_other_keys() {
        let mut kvs = store();
        kvs.set(None, "stable", b"keep-me", false).unwrap();
        kvs.set(Some("ns1"), "stable", b"keep-me-too", false).unwrap();
        let value = [0x44u8; 300];
        for _ in 0..40 {
            kvs.set(None, "churn", &value, false).unwrap();
        }
        let mut buf = [0u8; 300];
        let n = kvs.get(None, "stable", &mut buf).unwrap();
        assert_eq!(&buf[..n], b"keep-me");
        let n = kvs.get(Some("ns1"), "stable", &mut buf).unwrap();
        assert_eq!(&buf[..n], b"keep-me-too");
        kvs.get(None, "churn", &mut buf).unwrap();
        assert_eq!(&buf[..300], &value[..]);
    }

    #[test]
    fn test_encrypted_value_survives_compaction() {
        let mut kvs = store();
        let secret = b"re-encrypted-on-the-way";
        kvs.set(Some("creds"), "pw", secret, true).unwrap();
        let filler = [0x55u8; 400];
        for _ in 0..30 {
            kvs.set(None, "churn", &filler, false).unwrap();
        }
        let mut buf = [0u8; 64];
        let n = kvs.get(Some("creds"), "pw", &mut buf).unwrap();
        assert_eq!(&buf[..n], secret);

        let image = kvs.into_flash();
        assert!(!image.image().windows(secret.len()).any(|w| w == &secret[..]));
    }

    #[test]
    fn test_no_space_when_live_data_fills_partition() {
        let mut kvs = store();
        // Distinct keys, nothing to reclaim: the shared partition
        // (8192 bytes minus the header) eventually refuses.
        let value = [0u8; 500];
        let mut filled = 0;
        let mut result = Ok(());
        for i in 0..20u32 {
            let mut key_buf = heapless::String::<16>::new();
            core::fmt::Write::write_fmt(&mut key_buf, format_args!("key-{i}")).unwrap();
            result = kvs.set(None, &key_buf, &value, false);
            if result.is_err() {
                break;
            }
            filled += 1;
        }
        assert_eq!(result, Err(KvsError::NoSpace));
        assert!(filled >= 15);

        // Earlier keys are all still intact.
        assert_eq!(kvs.get_size(None, "key-0").unwrap(), 500);
    }

    #[test]
    fn test_cleanup_drops_retired_records() {
        let mut kvs = store();
        kvs.set(None, "keep", b"stay-put", false).unwrap();
        for i in 0..5u8 {
            let mut v = [0xC3u8; 120];
            v[0] = i;
            kvs.set(None, "churn", &v, false).unwrap();
        }
        kvs.delete(None, "churn").unwrap();
        kvs.cleanup(None).unwrap();

        let mut buf = [0u8; 16];
        let n = kvs.get(None, "keep", &mut buf).unwrap();
        assert_eq!(&buf[..n], b"stay-put");
        assert_eq!(kvs.get_size(None, "churn"), Err(KvsError::NotFound));

        // The retired records are physically gone from the partition.
        let image = kvs.into_flash();
        let shared = &image.image()[SECTOR_SIZE..3 * SECTOR_SIZE];
        let run = [0xC3u8; 119];
        assert!(!shared.windows(run.len()).any(|w| w == &run[..]));
    }

    #[test]
    fn test_for_each_key() {
        let mut kvs = store();
        kvs.set(Some("cfg"), "alpha", b"1", false).unwrap();
        kvs.set(Some("cfg"), "beta", b"2", false).unwrap();
        kvs.set(Some("cfg"), "alpha", b"3", false).unwrap();
        kvs.set(Some("zzz"), "gamma", b"4", false).unwrap();
        kvs.delete(Some("cfg"), "beta").unwrap();
        kvs.set(Some("cfg"), "delta", b"5", false).unwrap();

        let mut keys: Vec<String> = Vec::new();
        kvs.for_each_key(Some("cfg"), |k| keys.push(k.to_string()))
            .unwrap();
        assert_eq!(keys, vec!["alpha", "delta"]);
    }

    #[test]
    fn test_for_each_namespace() {
        let mut kvs = store();
        kvs.set(Some("net"), "a", b"1", false).unwrap();
        kvs.set(Some("net"), "b", b"2", false).unwrap();
        kvs.set(Some("app"), "a", b"3", false).unwrap();
        kvs.set(None, "bare", b"4", false).unwrap();

        let mut names: Vec<String> = Vec::new();
        kvs.for_each_namespace(|n| names.push(n.to_string())).unwrap();
        assert_eq!(names, vec!["wifi", "net", "app"]);
    }

    #[test]
    fn test_reopen_preserves_entries() {
        let mut kvs = store();
        kvs.set(None, "persist", b"across-reboot", false).unwrap();
        kvs.set(Some("wifi"), "ssid", b"still-here", true).unwrap();
        let image = kvs.into_flash();

        let mut kvs: KeyValueStore<SimFlash, SmallRng, 1> = KeyValueStore::new(
            image,
            SmallRng::seed_from_u64(99),
            layout(),
            Some(KEY_MATERIAL),
        )
        .unwrap();
        let mut buf = [0u8; 32];
        let n = kvs.get(None, "persist", &mut buf).unwrap();
        assert_eq!(&buf[..n], b"across-reboot");
        let n = kvs.get(Some("wifi"), "ssid", &mut buf).unwrap();
        assert_eq!(&buf[..n], b"still-here");

        // Appending after reopen does not clobber old entries.
        kvs.set(None, "more", b"new", false).unwrap();
        let n = kvs.get(None, "persist", &mut buf).unwrap();
        assert_eq!(&buf[..n], b"across-reboot");
    }

    #[test]
    fn test_corrupted_value_detected() {
        let mut kvs = store();
        kvs.set(None, "fragile", b"payload-bytes", false).unwrap();
        let mut flash = kvs.into_flash();

        // Clear a bit in the stored value: second value byte 'a' (0x61)
        // sits after the partition header, record meta and key bytes.
        let shared_base = SECTOR_SIZE;
        let mut image = flash.image().to_vec();
        let pos = shared_base + PARTITION_HEADER_SIZE + ENTRY_META_SIZE + "fragile".len() + 1;
        assert_eq!(image[pos], b'a');
        image[pos] &= !0x01;
        flash = SimFlash::from_image(image);

        let mut kvs: KeyValueStore<SimFlash, SmallRng, 1> = KeyValueStore::new(
            flash,
            SmallRng::seed_from_u64(1),
            layout(),
            Some(KEY_MATERIAL),
        )
        .unwrap();
        let mut buf = [0u8; 32];
        let r = kvs.get(None, "fragile", &mut buf);
        assert!(matches!(r, Err(KvsError::BadData) | Err(KvsError::NotFound)));
        // The damaged record was invalidated for good.
        assert_eq!(kvs.get_size(None, "fragile"), Err(KvsError::NotFound));
    }
}
