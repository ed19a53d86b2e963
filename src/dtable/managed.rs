//! Managed dtable: journal write-front + immutable layer stack + overlay.
//!
//! The managed table is the full lifecycle in one place. Writes land in a
//! [`JournalDtable`]; *digest* folds the journal into a new immutable file;
//! *combine* merges a contiguous range of immutable files (optionally
//! including the journal) into one. Reads go through an overlay of
//! `[journal, disk_{n-1}, …, disk_0]`, highest layer winning.
//!
//! # Metadata
//!
//! A small versioned file (`md_meta`) in the table's directory records the
//! key type, the journal's listener id, maintenance intervals and
//! timestamps, and the ordered list of `(ddt_number, is_fastbase)` layer
//! descriptors naming the `md_data.<n>` files. It is rewritten atomically
//! (temp + rename) after the new layer file is durable, and the replaced
//! layer files are unlinked only after that commit point; a crash leaves
//! either the old stack or the new one. A CRC32 trailer guards the
//! metadata bytes.
//!
//! # Digest and combine
//!
//! Combine over `[first..=last]` builds a source overlay of the selected
//! layers (the journal rides on top when the range reaches it) and a
//! *shadow* overlay of the layers older than the range. The shadow decides
//! tombstone retention: a tombstone is written only if some older layer
//! still has the key; when the range covers the bottom layer there is no
//! shadow and tombstones fold away entirely. When the journal is included,
//! it restarts under a fresh globally-unique id and its old entries are
//! discarded from the system journal.
//!
//! # Maintenance
//!
//! [`Dtable::maintain`] consults `digest_interval` and `combine_interval`:
//! each timestamp advances by its nominal interval, snapping forward to now
//! when more than two intervals behind (no runaway catch-up), and rolling
//! back if the operation fails so the next call retries.
//!
//! # Required comparator
//!
//! If the journal or any layer was built under a named blob comparator,
//! every read returns `Busy` until a comparator with the matching name is
//! attached; attachment also completes the journal's deferred replay.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::{SystemTime, UNIX_EPOCH},
};

use crc32fast::Hasher as Crc32;
use tracing::{debug, info, warn};

use crate::{
    dtable::{
        AtxId, Dtable, DtableError, DtableIter, check_key_type, iter::SkipIter,
        journal::JournalDtable, overlay::OverlayDtable,
    },
    encoding::{self, Decode, Encode},
    factory::{DtableFactory, TableContext, dtable_entry},
    params::Params,
    value::{Blob, BlobComparator, CmpRef, Dtype, KeyType},
};

const MDT_MAGIC: u32 = 0x4D44_5442;
const MDT_VERSION: u32 = 1;

const META_NAME: &str = "md_meta";

fn data_name(number: u32) -> String {
    format!("md_data.{number}")
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ------------------------------------------------------------------------------------------------
// Metadata
// ------------------------------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct ManagedHeader {
    magic: u32,
    version: u32,
    key_type: u8,
    combine_count: u8,
    journal_id: u32,
    ddt_next: u32,
    digest_interval: u32,
    combine_interval: u32,
    digested: u64,
    combined: u64,
    /// (ddt_number, is_fastbase), oldest layer first.
    entries: Vec<DiskDescriptor>,
}

#[derive(Clone, Copy, Debug)]
struct DiskDescriptor {
    number: u32,
    is_fastbase: bool,
}

impl Encode for DiskDescriptor {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), crate::encoding::EncodingError> {
        self.number.encode_to(buf)?;
        u8::from(self.is_fastbase).encode_to(buf)?;
        Ok(())
    }
}

impl Decode for DiskDescriptor {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), crate::encoding::EncodingError> {
        let mut offset = 0;
        let (number, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (fastbase, n) = u8::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                number,
                is_fastbase: fastbase != 0,
            },
            offset,
        ))
    }
}

impl Encode for ManagedHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), crate::encoding::EncodingError> {
        self.magic.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.key_type.encode_to(buf)?;
        self.combine_count.encode_to(buf)?;
        self.journal_id.encode_to(buf)?;
        self.ddt_next.encode_to(buf)?;
        self.digest_interval.encode_to(buf)?;
        self.combine_interval.encode_to(buf)?;
        self.digested.encode_to(buf)?;
        self.combined.encode_to(buf)?;
        encoding::encode_vec(&self.entries, buf)?;
        Ok(())
    }
}

impl Decode for ManagedHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), crate::encoding::EncodingError> {
        let mut offset = 0;
        let (magic, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (version, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (key_type, n) = u8::decode_from(&buf[offset..])?;
        offset += n;
        let (combine_count, n) = u8::decode_from(&buf[offset..])?;
        offset += n;
        let (journal_id, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (ddt_next, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (digest_interval, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (combine_interval, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (digested, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (combined, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (entries, n) = encoding::decode_vec::<DiskDescriptor>(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                magic,
                version,
                key_type,
                combine_count,
                journal_id,
                ddt_next,
                digest_interval,
                combine_interval,
                digested,
                combined,
                entries,
            },
            offset,
        ))
    }
}

fn write_meta(dir: &Path, header: &ManagedHeader) -> Result<(), DtableError> {
    let bytes = encoding::encode_to_vec(header)?;
    let mut hasher = Crc32::new();
    hasher.update(&bytes);
    let crc = hasher.finalize();

    let path = dir.join(META_NAME);
    let tmp = dir.join(format!("{META_NAME}.tmp"));
    let mut file_bytes = bytes;
    file_bytes.extend_from_slice(&crc.to_le_bytes());
    let mut file = fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&tmp)?;
    use std::io::Write as _;
    file.write_all(&file_bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

fn read_meta(dir: &Path) -> Result<ManagedHeader, DtableError> {
    let bytes = fs::read(dir.join(META_NAME))?;
    if bytes.len() < 4 {
        return Err(DtableError::Corrupt("metadata too short".into()));
    }
    let (payload, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored = u32::from_le_bytes(crc_bytes.try_into().unwrap_or([0; 4]));
    let mut hasher = Crc32::new();
    hasher.update(payload);
    if hasher.finalize() != stored {
        return Err(DtableError::Corrupt("metadata checksum mismatch".into()));
    }
    let (header, _) = ManagedHeader::decode_from(payload)?;
    if header.magic != MDT_MAGIC || header.version != MDT_VERSION {
        return Err(DtableError::Corrupt("metadata magic/version mismatch".into()));
    }
    Ok(header)
}

// ------------------------------------------------------------------------------------------------
// ManagedDtable
// ------------------------------------------------------------------------------------------------

struct DiskEntry {
    table: Arc<dyn Dtable>,
    number: u32,
    is_fastbase: bool,
}

struct ManagedState {
    header: ManagedHeader,
    /// Oldest layer first (`disks[0]` is the bottom of the stack).
    disks: Vec<DiskEntry>,
    journal: Arc<JournalDtable>,
    cmp: CmpRef,
}

/// The journaled, digesting, combining dtable.
pub struct ManagedDtable {
    dir: PathBuf,
    key_type: KeyType,
    ctx: TableContext,
    base: Arc<dyn DtableFactory>,
    base_config: Params,
    fastbase: Arc<dyn DtableFactory>,
    fastbase_config: Params,
    digest_size: usize,
    digest_on_close: bool,
    close_digest_fastbase: bool,
    state: Mutex<ManagedState>,
}

impl ManagedDtable {
    /// Creates the on-disk shell of a new managed table: its directory and
    /// metadata file, with no layers and a fresh journal id.
    pub fn create(
        ctx: &TableContext,
        dir: &Path,
        config: &Params,
        key_type: KeyType,
    ) -> Result<(), DtableError> {
        let combine_count = config.int("combine_count", 5)?;
        if !(2..=255).contains(&combine_count) {
            return Err(DtableError::InvalidArgument(
                "combine_count must be in 2..=255".into(),
            ));
        }
        let digest_interval = config.int("digest_interval", 300)?;
        let combine_interval = config.int("combine_interval", 1200)?;
        if digest_interval < 1 || combine_interval < 1 {
            return Err(DtableError::InvalidArgument(
                "maintenance intervals must be positive".into(),
            ));
        }

        fs::create_dir(dir)?;
        let journal_id = ctx.ids.next_id()?;
        let now = now_secs();
        let header = ManagedHeader {
            magic: MDT_MAGIC,
            version: MDT_VERSION,
            key_type: key_type.wire_tag(),
            combine_count: combine_count as u8,
            journal_id,
            ddt_next: 0,
            digest_interval: digest_interval as u32,
            combine_interval: combine_interval as u32,
            digested: now,
            combined: now,
            entries: Vec::new(),
        };
        if let Err(error) = write_meta(dir, &header) {
            let _ = fs::remove_dir_all(dir);
            return Err(error);
        }
        info!(dir = %dir.display(), key_type = key_type.name(), journal_id, "managed dtable created");
        Ok(())
    }

    /// Opens an existing managed table.
    pub fn open(ctx: &TableContext, dir: &Path, config: &Params) -> Result<Arc<Self>, DtableError> {
        let (base, base_config) = dtable_entry(ctx, config, "base", "base_config")?;
        let (fastbase, fastbase_config) = if config.class("fastbase")?.is_some() {
            let fast_config_key = if config.has("fastbase_config") {
                "fastbase_config"
            } else {
                "base_config"
            };
            dtable_entry(ctx, config, "fastbase", fast_config_key)?
        } else {
            (Arc::clone(&base), base_config.clone())
        };

        let digest_size = config.int("digest_size", 0)?;
        let digest_on_close = config.bool("digest_on_close", false)?;
        let close_digest_fastbase = config.bool("close_digest_fastbase", true)?;

        let header = read_meta(dir)?;
        let key_type = KeyType::from_wire_tag(header.key_type)?;

        let mut disks = Vec::with_capacity(header.entries.len());
        for descriptor in &header.entries {
            let path = dir.join(data_name(descriptor.number));
            let table = if descriptor.is_fastbase {
                fastbase.open(ctx, &path, &fastbase_config)?
            } else {
                base.open(ctx, &path, &base_config)?
            };
            if table.key_type() != key_type {
                return Err(DtableError::Corrupt(format!(
                    "layer {} key type disagrees with metadata",
                    descriptor.number
                )));
            }
            disks.push(DiskEntry {
                table,
                number: descriptor.number,
                is_fastbase: descriptor.is_fastbase,
            });
        }

        let journal = JournalDtable::new(key_type, header.journal_id, Arc::clone(&ctx.journal));
        journal.register()?;
        ctx.journal.get_entries(header.journal_id)?;

        let table = Arc::new(Self {
            dir: dir.to_path_buf(),
            key_type,
            ctx: ctx.clone(),
            base,
            base_config,
            fastbase,
            fastbase_config,
            digest_size: digest_size.max(0) as usize,
            digest_on_close,
            close_digest_fastbase,
            state: Mutex::new(ManagedState {
                header,
                disks,
                journal,
                cmp: None,
            }),
        });
        debug!(dir = %dir.display(), layers = table.lock()?.disks.len(), "managed dtable opened");
        Ok(table)
    }

    fn lock(&self) -> Result<MutexGuard<'_, ManagedState>, DtableError> {
        self.state
            .lock()
            .map_err(|_| DtableError::Internal("managed dtable lock poisoned".into()))
    }

    /// The required comparator name, from the journal or the oldest layer.
    fn required_cmp_name(state: &ManagedState) -> Option<String> {
        if let Ok(Some(name)) = state.journal.required_cmp_name() {
            return Some(name);
        }
        state.disks.iter().find_map(|disk| disk.table.cmp_name())
    }

    fn cmp_gate(state: &ManagedState) -> Result<(), DtableError> {
        if state.cmp.is_none() && Self::required_cmp_name(state).is_some() {
            return Err(DtableError::Busy("required comparator not attached"));
        }
        Ok(())
    }

    /// Overlay layers, highest first: journal, then disks newest → oldest.
    fn overlay_layers(state: &ManagedState) -> Vec<Arc<dyn Dtable>> {
        let mut layers: Vec<Arc<dyn Dtable>> = Vec::with_capacity(state.disks.len() + 1);
        let journal: Arc<dyn Dtable> = state.journal.clone();
        layers.push(journal);
        for disk in state.disks.iter().rev() {
            layers.push(Arc::clone(&disk.table));
        }
        layers
    }

    fn make_overlay(state: &ManagedState) -> Result<OverlayDtable, DtableError> {
        let overlay = OverlayDtable::new(Self::overlay_layers(state))?;
        if let Some(cmp) = &state.cmp {
            overlay.set_blob_cmp(Arc::clone(cmp))?;
        }
        Ok(overlay)
    }

    /// Folds the journal into a new immutable layer. A no-op on an empty
    /// journal.
    pub fn digest(&self, use_fastbase: bool) -> Result<(), DtableError> {
        let state = self.lock()?;
        if state.journal.is_empty()? {
            return Ok(());
        }
        let disk_count = state.disks.len();
        drop(state);
        self.combine_range(disk_count, disk_count, use_fastbase)
    }

    /// Combines the newest `count` stack units (the journal counts as one)
    /// into a single layer.
    pub fn combine_last(&self, count: usize) -> Result<(), DtableError> {
        let disk_count = self.lock()?.disks.len();
        let units = disk_count + 1;
        let count = count.max(1).min(units);
        let first = units - count;
        self.combine_range(first, disk_count, first > 0)
    }

    /// Combines layers `[first..=last]` of the stack into one new layer.
    /// `last == disks.len()` includes the journal. With `use_fastbase`, the
    /// result is written by the fastbase implementation and kept at the
    /// absorbing end.
    pub fn combine_range(
        &self,
        first: usize,
        last: usize,
        use_fastbase: bool,
    ) -> Result<(), DtableError> {
        let mut state = self.lock()?;
        Self::cmp_gate(&state)?;
        if last < first || last > state.disks.len() {
            return Err(DtableError::InvalidArgument(
                "combine range out of bounds".into(),
            ));
        }

        let reset_journal = last == state.disks.len();
        // Inclusive disk range being folded; empty when only the journal is
        // digested.
        let disk_last = if reset_journal { last.checked_sub(1) } else { Some(last) };

        // Shadow: everything older than the range, newest first.
        let shadow = if first > 0 {
            let mut layers: Vec<Arc<dyn Dtable>> = Vec::with_capacity(first);
            for disk in state.disks[..first].iter().rev() {
                layers.push(Arc::clone(&disk.table));
            }
            let overlay = OverlayDtable::new(layers)?;
            if let Some(cmp) = &state.cmp {
                overlay.set_blob_cmp(Arc::clone(cmp))?;
            }
            Some(overlay)
        } else {
            None
        };

        // Source: the selected range, journal on top, newest first.
        let source = {
            let mut layers: Vec<Arc<dyn Dtable>> = Vec::new();
            if reset_journal {
                let journal: Arc<dyn Dtable> = state.journal.clone();
                layers.push(journal);
            }
            if let Some(disk_last) = disk_last {
                for disk in state.disks[first..=disk_last].iter().rev() {
                    layers.push(Arc::clone(&disk.table));
                }
            }
            if layers.is_empty() {
                return Ok(());
            }
            let overlay = OverlayDtable::new(layers)?;
            if let Some(cmp) = &state.cmp {
                overlay.set_blob_cmp(Arc::clone(cmp))?;
            }
            overlay
        };

        let number = state.header.ddt_next;
        let path = self.dir.join(data_name(number));
        // A previous failed combine may have left debris under this name.
        if path.exists() {
            let _ = fs::remove_file(&path);
            let _ = fs::remove_dir_all(&path);
        }

        let (factory, config) = if use_fastbase {
            (&self.fastbase, &self.fastbase_config)
        } else {
            (&self.base, &self.base_config)
        };
        {
            let mut source_iter = source.iterate()?;
            let shadow_ref: Option<&dyn Dtable> = shadow.as_ref().map(|s| s as &dyn Dtable);
            factory.create(
                &self.ctx,
                &path,
                config,
                source_iter.as_mut(),
                shadow_ref,
                state.cmp.clone(),
            )?;
        }

        let result = match factory.open(&self.ctx, &path, config) {
            Ok(table) => table,
            Err(error) => {
                let _ = fs::remove_file(&path);
                let _ = fs::remove_dir_all(&path);
                return Err(error);
            }
        };
        if let Some(cmp) = &state.cmp {
            result.set_blob_cmp(Arc::clone(cmp))?;
        }

        // Build the new stack and commit the metadata.
        let mut new_header = state.header.clone();
        let old_journal_id = new_header.journal_id;
        if reset_journal {
            new_header.journal_id = self.ctx.ids.next_id()?;
        }
        new_header.ddt_next += 1;
        new_header.entries = Vec::new();
        for disk in &state.disks[..first] {
            new_header.entries.push(DiskDescriptor {
                number: disk.number,
                is_fastbase: disk.is_fastbase,
            });
        }
        new_header.entries.push(DiskDescriptor {
            number,
            is_fastbase: use_fastbase,
        });
        let keep_from = disk_last.map_or(first, |l| l + 1);
        for disk in &state.disks[keep_from..] {
            new_header.entries.push(DiskDescriptor {
                number: disk.number,
                is_fastbase: disk.is_fastbase,
            });
        }

        if let Err(error) = write_meta(&self.dir, &new_header) {
            let _ = fs::remove_file(&path);
            let _ = fs::remove_dir_all(&path);
            return Err(error);
        }

        // Swap in-memory state to match the committed metadata.
        let mut new_disks: Vec<DiskEntry> = Vec::new();
        let mut old_disks = std::mem::take(&mut state.disks);
        let tail = old_disks.split_off(keep_from.min(old_disks.len()));
        let mut folded = old_disks.split_off(first.min(old_disks.len()));
        new_disks.append(&mut old_disks);
        new_disks.push(DiskEntry {
            table: result,
            number,
            is_fastbase: use_fastbase,
        });
        new_disks.extend(tail);
        state.disks = new_disks;
        state.header = new_header;

        // The folded files are no longer referenced by the metadata.
        for disk in folded.drain(..) {
            let path = self.dir.join(data_name(disk.number));
            drop(disk.table);
            let _ = fs::remove_file(&path);
            let _ = fs::remove_dir_all(&path);
        }

        if reset_journal {
            let new_id = state.header.journal_id;
            state.journal.reinit(new_id)?;
            if let Some(cmp) = &state.cmp {
                state.journal.set_blob_cmp(Arc::clone(cmp))?;
            }
            debug!(old_journal_id, new_id, "journal folded into layer");
        }

        info!(
            dir = %self.dir.display(),
            layer = number,
            layers = state.disks.len(),
            use_fastbase,
            "combine complete"
        );
        Ok(())
    }

    /// Current number of immutable layers.
    pub fn disk_count(&self) -> Result<usize, DtableError> {
        Ok(self.lock()?.disks.len())
    }

    /// Entries currently buffered in the journal write-front.
    pub fn journal_len(&self) -> Result<usize, DtableError> {
        let state = self.lock()?;
        let len = state.journal.len()?;
        Ok(len)
    }
}

impl Dtable for ManagedDtable {
    fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn cmp_name(&self) -> Option<String> {
        self.lock().ok().and_then(|state| Self::required_cmp_name(&state))
    }

    fn set_blob_cmp(&self, cmp: Arc<dyn BlobComparator>) -> Result<(), DtableError> {
        if self.key_type != KeyType::Blob {
            return Err(DtableError::Unsupported("comparators require blob keys"));
        }
        let mut state = self.lock()?;
        if let Some(required) = Self::required_cmp_name(&state) {
            if required != cmp.name() {
                return Err(DtableError::InvalidArgument(format!(
                    "comparator {} does not match required {required}",
                    cmp.name()
                )));
            }
        }
        // The journal runs its deferred replay here.
        state.journal.set_blob_cmp(Arc::clone(&cmp))?;
        for disk in &state.disks {
            disk.table.set_blob_cmp(Arc::clone(&cmp))?;
        }
        state.cmp = Some(cmp);
        Ok(())
    }

    fn lookup_atx(&self, key: &Dtype, atx: Option<AtxId>) -> Result<Option<Blob>, DtableError> {
        check_key_type(self, key)?;
        let state = self.lock()?;
        Self::cmp_gate(&state)?;
        if let Some(blob) = state.journal.lookup_atx(key, atx)? {
            return Ok(Some(blob));
        }
        for disk in state.disks.iter().rev() {
            if let Some(blob) = disk.table.lookup_atx(key, None)? {
                return Ok(Some(blob));
            }
        }
        Ok(None)
    }

    fn iterate_atx(&self, atx: Option<AtxId>) -> Result<Box<dyn DtableIter>, DtableError> {
        let state = self.lock()?;
        Self::cmp_gate(&state)?;
        let overlay = Self::make_overlay(&state)?;
        let merged = overlay.iterate_atx(atx)?;
        Ok(Box::new(SkipIter::skip_nonexistent(merged)))
    }

    fn writable(&self) -> bool {
        true
    }

    fn insert_atx(
        &self,
        key: &Dtype,
        value: Blob,
        append_hint: bool,
        atx: Option<AtxId>,
    ) -> Result<(), DtableError> {
        check_key_type(self, key)?;
        // An over-full journal digests inline before accepting more.
        if atx.is_none() && self.digest_size > 0 {
            let needs_digest = {
                let state = self.lock()?;
                state.journal.len()? >= self.digest_size
            };
            if needs_digest {
                self.digest(true)?;
            }
        }
        let state = self.lock()?;
        Self::cmp_gate(&state)?;
        state.journal.insert_atx(key, value, append_hint, atx)
    }

    fn maintain(&self, force: bool) -> Result<(), DtableError> {
        let now = now_secs();
        let (mut do_digest, mut do_combine) = (force, force);
        let combine_count;
        {
            let mut state = self.lock()?;
            combine_count = state.header.combine_count as usize;
            if u64::from(state.header.digest_interval) + state.header.digested <= now {
                state.header.digested += u64::from(state.header.digest_interval);
                // Far behind: no point replaying missed cycles.
                if state.header.digested + u64::from(state.header.digest_interval) <= now {
                    state.header.digested = now;
                }
                do_digest = true;
            }
            if u64::from(state.header.combine_interval) + state.header.combined <= now {
                state.header.combined += u64::from(state.header.combine_interval);
                if state.header.combined + u64::from(state.header.combine_interval) <= now {
                    state.header.combined = now;
                }
                do_combine = true;
            }
            if do_digest || do_combine {
                write_meta(&self.dir, &state.header)?;
            }
        }

        if do_digest {
            if let Err(error) = self.digest(true) {
                let mut state = self.lock()?;
                state.header.digested = state.header.digested.saturating_sub(u64::from(
                    state.header.digest_interval,
                ));
                let _ = write_meta(&self.dir, &state.header);
                warn!(%error, "digest failed during maintenance");
                return Err(error);
            }
        }
        if do_combine {
            if let Err(error) = self.combine_last(combine_count) {
                let mut state = self.lock()?;
                state.header.combined = state.header.combined.saturating_sub(u64::from(
                    state.header.combine_interval,
                ));
                let _ = write_meta(&self.dir, &state.header);
                warn!(%error, "combine failed during maintenance");
                return Err(error);
            }
        }
        Ok(())
    }

    fn create_tx(&self) -> Result<AtxId, DtableError> {
        let state = self.lock()?;
        Self::cmp_gate(&state)?;
        state.journal.create_tx()
    }

    fn check_tx(&self, atx: AtxId) -> Result<(), DtableError> {
        self.lock()?.journal.check_tx(atx)
    }

    fn commit_tx(&self, atx: AtxId) -> Result<(), DtableError> {
        self.lock()?.journal.commit_tx(atx)
    }

    fn abort_tx(&self, atx: AtxId) -> Result<(), DtableError> {
        self.lock()?.journal.abort_tx(atx)
    }
}

impl Drop for ManagedDtable {
    fn drop(&mut self) {
        if self.digest_on_close {
            if let Err(error) = self.digest(self.close_digest_fastbase) {
                warn!(dir = %self.dir.display(), %error, "digest on close failed");
            }
        }
    }
}

impl std::fmt::Debug for ManagedDtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedDtable")
            .field("dir", &self.dir)
            .field("key_type", &self.key_type)
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Factory
// ------------------------------------------------------------------------------------------------

/// Factory for the `managed_dtable` class.
///
/// Config: `base` class + `base_config` (the digest target), optional
/// `fastbase` + `fastbase_config` (the absorbing-end implementation),
/// `combine_count`, `digest_interval`, `combine_interval`, `digest_size`,
/// `digest_on_close`, `close_digest_fastbase`.
pub struct ManagedDtableFactory;

impl DtableFactory for ManagedDtableFactory {
    fn class_name(&self) -> &'static str {
        "managed_dtable"
    }

    fn create_empty(
        &self,
        ctx: &TableContext,
        path: &Path,
        config: &Params,
        key_type: KeyType,
    ) -> Result<(), DtableError> {
        ManagedDtable::create(ctx, path, config, key_type)
    }

    fn open(
        &self,
        ctx: &TableContext,
        path: &Path,
        config: &Params,
    ) -> Result<Arc<dyn Dtable>, DtableError> {
        let table = ManagedDtable::open(ctx, path, config)?;
        Ok(table)
    }
}
