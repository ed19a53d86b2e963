//! System journal: a process-wide, append-only log shared across tables.
//!
//! The journal stores entries on behalf of multiple *listeners*, each
//! identified by a [`ListenerId`]. A journal-backed table appends its
//! mutations here instead of owning a log file; on reopen the entries are
//! replayed to the listener to rebuild its in-memory state. When a listener's
//! entries are no longer needed (its table has been digested into an
//! immutable file), a *discard marker* cancels them, and a later
//! [`SysJournal::filter`] rewrite drops them physically.
//!
//! # On-disk layout
//!
//! Two files, all integers little-endian:
//!
//! ```text
//! meta:            [magic u32 = 0xBAFE9BDA][version u32 = 1][sequence u32][size u64]
//! data (<meta>.<sequence>):
//!                  [magic u32 = 0x874C74FD][version u32 = 0]
//!                  {listener_id u32, length u64, bytes}*
//! ```
//!
//! A record with `length == u64::MAX` is a discard marker for its listener
//! and carries no bytes.
//!
//! # Durability
//!
//! Appends extend the data file and the in-memory size only;
//! [`SysJournal::commit`] syncs the data file and rewrites the meta file with
//! the new size. The `size` field in the meta file is therefore the commit
//! point: replay never reads past it, so a crash between append and commit
//! simply forgets the uncommitted suffix.
//!
//! [`SysJournal::filter`] writes a complete new data file under
//! `sequence + 1`, commits new meta pointing at it, then unlinks the old data
//! file — in that order, so a crash leaves the journal wholly at the
//! pre-filter or post-filter state.
//!
//! # Listeners
//!
//! Listeners register under their id before replay; [`SysJournal::playback`]
//! passes each committed entry to [`JournalListener::journal_replay`] in
//! append order. Entries addressed to unregistered listeners are tolerated
//! (and reported if `fail_missing` is set); discard markers remove a
//! listener's earlier entries from consideration.
//!
//! The module also hosts [`UniqueIdFile`], the file-backed monotonic
//! allocator that issues listener ids (and managed-table journal ids).

#[cfg(test)]
mod tests;

use std::{
    collections::{HashMap, HashSet},
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Mutex, Weak},
};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

const SYSJ_META_MAGIC: u32 = 0xBAFE_9BDA;
const SYSJ_META_VERSION: u32 = 1;

const SYSJ_DATA_MAGIC: u32 = 0x874C_74FD;
const SYSJ_DATA_VERSION: u32 = 0;

/// Size of the data-file header (magic + version).
const DATA_HEADER_SIZE: u64 = 8;

/// Size of a record header (listener id + length).
const RECORD_HEADER_SIZE: u64 = 12;

/// `length` value marking a discard record.
const DISCARD_LENGTH: u64 = u64::MAX;

/// Per-record payload ceiling during replay; larger lengths are corruption.
const MAX_ENTRY_LEN: u64 = 64 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by system-journal operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JournalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A file failed magic/version/structure validation.
    #[error("corrupt journal: {0}")]
    Corrupt(String),

    /// An entry was appended for an unknown or discarded listener.
    #[error("invalid listener {0}")]
    InvalidListener(ListenerId),

    /// A listener id was registered twice.
    #[error("listener {0} already registered")]
    ListenerExists(ListenerId),

    /// Replay found entries for unregistered listeners and `fail_missing`
    /// was set.
    #[error("entries for {0} unregistered listener(s)")]
    MissingListeners(usize),

    /// The unique-id allocator is exhausted or unavailable.
    #[error("unique id allocation failed")]
    NoId,

    /// A listener's replay hook failed.
    #[error("replay failed: {0}")]
    Replay(String),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Listener identity
// ------------------------------------------------------------------------------------------------

/// Identity under which a table's entries are stored in the journal.
pub type ListenerId = u32;

/// Receiver of replayed journal entries.
///
/// Implementations rebuild in-memory state from entries in append order.
/// Replay happens with interior mutability (`&self`): listeners are shared
/// objects living behind their own locks.
pub trait JournalListener: Send + Sync {
    /// Replays a single journal entry.
    fn journal_replay(&self, entry: &[u8]) -> Result<(), JournalError>;
}

// ------------------------------------------------------------------------------------------------
// Meta header
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct MetaHeader {
    magic: u32,
    version: u32,
    sequence: u32,
    size: u64,
}

impl Encode for MetaHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.magic.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.sequence.encode_to(buf)?;
        self.size.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for MetaHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (magic, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (version, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (sequence, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (size, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                magic,
                version,
                sequence,
                size,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// SysJournal
// ------------------------------------------------------------------------------------------------

/// The shared append-only journal.
///
/// One instance serves every journal-backed table under an environment
/// directory. All operations are internally synchronized; the journal can be
/// shared freely behind an `Arc`.
pub struct SysJournal {
    inner: Mutex<JournalInner>,
    listeners: Mutex<HashMap<ListenerId, Weak<dyn JournalListener>>>,
    meta_path: PathBuf,
}

struct JournalInner {
    data: File,
    data_path: PathBuf,
    sequence: u32,
    /// Committed size (what the meta file says).
    size: u64,
    /// Appended-but-uncommitted size (≥ `size`).
    appended: u64,
    dirty: bool,
    discarded: HashSet<ListenerId>,
    /// Live (non-discarded) entry count per listener, over the committed
    /// prefix plus uncommitted appends.
    live: HashMap<ListenerId, usize>,
}

impl SysJournal {
    /// Opens (or creates) the journal rooted at `meta_path`.
    ///
    /// The data file lives beside the meta file as `<meta>.<sequence>`. When
    /// `filter_on_empty` is set and the committed journal holds only
    /// discarded entries, an immediate [`SysJournal::filter`] shrinks it.
    pub fn open<P: AsRef<Path>>(
        meta_path: P,
        create: bool,
        filter_on_empty: bool,
    ) -> Result<Self, JournalError> {
        let meta_path = meta_path.as_ref().to_path_buf();
        let journal = if meta_path.exists() {
            Self::open_existing(meta_path)?
        } else if create {
            Self::create_new(meta_path)?
        } else {
            return Err(JournalError::Io(io::Error::from(io::ErrorKind::NotFound)));
        };

        if filter_on_empty {
            let empty = {
                let inner = journal.lock_inner()?;
                inner.size > DATA_HEADER_SIZE && inner.live.values().all(|&count| count == 0)
            };
            if empty {
                debug!("journal holds only discarded entries, filtering");
                journal.filter()?;
            }
        }
        Ok(journal)
    }

    fn create_new(meta_path: PathBuf) -> Result<Self, JournalError> {
        let data_path = data_file_path(&meta_path, 0);
        let mut data = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&data_path)?;
        let mut header = Vec::new();
        SYSJ_DATA_MAGIC
            .encode_to(&mut header)
            .and_then(|()| SYSJ_DATA_VERSION.encode_to(&mut header))?;
        data.write_all(&header)?;
        data.sync_all()?;

        write_meta(
            &meta_path,
            &MetaHeader {
                magic: SYSJ_META_MAGIC,
                version: SYSJ_META_VERSION,
                sequence: 0,
                size: DATA_HEADER_SIZE,
            },
        )?;

        info!(path = %meta_path.display(), "system journal created");

        Ok(Self {
            inner: Mutex::new(JournalInner {
                data,
                data_path,
                sequence: 0,
                size: DATA_HEADER_SIZE,
                appended: DATA_HEADER_SIZE,
                dirty: false,
                discarded: HashSet::new(),
                live: HashMap::new(),
            }),
            listeners: Mutex::new(HashMap::new()),
            meta_path,
        })
    }

    fn open_existing(meta_path: PathBuf) -> Result<Self, JournalError> {
        let meta = read_meta(&meta_path)?;
        if meta.magic != SYSJ_META_MAGIC || meta.version != SYSJ_META_VERSION {
            return Err(JournalError::Corrupt(format!(
                "meta magic/version mismatch in {}",
                meta_path.display()
            )));
        }

        let data_path = data_file_path(&meta_path, meta.sequence);
        let mut data = OpenOptions::new().read(true).write(true).open(&data_path)?;

        let mut header_bytes = [0u8; DATA_HEADER_SIZE as usize];
        data.read_exact(&mut header_bytes)?;
        let (magic, n) = u32::decode_from(&header_bytes)?;
        let (version, _) = u32::decode_from(&header_bytes[n..])?;
        if magic != SYSJ_DATA_MAGIC || version != SYSJ_DATA_VERSION {
            return Err(JournalError::Corrupt(format!(
                "data magic/version mismatch in {}",
                data_path.display()
            )));
        }

        // A crash after appending but before commit leaves bytes past the
        // committed size; they are dead and get dropped at the next commit
        // or filter.
        let on_disk = data.metadata()?.len();
        if on_disk < meta.size {
            return Err(JournalError::Corrupt(format!(
                "data file shorter ({on_disk}) than committed size ({})",
                meta.size
            )));
        }

        let (discarded, live) = scan_records(&mut data, meta.size)?;

        info!(
            path = %meta_path.display(),
            sequence = meta.sequence,
            size = meta.size,
            listeners = live.len(),
            "system journal opened"
        );

        Ok(Self {
            inner: Mutex::new(JournalInner {
                data,
                data_path,
                sequence: meta.sequence,
                size: meta.size,
                appended: meta.size,
                dirty: false,
                discarded,
                live,
            }),
            listeners: Mutex::new(HashMap::new()),
            meta_path,
        })
    }

    fn lock_inner(&self) -> Result<std::sync::MutexGuard<'_, JournalInner>, JournalError> {
        self.inner
            .lock()
            .map_err(|_| JournalError::Internal("journal mutex poisoned".into()))
    }

    /// Appends an entry on behalf of `listener`.
    ///
    /// The entry becomes durable at the next [`SysJournal::commit`].
    /// Appending for a discarded listener id is a caller bug and fails.
    pub fn append(&self, listener: ListenerId, entry: &[u8]) -> Result<(), JournalError> {
        if entry.len() as u64 == DISCARD_LENGTH {
            return Err(JournalError::Internal("entry length reserved".into()));
        }
        let mut inner = self.lock_inner()?;
        if inner.discarded.contains(&listener) {
            return Err(JournalError::InvalidListener(listener));
        }

        let offset = inner.appended;
        inner.data.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE as usize + entry.len());
        listener.encode_to(&mut buf)?;
        (entry.len() as u64).encode_to(&mut buf)?;
        buf.extend_from_slice(entry);
        inner.data.write_all(&buf)?;
        inner.appended += buf.len() as u64;
        inner.dirty = true;
        *inner.live.entry(listener).or_insert(0) += 1;

        trace!(listener, len = entry.len(), "journal entry appended");
        Ok(())
    }

    /// Appends a discard marker: `listener`'s earlier entries are no longer
    /// needed and will be dropped by replay and by the next filter.
    pub fn discard(&self, listener: ListenerId) -> Result<(), JournalError> {
        let mut inner = self.lock_inner()?;
        if inner.discarded.contains(&listener) {
            return Ok(());
        }
        let offset = inner.appended;
        inner.data.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE as usize);
        listener.encode_to(&mut buf)?;
        DISCARD_LENGTH.encode_to(&mut buf)?;
        inner.data.write_all(&buf)?;
        inner.appended += buf.len() as u64;
        inner.dirty = true;
        inner.discarded.insert(listener);
        inner.live.insert(listener, 0);

        debug!(listener, "journal listener discarded");
        Ok(())
    }

    /// Makes all appended entries durable: syncs the data file, then commits
    /// the new size into the meta file.
    pub fn commit(&self) -> Result<(), JournalError> {
        let mut inner = self.lock_inner()?;
        if !inner.dirty {
            return Ok(());
        }
        inner.data.sync_all()?;
        write_meta(
            &self.meta_path,
            &MetaHeader {
                magic: SYSJ_META_MAGIC,
                version: SYSJ_META_VERSION,
                sequence: inner.sequence,
                size: inner.appended,
            },
        )?;
        inner.size = inner.appended;
        inner.dirty = false;
        trace!(size = inner.size, "journal committed");
        Ok(())
    }

    /// Registers a listener under its id. Must happen before any replay that
    /// should reach it. Fails if the id is taken.
    pub fn register_listener(
        &self,
        id: ListenerId,
        listener: Weak<dyn JournalListener>,
    ) -> Result<(), JournalError> {
        let mut map = self
            .listeners
            .lock()
            .map_err(|_| JournalError::Internal("listener map poisoned".into()))?;
        // A dead weak entry may linger after its table was dropped.
        if let Some(existing) = map.get(&id) {
            if existing.strong_count() > 0 {
                return Err(JournalError::ListenerExists(id));
            }
        }
        map.insert(id, listener);
        Ok(())
    }

    /// Removes a listener registration.
    pub fn unregister_listener(&self, id: ListenerId) {
        if let Ok(mut map) = self.listeners.lock() {
            map.remove(&id);
        }
    }

    /// Replays committed entries for one registered listener, in order.
    pub fn get_entries(&self, id: ListenerId) -> Result<(), JournalError> {
        self.playback(Some(id), false)
    }

    /// Replays committed entries.
    ///
    /// With `target` set, only that listener's entries are replayed (it must
    /// be registered). With `target == None`, every committed entry is
    /// dispatched through the listener registry; entries for unregistered
    /// listeners are skipped unless `fail_missing` is set.
    pub fn playback(
        &self,
        target: Option<ListenerId>,
        fail_missing: bool,
    ) -> Result<(), JournalError> {
        let records = {
            let mut inner = self.lock_inner()?;
            let committed = inner.size;
            read_records(&mut inner.data, committed)?
        };

        let map = self
            .listeners
            .lock()
            .map_err(|_| JournalError::Internal("listener map poisoned".into()))?;

        let mut missing: HashSet<ListenerId> = HashSet::new();
        for record in &records {
            match record {
                Record::Discard { listener } => {
                    if target.is_none() {
                        missing.remove(listener);
                    }
                }
                Record::Entry { listener, bytes } => {
                    if let Some(want) = target {
                        if *listener != want {
                            continue;
                        }
                    }
                    let Some(weak) = map.get(listener) else {
                        if target.is_none() {
                            missing.insert(*listener);
                            continue;
                        }
                        return Err(JournalError::InvalidListener(*listener));
                    };
                    let Some(strong) = weak.upgrade() else {
                        if target.is_none() {
                            missing.insert(*listener);
                            continue;
                        }
                        return Err(JournalError::InvalidListener(*listener));
                    };
                    strong.journal_replay(bytes)?;
                }
            }
        }

        if fail_missing && !missing.is_empty() {
            warn!(count = missing.len(), "journal entries for missing listeners");
            return Err(JournalError::MissingListeners(missing.len()));
        }
        Ok(())
    }

    /// Rewrites the journal without entries for discarded listeners.
    ///
    /// Writes data file `<sequence + 1>`, commits new meta pointing at it,
    /// then unlinks the old data file; a crash anywhere leaves a consistent
    /// journal.
    pub fn filter(&self) -> Result<(), JournalError> {
        self.commit()?;
        let mut inner = self.lock_inner()?;

        let new_sequence = inner.sequence.wrapping_add(1);
        let new_path = data_file_path(&self.meta_path, new_sequence);

        let committed = inner.size;
        let records = read_records(&mut inner.data, committed)?;

        let mut new_data = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&new_path)?;
        let mut buf = Vec::new();
        SYSJ_DATA_MAGIC.encode_to(&mut buf)?;
        SYSJ_DATA_VERSION.encode_to(&mut buf)?;
        for record in &records {
            if let Record::Entry { listener, bytes } = record {
                if inner.discarded.contains(listener) {
                    continue;
                }
                listener.encode_to(&mut buf)?;
                (bytes.len() as u64).encode_to(&mut buf)?;
                buf.extend_from_slice(bytes);
            }
        }
        let new_size = buf.len() as u64;
        new_data.write_all(&buf)?;
        new_data.sync_all()?;

        write_meta(
            &self.meta_path,
            &MetaHeader {
                magic: SYSJ_META_MAGIC,
                version: SYSJ_META_VERSION,
                sequence: new_sequence,
                size: new_size,
            },
        )?;

        let old_path = std::mem::replace(&mut inner.data_path, new_path);
        inner.data = new_data;
        inner.sequence = new_sequence;
        inner.size = new_size;
        inner.appended = new_size;
        inner.dirty = false;
        inner.discarded.clear();
        inner.live.retain(|_, count| *count > 0);

        if let Err(error) = fs::remove_file(&old_path) {
            // The new state is already committed; a stale data file is
            // harmless and unreferenced.
            warn!(path = %old_path.display(), %error, "failed to unlink old journal data");
        }

        info!(sequence = new_sequence, size = new_size, "journal filtered");
        Ok(())
    }

    /// Current sequence number (bumped by each filter).
    pub fn sequence(&self) -> Result<u32, JournalError> {
        Ok(self.lock_inner()?.sequence)
    }

    /// Committed data size in bytes, including the data header.
    pub fn committed_size(&self) -> Result<u64, JournalError> {
        Ok(self.lock_inner()?.size)
    }

    /// Count of live (non-discarded) committed-or-appended entries for a
    /// listener.
    pub fn live_entries(&self, listener: ListenerId) -> Result<usize, JournalError> {
        Ok(self
            .lock_inner()?
            .live
            .get(&listener)
            .copied()
            .unwrap_or(0))
    }
}

impl Drop for SysJournal {
    fn drop(&mut self) {
        if let Err(error) = self.commit() {
            warn!(%error, "journal commit failed on drop");
        }
    }
}

impl std::fmt::Debug for SysJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysJournal")
            .field("meta_path", &self.meta_path)
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Record scanning
// ------------------------------------------------------------------------------------------------

enum Record {
    Entry { listener: ListenerId, bytes: Vec<u8> },
    Discard { listener: ListenerId },
}

/// Reads every record in the committed prefix `[DATA_HEADER_SIZE, committed)`.
fn read_records(data: &mut File, committed: u64) -> Result<Vec<Record>, JournalError> {
    let mut records = Vec::new();
    let mut offset = DATA_HEADER_SIZE;
    data.seek(SeekFrom::Start(offset))?;
    while offset < committed {
        let mut header = [0u8; RECORD_HEADER_SIZE as usize];
        data.read_exact(&mut header)?;
        let (listener, n) = u32::decode_from(&header)?;
        let (length, _) = u64::decode_from(&header[n..])?;
        offset += RECORD_HEADER_SIZE;

        if length == DISCARD_LENGTH {
            records.push(Record::Discard { listener });
            continue;
        }
        if length > MAX_ENTRY_LEN || offset + length > committed {
            return Err(JournalError::Corrupt(format!(
                "entry at offset {} runs past committed size",
                offset - RECORD_HEADER_SIZE
            )));
        }
        let mut bytes = vec![0u8; length as usize];
        data.read_exact(&mut bytes)?;
        offset += length;
        records.push(Record::Entry { listener, bytes });
    }
    Ok(records)
}

/// Scans the committed prefix, returning the discarded-listener set and the
/// live entry counts.
fn scan_records(
    data: &mut File,
    committed: u64,
) -> Result<(HashSet<ListenerId>, HashMap<ListenerId, usize>), JournalError> {
    let mut discarded = HashSet::new();
    let mut live: HashMap<ListenerId, usize> = HashMap::new();
    for record in read_records(data, committed)? {
        match record {
            Record::Entry { listener, .. } => {
                *live.entry(listener).or_insert(0) += 1;
            }
            Record::Discard { listener } => {
                discarded.insert(listener);
                live.insert(listener, 0);
            }
        }
    }
    Ok((discarded, live))
}

// ------------------------------------------------------------------------------------------------
// Meta file I/O
// ------------------------------------------------------------------------------------------------

fn read_meta(path: &Path) -> Result<MetaHeader, JournalError> {
    let bytes = fs::read(path)?;
    let (meta, _) = MetaHeader::decode_from(&bytes)?;
    Ok(meta)
}

/// Rewrites the meta file atomically (temp + rename + dir-entry durability
/// via sync on the temp file).
fn write_meta(path: &Path, meta: &MetaHeader) -> Result<(), JournalError> {
    let tmp = path.with_extension("tmp");
    let bytes = encoding::encode_to_vec(meta)?;
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&tmp)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn data_file_path(meta_path: &Path, sequence: u32) -> PathBuf {
    let mut name = meta_path.as_os_str().to_os_string();
    name.push(format!(".{sequence}"));
    PathBuf::from(name)
}

// ------------------------------------------------------------------------------------------------
// Unique id allocator
// ------------------------------------------------------------------------------------------------

/// File-backed monotonic allocator for listener and journal ids.
///
/// The next unissued id is persisted *before* an id is handed out, so a
/// crash can waste ids but never reissue one.
pub struct UniqueIdFile {
    state: Mutex<IdState>,
    path: PathBuf,
}

struct IdState {
    file: File,
    next: u32,
}

impl UniqueIdFile {
    /// Opens (or creates) the allocator file.
    pub fn open<P: AsRef<Path>>(path: P, create: bool) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
            let mut bytes = [0u8; 4];
            file.read_exact(&mut bytes)?;
            let next = u32::from_le_bytes(bytes);
            Ok(Self {
                state: Mutex::new(IdState { file, next }),
                path,
            })
        } else if create {
            let mut file = OpenOptions::new()
                .create(true)
                .truncate(true)
                .read(true)
                .write(true)
                .open(&path)?;
            file.write_all(&0u32.to_le_bytes())?;
            file.sync_all()?;
            Ok(Self {
                state: Mutex::new(IdState { file, next: 0 }),
                path,
            })
        } else {
            Err(JournalError::Io(io::Error::from(io::ErrorKind::NotFound)))
        }
    }

    /// Issues the next id, persisting the successor first.
    pub fn next_id(&self) -> Result<u32, JournalError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| JournalError::Internal("id file mutex poisoned".into()))?;
        let id = state.next;
        let successor = id.checked_add(1).ok_or(JournalError::NoId)?;
        state.file.seek(SeekFrom::Start(0))?;
        state.file.write_all(&successor.to_le_bytes())?;
        state.file.sync_all()?;
        state.next = successor;
        trace!(id, "unique id issued");
        Ok(id)
    }
}

impl std::fmt::Debug for UniqueIdFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniqueIdFile")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
