//! Paged B-tree key index over an indexed base dtable.
//!
//! The btree stores no values — only `(key, base_index)` pairs — so a point
//! lookup costs log base ~341 page reads instead of a binary search over
//! the whole key index. Values stay in the base table and are fetched by
//! index.
//!
//! # On-disk layout
//!
//! Fixed 4096-byte pages. Page 0 is the header; the rest are tree pages,
//! written bottom-up as they fill, with the root last:
//!
//! ```text
//! internal:  ptr | (key, index) | ptr | (key, index) | … | ptr
//! leaf:      (key, index) | (key, index) | …
//! ```
//!
//! Page numbers, keys, and indices are all 32-bit. Every page reserves its
//! final 4 bytes for the filled byte count, so partially-filled trailing
//! pages (the usual case) parse exactly like full ones; internal pages hold
//! up to 340 keys with 341 child pointers, leaves up to 511 keys. A page's
//! kind is known from its depth during descent, never stored.
//!
//! Only u32 keys are supported, and the base must provide stable indexed
//! access; `(key, index)` pairs are streamed from the base in key order
//! through an explicit stack of open pages, one per level.

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use memmap2::Mmap;
use tracing::debug;

use crate::{
    dtable::{AtxId, Dtable, DtableError, DtableIter, check_key_type},
    factory::{DtableFactory, TableContext, dtable_entry},
    params::Params,
    value::{Blob, BlobComparator, BlobMeta, CmpRef, Dtype, KeyType},
};

const BTREE_MAGIC: u32 = 0xB7EE_D7B1;
const BTREE_VERSION: u32 = 1;

const PAGE_SIZE: usize = 4096;
/// Bytes usable for entries; the final 4 hold the filled length.
const PAGE_USABLE: usize = PAGE_SIZE - 4;

const PAGENO_SIZE: usize = 4;
const KEY_SIZE: usize = 4;
const INDEX_SIZE: usize = 4;
const RECORD_SIZE: usize = KEY_SIZE + INDEX_SIZE;

/// Records per leaf page.
const LEAF_CAP: usize = PAGE_USABLE / RECORD_SIZE;
/// Records per internal page (each record also brings a child pointer, and
/// one extra pointer leads the page).
const INTERNAL_CAP: usize = (PAGE_USABLE - PAGENO_SIZE) / (PAGENO_SIZE + RECORD_SIZE);

const BASE_NAME: &str = "base";
const TREE_NAME: &str = "btree";

// ------------------------------------------------------------------------------------------------
// Header
// ------------------------------------------------------------------------------------------------

struct BtreeHeader {
    magic: u32,
    version: u32,
    page_size: u32,
    pageno_size: u32,
    key_size: u32,
    index_size: u32,
    key_type: u8,
    key_count: u32,
    depth: u32,
    root_page: u32,
    last_full: u32,
}

impl BtreeHeader {
    fn to_page(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PAGE_SIZE);
        bytes.extend_from_slice(&self.magic.to_le_bytes());
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&self.page_size.to_le_bytes());
        bytes.extend_from_slice(&self.pageno_size.to_le_bytes());
        bytes.extend_from_slice(&self.key_size.to_le_bytes());
        bytes.extend_from_slice(&self.index_size.to_le_bytes());
        bytes.push(self.key_type);
        bytes.extend_from_slice(&self.key_count.to_le_bytes());
        bytes.extend_from_slice(&self.depth.to_le_bytes());
        bytes.extend_from_slice(&self.root_page.to_le_bytes());
        bytes.extend_from_slice(&self.last_full.to_le_bytes());
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    fn from_page(page: &[u8]) -> Result<Self, DtableError> {
        let read_u32 = |offset: usize| -> u32 {
            u32::from_le_bytes(page[offset..offset + 4].try_into().unwrap_or([0; 4]))
        };
        let header = Self {
            magic: read_u32(0),
            version: read_u32(4),
            page_size: read_u32(8),
            pageno_size: read_u32(12),
            key_size: read_u32(16),
            index_size: read_u32(20),
            key_type: page[24],
            key_count: read_u32(25),
            depth: read_u32(29),
            root_page: read_u32(33),
            last_full: read_u32(37),
        };
        if header.magic != BTREE_MAGIC || header.version != BTREE_VERSION {
            return Err(DtableError::Corrupt("btree magic/version mismatch".into()));
        }
        if header.page_size as usize != PAGE_SIZE
            || header.pageno_size as usize != PAGENO_SIZE
            || header.key_size as usize != KEY_SIZE
            || header.index_size as usize != INDEX_SIZE
        {
            return Err(DtableError::Corrupt("btree geometry mismatch".into()));
        }
        Ok(header)
    }
}

// ------------------------------------------------------------------------------------------------
// Build
// ------------------------------------------------------------------------------------------------

struct PageBuf {
    data: Vec<u8>,
    records: usize,
    ptrs: usize,
    internal: bool,
}

impl PageBuf {
    fn new(internal: bool) -> Self {
        Self {
            data: Vec::with_capacity(PAGE_USABLE),
            records: 0,
            ptrs: 0,
            internal,
        }
    }

    fn cap(&self) -> usize {
        if self.internal { INTERNAL_CAP } else { LEAF_CAP }
    }

    fn is_empty(&self) -> bool {
        self.records == 0 && self.ptrs == 0
    }

    fn records_full(&self) -> bool {
        self.records >= self.cap()
    }

    /// A complete internal page carries one more pointer than records.
    fn complete(&self) -> bool {
        if self.internal {
            self.records_full() && self.ptrs == self.records + 1
        } else {
            self.records_full()
        }
    }

    fn append_ptr(&mut self, page: u32) {
        debug_assert!(self.internal && self.ptrs == self.records);
        self.data.extend_from_slice(&page.to_le_bytes());
        self.ptrs += 1;
    }

    fn append_record(&mut self, key: u32, index: u32) {
        debug_assert!(!self.internal || self.ptrs == self.records + 1);
        self.data.extend_from_slice(&key.to_le_bytes());
        self.data.extend_from_slice(&index.to_le_bytes());
        self.records += 1;
    }
}

struct TreeWriter {
    file: File,
    /// Next page number to assign (page 0 is the header).
    next_page: u32,
    last_full: u32,
    /// Open pages, leaf first.
    levels: Vec<PageBuf>,
}

impl TreeWriter {
    fn new(file: File) -> Self {
        Self {
            file,
            next_page: 1,
            last_full: 0,
            levels: vec![PageBuf::new(false)],
        }
    }

    /// Writes the level's buffer as the next page, returning its number.
    fn flush_page(&mut self, level: usize) -> Result<u32, DtableError> {
        let page = &mut self.levels[level];
        let filled = page.data.len() as u32;
        let was_full = page.complete();
        let mut bytes = std::mem::take(&mut page.data);
        bytes.resize(PAGE_SIZE, 0);
        bytes[PAGE_SIZE - 4..].copy_from_slice(&filled.to_le_bytes());
        page.records = 0;
        page.ptrs = 0;

        let number = self.next_page;
        self.next_page += 1;
        self.file.write_all(&bytes)?;
        if was_full {
            self.last_full = number;
        }
        Ok(number)
    }

    /// Flushes `level` and threads its pointer upward, cascading while
    /// parents complete. Returns the level now awaiting a separator
    /// record.
    fn flush_chain(&mut self, mut level: usize) -> Result<usize, DtableError> {
        loop {
            let number = self.flush_page(level)?;
            if level + 1 == self.levels.len() {
                self.levels.push(PageBuf::new(true));
            }
            let parent = &mut self.levels[level + 1];
            parent.append_ptr(number);
            if parent.complete() {
                level += 1;
                continue;
            }
            return Ok(level + 1);
        }
    }

    fn insert(&mut self, key: u32, index: u32) -> Result<(), DtableError> {
        // A full leaf promotes the next entry into the lowest ancestor
        // still missing its separator.
        if self.levels[0].records_full() {
            let target = self.flush_chain(0)?;
            self.levels[target].append_record(key, index);
            return Ok(());
        }
        self.levels[0].append_record(key, index);
        Ok(())
    }

    /// Flushes everything bottom-up; the last page written is the root.
    fn finish(&mut self) -> Result<u32, DtableError> {
        let top = self.levels.len() - 1;
        for level in 0..top {
            // A parent whose layout ends on a separator still needs its
            // final child pointer; an untouched parent does not.
            let parent = &self.levels[level + 1];
            let parent_waiting = !parent.is_empty() && parent.ptrs == parent.records;
            if self.levels[level].is_empty() && !parent_waiting {
                continue;
            }
            // An empty page still gets written when the parent's layout
            // ends on a separator and needs its final child pointer.
            let number = self.flush_page(level)?;
            self.levels[level + 1].append_ptr(number);
        }
        let root = self.flush_page(top)?;
        Ok(root)
    }
}

/// Streams the base's `(key, index)` pairs into a new btree file.
fn write_btree(path: &Path, base: &dyn Dtable) -> Result<(u32, u32, u32, u32), DtableError> {
    let key_count = base.entry_count()? as u32;
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)?;
    // Header placeholder; rewritten once the root position is known.
    file.write_all(&[0u8; PAGE_SIZE])?;

    let mut writer = TreeWriter::new(file);
    let mut iter = base.iterate()?;
    iter.first();
    while iter.valid() {
        let Some(key) = iter.key() else { break };
        let Dtype::U32(key) = key else {
            return Err(DtableError::InvalidArgument(
                "btree requires u32 keys".into(),
            ));
        };
        let index = iter.get_index()? as u32;
        writer.insert(key, index)?;
        iter.next();
    }
    let root = writer.finish()?;
    let depth = writer.levels.len() as u32;
    let last_full = writer.last_full;
    writer.file.sync_all()?;
    Ok((key_count, depth, root, last_full))
}

// ------------------------------------------------------------------------------------------------
// BtreeDtable
// ------------------------------------------------------------------------------------------------

/// Lookup-accelerating wrapper over an indexed base dtable.
pub struct BtreeDtable {
    base: Arc<dyn Dtable>,
    tree: Arc<TreeInner>,
}

struct TreeInner {
    map: Mmap,
    key_count: u32,
    depth: u32,
    root_page: u32,
    path: PathBuf,
}

impl TreeInner {
    fn page(&self, number: u32) -> &[u8] {
        let start = number as usize * PAGE_SIZE;
        &self.map[start..start + PAGE_SIZE]
    }

    /// Descends from the root, binary-searching each page.
    fn lookup(&self, key: u32) -> Option<u32> {
        if self.key_count == 0 {
            return None;
        }
        let mut page_no = self.root_page;
        let mut level = self.depth;
        loop {
            let page = self.page(page_no);
            let filled =
                u32::from_le_bytes(page[PAGE_SIZE - 4..].try_into().unwrap_or([0; 4])) as usize;
            if level > 1 {
                // Internal: ptr | record | ptr | record | … (| ptr).
                let records = filled / (PAGENO_SIZE + RECORD_SIZE);
                let read_record = |i: usize| -> (u32, u32) {
                    let offset = i * (PAGENO_SIZE + RECORD_SIZE) + PAGENO_SIZE;
                    (
                        u32::from_le_bytes(page[offset..offset + 4].try_into().unwrap_or([0; 4])),
                        u32::from_le_bytes(
                            page[offset + 4..offset + 8].try_into().unwrap_or([0; 4]),
                        ),
                    )
                };
                let mut low = 0usize;
                let mut high = records;
                while low < high {
                    let mid = low + (high - low) / 2;
                    let (probe, index) = read_record(mid);
                    if probe == key {
                        return Some(index);
                    }
                    if probe < key {
                        low = mid + 1;
                    } else {
                        high = mid;
                    }
                }
                // Descend left of record `low`.
                let ptr_offset = low * (PAGENO_SIZE + RECORD_SIZE);
                if ptr_offset + PAGENO_SIZE > filled {
                    return None;
                }
                page_no = u32::from_le_bytes(
                    page[ptr_offset..ptr_offset + 4].try_into().unwrap_or([0; 4]),
                );
                level -= 1;
            } else {
                // Leaf: record | record | …
                let records = filled / RECORD_SIZE;
                let read_record = |i: usize| -> (u32, u32) {
                    let offset = i * RECORD_SIZE;
                    (
                        u32::from_le_bytes(page[offset..offset + 4].try_into().unwrap_or([0; 4])),
                        u32::from_le_bytes(
                            page[offset + 4..offset + 8].try_into().unwrap_or([0; 4]),
                        ),
                    )
                };
                let mut low = 0usize;
                let mut high = records;
                while low < high {
                    let mid = low + (high - low) / 2;
                    let (probe, index) = read_record(mid);
                    if probe == key {
                        return Some(index);
                    }
                    if probe < key {
                        low = mid + 1;
                    } else {
                        high = mid;
                    }
                }
                return None;
            }
        }
    }
}

impl BtreeDtable {
    /// Creates the base table from `source`, then indexes it.
    pub fn create(
        ctx: &TableContext,
        path: &Path,
        config: &Params,
        source: &mut dyn DtableIter,
        shadow: Option<&dyn Dtable>,
        cmp: CmpRef,
    ) -> Result<(), DtableError> {
        if source.iter_key_type() != KeyType::U32 {
            return Err(DtableError::InvalidArgument(
                "btree requires u32 keys".into(),
            ));
        }
        let (base_factory, base_config) = dtable_entry(ctx, config, "base", "base_config")?;
        if !base_factory.indexed_access(ctx, &base_config) {
            return Err(DtableError::Unsupported(
                "btree base must support indexed access",
            ));
        }

        fs::create_dir(path)?;
        let result = (|| -> Result<(), DtableError> {
            base_factory.create(ctx, &path.join(BASE_NAME), &base_config, source, shadow, cmp)?;
            let base = base_factory.open(ctx, &path.join(BASE_NAME), &base_config)?;
            let tree_path = path.join(TREE_NAME);
            let (key_count, depth, root_page, last_full) =
                write_btree(&tree_path, base.as_ref())?;

            // Rewrite the header page now that the geometry is known.
            let header = BtreeHeader {
                magic: BTREE_MAGIC,
                version: BTREE_VERSION,
                page_size: PAGE_SIZE as u32,
                pageno_size: PAGENO_SIZE as u32,
                key_size: KEY_SIZE as u32,
                index_size: INDEX_SIZE as u32,
                key_type: KeyType::U32.wire_tag(),
                key_count,
                depth,
                root_page,
                last_full,
            };
            let mut file = OpenOptions::new().write(true).open(&tree_path)?;
            file.write_all(&header.to_page())?;
            file.sync_all()?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                debug!(path = %path.display(), "btree dtable written");
                Ok(())
            }
            Err(error) => {
                let _ = fs::remove_dir_all(path);
                Err(error)
            }
        }
    }

    /// Opens the base table and maps the btree file.
    pub fn open(ctx: &TableContext, path: &Path, config: &Params) -> Result<Self, DtableError> {
        let (base_factory, base_config) = dtable_entry(ctx, config, "base", "base_config")?;
        let base = base_factory.open(ctx, &path.join(BASE_NAME), &base_config)?;
        if base.key_type() != KeyType::U32 {
            return Err(DtableError::InvalidArgument(
                "btree requires u32 keys".into(),
            ));
        }
        let tree_path = path.join(TREE_NAME);
        let file = File::open(&tree_path)?;
        // Never modified after create.
        let map = unsafe { Mmap::map(&file)? };
        if map.len() < PAGE_SIZE {
            return Err(DtableError::Corrupt("btree file too short".into()));
        }
        let header = BtreeHeader::from_page(&map[..PAGE_SIZE])?;
        if header.root_page == 0 && header.key_count > 0 {
            return Err(DtableError::Corrupt("btree lost its root page".into()));
        }
        if map.len() < (header.root_page as usize + 1) * PAGE_SIZE {
            return Err(DtableError::Corrupt("btree truncated before root".into()));
        }
        Ok(Self {
            base,
            tree: Arc::new(TreeInner {
                map,
                key_count: header.key_count,
                depth: header.depth,
                root_page: header.root_page,
                path: tree_path,
            }),
        })
    }
}

impl Dtable for BtreeDtable {
    fn key_type(&self) -> KeyType {
        KeyType::U32
    }

    fn lookup_atx(&self, key: &Dtype, _atx: Option<AtxId>) -> Result<Option<Blob>, DtableError> {
        check_key_type(self, key)?;
        let Dtype::U32(key) = key else {
            return Err(DtableError::InvalidArgument("non-u32 key".into()));
        };
        match self.tree.lookup(*key) {
            Some(index) => Ok(Some(self.base.index_value(index as usize)?)),
            None => Ok(None),
        }
    }

    fn iterate_atx(&self, _atx: Option<AtxId>) -> Result<Box<dyn DtableIter>, DtableError> {
        Ok(Box::new(BtreeIter {
            base: self.base.iterate()?,
            tree: Arc::clone(&self.tree),
        }))
    }

    fn entry_count(&self) -> Result<usize, DtableError> {
        self.base.entry_count()
    }

    fn index_value(&self, index: usize) -> Result<Blob, DtableError> {
        self.base.index_value(index)
    }

    fn contains_index(&self, index: usize) -> Result<bool, DtableError> {
        self.base.contains_index(index)
    }

    fn set_blob_cmp(&self, cmp: Arc<dyn BlobComparator>) -> Result<(), DtableError> {
        self.base.set_blob_cmp(cmp)
    }
}

impl std::fmt::Debug for BtreeDtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtreeDtable")
            .field("path", &self.tree.path)
            .field("key_count", &self.tree.key_count)
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Iterator
// ------------------------------------------------------------------------------------------------

/// Delegates ordered traversal to the base; seeks go through the btree.
struct BtreeIter {
    base: Box<dyn DtableIter>,
    tree: Arc<TreeInner>,
}

impl DtableIter for BtreeIter {
    fn valid(&self) -> bool {
        self.base.valid()
    }

    fn next(&mut self) -> bool {
        self.base.next()
    }

    fn prev(&mut self) -> bool {
        self.base.prev()
    }

    fn first(&mut self) -> bool {
        self.base.first()
    }

    fn last(&mut self) -> bool {
        self.base.last()
    }

    fn seek(&mut self, key: &Dtype) -> bool {
        let Dtype::U32(target) = key else {
            return false;
        };
        match self.tree.lookup(*target) {
            Some(index) => self.base.seek_index(index as usize).unwrap_or(false),
            // Not present: fall back to the base's positioning seek so the
            // cursor parks at the next greater key.
            None => self.base.seek(key),
        }
    }

    fn seek_index(&mut self, index: usize) -> Result<bool, DtableError> {
        self.base.seek_index(index)
    }

    fn get_index(&self) -> Result<usize, DtableError> {
        self.base.get_index()
    }

    fn key(&self) -> Option<Dtype> {
        self.base.key()
    }

    fn meta(&self) -> Option<BlobMeta> {
        self.base.meta()
    }

    fn value(&self) -> Option<Blob> {
        self.base.value()
    }

    fn iter_key_type(&self) -> KeyType {
        KeyType::U32
    }
}

// ------------------------------------------------------------------------------------------------
// Factory
// ------------------------------------------------------------------------------------------------

/// Factory for the `btree_dtable` class. Config: `base`/`base_config`; the
/// base must support indexed access and u32 keys.
pub struct BtreeDtableFactory;

impl DtableFactory for BtreeDtableFactory {
    fn class_name(&self) -> &'static str {
        "btree_dtable"
    }

    fn indexed_access(&self, _ctx: &TableContext, _config: &Params) -> bool {
        true
    }

    fn create(
        &self,
        ctx: &TableContext,
        path: &Path,
        config: &Params,
        source: &mut dyn DtableIter,
        shadow: Option<&dyn Dtable>,
        cmp: CmpRef,
    ) -> Result<(), DtableError> {
        BtreeDtable::create(ctx, path, config, source, shadow, cmp)
    }

    fn open(
        &self,
        ctx: &TableContext,
        path: &Path,
        config: &Params,
    ) -> Result<Arc<dyn Dtable>, DtableError> {
        Ok(Arc::new(BtreeDtable::open(ctx, path, config)?))
    }
}
