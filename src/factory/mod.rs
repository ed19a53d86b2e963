//! Class-name registries for table construction.
//!
//! Every table implementation registers a factory under a stable class name
//! (`simple_dtable`, `managed_dtable`, `keydiv_dtable`, …). Configuration
//! trees refer to these names (`"base" class(dt) simple_dtable`), and every
//! wrapper resolves its sub-factories through the same registry, so a whole
//! table stack is described by one declarative tree.
//!
//! The registry is an explicit context object rather than process-global
//! state: [`Registry::standard`] builds one with all built-in classes, the
//! environment owns it, and tests construct and drop their own. It is
//! append-only at runtime; registering a taken name fails.

#[cfg(test)]
mod tests;

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    sync::{Arc, RwLock},
};

use crate::{
    ctable::{Ctable, CtableError, column::ColumnCtableFactory, simple::SimpleCtableFactory},
    dtable::{
        Dtable, DtableError, DtableIter, array::ArrayDtableFactory, btree::BtreeDtableFactory,
        deltaint::DeltaintDtableFactory, exception::ExceptionDtableFactory,
        exist::ExistDtableFactory, fixed::FixedDtableFactory, keydiv::KeydivDtableFactory,
        managed::ManagedDtableFactory,
        memory::MemoryDtableFactory, rwatx::RwatxDtableFactory, simple::SimpleDtableFactory,
        smallint::SmallintDtableFactory,
    },
    journal::{SysJournal, UniqueIdFile},
    params::Params,
    value::{CmpRef, KeyType},
};

// ------------------------------------------------------------------------------------------------
// Construction context
// ------------------------------------------------------------------------------------------------

/// Everything a factory needs besides its own configuration: the registry
/// for sub-factories, the shared system journal, and the unique-id
/// allocator.
#[derive(Clone)]
pub struct TableContext {
    /// Registry used to resolve sub-factories.
    pub registry: Registry,
    /// The environment's shared system journal.
    pub journal: Arc<SysJournal>,
    /// The environment's id allocator.
    pub ids: Arc<UniqueIdFile>,
}

// ------------------------------------------------------------------------------------------------
// Factory traits
// ------------------------------------------------------------------------------------------------

/// Constructor/opener for one dtable class.
pub trait DtableFactory: Send + Sync {
    /// The class name configuration trees use.
    fn class_name(&self) -> &'static str;

    /// Whether tables opened under `config` support stable indexed access.
    fn indexed_access(&self, ctx: &TableContext, config: &Params) -> bool {
        let (_, _) = (ctx, config);
        false
    }

    /// Writes a new table at `path` from a source iterator (read-only
    /// classes). `shadow` carries the older layers a tombstone must still
    /// hide; `cmp` is the active comparator whose name gets persisted.
    fn create(
        &self,
        ctx: &TableContext,
        path: &Path,
        config: &Params,
        source: &mut dyn DtableIter,
        shadow: Option<&dyn Dtable>,
        cmp: CmpRef,
    ) -> Result<(), DtableError> {
        let (_, _, _, _, _, _) = (ctx, path, config, source, shadow, cmp);
        Err(DtableError::Unsupported("class cannot create from a source"))
    }

    /// Creates a new empty writable table at `path` (writable classes).
    fn create_empty(
        &self,
        ctx: &TableContext,
        path: &Path,
        config: &Params,
        key_type: KeyType,
    ) -> Result<(), DtableError> {
        let (_, _, _, _) = (ctx, path, config, key_type);
        Err(DtableError::Unsupported("class cannot create empty tables"))
    }

    /// Opens an existing table at `path`.
    fn open(
        &self,
        ctx: &TableContext,
        path: &Path,
        config: &Params,
    ) -> Result<Arc<dyn Dtable>, DtableError>;
}

/// Constructor/opener for one ctable class.
pub trait CtableFactory: Send + Sync {
    /// The class name configuration trees use.
    fn class_name(&self) -> &'static str;

    /// Creates a new empty column table at `path`.
    fn create(
        &self,
        ctx: &TableContext,
        path: &Path,
        config: &Params,
        key_type: KeyType,
    ) -> Result<(), DtableError>;

    /// Opens an existing column table at `path`.
    fn open(
        &self,
        ctx: &TableContext,
        path: &Path,
        config: &Params,
    ) -> Result<Arc<dyn Ctable>, CtableError>;
}

// ------------------------------------------------------------------------------------------------
// Registry
// ------------------------------------------------------------------------------------------------

/// Append-only class-name registry, cheaply cloneable.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    dtables: RwLock<BTreeMap<&'static str, Arc<dyn DtableFactory>>>,
    ctables: RwLock<BTreeMap<&'static str, Arc<dyn CtableFactory>>>,
    indexes: RwLock<BTreeSet<&'static str>>,
}

impl Registry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                dtables: RwLock::new(BTreeMap::new()),
                ctables: RwLock::new(BTreeMap::new()),
                indexes: RwLock::new(BTreeSet::new()),
            }),
        }
    }

    /// A registry with every built-in class registered.
    pub fn standard() -> Self {
        let registry = Self::empty();
        let dtables: Vec<Arc<dyn DtableFactory>> = vec![
            Arc::new(SimpleDtableFactory),
            Arc::new(FixedDtableFactory),
            Arc::new(ArrayDtableFactory),
            Arc::new(MemoryDtableFactory),
            Arc::new(ManagedDtableFactory),
            Arc::new(SmallintDtableFactory),
            Arc::new(DeltaintDtableFactory),
            Arc::new(ExceptionDtableFactory),
            Arc::new(ExistDtableFactory),
            Arc::new(KeydivDtableFactory),
            Arc::new(BtreeDtableFactory),
            Arc::new(RwatxDtableFactory),
        ];
        for factory in dtables {
            // Names are distinct by construction.
            let _ = registry.register_dtable(factory);
        }
        let _ = registry.register_ctable(Arc::new(SimpleCtableFactory));
        let _ = registry.register_ctable(Arc::new(ColumnCtableFactory));
        registry
    }

    /// Registers a dtable factory; the name must be free.
    pub fn register_dtable(&self, factory: Arc<dyn DtableFactory>) -> Result<(), DtableError> {
        let mut map = self
            .inner
            .dtables
            .write()
            .map_err(|_| DtableError::Internal("registry lock poisoned".into()))?;
        let name = factory.class_name();
        if map.contains_key(name) {
            return Err(DtableError::Exists(name.to_string()));
        }
        map.insert(name, factory);
        Ok(())
    }

    /// Registers a ctable factory; the name must be free.
    pub fn register_ctable(&self, factory: Arc<dyn CtableFactory>) -> Result<(), DtableError> {
        let mut map = self
            .inner
            .ctables
            .write()
            .map_err(|_| DtableError::Internal("registry lock poisoned".into()))?;
        let name = factory.class_name();
        if map.contains_key(name) {
            return Err(DtableError::Exists(name.to_string()));
        }
        map.insert(name, factory);
        Ok(())
    }

    /// Looks up a dtable class by name.
    pub fn lookup_dtable(&self, name: &str) -> Option<Arc<dyn DtableFactory>> {
        self.inner.dtables.read().ok()?.get(name).cloned()
    }

    /// Looks up a ctable class by name.
    pub fn lookup_ctable(&self, name: &str) -> Option<Arc<dyn CtableFactory>> {
        self.inner.ctables.read().ok()?.get(name).cloned()
    }

    /// Whether an index class is registered under `name`.
    pub fn has_index(&self, name: &str) -> bool {
        self.inner
            .indexes
            .read()
            .map(|set| set.contains(name))
            .unwrap_or(false)
    }

    /// Registered dtable class names.
    pub fn dtable_names(&self) -> Vec<&'static str> {
        self.inner
            .dtables
            .read()
            .map(|map| map.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Registered ctable class names.
    pub fn ctable_names(&self) -> Vec<&'static str> {
        self.inner
            .ctables
            .read()
            .map(|map| map.keys().copied().collect())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("dtables", &self.dtable_names())
            .field("ctables", &self.ctable_names())
            .finish()
    }
}

// ------------------------------------------------------------------------------------------------
// Config helpers
// ------------------------------------------------------------------------------------------------

/// Resolves the factory named by `config[class_key]` together with its
/// `config[config_key]` subtree.
pub fn dtable_entry(
    ctx: &TableContext,
    config: &Params,
    class_key: &str,
    config_key: &str,
) -> Result<(Arc<dyn DtableFactory>, Params), DtableError> {
    let name = config
        .class(class_key)?
        .ok_or_else(|| DtableError::NoEntry(format!("missing {class_key:?} class")))?;
    let factory = ctx
        .registry
        .lookup_dtable(name)
        .ok_or_else(|| DtableError::NoEntry(format!("unknown dtable class {name:?}")))?;
    let sub_config = config.config(config_key)?;
    Ok((factory, sub_config))
}
