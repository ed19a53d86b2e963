//! The host environment: one directory, one system journal, one registry.
//!
//! An [`Env`] owns everything tables share: the directory that hosts them,
//! the process-wide [`SysJournal`] (with its unique-id file alongside), and
//! the factory [`Registry`]. Each managed table lives in its own
//! sub-directory. Environments are explicit objects — tests open one per
//! temp directory and drop it when done; nothing global survives.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::info;

use crate::{
    ctable::{Ctable, CtableError},
    dtable::{Dtable, DtableError, managed::ManagedDtable},
    factory::{Registry, TableContext},
    journal::{SysJournal, UniqueIdFile},
    params::Params,
    value::KeyType,
};

const JOURNAL_NAME: &str = "sys_journal";
const ID_FILE_NAME: &str = "unique_id";

/// An open storage environment.
pub struct Env {
    dir: PathBuf,
    ctx: TableContext,
}

impl Env {
    /// Opens (creating on first use) the environment rooted at `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, DtableError> {
        Self::open_with_registry(dir, Registry::standard())
    }

    /// Opens the environment with a caller-supplied registry (extra classes
    /// registered, or a restricted set for tests).
    pub fn open_with_registry<P: AsRef<Path>>(
        dir: P,
        registry: Registry,
    ) -> Result<Self, DtableError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let journal = Arc::new(SysJournal::open(dir.join(JOURNAL_NAME), true, true)?);
        let ids = Arc::new(UniqueIdFile::open(dir.join(ID_FILE_NAME), true)?);
        info!(dir = %dir.display(), "environment opened");
        Ok(Self {
            dir,
            ctx: TableContext {
                registry,
                journal,
                ids,
            },
        })
    }

    /// The environment's root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The factory registry.
    pub fn registry(&self) -> &Registry {
        &self.ctx.registry
    }

    /// The shared system journal.
    pub fn journal(&self) -> &Arc<SysJournal> {
        &self.ctx.journal
    }

    /// The construction context handed to factories.
    pub fn ctx(&self) -> &TableContext {
        &self.ctx
    }

    fn table_path(&self, name: &str) -> Result<PathBuf, DtableError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(DtableError::InvalidArgument(format!(
                "bad table name {name:?}"
            )));
        }
        Ok(self.dir.join(name))
    }

    /// Creates a dtable of the class named by `config["class"]` under
    /// `name`.
    pub fn create_dtable(
        &self,
        name: &str,
        config: &Params,
        key_type: KeyType,
    ) -> Result<(), DtableError> {
        let class = config
            .class("class")?
            .ok_or_else(|| DtableError::NoEntry("missing \"class\" entry".into()))?;
        let factory = self
            .ctx
            .registry
            .lookup_dtable(class)
            .ok_or_else(|| DtableError::NoEntry(format!("unknown dtable class {class:?}")))?;
        let path = self.table_path(name)?;
        factory.create_empty(&self.ctx, &path, &config.config("config")?, key_type)
    }

    /// Opens the dtable under `name` through `config["class"]`.
    pub fn open_dtable(&self, name: &str, config: &Params) -> Result<Arc<dyn Dtable>, DtableError> {
        let class = config
            .class("class")?
            .ok_or_else(|| DtableError::NoEntry("missing \"class\" entry".into()))?;
        let factory = self
            .ctx
            .registry
            .lookup_dtable(class)
            .ok_or_else(|| DtableError::NoEntry(format!("unknown dtable class {class:?}")))?;
        let path = self.table_path(name)?;
        factory.open(&self.ctx, &path, &config.config("config")?)
    }

    /// Creates a managed dtable under `name` with the given managed config.
    pub fn create_managed(
        &self,
        name: &str,
        config: &Params,
        key_type: KeyType,
    ) -> Result<(), DtableError> {
        let path = self.table_path(name)?;
        ManagedDtable::create(&self.ctx, &path, config, key_type)
    }

    /// Opens the managed dtable under `name`.
    pub fn open_managed(&self, name: &str, config: &Params) -> Result<Arc<ManagedDtable>, DtableError> {
        let path = self.table_path(name)?;
        ManagedDtable::open(&self.ctx, &path, config)
    }

    /// Creates a ctable of the class named by `config["class"]`.
    pub fn create_ctable(
        &self,
        name: &str,
        config: &Params,
        key_type: KeyType,
    ) -> Result<(), DtableError> {
        let class = config
            .class("class")?
            .ok_or_else(|| DtableError::NoEntry("missing \"class\" entry".into()))?;
        let factory = self
            .ctx
            .registry
            .lookup_ctable(class)
            .ok_or_else(|| DtableError::NoEntry(format!("unknown ctable class {class:?}")))?;
        let path = self.table_path(name)?;
        factory.create(&self.ctx, &path, &config.config("config")?, key_type)
    }

    /// Opens the ctable under `name`.
    pub fn open_ctable(&self, name: &str, config: &Params) -> Result<Arc<dyn Ctable>, CtableError> {
        let class = config
            .class("class")
            .map_err(DtableError::from)?
            .ok_or_else(|| DtableError::NoEntry("missing \"class\" entry".into()))?
            .to_string();
        let factory = self
            .ctx
            .registry
            .lookup_ctable(&class)
            .ok_or_else(|| DtableError::NoEntry(format!("unknown ctable class {class:?}")))?;
        let path = self.table_path(name)?;
        let sub_config = config.config("config").map_err(DtableError::from)?;
        factory.open(&self.ctx, &path, &sub_config)
    }
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env").field("dir", &self.dir).finish_non_exhaustive()
    }
}
