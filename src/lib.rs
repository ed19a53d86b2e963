//! # Anvil
//!
//! An embeddable, single-process storage engine built on **layered,
//! log-structured sorted tables**. The core abstraction is the *dtable*: an
//! ordered map from typed keys to byte-sequence values that supports stable
//! forward/backward iteration and point lookup. Every dtable is either a
//! *leaf* (owns in-memory or on-disk storage) or a *wrapper* (composes one or
//! more inner dtables and transforms keys, values, or iteration).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ManagedDtable                           │
//! │  ┌──────────────┐  ┌─────────────────────────────────────┐  │
//! │  │ JournalDtable│  │  disk_{n-1}  …  disk_1  disk_0      │  │
//! │  │ (write front)│  │  (immutable sorted layers)          │  │
//! │  └──────┬───────┘  └──────────────┬──────────────────────┘  │
//! │         │ digest                  │ combine                 │
//! │         └────────►  new layer  ◄──┘                         │
//! │                                                             │
//! │  OverlayDtable: [journal, disk_{n-1}, …, disk_0]            │
//! │  (higher layers shadow lower ones)                          │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ entries
//!            ┌───────────┴───────────┐
//!            │      SysJournal       │  (shared append-only log,
//!            │  meta + data files    │   listener ids, replay, filter)
//!            └───────────────────────┘
//! ```
//!
//! Transforming wrappers (`smallint`, `deltaint`, `exception`, `exist`,
//! `keydiv`, `btree`, `rwatx`) compose by overlaying iterators; column
//! tables (`SimpleCtable`, `ColumnCtable`) layer a (key, column, value)
//! model on top of dtables. Table stacks are described entirely by a
//! declarative [`params`] configuration tree resolved through the
//! [`factory`] registry.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`value`] | `Blob`, `BlobBuffer`, `Dtype` keys, named blob comparators |
//! | [`encoding`] | Deterministic binary encoding for all on-disk structures |
//! | [`journal`] | System journal: listener entries, replay, filter, unique ids |
//! | [`dtable`] | The dtable trait family and every implementation |
//! | [`ctable`] | Column tables over dtables |
//! | [`params`] | `config [ … ]` grammar and the typed configuration tree |
//! | [`factory`] | Class-name registries for table construction |
//! | [`env`] | The host environment: directory, journal, registry |
//! | [`bg`] | Background maintenance token and thread wrapper |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use anvil::dtable::Dtable;
//! use anvil::env::Env;
//! use anvil::params::Params;
//! use anvil::value::{Blob, Dtype, KeyType};
//!
//! let env = Env::open("/tmp/my_store").unwrap();
//! let config = Params::parse(
//!     r#"config [
//!         "base" class(dt) simple_dtable
//!         "digest_interval" int 2
//!     ]"#,
//!     env.registry(),
//! )
//! .unwrap();
//!
//! env.create_managed("table", &config, KeyType::U32).unwrap();
//! let table = env.open_managed("table", &config).unwrap();
//!
//! table.insert(&Dtype::U32(1), Blob::from(&b"first"[..])).unwrap();
//! assert_eq!(table.get(&Dtype::U32(1)).unwrap(), Some(Blob::from(&b"first"[..])));
//!
//! table.remove(&Dtype::U32(1)).unwrap();
//! assert_eq!(table.get(&Dtype::U32(1)).unwrap(), None);
//! ```

#![allow(dead_code)]

pub mod bg;
pub mod ctable;
pub mod dtable;
pub mod encoding;
pub mod env;
pub mod factory;
pub mod journal;
pub mod params;
pub mod value;
