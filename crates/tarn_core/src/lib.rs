//! # Tarn Core
//!
//! The Tarn segment store engine.
//!
//! This crate provides:
//! - Immutable segments archived into append-only tar containers
//! - Node records forming a persistent tree with structural sharing
//! - A journal persisting the single mutable head pointer
//! - Branches with optimistic and pessimistic merge
//! - Commit hooks for validating and rewriting merged trees
//!
//! The entry point is [`FileStore::open`]; work against the tree goes
//! through [`Branch`].
//!
//! ```no_run
//! use tarn_core::{Branch, CommitInfo, Config, EmptyHook, FileStore, PropertyValue};
//!
//! # fn main() -> tarn_core::CoreResult<()> {
//! let store = FileStore::open("/var/lib/tarn", Config::default())?;
//!
//! let mut branch = Branch::new(store.clone())?;
//! let mut builder = branch.root()?.builder();
//! builder.set_property("name", PropertyValue::string("tarn"));
//! branch.set_root(&builder.write()?);
//! branch.merge(&EmptyHook, &CommitInfo::new())?;
//!
//! store.close()?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod branch;
pub mod commit;
pub mod config;
pub mod error;
pub mod journal;
pub mod node;
pub mod segment;
pub mod stats;
pub mod store;
mod tar;
pub mod types;

pub use branch::Branch;
pub use commit::{CommitHook, CommitInfo, ConflictValidator, EmptyHook};
pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use journal::Journal;
pub use node::{Node, NodeBuilder, NodeState, PropertyValue, CONFLICT_NAME};
pub use segment::{compute_crc32, Segment};
pub use stats::{StatsSnapshot, StoreStats};
pub use store::FileStore;
pub use types::{RecordId, SegmentId};
