//! Storage backends for starmerge.
//!
//! [`TableStore`] is the contract; [`InMemoryTableStore`] is always
//! available and the durable backend lives in [`persistent`] behind the
//! `persistent` feature.

mod memory;
mod state;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::InMemoryTableStore;
pub use traits::{Commit, StorageError, TableStore};
