//! Account persistence.

pub mod accounts;
pub mod index;

pub use accounts::{Account, AccountDirectory, AccountId, StorageConfig, StorageError};
pub use index::{IndexEntry, IndexError, SortedIndex};
