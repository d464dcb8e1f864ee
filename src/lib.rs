//! Out-of-core element stores and an external merge sort.
//!
//! [`VariableStore`] and [`FixedStore`] hold elements in memory until a
//! budget derived from free memory runs out, then spill to a backing file.
//! Either store can be sorted; file-backed contents go through the
//! [`MergeSorter`], which splits input into sorted chunks and merges them
//! pairwise.

pub mod arena;
pub mod budget;
pub mod cli;
pub mod compare;
pub mod config;
pub mod error;
pub mod fixed_store;
pub mod framing;
pub mod input;
pub mod key;
pub mod merge;
pub mod output;
pub mod probe;
pub mod reader;
pub mod store;

pub use budget::BudgetPolicy;
pub use error::{Result, SpillError};
pub use fixed_store::FixedStore;
pub use framing::{
    ArenaFraming, ArenaSerializable, Framing, KeyExtractable, LineFraming, LineSerializable,
    RawLine, SortKey,
};
pub use merge::{MergeSorter, SortStats, merge_two_files};
pub use probe::{FixedMemoryProbe, MemoryProbe, SystemMemoryProbe};
pub use store::VariableStore;
