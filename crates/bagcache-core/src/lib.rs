//! Bagcache core - tiered in-process cache for bag files
//!
//! This crate keeps opened bags and the data derived from them in memory:
//! - Bag identity resolution (canonical path + size + mtime)
//! - A bounded pool of open bag handles (LRU + idle TTL)
//! - Per-bag metadata cache (size-aware segmented LRU with TTL)
//! - Per-series time indexes for nearest/range lookups
//! - Per-bag raw record cache for small series
//!
//! ```text
//!                 Manager (max_open, idle_ttl)
//!                   |
//!        +----------+----------+
//!        |          |          |
//!     Handle     Handle     Handle      keyed by BagKey
//!        |
//!        +-- resource (BagOpener::Resource, scoped by ResourceGuard)
//!        +-- metadata  SizeAwareSlru<String, serde_json::Value>
//!        +-- indexes   series -> TopicTimeIndex
//!        +-- records   RecordCache
//! ```

pub mod handle;
pub mod index;
pub mod key;
pub mod manager;
pub mod records;
pub mod resource;
pub mod slru;

// Re-exports
pub use handle::{Handle, HandleSummary, ResourceGuard};
pub use index::TopicTimeIndex;
pub use key::{BagKey, expand_home, locate_data_file};
pub use manager::{Manager, ManagerStats};
pub use records::{CachedRecord, RecordCache, RecordCacheStats, SeriesStats};
pub use resource::{BagFile, BagOpener, BagResource, FileOpener};
pub use slru::{Segment, SizeAwareSlru, SlruStats};
