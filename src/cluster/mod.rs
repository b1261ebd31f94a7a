//! Physical clusters - partitioned record storage and shard routing
//!
//! A logical collection owns one or more clusters. Each cluster is an
//! ordered, append-friendly container of versioned record slots; the
//! sharding strategy picks, for every new record, which of the collection's
//! clusters receives it.

pub mod sharding;
pub mod store;

pub use sharding::{HashSharding, ShardKey, ShardingStrategy};
pub use store::{ClusterId, ClusterStore, ClusterStoreSnapshot, CommitLock};
