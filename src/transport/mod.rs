//! External capabilities behind narrow seams: the partitioned log, the
//! low-latency side cache, and the archival object store. In-process
//! implementations live here; a networked deployment swaps them without
//! touching the engines.

pub mod cache;
pub mod log;
pub mod object_store;

pub use cache::{CacheError, MemoryCache, PubSubMessage, SideCache};
pub use log::{LogError, MemoryLog, PartitionConsumer, Producer, Record, StoredRecord};
pub use object_store::{FsObjectStore, MemoryObjectStore, ObjectStore, ObjectStoreError};
