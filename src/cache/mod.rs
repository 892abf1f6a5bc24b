//! Local persistence: the entity store, offline snapshots and icons.
//!
//! The store is an upsert/query surface keyed by `(kind, id)`. Snapshots let a
//! restart skip the network for entities the server still lists.

pub mod icons;
pub mod snapshot;
pub mod storage;
mod traits;

pub use icons::{FsIconStore, IconStore, MemoryIconStore};
pub use snapshot::OfflineSnapshot;
pub use storage::{CachedEntity, CatalogStore, EntityStore, MemoryStorage, SqliteStorage};
pub use traits::Cacheable;
