//! Compressed on-disk copy of a fully synced entity set.
//!
//! One gzip'd JSON array per entity kind. The file is only trusted while its
//! modification time is within the freshness window; anything unreadable or
//! stale is deleted and the sync falls back to the network.

use color_eyre::{eyre::eyre, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use super::storage::EntityStore;
use super::traits::Cacheable;
use crate::api::types::EntityId;
use crate::sync::queue::PendingIdQueue;

pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Whether a file modified at `modified` is still usable at `now`.
///
/// A modification time in the future counts as fresh.
pub fn is_fresh(modified: SystemTime, now: SystemTime, max_age: Duration) -> bool {
  match now.duration_since(modified) {
    Ok(age) => age <= max_age,
    Err(_) => true,
  }
}

pub struct OfflineSnapshot<E> {
  path: PathBuf,
  max_age: Duration,
  _entity: PhantomData<fn() -> E>,
}

impl<E: Cacheable> OfflineSnapshot<E> {
  /// Snapshot file for `E` inside `dir`.
  pub fn new(dir: &Path, max_age: Duration) -> Self {
    Self {
      path: dir.join(format!("{}.json.gz", E::KIND.name())),
      max_age,
      _entity: PhantomData,
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Write the full entity set, replacing the previous snapshot atomically.
  pub fn save(&self, entities: &[E]) -> Result<()> {
    if let Some(parent) = self.path.parent() {
      fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create snapshot directory: {}", e))?;
    }

    let tmp = self.path.with_extension("gz.tmp");
    let file = File::create(&tmp)
      .map_err(|e| eyre!("Failed to create snapshot {}: {}", tmp.display(), e))?;

    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    serde_json::to_writer(&mut encoder, entities)
      .map_err(|e| eyre!("Failed to serialize {} snapshot: {}", E::KIND, e))?;
    let mut writer = encoder
      .finish()
      .map_err(|e| eyre!("Failed to compress {} snapshot: {}", E::KIND, e))?;
    writer
      .flush()
      .map_err(|e| eyre!("Failed to write snapshot {}: {}", tmp.display(), e))?;
    drop(writer);

    fs::rename(&tmp, &self.path)
      .map_err(|e| eyre!("Failed to move snapshot into {}: {}", self.path.display(), e))?;

    debug!(kind = %E::KIND, count = entities.len(), "snapshot saved");
    Ok(())
  }

  /// Restore cached entities that are still listed in `pending`.
  pub fn restore(
    &self,
    pending: &mut PendingIdQueue,
    store: &dyn EntityStore<E>,
  ) -> Vec<EntityId> {
    self.restore_at(pending, store, SystemTime::now())
  }

  /// Write every cached entity whose id is pending to `store` and remove it
  /// from `pending`. Entities no longer on the server are dropped. Returns the
  /// ids served from the snapshot.
  ///
  /// Never fails: a missing, stale or broken file just yields nothing.
  pub fn restore_at(
    &self,
    pending: &mut PendingIdQueue,
    store: &dyn EntityStore<E>,
    now: SystemTime,
  ) -> Vec<EntityId> {
    let cached = match self.load(now) {
      Ok(Some(cached)) => cached,
      Ok(None) => return Vec::new(),
      Err(e) => {
        warn!(kind = %E::KIND, "discarding offline snapshot: {}", e);
        self.discard();
        return Vec::new();
      }
    };

    let wanted: HashSet<EntityId> = pending.iter().collect();
    let mut consumed = Vec::new();

    for entity in cached {
      let id = entity.id();
      if !wanted.contains(&id) {
        continue;
      }

      let local = store.query_by_id(id).unwrap_or_else(|e| {
        warn!(kind = %E::KIND, %id, "failed to read local copy: {}", e);
        None
      });
      match store.upsert(&entity.merged_with(local.as_ref())) {
        Ok(()) => consumed.push(id),
        Err(e) => warn!(kind = %E::KIND, %id, "failed to restore from snapshot: {}", e),
      }
    }

    let consumed_set: HashSet<EntityId> = consumed.iter().copied().collect();
    pending.remove_all(&consumed_set);

    info!(kind = %E::KIND, restored = consumed.len(), "restored from offline snapshot");
    consumed
  }

  /// Read the snapshot. `Ok(None)` when there is no file or it is too old.
  fn load(&self, now: SystemTime) -> Result<Option<Vec<E>>> {
    let metadata = match fs::metadata(&self.path) {
      Ok(metadata) => metadata,
      Err(_) => return Ok(None),
    };

    let modified = metadata
      .modified()
      .map_err(|e| eyre!("Failed to read snapshot time: {}", e))?;
    if !is_fresh(modified, now, self.max_age) {
      info!(kind = %E::KIND, "offline snapshot is stale");
      self.discard();
      return Ok(None);
    }

    let file = File::open(&self.path)
      .map_err(|e| eyre!("Failed to open {}: {}", self.path.display(), e))?;
    let json: Value = serde_json::from_reader(GzDecoder::new(BufReader::new(file)))
      .map_err(|e| eyre!("Failed to parse {}: {}", self.path.display(), e))?;

    let Value::Array(items) = json else {
      return Err(eyre!("{} is not a json array", self.path.display()));
    };

    let entities = items
      .into_iter()
      .filter_map(|item| match serde_json::from_value::<E>(item) {
        Ok(entity) => Some(entity),
        Err(e) => {
          warn!(kind = %E::KIND, "skipping unreadable snapshot entry: {}", e);
          None
        }
      })
      .collect();

    Ok(Some(entities))
  }

  /// Delete the snapshot file.
  pub fn discard(&self) {
    if let Err(e) = fs::remove_file(&self.path) {
      if e.kind() != std::io::ErrorKind::NotFound {
        warn!(kind = %E::KIND, "failed to delete {}: {}", self.path.display(), e);
      }
    }
  }
}
