//! Local entity store: trait plus SQLite and in-memory implementations.

use chrono::{DateTime, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use super::traits::Cacheable;
use crate::api::types::{Bank, CashPoint, EntityId, EntityKind, Town};

/// A stored entity together with the time it was last written.
#[derive(Debug, Clone)]
pub struct CachedEntity<T> {
  pub entity: T,
  pub synced_at: DateTime<Utc>,
}

/// Upsert/query surface of the local store for one entity type.
pub trait EntityStore<E: Cacheable> {
  /// Insert or replace by id.
  fn upsert(&self, entity: &E) -> Result<()>;

  fn query_entry(&self, id: EntityId) -> Result<Option<CachedEntity<E>>>;

  /// All stored entities of this kind, ordered by id.
  fn query_all(&self) -> Result<Vec<E>>;

  fn query_by_id(&self, id: EntityId) -> Result<Option<E>> {
    Ok(self.query_entry(id)?.map(|cached| cached.entity))
  }
}

/// A store that can hold every catalog kind.
pub trait CatalogStore: EntityStore<Bank> + EntityStore<Town> + EntityStore<CashPoint> {}

impl<S> CatalogStore for S where S: EntityStore<Bank> + EntityStore<Town> + EntityStore<CashPoint> {}

fn encode<E: Cacheable>(entity: &E) -> Result<Vec<u8>> {
  serde_json::to_vec(entity)
    .map_err(|e| eyre!("Failed to serialize {} {}: {}", E::KIND, entity.id(), e))
}

fn decode<E: Cacheable>(id: EntityId, data: &[u8]) -> Result<E> {
  serde_json::from_slice(data).map_err(|e| eyre!("Failed to parse stored {} {}: {}", E::KIND, id, e))
}

/// SQLite-based entity storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database under `data_dir`.
  pub fn open(data_dir: &Path) -> Result<Self> {
    Self::open_at(&data_dir.join("cache.db"))
  }

  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;
    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    kind TEXT NOT NULL,
    id INTEGER NOT NULL,
    data BLOB NOT NULL,
    synced_at INTEGER NOT NULL,
    PRIMARY KEY (kind, id)
);
"#;

impl<E: Cacheable> EntityStore<E> for SqliteStorage {
  fn upsert(&self, entity: &E) -> Result<()> {
    let data = encode(entity)?;
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO entities (kind, id, data, synced_at) VALUES (?, ?, ?, ?)",
        params![
          E::KIND.name(),
          entity.id().get(),
          data,
          Utc::now().timestamp_millis()
        ],
      )
      .map_err(|e| eyre!("Failed to store {} {}: {}", E::KIND, entity.id(), e))?;

    Ok(())
  }

  fn query_entry(&self, id: EntityId) -> Result<Option<CachedEntity<E>>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(Vec<u8>, i64)> = conn
      .query_row(
        "SELECT data, synced_at FROM entities WHERE kind = ? AND id = ?",
        params![E::KIND.name(), id.get()],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query {} {}: {}", E::KIND, id, e))?;

    match row {
      Some((data, synced_at)) => Ok(Some(CachedEntity {
        entity: decode(id, &data)?,
        synced_at: Utc
          .timestamp_millis_opt(synced_at)
          .single()
          .unwrap_or_default(),
      })),
      None => Ok(None),
    }
  }

  fn query_all(&self) -> Result<Vec<E>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT id, data FROM entities WHERE kind = ? ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![E::KIND.name()], |row| {
        Ok((row.get::<_, u32>(0)?, row.get::<_, Vec<u8>>(1)?))
      })
      .map_err(|e| eyre!("Failed to query {} list: {}", E::KIND, e))?;

    let mut entities = Vec::new();
    for row in rows {
      let (raw_id, data) = row.map_err(|e| eyre!("Failed to read row: {}", e))?;
      let id = EntityId::new(i64::from(raw_id))
        .ok_or_else(|| eyre!("Invalid {} id {} in store", E::KIND, raw_id))?;
      entities.push(decode(id, &data)?);
    }

    Ok(entities)
  }
}

/// Store kept entirely in memory, for tests and disk-less runs.
#[derive(Default)]
pub struct MemoryStorage {
  entries: Mutex<BTreeMap<(EntityKind, EntityId), (Vec<u8>, DateTime<Utc>)>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  /// Overwrite the sync time of a stored entity.
  pub fn set_synced_at(&self, kind: EntityKind, id: EntityId, at: DateTime<Utc>) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if let Some(entry) = entries.get_mut(&(kind, id)) {
      entry.1 = at;
    }
    Ok(())
  }
}

impl<E: Cacheable> EntityStore<E> for MemoryStorage {
  fn upsert(&self, entity: &E) -> Result<()> {
    let data = encode(entity)?;
    self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .insert((E::KIND, entity.id()), (data, Utc::now()));
    Ok(())
  }

  fn query_entry(&self, id: EntityId) -> Result<Option<CachedEntity<E>>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    match entries.get(&(E::KIND, id)) {
      Some((data, synced_at)) => Ok(Some(CachedEntity {
        entity: decode(id, data)?,
        synced_at: *synced_at,
      })),
      None => Ok(None),
    }
  }

  fn query_all(&self) -> Result<Vec<E>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    entries
      .iter()
      .filter(|((kind, _), _)| *kind == E::KIND)
      .map(|((_, id), (data, _))| decode(*id, data))
      .collect()
  }
}
