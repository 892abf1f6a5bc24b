//! Icon storage. Image decoding happens elsewhere; this only keeps raw bytes.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use crate::api::types::{EntityId, EntityKind};

pub trait IconStore: Send + Sync {
  /// Whether an icon is already available for the entity.
  fn contains(&self, kind: EntityKind, id: EntityId) -> bool;

  /// Hand raw image bytes over. Returns false when they were rejected.
  fn load(&self, kind: EntityKind, id: EntityId, data: &[u8]) -> bool;
}

/// Keeps icons as `<kind>/<id>.svg` files.
pub struct FsIconStore {
  root: PathBuf,
}

impl FsIconStore {
  pub fn open(root: &Path) -> Result<Self> {
    fs::create_dir_all(root)
      .map_err(|e| eyre!("Failed to create icon directory {}: {}", root.display(), e))?;
    Ok(Self {
      root: root.to_path_buf(),
    })
  }

  fn path(&self, kind: EntityKind, id: EntityId) -> PathBuf {
    self.root.join(kind.name()).join(format!("{}.svg", id))
  }
}

fn looks_like_svg(data: &[u8]) -> bool {
  std::str::from_utf8(data)
    .map(|text| text.contains("<svg"))
    .unwrap_or(false)
}

impl IconStore for FsIconStore {
  fn contains(&self, kind: EntityKind, id: EntityId) -> bool {
    self.path(kind, id).is_file()
  }

  fn load(&self, kind: EntityKind, id: EntityId, data: &[u8]) -> bool {
    if !looks_like_svg(data) {
      return false;
    }

    let path = self.path(kind, id);
    let written = path
      .parent()
      .map_or(Ok(()), fs::create_dir_all)
      .and_then(|()| fs::write(&path, data));

    match written {
      Ok(()) => true,
      Err(e) => {
        warn!(%kind, %id, "failed to write icon {}: {}", path.display(), e);
        false
      }
    }
  }
}

/// In-memory icon store.
#[derive(Default)]
pub struct MemoryIconStore {
  icons: Mutex<HashMap<(EntityKind, EntityId), Vec<u8>>>,
}

impl MemoryIconStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.icons.lock().map(|icons| icons.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl IconStore for MemoryIconStore {
  fn contains(&self, kind: EntityKind, id: EntityId) -> bool {
    self
      .icons
      .lock()
      .map(|icons| icons.contains_key(&(kind, id)))
      .unwrap_or(false)
  }

  fn load(&self, kind: EntityKind, id: EntityId, data: &[u8]) -> bool {
    if !looks_like_svg(data) {
      return false;
    }
    match self.icons.lock() {
      Ok(mut icons) => {
        icons.insert((kind, id), data.to_vec());
        true
      }
      Err(_) => false,
    }
  }
}
