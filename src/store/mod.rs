//! Node persistence and product lookup
//!
//! The coordinator only needs three operations from persistence and one
//! from the product catalog. Both are expressed as traits so hosts can
//! plug in their own storage; file and in-memory implementations are
//! provided.

mod catalog;

pub use self::catalog::{NoCatalog, ProductCatalog, ProductDescriptor, StaticCatalog};

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use crate::core::{Error, NodeId, Result};
use crate::node::Node;

/// Format version of persisted node files
pub const STORE_VERSION: &str = "1.0";

/// Save and restore of node state
pub trait NodeStore: Send + Sync {
    /// Persists a node, replacing earlier state
    fn save(&self, node: &Node) -> Result<()>;

    /// Loads a node, `None` when nothing was saved
    fn load(&self, id: NodeId) -> Result<Option<Node>>;

    /// Removes saved state, returning whether anything was removed
    fn delete(&self, id: NodeId) -> Result<bool>;
}

/// Keeps node snapshots in memory
#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    nodes: Mutex<HashMap<NodeId, Node>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        MemoryNodeStore::default()
    }
}

impl NodeStore for MemoryNodeStore {
    fn save(&self, node: &Node) -> Result<()> {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node.id(), node.clone());
        Ok(())
    }

    fn load(&self, id: NodeId) -> Result<Option<Node>> {
        Ok(self
            .nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned())
    }

    fn delete(&self, id: NodeId) -> Result<bool> {
        Ok(self
            .nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some())
    }
}

/// One bincode file per node under a versioned directory
#[derive(Debug, Clone)]
pub struct FileNodeStore {
    dir: PathBuf,
}

impl FileNodeStore {
    /// Creates a store rooted at `base`; files go to `base/<version>/`
    pub fn new(base: impl AsRef<Path>) -> Self {
        FileNodeStore {
            dir: base.as_ref().join(STORE_VERSION),
        }
    }

    /// Directory holding the node files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: NodeId) -> PathBuf {
        self.dir.join(format!("node{}.bin", id))
    }
}

impl NodeStore for FileNodeStore {
    fn save(&self, node: &Node) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| Error::persistence(format!("Failed to create {}: {}", self.dir.display(), e)))?;
        let bytes = bincode::serialize(node)
            .map_err(|e| Error::persistence(format!("Failed to serialize node {}: {}", node.id(), e)))?;
        let path = self.path(node.id());
        fs::write(&path, bytes)
            .map_err(|e| Error::persistence(format!("Failed to write {}: {}", path.display(), e)))?;
        debug!(node = %node.id(), path = %path.display(), "saved node");
        Ok(())
    }

    fn load(&self, id: NodeId) -> Result<Option<Node>> {
        let path = self.path(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::persistence(format!("Failed to read {}: {}", path.display(), e)))
            }
        };
        match bincode::deserialize::<Node>(&bytes) {
            Ok(node) if node.id() == id => Ok(Some(node)),
            Ok(node) => {
                warn!(expected = %id, found = %node.id(), "node file holds another node");
                Ok(None)
            }
            Err(e) => Err(Error::persistence(format!("Failed to decode {}: {}", path.display(), e))),
        }
    }

    fn delete(&self, id: NodeId) -> Result<bool> {
        match fs::remove_file(self.path(id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::persistence(format!("Failed to delete node {}: {}", id, e))),
        }
    }
}
