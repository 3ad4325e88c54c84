//! Object stores that back the shared SlateDB work item database.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use slatedb::Db;
use slatedb::object_store::ObjectStore;
use slatedb::object_store::local::LocalFileSystem;
use slatedb::object_store::memory::InMemory;
use thiserror::Error;

use crate::settings::{Backend, StoreConfig};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("slatedb error: {0}")]
    Slate(#[from] slatedb::Error),
    #[error("cannot use {path:?} as a store root: {source}")]
    LocalRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("object store rejected {location}: {reason}")]
    ObjectStore { location: String, reason: String },
    #[error("backend {0:?} does not use an object store")]
    NotObjectStore(Backend),
}

/// An object store plus the path SlateDB should open inside it.
pub struct StoreLocation {
    pub object_store: Arc<dyn ObjectStore>,
    pub db_path: String,
}

/// Resolve where the work item database lives for `cfg`.
pub fn store_location(cfg: &StoreConfig) -> Result<StoreLocation, StorageError> {
    match cfg.backend {
        Backend::Fs => local_store(Path::new(&cfg.path)),
        Backend::SlateMemory => Ok(StoreLocation {
            object_store: Arc::new(InMemory::new()),
            db_path: cfg.path.clone(),
        }),
        // s3://bucket/prefix, gs://bucket/prefix, ...
        Backend::Url => Ok(StoreLocation {
            object_store: Db::resolve_object_store(&cfg.path)?,
            db_path: cfg.path.clone(),
        }),
        Backend::Memory => Err(StorageError::NotObjectStore(cfg.backend)),
    }
}

fn local_store(root: &Path) -> Result<StoreLocation, StorageError> {
    let root_err = |source| StorageError::LocalRoot {
        path: root.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(root).map_err(root_err)?;
    // The same absolute path has to reach both the object store and DbBuilder;
    // relative segments get URL-encoded differently by each.
    let canonical = root.canonicalize().map_err(root_err)?;
    let db_path = canonical.to_string_lossy().to_string();
    let fs = LocalFileSystem::new_with_prefix(&canonical).map_err(|e| {
        StorageError::ObjectStore {
            location: db_path.clone(),
            reason: e.to_string(),
        }
    })?;
    Ok(StoreLocation {
        object_store: Arc::new(fs),
        db_path,
    })
}
