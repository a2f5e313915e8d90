//! Persistent route table: run name to host endpoint bindings.
//!
//! External callers reach a run's published endpoints through this table;
//! it is rewritten atomically on every mutation so a crash never leaves a
//! half-written file behind.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt route table: {0}")]
    Corrupt(#[from] serde_json::Error),
}

pub type RouteResult<T> = Result<T, RouteError>;

/// Endpoint name to `host:port`.
pub type EndpointMap = HashMap<String, String>;

/// File-backed route table at `<dir>/routes.json`.
pub struct RouteTable {
    path: PathBuf,
    routes: Mutex<HashMap<String, EndpointMap>>,
}

impl RouteTable {
    /// Load the table from `<dir>/routes.json`, creating the directory if
    /// needed. A missing file is an empty table.
    pub fn load(dir: impl Into<PathBuf>) -> RouteResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let path = dir.join("routes.json");

        let routes = if path.exists() {
            serde_json::from_slice(&fs::read(&path)?)?
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            routes: Mutex::new(routes),
        })
    }

    /// Bind a name to its endpoint map, replacing any previous binding.
    pub fn set(&self, name: &str, endpoints: EndpointMap) -> RouteResult<()> {
        let mut routes = self.routes.lock();
        routes.insert(name.to_string(), endpoints);
        self.flush(&routes)
    }

    /// Remove the binding for a name. Returns whether one existed.
    pub fn remove(&self, name: &str) -> RouteResult<bool> {
        let mut routes = self.routes.lock();
        let existed = routes.remove(name).is_some();
        if existed {
            self.flush(&routes)?;
        }
        Ok(existed)
    }

    pub fn get(&self, name: &str) -> Option<EndpointMap> {
        self.routes.lock().get(name).cloned()
    }

    pub fn list(&self) -> HashMap<String, EndpointMap> {
        self.routes.lock().clone()
    }

    /// Atomic rewrite: temp file in the same directory, then rename.
    fn flush(&self, routes: &HashMap<String, EndpointMap>) -> RouteResult<()> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(routes)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
