use crate::event::ChangeEvent;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Callback into the cache/index layer of one locally-registered server. Invoked from
/// transport worker tasks, concurrently with application traffic; implementations must be
/// thread-safe.
pub trait ServerHandle: Send + Sync {
    fn invalidate(&self, event: &ChangeEvent);
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterServerError {
    #[error("server '{0}' is already registered")]
    AlreadyRegistered(String),
}

/// Name -> handle map for the servers hosted in this process. An explicit struct passed by
/// handle, deliberately not ambient global state.
pub struct ServerRegistry {
    servers: Mutex<HashMap<String, Arc<dyn ServerHandle>>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        ServerRegistry {
            servers: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, name: &str, handle: Arc<dyn ServerHandle>) -> Result<(), RegisterServerError> {
        let mut servers = self.servers.lock().unwrap();
        if servers.contains_key(name) {
            return Err(RegisterServerError::AlreadyRegistered(name.to_string()));
        }
        servers.insert(name.to_string(), handle);
        Ok(())
    }

    pub fn route(&self, name: &str) -> Option<Arc<dyn ServerHandle>> {
        self.servers.lock().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.servers.lock().unwrap().keys().cloned().collect()
    }

    pub fn clear(&self) {
        self.servers.lock().unwrap().clear();
    }
}
