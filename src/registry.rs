//! Process-wide sharing of stream clients
//!
//! Several components that want the same stream share one manager instead of
//! opening one socket each. The first lease starts the client, the last lease
//! to drop stops it.

use crate::{client::StreamClient, error::SdkError};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

struct Shared {
    client: StreamClient,
    leases: usize,
}

/// Reference-counted registry of named clients
#[derive(Clone, Default)]
pub struct StreamRegistry {
    entries: Arc<Mutex<HashMap<String, Shared>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by the whole process
    pub fn global() -> &'static StreamRegistry {
        static GLOBAL: OnceLock<StreamRegistry> = OnceLock::new();
        GLOBAL.get_or_init(StreamRegistry::new)
    }

    /// Lease the client registered under `key`, creating and starting it with
    /// `factory` when this is the first lease.
    pub fn acquire<F>(&self, key: &str, factory: F) -> Result<StreamLease, SdkError>
    where
        F: FnOnce() -> Result<StreamClient, SdkError>,
    {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(shared) = entries.get_mut(key) {
            shared.leases += 1;
            tracing::debug!(key, leases = shared.leases, "Sharing stream client");
            return Ok(StreamLease {
                key: key.to_string(),
                client: shared.client.clone(),
                registry: self.clone(),
            });
        }

        let client = factory()?;
        client.start();
        entries.insert(
            key.to_string(),
            Shared {
                client: client.clone(),
                leases: 1,
            },
        );
        tracing::info!(key, client = %client.id(), "Stream client registered");

        Ok(StreamLease {
            key: key.to_string(),
            client,
            registry: self.clone(),
        })
    }

    /// Number of live leases for `key`
    pub fn lease_count(&self, key: &str) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).map(|shared| shared.leases).unwrap_or(0)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lease_count(key) > 0
    }

    fn release(&self, key: &str) {
        let removed = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let last = match entries.get_mut(key) {
                Some(shared) => {
                    shared.leases = shared.leases.saturating_sub(1);
                    shared.leases == 0
                }
                None => return,
            };
            if last {
                entries.remove(key)
            } else {
                None
            }
        };

        // stop() waits for a running observer, which may itself use the registry
        if let Some(shared) = removed {
            tracing::info!(key, "Last lease dropped; stopping stream client");
            shared.client.stop();
        }
    }
}

/// Shared use of a registered client; derefs to [`StreamClient`]
pub struct StreamLease {
    key: String,
    client: StreamClient,
    registry: StreamRegistry,
}

impl StreamLease {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Deref for StreamLease {
    type Target = StreamClient;

    fn deref(&self) -> &StreamClient {
        &self.client
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}
