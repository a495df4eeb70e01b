//! [`ClientPool`] – lazily provisioned, per-group client cache.
//!
//! The pool holds at most one connected [`GroupClient`] per group.  The first
//! request for a group asks the [`ClientFactory`] for a client and waits, up
//! to the connect timeout, for it to come up.  A client that fails to connect
//! is discarded, so the next request for that group tries again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use posture_types::{ConnectResult, PostureError};
use tracing::{error, info};

use crate::client::{ClientFactory, GroupClient};

/// How long provisioning waits for a group's endpoint.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(4);

/// Per-group client cache backed by a [`ClientFactory`].
pub struct ClientPool {
    factory: Arc<dyn ClientFactory>,
    connect_timeout: Duration,
    clients: HashMap<String, Arc<dyn GroupClient>>,
}

impl ClientPool {
    pub fn new(factory: Arc<dyn ClientFactory>, connect_timeout: Duration) -> Self {
        Self {
            factory,
            connect_timeout,
            clients: HashMap::new(),
        }
    }

    /// Return the connected client for `group`, provisioning one if needed.
    ///
    /// # Errors
    ///
    /// Returns [`PostureError::ClientProvisioningTimeout`] when the new
    /// client does not connect within the timeout.  Nothing is cached in that
    /// case.
    pub async fn get_or_provision(
        &mut self,
        group: &str,
    ) -> Result<Arc<dyn GroupClient>, PostureError> {
        if let Some(client) = self.clients.get(group) {
            return Ok(Arc::clone(client));
        }

        info!(group, "client not initialised, provisioning");
        let client = self.factory.create(group);
        // Bound the wait even if the transport ignores its own timeout.
        let result = tokio::time::timeout(self.connect_timeout, client.connect(self.connect_timeout))
            .await
            .unwrap_or(ConnectResult::TimedOut);

        match result {
            ConnectResult::Ready => {
                self.clients.insert(group.to_string(), Arc::clone(&client));
                Ok(client)
            }
            ConnectResult::TimedOut => {
                error!(
                    group,
                    timeout_ms = self.connect_timeout.as_millis() as u64,
                    "failed to connect to group endpoint"
                );
                Err(PostureError::ClientProvisioningTimeout {
                    group: group.to_string(),
                    timeout: self.connect_timeout,
                })
            }
        }
    }

    /// Groups with a connected client, sorted.
    pub fn connected_groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.clients.keys().cloned().collect();
        groups.sort();
        groups
    }
}
