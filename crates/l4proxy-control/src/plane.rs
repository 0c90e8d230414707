//! Registry of running agent instances
//!
//! Each registration binds and starts an [`AgentInstance`] and hands its
//! event stream to the caller. Names are unique: a second registration under
//! a name that is already taken is rejected, never replaced.

use crate::error::ControlError;
use l4proxy_proto::{BackendServiceUser, ClientEvent, ClientInfo};
use l4proxy_relay::{AgentInstance, InstanceConfig};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    /// Host advertised to agents and users
    pub host: String,
    pub bind_ip: IpAddr,
    pub pending_timeout: Option<Duration>,
    pub handshake_timeout: Duration,
    pub event_buffer: usize,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        let instance = InstanceConfig::default();
        Self {
            host: instance.host,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            pending_timeout: instance.pending_timeout,
            handshake_timeout: instance.handshake_timeout,
            event_buffer: instance.event_buffer,
        }
    }
}

/// A successful registration
pub struct Registration {
    pub name: String,
    pub public_address: String,
    pub internal_address: String,
    /// Ordered events for the registering agent. The first carries the public address.
    pub events: mpsc::Receiver<ClientEvent>,
}

pub struct ControlPlane {
    config: ControlPlaneConfig,
    instances: RwLock<HashMap<String, Arc<AgentInstance>>>,
    shutdown: CancellationToken,
}

impl ControlPlane {
    pub fn new(config: ControlPlaneConfig) -> Self {
        info!(host = %config.host, bind_ip = %config.bind_ip, "Creating control plane");
        Self {
            config,
            instances: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    /// Bind and start a new agent instance under `name`.
    ///
    /// Port 0 picks a free port. Fails with [`ControlError::NameConflict`] if
    /// `name` is taken, or with a bind error if either port is unavailable; in
    /// both cases nothing is registered.
    pub async fn register(
        &self,
        name: String,
        display_name: String,
        public_port: u16,
        internal_port: u16,
    ) -> Result<Registration, ControlError> {
        if self.shutdown.is_cancelled() {
            return Err(ControlError::ShuttingDown);
        }

        // Held across the bind so two registrations of one name cannot both succeed
        let mut instances = self.instances.write().await;
        if instances.contains_key(&name) {
            warn!(client = %name, "Rejected duplicate registration");
            return Err(ControlError::NameConflict(name));
        }

        let config = InstanceConfig {
            name: name.clone(),
            display_name,
            host: self.config.host.clone(),
            bind_ip: self.config.bind_ip,
            public_port,
            internal_port,
            pending_timeout: self.config.pending_timeout,
            handshake_timeout: self.config.handshake_timeout,
            event_buffer: self.config.event_buffer,
        };

        let (instance, events) = AgentInstance::bind(config, self.shutdown.child_token()).await?;
        instance.start()?;

        let registration = Registration {
            name: name.clone(),
            public_address: instance.public_address().to_string(),
            internal_address: instance.internal_address().to_string(),
            events,
        };

        info!(
            client = %name,
            display_name = %instance.display_name(),
            public = %registration.public_address,
            internal = %registration.internal_address,
            "Registered client"
        );

        instances.insert(name, Arc::new(instance));
        Ok(registration)
    }

    /// Remove an instance and stop it from accepting.
    ///
    /// Pending users are dropped; active relays run until their own I/O ends.
    /// Returns once every relay of the instance has finished.
    pub async fn deregister(&self, name: &str) -> Result<(), ControlError> {
        let instance = self
            .instances
            .write()
            .await
            .remove(name)
            .ok_or_else(|| ControlError::NotFound(name.to_string()))?;

        info!(client = %name, "Deregistered client");
        instance.drain().await;
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Arc<AgentInstance>> {
        self.instances.read().await.get(name).cloned()
    }

    /// Every registered instance, oldest first
    pub async fn list_clients(&self) -> Vec<ClientInfo> {
        let mut clients: Vec<ClientInfo> = self
            .instances
            .read()
            .await
            .values()
            .map(|instance| instance.info())
            .collect();
        clients.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        clients
    }

    /// Users with a pending or active session on the named instance
    pub async fn list_users(&self, name: &str) -> Result<Vec<BackendServiceUser>, ControlError> {
        let instance = self
            .get(name)
            .await
            .ok_or_else(|| ControlError::NotFound(name.to_string()))?;

        Ok(instance
            .users()
            .into_iter()
            .map(|addr| BackendServiceUser {
                user_address: addr.to_string(),
            })
            .collect())
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Refuse new registrations and close every instance, including active relays
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let instances: Vec<Arc<AgentInstance>> = self
            .instances
            .write()
            .await
            .drain()
            .map(|(_, instance)| instance)
            .collect();

        debug!("Closing {} clients", instances.len());
        futures::future::join_all(instances.iter().map(|instance| instance.close())).await;
        info!("Control plane stopped");
    }
}
