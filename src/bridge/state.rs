//! Bridge state.
//!
//! `BridgeContext` is built once at startup and shared by every handler. It
//! owns the network policies, the store, the homeserver client, the request
//! tracker and the registry of live IRC connections.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn, Instrument};

use crate::bridge::requests::RequestTracker;
use crate::common::error::{BridgeError, BridgeResult};
use crate::common::messages::LocalEvent;
use crate::common::metrics::MetricsSink;
use crate::common::types::{to_irc_lower, LocalIdentity, RemoteIdentity};
use crate::config::types::Config;
use crate::irc::client::{ConnectionDeps, ConnectionNotification, ConnectionState, VirtualConnection};
use crate::irc::server::ServerPolicy;
use crate::matrix::client::RemoteClient;
use crate::store::IdentityStore;

type ClientKey = (String, String);

/// Live IRC connections: one bot per network, one client per
/// (network, room-side user).
#[derive(Default)]
pub struct ConnectionRegistry {
    bots: DashMap<String, VirtualConnection>,
    clients: Arc<DashMap<ClientKey, VirtualConnection>>,
    creating: DashMap<ClientKey, Arc<tokio::sync::Mutex<()>>>,
}

impl ConnectionRegistry {
    pub fn bot(&self, domain: &str) -> Option<VirtualConnection> {
        self.bots.get(domain).map(|c| c.value().clone())
    }

    pub fn set_bot(&self, conn: VirtualConnection) {
        self.bots.insert(conn.domain().to_string(), conn);
    }

    /// A connected client for `user_id` on `domain`.
    pub fn client(&self, domain: &str, user_id: &str) -> Option<VirtualConnection> {
        self.clients
            .get(&(domain.to_string(), user_id.to_string()))
            .map(|c| c.value().clone())
            .filter(|c| c.state() == ConnectionState::Connected)
    }

    fn insert_client(&self, user_id: &str, conn: VirtualConnection) {
        self.clients
            .insert((conn.domain().to_string(), user_id.to_string()), conn);
    }

    pub fn client_count(&self, domain: &str) -> usize {
        self.clients.iter().filter(|e| e.key().0 == domain).count()
    }

    /// Whether `nick` belongs to one of our own connections on `domain`.
    pub fn owns_nick(&self, domain: &str, nick: &str) -> bool {
        self.by_nick(domain, nick).is_some()
    }

    pub fn by_nick(&self, domain: &str, nick: &str) -> Option<VirtualConnection> {
        let nick = to_irc_lower(nick);
        let matches = |c: &VirtualConnection| c.domain() == domain && to_irc_lower(&c.nick()) == nick;
        self.bots
            .iter()
            .map(|e| e.value().clone())
            .chain(self.clients.iter().map(|e| e.value().clone()))
            .find(|c| matches(c))
    }

    pub fn all(&self) -> Vec<VirtualConnection> {
        self.bots
            .iter()
            .map(|e| e.value().clone())
            .chain(self.clients.iter().map(|e| e.value().clone()))
            .collect()
    }

    fn creation_lock(&self, key: &ClientKey) -> Arc<tokio::sync::Mutex<()>> {
        self.creating.entry(key.clone()).or_default().clone()
    }

    /// Drop the creation lock for `key` once no other caller is waiting on it.
    fn release_creation_lock(&self, key: &ClientKey, lock: Arc<tokio::sync::Mutex<()>>) {
        // One reference in the map, one held here.
        self.creating.remove_if(key, |_, l| Arc::strong_count(l) <= 2);
        drop(lock);
    }
}

/// Everything a handler needs, built once at startup.
pub struct BridgeContext {
    pub config: Arc<Config>,
    pub servers: BTreeMap<String, Arc<ServerPolicy>>,
    pub store: Arc<IdentityStore>,
    pub remote: Arc<dyn RemoteClient>,
    pub tracker: RequestTracker,
    pub connections: ConnectionRegistry,
    pub deps: ConnectionDeps,
    /// Every connection forwards its IRC events here.
    pub local_events: mpsc::UnboundedSender<LocalEvent>,
}

impl BridgeContext {
    pub fn new(
        config: Arc<Config>,
        servers: Vec<Arc<ServerPolicy>>,
        store: Arc<IdentityStore>,
        remote: Arc<dyn RemoteClient>,
        deps: ConnectionDeps,
        metrics: Arc<dyn MetricsSink>,
        local_events: mpsc::UnboundedSender<LocalEvent>,
    ) -> Self {
        Self {
            config,
            servers: servers
                .into_iter()
                .map(|s| (s.domain().to_string(), s))
                .collect(),
            store,
            remote,
            tracker: RequestTracker::new(metrics),
            connections: ConnectionRegistry::default(),
            deps,
            local_events,
        }
    }

    pub fn server(&self, domain: &str) -> BridgeResult<&Arc<ServerPolicy>> {
        self.servers.get(domain).ok_or_else(|| BridgeError::UnknownServer {
            domain: domain.to_string(),
        })
    }

    /// The network whose virtual users include `user_id`.
    pub fn server_claiming_user(&self, user_id: &str) -> Option<&Arc<ServerPolicy>> {
        self.servers.values().find(|s| s.claims_user_id(user_id))
    }

    /// Whether `user_id` is one of the users the bridge itself puppets.
    pub fn is_bridge_user(&self, user_id: &str) -> bool {
        user_id == self.bot_user_id() || self.server_claiming_user(user_id).is_some()
    }

    pub fn bot_user_id(&self) -> String {
        self.remote.user_id(&self.config.appservice.localpart)
    }

    /// The IRC connection for a room-side user, connecting one if needed.
    ///
    /// Concurrent callers for the same user share one connection attempt.
    pub async fn client_for(
        &self,
        server: &Arc<ServerPolicy>,
        user_id: &str,
    ) -> BridgeResult<VirtualConnection> {
        let domain = server.domain();
        if let Some(conn) = self.connections.client(domain, user_id) {
            return Ok(conn);
        }

        let key = (domain.to_string(), user_id.to_string());
        let lock = self.connections.creation_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            match self.connections.client(domain, user_id) {
                Some(conn) => Ok(conn),
                None => self.create_client(server, user_id).await,
            }
        };
        self.connections.release_creation_lock(&key, lock);
        result
    }

    async fn create_client(
        &self,
        server: &Arc<ServerPolicy>,
        user_id: &str,
    ) -> BridgeResult<VirtualConnection> {
        let domain = server.domain();
        let identity = match self.store.users.local_identity(user_id, domain).await? {
            Some(identity) => identity,
            None => LocalIdentity::new(domain, server.nick_for(user_id, None)),
        };
        debug!("Creating IRC connection for {} as {}", user_id, identity);

        let conn = VirtualConnection::new(
            server.clone(),
            identity,
            Some(RemoteIdentity::new(user_id)),
            self.deps.clone(),
        );
        let notifications = conn.subscribe();
        conn.connect(self.local_events.clone()).await?;
        self.connections.insert_client(user_id, conn.clone());
        let count = self.connections.client_count(domain);
        if count > server.max_clients() {
            warn!("{} has {} clients, above max_clients {}", domain, count, server.max_clients());
        }
        self.spawn_client_watch(&conn, user_id, notifications);
        Ok(conn)
    }

    /// Drop a client from the registry once it disconnects.
    fn spawn_client_watch(
        &self,
        conn: &VirtualConnection,
        user_id: &str,
        mut notifications: broadcast::Receiver<ConnectionNotification>,
    ) {
        let domain = conn.domain().to_string();
        let conn_id = conn.id().to_string();
        let user_id = user_id.to_string();
        let registry = self.connections.clients.clone();
        tokio::spawn(
            async move {
                loop {
                    match notifications.recv().await {
                        Ok(ConnectionNotification::Disconnected { reason }) => {
                            info!("Client for {} gone: {}", user_id, reason);
                            // A reconnect may already have replaced this entry.
                            registry.remove_if(&(domain, user_id), |_, c| c.id() == conn_id);
                            break;
                        }
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            .in_current_span(),
        );
    }

    /// Make sure the virtual user standing in for `nick` exists on the
    /// homeserver, returning its user ID.
    pub async fn ensure_virtual_user(&self, server: &ServerPolicy, nick: &str) -> BridgeResult<String> {
        let user_id = server.user_id_for_nick(nick, &self.config.homeserver.domain);
        let identity =
            RemoteIdentity::new(user_id.clone()).with_display_name(server.display_name_for_nick(nick));

        if self
            .store
            .users
            .remote_identity(identity.localpart())
            .await?
            .is_none()
        {
            self.remote.register_user(identity.localpart()).await?;
            if let Some(display_name) = &identity.display_name {
                self.remote.set_display_name(&user_id, display_name).await?;
            }
            self.store.users.set_remote_identity(&identity).await?;
        }
        Ok(user_id)
    }
}
