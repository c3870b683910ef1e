//! Bridge orchestrator.
//!
//! Runs the startup sequence, owns the event loop that fans inbound events
//! out to the handlers, supervises the bot connections and tears everything
//! down on shutdown.

use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn, Instrument};

use crate::bridge::channels::BridgeChannels;
use crate::bridge::local_events::handle_local_event;
use crate::bridge::registration::{check_hs_token, create_hs_token, Registration};
use crate::bridge::remote_events::{handle_remote_event, on_alias_query, on_user_query};
use crate::bridge::requests::Disposition;
use crate::bridge::state::BridgeContext;
use crate::common::error::{BridgeError, BridgeResult};
use crate::common::messages::{LocalEvent, RemoteEvent};
use crate::common::types::{LocalRoom, RequestOrigin};
use crate::config::types::Config;
use crate::irc::client::{ConnectionNotification, VirtualConnection};
use crate::irc::server::{ServerPolicy, SyncKind};
use crate::matrix::listener::ListenerMessage;
use crate::store::{BridgeConfigRecord, IdentityStore};

/// How long connections get to say goodbye on shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// One policy per configured network.
pub fn build_servers(config: &Config) -> Vec<Arc<ServerPolicy>> {
    config
        .servers
        .iter()
        .map(|(domain, server)| Arc::new(ServerPolicy::new(domain.clone(), server.clone())))
        .collect()
}

/// Replace the configured channel links with the current configuration.
pub async fn prepare_store(store: &IdentityStore, servers: &[Arc<ServerPolicy>]) -> BridgeResult<()> {
    store.rooms.remove_config_links().await?;
    for server in servers {
        let seeded = store.rooms.seed_config_links(server).await?;
        info!("Seeded {} mappings for {}", seeded, server.domain());
    }
    Ok(())
}

/// Mint a new homeserver token, store it and build the registration that
/// carries it.
pub async fn generate_registration(
    config: &Config,
    store: &IdentityStore,
    servers: &[Arc<ServerPolicy>],
) -> BridgeResult<Registration> {
    let hs_token = create_hs_token(config)?;
    store
        .config
        .set(&BridgeConfigRecord {
            hs_token: hs_token.clone(),
        })
        .await?;

    let config_rooms = store.rooms.config_room_ids().await?;
    let mut registration = Registration::new(config, hs_token);
    registration.add_patterns(&config_rooms, servers.iter().map(|s| s.as_ref()));
    Ok(registration)
}

/// Refuse to start without a registration, with a drifted configuration or
/// with nothing to bridge. Returns the homeserver token.
pub async fn check_startup(
    config: &Config,
    store: &IdentityStore,
    servers: &[Arc<ServerPolicy>],
    skip_crc_check: bool,
) -> BridgeResult<String> {
    let record = store
        .config
        .get()
        .await?
        .ok_or(BridgeError::MissingRegistration)?;

    if skip_crc_check {
        warn!("Skipping the configuration checksum check");
    } else {
        check_hs_token(&record.hs_token, config)?;
    }

    if servers.is_empty() {
        return Err(BridgeError::NoServers);
    }
    Ok(record.hs_token)
}

fn bot_backoff() -> impl Iterator<Item = Duration> {
    backon::ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(5))
        .with_max_delay(Duration::from_secs(300))
        .with_factor(1.1)
        .with_jitter()
        .without_max_times()
        .build()
}

/// The running bridge.
#[derive(Clone)]
pub struct Bridge {
    ctx: Arc<BridgeContext>,
}

impl Bridge {
    pub fn new(ctx: Arc<BridgeContext>) -> Self {
        Self { ctx }
    }

    /// Join the mapped rooms, bring up the bots and sync membership.
    pub async fn start(&self, shutdown_rx: watch::Receiver<bool>) -> BridgeResult<()> {
        info!("Joining mapped rooms...");
        for server in self.ctx.servers.values() {
            for (_, room_id) in server.mappings() {
                self.ctx.remote.join_room(None, room_id).await?;
            }
        }

        info!("Connecting to IRC networks...");
        for server in self.ctx.servers.values() {
            let (connected_tx, connected_rx) = tokio::sync::oneshot::channel();
            tokio::spawn(
                supervise_bot(
                    self.ctx.clone(),
                    server.clone(),
                    shutdown_rx.clone(),
                    Some(connected_tx),
                )
                .instrument(tracing::info_span!("bot", domain = %server.domain())),
            );
            // A first failure is handed to the supervisor's backoff.
            if connected_rx.await.is_err() {
                warn!("Bot for {} is not connected yet", server.domain());
            }
        }

        info!("Syncing relevant membership lists...");
        for server in self.ctx.servers.values() {
            if let Err(e) = self.sync_initial_membership(server).await {
                error!("Membership sync for {} failed: {}", server.domain(), e);
            }
        }
        Ok(())
    }

    /// Mirror the current room membership onto IRC where the policy asks for
    /// an initial sync.
    pub async fn sync_initial_membership(&self, server: &Arc<ServerPolicy>) -> BridgeResult<()> {
        if !server.is_membership_lists_enabled() {
            return Ok(());
        }

        for channel in self.ctx.store.rooms.tracked_channels(server.domain()).await? {
            if server.should_sync_membership_to_remote(SyncKind::Initial, Some(&channel)) {
                // IRC names are only learned as users speak, join or part.
                debug!("No name list for {}, IRC side will sync incrementally", channel);
            }

            let local = LocalRoom::new(server.domain(), channel.clone());
            for room in self.ctx.store.rooms.linked_remote_rooms(&local).await? {
                if !server.should_sync_membership_to_irc(SyncKind::Initial, Some(&room.room_id)) {
                    continue;
                }
                let members = self.ctx.remote.joined_members(&room.room_id).await?;
                for user_id in members.iter().filter(|u| !self.ctx.is_bridge_user(u)) {
                    let joined = async {
                        let conn = self.ctx.client_for(server, user_id).await?;
                        conn.join_channel(&channel).await?;
                        Ok::<_, BridgeError>(())
                    }
                    .await;
                    if let Err(e) = joined {
                        warn!("Could not join {} to {}: {}", user_id, channel, e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Dispatch inbound events until shutdown, then disconnect everything.
    pub async fn run(self, mut channels: BridgeChannels) {
        loop {
            tokio::select! {
                biased;
                changed = channels.shutdown_rx.changed() => {
                    if changed.is_err() || *channels.shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping event loop");
                        break;
                    }
                }
                Some(message) = channels.listener_rx.recv() => self.dispatch_listener(message),
                Some(event) = channels.local_rx.recv() => self.dispatch_local(event),
                else => break,
            }
        }
        self.shutdown().await;
    }

    fn dispatch_listener(&self, message: ListenerMessage) {
        match message {
            ListenerMessage::Event(event) => self.dispatch_remote(event),
            ListenerMessage::AliasQuery { alias, reply } => {
                let ctx = self.ctx.clone();
                let request = ctx.tracker.new_request(RequestOrigin::Remote);
                let span = request.span().clone();
                tokio::spawn(
                    async move {
                        debug!("Alias query for {}", alias);
                        let result = on_alias_query(&ctx, &alias).await;
                        let _ = reply.send(matches!(result, Ok(true)));
                        request.complete(result.map(|_| Disposition::Done));
                    }
                    .instrument(span),
                );
            }
            ListenerMessage::UserQuery { user_id, reply } => {
                let ctx = self.ctx.clone();
                let request = ctx.tracker.new_request(RequestOrigin::Remote);
                let span = request.span().clone();
                tokio::spawn(
                    async move {
                        debug!("User query for {}", user_id);
                        let result = on_user_query(&ctx, &user_id).await;
                        let _ = reply.send(matches!(result, Ok(true)));
                        request.complete(result.map(|_| Disposition::Done));
                    }
                    .instrument(span),
                );
            }
        }
    }

    fn dispatch_remote(&self, event: RemoteEvent) {
        let ctx = self.ctx.clone();
        let request = ctx.tracker.new_request(RequestOrigin::Remote);
        let span = request.span().clone();
        tokio::spawn(
            async move {
                debug!(
                    event_type = %event.event_type,
                    room_id = %event.room_id,
                    sender = %event.sender,
                    "Received event"
                );
                let result = handle_remote_event(&ctx, &event).await;
                request.complete(result);
            }
            .instrument(span),
        );
    }

    fn dispatch_local(&self, event: LocalEvent) {
        let ctx = self.ctx.clone();
        let request = ctx.tracker.new_request(RequestOrigin::Local);
        let span = request.span().clone();
        tokio::spawn(
            async move {
                debug!(domain = %event.domain, receiver = %event.receiver, "Received {:?}", event.kind);
                let result = handle_local_event(&ctx, &event).await;
                request.complete(result);
            }
            .instrument(span),
        );
    }

    /// Disconnect every connection, giving up after [`SHUTDOWN_TIMEOUT`].
    pub async fn shutdown(&self) {
        let connections = self.ctx.connections.all();
        info!("Disconnecting {} IRC connections", connections.len());
        let quits = futures::future::join_all(
            connections
                .iter()
                .map(|conn| conn.disconnect("Bridge shutting down")),
        );
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, quits).await {
            Ok(results) => {
                for e in results.into_iter().filter_map(Result::err) {
                    debug!("Disconnect failed: {}", e);
                }
            }
            Err(_) => warn!("Timed out disconnecting from IRC"),
        }
    }
}

/// Keep a network's bot connected, reconnecting with backoff when it drops.
///
/// `connected` fires after the first attempt, whatever its outcome.
async fn supervise_bot(
    ctx: Arc<BridgeContext>,
    server: Arc<ServerPolicy>,
    mut shutdown_rx: watch::Receiver<bool>,
    mut connected: Option<tokio::sync::oneshot::Sender<()>>,
) {
    let mut backoff = bot_backoff();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let conn = VirtualConnection::new(server.clone(), server.bot_identity(), None, ctx.deps.clone());
        let mut notifications = conn.subscribe();
        let result = connect_bot(&ctx, &conn).await;
        if let Some(tx) = connected.take() {
            let _ = tx.send(());
        }

        match result {
            Ok(()) => {
                backoff = bot_backoff();
                if !wait_for_drop(&conn, &mut notifications, &mut shutdown_rx).await {
                    break;
                }
                warn!("Bot connection to {} dropped", server.domain());
            }
            Err(e) => error!("Bot failed to connect to {}: {}", server.domain(), e),
        }

        let delay = backoff.next().unwrap_or(Duration::from_secs(300));
        info!("Reconnecting bot in {:.1} seconds...", delay.as_secs_f64());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {},
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received during backoff");
                    break;
                }
            }
        }
    }
}

/// Connect the bot and put it in every channel that has a link.
async fn connect_bot(ctx: &BridgeContext, conn: &VirtualConnection) -> BridgeResult<()> {
    conn.connect(ctx.local_events.clone()).await?;
    ctx.connections.set_bot(conn.clone());

    let server = ctx.server(conn.domain())?;
    if !server.should_join_channels_if_no_users() {
        return Ok(());
    }
    for channel in ctx.store.rooms.tracked_channels(conn.domain()).await? {
        if let Err(e) = conn.join_channel(&channel).await {
            warn!("Bot could not join {}: {}", channel, e);
        }
    }
    Ok(())
}

/// Wait until the connection goes away. Returns `true` if it died on its
/// own, `false` on shutdown or a deliberate disconnect.
async fn wait_for_drop(
    conn: &VirtualConnection,
    notifications: &mut broadcast::Receiver<ConnectionNotification>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        tokio::select! {
            notification = notifications.recv() => match notification {
                Ok(ConnectionNotification::Disconnected { reason }) => {
                    debug!("Bot disconnected: {}", reason);
                    return conn.is_dead();
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return conn.is_dead(),
            },
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::channels::ChannelBundle;
    use crate::bridge::testing::{config, harness, policies, settle, ALICE, DOMAIN, MAPPED_ROOM};
    use crate::common::metrics::RequestOutcome;
    use crate::common::types::{LinkData, RemoteRoom};
    use crate::irc::wire::WireEvent;
    use crate::matrix::testing::RemoteCall;

    #[tokio::test]
    async fn test_prepare_store_replaces_config_links() {
        let config = config("");
        let servers = policies(&config);
        let store = IdentityStore::in_memory();
        store
            .rooms
            .link_rooms(
                &RemoteRoom::new("!stale:hs"),
                &LocalRoom::new(DOMAIN, "#old"),
                LinkData::Channel { from_config: true },
            )
            .await
            .unwrap();

        prepare_store(&store, &servers).await.unwrap();
        assert_eq!(store.rooms.config_room_ids().await.unwrap(), vec![MAPPED_ROOM]);
    }

    #[tokio::test]
    async fn test_startup_requires_registration() {
        let config = config("");
        let servers = policies(&config);
        let store = IdentityStore::in_memory();
        assert!(matches!(
            check_startup(&config, &store, &servers, false).await,
            Err(BridgeError::MissingRegistration)
        ));
    }

    #[tokio::test]
    async fn test_generated_registration_passes_startup() {
        let config = config("");
        let servers = policies(&config);
        let store = IdentityStore::in_memory();
        prepare_store(&store, &servers).await.unwrap();

        let registration = generate_registration(&config, &store, &servers).await.unwrap();
        assert_eq!(registration.namespaces.rooms.len(), 1);
        let token = check_startup(&config, &store, &servers, false).await.unwrap();
        assert_eq!(token, registration.hs_token);
    }

    #[tokio::test]
    async fn test_drift_fails_unless_skipped() {
        let config = config("");
        let servers = policies(&config);
        let store = IdentityStore::in_memory();
        store
            .config
            .set(&BridgeConfigRecord {
                hs_token: "abc_crcdeadbeef".to_string(),
            })
            .await
            .unwrap();

        assert!(matches!(
            check_startup(&config, &store, &servers, false).await,
            Err(BridgeError::ConfigDrift { .. })
        ));
        assert!(check_startup(&config, &store, &servers, true).await.is_ok());
    }

    #[tokio::test]
    async fn test_startup_requires_a_network() {
        let config = config("");
        let store = IdentityStore::in_memory();
        store
            .config
            .set(&BridgeConfigRecord {
                hs_token: "legacy".to_string(),
            })
            .await
            .unwrap();
        assert!(matches!(
            check_startup(&config, &store, &[], false).await,
            Err(BridgeError::NoServers)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_connects_bot_and_joins_channels() {
        let h = harness("").await;
        let bridge = Bridge::new(h.ctx.clone());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        bridge.start(shutdown_rx).await.unwrap();

        assert!(h.remote.calls().contains(&RemoteCall::Join {
            as_user: None,
            room: MAPPED_ROOM.to_string(),
        }));
        let bot = h.connector.wire_for("appservicebot").unwrap();
        assert!(bot.sent().contains(&"JOIN #rust".to_string()));
        assert!(h.ctx.connections.bot(DOMAIN).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_membership_sync_joins_members() {
        let h = harness(
            "membership_lists { enabled = true, global { matrix_to_irc { initial = true } } }",
        )
        .await;
        *h.remote.members.lock() = vec![ALICE.to_string(), h.ctx.bot_user_id()];
        let bridge = Bridge::new(h.ctx.clone());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        bridge.start(shutdown_rx).await.unwrap();

        let alice = h.connector.wire_for("M-alice").unwrap();
        assert!(alice.sent().contains(&"JOIN #rust".to_string()));
        // The bridge bot user gets no client of its own.
        assert_eq!(h.connector.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_bot_reconnects() {
        let h = harness("").await;
        let bridge = Bridge::new(h.ctx.clone());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        bridge.start(shutdown_rx).await.unwrap();
        assert_eq!(h.connector.connect_count(), 1);

        let wire = h.connector.wire_for("appservicebot").unwrap();
        wire.emit(WireEvent::Disconnected {
            reason: "ping timeout".to_string(),
        });
        settle().await;

        tokio::time::sleep(Duration::from_secs(20)).await;
        settle().await;
        assert_eq!(h.connector.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_dispatches_and_shuts_down() {
        let h = harness("").await;
        let bundle = ChannelBundle::new();
        let listener_tx = bundle.producers.listener_tx.clone();
        let shutdown_tx = bundle.control.shutdown_tx;

        let bridge = Bridge::new(h.ctx.clone());
        let task = tokio::spawn(bridge.clone().run(bundle.bridge));

        let event: RemoteEvent = serde_json::from_value(serde_json::json!({
            "type": "m.room.message",
            "room_id": MAPPED_ROOM,
            "sender": ALICE,
            "content": { "msgtype": "m.text", "body": "through the loop" }
        }))
        .unwrap();
        listener_tx.send(ListenerMessage::Event(event)).unwrap();

        let (reply, answer) = tokio::sync::oneshot::channel();
        listener_tx
            .send(ListenerMessage::UserQuery {
                user_id: "@irc.example.org_bob:hs.example.org".to_string(),
                reply,
            })
            .unwrap();
        assert!(answer.await.unwrap());

        settle().await;
        let alice = h.connector.wire_for("M-alice").unwrap();
        assert!(alice
            .sent()
            .contains(&"PRIVMSG #rust :through the loop".to_string()));
        assert_eq!(h.metrics.count(RequestOutcome::Success), 2);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        assert!(alice.sent().iter().any(|l| l.starts_with("QUIT")));
        assert_eq!(h.ctx.tracker.outstanding(), 0);
    }
}
