//! Virtual IRC connections.
//!
//! A `VirtualConnection` is the bridge's presence on one network for one
//! identity: either a room-side user or the bridge bot. It owns the wire
//! handle, the channel join state machine, the idle timer and nick tracking.
//!
//! The handle is cheap to clone; all clones share one connection.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::common::error::{BridgeError, BridgeResult};
use crate::common::messages::{ActionKind, LocalAction, LocalEvent, LocalEventKind};
use crate::common::types::{is_channel_name, to_irc_lower, LocalIdentity, LocalRoom, RemoteIdentity};
use crate::irc::formatting::split_message;
use crate::irc::server::{ServerPolicy, SyncKind};
use crate::irc::wire::{
    ConnectOptions, IrcConnector, IrcWire, MessageKind, NameService, WhoisInfo, WireEvent,
    JOIN_FAIL_CODES, NICK_FAIL_CODES,
};

/// How long to wait for a JOIN to be confirmed before trying again.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(15);
/// Total JOINs sent for one channel before giving up.
pub const MAX_JOIN_ATTEMPTS: u32 = 5;
/// RFC 1459 nick length, used when the server does not advertise NICKLEN.
pub const DEFAULT_NICK_MAX_LEN: usize = 9;
/// How long to wait for the server to confirm a NICK.
pub const NICK_CHANGE_TIMEOUT: Duration = Duration::from_secs(15);
/// Text bytes per outgoing line, leaving room for the prefix and command.
const MAX_LINE_BYTES: usize = 400;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// Connecting failed or the wire dropped unexpectedly. Terminal.
    Dead,
}

/// Notifications published by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionNotification {
    Connected { nick: String },
    NickChanged { old: String, new: String },
    Disconnected { reason: String },
}

/// Collaborators every connection needs.
#[derive(Clone)]
pub struct ConnectionDeps {
    pub connector: Arc<dyn IrcConnector>,
    pub names: Arc<dyn NameService>,
}

type JoinOutcome = Option<BridgeResult<LocalRoom>>;

struct State {
    phase: ConnectionState,
    nick: String,
    /// Channels (lower-cased) this identity wants to be in.
    chan_list: HashSet<String>,
    wire: Option<Arc<dyn IrcWire>>,
    failure: Option<String>,
    last_action: Instant,
    idle_timer: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    explicit_disconnect: bool,
    pending_joins: HashMap<String, watch::Receiver<JoinOutcome>>,
}

struct Inner {
    id: String,
    policy: Arc<ServerPolicy>,
    identity: LocalIdentity,
    owner: Option<RemoteIdentity>,
    deps: ConnectionDeps,
    state: Mutex<State>,
    notify: broadcast::Sender<ConnectionNotification>,
    span: Span,
}

/// One identity's presence on one IRC network.
#[derive(Clone)]
pub struct VirtualConnection {
    inner: Arc<Inner>,
}

impl VirtualConnection {
    pub fn new(
        policy: Arc<ServerPolicy>,
        identity: LocalIdentity,
        owner: Option<RemoteIdentity>,
        deps: ConnectionDeps,
    ) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let span = info_span!(
            "conn",
            nick = %identity.nick,
            domain = %identity.domain,
            conn = %id,
        );
        let (notify, _) = broadcast::channel(32);

        Self {
            inner: Arc::new(Inner {
                id,
                state: Mutex::new(State {
                    phase: ConnectionState::Disconnected,
                    nick: identity.nick.clone(),
                    chan_list: HashSet::new(),
                    wire: None,
                    failure: None,
                    last_action: Instant::now(),
                    idle_timer: None,
                    pump: None,
                    explicit_disconnect: false,
                    pending_joins: HashMap::new(),
                }),
                policy,
                identity,
                owner,
                deps,
                notify,
                span,
            }),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn domain(&self) -> &str {
        self.inner.policy.domain()
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.inner.identity
    }

    /// The room-side user this connection stands in for; `None` for the bot.
    pub fn owner(&self) -> Option<&RemoteIdentity> {
        self.inner.owner.as_ref()
    }

    pub fn is_bot(&self) -> bool {
        self.inner.identity.is_bot
    }

    /// A bot on a network whose bot is turned off never touches the wire.
    pub fn is_disabled(&self) -> bool {
        self.is_bot() && !self.inner.policy.is_bot_enabled()
    }

    /// Current nick, which the server may have changed.
    pub fn nick(&self) -> String {
        self.inner.state.lock().nick.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().phase
    }

    pub fn is_dead(&self) -> bool {
        self.state() == ConnectionState::Dead
    }

    pub fn last_action(&self) -> Instant {
        self.inner.state.lock().last_action
    }

    /// Channels this identity wants to be in.
    pub fn chan_list(&self) -> Vec<String> {
        self.inner.state.lock().chan_list.iter().cloned().collect()
    }

    /// Attach before `connect` to see every notification.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionNotification> {
        self.inner.notify.subscribe()
    }

    fn publish(&self, notification: ConnectionNotification) {
        // No subscribers is fine.
        let _ = self.inner.notify.send(notification);
    }

    fn connection_failed(&self, reason: impl Into<String>) -> BridgeError {
        BridgeError::ConnectionFailed {
            domain: self.domain().to_string(),
            nick: self.nick(),
            reason: reason.into(),
        }
    }

    fn mark_dead(&self, reason: String) -> BridgeError {
        {
            let mut state = self.inner.state.lock();
            state.phase = ConnectionState::Dead;
            state.failure = Some(reason.clone());
        }
        self.connection_failed(reason)
    }

    /// The live wire, or `ConnectionFailed`.
    fn wire(&self) -> BridgeResult<Arc<dyn IrcWire>> {
        let (wire, phase, failure) = {
            let state = self.inner.state.lock();
            (state.wire.clone(), state.phase, state.failure.clone())
        };
        match (wire, phase) {
            (Some(wire), ConnectionState::Connected) => Ok(wire),
            (_, ConnectionState::Dead) => {
                Err(self.connection_failed(failure.unwrap_or_else(|| "dead".to_string())))
            }
            _ => Err(self.connection_failed("not connected")),
        }
    }

    fn current_wire(&self) -> Option<Arc<dyn IrcWire>> {
        let state = self.inner.state.lock();
        match state.phase {
            ConnectionState::Connected => state.wire.clone(),
            _ => None,
        }
    }

    // ========================================================================
    // Connect / disconnect
    // ========================================================================

    /// Open the wire and start forwarding inbound events to `events`.
    pub async fn connect(&self, events: mpsc::UnboundedSender<LocalEvent>) -> BridgeResult<()> {
        let failure = {
            let mut state = self.inner.state.lock();
            let phase = state.phase;
            match phase {
                ConnectionState::Dead => {
                    Some(state.failure.clone().unwrap_or_else(|| "dead".to_string()))
                }
                ConnectionState::Connected | ConnectionState::Connecting => return Ok(()),
                ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                    state.phase = ConnectionState::Connecting;
                    state.explicit_disconnect = false;
                    None
                }
            }
        };
        if let Some(reason) = failure {
            return Err(self.connection_failed(reason));
        }

        if self.is_disabled() {
            info!(domain = %self.domain(), "Bot is disabled; not connecting");
            self.inner.state.lock().phase = ConnectionState::Connected;
            return Ok(());
        }

        let names = match self
            .inner
            .deps
            .names
            .resolve(&self.inner.identity, self.inner.owner.as_ref())
            .await
        {
            Ok(names) => names,
            Err(e) => return Err(self.mark_dead(e.to_string())),
        };

        info!(
            conn = %self.id(),
            "Connecting to IRC server {} as {} (user={})",
            self.domain(),
            names.nick,
            names.username
        );

        let options = ConnectOptions {
            domain: self.domain().to_string(),
            port: self.inner.policy.port(),
            ssl: self.inner.policy.use_ssl(),
            nick: names.nick.clone(),
            username: names.username,
            realname: names.realname,
            password: self.inner.identity.password.clone(),
        };

        let wire = match self.inner.deps.connector.connect(options).await {
            Ok(wire) => wire,
            Err(e) => {
                warn!(conn = %self.id(), "Failed to connect: {}", e);
                return Err(self.mark_dead(e.to_string()));
            }
        };

        let wire_events = wire.subscribe();
        let nick = wire.current_nick();
        {
            let mut state = self.inner.state.lock();
            state.nick = nick.clone();
            state.wire = Some(wire);
            state.phase = ConnectionState::Connected;
        }

        debug!(conn = %self.id(), "Connected as {}", nick);
        self.publish(ConnectionNotification::Connected { nick: nick.clone() });
        if nick != names.nick {
            info!(
                conn = %self.id(),
                "REGISTERED: Nick changed from '{}' to '{}'.", names.nick, nick
            );
            self.publish(ConnectionNotification::NickChanged {
                old: names.nick,
                new: nick,
            });
        }

        self.keep_alive();

        let pump = tokio::spawn(
            run_pump(Arc::downgrade(&self.inner), wire_events, events)
                .instrument(self.inner.span.clone()),
        );
        self.inner.state.lock().pump = Some(pump);

        Ok(())
    }

    /// Quit the network. Safe to call on a connection that never connected.
    pub async fn disconnect(&self, reason: &str) -> BridgeResult<()> {
        let (wire, pump, idle_timer) = {
            let mut state = self.inner.state.lock();
            state.explicit_disconnect = true;
            if state.phase != ConnectionState::Connected {
                return Ok(());
            }
            state.phase = ConnectionState::Disconnecting;
            (state.wire.take(), state.pump.take(), state.idle_timer.take())
        };

        if let Some(timer) = idle_timer {
            timer.abort();
        }
        if let Some(wire) = wire {
            if let Err(e) = wire.quit(reason).await {
                warn!(conn = %self.id(), "Error when disconnecting: {}", e);
            }
        }
        if let Some(pump) = pump {
            pump.abort();
        }

        self.inner.state.lock().phase = ConnectionState::Disconnected;
        info!(conn = %self.id(), "Disconnected: {}", reason);
        self.publish(ConnectionNotification::Disconnected {
            reason: reason.to_string(),
        });
        Ok(())
    }

    // ========================================================================
    // Channels
    // ========================================================================

    /// Join `channel`, retrying until the server confirms.
    ///
    /// Concurrent calls for the same channel share one attempt.
    pub async fn join_channel(&self, channel: &str) -> BridgeResult<LocalRoom> {
        let room = LocalRoom::new(self.domain(), channel);
        if self.is_disabled() {
            return Ok(room);
        }

        let wire = self.wire()?;
        if wire.is_joined(channel) {
            return Ok(room);
        }
        if !room.is_channel() {
            return Ok(room);
        }
        if self.inner.policy.is_excluded_channel(channel) {
            return Err(BridgeError::ChannelExcluded {
                channel: channel.to_string(),
            });
        }

        let key = to_irc_lower(channel);
        let mut outcome = {
            let mut state = self.inner.state.lock();
            state.chan_list.insert(key.clone());
            match state.pending_joins.get(&key) {
                Some(pending) => {
                    debug!(conn = %self.id(), "Join of {} already pending", channel);
                    pending.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    state.pending_joins.insert(key.clone(), rx.clone());

                    let conn = self.clone();
                    let room = room.clone();
                    tokio::spawn(
                        async move {
                            let result = conn.run_join(wire, room).await;
                            tx.send_replace(Some(result));
                            conn.inner.state.lock().pending_joins.remove(&key);
                        }
                        .instrument(self.inner.span.clone()),
                    );
                    rx
                }
            }
        };

        loop {
            let current = outcome.borrow_and_update().clone();
            if let Some(result) = current {
                return result;
            }
            if outcome.changed().await.is_err() {
                return Err(self.connection_failed("join abandoned"));
            }
        }
    }

    fn wants_channel(&self, key: &str) -> bool {
        self.inner.state.lock().chan_list.contains(key)
    }

    async fn run_join(&self, wire: Arc<dyn IrcWire>, room: LocalRoom) -> BridgeResult<LocalRoom> {
        let key = to_irc_lower(&room.channel);
        let mut events = wire.subscribe();

        for attempt in 1..=MAX_JOIN_ATTEMPTS {
            if !self.wants_channel(&key) {
                debug!("No longer want {}; giving up", room.channel);
                return Err(BridgeError::JoinTimeout {
                    channel: room.channel.clone(),
                    attempts: attempt - 1,
                });
            }

            debug!(
                "Joining channel {} (attempt {}/{})",
                room.channel, attempt, MAX_JOIN_ATTEMPTS
            );
            wire.join(&room.channel).await?;

            match timeout(JOIN_TIMEOUT, self.wait_for_join(&mut events, &room.channel, &key)).await {
                Ok(Ok(())) => {
                    debug!("Joined channel {}", room.channel);
                    return Ok(room);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    if wire.is_joined(&room.channel) {
                        debug!(
                            "Timed out joining {} - didn't get confirmation but are now joined",
                            room.channel
                        );
                        return Ok(room);
                    }
                    if attempt < MAX_JOIN_ATTEMPTS {
                        warn!("Timed out trying to join {} - trying again", room.channel);
                    }
                }
            }
        }

        error!(
            "Failed to join {} after {} tries",
            room.channel, MAX_JOIN_ATTEMPTS
        );
        Err(BridgeError::JoinTimeout {
            channel: room.channel,
            attempts: MAX_JOIN_ATTEMPTS,
        })
    }

    async fn wait_for_join(
        &self,
        events: &mut broadcast::Receiver<WireEvent>,
        channel: &str,
        key: &str,
    ) -> BridgeResult<()> {
        loop {
            match events.recv().await {
                Ok(WireEvent::Joined { channel: c, nick }) => {
                    if to_irc_lower(&c) == key && nick == self.nick() {
                        return Ok(());
                    }
                }
                Ok(WireEvent::Error { command, args }) => {
                    if JOIN_FAIL_CODES.contains(&command.as_str())
                        && args.iter().any(|a| to_irc_lower(a) == key)
                    {
                        error!("Cannot track channel {}: {}", channel, command);
                        return Err(BridgeError::JoinRejected {
                            channel: channel.to_string(),
                            code: command,
                        });
                    }
                }
                Ok(WireEvent::Disconnected { reason }) => {
                    return Err(self.connection_failed(reason));
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Missed {} wire events while joining {}", n, channel);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(self.connection_failed("wire closed"));
                }
            }
        }
    }

    /// Part `channel`. No-op for PM targets and channels never joined.
    pub async fn leave_channel(&self, channel: &str) -> BridgeResult<()> {
        if self.is_disabled() {
            return Ok(());
        }
        self.inner.state.lock().chan_list.remove(&to_irc_lower(channel));

        let Some(wire) = self.current_wire() else {
            return Ok(());
        };
        if !wire.is_joined(channel) || !is_channel_name(channel) {
            return Ok(());
        }

        debug!(conn = %self.id(), "Leaving channel {}", channel);
        wire.part(channel, "User left").await
    }

    // ========================================================================
    // Actions
    // ========================================================================

    /// Send `action` to `room`, joining it first if needed.
    pub async fn send_action(&self, room: &LocalRoom, action: &LocalAction) -> BridgeResult<()> {
        if self.is_disabled() {
            return Ok(());
        }

        if matches!(action.kind, ActionKind::Image | ActionKind::File) {
            error!(conn = %self.id(), "Unknown action type: {}", action.kind);
            return Err(BridgeError::UnknownActionKind {
                kind: action.kind.to_string(),
            });
        }

        let wire = self.wire()?;
        self.keep_alive();
        self.join_channel(&room.channel).await?;

        if action.kind == ActionKind::Topic {
            info!(
                conn = %self.id(),
                "Setting topic to {} in channel {}", action.text, room.channel
            );
            return wire.topic(&room.channel, &action.text).await;
        }

        for line in split_message(&action.text, MAX_LINE_BYTES) {
            match action.kind {
                ActionKind::Emote => wire.action(&room.channel, &line).await?,
                ActionKind::Notice => wire.notice(&room.channel, &line).await?,
                _ => wire.say(&room.channel, &line).await?,
            }
        }
        Ok(())
    }

    /// Change this identity's nick; resolves to a message for the user.
    pub async fn change_nick(&self, new_nick: &str) -> BridgeResult<String> {
        let nick: String = new_nick
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || "[]^\\{}-`_".contains(*c))
            .collect();

        if !nick.starts_with(|c: char| c.is_ascii_alphabetic()) {
            return Err(BridgeError::InvalidNick {
                nick,
                reason: "must start with a letter.".to_string(),
            });
        }

        let wire = self.wire()?;
        let max_len = wire.nick_max_len().unwrap_or(DEFAULT_NICK_MAX_LEN);
        if nick.len() > max_len {
            return Err(BridgeError::InvalidNick {
                nick,
                reason: format!("is too long. (Max: {})", max_len),
            });
        }

        let current = self.nick();
        if nick == current {
            return Ok(format!("Your nick is already '{}'.", nick));
        }

        let mut events = wire.subscribe();
        wire.nick(&nick).await?;

        let confirmation = async {
            loop {
                match events.recv().await {
                    Ok(WireEvent::NickChanged { old, new }) if old == current => {
                        let message = format!("Nick changed from '{}' to '{}'.", old, new);
                        self.update_nick(new);
                        return Ok(message);
                    }
                    Ok(WireEvent::Error { command, .. })
                        if NICK_FAIL_CODES.contains(&command.as_str()) =>
                    {
                        return Err(BridgeError::InvalidNick {
                            nick: nick.clone(),
                            reason: format!("was rejected by the server ({}).", command),
                        });
                    }
                    Ok(WireEvent::Disconnected { reason }) => {
                        return Err(self.connection_failed(reason));
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(self.connection_failed("wire closed"));
                    }
                }
            }
        };

        match timeout(NICK_CHANGE_TIMEOUT, confirmation).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::InvalidNick {
                nick,
                reason: "was not confirmed by the server.".to_string(),
            }),
        }
    }

    pub async fn whois(&self, nick: &str) -> BridgeResult<WhoisInfo> {
        if self.is_disabled() {
            return Ok(WhoisInfo {
                nick: nick.to_string(),
                server: Some(self.domain().to_string()),
                ..WhoisInfo::default()
            });
        }

        let wire = self.wire()?;
        match wire.whois(nick).await? {
            Some(info) => Ok(info),
            None => Err(BridgeError::WhoisNotFound {
                nick: nick.to_string(),
            }),
        }
    }

    // ========================================================================
    // Idle timer
    // ========================================================================

    /// Record activity and restart the idle timer.
    pub fn keep_alive(&self) {
        let idle_timeout = self.inner.policy.idle_timeout();
        let mut state = self.inner.state.lock();
        state.last_action = Instant::now();

        let Some(idle_timeout) = idle_timeout else {
            return;
        };
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }

        let weak = Arc::downgrade(&self.inner);
        state.idle_timer = Some(tokio::spawn(
            async move {
                tokio::time::sleep(idle_timeout).await;
                if let Some(inner) = weak.upgrade() {
                    VirtualConnection { inner }.on_idle_timeout(idle_timeout).await;
                }
            }
            .instrument(self.inner.span.clone()),
        ));
    }

    async fn on_idle_timeout(&self, idle_timeout: Duration) {
        {
            let mut state = self.inner.state.lock();
            // Activity since the timer was armed re-armed a newer timer.
            if state.last_action.elapsed() < idle_timeout {
                return;
            }
            // Detach our own handle so disconnect() does not abort this task.
            drop(state.idle_timer.take());
        }
        info!(conn = %self.id(), "Idle timeout has expired");

        if self
            .inner
            .policy
            .should_sync_membership_to_irc(SyncKind::Initial, None)
        {
            info!(
                "Not disconnecting because {} is mirroring membership lists",
                self.domain()
            );
            return;
        }
        if self.is_bot() {
            info!("Not disconnecting because this is the bot");
            return;
        }

        let reason = format!("Idle timeout reached: {}s", idle_timeout.as_secs());
        if let Err(e) = self.disconnect(&reason).await {
            error!("Error when disconnecting: {}", e);
        }
    }

    // ========================================================================
    // Wire events
    // ========================================================================

    /// Returns false once the wire is gone.
    fn handle_wire_event(&self, event: WireEvent, events: &mpsc::UnboundedSender<LocalEvent>) -> bool {
        match event {
            WireEvent::Registered { nick } => self.update_nick(nick),
            WireEvent::NickChanged { old, new } => {
                if old == self.nick() {
                    self.update_nick(new);
                }
            }
            WireEvent::Joined { channel, nick } => {
                self.forward(events, LocalEventKind::Join { nick, channel });
            }
            WireEvent::Parted {
                channel,
                nick,
                reason,
            } => {
                self.forward(
                    events,
                    LocalEventKind::Part {
                        nick,
                        channel,
                        reason,
                    },
                );
            }
            WireEvent::Message {
                from,
                target,
                text,
                kind,
            } => {
                let kind = match kind {
                    MessageKind::Privmsg => ActionKind::Message,
                    MessageKind::Action => ActionKind::Emote,
                    MessageKind::Notice => ActionKind::Notice,
                    MessageKind::Topic => ActionKind::Topic,
                };
                self.forward(
                    events,
                    LocalEventKind::Message {
                        from,
                        target,
                        action: LocalAction::new(kind, text),
                    },
                );
            }
            WireEvent::Mode {
                channel,
                by,
                mode,
                arg,
            } => {
                self.forward(
                    events,
                    LocalEventKind::Mode {
                        channel,
                        by,
                        mode,
                        arg,
                    },
                );
            }
            WireEvent::Error { command, args } => {
                debug!("Error reply {} {:?}", command, args);
            }
            WireEvent::Disconnected { reason } => {
                self.on_wire_lost(reason);
                return false;
            }
        }
        true
    }

    fn update_nick(&self, new: String) {
        let old = {
            let mut state = self.inner.state.lock();
            if state.nick == new {
                return;
            }
            std::mem::replace(&mut state.nick, new.clone())
        };
        info!("NICK: Nick changed from '{}' to '{}'.", old, new);
        self.publish(ConnectionNotification::NickChanged { old, new });
    }

    fn forward(&self, events: &mpsc::UnboundedSender<LocalEvent>, kind: LocalEventKind) {
        let event = LocalEvent {
            domain: self.domain().to_string(),
            receiver: self.nick(),
            receiver_is_bot: self.is_bot(),
            kind,
        };
        if let Err(e) = events.send(event) {
            debug!("Event channel closed: {}", e);
        }
    }

    fn on_wire_lost(&self, reason: String) {
        {
            let mut state = self.inner.state.lock();
            if state.explicit_disconnect {
                return;
            }
            state.wire = None;
            state.phase = ConnectionState::Dead;
            state.failure = Some(reason.clone());
            if let Some(timer) = state.idle_timer.take() {
                timer.abort();
            }
        }
        warn!("Connection lost: {}", reason);
        self.publish(ConnectionNotification::Disconnected { reason });
    }
}

async fn run_pump(
    inner: Weak<Inner>,
    mut wire_events: broadcast::Receiver<WireEvent>,
    events: mpsc::UnboundedSender<LocalEvent>,
) {
    loop {
        let event = match wire_events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Wire event pump lagged by {} events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => WireEvent::Disconnected {
                reason: "wire closed".to_string(),
            },
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };
        if !(VirtualConnection { inner }).handle_wire_event(event, &events) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ServerConfig;
    use crate::irc::testing::{JoinBehaviour, MockConnector, MockWire, PlainNames};

    const DOMAIN: &str = "irc.example.org";

    fn make_policy(configure: impl FnOnce(&mut ServerConfig)) -> Arc<ServerPolicy> {
        let mut config = ServerConfig::default();
        config.dynamic_channels.exclude = vec!["#secret".to_string()];
        configure(&mut config);
        Arc::new(ServerPolicy::new(DOMAIN, config))
    }

    fn make_conn(
        policy: Arc<ServerPolicy>,
        identity: LocalIdentity,
        connector: Arc<MockConnector>,
    ) -> VirtualConnection {
        VirtualConnection::new(
            policy,
            identity,
            Some(RemoteIdentity::new("@alice:hs")),
            ConnectionDeps {
                connector,
                names: Arc::new(PlainNames),
            },
        )
    }

    async fn connected(
        configure: impl FnOnce(&mut ServerConfig),
        behaviour: JoinBehaviour,
    ) -> (VirtualConnection, Arc<MockWire>, mpsc::UnboundedReceiver<LocalEvent>) {
        let connector = MockConnector::new();
        *connector.join_behaviour.lock() = Some(behaviour);
        let conn = make_conn(
            make_policy(configure),
            LocalIdentity::new(DOMAIN, "M-alice"),
            connector.clone(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        conn.connect(tx).await.unwrap();
        let wire = connector.wire_for("M-alice").unwrap();
        (conn, wire, rx)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_publishes_connected() {
        let connector = MockConnector::new();
        let conn = make_conn(
            make_policy(|_| {}),
            LocalIdentity::new(DOMAIN, "M-alice"),
            connector,
        );
        let mut notifications = conn.subscribe();
        let (tx, _rx) = mpsc::unbounded_channel();

        conn.connect(tx).await.unwrap();

        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(
            notifications.recv().await.unwrap(),
            ConnectionNotification::Connected {
                nick: "M-alice".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_is_dead() {
        let conn = make_conn(
            make_policy(|_| {}),
            LocalIdentity::new(DOMAIN, "M-alice"),
            MockConnector::failing(),
        );
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = conn.connect(tx.clone()).await;
        assert!(matches!(result, Err(BridgeError::ConnectionFailed { .. })));
        assert!(conn.is_dead());

        // No silent retry.
        assert!(matches!(
            conn.connect(tx).await,
            Err(BridgeError::ConnectionFailed { .. })
        ));
        assert!(matches!(
            conn.join_channel("#rust").await,
            Err(BridgeError::ConnectionFailed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_excluded_channel() {
        let (conn, wire, _rx) = connected(|_| {}, JoinBehaviour::Confirm).await;

        let result = conn.join_channel("#secret").await;

        assert_eq!(
            result,
            Err(BridgeError::ChannelExcluded {
                channel: "#secret".to_string()
            })
        );
        assert_eq!(wire.join_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_confirmed_then_idempotent() {
        let (conn, wire, _rx) = connected(|_| {}, JoinBehaviour::Confirm).await;

        let room = conn.join_channel("#rust").await.unwrap();
        assert_eq!(room, LocalRoom::new(DOMAIN, "#rust"));
        conn.join_channel("#Rust").await.unwrap();

        assert_eq!(wire.join_calls(), 1);
        assert_eq!(conn.chan_list(), vec!["#rust".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_pm_target_resolves_immediately() {
        let (conn, wire, _rx) = connected(|_| {}, JoinBehaviour::Silent).await;

        conn.join_channel("bob").await.unwrap();
        assert_eq!(wire.join_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_out_of_band_before_last_attempt() {
        let (conn, wire, _rx) = connected(|_| {}, JoinBehaviour::OutOfBandAfter(3)).await;

        let room = conn.join_channel("#rust").await.unwrap();

        assert_eq!(room.channel, "#rust");
        assert_eq!(wire.join_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_times_out_after_five_attempts() {
        let (conn, wire, _rx) = connected(|_| {}, JoinBehaviour::Silent).await;
        let started = Instant::now();

        let result = conn.join_channel("#rust").await;

        assert_eq!(
            result,
            Err(BridgeError::JoinTimeout {
                channel: "#rust".to_string(),
                attempts: 5
            })
        );
        assert_eq!(wire.join_calls(), 5);
        assert!(started.elapsed() >= JOIN_TIMEOUT * 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_rejection_short_circuits() {
        let (conn, wire, _rx) = connected(
            |_| {},
            JoinBehaviour::Reject("err_inviteonlychan".to_string()),
        )
        .await;

        let result = conn.join_channel("#private").await;

        assert_eq!(
            result,
            Err(BridgeError::JoinRejected {
                channel: "#private".to_string(),
                code: "err_inviteonlychan".to_string()
            })
        );
        assert_eq!(wire.join_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_joins_share_one_attempt() {
        let (conn, wire, _rx) = connected(|_| {}, JoinBehaviour::OutOfBandAfter(2)).await;

        let (a, b) = tokio::join!(conn.join_channel("#rust"), conn.join_channel("#rust"));

        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(wire.join_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_pending_until_confirmed() {
        let (conn, wire, _rx) = connected(|_| {}, JoinBehaviour::Silent).await;

        let mut join = tokio_test::task::spawn(conn.join_channel("#rust"));
        tokio_test::assert_pending!(join.poll());
        settle().await;
        assert_eq!(wire.join_calls(), 1);
        tokio_test::assert_pending!(join.poll());

        wire.emit(WireEvent::Joined {
            channel: "#rust".to_string(),
            nick: "M-alice".to_string(),
        });
        settle().await;
        tokio_test::assert_ready_ok!(join.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_stops_pending_retries() {
        let (conn, wire, _rx) = connected(|_| {}, JoinBehaviour::Silent).await;

        let joiner = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.join_channel("#rust").await })
        };
        settle().await;
        conn.leave_channel("#rust").await.unwrap();

        let result = joiner.await.unwrap();
        assert!(matches!(result, Err(BridgeError::JoinTimeout { attempts: 1, .. })));
        assert_eq!(wire.join_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_channel() {
        let (conn, wire, _rx) = connected(|_| {}, JoinBehaviour::Confirm).await;

        conn.leave_channel("#rust").await.unwrap();
        assert!(wire.sent().iter().all(|l| !l.starts_with("PART")));

        conn.join_channel("#rust").await.unwrap();
        conn.leave_channel("#rust").await.unwrap();
        assert!(wire.sent().contains(&"PART #rust :User left".to_string()));
        assert!(conn.chan_list().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_action_joins_first() {
        let (conn, wire, _rx) = connected(|_| {}, JoinBehaviour::Confirm).await;
        let room = LocalRoom::new(DOMAIN, "#rust");

        conn.send_action(&room, &LocalAction::new(ActionKind::Message, "hello"))
            .await
            .unwrap();
        conn.send_action(&room, &LocalAction::new(ActionKind::Emote, "waves"))
            .await
            .unwrap();

        assert_eq!(
            wire.sent(),
            vec![
                "JOIN #rust".to_string(),
                "PRIVMSG #rust :hello".to_string(),
                "PRIVMSG #rust :\x01ACTION waves\x01".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_action_rejects_media() {
        let (conn, wire, _rx) = connected(|_| {}, JoinBehaviour::Confirm).await;
        let room = LocalRoom::new(DOMAIN, "#rust");

        let result = conn
            .send_action(&room, &LocalAction::new(ActionKind::Image, "x"))
            .await;

        assert!(matches!(result, Err(BridgeError::UnknownActionKind { .. })));
        assert!(wire.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_nick_validation() {
        let (conn, wire, _rx) = connected(|_| {}, JoinBehaviour::Confirm).await;

        assert!(matches!(
            conn.change_nick("1abc").await,
            Err(BridgeError::InvalidNick { .. })
        ));
        assert!(matches!(
            conn.change_nick("abcdefghij").await,
            Err(BridgeError::InvalidNick { .. })
        ));

        wire.state.lock().nick_max_len = Some(20);
        assert_eq!(
            conn.change_nick("M-alice").await.unwrap(),
            "Your nick is already 'M-alice'."
        );
        assert_eq!(wire.state.lock().nick_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_nick_confirmed() {
        let (conn, wire, _rx) = connected(|_| {}, JoinBehaviour::Confirm).await;
        let mut notifications = conn.subscribe();

        let message = conn.change_nick("al!ice").await.unwrap();

        // Local state follows the confirmation before the pump sees it.
        assert_eq!(conn.nick(), "alice");
        assert_eq!(message, "Nick changed from 'M-alice' to 'alice'.");
        assert_eq!(wire.state.lock().nick_calls, 1);
        assert_eq!(
            notifications.recv().await.unwrap(),
            ConnectionNotification::NickChanged {
                old: "M-alice".to_string(),
                new: "alice".to_string()
            }
        );
        assert_eq!(conn.nick(), "alice");
    }

    #[tokio::test(start_paused = true)]
    async fn test_whois() {
        let (conn, wire, _rx) = connected(|_| {}, JoinBehaviour::Confirm).await;
        wire.state.lock().whois.insert(
            "bob".to_string(),
            WhoisInfo {
                nick: "bob".to_string(),
                user: Some("bob".to_string()),
                ..WhoisInfo::default()
            },
        );

        assert_eq!(conn.whois("bob").await.unwrap().nick, "bob");
        assert_eq!(
            conn.whois("nobody").await,
            Err(BridgeError::WhoisNotFound {
                nick: "nobody".to_string()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_bot_short_circuits() {
        let connector = MockConnector::new();
        let policy = make_policy(|c| c.bot_config.enabled = false);
        let conn = VirtualConnection::new(
            policy.clone(),
            policy.bot_identity(),
            None,
            ConnectionDeps {
                connector: connector.clone(),
                names: Arc::new(PlainNames),
            },
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        conn.connect(tx).await.unwrap();

        assert!(conn.is_disabled());
        conn.join_channel("#rust").await.unwrap();
        conn.send_action(
            &LocalRoom::new(DOMAIN, "#rust"),
            &LocalAction::new(ActionKind::Message, "hi"),
        )
        .await
        .unwrap();
        let whois = conn.whois("bob").await.unwrap();
        assert_eq!(whois.server.as_deref(), Some(DOMAIN));
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_disconnects() {
        let (conn, wire, _rx) = connected(|c| c.irc_clients.idle_timeout = 10, JoinBehaviour::Confirm).await;
        let mut notifications = conn.subscribe();

        tokio::time::sleep(Duration::from_secs(6)).await;
        conn.keep_alive();
        tokio::time::sleep(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(conn.state(), ConnectionState::Connected);

        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(wire
            .sent()
            .contains(&"QUIT :Idle timeout reached: 10s".to_string()));
        assert_eq!(
            notifications.recv().await.unwrap(),
            ConnectionNotification::Disconnected {
                reason: "Idle timeout reached: 10s".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_idle_timer_keeps_recent_activity() {
        let (conn, _wire, _rx) = connected(|c| c.irc_clients.idle_timeout = 10, JoinBehaviour::Confirm).await;

        tokio::time::sleep(Duration::from_secs(4)).await;
        conn.keep_alive();
        // A timer that fired just before the keep-alive still runs its handler.
        conn.on_idle_timeout(Duration::from_secs(10)).await;

        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(conn.inner.state.lock().idle_timer.is_some());

        tokio::time::sleep(Duration::from_secs(11)).await;
        settle().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_on_dead_connection_arms_no_idle_timer() {
        let connector = MockConnector::failing();
        let conn = make_conn(
            make_policy(|c| c.irc_clients.idle_timeout = 10),
            LocalIdentity::new(DOMAIN, "M-alice"),
            connector,
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(conn.connect(tx).await.is_err());

        let result = conn
            .send_action(
                &LocalRoom::new(DOMAIN, "#rust"),
                &LocalAction::new(ActionKind::Message, "hi"),
            )
            .await;

        assert!(matches!(result, Err(BridgeError::ConnectionFailed { .. })));
        assert!(conn.inner.state.lock().idle_timer.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_exempts_bot() {
        let connector = MockConnector::new();
        let policy = make_policy(|c| c.irc_clients.idle_timeout = 10);
        let conn = make_conn(policy.clone(), policy.bot_identity(), connector);
        let (tx, _rx) = mpsc::unbounded_channel();
        conn.connect(tx).await.unwrap();

        tokio::time::sleep(Duration::from_secs(20)).await;
        settle().await;

        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_exempt_when_mirroring_initial() {
        let (conn, _wire, _rx) = connected(
            |c| {
                c.irc_clients.idle_timeout = 10;
                c.membership_lists.enabled = true;
                c.membership_lists.global.matrix_to_irc.initial = true;
            },
            JoinBehaviour::Confirm,
        )
        .await;

        tokio::time::sleep(Duration::from_secs(20)).await;
        settle().await;

        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_forwards_and_tracks_nick() {
        let (conn, wire, mut rx) = connected(|_| {}, JoinBehaviour::Confirm).await;

        wire.emit(WireEvent::Message {
            from: "bob".to_string(),
            target: "#rust".to_string(),
            text: "hi".to_string(),
            kind: MessageKind::Privmsg,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.domain, DOMAIN);
        assert_eq!(
            event.kind,
            LocalEventKind::Message {
                from: "bob".to_string(),
                target: "#rust".to_string(),
                action: LocalAction::new(ActionKind::Message, "hi"),
            }
        );

        wire.emit(WireEvent::NickChanged {
            old: "M-alice".to_string(),
            new: "M-alice_".to_string(),
        });
        settle().await;
        assert_eq!(conn.nick(), "M-alice_");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_disconnect_is_dead() {
        let (conn, wire, _rx) = connected(|_| {}, JoinBehaviour::Confirm).await;
        let mut notifications = conn.subscribe();

        wire.emit(WireEvent::Disconnected {
            reason: "ping timeout".to_string(),
        });
        settle().await;

        assert!(conn.is_dead());
        assert_eq!(
            notifications.recv().await.unwrap(),
            ConnectionNotification::Disconnected {
                reason: "ping timeout".to_string()
            }
        );
    }
}
