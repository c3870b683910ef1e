//! TCP/TLS implementation of the IRC wire.
//!
//! `TcpConnector` opens a socket, registers, then splits the framed stream
//! into a writer task fed by an mpsc channel and a reader task that tracks
//! joined channels, nick, ISUPPORT and WHOIS replies and publishes
//! `WireEvent`s.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::common::error::{BridgeError, BridgeResult};
use crate::common::types::{is_channel_name, to_irc_lower};
use crate::irc::codec::{IrcCodec, IrcMessage};
use crate::irc::wire::{ConnectOptions, IrcConnector, IrcWire, MessageKind, WhoisInfo, WireEvent};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(60);
const WHOIS_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_NICK_RETRIES: usize = 5;

trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

type IrcFramed = Framed<Box<dyn IoStream>, IrcCodec>;

/// Lower-case mnemonic for the error numerics the bridge reacts to.
fn error_mnemonic(numeric: &str) -> Option<&'static str> {
    Some(match numeric {
        "401" => "err_nosuchnick",
        "403" => "err_nosuchchannel",
        "405" => "err_toomanychannels",
        "431" => "err_nonicknamegiven",
        "432" => "err_erroneusnickname",
        "433" => "err_nicknameinuse",
        "436" => "err_nickcollision",
        "471" => "err_channelisfull",
        "473" => "err_inviteonlychan",
        "474" => "err_bannedfromchan",
        "475" => "err_badchannelkey",
        "482" => "err_chanoprivsneeded",
        _ => return None,
    })
}

// ============================================================================
// Shared wire state
// ============================================================================

#[derive(Debug, Default)]
struct PendingWhois {
    info: WhoisInfo,
    found: bool,
    waiters: Vec<oneshot::Sender<Option<WhoisInfo>>>,
}

#[derive(Debug, Default)]
struct WireShared {
    nick: String,
    chans: HashSet<String>,
    nick_max_len: Option<usize>,
    whois: HashMap<String, PendingWhois>,
}

/// What the reader should do with one inbound message.
#[derive(Debug, Default, PartialEq, Eq)]
struct Processed {
    events: Vec<WireEvent>,
    reply: Option<IrcMessage>,
}

fn parse_isupport(shared: &mut WireShared, msg: &IrcMessage) {
    for token in msg.params.iter().skip(1) {
        if let Some(value) = token.strip_prefix("NICKLEN=") {
            if let Ok(len) = value.parse() {
                shared.nick_max_len = Some(len);
            }
        }
    }
}

fn parse_ctcp_action(text: &str) -> Option<&str> {
    text.strip_prefix("\x01ACTION ")
        .map(|rest| rest.strip_suffix('\x01').unwrap_or(rest))
}

/// Update `shared` for one inbound message and work out what to publish.
fn process(shared: &Mutex<WireShared>, msg: IrcMessage) -> Processed {
    let mut out = Processed::default();
    let source = msg.source_nick().unwrap_or_default().to_string();
    let mut shared = shared.lock();

    match msg.command.as_str() {
        "PING" => {
            out.reply = Some(IrcMessage {
                prefix: None,
                command: "PONG".to_string(),
                params: msg.params.clone(),
            });
        }
        "001" => {
            if let Some(nick) = msg.param(0) {
                shared.nick = nick.to_string();
                out.events.push(WireEvent::Registered {
                    nick: nick.to_string(),
                });
            }
        }
        "005" => parse_isupport(&mut shared, &msg),
        "NICK" => {
            if let Some(new) = msg.param(0) {
                if source == shared.nick {
                    shared.nick = new.to_string();
                }
                out.events.push(WireEvent::NickChanged {
                    old: source,
                    new: new.to_string(),
                });
            }
        }
        "JOIN" => {
            if let Some(channel) = msg.param(0) {
                if source == shared.nick {
                    shared.chans.insert(to_irc_lower(channel));
                }
                out.events.push(WireEvent::Joined {
                    channel: channel.to_string(),
                    nick: source,
                });
            }
        }
        "PART" => {
            if let Some(channel) = msg.param(0) {
                if source == shared.nick {
                    shared.chans.remove(&to_irc_lower(channel));
                }
                out.events.push(WireEvent::Parted {
                    channel: channel.to_string(),
                    nick: source,
                    reason: msg.param(1).map(str::to_string),
                });
            }
        }
        "KICK" => {
            if let (Some(channel), Some(target)) = (msg.param(0), msg.param(1)) {
                if target == shared.nick {
                    shared.chans.remove(&to_irc_lower(channel));
                }
                out.events.push(WireEvent::Parted {
                    channel: channel.to_string(),
                    nick: target.to_string(),
                    reason: msg.param(2).map(str::to_string),
                });
            }
        }
        "PRIVMSG" | "NOTICE" => {
            if let (Some(target), Some(text)) = (msg.param(0), msg.param(1)) {
                let (kind, text) = match parse_ctcp_action(text) {
                    Some(action) => (MessageKind::Action, action),
                    None if text.starts_with('\x01') => return out,
                    None if msg.command == "NOTICE" => (MessageKind::Notice, text),
                    None => (MessageKind::Privmsg, text),
                };
                out.events.push(WireEvent::Message {
                    from: source,
                    target: target.to_string(),
                    text: text.to_string(),
                    kind,
                });
            }
        }
        "TOPIC" => {
            if let (Some(channel), Some(topic)) = (msg.param(0), msg.param(1)) {
                out.events.push(WireEvent::Message {
                    from: source,
                    target: channel.to_string(),
                    text: topic.to_string(),
                    kind: MessageKind::Topic,
                });
            }
        }
        "MODE" => {
            if let (Some(channel), Some(mode)) = (msg.param(0), msg.param(1)) {
                if is_channel_name(channel) {
                    out.events.push(WireEvent::Mode {
                        channel: channel.to_string(),
                        by: source,
                        mode: mode.to_string(),
                        arg: msg.param(2).map(str::to_string),
                    });
                }
            }
        }
        "311" => {
            if let Some(nick) = msg.param(1) {
                let pending = shared.whois.entry(to_irc_lower(nick)).or_default();
                pending.found = true;
                pending.info.nick = nick.to_string();
                pending.info.user = msg.param(2).map(str::to_string);
                pending.info.host = msg.param(3).map(str::to_string);
                pending.info.realname = msg.param(5).map(str::to_string);
            }
        }
        "312" => {
            if let Some(nick) = msg.param(1) {
                if let Some(pending) = shared.whois.get_mut(&to_irc_lower(nick)) {
                    pending.info.server = msg.param(2).map(str::to_string);
                }
            }
        }
        "319" => {
            if let (Some(nick), Some(chans)) = (msg.param(1), msg.param(2)) {
                if let Some(pending) = shared.whois.get_mut(&to_irc_lower(nick)) {
                    pending.info.channels = chans
                        .split_whitespace()
                        .map(|c| c.trim_start_matches(['@', '+', '%', '~', '&']).to_string())
                        .collect();
                }
            }
        }
        "318" => {
            if let Some(nick) = msg.param(1) {
                if let Some(pending) = shared.whois.remove(&to_irc_lower(nick)) {
                    let result = pending.found.then_some(pending.info);
                    for waiter in pending.waiters {
                        let _ = waiter.send(result.clone());
                    }
                }
            }
        }
        "ERROR" => {
            out.events.push(WireEvent::Disconnected {
                reason: msg.param(0).unwrap_or("ERROR").to_string(),
            });
        }
        numeric => {
            if let Some(command) = error_mnemonic(numeric) {
                out.events.push(WireEvent::Error {
                    command: command.to_string(),
                    args: msg.params.clone(),
                });
            }
        }
    }

    out
}

// ============================================================================
// Wire
// ============================================================================

/// A registered TCP/TLS IRC connection.
pub struct TcpWire {
    domain: String,
    outgoing: mpsc::UnboundedSender<IrcMessage>,
    events: broadcast::Sender<WireEvent>,
    shared: Arc<Mutex<WireShared>>,
}

impl TcpWire {
    fn send(&self, command: &str, params: &[&str]) -> BridgeResult<()> {
        self.outgoing
            .send(IrcMessage::new(command, params))
            .map_err(|_| BridgeError::ConnectionFailed {
                domain: self.domain.clone(),
                nick: self.current_nick(),
                reason: "wire closed".to_string(),
            })
    }
}

#[async_trait]
impl IrcWire for TcpWire {
    fn subscribe(&self) -> broadcast::Receiver<WireEvent> {
        self.events.subscribe()
    }

    async fn join(&self, channel: &str) -> BridgeResult<()> {
        self.send("JOIN", &[channel])
    }

    async fn part(&self, channel: &str, reason: &str) -> BridgeResult<()> {
        self.send("PART", &[channel, reason])
    }

    async fn say(&self, target: &str, text: &str) -> BridgeResult<()> {
        self.send("PRIVMSG", &[target, text])
    }

    async fn action(&self, target: &str, text: &str) -> BridgeResult<()> {
        let ctcp = format!("\x01ACTION {}\x01", text);
        self.send("PRIVMSG", &[target, &ctcp])
    }

    async fn notice(&self, target: &str, text: &str) -> BridgeResult<()> {
        self.send("NOTICE", &[target, text])
    }

    async fn topic(&self, channel: &str, topic: &str) -> BridgeResult<()> {
        self.send("TOPIC", &[channel, topic])
    }

    async fn nick(&self, nick: &str) -> BridgeResult<()> {
        self.send("NICK", &[nick])
    }

    async fn whois(&self, nick: &str) -> BridgeResult<Option<WhoisInfo>> {
        let key = to_irc_lower(nick);
        let (tx, rx) = oneshot::channel();
        self.shared
            .lock()
            .whois
            .entry(key.clone())
            .or_default()
            .waiters
            .push(tx);
        self.send("WHOIS", &[nick])?;

        match timeout(WHOIS_TIMEOUT, rx).await {
            Ok(Ok(info)) => Ok(info),
            _ => {
                self.shared.lock().whois.remove(&key);
                Ok(None)
            }
        }
    }

    async fn quit(&self, reason: &str) -> BridgeResult<()> {
        self.send("QUIT", &[reason])
    }

    fn current_nick(&self) -> String {
        self.shared.lock().nick.clone()
    }

    fn is_joined(&self, channel: &str) -> bool {
        self.shared.lock().chans.contains(&to_irc_lower(channel))
    }

    fn nick_max_len(&self) -> Option<usize> {
        self.shared.lock().nick_max_len
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Opens IRC connections over TCP, with TLS when the network asks for it.
#[derive(Debug, Default, Clone)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }
}

async fn upgrade_to_tls(
    tcp: TcpStream,
    hostname: &str,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, Box<dyn std::error::Error + Send + Sync>> {
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};
    use tokio_rustls::TlsConnector;

    let mut roots = RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs();
    for cert in certs.certs {
        if let Err(e) = roots.add(cert) {
            warn!("Failed to add root cert: {}", e);
        }
    }
    for e in &certs.errors {
        warn!("Error loading native certs: {}", e);
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(hostname.to_string())?;
    Ok(connector.connect(server_name, tcp).await?)
}

/// Send PASS/NICK/USER and wait for RPL_WELCOME.
async fn register(
    framed: &mut IrcFramed,
    options: &ConnectOptions,
    shared: &Mutex<WireShared>,
) -> Result<String, String> {
    if let Some(password) = &options.password {
        framed
            .send(IrcMessage::new("PASS", &[password]))
            .await
            .map_err(|e| e.to_string())?;
    }

    let mut nick = options.nick.clone();
    framed
        .send(IrcMessage::new("NICK", &[&nick]))
        .await
        .map_err(|e| e.to_string())?;
    framed
        .send(IrcMessage::new(
            "USER",
            &[&options.username, "0", "*", &options.realname],
        ))
        .await
        .map_err(|e| e.to_string())?;

    let mut retries = 0;
    loop {
        let msg = match framed.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => return Err(e.to_string()),
            None => return Err("connection closed during registration".to_string()),
        };

        match msg.command.as_str() {
            "PING" => {
                let pong = IrcMessage {
                    prefix: None,
                    command: "PONG".to_string(),
                    params: msg.params.clone(),
                };
                framed.send(pong).await.map_err(|e| e.to_string())?;
            }
            "001" => {
                let registered = msg.param(0).unwrap_or(&nick).to_string();
                shared.lock().nick = registered.clone();
                return Ok(registered);
            }
            "005" => parse_isupport(&mut shared.lock(), &msg),
            "432" | "433" | "436" => {
                retries += 1;
                if retries > MAX_NICK_RETRIES {
                    return Err(format!("nick {} unavailable", options.nick));
                }
                nick.push('_');
                debug!("Nick taken during registration, trying {}", nick);
                framed
                    .send(IrcMessage::new("NICK", &[&nick]))
                    .await
                    .map_err(|e| e.to_string())?;
            }
            "464" => return Err("password mismatch".to_string()),
            "ERROR" => return Err(msg.param(0).unwrap_or("ERROR").to_string()),
            _ => {}
        }
    }
}

#[async_trait]
impl IrcConnector for TcpConnector {
    async fn connect(&self, options: ConnectOptions) -> BridgeResult<Arc<dyn IrcWire>> {
        let failed = |reason: String| BridgeError::ConnectionFailed {
            domain: options.domain.clone(),
            nick: options.nick.clone(),
            reason,
        };

        let tcp = timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((options.domain.as_str(), options.port)),
        )
        .await
        .map_err(|_| failed("connect timed out".to_string()))?
        .map_err(|e| failed(e.to_string()))?;

        let stream: Box<dyn IoStream> = if options.ssl {
            Box::new(
                upgrade_to_tls(tcp, &options.domain)
                    .await
                    .map_err(|e| failed(format!("TLS handshake failed: {}", e)))?,
            )
        } else {
            Box::new(tcp)
        };

        let mut framed = Framed::new(stream, IrcCodec::new());
        let shared = Arc::new(Mutex::new(WireShared {
            nick: options.nick.clone(),
            ..WireShared::default()
        }));

        let nick = timeout(REGISTRATION_TIMEOUT, register(&mut framed, &options, &shared))
            .await
            .map_err(|_| failed("registration timed out".to_string()))?
            .map_err(failed)?;
        info!(domain = %options.domain, "Registered as {}", nick);

        let (mut sink, mut stream) = framed.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<IrcMessage>();
        let (events, _) = broadcast::channel(256);

        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let quitting = msg.command == "QUIT";
                if let Err(e) = sink.send(msg).await {
                    warn!("IRC write failed: {}", e);
                    break;
                }
                if quitting {
                    break;
                }
            }
            if let Err(e) = sink.close().await {
                debug!("Error closing IRC sink: {}", e);
            }
        });

        {
            let shared = shared.clone();
            let events = events.clone();
            let outgoing = outgoing.clone();
            let domain = options.domain.clone();
            tokio::spawn(async move {
                let mut reason = "connection closed".to_string();
                'read: while let Some(item) = stream.next().await {
                    let msg = match item {
                        Ok(msg) => msg,
                        Err(e) => {
                            reason = e.to_string();
                            break;
                        }
                    };
                    let processed = process(&shared, msg);
                    if let Some(reply) = processed.reply {
                        let _ = outgoing.send(reply);
                    }
                    for event in processed.events {
                        if let WireEvent::Disconnected { reason: r } = &event {
                            reason = r.clone();
                            break 'read;
                        }
                        // No subscribers is fine.
                        let _ = events.send(event);
                    }
                }
                debug!(domain = %domain, "IRC reader finished: {}", reason);
                let _ = events.send(WireEvent::Disconnected { reason });
            });
        }

        Ok(Arc::new(TcpWire {
            domain: options.domain,
            outgoing,
            events,
            shared,
        }))
    }
}
