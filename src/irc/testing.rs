//! In-memory wire fakes shared by tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::common::error::{BridgeError, BridgeResult};
use crate::common::types::{to_irc_lower, LocalIdentity, RemoteIdentity};
use crate::irc::wire::{
    ConnectOptions, IrcConnector, IrcNames, IrcWire, NameService, WhoisInfo, WireEvent,
};

/// How the fake server answers a JOIN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinBehaviour {
    /// Confirm immediately with a JOIN echo.
    Confirm,
    /// Never answer.
    Silent,
    /// Never answer, but show the channel as joined from the n-th JOIN on.
    OutOfBandAfter(usize),
    /// Answer with the given error reply.
    Reject(String),
}

#[derive(Debug)]
pub struct MockState {
    pub nick: String,
    pub joined: HashSet<String>,
    pub sent: Vec<String>,
    pub join_calls: usize,
    pub nick_calls: usize,
    pub join_behaviour: JoinBehaviour,
    pub nick_max_len: Option<usize>,
    pub whois: HashMap<String, WhoisInfo>,
}

pub struct MockWire {
    events: broadcast::Sender<WireEvent>,
    pub state: Mutex<MockState>,
}

impl MockWire {
    pub fn new(nick: &str) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            events,
            state: Mutex::new(MockState {
                nick: nick.to_string(),
                joined: HashSet::new(),
                sent: Vec::new(),
                join_calls: 0,
                nick_calls: 0,
                join_behaviour: JoinBehaviour::Confirm,
                nick_max_len: None,
                whois: HashMap::new(),
            }),
        })
    }

    pub fn set_join_behaviour(&self, behaviour: JoinBehaviour) {
        self.state.lock().join_behaviour = behaviour;
    }

    pub fn join_calls(&self) -> usize {
        self.state.lock().join_calls
    }

    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    /// Inject an event as if it came from the server.
    pub fn emit(&self, event: WireEvent) {
        let _ = self.events.send(event);
    }

    fn record(&self, line: String) {
        self.state.lock().sent.push(line);
    }
}

#[async_trait]
impl IrcWire for MockWire {
    fn subscribe(&self) -> broadcast::Receiver<WireEvent> {
        self.events.subscribe()
    }

    async fn join(&self, channel: &str) -> BridgeResult<()> {
        let (behaviour, nick, calls) = {
            let mut state = self.state.lock();
            state.join_calls += 1;
            state.sent.push(format!("JOIN {}", channel));
            (state.join_behaviour.clone(), state.nick.clone(), state.join_calls)
        };

        match behaviour {
            JoinBehaviour::Confirm => {
                self.state.lock().joined.insert(to_irc_lower(channel));
                self.emit(WireEvent::Joined {
                    channel: channel.to_string(),
                    nick,
                });
            }
            JoinBehaviour::Silent => {}
            JoinBehaviour::OutOfBandAfter(n) => {
                if calls >= n {
                    self.state.lock().joined.insert(to_irc_lower(channel));
                }
            }
            JoinBehaviour::Reject(code) => {
                self.emit(WireEvent::Error {
                    command: code,
                    args: vec![nick, channel.to_string(), "Cannot join channel".to_string()],
                });
            }
        }
        Ok(())
    }

    async fn part(&self, channel: &str, reason: &str) -> BridgeResult<()> {
        let mut state = self.state.lock();
        state.joined.remove(&to_irc_lower(channel));
        state.sent.push(format!("PART {} :{}", channel, reason));
        Ok(())
    }

    async fn say(&self, target: &str, text: &str) -> BridgeResult<()> {
        self.record(format!("PRIVMSG {} :{}", target, text));
        Ok(())
    }

    async fn action(&self, target: &str, text: &str) -> BridgeResult<()> {
        self.record(format!("PRIVMSG {} :\x01ACTION {}\x01", target, text));
        Ok(())
    }

    async fn notice(&self, target: &str, text: &str) -> BridgeResult<()> {
        self.record(format!("NOTICE {} :{}", target, text));
        Ok(())
    }

    async fn topic(&self, channel: &str, topic: &str) -> BridgeResult<()> {
        self.record(format!("TOPIC {} :{}", channel, topic));
        Ok(())
    }

    async fn nick(&self, nick: &str) -> BridgeResult<()> {
        let old = {
            let mut state = self.state.lock();
            state.nick_calls += 1;
            state.sent.push(format!("NICK {}", nick));
            std::mem::replace(&mut state.nick, nick.to_string())
        };
        self.emit(WireEvent::NickChanged {
            old,
            new: nick.to_string(),
        });
        Ok(())
    }

    async fn whois(&self, nick: &str) -> BridgeResult<Option<WhoisInfo>> {
        self.record(format!("WHOIS {}", nick));
        Ok(self.state.lock().whois.get(nick).cloned())
    }

    async fn quit(&self, reason: &str) -> BridgeResult<()> {
        self.record(format!("QUIT :{}", reason));
        self.emit(WireEvent::Disconnected {
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn current_nick(&self) -> String {
        self.state.lock().nick.clone()
    }

    fn is_joined(&self, channel: &str) -> bool {
        self.state.lock().joined.contains(&to_irc_lower(channel))
    }

    fn nick_max_len(&self) -> Option<usize> {
        self.state.lock().nick_max_len
    }
}

/// Connector handing out `MockWire`s, one per nick.
#[derive(Default)]
pub struct MockConnector {
    pub wires: Mutex<Vec<Arc<MockWire>>>,
    pub fail: Mutex<bool>,
    pub join_behaviour: Mutex<Option<JoinBehaviour>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let connector = Self::default();
        *connector.fail.lock() = true;
        Arc::new(connector)
    }

    pub fn wire_for(&self, nick: &str) -> Option<Arc<MockWire>> {
        self.wires
            .lock()
            .iter()
            .find(|w| w.current_nick() == nick)
            .cloned()
    }

    pub fn connect_count(&self) -> usize {
        self.wires.lock().len()
    }
}

#[async_trait]
impl IrcConnector for MockConnector {
    async fn connect(&self, options: ConnectOptions) -> BridgeResult<Arc<dyn IrcWire>> {
        if *self.fail.lock() {
            return Err(BridgeError::ConnectionFailed {
                domain: options.domain,
                nick: options.nick,
                reason: "connection refused".to_string(),
            });
        }
        let wire = MockWire::new(&options.nick);
        if let Some(behaviour) = self.join_behaviour.lock().clone() {
            wire.set_join_behaviour(behaviour);
        }
        self.wires.lock().push(wire.clone());
        Ok(wire)
    }
}

/// Registers with the identity's nick unchanged.
pub struct PlainNames;

#[async_trait]
impl NameService for PlainNames {
    async fn resolve(
        &self,
        identity: &LocalIdentity,
        _owner: Option<&RemoteIdentity>,
    ) -> BridgeResult<IrcNames> {
        Ok(IrcNames {
            nick: identity.nick.clone(),
            username: identity
                .username
                .clone()
                .unwrap_or_else(|| identity.nick.to_lowercase()),
            realname: identity.nick.clone(),
        })
    }
}
