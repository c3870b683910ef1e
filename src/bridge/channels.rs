//! Bridge channel management.
//!
//! Groups the channels that connect the homeserver listener, the IRC
//! connections and the event loop.

use tokio::sync::{mpsc, watch};

use crate::common::messages::LocalEvent;
use crate::matrix::listener::ListenerMessage;

/// Channels the event loop reads from.
pub struct BridgeChannels {
    /// Events and queries from the homeserver listener.
    pub listener_rx: mpsc::UnboundedReceiver<ListenerMessage>,
    /// Events from every IRC connection.
    pub local_rx: mpsc::UnboundedReceiver<LocalEvent>,
    /// Flips to `true` on shutdown.
    pub shutdown_rx: watch::Receiver<bool>,
}

/// Senders handed to the producers.
pub struct ProducerChannels {
    /// Given to the HTTP listener.
    pub listener_tx: mpsc::UnboundedSender<ListenerMessage>,
    /// Given to every IRC connection.
    pub local_tx: mpsc::UnboundedSender<LocalEvent>,
}

/// Control channels for shutdown coordination.
pub struct ControlChannels {
    pub shutdown_tx: watch::Sender<bool>,
}

/// Bundle of all channels created at startup.
pub struct ChannelBundle {
    pub bridge: BridgeChannels,
    pub producers: ProducerChannels,
    pub control: ControlChannels,
}

impl ChannelBundle {
    pub fn new() -> Self {
        let (listener_tx, listener_rx) = mpsc::unbounded_channel();
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            bridge: BridgeChannels {
                listener_rx,
                local_rx,
                shutdown_rx,
            },
            producers: ProducerChannels {
                listener_tx,
                local_tx,
            },
            control: ControlChannels { shutdown_tx },
        }
    }
}

impl Default for ChannelBundle {
    fn default() -> Self {
        Self::new()
    }
}
