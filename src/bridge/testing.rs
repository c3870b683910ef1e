//! A fully wired bridge over in-memory fakes.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::bridge::state::BridgeContext;
use crate::common::messages::LocalEvent;
use crate::common::metrics::testing::RecordingMetrics;
use crate::config::parser::load_config_str;
use crate::config::types::Config;
use crate::irc::client::ConnectionDeps;
use crate::irc::server::ServerPolicy;
use crate::irc::testing::{MockConnector, PlainNames};
use crate::matrix::testing::MockRemoteClient;
use crate::store::IdentityStore;

pub const DOMAIN: &str = "irc.example.org";
pub const MAPPED_ROOM: &str = "!mapped:hs.example.org";
pub const ALICE: &str = "@alice:hs.example.org";

pub struct Harness {
    pub ctx: Arc<BridgeContext>,
    pub connector: Arc<MockConnector>,
    pub remote: Arc<MockRemoteClient>,
    pub metrics: Arc<RecordingMetrics>,
    /// Kept so connections can always forward.
    pub local_rx: mpsc::UnboundedReceiver<LocalEvent>,
}

/// A config with one network mapping `#rust` to [`MAPPED_ROOM`]. `server_extra`
/// is spliced into the network block.
pub fn config(server_extra: &str) -> Config {
    load_config_str(&format!(
        r##"
        homeserver {{
            url = "https://hs.example.org"
            domain = "hs.example.org"
        }}
        appservice {{
            url = "http://localhost:9995"
            token = "as-secret"
        }}
        database_uri = "memory://"
        servers {{
            "{}" {{
                mappings {{ "#rust" = ["{}"] }}
                {}
            }}
        }}
        "##,
        DOMAIN, MAPPED_ROOM, server_extra
    ))
    .unwrap()
}

pub fn policies(config: &Config) -> Vec<Arc<ServerPolicy>> {
    config
        .servers
        .iter()
        .map(|(domain, server)| Arc::new(ServerPolicy::new(domain.clone(), server.clone())))
        .collect()
}

pub async fn harness(server_extra: &str) -> Harness {
    let config = config(server_extra);
    let servers = policies(&config);
    let store = Arc::new(IdentityStore::in_memory());
    for server in &servers {
        store.rooms.seed_config_links(server).await.unwrap();
    }

    let connector = MockConnector::new();
    let remote = Arc::new(MockRemoteClient::default());
    let metrics = Arc::new(RecordingMetrics::default());
    let (local_tx, local_rx) = mpsc::unbounded_channel();

    let ctx = BridgeContext::new(
        Arc::new(config),
        servers,
        store,
        remote.clone(),
        ConnectionDeps {
            connector: connector.clone(),
            names: Arc::new(PlainNames),
        },
        metrics.clone(),
        local_tx,
    );

    Harness {
        ctx: Arc::new(ctx),
        connector,
        remote,
        metrics,
        local_rx,
    }
}

/// Let spawned tasks run.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
