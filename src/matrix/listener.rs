//! Application service HTTP endpoint.
//!
//! The homeserver pushes room events in transactions and asks about users
//! and aliases the bridge claims. Every request must carry the homeserver
//! token. Events and queries are handed to the bridge over a channel.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::common::messages::RemoteEvent;

/// What the listener hands to the bridge.
#[derive(Debug)]
pub enum ListenerMessage {
    Event(RemoteEvent),
    /// Does the bridge provide this alias? Reply `true` once the room exists.
    AliasQuery {
        alias: String,
        reply: oneshot::Sender<bool>,
    },
    /// Does the bridge provide this user? Reply `true` once it is registered.
    UserQuery {
        user_id: String,
        reply: oneshot::Sender<bool>,
    },
}

#[derive(Clone)]
struct ListenerState {
    hs_token: Arc<str>,
    tx: mpsc::UnboundedSender<ListenerMessage>,
    last_txn: Arc<Mutex<Option<String>>>,
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Transaction {
    #[serde(default)]
    events: Vec<Value>,
}

fn matrix_error(status: StatusCode, errcode: &str) -> Response {
    (status, Json(json!({ "errcode": errcode }))).into_response()
}

fn ok() -> Response {
    (StatusCode::OK, Json(json!({}))).into_response()
}

impl ListenerState {
    fn check_token(&self, query: &TokenQuery) -> Result<(), Response> {
        match query.access_token.as_deref() {
            None => Err(matrix_error(StatusCode::UNAUTHORIZED, "M_UNAUTHORIZED")),
            Some(token) if token != &*self.hs_token => {
                warn!("Rejected request with a bad homeserver token");
                Err(matrix_error(StatusCode::FORBIDDEN, "M_FORBIDDEN"))
            }
            Some(_) => Ok(()),
        }
    }

    async fn ask(&self, message: ListenerMessage, reply: oneshot::Receiver<bool>) -> Response {
        if self.tx.send(message).is_err() {
            return matrix_error(StatusCode::SERVICE_UNAVAILABLE, "M_UNKNOWN");
        }
        match reply.await {
            Ok(true) => ok(),
            Ok(false) => matrix_error(StatusCode::NOT_FOUND, "M_NOT_FOUND"),
            Err(_) => matrix_error(StatusCode::INTERNAL_SERVER_ERROR, "M_UNKNOWN"),
        }
    }
}

async fn on_transaction(
    State(state): State<ListenerState>,
    Path(txn_id): Path<String>,
    Query(query): Query<TokenQuery>,
    Json(txn): Json<Transaction>,
) -> Response {
    if let Err(response) = state.check_token(&query) {
        return response;
    }

    {
        let mut last = state.last_txn.lock();
        if last.as_deref() == Some(txn_id.as_str()) {
            debug!("Already processed transaction {}", txn_id);
            return ok();
        }
        *last = Some(txn_id.clone());
    }

    debug!("Transaction {} with {} events", txn_id, txn.events.len());
    for raw in txn.events {
        match serde_json::from_value::<RemoteEvent>(raw) {
            Ok(event) => {
                if state.tx.send(ListenerMessage::Event(event)).is_err() {
                    return matrix_error(StatusCode::SERVICE_UNAVAILABLE, "M_UNKNOWN");
                }
            }
            Err(e) => warn!("Skipping malformed event in {}: {}", txn_id, e),
        }
    }
    ok()
}

async fn on_user_query(
    State(state): State<ListenerState>,
    Path(user_id): Path<String>,
    Query(query): Query<TokenQuery>,
) -> Response {
    if let Err(response) = state.check_token(&query) {
        return response;
    }
    let (reply, rx) = oneshot::channel();
    state.ask(ListenerMessage::UserQuery { user_id, reply }, rx).await
}

async fn on_alias_query(
    State(state): State<ListenerState>,
    Path(alias): Path<String>,
    Query(query): Query<TokenQuery>,
) -> Response {
    if let Err(response) = state.check_token(&query) {
        return response;
    }
    let (reply, rx) = oneshot::channel();
    state.ask(ListenerMessage::AliasQuery { alias, reply }, rx).await
}

/// Routes for both the legacy and the versioned application service API.
pub fn router(hs_token: &str, tx: mpsc::UnboundedSender<ListenerMessage>) -> Router {
    let state = ListenerState {
        hs_token: Arc::from(hs_token),
        tx,
        last_txn: Arc::new(Mutex::new(None)),
    };
    Router::new()
        .route("/transactions/:txn_id", put(on_transaction))
        .route("/users/:user_id", get(on_user_query))
        .route("/rooms/:alias", get(on_alias_query))
        .route("/_matrix/app/v1/transactions/:txn_id", put(on_transaction))
        .route("/_matrix/app/v1/users/:user_id", get(on_user_query))
        .route("/_matrix/app/v1/rooms/:alias", get(on_alias_query))
        .with_state(state)
}

/// Bind `0.0.0.0:port` and serve until the task is dropped.
pub async fn serve(port: u16, app: Router) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Listening for homeserver transactions on {}", addr);
    axum::serve(listener, app).await
}
