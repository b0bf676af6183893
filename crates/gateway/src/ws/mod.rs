// WebSocket transport for the gateway.
//
// `GET /v1/ws?deviceId=..` verifies the bearer identity before upgrading;
// device authorization happens after the upgrade so it can be acknowledged
// over the socket. `GET /v1/stats` needs an admin bearer token.

pub mod handler;
pub mod protocol;

use std::sync::Arc;

use axum::{routing::get, Router};

use crate::auth::IdentityVerifier;
use crate::gateway::Gateway;

#[derive(Clone)]
pub struct WsState {
    pub gateway: Gateway,
    pub verifier: Arc<IdentityVerifier>,
}

pub fn router(gateway: Gateway, verifier: Arc<IdentityVerifier>) -> Router {
    Router::new()
        .route("/v1/ws", get(handler::ws_upgrade))
        .route("/v1/stats", get(handler::stats))
        .with_state(WsState { gateway, verifier })
}
