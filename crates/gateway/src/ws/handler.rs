use axum::{
    extract::{
        ws::{close_code, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use freemonitor_common::protocol::events::{decode_inbound, OutboundEvent};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::protocol as ws_protocol;
use super::WsState;
use crate::auth::{token_from_request, Identity};
use crate::error::GatewayError;
use crate::gateway::{
    connection_established, decode_rejection, handshake_rejection, rate_limited_reply, Gateway,
    GatewayStats, UNAUTHORIZED_REASON,
};
use crate::rate_limit::{ConnectionRateLimits, RateLimitDecision};
use crate::registry::ConnectionId;
use crate::sink::ConnectionSink;

const INACTIVE_CLOSE_REASON: &str = "inactive";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectQuery {
    pub device_id: Option<String>,
    pub token: Option<String>,
}

pub async fn ws_upgrade(
    State(state): State<WsState>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = match authenticate(&state, &headers, query.token.as_deref()) {
        Ok(identity) => identity,
        Err(failure) => return failure.into_response(),
    };
    let Some(device_id) = query.device_id.filter(|device_id| !device_id.trim().is_empty()) else {
        return GatewayError::Validation("deviceId query parameter is required".to_string())
            .into_response();
    };

    let gateway = state.gateway.clone();
    ws.on_upgrade(move |socket| handle_socket(gateway, identity, device_id, socket))
}

/// Operational snapshot. Lists user ids, so only admins may read it, and
/// only with an `Authorization` header.
pub async fn stats(
    State(state): State<WsState>,
    headers: HeaderMap,
) -> Result<Json<GatewayStats>, GatewayError> {
    let identity = authenticate(&state, &headers, None)?;
    if !identity.is_admin() {
        warn!(user_id = %identity.user_id, "stats request without admin role");
        return Err(GatewayError::Forbidden("caller lacks required role".to_string()));
    }
    Ok(Json(state.gateway.stats().await))
}

fn authenticate(
    state: &WsState,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<Identity, GatewayError> {
    let token = token_from_request(headers, query_token)
        .ok_or_else(|| GatewayError::InvalidIdentity("missing bearer token".to_string()))?;
    state.verifier.verify(token).map_err(|error| {
        warn!(error = ?error, "rejected request with invalid token");
        GatewayError::InvalidIdentity("invalid bearer token".to_string())
    })
}

async fn handle_socket(
    gateway: Gateway,
    identity: Identity,
    device_id: String,
    mut socket: WebSocket,
) {
    let connection_id = Uuid::new_v4();
    let settings = *gateway.settings();
    let (sink, mut receiver) = ConnectionSink::channel(settings.outbound_buffer);

    let record = match gateway.connect(connection_id, &identity, &device_id, sink).await {
        Ok(record) => record,
        Err(failure) => {
            let _ = ws_protocol::send_event(&mut socket, &handshake_rejection(&failure)).await;
            ws_protocol::close_with_reason(&mut socket, close_code::POLICY, UNAUTHORIZED_REASON)
                .await;
            return;
        }
    };

    if ws_protocol::send_event(&mut socket, &connection_established(&record)).await.is_err() {
        gateway.disconnect(connection_id).await;
        return;
    }

    let mut limits = settings.rate_limits();
    loop {
        tokio::select! {
            _ = receiver.close.notified() => {
                ws_protocol::close_with_reason(
                    &mut socket,
                    close_code::NORMAL,
                    INACTIVE_CLOSE_REASON,
                )
                .await;
                break;
            }
            maybe_frame = receiver.frames.recv() => {
                let Some(frame) = maybe_frame else {
                    break;
                };
                if ws_protocol::send_frame(&mut socket, frame).await.is_err() {
                    break;
                }
            }
            maybe_message = socket.recv() => {
                let Some(Ok(message)) = maybe_message else {
                    break;
                };

                match message {
                    Message::Text(raw) => {
                        let replies =
                            process_text(&gateway, connection_id, &mut limits, raw.as_str())
                                .await;
                        if ws_protocol::send_events(&mut socket, &replies).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    Message::Binary(_) => {
                        debug!(connection_id = %connection_id, "ignoring binary frame");
                    }
                    Message::Ping(_) | Message::Pong(_) => {
                        gateway.registry().touch(connection_id).await;
                    }
                }
            }
        }
    }

    gateway.disconnect(connection_id).await;
}

/// Decode, throttle and apply one text frame. Returns the replies for the sender.
pub(crate) async fn process_text(
    gateway: &Gateway,
    connection_id: ConnectionId,
    limits: &mut ConnectionRateLimits,
    raw: &str,
) -> Vec<OutboundEvent> {
    let event = match decode_inbound(raw) {
        Ok(event) => event,
        Err(failure) => {
            warn!(connection_id = %connection_id, error = %failure, "rejected inbound frame");
            gateway.registry().touch(connection_id).await;
            return vec![decode_rejection(&failure)];
        }
    };

    if let RateLimitDecision::Limited { retry_after_secs } = limits.check(&event) {
        warn!(
            connection_id = %connection_id,
            event = event.name(),
            retry_after_secs,
            "inbound event rate limited"
        );
        return rate_limited_reply(&event).into_iter().collect();
    }

    gateway.handle_event(connection_id, event).await
}
