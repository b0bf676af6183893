use anyhow::Context;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use freemonitor_common::protocol::events::OutboundEvent;

use crate::sink::Frame;

pub async fn send_event(socket: &mut WebSocket, event: &OutboundEvent) -> anyhow::Result<()> {
    let encoded = event.encode().with_context(|| format!("failed to encode {}", event.name()))?;
    socket.send(Message::Text(encoded.into())).await.context("failed to send websocket frame")
}

pub async fn send_frame(socket: &mut WebSocket, frame: Frame) -> anyhow::Result<()> {
    socket
        .send(Message::Text(frame.to_string().into()))
        .await
        .context("failed to send websocket frame")
}

pub async fn send_events(socket: &mut WebSocket, events: &[OutboundEvent]) -> anyhow::Result<()> {
    for event in events {
        send_event(socket, event).await?;
    }
    Ok(())
}

/// Best effort; the peer may already be gone.
pub async fn close_with_reason(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code, reason: reason.to_string().into() })))
        .await;
}
