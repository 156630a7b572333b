//! WebSocket event channel.
//!
//! One unfiltered stream of the canonical event set; clients filter on
//! their side. A subscriber that falls behind the broadcast buffer loses
//! the lagged events, consistent with at-most-once delivery.

use super::ApiServer;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

pub async fn event_stream(
    ws: WebSocketUpgrade,
    State(server): State<ApiServer>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = forward_events(socket, server).await {
            debug!(error = %e, "event stream closed");
        }
    })
}

async fn forward_events(mut socket: WebSocket, server: ApiServer) -> anyhow::Result<()> {
    let mut events = server.events.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let body = serde_json::to_string(&event)?;
                        if socket.send(Message::Text(body.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "event stream subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            message = socket.recv() => {
                match message {
                    // Clients only ever subscribe; inbound frames are
                    // drained so pings and closes are handled.
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
    Ok(())
}
