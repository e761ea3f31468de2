//! WebSocket subscriptions: one socket per watched hostname, one text frame
//! per committed snapshot.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::hub::Subscription;
use crate::state::AppState;

/// A subscriber that cannot take a frame within this window is disconnected.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

// GET /ws/processes/{hostname}/
pub async fn subscribe(
    ws: WebSocketUpgrade,
    State(app): State<AppState>,
    Path(hostname): Path<String>,
) -> Response {
    let subscription = app.hub.subscribe(&hostname);
    ws.on_upgrade(move |socket| pump(socket, subscription))
}

async fn pump(mut socket: WebSocket, mut subscription: Subscription) {
    info!(hostname = subscription.hostname(), "Subscriber connected");

    loop {
        tokio::select! {
            next = subscription.recv() => {
                let Some(payload) = next else { break };
                match timeout(SEND_TIMEOUT, socket.send(Message::Text(payload.as_ref().into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(hostname = subscription.hostname(), error = %e, "Subscriber send failed");
                        break;
                    }
                    Err(_) => {
                        warn!(hostname = subscription.hostname(), "Subscriber too slow, disconnecting");
                        break;
                    }
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    info!(hostname = subscription.hostname(), "Subscriber disconnected");
    subscription.unsubscribe();
}
