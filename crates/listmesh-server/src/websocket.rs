//! WebSocket sync handler
//!
//! One socket per device. The path segment names the user; everything the
//! socket reads or writes goes through that user's registry entry only.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;

use listmesh_core::store::{lock, ChangeSource};
use listmesh_core::{SyncMessage, UserId};

use crate::registry::Attachment;
use crate::AppState;

/// Upgrade `GET /{user_id}` to a sync socket
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let user = match UserId::parse(&user_id) {
        Ok(user) => user,
        Err(_) => {
            tracing::debug!("Rejected sync request with malformed user id");
            return (StatusCode::BAD_REQUEST, "invalid user id").into_response();
        }
    };

    let attachment = state.registry.attach(&user);
    tracing::info!(
        user = %user.redacted(),
        connection = attachment.id(),
        "Sync connection opened"
    );

    ws.on_upgrade(move |socket| async move {
        if let Err(e) = handle_socket(socket, state, attachment).await {
            tracing::warn!("Sync connection ended with error: {}", e);
        }
    })
}

async fn send(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    message: &SyncMessage,
) -> Result<(), axum::Error> {
    match message.encode() {
        Ok(text) => sender.send(Message::Text(text.into())).await,
        Err(e) => {
            tracing::error!("Failed to encode frame: {}", e);
            Ok(())
        }
    }
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    attachment: Attachment,
) -> Result<(), axum::Error> {
    let connection = attachment.id();
    let user = attachment.entry().user().redacted();
    let loaded = state.registry.load(&attachment).await;
    let store = &loaded.store;

    // subscribe before the handshake so no update falls in between
    let mut updates = attachment.entry().subscribe();
    let mut shutdown = state.shutdown_signal();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            frame = receiver.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(connection, "Socket error: {}", e);
                        break;
                    }
                };

                match SyncMessage::decode(text.as_str()) {
                    Ok(SyncMessage::Digest { digest }) => {
                        let (missing, ours) = {
                            let store = lock(store);
                            (store.changes_missing_from(&digest), store.digest())
                        };
                        tracing::debug!(connection, sending = missing.len(), "Handshake");
                        send(&mut sender, &SyncMessage::Changes { changes: missing }).await?;
                        send(&mut sender, &SyncMessage::Digest { digest: ours }).await?;
                    }
                    Ok(SyncMessage::Changes { changes }) => {
                        let applied = lock(store)
                            .merge_from(&changes, ChangeSource::Connection(connection));
                        tracing::debug!(
                            connection,
                            received = changes.len(),
                            applied = applied.len(),
                            "Merged frame"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(connection, "Ignoring undecodable frame: {}", e);
                    }
                }
            }
            update = updates.recv() => match update {
                Ok(update) if update.origin == Some(connection) => {}
                Ok(update) => {
                    let changes = (*update.changes).clone();
                    send(&mut sender, &SyncMessage::Changes { changes }).await?;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(connection, skipped, "Connection lagged, resending full state");
                    let changes = lock(store).snapshot();
                    send(&mut sender, &SyncMessage::Changes { changes }).await?;
                }
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.changed() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    tracing::info!(user = %user, connection, "Sync connection closed");
    Ok(())
}
