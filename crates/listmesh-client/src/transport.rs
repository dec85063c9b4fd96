//! Reconnecting sync transport
//!
//! A [`SyncClient`] keeps at most one link between a local store and the
//! server socket of one user:
//!
//! ```text
//! Disconnected ──connect──> Connecting ──handshake──> Connected
//!      ^                        │                        │
//!      │                        └─ timeout / error ──> Error
//!      │                                                 │
//!      └──── disconnect ────  wait reconnect_delay  <────┘
//! ```
//!
//! After a drop or a failed attempt, one reconnect is scheduled after
//! `reconnect_delay_ms`; each new failure schedules the next one.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use listmesh_core::config::SyncConfig;
use listmesh_core::store::{lock, ChangeSource, DocumentStore, ListenerId, SharedStore};
use listmesh_core::{Changes, SyncMessage, TransportError, UserId};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Sink = SplitSink<Socket, Message>;
type Source = SplitStream<Socket>;

/// Connection state published to observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Last attempt failed; a reconnect is pending
    Error(String),
}

impl SyncStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, SyncStatus::Connected)
    }
}

/// Everything one link needs; fixed for the link's life
#[derive(Clone)]
struct Link {
    url: Url,
    store: SharedStore,
    user: UserId,
    connect_timeout: Duration,
    reconnect_delay: Duration,
}

struct ActiveLink {
    store: SharedStore,
    user: UserId,
    cancel: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

enum LinkEnd {
    Cancelled,
    Closed,
}

/// Removes the forwarding listener however the link ends
struct ListenerGuard {
    store: SharedStore,
    id: ListenerId,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        lock(&self.store).remove_listener(self.id);
    }
}

/// Client side of the sync protocol
pub struct SyncClient {
    config: SyncConfig,
    status: watch::Sender<SyncStatus>,
    active: Option<ActiveLink>,
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("server_url", &self.config.server_url)
            .field("status", &*self.status.borrow())
            .field("active", &self.active.is_some())
            .finish()
    }
}

impl SyncClient {
    pub fn new(config: SyncConfig) -> Self {
        let (status, _) = watch::channel(SyncStatus::Disconnected);
        Self {
            config,
            status,
            active: None,
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Watch status transitions
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// The user of the current link, if any
    pub fn user(&self) -> Option<&UserId> {
        self.active.as_ref().map(|active| &active.user)
    }

    /// `<server_url>/<user_id>`
    pub fn endpoint(&self, user: &UserId) -> Result<Url, TransportError> {
        let base = self.config.server_url.trim_end_matches('/');
        let url = Url::parse(&format!("{base}/{user}"))
            .map_err(|e| TransportError::InvalidServerUrl(e.to_string()))?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(TransportError::InvalidServerUrl(format!(
                "unsupported scheme {other}"
            ))),
        }
    }

    /// Link `store` to the server socket of `user`.
    ///
    /// A no-op while the same store and user are already linked; a different
    /// pair tears the old link down first. Connection failures are reported
    /// through [`SyncClient::status`], not here.
    pub async fn connect(&mut self, store: SharedStore, user: UserId) -> Result<(), TransportError> {
        if let Some(active) = &self.active {
            if Arc::ptr_eq(&active.store, &store)
                && active.user == user
                && !active.task.is_finished()
            {
                return Ok(());
            }
        }
        let url = self.endpoint(&user)?;
        self.disconnect().await;

        let link = Link {
            url,
            store: store.clone(),
            user: user.clone(),
            connect_timeout: Duration::from_millis(self.config.connect_timeout_ms),
            reconnect_delay: Duration::from_millis(self.config.reconnect_delay_ms),
        };
        let (cancel, cancelled) = oneshot::channel();
        let status = self.status.clone();
        let task = tokio::spawn(supervise(link, cancelled, status));

        self.active = Some(ActiveLink {
            store,
            user,
            cancel,
            task,
        });
        Ok(())
    }

    /// Close the link and cancel any pending reconnect. Safe to call when
    /// never connected and safe to call twice.
    pub async fn disconnect(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.cancel.send(());
            if let Err(e) = active.task.await {
                if !e.is_cancelled() {
                    tracing::warn!("Sync task panicked: {}", e);
                }
            }
        }
        self.status.send_replace(SyncStatus::Disconnected);
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.task.abort();
        }
    }
}

async fn supervise(
    link: Link,
    mut cancelled: oneshot::Receiver<()>,
    status: watch::Sender<SyncStatus>,
) {
    let user = link.user.redacted();
    loop {
        status.send_replace(SyncStatus::Connecting);
        match run_link(&link, &status, &mut cancelled).await {
            Ok(LinkEnd::Cancelled) => break,
            Ok(LinkEnd::Closed) => {
                tracing::info!(user = %user, "Sync connection closed by server");
                status.send_replace(SyncStatus::Disconnected);
            }
            Err(e) => {
                tracing::warn!(user = %user, error = %e, "Sync connection failed");
                status.send_replace(SyncStatus::Error(e.to_string()));
            }
        }

        tokio::select! {
            _ = &mut cancelled => break,
            _ = tokio::time::sleep(link.reconnect_delay) => {
                tracing::debug!(user = %user, "Reconnecting");
            }
        }
    }
    status.send_replace(SyncStatus::Disconnected);
}

async fn send(sink: &mut Sink, message: &SyncMessage) -> Result<(), TransportError> {
    let text = message.encode()?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))
}

/// Changes to send, without client-only values
fn outgoing(store: &SharedStore, select: impl FnOnce(&DocumentStore) -> Changes) -> Changes {
    let store = lock(store);
    store.shareable(select(&store))
}

/// Exchange digests and the changes each side lacks
async fn handshake(link: &Link) -> Result<(Sink, Source), TransportError> {
    let (socket, _) = connect_async(link.url.as_str())
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;
    let (mut sink, mut source) = socket.split();

    let digest = lock(&link.store).digest();
    send(&mut sink, &SyncMessage::Digest { digest }).await?;

    loop {
        let frame = source
            .next()
            .await
            .ok_or_else(|| TransportError::Connection("closed during handshake".into()))?
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let Message::Text(text) = frame else {
            continue;
        };

        match SyncMessage::decode(text.as_str())? {
            SyncMessage::Changes { changes } => {
                lock(&link.store).merge_with(&changes);
            }
            SyncMessage::Digest { digest } => {
                let missing = outgoing(&link.store, |store| store.changes_missing_from(&digest));
                send(&mut sink, &SyncMessage::Changes { changes: missing }).await?;
                return Ok((sink, source));
            }
        }
    }
}

async fn run_link(
    link: &Link,
    status: &watch::Sender<SyncStatus>,
    cancelled: &mut oneshot::Receiver<()>,
) -> Result<LinkEnd, TransportError> {
    // local writes made while the handshake is in flight queue here
    let (outbound_tx, mut outbound) = mpsc::unbounded_channel::<Changes>();
    let _guard = ListenerGuard {
        store: link.store.clone(),
        id: lock(&link.store).add_listener(move |event| {
            if event.source != ChangeSource::Remote {
                let _ = outbound_tx.send(event.changes.clone());
            }
        }),
    };

    let timeout_ms = link.connect_timeout.as_millis() as u64;
    let (mut sink, mut source) = tokio::select! {
        _ = &mut *cancelled => return Ok(LinkEnd::Cancelled),
        result = tokio::time::timeout(link.connect_timeout, handshake(link)) => {
            result.map_err(|_| TransportError::ConnectionTimeout(timeout_ms))??
        }
    };

    status.send_replace(SyncStatus::Connected);
    tracing::info!(user = %link.user.redacted(), "Sync connected");

    loop {
        tokio::select! {
            _ = &mut *cancelled => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(LinkEnd::Cancelled);
            }
            Some(changes) = outbound.recv() => {
                let changes = lock(&link.store).shareable(changes);
                if !changes.is_empty() {
                    send(&mut sink, &SyncMessage::Changes { changes }).await?;
                }
            }
            frame = source.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => return Ok(LinkEnd::Closed),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(TransportError::Connection(e.to_string())),
                };
                match SyncMessage::decode(text.as_str()) {
                    Ok(SyncMessage::Changes { changes }) => {
                        lock(&link.store).merge_with(&changes);
                    }
                    Ok(SyncMessage::Digest { digest }) => {
                        let missing =
                            outgoing(&link.store, |store| store.changes_missing_from(&digest));
                        send(&mut sink, &SyncMessage::Changes { changes: missing }).await?;
                    }
                    Err(e) => tracing::warn!("Ignoring undecodable frame: {}", e),
                }
            }
        }
    }
}
