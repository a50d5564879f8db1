//! Live progress transport
//!
//! Bridges the progress bus to one bidirectional client connection. Frames
//! in are JSON [`ClientMessage`]s; frames out are [`Envelope`]s. The adapter
//! is agnostic of the wire: the server feeds it WebSocket text frames, tests
//! feed it channels.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::export::{
    ChunkDescriptor, DownloadId, ExportCoordinator, ExportSession, OverallProgress, ProgressEvent,
    ProgressUpdate, StartRequest, Subscription,
};
use crate::query::SearchParams;

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Follow a session, starting it when it does not exist yet.
    #[serde(rename_all = "camelCase")]
    Subscribe {
        download_id: String,
        #[serde(default)]
        search_id: Option<String>,
        #[serde(default)]
        search_params: Option<SearchParams>,
        #[serde(default)]
        total_rows: Option<u64>,
    },
    /// Start a session and follow it.
    #[serde(rename_all = "camelCase")]
    StartDownload {
        #[serde(default)]
        download_id: Option<String>,
        search_params: SearchParams,
        #[serde(default)]
        total_rows: Option<u64>,
    },
}

/// Payload of a frame sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        status: String,
    },
    /// A chunk tick (descriptor fields inlined) or a session status change.
    Progress {
        #[serde(flatten)]
        chunk: Option<ChunkDescriptor>,
        overall: OverallProgress,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    FileReady {
        #[serde(flatten)]
        chunk: ChunkDescriptor,
        overall: OverallProgress,
    },
    #[serde(rename_all = "camelCase")]
    CountUpdate {
        expected_rows: Option<u64>,
        actual_rows: u64,
    },
    Error {
        message: String,
    },
}

/// A frame sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_id: Option<DownloadId>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub message: ServerMessage,
}

impl Envelope {
    pub fn new(download_id: Option<DownloadId>, message: ServerMessage) -> Self {
        Self {
            download_id,
            timestamp: Utc::now(),
            message,
        }
    }

    pub fn error(download_id: Option<DownloadId>, message: impl Into<String>) -> Self {
        Self::new(
            download_id,
            ServerMessage::Error {
                message: message.into(),
            },
        )
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<ProgressUpdate> for Envelope {
    fn from(update: ProgressUpdate) -> Self {
        let message = match update.event {
            ProgressEvent::Chunk { chunk, overall } => ServerMessage::Progress {
                message: chunk.failure.as_ref().map(|f| f.message().to_string()),
                chunk: Some(chunk),
                overall,
            },
            ProgressEvent::FileReady { chunk, overall } => ServerMessage::FileReady { chunk, overall },
            ProgressEvent::Session { overall, message } => ServerMessage::Progress {
                chunk: None,
                overall,
                message,
            },
        };
        Envelope::new(Some(update.download_id), message)
    }
}

/// Per-connection state.
#[derive(Default)]
struct Connection {
    watching: Option<DownloadId>,
    subscription: Option<Subscription>,
    counted: HashSet<DownloadId>,
}

async fn next_update(subscription: &mut Option<Subscription>) -> Option<ProgressUpdate> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

/// Serves client connections on behalf of an [`ExportCoordinator`].
#[derive(Clone)]
pub struct TransportAdapter {
    coordinator: ExportCoordinator,
    reconnect_grace: Duration,
}

impl TransportAdapter {
    /// `reconnect_grace` is how long an abandoned session may wait for a
    /// new connection before it is cancelled.
    pub fn new(coordinator: ExportCoordinator, reconnect_grace: Duration) -> Self {
        Self {
            coordinator,
            reconnect_grace,
        }
    }

    /// Run one connection until the client goes away.
    pub async fn serve<S>(&self, owner: &str, mut incoming: S, outgoing: mpsc::Sender<Envelope>)
    where
        S: Stream<Item = String> + Unpin + Send,
    {
        let mut conn = Connection::default();
        loop {
            let delivered = tokio::select! {
                frame = incoming.next() => match frame {
                    Some(text) => self.handle_frame(owner, &text, &mut conn, &outgoing).await,
                    None => break,
                },
                update = next_update(&mut conn.subscription) => match update {
                    Some(update) => outgoing.send(update.into()).await.is_ok(),
                    None => {
                        debug!(download_id = ?conn.watching, "progress topic closed");
                        conn.subscription = None;
                        true
                    }
                },
            };
            if !delivered {
                break;
            }
        }

        debug!(owner, download_id = ?conn.watching, "connection closed");
        conn.subscription = None;
        if let Some(id) = conn.watching.take() {
            self.release(&id, owner, true);
        }
    }

    /// Handle one text frame. Returns false once the client is gone.
    async fn handle_frame(
        &self,
        owner: &str,
        text: &str,
        conn: &mut Connection,
        outgoing: &mpsc::Sender<Envelope>,
    ) -> bool {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "malformed client frame");
                return outgoing
                    .send(Envelope::error(None, format!("invalid message: {e}")))
                    .await
                    .is_ok();
            }
        };

        let (requested, params, total_rows) = match message {
            ClientMessage::Subscribe {
                download_id,
                search_id,
                search_params,
                total_rows,
            } => {
                debug!(download_id, search_id = ?search_id, "subscribe");
                (Some(download_id), search_params, total_rows)
            }
            ClientMessage::StartDownload {
                download_id,
                search_params,
                total_rows,
            } => (download_id, Some(search_params), total_rows),
        };

        let session = match self.resolve(owner, requested, params, total_rows).await {
            Ok(session) => session,
            Err(envelope) => return outgoing.send(envelope).await.is_ok(),
        };
        self.watch(owner, &session, conn, outgoing).await
    }

    /// Find the requested session or start it.
    async fn resolve(
        &self,
        owner: &str,
        requested: Option<String>,
        params: Option<SearchParams>,
        total_rows: Option<u64>,
    ) -> Result<ExportSession, Envelope> {
        let id = requested.as_deref().map(DownloadId::from_client);
        if let Some(id) = &id {
            if self.coordinator.contains(id) {
                return self
                    .coordinator
                    .session(id, owner)
                    .map_err(|e| Envelope::error(Some(id.clone()), e.to_string()));
            }
        }

        let Some(params) = params else {
            return Err(Envelope::error(id, "unknown download and no search parameters"));
        };
        let request = StartRequest {
            download_id: id.as_ref().map(|id| id.to_string()),
            expected_rows: total_rows,
            ..StartRequest::new(owner, params)
        };
        self.coordinator.start_export(request).await.map_err(|e| {
            warn!(download_id = ?id, error = %e, "failed to start export");
            Envelope::error(id, e.to_string())
        })
    }

    /// Point the connection at `session`, acknowledging every subscribe and
    /// reporting the count once.
    async fn watch(
        &self,
        owner: &str,
        session: &ExportSession,
        conn: &mut Connection,
        outgoing: &mpsc::Sender<Envelope>,
    ) -> bool {
        let id = &session.id;
        if conn.watching.as_ref() != Some(id) {
            if let Some(previous) = conn.watching.take() {
                conn.subscription = None;
                self.release(&previous, owner, false);
            }
            self.coordinator.attach(id);
            conn.watching = Some(id.clone());
        }

        let connected = ServerMessage::Connected {
            status: "connected".into(),
        };
        if outgoing.send(Envelope::new(Some(id.clone()), connected)).await.is_err() {
            return false;
        }

        if conn.counted.insert(id.clone()) {
            let count = ServerMessage::CountUpdate {
                expected_rows: session.expected_rows,
                actual_rows: session.total_rows,
            };
            if outgoing.send(Envelope::new(Some(id.clone()), count)).await.is_err() {
                return false;
            }
        }

        // Resubscribing replays the current state of every chunk.
        conn.subscription = self.coordinator.subscribe(id);
        info!(download_id = %id, chunks = session.chunks.len(), "client watching export");
        true
    }

    /// Detach from a session; an abandoned session with work in flight is
    /// cancelled once the reconnect grace passes.
    fn release(&self, id: &DownloadId, owner: &str, abandon: bool) {
        let Some((remaining, in_flight)) = self.coordinator.detach(id) else {
            return;
        };
        if !abandon || remaining > 0 || !in_flight {
            return;
        }

        let coordinator = self.coordinator.clone();
        let grace = self.reconnect_grace;
        let id = id.clone();
        let owner = owner.to_string();
        tokio::spawn(async move {
            if !grace.is_zero() {
                tokio::time::sleep(grace).await;
                match coordinator.connection_state(&id) {
                    Some((0, true)) => {}
                    _ => return,
                }
            }
            info!(download_id = %id, "client disconnected; cancelling export");
            if let Err(e) = coordinator.cancel(&id, &owner).await {
                debug!(download_id = %id, error = %e, "cancel after disconnect failed");
            }
        });
    }
}
