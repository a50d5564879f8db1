//! Export session handlers: the progress socket, file downloads and
//! session control.

use std::io;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt, future, stream};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use super::{AppState, owner};
use crate::error::Result;
use crate::export::{ChunkDescriptor, DownloadId, ExportCoordinator, ExportSession, OverallProgress};
use crate::transport::{Envelope, TransportAdapter};

const OUTGOING_BUFFER: usize = 64;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SocketQuery {
    #[serde(default)]
    user_id: Option<String>,
}

/// Browsers cannot set headers on a WebSocket handshake, so the user id
/// may also come as a `userId` query parameter.
pub(super) async fn websocket(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SocketQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let owner = match owner(&headers) {
        Ok(owner) => owner,
        Err(e) => query.user_id.filter(|u| !u.is_empty()).ok_or(e)?,
    };
    let transport = state.transport.clone();
    Ok(ws.on_upgrade(move |socket| bridge(socket, transport, owner)))
}

async fn bridge(socket: WebSocket, transport: TransportAdapter, owner: String) {
    let (mut sink, frames) = socket.split();
    let (outgoing, mut rx) = mpsc::channel::<Envelope>(OUTGOING_BUFFER);

    let forward = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let text = match envelope.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "failed to encode frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let incoming = Box::pin(
        frames
            .take_while(|frame| future::ready(matches!(frame, Ok(m) if !matches!(m, Message::Close(_)))))
            .filter_map(|frame| {
                future::ready(match frame {
                    Ok(Message::Text(text)) => Some(text),
                    _ => None,
                })
            }),
    );

    transport.serve(&owner, incoming, outgoing).await;
    let _ = forward.await;
    debug!(owner, "socket closed");
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct DownloadQuery {
    download_id: String,
    file: String,
}

/// An open file transfer. Dropped unfinished, it hands the chunk back
/// to Ready.
struct Transfer {
    coordinator: ExportCoordinator,
    id: DownloadId,
    file: String,
    owner: String,
    done: bool,
}

impl Transfer {
    fn finish(mut self) {
        self.done = true;
        if let Err(e) = self.coordinator.finish_download(&self.id, &self.file, &self.owner) {
            warn!(download_id = %self.id, file = %self.file, error = %e, "download acknowledgement failed");
        }
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        debug!(download_id = %self.id, file = %self.file, "transfer ended early");
        if let Err(e) = self.coordinator.abort_download(&self.id, &self.file, &self.owner) {
            debug!(download_id = %self.id, file = %self.file, error = %e, "failed to release transfer");
        }
    }
}

/// File contents followed by the acknowledgement, which only runs once
/// the last byte was handed to the connection.
fn transfer_body(
    file: tokio::fs::File,
    transfer: Transfer,
) -> impl futures::Stream<Item = io::Result<Bytes>> + Send {
    let acknowledge = stream::once(async move {
        transfer.finish();
        None::<io::Result<Bytes>>
    })
    .filter_map(future::ready);
    ReaderStream::new(file).chain(acknowledge)
}

/// Stream one chunk file. The chunk is acknowledged as Completed once
/// the whole body has been handed to the connection; an aborted transfer
/// returns it to Ready.
pub(super) async fn download_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DownloadQuery>,
) -> Result<Response> {
    let owner = owner(&headers)?;
    let id = DownloadId::from_client(&query.download_id);
    let (path, chunk) = state.coordinator.begin_download(&id, &query.file, &owner)?;
    let transfer = Transfer {
        coordinator: state.coordinator.clone(),
        id,
        file: chunk.file_name.clone(),
        owner,
        done: false,
    };
    let file = tokio::fs::File::open(&path).await?;

    let body = Body::from_stream(transfer_body(file, transfer));
    let disposition = format!("attachment; filename=\"{}\"", chunk.client_file_name);
    Ok((
        [
            (CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

pub(super) async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ExportSession>> {
    let owner = owner(&headers)?;
    let session = state.coordinator.session(&DownloadId::from_client(&id), &owner)?;
    Ok(Json(session))
}

pub(super) async fn pause(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<OverallProgress>> {
    let owner = owner(&headers)?;
    let overall = state.coordinator.pause(&DownloadId::from_client(&id), &owner)?;
    Ok(Json(overall))
}

pub(super) async fn resume(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<OverallProgress>> {
    let owner = owner(&headers)?;
    let overall = state.coordinator.resume(&DownloadId::from_client(&id), &owner)?;
    Ok(Json(overall))
}

pub(super) async fn cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ExportSession>> {
    let owner = owner(&headers)?;
    let session = state
        .coordinator
        .cancel(&DownloadId::from_client(&id), &owner)
        .await?;
    Ok(Json(session))
}

/// Drop a session and its files right away.
pub(super) async fn remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let owner = owner(&headers)?;
    let id = DownloadId::from_client(&id);
    state.coordinator.session(&id, &owner)?;
    state.coordinator.cleanup(&id).await;
    Ok(StatusCode::NO_CONTENT)
}

/// Explicit acknowledgement for clients that fetched a file another way.
pub(super) async fn complete_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, file)): Path<(String, String)>,
) -> Result<Json<ChunkDescriptor>> {
    let owner = owner(&headers)?;
    let chunk = state
        .coordinator
        .finish_download(&DownloadId::from_client(&id), &file, &owner)?;
    Ok(Json(chunk))
}
