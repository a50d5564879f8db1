//! One-shot export driven from the command line
//!
//! Runs a session in-process, draws one progress bar per chunk from the
//! progress bus, then moves every generated file into the output
//! directory under its client file name.

use std::path::{Path, PathBuf};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tabled::builder::Builder;
use tabled::settings::object::Rows;
use tabled::settings::{Alignment, Modify, Style};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Result, SessionError};
use crate::export::{
    ChunkDescriptor, ChunkStatus, DownloadId, ExportCoordinator, ExportSession, ProgressEvent,
    StartRequest,
};

/// Result of a finished command-line export.
#[derive(Debug)]
pub struct ExportOutcome {
    pub session: ExportSession,
    /// Files written, in chunk order.
    pub files: Vec<PathBuf>,
}

struct ChunkBars {
    _multi: MultiProgress,
    bars: Vec<ProgressBar>,
}

impl ChunkBars {
    fn new(session: &ExportSession, visible: bool) -> Self {
        let multi = if visible {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };
        let style = ProgressStyle::default_bar()
            .template("{prefix:>8} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");

        let total = session.chunks.len();
        let bars = session
            .chunks
            .iter()
            .map(|chunk| {
                let bar = multi.add(ProgressBar::new(chunk.row_count));
                bar.set_style(style.clone());
                bar.set_prefix(format!("{}/{total}", chunk.index + 1));
                bar
            })
            .collect();
        Self { _multi: multi, bars }
    }

    fn update(&self, chunk: &ChunkDescriptor) {
        let Some(bar) = self.bars.get(chunk.index) else {
            return;
        };
        match chunk.status {
            ChunkStatus::Generating => {
                bar.set_position(chunk.processed_rows);
                let state = if chunk.paused { "paused" } else { "rows/sec" };
                bar.set_message(format!("({:.0} {state})", chunk.processing_speed));
            }
            ChunkStatus::Failed => {
                let reason = chunk.failure.as_ref().map_or("failed", |f| f.message());
                bar.abandon_with_message(format!("failed: {reason}"));
            }
            status if status.has_file() => {
                bar.set_length(chunk.total_rows);
                bar.set_position(chunk.total_rows);
                bar.finish_with_message("ready");
            }
            _ => {}
        }
    }

    fn clear(&self) {
        for bar in &self.bars {
            if !bar.is_finished() {
                bar.abandon();
            }
        }
    }
}

/// Run one export to completion and collect its files in `out`.
///
/// Cancelling `interrupt` cancels the session and fails with
/// [`SessionError::Cancelled`].
pub async fn run_export(
    coordinator: &ExportCoordinator,
    request: StartRequest,
    out: &Path,
    show_progress: bool,
    interrupt: CancellationToken,
) -> Result<ExportOutcome> {
    let owner = request.owner.clone();
    let session = coordinator.start_export(request).await?;
    let id = session.id.clone();
    info!(download_id = %id, chunks = session.chunks.len(), rows = session.total_rows, "export started");

    let bars = ChunkBars::new(&session, show_progress);
    if let Some(mut subscription) = coordinator.subscribe(&id) {
        loop {
            let update = tokio::select! {
                _ = interrupt.cancelled() => {
                    bars.clear();
                    coordinator.cancel(&id, &owner).await?;
                    return Err(SessionError::Cancelled(id.to_string()).into());
                }
                update = subscription.recv() => update,
            };
            let Some(update) = update else {
                break;
            };
            match &update.event {
                ProgressEvent::Chunk { chunk, .. } | ProgressEvent::FileReady { chunk, .. } => {
                    bars.update(chunk)
                }
                ProgressEvent::Session { overall, .. } if overall.status.is_terminal() => break,
                ProgressEvent::Session { .. } => {}
            }
        }
    }
    bars.clear();

    let collected = collect_files(coordinator, &id, &owner, out).await;
    let session = coordinator.session(&id, &owner);
    coordinator.cleanup(&id).await;
    Ok(ExportOutcome {
        session: session?,
        files: collected?,
    })
}

/// Move every generated file into `out` through the download handshake.
async fn collect_files(
    coordinator: &ExportCoordinator,
    id: &DownloadId,
    owner: &str,
    out: &Path,
) -> Result<Vec<PathBuf>> {
    let generated = coordinator.session(id, owner)?;
    let mut files = Vec::new();
    for chunk in generated.chunks.iter().filter(|c| c.status.has_file()) {
        let (path, _) = coordinator.begin_download(id, &chunk.file_name, owner)?;
        let target = out.join(&chunk.client_file_name);
        move_file(&path, &target).await?;
        coordinator.finish_download(id, &chunk.file_name, owner)?;
        debug!(file = %target.display(), "chunk file moved");
        files.push(target);
    }
    Ok(files)
}

/// Rename, falling back to copy and delete when `from` and `to` live on
/// different filesystems.
async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!(from = %from.display(), error = %e, "rename failed; copying instead");
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await
        }
    }
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Per-chunk summary of a finished session.
pub fn summary_table(session: &ExportSession) -> String {
    let mut builder = Builder::default();
    builder.push_record(["#", "File", "Rows", "Size", "Status"].map(String::from));
    for chunk in &session.chunks {
        let status = match &chunk.failure {
            Some(failure) => format!("{} ({})", chunk.status, failure.message()),
            None => chunk.status.to_string(),
        };
        builder.push_record([
            (chunk.index + 1).to_string(),
            chunk.client_file_name.clone(),
            chunk.processed_rows.to_string(),
            chunk.file_size.map(human_size).unwrap_or_else(|| "-".into()),
            status,
        ]);
    }

    let mut table = builder.build();
    table.with(Style::modern());
    table.with(Modify::new(Rows::first()).with(Alignment::center()));
    format!(
        "{table}\n{} rows in {} files ({})",
        session.total_rows,
        session.chunks.len(),
        session.status
    )
}
