use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use chrono::Local;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc as tokio_mpsc;

const EVENT_RING_MAX: usize = 2000;
const DAEMON_LOG_NAME: &str = "servicemaster.log";
const DAEMON_LOG_MAX_BYTES: u64 = 10 * 1024 * 1024;
const DAEMON_LOG_BACKUPS: usize = 10;

static DAEMON_LOG_TX: OnceLock<tokio_mpsc::UnboundedSender<String>> = OnceLock::new();
static EVENTS: OnceLock<Mutex<VecDeque<EventEntry>>> = OnceLock::new();

#[derive(Debug, Clone, Serialize)]
pub struct EventEntry {
    pub ts: String,
    pub component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub message: String,
}

fn ring() -> &'static Mutex<VecDeque<EventEntry>> {
    EVENTS.get_or_init(|| Mutex::new(VecDeque::new()))
}

/// Emit one structured daemon event: stderr, the in-memory ring, and (once the
/// writer task is up) the daemon log file.
pub fn sm_event(component: &str, service: Option<&str>, msg: impl AsRef<str>) {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f").to_string();
    let line = match service {
        Some(s) => format!("{ts} [{component}] service={s} {}", msg.as_ref()),
        None => format!("{ts} [{component}] {}", msg.as_ref()),
    };
    eprintln!("{line}");
    if let Some(tx) = DAEMON_LOG_TX.get() {
        let _ = tx.send(line);
    }

    let entry = EventEntry {
        ts,
        component: component.to_string(),
        service: service.map(|s| s.to_string()),
        message: msg.as_ref().to_string(),
    };
    let mut q = ring().lock().unwrap_or_else(|p| p.into_inner());
    q.push_back(entry);
    while q.len() > EVENT_RING_MAX {
        q.pop_front();
    }
}

/// Most recent `n` events, oldest first.
pub fn recent(n: usize) -> Vec<EventEntry> {
    let q = ring().lock().unwrap_or_else(|p| p.into_inner());
    q.iter().rev().take(n).rev().cloned().collect()
}

/// Start the background task that mirrors events into
/// `<logs_dir>/servicemaster.log`, rotating by size with numbered backups.
/// Safe to call more than once; only the first call wires the channel.
pub fn start_log_writer(logs_dir: &Path) {
    let (tx, mut rx) = tokio_mpsc::unbounded_channel::<String>();
    if DAEMON_LOG_TX.set(tx).is_err() {
        return;
    }
    let path: PathBuf = logs_dir.join(DAEMON_LOG_NAME);
    let dir = logs_dir.to_path_buf();

    tokio::spawn(async move {
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            eprintln!("[log] failed to create log directory {}: {e}", dir.display());
            return;
        }
        let mut f = match open_append(&path).await {
            Ok(f) => f,
            Err(e) => {
                eprintln!("[log] failed to open daemon log file {}: {e}", path.display());
                return;
            }
        };
        let mut bytes_written: u64 = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        while let Some(line) = rx.recv().await {
            if DAEMON_LOG_MAX_BYTES > 0 && bytes_written >= DAEMON_LOG_MAX_BYTES {
                let _ = f.flush().await;
                if let Ok(reopened) = rotate_numbered_reopen(&path, DAEMON_LOG_BACKUPS).await {
                    f = reopened;
                    bytes_written = 0;
                }
            }

            let mut s = line;
            if !s.ends_with('\n') {
                s.push('\n');
            }
            if f.write_all(s.as_bytes()).await.is_ok() {
                bytes_written = bytes_written.saturating_add(s.len() as u64);
            }
        }
    });
}

async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

/// Shift `base.1 -> base.2 -> ...`, move the live file to `base.1`, and
/// reopen a fresh live file. The oldest backup past `backups` falls off.
async fn rotate_numbered_reopen(
    base_path: &Path,
    backups: usize,
) -> std::io::Result<tokio::fs::File> {
    let numbered = |n: usize| -> PathBuf {
        let mut os = base_path.as_os_str().to_owned();
        os.push(format!(".{n}"));
        PathBuf::from(os)
    };

    let _ = tokio::fs::remove_file(numbered(backups)).await;
    for n in (1..backups).rev() {
        let from = numbered(n);
        if tokio::fs::metadata(&from).await.is_ok() {
            let _ = tokio::fs::rename(&from, numbered(n + 1)).await;
        }
    }
    if tokio::fs::metadata(base_path).await.is_ok() {
        let _ = tokio::fs::rename(base_path, numbered(1)).await;
    }
    open_append(base_path).await
}
