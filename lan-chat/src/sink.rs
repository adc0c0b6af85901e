//! Event/audit log collaborators.
//!
//! The chat core reports connections, disconnections, messages, errors and
//! lifecycle events through [`EventSink`]. Every call is fire-and-forget: a
//! sink that cannot record an entry drops it rather than slowing down or
//! failing chat delivery.

use std::{
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Local;
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
    sync::{mpsc, oneshot},
};
use tracing::{error, info, warn};

const SERVER_LOG_FILE: &str = "server.log";
const MESSAGES_LOG_FILE: &str = "messages.log";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub trait EventSink: Send + Sync {
    fn log_connect(&self, user: &str, addr: SocketAddr);
    fn log_disconnect(&self, user: &str);
    fn log_message(&self, user: &str, text: &str);
    fn log_error(&self, text: &str);
    fn log_server_event(&self, text: &str);
}

/// Emits every entry as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn log_connect(&self, user: &str, addr: SocketAddr) {
        info!(user, %addr, "user connected");
    }

    fn log_disconnect(&self, user: &str) {
        info!(user, "user disconnected");
    }

    fn log_message(&self, user: &str, text: &str) {
        info!(user, text, "chat message");
    }

    fn log_error(&self, text: &str) {
        error!("{text}");
    }

    fn log_server_event(&self, text: &str) {
        info!("{text}");
    }
}

/// Forwards each entry to several sinks in order.
#[derive(Default, Clone)]
pub struct Fanout {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for Fanout {
    fn log_connect(&self, user: &str, addr: SocketAddr) {
        self.sinks.iter().for_each(|sink| sink.log_connect(user, addr));
    }

    fn log_disconnect(&self, user: &str) {
        self.sinks.iter().for_each(|sink| sink.log_disconnect(user));
    }

    fn log_message(&self, user: &str, text: &str) {
        self.sinks.iter().for_each(|sink| sink.log_message(user, text));
    }

    fn log_error(&self, text: &str) {
        self.sinks.iter().for_each(|sink| sink.log_error(text));
    }

    fn log_server_event(&self, text: &str) {
        self.sinks.iter().for_each(|sink| sink.log_server_event(text));
    }
}

#[derive(Debug, Clone, Copy)]
enum LogFile {
    Server,
    Messages,
}

enum Record {
    Line { file: LogFile, line: String },
    Flush(oneshot::Sender<()>),
}

/// Appends timestamped entries to `server.log` and `messages.log` in a
/// directory.
///
/// Callers only push onto an unbounded channel; a background task owns both
/// files and performs the writes.
pub struct FileSink {
    dir: PathBuf,
    records: mpsc::UnboundedSender<Record>,
}

impl FileSink {
    /// Creates `dir` if needed, opens both log files for appending and spawns
    /// the writer task. Must be called from within a tokio runtime.
    pub async fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let server_log = open_append(&dir.join(SERVER_LOG_FILE)).await?;
        let messages_log = open_append(&dir.join(MESSAGES_LOG_FILE)).await?;

        let (records, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_records(rx, server_log, messages_log));

        Ok(Self { dir, records })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Waits until every entry pushed before this call has been written.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.records.send(Record::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    fn push(&self, file: LogFile, entry: String) {
        let line = format!("[{}] {entry}", Local::now().format(TIMESTAMP_FORMAT));
        if self.records.send(Record::Line { file, line }).is_err() {
            warn!("file log writer has stopped; dropping entry");
        }
    }
}

impl EventSink for FileSink {
    fn log_connect(&self, user: &str, addr: SocketAddr) {
        self.push(LogFile::Server, format!("Connection: {user} from {addr}"));
    }

    fn log_disconnect(&self, user: &str) {
        self.push(LogFile::Server, format!("Disconnection: {user}"));
    }

    fn log_message(&self, user: &str, text: &str) {
        self.push(LogFile::Messages, format!("[{user}] {text}"));
    }

    fn log_error(&self, text: &str) {
        self.push(LogFile::Server, format!("[ERROR] {text}"));
    }

    fn log_server_event(&self, text: &str) {
        self.push(LogFile::Server, text.to_string());
    }
}

async fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

async fn append(file: &mut File, line: &str) -> io::Result<()> {
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}

async fn write_records(
    mut rx: mpsc::UnboundedReceiver<Record>,
    mut server_log: File,
    mut messages_log: File,
) {
    while let Some(record) = rx.recv().await {
        match record {
            Record::Line { file, mut line } => {
                line.push('\n');
                let target = match file {
                    LogFile::Server => &mut server_log,
                    LogFile::Messages => &mut messages_log,
                };
                if let Err(err) = append(target, &line).await {
                    warn!(?file, error = ?err, "failed to write log entry");
                }
            }
            Record::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
