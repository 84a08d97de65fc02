//! Directory-backed fallback transport.
//!
//! Used when the primary medium cannot be opened. A shared directory acts as
//! the key/value store: every message is one file in `<dir>/<channel>/`, and
//! a debounced `notify` watcher plays the role of the change notification.
//!
//! File names carry everything the receiver needs before reading the body:
//!
//! ```text
//! 1700000000123-k3j9x0a1b-00000042.msg
//! ^ write time  ^ writer  ^ sequence
//! ```
//!
//! - Files are written to a hidden temp name and renamed into place, so a
//!   reader never sees a partial message
//! - A writer never receives its own files
//! - Files older than the TTL are pruned by every writer on send

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use beacon_core::{MessageCallback, PeerId, Transport, TransportError, TransportSubscription};
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

const EXTENSION: &str = "msg";

/// Cap on remembered file names before old ones are forgotten.
const SEEN_LIMIT: usize = 4096;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory shared by all peers
    pub dir: PathBuf,
    /// Age after which message files are pruned
    pub ttl: Duration,
    /// Watcher debounce period
    pub debounce: Duration,
}

impl StoreConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ttl: Duration::from_secs(10),
            debounce: Duration::from_millis(50),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }
}

/// Parsed message file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFile<'a> {
    pub written_ms: u64,
    pub writer: &'a str,
    pub seq: u64,
}

impl<'a> MessageFile<'a> {
    /// Parse `<ms>-<writer>-<seq>.msg`. Hidden and foreign files yield `None`.
    pub fn parse(name: &'a str) -> Option<Self> {
        if name.starts_with('.') {
            return None;
        }
        let stem = name.strip_suffix(EXTENSION)?.strip_suffix('.')?;
        let mut parts = stem.splitn(3, '-');
        let written_ms = parts.next()?.parse().ok()?;
        let writer = parts.next()?;
        let seq = parts.next()?.parse().ok()?;
        if writer.is_empty() {
            return None;
        }
        Some(Self {
            written_ms,
            writer,
            seq,
        })
    }

    pub fn file_name(written_ms: u64, writer: &str, seq: u64) -> String {
        format!("{written_ms:013}-{writer}-{seq:08}.{EXTENSION}")
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Map a channel name onto a safe directory name.
fn channel_dir_name(channel: &str) -> String {
    channel
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Broadcast medium emulated over a shared directory.
pub struct StoreTransport {
    channel_dir: PathBuf,
    writer: String,
    seq: AtomicU64,
    config: StoreConfig,
}

impl StoreTransport {
    /// Open (creating if needed) the channel directory under `config.dir`.
    pub fn open(channel: &str, config: StoreConfig) -> Result<Self, TransportError> {
        if channel.is_empty() {
            return Err(TransportError::Unavailable("empty channel name".to_string()));
        }
        let channel_dir = config.dir.join(channel_dir_name(channel));
        std::fs::create_dir_all(&channel_dir)?;
        // Resolve symlinks so watcher paths match ours (macOS /var -> /private/var)
        let channel_dir = channel_dir.canonicalize().unwrap_or(channel_dir);

        Ok(Self {
            channel_dir,
            writer: PeerId::generate().to_string(),
            seq: AtomicU64::new(0),
            config,
        })
    }

    pub fn channel_dir(&self) -> &Path {
        &self.channel_dir
    }

    /// Token identifying this endpoint's files.
    pub fn writer(&self) -> &str {
        &self.writer
    }

    /// Delete message files older than the TTL. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let cutoff = now_ms().saturating_sub(self.config.ttl.as_millis() as u64);
        let entries = match std::fs::read_dir(&self.channel_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Cannot list {:?} for pruning: {}", self.channel_dir, e);
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(file) = MessageFile::parse(name) else { continue };
            if file.written_ms < cutoff && std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Pruned {} expired message file(s)", removed);
        }
        removed
    }

    fn existing_names(&self) -> HashSet<String> {
        std::fs::read_dir(&self.channel_dir)
            .map(|entries| {
                entries
                    .flatten()
                    .filter_map(|e| e.file_name().to_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Transport for StoreTransport {
    fn name(&self) -> &'static str {
        "store"
    }

    fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let name = MessageFile::file_name(now_ms(), &self.writer, seq);
        write_atomically(&self.channel_dir, &name, data)?;

        self.prune();
        Ok(())
    }

    fn subscribe(&self, on_message: MessageCallback) -> Result<TransportSubscription, TransportError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        // Anything already on disk predates us
        let seen = Arc::new(Mutex::new(self.existing_names()));

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer = self.writer.clone();
        let ttl_ms = self.config.ttl.as_millis() as u64;

        let mut debouncer = new_debouncer(
            self.config.debounce,
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(data) = read_event(&event.path, &writer, ttl_ms, &seen) {
                            if tx.send(data).is_err() {
                                // Subscription released
                                return;
                            }
                        }
                    }
                }
                Err(e) => error!("Store watcher error: {}", e),
            },
        )
        .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        debouncer
            .watcher()
            .watch(&self.channel_dir, RecursiveMode::NonRecursive)
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        let task = runtime.spawn(async move {
            while let Some(data) = rx.recv().await {
                on_message(&data);
            }
        });

        debug!("Watching {:?} for messages", self.channel_dir);

        Ok(TransportSubscription::new(move || {
            drop(debouncer);
            task.abort();
        }))
    }
}

/// Read a newly observed message file, or `None` if it should be skipped.
/// Write `data` to a hidden temp file in `dir` and rename it to `name`.
///
/// The temp file is removed if either step fails.
fn write_atomically(dir: &Path, name: &str, data: &[u8]) -> std::io::Result<()> {
    let tmp = dir.join(format!(".{name}.tmp"));
    let result = std::fs::write(&tmp, data).and_then(|()| std::fs::rename(&tmp, dir.join(name)));
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

fn read_event(
    path: &Path,
    own_writer: &str,
    ttl_ms: u64,
    seen: &Mutex<HashSet<String>>,
) -> Option<Vec<u8>> {
    let name = path.file_name()?.to_str()?;
    let file = MessageFile::parse(name)?;
    if file.writer == own_writer {
        return None;
    }

    let now = now_ms();
    if file.written_ms.saturating_add(ttl_ms) < now {
        return None;
    }

    {
        let mut seen = seen.lock().unwrap_or_else(|e| e.into_inner());
        if !seen.insert(name.to_string()) {
            return None;
        }
        if seen.len() > SEEN_LIMIT {
            let cutoff = now.saturating_sub(ttl_ms * 2);
            seen.retain(|n| MessageFile::parse(n).is_some_and(|f| f.written_ms >= cutoff));
        }
    }

    match std::fs::read(path) {
        Ok(data) => Some(data),
        Err(e) => {
            // Pruned between the event and the read
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to read message file {:?}: {}", path, e);
            }
            None
        }
    }
}
