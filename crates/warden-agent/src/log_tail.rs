use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const READ_CHUNK: usize = 64 * 1024;

/// Follows a growing text file and streams complete lines.
///
/// Tolerates the file not existing yet, truncation (size shrinks below the read
/// position) and rotation (the path now names a different file).
#[derive(Debug)]
pub struct LogTailReader {
    path: PathBuf,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl LogTailReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_poll_interval(mut self, every: Duration) -> Self {
        self.poll_interval = every;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tail from the current end of file.
    pub fn start(&self) -> mpsc::UnboundedReceiver<String> {
        self.spawn(false)
    }

    /// Replay existing content first, then keep tailing.
    pub fn start_at_beginning(&self) -> mpsc::UnboundedReceiver<String> {
        self.spawn(true)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn spawn(&self, from_start: bool) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(
            self.path.clone(),
            self.poll_interval,
            from_start,
            tx,
            self.cancel.child_token(),
        ));
        rx
    }
}

impl Drop for LogTailReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Tail {
    file: File,
    pos: u64,
    id: Option<u64>,
    partial: Vec<u8>,
}

#[cfg(unix)]
fn file_id(meta: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn file_id(_meta: &std::fs::Metadata) -> Option<u64> {
    None
}

async fn run(
    path: PathBuf,
    poll: Duration,
    from_start: bool,
    tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
) {
    // Content present at start is skipped in "from now" mode; a file created later
    // (or a rotated replacement) is always read from its beginning.
    let mut skip_existing = !from_start && tokio::fs::metadata(&path).await.is_ok();
    let mut tail: Option<Tail> = None;

    loop {
        if tx.is_closed() {
            return;
        }

        if tail.is_none() {
            tail = open(&path, skip_existing).await;
            if tail.is_some() {
                skip_existing = false;
            }
        }

        if let Some(t) = tail.as_mut() {
            match poll_once(&path, t, &tx).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(path = %path.display(), "log file rotated; reopening");
                    // Drain whatever the old handle still has before switching.
                    let _ = read_new(t, &tx).await;
                    flush_partial(t, &tx);
                    tail = None;
                    continue;
                }
                Err(e) => {
                    trace!(path = %path.display(), error = %e, "log tail read failed");
                    tail = None;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

async fn open(path: &Path, at_end: bool) -> Option<Tail> {
    let file = File::open(path).await.ok()?;
    let meta = file.metadata().await.ok()?;
    let pos = if at_end { meta.len() } else { 0 };
    Some(Tail {
        file,
        pos,
        id: file_id(&meta),
        partial: Vec::new(),
    })
}

/// Returns `Ok(false)` when the path now refers to a different file.
async fn poll_once(
    path: &Path,
    t: &mut Tail,
    tx: &mpsc::UnboundedSender<String>,
) -> std::io::Result<bool> {
    if let Ok(meta) = tokio::fs::metadata(path).await {
        let current = file_id(&meta);
        if current.is_some() && current != t.id {
            return Ok(false);
        }
        if meta.len() < t.pos {
            debug!(path = %path.display(), "log file truncated; restarting from top");
            t.pos = 0;
            t.partial.clear();
        }
    }
    read_new(t, tx).await?;
    Ok(true)
}

async fn read_new(t: &mut Tail, tx: &mpsc::UnboundedSender<String>) -> std::io::Result<()> {
    t.file.seek(SeekFrom::Start(t.pos)).await?;
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = t.file.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        t.pos += n as u64;
        t.partial.extend_from_slice(&buf[..n]);
        emit_lines(&mut t.partial, tx);
    }
}

fn emit_lines(partial: &mut Vec<u8>, tx: &mpsc::UnboundedSender<String>) {
    while let Some(nl) = partial.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = partial.drain(..=nl).collect();
        let mut s = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
        if s.ends_with('\r') {
            s.pop();
        }
        let _ = tx.send(s);
    }
}

fn flush_partial(t: &mut Tail, tx: &mpsc::UnboundedSender<String>) {
    if t.partial.is_empty() {
        return;
    }
    let s = String::from_utf8_lossy(&t.partial).into_owned();
    t.partial.clear();
    let _ = tx.send(s);
}
