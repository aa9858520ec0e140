use std::{
    io::ErrorKind,
    net::SocketAddr,
    sync::{
        Arc, Mutex as StdMutex, Weak,
        atomic::{AtomicI32, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::Mutex,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use warden_proto::{
    DecodeError,
    rcon::{
        AUTH_FAILED_ID, Packet, SERVERDATA_AUTH_RESPONSE, SERVERDATA_RESPONSE_VALUE, frame_len,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum RconError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("connect to {0} timed out")]
    ConnectTimeout(SocketAddr),
    #[error("rcon authentication rejected by {0}")]
    AuthRejected(SocketAddr),
    #[error("timed out waiting for rcon response")]
    Timeout,
    #[error("rcon i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("rcon protocol error: {0}")]
    Protocol(#[from] DecodeError),
    #[error("rcon request cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct RconOptions {
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    /// Idle interval after which an empty command is sent to keep the session open.
    pub keep_alive: Option<Duration>,
}

impl Default for RconOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(10),
            keep_alive: Some(Duration::from_secs(60)),
        }
    }
}

struct Connection {
    stream: TcpStream,
}

/// Persistent remote-console session.
///
/// The TCP connection is opened lazily on the first [`RconClient::send`] and
/// re-established transparently when the server drops it.
pub struct RconClient {
    addr: SocketAddr,
    password: String,
    opts: RconOptions,
    conn: Mutex<Option<Connection>>,
    next_id: AtomicI32,
    last_used: StdMutex<Instant>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RconClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RconClient")
            .field("addr", &self.addr)
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}

impl RconClient {
    /// Must be called from within a tokio runtime when keep-alive is enabled.
    pub fn new(addr: SocketAddr, password: impl Into<String>, opts: RconOptions) -> Arc<Self> {
        let client = Arc::new(Self {
            addr,
            password: password.into(),
            opts,
            conn: Mutex::new(None),
            next_id: AtomicI32::new(1),
            last_used: StdMutex::new(Instant::now()),
            cancel: CancellationToken::new(),
        });

        if let Some(every) = opts.keep_alive {
            tokio::spawn(keep_alive_loop(
                Arc::downgrade(&client),
                every,
                client.cancel.clone(),
            ));
        }
        client
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    pub async fn close(&self) {
        self.conn.lock().await.take();
    }

    /// Sends one command and returns the server's text response.
    pub async fn send(&self, command: &str, cancel: &CancellationToken) -> Result<String, RconError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RconError::Cancelled),
            res = self.send_inner(command) => res,
        }
    }

    async fn send_inner(&self, command: &str) -> Result<String, RconError> {
        let mut guard = self.conn.lock().await;

        // One transparent reconnect when a cached connection turns out to be dead.
        for attempt in 0..2 {
            let reused = guard.is_some();
            let mut conn = match guard.take() {
                Some(c) => c,
                None => self.connect().await?,
            };

            let id = self.next_id();
            match self.exchange(&mut conn, id, command).await {
                Ok(body) => {
                    *guard = Some(conn);
                    *self.last_used.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
                    return Ok(body);
                }
                Err(RconError::Io(e)) if attempt == 0 && reused => {
                    debug!(addr = %self.addr, error = %e, "rcon connection lost; reconnecting");
                }
                Err(e) => return Err(e),
            }
        }

        Err(RconError::Io(std::io::Error::new(
            ErrorKind::NotConnected,
            "rcon connection could not be re-established",
        )))
    }

    fn next_id(&self) -> i32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) & i32::MAX;
        if id == 0 { 1 } else { id }
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    async fn connect(&self) -> Result<Connection, RconError> {
        let stream = tokio::time::timeout(self.opts.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| RconError::ConnectTimeout(self.addr))?
            .map_err(|source| RconError::Connect {
                addr: self.addr,
                source,
            })?;
        stream.set_nodelay(true).ok();
        let mut conn = Connection { stream };

        let id = self.next_id();
        write_packet(&mut conn.stream, &Packet::auth(id, &self.password)).await?;
        loop {
            let p = self.read_with_timeout(&mut conn.stream).await?;
            if p.kind != SERVERDATA_AUTH_RESPONSE {
                // Source servers send an empty RESPONSE_VALUE ahead of the auth result.
                continue;
            }
            if p.id == AUTH_FAILED_ID {
                return Err(RconError::AuthRejected(self.addr));
            }
            if p.id == id {
                break;
            }
        }

        debug!(addr = %self.addr, "rcon authenticated");
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        Ok(conn)
    }

    async fn exchange(&self, conn: &mut Connection, id: i32, command: &str) -> Result<String, RconError> {
        write_packet(&mut conn.stream, &Packet::command(id, command)).await?;
        loop {
            let p = self.read_with_timeout(&mut conn.stream).await?;
            if p.id == id && p.kind == SERVERDATA_RESPONSE_VALUE {
                return Ok(p.body);
            }
            // Late answers to earlier (timed out) requests.
        }
    }

    async fn read_with_timeout(&self, stream: &mut TcpStream) -> Result<Packet, RconError> {
        tokio::time::timeout(self.opts.response_timeout, read_packet(stream))
            .await
            .map_err(|_| RconError::Timeout)?
    }
}

impl Drop for RconClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn write_packet(stream: &mut TcpStream, packet: &Packet) -> Result<(), RconError> {
    stream.write_all(&packet.encode()).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_packet(stream: &mut TcpStream) -> Result<Packet, RconError> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await?;
    let len = frame_len(prefix)?;
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame).await?;
    Ok(Packet::decode(&frame)?)
}

async fn keep_alive_loop(client: Weak<RconClient>, every: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(every) => {}
        }
        let Some(client) = client.upgrade() else {
            return;
        };
        if client.idle_for() < every || !client.is_connected().await {
            continue;
        }
        if let Err(e) = client.send_inner("").await {
            warn!(addr = %client.addr, error = %e, "rcon keep-alive failed");
        }
    }
}
