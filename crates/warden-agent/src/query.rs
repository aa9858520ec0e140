use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span};
use warden_proto::a2s::{self, InfoReply, ServerInfo};

// Servers may ask for a fresh challenge more than once.
const MAX_CHALLENGES: usize = 3;
const MAX_DATAGRAM: usize = 1400;

/// Latest result of the query loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuerySnapshot {
    pub online: bool,
    pub players: u32,
    pub max_players: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive failed polls before the server is reported offline.
    pub failure_threshold: u32,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            failure_threshold: 3,
        }
    }
}

/// Polls a game server over the Source Query protocol on its own task.
///
/// The loop runs until [`QueryClient::stop`] is called or the client is dropped.
#[derive(Debug)]
pub struct QueryClient {
    addr: SocketAddr,
    latest: Arc<Mutex<QuerySnapshot>>,
    cancel: CancellationToken,
}

impl QueryClient {
    pub fn spawn(addr: SocketAddr, opts: QueryOptions) -> Self {
        let latest = Arc::new(Mutex::new(QuerySnapshot::default()));
        let cancel = CancellationToken::new();

        let span = info_span!("query", %addr);
        tokio::spawn(
            poll_loop(addr, opts, latest.clone(), cancel.clone()).instrument(span),
        );

        Self {
            addr,
            latest,
            cancel,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn snapshot(&self) -> QuerySnapshot {
        *self.latest.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for QueryClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn poll_loop(
    addr: SocketAddr,
    opts: QueryOptions,
    latest: Arc<Mutex<QuerySnapshot>>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(opts.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let res = tokio::select! {
            _ = cancel.cancelled() => break,
            res = query_info(addr, opts.timeout) => res,
        };

        let next = match res {
            Ok(info) => {
                failures = 0;
                Some(QuerySnapshot {
                    online: true,
                    players: u32::from(info.players),
                    max_players: u32::from(info.max_players),
                })
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                debug!(error = %e, failures, "query failed");
                (failures >= opts.failure_threshold.max(1)).then(QuerySnapshot::default)
            }
        };

        if let Some(next) = next {
            *latest.lock().unwrap_or_else(|e| e.into_inner()) = next;
        }
    }
}

/// One `A2S_INFO` exchange including the challenge handshake.
pub async fn query_info(addr: SocketAddr, timeout: Duration) -> anyhow::Result<ServerInfo> {
    tokio::time::timeout(timeout, query_info_inner(addr))
        .await
        .map_err(|_| anyhow::anyhow!("query {addr} timed out after {}ms", timeout.as_millis()))?
}

async fn query_info_inner(addr: SocketAddr) -> anyhow::Result<ServerInfo> {
    let bind: SocketAddr = if addr.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await.context("bind query socket")?;
    socket
        .connect(addr)
        .await
        .with_context(|| format!("connect query socket to {addr}"))?;

    let mut challenge = None;
    let mut buf = vec![0u8; MAX_DATAGRAM];
    for _ in 0..=MAX_CHALLENGES {
        socket
            .send(&a2s::info_request(challenge))
            .await
            .context("send A2S_INFO")?;
        let n = socket.recv(&mut buf).await.context("receive A2S_INFO")?;
        match a2s::parse_info_reply(&buf[..n])? {
            InfoReply::Info(info) => return Ok(info),
            InfoReply::Challenge(c) => challenge = Some(c),
        }
    }
    anyhow::bail!("server kept answering with challenges")
}
