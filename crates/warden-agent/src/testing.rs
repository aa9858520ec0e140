//! Loopback fakes shared by unit tests.

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
};
use warden_process::ResourceUsage;
use warden_proto::{
    a2s::{self, ServerInfo},
    rcon::{
        AUTH_FAILED_ID, Packet, SERVERDATA_AUTH, SERVERDATA_AUTH_RESPONSE,
        SERVERDATA_RESPONSE_VALUE, frame_len,
    },
};

use crate::os_process::{Liveness, OsProcess};

pub(crate) struct FakeRcon {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicUsize>,
    pub commands: Arc<Mutex<Vec<String>>>,
}

impl FakeRcon {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

async fn read_one(stream: &mut TcpStream) -> Option<Packet> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await.ok()?;
    let len = frame_len(prefix).ok()?;
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame).await.ok()?;
    Packet::decode(&frame).ok()
}

/// Minimal Source RCON server. Answers commands with `ack:<cmd>` and drops the
/// connection after `drop_after` commands when set.
pub(crate) async fn fake_rcon_server(password: &'static str, drop_after: Option<usize>) -> FakeRcon {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let commands = Arc::new(Mutex::new(Vec::new()));

    let counter = connections.clone();
    let log = commands.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let log = log.clone();
            tokio::spawn(async move {
                let mut served = 0usize;
                while let Some(p) = read_one(&mut stream).await {
                    if p.kind == SERVERDATA_AUTH {
                        let empty = Packet {
                            id: p.id,
                            kind: SERVERDATA_RESPONSE_VALUE,
                            body: String::new(),
                        };
                        let id = if p.body == password { p.id } else { AUTH_FAILED_ID };
                        let auth = Packet {
                            id,
                            kind: SERVERDATA_AUTH_RESPONSE,
                            body: String::new(),
                        };
                        let _ = stream.write_all(&empty.encode()).await;
                        let _ = stream.write_all(&auth.encode()).await;
                        continue;
                    }
                    log.lock().unwrap().push(p.body.clone());
                    let reply = Packet {
                        id: p.id,
                        kind: SERVERDATA_RESPONSE_VALUE,
                        body: format!("ack:{}", p.body),
                    };
                    let _ = stream.write_all(&reply.encode()).await;
                    served += 1;
                    if drop_after.is_some_and(|n| served >= n) {
                        return;
                    }
                }
            });
        }
    });

    FakeRcon {
        addr,
        connections,
        commands,
    }
}

/// Answers every A2S_INFO request directly, without a challenge.
pub(crate) async fn fake_query_server(players: u8) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1400];
        while let Ok((_, peer)) = socket.recv_from(&mut buf).await {
            let reply = a2s::encode_info_reply(&ServerInfo {
                name: "Island".to_string(),
                map: "TheIsland".to_string(),
                folder: "ark".to_string(),
                game: "ARK".to_string(),
                players,
                max_players: 70,
                bots: 0,
            });
            let _ = socket.send_to(&reply, peer).await;
        }
    });
    addr
}

#[derive(Debug, Clone)]
pub(crate) struct HttpRequest {
    pub method: String,
    pub path: String,
    /// Header names are lower-cased.
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

pub(crate) struct FakeHttp {
    pub url: String,
    pub requests: Arc<Mutex<Vec<HttpRequest>>>,
}

impl FakeHttp {
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

async fn read_request(stream: &mut TcpStream) -> Option<HttpRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(i) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break i;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut start = lines.next()?.split(' ');
    let method = start.next()?.to_string();
    let path = start.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();
    let len = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < len {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    Some(HttpRequest {
        method,
        path,
        headers,
        body: String::from_utf8_lossy(&body).to_string(),
    })
}

/// One-request-per-connection HTTP responder. Replies with `status` after
/// `delay` and records every request.
pub(crate) async fn fake_http_server(status: u16, delay: Duration) -> FakeHttp {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let requests = Arc::new(Mutex::new(Vec::new()));

    let log = requests.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let log = log.clone();
            tokio::spawn(async move {
                let Some(req) = read_request(&mut stream).await else {
                    return;
                };
                log.lock().unwrap().push(req);
                tokio::time::sleep(delay).await;
                let reply = format!(
                    "HTTP/1.1 {status} Fake\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                );
                let _ = stream.write_all(reply.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    FakeHttp { url, requests }
}

/// Scriptable stand-in for an OS process.
pub(crate) struct FakeProcess {
    pid: u32,
    liveness: Mutex<Liveness>,
    exit_on_close: AtomicBool,
    closes: AtomicUsize,
    kills: AtomicUsize,
}

impl FakeProcess {
    pub fn new(pid: u32) -> Arc<Self> {
        Arc::new(Self {
            pid,
            liveness: Mutex::new(Liveness::Alive { responding: true }),
            exit_on_close: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, liveness: Liveness) {
        *self.liveness.lock().unwrap() = liveness;
    }

    pub fn exit_on_close(&self) {
        self.exit_on_close.store(true, Ordering::SeqCst);
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OsProcess for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn probe(&self) -> Liveness {
        *self.liveness.lock().unwrap()
    }

    async fn usage(&self) -> ResourceUsage {
        if self.probe().await.is_alive() {
            ResourceUsage {
                memory_bytes: 4096,
                cpu_time: std::time::Duration::from_millis(250),
            }
        } else {
            ResourceUsage::default()
        }
    }

    async fn close_main_window(&self) -> bool {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.exit_on_close.load(Ordering::SeqCst) {
            self.set(Liveness::Gone);
        }
        true
    }

    async fn kill(&self) -> anyhow::Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.set(Liveness::Gone);
        Ok(())
    }
}

pub(crate) fn server_handle(
    instance: u32,
) -> (Arc<crate::process::ServerProcessHandle>, Arc<FakeProcess>) {
    let fake = FakeProcess::new(1000 + instance);
    let handle = crate::process::ServerProcessHandle::new(
        fake.clone(),
        warden_process::ServerInfos {
            instance,
            title: format!("server-{instance}"),
            port: 7777,
            query_port: 27015,
            rcon_port: 27020,
            rcon_password: String::new(),
        },
        crate::process::SupervisionConfig::default(),
    );
    (Arc::new(handle), fake)
}

/// Captures sequence log entries as `message: error chain`.
#[derive(Default)]
pub(crate) struct RecordingLogger {
    errors: Mutex<Vec<String>>,
    warnings: Mutex<Vec<String>>,
}

impl RecordingLogger {
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().unwrap().clone()
    }

    fn entry(message: &str, err: Option<&anyhow::Error>) -> String {
        match err {
            Some(e) => format!("{message}: {e:#}"),
            None => message.to_string(),
        }
    }
}

impl crate::sequence::SequenceLogger for RecordingLogger {
    fn error(&self, _instance: u32, message: &str, err: Option<&anyhow::Error>) {
        self.errors.lock().unwrap().push(Self::entry(message, err));
    }

    fn warning(&self, _instance: u32, message: &str, err: Option<&anyhow::Error>) {
        self.warnings.lock().unwrap().push(Self::entry(message, err));
    }
}

#[derive(Default)]
pub(crate) struct CountingBackup {
    calls: AtomicUsize,
}

impl CountingBackup {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl crate::backup::BackupManager for CountingBackup {
    async fn perform_server_backup(
        &self,
        _instance: u32,
        _max_age: std::time::Duration,
    ) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
