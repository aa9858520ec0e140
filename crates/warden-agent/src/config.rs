use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;
use warden_process::ServerInfos;

use crate::{
    process::{DEFAULT_SHUTDOWN_COMMAND, SupervisionConfig},
    query::QueryOptions,
    rcon::RconOptions,
    sequence::Sequence,
    support::{env_duration_ms, env_duration_secs, env_u32},
};

/// Runtime tunables, read from `WARDEN_*` environment variables.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub refresh_interval: Duration,
    pub query: QueryOptions,
    pub rcon: RconOptions,
    pub shutdown_cooldown: Duration,
    pub zombie_check: Duration,
    pub sequence_poll: Duration,
    pub config_path: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let keep_alive = env_duration_secs("WARDEN_RCON_KEEPALIVE_SEC", 0, 3600, 60);
        Self {
            refresh_interval: env_duration_ms("WARDEN_REFRESH_INTERVAL_MS", 250, 60_000, 2_000),
            query: QueryOptions {
                interval: env_duration_ms("WARDEN_QUERY_INTERVAL_MS", 500, 300_000, 5_000),
                timeout: env_duration_ms("WARDEN_QUERY_TIMEOUT_MS", 100, 30_000, 2_000),
                failure_threshold: env_u32("WARDEN_QUERY_FAILURE_THRESHOLD")
                    .map(|v| v.clamp(1, 100))
                    .unwrap_or(3),
            },
            rcon: RconOptions {
                connect_timeout: env_duration_ms("WARDEN_RCON_CONNECT_TIMEOUT_MS", 100, 60_000, 5_000),
                response_timeout: env_duration_ms("WARDEN_RCON_TIMEOUT_MS", 100, 120_000, 10_000),
                // Zero disables keep-alive.
                keep_alive: (!keep_alive.is_zero()).then_some(keep_alive),
            },
            shutdown_cooldown: env_duration_secs("WARDEN_SHUTDOWN_COOLDOWN_SEC", 1, 3600, 180),
            zombie_check: env_duration_secs("WARDEN_ZOMBIE_CHECK_SEC", 5, 3600, 60),
            sequence_poll: env_duration_ms("WARDEN_SEQUENCE_POLL_MS", 50, 60_000, 1_000),
            config_path: env_path("WARDEN_CONFIG"),
            log_dir: env_path("WARDEN_LOG_DIR"),
        }
    }

    pub fn load_file(&self) -> anyhow::Result<FileConfig> {
        match &self.config_path {
            Some(path) => FileConfig::load(path),
            None => Ok(FileConfig::default()),
        }
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_true() -> bool {
    true
}

/// Attached servers and sequence definitions, supplied as TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
    #[serde(default)]
    pub backup: Option<BackupSection>,
    #[serde(default)]
    pub sequences: Vec<Sequence>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupSection {
    pub root: PathBuf,
}

#[derive(Clone, Deserialize)]
pub struct ServerEntry {
    pub instance: u32,
    pub pid: u32,
    pub title: String,
    #[serde(default = "default_host")]
    pub host: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub query_port: u16,
    #[serde(default)]
    pub rcon_port: u16,
    #[serde(default)]
    pub rcon_password: String,
    #[serde(default = "default_true")]
    pub enable_query: bool,
    #[serde(default)]
    pub kill_zombies: bool,
    #[serde(default)]
    pub zombie_check_seconds: Option<u64>,
    #[serde(default)]
    pub shutdown_command: Option<String>,
    #[serde(default)]
    pub discord_webhook: Option<String>,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl std::fmt::Debug for ServerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerEntry")
            .field("instance", &self.instance)
            .field("pid", &self.pid)
            .field("title", &self.title)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("query_port", &self.query_port)
            .field("rcon_port", &self.rcon_port)
            .finish_non_exhaustive()
    }
}

impl ServerEntry {
    pub fn infos(&self) -> ServerInfos {
        ServerInfos {
            instance: self.instance,
            title: self.title.clone(),
            port: self.port,
            query_port: self.query_port,
            rcon_port: self.rcon_port,
            rcon_password: self.rcon_password.clone(),
        }
    }

    pub fn query_addr(&self) -> Option<SocketAddr> {
        (self.enable_query && self.query_port != 0)
            .then(|| SocketAddr::new(self.host, self.query_port))
    }

    /// RCON is only attached when both a port and a password are configured.
    pub fn rcon_addr(&self) -> Option<SocketAddr> {
        (self.rcon_port != 0 && !self.rcon_password.is_empty())
            .then(|| SocketAddr::new(self.host, self.rcon_port))
    }

    pub fn shutdown_command(&self) -> &str {
        self.shutdown_command
            .as_deref()
            .unwrap_or(DEFAULT_SHUTDOWN_COMMAND)
    }

    pub fn supervision(&self, agent: &AgentConfig) -> SupervisionConfig {
        SupervisionConfig {
            kill_zombies: self.kill_zombies,
            zombie_check: self
                .zombie_check_seconds
                .map(Duration::from_secs)
                .unwrap_or(agent.zombie_check),
            shutdown_cooldown: agent.shutdown_cooldown,
        }
    }
}

impl FileConfig {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let cfg: FileConfig = toml::from_str(text).context("parse warden config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("load config {}", path.display()))
    }

    pub fn sequence(&self, name: &str) -> Option<&Sequence> {
        self.sequences.iter().find(|s| s.name == name)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for s in &self.servers {
            if !seen.insert(s.instance) {
                anyhow::bail!("duplicate server instance {}", s.instance);
            }
            if s.pid == 0 {
                anyhow::bail!("server instance {} has pid 0", s.instance);
            }
        }
        let mut names = std::collections::BTreeSet::new();
        for s in &self.sequences {
            if !names.insert(s.name.as_str()) {
                anyhow::bail!("duplicate sequence {:?}", s.name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::SequenceAction;

    const SAMPLE: &str = r#"
[backup]
root = "/srv/backups"

[[servers]]
instance = 1
pid = 4242
title = "The Island"
port = 7777
query_port = 27015
rcon_port = 27020
rcon_password = "hunter2"
kill_zombies = true
zombie_check_seconds = 120
shutdown_command = "DoExit"
log_file = "/srv/ark/ShooterGame.log"

[[servers]]
instance = 2
pid = 4343
title = "Ragnarok"
host = "10.0.0.5"
port = 7779
enable_query = false

[[sequences]]
name = "nightly"

[[sequences.actions]]
type = "RconCommand"
command = "broadcast Restart for {reason}"

[[sequences.actions]]
type = "WaitOffline"
timeout_seconds = 300
cancel_on_failure = true

[[sequences.actions]]
type = "BackupServerData"
max_age_seconds = 604800
cancel_on_failure = true

[[sequences.actions]]
type = "MainAction"
"#;

    #[test]
    fn parses_servers_and_sequences() {
        let cfg = FileConfig::parse(SAMPLE).unwrap();
        assert_eq!(cfg.servers.len(), 2);
        assert_eq!(cfg.backup.as_ref().unwrap().root, PathBuf::from("/srv/backups"));

        let island = &cfg.servers[0];
        assert_eq!(island.infos().rcon_password, "hunter2");
        assert_eq!(island.shutdown_command(), "DoExit");
        assert_eq!(
            island.rcon_addr(),
            Some("127.0.0.1:27020".parse().unwrap())
        );
        assert_eq!(
            island.query_addr(),
            Some("127.0.0.1:27015".parse().unwrap())
        );
        assert!(!format!("{island:?}").contains("hunter2"));

        let ragnarok = &cfg.servers[1];
        assert_eq!(ragnarok.query_addr(), None);
        assert_eq!(ragnarok.rcon_addr(), None);
        assert_eq!(ragnarok.shutdown_command(), DEFAULT_SHUTDOWN_COMMAND);

        let nightly = cfg.sequence("nightly").unwrap();
        assert_eq!(nightly.actions.len(), 4);
        assert_eq!(nightly.actions[3], SequenceAction::MainAction);
        assert!(nightly.actions[1].cancel_on_failure());
    }

    #[test]
    fn per_server_zombie_check_overrides_default() {
        let cfg = FileConfig::parse(SAMPLE).unwrap();
        let agent = AgentConfig {
            refresh_interval: Duration::from_secs(2),
            query: QueryOptions::default(),
            rcon: RconOptions::default(),
            shutdown_cooldown: Duration::from_secs(180),
            zombie_check: Duration::from_secs(60),
            sequence_poll: Duration::from_secs(1),
            config_path: None,
            log_dir: None,
        };
        let island = cfg.servers[0].supervision(&agent);
        assert!(island.kill_zombies);
        assert_eq!(island.zombie_check, Duration::from_secs(120));
        let ragnarok = cfg.servers[1].supervision(&agent);
        assert!(!ragnarok.kill_zombies);
        assert_eq!(ragnarok.zombie_check, Duration::from_secs(60));
        assert_eq!(ragnarok.shutdown_cooldown, Duration::from_secs(180));
    }

    #[test]
    fn rejects_duplicate_instances() {
        let text = r#"
[[servers]]
instance = 1
pid = 10
title = "a"
port = 1

[[servers]]
instance = 1
pid = 11
title = "b"
port = 2
"#;
        let err = FileConfig::parse(text).unwrap_err();
        assert!(err.to_string().contains("duplicate server instance 1"));
    }

    #[test]
    fn unknown_action_type_is_rejected() {
        let text = r#"
[[sequences]]
name = "bad"

[[sequences.actions]]
type = "FormatDisk"
"#;
        assert!(FileConfig::parse(text).is_err());
    }

    #[test]
    fn load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        assert_eq!(FileConfig::load(&path).unwrap().servers.len(), 2);

        let missing = dir.path().join("missing.toml");
        let err = FileConfig::load(&missing).unwrap_err();
        assert!(format!("{err:#}").contains("missing.toml"));
    }
}
