use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};
use warden_agent::{
    backup::{BackupManager, ZipBackupManager},
    config::{AgentConfig, FileConfig, ServerEntry},
    launcher::{Launcher, ProcessRegistry},
    log_tail::LogTailReader,
    logging,
    notify::{DiscordWebhookNotifier, Notifier},
    os_process::SystemProcess,
    process::ServerProcessHandle,
    query::QueryClient,
    rcon::RconClient,
    sequence::{SequenceArgs, SequenceRunner},
};

const USAGE: &str = "usage: warden-agent [run-sequence <name> <instance> [reason]]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AgentConfig::from_env();
    let _log_guard = logging::init(cfg.log_dir.as_deref());

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match args.first().map(String::as_str) {
        None => None,
        Some("run-sequence") => Some(parse_run_sequence(&args[1..])?),
        Some("-h" | "--help") => {
            println!("{USAGE}");
            return Ok(());
        }
        Some(other) => anyhow::bail!("unknown command {other:?}\n{USAGE}"),
    };

    let file = cfg.load_file()?;
    let registry = ProcessRegistry::new();
    for entry in &file.servers {
        let handle = attach(entry, &cfg);
        info!(
            instance = entry.instance,
            pid = entry.pid,
            title = %entry.title,
            query = ?entry.query_addr(),
            rcon = ?entry.rcon_addr(),
            "server attached"
        );
        if let Some(path) = &entry.log_file {
            spawn_log_tail(entry.instance, LogTailReader::new(path));
        }
        registry.insert(handle);
    }
    info!(servers = registry.len(), "warden-agent started");

    let shutdown = CancellationToken::new();
    let refresher = tokio::spawn(
        refresh_loop(registry.clone(), cfg.refresh_interval, shutdown.clone())
            .instrument(info_span!("refresh")),
    );

    let res = match command {
        None => {
            tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
            info!("shutdown requested");
            Ok(())
        }
        Some(run) => run_sequence(&cfg, &file, &registry, run).await,
    };

    shutdown.cancel();
    let _ = refresher.await;
    for handle in registry.server_processes() {
        handle.detach().await;
    }
    res
}

struct RunSequence {
    name: String,
    instance: u32,
    reason: String,
}

fn parse_run_sequence(args: &[String]) -> anyhow::Result<RunSequence> {
    let [name, instance, rest @ ..] = args else {
        anyhow::bail!("run-sequence needs a sequence name and an instance\n{USAGE}");
    };
    let instance = instance
        .parse::<u32>()
        .with_context(|| format!("invalid instance {instance:?}"))?;
    Ok(RunSequence {
        name: name.clone(),
        instance,
        reason: rest.join(" "),
    })
}

fn attach(entry: &ServerEntry, cfg: &AgentConfig) -> Arc<ServerProcessHandle> {
    let process = Arc::new(SystemProcess::attach(entry.pid));
    let mut handle = ServerProcessHandle::new(process, entry.infos(), entry.supervision(cfg))
        .with_shutdown_command(entry.shutdown_command());

    if let Some(addr) = entry.query_addr() {
        handle = handle.with_query(QueryClient::spawn(addr, cfg.query));
    }
    if let Some(addr) = entry.rcon_addr() {
        handle = handle.with_rcon(RconClient::new(addr, entry.rcon_password.clone(), cfg.rcon));
    }
    if let Some(url) = &entry.discord_webhook {
        let notifier: Arc<dyn Notifier> = Arc::new(DiscordWebhookNotifier::new(url.clone()));
        handle = handle.with_notifiers(vec![notifier]);
    }
    Arc::new(handle)
}

fn spawn_log_tail(instance: u32, reader: LogTailReader) {
    let span = info_span!("server_log", instance);
    tokio::spawn(
        async move {
            let mut lines = reader.start();
            while let Some(line) = lines.recv().await {
                info!(target: "warden::server_log", "{line}");
            }
            reader.stop();
        }
        .instrument(span),
    );
}

async fn refresh_loop(registry: ProcessRegistry, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        for handle in registry.server_processes() {
            handle.refresh().await;
        }
        for gone in registry.prune_inactive() {
            info!(instance = gone.instance(), state = %gone.state(), "server detached");
            gone.detach().await;
        }
    }
}

async fn run_sequence(
    cfg: &AgentConfig,
    file: &FileConfig,
    registry: &ProcessRegistry,
    run: RunSequence,
) -> anyhow::Result<()> {
    let sequence = file
        .sequence(&run.name)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("no sequence named {:?}", run.name))?;

    let restart_registry = registry.clone();
    let mut builder = SequenceArgs::builder(run.instance, Arc::new(registry.clone()))
        .reason(run.reason)
        .poll_interval(cfg.sequence_poll)
        .main_action(move |instance, _cancel| {
            let registry = restart_registry.clone();
            async move {
                let handle = registry
                    .server_process(instance)
                    .ok_or_else(|| anyhow::anyhow!("instance {instance} is not attached"))?;
                handle.restart().await;
                info!(instance, state = %handle.state(), "restart requested");
                Ok::<_, anyhow::Error>(())
            }
        });

    if let Some(section) = &file.backup {
        let mut mgr = ZipBackupManager::new(&section.root);
        for entry in &file.servers {
            if let Some(dir) = &entry.data_dir {
                mgr = mgr.with_instance(entry.instance, dir);
            }
        }
        let mgr: Arc<dyn BackupManager> = Arc::new(mgr);
        builder = builder.backups(mgr);
    }

    let runner = Arc::new(SequenceRunner::new(
        sequence,
        builder.build(),
        |instance: u32, completed: usize, total: usize| {
            info!(instance, completed, total, "sequence progress");
        },
    ));

    let task = tokio::spawn({
        let runner = runner.clone();
        async move { runner.execute_sequence().await }
    });
    let ctrl_c = {
        let cancel = runner.cancel_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; cancelling sequence");
                cancel.cancel();
            }
        })
    };

    let res = task.await.context("sequence task panicked")?;
    ctrl_c.abort();
    res?;
    info!(name = %run.name, instance = run.instance, "sequence completed");
    Ok(())
}
