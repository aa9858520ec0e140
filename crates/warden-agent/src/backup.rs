use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

#[async_trait]
pub trait BackupManager: Send + Sync {
    /// Archives the instance's data, then drops archives older than `max_age`.
    async fn perform_server_backup(&self, instance: u32, max_age: Duration) -> anyhow::Result<()>;
}

/// Writes `<backup_root>/<instance>/backup-<utc>.zip` from each instance's data dir.
#[derive(Debug, Clone)]
pub struct ZipBackupManager {
    backup_root: PathBuf,
    data_dirs: BTreeMap<u32, PathBuf>,
}

impl ZipBackupManager {
    pub fn new(backup_root: impl Into<PathBuf>) -> Self {
        Self {
            backup_root: backup_root.into(),
            data_dirs: BTreeMap::new(),
        }
    }

    pub fn with_instance(mut self, instance: u32, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dirs.insert(instance, data_dir.into());
        self
    }

    pub fn instance_dir(&self, instance: u32) -> PathBuf {
        self.backup_root.join(instance.to_string())
    }
}

#[async_trait]
impl BackupManager for ZipBackupManager {
    async fn perform_server_backup(&self, instance: u32, max_age: Duration) -> anyhow::Result<()> {
        let src = self
            .data_dirs
            .get(&instance)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no data directory configured for instance {instance}"))?;
        let dest = self.instance_dir(instance);

        let (archive, pruned) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            let archive = write_archive(&src, &dest, Utc::now())?;
            let pruned = prune_archives(&dest, &archive, max_age)?;
            Ok((archive, pruned))
        })
        .await
        .context("backup task panicked")??;

        info!(instance, archive = %archive.display(), pruned, "server backup written");
        Ok(())
    }
}

fn archive_name(at: DateTime<Utc>) -> String {
    format!("backup-{}.zip", at.format("%Y%m%dT%H%M%S%3fZ"))
}

fn is_archive(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("backup-") && n.ends_with(".zip"))
}

fn write_archive(src: &Path, dest_dir: &Path, at: DateTime<Utc>) -> anyhow::Result<PathBuf> {
    if !src.is_dir() {
        anyhow::bail!("data directory {} does not exist", src.display());
    }
    std::fs::create_dir_all(dest_dir)
        .with_context(|| format!("create backup dir {}", dest_dir.display()))?;

    let out_path = dest_dir.join(archive_name(at));
    let tmp_path = out_path.with_extension("zip.tmp");
    if let Err(e) = fill_archive(src, &tmp_path) {
        // Partial archives are never picked up by pruning.
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e);
    }

    std::fs::rename(&tmp_path, &out_path)
        .with_context(|| format!("rename {} -> {}", tmp_path.display(), out_path.display()))?;
    Ok(out_path)
}

fn fill_archive(src: &Path, tmp_path: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::create(tmp_path)
        .with_context(|| format!("create {}", tmp_path.display()))?;

    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    add_dir(&mut zip, src, Path::new(""), options)?;
    let mut file = zip.finish().context("finish zip archive")?;
    file.flush().ok();
    file.sync_all().ok();
    Ok(())
}

fn add_dir(
    zip: &mut ZipWriter<std::fs::File>,
    dir: &Path,
    rel: &Path,
    options: SimpleFileOptions,
) -> anyhow::Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("read dir {}", dir.display()))?
        .flatten()
        .collect();
    entries.sort_by_key(|e| e.file_name());

    for e in entries {
        let path = e.path();
        let rel = rel.join(e.file_name());
        let name = zip_name(&rel);
        let meta = std::fs::symlink_metadata(&path)?;
        // Never follow links out of the data directory.
        if meta.file_type().is_symlink() {
            continue;
        }
        if meta.is_dir() {
            zip.add_directory(format!("{name}/"), options)?;
            add_dir(zip, &path, &rel, options)?;
        } else if meta.is_file() {
            zip.start_file(name, options)?;
            let mut f = std::fs::File::open(&path)
                .with_context(|| format!("open {}", path.display()))?;
            std::io::copy(&mut f, zip)?;
        }
    }
    Ok(())
}

fn zip_name(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// A zero `max_age` keeps everything.
fn prune_archives(dir: &Path, keep: &Path, max_age: Duration) -> anyhow::Result<usize> {
    if max_age.is_zero() {
        return Ok(0);
    }
    let now = SystemTime::now();
    let mut removed = 0;
    for e in std::fs::read_dir(dir)?.flatten() {
        let path = e.path();
        if path == keep || !is_archive(&path) {
            continue;
        }
        let Ok(modified) = e.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if now.duration_since(modified).unwrap_or_default() > max_age {
            debug!(path = %path.display(), "removing expired backup");
            std::fs::remove_file(&path)
                .with_context(|| format!("remove {}", path.display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}
