//! Port discovery store
//!
//! One small JSON file per UI host process, named `<pid>.port`, holding
//! `{port, pid, time}`. Each process only ever writes its own file, so
//! concurrent hosts never contend.

use crate::process::ProcessControl;
use crate::protocol::PortRecord;
use crate::Result;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

const RECORD_EXTENSION: &str = "port";

/// A parsed record together with the file it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub path: PathBuf,
    pub record: PortRecord,
}

/// Directory of per-process discovery records
#[derive(Debug, Clone)]
pub struct PortStore {
    dir: PathBuf,
}

impl PortStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, pid: u32) -> PathBuf {
        self.dir.join(format!("{pid}.{RECORD_EXTENSION}"))
    }

    /// Write `record` as `<pid>.port`, replacing any previous file for that pid.
    pub async fn write(&self, record: &PortRecord) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.record_path(record.pid);
        let tmp = path.with_extension("port.tmp");
        fs::write(&tmp, serde_json::to_vec(record)?).await?;
        fs::rename(&tmp, &path).await?;
        debug!("Wrote port record {}", path.display());
        Ok(path)
    }

    /// Remove the record for `pid`. Returns whether a file was removed.
    pub async fn remove(&self, pid: u32) -> Result<bool> {
        match fs::remove_file(self.record_path(pid)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn read(&self, pid: u32) -> Result<Option<PortRecord>> {
        match fs::read(self.record_path(pid)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every `*.port` file, with `None` for files that do not parse.
    async fn entries(&self) -> Result<Vec<(PathBuf, Option<PortRecord>)>> {
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let record = match fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice::<PortRecord>(&bytes).ok(),
                Err(e) => {
                    warn!("Failed to read {}: {}", path.display(), e);
                    None
                }
            };
            entries.push((path, record));
        }
        Ok(entries)
    }

    /// All records that parse, regardless of liveness.
    pub async fn records(&self) -> Result<Vec<StoredRecord>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter_map(|(path, record)| record.map(|record| StoredRecord { path, record }))
            .collect())
    }

    /// Records whose owning process is still running.
    pub async fn live_records(&self, probe: &impl ProcessControl) -> Result<Vec<StoredRecord>> {
        let mut live = Vec::new();
        for stored in self.records().await? {
            if probe.is_alive(stored.record.pid).await {
                live.push(stored);
            }
        }
        Ok(live)
    }

    /// The most recently written live record.
    pub async fn newest_live(&self, probe: &impl ProcessControl) -> Result<Option<PortRecord>> {
        Ok(self
            .live_records(probe)
            .await?
            .into_iter()
            .map(|stored| stored.record)
            .max_by_key(|record| record.time))
    }

    /// Delete records not owned by `current_pid` whose process is gone.
    /// Unparseable files are deleted too.
    pub async fn prune_stale(
        &self,
        current_pid: u32,
        probe: &impl ProcessControl,
    ) -> Result<Vec<PathBuf>> {
        let mut pruned = Vec::new();
        for (path, record) in self.entries().await? {
            let stale = match record {
                Some(record) => record.pid != current_pid && !probe.is_alive(record.pid).await,
                None => true,
            };
            if !stale {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => {
                    info!("Removed stale port record {}", path.display());
                    pruned.push(path);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
        Ok(pruned)
    }
}
