//! Stale-process sweeper
//!
//! Best-effort cleanup run when a UI host starts or restarts:
//! 1. Probe every port in the reserved range for a listener and terminate
//!    any owner that is not this process.
//! 2. Prune discovery records whose owner is no longer alive.
//!
//! Nothing here is a lock. Probes run with bounded concurrency and each one
//! stands alone; a missed or failed probe is logged and forgotten.

use crate::config::BridgeConfig;
use crate::discovery::PortStore;
use crate::process::{ProcessControl, SystemProcesses};
use futures::stream::{self, StreamExt};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// A listener the sweeper terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminatedListener {
    pub port: u16,
    pub pid: u32,
}

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub terminated: Vec<TerminatedListener>,
    pub pruned: Vec<PathBuf>,
}

pub struct Sweeper<P = SystemProcesses> {
    probe: P,
    store: PortStore,
    range: RangeInclusive<u16>,
    concurrency: usize,
    current_pid: u32,
}

impl Sweeper<SystemProcesses> {
    pub fn new(config: &BridgeConfig) -> Self {
        Self::with_probe(config, SystemProcesses)
    }
}

impl<P: ProcessControl> Sweeper<P> {
    pub fn with_probe(config: &BridgeConfig, probe: P) -> Self {
        Self {
            probe,
            store: PortStore::new(config.discovery_dir.clone()),
            range: config.sweep_range.clone(),
            concurrency: config.sweep_concurrency.max(1),
            current_pid: std::process::id(),
        }
    }

    pub async fn run(&self) -> SweepReport {
        let terminated = self.sweep_ports().await;
        let pruned = self.prune_records().await;
        info!(
            "Sweep finished: {} listeners terminated, {} records pruned",
            terminated.len(),
            pruned.len()
        );
        SweepReport { terminated, pruned }
    }

    /// Terminate foreign listeners across the reserved range.
    pub async fn sweep_ports(&self) -> Vec<TerminatedListener> {
        stream::iter(self.range.clone())
            .map(|port| self.sweep_port(port))
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    async fn sweep_port(&self, port: u16) -> Vec<TerminatedListener> {
        let mut terminated = Vec::new();
        for pid in self.probe.listeners_on(port).await {
            if pid == self.current_pid {
                continue;
            }
            match self.probe.terminate(pid).await {
                Ok(()) => {
                    info!("Killed old process on port {} (PID: {})", port, pid);
                    terminated.push(TerminatedListener { port, pid });
                }
                Err(e) => debug!("Could not kill PID {} on port {}: {}", pid, port, e),
            }
        }
        terminated
    }

    /// Remove discovery records left behind by dead hosts.
    pub async fn prune_records(&self) -> Vec<PathBuf> {
        match self.store.prune_stale(self.current_pid, &self.probe).await {
            Ok(pruned) => pruned,
            Err(e) => {
                warn!("Failed to prune {}: {}", self.store.dir().display(), e);
                Vec::new()
            }
        }
    }
}
