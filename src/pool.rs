//! Pool manager: supervises N worker processes.
//!
//! Workers are separate OS processes (one GPU owner each), re-executions of
//! the current binary with `DOCPIPE_WORKER_ID` set. The manager spawns them
//! **sequentially**, waiting for each worker's readiness key before starting
//! the next — two models loading at once would thrash GPU memory. After
//! startup it sweeps every few seconds: restarts exited workers, refreshes
//! the census key. On shutdown it sends SIGTERM, grants a grace period for
//! the in-flight unit, then force-kills.
//!
//! State machine per worker:
//! `spawning → loading → ready → running → {exited, crashed}`, with
//! `crashed` re-entering `spawning` on the next sweep.

use crate::bus::Bus;
use crate::config::{worker_ready_key, Config, RuntimeEnv, WORKERS_COUNT_KEY};
use crate::error::PipelineError;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Estimated VRAM one worker occupies: model weights plus KV cache and
/// activation headroom.
const GB_PER_WORKER: f64 = 28.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Spawning,
    Loading,
    Ready,
    Running,
    Exited,
    Crashed,
}

struct ChildWorker {
    id: u32,
    child: Child,
    state: WorkerState,
}

/// Pool size from environment and declared VRAM.
///
/// Production: 75% of VRAM divided by the per-worker estimate, clamped to
/// `[1, 4]`. Development: one worker. An explicit override wins everywhere.
pub fn desired_worker_count(
    env: RuntimeEnv,
    vram_gb: Option<f64>,
    override_count: Option<usize>,
) -> usize {
    if let Some(n) = override_count {
        return n.max(1);
    }
    match env {
        RuntimeEnv::Development => 1,
        RuntimeEnv::Production => match vram_gb {
            Some(vram) => (((vram * 0.75) / GB_PER_WORKER).floor() as usize).clamp(1, 4),
            None => {
                warn!("DOCPIPE_VRAM_GB not set; defaulting to 1 worker");
                1
            }
        },
    }
}

pub struct PoolManager {
    cfg: Config,
    bus: Arc<dyn Bus>,
    children: Vec<ChildWorker>,
    running: Arc<AtomicBool>,
    worker_count: usize,
}

impl PoolManager {
    pub fn new(cfg: Config, bus: Arc<dyn Bus>) -> PoolManager {
        let worker_count = desired_worker_count(cfg.env, cfg.vram_gb, cfg.workers_override);
        info!("Pool manager initialised (will run {worker_count} workers)");
        PoolManager {
            cfg,
            bus,
            children: Vec::new(),
            running: Arc::new(AtomicBool::new(true)),
            worker_count,
        }
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Spawn all workers, then monitor until shutdown is requested.
    pub async fn run(&mut self) -> Result<(), PipelineError> {
        info!("Starting {} workers...", self.worker_count);

        for id in 1..=self.worker_count as u32 {
            let child = spawn_worker_process(id)?;
            info!("Spawned worker {id} (pid {})", child.id());
            self.children.push(ChildWorker {
                id,
                child,
                state: WorkerState::Loading,
            });

            // Serialise model loads: wait for this worker's ready key
            // before spawning the next.
            if (id as usize) < self.worker_count {
                if self.wait_ready(id).await {
                    self.set_state(id, WorkerState::Ready);
                } else {
                    error!(
                        "Worker {id} did not signal ready within {}s",
                        self.cfg.ready_wait_secs
                    );
                }
            }
        }

        self.heartbeat().await;
        info!("All {} workers started", self.worker_count);

        self.monitor().await;
        self.stop().await;
        Ok(())
    }

    /// Wait for a worker's readiness key, polling every 500 ms.
    pub async fn wait_ready(&self, worker_id: u32) -> bool {
        let key = worker_ready_key(worker_id);
        let deadline = Instant::now() + Duration::from_secs(self.cfg.ready_wait_secs);
        let started = Instant::now();

        while Instant::now() < deadline {
            match self.bus.get(&key).await {
                Ok(Some(_)) => {
                    info!(
                        "Worker {worker_id} ready (model loaded in {:.1}s)",
                        started.elapsed().as_secs_f64()
                    );
                    return true;
                }
                Ok(None) => {}
                Err(e) => warn!("Ready poll failed for worker {worker_id}: {e}"),
            }
            sleep(Duration::from_millis(500)).await;
        }
        false
    }

    /// Liveness sweep: restart exited workers, refresh the census.
    async fn monitor(&mut self) {
        let interval = Duration::from_secs(self.cfg.monitor_interval_secs);

        while self.running.load(Ordering::SeqCst) {
            sleep(interval).await;

            for slot in &mut self.children {
                match slot.child.try_wait() {
                    Ok(Some(status)) => {
                        error!(
                            "Worker {} exited ({status}), restarting...",
                            slot.id
                        );
                        // Crashed workers re-enter spawning.
                        slot.state = WorkerState::Spawning;
                        match spawn_worker_process(slot.id) {
                            Ok(child) => {
                                info!("Respawned worker {} (pid {})", slot.id, child.id());
                                slot.child = child;
                                slot.state = WorkerState::Loading;
                            }
                            Err(e) => {
                                error!("Respawn of worker {} failed: {e}", slot.id);
                                // The dead child stays; the next sweep sees
                                // it exited again and retries the spawn.
                                slot.state = WorkerState::Crashed;
                            }
                        }
                    }
                    Ok(None) => {
                        if slot.state == WorkerState::Loading || slot.state == WorkerState::Ready {
                            slot.state = WorkerState::Running;
                        }
                    }
                    Err(e) => warn!("Liveness check failed for worker {}: {e}", slot.id),
                }
            }

            self.heartbeat().await;
        }
    }

    /// Census heartbeat. Short-TTL by design: the key is a liveness hint,
    /// not a real-time gauge, and goes stale only if the manager dies.
    async fn heartbeat(&self) {
        if let Err(e) = self
            .bus
            .set_with_ttl(
                WORKERS_COUNT_KEY,
                &self.worker_count.to_string(),
                Duration::from_secs(self.cfg.census_ttl_secs),
            )
            .await
        {
            warn!("Census heartbeat failed: {e}");
        }
    }

    fn set_state(&mut self, worker_id: u32, state: WorkerState) {
        if let Some(slot) = self.children.iter_mut().find(|c| c.id == worker_id) {
            slot.state = state;
        }
    }

    /// Graceful shutdown: SIGTERM each worker, wait out the grace period,
    /// force-kill stragglers.
    pub async fn stop(&mut self) {
        info!("Stopping all workers...");

        for slot in &mut self.children {
            if matches!(slot.child.try_wait(), Ok(None)) {
                info!("Sending SIGTERM to worker {} (pid {})", slot.id, slot.child.id());
                terminate(&slot.child);
            }
        }

        let deadline = Instant::now() + Duration::from_secs(self.cfg.shutdown_grace_secs);
        for slot in &mut self.children {
            loop {
                match slot.child.try_wait() {
                    Ok(Some(_)) => {
                        slot.state = WorkerState::Exited;
                        break;
                    }
                    Ok(None) if Instant::now() < deadline => {
                        sleep(Duration::from_millis(100)).await;
                    }
                    _ => {
                        warn!(
                            "Worker {} did not stop in time, force-killing",
                            slot.id
                        );
                        let _ = slot.child.kill();
                        let _ = slot.child.wait();
                        slot.state = WorkerState::Exited;
                        break;
                    }
                }
            }
        }

        info!("All workers stopped");
    }
}

/// Clean re-exec of this binary in worker mode. The child discovers its
/// role through `DOCPIPE_WORKER_ID`; everything else comes from the
/// inherited environment.
fn spawn_worker_process(worker_id: u32) -> Result<Child, PipelineError> {
    let exe = std::env::current_exe().map_err(|source| PipelineError::SpawnFailed {
        worker_id,
        source,
    })?;
    Command::new(exe)
        .env("DOCPIPE_WORKER_ID", worker_id.to_string())
        .spawn()
        .map_err(|source| PipelineError::SpawnFailed { worker_id, source })
}

#[cfg(unix)]
fn terminate(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Err(e) = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM) {
        warn!("SIGTERM failed for pid {}: {e}", child.id());
    }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) {
    // No graceful signal available; the grace-period loop will force-kill.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;

    #[test]
    fn development_runs_one_worker() {
        assert_eq!(desired_worker_count(RuntimeEnv::Development, Some(160.0), None), 1);
    }

    #[test]
    fn production_scales_with_vram_and_clamps() {
        // 112 GB × 0.75 / 28 = 3 workers.
        assert_eq!(
            desired_worker_count(RuntimeEnv::Production, Some(112.0), None),
            3
        );
        // Tiny card still gets one worker.
        assert_eq!(
            desired_worker_count(RuntimeEnv::Production, Some(24.0), None),
            1
        );
        // A rack of VRAM still caps at four.
        assert_eq!(
            desired_worker_count(RuntimeEnv::Production, Some(640.0), None),
            4
        );
        // Unknown VRAM falls back to one.
        assert_eq!(desired_worker_count(RuntimeEnv::Production, None, None), 1);
    }

    #[test]
    fn explicit_override_wins() {
        assert_eq!(
            desired_worker_count(RuntimeEnv::Production, Some(640.0), Some(2)),
            2
        );
        assert_eq!(
            desired_worker_count(RuntimeEnv::Development, None, Some(3)),
            3
        );
    }

    #[tokio::test]
    async fn wait_ready_sees_the_readiness_key() {
        let bus = Arc::new(MemoryBus::new());
        let mut cfg = Config::default();
        cfg.ready_wait_secs = 1;
        let manager = PoolManager::new(cfg, bus.clone());

        // No key → times out.
        assert!(!manager.wait_ready(9).await);

        bus.set_with_ttl(&worker_ready_key(9), "1", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(manager.wait_ready(9).await);
    }
}
