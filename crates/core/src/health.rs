//! Background health tracking and best-effort recovery for the external
//! AI service and the local model runtime.
//!
//! The monitor owns a shared snapshot of boolean statuses that every other
//! component reads; only the poller writes it. On sustained failure of the
//! AI service it attempts an out-of-process restart, guarded by a cooldown
//! so a dead service cannot trigger a restart storm.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Liveness probes for the monitored dependencies. A probe returns false on
/// any transport error, timeout or non-success status.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check_inference(&self) -> bool;
    async fn check_model_runtime(&self) -> bool;
}

/// HTTP probe with a bounded per-request timeout (5s).
pub struct HttpHealthProbe {
    client: reqwest::Client,
    inference_url: String,
    runtime_url: String,
    timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(inference_url: impl Into<String>, runtime_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            inference_url: inference_url.into(),
            runtime_url: runtime_url.into(),
            timeout: Duration::from_secs(5),
        }
    }

    async fn ping(&self, url: String) -> bool {
        match self.client.get(url).timeout(self.timeout).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check_inference(&self) -> bool {
        self.ping(format!("{}/health", self.inference_url.trim_end_matches('/')))
            .await
    }

    async fn check_model_runtime(&self) -> bool {
        self.ping(format!("{}/api/tags", self.runtime_url.trim_end_matches('/')))
            .await
    }
}

/// Live status flags, written only by the poller, read by everyone else.
#[derive(Default)]
pub struct HealthSnapshot {
    inference: AtomicBool,
    model_runtime: AtomicBool,
}

impl HealthSnapshot {
    pub fn inference_online(&self) -> bool {
        self.inference.load(Ordering::Relaxed)
    }

    pub fn model_runtime_online(&self) -> bool {
        self.model_runtime.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn force_inference(&self, online: bool) {
        self.inference.store(online, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Background poll interval.
    pub poll_interval: Duration,
    /// Consecutive AI-probe failures before a restart attempt.
    pub failures_before_restart: u32,
    /// Minimum gap between restart attempts.
    pub restart_cooldown: Duration,
    /// Command (argv) spawned to restart the AI service. None disables
    /// auto-recovery.
    pub restart_command: Option<Vec<String>>,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            failures_before_restart: 5,
            restart_cooldown: Duration::from_secs(120),
            restart_command: None,
        }
    }
}

/// Cooldown gate for restart attempts. `try_begin` returns true at most once
/// per cooldown window.
struct RestartGuard {
    cooldown: Duration,
    last_attempt: Mutex<Option<Instant>>,
}

impl RestartGuard {
    fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_attempt: Mutex::new(None),
        }
    }

    fn try_begin(&self) -> bool {
        let mut last = self.last_attempt.lock().expect("restart guard poisoned");
        match *last {
            Some(t) if t.elapsed() < self.cooldown => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

pub struct ServiceHealthMonitor {
    probe: Arc<dyn HealthProbe>,
    snapshot: Arc<HealthSnapshot>,
    config: HealthMonitorConfig,
    consecutive_failures: AtomicU32,
    restart_guard: RestartGuard,
}

impl ServiceHealthMonitor {
    pub fn new(probe: Arc<dyn HealthProbe>, config: HealthMonitorConfig) -> Self {
        Self {
            probe,
            snapshot: Arc::new(HealthSnapshot::default()),
            restart_guard: RestartGuard::new(config.restart_cooldown),
            config,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn snapshot(&self) -> Arc<HealthSnapshot> {
        self.snapshot.clone()
    }

    /// Synchronous admission check used before starting any new session.
    pub fn is_ready(&self) -> bool {
        self.snapshot.inference_online()
    }

    /// Probes both dependencies concurrently and refreshes the snapshot.
    /// Logs only on state transitions to avoid flooding.
    pub async fn poll(&self) {
        let (inference, runtime) = tokio::join!(
            self.probe.check_inference(),
            self.probe.check_model_runtime()
        );

        let prev_inference = self.snapshot.inference.swap(inference, Ordering::Relaxed);
        let prev_runtime = self.snapshot.model_runtime.swap(runtime, Ordering::Relaxed);

        if prev_inference != inference {
            if inference {
                tracing::info!("AI service recovered, leaving degraded mode");
            } else {
                tracing::warn!("AI service went offline");
            }
        }
        if prev_runtime != runtime {
            if runtime {
                tracing::info!("Model runtime online");
            } else {
                tracing::warn!("Model runtime offline");
            }
        }

        if inference {
            self.consecutive_failures.store(0, Ordering::Relaxed);
        } else {
            let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures >= self.config.failures_before_restart {
                self.attempt_restart();
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
        }
    }

    /// Best-effort out-of-process restart of the AI service. Failures are
    /// advisory only and never propagate into the turn path.
    fn attempt_restart(&self) {
        let Some(command) = self.config.restart_command.as_ref() else {
            tracing::warn!("AI service down and no restart command configured");
            return;
        };
        if !self.restart_guard.try_begin() {
            tracing::info!("Auto-restart on cooldown, skipping");
            return;
        }
        tracing::warn!(command = ?command, "Attempting AI service auto-restart");

        let (program, args) = match command.split_first() {
            Some(parts) => parts,
            None => return,
        };
        match tokio::process::Command::new(program).args(args).spawn() {
            Ok(mut child) => {
                tokio::spawn(async move {
                    match child.wait().await {
                        Ok(status) => {
                            tracing::info!(%status, "Auto-restart command finished")
                        }
                        Err(e) => tracing::error!("Auto-restart command failed: {e:?}"),
                    }
                });
            }
            Err(e) => tracing::error!("Failed to spawn auto-restart command: {e:?}"),
        }
    }

    /// Starts the background polling loop: one immediate poll, then a fixed
    /// interval until the process shuts down.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tracing::info!(
            interval_secs = self.config.poll_interval.as_secs(),
            "Health monitor started"
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.poll_interval);
            loop {
                ticker.tick().await;
                self.poll().await;
            }
        })
    }

    /// Waits for the AI service to come online, probing with exponential
    /// backoff (doubling, capped at 10s). Startup only, never inside the
    /// live turn path. Returns false once `max_attempts` are exhausted.
    pub async fn wait_until_ready(&self, max_attempts: u32, base_delay: Duration) -> bool {
        for attempt in 1..=max_attempts {
            tracing::info!(attempt, max_attempts, "Checking AI service readiness");
            if self.probe.check_inference().await {
                self.snapshot.inference.store(true, Ordering::Relaxed);
                tracing::info!(attempt, "AI service is ready");
                return true;
            }
            if attempt < max_attempts {
                let delay = (base_delay * 2u32.saturating_pow(attempt - 1))
                    .min(Duration::from_secs(10));
                tracing::info!(delay_ms = delay.as_millis() as u64, "AI offline, retrying");
                tokio::time::sleep(delay).await;
            }
        }
        tracing::warn!(max_attempts, "AI service never came online, continuing degraded");
        self.snapshot.inference.store(false, Ordering::Relaxed);
        false
    }
}
