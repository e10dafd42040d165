//! Supervised restart of long-running units.
//!
//! A [`Supervisor`] owns a set of [`Service`]s. Each service runs in its own
//! task; when `serve` fails it is restarted after an exponential backoff.
//! Too many failures inside the restart window trip a cool-down of one
//! full window before the next attempt. All services and anything else
//! holding a [`Supervisor::subscribe`] receiver stop on [`Supervisor::stop`].

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ── Service ───────────────────────────────────────────────────────────────────

/// A restartable unit of work.
pub trait Service: Send + 'static {
    fn name(&self) -> &str;

    /// Run until failure. `Ok(())` means the service finished for good and
    /// is not restarted. The future is dropped on shutdown.
    fn serve(&mut self) -> impl Future<Output = std::io::Result<()>> + Send;
}

// ── Policy ────────────────────────────────────────────────────────────────────

/// Policy for restarting failed services.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Maximum number of restarts within the window before cooling down.
    pub max_restarts: u32,
    /// Time window for counting restarts.
    pub window: Duration,
    /// Delay before the first restart; doubles per consecutive failure.
    pub backoff: Duration,
    /// Upper bound on the restart delay.
    pub max_backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(60),
            backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(15),
        }
    }
}

/// Restart history of one service.
#[derive(Debug)]
pub struct RestartTracker {
    policy: RestartPolicy,
    restart_times: VecDeque<Instant>,
    consecutive_restarts: u32,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            restart_times: VecDeque::new(),
            consecutive_restarts: 0,
        }
    }

    /// Record a restart attempt.
    ///
    /// Returns the delay to wait before restarting, or `None` if the limit
    /// for the current window is used up.
    pub fn record_restart(&mut self) -> Option<Duration> {
        while let Some(front) = self.restart_times.front() {
            if front.elapsed() > self.policy.window {
                self.restart_times.pop_front();
            } else {
                break;
            }
        }

        if self.restart_times.len() >= self.policy.max_restarts as usize {
            return None;
        }

        self.restart_times.push_back(Instant::now());
        self.consecutive_restarts += 1;
        Some(self.backoff())
    }

    fn backoff(&self) -> Duration {
        let exp = self.consecutive_restarts.saturating_sub(1).min(16);
        self.policy
            .backoff
            .saturating_mul(1u32 << exp)
            .min(self.policy.max_backoff)
    }

    /// Forget consecutive failures (after a run that lasted a full window).
    pub fn reset(&mut self) {
        self.consecutive_restarts = 0;
    }

    pub fn restart_count(&self) -> usize {
        self.restart_times.len()
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }
}

// ── Supervisor ────────────────────────────────────────────────────────────────

pub struct Supervisor {
    name: String,
    policy: RestartPolicy,
    shutdown: broadcast::Sender<()>,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(name: impl Into<String>, policy: RestartPolicy) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            name: name.into(),
            policy,
            shutdown,
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start supervising `service`. Must be called inside a Tokio runtime.
    pub fn add<S: Service>(&self, service: S) {
        let shutdown = self.subscribe();
        if self.is_stopped() {
            return;
        }
        let handle = tokio::spawn(supervise(
            self.name.clone(),
            service,
            self.policy.clone(),
            shutdown,
        ));
        self.track(handle);
    }

    /// Spawn a plain task that is joined with the supervised services. The
    /// task is expected to watch a receiver from [`subscribe`](Self::subscribe),
    /// taken before this call. Nothing is spawned once stopped.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_stopped() {
            return;
        }
        self.track(tokio::spawn(task));
    }

    /// Receiver that fires once on [`stop`](Self::stop).
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Signal every supervised service and subscriber to stop. Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!(supervisor = %self.name, "stopping");
            let _ = self.shutdown.send(());
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Wait for every task started so far to finish.
    pub async fn join(&self) {
        let handles = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(supervisor = %self.name, error = %e, "supervised task panicked");
            }
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn supervise<S: Service>(
    supervisor: String,
    mut service: S,
    policy: RestartPolicy,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tracker = RestartTracker::new(policy);

    loop {
        let started = Instant::now();
        let result = tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!(%supervisor, service = service.name(), "service stopped");
                return;
            }
            r = service.serve() => r,
        };

        match result {
            Ok(()) => {
                tracing::info!(%supervisor, service = service.name(), "service finished");
                return;
            }
            Err(e) => {
                tracing::warn!(%supervisor, service = service.name(), error = %e, "service failed");
            }
        }

        if started.elapsed() >= tracker.policy().window {
            tracker.reset();
        }

        let delay = match tracker.record_restart() {
            Some(backoff) => backoff,
            None => {
                let cool_down = tracker.policy().window;
                tracing::error!(
                    %supervisor,
                    service = service.name(),
                    restarts = tracker.restart_count(),
                    cool_down_secs = cool_down.as_secs(),
                    "restart limit reached"
                );
                cool_down
            }
        };

        tokio::select! {
            _ = shutdown.recv() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        tracing::debug!(%supervisor, service = service.name(), "restarting service");
    }
}
