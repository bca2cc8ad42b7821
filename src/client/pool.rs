use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::tunnel::Tunnel;
use crate::config::ClientConfig;
use crate::protocol::ClientSettings;
use crate::rules::Validator;
use crate::tunnel::{Status, StatusNotifier};

const MAX_DIAL_BACKOFF: Duration = Duration::from_secs(30);

/// Tunnel counts per status for one target.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolSize {
    pub connecting: usize,
    pub idle: usize,
    pub busy: usize,
    pub closed: usize,
    pub total: usize,
}

impl fmt::Display for PoolSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connecting {}, idle {}, busy {}, closed {}, total {}",
            self.connecting, self.idle, self.busy, self.closed, self.total
        )
    }
}

/// Throttle for redialing an unreachable rendezvous: 1 s doubling to a
/// 30 s cap, reset by the first tunnel that comes up.
struct Backoff {
    retry_at: Option<Instant>,
    delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            retry_at: None,
            delay: Duration::from_secs(1),
        }
    }
}

/// Maintains the target number of idle outbound tunnels to one rendezvous.
///
/// A single replenisher task is the only writer to the member list. It is
/// woken by a periodic tick, by any tunnel status change, and by close.
pub struct Pool {
    config: Arc<ClientConfig>,
    target: String,
    validator: Arc<Validator>,
    executor: reqwest::Client,
    members: parking_lot::Mutex<Vec<Arc<Tunnel>>>,
    events: StatusNotifier,
    next_connection_id: AtomicU64,
    backoff: parking_lot::Mutex<Backoff>,
    done: CancellationToken,
}

impl Pool {
    /// Create the pool and start its replenisher.
    pub fn start(
        config: Arc<ClientConfig>,
        target: String,
        validator: Arc<Validator>,
        executor: reqwest::Client,
    ) -> Arc<Self> {
        let (events, wakeups) = StatusNotifier::new();

        let pool = Arc::new(Self {
            config,
            target,
            validator,
            executor,
            members: parking_lot::Mutex::new(Vec::new()),
            events,
            next_connection_id: AtomicU64::new(0),
            backoff: parking_lot::Mutex::new(Backoff::default()),
            done: CancellationToken::new(),
        });

        tokio::spawn(pool.clone().replenish_loop(wakeups));

        pool
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn size(&self) -> PoolSize {
        count(&self.members.lock())
    }

    async fn replenish_loop(self: Arc<Self>, mut wakeups: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            self.replenish();
            tokio::select! {
                _ = self.done.cancelled() => return,
                _ = ticker.tick() => {}
                _ = wakeups.recv() => {}
            }
        }
    }

    /// Reconcile the pool against its idle target: reap closed tunnels,
    /// then open enough connections to keep `pool_idle_size` idle ones,
    /// never exceeding `pool_max_size` in total.
    fn replenish(self: &Arc<Self>) {
        if self.done.is_cancelled() {
            return;
        }

        let mut members = self.members.lock();
        members.retain(|tunnel| tunnel.status() != Status::Closed);

        let size = count(&members);
        debug!("{} pool size: {size}", self.target);

        let mut missing = self.config.pool_idle_size.saturating_sub(size.idle);

        if size.idle + size.busy == 0 {
            // Cold start: open a single connection, backing off while the
            // rendezvous stays unreachable.
            missing = 1;
            if size.connecting == 0 {
                let mut backoff = self.backoff.lock();
                let now = Instant::now();
                if backoff.retry_at.is_some_and(|at| now < at) {
                    return;
                }
                backoff.retry_at = Some(now + backoff.delay);
                backoff.delay = (backoff.delay * 2).min(MAX_DIAL_BACKOFF);
            }
        } else {
            *self.backoff.lock() = Backoff::default();
        }

        missing = missing.min(self.config.pool_max_size.saturating_sub(size.total));
        let to_create = missing.saturating_sub(size.connecting);

        for _ in 0..to_create {
            let settings = ClientSettings {
                id: self.config.id.clone(),
                name: self.config.name.clone(),
                pool_size: self.config.pool_idle_size,
                connection_id: self.next_connection_id.fetch_add(1, Ordering::Relaxed),
            };
            let tunnel = Tunnel::new(settings, self.target.clone(), self.events.clone());

            // Visible as `connecting` before the dial begins, so in-flight
            // attempts count against the next reconciliation.
            members.push(tunnel.clone());

            let pool = self.clone();
            tokio::spawn(async move {
                if let Err(err) = pool.run_tunnel(&tunnel).await {
                    debug!("connection to {}: {err:#}", pool.target);
                }
                tunnel.close();
            });
        }
    }

    async fn run_tunnel(&self, tunnel: &Arc<Tunnel>) -> anyhow::Result<()> {
        let ws = tunnel.connect(&self.config).await?;
        tunnel.serve(ws, &self.executor, &self.validator).await
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Close every tunnel and stop the replenisher.
    pub fn close(&self) {
        if self.done.is_cancelled() {
            return;
        }
        self.done.cancel();

        let members: Vec<_> = self.members.lock().clone();
        for tunnel in members {
            tunnel.close();
        }
    }
}

fn count(members: &[Arc<Tunnel>]) -> PoolSize {
    let mut size = PoolSize {
        total: members.len(),
        ..Default::default()
    };
    for tunnel in members {
        match tunnel.status() {
            Status::Connecting => size.connecting += 1,
            Status::Idle => size.idle += 1,
            Status::Busy => size.busy += 1,
            Status::Closed => size.closed += 1,
        }
    }
    size
}
