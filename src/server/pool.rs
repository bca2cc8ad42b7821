use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::protocol::ClientSettings;
use crate::server::stack::IdleStack;
use crate::server::tunnel::{ServerStream, Tunnel};
use crate::tunnel::Status;

/// Tunnel counts per status for one pool.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolSize {
    pub idle: usize,
    pub busy: usize,
    pub closed: usize,
    pub total: usize,
}

/// All tunnels registered by one internal peer, keyed by its greeting ID.
///
/// The pool owns the idle stack and the member set. Members enter at
/// register time and are removed by a per-tunnel watcher when their done
/// signal fires; once the member set empties the pool closes itself.
pub struct Pool {
    settings: ClientSettings,
    idle: IdleStack<Arc<Tunnel>>,
    members: parking_lot::Mutex<Vec<Arc<Tunnel>>>,
    idle_timeout: Duration,
    done: CancellationToken,
}

impl Pool {
    pub fn new(settings: ClientSettings, idle_timeout: Duration) -> Arc<Self> {
        let pool = Arc::new(Self {
            settings,
            idle: IdleStack::new(),
            members: parking_lot::Mutex::new(Vec::new()),
            idle_timeout,
            done: CancellationToken::new(),
        });

        tokio::spawn(pool.clone().gc_loop());

        pool
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn idle_stack(&self) -> IdleStack<Arc<Tunnel>> {
        self.idle.clone()
    }

    /// Add an accepted WebSocket to the pool and offer it as idle.
    pub fn register(self: &Arc<Self>, connection_id: u64, ws: ServerStream) {
        info!(
            "registering connection {} from {} ({})",
            connection_id, self.settings.name, self.settings.id
        );

        let tunnel = Tunnel::spawn(connection_id, ws, self.idle.clone());
        self.members.lock().push(tunnel.clone());

        // Watch the done signal: drop the member, close the pool when it
        // was the last one.
        let pool = self.clone();
        let watched = tunnel.clone();
        tokio::spawn(async move {
            watched.closed().await;
            let emptied = {
                let mut members = pool.members.lock();
                members.retain(|t| !Arc::ptr_eq(t, &watched));
                members.is_empty()
            };
            debug!(
                "connection {} from {} closed",
                watched.id(),
                pool.settings.name
            );
            if emptied {
                pool.close();
            }
        });

        // The pool may have closed while we were registering.
        if self.is_closed() {
            tunnel.close();
            return;
        }

        self.idle.offer(tunnel);
    }

    pub fn size(&self) -> PoolSize {
        let members = self.members.lock();
        let mut size = PoolSize {
            total: members.len(),
            ..Default::default()
        };
        for tunnel in members.iter() {
            match tunnel.status().0 {
                Status::Idle => size.idle += 1,
                Status::Busy => size.busy += 1,
                Status::Closed => size.closed += 1,
                Status::Connecting => {}
            }
        }
        size
    }

    /// Close surplus idle tunnels past the idle timeout. The first
    /// `PoolSize` idle tunnels, freshest first, are kept unconditionally.
    /// Only this side ever closes surplus tunnels, so a tunnel cannot be
    /// torn down by its owner just as we hand it to a request.
    fn reap_idle(&self) {
        let mut idle: Vec<_> = self
            .members
            .lock()
            .iter()
            .filter_map(|tunnel| match tunnel.status() {
                (Status::Idle, since) => Some((tunnel.clone(), since)),
                _ => None,
            })
            .collect();

        // Most recently idle first.
        idle.sort_by(|a, b| b.1.cmp(&a.1));

        for (tunnel, since) in idle.iter().skip(self.settings.pool_size) {
            if since.elapsed() >= self.idle_timeout && tunnel.close_if_idle() {
                info!(
                    "closing idle connection {} from {}",
                    tunnel.id(),
                    self.settings.name
                );
            }
        }
    }

    async fn gc_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = self.done.cancelled() => return,
                _ = ticker.tick() => self.reap_idle(),
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    pub async fn closed(&self) {
        self.done.cancelled().await
    }

    /// Close the pool: the idle stack, the GC, and every member tunnel.
    pub fn close(&self) {
        if self.done.is_cancelled() {
            return;
        }
        self.done.cancel();
        self.idle.close();

        let members: Vec<_> = self.members.lock().clone();
        for tunnel in members {
            tunnel.close();
        }
    }
}
