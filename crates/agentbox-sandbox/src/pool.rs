//! Warm pool of pre-initialized execution contexts
//!
//! Instances move `idle -> in-use -> idle` until they sit idle past the TTL,
//! at which point the periodic cleanup recycles them. The idle population
//! is replenished so it never drops below the warm floor.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Idle instances kept warm (capped by the pool size)
pub const POOL_WARM_FLOOR: usize = 3;

type Factory<C> = Arc<dyn Fn() -> C + Send + Sync>;

/// One pooled context and its bookkeeping
pub struct PooledInstance<C> {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub in_use: bool,
    last_used: Instant,
    context: Arc<C>,
}

impl<C> PooledInstance<C> {
    fn new(context: C) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            last_used_at: now,
            in_use: false,
            last_used: Instant::now(),
            context: Arc::new(context),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub running: bool,
    pub max_size: usize,
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub total_created: u64,
    pub total_acquired: u64,
    pub total_evicted: u64,
}

struct PoolInner<C> {
    instances: Vec<PooledInstance<C>>,
    running: bool,
    max_size: usize,
    ttl: Duration,
    cleanup_task: Option<JoinHandle<()>>,
    total_created: u64,
    total_acquired: u64,
    total_evicted: u64,
}

impl<C> PoolInner<C> {
    fn floor(&self) -> usize {
        POOL_WARM_FLOOR.min(self.max_size)
    }

    fn idle(&self) -> usize {
        self.instances.iter().filter(|i| !i.in_use).count()
    }

    fn spawn_instance(&mut self, factory: &Factory<C>) -> usize {
        self.instances.push(PooledInstance::new(factory()));
        self.total_created += 1;
        self.instances.len() - 1
    }

    /// Top idle instances back up to the floor without passing `max_size`
    fn replenish(&mut self, factory: &Factory<C>) {
        while self.idle() < self.floor() && self.instances.len() < self.max_size {
            self.spawn_instance(factory);
        }
    }

    fn release(&mut self, id: &str) -> bool {
        match self.instances.iter_mut().find(|i| i.id == id && i.in_use) {
            Some(instance) => {
                instance.in_use = false;
                instance.last_used = Instant::now();
                instance.last_used_at = Utc::now();
                true
            }
            None => false,
        }
    }

    fn cleanup(&mut self, now: Instant, factory: &Factory<C>) -> usize {
        let ttl = self.ttl;
        let before = self.instances.len();
        self.instances
            .retain(|i| i.in_use || now.saturating_duration_since(i.last_used) < ttl);
        let evicted = before - self.instances.len();
        self.total_evicted += evicted as u64;
        self.replenish(factory);
        evicted
    }
}

/// A bounded pool of reusable contexts built by a factory
pub struct WarmPool<C> {
    inner: Arc<Mutex<PoolInner<C>>>,
    factory: Factory<C>,
}

impl<C: Send + Sync + 'static> WarmPool<C> {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> C + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                instances: Vec::new(),
                running: false,
                max_size: 0,
                ttl: Duration::ZERO,
                cleanup_task: None,
                total_created: 0,
                total_acquired: 0,
                total_evicted: 0,
            })),
            factory: Arc::new(factory),
        }
    }

    /// Pre-warm the floor and schedule cleanup every `ttl / 2`.
    /// A second call while running does nothing.
    pub fn start(&self, max_size: usize, ttl_ms: u64) {
        let mut inner = self.inner.lock();
        if inner.running {
            debug!("Warm pool already running");
            return;
        }
        inner.running = true;
        inner.max_size = max_size;
        inner.ttl = Duration::from_millis(ttl_ms);
        inner.replenish(&self.factory);

        let period = Duration::from_millis((ttl_ms / 2).max(1));
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = Arc::clone(&self.inner);
                let factory = Arc::clone(&self.factory);
                inner.cleanup_task = Some(handle.spawn(async move {
                    let mut interval = tokio::time::interval(period);
                    interval.tick().await;
                    loop {
                        interval.tick().await;
                        let evicted = pool.lock().cleanup(Instant::now(), &factory);
                        if evicted > 0 {
                            debug!(evicted, "Recycled idle pool instances");
                        }
                    }
                }));
            }
            Err(_) => warn!("No async runtime, warm pool cleanup is not scheduled"),
        }

        info!(max_size, ttl_ms, warm = inner.instances.len(), "Warm pool started");
    }

    /// An idle instance if any, else a new one while below `max_size`, else `None`
    pub fn acquire(&self) -> Option<Lease<C>> {
        let mut inner = self.inner.lock();
        if !inner.running {
            return None;
        }

        let index = match inner.instances.iter().position(|i| !i.in_use) {
            Some(index) => index,
            None if inner.instances.len() < inner.max_size => inner.spawn_instance(&self.factory),
            None => return None,
        };
        inner.total_acquired += 1;

        let instance = &mut inner.instances[index];
        instance.in_use = true;
        instance.last_used = Instant::now();
        instance.last_used_at = Utc::now();

        Some(Lease {
            id: instance.id.clone(),
            context: Arc::clone(&instance.context),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Return an instance to the idle set; unknown or idle ids are ignored
    pub fn release(&self, id: &str) {
        self.inner.lock().release(id);
    }

    /// Evict idle instances past the TTL, then replenish the floor
    pub fn cleanup(&self) -> usize {
        self.cleanup_with_now(Instant::now())
    }

    /// [`cleanup`](Self::cleanup) against an explicit clock
    pub fn cleanup_with_now(&self, now: Instant) -> usize {
        self.inner.lock().cleanup(now, &self.factory)
    }

    /// Drop every instance and cancel the cleanup schedule
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if let Some(task) = inner.cleanup_task.take() {
            task.abort();
        }
        inner.instances.clear();
        if inner.running {
            info!("Warm pool stopped");
        }
        inner.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        let idle = inner.idle();
        PoolStats {
            running: inner.running,
            max_size: inner.max_size,
            total: inner.instances.len(),
            idle,
            in_use: inner.instances.len() - idle,
            total_created: inner.total_created,
            total_acquired: inner.total_acquired,
            total_evicted: inner.total_evicted,
        }
    }
}

impl<C> Drop for WarmPool<C> {
    fn drop(&mut self) {
        if let Some(task) = self.inner.lock().cleanup_task.take() {
            task.abort();
        }
    }
}

/// An acquired instance. Released back to the pool when dropped.
pub struct Lease<C> {
    id: String,
    context: Arc<C>,
    pool: Arc<Mutex<PoolInner<C>>>,
}

impl<C> Lease<C> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn context(&self) -> Arc<C> {
        Arc::clone(&self.context)
    }
}

impl<C> Drop for Lease<C> {
    fn drop(&mut self) {
        self.pool.lock().release(&self.id);
    }
}
