// ABOUTME: Fingerprint-keyed pool of live sandboxes with expiry and reuse caps
// ABOUTME: Deduplicates concurrent creations through shared in-flight futures

use crate::backend::{SandboxBackend, SandboxHandle};
use crate::config::SandboxConfig;
use crate::settings::PoolSettings;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pool errors are cloneable so a single creation failure reaches every
/// concurrent waiter on the shared in-flight future.
#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("Sandbox creation failed: {0}")]
    Creation(String),

    #[error("Sandbox pool is shut down")]
    Draining,
}

pub type Result<T> = std::result::Result<T, PoolError>;

/// A live execution environment kept alive across invocations.
#[derive(Debug)]
pub struct PooledSandbox {
    pub handle: SandboxHandle,
    pub fingerprint: String,
    pub dependencies: HashMap<String, String>,
    created_at: Instant,
    timeout_budget: Duration,
    use_count: AtomicU32,
}

impl PooledSandbox {
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn use_count(&self) -> u32 {
        self.use_count.load(Ordering::SeqCst)
    }

    /// Timeout budget left after the time already spent alive.
    pub fn remaining_budget(&self) -> Duration {
        self.timeout_budget.saturating_sub(self.age())
    }

    /// Expiry predicate: too old, over the reuse cap, or not enough budget
    /// left to safely start another invocation.
    pub fn is_expired(&self, settings: &PoolSettings) -> bool {
        self.age() > settings.ttl()
            || self.use_count() >= settings.max_use_count
            || self.remaining_budget() <= settings.safety_margin()
    }

    fn bump(&self) -> u32 {
        self.use_count.fetch_add(1, Ordering::SeqCst) + 1
    }
}

type CreationFuture = Shared<BoxFuture<'static, Result<Arc<PooledSandbox>>>>;

#[derive(Default)]
struct PoolState {
    entries: HashMap<String, Arc<PooledSandbox>>,
    pending: HashMap<String, CreationFuture>,
}

/// Per-executor registry of live sandboxes keyed by dependency fingerprint.
///
/// At most one creation is ever in flight per fingerprint: concurrent
/// acquirers share the same in-flight future instead of racing to create
/// duplicates. State is only mutated from within the pool's own methods.
pub struct SandboxPool {
    backend: Arc<dyn SandboxBackend>,
    settings: PoolSettings,
    state: Arc<Mutex<PoolState>>,
    draining: Arc<AtomicBool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SandboxPool {
    pub fn new(backend: Arc<dyn SandboxBackend>, settings: PoolSettings) -> Self {
        Self {
            backend,
            settings,
            state: Arc::new(Mutex::new(PoolState::default())),
            draining: Arc::new(AtomicBool::new(false)),
            sweeper: Mutex::new(None),
        }
    }

    /// Acquire a sandbox for `fingerprint`, reusing a valid pooled entry,
    /// joining an in-flight creation, or creating a fresh environment.
    pub async fn acquire(
        &self,
        fingerprint: &str,
        dependencies: &HashMap<String, String>,
        config: &SandboxConfig,
    ) -> Result<Arc<PooledSandbox>> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(PoolError::Draining);
        }

        let creation = {
            let mut state = self.state.lock().await;

            let reusable = match state.entries.get(fingerprint) {
                Some(entry) if !entry.is_expired(&self.settings) => Some(entry.clone()),
                _ => None,
            };
            if let Some(entry) = reusable {
                let uses = entry.bump();
                debug!(
                    "reusing sandbox {} for fingerprint {} (use {})",
                    entry.handle.id, fingerprint, uses
                );
                return Ok(entry);
            }

            // An entry still present here is expired: unregister it before
            // the (possibly slow) teardown so no concurrent acquire can
            // observe a half-torn-down entry.
            if let Some(stale) = state.entries.remove(fingerprint) {
                debug!(
                    "retiring sandbox {} (age {:?}, uses {})",
                    stale.handle.id,
                    stale.age(),
                    stale.use_count()
                );
                let backend = self.backend.clone();
                tokio::spawn(async move {
                    if let Err(e) = backend.teardown(&stale.handle).await {
                        warn!("failed to tear down sandbox {}: {}", stale.handle.id, e);
                    }
                });
            }

            match state.pending.get(fingerprint) {
                Some(pending) => pending.clone(),
                None => {
                    let future = self.creation_future(
                        fingerprint.to_string(),
                        dependencies.clone(),
                        config.clone(),
                    );
                    state.pending.insert(fingerprint.to_string(), future.clone());
                    future
                }
            }
        };

        let entry = creation.await?;
        entry.bump();
        Ok(entry)
    }

    fn creation_future(
        &self,
        fingerprint: String,
        dependencies: HashMap<String, String>,
        config: SandboxConfig,
    ) -> CreationFuture {
        let backend = self.backend.clone();
        let state = self.state.clone();
        let draining = self.draining.clone();
        let timeout_budget = Duration::from_millis(config.timeout_ms);

        async move {
            let created = backend.create_sandbox(&dependencies, &config).await;

            let mut guard = state.lock().await;
            guard.pending.remove(&fingerprint);

            let handle = match created {
                Ok(handle) => handle,
                Err(e) => {
                    // Any partial environment was discarded by the backend;
                    // clearing the pending slot lets a later call retry fresh.
                    return Err(PoolError::Creation(e.to_string()));
                }
            };

            if draining.load(Ordering::SeqCst) {
                drop(guard);
                if let Err(e) = backend.teardown(&handle).await {
                    warn!("failed to tear down sandbox {}: {}", handle.id, e);
                }
                return Err(PoolError::Draining);
            }

            info!(
                "pooled new sandbox {} for fingerprint {}",
                handle.id, fingerprint
            );
            let entry = Arc::new(PooledSandbox {
                handle,
                fingerprint: fingerprint.clone(),
                dependencies,
                created_at: Instant::now(),
                timeout_budget,
                use_count: AtomicU32::new(0),
            });
            guard.entries.insert(fingerprint, entry.clone());
            Ok(entry)
        }
        .boxed()
        .shared()
    }

    /// Remove the entry for `fingerprint` and tear its sandbox down. The
    /// entry leaves the map before the teardown call is awaited.
    pub async fn release(&self, fingerprint: &str) {
        let removed = {
            let mut state = self.state.lock().await;
            state.entries.remove(fingerprint)
        };
        if let Some(entry) = removed {
            debug!("releasing sandbox {}", entry.handle.id);
            if let Err(e) = self.backend.teardown(&entry.handle).await {
                warn!("failed to tear down sandbox {}: {}", entry.handle.id, e);
            }
        }
    }

    /// One expiry pass over the pool; returns the number of retired entries.
    pub async fn sweep_expired(&self) -> usize {
        Self::sweep_once(&self.state, &self.backend, &self.settings).await
    }

    async fn sweep_once(
        state: &Arc<Mutex<PoolState>>,
        backend: &Arc<dyn SandboxBackend>,
        settings: &PoolSettings,
    ) -> usize {
        let expired: Vec<Arc<PooledSandbox>> = {
            let mut guard = state.lock().await;
            let fingerprints: Vec<String> = guard
                .entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(settings))
                .map(|(fp, _)| fp.clone())
                .collect();
            fingerprints
                .iter()
                .filter_map(|fp| guard.entries.remove(fp))
                .collect()
        };

        let count = expired.len();
        for entry in expired {
            debug!(
                "sweeping expired sandbox {} (age {:?}, uses {})",
                entry.handle.id,
                entry.age(),
                entry.use_count()
            );
            if let Err(e) = backend.teardown(&entry.handle).await {
                warn!("failed to tear down sandbox {}: {}", entry.handle.id, e);
            }
        }
        count
    }

    /// Start the background expiry sweep. The task is owned by the pool and
    /// cancelled by `drain_all`.
    pub async fn start_sweeper(&self) {
        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_some() {
            return;
        }

        let state = self.state.clone();
        let backend = self.backend.clone();
        let settings = self.settings.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(settings.sweep_interval());
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                let swept = Self::sweep_once(&state, &backend, &settings).await;
                if swept > 0 {
                    debug!("pool sweep retired {} sandboxes", swept);
                }
            }
        });
        *sweeper = Some(handle);
    }

    /// Cancel the sweeper and tear down every pooled sandbox. New acquires
    /// fail with `PoolError::Draining` afterwards.
    pub async fn drain_all(&self) {
        self.draining.store(true, Ordering::SeqCst);

        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.abort();
        }

        let entries: Vec<Arc<PooledSandbox>> = {
            let mut state = self.state.lock().await;
            state.pending.clear();
            state.entries.drain().map(|(_, entry)| entry).collect()
        };

        info!("draining sandbox pool ({} entries)", entries.len());
        for entry in entries {
            if let Err(e) = self.backend.teardown(&entry.handle).await {
                warn!("failed to tear down sandbox {}: {}", entry.handle.id, e);
            }
        }
    }

    /// Number of live pooled entries.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
