//! Isolate lifecycle: one live isolate per route pattern, started on first
//! use, replaced when stale, dropped when unreachable.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use engine::TransportKind;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use isolate::{Manifest, StartupMetadata};
use parking_lot::Mutex;
use resolver::RoutePattern;
use transport::{AddressConfig, IsolateAddress, Transport};

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::launcher::{IsolateHandle, LaunchSpec, Launcher};
use crate::port::find_free_port;
use crate::registry::{IsolateRecord, IsolateRegistry};

type SpawnFuture = Shared<BoxFuture<'static, Result<Arc<IsolateRecord>, PoolError>>>;

/// What a new isolate for a pattern should load.
#[derive(Debug, Clone, Default)]
pub struct SpawnSpec {
    pub import: String,
    pub params: BTreeMap<String, String>,
    pub variables: BTreeMap<String, String>,
    pub cwd: Option<String>,
    pub manifest: Option<Manifest>,
}

// ========== Pool Metrics ==========

/// Metrics for monitoring pool health
#[derive(Default)]
pub struct PoolMetrics {
    pub total_requests: AtomicU64,
    pub cache_hits: AtomicU64,
    pub spawns: AtomicU64,
    pub spawn_failures: AtomicU64,
    pub upgrades: AtomicU64,
    pub evictions: AtomicU64,
}

impl PoolMetrics {
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.total_requests.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        let hits = self.cache_hits.load(Ordering::Relaxed);
        hits as f64 / total as f64
    }

    /// Get metrics as a JSON-serializable snapshot
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "total_requests": self.total_requests.load(Ordering::Relaxed),
            "cache_hits": self.cache_hits.load(Ordering::Relaxed),
            "cache_hit_rate": self.cache_hit_rate(),
            "spawns": self.spawns.load(Ordering::Relaxed),
            "spawn_failures": self.spawn_failures.load(Ordering::Relaxed),
            "upgrades": self.upgrades.load(Ordering::Relaxed),
            "evictions": self.evictions.load(Ordering::Relaxed),
        })
    }
}

// ========== Isolate Manager ==========

/// Owns every isolate of one proxy. Cheap to clone.
#[derive(Clone)]
pub struct IsolateManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: PoolConfig,
    transport: Arc<dyn Transport>,
    launcher: Arc<dyn Launcher>,
    registry: IsolateRegistry,
    inflight: Mutex<HashMap<RoutePattern, SpawnFuture>>,
    reserved_ports: Mutex<HashSet<u16>>,
    invalidated_at: Mutex<Option<Instant>>,
    generation: AtomicU64,
    closed: AtomicBool,
    metrics: PoolMetrics,
}

impl IsolateManager {
    pub fn new(config: PoolConfig, transport: Arc<dyn Transport>, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                launcher,
                registry: IsolateRegistry::new(),
                inflight: Mutex::new(HashMap::new()),
                reserved_ports: Mutex::new(HashSet::new()),
                invalidated_at: Mutex::new(None),
                generation: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                metrics: PoolMetrics::default(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn registry(&self) -> &IsolateRegistry {
        &self.inner.registry
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.inner.metrics
    }

    /// Address of a ready isolate for `pattern`, starting one if needed.
    ///
    /// A cached isolate is reused unless `bust` is set, it predates the last
    /// [`invalidate`](Self::invalidate), or it has exited. Concurrent calls for
    /// one pattern share a single spawn. The spawn runs on its own task, so a
    /// caller that gives up does not cancel it for the others.
    pub async fn ensure(
        &self,
        pattern: &RoutePattern,
        spec: SpawnSpec,
        bust: bool,
    ) -> Result<IsolateAddress, PoolError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(PoolError::ShutDown);
        }
        inner.metrics.total_requests.fetch_add(1, Ordering::Relaxed);

        let spawn = {
            let mut inflight = inner.inflight.lock();
            match inflight.get(pattern) {
                Some(spawn) => spawn.clone(),
                None => {
                    if let Some(record) = inner.registry.get(pattern) {
                        if record.handle.has_exited() {
                            tracing::warn!("Isolate for {} exited; starting a new one", pattern);
                            if inner.registry.remove_if_address(pattern, &record.address).is_some() {
                                inner.retire(&record);
                            }
                        } else if !bust && !inner.is_stale(&record) {
                            inner.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                            return Ok(record.address.clone());
                        }
                    }
                    let spawn = self.start_spawn(pattern.clone(), spec);
                    inflight.insert(pattern.clone(), spawn.clone());
                    spawn
                }
            }
        };

        spawn.await.map(|record| record.address.clone())
    }

    // Called with the inflight lock held; the task removes its own entry
    // once done, which cannot happen before the caller has inserted it.
    fn start_spawn(&self, pattern: RoutePattern, spec: SpawnSpec) -> SpawnFuture {
        let inner = self.inner.clone();
        let key = pattern.to_string();
        let task = tokio::spawn(async move {
            let result = inner.spawn_isolate(&pattern, &spec).await;
            inner.inflight.lock().remove(&pattern);
            result
        });
        async move {
            match task.await {
                Ok(result) => result,
                Err(err) => {
                    tracing::warn!("Spawn task for {} failed: {}", key, err);
                    Err(PoolError::Abandoned(key))
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Terminates and forgets the isolate for `pattern`.
    pub fn evict(&self, pattern: &RoutePattern) -> bool {
        match self.inner.registry.remove(pattern) {
            Some(record) => {
                self.inner.evicted(&record);
                true
            }
            None => false,
        }
    }

    /// Like [`evict`](Self::evict), but only while the registry still points
    /// at `address`. A failed request must not evict the replacement that an
    /// upgrade swapped in meanwhile.
    pub fn evict_address(&self, pattern: &RoutePattern, address: &IsolateAddress) -> bool {
        match self.inner.registry.remove_if_address(pattern, address) {
            Some(record) => {
                self.inner.evicted(&record);
                true
            }
            None => false,
        }
    }

    /// Marks every isolate loaded before now as stale; each is replaced on
    /// its next request.
    pub fn invalidate(&self) {
        *self.inner.invalidated_at.lock() = Some(Instant::now());
        tracing::info!(
            "Invalidated {} isolate(s); they upgrade on next request",
            self.inner.registry.len()
        );
    }

    pub fn is_stale(&self, record: &IsolateRecord) -> bool {
        self.inner.is_stale(record)
    }

    /// Terminates every isolate.
    /// Stops every isolate. Spawns still in flight discard their isolate
    /// instead of installing it, and later `ensure` calls fail.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let records = self.inner.registry.drain();
        if !records.is_empty() {
            tracing::info!("Stopping {} isolate(s)", records.len());
        }
        for record in records {
            self.inner.retire(&record);
        }
    }
}

impl Inner {
    fn is_stale(&self, record: &IsolateRecord) -> bool {
        match *self.invalidated_at.lock() {
            Some(invalidated_at) => record.loaded_at < invalidated_at,
            None => false,
        }
    }

    async fn spawn_isolate(
        &self,
        pattern: &RoutePattern,
        spec: &SpawnSpec,
    ) -> Result<Arc<IsolateRecord>, PoolError> {
        let attempts = self.config.spawn_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.try_spawn(pattern, spec).await {
                Ok(record) => return self.install(record),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    tracing::warn!(
                        "Spawn attempt {}/{} for {} failed: {}; retrying",
                        attempt,
                        attempts,
                        pattern,
                        err
                    );
                    attempt += 1;
                }
                Err(err) => {
                    self.metrics.spawn_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Failed to start isolate for {}: {}", pattern, err);
                    return Err(err);
                }
            }
        }
    }

    async fn try_spawn(&self, pattern: &RoutePattern, spec: &SpawnSpec) -> Result<IsolateRecord, PoolError> {
        let port = match self.transport.kind() {
            TransportKind::Http => Some(self.reserve_port()?),
            TransportKind::Worker | TransportKind::PubSub => None,
        };
        let result = self.launch_ready(pattern, spec, port).await;
        if let (Err(_), Some(port)) = (&result, port) {
            self.release_port(port);
        }
        result
    }

    async fn launch_ready(
        &self,
        pattern: &RoutePattern,
        spec: &SpawnSpec,
        port: Option<u16>,
    ) -> Result<IsolateRecord, PoolError> {
        // Worker ids and subjects get a generation suffix so a replacement
        // never shares an address with the isolate it replaces.
        let name = match port {
            Some(_) => pattern.to_string(),
            None => format!(
                "{}/{}",
                pattern,
                self.generation.fetch_add(1, Ordering::Relaxed)
            ),
        };
        let address = self.transport.create_address(&AddressConfig { port, name })?;
        let launch = LaunchSpec {
            pattern: pattern.clone(),
            address: address.clone(),
            metadata: StartupMetadata {
                import: spec.import.clone(),
                pattern: pattern.to_string(),
                params: spec.params.clone(),
                variables: spec.variables.clone(),
                cwd: spec.cwd.clone(),
                permissions: self.config.permissions.clone(),
                manifest: spec.manifest.clone(),
            },
        };

        // Taken before launch so an invalidation during startup still counts.
        let loaded_at = Instant::now();
        let handle = self.launcher.launch(&launch).await?;

        let ready = tokio::select! {
            ready = self.transport.wait_for_ready(
                &address,
                self.config.health_timeout,
                self.config.health_interval,
            ) => ready.map_err(PoolError::from),
            _ = wait_for_exit(handle.as_ref(), self.config.health_interval) => Err(PoolError::Exited {
                pattern: pattern.to_string(),
            }),
        };
        if let Err(err) = ready {
            handle.terminate();
            return Err(err);
        }

        Ok(IsolateRecord {
            pattern: pattern.clone(),
            address,
            import: spec.import.clone(),
            handle,
            loaded_at,
        })
    }

    /// Swaps the new record in, then terminates whatever it replaced.
    // The flag is checked after inserting: either this check sees the
    // shutdown, or the shutdown's drain sees the record.
    fn install(&self, record: IsolateRecord) -> Result<Arc<IsolateRecord>, PoolError> {
        let record = Arc::new(record);
        self.metrics.spawns.fetch_add(1, Ordering::Relaxed);
        let replaced = self.registry.insert(record.clone());
        if self.closed.load(Ordering::SeqCst) {
            tracing::info!("Discarding isolate for {} started during shutdown", record.pattern);
            if let Some(old) = replaced {
                self.retire(&old);
            }
            if self
                .registry
                .remove_if_address(&record.pattern, &record.address)
                .is_some()
            {
                self.retire(&record);
            }
            return Err(PoolError::ShutDown);
        }
        match replaced {
            Some(old) => {
                self.metrics.upgrades.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    "Upgraded isolate for {}: {} -> {}",
                    record.pattern,
                    old.address,
                    record.address
                );
                self.retire(&old);
            }
            None => tracing::info!(
                "Isolate for {} ({}) ready at {}",
                record.pattern,
                record.import,
                record.address
            ),
        }
        Ok(record)
    }

    fn evicted(&self, record: &IsolateRecord) {
        self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Evicted isolate for {} at {}", record.pattern, record.address);
        self.retire(record);
    }

    fn retire(&self, record: &IsolateRecord) {
        record.terminate();
        if let Some(port) = record.address.port() {
            self.release_port(port);
        }
    }

    fn reserve_port(&self) -> Result<u16, PoolError> {
        let mut reserved = self.reserved_ports.lock();
        let port = find_free_port(self.config.port_start, self.config.port_end, &reserved).ok_or(
            PoolError::PortExhausted {
                start: self.config.port_start,
                end: self.config.port_end,
            },
        )?;
        reserved.insert(port);
        Ok(port)
    }

    fn release_port(&self, port: u16) {
        self.reserved_ports.lock().remove(&port);
    }
}

async fn wait_for_exit(handle: &dyn IsolateHandle, interval: Duration) {
    while !handle.has_exited() {
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use async_trait::async_trait;
    use engine::{RequestEnvelope, ResponseSink, handler_fn};
    use http_body_util::BodyExt;
    use isolate::{Module, StaticModuleSource};
    use transport::{WorkerHub, WorkerTransport};

    use crate::launcher::WorkerLauncher;

    fn source() -> Arc<StaticModuleSource> {
        let handler = handler_fn(|request: RequestEnvelope, response: ResponseSink| async move {
            response.send(format!("hello {}", request.path));
        });
        Arc::new(
            StaticModuleSource::new()
                .with_module(Module::new("api/hello.ts", "").with_handler(handler)),
        )
    }

    fn spec() -> SpawnSpec {
        SpawnSpec {
            import: "api/hello.ts".to_string(),
            ..SpawnSpec::default()
        }
    }

    fn pattern() -> RoutePattern {
        RoutePattern::parse("local", "/api/hello")
    }

    fn fast_config() -> PoolConfig {
        PoolConfig {
            transport: TransportKind::Worker,
            health_timeout: Duration::from_millis(200),
            health_interval: Duration::from_millis(5),
            ..PoolConfig::default()
        }
    }

    /// Counts launches; the first `dead_on_arrival` launches exit at once.
    struct Counting {
        inner: WorkerLauncher,
        launches: AtomicUsize,
        dead_on_arrival: usize,
        delay: Duration,
    }

    struct Exited;

    impl IsolateHandle for Exited {
        fn id(&self) -> String {
            "exited".to_string()
        }

        fn has_exited(&self) -> bool {
            true
        }

        fn terminate(&self) {}
    }

    #[async_trait]
    impl Launcher for Counting {
        async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn IsolateHandle>, PoolError> {
            let launch = self.launches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if launch < self.dead_on_arrival {
                return Ok(Box::new(Exited));
            }
            self.inner.launch(spec).await
        }
    }

    fn manager(dead_on_arrival: usize) -> (IsolateManager, Arc<Counting>, Arc<WorkerHub>) {
        let hub = WorkerHub::new();
        let launcher = Arc::new(Counting {
            inner: WorkerLauncher::new(hub.clone(), source()),
            launches: AtomicUsize::new(0),
            dead_on_arrival,
            delay: Duration::from_millis(20),
        });
        let manager = IsolateManager::new(
            fast_config(),
            Arc::new(WorkerTransport::new(hub.clone())),
            launcher.clone(),
        );
        (manager, launcher, hub)
    }

    #[tokio::test]
    async fn concurrent_cold_requests_share_one_spawn() {
        let (manager, launcher, _hub) = manager(0);
        let pattern = pattern();

        let calls = (0..8).map(|_| manager.ensure(&pattern, spec(), false));
        let addresses = futures_util::future::join_all(calls).await;

        let first = addresses[0].clone().expect("address");
        for address in addresses {
            assert_eq!(address.expect("address"), first);
        }
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert_eq!(manager.registry().len(), 1);
        assert_eq!(manager.metrics().spawns.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn warm_requests_reuse_the_isolate() {
        let (manager, launcher, _hub) = manager(0);
        let first = manager.ensure(&pattern(), spec(), false).await.expect("cold");
        let second = manager.ensure(&pattern(), spec(), false).await.expect("warm");
        assert_eq!(first, second);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert_eq!(manager.metrics().cache_hits.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn spawned_isolate_serves_requests() {
        let (manager, _launcher, _hub) = manager(0);
        let address = manager.ensure(&pattern(), spec(), false).await.expect("address");
        let response = manager
            .transport()
            .send(&address, RequestEnvelope::new("GET", "/api/hello"))
            .await
            .expect("send");
        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(&body[..], b"hello /api/hello");
    }

    #[tokio::test]
    async fn invalidation_upgrades_and_retires_the_old_isolate() {
        let (manager, launcher, _hub) = manager(0);
        let old = manager.ensure(&pattern(), spec(), false).await.expect("cold");

        manager.invalidate();
        let new = manager.ensure(&pattern(), spec(), false).await.expect("upgrade");

        assert_ne!(old, new);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
        assert_eq!(manager.registry().len(), 1);
        assert_eq!(manager.metrics().upgrades.load(Ordering::Relaxed), 1);
        assert!(!manager.transport().health_check(&old).await);
        assert!(manager.transport().health_check(&new).await);

        let again = manager.ensure(&pattern(), spec(), false).await.expect("warm");
        assert_eq!(again, new);
    }

    #[tokio::test]
    async fn bust_forces_a_replacement() {
        let (manager, launcher, _hub) = manager(0);
        let old = manager.ensure(&pattern(), spec(), false).await.expect("cold");
        let new = manager.ensure(&pattern(), spec(), true).await.expect("bust");
        assert_ne!(old, new);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn eviction_forces_a_cold_start() {
        let (manager, launcher, _hub) = manager(0);
        let address = manager.ensure(&pattern(), spec(), false).await.expect("cold");

        let elsewhere = IsolateAddress {
            url: "worker://elsewhere".to_string(),
            ..address.clone()
        };
        assert!(!manager.evict_address(&pattern(), &elsewhere));
        assert!(manager.evict_address(&pattern(), &address));
        assert!(manager.registry().is_empty());
        assert!(!manager.transport().health_check(&address).await);

        manager.ensure(&pattern(), spec(), false).await.expect("fresh");
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
        assert_eq!(manager.metrics().evictions.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn early_exit_is_retried() {
        let (manager, launcher, _hub) = manager(1);
        manager.ensure(&pattern(), spec(), false).await.expect("second attempt");
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
        assert_eq!(manager.registry().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_report_the_exit() {
        let (manager, launcher, _hub) = manager(usize::MAX);
        let err = manager.ensure(&pattern(), spec(), false).await.expect_err("never starts");
        assert_eq!(
            err,
            PoolError::Exited {
                pattern: "/api/hello".to_string()
            }
        );
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 3);
        assert!(manager.registry().is_empty());
        assert_eq!(manager.metrics().spawn_failures.load(Ordering::Relaxed), 1);
    }

    /// Starts nothing, so the isolate never answers its health check.
    struct Silent {
        terminated: Arc<AtomicBool>,
    }

    struct SilentHandle(Arc<AtomicBool>);

    impl IsolateHandle for SilentHandle {
        fn id(&self) -> String {
            "silent".to_string()
        }

        fn has_exited(&self) -> bool {
            false
        }

        fn terminate(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Launcher for Silent {
        async fn launch(&self, _spec: &LaunchSpec) -> Result<Box<dyn IsolateHandle>, PoolError> {
            Ok(Box::new(SilentHandle(self.terminated.clone())))
        }
    }

    #[tokio::test]
    async fn health_timeout_fails_the_spawn_and_is_not_cached() {
        let terminated = Arc::new(AtomicBool::new(false));
        let manager = IsolateManager::new(
            PoolConfig {
                health_timeout: Duration::from_millis(30),
                ..fast_config()
            },
            Arc::new(WorkerTransport::new(WorkerHub::new())),
            Arc::new(Silent {
                terminated: terminated.clone(),
            }),
        );

        let err = manager.ensure(&pattern(), spec(), false).await.expect_err("timeout");
        assert!(matches!(err, PoolError::HealthTimeout(_)));
        assert!(err.to_string().starts_with("timed out waiting for isolate at worker://"));
        assert!(terminated.load(Ordering::SeqCst));
        assert!(manager.registry().is_empty());

        let err = manager.ensure(&pattern(), spec(), false).await.expect_err("retried");
        assert!(matches!(err, PoolError::HealthTimeout(_)));
        assert_eq!(manager.metrics().spawn_failures.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn shutdown_terminates_everything() {
        let (manager, _launcher, _hub) = manager(0);
        let address = manager.ensure(&pattern(), spec(), false).await.expect("cold");
        manager.shutdown();
        assert!(manager.registry().is_empty());
        assert!(!manager.transport().health_check(&address).await);
    }

    #[tokio::test]
    async fn shutdown_discards_spawns_in_flight() {
        let (manager, launcher, _hub) = manager(0);
        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.ensure(&pattern(), spec(), false).await })
        };
        while launcher.launches.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        manager.shutdown();
        let result = pending.await.expect("join");
        assert_eq!(result, Err(PoolError::ShutDown));
        assert!(manager.registry().is_empty());

        let err = manager.ensure(&pattern(), spec(), false).await.expect_err("closed");
        assert_eq!(err, PoolError::ShutDown);
    }
}
