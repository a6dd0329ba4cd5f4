// src/execution/pool.rs
//! Pooled interpreter execution backend
//!
//! A bounded pool of persistent interpreter workers, created lazily behind a
//! single-entry initialization gate so concurrent first callers cannot
//! double-initialize. Initialization raises the process-scope execution
//! restriction ceiling, loads vendor modules per the resolver's plan, and
//! smoke-tests each worker. If initialization fails the pool reports itself
//! unavailable and every later call fails fast without reattempting.
//!
//! # Architecture
//!
//! ```text
//! ShellPool
//! ├─ Idle: [Worker1, Worker2, ...]   (ready interpreter processes)
//! ├─ Leased: [Worker3, ...]          (running scripts)
//! └─ Waiters: [Caller1, ...]         (blocked on the capacity semaphore)
//! ```
//!
//! Requests beyond capacity block until a slot frees, deliberate
//! backpressure against unbounded interpreter creation. A deadline mid-run
//! abandons the slot: the worker is killed, the permit returns, and the next
//! lease spawns a fresh worker.

use crate::execution::interpreter::InterpreterProfile;
use crate::execution::types::{parse_objects, ExecutionRequest, ExecutionResult, FailureKind};
use crate::execution::worker::{ShellWorker, WorkerConfig};
use crate::modules::resolver::{self, ModuleLoadPlan, ModuleResolver};
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OnceCell, Semaphore};
use tracing::{debug, info, warn};

const SMOKE_MARKER: &str = "VIRTOPS_POOL_READY";

/// Configuration for the interpreter pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of persistent workers (minimum 1)
    pub capacity: usize,

    /// Worker spawn settings
    pub worker: WorkerConfig,

    /// Smoke-test each worker during initialization
    pub smoke_test: bool,

    /// Timeout for each initialization step per worker
    pub init_timeout: Duration,
}

impl PoolConfig {
    pub fn new(capacity: usize, worker: WorkerConfig) -> Self {
        Self {
            capacity: capacity.max(1),
            worker,
            smoke_test: true,
            init_timeout: Duration::from_secs(120),
        }
    }

    /// Build pool configuration from engine configuration
    pub fn from_engine_config(config: &EngineConfig, profile: InterpreterProfile) -> Self {
        let mut worker = WorkerConfig::new(profile);
        worker.inherit_environment = config.execution.inherit_environment;
        worker.env_vars = config
            .execution
            .env_vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut pool = Self::new(config.pool.capacity, worker);
        pool.smoke_test = config.pool.smoke_test;
        pool
    }
}

/// What initialization decided, memoized for the pool's lifetime
enum InitOutcome {
    Ready {
        /// Module-loading script replayed on every replacement worker
        load_script: Option<String>,

        /// The resolved plan with loaded flags from the first worker
        plan: Option<ModuleLoadPlan>,
    },
    Unavailable(String),
}

/// Pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub capacity: usize,
    pub available_slots: usize,
    pub busy_slots: usize,
    pub idle_workers: usize,
}

/// Bounded pool of persistent interpreter workers
pub struct ShellPool {
    config: PoolConfig,
    resolver: Arc<ModuleResolver>,
    init: OnceCell<InitOutcome>,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<ShellWorker>>,
    next_worker_id: AtomicUsize,
}

impl ShellPool {
    /// Create an uninitialized pool; workers spawn on first use
    pub fn new(config: PoolConfig, resolver: Arc<ModuleResolver>) -> Self {
        let capacity = config.capacity;
        Self {
            config,
            resolver,
            init: OnceCell::new(),
            semaphore: Arc::new(Semaphore::new(capacity)),
            idle: Mutex::new(Vec::with_capacity(capacity)),
            next_worker_id: AtomicUsize::new(1),
        }
    }

    /// The module plan in effect, once initialization has run
    pub fn module_plan(&self) -> Option<&ModuleLoadPlan> {
        match self.init.get() {
            Some(InitOutcome::Ready { plan, .. }) => plan.as_ref(),
            _ => None,
        }
    }

    /// Pool statistics
    pub async fn stats(&self) -> PoolStats {
        let idle = self.idle.lock().await.len();
        let available = self.semaphore.available_permits();
        PoolStats {
            capacity: self.config.capacity,
            available_slots: available,
            busy_slots: self.config.capacity - available,
            idle_workers: idle,
        }
    }

    /// Execute a request on a pooled worker.
    ///
    /// `Err` means the pool mechanism could not run the script (unavailable
    /// after failed initialization, worker spawn failure); script errors,
    /// timeouts and cancellations come back as classified `Ok` results.
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let started = Instant::now();

        let load_script = match self.ensure_initialized().await {
            InitOutcome::Ready { load_script, .. } => load_script.clone(),
            InitOutcome::Unavailable(reason) => {
                return Err(EngineError::PoolUnavailable(reason.clone()));
            }
        };

        // Lease a slot under the request's own deadline; waiting for
        // capacity counts against the caller's timeout.
        let permit = tokio::select! {
            permit = self.semaphore.acquire() => {
                permit.map_err(|_| EngineError::PoolExhausted)?
            }
            _ = tokio::time::sleep(request.timeout) => {
                return Ok(ExecutionResult::failure_message(
                    FailureKind::Timeout,
                    format!("no pool slot freed within {:?}", request.timeout),
                    started.elapsed(),
                ));
            }
            _ = request.cancellation.cancelled() => {
                return Ok(ExecutionResult::failure_message(
                    FailureKind::Cancelled,
                    "cancelled while waiting for a pool slot",
                    started.elapsed(),
                ));
            }
        };

        let mut worker = match self.lease_worker(load_script.as_deref()).await {
            Ok(worker) => {
                permit.forget(); // Slot stays claimed until release/abandon
                worker
            }
            Err(e) => return Err(e),
        };

        debug!("Leased worker #{} from pool", worker.id);

        match worker.execute(request).await {
            Ok(output) => {
                let elapsed = started.elapsed();

                if output.died {
                    // The script took the interpreter down with it; the slot
                    // frees and the next lease spawns a replacement.
                    warn!("Worker #{} died mid-script", worker.id);
                    self.semaphore.add_permits(1);

                    let error = if output.error.trim().is_empty() {
                        "interpreter process exited while running the script".to_string()
                    } else {
                        output.error
                    };
                    return Ok(ExecutionResult::failed(
                        FailureKind::Script,
                        output.output,
                        error,
                        elapsed,
                    ));
                }

                self.release_worker(worker).await;

                if output.error.trim().is_empty() {
                    let objects = if request.capture_objects {
                        parse_objects(&output.output)
                    } else {
                        Vec::new()
                    };
                    Ok(ExecutionResult::succeeded(output.output, objects, elapsed))
                } else {
                    Ok(ExecutionResult::failed(
                        FailureKind::Script,
                        output.output,
                        output.error,
                        elapsed,
                    ))
                }
            }
            Err(EngineError::ExecutionTimeout) => {
                debug!("Abandoning slot of worker #{} after timeout", worker.id);
                self.semaphore.add_permits(1);
                Ok(ExecutionResult::failure_message(
                    FailureKind::Timeout,
                    format!("execution timed out after {:?}", request.timeout),
                    started.elapsed(),
                ))
            }
            Err(EngineError::ExecutionCancelled) => {
                debug!("Abandoning slot of worker #{} after cancellation", worker.id);
                self.semaphore.add_permits(1);
                Ok(ExecutionResult::failure_message(
                    FailureKind::Cancelled,
                    "execution cancelled by caller",
                    started.elapsed(),
                ))
            }
            Err(e) => {
                self.semaphore.add_permits(1);
                Err(e)
            }
        }
    }

    /// Shut down all idle workers. Leased workers die with their processes
    /// when dropped (`kill_on_drop`).
    pub async fn shutdown(&self) {
        let mut idle = self.idle.lock().await;
        info!("Shutting down {} idle pool workers", idle.len());
        for mut worker in idle.drain(..) {
            worker.shutdown().await;
        }
    }

    /// Single-entry initialization gate; concurrent first callers wait on
    /// the same in-flight attempt, and the outcome is never recomputed.
    async fn ensure_initialized(&self) -> &InitOutcome {
        self.init
            .get_or_init(|| async {
                match self.initialize().await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!("Pool initialization failed: {}", e);
                        InitOutcome::Unavailable(e.to_string())
                    }
                }
            })
            .await
    }

    async fn initialize(&self) -> Result<InitOutcome> {
        info!(
            "Initializing interpreter pool with {} workers",
            self.config.capacity
        );

        // Resolve the module plan once per pool lifetime
        let (mut plan, load_script) = if self.config.worker.profile.kind.supports_vendor_modules()
        {
            let plan = self.resolver.plan().await?.clone();
            for note in &plan.diagnostics {
                info!("Module resolution: {}", note);
            }
            let script = resolver::load_script(&plan);
            (Some(plan), script)
        } else {
            (None, None)
        };

        let mut workers = Vec::with_capacity(self.config.capacity);
        for index in 0..self.config.capacity {
            let (worker, load_failures) = self
                .spawn_initialized_worker(load_script.as_deref())
                .await?;

            // The first worker's load results stamp the plan's loaded flags
            if index == 0 {
                if let (Some(plan), Some(_)) = (plan.as_mut(), load_script.as_ref()) {
                    plan.apply_load_results(&load_failures);
                    if !plan.has_mandatory_loaded() {
                        return Err(EngineError::PoolUnavailable(
                            "no mandatory vendor module could be loaded".to_string(),
                        ));
                    }
                }
            }

            workers.push(worker);
        }

        let count = workers.len();
        *self.idle.lock().await = workers;

        info!("Interpreter pool initialized with {} workers", count);
        Ok(InitOutcome::Ready { load_script, plan })
    }

    /// Spawn a worker and run its initialization sequence: restriction
    /// bypass, module loading, smoke test. Returns the worker plus the
    /// names of modules that failed every load strategy.
    async fn spawn_initialized_worker(
        &self,
        load_script: Option<&str>,
    ) -> Result<(ShellWorker, Vec<String>)> {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let (mut worker, load_failures) = ShellWorker::spawn_prepared(
            id,
            self.config.worker.clone(),
            load_script,
            self.config.init_timeout,
        )
        .await?;

        if self.config.smoke_test {
            let kind = self.config.worker.profile.kind;
            let smoke = kind.stdout_marker(SMOKE_MARKER);
            let out = worker.execute_raw(&smoke, self.config.init_timeout).await?;
            if out.died || !out.output.contains(SMOKE_MARKER) {
                return Err(EngineError::PoolUnavailable(format!(
                    "worker #{} failed its smoke test",
                    worker.id
                )));
            }
        }

        Ok((worker, load_failures))
    }

    /// Take an idle worker or spawn a replacement for an abandoned slot
    async fn lease_worker(&self, load_script: Option<&str>) -> Result<ShellWorker> {
        if let Some(worker) = self.idle.lock().await.pop() {
            if worker.is_alive() {
                return Ok(worker);
            }
            debug!("Discarding dead idle worker #{}", worker.id);
        }

        let (worker, _) = self.spawn_initialized_worker(load_script).await?;
        Ok(worker)
    }

    /// Return a worker to the idle set and free its slot
    async fn release_worker(&self, worker: ShellWorker) {
        debug!("Releasing worker #{} back to pool", worker.id);
        self.idle.lock().await.push(worker);
        self.semaphore.add_permits(1);
    }
}
