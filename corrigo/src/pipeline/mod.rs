//! The pipeline engine: controller, producer, worker pool, and consumer.
//!
//! Data flow:
//! `document -> producer -> input queue -> workers (local or remote) ->
//! output queue -> consumer -> document`.
//!
//! The controller owns module instances and channels; workers share nothing
//! but the queues and the completion watch channel; the consumer is the only
//! writer of the document.
use flume::{bounded, unbounded};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, Once};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Duration;
use tracing::{debug, error, info, trace};

use crate::config::{Config, ParsedConfig};
use crate::document::Document;
use crate::filters::FilterKind;
use crate::modules::register_modules;
use crate::registry::{ServerRegistry, ServerStatus};
use crate::{Error, Module, Parameters, Unit};

mod consumer;
mod producer;
mod worker;

pub(crate) use consumer::ModuleStats;

use once_cell::sync::Lazy;

/// Capacity of the bounded output queue.
const CHANNEL_CAPACITY: usize = 10_000;

static REGISTER: Once = Once::new();
/// Stores any error that occurred during module registration
static REGISTER_ERROR: Lazy<Mutex<Option<String>>> = Lazy::new(|| Mutex::new(None));

/// One unit of work on the input queue: a serialized payload bound to a
/// `(module, unit)` pair, produced once and consumed once.
#[derive(Debug, Clone)]
pub(crate) struct UnitPayload {
    pub module_id: String,
    pub unit_id: String,
    pub payload: Value,
}

/// Input-queue items: payloads plus one end-of-stream sentinel per worker.
#[derive(Debug, Clone)]
pub(crate) enum InputItem {
    Unit(UnitPayload),
    Sentinel,
}

/// Output-queue items. Every dequeued payload yields exactly one of these,
/// so the consumer can account for module completion.
#[derive(Debug, Clone)]
pub(crate) enum OutputItem {
    /// A non-null module output together with its original payload
    Result {
        module_id: String,
        unit_id: String,
        output: Value,
        payload: Value,
    },
    /// The module ran and returned null; bookkeeping only
    Empty { module_id: String, unit_id: String },
    /// The dispatch failed; logged, never re-enqueued
    Failure {
        module_id: String,
        unit_id: String,
        error: String,
    },
}

/// How one module's `run` is reached this run.
#[derive(Debug, Clone)]
pub(crate) enum Dispatch {
    Local,
    Remote(Vec<(String, u16)>),
}

/// One module resolved for this run: instance, dispatch path, and the spec
/// fields the producer and workers consult.
pub(crate) struct PlannedModule {
    pub id: String,
    pub submodule: bool,
    pub depends: Vec<String>,
    pub filter: Option<FilterKind>,
    pub dispatch: Dispatch,
    pub module: Arc<dyn Module>,
}

impl PlannedModule {
    /// Combined unit acceptance: the configured named filter and the
    /// module's own predicate.
    pub fn accepts(&self, unit: &Unit) -> bool {
        self.filter.map_or(true, |f| f.accepts(unit)) && self.module.unit_filter(unit)
    }
}

/// The per-run resolution of the enabled module set.
pub(crate) struct RunPlan {
    pub modules: Vec<Arc<PlannedModule>>,
    index: FxHashMap<String, usize>,
}

impl RunPlan {
    fn new(modules: Vec<Arc<PlannedModule>>) -> Self {
        let index = modules
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id.clone(), i))
            .collect();
        RunPlan { modules, index }
    }

    pub fn get(&self, id: &str) -> Option<&Arc<PlannedModule>> {
        self.index.get(id).map(|&i| &self.modules[i])
    }

    /// Modules the pipeline dispatches: everything except submodules.
    pub fn dispatchable(&self) -> impl Iterator<Item = &Arc<PlannedModule>> {
        self.modules.iter().filter(|m| !m.submodule)
    }
}

/// Per-module outcome of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleReport {
    /// Payloads the producer enqueued for this module
    pub expected: usize,
    /// Results successfully interpreted into the document
    pub results: usize,
    /// Dispatch or interpretation failures
    pub failures: usize,
    /// Edit queries applied
    pub applied_queries: usize,
    /// Wall-clock time workers spent inside this module
    pub duration: Duration,
}

/// End-of-run statistics, per module.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Per-module outcomes, keyed by module id
    pub modules: BTreeMap<String, ModuleReport>,
}

impl RunReport {
    /// Log one summary line per module.
    pub fn log_summary(&self) {
        for (id, m) in &self.modules {
            info!(
                module = id,
                expected = m.expected,
                results = m.results,
                failures = m.failures,
                applied_queries = m.applied_queries,
                duration_ms = m.duration.as_millis() as u64,
                "module finished"
            );
        }
    }
}

/// Represents a single correction pipeline, configured and ready to run.
pub struct Runtime {
    config: ParsedConfig,
    parameters: Parameters,
    metadata: BTreeMap<String, String>,
    module_subset: Option<Vec<String>>,
    force_local: bool,
    poll_state: Mutex<Option<(Instant, BTreeMap<String, Vec<ServerStatus>>)>>,
}

fn ensure_registered() -> Result<(), Error> {
    REGISTER.call_once(|| {
        if let Err(e) = register_modules() {
            if let Ok(mut err) = REGISTER_ERROR.lock() {
                *err = Some(format!("{e}"));
            }
        }
    });
    if let Ok(err_lock) = REGISTER_ERROR.lock() {
        if let Some(ref e) = *err_lock {
            return Err(Error::ExecutionError(format!(
                "Module registration failed: {e}"
            )));
        }
    }
    trace!("modules registered");
    Ok(())
}

impl Runtime {
    /// Build a runtime from raw configuration text: registers the built-in
    /// modules, validates the configuration (including cycle detection,
    /// before any I/O), and returns the runtime to run.
    ///
    /// ```
    /// use corrigo::Runtime;
    ///
    /// let conf_str = r#"id: demo
    /// modules:
    ///   - id: dummy
    ///     module: dummy"#;
    /// # tokio_test::block_on(async {
    /// let rt = Runtime::from_config(conf_str).await.unwrap();
    /// # })
    /// ```
    pub async fn from_config(config: &str) -> Result<Self, Error> {
        ensure_registered()?;
        let conf = Config::from_str(config)?;
        Self::from_parsed(conf.validate()?)
    }

    /// Build a runtime from a configuration file, resolving `inherit`
    /// chains.
    pub async fn from_config_file(path: &Path) -> Result<Self, Error> {
        ensure_registered()?;
        let conf = Config::load(path)?;
        Self::from_parsed(conf.validate()?)
    }

    fn from_parsed(config: ParsedConfig) -> Result<Self, Error> {
        debug!(pipeline = config.id, "runtime is ready");
        Ok(Runtime {
            config,
            parameters: Parameters::new(),
            metadata: BTreeMap::new(),
            module_subset: None,
            force_local: false,
            poll_state: Mutex::new(None),
        })
    }

    /// The validated configuration.
    pub fn config(&self) -> &ParsedConfig {
        &self.config
    }

    /// The server registry rooted at this pipeline's `root`.
    pub fn registry(&self) -> ServerRegistry {
        ServerRegistry::new(self.config.root.clone())
    }

    /// Free-form `key=value` parameters handed to every module.
    pub fn set_parameters(&mut self, parameters: Parameters) {
        self.parameters = parameters;
    }

    /// Metadata merged over the document before the run.
    pub fn set_metadata(&mut self, metadata: BTreeMap<String, String>) {
        self.metadata = metadata;
    }

    /// Restrict the run to the named modules.
    pub fn set_module_subset(&mut self, subset: Option<Vec<String>>) {
        self.module_subset = subset;
    }

    /// Force every module local for the whole run, regardless of probe
    /// results. Sticky: a later probe never flips it back.
    pub fn set_force_local(&mut self, force_local: bool) {
        self.force_local = force_local;
    }

    /// Probe the registry for live servers, rate-limited by
    /// `minpollinterval`; the cached result is reused within the interval.
    pub async fn find_servers(&self) -> Result<BTreeMap<String, Vec<ServerStatus>>, Error> {
        {
            let cached = self
                .poll_state
                .lock()
                .map_err(|_| Error::UnableToSecureLock)?;
            if let Some((at, found)) = cached.as_ref() {
                if at.elapsed() < self.config.minpollinterval {
                    trace!("reusing cached server probe");
                    return Ok(found.clone());
                }
            }
        }
        let found = self.registry().find_servers().await?;
        let mut cached = self
            .poll_state
            .lock()
            .map_err(|_| Error::UnableToSecureLock)?;
        *cached = Some((Instant::now(), found.clone()));
        Ok(found)
    }

    async fn build_plan(&self) -> Result<RunPlan, Error> {
        let any_servers = self
            .config
            .modules
            .iter()
            .any(|m| m.enabled && !m.servers.is_empty());
        let mut found = if self.force_local || !any_servers {
            BTreeMap::new()
        } else {
            self.find_servers().await?
        };

        let mut modules = Vec::new();
        for pm in &self.config.modules {
            if !pm.enabled {
                continue;
            }
            if let Some(subset) = &self.module_subset {
                if !subset.contains(&pm.id) {
                    continue;
                }
            }
            let dispatch = if self.force_local {
                Dispatch::Local
            } else {
                match found.remove(&pm.id) {
                    Some(list) if !list.is_empty() => Dispatch::Remote(
                        list.into_iter().map(|s| (s.host, s.port)).collect(),
                    ),
                    _ => Dispatch::Local,
                }
            };

            let mut module = pm.instantiate().await?;
            match &dispatch {
                Dispatch::Local => module.load().await?,
                Dispatch::Remote(servers) => {
                    debug!(module = pm.id, servers = servers.len(), "remote dispatch");
                    module.client_load().await?
                }
            }

            modules.push(Arc::new(PlannedModule {
                id: pm.id.clone(),
                submodule: pm.submodule,
                depends: pm.depends.clone(),
                filter: pm.filter,
                dispatch,
                module: Arc::from(module),
            }));
        }
        Ok(RunPlan::new(modules))
    }

    /// Run the pipeline over an in-memory document, returning the corrected
    /// document and the per-module report.
    pub async fn run_document(&self, doc: Document) -> Result<(Document, RunReport), Error> {
        let plan = Arc::new(self.build_plan().await?);
        let parameters = Arc::new(self.parameters.clone());
        let threads = self.config.threads.max(1);
        let timeout = self.config.timeout;

        let (in_tx, in_rx) = unbounded::<InputItem>();
        let (out_tx, out_rx) = bounded::<OutputItem>(CHANNEL_CAPACITY);
        let (gate_tx, gate_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(FxHashSet::default());

        let mut workers: JoinSet<Result<FxHashMap<String, Duration>, Error>> = JoinSet::new();
        for n in 0..threads {
            let _ = workers.spawn(worker::run_worker(
                n,
                Arc::clone(&plan),
                in_rx.clone(),
                out_tx.clone(),
                gate_rx.clone(),
                done_rx.clone(),
                timeout,
            ));
        }
        drop(in_rx);
        drop(out_tx);

        let consumer = tokio::spawn(consumer::run_consumer(
            doc,
            Arc::clone(&plan),
            Arc::clone(&parameters),
            self.metadata.clone(),
            in_tx,
            out_rx,
            gate_tx,
            done_tx,
            timeout,
            threads,
        ));

        let run_id = uuid::Uuid::new_v4();
        info!(pipeline = self.config.id, run_id = %run_id, threads, "pipeline started");

        let mut timings: FxHashMap<String, Duration> = FxHashMap::default();
        while let Some(res) = workers.join_next().await {
            match res {
                Ok(Ok(worker_timings)) => {
                    for (id, d) in worker_timings {
                        *timings.entry(id).or_default() += d;
                    }
                }
                Ok(Err(e)) => error!(error = %e, "worker failed"),
                Err(e) => error!(error = %e, "worker panicked or was cancelled"),
            }
        }

        let (doc, expected, stats) = consumer
            .await
            .map_err(|e| Error::ExecutionError(format!("{e}")))??;

        let mut report = RunReport::default();
        for m in plan.dispatchable() {
            let s = stats.get(&m.id).cloned().unwrap_or_default();
            let _ = report.modules.insert(
                m.id.clone(),
                ModuleReport {
                    expected: expected.get(&m.id).copied().unwrap_or(0),
                    results: s.results,
                    failures: s.failures,
                    applied_queries: s.applied_queries,
                    duration: timings.get(&m.id).copied().unwrap_or_default(),
                },
            );
        }
        report.log_summary();
        info!(pipeline = self.config.id, run_id = %run_id, "pipeline finished");
        Ok((doc, report))
    }

    /// Load a document from disk (tokenizing plain text first when needed)
    /// and run the pipeline over it.
    pub async fn run_file(&self, input: &Path) -> Result<(Document, RunReport), Error> {
        let doc = Document::load(input)?;
        self.run_document(doc).await
    }

    /// Serve one configured module on `host:port` forever: the entry point
    /// behind the `startserver` command. Loads the module's heavy models
    /// first.
    pub async fn serve_module(&self, module_id: &str, host: &str, port: u16) -> Result<(), Error> {
        let pm = self
            .config
            .modules
            .iter()
            .find(|m| m.id == module_id)
            .ok_or_else(|| Error::ModuleNotRegistered(module_id.into()))?;
        let mut module = pm.instantiate().await?;
        module.load().await?;
        let addr = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| Error::ExecutionError(format!("cannot resolve {host}:{port}")))?;
        crate::net::serve(Arc::from(module), addr).await
    }

    /// Default output path for an input that was not already structured.
    pub fn default_output_path(input: &Path) -> PathBuf {
        let is_json = input
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "json")
            .unwrap_or(false);
        if is_json {
            input.to_path_buf()
        } else {
            input.with_extension("json")
        }
    }
}
