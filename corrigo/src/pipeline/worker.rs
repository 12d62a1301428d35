//! One worker of the pool: consume payloads, dispatch the module locally or
//! against its servers, and emit exactly one output item per payload.
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, trace, warn};

use super::{Dispatch, InputItem, OutputItem, PlannedModule, RunPlan};
use crate::net::ModuleClient;
use crate::Error;

/// Pause between failover attempts, so a sustained outage does not spin.
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Attempts per configured server before a unit is abandoned.
const RETRIES_PER_SERVER: usize = 10;

pub(crate) async fn run_worker(
    worker_id: usize,
    plan: Arc<RunPlan>,
    in_rx: flume::Receiver<InputItem>,
    out_tx: flume::Sender<OutputItem>,
    mut gate_rx: watch::Receiver<bool>,
    done_rx: watch::Receiver<FxHashSet<String>>,
    queue_timeout: Duration,
) -> Result<FxHashMap<String, Duration>, Error> {
    let mut timings: FxHashMap<String, Duration> = FxHashMap::default();

    // no output may arrive before the consumer is ready to apply it
    if gate_rx.wait_for(|open| *open).await.is_err() {
        debug!(worker_id, "gate closed before opening; stopping");
        return Ok(timings);
    }
    trace!(worker_id, "worker started");

    let mut clients: FxHashMap<(String, u16), ModuleClient> = FxHashMap::default();
    let mut sequences: FxHashMap<String, usize> = FxHashMap::default();

    loop {
        let item = match timeout(queue_timeout, in_rx.recv_async()).await {
            Err(_) => {
                warn!(worker_id, "input queue timed out; stopping");
                break;
            }
            Ok(Err(_)) => break,
            Ok(Ok(item)) => item,
        };
        let unit = match item {
            InputItem::Sentinel => {
                trace!(worker_id, "sentinel received; stopping");
                break;
            }
            InputItem::Unit(unit) => unit,
        };

        let Some(module) = plan.get(&unit.module_id) else {
            warn!(module = unit.module_id, "payload for unplanned module; dropped");
            continue;
        };
        if module.submodule {
            trace!(module = module.id, "submodule payload skipped");
            continue;
        }

        if !prepare(module, &done_rx, queue_timeout).await {
            warn!(
                worker_id,
                module = module.id,
                unit = unit.unit_id,
                "dependency barrier timed out"
            );
            send(
                &out_tx,
                OutputItem::Failure {
                    module_id: unit.module_id.clone(),
                    unit_id: unit.unit_id.clone(),
                    error: "dependency barrier timed out".into(),
                },
            )
            .await?;
            continue;
        }

        let started = Instant::now();
        let outcome = match &module.dispatch {
            Dispatch::Local => {
                trace!(worker_id, module = module.id, unit = unit.unit_id, "local dispatch");
                module.module.run(unit.payload.clone()).await
            }
            Dispatch::Remote(servers) => {
                run_remote(
                    &mut clients,
                    &mut sequences,
                    module,
                    servers,
                    &unit.unit_id,
                    &unit.payload,
                )
                .await
            }
        };
        *timings.entry(unit.module_id.clone()).or_default() += started.elapsed();

        let item = match outcome {
            Ok(Some(output)) => OutputItem::Result {
                module_id: unit.module_id,
                unit_id: unit.unit_id,
                output,
                payload: unit.payload,
            },
            Ok(None) => OutputItem::Empty {
                module_id: unit.module_id,
                unit_id: unit.unit_id,
            },
            Err(e) => {
                warn!(
                    worker_id,
                    module = unit.module_id,
                    unit = unit.unit_id,
                    error = %e,
                    "dispatch failed"
                );
                OutputItem::Failure {
                    module_id: unit.module_id,
                    unit_id: unit.unit_id,
                    error: format!("{e}"),
                }
            }
        };
        send(&out_tx, item).await?;
    }

    trace!(worker_id, "worker stopped");
    Ok(timings)
}

async fn send(out_tx: &flume::Sender<OutputItem>, item: OutputItem) -> Result<(), Error> {
    out_tx
        .send_async(item)
        .await
        .map_err(|e| Error::UnableToSendToChannel(format!("{e}")))
}

/// Dependency barrier: wait until every id in `depends` is present in the
/// completion set published by the consumer. Bounded by the queue timeout.
async fn prepare(
    module: &PlannedModule,
    done_rx: &watch::Receiver<FxHashSet<String>>,
    queue_timeout: Duration,
) -> bool {
    if module.depends.is_empty() {
        return true;
    }
    let mut rx = done_rx.clone();
    let result = timeout(
        queue_timeout,
        rx.wait_for(|done| module.depends.iter().all(|d| done.contains(d.as_str()))),
    )
    .await;
    matches!(result, Ok(Ok(_)))
}

/// Remote dispatch with failover: rotate over the module's server list from
/// a per-module sequence counter (seeded randomly so workers spread load),
/// reusing one connection per server address. Any transport error drops the
/// cached client and advances to the next server. At most
/// `10 x len(servers)` attempts; after that the unit is abandoned.
async fn run_remote(
    clients: &mut FxHashMap<(String, u16), ModuleClient>,
    sequences: &mut FxHashMap<String, usize>,
    module: &PlannedModule,
    servers: &[(String, u16)],
    unit_id: &str,
    payload: &Value,
) -> Result<Option<Value>, Error> {
    if servers.is_empty() {
        return Err(Error::ServerUnreachable {
            module: module.id.clone(),
            unit: unit_id.into(),
        });
    }
    let seq = sequences
        .entry(module.id.clone())
        .or_insert_with(|| fastrand::usize(..servers.len()));

    for attempt in 0..servers.len() * RETRIES_PER_SERVER {
        let (host, port) = &servers[*seq % servers.len()];
        *seq = seq.wrapping_add(1);
        let key = (host.clone(), *port);

        if !clients.contains_key(&key) {
            match ModuleClient::connect(host, *port).await {
                Ok(client) => {
                    let _ = clients.insert(key.clone(), client);
                }
                Err(e) => {
                    debug!(
                        module = module.id,
                        host, port, attempt, error = %e,
                        "connect failed; trying next server"
                    );
                    sleep(RETRY_BACKOFF).await;
                    continue;
                }
            }
        }
        let Some(client) = clients.get_mut(&key) else {
            continue;
        };
        debug!(module = module.id, unit = unit_id, host, port, "remote dispatch");
        match client.call(payload).await {
            Ok(output) => return Ok(output),
            Err(e) => {
                debug!(
                    module = module.id,
                    host, port, attempt, error = %e,
                    "call failed; dropping client and trying next server"
                );
                let _ = clients.remove(&key);
                sleep(RETRY_BACKOFF).await;
            }
        }
    }

    Err(Error::ServerUnreachable {
        module: module.id.clone(),
        unit: unit_id.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::net::serve;
    use crate::{EditQuery, Module, Parameters, Unit, UnitType};
    use async_trait::async_trait;
    use serde_json::json;
    use std::net::SocketAddr;

    struct Echo;

    #[async_trait]
    impl Module for Echo {
        fn unit_type(&self) -> UnitType {
            UnitType::Word
        }
        fn init(&self, _doc: &mut Document) -> Result<(), Error> {
            Ok(())
        }
        fn prepare_input(
            &self,
            unit: &Unit,
            _parameters: &Parameters,
        ) -> Result<Option<Value>, Error> {
            Ok(Some(json!(unit.text())))
        }
        async fn run(&self, payload: Value) -> Result<Option<Value>, Error> {
            Ok(Some(payload))
        }
        fn process_output(
            &self,
            _output: Value,
            _payload: Value,
            _unit_id: &str,
            _parameters: &Parameters,
        ) -> Result<Vec<EditQuery>, Error> {
            Ok(Vec::new())
        }
    }

    fn planned(servers: Vec<(String, u16)>) -> PlannedModule {
        PlannedModule {
            id: "echo".into(),
            submodule: false,
            depends: vec![],
            filter: None,
            dispatch: Dispatch::Remote(servers.clone()),
            module: Arc::new(Echo),
        }
    }

    fn free_addr() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    #[tokio::test]
    async fn failover_skips_refusing_server() {
        let dead = free_addr();
        let live = free_addr();
        let _ = tokio::spawn(serve(Arc::new(Echo), live));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let servers = vec![
            ("127.0.0.1".to_string(), dead.port()),
            ("127.0.0.1".to_string(), live.port()),
        ];
        let module = planned(servers.clone());
        let mut clients = FxHashMap::default();
        let mut sequences = FxHashMap::default();
        // pin the rotation to start at the dead server
        let _ = sequences.insert("echo".to_string(), 0);

        for i in 0..10 {
            let out = run_remote(
                &mut clients,
                &mut sequences,
                &module,
                &servers,
                "u",
                &json!(format!("word{i}")),
            )
            .await
            .unwrap();
            assert_eq!(out, Some(json!(format!("word{i}"))));
        }
        // only the live server has a cached connection
        assert!(clients.contains_key(&("127.0.0.1".to_string(), live.port())));
        assert!(!clients.contains_key(&("127.0.0.1".to_string(), dead.port())));
    }

    #[tokio::test]
    async fn all_servers_down_abandons_unit() {
        let dead1 = free_addr();
        let dead2 = free_addr();
        let servers = vec![
            ("127.0.0.1".to_string(), dead1.port()),
            ("127.0.0.1".to_string(), dead2.port()),
        ];
        let module = planned(servers.clone());
        let mut clients = FxHashMap::default();
        let mut sequences = FxHashMap::default();

        let result = run_remote(
            &mut clients,
            &mut sequences,
            &module,
            &servers,
            "u",
            &json!("word"),
        )
        .await;
        assert!(matches!(result, Err(Error::ServerUnreachable { .. })));
    }

    #[tokio::test]
    async fn rotation_spreads_calls_between_servers() {
        let a = free_addr();
        let b = free_addr();
        let _ = tokio::spawn(serve(Arc::new(Echo), a));
        let _ = tokio::spawn(serve(Arc::new(Echo), b));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let servers = vec![
            ("127.0.0.1".to_string(), a.port()),
            ("127.0.0.1".to_string(), b.port()),
        ];
        let module = planned(servers.clone());
        let mut clients = FxHashMap::default();
        let mut sequences = FxHashMap::default();

        for i in 0..10 {
            let out = run_remote(
                &mut clients,
                &mut sequences,
                &module,
                &servers,
                "u",
                &json!(i),
            )
            .await
            .unwrap();
            assert_eq!(out, Some(json!(i)));
        }
        // alternation touches both servers
        assert_eq!(clients.len(), 2);
    }

    #[tokio::test]
    async fn barrier_passes_once_dependencies_complete() {
        let module = PlannedModule {
            id: "b".into(),
            submodule: false,
            depends: vec!["a".into()],
            filter: None,
            dispatch: Dispatch::Local,
            module: Arc::new(Echo),
        };
        let (done_tx, done_rx) = watch::channel(FxHashSet::default());

        let waiter = {
            let done_rx = done_rx.clone();
            let module_depends = module.depends.clone();
            tokio::spawn(async move {
                let pm = PlannedModule {
                    id: "b".into(),
                    submodule: false,
                    depends: module_depends,
                    filter: None,
                    dispatch: Dispatch::Local,
                    module: Arc::new(Echo),
                };
                prepare(&pm, &done_rx, Duration::from_secs(5)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        done_tx.send_modify(|d| {
            let _ = d.insert("a".to_string());
        });
        assert!(waiter.await.unwrap());

        // and a missing dependency times out
        let (_tx2, done_rx2) = watch::channel(FxHashSet::default());
        assert!(!prepare(&module, &done_rx2, Duration::from_millis(100)).await);
    }
}
