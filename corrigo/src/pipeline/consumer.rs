//! The consumer half of the data stage: the single task that owns the
//! document. Runs the producer, opens the worker gate, drains the output
//! queue, interprets each result into edit queries, and publishes module
//! completion for the dependency barrier.
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, trace, warn};

use super::{producer, InputItem, OutputItem, RunPlan};
use crate::document::{query, Document};
use crate::Parameters;
use crate::Error;

/// Per-module consumer-side counters.
#[derive(Debug, Clone, Default)]
pub(crate) struct ModuleStats {
    pub results: usize,
    pub failures: usize,
    pub applied_queries: usize,
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_consumer(
    mut doc: Document,
    plan: Arc<RunPlan>,
    parameters: Arc<Parameters>,
    metadata: BTreeMap<String, String>,
    in_tx: flume::Sender<InputItem>,
    out_rx: flume::Receiver<OutputItem>,
    gate_tx: watch::Sender<bool>,
    done_tx: watch::Sender<FxHashSet<String>>,
    queue_timeout: Duration,
    threads: usize,
) -> Result<(Document, BTreeMap<String, usize>, BTreeMap<String, ModuleStats>), Error> {
    doc.metadata.extend(metadata);

    // init every module serially before any dispatch
    for module in plan.dispatchable() {
        if let Err(e) = module.module.init(&mut doc) {
            error!(module = module.id, error = %e, "module init failed");
        }
    }

    let expected = producer::produce(&doc, &plan, &parameters, &in_tx, threads);
    drop(in_tx);

    // a module with nothing to do has already completed
    done_tx.send_modify(|done| {
        for (id, count) in &expected {
            if *count == 0 {
                let _ = done.insert(id.clone());
            }
        }
    });

    // release the workers: no output arrives before we are ready to apply it
    let _ = gate_tx.send(true);

    let mut stats: BTreeMap<String, ModuleStats> = expected
        .keys()
        .map(|id| (id.clone(), ModuleStats::default()))
        .collect();
    let mut processed: FxHashMap<String, usize> = FxHashMap::default();

    loop {
        let item = match timeout(queue_timeout, out_rx.recv_async()).await {
            Err(_) => {
                warn!("output queue timed out; stopping consumer");
                break;
            }
            Ok(Err(_)) => {
                debug!("output queue drained; all workers stopped");
                break;
            }
            Ok(Ok(item)) => item,
        };

        match item {
            OutputItem::Result {
                module_id,
                unit_id,
                output,
                payload,
            } => {
                let Some(module) = plan.get(&module_id) else {
                    warn!(module = module_id, "result for unplanned module; dropped");
                    continue;
                };
                match module
                    .module
                    .process_output(output, payload, &unit_id, &parameters)
                {
                    Ok(queries) => {
                        for q in &queries {
                            match query::apply(&mut doc, q) {
                                Ok(()) => {
                                    if let Some(s) = stats.get_mut(&module_id) {
                                        s.applied_queries += 1;
                                    }
                                }
                                Err(e) => {
                                    // one bad query must not halt the batch
                                    error!(
                                        module = module_id,
                                        unit = unit_id,
                                        error = %e,
                                        "edit query rejected"
                                    );
                                }
                            }
                        }
                        if let Some(s) = stats.get_mut(&module_id) {
                            s.results += 1;
                        }
                        // first completion satisfies dependants
                        publish_done(&done_tx, &module_id);
                    }
                    Err(e) => {
                        error!(
                            module = module_id,
                            unit = unit_id,
                            error = %e,
                            "process_output failed; continuing with next record"
                        );
                        if let Some(s) = stats.get_mut(&module_id) {
                            s.failures += 1;
                        }
                    }
                }
                account(&mut processed, &expected, &done_tx, &module_id);
            }
            OutputItem::Empty { module_id, unit_id } => {
                trace!(module = module_id, unit = unit_id, "null output");
                account(&mut processed, &expected, &done_tx, &module_id);
            }
            OutputItem::Failure {
                module_id,
                unit_id,
                error,
            } => {
                warn!(module = module_id, unit = unit_id, error, "unit failed");
                if let Some(s) = stats.get_mut(&module_id) {
                    s.failures += 1;
                }
                account(&mut processed, &expected, &done_tx, &module_id);
            }
        }
    }

    // finish every module serially after all results are applied
    for module in plan.dispatchable() {
        if let Err(e) = module.module.finish(&mut doc) {
            error!(module = module.id, error = %e, "module finish failed");
        }
    }

    Ok((doc, expected, stats))
}

/// Publish one module into the completion set, once.
fn publish_done(done_tx: &watch::Sender<FxHashSet<String>>, module_id: &str) {
    let already = done_tx.borrow().contains(module_id);
    if !already {
        done_tx.send_modify(|done| {
            let _ = done.insert(module_id.to_string());
        });
    }
}

/// Count one accounted payload; when a module's results and failures reach
/// the producer's expected count the module is complete even if every unit
/// failed, so dependants never hang.
fn account(
    processed: &mut FxHashMap<String, usize>,
    expected: &BTreeMap<String, usize>,
    done_tx: &watch::Sender<FxHashSet<String>>,
    module_id: &str,
) {
    let count = processed.entry(module_id.to_string()).or_insert(0);
    *count += 1;
    if let Some(total) = expected.get(module_id) {
        if *count >= *total {
            publish_done(done_tx, module_id);
        }
    }
}
