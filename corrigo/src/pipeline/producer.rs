//! The producer half of the data stage: walk the document once and fan
//! matching units out to the input queue.
use std::collections::BTreeMap;
use std::collections::HashSet;
use tracing::{debug, error, trace};

use super::{InputItem, RunPlan, UnitPayload};
use crate::document::Document;
use crate::{Parameters, Unit, UnitType};

/// Enqueue one payload per (module, matching unit) pair, in document order
/// per unit type, followed by exactly `threads` end-of-stream sentinels.
/// Returns the number of payloads enqueued per module; the consumer uses it
/// for completion accounting.
pub(crate) fn produce(
    doc: &Document,
    plan: &RunPlan,
    parameters: &Parameters,
    in_tx: &flume::Sender<InputItem>,
    threads: usize,
) -> BTreeMap<String, usize> {
    let mut expected: BTreeMap<String, usize> = plan
        .dispatchable()
        .map(|m| (m.id.clone(), 0))
        .collect();

    let unit_types: HashSet<UnitType> = plan
        .dispatchable()
        .map(|m| m.module.unit_type())
        .collect();

    if unit_types.contains(&UnitType::Document) {
        let unit = Unit::Document(doc);
        for module in plan.dispatchable() {
            if module.module.unit_type() == UnitType::Document {
                enqueue(module, &unit, parameters, in_tx, &mut expected);
            }
        }
    }

    for unit_type in [UnitType::Paragraph, UnitType::Sentence, UnitType::Word] {
        if !unit_types.contains(&unit_type) {
            continue;
        }
        for unit in doc.units_of_type(unit_type) {
            for module in plan.dispatchable() {
                if module.module.unit_type() == unit_type {
                    enqueue(module, &unit, parameters, in_tx, &mut expected);
                }
            }
        }
    }

    for _ in 0..threads {
        if in_tx.send(InputItem::Sentinel).is_err() {
            error!("input queue disconnected before sentinels were sent");
            break;
        }
    }
    debug!(
        payloads = expected.values().sum::<usize>(),
        sentinels = threads,
        "producer finished"
    );
    expected
}

fn enqueue(
    module: &super::PlannedModule,
    unit: &Unit,
    parameters: &Parameters,
    in_tx: &flume::Sender<InputItem>,
    expected: &mut BTreeMap<String, usize>,
) {
    if !module.accepts(unit) {
        return;
    }
    match module.module.prepare_input(unit, parameters) {
        Ok(Some(payload)) => {
            trace!(module = module.id, unit = unit.id(), "payload enqueued");
            let item = InputItem::Unit(UnitPayload {
                module_id: module.id.clone(),
                unit_id: unit.id().to_string(),
                payload,
            });
            if in_tx.send(item).is_err() {
                error!(module = module.id, "input queue disconnected");
                return;
            }
            if let Some(count) = expected.get_mut(&module.id) {
                *count += 1;
            }
        }
        Ok(None) => {}
        Err(e) => {
            error!(
                module = module.id,
                unit = unit.id(),
                error = %e,
                "prepare_input failed; unit dropped"
            );
        }
    }
}
