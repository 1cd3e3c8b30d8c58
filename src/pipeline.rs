// Line item computation pipeline
//
//   resolve current version -> evaluate -> build snapshot -> persist
//
// Nothing is written unless every step succeeds, so a failed computation
// leaves the previous snapshot as the line item's latest value.

use tracing::debug;

use crate::error::{Error, Result};
use crate::estimate::LineItem;
use crate::formula::{evaluate, FormulaRegistry, FormulaVersion};
use crate::provenance::UsageSnapshot;
use crate::store::EstimateStore;

/// Evaluate `item` against the current version of its formula and build
/// the snapshot, without persisting it.
pub fn prepare_snapshot(
    registry: &dyn FormulaRegistry,
    item: &LineItem,
    triggered_by: &str,
) -> Result<UsageSnapshot> {
    let key = item
        .formula_key
        .as_deref()
        .ok_or_else(|| Error::NoFormulaAssigned {
            line_item_id: item.id.clone(),
        })?;

    let version = registry.current_version(key)?;
    snapshot_for(&version, item, triggered_by)
}

/// Evaluate `item` against one specific version.
///
/// The snapshot's version reference is taken from the very version that was
/// evaluated.
pub fn snapshot_for(
    version: &FormulaVersion,
    item: &LineItem,
    triggered_by: &str,
) -> Result<UsageSnapshot> {
    let outputs = evaluate(version, &item.inputs)?;

    let total_output = item
        .total_output
        .as_deref()
        .unwrap_or_else(|| version.primary_output());
    match outputs.get(total_output) {
        Some(value) if value.as_number().is_some() => {}
        Some(value) => {
            return Err(Error::InvalidLineTotal {
                line_item_id: item.id.clone(),
                output: total_output.to_string(),
                reason: format!("expected a number, got {}", value.kind()),
            })
        }
        None => {
            return Err(Error::InvalidLineTotal {
                line_item_id: item.id.clone(),
                output: total_output.to_string(),
                reason: format!("not an output of {}", version.reference()),
            })
        }
    }

    debug!(
        line_item_id = %item.id,
        formula = %version.reference(),
        "evaluated line item"
    );

    Ok(UsageSnapshot::record(
        version,
        &item.id,
        &item.inputs,
        outputs,
        total_output,
        triggered_by,
    ))
}

/// Compute `item` and append the snapshot to `store`.
pub fn compute_line_item(
    registry: &dyn FormulaRegistry,
    store: &dyn EstimateStore,
    item: &LineItem,
    triggered_by: &str,
) -> Result<UsageSnapshot> {
    let snapshot = prepare_snapshot(registry, item, triggered_by)?;
    store.append_snapshot(&snapshot)?;
    Ok(snapshot)
}
