// Estimating engine - the operations surrounding code calls
//
// Owns the per-line-item serialization discipline: a line item's
// read-evaluate-write sequence never interleaves with another computation of
// the same line item. Unrelated line items run in parallel.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::aggregation::{aggregate, line_contribution, AggregateTotals};
use crate::error::{Error, ErrorKind, Result};
use crate::estimate::{Estimate, LineItem, PricingPolicy};
use crate::formula::{current_sequences, evaluate, FormulaDraft, FormulaRegistry, FormulaVersion, InMemoryRegistry, Value, VersionRef};
use crate::locks::KeyedLocks;
use crate::pipeline;
use crate::provenance::UsageSnapshot;
use crate::staleness::{check_line_staleness, Staleness};
use crate::store::{EstimateStore, Event, MemoryStore, SqliteStore};

// ============================================================================
// RESULT TYPES
// ============================================================================

/// One line item that could not be recomputed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineFailure {
    pub line_item_id: String,
    pub kind: &'static str,
    pub message: String,
    /// Caused by the formula or the item's inputs; an edit is needed before
    /// recomputing helps.
    pub evaluation: bool,
}

/// Outcome of recomputing every formula-driven line item of an estimate.
#[derive(Debug, Clone, Serialize)]
pub struct Recomputation {
    pub estimate_id: String,
    pub snapshots: Vec<UsageSnapshot>,
    pub failures: Vec<LineFailure>,
}

impl Recomputation {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Replay of a stored snapshot against its exact formula version.
#[derive(Debug, Clone, Serialize)]
pub struct Verification {
    pub line_item_id: String,
    pub snapshot_id: String,
    pub formula: VersionRef,
    pub digest_valid: bool,
    pub outputs_reproduced: bool,
    pub replayed_outputs: Option<BTreeMap<String, Value>>,
    /// Kind and message when the replay itself failed
    pub replay_error: Option<String>,
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        self.digest_valid && self.outputs_reproduced
    }
}

/// How one formula key is used across an estimate's latest snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormulaUsage {
    pub formula_key: String,
    pub current_sequence: Option<u32>,
    /// Sequences referenced by latest snapshots
    pub sequences: BTreeSet<u32>,
    pub line_items: usize,
    pub stale: usize,
    /// Assigned but never computed
    pub pending: usize,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct EstimatingEngine {
    registry: Arc<dyn FormulaRegistry>,
    store: Arc<dyn EstimateStore>,
    line_locks: KeyedLocks,
    default_pricing: PricingPolicy,
}

impl EstimatingEngine {
    pub fn new(registry: Arc<dyn FormulaRegistry>, store: Arc<dyn EstimateStore>) -> Self {
        EstimatingEngine {
            registry,
            store,
            line_locks: KeyedLocks::new(),
            default_pricing: PricingPolicy::default(),
        }
    }

    /// Registry and store both in memory.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryRegistry::new()), Arc::new(MemoryStore::new()))
    }

    /// One SQLite database serving as registry and store.
    pub fn with_sqlite(store: Arc<SqliteStore>) -> Self {
        let registry: Arc<dyn FormulaRegistry> = store.clone();
        Self::new(registry, store)
    }

    /// Policy for organizations without a stored one.
    pub fn with_default_pricing(mut self, policy: PricingPolicy) -> Self {
        self.default_pricing = policy;
        self
    }

    pub fn registry(&self) -> &dyn FormulaRegistry {
        self.registry.as_ref()
    }

    pub fn store(&self) -> &dyn EstimateStore {
        self.store.as_ref()
    }

    // ========================================================================
    // FORMULAS
    // ========================================================================

    pub fn publish_formula_version(&self, draft: FormulaDraft) -> Result<Arc<FormulaVersion>> {
        self.registry.publish(draft)
    }

    pub fn formula_history(&self, key: &str) -> Result<Vec<Arc<FormulaVersion>>> {
        self.registry.history(key)
    }

    /// Every published key with its current sequence.
    pub fn formula_catalog(&self) -> Result<BTreeMap<String, u32>> {
        current_sequences(self.registry.as_ref())
    }

    // ========================================================================
    // ESTIMATES + LINE ITEMS
    // ========================================================================

    pub fn set_organization_pricing(&self, organization_id: &str, policy: &PricingPolicy) -> Result<()> {
        self.store.set_organization_pricing(organization_id, policy)
    }

    /// Stored policy of `organization_id`, or the engine default.
    pub fn organization_pricing(&self, organization_id: &str) -> Result<PricingPolicy> {
        Ok(self
            .store
            .organization_pricing(organization_id)?
            .unwrap_or_else(|| self.default_pricing.clone()))
    }

    /// New estimate carrying a copy of its organization's current policy.
    pub fn create_estimate(&self, organization_id: &str, name: &str) -> Result<Estimate> {
        let pricing = self.organization_pricing(organization_id)?;
        let estimate = Estimate::new(organization_id, name, pricing);
        self.store.create_estimate(&estimate)?;
        info!(estimate_id = %estimate.id, organization_id, "created estimate");
        Ok(estimate)
    }

    pub fn estimate(&self, estimate_id: &str) -> Result<Estimate> {
        self.store.estimate(estimate_id)
    }

    /// Store a line item edit. Does not recompute: recomputation is always
    /// an explicit request.
    pub fn save_line_item(&self, item: &LineItem) -> Result<()> {
        self.line_locks.with(&item.id, || self.store.save_line_item(item))
    }

    pub fn line_items(&self, estimate_id: &str) -> Result<Vec<LineItem>> {
        self.store.line_items(estimate_id)
    }

    // ========================================================================
    // COMPUTATION
    // ========================================================================

    /// Evaluate the line item against the current version of its formula and
    /// record a new snapshot.
    pub fn compute_line_item(&self, line_item_id: &str, triggered_by: &str) -> Result<UsageSnapshot> {
        self.line_locks.with(line_item_id, || {
            let item = self.store.line_item(line_item_id)?;
            let result =
                pipeline::compute_line_item(self.registry.as_ref(), self.store.as_ref(), &item, triggered_by);

            match &result {
                Ok(snapshot) => info!(
                    line_item_id,
                    formula_key = snapshot.formula_key(),
                    sequence = snapshot.formula_sequence(),
                    triggered_by,
                    "recorded usage snapshot"
                ),
                Err(Error::NoFormulaAssigned { .. }) => {}
                Err(e) => warn!(line_item_id, error = %e, "line item computation failed"),
            }
            result
        })
    }

    /// Recompute every formula-driven line item of an estimate.
    ///
    /// Per-line failures are collected; storage failures abort.
    pub fn recompute_estimate(&self, estimate_id: &str, triggered_by: &str) -> Result<Recomputation> {
        let items = self.store.line_items(estimate_id)?;

        let mut snapshots = Vec::new();
        let mut failures = Vec::new();
        for item in items.iter().filter(|i| i.is_formula_driven()) {
            match self.compute_line_item(&item.id, triggered_by) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) if e.kind() == ErrorKind::Storage => return Err(e),
                Err(e) => failures.push(LineFailure {
                    line_item_id: item.id.clone(),
                    kind: e.kind().as_str(),
                    message: e.to_string(),
                    evaluation: e.is_evaluation_failure(),
                }),
            }
        }

        info!(
            estimate_id,
            computed = snapshots.len(),
            failed = failures.len(),
            "recomputed estimate"
        );
        Ok(Recomputation {
            estimate_id: estimate_id.to_string(),
            snapshots,
            failures,
        })
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Totals from current line values. Stale snapshots still count until
    /// they are recomputed.
    pub fn aggregate_totals(&self, estimate_id: &str) -> Result<AggregateTotals> {
        let estimate = self.store.estimate(estimate_id)?;
        let items = self.store.line_items(estimate_id)?;

        let mut lines = Vec::with_capacity(items.len());
        for item in &items {
            let latest = match item.formula_key {
                Some(_) => self.store.latest_snapshot(&item.id)?,
                None => None,
            };
            lines.push(line_contribution(item, latest.as_ref())?);
        }

        aggregate(&estimate.pricing, &lines)
    }

    /// Judged against the formula the item is assigned now, which may differ
    /// from the one its latest snapshot used.
    pub fn staleness(&self, line_item_id: &str) -> Result<Staleness> {
        let (item, snapshot) = self.latest_snapshot_of(line_item_id)?;
        let key = item.formula_key.as_deref().unwrap_or_else(|| snapshot.formula_key());
        check_line_staleness(self.registry.as_ref(), key, &snapshot)
    }

    pub fn snapshot_history(&self, line_item_id: &str) -> Result<Vec<UsageSnapshot>> {
        // existence check
        self.store.line_item(line_item_id)?;
        self.store.snapshot_history(line_item_id)
    }

    /// Audit trail of a line item, oldest first.
    pub fn line_item_events(&self, line_item_id: &str) -> Result<Vec<Event>> {
        // existence check
        self.store.line_item(line_item_id)?;
        self.store.events("line_item", line_item_id)
    }

    /// Re-evaluate the latest snapshot's exact version against its frozen
    /// inputs and check the stored digest.
    pub fn verify_snapshot(&self, line_item_id: &str) -> Result<Verification> {
        let (_, snapshot) = self.latest_snapshot_of(line_item_id)?;

        let version = match self
            .registry
            .version(snapshot.formula_key(), snapshot.formula_sequence())
        {
            Ok(version) => version,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::OrphanedFormula {
                    key: snapshot.formula_key().to_string(),
                    sequence: snapshot.formula_sequence(),
                })
            }
            Err(e) => return Err(e),
        };

        let (replayed, replay_error) = match evaluate(&version, snapshot.inputs()) {
            Ok(outputs) => (Some(outputs), None),
            Err(e) => (None, Some(format!("{}: {}", e.kind().as_str(), e))),
        };
        let outputs_reproduced = replayed.as_ref() == Some(snapshot.outputs());
        let digest_valid = snapshot.verify_digest();
        if !(outputs_reproduced && digest_valid) {
            warn!(
                line_item_id,
                snapshot_id = snapshot.id(),
                digest_valid,
                outputs_reproduced,
                replay_error = replay_error.as_deref(),
                "snapshot failed verification"
            );
        }

        Ok(Verification {
            line_item_id: line_item_id.to_string(),
            snapshot_id: snapshot.id().to_string(),
            formula: snapshot.version_ref(),
            digest_valid,
            outputs_reproduced,
            replayed_outputs: replayed,
            replay_error,
        })
    }

    /// Formula usage summary for document generation.
    pub fn formula_usage(&self, estimate_id: &str) -> Result<Vec<FormulaUsage>> {
        let items = self.store.line_items(estimate_id)?;
        let mut usage: BTreeMap<String, FormulaUsage> = BTreeMap::new();

        for item in &items {
            let Some(key) = item.formula_key.as_deref() else {
                continue;
            };
            if !usage.contains_key(key) {
                let current_sequence = match self.registry.current_version(key) {
                    Ok(v) => Some(v.sequence()),
                    Err(e) if e.kind() == ErrorKind::NotFound => None,
                    Err(e) => return Err(e),
                };
                usage.insert(
                    key.to_string(),
                    FormulaUsage {
                        formula_key: key.to_string(),
                        current_sequence,
                        sequences: BTreeSet::new(),
                        line_items: 0,
                        stale: 0,
                        pending: 0,
                    },
                );
            }
            let Some(entry) = usage.get_mut(key) else {
                continue;
            };

            entry.line_items += 1;
            match self.store.latest_snapshot(&item.id)? {
                // latest snapshot may predate a formula change on the item
                Some(snapshot) if snapshot.formula_key() == key => {
                    entry.sequences.insert(snapshot.formula_sequence());
                    if entry.current_sequence != Some(snapshot.formula_sequence()) {
                        entry.stale += 1;
                    }
                }
                Some(_) => entry.stale += 1,
                None => entry.pending += 1,
            }
        }

        Ok(usage.into_values().collect())
    }

    fn latest_snapshot_of(&self, line_item_id: &str) -> Result<(LineItem, UsageSnapshot)> {
        let item = self.store.line_item(line_item_id)?;
        if !item.is_formula_driven() {
            return Err(Error::NoFormulaAssigned {
                line_item_id: line_item_id.to_string(),
            });
        }
        let snapshot = self
            .store
            .latest_snapshot(line_item_id)?
            .ok_or_else(|| Error::SnapshotNotFound {
                line_item_id: line_item_id.to_string(),
            })?;
        Ok((item, snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::InputDecl;
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use std::thread;

    fn labor(body: &str) -> FormulaDraft {
        FormulaDraft::new("LaborCost", body, "estimator@acme")
            .with_input(InputDecl::number("hours"))
            .with_input(InputDecl::number("rate"))
            .with_output("output")
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn engine_with_estimate() -> (EstimatingEngine, Estimate) {
        let engine = EstimatingEngine::in_memory();
        engine
            .set_organization_pricing("acme", &PricingPolicy::new(dec("10"), dec("12")))
            .unwrap();
        engine.publish_formula_version(labor("output = hours * rate")).unwrap();
        let estimate = engine.create_estimate("acme", "Garage").unwrap();
        (engine, estimate)
    }

    fn labor_item(estimate: &Estimate, position: u32, hours: i64, rate: i64) -> LineItem {
        LineItem::formula(&estimate.id, position, "Labor", "LaborCost")
            .with_input("hours", hours)
            .with_input("rate", rate)
    }

    #[test]
    fn test_labor_cost_lifecycle() {
        let (engine, estimate) = engine_with_estimate();
        let item = labor_item(&estimate, 1, 8, 500);
        engine.save_line_item(&item).unwrap();

        let v1 = engine.compute_line_item(&item.id, "alice").unwrap();
        assert_eq!(v1.line_total(), Some(&Value::from(4000)));
        assert!(engine.staleness(&item.id).unwrap().up_to_date);

        engine
            .publish_formula_version(labor("output = hours × rate × 1.12"))
            .unwrap();
        let status = engine.staleness(&item.id).unwrap();
        assert_eq!(status.label(), "Newer version available");
        assert_eq!(status.current_sequence, 2);

        // Stale value still counts until recomputed
        assert_eq!(engine.aggregate_totals(&estimate.id).unwrap().subtotal, dec("4000"));

        let v2 = engine.compute_line_item(&item.id, "alice").unwrap();
        assert_eq!(v2.formula_sequence(), 2);
        assert_eq!(v2.line_total(), Some(&Value::from(4480)));
        assert!(engine.staleness(&item.id).unwrap().up_to_date);
        assert_eq!(engine.snapshot_history(&item.id).unwrap().len(), 2);
    }

    #[test]
    fn test_missing_input_leaves_prior_snapshot() {
        let (engine, estimate) = engine_with_estimate();
        let mut item = labor_item(&estimate, 1, 8, 500);
        engine.save_line_item(&item).unwrap();
        let before = engine.compute_line_item(&item.id, "alice").unwrap();

        item.inputs.remove("rate");
        engine.save_line_item(&item).unwrap();
        let err = engine.compute_line_item(&item.id, "alice").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingInput);
        assert!(err.to_string().contains("rate"));

        let history = engine.snapshot_history(&item.id).unwrap();
        assert_eq!(history, vec![before]);
    }

    #[test]
    fn test_estimate_totals_with_markup_and_vat() {
        let (engine, estimate) = engine_with_estimate();
        let items = [
            labor_item(&estimate, 1, 8, 500),
            labor_item(&estimate, 2, 12, 500),
            LineItem::manual(&estimate.id, 3, "Materials", dec("5000")),
        ];
        for item in &items {
            engine.save_line_item(item).unwrap();
        }

        let run = engine.recompute_estimate(&estimate.id, "alice").unwrap();
        assert_eq!(run.snapshots.len(), 2);
        assert!(run.is_complete());

        let totals = engine.aggregate_totals(&estimate.id).unwrap();
        assert_eq!(totals.subtotal, dec("15000"));
        assert_eq!(totals.markup_amount.to_string(), "1500.00");
        assert_eq!(totals.vat_amount.to_string(), "1980.00");
        assert_eq!(totals.grand_total.to_string(), "18480.00");
    }

    #[test]
    fn test_recompute_collects_line_failures() {
        let (engine, estimate) = engine_with_estimate();
        let good = labor_item(&estimate, 1, 8, 500);
        let bad = LineItem::formula(&estimate.id, 2, "Labor", "LaborCost").with_input("hours", 3);
        let unknown = LineItem::formula(&estimate.id, 3, "Crane", "CraneRental");
        for item in [&good, &bad, &unknown] {
            engine.save_line_item(item).unwrap();
        }

        let run = engine.recompute_estimate(&estimate.id, "alice").unwrap();
        assert_eq!(run.snapshots.len(), 1);
        assert_eq!(run.failures.len(), 2);
        assert_eq!(run.failures[0].kind, "missing_input");
        assert!(run.failures[0].evaluation);
        assert_eq!(run.failures[1].kind, "not_found");
        assert!(!run.failures[1].evaluation);

        let totals = engine.aggregate_totals(&estimate.id).unwrap();
        assert_eq!(totals.subtotal, dec("4000"));
        assert_eq!(totals.pending, vec![bad.id.clone(), unknown.id.clone()]);
    }

    #[test]
    fn test_estimate_keeps_policy_copy() {
        let (engine, estimate) = engine_with_estimate();
        engine
            .set_organization_pricing("acme", &PricingPolicy::new(dec("20"), dec("5")))
            .unwrap();

        assert_eq!(engine.estimate(&estimate.id).unwrap().pricing.markup_percent, dec("10"));
        let newer = engine.create_estimate("acme", "Shed").unwrap();
        assert_eq!(newer.pricing.markup_percent, dec("20"));

        let fallback = engine.create_estimate("unknown-org", "Deck").unwrap();
        assert_eq!(fallback.pricing, PricingPolicy::default());
    }

    #[test]
    fn test_manual_items_have_no_staleness() {
        let (engine, estimate) = engine_with_estimate();
        let manual = LineItem::manual(&estimate.id, 1, "Permit", dec("250"));
        engine.save_line_item(&manual).unwrap();

        assert_eq!(
            engine.compute_line_item(&manual.id, "alice").unwrap_err().kind(),
            ErrorKind::NoFormulaAssigned
        );
        assert_eq!(
            engine.staleness(&manual.id).unwrap_err().kind(),
            ErrorKind::NoFormulaAssigned
        );

        let never_computed = labor_item(&estimate, 2, 1, 1);
        engine.save_line_item(&never_computed).unwrap();
        assert!(matches!(
            engine.staleness(&never_computed.id),
            Err(Error::SnapshotNotFound { .. })
        ));
        assert!(matches!(
            engine.compute_line_item("nope", "alice"),
            Err(Error::LineItemNotFound { .. })
        ));
    }

    #[test]
    fn test_verify_and_usage_summary() {
        let (engine, estimate) = engine_with_estimate();
        let first = labor_item(&estimate, 1, 8, 500);
        let second = labor_item(&estimate, 2, 2, 100);
        let third = labor_item(&estimate, 3, 1, 1);
        for item in [&first, &second, &third] {
            engine.save_line_item(item).unwrap();
        }
        engine.compute_line_item(&first.id, "alice").unwrap();
        engine.publish_formula_version(labor("output = hours * rate * 2")).unwrap();
        engine.compute_line_item(&second.id, "alice").unwrap();

        let verification = engine.verify_snapshot(&first.id).unwrap();
        assert!(verification.is_valid());
        assert_eq!(verification.formula.sequence, 1);

        let usage = engine.formula_usage(&estimate.id).unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].current_sequence, Some(2));
        assert_eq!(usage[0].sequences, BTreeSet::from([1, 2]));
        assert_eq!(usage[0].line_items, 3);
        assert_eq!(usage[0].stale, 1);
        assert_eq!(usage[0].pending, 1);
    }

    #[test]
    fn test_staleness_follows_reassigned_formula() {
        let (engine, estimate) = engine_with_estimate();
        engine
            .publish_formula_version(
                FormulaDraft::new("CraneRental", "output = hours * rate * 3", "estimator@acme")
                    .with_input(InputDecl::number("hours"))
                    .with_input(InputDecl::number("rate"))
                    .with_output("output"),
            )
            .unwrap();
        let mut item = labor_item(&estimate, 1, 8, 500);
        engine.save_line_item(&item).unwrap();
        engine.compute_line_item(&item.id, "alice").unwrap();
        assert!(engine.staleness(&item.id).unwrap().up_to_date);

        item.formula_key = Some("CraneRental".to_string());
        engine.save_line_item(&item).unwrap();

        let status = engine.staleness(&item.id).unwrap();
        assert!(status.is_stale());
        assert_eq!(status.formula_key, "CraneRental");
        assert_eq!(status.snapshot_formula_key, "LaborCost");
        assert_eq!(status.label(), "Formula changed");

        // Usage summary agrees
        let usage = engine.formula_usage(&estimate.id).unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].formula_key, "CraneRental");
        assert_eq!(usage[0].stale, 1);

        let recomputed = engine.compute_line_item(&item.id, "alice").unwrap();
        assert_eq!(recomputed.formula_key(), "CraneRental");
        assert!(engine.staleness(&item.id).unwrap().up_to_date);
        println!("✅ Reassigned formula staleness test PASSED");
    }

    #[test]
    fn test_catalog_and_line_item_events() {
        let (engine, estimate) = engine_with_estimate();
        engine.publish_formula_version(labor("output = hours * rate * 2")).unwrap();
        engine
            .publish_formula_version(FormulaDraft::new("Markup", "pct = 10", "admin").with_output("pct"))
            .unwrap();
        let catalog = engine.formula_catalog().unwrap();
        assert_eq!(catalog, BTreeMap::from([("LaborCost".to_string(), 2), ("Markup".to_string(), 1)]));

        let item = labor_item(&estimate, 1, 8, 500);
        engine.save_line_item(&item).unwrap();
        assert!(engine.line_item_events(&item.id).unwrap().is_empty());

        let first = engine.compute_line_item(&item.id, "alice").unwrap();
        engine.compute_line_item(&item.id, "bob").unwrap();
        let events = engine.line_item_events(&item.id).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "snapshot_recorded");
        assert_eq!(events[0].actor, "alice");
        assert_eq!(events[0].data["snapshot_id"], first.id());
        assert_eq!(events[1].actor, "bob");

        assert!(matches!(
            engine.line_item_events("nope"),
            Err(Error::LineItemNotFound { .. })
        ));
        println!("✅ Catalog and audit trail test PASSED");
    }

    #[test]
    fn test_failed_replay_keeps_its_error() {
        let registry = Arc::new(InMemoryRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let engine = EstimatingEngine::new(registry.clone(), store.clone());
        let version = engine.publish_formula_version(labor("output = hours * rate")).unwrap();
        let estimate = engine.create_estimate("acme", "Garage").unwrap();
        let item = labor_item(&estimate, 1, 8, 500);
        engine.save_line_item(&item).unwrap();

        // Frozen inputs lack `rate`, so the replay cannot run at all
        let mut inputs = BTreeMap::new();
        inputs.insert("hours".to_string(), Value::from(8));
        let outputs = BTreeMap::from([("output".to_string(), Value::from(4000))]);
        let snapshot = UsageSnapshot::record(&version, &item.id, &inputs, outputs, "output", "alice");
        store.append_snapshot(&snapshot).unwrap();

        let verification = engine.verify_snapshot(&item.id).unwrap();
        assert!(verification.digest_valid);
        assert!(!verification.outputs_reproduced);
        assert_eq!(verification.replayed_outputs, None);
        let replay_error = verification.replay_error.unwrap();
        assert!(replay_error.starts_with("missing_input"));
        assert!(replay_error.contains("rate"));

        // A clean replay carries no error
        engine.compute_line_item(&item.id, "alice").unwrap();
        let fresh = engine.verify_snapshot(&item.id).unwrap();
        assert!(fresh.is_valid());
        assert_eq!(fresh.replay_error, None);
        println!("✅ Replay error test PASSED");
    }

    #[test]
    fn test_concurrent_computation_of_one_line_item() {
        let (engine, estimate) = engine_with_estimate();
        let engine = Arc::new(engine);
        let item = labor_item(&estimate, 1, 8, 500);
        engine.save_line_item(&item).unwrap();

        let handles: Vec<_> = (0..6)
            .map(|worker| {
                let engine = Arc::clone(&engine);
                let id = item.id.clone();
                thread::spawn(move || {
                    for round in 0..10 {
                        if worker == 0 && round % 3 == 0 {
                            engine
                                .publish_formula_version(labor(&format!("output = hours * rate + {}", round)))
                                .unwrap();
                        }
                        engine.compute_line_item(&id, &format!("worker-{}", worker)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Every snapshot reproduces from the exact version it names
        let history = engine.snapshot_history(&item.id).unwrap();
        assert_eq!(history.len(), 60);
        for snapshot in &history {
            let version = engine
                .registry()
                .version(snapshot.formula_key(), snapshot.formula_sequence())
                .unwrap();
            assert_eq!(&evaluate(&version, snapshot.inputs()).unwrap(), snapshot.outputs());
        }
    }

    #[test]
    fn test_sqlite_backed_engine() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let engine = EstimatingEngine::with_sqlite(store);
        engine.publish_formula_version(labor("output = hours * rate")).unwrap();
        let estimate = engine.create_estimate("acme", "Garage").unwrap();
        let item = labor_item(&estimate, 1, 8, 500);
        engine.save_line_item(&item).unwrap();

        engine.compute_line_item(&item.id, "alice").unwrap();
        assert!(engine.verify_snapshot(&item.id).unwrap().is_valid());
        assert_eq!(engine.aggregate_totals(&estimate.id).unwrap().subtotal, dec("4000"));
    }
}
