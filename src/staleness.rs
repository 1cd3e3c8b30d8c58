// Staleness detector - snapshot sequence vs the registry's current sequence
//
// Pure read. Never mutates the snapshot or the registry and is safe to call
// concurrently.

use serde::Serialize;
use tracing::warn;

use crate::error::{Error, Result};
use crate::formula::FormulaRegistry;
use crate::provenance::UsageSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Staleness {
    pub line_item_id: String,
    /// Key the line item is assigned now
    pub formula_key: String,
    /// Key the snapshot was computed with
    pub snapshot_formula_key: String,
    pub snapshot_sequence: u32,
    pub current_sequence: u32,
    pub up_to_date: bool,
}

impl Staleness {
    pub fn is_stale(&self) -> bool {
        !self.up_to_date
    }

    pub fn formula_changed(&self) -> bool {
        self.formula_key != self.snapshot_formula_key
    }

    /// Display label.
    pub fn label(&self) -> &'static str {
        if self.up_to_date {
            "Up to date"
        } else if self.formula_changed() {
            "Formula changed"
        } else {
            "Newer version available"
        }
    }
}

/// Compare `snapshot` against the current version of its formula key.
///
/// A key the registry no longer resolves, or a snapshot sequence above the
/// current one, is an `OrphanedFormula` integrity problem, never "stale".
pub fn check_staleness(registry: &dyn FormulaRegistry, snapshot: &UsageSnapshot) -> Result<Staleness> {
    let orphaned = || Error::OrphanedFormula {
        key: snapshot.formula_key().to_string(),
        sequence: snapshot.formula_sequence(),
    };

    let current = match registry.current_version(snapshot.formula_key()) {
        Ok(current) => current.sequence(),
        Err(Error::FormulaNotFound { .. }) => {
            warn!(
                line_item_id = snapshot.line_item_id(),
                formula_key = snapshot.formula_key(),
                sequence = snapshot.formula_sequence(),
                "snapshot references an unknown formula key"
            );
            return Err(orphaned());
        }
        Err(e) => return Err(e),
    };

    if snapshot.formula_sequence() > current {
        warn!(
            line_item_id = snapshot.line_item_id(),
            formula_key = snapshot.formula_key(),
            sequence = snapshot.formula_sequence(),
            current_sequence = current,
            "snapshot references a sequence the registry never published"
        );
        return Err(orphaned());
    }

    Ok(Staleness {
        line_item_id: snapshot.line_item_id().to_string(),
        formula_key: snapshot.formula_key().to_string(),
        snapshot_formula_key: snapshot.formula_key().to_string(),
        snapshot_sequence: snapshot.formula_sequence(),
        current_sequence: current,
        up_to_date: snapshot.formula_sequence() == current,
    })
}

/// Staleness of `snapshot` for a line item now assigned `formula_key`.
///
/// A snapshot computed under another key is never up to date, whatever its
/// sequence. `current_sequence` then refers to `formula_key`.
pub fn check_line_staleness(
    registry: &dyn FormulaRegistry,
    formula_key: &str,
    snapshot: &UsageSnapshot,
) -> Result<Staleness> {
    if snapshot.formula_key() == formula_key {
        return check_staleness(registry, snapshot);
    }

    let current = registry.current_version(formula_key)?;
    Ok(Staleness {
        line_item_id: snapshot.line_item_id().to_string(),
        formula_key: formula_key.to_string(),
        snapshot_formula_key: snapshot.formula_key().to_string(),
        snapshot_sequence: snapshot.formula_sequence(),
        current_sequence: current.sequence(),
        up_to_date: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::formula::{evaluate, FormulaDraft, InMemoryRegistry, InputDecl, Value};
    use std::collections::BTreeMap;

    fn labor(body: &str) -> FormulaDraft {
        FormulaDraft::new("LaborCost", body, "estimator@acme")
            .with_input(InputDecl::number("hours"))
            .with_input(InputDecl::number("rate"))
            .with_output("output")
    }

    fn snapshot_of(registry: &InMemoryRegistry, key: &str, sequence: u32) -> UsageSnapshot {
        let version = registry.version(key, sequence).unwrap();
        let mut inputs = BTreeMap::new();
        inputs.insert("hours".to_string(), Value::from(8));
        inputs.insert("rate".to_string(), Value::from(500));
        let outputs = evaluate(&version, &inputs).unwrap();
        UsageSnapshot::record(&version, "li-1", &inputs, outputs, "output", "alice")
    }

    #[test]
    fn test_up_to_date_then_newer_available() {
        let registry = InMemoryRegistry::new();
        registry.publish(labor("output = hours * rate")).unwrap();
        let snapshot = snapshot_of(&registry, "LaborCost", 1);

        let fresh = check_staleness(&registry, &snapshot).unwrap();
        assert!(fresh.up_to_date);
        assert_eq!(fresh.label(), "Up to date");

        registry.publish(labor("output = hours * rate * 1.12")).unwrap();
        let stale = check_staleness(&registry, &snapshot).unwrap();
        assert!(stale.is_stale());
        assert_eq!(stale.snapshot_sequence, 1);
        assert_eq!(stale.current_sequence, 2);
        assert_eq!(stale.label(), "Newer version available");
    }

    #[test]
    fn test_every_older_sequence_is_stale() {
        let registry = InMemoryRegistry::new();
        for i in 0..5 {
            registry
                .publish(labor(&format!("output = hours * rate + {}", i)))
                .unwrap();
        }

        for sequence in 1..=5 {
            let snapshot = snapshot_of(&registry, "LaborCost", sequence);
            let status = check_staleness(&registry, &snapshot).unwrap();
            assert_eq!(status.up_to_date, sequence == 5);
            assert_eq!(status.current_sequence, 5);
        }
    }

    #[test]
    fn test_unknown_key_is_orphaned() {
        let source = InMemoryRegistry::new();
        source.publish(labor("output = hours * rate")).unwrap();
        let snapshot = snapshot_of(&source, "LaborCost", 1);

        let empty = InMemoryRegistry::new();
        let err = check_staleness(&empty, &snapshot).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OrphanedFormula);
    }

    #[test]
    fn test_sequence_beyond_current_is_orphaned() {
        let source = InMemoryRegistry::new();
        source.publish(labor("output = hours * rate")).unwrap();
        source.publish(labor("output = hours * rate * 2")).unwrap();
        let snapshot = snapshot_of(&source, "LaborCost", 2);

        let behind = InMemoryRegistry::new();
        behind.publish(labor("output = hours * rate")).unwrap();
        assert!(matches!(
            check_staleness(&behind, &snapshot),
            Err(Error::OrphanedFormula { sequence: 2, .. })
        ));
    }

    #[test]
    fn test_reassigned_formula_is_never_up_to_date() {
        let registry = InMemoryRegistry::new();
        registry.publish(labor("output = hours * rate")).unwrap();
        registry
            .publish(
                FormulaDraft::new("CraneRental", "output = hours * rate * 3", "estimator@acme")
                    .with_input(InputDecl::number("hours"))
                    .with_input(InputDecl::number("rate"))
                    .with_output("output"),
            )
            .unwrap();
        let snapshot = snapshot_of(&registry, "LaborCost", 1);

        let same = check_line_staleness(&registry, "LaborCost", &snapshot).unwrap();
        assert!(same.up_to_date);
        assert!(!same.formula_changed());

        let moved = check_line_staleness(&registry, "CraneRental", &snapshot).unwrap();
        assert!(moved.is_stale());
        assert!(moved.formula_changed());
        assert_eq!(moved.formula_key, "CraneRental");
        assert_eq!(moved.snapshot_formula_key, "LaborCost");
        assert_eq!(moved.current_sequence, 1);
        assert_eq!(moved.label(), "Formula changed");

        assert!(matches!(
            check_line_staleness(&registry, "Missing", &snapshot),
            Err(Error::FormulaNotFound { .. })
        ));
        println!("✅ Reassigned formula staleness test PASSED");
    }
}
