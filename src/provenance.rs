// 🧾 Provenance - immutable record of one computation event
//
// A UsageSnapshot answers "which formula version, fed with which inputs,
// produced this number, when, and on whose request". Snapshots are never
// updated: a recomputation appends a new one and the old one stays for audit.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::formula::{FormulaVersion, Value, VersionRef};

// ============================================================================
// USAGE SNAPSHOT
// ============================================================================

/// Fields are private: once recorded, nothing can change the version
/// reference, inputs or outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    id: String,
    line_item_id: String,

    // Exact version, never just the key
    formula_key: String,
    formula_sequence: u32,

    /// Frozen copy of the declared inputs actually consumed
    inputs: BTreeMap<String, Value>,
    outputs: BTreeMap<String, Value>,

    /// Which output counts as the line total
    line_total_output: String,

    computed_at: DateTime<Utc>,
    triggered_by: String,

    /// SHA-256 over everything above except `id`
    digest: String,
}

/// Column values of a stored snapshot, used when reading it back.
#[derive(Debug, Clone)]
pub(crate) struct SnapshotParts {
    pub id: String,
    pub line_item_id: String,
    pub formula_key: String,
    pub formula_sequence: u32,
    pub inputs: BTreeMap<String, Value>,
    pub outputs: BTreeMap<String, Value>,
    pub line_total_output: String,
    pub computed_at: DateTime<Utc>,
    pub triggered_by: String,
    pub digest: String,
}

impl UsageSnapshot {
    /// Record a fresh computation of `version`.
    ///
    /// Only the inputs `version` declares are frozen; anything else the line
    /// item carried was not consumed and is left out.
    pub fn record(
        version: &FormulaVersion,
        line_item_id: &str,
        supplied: &BTreeMap<String, Value>,
        outputs: BTreeMap<String, Value>,
        line_total_output: &str,
        triggered_by: &str,
    ) -> Self {
        let inputs = version
            .input_names()
            .filter_map(|name| {
                supplied
                    .get(name)
                    .map(|value| (name.to_string(), value.clone()))
            })
            .collect();

        let mut snapshot = UsageSnapshot {
            id: uuid::Uuid::new_v4().to_string(),
            line_item_id: line_item_id.to_string(),
            formula_key: version.key().to_string(),
            formula_sequence: version.sequence(),
            inputs,
            outputs,
            line_total_output: line_total_output.to_string(),
            // storage keeps microseconds
            computed_at: Utc::now().trunc_subsecs(6),
            triggered_by: triggered_by.to_string(),
            digest: String::new(),
        };
        snapshot.digest = snapshot.compute_digest();
        snapshot
    }

    pub(crate) fn restore(parts: SnapshotParts) -> Self {
        UsageSnapshot {
            id: parts.id,
            line_item_id: parts.line_item_id,
            formula_key: parts.formula_key,
            formula_sequence: parts.formula_sequence,
            inputs: parts.inputs,
            outputs: parts.outputs,
            line_total_output: parts.line_total_output,
            computed_at: parts.computed_at,
            triggered_by: parts.triggered_by,
            digest: parts.digest,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn line_item_id(&self) -> &str {
        &self.line_item_id
    }

    pub fn formula_key(&self) -> &str {
        &self.formula_key
    }

    pub fn formula_sequence(&self) -> u32 {
        self.formula_sequence
    }

    pub fn version_ref(&self) -> VersionRef {
        VersionRef {
            key: self.formula_key.clone(),
            sequence: self.formula_sequence,
        }
    }

    pub fn inputs(&self) -> &BTreeMap<String, Value> {
        &self.inputs
    }

    pub fn outputs(&self) -> &BTreeMap<String, Value> {
        &self.outputs
    }

    pub fn line_total_output(&self) -> &str {
        &self.line_total_output
    }

    /// Value of the designated line-total output.
    pub fn line_total(&self) -> Option<&Value> {
        self.outputs.get(&self.line_total_output)
    }

    pub fn computed_at(&self) -> DateTime<Utc> {
        self.computed_at
    }

    pub fn triggered_by(&self) -> &str {
        &self.triggered_by
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// True when the stored digest still matches the recorded content.
    pub fn verify_digest(&self) -> bool {
        self.compute_digest() == self.digest
    }

    /// Canonical content hash. Maps are ordered and decimals keep their
    /// scale, so equal content always hashes equally.
    fn compute_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1e}",
            self.line_item_id,
            self.formula_key,
            self.formula_sequence,
            self.line_total_output,
            self.computed_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            self.triggered_by,
        ));
        for (section, values) in [("in", &self.inputs), ("out", &self.outputs)] {
            for (name, value) in values {
                hasher.update(format!(
                    "{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1e}",
                    section,
                    name,
                    value.kind(),
                    value
                ));
            }
        }
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::{evaluate, FormulaDraft, InputDecl};

    fn labor_v1() -> FormulaVersion {
        let draft = FormulaDraft::new("LaborCost", "output = hours * rate", "estimator@acme")
            .with_input(InputDecl::number("hours"))
            .with_input(InputDecl::number("rate"))
            .with_output("output");
        FormulaVersion::new(draft, 1, Utc::now()).unwrap()
    }

    fn supplied() -> BTreeMap<String, Value> {
        let mut inputs = BTreeMap::new();
        inputs.insert("hours".to_string(), Value::from(8));
        inputs.insert("rate".to_string(), Value::from(500));
        inputs.insert("crew_notes_id".to_string(), Value::from(17));
        inputs
    }

    fn record() -> UsageSnapshot {
        let version = labor_v1();
        let inputs = supplied();
        let outputs = evaluate(&version, &inputs).unwrap();
        UsageSnapshot::record(&version, "li-1", &inputs, outputs, "output", "alice")
    }

    #[test]
    fn test_record_freezes_declared_inputs_only() {
        let snapshot = record();

        assert_eq!(snapshot.formula_key(), "LaborCost");
        assert_eq!(snapshot.formula_sequence(), 1);
        assert_eq!(snapshot.inputs().len(), 2);
        assert!(!snapshot.inputs().contains_key("crew_notes_id"));
        assert_eq!(snapshot.line_total(), Some(&Value::from(4000)));
        assert_eq!(snapshot.triggered_by(), "alice");
        assert_eq!(snapshot.digest().len(), 64);
        assert!(snapshot.verify_digest());
    }

    #[test]
    fn test_frozen_inputs_independent_of_later_edits() {
        let version = labor_v1();
        let mut inputs = supplied();
        let outputs = evaluate(&version, &inputs).unwrap();
        let snapshot = UsageSnapshot::record(&version, "li-1", &inputs, outputs, "output", "alice");

        inputs.insert("hours".to_string(), Value::from(12));

        assert_eq!(snapshot.inputs()["hours"], Value::from(8));
    }

    #[test]
    fn test_tampering_breaks_digest() {
        let original = record();
        let mut parts = SnapshotParts {
            id: original.id().to_string(),
            line_item_id: original.line_item_id().to_string(),
            formula_key: original.formula_key().to_string(),
            formula_sequence: original.formula_sequence(),
            inputs: original.inputs().clone(),
            outputs: original.outputs().clone(),
            line_total_output: original.line_total_output().to_string(),
            computed_at: original.computed_at(),
            triggered_by: original.triggered_by().to_string(),
            digest: original.digest().to_string(),
        };

        let restored = UsageSnapshot::restore(parts.clone());
        assert_eq!(restored, original);
        assert!(restored.verify_digest());

        parts.outputs.insert("output".to_string(), Value::from(4001));
        assert!(!UsageSnapshot::restore(parts).verify_digest());
    }

    #[test]
    fn test_each_record_is_a_new_snapshot() {
        let first = record();
        let second = record();
        assert_ne!(first.id(), second.id());
        assert_eq!(first.outputs(), second.outputs());
    }
}
