// Formula Registry - append-only version history per formula key
//
// Versions live in an arena of immutable records indexed by (key, sequence).
// Publishing is serialized per key; readers never block publishers of other
// keys.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;

use super::version::{FormulaDraft, FormulaVersion};
use crate::error::{Error, Result};
use crate::locks::KeyedLocks;

/// Read and publish access to formula versions.
///
/// Implementations must never reuse or decrement a sequence number and must
/// keep every published version retrievable.
pub trait FormulaRegistry: Send + Sync {
    /// Highest-sequence version for `key`.
    fn current_version(&self, key: &str) -> Result<Arc<FormulaVersion>>;

    /// Exact `(key, sequence)` lookup.
    fn version(&self, key: &str, sequence: u32) -> Result<Arc<FormulaVersion>>;

    /// Validate `draft` and append it as `previous + 1`.
    fn publish(&self, draft: FormulaDraft) -> Result<Arc<FormulaVersion>>;

    /// Every version of `key`, oldest first.
    fn history(&self, key: &str) -> Result<Vec<Arc<FormulaVersion>>>;

    /// All formula keys with at least one version, sorted.
    fn keys(&self) -> Result<Vec<String>>;
}

// ============================================================================
// IN-MEMORY REGISTRY
// ============================================================================

#[derive(Default)]
pub struct InMemoryRegistry {
    /// ALL versions (append-only, never removed)
    arena: RwLock<Vec<Arc<FormulaVersion>>>,

    /// key -> arena positions in sequence order
    index: RwLock<HashMap<String, Vec<usize>>>,

    publish_locks: KeyedLocks,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of versions across all keys.
    pub fn len(&self) -> usize {
        self.arena.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn positions(&self, key: &str) -> Result<Vec<usize>> {
        self.index
            .read()
            .get(key)
            .filter(|p| !p.is_empty())
            .cloned()
            .ok_or_else(|| Error::FormulaNotFound {
                key: key.to_string(),
            })
    }
}

impl FormulaRegistry for InMemoryRegistry {
    fn current_version(&self, key: &str) -> Result<Arc<FormulaVersion>> {
        let index = self.index.read();
        let position = index
            .get(key)
            .and_then(|p| p.last().copied())
            .ok_or_else(|| Error::FormulaNotFound {
                key: key.to_string(),
            })?;
        Ok(Arc::clone(&self.arena.read()[position]))
    }

    fn version(&self, key: &str, sequence: u32) -> Result<Arc<FormulaVersion>> {
        let not_found = || Error::VersionNotFound {
            key: key.to_string(),
            sequence,
        };
        if sequence == 0 {
            return Err(not_found());
        }

        let index = self.index.read();
        let position = index
            .get(key)
            .and_then(|p| p.get(sequence as usize - 1).copied())
            .ok_or_else(not_found)?;
        Ok(Arc::clone(&self.arena.read()[position]))
    }

    fn publish(&self, draft: FormulaDraft) -> Result<Arc<FormulaVersion>> {
        let key = draft.key.clone();

        self.publish_locks.with(&key, || {
            let previous = self.index.read().get(&key).map_or(0, Vec::len) as u32;
            let version = Arc::new(FormulaVersion::new(draft, previous + 1, Utc::now())?);

            // index before arena, same order as the readers
            let mut index = self.index.write();
            let mut arena = self.arena.write();
            let positions = index.entry(key.clone()).or_default();
            if positions.len() as u32 != previous {
                return Err(Error::PublishConflict {
                    key: key.clone(),
                    expected: previous + 1,
                });
            }
            arena.push(Arc::clone(&version));
            positions.push(arena.len() - 1);

            info!(
                formula_key = %key,
                sequence = version.sequence(),
                author = version.author(),
                "published formula version"
            );
            Ok(version)
        })
    }

    fn history(&self, key: &str) -> Result<Vec<Arc<FormulaVersion>>> {
        let positions = self.positions(key)?;
        let arena = self.arena.read();
        Ok(positions.iter().map(|&p| Arc::clone(&arena[p])).collect())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .index
            .read()
            .iter()
            .filter(|(_, p)| !p.is_empty())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Latest sequence per key, handy for bulk staleness reports.
pub fn current_sequences(registry: &dyn FormulaRegistry) -> Result<BTreeMap<String, u32>> {
    let mut sequences = BTreeMap::new();
    for key in registry.keys()? {
        let current = registry.current_version(&key)?;
        sequences.insert(key, current.sequence());
    }
    Ok(sequences)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::formula::version::InputDecl;
    use std::thread;

    fn labor(body: &str) -> FormulaDraft {
        FormulaDraft::new("LaborCost", body, "estimator@acme")
            .with_input(InputDecl::number("hours"))
            .with_input(InputDecl::number("rate"))
            .with_output("output")
    }

    #[test]
    fn test_publish_allocates_sequences() {
        let registry = InMemoryRegistry::new();

        let v1 = registry.publish(labor("output = hours * rate")).unwrap();
        let v2 = registry.publish(labor("output = hours * rate * 1.12")).unwrap();

        assert_eq!(v1.sequence(), 1);
        assert_eq!(v2.sequence(), 2);
        assert_eq!(registry.current_version("LaborCost").unwrap().sequence(), 2);

        // Old versions stay retrievable and unchanged
        let old = registry.version("LaborCost", 1).unwrap();
        assert_eq!(old.body_source(), "output = hours * rate");
        assert_eq!(registry.history("LaborCost").unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_key_and_sequence() {
        let registry = InMemoryRegistry::new();
        assert_eq!(
            registry.current_version("Nope").unwrap_err().kind(),
            ErrorKind::NotFound
        );

        registry.publish(labor("output = hours * rate")).unwrap();
        assert!(matches!(
            registry.version("LaborCost", 2),
            Err(Error::VersionNotFound { sequence: 2, .. })
        ));
        assert!(registry.version("LaborCost", 0).is_err());
        assert!(registry.history("Nope").is_err());
    }

    #[test]
    fn test_invalid_draft_does_not_consume_sequence() {
        let registry = InMemoryRegistry::new();
        registry.publish(labor("output = hours * rate")).unwrap();

        let err = registry.publish(labor("output = hours *")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFormula);

        let next = registry.publish(labor("output = hours * rate * 2")).unwrap();
        assert_eq!(next.sequence(), 2);
    }

    #[test]
    fn test_concurrent_publishers_leave_no_gaps() {
        let registry = Arc::new(InMemoryRegistry::new());

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    (0..25)
                        .map(|i| {
                            let body = format!("output = hours * rate + {}", worker * 100 + i);
                            registry.publish(labor(&body)).unwrap().sequence()
                        })
                        .collect::<Vec<u32>>()
                })
            })
            .collect();

        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();

        let expected: Vec<u32> = (1..=200).collect();
        assert_eq!(all, expected);

        let history = registry.history("LaborCost").unwrap();
        assert!(history
            .windows(2)
            .all(|w| w[1].sequence() == w[0].sequence() + 1));
    }

    #[test]
    fn test_keys_and_current_sequences() {
        let registry = InMemoryRegistry::new();
        registry.publish(labor("output = hours * rate")).unwrap();
        registry.publish(labor("output = hours * rate * 2")).unwrap();
        registry
            .publish(FormulaDraft::new("Markup", "pct = 10", "admin").with_output("pct"))
            .unwrap();

        assert_eq!(registry.keys().unwrap(), vec!["LaborCost", "Markup"]);
        let current = current_sequences(&registry).unwrap();
        assert_eq!(current["LaborCost"], 2);
        assert_eq!(current["Markup"], 1);
        assert_eq!(registry.len(), 3);
    }
}
