// Persistence - estimates, line items, snapshots and pricing policies
//
// Snapshots are append-only: there is no update or delete. The latest
// snapshot of a line item is the last one appended for it.

pub mod sqlite;

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::estimate::{Estimate, LineItem, PricingPolicy};
use crate::provenance::UsageSnapshot;

pub use sqlite::{Event, SqliteStore};

pub trait EstimateStore: Send + Sync {
    fn create_estimate(&self, estimate: &Estimate) -> Result<()>;

    fn estimate(&self, id: &str) -> Result<Estimate>;

    /// All estimates, oldest first.
    fn estimates(&self) -> Result<Vec<Estimate>>;

    /// Insert or replace a line item. Its estimate must exist, and a saved
    /// item never changes estimate.
    fn save_line_item(&self, item: &LineItem) -> Result<()>;

    fn line_item(&self, id: &str) -> Result<LineItem>;

    /// Line items of `estimate_id` in declaration order.
    fn line_items(&self, estimate_id: &str) -> Result<Vec<LineItem>>;

    /// Append a snapshot; it becomes the line item's latest.
    fn append_snapshot(&self, snapshot: &UsageSnapshot) -> Result<()>;

    fn latest_snapshot(&self, line_item_id: &str) -> Result<Option<UsageSnapshot>>;

    /// Every snapshot of `line_item_id` in creation order.
    fn snapshot_history(&self, line_item_id: &str) -> Result<Vec<UsageSnapshot>>;

    fn set_organization_pricing(&self, organization_id: &str, policy: &PricingPolicy) -> Result<()>;

    fn organization_pricing(&self, organization_id: &str) -> Result<Option<PricingPolicy>>;

    /// Audit events for one entity, oldest first.
    fn events(&self, entity_type: &str, entity_id: &str) -> Result<Vec<Event>>;
}

// ============================================================================
// MEMORY STORE
// ============================================================================

#[derive(Default)]
struct Tables {
    estimates: Vec<Estimate>,
    line_items: HashMap<String, LineItem>,
    snapshots: HashMap<String, Vec<UsageSnapshot>>,
    pricing: HashMap<String, PricingPolicy>,
    events: Vec<Event>,
}

/// In-process store for tests and one-shot runs.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EstimateStore for MemoryStore {
    fn create_estimate(&self, estimate: &Estimate) -> Result<()> {
        let mut tables = self.tables.write();
        match tables.estimates.iter_mut().find(|e| e.id == estimate.id) {
            Some(existing) => *existing = estimate.clone(),
            None => tables.estimates.push(estimate.clone()),
        }
        Ok(())
    }

    fn estimate(&self, id: &str) -> Result<Estimate> {
        self.tables
            .read()
            .estimates
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| Error::EstimateNotFound { id: id.to_string() })
    }

    fn estimates(&self) -> Result<Vec<Estimate>> {
        Ok(self.tables.read().estimates.clone())
    }

    fn save_line_item(&self, item: &LineItem) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.estimates.iter().any(|e| e.id == item.estimate_id) {
            return Err(Error::EstimateNotFound {
                id: item.estimate_id.clone(),
            });
        }
        if let Some(existing) = tables.line_items.get(&item.id) {
            if existing.estimate_id != item.estimate_id {
                return Err(Error::LineItemMoved {
                    id: item.id.clone(),
                    from: existing.estimate_id.clone(),
                    to: item.estimate_id.clone(),
                });
            }
        }
        tables.line_items.insert(item.id.clone(), item.clone());
        Ok(())
    }

    fn line_item(&self, id: &str) -> Result<LineItem> {
        self.tables
            .read()
            .line_items
            .get(id)
            .cloned()
            .ok_or_else(|| Error::LineItemNotFound { id: id.to_string() })
    }

    fn line_items(&self, estimate_id: &str) -> Result<Vec<LineItem>> {
        let tables = self.tables.read();
        if !tables.estimates.iter().any(|e| e.id == estimate_id) {
            return Err(Error::EstimateNotFound {
                id: estimate_id.to_string(),
            });
        }
        let mut items: Vec<LineItem> = tables
            .line_items
            .values()
            .filter(|i| i.estimate_id == estimate_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        Ok(items)
    }

    fn append_snapshot(&self, snapshot: &UsageSnapshot) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.line_items.contains_key(snapshot.line_item_id()) {
            return Err(Error::LineItemNotFound {
                id: snapshot.line_item_id().to_string(),
            });
        }
        tables
            .snapshots
            .entry(snapshot.line_item_id().to_string())
            .or_default()
            .push(snapshot.clone());
        tables.events.push(Event::snapshot_recorded(snapshot));
        Ok(())
    }

    fn latest_snapshot(&self, line_item_id: &str) -> Result<Option<UsageSnapshot>> {
        Ok(self
            .tables
            .read()
            .snapshots
            .get(line_item_id)
            .and_then(|s| s.last().cloned()))
    }

    fn snapshot_history(&self, line_item_id: &str) -> Result<Vec<UsageSnapshot>> {
        Ok(self
            .tables
            .read()
            .snapshots
            .get(line_item_id)
            .cloned()
            .unwrap_or_default())
    }

    fn set_organization_pricing(&self, organization_id: &str, policy: &PricingPolicy) -> Result<()> {
        let event = Event::pricing_updated(organization_id, policy)?;
        let mut tables = self.tables.write();
        tables.pricing.insert(organization_id.to_string(), policy.clone());
        tables.events.push(event);
        Ok(())
    }

    fn organization_pricing(&self, organization_id: &str) -> Result<Option<PricingPolicy>> {
        Ok(self.tables.read().pricing.get(organization_id).cloned())
    }

    fn events(&self, entity_type: &str, entity_id: &str) -> Result<Vec<Event>> {
        Ok(self
            .tables
            .read()
            .events
            .iter()
            .filter(|e| e.entity_type == entity_type && e.entity_id == entity_id)
            .cloned()
            .collect())
    }
}
