// ⚖️ Estimate Aggregator - subtotal, markup, VAT, grand total
//
//   subtotal     = Σ line values                      (exact, never rounded)
//   markup       = round(subtotal × markup% / 100)    (rounded once)
//   vat          = round(base × vat% / 100)           (rounded once)
//   grand_total  = subtotal + markup + vat
//
// `base` is the recorded VatBase: subtotal, or subtotal + markup.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::estimate::{LineItem, PricingPolicy, VatBase};
use crate::formula::VersionRef;
use crate::provenance::UsageSnapshot;

// ============================================================================
// LINE CONTRIBUTIONS
// ============================================================================

/// Where a line's current value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueSource {
    /// Line total of the latest snapshot
    Snapshot { formula: VersionRef, snapshot_id: String },

    /// Manually entered amount
    Manual,

    /// Formula-driven but never computed; counts as zero
    Pending,

    /// Neither formula nor manual amount; counts as zero
    Unpriced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineContribution {
    pub line_item_id: String,
    pub position: u32,
    pub description: String,
    pub amount: Decimal,
    pub source: ValueSource,
}

/// Current value of `item` given its latest snapshot.
///
/// A formula-driven item always takes its value from the snapshot, even
/// if a manual amount is also present.
pub fn line_contribution(item: &LineItem, latest: Option<&UsageSnapshot>) -> Result<LineContribution> {
    let (amount, source) = match (&item.formula_key, latest) {
        (Some(_), Some(snapshot)) => {
            let total = snapshot
                .line_total()
                .and_then(|v| v.as_number())
                .ok_or_else(|| Error::InvalidLineTotal {
                    line_item_id: item.id.clone(),
                    output: snapshot.line_total_output().to_string(),
                    reason: "snapshot has no numeric value for it".to_string(),
                })?;
            (
                total,
                ValueSource::Snapshot {
                    formula: snapshot.version_ref(),
                    snapshot_id: snapshot.id().to_string(),
                },
            )
        }
        (Some(_), None) => (Decimal::ZERO, ValueSource::Pending),
        (None, _) => match item.manual_amount {
            Some(amount) => (amount, ValueSource::Manual),
            None => (Decimal::ZERO, ValueSource::Unpriced),
        },
    };

    Ok(LineContribution {
        line_item_id: item.id.clone(),
        position: item.position,
        description: item.description.clone(),
        amount,
        source,
    })
}

// ============================================================================
// AGGREGATE TOTALS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateTotals {
    pub subtotal: Decimal,
    pub markup_amount: Decimal,
    pub vat_amount: Decimal,
    pub grand_total: Decimal,

    /// Policy the totals were computed with
    pub policy: PricingPolicy,

    /// Per-line values in declaration order
    pub lines: Vec<LineContribution>,

    /// Formula-driven line items without a snapshot yet
    pub pending: Vec<String>,
}

impl AggregateTotals {
    pub fn summary(&self) -> String {
        format!(
            "subtotal {}, markup {} ({}%), VAT {} ({}% on {}), grand total {}",
            self.subtotal,
            self.markup_amount,
            self.policy.markup_percent,
            self.vat_amount,
            self.policy.vat_percent,
            self.policy.vat_base,
            self.grand_total
        )
    }
}

/// Fold line values into estimate totals. Pure; the sum is independent of
/// line order.
pub fn aggregate(policy: &PricingPolicy, lines: &[LineContribution]) -> Result<AggregateTotals> {
    let overflow = |what: &str| Error::ArithmeticOverflow {
        binding: what.to_string(),
    };

    let subtotal = lines
        .iter()
        .try_fold(Decimal::ZERO, |acc, line| acc.checked_add(line.amount))
        .ok_or_else(|| overflow("subtotal"))?;

    let markup_amount = percent_of(subtotal, policy.markup_percent)
        .map(|m| policy.rounding.apply(m))
        .ok_or_else(|| overflow("markup"))?;

    let vat_base = match policy.vat_base {
        VatBase::Subtotal => Some(subtotal),
        VatBase::SubtotalPlusMarkup => subtotal.checked_add(markup_amount),
    };
    let vat_amount = vat_base
        .and_then(|base| percent_of(base, policy.vat_percent))
        .map(|v| policy.rounding.apply(v))
        .ok_or_else(|| overflow("vat"))?;

    let grand_total = subtotal
        .checked_add(markup_amount)
        .and_then(|t| t.checked_add(vat_amount))
        .ok_or_else(|| overflow("grand_total"))?;

    let mut ordered = lines.to_vec();
    ordered.sort_by_key(|l| l.position);
    let pending = ordered
        .iter()
        .filter(|l| l.source == ValueSource::Pending)
        .map(|l| l.line_item_id.clone())
        .collect();

    Ok(AggregateTotals {
        subtotal,
        markup_amount,
        vat_amount,
        grand_total,
        policy: policy.clone(),
        lines: ordered,
        pending,
    })
}

fn percent_of(amount: Decimal, percent: Decimal) -> Option<Decimal> {
    amount
        .checked_mul(percent)
        .and_then(|p| p.checked_div(Decimal::ONE_HUNDRED))
}
