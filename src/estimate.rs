// 📐 Estimates and line items
//
// An estimate owns an ordered list of line items plus the pricing policy
// (markup, VAT, VAT base, rounding) recorded for it at creation time. Totals
// are never stored; see aggregation.rs.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::formula::Value;

// ============================================================================
// PRICING POLICY
// ============================================================================

/// What VAT is charged on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VatBase {
    /// VAT on the subtotal alone
    Subtotal,

    /// VAT on subtotal + markup amount
    #[default]
    SubtotalPlusMarkup,
}

impl VatBase {
    pub fn as_str(&self) -> &'static str {
        match self {
            VatBase::Subtotal => "subtotal",
            VatBase::SubtotalPlusMarkup => "subtotal_plus_markup",
        }
    }
}

impl fmt::Display for VatBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VatBase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subtotal" => Ok(VatBase::Subtotal),
            "subtotal_plus_markup" | "subtotal+markup" => Ok(VatBase::SubtotalPlusMarkup),
            other => Err(format!("unknown VAT base: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    /// 0.005 -> 0.01 (away from zero)
    #[default]
    HalfUp,

    /// Banker's rounding: 0.005 -> 0.00, 0.015 -> 0.02
    HalfEven,
}

impl RoundingMode {
    fn strategy(&self) -> RoundingStrategy {
        match self {
            RoundingMode::HalfUp => RoundingStrategy::MidpointAwayFromZero,
            RoundingMode::HalfEven => RoundingStrategy::MidpointNearestEven,
        }
    }
}

impl std::str::FromStr for RoundingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "half_up" | "half-up" => Ok(RoundingMode::HalfUp),
            "half_even" | "half-even" | "bankers" => Ok(RoundingMode::HalfEven),
            other => Err(format!("unknown rounding mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundingRule {
    pub places: u32,
    #[serde(default)]
    pub mode: RoundingMode,
}

impl Default for RoundingRule {
    fn default() -> Self {
        RoundingRule {
            places: 2,
            mode: RoundingMode::HalfUp,
        }
    }
}

impl RoundingRule {
    /// Round once and pad to exactly `places` decimals.
    pub fn apply(&self, amount: Decimal) -> Decimal {
        let mut rounded = amount.round_dp_with_strategy(self.places, self.mode.strategy());
        rounded.rescale(self.places);
        rounded
    }
}

/// Markup/VAT configuration applicable at estimate level.
///
/// Percentages are plain numbers (`10` means 10%).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingPolicy {
    pub markup_percent: Decimal,
    pub vat_percent: Decimal,
    #[serde(default)]
    pub vat_base: VatBase,
    #[serde(default)]
    pub rounding: RoundingRule,
}

impl Default for PricingPolicy {
    fn default() -> Self {
        PricingPolicy {
            markup_percent: Decimal::ZERO,
            vat_percent: Decimal::ZERO,
            vat_base: VatBase::default(),
            rounding: RoundingRule::default(),
        }
    }
}

impl PricingPolicy {
    pub fn new(markup_percent: Decimal, vat_percent: Decimal) -> Self {
        PricingPolicy {
            markup_percent,
            vat_percent,
            ..Default::default()
        }
    }

    pub fn with_vat_base(mut self, vat_base: VatBase) -> Self {
        self.vat_base = vat_base;
        self
    }

    pub fn with_rounding(mut self, rounding: RoundingRule) -> Self {
        self.rounding = rounding;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.markup_percent.is_sign_negative() {
            return Err(format!("markup percent must not be negative: {}", self.markup_percent));
        }
        if self.vat_percent.is_sign_negative() {
            return Err(format!("VAT percent must not be negative: {}", self.vat_percent));
        }
        if self.rounding.places > 10 {
            return Err(format!("rounding places must be at most 10: {}", self.rounding.places));
        }
        Ok(())
    }
}

// ============================================================================
// ESTIMATE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub id: String,
    pub organization_id: String,
    pub name: String,

    /// Copy of the organization's policy at creation time
    pub pricing: PricingPolicy,

    pub created_at: DateTime<Utc>,
}

impl Estimate {
    pub fn new(organization_id: &str, name: &str, pricing: PricingPolicy) -> Self {
        Estimate {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id: organization_id.to_string(),
            name: name.to_string(),
            pricing,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// LINE ITEM
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: String,
    pub estimate_id: String,

    /// Declaration order within the estimate (display only)
    pub position: u32,
    pub description: String,

    /// None for manually priced items
    pub formula_key: Option<String>,

    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,

    /// Used only when `formula_key` is None
    pub manual_amount: Option<Decimal>,

    /// Output used as the line total (default: first declared output)
    pub total_output: Option<String>,
}

impl LineItem {
    pub fn formula(estimate_id: &str, position: u32, description: &str, formula_key: &str) -> Self {
        LineItem {
            id: uuid::Uuid::new_v4().to_string(),
            estimate_id: estimate_id.to_string(),
            position,
            description: description.to_string(),
            formula_key: Some(formula_key.to_string()),
            inputs: BTreeMap::new(),
            manual_amount: None,
            total_output: None,
        }
    }

    pub fn manual(estimate_id: &str, position: u32, description: &str, amount: Decimal) -> Self {
        LineItem {
            id: uuid::Uuid::new_v4().to_string(),
            estimate_id: estimate_id.to_string(),
            position,
            description: description.to_string(),
            formula_key: None,
            inputs: BTreeMap::new(),
            manual_amount: Some(amount),
            total_output: None,
        }
    }

    /// Builder: set one input value
    pub fn with_input(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.inputs.insert(name.to_string(), value.into());
        self
    }

    pub fn with_total_output(mut self, output: &str) -> Self {
        self.total_output = Some(output.to_string());
        self
    }

    pub fn is_formula_driven(&self) -> bool {
        self.formula_key.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_rounding_rule_applies_mode() {
        let half_up = RoundingRule::default();
        assert_eq!(half_up.apply(Decimal::from_str("100.0005").unwrap()).to_string(), "100.00");
        assert_eq!(half_up.apply(Decimal::from_str("0.125").unwrap()).to_string(), "0.13");
        assert_eq!(half_up.apply(Decimal::from(1500)).to_string(), "1500.00");

        let half_even = RoundingRule {
            places: 2,
            mode: RoundingMode::HalfEven,
        };
        assert_eq!(half_even.apply(Decimal::from_str("0.125").unwrap()).to_string(), "0.12");
        assert_eq!(half_even.apply(Decimal::from_str("0.135").unwrap()).to_string(), "0.14");
    }

    #[test]
    fn test_policy_defaults_from_json() {
        let policy: PricingPolicy =
            serde_json::from_str(r#"{"markup_percent": "10", "vat_percent": "12"}"#).unwrap();

        assert_eq!(policy.vat_base, VatBase::SubtotalPlusMarkup);
        assert_eq!(policy.rounding, RoundingRule::default());
        assert!(policy.validate().is_ok());

        let negative = PricingPolicy::new(Decimal::from(-1), Decimal::ZERO);
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_line_item_builders() {
        let item = LineItem::formula("est-1", 1, "Framing labor", "LaborCost")
            .with_input("hours", 8)
            .with_input("rate", 500);
        assert!(item.is_formula_driven());
        assert_eq!(item.inputs.len(), 2);

        let manual = LineItem::manual("est-1", 2, "Permit fee", Decimal::from(250));
        assert!(!manual.is_formula_driven());
        assert_eq!(manual.manual_amount, Some(Decimal::from(250)));
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!("subtotal".parse::<VatBase>(), Ok(VatBase::Subtotal));
        assert_eq!("half-even".parse::<RoundingMode>(), Ok(RoundingMode::HalfEven));
        assert!("gross".parse::<VatBase>().is_err());
    }
}
