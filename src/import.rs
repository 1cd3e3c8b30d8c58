// 📥 Line item import - CSV → line items
//
// Columns: Position, Description, Formula, Inputs, Manual_Amount, Total_Output
//
// `Inputs` is a `name=value;name=value` list. Values are numbers or
// `true`/`false`. A row names either a formula or a manual amount.

use anyhow::{anyhow, bail, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use crate::estimate::LineItem;
use crate::formula::Value;

/// One CSV row as written by estimators.
#[derive(Debug, Clone, Deserialize)]
pub struct LineItemRow {
    #[serde(rename = "Position")]
    pub position: u32,

    #[serde(rename = "Description")]
    pub description: String,

    #[serde(rename = "Formula", default)]
    pub formula: Option<String>,

    #[serde(rename = "Inputs", default)]
    pub inputs: Option<String>,

    #[serde(rename = "Manual_Amount", default)]
    pub manual_amount: Option<String>,

    #[serde(rename = "Total_Output", default)]
    pub total_output: Option<String>,
}

impl LineItemRow {
    pub fn into_line_item(self, estimate_id: &str) -> Result<LineItem> {
        let formula = non_empty(self.formula);
        let manual = non_empty(self.manual_amount);

        let mut item = match (formula, manual) {
            (Some(_), Some(_)) => bail!(
                "line {} ({}) has both a formula and a manual amount",
                self.position,
                self.description
            ),
            (Some(key), None) => LineItem::formula(estimate_id, self.position, &self.description, &key),
            (None, Some(amount)) => {
                let amount = Decimal::from_str(&amount)
                    .with_context(|| format!("Invalid manual amount on line {}: {}", self.position, amount))?;
                LineItem::manual(estimate_id, self.position, &self.description, amount)
            }
            (None, None) => bail!(
                "line {} ({}) has neither a formula nor a manual amount",
                self.position,
                self.description
            ),
        };

        if let Some(raw) = non_empty(self.inputs) {
            if !item.is_formula_driven() {
                bail!("line {} has inputs but no formula", self.position);
            }
            item.inputs = parse_inputs(&raw)
                .with_context(|| format!("Invalid inputs on line {}", self.position))?;
        }
        item.total_output = non_empty(self.total_output);

        Ok(item)
    }
}

fn non_empty(field: Option<String>) -> Option<String> {
    field
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Parse `hours=8;rate=500.00;overtime=false`.
pub fn parse_inputs(raw: &str) -> Result<BTreeMap<String, Value>> {
    let mut inputs = BTreeMap::new();
    for pair in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("expected name=value, got '{}'", pair))?;
        let name = name.trim();
        let value = Value::parse_literal(value.trim())
            .ok_or_else(|| anyhow!("'{}' is not a number or boolean", value.trim()))?;
        if inputs.insert(name.to_string(), value).is_some() {
            bail!("input '{}' given twice", name);
        }
    }
    Ok(inputs)
}

/// Read line items for `estimate_id` from any CSV source.
pub fn read_line_items<R: Read>(reader: R, estimate_id: &str) -> Result<Vec<LineItem>> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);

    let mut items = Vec::new();
    for (index, result) in rdr.deserialize().enumerate() {
        let row: LineItemRow =
            result.with_context(|| format!("Failed to deserialize line item row {}", index + 1))?;
        items.push(row.into_line_item(estimate_id)?);
    }
    Ok(items)
}

pub fn load_csv(csv_path: &Path, estimate_id: &str) -> Result<Vec<LineItem>> {
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("Failed to open CSV file: {:?}", csv_path))?;
    read_line_items(file, estimate_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = "\
Position,Description,Formula,Inputs,Manual_Amount,Total_Output
1,Framing labor,LaborCost,hours=8;rate=500,,
2,Finish labor,LaborCost,hours=12; rate=500.00,,output
3,Materials,,,5000,
";

    #[test]
    fn test_read_sample_rows() {
        let items = read_line_items(SAMPLE.as_bytes(), "est-1").unwrap();
        assert_eq!(items.len(), 3);

        assert_eq!(items[0].formula_key.as_deref(), Some("LaborCost"));
        assert_eq!(items[0].inputs.get("hours"), Some(&Value::from(8)));
        assert_eq!(items[1].inputs["rate"].to_string(), "500.00");
        assert_eq!(items[1].total_output.as_deref(), Some("output"));

        assert!(!items[2].is_formula_driven());
        assert_eq!(items[2].manual_amount, Some(Decimal::from(5000)));
        assert!(items.iter().all(|i| i.estimate_id == "est-1"));
    }

    #[test]
    fn test_parse_inputs() {
        let inputs = parse_inputs("hours=8; overtime=true;").unwrap();
        assert_eq!(inputs["overtime"], Value::Bool(true));

        assert!(parse_inputs("hours").is_err());
        assert!(parse_inputs("hours=eight").is_err());
        assert!(parse_inputs("hours=1;hours=2").is_err());
    }

    #[test]
    fn test_rejects_ambiguous_rows() {
        let both = "Position,Description,Formula,Inputs,Manual_Amount,Total_Output\n1,X,LaborCost,,10,\n";
        let err = read_line_items(both.as_bytes(), "est-1").unwrap_err();
        assert!(err.to_string().contains("both a formula and a manual amount"));

        let neither = "Position,Description,Formula,Inputs,Manual_Amount,Total_Output\n1,X,,,,\n";
        assert!(read_line_items(neither.as_bytes(), "est-1").is_err());
    }

    #[test]
    fn test_load_csv_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let items = load_csv(file.path(), "est-9").unwrap();
        assert_eq!(items.len(), 3);
        println!("✅ CSV import test PASSED: {} line items", items.len());
    }
}
