// Formula versions - immutable, sequence-numbered revisions of one formula key
//
// A version is built once (at publish, or when restored from storage) and only
// exposes read accessors afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::expr::FormulaBody;
use super::parser::{is_identifier, parse_body};
use super::value::ValueKind;
use crate::error::{Error, Result};

/// A required input variable and the kind of value it expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDecl {
    pub name: String,
    pub kind: ValueKind,
}

impl InputDecl {
    pub fn number(name: impl Into<String>) -> Self {
        InputDecl {
            name: name.into(),
            kind: ValueKind::Number,
        }
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        InputDecl {
            name: name.into(),
            kind: ValueKind::Boolean,
        }
    }
}

/// Everything an author supplies when publishing a new version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormulaDraft {
    pub key: String,
    pub body: String,
    pub inputs: Vec<InputDecl>,
    pub outputs: Vec<String>,
    pub author: String,
}

impl FormulaDraft {
    pub fn new(key: impl Into<String>, body: impl Into<String>, author: impl Into<String>) -> Self {
        FormulaDraft {
            key: key.into(),
            body: body.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            author: author.into(),
        }
    }

    /// Builder: declare a required input
    pub fn with_input(mut self, input: InputDecl) -> Self {
        self.inputs.push(input);
        self
    }

    /// Builder: declare a produced output
    pub fn with_output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    /// Check the declarations and parse the body without allocating a sequence.
    pub fn validate(&self) -> Result<FormulaBody> {
        let invalid = |reason: String| Error::InvalidFormula {
            key: self.key.clone(),
            reason,
        };

        if self.key.trim().is_empty() || self.key.trim() != self.key {
            return Err(invalid("formula key must be non-empty without surrounding whitespace".to_string()));
        }
        if self.author.trim().is_empty() {
            return Err(invalid("author is required".to_string()));
        }
        if self.outputs.is_empty() {
            return Err(invalid("at least one output must be declared".to_string()));
        }

        let mut declared = BTreeSet::new();
        for name in self
            .inputs
            .iter()
            .map(|i| i.name.as_str())
            .chain(self.outputs.iter().map(String::as_str))
        {
            if !is_identifier(name) {
                return Err(invalid(format!("'{}' is not a valid variable name", name)));
            }
            if !declared.insert(name) {
                return Err(invalid(format!("'{}' is declared more than once", name)));
            }
        }

        let body = parse_body(&self.body).map_err(|e| invalid(e.to_string()))?;

        let mut bound = BTreeSet::new();
        for binding in &body.bindings {
            if self.inputs.iter().any(|i| i.name == binding.name) {
                return Err(invalid(format!("binding '{}' shadows an input", binding.name)));
            }
            if !bound.insert(binding.name.as_str()) {
                return Err(invalid(format!("'{}' is bound more than once", binding.name)));
            }
        }

        Ok(body)
    }
}

/// `(key, sequence)` - the exact identity of one formula version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionRef {
    pub key: String,
    pub sequence: u32,
}

impl fmt::Display for VersionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.key, self.sequence)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FormulaVersion {
    key: String,
    sequence: u32,
    body_source: String,
    #[serde(skip)]
    body: FormulaBody,
    inputs: Vec<InputDecl>,
    outputs: Vec<String>,
    author: String,
    created_at: DateTime<Utc>,
}

impl FormulaVersion {
    /// Build a version from a draft. Used by registries when publishing and
    /// when restoring previously published rows.
    pub fn new(draft: FormulaDraft, sequence: u32, created_at: DateTime<Utc>) -> Result<Self> {
        if sequence == 0 {
            return Err(Error::InvalidFormula {
                key: draft.key,
                reason: "sequence numbers start at 1".to_string(),
            });
        }

        let body = draft.validate()?;

        Ok(FormulaVersion {
            key: draft.key,
            sequence,
            body_source: draft.body,
            body,
            inputs: draft.inputs,
            outputs: draft.outputs,
            author: draft.author,
            created_at,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn reference(&self) -> VersionRef {
        VersionRef {
            key: self.key.clone(),
            sequence: self.sequence,
        }
    }

    /// Source text of the body, exactly as published.
    pub fn body_source(&self) -> &str {
        &self.body_source
    }

    pub fn body(&self) -> &FormulaBody {
        &self.body
    }

    pub fn inputs(&self) -> &[InputDecl] {
        &self.inputs
    }

    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|i| i.name.as_str())
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The output used as a line total unless a line item names another one.
    pub fn primary_output(&self) -> &str {
        // validate() rejects drafts without outputs
        self.outputs.first().map(String::as_str).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labor_draft() -> FormulaDraft {
        FormulaDraft::new("LaborCost", "output = hours * rate", "estimator@acme")
            .with_input(InputDecl::number("hours"))
            .with_input(InputDecl::number("rate"))
            .with_output("output")
    }

    #[test]
    fn test_version_from_draft() {
        let version = FormulaVersion::new(labor_draft(), 1, Utc::now()).unwrap();

        assert_eq!(version.key(), "LaborCost");
        assert_eq!(version.sequence(), 1);
        assert_eq!(version.reference().to_string(), "LaborCost v1");
        assert_eq!(version.input_names().collect::<Vec<_>>(), vec!["hours", "rate"]);
        assert_eq!(version.primary_output(), "output");
        assert_eq!(version.body().bindings.len(), 1);
    }

    #[test]
    fn test_sequence_zero_rejected() {
        assert!(FormulaVersion::new(labor_draft(), 0, Utc::now()).is_err());
    }

    #[test]
    fn test_draft_validation() {
        let no_outputs = FormulaDraft::new("X", "a = 1", "me");
        assert!(no_outputs.validate().is_err());

        let bad_name = labor_draft().with_input(InputDecl::number("unit cost"));
        assert!(bad_name.validate().is_err());

        let duplicate = labor_draft().with_input(InputDecl::number("hours"));
        assert!(duplicate.validate().is_err());

        let mut shadowing = labor_draft();
        shadowing.body = "hours = 1\noutput = hours * rate".to_string();
        assert!(shadowing.validate().is_err());

        let mut rebound = labor_draft();
        rebound.body = "output = 1\noutput = 2".to_string();
        assert!(rebound.validate().is_err());

        let mut syntax = labor_draft();
        syntax.body = "output = hours *".to_string();
        let err = syntax.validate().unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_oversized_body_is_invalid_formula() {
        let mut deep = labor_draft();
        deep.body = format!("output = {}hours{} * rate", "(".repeat(3000), ")".repeat(3000));
        let err = deep.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidFormula { .. }));

        let mut chain = labor_draft();
        chain.body = format!("output = {}hours * rate", "1 + ".repeat(20_000));
        assert!(matches!(
            FormulaVersion::new(chain, 1, Utc::now()),
            Err(Error::InvalidFormula { .. })
        ));

        let mut tall = labor_draft();
        tall.body = format!("output = {}hours * rate", "1 + ".repeat(5_000));
        let err = tall.validate().unwrap_err();
        assert!(err.to_string().contains("too complex"));
        println!("✅ Oversized body rejection test PASSED");
    }

    #[test]
    fn test_incomplete_body_is_publishable() {
        // Missing outputs surface at evaluation time
        let draft = labor_draft().with_output("overhead");
        assert!(draft.validate().is_ok());
    }
}
