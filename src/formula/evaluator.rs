// Expression evaluator - pure function of (FormulaVersion, inputs)
//
// No clocks, no randomness, no I/O. Numbers are rust_decimal values and every
// arithmetic step is checked, so the same version and inputs always produce the
// same outputs to the last digit.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::{BTreeMap, HashMap};

use super::expr::{BinaryOp, Expr, FormulaBody, Function, UnaryOp};
use super::value::{Value, ValueKind};
use super::version::FormulaVersion;
use crate::error::{Error, Result};

/// Largest scale `round(x, places)` accepts.
const MAX_ROUND_PLACES: u32 = 28;

/// Evaluate `version` against `inputs`.
///
/// Only declared inputs are read; undeclared keys are ignored. Returns exactly
/// the declared outputs.
pub fn evaluate(
    version: &FormulaVersion,
    inputs: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>> {
    let missing: Vec<String> = version
        .inputs()
        .iter()
        .filter(|decl| !inputs.contains_key(&decl.name))
        .map(|decl| decl.name.clone())
        .collect();
    if !missing.is_empty() {
        return Err(Error::MissingInput { names: missing });
    }

    let mut env: BTreeMap<String, Value> = BTreeMap::new();
    for decl in version.inputs() {
        // presence checked above
        if let Some(value) = inputs.get(&decl.name) {
            if value.kind() != decl.kind {
                return Err(Error::InputTypeMismatch {
                    name: decl.name.clone(),
                    expected: decl.kind,
                    found: value.kind(),
                });
            }
            env.insert(decl.name.clone(), value.clone());
        }
    }

    let body = version.body();
    if let Some(cycle) = find_cycle(body) {
        return Err(Error::CyclicReference { cycle });
    }
    check_references(body, &env)?;

    for binding in &body.bindings {
        let scope = Scope {
            binding: &binding.name,
            env: &env,
        };
        let value = scope.eval(&binding.expr)?;
        env.insert(binding.name.clone(), value);
    }

    let mut outputs = BTreeMap::new();
    let mut incomplete = Vec::new();
    for name in version.outputs() {
        match env.remove(name) {
            Some(value) => {
                outputs.insert(name.clone(), value);
            }
            None => incomplete.push(name.clone()),
        }
    }
    if !incomplete.is_empty() {
        return Err(Error::IncompleteOutput {
            missing: incomplete,
        });
    }

    Ok(outputs)
}

// ============================================================================
// STATIC CHECKS
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// First dependency cycle among bindings, as a path that starts and ends on
/// the same name (`[x, x]` for a self reference).
fn find_cycle(body: &FormulaBody) -> Option<Vec<String>> {
    let deps: HashMap<&str, Vec<String>> = body
        .bindings
        .iter()
        .map(|b| {
            let refs = b
                .expr
                .references()
                .into_iter()
                .filter(|name| body.position(name).is_some())
                .collect();
            (b.name.as_str(), refs)
        })
        .collect();

    let mut marks: HashMap<String, Mark> = HashMap::new();
    for binding in &body.bindings {
        let mut path = Vec::new();
        if let Some(cycle) = visit(&binding.name, &deps, &mut marks, &mut path) {
            return Some(cycle);
        }
    }
    None
}

fn visit(
    name: &str,
    deps: &HashMap<&str, Vec<String>>,
    marks: &mut HashMap<String, Mark>,
    path: &mut Vec<String>,
) -> Option<Vec<String>> {
    match marks.get(name) {
        Some(Mark::Done) => return None,
        Some(Mark::Visiting) => {
            let start = path.iter().position(|n| n == name)?;
            let mut cycle = path[start..].to_vec();
            cycle.push(name.to_string());
            return Some(cycle);
        }
        None => {}
    }

    marks.insert(name.to_string(), Mark::Visiting);
    path.push(name.to_string());
    if let Some(next) = deps.get(name) {
        for dep in next {
            if let Some(cycle) = visit(dep, deps, marks, path) {
                return Some(cycle);
            }
        }
    }
    path.pop();
    marks.insert(name.to_string(), Mark::Done);
    None
}

/// Bindings may read inputs and earlier bindings only. Checked over every
/// branch so the outcome never depends on which branch the inputs select.
fn check_references(body: &FormulaBody, inputs: &BTreeMap<String, Value>) -> Result<()> {
    for (index, binding) in body.bindings.iter().enumerate() {
        for name in binding.expr.references() {
            if inputs.contains_key(&name) {
                continue;
            }
            match body.position(&name) {
                Some(pos) if pos < index => {}
                Some(_) => {
                    return Err(Error::ForwardReference {
                        binding: binding.name.clone(),
                        name,
                    })
                }
                None => {
                    return Err(Error::UnknownVariable {
                        binding: binding.name.clone(),
                        name,
                    })
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// TREE WALK
// ============================================================================

struct Scope<'a> {
    binding: &'a str,
    env: &'a BTreeMap<String, Value>,
}

impl<'a> Scope<'a> {
    fn eval(&self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Number { value } => Ok(Value::Number(*value)),
            Expr::Bool { value } => Ok(Value::Bool(*value)),
            Expr::Var { name } => self
                .env
                .get(name)
                .cloned()
                .ok_or_else(|| Error::UnknownVariable {
                    binding: self.binding.to_string(),
                    name: name.clone(),
                }),
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Neg => Ok(Value::Number(-self.number(value, "-")?)),
                    UnaryOp::Not => Ok(Value::Bool(!self.boolean(value, "not")?)),
                }
            }
            Expr::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs),
            Expr::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let condition = self.eval(condition)?;
                if self.boolean(condition, "if")? {
                    self.eval(then_branch)
                } else {
                    self.eval(else_branch)
                }
            }
            Expr::Call { function, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    let value = self.eval(arg)?;
                    values.push(self.number(value, function.name())?);
                }
                self.call(*function, &values).map(Value::Number)
            }
        }
    }

    fn binary(&self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<Value> {
        match op {
            BinaryOp::And | BinaryOp::Or => {
                let left = self.eval(lhs)?;
                let left = self.boolean(left, op.symbol())?;
                // false and _ / true or _
                if left == (op == BinaryOp::Or) {
                    return Ok(Value::Bool(left));
                }
                let right = self.eval(rhs)?;
                Ok(Value::Bool(self.boolean(right, op.symbol())?))
            }
            BinaryOp::Eq | BinaryOp::Ne => {
                let left = self.eval(lhs)?;
                let right = self.eval(rhs)?;
                if left.kind() != right.kind() {
                    return Err(self.mismatch(op.symbol(), left.kind(), right.kind()));
                }
                Ok(Value::Bool((left == right) == (op == BinaryOp::Eq)))
            }
            BinaryOp::Add => self.arithmetic(op, lhs, rhs, Decimal::checked_add),
            BinaryOp::Sub => self.arithmetic(op, lhs, rhs, Decimal::checked_sub),
            BinaryOp::Mul => self.arithmetic(op, lhs, rhs, Decimal::checked_mul),
            BinaryOp::Div => {
                let (a, b) = self.operands(op, lhs, rhs)?;
                if b.is_zero() {
                    return Err(Error::DivisionByZero {
                        binding: self.binding.to_string(),
                    });
                }
                self.checked(a.checked_div(b)).map(Value::Number)
            }
            BinaryOp::Lt => self.compare(op, lhs, rhs, |a, b| a < b),
            BinaryOp::Le => self.compare(op, lhs, rhs, |a, b| a <= b),
            BinaryOp::Gt => self.compare(op, lhs, rhs, |a, b| a > b),
            BinaryOp::Ge => self.compare(op, lhs, rhs, |a, b| a >= b),
        }
    }

    fn operands(&self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<(Decimal, Decimal)> {
        let left = self.eval(lhs)?;
        let right = self.eval(rhs)?;
        Ok((self.number(left, op.symbol())?, self.number(right, op.symbol())?))
    }

    fn arithmetic(
        &self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        apply: fn(Decimal, Decimal) -> Option<Decimal>,
    ) -> Result<Value> {
        let (a, b) = self.operands(op, lhs, rhs)?;
        self.checked(apply(a, b)).map(Value::Number)
    }

    fn compare(
        &self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        test: fn(&Decimal, &Decimal) -> bool,
    ) -> Result<Value> {
        let (a, b) = self.operands(op, lhs, rhs)?;
        Ok(Value::Bool(test(&a, &b)))
    }

    fn call(&self, function: Function, args: &[Decimal]) -> Result<Decimal> {
        let invalid = |reason: &str| Error::InvalidArgument {
            binding: self.binding.to_string(),
            function: function.name(),
            reason: reason.to_string(),
        };

        let first = *args
            .first()
            .ok_or_else(|| invalid("expected at least one argument"))?;

        match function {
            Function::Min => Ok(args.iter().copied().fold(first, Decimal::min)),
            Function::Max => Ok(args.iter().copied().fold(first, Decimal::max)),
            Function::Abs => Ok(first.abs()),
            Function::Ceil => Ok(first.ceil()),
            Function::Floor => Ok(first.floor()),
            Function::Round => {
                let places = match args.get(1) {
                    None => 0,
                    Some(p) if p.fract().is_zero() && !p.is_sign_negative() => p
                        .to_u32()
                        .filter(|p| *p <= MAX_ROUND_PLACES)
                        .ok_or_else(|| invalid("places must be at most 28"))?,
                    Some(_) => return Err(invalid("places must be a non-negative integer")),
                };
                Ok(first.round_dp_with_strategy(places, RoundingStrategy::MidpointAwayFromZero))
            }
        }
    }

    fn number(&self, value: Value, operation: &'static str) -> Result<Decimal> {
        match value {
            Value::Number(n) => Ok(n),
            other => Err(self.mismatch(operation, ValueKind::Number, other.kind())),
        }
    }

    fn boolean(&self, value: Value, operation: &'static str) -> Result<bool> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(self.mismatch(operation, ValueKind::Boolean, other.kind())),
        }
    }

    fn checked(&self, result: Option<Decimal>) -> Result<Decimal> {
        result.ok_or_else(|| Error::ArithmeticOverflow {
            binding: self.binding.to_string(),
        })
    }

    fn mismatch(&self, operation: &'static str, expected: ValueKind, found: ValueKind) -> Error {
        Error::TypeMismatch {
            binding: self.binding.to_string(),
            operation,
            expected,
            found,
        }
    }
}
