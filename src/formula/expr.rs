// Expression tree - closed set of node variants, evaluated exhaustively

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }
}

/// Built-in functions. Arity is checked when the body is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Function {
    Min,
    Max,
    Abs,
    Round,
    Ceil,
    Floor,
}

impl Function {
    pub fn from_name(name: &str) -> Option<Function> {
        match name {
            "min" => Some(Function::Min),
            "max" => Some(Function::Max),
            "abs" => Some(Function::Abs),
            "round" => Some(Function::Round),
            "ceil" => Some(Function::Ceil),
            "floor" => Some(Function::Floor),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Function::Min => "min",
            Function::Max => "max",
            Function::Abs => "abs",
            Function::Round => "round",
            Function::Ceil => "ceil",
            Function::Floor => "floor",
        }
    }

    /// Accepted argument counts (inclusive).
    pub fn arity(&self) -> (usize, usize) {
        match self {
            Function::Min | Function::Max => (1, usize::MAX),
            Function::Abs | Function::Ceil | Function::Floor => (1, 1),
            Function::Round => (1, 2),
        }
    }

    pub fn accepts(&self, count: usize) -> bool {
        let (min, max) = self.arity();
        count >= min && count <= max
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Expr {
    Number { value: Decimal },
    Bool { value: bool },
    Var { name: String },
    Unary { op: UnaryOp, operand: Box<Expr> },
    Binary { op: BinaryOp, lhs: Box<Expr>, rhs: Box<Expr> },
    If {
        condition: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
    Call { function: Function, args: Vec<Expr> },
}

impl Expr {
    pub fn var(name: impl Into<String>) -> Expr {
        Expr::Var { name: name.into() }
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Expr {
        Expr::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Every variable name this expression reads.
    pub fn references(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.collect_references(&mut names);
        names
    }

    /// Nodes on the longest root-to-leaf path. Recursive: only call it on
    /// trees the parser has bounded.
    pub fn height(&self) -> usize {
        1 + match self {
            Expr::Number { .. } | Expr::Bool { .. } | Expr::Var { .. } => 0,
            Expr::Unary { operand, .. } => operand.height(),
            Expr::Binary { lhs, rhs, .. } => lhs.height().max(rhs.height()),
            Expr::If {
                condition,
                then_branch,
                else_branch,
            } => condition
                .height()
                .max(then_branch.height())
                .max(else_branch.height()),
            Expr::Call { args, .. } => args.iter().map(Expr::height).max().unwrap_or(0),
        }
    }

    fn collect_references(&self, names: &mut BTreeSet<String>) {
        match self {
            Expr::Number { .. } | Expr::Bool { .. } => {}
            Expr::Var { name } => {
                names.insert(name.clone());
            }
            Expr::Unary { operand, .. } => operand.collect_references(names),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_references(names);
                rhs.collect_references(names);
            }
            Expr::If {
                condition,
                then_branch,
                else_branch,
            } => {
                condition.collect_references(names);
                then_branch.collect_references(names);
                else_branch.collect_references(names);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.collect_references(names);
                }
            }
        }
    }
}

/// One `name = expr` statement of a formula body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub name: String,
    pub expr: Expr,
}

/// Parsed formula body: bindings in source order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FormulaBody {
    pub bindings: Vec<Binding>,
}

impl FormulaBody {
    pub fn binding(&self, name: &str) -> Option<&Binding> {
        self.bindings.iter().find(|b| b.name == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.bindings.iter().position(|b| b.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_references_walk_every_branch() {
        let expr = Expr::If {
            condition: Box::new(Expr::var("overtime")),
            then_branch: Box::new(Expr::binary(
                BinaryOp::Mul,
                Expr::var("hours"),
                Expr::var("rate"),
            )),
            else_branch: Box::new(Expr::Call {
                function: Function::Max,
                args: vec![Expr::var("base"), Expr::Number { value: Decimal::ONE }],
            }),
        };

        let refs: Vec<String> = expr.references().into_iter().collect();
        assert_eq!(refs, vec!["base", "hours", "overtime", "rate"]);
    }

    #[test]
    fn test_function_arity() {
        assert!(Function::Round.accepts(1));
        assert!(Function::Round.accepts(2));
        assert!(!Function::Round.accepts(3));
        assert!(Function::Max.accepts(5));
        assert!(!Function::Abs.accepts(0));
        assert_eq!(Function::from_name("floor"), Some(Function::Floor));
        assert_eq!(Function::from_name("sqrt"), None);
    }
}
