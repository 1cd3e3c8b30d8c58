// Formulas - versioned definitions, their expression trees and evaluation

pub mod evaluator;
pub mod expr;
pub mod parser;
pub mod registry;
pub mod value;
pub mod version;

pub use evaluator::evaluate;
pub use expr::{BinaryOp, Binding, Expr, FormulaBody, Function, UnaryOp};
pub use parser::{parse_body, parse_expr, ParseError, ParseProblem};
pub use registry::{current_sequences, FormulaRegistry, InMemoryRegistry};
pub use value::{Value, ValueKind};
pub use version::{FormulaDraft, FormulaVersion, InputDecl, VersionRef};
