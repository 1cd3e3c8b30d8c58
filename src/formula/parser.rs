// Formula body parser
//
// Grammar (loosest binding first):
//
//   body        := binding*
//   binding     := ident "=" expr ";"?
//   expr        := "if" expr "then" expr "else" expr | disjunction
//   disjunction := conjunction (("or" | "||") conjunction)*
//   conjunction := negation (("and" | "&&") negation)*
//   negation    := ("not" | "!") negation | comparison
//   comparison  := additive (("<=" | ">=" | "==" | "!=" | "<" | ">") additive)?
//   additive    := term (("+" | "-") term)*
//   term        := unary (("*" | "×" | "/" | "÷") unary)*
//   unary       := "-" unary | primary
//   primary     := number | "true" | "false" | call | ident | "(" expr ")"
//
// `#` starts a comment that runs to the end of the line.
//
// Bodies are bounded in size, binding count, nesting and tree height, so the
// recursive walks over a parsed body (evaluation, reference collection, drop)
// stay well inside a thread stack.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{char as pchar, digit1, multispace1, not_line_ending, satisfy},
    combinator::{all_consuming, map, map_res, not, opt, recognize, value, verify},
    error::ErrorKind as NomErrorKind,
    multi::{many0, separated_list1},
    sequence::{delimited, pair, preceded, terminated},
    IResult,
};
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::expr::{BinaryOp, Binding, Expr, FormulaBody, Function, UnaryOp};

const KEYWORDS: &[&str] = &["if", "then", "else", "and", "or", "not", "true", "false"];

/// Largest body accepted, in bytes.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

pub const MAX_BINDINGS: usize = 512;

/// Parentheses, calls, prefix operators and conditionals nested in one another.
pub const MAX_NESTING: usize = 64;

/// Nodes on the longest path of one binding's tree, operator chains included.
pub const MAX_HEIGHT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseProblem {
    Unexpected,
    TooComplex,
    TooLong,
}

impl fmt::Display for ParseProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseProblem::Unexpected => f.write_str("unexpected input"),
            ParseProblem::TooComplex => write!(
                f,
                "expression too complex (nesting above {} or height above {})",
                MAX_NESTING, MAX_HEIGHT
            ),
            ParseProblem::TooLong => write!(
                f,
                "body too long (more than {} bytes or {} bindings)",
                MAX_BODY_BYTES, MAX_BINDINGS
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}, column {column}: {problem} near '{near}'")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub problem: ParseProblem,
    pub near: String,
}

impl ParseError {
    fn from_nom(source: &str, e: nom::error::Error<&str>) -> Self {
        let mut error = ParseError::at(source, e.input);
        if e.code == NomErrorKind::TooLarge {
            error.problem = ParseProblem::TooComplex;
        }
        error
    }

    fn at(source: &str, remaining: &str) -> Self {
        let offset = source.len().saturating_sub(remaining.len());
        let consumed = &source[..offset];
        let line = consumed.matches('\n').count() + 1;
        let column = consumed
            .rsplit('\n')
            .next()
            .map(|l| l.chars().count() + 1)
            .unwrap_or(1);
        let near: String = remaining.chars().take(16).collect();

        ParseError {
            line,
            column,
            problem: ParseProblem::Unexpected,
            near: if near.is_empty() {
                "end of input".to_string()
            } else {
                near
            },
        }
    }
}

/// Parse a complete formula body.
pub fn parse_body(source: &str) -> Result<FormulaBody, ParseError> {
    if source.len() > MAX_BODY_BYTES {
        return Err(ParseError {
            problem: ParseProblem::TooLong,
            ..ParseError::at(source, source)
        });
    }

    match all_consuming(preceded(sp, many0(binding)))(source) {
        Ok((_, bindings)) if bindings.len() > MAX_BINDINGS => Err(ParseError {
            problem: ParseProblem::TooLong,
            ..ParseError::at(source, source)
        }),
        Ok((_, bindings)) => Ok(FormulaBody { bindings }),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(ParseError::from_nom(source, e)),
        Err(nom::Err::Incomplete(_)) => Err(ParseError::at(source, "")),
    }
}

/// Parse a single expression (used by tests and tooling).
pub fn parse_expr(source: &str) -> Result<Expr, ParseError> {
    match all_consuming(preceded(sp, |i| expr(i, 0)))(source) {
        Ok((_, parsed)) => Ok(parsed),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(ParseError::from_nom(source, e)),
        Err(nom::Err::Incomplete(_)) => Err(ParseError::at(source, "")),
    }
}

/// True if `name` can be used as an input or output variable name.
pub fn is_identifier(name: &str) -> bool {
    matches!(identifier(name), Ok(("", _)))
}

// ============================================================================
// LEXICAL
// ============================================================================

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Whitespace and comments.
fn sp(input: &str) -> IResult<&str, ()> {
    value(
        (),
        many0(alt((
            value((), multispace1),
            value((), pair(pchar('#'), not_line_ending)),
        ))),
    )(input)
}

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(sp, inner, sp)
}

fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(tag(word), not(satisfy(is_ident_char)))
}

fn identifier(input: &str) -> IResult<&str, &str> {
    verify(
        recognize(pair(satisfy(is_ident_start), take_while(is_ident_char))),
        |name: &str| !KEYWORDS.contains(&name),
    )(input)
}

fn number(input: &str) -> IResult<&str, Expr> {
    map_res(
        recognize(pair(digit1, opt(pair(pchar('.'), digit1)))),
        |digits: &str| Decimal::from_str(digits).map(|value| Expr::Number { value }),
    )(input)
}

fn boolean(input: &str) -> IResult<&str, Expr> {
    alt((
        value(Expr::Bool { value: true }, keyword("true")),
        value(Expr::Bool { value: false }, keyword("false")),
    ))(input)
}

// ============================================================================
// EXPRESSIONS
// ============================================================================

fn binding(input: &str) -> IResult<&str, Binding> {
    let (input, name) = ws(identifier)(input)?;
    let (input, _) = ws(pchar('='))(input)?;
    let (input, expr) = expr(input, 0)?;
    let (input, _) = opt(ws(pchar(';')))(input)?;

    Ok((
        input,
        Binding {
            name: name.to_string(),
            expr,
        },
    ))
}

fn too_large(input: &str) -> nom::Err<nom::error::Error<&str>> {
    nom::Err::Failure(nom::error::Error::new(input, NomErrorKind::TooLarge))
}

/// One level deeper into the grammar; fails once `MAX_NESTING` is passed.
fn nest(input: &str, depth: usize) -> Result<usize, nom::Err<nom::error::Error<&str>>> {
    if depth >= MAX_NESTING {
        Err(too_large(input))
    } else {
        Ok(depth + 1)
    }
}

/// Reject a freshly built node taller than `MAX_HEIGHT`.
fn bounded(input: &str, node: Expr) -> IResult<&str, Expr> {
    if node.height() > MAX_HEIGHT {
        Err(too_large(input))
    } else {
        Ok((input, node))
    }
}

fn expr(input: &str, depth: usize) -> IResult<&str, Expr> {
    let depth = nest(input, depth)?;
    alt((move |i| conditional(i, depth), move |i| disjunction(i, depth)))(input)
}

fn conditional(input: &str, depth: usize) -> IResult<&str, Expr> {
    let (input, _) = ws(keyword("if"))(input)?;
    let (input, condition) = expr(input, depth)?;
    let (input, _) = ws(keyword("then"))(input)?;
    let (input, then_branch) = expr(input, depth)?;
    let (input, _) = ws(keyword("else"))(input)?;
    let (input, else_branch) = expr(input, depth)?;

    bounded(
        input,
        Expr::If {
            condition: Box::new(condition),
            then_branch: Box::new(then_branch),
            else_branch: Box::new(else_branch),
        },
    )
}

/// Left-associative `operand (operator operand)*`, height-checked per step.
fn left_chain<'a, P, O>(input: &'a str, mut operand: P, mut operator: O) -> IResult<&'a str, Expr>
where
    P: FnMut(&'a str) -> IResult<&'a str, Expr>,
    O: FnMut(&'a str) -> IResult<&'a str, BinaryOp>,
{
    let (mut input, mut lhs) = operand(input)?;
    let mut height = lhs.height();

    loop {
        let (rest, op) = match operator(input) {
            Ok(parsed) => parsed,
            Err(nom::Err::Error(_)) => return Ok((input, lhs)),
            Err(e) => return Err(e),
        };
        let (rest, rhs) = match operand(rest) {
            Ok(parsed) => parsed,
            Err(nom::Err::Error(_)) => return Ok((input, lhs)),
            Err(e) => return Err(e),
        };

        height = height.max(rhs.height()) + 1;
        if height > MAX_HEIGHT {
            return Err(too_large(input));
        }
        lhs = Expr::binary(op, lhs, rhs);
        input = rest;
    }
}

fn disjunction(input: &str, depth: usize) -> IResult<&str, Expr> {
    left_chain(
        input,
        |i| conjunction(i, depth),
        value(BinaryOp::Or, ws(alt((keyword("or"), tag("||"))))),
    )
}

fn conjunction(input: &str, depth: usize) -> IResult<&str, Expr> {
    left_chain(
        input,
        |i| negation(i, depth),
        value(BinaryOp::And, ws(alt((keyword("and"), tag("&&"))))),
    )
}

fn negation(input: &str, depth: usize) -> IResult<&str, Expr> {
    let (rest, bang) = opt(ws(alt((keyword("not"), tag("!")))))(input)?;
    match bang {
        Some(_) => {
            let (rest, operand) = negation(rest, nest(rest, depth)?)?;
            bounded(rest, Expr::unary(UnaryOp::Not, operand))
        }
        None => comparison(input, depth),
    }
}

fn compare_op(input: &str) -> IResult<&str, BinaryOp> {
    alt((
        value(BinaryOp::Le, tag("<=")),
        value(BinaryOp::Ge, tag(">=")),
        value(BinaryOp::Eq, tag("==")),
        value(BinaryOp::Ne, tag("!=")),
        value(BinaryOp::Lt, tag("<")),
        value(BinaryOp::Gt, tag(">")),
    ))(input)
}

fn comparison(input: &str, depth: usize) -> IResult<&str, Expr> {
    let (input, lhs) = additive(input, depth)?;
    let (input, rest) = opt(pair(ws(compare_op), |i| additive(i, depth)))(input)?;

    match rest {
        Some((op, rhs)) => bounded(input, Expr::binary(op, lhs, rhs)),
        None => Ok((input, lhs)),
    }
}

fn additive(input: &str, depth: usize) -> IResult<&str, Expr> {
    left_chain(
        input,
        |i| term(i, depth),
        ws(alt((
            value(BinaryOp::Add, pchar('+')),
            value(BinaryOp::Sub, pchar('-')),
        ))),
    )
}

fn term(input: &str, depth: usize) -> IResult<&str, Expr> {
    left_chain(
        input,
        |i| unary(i, depth),
        ws(alt((
            value(BinaryOp::Mul, alt((pchar('*'), pchar('×')))),
            value(BinaryOp::Div, alt((pchar('/'), pchar('÷')))),
        ))),
    )
}

fn unary(input: &str, depth: usize) -> IResult<&str, Expr> {
    let (rest, minus) = opt(ws(pchar('-')))(input)?;
    match minus {
        Some(_) => {
            let (rest, operand) = unary(rest, nest(rest, depth)?)?;
            bounded(rest, Expr::unary(UnaryOp::Neg, operand))
        }
        None => primary(input, depth),
    }
}

fn call(input: &str, depth: usize) -> IResult<&str, Expr> {
    let (rest, (name, args)) = pair(
        identifier,
        delimited(
            ws(pchar('(')),
            separated_list1(ws(pchar(',')), |i| expr(i, depth)),
            ws(pchar(')')),
        ),
    )(input)?;

    let function = match Function::from_name(name) {
        Some(function) if function.accepts(args.len()) => function,
        _ => {
            return Err(nom::Err::Error(nom::error::Error::new(
                input,
                NomErrorKind::MapRes,
            )))
        }
    };
    bounded(rest, Expr::Call { function, args })
}

fn primary(input: &str, depth: usize) -> IResult<&str, Expr> {
    ws(alt((
        number,
        boolean,
        |i| call(i, depth),
        map(identifier, |name: &str| Expr::var(name)),
        delimited(pchar('('), |i| expr(i, depth), ws(pchar(')'))),
    )))(input)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: i64) -> Expr {
        Expr::Number {
            value: Decimal::from(n),
        }
    }

    #[test]
    fn test_single_binding() {
        let body = parse_body("output = hours * rate").unwrap();

        assert_eq!(body.bindings.len(), 1);
        assert_eq!(body.bindings[0].name, "output");
        assert_eq!(
            body.bindings[0].expr,
            Expr::binary(BinaryOp::Mul, Expr::var("hours"), Expr::var("rate"))
        );
    }

    #[test]
    fn test_precedence() {
        let parsed = parse_expr("a + b * c - d").unwrap();
        let expected = Expr::binary(
            BinaryOp::Sub,
            Expr::binary(
                BinaryOp::Add,
                Expr::var("a"),
                Expr::binary(BinaryOp::Mul, Expr::var("b"), Expr::var("c")),
            ),
            Expr::var("d"),
        );
        assert_eq!(parsed, expected);

        let grouped = parse_expr("(a + b) * 2").unwrap();
        assert_eq!(
            grouped,
            Expr::binary(
                BinaryOp::Mul,
                Expr::binary(BinaryOp::Add, Expr::var("a"), Expr::var("b")),
                num(2)
            )
        );
    }

    #[test]
    fn test_decimal_literal_is_exact() {
        let parsed = parse_expr("hours × rate × 1.12").unwrap();
        match parsed {
            Expr::Binary { op, rhs, .. } => {
                assert_eq!(op, BinaryOp::Mul);
                assert_eq!(
                    *rhs,
                    Expr::Number {
                        value: Decimal::new(112, 2)
                    }
                );
            }
            other => panic!("unexpected tree: {:?}", other),
        }
    }

    #[test]
    fn test_multiple_bindings_with_comments() {
        let source = "
            # waste factor applied before pricing
            gross_qty = net_qty * (1 + waste_pct / 100);
            total = gross_qty * unit_cost
        ";
        let body = parse_body(source).unwrap();

        let names: Vec<&str> = body.bindings.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["gross_qty", "total"]);
    }

    #[test]
    fn test_conditional_and_logic() {
        let parsed = parse_expr("if overtime and hours > 8 then rate * 1.5 else rate").unwrap();
        match parsed {
            Expr::If { condition, .. } => match *condition {
                Expr::Binary { op, rhs, .. } => {
                    assert_eq!(op, BinaryOp::And);
                    assert!(matches!(*rhs, Expr::Binary { op: BinaryOp::Gt, .. }));
                }
                other => panic!("unexpected condition: {:?}", other),
            },
            other => panic!("unexpected tree: {:?}", other),
        }
    }

    #[test]
    fn test_not_binds_looser_than_comparison() {
        let parsed = parse_expr("not a < b").unwrap();
        assert_eq!(
            parsed,
            Expr::unary(
                UnaryOp::Not,
                Expr::binary(BinaryOp::Lt, Expr::var("a"), Expr::var("b"))
            )
        );
    }

    #[test]
    fn test_function_calls() {
        let parsed = parse_expr("round(max(a, b, 0), 2)").unwrap();
        match parsed {
            Expr::Call { function, args } => {
                assert_eq!(function, Function::Round);
                assert_eq!(args.len(), 2);
                assert!(matches!(
                    args[0],
                    Expr::Call {
                        function: Function::Max,
                        ..
                    }
                ));
            }
            other => panic!("unexpected tree: {:?}", other),
        }
    }

    #[test]
    fn test_keywords_are_not_identifiers() {
        assert!(is_identifier("hours"));
        assert!(is_identifier("_tmp2"));
        assert!(!is_identifier("then"));
        assert!(!is_identifier("2x"));
        assert!(!is_identifier("unit cost"));
    }

    #[test]
    fn test_error_position() {
        let err = parse_body("a = 1\nb = * 2").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.column, 1);

        assert!(parse_body("total = abs(1, 2)").is_err());
        assert!(parse_body("total = hours *").is_err());
    }

    #[test]
    fn test_deep_nesting_rejected() {
        let deep = format!("out = {}1{}", "(".repeat(3000), ")".repeat(3000));
        let err = parse_body(&deep).unwrap_err();
        assert_eq!(err.problem, ParseProblem::TooComplex);

        let negated = format!("out = {}1", "- ".repeat(MAX_NESTING + 1));
        assert_eq!(parse_body(&negated).unwrap_err().problem, ParseProblem::TooComplex);

        let nested_calls = format!("out = {}1{}", "abs(".repeat(500), ")".repeat(500));
        assert_eq!(parse_body(&nested_calls).unwrap_err().problem, ParseProblem::TooComplex);

        let shallow = format!("out = {}1{}", "(".repeat(20), ")".repeat(20));
        assert!(parse_body(&shallow).is_ok());
    }

    #[test]
    fn test_long_operator_chain_rejected() {
        let chain = format!("out = {}1", "1 + ".repeat(5_000));
        let err = parse_body(&chain).unwrap_err();
        assert_eq!(err.problem, ParseProblem::TooComplex);
        assert!(err.to_string().contains("too complex"));

        // Past the byte limit the size check answers first
        let longer = format!("out = {}1", "1 + ".repeat(20_000));
        assert_eq!(parse_body(&longer).unwrap_err().problem, ParseProblem::TooLong);

        // Long but reasonable sums still parse
        let sum = format!("out = {}1", "1 + ".repeat(200));
        let body = parse_body(&sum).unwrap();
        assert_eq!(body.bindings[0].expr.height(), 201);
    }

    #[test]
    fn test_body_size_limits() {
        let huge = format!("out = 1 # {}", "x".repeat(MAX_BODY_BYTES));
        assert_eq!(parse_body(&huge).unwrap_err().problem, ParseProblem::TooLong);

        let many: String = (0..=MAX_BINDINGS).map(|i| format!("b{} = 1\n", i)).collect();
        assert_eq!(parse_body(&many).unwrap_err().problem, ParseProblem::TooLong);
    }

    #[test]
    fn test_empty_body() {
        let body = parse_body("  # nothing yet\n").unwrap();
        assert!(body.bindings.is_empty());
    }
}
