//! Filter and projection expressions evaluated at the storage layer:
//! closed terms over constants, row fields, arithmetic, comparisons,
//! logical connectives, and a small builtin function set.
//!
//! Expressions arrive serialized inside read requests (the planner builds
//! them; storage only evaluates), so the AST derives serde and the wire
//! form is its JSON encoding.

use models::Value;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    #[error("unknown function {0:?}")]
    UnknownFunction(String),
    #[error("function {0:?} applied to unsupported operand types")]
    BadOperands(&'static str),
    #[error("division by zero")]
    DivisionByZero,
    #[error("arithmetic overflow")]
    Overflow,
    #[error("malformed expression: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LogicalOp {
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Expr {
    Constant(Value),
    /// A named property of the row in scope.
    Field(String),
    Arith(ArithOp, Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    /// `Not` takes one operand; `And`/`Or` take two or more.
    Logical(LogicalOp, Vec<Expr>),
    Call(String, Vec<Expr>),
}

impl Expr {
    pub fn field(name: &str) -> Expr {
        Expr::Field(name.to_string())
    }

    pub fn constant(value: Value) -> Expr {
        Expr::Constant(value)
    }

    pub fn cmp(op: CmpOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Cmp(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn and(terms: Vec<Expr>) -> Expr {
        Expr::Logical(LogicalOp::And, terms)
    }

    /// Serialize for transport inside a request.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("expression serialization is infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Expr> {
        serde_json::from_slice(bytes).map_err(|err| Error::Malformed(err.to_string()))
    }
}

/// The row a filter or projection runs against: resolves field names to
/// values. Absent fields resolve to None and evaluate as null.
pub trait RowScope {
    fn field(&self, name: &str) -> Option<Value>;
}

impl RowScope for std::collections::BTreeMap<String, Value> {
    fn field(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

/// Evaluate an expression against a row. Null propagates: an arithmetic
/// or comparison term with a null operand is null, and the connectives
/// follow three-valued logic.
pub fn evaluate(expr: &Expr, row: &dyn RowScope) -> Result<Value> {
    match expr {
        Expr::Constant(value) => Ok(value.clone()),
        Expr::Field(name) => Ok(row.field(name).unwrap_or(Value::Null)),
        Expr::Arith(op, lhs, rhs) => {
            let lhs = evaluate(lhs, row)?;
            let rhs = evaluate(rhs, row)?;
            arith(*op, lhs, rhs)
        }
        Expr::Cmp(op, lhs, rhs) => {
            let lhs = evaluate(lhs, row)?;
            let rhs = evaluate(rhs, row)?;
            if lhs.is_null() || rhs.is_null() {
                return Ok(Value::Null);
            }
            let ord = lhs.cmp_total(&rhs);
            Ok(Value::Bool(match op {
                CmpOp::Eq => ord.is_eq(),
                CmpOp::Ne => ord.is_ne(),
                CmpOp::Lt => ord.is_lt(),
                CmpOp::Le => ord.is_le(),
                CmpOp::Gt => ord.is_gt(),
                CmpOp::Ge => ord.is_ge(),
            }))
        }
        Expr::Logical(LogicalOp::Not, terms) => {
            let [term] = terms.as_slice() else {
                return Err(Error::Malformed("NOT takes exactly one operand".to_string()));
            };
            match evaluate(term, row)? {
                Value::Null => Ok(Value::Null),
                Value::Bool(b) => Ok(Value::Bool(!b)),
                _ => Err(Error::BadOperands("NOT")),
            }
        }
        Expr::Logical(op, terms) => {
            // Three-valued AND/OR: a decided operand short-circuits, null
            // otherwise taints the result.
            let decided = matches!(op, LogicalOp::Or);
            let mut saw_null = false;
            for term in terms {
                match evaluate(term, row)? {
                    Value::Null => saw_null = true,
                    Value::Bool(b) if b == decided => return Ok(Value::Bool(decided)),
                    Value::Bool(_) => (),
                    _ => return Err(Error::BadOperands("AND/OR")),
                }
            }
            if saw_null {
                Ok(Value::Null)
            } else {
                Ok(Value::Bool(!decided))
            }
        }
        Expr::Call(name, args) => {
            let args = args
                .iter()
                .map(|arg| evaluate(arg, row))
                .collect::<Result<Vec<_>>>()?;
            call(name, args)
        }
    }
}

/// Evaluate a filter: true passes, false and null suppress.
pub fn matches(expr: &Expr, row: &dyn RowScope) -> Result<bool> {
    Ok(evaluate(expr, row)? == Value::Bool(true))
}

fn arith(op: ArithOp, lhs: Value, rhs: Value) -> Result<Value> {
    use ArithOp::*;

    if lhs.is_null() || rhs.is_null() {
        return Ok(Value::Null);
    }
    match (&lhs, &rhs) {
        (Value::Int(l), Value::Int(r)) => {
            let out = match op {
                Add => l.checked_add(*r),
                Sub => l.checked_sub(*r),
                Mul => l.checked_mul(*r),
                Div if *r == 0 => return Err(Error::DivisionByZero),
                Div => l.checked_div(*r),
                Mod if *r == 0 => return Err(Error::DivisionByZero),
                Mod => l.checked_rem(*r),
            };
            out.map(Value::Int).ok_or(Error::Overflow)
        }
        _ => {
            let (Some(l), Some(r)) = (lhs.as_float(), rhs.as_float()) else {
                // String concatenation is the one non-numeric arithmetic.
                if let (ArithOp::Add, Value::Str(l), Value::Str(r)) = (op, &lhs, &rhs) {
                    return Ok(Value::Str(format!("{l}{r}")));
                }
                return Err(Error::BadOperands("arithmetic"));
            };
            Ok(Value::Float(match op {
                Add => l + r,
                Sub => l - r,
                Mul => l * r,
                Div => l / r,
                Mod => l % r,
            }))
        }
    }
}

fn call(name: &str, mut args: Vec<Value>) -> Result<Value> {
    match (name, args.len()) {
        (_, _) if args.iter().any(Value::is_null) => Ok(Value::Null),
        ("abs", 1) => match args.pop().unwrap() {
            Value::Int(i) => i.checked_abs().map(Value::Int).ok_or(Error::Overflow),
            Value::Float(f) => Ok(Value::Float(f.abs())),
            _ => Err(Error::BadOperands("abs")),
        },
        ("size", 1) => match args.pop().unwrap() {
            Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
            Value::List(items) => Ok(Value::Int(items.len() as i64)),
            Value::Map(entries) => Ok(Value::Int(entries.len() as i64)),
            _ => Err(Error::BadOperands("size")),
        },
        ("lower", 1) => match args.pop().unwrap() {
            Value::Str(s) => Ok(Value::Str(s.to_lowercase())),
            _ => Err(Error::BadOperands("lower")),
        },
        ("upper", 1) => match args.pop().unwrap() {
            Value::Str(s) => Ok(Value::Str(s.to_uppercase())),
            _ => Err(Error::BadOperands("upper")),
        },
        _ => Err(Error::UnknownFunction(name.to_string())),
    }
}

/// Rewrite an expression bottom-up: wherever `matcher` accepts a
/// (already-rewritten) subterm, `replacer` substitutes it.
pub fn rewrite(
    expr: Expr,
    matcher: &dyn Fn(&Expr) -> bool,
    replacer: &dyn Fn(Expr) -> Expr,
) -> Expr {
    let expr = match expr {
        Expr::Arith(op, lhs, rhs) => Expr::Arith(
            op,
            Box::new(rewrite(*lhs, matcher, replacer)),
            Box::new(rewrite(*rhs, matcher, replacer)),
        ),
        Expr::Cmp(op, lhs, rhs) => Expr::Cmp(
            op,
            Box::new(rewrite(*lhs, matcher, replacer)),
            Box::new(rewrite(*rhs, matcher, replacer)),
        ),
        Expr::Logical(op, terms) => Expr::Logical(
            op,
            terms
                .into_iter()
                .map(|term| rewrite(term, matcher, replacer))
                .collect(),
        ),
        Expr::Call(name, args) => Expr::Call(
            name,
            args.into_iter()
                .map(|arg| rewrite(arg, matcher, replacer))
                .collect(),
        ),
        leaf => leaf,
    };

    if matcher(&expr) {
        replacer(expr)
    } else {
        expr
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;

    fn row() -> BTreeMap<String, Value> {
        [
            ("age".to_string(), Value::Int(30)),
            ("name".to_string(), Value::Str("Alice".to_string())),
            ("score".to_string(), Value::Float(2.5)),
            ("nick".to_string(), Value::Null),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_arithmetic() {
        let expr = Expr::Arith(
            ArithOp::Add,
            Box::new(Expr::field("age")),
            Box::new(Expr::constant(Value::Int(12))),
        );
        assert_eq!(evaluate(&expr, &row()).unwrap(), Value::Int(42));

        let expr = Expr::Arith(
            ArithOp::Mul,
            Box::new(Expr::field("score")),
            Box::new(Expr::constant(Value::Int(2))),
        );
        assert_eq!(evaluate(&expr, &row()).unwrap(), Value::Float(5.0));

        let expr = Expr::Arith(
            ArithOp::Div,
            Box::new(Expr::constant(Value::Int(1))),
            Box::new(Expr::constant(Value::Int(0))),
        );
        assert_eq!(evaluate(&expr, &row()), Err(Error::DivisionByZero));
    }

    #[test]
    fn test_comparison_and_null_propagation() {
        let expr = Expr::cmp(
            CmpOp::Ge,
            Expr::field("age"),
            Expr::constant(Value::Int(20)),
        );
        assert_eq!(evaluate(&expr, &row()).unwrap(), Value::Bool(true));

        // A null operand yields null, and a null filter does not match.
        let expr = Expr::cmp(CmpOp::Eq, Expr::field("nick"), Expr::constant(Value::Int(1)));
        assert_eq!(evaluate(&expr, &row()).unwrap(), Value::Null);
        assert!(!matches(&expr, &row()).unwrap());

        // Absent fields behave as null.
        let expr = Expr::cmp(
            CmpOp::Eq,
            Expr::field("ghost"),
            Expr::constant(Value::Int(1)),
        );
        assert_eq!(evaluate(&expr, &row()).unwrap(), Value::Null);
    }

    #[test]
    fn test_three_valued_logic() {
        let null = || Expr::constant(Value::Null);
        let truth = |b| Expr::constant(Value::Bool(b));

        let and = |terms| Expr::Logical(LogicalOp::And, terms);
        let or = |terms| Expr::Logical(LogicalOp::Or, terms);

        // false AND null decides false; true AND null stays null.
        assert_eq!(
            evaluate(&and(vec![truth(false), null()]), &row()).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            evaluate(&and(vec![truth(true), null()]), &row()).unwrap(),
            Value::Null
        );
        // true OR null decides true.
        assert_eq!(
            evaluate(&or(vec![null(), truth(true)]), &row()).unwrap(),
            Value::Bool(true)
        );

        let not = Expr::Logical(LogicalOp::Not, vec![truth(false)]);
        assert_eq!(evaluate(&not, &row()).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_function_calls() {
        let expr = Expr::Call("size".to_string(), vec![Expr::field("name")]);
        assert_eq!(evaluate(&expr, &row()).unwrap(), Value::Int(5));

        let expr = Expr::Call("upper".to_string(), vec![Expr::field("name")]);
        assert_eq!(
            evaluate(&expr, &row()).unwrap(),
            Value::Str("ALICE".to_string())
        );

        let expr = Expr::Call("nope".to_string(), vec![]);
        assert_eq!(
            evaluate(&expr, &row()),
            Err(Error::UnknownFunction("nope".to_string()))
        );
    }

    #[test]
    fn test_wire_round_trip() {
        let expr = Expr::and(vec![
            Expr::cmp(CmpOp::Ge, Expr::field("age"), Expr::constant(Value::Int(20))),
            Expr::cmp(CmpOp::Lt, Expr::field("age"), Expr::constant(Value::Int(30))),
        ]);
        let bytes = expr.to_bytes();
        assert_eq!(Expr::from_bytes(&bytes).unwrap(), expr);
    }

    #[test]
    fn test_rewrite_substitutes_fields() {
        // Rewrite field references to constants, as the storage layer does
        // when binding a filter to a concrete row.
        let expr = Expr::cmp(
            CmpOp::Gt,
            Expr::field("age"),
            Expr::constant(Value::Int(20)),
        );

        let bound = rewrite(
            expr,
            &|e| matches!(e, Expr::Field(_)),
            &|e| match e {
                Expr::Field(_) => Expr::constant(Value::Int(25)),
                other => other,
            },
        );

        assert_eq!(
            bound,
            Expr::cmp(
                CmpOp::Gt,
                Expr::constant(Value::Int(25)),
                Expr::constant(Value::Int(20)),
            )
        );
    }
}
