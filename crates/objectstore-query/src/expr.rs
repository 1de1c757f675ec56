//! Expression trees over one mapped object.
//!
//! An [`Expr`] is a lambda body whose single parameter is the object being
//! filtered or sorted. Member access on the parameter reads a property;
//! member access on a navigation property walks to the related object.
//!
//! ```ignore
//! // x => x.team.name == "core" && x.age >= 18
//! let predicate = Expr::field("team").member("name").eq("core")
//!     .and(Expr::field("age").ge(18));
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use objectstore_core::{Result, Value};

/// Host-side function usable inside expressions.
///
/// `template` is the SQL substitution with positional slots (`LOWER({0})`);
/// `eval` is the in-memory implementation.
pub struct SqlFunction {
    pub name: String,
    pub template: Option<String>,
    pub eval: Option<Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>>,
}

impl SqlFunction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: None,
            eval: None,
        }
    }

    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn eval<F>(mut self, eval: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.eval = Some(Arc::new(eval));
        self
    }

    pub fn build(self) -> Arc<SqlFunction> {
        Arc::new(self)
    }
}

impl fmt::Debug for SqlFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlFunction")
            .field("name", &self.name)
            .field("template", &self.template)
            .field("eval", &self.eval.is_some())
            .finish()
    }
}

/// A closure evaluated when the query is analyzed.
#[derive(Clone)]
pub struct Captured {
    pub name: Arc<str>,
    pub eval: Arc<dyn Fn() -> Value + Send + Sync>,
}

impl fmt::Debug for Captured {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Captured({})", self.name)
    }
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    // Comparison
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    // Logical
    And,
    Or,

    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    /// Get the SQL representation of this operator.
    pub const fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
        }
    }

    /// Operator as written in an expression.
    pub const fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            other => other.as_str(),
        }
    }

    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub const fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Neg,
}

impl UnaryOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            UnaryOp::Not => "NOT",
            UnaryOp::Neg => "-",
        }
    }
}

/// An expression node.
#[derive(Debug, Clone)]
pub enum Expr {
    /// The lambda parameter: the object itself
    Parameter,
    /// Literal value
    Constant(Value),
    /// Host-side computation folded into a constant at analysis
    Captured(Captured),
    /// `target.name`
    Member { target: Box<Expr>, name: Arc<str> },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary { op: UnaryOp, expr: Box<Expr> },
    /// `list.contains(item)`
    Contains { list: Box<Expr>, item: Box<Expr> },
    /// Function call
    Call {
        function: Arc<SqlFunction>,
        args: Vec<Expr>,
    },
    /// `test ? if_true : if_false`
    Conditional {
        test: Box<Expr>,
        if_true: Box<Expr>,
        if_false: Box<Expr>,
    },
}

impl Expr {
    /// Property of the parameter: `x.name`.
    pub fn field(name: &str) -> Self {
        Expr::Parameter.member(name)
    }

    /// Member access on this expression.
    pub fn member(self, name: &str) -> Self {
        Expr::Member {
            target: Box::new(self),
            name: Arc::from(name),
        }
    }

    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Constant(value.into())
    }

    pub fn null() -> Self {
        Expr::Constant(Value::Null)
    }

    /// A named closure folded into a constant when the query is analyzed.
    pub fn captured<F>(name: &str, eval: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        Expr::Captured(Captured {
            name: Arc::from(name),
            eval: Arc::new(eval),
        })
    }

    pub fn call(function: &Arc<SqlFunction>, args: Vec<Expr>) -> Self {
        Expr::Call {
            function: Arc::clone(function),
            args,
        }
    }

    pub fn cond(test: impl Into<Expr>, if_true: impl Into<Expr>, if_false: impl Into<Expr>) -> Self {
        Expr::Conditional {
            test: Box::new(test.into()),
            if_true: Box::new(if_true.into()),
            if_false: Box::new(if_false.into()),
        }
    }

    fn binary(self, op: BinaryOp, other: impl Into<Expr>) -> Self {
        Expr::Binary {
            op,
            left: Box::new(self),
            right: Box::new(other.into()),
        }
    }

    pub fn eq(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Eq, other)
    }

    pub fn ne(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ne, other)
    }

    pub fn lt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Lt, other)
    }

    pub fn le(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Le, other)
    }

    pub fn gt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Gt, other)
    }

    pub fn ge(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ge, other)
    }

    pub fn and(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::And, other)
    }

    pub fn or(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Or, other)
    }

    pub fn add(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Add, other)
    }

    pub fn sub(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Sub, other)
    }

    pub fn mul(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Mul, other)
    }

    pub fn div(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Div, other)
    }

    pub fn modulo(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Mod, other)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Expr::Unary {
            op: UnaryOp::Not,
            expr: Box::new(self),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn neg(self) -> Self {
        Expr::Unary {
            op: UnaryOp::Neg,
            expr: Box::new(self),
        }
    }

    pub fn is_null(self) -> Self {
        self.eq(Expr::null())
    }

    pub fn is_not_null(self) -> Self {
        self.ne(Expr::null())
    }

    /// `list.contains(self)` against a constant list.
    pub fn in_list(self, values: Vec<impl Into<Value>>) -> Self {
        let list = Value::Array(values.into_iter().map(Into::into).collect());
        Expr::Contains {
            list: Box::new(Expr::Constant(list)),
            item: Box::new(self),
        }
    }

    /// `self.contains(item)` where `self` evaluates to a list.
    pub fn contains(self, item: impl Into<Expr>) -> Self {
        Expr::Contains {
            list: Box::new(self),
            item: Box::new(item.into()),
        }
    }

    /// Does the lambda parameter occur anywhere inside?
    pub fn uses_parameter(&self) -> bool {
        match self {
            Expr::Parameter => true,
            Expr::Constant(_) | Expr::Captured(_) => false,
            Expr::Member { target, .. } => target.uses_parameter(),
            Expr::Binary { left, right, .. } => left.uses_parameter() || right.uses_parameter(),
            Expr::Unary { expr, .. } => expr.uses_parameter(),
            Expr::Contains { list, item } => list.uses_parameter() || item.uses_parameter(),
            Expr::Call { args, .. } => args.iter().any(Expr::uses_parameter),
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => test.uses_parameter() || if_true.uses_parameter() || if_false.uses_parameter(),
        }
    }

    /// Navigation path from the parameter (`["team", "name"]` for
    /// `x.team.name`), if this is a member chain rooted at the parameter.
    pub fn member_path(&self) -> Option<Vec<&str>> {
        match self {
            Expr::Member { target, name } => {
                let mut path = match target.as_ref() {
                    Expr::Parameter => Vec::new(),
                    other => other.member_path()?,
                };
                path.push(name);
                Some(path)
            }
            _ => None,
        }
    }

    /// Own properties of the parameter referenced anywhere inside.
    pub fn referenced_properties(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_properties(&mut out);
        out
    }

    fn collect_properties(&self, out: &mut Vec<String>) {
        match self {
            Expr::Member { target, name } => {
                if matches!(target.as_ref(), Expr::Parameter) {
                    if !out.iter().any(|p| p.as_str() == name.as_ref()) {
                        out.push(name.to_string());
                    }
                } else {
                    target.collect_properties(out);
                }
            }
            Expr::Binary { left, right, .. } => {
                left.collect_properties(out);
                right.collect_properties(out);
            }
            Expr::Unary { expr, .. } => expr.collect_properties(out),
            Expr::Contains { list, item } => {
                list.collect_properties(out);
                item.collect_properties(out);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.collect_properties(out);
                }
            }
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => {
                test.collect_properties(out);
                if_true.collect_properties(out);
                if_false.collect_properties(out);
            }
            Expr::Parameter | Expr::Constant(_) | Expr::Captured(_) => {}
        }
    }

    /// Replace every parameter-free subtree with its value.
    pub fn fold_constants(&self) -> Result<Expr> {
        if !self.uses_parameter() {
            if let Expr::Constant(_) = self {
                return Ok(self.clone());
            }
            return crate::compile::evaluate_constant(self).map(Expr::Constant);
        }
        Ok(match self {
            Expr::Member { target, name } => Expr::Member {
                target: Box::new(target.fold_constants()?),
                name: Arc::clone(name),
            },
            Expr::Binary { op, left, right } => Expr::Binary {
                op: *op,
                left: Box::new(left.fold_constants()?),
                right: Box::new(right.fold_constants()?),
            },
            Expr::Unary { op, expr } => Expr::Unary {
                op: *op,
                expr: Box::new(expr.fold_constants()?),
            },
            Expr::Contains { list, item } => Expr::Contains {
                list: Box::new(list.fold_constants()?),
                item: Box::new(item.fold_constants()?),
            },
            Expr::Call { function, args } => Expr::Call {
                function: Arc::clone(function),
                args: args
                    .iter()
                    .map(Expr::fold_constants)
                    .collect::<Result<Vec<_>>>()?,
            },
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => Expr::Conditional {
                test: Box::new(test.fold_constants()?),
                if_true: Box::new(if_true.fold_constants()?),
                if_false: Box::new(if_false.fold_constants()?),
            },
            other => other.clone(),
        })
    }

    fn captured_value(captured: &Captured) -> Value {
        (captured.eval)()
    }
}

// Captured closures compare by the value they produce. Queries fold them
// before contexts are cached, so keys never evaluate host code.
impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Expr::Parameter, Expr::Parameter) => true,
            (Expr::Constant(a), Expr::Constant(b)) => a == b,
            (Expr::Captured(a), Expr::Captured(b)) => {
                Expr::captured_value(a) == Expr::captured_value(b)
            }
            (Expr::Captured(a), Expr::Constant(b)) | (Expr::Constant(b), Expr::Captured(a)) => {
                Expr::captured_value(a) == *b
            }
            (
                Expr::Member {
                    target: ta,
                    name: na,
                },
                Expr::Member {
                    target: tb,
                    name: nb,
                },
            ) => na == nb && ta == tb,
            (
                Expr::Binary {
                    op: oa,
                    left: la,
                    right: ra,
                },
                Expr::Binary {
                    op: ob,
                    left: lb,
                    right: rb,
                },
            ) => oa == ob && la == lb && ra == rb,
            (Expr::Unary { op: oa, expr: ea }, Expr::Unary { op: ob, expr: eb }) => {
                oa == ob && ea == eb
            }
            (
                Expr::Contains {
                    list: la,
                    item: ia,
                },
                Expr::Contains {
                    list: lb,
                    item: ib,
                },
            ) => la == lb && ia == ib,
            (
                Expr::Call {
                    function: fa,
                    args: aa,
                },
                Expr::Call {
                    function: fb,
                    args: ab,
                },
            ) => fa.name == fb.name && fa.template == fb.template && aa == ab,
            (
                Expr::Conditional {
                    test: ta,
                    if_true: ya,
                    if_false: na,
                },
                Expr::Conditional {
                    test: tb,
                    if_true: yb,
                    if_false: nb,
                },
            ) => ta == tb && ya == yb && na == nb,
            _ => false,
        }
    }
}

impl Eq for Expr {}

impl Hash for Expr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Expr::Parameter => state.write_u8(0),
            // Constants and captured closures hash alike so equal values collide.
            Expr::Constant(v) => {
                state.write_u8(1);
                v.hash(state);
            }
            Expr::Captured(c) => {
                state.write_u8(1);
                Expr::captured_value(c).hash(state);
            }
            Expr::Member { target, name } => {
                state.write_u8(2);
                name.hash(state);
                target.hash(state);
            }
            Expr::Binary { op, left, right } => {
                state.write_u8(3);
                op.hash(state);
                left.hash(state);
                right.hash(state);
            }
            Expr::Unary { op, expr } => {
                state.write_u8(4);
                op.hash(state);
                expr.hash(state);
            }
            Expr::Contains { list, item } => {
                state.write_u8(5);
                list.hash(state);
                item.hash(state);
            }
            Expr::Call { function, args } => {
                state.write_u8(6);
                function.name.hash(state);
                function.template.hash(state);
                args.hash(state);
            }
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => {
                state.write_u8(7);
                test.hash(state);
                if_true.hash(state);
                if_false.hash(state);
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Parameter => write!(f, "x"),
            Expr::Constant(v) => write!(f, "{}", v),
            Expr::Captured(c) => write!(f, "<{}>", c.name),
            Expr::Member { target, name } => write!(f, "{}.{}", target, name),
            Expr::Binary { op, left, right } => {
                write!(f, "({} {} {})", left, op.symbol(), right)
            }
            Expr::Unary {
                op: UnaryOp::Not,
                expr,
            } => write!(f, "!{}", expr),
            Expr::Unary {
                op: UnaryOp::Neg,
                expr,
            } => write!(f, "-{}", expr),
            Expr::Contains { list, item } => write!(f, "{}.contains({})", list, item),
            Expr::Call { function, args } => {
                write!(f, "{}(", function.name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => write!(f, "({} ? {} : {})", test, if_true, if_false),
        }
    }
}

impl From<Value> for Expr {
    fn from(value: Value) -> Self {
        Expr::Constant(value)
    }
}

impl From<bool> for Expr {
    fn from(value: bool) -> Self {
        Expr::Constant(Value::Bool(value))
    }
}

impl From<i32> for Expr {
    fn from(value: i32) -> Self {
        Expr::Constant(Value::Int(value))
    }
}

impl From<i64> for Expr {
    fn from(value: i64) -> Self {
        Expr::Constant(Value::BigInt(value))
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::Constant(Value::Double(value))
    }
}

impl From<&str> for Expr {
    fn from(value: &str) -> Self {
        Expr::Constant(Value::from(value))
    }
}

impl From<String> for Expr {
    fn from(value: String) -> Self {
        Expr::Constant(Value::Text(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[test]
    fn display_reads_like_a_lambda() {
        let expr = Expr::field("team")
            .member("name")
            .eq("core")
            .and(Expr::field("age").ge(18).not());
        assert_eq!(
            expr.to_string(),
            "((x.team.name == 'core') && !(x.age >= 18))"
        );
    }

    #[test]
    fn referenced_properties_are_own_properties() {
        let expr = Expr::field("team")
            .member("name")
            .eq("core")
            .or(Expr::field("age").gt(Expr::field("min_age")))
            .or(Expr::field("age").lt(3));
        assert_eq!(
            expr.referenced_properties(),
            vec!["team".to_string(), "age".to_string(), "min_age".to_string()]
        );
        assert_eq!(
            Expr::field("team").member("name").member_path(),
            Some(vec!["team", "name"])
        );
        assert_eq!(Expr::lit(1).member_path(), None);
    }

    #[test]
    fn structural_equality_includes_constants() {
        let a = Expr::field("name").eq("x");
        let b = Expr::field("name").eq("x");
        let c = Expr::field("name").eq("y");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn captured_values_compare_by_value() {
        static LIMIT: AtomicI64 = AtomicI64::new(5);
        let captured = Expr::field("age").lt(Expr::captured("limit", || {
            Value::BigInt(LIMIT.load(Ordering::SeqCst))
        }));
        assert_eq!(captured, Expr::field("age").lt(5_i64));

        let folded = captured.fold_constants().unwrap();
        LIMIT.store(9, Ordering::SeqCst);
        assert_eq!(folded, Expr::field("age").lt(5_i64));
        assert!(folded.uses_parameter());
    }

    #[test]
    fn folding_evaluates_parameter_free_arithmetic() {
        let expr = Expr::field("age").gt(Expr::lit(40).add(2));
        let folded = expr.fold_constants().unwrap();
        assert_eq!(folded, Expr::field("age").gt(Expr::lit(Value::BigInt(42))));
    }
}
