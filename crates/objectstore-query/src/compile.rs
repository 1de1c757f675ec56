//! In-memory evaluation of expressions against live objects.
//!
//! Expressions compile once into closure trees. Predicates are rewritten so
//! that every navigation chain used in a comparison, call or containment
//! test is guarded (`x.team != null && x.team.name == "a"`), which makes a
//! missing related object evaluate to `false` instead of failing.

use std::cmp::Ordering;
use std::sync::Arc;

use objectstore_core::{EntityRef, Error, Result, TranslationErrorKind, Value};

use crate::expr::{BinaryOp, Expr, UnaryOp};

/// Result of evaluating a node: a plain value or a (possibly missing) object.
#[derive(Debug, Clone)]
pub enum Eval {
    Value(Value),
    Object(Option<EntityRef>),
}

impl Eval {
    fn into_value(self, expr: &Expr) -> Result<Value> {
        match self {
            Eval::Value(v) => Ok(v),
            Eval::Object(None) => Ok(Value::Null),
            Eval::Object(Some(_)) => Err(Error::translation(
                TranslationErrorKind::Unsupported,
                expr,
                "an object cannot be used as a value",
            )),
        }
    }

    fn is_null(&self) -> bool {
        matches!(self, Eval::Value(Value::Null) | Eval::Object(None))
    }
}

pub type Compiled = Arc<dyn Fn(&EntityRef) -> Result<Eval> + Send + Sync>;

/// Compiled boolean predicate.
pub type Predicate = Arc<dyn Fn(&EntityRef) -> Result<bool> + Send + Sync>;

/// Compiled sort-key selector. Missing navigation targets yield NULL.
pub type Selector = Arc<dyn Fn(&EntityRef) -> Result<Value> + Send + Sync>;

/// Compile a boolean predicate with null-safe navigation.
pub fn compile_predicate(expr: &Expr) -> Result<Predicate> {
    let guarded = guard_navigation(expr);
    let compiled = compile(&guarded, false)?;
    let source = guarded.clone();
    Ok(Arc::new(move |object| {
        let value = compiled(object)?.into_value(&source)?;
        truthy(&value, &source)
    }))
}

/// Compile a value selector; navigating through a missing object yields NULL.
pub fn compile_selector(expr: &Expr) -> Result<Selector> {
    let compiled = compile(expr, true)?;
    let source = expr.clone();
    Ok(Arc::new(move |object| compiled(object)?.into_value(&source)))
}

/// Evaluate a parameter-free expression.
pub fn evaluate_constant(expr: &Expr) -> Result<Value> {
    match expr {
        Expr::Constant(v) => Ok(v.clone()),
        Expr::Captured(c) => Ok((c.eval)()),
        Expr::Binary { op, left, right } => {
            let l = evaluate_constant(left)?;
            if op.is_logical() {
                let lb = truthy(&l, left)?;
                if (*op == BinaryOp::And && !lb) || (*op == BinaryOp::Or && lb) {
                    return Ok(Value::Bool(lb));
                }
                return Ok(Value::Bool(truthy(&evaluate_constant(right)?, right)?));
            }
            let r = evaluate_constant(right)?;
            binary(*op, &Eval::Value(l), &Eval::Value(r), expr)
        }
        Expr::Unary { op, expr: inner } => unary(*op, evaluate_constant(inner)?, inner),
        Expr::Contains { list, item } => {
            let list_value = evaluate_constant(list)?;
            contains(&list_value, &evaluate_constant(item)?, list)
        }
        Expr::Call { function, args } => {
            let Some(eval) = &function.eval else {
                return Err(Error::translation(
                    TranslationErrorKind::Unsupported,
                    expr,
                    format!("function '{}' has no in-memory implementation", function.name),
                ));
            };
            let values = args
                .iter()
                .map(evaluate_constant)
                .collect::<Result<Vec<_>>>()?;
            eval(&values)
        }
        Expr::Conditional {
            test,
            if_true,
            if_false,
        } => {
            if truthy(&evaluate_constant(test)?, test)? {
                evaluate_constant(if_true)
            } else {
                evaluate_constant(if_false)
            }
        }
        Expr::Parameter | Expr::Member { .. } => Err(Error::translation(
            TranslationErrorKind::Unsupported,
            expr,
            "expression depends on the query parameter",
        )),
    }
}

fn truthy(value: &Value, expr: &Expr) -> Result<bool> {
    match value {
        Value::Null => Ok(false),
        other => other.as_bool().ok_or_else(|| {
            Error::translation(
                TranslationErrorKind::Unsupported,
                expr,
                format!("expected a boolean, found {}", other.type_name()),
            )
        }),
    }
}

/// Prefixes of every navigation chain in `expr` (`x.team` for
/// `x.team.name`), outermost first, without duplicates.
fn navigation_prefixes(expr: &Expr, out: &mut Vec<Expr>) {
    match expr {
        Expr::Member { target, .. } => {
            if matches!(target.as_ref(), Expr::Member { .. }) {
                navigation_prefixes(target, out);
                if !out.contains(target) {
                    out.push(target.as_ref().clone());
                }
            }
        }
        Expr::Binary { left, right, .. } => {
            navigation_prefixes(left, out);
            navigation_prefixes(right, out);
        }
        Expr::Unary { expr, .. } => navigation_prefixes(expr, out),
        Expr::Contains { list, item } => {
            navigation_prefixes(list, out);
            navigation_prefixes(item, out);
        }
        Expr::Call { args, .. } => {
            for arg in args {
                navigation_prefixes(arg, out);
            }
        }
        Expr::Conditional {
            test,
            if_true,
            if_false,
        } => {
            navigation_prefixes(test, out);
            navigation_prefixes(if_true, out);
            navigation_prefixes(if_false, out);
        }
        Expr::Parameter | Expr::Constant(_) | Expr::Captured(_) => {}
    }
}

fn with_guards(expr: &Expr) -> Expr {
    let mut prefixes = Vec::new();
    navigation_prefixes(expr, &mut prefixes);
    prefixes
        .into_iter()
        .rev()
        .fold(expr.clone(), |guarded, prefix| prefix.is_not_null().and(guarded))
}

/// Rewrite comparisons, calls and containment tests over navigation
/// chains into null-guarded conjunctions.
pub fn guard_navigation(expr: &Expr) -> Expr {
    match expr {
        Expr::Binary { op, left, right } if op.is_logical() => Expr::Binary {
            op: *op,
            left: Box::new(guard_navigation(left)),
            right: Box::new(guard_navigation(right)),
        },
        Expr::Unary {
            op: UnaryOp::Not,
            expr: inner,
        } => guard_navigation(inner).not(),
        Expr::Binary { .. } | Expr::Call { .. } | Expr::Contains { .. } | Expr::Member { .. } => {
            with_guards(expr)
        }
        other => other.clone(),
    }
}

fn compile(expr: &Expr, null_safe: bool) -> Result<Compiled> {
    if !expr.uses_parameter() {
        let value = evaluate_constant(expr)?;
        return Ok(Arc::new(move |_| Ok(Eval::Value(value.clone()))));
    }
    let source = expr.clone();
    Ok(match expr {
        Expr::Parameter => Arc::new(|object| Ok(Eval::Object(Some(Arc::clone(object))))),
        Expr::Member { target, name } => {
            let target = compile(target, null_safe)?;
            let name = Arc::clone(name);
            Arc::new(move |object| match target(object)? {
                Eval::Object(Some(owner)) => {
                    let mapping = owner.mapping();
                    if mapping.field_index(&name).is_some() {
                        owner.get(&name).map(Eval::Value)
                    } else if mapping.foreign(&name).is_some() {
                        owner.navigate(&name).map(Eval::Object)
                    } else {
                        Err(Error::translation(
                            TranslationErrorKind::UnknownMember,
                            &source,
                            format!("'{}' has no member '{}'", mapping.table(), name),
                        ))
                    }
                }
                Eval::Object(None) if null_safe => Ok(Eval::Value(Value::Null)),
                Eval::Object(None) => Err(Error::state(format!(
                    "null reference reading '{}' in `{}`",
                    name, source
                ))),
                Eval::Value(_) => Err(Error::translation(
                    TranslationErrorKind::Unsupported,
                    &source,
                    "member access on a plain value",
                )),
            })
        }
        Expr::Binary { op, left, right } => {
            let op = *op;
            let l = compile(left, null_safe)?;
            let r = compile(right, null_safe)?;
            if op.is_logical() {
                let (left_src, right_src) = (left.as_ref().clone(), right.as_ref().clone());
                Arc::new(move |object| {
                    let lb = truthy(&l(object)?.into_value(&left_src)?, &left_src)?;
                    if (op == BinaryOp::And && !lb) || (op == BinaryOp::Or && lb) {
                        return Ok(Eval::Value(Value::Bool(lb)));
                    }
                    let rb = truthy(&r(object)?.into_value(&right_src)?, &right_src)?;
                    Ok(Eval::Value(Value::Bool(rb)))
                })
            } else {
                Arc::new(move |object| {
                    let lv = l(object)?;
                    let rv = r(object)?;
                    binary(op, &lv, &rv, &source).map(Eval::Value)
                })
            }
        }
        Expr::Unary { op, expr: inner } => {
            let op = *op;
            let compiled = compile(inner, null_safe)?;
            let inner_src = inner.as_ref().clone();
            Arc::new(move |object| {
                let value = compiled(object)?.into_value(&inner_src)?;
                unary(op, value, &inner_src).map(Eval::Value)
            })
        }
        Expr::Contains { list, item } => {
            let list_c = compile(list, null_safe)?;
            let item_c = compile(item, null_safe)?;
            let (list_src, item_src) = (list.as_ref().clone(), item.as_ref().clone());
            Arc::new(move |object| {
                let list_value = list_c(object)?.into_value(&list_src)?;
                let item_value = item_c(object)?.into_value(&item_src)?;
                contains(&list_value, &item_value, &list_src).map(Eval::Value)
            })
        }
        Expr::Call { function, args } => {
            let Some(eval) = function.eval.clone() else {
                return Err(Error::translation(
                    TranslationErrorKind::Unsupported,
                    expr,
                    format!("function '{}' has no in-memory implementation", function.name),
                ));
            };
            let compiled = args
                .iter()
                .map(|a| compile(a, null_safe).map(|c| (c, a.clone())))
                .collect::<Result<Vec<_>>>()?;
            Arc::new(move |object| {
                let values = compiled
                    .iter()
                    .map(|(c, src)| c(object)?.into_value(src))
                    .collect::<Result<Vec<_>>>()?;
                eval(&values).map(Eval::Value)
            })
        }
        Expr::Conditional {
            test,
            if_true,
            if_false,
        } => {
            let t = compile(test, null_safe)?;
            let y = compile(if_true, null_safe)?;
            let n = compile(if_false, null_safe)?;
            let test_src = test.as_ref().clone();
            Arc::new(move |object| {
                if truthy(&t(object)?.into_value(&test_src)?, &test_src)? {
                    y(object)
                } else {
                    n(object)
                }
            })
        }
        Expr::Constant(_) | Expr::Captured(_) => {
            let value = evaluate_constant(expr)?;
            Arc::new(move |_| Ok(Eval::Value(value.clone())))
        }
    })
}

fn binary(op: BinaryOp, left: &Eval, right: &Eval, expr: &Expr) -> Result<Value> {
    if matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
        let equal = match (left, right) {
            (Eval::Object(Some(a)), Eval::Object(Some(b))) => Arc::ptr_eq(a, b),
            (a, b) if a.is_null() || b.is_null() => a.is_null() && b.is_null(),
            (Eval::Value(a), Eval::Value(b)) => a == b,
            _ => false,
        };
        return Ok(Value::Bool(equal == (op == BinaryOp::Eq)));
    }
    let l = left.clone().into_value(expr)?;
    let r = right.clone().into_value(expr)?;
    if op.is_comparison() {
        // Ordered comparisons with NULL are false, like lifted operators.
        if l.is_null() || r.is_null() {
            return Ok(Value::Bool(false));
        }
        let ord = l.compare(&r);
        let result = match op {
            BinaryOp::Lt => ord == Ordering::Less,
            BinaryOp::Le => ord != Ordering::Greater,
            BinaryOp::Gt => ord == Ordering::Greater,
            _ => ord != Ordering::Less,
        };
        return Ok(Value::Bool(result));
    }
    arithmetic(op, &l, &r, expr)
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value, expr: &Expr) -> Result<Value> {
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    if let (BinaryOp::Add, Value::Text(a), Value::Text(b)) = (op, l, r) {
        return Ok(Value::Text(format!("{}{}", a, b)));
    }
    let overflow = || {
        Error::translation(
            TranslationErrorKind::Unsupported,
            expr,
            "integer overflow or division by zero",
        )
    };
    if let (Some(a), Some(b)) = (integer(l), integer(r)) {
        let result = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div => a.checked_div(b),
            _ => a.checked_rem(b),
        };
        return result.map(Value::BigInt).ok_or_else(overflow);
    }
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => Ok(Value::Double(match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            _ => a % b,
        })),
        _ => Err(Error::translation(
            TranslationErrorKind::Unsupported,
            expr,
            format!(
                "operator `{}` cannot combine {} and {}",
                op.symbol(),
                l.type_name(),
                r.type_name()
            ),
        )),
    }
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::TinyInt(_) | Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_) => {
            value.as_i64()
        }
        _ => None,
    }
}

fn unary(op: UnaryOp, value: Value, expr: &Expr) -> Result<Value> {
    match op {
        UnaryOp::Not => {
            if value.is_null() {
                return Ok(Value::Null);
            }
            Ok(Value::Bool(!truthy(&value, expr)?))
        }
        UnaryOp::Neg => match value {
            Value::Null => Ok(Value::Null),
            v => {
                if let Some(i) = integer(&v) {
                    return i.checked_neg().map(Value::BigInt).ok_or_else(|| {
                        Error::translation(TranslationErrorKind::Unsupported, expr, "integer overflow")
                    });
                }
                v.as_f64().map(|f| Value::Double(-f)).ok_or_else(|| {
                    Error::translation(
                        TranslationErrorKind::Unsupported,
                        expr,
                        format!("cannot negate {}", v.type_name()),
                    )
                })
            }
        },
    }
}

fn contains(list: &Value, item: &Value, expr: &Expr) -> Result<Value> {
    let items = list.as_array().ok_or_else(|| {
        Error::translation(
            TranslationErrorKind::Unsupported,
            expr,
            format!("contains needs a list, found {}", list.type_name()),
        )
    })?;
    Ok(Value::Bool(items.contains(item)))
}
