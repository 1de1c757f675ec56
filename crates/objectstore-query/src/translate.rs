//! Expression-to-SQL translation.
//!
//! A recursive walk renders predicates and order keys as SQL over the root
//! alias `t0`, acquiring joins for navigation paths and turning every
//! parameter-free subexpression into a named parameter. Anything without a
//! rule fails with a [`TranslationErrorKind`] naming the offending
//! subexpression; there is no fallback to in-memory evaluation.

use std::sync::{Arc, OnceLock};

use objectstore_core::{
    Dialect, Error, MappingRegistry, Result, TableMapping, TranslationErrorKind, Value,
};
use regex::{Captures, Regex};

use crate::compile::evaluate_constant;
use crate::expr::{BinaryOp, Expr, SqlFunction, UnaryOp};
use crate::join::JoinSet;

fn slot_regex() -> Result<&'static Regex> {
    static SLOT: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    SLOT.get_or_init(|| Regex::new(r"\{(\d+)\}"))
        .as_ref()
        .map_err(|e| Error::Custom(format!("template slot pattern: {}", e)))
}

// Parentheses nest and close outside quoted literals, and every quote closes.
fn template_is_balanced(template: &str) -> bool {
    let mut depth = 0_usize;
    let mut quote: Option<char> = None;
    for c in template.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => match depth.checked_sub(1) {
                Some(d) => depth = d,
                None => return false,
            },
            (None, _) => {}
        }
    }
    depth == 0 && quote.is_none()
}

/// Translator state for one statement: its joins and parameters.
pub struct SqlTranslator<'r> {
    dialect: Dialect,
    registry: &'r MappingRegistry,
    joins: JoinSet,
    params: Vec<(String, Value)>,
}

impl<'r> SqlTranslator<'r> {
    pub fn new(dialect: Dialect, registry: &'r MappingRegistry, root: &Arc<TableMapping>) -> Self {
        Self {
            dialect,
            registry,
            joins: JoinSet::new(dialect, root),
            params: Vec::new(),
        }
    }

    pub fn joins(&self) -> &JoinSet {
        &self.joins
    }

    pub fn params(&self) -> &[(String, Value)] {
        &self.params
    }

    pub fn into_parts(self) -> (JoinSet, Vec<(String, Value)>) {
        (self.joins, self.params)
    }

    fn unsupported(expr: &Expr, message: impl Into<String>) -> Error {
        Error::translation(TranslationErrorKind::Unsupported, expr, message)
    }

    fn bind(&mut self, value: Value) -> String {
        let name = format!("p{}", self.params.len());
        let placeholder = self.dialect.parameter(&name);
        self.params.push((name, value));
        placeholder
    }

    /// Translate a boolean condition.
    pub fn condition(&mut self, expr: &Expr) -> Result<String> {
        if !expr.uses_parameter() {
            return match evaluate_constant(expr)? {
                Value::Bool(true) => Ok("(1=1)".to_string()),
                Value::Bool(false) | Value::Null => Ok("(1=0)".to_string()),
                other => Err(Self::unsupported(
                    expr,
                    format!("{} is not a condition", other.type_name()),
                )),
            };
        }
        match expr {
            Expr::Binary { op, left, right } if op.is_logical() => {
                let keyword = if *op == BinaryOp::And { "AND" } else { "OR" };
                let l = self.condition(left)?;
                let r = self.condition(right)?;
                Ok(format!("({} {} {})", l, keyword, r))
            }
            Expr::Binary { op, left, right } if op.is_comparison() => {
                self.comparison(*op, left, right)
            }
            Expr::Unary {
                op: UnaryOp::Not,
                expr: inner,
            } => match inner.as_ref() {
                Expr::Contains { list, item } => self.contains(inner, list, item, true),
                other => Ok(format!("NOT {}", self.condition(other)?)),
            },
            Expr::Contains { list, item } => self.contains(expr, list, item, false),
            Expr::Member { .. } => {
                let column = self.column(expr)?;
                let truth = self.bind(Value::Bool(true));
                Ok(format!("{} = {}", column, truth))
            }
            Expr::Call { .. } => self.value(expr),
            _ => Err(Self::unsupported(expr, "expression is not a condition")),
        }
    }

    fn comparison(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<String> {
        let is_null = |e: &Expr| !e.uses_parameter() && matches!(evaluate_constant(e), Ok(Value::Null));
        if matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
            let other = if is_null(right) {
                Some(left)
            } else if is_null(left) {
                Some(right)
            } else {
                None
            };
            if let Some(other) = other {
                let negate = op == BinaryOp::Ne;
                return self.null_test(other, negate);
            }
        }
        let l = self.value(left)?;
        let r = self.value(right)?;
        Ok(format!("{} {} {}", l, op.as_str(), r))
    }

    /// `IS [NOT] NULL`, using the foreign-key columns for navigation
    /// properties.
    fn null_test(&mut self, expr: &Expr, negate: bool) -> Result<String> {
        let test = if negate { "IS NOT NULL" } else { "IS NULL" };
        if let Some(path) = expr.member_path() {
            let (owner, last) = path.split_at(path.len() - 1);
            let (alias, mapping) = self.joins.resolve(self.registry, owner)?;
            if let Some(relation) = mapping.foreign(last[0]) {
                let mut columns = Vec::with_capacity(relation.columns.len());
                for (local, _) in &relation.columns {
                    let field = mapping.field(local).ok_or_else(|| {
                        Error::mapping(mapping.table(), format!("unknown field '{}'", local))
                    })?;
                    columns.push(format!(
                        "{}.{} {}",
                        alias,
                        self.dialect.quote_identifier(&field.column),
                        test
                    ));
                }
                return Ok(match columns.len() {
                    1 => columns.remove(0),
                    _ if negate => format!("({})", columns.join(" OR ")),
                    _ => format!("({})", columns.join(" AND ")),
                });
            }
        }
        Ok(format!("{} {}", self.value(expr)?, test))
    }

    fn contains(&mut self, expr: &Expr, list: &Expr, item: &Expr, negate: bool) -> Result<String> {
        if list.uses_parameter() {
            return Err(Self::unsupported(expr, "contains needs a constant list"));
        }
        let values = match evaluate_constant(list)? {
            Value::Array(values) => values,
            other => {
                return Err(Self::unsupported(
                    expr,
                    format!("contains needs a list, found {}", other.type_name()),
                ));
            }
        };
        if values.is_empty() {
            return Ok(if negate { "(1=1)" } else { "(1=0)" }.to_string());
        }
        let item = self.value(item)?;
        let placeholders = values
            .into_iter()
            .map(|v| self.bind(v))
            .collect::<Vec<_>>()
            .join(", ");
        let keyword = if negate { "NOT IN" } else { "IN" };
        Ok(format!("{} {} ({})", item, keyword, placeholders))
    }

    /// Translate a scalar expression.
    pub fn value(&mut self, expr: &Expr) -> Result<String> {
        if !expr.uses_parameter() {
            return Ok(match evaluate_constant(expr)? {
                Value::Null => "NULL".to_string(),
                value => self.bind(value),
            });
        }
        match expr {
            Expr::Member { .. } => self.column(expr),
            Expr::Binary { op, left, right } => match op {
                BinaryOp::Add | BinaryOp::Sub => {
                    let l = self.value(left)?;
                    let r = self.value(right)?;
                    Ok(format!("({} {} {})", l, op.as_str(), r))
                }
                _ if op.is_comparison() || op.is_logical() => self.condition(expr),
                _ => Err(Self::unsupported(
                    expr,
                    format!("operator `{}` has no SQL translation", op.symbol()),
                )),
            },
            Expr::Unary { op: UnaryOp::Not, .. } | Expr::Contains { .. } => self.condition(expr),
            Expr::Call { function, args } => self.call(expr, function, args),
            Expr::Unary { op: UnaryOp::Neg, .. } => {
                Err(Self::unsupported(expr, "negation has no SQL translation"))
            }
            Expr::Conditional { .. } => Err(Self::unsupported(
                expr,
                "conditional expressions have no SQL translation",
            )),
            Expr::Parameter => Err(Self::unsupported(
                expr,
                "the query parameter cannot be used as a value",
            )),
            Expr::Constant(_) | Expr::Captured(_) => {
                Err(Self::unsupported(expr, "unexpected constant"))
            }
        }
    }

    /// Column of a member chain such as `x.team.name`, acquiring joins.
    fn column(&mut self, expr: &Expr) -> Result<String> {
        let path = expr.member_path().ok_or_else(|| {
            Self::unsupported(expr, "member access must start at the query parameter")
        })?;
        let (owner, last) = path.split_at(path.len() - 1);
        let (alias, mapping) = self.joins.resolve(self.registry, owner)?;
        match mapping.field(last[0]) {
            Some(field) => Ok(format!(
                "{}.{}",
                alias,
                self.dialect.quote_identifier(&field.column)
            )),
            None if mapping.foreign(last[0]).is_some() => Err(Self::unsupported(
                expr,
                "navigation properties can only be compared with null",
            )),
            None => Err(Error::translation(
                TranslationErrorKind::UnknownMember,
                expr,
                format!("'{}' has no member '{}'", mapping.table(), last[0]),
            )),
        }
    }

    fn call(&mut self, expr: &Expr, function: &SqlFunction, args: &[Expr]) -> Result<String> {
        let Some(template) = &function.template else {
            return Err(Self::unsupported(
                expr,
                format!("function '{}' has no SQL substitution", function.name),
            ));
        };
        let mut rendered = Vec::with_capacity(args.len());
        for arg in args {
            rendered.push(self.value(arg)?);
        }

        if !template_is_balanced(template) {
            return Err(Error::translation(
                TranslationErrorKind::MalformedTemplate,
                expr,
                format!("unbalanced parentheses or quotes in template '{}'", template),
            ));
        }

        let regex = slot_regex()?;
        let mut bad_slot = None;
        let text = regex.replace_all(template, |caps: &Captures<'_>| {
            match caps[1].parse::<usize>().ok().and_then(|i| rendered.get(i)) {
                Some(sql) => sql.clone(),
                None => {
                    bad_slot.get_or_insert_with(|| caps[0].to_string());
                    String::new()
                }
            }
        });
        if let Some(slot) = bad_slot {
            return Err(Error::translation(
                TranslationErrorKind::MalformedTemplate,
                expr,
                format!(
                    "slot {} of '{}' has no argument ({} given)",
                    slot,
                    template,
                    args.len()
                ),
            ));
        }
        if text.contains('{') || text.contains('}') {
            return Err(Error::translation(
                TranslationErrorKind::MalformedTemplate,
                expr,
                format!("unbalanced braces in template '{}'", template),
            ));
        }
        Ok(text.into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::registry;

    fn translate(expr: &Expr) -> Result<(String, Vec<(String, Value)>, String)> {
        let registry = registry();
        let users = registry.get("users")?;
        let mut t = SqlTranslator::new(Dialect::Sqlite, &registry, &users);
        let sql = t.condition(expr)?;
        let joins = t.joins().to_sql();
        let (_, params) = t.into_parts();
        Ok((sql, params, joins))
    }

    #[test]
    fn comparisons_and_constants_become_parameters() {
        let threshold = 17;
        let (sql, params, joins) = translate(
            &Expr::field("age")
                .gt(Expr::captured("threshold", move || threshold.into()).add(1))
                .and(Expr::field("name").ne("bob")),
        )
        .unwrap();
        assert_eq!(sql, "(t0.\"age\" > @p0 AND t0.\"name\" <> @p1)");
        assert_eq!(params[0], ("p0".to_string(), Value::BigInt(18)));
        assert_eq!(params[1].1, Value::from("bob"));
        assert!(joins.is_empty());
    }

    #[test]
    fn null_comparisons() {
        let (sql, params, _) = translate(&Expr::field("name").is_null()).unwrap();
        assert_eq!(sql, "t0.\"name\" IS NULL");
        assert!(params.is_empty());

        let (sql, _, _) = translate(&Expr::null().ne(Expr::field("name"))).unwrap();
        assert_eq!(sql, "t0.\"name\" IS NOT NULL");

        let (sql, _, joins) = translate(&Expr::field("team").is_null()).unwrap();
        assert_eq!(sql, "t0.\"team\" IS NULL");
        assert!(joins.is_empty());
    }

    #[test]
    fn navigation_acquires_one_join_per_path() {
        let (sql, _, joins) = translate(
            &Expr::field("team")
                .member("name")
                .eq("core")
                .or(Expr::field("team").member("name").eq("ops"))
                .and(Expr::field("team").member("owner").member("name").ne("x")),
        )
        .unwrap();
        assert_eq!(
            sql,
            "((j1.\"name\" = @p0 OR j1.\"name\" = @p1) AND j2.\"name\" <> @p2)"
        );
        assert_eq!(
            joins,
            "LEFT JOIN \"teams\" AS j1 ON j1.\"id\" = t0.\"team\" \
             LEFT JOIN \"people\" AS j2 ON j2.\"id\" = j1.\"owner_id\""
        );
    }

    #[test]
    fn contains_and_not_contains() {
        let (sql, params, _) = translate(&Expr::field("id").in_list(vec![1, 2, 3])).unwrap();
        assert_eq!(sql, "t0.\"id\" IN (@p0, @p1, @p2)");
        assert_eq!(params.len(), 3);

        let (sql, _, _) = translate(&Expr::field("id").in_list(vec![1, 2]).not()).unwrap();
        assert_eq!(sql, "t0.\"id\" NOT IN (@p0, @p1)");

        let (sql, _, _) = translate(&Expr::field("id").in_list(Vec::<i32>::new())).unwrap();
        assert_eq!(sql, "(1=0)");
    }

    #[test]
    fn boolean_members_and_negation() {
        let (sql, params, _) = translate(&Expr::field("active").not()).unwrap();
        assert_eq!(sql, "NOT t0.\"active\" = @p0");
        assert_eq!(params[0].1, Value::Bool(true));
    }

    #[test]
    fn substitution_templates() {
        let lower = SqlFunction::new("lower").template("lower({0})").build();
        let (sql, _, _) =
            translate(&Expr::call(&lower, vec![Expr::field("name")]).eq("ann")).unwrap();
        assert_eq!(sql, "lower(t0.\"name\") = @p0");

        let like = SqlFunction::new("like").template("{0} LIKE {1}").build();
        let (sql, params, _) =
            translate(&Expr::call(&like, vec![Expr::field("name"), Expr::lit("a%")])).unwrap();
        assert_eq!(sql, "t0.\"name\" LIKE @p0");
        assert_eq!(params[0].1, Value::from("a%"));

        let broken = SqlFunction::new("broken").template("f({1})").build();
        let err = translate(&Expr::call(&broken, vec![Expr::field("name")]).eq(1)).unwrap_err();
        assert_eq!(err.translation_kind(), Some(TranslationErrorKind::MalformedTemplate));

        let unbalanced = SqlFunction::new("unbalanced").template("f({0}").build();
        let err =
            translate(&Expr::call(&unbalanced, vec![Expr::field("name")]).eq(1)).unwrap_err();
        assert_eq!(err.translation_kind(), Some(TranslationErrorKind::MalformedTemplate));

        for template in ["f({0}))", "{0} = 'x", ")({0}"] {
            let function = SqlFunction::new("bad").template(template).build();
            let err =
                translate(&Expr::call(&function, vec![Expr::field("name")]).eq(1)).unwrap_err();
            assert_eq!(
                err.translation_kind(),
                Some(TranslationErrorKind::MalformedTemplate),
                "{template}"
            );
        }
        let quoted = SqlFunction::new("quoted").template("concat({0}, ')')").build();
        let (sql, _, _) =
            translate(&Expr::call(&quoted, vec![Expr::field("name")]).eq("x")).unwrap();
        assert_eq!(sql, "concat(t0.\"name\", ')') = @p0");
    }

    #[test]
    fn unsupported_shapes_fail_with_the_offending_expression() {
        let err = translate(&Expr::field("age").mul(2).gt(10)).unwrap_err();
        assert_eq!(err.translation_kind(), Some(TranslationErrorKind::Unsupported));
        assert!(err.to_string().contains("(x.age * 2)"));

        let opaque = SqlFunction::new("opaque").eval(|_| Ok(Value::Bool(true))).build();
        let err = translate(&Expr::call(&opaque, vec![Expr::field("age")])).unwrap_err();
        assert_eq!(err.translation_kind(), Some(TranslationErrorKind::Unsupported));

        let err = translate(&Expr::cond(Expr::field("active"), 1, 2).eq(1)).unwrap_err();
        assert_eq!(err.translation_kind(), Some(TranslationErrorKind::Unsupported));

        let err = translate(&Expr::field("missing").eq(1)).unwrap_err();
        assert_eq!(err.translation_kind(), Some(TranslationErrorKind::UnknownMember));
    }

    #[test]
    fn constant_conditions() {
        let (sql, _, _) = translate(&Expr::lit(true).and(Expr::field("age").gt(1))).unwrap();
        assert_eq!(sql, "((1=1) AND t0.\"age\" > @p0)");
    }
}
