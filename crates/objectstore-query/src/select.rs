//! SELECT command assembly for an analyzed context.

use objectstore_core::{Command, Dialect, MappingRegistry, Result};
use tracing::trace;

use crate::clause::OrderDirection;
use crate::context::QueryContext;
use crate::join::ROOT_ALIAS;
use crate::translate::SqlTranslator;

/// Render the SELECT that loads every row of `context`.
///
/// Columns come from the root table only (`t0.*`); navigation targets are
/// joined for filtering and ordering and loaded separately on access.
pub fn select_command(
    dialect: Dialect,
    registry: &MappingRegistry,
    context: &QueryContext,
) -> Result<Command> {
    let mapping = context.mapping();
    let mut translator = SqlTranslator::new(dialect, registry, mapping);

    let mut conditions = Vec::with_capacity(context.predicates().len());
    for predicate in context.predicates() {
        conditions.push(translator.condition(predicate)?);
    }
    let mut order = Vec::with_capacity(context.order().len());
    for item in context.order() {
        let key = translator.value(item.expr())?;
        order.push(match item.direction() {
            OrderDirection::Asc => key,
            OrderDirection::Desc => format!("{} DESC", key),
        });
    }

    let (joins, params) = translator.into_parts();
    let mut sql = String::from("SELECT ");
    if let (Dialect::SqlServer, Some(n)) = (dialect, context.top()) {
        sql.push_str(&format!("TOP ({}) ", n));
    }
    sql.push_str(&format!(
        "{}.* FROM {} AS {}",
        ROOT_ALIAS,
        dialect.quote_identifier(mapping.table()),
        ROOT_ALIAS
    ));
    if !joins.is_empty() {
        sql.push(' ');
        sql.push_str(&joins.to_sql());
    }
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    if !order.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&order.join(", "));
    }
    if let (Dialect::Sqlite, Some(n)) = (dialect, context.top()) {
        sql.push_str(&format!(" LIMIT {}", n));
    }

    trace!(context = context.id(), sql = %sql, "rendered select");
    let mut command = Command::new(sql);
    command.params = params;
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextRegistry, QueryExpr};
    use crate::expr::Expr;
    use crate::test_support::registry;
    use objectstore_core::Value;

    #[test]
    fn whole_table() {
        let registry = registry();
        let contexts = ContextRegistry::new();
        let users = registry.get("users").unwrap();
        let ctx = contexts.analyse(&QueryExpr::table(&users)).unwrap();
        let command = select_command(Dialect::Sqlite, &registry, &ctx).unwrap();
        assert_eq!(command.text, "SELECT t0.* FROM \"users\" AS t0");
        assert!(command.params.is_empty());
    }

    #[test]
    fn filtered_ordered_and_limited() {
        let registry = registry();
        let contexts = ContextRegistry::new();
        let users = registry.get("users").unwrap();
        let query = QueryExpr::table(&users)
            .filter(Expr::field("age").ge(18))
            .filter(Expr::field("team").member("name").eq("core"))
            .order_by_desc(Expr::field("age"))
            .then_by(Expr::field("team").member("name"))
            .take(10);
        let ctx = contexts.analyse(&query).unwrap();

        let command = select_command(Dialect::Sqlite, &registry, &ctx).unwrap();
        assert_eq!(
            command.text,
            "SELECT t0.* FROM \"users\" AS t0 \
             LEFT JOIN \"teams\" AS j1 ON j1.\"id\" = t0.\"team\" \
             WHERE t0.\"age\" >= @p0 AND j1.\"name\" = @p1 \
             ORDER BY t0.\"age\" DESC, j1.\"name\" LIMIT 10"
        );
        assert_eq!(command.param_value("p0"), Some(&Value::Int(18)));
        assert_eq!(command.param_value("p1"), Some(&Value::from("core")));

        let command = select_command(Dialect::SqlServer, &registry, &ctx).unwrap();
        assert!(command.text.starts_with("SELECT TOP (10) t0.* FROM [users] AS t0"));
        assert!(!command.text.contains("LIMIT"));
    }
}
