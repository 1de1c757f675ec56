//! JOINs acquired by navigation paths.
//!
//! Every distinct navigation path (`team`, `team.owner`, ...) inside one
//! translated statement gets exactly one LEFT JOIN. Aliases are assigned in
//! order of first use: `t0` for the root table, then `j1`, `j2`, ...

use std::sync::Arc;

use objectstore_core::{Dialect, Error, MappingRegistry, Result, TableMapping, TranslationErrorKind};

/// Alias of the root table in translated statements.
pub const ROOT_ALIAS: &str = "t0";

/// One LEFT JOIN for a navigation path.
#[derive(Debug, Clone)]
pub struct Join {
    /// Navigation properties from the root, in order
    pub path: Vec<String>,
    pub alias: String,
    pub mapping: Arc<TableMapping>,
    /// ON condition SQL
    pub on: String,
}

impl Join {
    pub fn to_sql(&self, dialect: Dialect) -> String {
        format!(
            "LEFT JOIN {} AS {} ON {}",
            dialect.quote_identifier(self.mapping.table()),
            self.alias,
            self.on
        )
    }
}

/// Joins of one statement, deduplicated by navigation path.
#[derive(Debug, Clone)]
pub struct JoinSet {
    dialect: Dialect,
    root: Arc<TableMapping>,
    joins: Vec<Join>,
}

impl JoinSet {
    pub fn new(dialect: Dialect, root: &Arc<TableMapping>) -> Self {
        Self {
            dialect,
            root: Arc::clone(root),
            joins: Vec::new(),
        }
    }

    pub fn root(&self) -> &Arc<TableMapping> {
        &self.root
    }

    /// Alias and mapping reached by following `path` from the root, adding
    /// a join for every hop not seen yet. An empty path is the root.
    pub fn resolve(
        &mut self,
        registry: &MappingRegistry,
        path: &[&str],
    ) -> Result<(String, Arc<TableMapping>)> {
        let mut alias = ROOT_ALIAS.to_string();
        let mut mapping = Arc::clone(&self.root);
        for (depth, &property) in path.iter().enumerate() {
            let prefix = &path[..=depth];
            if let Some(existing) = self.find(prefix) {
                alias = existing.alias.clone();
                mapping = Arc::clone(&existing.mapping);
                continue;
            }
            let relation = mapping.foreign(property).ok_or_else(|| {
                Error::translation(
                    TranslationErrorKind::UnknownMember,
                    prefix.join("."),
                    format!("'{}' has no navigation property '{}'", mapping.table(), property),
                )
            })?;
            let target = registry.get(&relation.target)?;
            let join_alias = format!("j{}", self.joins.len() + 1);
            let mut conditions = Vec::with_capacity(relation.columns.len());
            for (local, target_property) in &relation.columns {
                let local_column = column_of(&mapping, local)?;
                let target_column = column_of(&target, target_property)?;
                conditions.push(format!(
                    "{}.{} = {}.{}",
                    join_alias,
                    self.dialect.quote_identifier(target_column),
                    alias,
                    self.dialect.quote_identifier(local_column)
                ));
            }
            self.joins.push(Join {
                path: prefix.iter().map(|p| p.to_string()).collect(),
                alias: join_alias.clone(),
                mapping: Arc::clone(&target),
                on: conditions.join(" AND "),
            });
            alias = join_alias;
            mapping = target;
        }
        Ok((alias, mapping))
    }

    fn find(&self, path: &[&str]) -> Option<&Join> {
        self.joins
            .iter()
            .find(|j| j.path.len() == path.len() && j.path.iter().zip(path).all(|(a, b)| a == b))
    }

    pub fn joins(&self) -> &[Join] {
        &self.joins
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// All joins, space separated, in order of acquisition.
    pub fn to_sql(&self) -> String {
        self.joins
            .iter()
            .map(|j| j.to_sql(self.dialect))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn column_of<'m>(mapping: &'m TableMapping, property: &str) -> Result<&'m str> {
    mapping
        .field(property)
        .map(|f| f.column.as_str())
        .ok_or_else(|| {
            Error::mapping(
                mapping.table(),
                format!("relation column '{}' is not a mapped field", property),
            )
        })
}
