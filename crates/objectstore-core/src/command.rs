//! Parameterized commands, dialects and per-object command builders.

use std::fmt;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::entity::CommandKind;
use crate::error::Error;
use crate::value::Value;

/// SQL dialect of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Dialect {
    #[default]
    Sqlite,
    SqlServer,
}

impl Dialect {
    /// Quote an identifier, escaping embedded quote characters.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Sqlite => format!("\"{}\"", name.replace('"', "\"\"")),
            Dialect::SqlServer => format!("[{}]", name.replace(']', "]]")),
        }
    }

    /// Placeholder text for a named parameter.
    pub fn parameter(self, name: &str) -> String {
        format!("@{}", name)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Dialect::Sqlite => "sqlite",
            Dialect::SqlServer => "sqlserver",
        }
    }
}

/// SQL text plus named parameters.
///
/// A combined batch carries several statements; `statements` is the number of
/// result sets its execution yields.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub text: String,
    pub params: Vec<(String, Value)>,
    pub statements: usize,
}

fn param_regex() -> Result<&'static Regex> {
    static PARAM: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    PARAM
        .get_or_init(|| Regex::new(r"@([A-Za-z_][A-Za-z0-9_]*)"))
        .as_ref()
        .map_err(|e| Error::Custom(format!("parameter pattern: {}", e)))
}

impl Command {
    /// A single-statement command without parameters.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Vec::new(),
            statements: 1,
        }
    }

    /// Add a named parameter (without the `@` prefix).
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn param_value(&self, name: &str) -> Option<&Value> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Concatenate commands into one batch, renaming each command's
    /// parameters to `b{index}_{name}` so they never collide.
    pub fn combine(commands: &[Command]) -> Result<Command> {
        if let [single] = commands {
            return Ok(single.clone());
        }
        let pattern = param_regex()?;
        let mut text = String::new();
        let mut params = Vec::new();
        let mut statements = 0;
        for (index, command) in commands.iter().enumerate() {
            if index > 0 {
                text.push_str(";\n");
            }
            let renamed = pattern.replace_all(&command.text, |caps: &Captures<'_>| {
                let name = &caps[1];
                if command.params.iter().any(|(n, _)| n == name) {
                    format!("@b{}_{}", index, name)
                } else {
                    caps[0].to_string()
                }
            });
            text.push_str(&renamed);
            params.extend(
                command
                    .params
                    .iter()
                    .map(|(name, value)| (format!("b{}_{}", index, name), value.clone())),
            );
            statements += command.statements;
        }
        Ok(Command {
            text,
            params,
            statements,
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Collects the columns an object contributes to an insert, update, delete
/// or refresh and renders the statement for its dialect.
///
/// Inserts and updates return the refreshed row (`RETURNING *` or
/// `OUTPUT INSERTED.*`) so generated values can be refilled.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    dialect: Dialect,
    table: String,
    kind: CommandKind,
    sets: Vec<(String, Value)>,
    keys: Vec<(String, Value)>,
}

impl CommandBuilder {
    pub fn new(dialect: Dialect, table: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            dialect,
            table: table.into(),
            kind,
            sets: Vec::new(),
            keys: Vec::new(),
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Column written by an insert or update.
    pub fn set(&mut self, column: impl Into<String>, value: Value) -> &mut Self {
        self.sets.push((column.into(), value));
        self
    }

    /// Key column identifying the row.
    pub fn key(&mut self, column: impl Into<String>, value: Value) -> &mut Self {
        self.keys.push((column.into(), value));
        self
    }

    fn where_clause(&self, params: &mut Vec<(String, Value)>) -> Result<String> {
        if self.keys.is_empty() {
            return Err(Error::state(format!(
                "{:?} on '{}' requires key columns",
                self.kind, self.table
            )));
        }
        let mut parts = Vec::with_capacity(self.keys.len());
        for (i, (column, value)) in self.keys.iter().enumerate() {
            let column = self.dialect.quote_identifier(column);
            if value.is_null() {
                parts.push(format!("{} IS NULL", column));
            } else {
                let name = format!("k{}", i);
                parts.push(format!("{} = {}", column, self.dialect.parameter(&name)));
                params.push((name, value.clone()));
            }
        }
        Ok(parts.join(" AND "))
    }

    pub fn build(&self) -> Result<Command> {
        let d = self.dialect;
        let table = d.quote_identifier(&self.table);
        let mut params = Vec::new();
        let text = match self.kind {
            CommandKind::Insert => {
                let output = match d {
                    Dialect::Sqlite => "",
                    Dialect::SqlServer => " OUTPUT INSERTED.*",
                };
                let returning = match d {
                    Dialect::Sqlite => " RETURNING *",
                    Dialect::SqlServer => "",
                };
                if self.sets.is_empty() {
                    format!("INSERT INTO {}{} DEFAULT VALUES{}", table, output, returning)
                } else {
                    let mut columns = Vec::with_capacity(self.sets.len());
                    let mut values = Vec::with_capacity(self.sets.len());
                    for (i, (column, value)) in self.sets.iter().enumerate() {
                        let name = format!("p{}", i);
                        columns.push(d.quote_identifier(column));
                        values.push(d.parameter(&name));
                        params.push((name, value.clone()));
                    }
                    format!(
                        "INSERT INTO {} ({}){} VALUES ({}){}",
                        table,
                        columns.join(", "),
                        output,
                        values.join(", "),
                        returning
                    )
                }
            }
            CommandKind::Update if !self.sets.is_empty() => {
                let mut assignments = Vec::with_capacity(self.sets.len());
                for (i, (column, value)) in self.sets.iter().enumerate() {
                    let name = format!("p{}", i);
                    assignments.push(format!(
                        "{} = {}",
                        d.quote_identifier(column),
                        d.parameter(&name)
                    ));
                    params.push((name, value.clone()));
                }
                let filter = self.where_clause(&mut params)?;
                match d {
                    Dialect::Sqlite => format!(
                        "UPDATE {} SET {} WHERE {} RETURNING *",
                        table,
                        assignments.join(", "),
                        filter
                    ),
                    Dialect::SqlServer => format!(
                        "UPDATE {} SET {} OUTPUT INSERTED.* WHERE {}",
                        table,
                        assignments.join(", "),
                        filter
                    ),
                }
            }
            // An update with nothing to write refreshes the row.
            CommandKind::Update | CommandKind::Select => {
                let filter = self.where_clause(&mut params)?;
                format!("SELECT * FROM {} WHERE {}", table, filter)
            }
            CommandKind::Delete => {
                let filter = self.where_clause(&mut params)?;
                format!("DELETE FROM {} WHERE {}", table, filter)
            }
        };
        Ok(Command {
            text,
            params,
            statements: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_per_dialect() {
        assert_eq!(Dialect::Sqlite.quote_identifier("a\"b"), "\"a\"\"b\"");
        assert_eq!(Dialect::SqlServer.quote_identifier("a]b"), "[a]]b]");
        assert_eq!(Dialect::SqlServer.parameter("p0"), "@p0");
    }

    #[test]
    fn insert_returns_row() {
        let mut builder = CommandBuilder::new(Dialect::Sqlite, "users", CommandKind::Insert);
        builder.set("name", Value::from("x")).set("age", Value::Int(3));
        let cmd = builder.build().unwrap();
        assert_eq!(
            cmd.text,
            "INSERT INTO \"users\" (\"name\", \"age\") VALUES (@p0, @p1) RETURNING *"
        );
        assert_eq!(cmd.param_value("p1"), Some(&Value::Int(3)));

        let mut builder = CommandBuilder::new(Dialect::SqlServer, "users", CommandKind::Insert);
        builder.set("name", Value::from("x"));
        assert_eq!(
            builder.build().unwrap().text,
            "INSERT INTO [users] ([name]) OUTPUT INSERTED.* VALUES (@p0)"
        );
    }

    #[test]
    fn update_and_delete_need_keys() {
        let mut builder = CommandBuilder::new(Dialect::Sqlite, "users", CommandKind::Update);
        builder.set("name", Value::from("y"));
        assert!(builder.build().is_err());
        builder.key("id", Value::Int(1));
        assert_eq!(
            builder.build().unwrap().text,
            "UPDATE \"users\" SET \"name\" = @p0 WHERE \"id\" = @k0 RETURNING *"
        );

        let mut builder = CommandBuilder::new(Dialect::SqlServer, "users", CommandKind::Delete);
        builder.key("id", Value::Int(1)).key("org", Value::Null);
        assert_eq!(
            builder.build().unwrap().text,
            "DELETE FROM [users] WHERE [id] = @k0 AND [org] IS NULL"
        );
    }

    #[test]
    fn empty_update_refreshes() {
        let mut builder = CommandBuilder::new(Dialect::Sqlite, "users", CommandKind::Update);
        builder.key("id", Value::Int(1));
        assert_eq!(
            builder.build().unwrap().text,
            "SELECT * FROM \"users\" WHERE \"id\" = @k0"
        );
    }

    #[test]
    fn combine_renames_parameters() {
        let a = Command::new("SELECT * FROM t WHERE a = @p0").param("p0", 1);
        let b = Command::new("SELECT * FROM t WHERE a = @p0 OR b = @other").param("p0", 2);
        let combined = Command::combine(&[a, b]).unwrap();
        assert_eq!(
            combined.text,
            "SELECT * FROM t WHERE a = @b0_p0;\nSELECT * FROM t WHERE a = @b1_p0 OR b = @other"
        );
        assert_eq!(combined.statements, 2);
        assert_eq!(combined.param_value("b0_p0"), Some(&Value::Int(1)));
        assert_eq!(combined.param_value("b1_p0"), Some(&Value::Int(2)));

        let single = Command::new("SELECT 1").param("p0", 5);
        assert_eq!(Command::combine(std::slice::from_ref(&single)).unwrap(), single);
    }
}
