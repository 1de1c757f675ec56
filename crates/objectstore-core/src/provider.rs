//! Database provider capability.
//!
//! A provider opens connections, renders per-object commands for its dialect
//! and combines queued commands into one batch. Connections are blocking: an
//! `execute` call returns a reader over every result set of the command.

use std::collections::VecDeque;

use crate::Result;
use crate::command::{Command, CommandBuilder, Dialect};
use crate::entity::CommandKind;
use crate::mapping::TableMapping;
use crate::row::ResultSet;

/// Source of database connections and command builders.
pub trait DatabaseProvider: Send + Sync {
    /// Stable name; worker queues are keyed by (name, connection string).
    fn name(&self) -> &str;

    fn dialect(&self) -> Dialect;

    /// Open a new physical connection.
    fn connect(&self, connection_string: &str) -> Result<Box<dyn DbConnection>>;

    fn command_builder(&self, mapping: &TableMapping, kind: CommandKind) -> CommandBuilder {
        CommandBuilder::new(self.dialect(), mapping.table(), kind)
    }

    /// Merge commands into one multi-statement command.
    fn combine(&self, commands: &[Command]) -> Result<Command> {
        Command::combine(commands)
    }

    /// Called once for every connection the pool opens.
    fn on_connection_opened(&self, _connection: &mut dyn DbConnection) -> Result<()> {
        Ok(())
    }
}

/// One open database connection.
pub trait DbConnection: Send {
    fn execute(&mut self, command: &Command) -> Result<Box<dyn DataReader + '_>>;

    fn close(&mut self) -> Result<()>;
}

/// Successive result sets of one executed command.
pub trait DataReader {
    /// The next result set, or `None` once every statement has been read.
    fn next_result(&mut self) -> Result<Option<ResultSet>>;
}

/// A reader over result sets already materialized in memory.
#[derive(Debug, Default)]
pub struct BufferedReader {
    sets: VecDeque<ResultSet>,
}

impl BufferedReader {
    pub fn new(sets: impl IntoIterator<Item = ResultSet>) -> Self {
        Self {
            sets: sets.into_iter().collect(),
        }
    }
}

impl DataReader for BufferedReader {
    fn next_result(&mut self) -> Result<Option<ResultSet>> {
        Ok(self.sets.pop_front())
    }
}
