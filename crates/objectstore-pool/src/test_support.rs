use std::sync::Arc;

use objectstore_core::error::QueryError;
use objectstore_core::{
    BufferedReader, Command, DataReader, DatabaseProvider, DbConnection, Dialect, Error,
    QueryErrorKind, Result, ResultSet, Value,
};
use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct Counters {
    opened: usize,
    closed: usize,
    hooks: usize,
    executed: Vec<String>,
    fail_on: Option<String>,
    gate_closed: bool,
}

#[derive(Default)]
struct Shared {
    counters: Mutex<Counters>,
    gate: Condvar,
}

/// Echoes every statement back as a one-row result set.
#[derive(Default)]
pub(crate) struct ScriptedProvider {
    shared: Arc<Shared>,
}

impl ScriptedProvider {
    pub(crate) fn shared() -> Arc<ScriptedProvider> {
        Arc::new(ScriptedProvider::default())
    }

    pub(crate) fn opened(&self) -> usize {
        self.shared.counters.lock().opened
    }

    pub(crate) fn closed(&self) -> usize {
        self.shared.counters.lock().closed
    }

    pub(crate) fn hook_calls(&self) -> usize {
        self.shared.counters.lock().hooks
    }

    /// Text of every physical execution.
    pub(crate) fn executed(&self) -> Vec<String> {
        self.shared.counters.lock().executed.clone()
    }

    pub(crate) fn fail_on(&self, fragment: &str) {
        self.shared.counters.lock().fail_on = Some(fragment.to_string());
    }

    /// Hold `connect` until [`open_gate`](Self::open_gate).
    pub(crate) fn close_gate(&self) {
        self.shared.counters.lock().gate_closed = true;
    }

    pub(crate) fn open_gate(&self) {
        self.shared.counters.lock().gate_closed = false;
        self.shared.gate.notify_all();
    }
}

struct EchoConnection {
    shared: Arc<Shared>,
}

impl DatabaseProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn connect(&self, _connection_string: &str) -> Result<Box<dyn DbConnection>> {
        let mut counters = self.shared.counters.lock();
        while counters.gate_closed {
            self.shared.gate.wait(&mut counters);
        }
        counters.opened += 1;
        Ok(Box::new(EchoConnection {
            shared: Arc::clone(&self.shared),
        }))
    }

    fn on_connection_opened(&self, _connection: &mut dyn DbConnection) -> Result<()> {
        self.shared.counters.lock().hooks += 1;
        Ok(())
    }
}

impl DbConnection for EchoConnection {
    fn execute(&mut self, command: &Command) -> Result<Box<dyn DataReader + '_>> {
        let mut counters = self.shared.counters.lock();
        counters.executed.push(command.text.clone());
        if let Some(fragment) = &counters.fail_on {
            if command.text.contains(fragment.as_str()) {
                return Err(Error::Query(QueryError {
                    kind: QueryErrorKind::Database,
                    sql: Some(command.text.clone()),
                    message: format!("scripted failure on '{}'", fragment),
                    source: None,
                }));
            }
        }
        let sets: Vec<ResultSet> = command
            .text
            .split(";\n")
            .map(|statement| {
                ResultSet::from_rows(vec!["sql".into()], vec![vec![Value::from(statement)]])
            })
            .collect();
        Ok(Box::new(BufferedReader::new(sets)))
    }

    fn close(&mut self) -> Result<()> {
        self.shared.counters.lock().closed += 1;
        Ok(())
    }
}
