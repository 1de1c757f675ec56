//! Scripted in-memory database shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use objectstore::prelude::*;
use objectstore::{BufferedReader, Command, DataReader, DbConnection, Dialect, ResultSet};
use objectstore_core::QueryErrorKind;
use objectstore_core::error::QueryError;
use parking_lot::{Condvar, Mutex};

struct Response {
    fragment: String,
    set: ResultSet,
    once: bool,
}

#[derive(Default)]
struct DbState {
    responses: Vec<Response>,
    executions: Vec<Command>,
    fail_on: Option<String>,
    gate_closed: bool,
    opened: usize,
    closed: usize,
}

#[derive(Default)]
struct Db {
    state: Mutex<DbState>,
    gate: Condvar,
}

/// Provider whose connections answer each statement with the first scripted
/// result set whose fragment the statement contains.
///
/// Unscripted statements return an empty set: zero rows for a `SELECT`, one
/// affected row otherwise.
#[derive(Default)]
pub struct FakeProvider {
    db: Arc<Db>,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer every statement containing `fragment` with `set`. Later
    /// scripts win over earlier ones.
    pub fn respond(&self, fragment: &str, set: ResultSet) {
        self.push(fragment, set, false);
    }

    /// Answer the next statement containing `fragment` with `set`.
    pub fn respond_once(&self, fragment: &str, set: ResultSet) {
        self.push(fragment, set, true);
    }

    fn push(&self, fragment: &str, set: ResultSet, once: bool) {
        self.db.state.lock().responses.push(Response {
            fragment: fragment.to_string(),
            set,
            once,
        });
    }

    /// Fail every execution whose text contains `fragment`.
    pub fn fail_on(&self, fragment: &str) {
        self.db.state.lock().fail_on = Some(fragment.to_string());
    }

    pub fn clear_failure(&self) {
        self.db.state.lock().fail_on = None;
    }

    /// Physical executions, in order.
    pub fn executions(&self) -> Vec<Command> {
        self.db.state.lock().executions.clone()
    }

    pub fn execution_count(&self) -> usize {
        self.db.state.lock().executions.len()
    }

    /// Every statement executed, batches split apart.
    pub fn statements(&self) -> Vec<String> {
        self.db
            .state
            .lock()
            .executions
            .iter()
            .flat_map(|c| c.text.split(";\n").map(str::to_string).collect::<Vec<_>>())
            .collect()
    }

    pub fn opened(&self) -> usize {
        self.db.state.lock().opened
    }

    /// Hold new connections until [`open_gate`](Self::open_gate).
    pub fn close_gate(&self) {
        self.db.state.lock().gate_closed = true;
    }

    pub fn open_gate(&self) {
        self.db.state.lock().gate_closed = false;
        self.db.gate.notify_all();
    }
}

impl DatabaseProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn connect(&self, _connection_string: &str) -> Result<Box<dyn DbConnection>> {
        let mut state = self.db.state.lock();
        while state.gate_closed {
            self.db.gate.wait(&mut state);
        }
        state.opened += 1;
        Ok(Box::new(FakeConnection {
            db: Arc::clone(&self.db),
        }))
    }
}

struct FakeConnection {
    db: Arc<Db>,
}

impl DbState {
    fn answer(&mut self, statement: &str) -> ResultSet {
        if let Some(i) = self
            .responses
            .iter()
            .position(|r| r.once && statement.contains(&r.fragment))
        {
            return self.responses.remove(i).set;
        }
        if let Some(r) = self
            .responses
            .iter()
            .rev()
            .find(|r| !r.once && statement.contains(&r.fragment))
        {
            return r.set.clone();
        }
        if statement.starts_with("SELECT") {
            ResultSet::affected(0)
        } else {
            ResultSet::affected(1)
        }
    }
}

impl DbConnection for FakeConnection {
    fn execute(&mut self, command: &Command) -> Result<Box<dyn DataReader + '_>> {
        let mut state = self.db.state.lock();
        state.executions.push(command.clone());
        if let Some(fragment) = &state.fail_on {
            if command.text.contains(fragment.as_str()) {
                return Err(Error::Query(QueryError {
                    kind: QueryErrorKind::Constraint,
                    sql: Some(command.text.clone()),
                    message: format!("scripted failure on '{}'", fragment),
                    source: None,
                }));
            }
        }
        let sets: Vec<ResultSet> = command
            .text
            .split(";\n")
            .map(|statement| state.answer(statement))
            .collect();
        Ok(Box::new(BufferedReader::new(sets)))
    }

    fn close(&mut self) -> Result<()> {
        self.db.state.lock().closed += 1;
        Ok(())
    }
}

pub const USER_COLUMNS: [&str; 4] = ["id", "name", "age", "team_id"];

/// teams <- users.team; deleting a team deletes its users.
pub fn teams() -> Arc<TableMapping> {
    TableMapping::new("teams")
        .field(FieldMapping::new("id").key(true).generated(true))
        .field(FieldMapping::new("name"))
        .child(
            ChildRelation::new("members", "users", "team")
                .cascade_delete(true)
                .cascade_save(true),
        )
        .build()
        .unwrap()
}

pub fn users() -> Arc<TableMapping> {
    TableMapping::new("users")
        .field(FieldMapping::new("id").key(true).generated(true))
        .field(FieldMapping::new("name"))
        .field(FieldMapping::new("age"))
        .field(FieldMapping::new("team_id"))
        .foreign(ForeignRelation::new("team", "teams").column("team_id", "id"))
        .build()
        .unwrap()
}

pub fn store() -> (ObjectStore, Arc<FakeProvider>) {
    let provider = FakeProvider::new();
    let store = ObjectStore::new(
        Arc::clone(&provider) as Arc<dyn DatabaseProvider>,
        StoreConfig::new("memory").pool(PoolConfig::new().idle_grace(50).sweep_interval(10)),
    );
    store.register(teams()).unwrap();
    store.register(users()).unwrap();
    (store, provider)
}

pub fn user_rows(rows: &[(i64, &str, i64, Option<i64>)]) -> ResultSet {
    ResultSet::from_rows(
        USER_COLUMNS.iter().map(|c| (*c).to_string()).collect(),
        rows.iter()
            .map(|(id, name, age, team)| {
                vec![
                    Value::BigInt(*id),
                    Value::from(*name),
                    Value::BigInt(*age),
                    (*team).map_or(Value::Null, Value::BigInt),
                ]
            })
            .collect(),
    )
}

pub fn team_rows(rows: &[(i64, &str)]) -> ResultSet {
    ResultSet::from_rows(
        vec!["id".into(), "name".into()],
        rows.iter()
            .map(|(id, name)| vec![Value::BigInt(*id), Value::from(*name)])
            .collect(),
    )
}

pub fn name(object: &EntityRef) -> String {
    object
        .get("name")
        .unwrap()
        .as_str()
        .unwrap_or_default()
        .to_string()
}

pub fn names(objects: &[EntityRef]) -> Vec<String> {
    objects.iter().map(name).collect()
}

pub fn keys(id: i64) -> MappedObjectKeys {
    MappedObjectKeys::new(vec![Value::BigInt(id)])
}
