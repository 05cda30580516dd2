//! In-memory doubles of [`SpannerClient`] and [`MonitoringClient`].
//!
//! Handles are cheap to clone and share their state, so a test can hand one
//! clone to the manager and keep another to script failures and inspect the
//! calls that were made. Creating an instance or database twice reports
//! `ALREADY_EXISTS` and removing a missing one reports `NOT_FOUND`. Tables
//! are plain row lists keyed by their first column.

use crate::client::types::{
    DatabaseName, Dialect, InstanceConfig, InstanceName, KeySet, Mutation, MutationOp, Statement,
    Struct, Value,
};
use crate::client::{
    BufferedResultSet, ErrorCode, RemoteError, ResultSet, SpannerClient, TransactionContext,
    TransactionWork,
};
use crate::monitoring::{Aggregation, MonitoringClient, Reducer, TimeInterval};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Remote operations a failure can be scripted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateInstance,
    DeleteInstance,
    CreateDatabase,
    UpdateDatabaseDdl,
    DropDatabase,
    Write,
    ReadWriteTransaction,
    BatchUpdate,
    /// Commit at the end of a read-write transaction.
    Commit,
    Read,
}

/// A call received by [`FakeSpannerClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateInstance(InstanceConfig),
    DeleteInstance(InstanceName),
    CreateDatabase(DatabaseName, Dialect),
    UpdateDatabaseDdl(DatabaseName, Vec<String>),
    DropDatabase(DatabaseName),
    Write(DatabaseName, Vec<Mutation>),
    ReadWriteTransaction(DatabaseName),
    Buffer(Vec<Mutation>),
    BatchUpdate(Vec<Statement>),
    Commit(Vec<Mutation>),
    Read {
        database: DatabaseName,
        table: String,
        columns: Vec<String>,
    },
    Close,
}

impl Call {
    pub fn operation(&self) -> Option<Operation> {
        Some(match self {
            Self::CreateInstance(_) => Operation::CreateInstance,
            Self::DeleteInstance(_) => Operation::DeleteInstance,
            Self::CreateDatabase(..) => Operation::CreateDatabase,
            Self::UpdateDatabaseDdl(..) => Operation::UpdateDatabaseDdl,
            Self::DropDatabase(_) => Operation::DropDatabase,
            Self::Write(..) => Operation::Write,
            Self::ReadWriteTransaction(_) => Operation::ReadWriteTransaction,
            Self::BatchUpdate(_) => Operation::BatchUpdate,
            Self::Commit(_) => Operation::Commit,
            Self::Read { .. } => Operation::Read,
            Self::Buffer(_) | Self::Close => return None,
        })
    }
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    failures: HashMap<Operation, VecDeque<RemoteError>>,
    tables: HashMap<String, Vec<Struct>>,
    instances: HashSet<InstanceName>,
    databases: HashSet<DatabaseName>,
    closed: bool,
}

impl State {
    /// Records `call` and fails with the next scripted error of its operation, if any.
    fn record(&mut self, call: Call) -> Result<(), RemoteError> {
        let operation = call.operation();
        self.calls.push(call);
        if let Some(error) = operation
            .and_then(|operation| self.failures.get_mut(&operation))
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        if self.closed {
            return Err(RemoteError::new(
                ErrorCode::FailedPrecondition,
                "client has been closed",
            ));
        }
        Ok(())
    }

    fn apply(&mut self, mutations: &[Mutation]) {
        for mutation in mutations {
            let rows = self.tables.entry(mutation.table().to_string()).or_default();
            if mutation.op() == MutationOp::Delete {
                match mutation.key_set() {
                    Some(KeySet::All) => rows.clear(),
                    Some(KeySet::Keys(keys)) => rows.retain(|row| {
                        !keys
                            .iter()
                            .any(|key| key.first().is_some_and(|k| primary_key(row) == Some(k)))
                    }),
                    None => {}
                }
                continue;
            }
            let row: Struct = mutation
                .columns()
                .iter()
                .cloned()
                .zip(mutation.values().iter().cloned())
                .collect();
            match rows
                .iter()
                .position(|existing| primary_key(existing) == primary_key(&row))
            {
                Some(index) => rows[index] = row,
                None => rows.push(row),
            }
        }
    }
}

fn already_exists(name: impl std::fmt::Display) -> RemoteError {
    RemoteError::new(ErrorCode::AlreadyExists, format!("{name} already exists"))
}

fn not_found(name: impl std::fmt::Display) -> RemoteError {
    RemoteError::new(ErrorCode::NotFound, format!("{name} not found"))
}

fn primary_key(row: &Struct) -> Option<&Value> {
    row.fields().first().map(|(_, value)| value)
}

/// Scripted [`SpannerClient`].
#[derive(Clone, Default)]
pub struct FakeSpannerClient {
    state: Arc<Mutex<State>>,
}

impl FakeSpannerClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next call of `operation` fails with `error`. Errors queue up.
    pub fn fail_next(&self, operation: Operation, error: RemoteError) {
        self.state()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Replaces the content of `table`.
    pub fn set_rows(&self, table: &str, rows: Vec<Struct>) {
        self.state().tables.insert(table.to_string(), rows);
    }

    /// Marks `database` as existing, e.g. one created by a previous run.
    pub fn add_database(&self, database: DatabaseName) {
        self.state().databases.insert(database);
    }

    pub fn instance_exists(&self, instance: &InstanceName) -> bool {
        self.state().instances.contains(instance)
    }

    pub fn database_exists(&self, database: &DatabaseName) -> bool {
        self.state().databases.contains(database)
    }

    pub fn rows(&self, table: &str) -> Vec<Struct> {
        self.state().tables.get(table).cloned().unwrap_or_default()
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Number of calls of `operation` received so far.
    pub fn count(&self, operation: Operation) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| call.operation() == Some(operation))
            .count()
    }
}

struct FakeTransactionContext<'a> {
    client: &'a FakeSpannerClient,
    buffered: Vec<Mutation>,
}

impl TransactionContext for FakeTransactionContext<'_> {
    fn buffer(&mut self, mutations: &[Mutation]) {
        self.client
            .state()
            .calls
            .push(Call::Buffer(mutations.to_vec()));
        self.buffered.extend_from_slice(mutations);
    }

    fn batch_update(&mut self, statements: &[Statement]) -> Result<Vec<i64>, RemoteError> {
        self.client
            .state()
            .record(Call::BatchUpdate(statements.to_vec()))?;
        Ok(vec![1; statements.len()])
    }
}

impl SpannerClient for FakeSpannerClient {
    fn create_instance(&self, instance: &InstanceConfig) -> Result<(), RemoteError> {
        let mut state = self.state();
        state.record(Call::CreateInstance(instance.clone()))?;
        if !state.instances.insert(instance.name.clone()) {
            return Err(already_exists(&instance.name));
        }
        Ok(())
    }

    fn delete_instance(&self, instance: &InstanceName) -> Result<(), RemoteError> {
        let mut state = self.state();
        state.record(Call::DeleteInstance(instance.clone()))?;
        if !state.instances.remove(instance) {
            return Err(not_found(instance));
        }
        state
            .databases
            .retain(|database| &database.instance() != instance);
        Ok(())
    }

    fn create_database(
        &self,
        database: &DatabaseName,
        dialect: Dialect,
    ) -> Result<(), RemoteError> {
        let mut state = self.state();
        state.record(Call::CreateDatabase(database.clone(), dialect))?;
        if !state.databases.insert(database.clone()) {
            return Err(already_exists(database));
        }
        Ok(())
    }

    fn update_database_ddl(
        &self,
        database: &DatabaseName,
        statements: &[String],
    ) -> Result<(), RemoteError> {
        self.state()
            .record(Call::UpdateDatabaseDdl(database.clone(), statements.to_vec()))
    }

    fn drop_database(&self, database: &DatabaseName) -> Result<(), RemoteError> {
        let mut state = self.state();
        state.record(Call::DropDatabase(database.clone()))?;
        if !state.databases.remove(database) {
            return Err(not_found(database));
        }
        Ok(())
    }

    fn write(
        &self,
        database: &DatabaseName,
        mutations: &[Mutation],
    ) -> Result<DateTime<Utc>, RemoteError> {
        let mut state = self.state();
        state.record(Call::Write(database.clone(), mutations.to_vec()))?;
        state.apply(mutations);
        Ok(Utc::now())
    }

    fn read_write_transaction(
        &self,
        database: &DatabaseName,
        work: &mut TransactionWork<'_>,
    ) -> Result<(), RemoteError> {
        self.state()
            .record(Call::ReadWriteTransaction(database.clone()))?;
        let mut context = FakeTransactionContext {
            client: self,
            buffered: Vec::new(),
        };
        work(&mut context)?;
        let mut state = self.state();
        state.record(Call::Commit(context.buffered.clone()))?;
        state.apply(&context.buffered);
        Ok(())
    }

    fn read(
        &self,
        database: &DatabaseName,
        table: &str,
        _key_set: &KeySet,
        columns: &[String],
    ) -> Result<Box<dyn ResultSet>, RemoteError> {
        let mut state = self.state();
        state.record(Call::Read {
            database: database.clone(),
            table: table.to_string(),
            columns: columns.to_vec(),
        })?;
        let rows = state
            .tables
            .get(table)
            .map(|rows| rows.iter().map(|row| row.project(columns)).collect())
            .unwrap_or_default();
        Ok(Box::new(BufferedResultSet::new(rows)))
    }

    fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn close(&mut self) {
        let mut state = self.state();
        state.calls.push(Call::Close);
        state.closed = true;
    }
}

#[derive(Default)]
struct MonitoringState {
    values: HashMap<Reducer, f64>,
    queries: Vec<MetricQuery>,
    failures: HashMap<Reducer, VecDeque<RemoteError>>,
}

/// A query received by [`FakeMonitoringClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct MetricQuery {
    pub project_id: String,
    pub filter: String,
    pub interval: TimeInterval,
    pub aggregation: Aggregation,
}

/// [`MonitoringClient`] answering with a fixed value per reducer. A reducer
/// without a value reports no samples.
#[derive(Clone, Default)]
pub struct FakeMonitoringClient {
    state: Arc<Mutex<MonitoringState>>,
}

impl FakeMonitoringClient {
    /// Answers mean queries with `average` and max queries with `max`.
    pub fn with_values(average: f64, max: f64) -> Self {
        let client = Self::default();
        {
            let mut state = client.state();
            state.values.insert(Reducer::Mean, average);
            state.values.insert(Reducer::Max, max);
        }
        client
    }

    fn state(&self) -> MutexGuard<'_, MonitoringState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails the next query aggregated with `reducer`.
    pub fn fail_next(&self, reducer: Reducer, error: RemoteError) {
        self.state()
            .failures
            .entry(reducer)
            .or_default()
            .push_back(error);
    }

    pub fn queries(&self) -> Vec<MetricQuery> {
        self.state().queries.clone()
    }
}

impl MonitoringClient for FakeMonitoringClient {
    fn get_aggregated_metric(
        &self,
        project_id: &str,
        filter: &str,
        interval: &TimeInterval,
        aggregation: &Aggregation,
    ) -> Result<Option<f64>, RemoteError> {
        let mut state = self.state();
        state.queries.push(MetricQuery {
            project_id: project_id.to_string(),
            filter: filter.to_string(),
            interval: *interval,
            aggregation: *aggregation,
        });
        if let Some(error) = state
            .failures
            .get_mut(&aggregation.reducer)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        Ok(state.values.get(&aggregation.reducer).copied())
    }
}
