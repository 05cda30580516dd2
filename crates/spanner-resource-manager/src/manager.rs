//! The resource manager owns one Spanner instance/database pair for the
//! duration of a test and walks it through three states:
//!
//! ```text
//!                  execute_ddl_statement(s)
//!  Uninitialized ────────────────────────────▶ Ready
//!        │          (provisions: instance,       │
//!        │           database, initial schema)   │
//!        │                                       │
//!        └──────────────┐         ┌──────────────┘
//!                       ▼         ▼
//!                       cleanup_all
//!                            │
//!                            ▼
//!                        CleanedUp  (terminal)
//! ```
//!
//! Provisioning is lazy: nothing is created remotely until the first DDL
//! statement arrives, and that statement becomes the initial schema of the
//! database. Data operations require `Ready`. After `cleanup_all` the
//! manager rejects every operation, even when the cleanup itself failed.

use crate::client::types::{
    DatabaseName, Dialect, InstanceConfig, InstanceName, KeySet, Mutation, Statement, Struct,
};
use crate::client::{ErrorCode, RemoteError, SpannerClient};
use crate::config::ResourceManagerConfig;
use crate::error::ResourceManagerError;
use crate::ids::{generate_database_id, generate_instance_id};
use crate::metrics::{
    CLEANUP_FAILURES, PROVISIONING_ATTEMPTS, PROVISIONING_LATENCY, PROVISIONING_RETRIES,
};
use crate::monitoring::{
    cpu_utilization_filter, Aggregation, TimeInterval, AVERAGE_CPU_UTILIZATION_KEY,
    MAX_CPU_UTILIZATION_KEY,
};
use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::{self, Display};
use std::time::Instant;

#[cfg(test)]
mod test;

/// Lifecycle state of a [`SpannerResourceManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResourceState {
    /// Nothing provisioned yet.
    Uninitialized,
    /// Instance, database and initial schema exist.
    Ready,
    /// Torn down; terminal.
    CleanedUp,
}

impl Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Ready => write!(f, "ready"),
            Self::CleanedUp => write!(f, "cleaned up"),
        }
    }
}

/// Bookkeeping of the remote resources owned by a manager.
#[derive(Debug, Clone)]
pub struct ProvisionedResource {
    instance_id: String,
    database_id: String,
    is_static: bool,
    instance_created: bool,
    database_created: bool,
    provisioned: bool,
    cleaned_up: bool,
    provisioned_at: Option<DateTime<Utc>>,
}

impl ProvisionedResource {
    fn new(config: &ResourceManagerConfig) -> Self {
        let instance_id = match config.instance_id() {
            Some(instance_id) => instance_id.to_string(),
            None => generate_instance_id(config.test_id()),
        };
        Self {
            instance_id,
            database_id: generate_database_id(config.test_id()),
            is_static: config.use_static_instance(),
            instance_created: false,
            database_created: false,
            provisioned: false,
            cleaned_up: false,
            provisioned_at: None,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    pub fn is_static(&self) -> bool {
        self.is_static
    }

    /// Whether this manager created the instance (never true for a static one).
    pub fn instance_created(&self) -> bool {
        self.instance_created
    }

    pub fn database_created(&self) -> bool {
        self.database_created
    }

    /// Completion time of the provisioning sequence.
    pub fn provisioned_at(&self) -> Option<DateTime<Utc>> {
        self.provisioned_at
    }

    fn owns_remote_resources(&self) -> bool {
        self.instance_created || self.database_created
    }
}

/// Manages the lifecycle of a Spanner instance and database for one test run.
///
/// State-changing calls take `&mut self`; share a manager between threads by
/// wrapping it in a `Mutex`.
pub struct SpannerResourceManager {
    config: ResourceManagerConfig,
    client: Box<dyn SpannerClient>,
    resource: ProvisionedResource,
}

impl SpannerResourceManager {
    /// Creates a manager that talks to Spanner through `client`. No remote
    /// call is made until the first DDL statement.
    pub fn new(config: ResourceManagerConfig, client: Box<dyn SpannerClient>) -> Self {
        crate::metrics::init();
        let resource = ProvisionedResource::new(&config);
        info!(
            "Spanner resource manager for test '{}' will use instance '{}'{} and database '{}'",
            config.test_id(),
            resource.instance_id,
            if resource.is_static { " (static)" } else { "" },
            resource.database_id
        );
        Self {
            config,
            client,
            resource,
        }
    }

    pub fn config(&self) -> &ResourceManagerConfig {
        &self.config
    }

    pub fn resource(&self) -> &ProvisionedResource {
        &self.resource
    }

    pub fn instance_id(&self) -> &str {
        &self.resource.instance_id
    }

    pub fn database_id(&self) -> &str {
        &self.resource.database_id
    }

    pub fn project_id(&self) -> &str {
        self.config.project_id()
    }

    pub fn region(&self) -> &str {
        self.config.region()
    }

    pub fn dialect(&self) -> Dialect {
        self.config.dialect()
    }

    pub fn is_static_instance(&self) -> bool {
        self.resource.is_static
    }

    /// Fully qualified name of the managed database.
    pub fn database_name(&self) -> DatabaseName {
        DatabaseName::new(
            self.config.project_id(),
            &self.resource.instance_id,
            &self.resource.database_id,
        )
    }

    pub fn instance_name(&self) -> InstanceName {
        InstanceName::new(self.config.project_id(), &self.resource.instance_id)
    }

    pub fn state(&self) -> ResourceState {
        if self.resource.cleaned_up || self.client.is_closed() {
            ResourceState::CleanedUp
        } else if self.resource.provisioned {
            ResourceState::Ready
        } else {
            ResourceState::Uninitialized
        }
    }

    fn check_ready(&self, operation: &'static str) -> Result<(), ResourceManagerError> {
        match self.state() {
            ResourceState::Ready => Ok(()),
            state => Err(ResourceManagerError::invalid_state(operation, state)),
        }
    }

    fn check_not_cleaned_up(&self, operation: &'static str) -> Result<(), ResourceManagerError> {
        match self.state() {
            ResourceState::CleanedUp => Err(ResourceManagerError::invalid_state(
                operation,
                ResourceState::CleanedUp,
            )),
            _ => Ok(()),
        }
    }

    /// Applies a DDL statement, provisioning the instance and database first
    /// if this is the first statement.
    pub fn execute_ddl_statement(&mut self, statement: &str) -> Result<(), ResourceManagerError> {
        self.execute_ddl_statements(&[statement.to_string()])
    }

    /// Applies DDL statements in order as a single schema change. The first
    /// call provisions the instance and database and applies the statements
    /// as the initial schema; resource exhaustion during that sequence
    /// re-runs the whole sequence once.
    pub fn execute_ddl_statements(
        &mut self,
        statements: &[String],
    ) -> Result<(), ResourceManagerError> {
        self.check_not_cleaned_up("execute DDL statements")?;
        if self.resource.provisioned {
            debug!(
                "Applying {} DDL statement(s) to database '{}'",
                statements.len(),
                self.resource.database_id
            );
            return self
                .client
                .update_database_ddl(&self.database_name(), statements)
                .map_err(|e| {
                    ResourceManagerError::remote(
                        format!(
                            "Failed to execute DDL statements on database '{}'",
                            self.resource.database_id
                        ),
                        e,
                    )
                });
        }
        self.provision(statements)
    }

    fn provision(&mut self, statements: &[String]) -> Result<(), ResourceManagerError> {
        let policy = self.config.retry_policy().clone();
        let started = Instant::now();
        let mut attempt = 1;
        loop {
            ::metrics::counter!(PROVISIONING_ATTEMPTS).increment(1);
            match self.run_provisioning_sequence(statements) {
                Ok(()) => {
                    self.resource.provisioned = true;
                    self.resource.provisioned_at = Some(Utc::now());
                    let elapsed = started.elapsed();
                    ::metrics::histogram!(PROVISIONING_LATENCY).record(elapsed.as_secs_f64());
                    info!(
                        "Provisioned database '{}' on instance '{}' in {:.1}s (attempt {attempt})",
                        self.resource.database_id,
                        self.resource.instance_id,
                        elapsed.as_secs_f64()
                    );
                    return Ok(());
                }
                Err(e) if policy.should_retry(attempt, &e) => {
                    ::metrics::counter!(PROVISIONING_RETRIES).increment(1);
                    warn!(
                        "Provisioning attempt {attempt} of {} failed with resource exhaustion, retrying in {:?}: {e}",
                        policy.max_attempts(),
                        policy.backoff()
                    );
                    std::thread::sleep(policy.backoff());
                    attempt += 1;
                }
                Err(e) => {
                    error!("Provisioning failed after {attempt} attempt(s): {e}");
                    return Err(e);
                }
            }
        }
    }

    /// Instance, then database, then initial schema. Re-runnable: a create
    /// step that finds the resource this manager already created succeeds.
    fn run_provisioning_sequence(
        &mut self,
        statements: &[String],
    ) -> Result<(), ResourceManagerError> {
        let database = self.database_name();

        if !self.resource.is_static {
            let instance = InstanceConfig::regional(
                self.instance_name(),
                self.config.region(),
                self.config.node_count(),
            );
            info!(
                "Creating instance '{}' ({}, {} node(s))",
                self.resource.instance_id, instance.config, instance.node_count
            );
            match self.client.create_instance(&instance) {
                Ok(()) => self.resource.instance_created = true,
                Err(e) if self.resource.instance_created && is_already_exists(&e) => {
                    debug!("Instance '{}' already exists", self.resource.instance_id);
                }
                Err(e) => {
                    return Err(ResourceManagerError::remote(
                        format!("Failed to create instance '{}'", self.resource.instance_id),
                        e,
                    ))
                }
            }
        }

        info!(
            "Creating {} database '{}'",
            self.config.dialect(),
            self.resource.database_id
        );
        match self.client.create_database(&database, self.config.dialect()) {
            Ok(()) => self.resource.database_created = true,
            Err(e) if self.resource.database_created && is_already_exists(&e) => {
                debug!("Database '{}' already exists", self.resource.database_id);
            }
            Err(e) => {
                return Err(ResourceManagerError::remote(
                    format!("Failed to create database '{}'", self.resource.database_id),
                    e,
                ))
            }
        }

        debug!(
            "Applying initial schema ({} statement(s)) to database '{}'",
            statements.len(),
            self.resource.database_id
        );
        self.client
            .update_database_ddl(&database, statements)
            .map_err(|e| {
                ResourceManagerError::remote(
                    format!(
                        "Failed to apply initial schema to database '{}'",
                        self.resource.database_id
                    ),
                    e,
                )
            })
    }

    /// Writes a single mutation.
    pub fn write(&self, mutation: &Mutation) -> Result<(), ResourceManagerError> {
        self.write_batch(std::slice::from_ref(mutation))
    }

    /// Writes mutations atomically, in the given order.
    pub fn write_batch(&self, mutations: &[Mutation]) -> Result<(), ResourceManagerError> {
        self.check_ready("write mutations")?;
        let commit_timestamp = self
            .client
            .write(&self.database_name(), mutations)
            .map_err(|e| ResourceManagerError::remote("Failed to write mutations", e))?;
        trace!(
            "Committed {} mutation(s) at {commit_timestamp}",
            mutations.len()
        );
        Ok(())
    }

    /// Writes mutations in a read-write transaction. Unlike
    /// [`Self::write_batch`], a remote failure is returned as
    /// [`ResourceManagerError::Transaction`] holding the error exactly as the
    /// client reported it.
    pub fn write_in_transaction(&self, mutations: &[Mutation]) -> Result<(), ResourceManagerError> {
        self.check_ready("write mutations in a transaction")?;
        self.client
            .read_write_transaction(&self.database_name(), &mut |transaction| {
                transaction.buffer(mutations);
                Ok(())
            })
            .map_err(ResourceManagerError::Transaction)
    }

    /// Executes DML statements as one batch inside a read-write transaction.
    pub fn execute_dml_statements(&self, statements: &[String]) -> Result<(), ResourceManagerError> {
        self.check_ready("execute DML statements")?;
        let statements: Vec<Statement> = statements.iter().map(Statement::of).collect();
        self.client
            .read_write_transaction(&self.database_name(), &mut |transaction| {
                let row_counts = transaction.batch_update(&statements)?;
                trace!("DML row counts: {row_counts:?}");
                Ok(())
            })
            .map_err(|e| ResourceManagerError::remote("Failed to execute DML statements", e))
    }

    /// Reads `columns` of every row of `table`.
    pub fn read_table_records(
        &self,
        table: &str,
        columns: &[&str],
    ) -> Result<Vec<Struct>, ResourceManagerError> {
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        self.read_records(table, &columns)
    }

    /// Same as [`Self::read_table_records`] with an owned column list.
    pub fn read_table_records_with_column_names(
        &self,
        table: &str,
        columns: &[String],
    ) -> Result<Vec<Struct>, ResourceManagerError> {
        self.read_records(table, columns)
    }

    fn read_records(
        &self,
        table: &str,
        columns: &[String],
    ) -> Result<Vec<Struct>, ResourceManagerError> {
        self.check_ready("read table records")?;
        let wrap = |e| ResourceManagerError::remote(format!("Failed to read from table '{table}'"), e);
        let mut result_set = self
            .client
            .read(&self.database_name(), table, &KeySet::all(), columns)
            .map_err(wrap)?;
        let mut records = Vec::new();
        while result_set.next().map_err(wrap)? {
            records.push(result_set.current_row_as_struct().map_err(wrap)?);
        }
        debug!("Read {} record(s) from table '{table}'", records.len());
        Ok(records)
    }

    /// Adds the average and maximum CPU utilization of the instance since
    /// provisioning to `metrics`, overwriting previous values. Both entries
    /// are added or neither is; a value without samples yet is `NaN`.
    pub fn collect_metrics(
        &self,
        metrics: &mut HashMap<String, f64>,
    ) -> Result<(), ResourceManagerError> {
        let monitoring = self
            .config
            .monitoring_client()
            .ok_or(ResourceManagerError::MonitoringClientNotConfigured)?;
        self.check_ready("collect metrics")?;

        let end = Utc::now();
        let interval = TimeInterval::new(self.resource.provisioned_at.unwrap_or(end), end);
        let filter = cpu_utilization_filter(&self.resource.instance_id);
        let query = |key: &str, aggregation: Aggregation| -> Result<f64, ResourceManagerError> {
            let value = monitoring
                .get_aggregated_metric(self.config.project_id(), &filter, &interval, &aggregation)
                .map_err(|e| ResourceManagerError::remote(format!("Failed to collect {key}"), e))?;
            match value {
                Some(value) => debug!("{key} = {value}"),
                None => debug!("No {key} samples since {}", interval.start),
            }
            Ok(value.unwrap_or(f64::NAN))
        };
        let average = query(AVERAGE_CPU_UTILIZATION_KEY, Aggregation::mean())?;
        let max = query(MAX_CPU_UTILIZATION_KEY, Aggregation::max())?;

        metrics.insert(AVERAGE_CPU_UTILIZATION_KEY.to_string(), average);
        metrics.insert(MAX_CPU_UTILIZATION_KEY.to_string(), max);
        Ok(())
    }

    /// Deletes the instance, or for a static instance drops only the
    /// database, and closes the client. An instance named through
    /// `set_instance_id` is deleted only if this manager created it. The
    /// manager is unusable afterwards, also when this call fails.
    pub fn cleanup_all(&mut self) -> Result<(), ResourceManagerError> {
        self.check_not_cleaned_up("clean up resources")?;

        let result = if self.resource.is_static {
            info!(
                "Dropping database '{}' on static instance '{}'",
                self.resource.database_id, self.resource.instance_id
            );
            self.client
                .drop_database(&self.database_name())
                .map_err(|e| (format!("Failed to drop database '{}'", self.resource.database_id), e))
        } else if self.config.instance_id().is_some() && !self.resource.instance_created {
            info!(
                "Leaving instance '{}' in place, it was not created by this manager",
                self.resource.instance_id
            );
            Ok(())
        } else {
            info!("Deleting instance '{}'", self.resource.instance_id);
            self.client
                .delete_instance(&self.instance_name())
                .map_err(|e| (format!("Failed to delete instance '{}'", self.resource.instance_id), e))
        };

        self.resource.cleaned_up = true;
        self.client.close();

        match result {
            Ok(()) => Ok(()),
            Err((_, e)) if e.code() == ErrorCode::NotFound => {
                debug!("Nothing to clean up: {e}");
                Ok(())
            }
            Err((context, e)) => {
                ::metrics::counter!(CLEANUP_FAILURES).increment(1);
                error!("{context}: {e}");
                Err(ResourceManagerError::remote(context, e))
            }
        }
    }
}

fn is_already_exists(error: &RemoteError) -> bool {
    error.code() == ErrorCode::AlreadyExists
}

impl fmt::Debug for SpannerResourceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpannerResourceManager")
            .field("config", &self.config)
            .field("resource", &self.resource)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for SpannerResourceManager {
    fn drop(&mut self) {
        if !self.resource.cleaned_up && self.resource.owns_remote_resources() {
            warn!(
                "Spanner resource manager for test '{}' dropped without cleanup_all(); \
                 instance '{}' and database '{}' may be leaked",
                self.config.test_id(),
                self.resource.instance_id,
                self.resource.database_id
            );
        }
    }
}
