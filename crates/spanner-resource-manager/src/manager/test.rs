use super::*;
use crate::client::fake::{Call, FakeMonitoringClient, FakeSpannerClient, Operation};
use crate::client::types::Value;
use crate::config::ResourceManagerBuilder;
use crate::monitoring::Reducer;
use proptest::prelude::*;
use proptest::test_runner::{Config, TestRunner};
use proptest_derive::Arbitrary;
use regex::Regex;
use std::collections::VecDeque;
use std::error::Error as StdError;
use std::time::Duration;

const TEST_ID: &str = "test";
const PROJECT_ID: &str = "test-project";
const REGION: &str = "us-east1";
const STATIC_INSTANCE: &str = "existing-instance";
const CREATE_TABLE: &str = "CREATE TABLE Singers (SingerId INT64 NOT NULL, FirstName STRING(1024)) PRIMARY KEY (SingerId)";

fn builder() -> ResourceManagerBuilder {
    ResourceManagerConfig::builder(TEST_ID, PROJECT_ID, REGION, Dialect::GoogleStandardSql)
        .set_retry_backoff(Duration::ZERO)
}

fn manager(client: &FakeSpannerClient) -> SpannerResourceManager {
    builder().build(client.clone()).unwrap()
}

fn static_manager(client: &FakeSpannerClient) -> SpannerResourceManager {
    builder()
        .set_instance_id(STATIC_INSTANCE)
        .use_static_instance()
        .build(client.clone())
        .unwrap()
}

fn provisioned(client: &FakeSpannerClient) -> SpannerResourceManager {
    let mut manager = manager(client);
    manager.execute_ddl_statement(CREATE_TABLE).unwrap();
    manager
}

fn resource_exhausted() -> RemoteError {
    RemoteError::new(
        ErrorCode::Unknown,
        "com.google.cloud.spanner.SpannerException: RESOURCE_EXHAUSTED: \
         io.grpc.StatusRuntimeException: RESOURCE_EXHAUSTED: CPU overload detected",
    )
}

fn singer(id: i64, name: &str) -> Mutation {
    Mutation::new_insert_or_update_builder("Singers")
        .set("SingerId", id)
        .set("FirstName", name)
        .build()
}

fn singer_row(id: i64, name: &str) -> Struct {
    Struct::builder()
        .set("SingerId", id)
        .set("FirstName", name)
        .build()
}

fn assert_invalid_state<T: fmt::Debug>(result: Result<T, ResourceManagerError>) {
    let error = result.unwrap_err();
    assert!(error.is_invalid_state(), "unexpected error: {error:?}");
}

#[test]
fn generated_ids_follow_the_naming_scheme() {
    let client = FakeSpannerClient::new();
    let manager = manager(&client);
    assert!(
        Regex::new(r"^test-\d{8}-\d{6}-[a-zA-Z0-9]{6}$")
            .unwrap()
            .is_match(manager.instance_id()),
        "{}",
        manager.instance_id()
    );
    assert!(
        Regex::new(r"^test_\d{8}_\d{6}_[a-zA-Z0-9]{6}$")
            .unwrap()
            .is_match(manager.database_id()),
        "{}",
        manager.database_id()
    );
    assert_eq!(manager.project_id(), PROJECT_ID);
    assert_eq!(manager.region(), REGION);
    assert_eq!(manager.dialect(), Dialect::GoogleStandardSql);
    assert!(!manager.is_static_instance());
    assert_eq!(manager.state(), ResourceState::Uninitialized);
    assert!(client.calls().is_empty());
}

#[test]
fn explicit_instance_id_is_used() {
    let client = FakeSpannerClient::new();
    let manager = static_manager(&client);
    assert_eq!(manager.instance_id(), STATIC_INSTANCE);
    assert!(manager.is_static_instance());
}

#[test]
fn data_operations_require_provisioning() {
    let client = FakeSpannerClient::new();
    let manager = manager(&client);
    assert_invalid_state(manager.write(&singer(1, "Marc")));
    assert_invalid_state(manager.write_batch(&[singer(1, "Marc")]));
    assert_invalid_state(manager.write_in_transaction(&[singer(1, "Marc")]));
    assert_invalid_state(manager.execute_dml_statements(&["DELETE FROM Singers WHERE TRUE".into()]));
    assert_invalid_state(manager.read_table_records("Singers", &["SingerId"]));
    assert_invalid_state(
        manager.read_table_records_with_column_names("Singers", &["SingerId".to_string()]),
    );
    assert!(client.calls().is_empty());
}

#[test]
fn first_ddl_statement_provisions_in_order() {
    let client = FakeSpannerClient::new();
    let manager = provisioned(&client);
    let database = manager.database_name();
    assert_eq!(
        client.calls(),
        vec![
            Call::CreateInstance(InstanceConfig::regional(
                manager.instance_name(),
                REGION,
                1
            )),
            Call::CreateDatabase(database.clone(), Dialect::GoogleStandardSql),
            Call::UpdateDatabaseDdl(database, vec![CREATE_TABLE.to_string()]),
        ]
    );
    assert_eq!(manager.state(), ResourceState::Ready);
    assert!(manager.resource().instance_created());
    assert!(manager.resource().database_created());
    assert!(manager.resource().provisioned_at().is_some());
}

#[test]
fn later_ddl_statements_only_change_the_schema() {
    let client = FakeSpannerClient::new();
    let mut manager = provisioned(&client);
    manager
        .execute_ddl_statements(&[
            "CREATE INDEX SingersByName ON Singers(FirstName)".to_string(),
            "ALTER TABLE Singers ADD COLUMN LastName STRING(1024)".to_string(),
        ])
        .unwrap();
    assert_eq!(client.count(Operation::CreateInstance), 1);
    assert_eq!(client.count(Operation::CreateDatabase), 1);
    assert_eq!(client.count(Operation::UpdateDatabaseDdl), 2);
    assert_eq!(
        client.calls().last(),
        Some(&Call::UpdateDatabaseDdl(
            manager.database_name(),
            vec![
                "CREATE INDEX SingersByName ON Singers(FirstName)".to_string(),
                "ALTER TABLE Singers ADD COLUMN LastName STRING(1024)".to_string(),
            ]
        ))
    );
}

#[test]
fn static_instance_is_not_created() {
    let client = FakeSpannerClient::new();
    let mut manager = static_manager(&client);
    manager.execute_ddl_statement(CREATE_TABLE).unwrap();
    assert_eq!(client.count(Operation::CreateInstance), 0);
    assert_eq!(
        client.calls()[0],
        Call::CreateDatabase(
            DatabaseName::new(PROJECT_ID, STATIC_INSTANCE, manager.database_id()),
            Dialect::GoogleStandardSql
        )
    );
    assert!(!manager.resource().instance_created());
}

#[test]
fn resource_exhaustion_reruns_the_whole_sequence() {
    let client = FakeSpannerClient::new();
    client.fail_next(Operation::UpdateDatabaseDdl, resource_exhausted());
    let manager = provisioned(&client);
    // The second round finds instance and database already there.
    assert_eq!(client.count(Operation::CreateInstance), 2);
    assert_eq!(client.count(Operation::CreateDatabase), 2);
    assert_eq!(client.count(Operation::UpdateDatabaseDdl), 2);
    assert_eq!(manager.state(), ResourceState::Ready);

    // Both rounds target the same resources.
    let calls_of = |operation| -> Vec<Call> {
        client
            .calls()
            .into_iter()
            .filter(|call| call.operation() == Some(operation))
            .collect()
    };
    let instances = calls_of(Operation::CreateInstance);
    assert_eq!(instances[0], instances[1]);
    assert!(
        matches!(&instances[0], Call::CreateInstance(config) if config.name == manager.instance_name())
    );
    assert_eq!(
        calls_of(Operation::CreateDatabase),
        vec![Call::CreateDatabase(manager.database_name(), Dialect::GoogleStandardSql); 2]
    );
    assert_eq!(
        calls_of(Operation::UpdateDatabaseDdl),
        vec![Call::UpdateDatabaseDdl(manager.database_name(), vec![CREATE_TABLE.to_string()]); 2]
    );
}

#[test]
fn typed_resource_exhaustion_is_retried_at_any_step() {
    let client = FakeSpannerClient::new();
    client.fail_next(
        Operation::CreateDatabase,
        RemoteError::new(ErrorCode::ResourceExhausted, "Quota exceeded"),
    );
    let manager = provisioned(&client);
    assert_eq!(client.count(Operation::CreateInstance), 2);
    assert_eq!(client.count(Operation::CreateDatabase), 2);
    assert_eq!(client.count(Operation::UpdateDatabaseDdl), 1);
    assert_eq!(manager.state(), ResourceState::Ready);
}

#[test]
fn resource_exhaustion_is_retried_only_once() {
    let client = FakeSpannerClient::new();
    client.fail_next(Operation::UpdateDatabaseDdl, resource_exhausted());
    client.fail_next(Operation::UpdateDatabaseDdl, resource_exhausted());
    let mut manager = manager(&client);
    let error = manager.execute_ddl_statement(CREATE_TABLE).unwrap_err();
    assert_eq!(error.error_code(), "RemoteError");
    assert_eq!(error.remote_error(), Some(&resource_exhausted()));
    assert_eq!(client.count(Operation::UpdateDatabaseDdl), 2);
    assert_eq!(manager.state(), ResourceState::Uninitialized);
}

#[test]
fn fatal_provisioning_failures_are_not_retried() {
    for operation in [
        Operation::CreateInstance,
        Operation::CreateDatabase,
        Operation::UpdateDatabaseDdl,
    ] {
        let client = FakeSpannerClient::new();
        let cause = RemoteError::new(ErrorCode::PermissionDenied, "permission denied");
        client.fail_next(operation, cause.clone());
        let mut manager = manager(&client);
        let error = manager.execute_ddl_statement(CREATE_TABLE).unwrap_err();
        assert_eq!(error.remote_error(), Some(&cause));
        assert_eq!(
            error.source().unwrap().downcast_ref::<RemoteError>(),
            Some(&cause)
        );
        assert_eq!(client.count(operation), 1, "{operation:?}");
        assert_eq!(client.count(Operation::CreateInstance), 1);
        assert_eq!(manager.state(), ResourceState::Uninitialized);
    }
}

#[test]
fn ddl_failure_after_provisioning_is_wrapped_and_not_retried() {
    let client = FakeSpannerClient::new();
    let mut manager = provisioned(&client);
    client.fail_next(Operation::UpdateDatabaseDdl, resource_exhausted());
    let error = manager
        .execute_ddl_statement("ALTER TABLE Singers ADD COLUMN Age INT64")
        .unwrap_err();
    assert_eq!(error.error_code(), "RemoteError");
    assert_eq!(client.count(Operation::UpdateDatabaseDdl), 2);
    assert_eq!(manager.state(), ResourceState::Ready);
}

#[test]
fn write_delivers_mutations_unchanged() {
    let client = FakeSpannerClient::new();
    let manager = provisioned(&client);
    let mutations = vec![
        singer(2, "Catalina"),
        singer(1, "Marc"),
        Mutation::delete("Singers", KeySet::single_key(vec![Value::Int64(3)])),
    ];
    manager.write_batch(&mutations).unwrap();
    manager.write(&singer(4, "Alice")).unwrap();
    let writes: Vec<Call> = client
        .calls()
        .into_iter()
        .filter(|call| matches!(call, Call::Write(..)))
        .collect();
    assert_eq!(
        writes,
        vec![
            Call::Write(manager.database_name(), mutations),
            Call::Write(manager.database_name(), vec![singer(4, "Alice")]),
        ]
    );
}

#[test]
fn write_failures_are_wrapped() {
    let client = FakeSpannerClient::new();
    let manager = provisioned(&client);
    let cause = RemoteError::new(ErrorCode::NotFound, "Table not found: Singers");
    client.fail_next(Operation::Write, cause.clone());
    let error = manager.write(&singer(1, "Marc")).unwrap_err();
    assert_eq!(error.error_code(), "RemoteError");
    assert_ne!(error.to_string(), cause.to_string());
    assert_eq!(
        error.source().unwrap().downcast_ref::<RemoteError>(),
        Some(&cause)
    );
}

#[test]
fn write_in_transaction_buffers_and_commits() {
    let client = FakeSpannerClient::new();
    let manager = provisioned(&client);
    let mutations = vec![singer(1, "Marc"), singer(2, "Catalina")];
    manager.write_in_transaction(&mutations).unwrap();
    let calls = client.calls();
    assert_eq!(
        calls[calls.len() - 3..],
        [
            Call::ReadWriteTransaction(manager.database_name()),
            Call::Buffer(mutations.clone()),
            Call::Commit(mutations),
        ]
    );
    assert_eq!(
        client.rows("Singers"),
        vec![singer_row(1, "Marc"), singer_row(2, "Catalina")]
    );
}

#[test]
fn write_in_transaction_failures_are_not_wrapped() {
    let client = FakeSpannerClient::new();
    let manager = provisioned(&client);
    let cause = RemoteError::new(ErrorCode::NotFound, "Not found");
    client.fail_next(Operation::Commit, cause.clone());
    let error = manager.write_in_transaction(&[singer(1, "Marc")]).unwrap_err();
    assert!(matches!(&error, ResourceManagerError::Transaction(e) if e == &cause));
    assert_eq!(error.to_string(), cause.to_string());
    assert!(error.source().is_none());
}

#[test]
fn dml_statements_run_as_one_batch() {
    let client = FakeSpannerClient::new();
    let manager = provisioned(&client);
    let statements = vec![
        "INSERT INTO Singers (SingerId, FirstName) VALUES (1, 'Marc')".to_string(),
        "UPDATE Singers SET FirstName = 'Marcus' WHERE SingerId = 1".to_string(),
    ];
    manager.execute_dml_statements(&statements).unwrap();
    let calls = client.calls();
    assert_eq!(
        calls[calls.len() - 3..],
        [
            Call::ReadWriteTransaction(manager.database_name()),
            Call::BatchUpdate(statements.iter().map(Statement::of).collect()),
            Call::Commit(Vec::new()),
        ]
    );
}

#[test]
fn dml_failures_are_wrapped() {
    let client = FakeSpannerClient::new();
    let manager = provisioned(&client);
    let cause = RemoteError::new(ErrorCode::DeadlineExceeded, "deadline exceeded");
    client.fail_next(Operation::BatchUpdate, cause.clone());
    let error = manager
        .execute_dml_statements(&["DELETE FROM Singers WHERE TRUE".to_string()])
        .unwrap_err();
    assert!(matches!(error, ResourceManagerError::Remote { .. }));
    assert!(error.to_string().starts_with("Failed to execute DML statements"));
    assert_eq!(error.remote_error(), Some(&cause));
}

#[test]
fn both_read_variants_return_the_same_rows_in_order() {
    let client = FakeSpannerClient::new();
    let manager = provisioned(&client);
    let rows = vec![
        singer_row(3, "Alice"),
        singer_row(1, "Marc"),
        singer_row(2, "Catalina"),
    ];
    client.set_rows("Singers", rows.clone());

    let by_slice = manager
        .read_table_records("Singers", &["SingerId", "FirstName"])
        .unwrap();
    let by_names = manager
        .read_table_records_with_column_names(
            "Singers",
            &["SingerId".to_string(), "FirstName".to_string()],
        )
        .unwrap();
    assert_eq!(by_slice, rows);
    assert_eq!(by_names, rows);
    assert_eq!(
        client.calls().last(),
        Some(&Call::Read {
            database: manager.database_name(),
            table: "Singers".to_string(),
            columns: vec!["SingerId".to_string(), "FirstName".to_string()],
        })
    );
}

#[test]
fn read_failures_are_wrapped() {
    let client = FakeSpannerClient::new();
    let manager = provisioned(&client);
    let cause = RemoteError::new(ErrorCode::NotFound, "Table not found: Missing");
    client.fail_next(Operation::Read, cause.clone());
    let error = manager.read_table_records("Missing", &["Id"]).unwrap_err();
    assert!(error.to_string().contains("'Missing'"));
    assert_eq!(error.remote_error(), Some(&cause));
}

#[test]
fn cleanup_deletes_the_instance_and_closes_the_client() {
    let client = FakeSpannerClient::new();
    let mut manager = provisioned(&client);
    manager.cleanup_all().unwrap();
    assert_eq!(client.count(Operation::DeleteInstance), 1);
    assert_eq!(client.count(Operation::DropDatabase), 0);
    assert!(!client.instance_exists(&manager.instance_name()));
    assert!(client.is_closed());
    assert_eq!(manager.state(), ResourceState::CleanedUp);
}

#[test]
fn cleanup_of_static_instance_only_drops_the_database() {
    let client = FakeSpannerClient::new();
    let mut manager = static_manager(&client);
    manager.execute_ddl_statement(CREATE_TABLE).unwrap();
    manager.cleanup_all().unwrap();
    assert_eq!(client.count(Operation::DeleteInstance), 0);
    assert_eq!(
        client.calls()[client.calls().len() - 2..],
        [
            Call::DropDatabase(DatabaseName::new(
                PROJECT_ID,
                STATIC_INSTANCE,
                manager.database_id()
            )),
            Call::Close,
        ]
    );
    assert!(client.is_closed());
}

#[test]
fn cleanup_before_provisioning_succeeds() {
    let client = FakeSpannerClient::new();
    let mut manager = manager(&client);
    // Nothing was created, so the instance is not found.
    manager.cleanup_all().unwrap();
    assert_eq!(manager.state(), ResourceState::CleanedUp);
    assert!(client.is_closed());
}

#[test]
fn cleanup_keeps_a_named_instance_it_did_not_create() {
    let client = FakeSpannerClient::new();
    client.fail_next(
        Operation::CreateInstance,
        RemoteError::new(ErrorCode::AlreadyExists, "Instance already exists: shared-instance"),
    );
    let mut manager = builder()
        .set_instance_id("shared-instance")
        .build(client.clone())
        .unwrap();
    let error = manager.execute_ddl_statement(CREATE_TABLE).unwrap_err();
    assert_eq!(
        error.remote_error().map(|e| e.code()),
        Some(ErrorCode::AlreadyExists)
    );
    assert!(!manager.resource().instance_created());

    manager.cleanup_all().unwrap();
    assert_eq!(client.count(Operation::DeleteInstance), 0);
    assert!(client.is_closed());
    assert_eq!(manager.state(), ResourceState::CleanedUp);
}

#[test]
fn cleanup_deletes_a_named_instance_it_created() {
    let client = FakeSpannerClient::new();
    let mut manager = builder()
        .set_instance_id("named-instance")
        .build(client.clone())
        .unwrap();
    manager.execute_ddl_statement(CREATE_TABLE).unwrap();
    manager.cleanup_all().unwrap();
    assert_eq!(
        client.calls()[client.calls().len() - 2..],
        [
            Call::DeleteInstance(InstanceName::new(PROJECT_ID, "named-instance")),
            Call::Close,
        ]
    );
}

#[test]
fn failed_cleanup_still_ends_the_lifecycle() {
    let client = FakeSpannerClient::new();
    let mut manager = provisioned(&client);
    let cause = RemoteError::new(ErrorCode::PermissionDenied, "permission denied");
    client.fail_next(Operation::DeleteInstance, cause.clone());
    let error = manager.cleanup_all().unwrap_err();
    assert_eq!(error.remote_error(), Some(&cause));
    assert_eq!(manager.state(), ResourceState::CleanedUp);
    assert!(client.is_closed());

    assert_invalid_state(manager.cleanup_all());
    assert_invalid_state(manager.write(&singer(1, "Marc")));
    assert_eq!(client.count(Operation::DeleteInstance), 1);
}

#[test]
fn every_operation_fails_after_cleanup() {
    let client = FakeSpannerClient::new();
    let mut manager = provisioned(&client);
    manager.cleanup_all().unwrap();
    let calls_before = client.calls().len();

    assert_invalid_state(manager.execute_ddl_statement(CREATE_TABLE));
    assert_invalid_state(manager.write(&singer(1, "Marc")));
    assert_invalid_state(manager.write_in_transaction(&[singer(1, "Marc")]));
    assert_invalid_state(manager.execute_dml_statements(&["DELETE FROM Singers WHERE TRUE".into()]));
    assert_invalid_state(manager.read_table_records("Singers", &["SingerId"]));
    assert_invalid_state(manager.cleanup_all());
    assert_eq!(client.calls().len(), calls_before);
}

#[test]
fn closed_client_makes_the_manager_unusable() {
    let client = FakeSpannerClient::new();
    let manager = provisioned(&client);
    let mut handle = client.clone();
    handle.close();
    assert_eq!(manager.state(), ResourceState::CleanedUp);
    assert_invalid_state(manager.write(&singer(1, "Marc")));
}

#[test]
fn collect_metrics_requires_a_monitoring_client() {
    let client = FakeSpannerClient::new();
    let manager = provisioned(&client);
    let mut metrics = HashMap::new();
    let error = manager.collect_metrics(&mut metrics).unwrap_err();
    assert!(matches!(
        error,
        ResourceManagerError::MonitoringClientNotConfigured
    ));
    assert!(metrics.is_empty());
}

#[test]
fn collect_metrics_requires_provisioning() {
    let client = FakeSpannerClient::new();
    let monitoring = FakeMonitoringClient::with_values(0.1, 0.3);
    let manager = builder()
        .set_monitoring_client(monitoring.clone())
        .build(client)
        .unwrap();
    let mut metrics = HashMap::new();
    assert_invalid_state(manager.collect_metrics(&mut metrics));
    assert!(metrics.is_empty());
    assert!(monitoring.queries().is_empty());
}

#[test]
fn collect_metrics_adds_average_and_max_cpu_utilization() {
    let client = FakeSpannerClient::new();
    let monitoring = FakeMonitoringClient::with_values(0.1, 0.3);
    let mut manager = builder()
        .set_monitoring_client(monitoring.clone())
        .build(client)
        .unwrap();
    manager.execute_ddl_statement(CREATE_TABLE).unwrap();

    let mut metrics = HashMap::new();
    manager.collect_metrics(&mut metrics).unwrap();
    manager.collect_metrics(&mut metrics).unwrap();
    assert_eq!(metrics.len(), 2);
    assert_eq!(metrics["Spanner_AverageCpuUtilization"], 0.1);
    assert_eq!(metrics["Spanner_MaxCpuUtilization"], 0.3);

    let queries = monitoring.queries();
    assert_eq!(queries.len(), 4);
    for query in &queries {
        assert_eq!(query.project_id, PROJECT_ID);
        assert_eq!(query.filter, cpu_utilization_filter(manager.instance_id()));
        assert_eq!(
            Some(query.interval.start),
            manager.resource().provisioned_at()
        );
        assert!(query.interval.end >= query.interval.start);
        assert_eq!(query.aggregation.alignment_period, Duration::from_secs(60));
    }
    assert_eq!(queries[0].aggregation.reducer, Reducer::Mean);
    assert_eq!(queries[1].aggregation.reducer, Reducer::Max);
}

#[test]
fn monitoring_failures_are_wrapped() {
    let client = FakeSpannerClient::new();
    let monitoring = FakeMonitoringClient::with_values(0.1, 0.3);
    monitoring.fail_next(
        Reducer::Mean,
        RemoteError::new(ErrorCode::PermissionDenied, "monitoring.timeSeries.list denied"),
    );
    let mut manager = builder()
        .set_monitoring_client(monitoring)
        .build(client)
        .unwrap();
    manager.execute_ddl_statement(CREATE_TABLE).unwrap();
    let error = manager.collect_metrics(&mut HashMap::new()).unwrap_err();
    assert_eq!(error.error_code(), "RemoteError");
    assert!(error.to_string().contains("Spanner_AverageCpuUtilization"));
    assert_eq!(
        error.remote_error().map(|e| e.code()),
        Some(ErrorCode::PermissionDenied)
    );
}

#[test]
fn failed_max_query_leaves_metrics_untouched() {
    let client = FakeSpannerClient::new();
    let monitoring = FakeMonitoringClient::with_values(0.2, 0.4);
    monitoring.fail_next(
        Reducer::Max,
        RemoteError::new(ErrorCode::Unavailable, "monitoring backend unavailable"),
    );
    let mut manager = builder()
        .set_monitoring_client(monitoring.clone())
        .build(client)
        .unwrap();
    manager.execute_ddl_statement(CREATE_TABLE).unwrap();

    let mut metrics = HashMap::from([("Other".to_string(), 1.0)]);
    let error = manager.collect_metrics(&mut metrics).unwrap_err();
    assert!(error.to_string().contains("Spanner_MaxCpuUtilization"));
    assert_eq!(metrics, HashMap::from([("Other".to_string(), 1.0)]));
    assert_eq!(monitoring.queries().len(), 2);

    // The failure was one-shot.
    manager.collect_metrics(&mut metrics).unwrap();
    assert_eq!(metrics.len(), 3);
    assert_eq!(metrics["Spanner_MaxCpuUtilization"], 0.4);
}

#[test]
fn metrics_without_samples_are_nan() {
    let client = FakeSpannerClient::new();
    let mut manager = builder()
        .set_monitoring_client(FakeMonitoringClient::default())
        .build(client)
        .unwrap();
    manager.execute_ddl_statement(CREATE_TABLE).unwrap();

    let mut metrics = HashMap::new();
    manager.collect_metrics(&mut metrics).unwrap();
    assert_eq!(metrics.len(), 2);
    assert!(metrics["Spanner_AverageCpuUtilization"].is_nan());
    assert!(metrics["Spanner_MaxCpuUtilization"].is_nan());
}

/// Operations applied to both the manager and the model.
#[derive(Debug, Clone, Arbitrary)]
enum Action {
    ExecuteDdl,
    Write(#[proptest(strategy = "0i64..4")] i64),
    WriteInTransaction(#[proptest(strategy = "0i64..4")] i64),
    ExecuteDml,
    Read,
    CollectMetrics,
    Cleanup,
    /// Makes the next schema change fail; `true` for resource exhaustion.
    FailNextDdl(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Ok,
    InvalidState,
    Remote,
}

fn outcome<T>(result: &Result<T, ResourceManagerError>) -> Outcome {
    match result {
        Ok(_) => Outcome::Ok,
        Err(e) if e.is_invalid_state() => Outcome::InvalidState,
        Err(_) => Outcome::Remote,
    }
}

/// Reference behavior of the manager.
struct Model {
    state: ResourceState,
    /// Pending schema change failures; `true` for resource exhaustion.
    ddl_failures: VecDeque<bool>,
    rows: Vec<i64>,
}

impl Model {
    fn require(&self, state: ResourceState) -> Outcome {
        if self.state == state {
            Outcome::Ok
        } else {
            Outcome::InvalidState
        }
    }

    fn execute_ddl(&mut self) -> Outcome {
        match self.state {
            ResourceState::CleanedUp => Outcome::InvalidState,
            ResourceState::Ready => match self.ddl_failures.pop_front() {
                Some(_) => Outcome::Remote,
                None => Outcome::Ok,
            },
            ResourceState::Uninitialized => {
                let outcome = match self.ddl_failures.pop_front() {
                    None => Outcome::Ok,
                    Some(false) => Outcome::Remote,
                    Some(true) => match self.ddl_failures.pop_front() {
                        None => Outcome::Ok,
                        Some(_) => Outcome::Remote,
                    },
                };
                if outcome == Outcome::Ok {
                    self.state = ResourceState::Ready;
                }
                outcome
            }
        }
    }

    fn write(&mut self, id: i64) -> Outcome {
        let outcome = self.require(ResourceState::Ready);
        if outcome == Outcome::Ok && !self.rows.contains(&id) {
            self.rows.push(id);
        }
        outcome
    }

    fn cleanup(&mut self) -> Outcome {
        if self.state == ResourceState::CleanedUp {
            return Outcome::InvalidState;
        }
        self.state = ResourceState::CleanedUp;
        Outcome::Ok
    }
}

fn singer_name(id: i64) -> String {
    format!("singer-{id}")
}

#[test]
fn manager_behaves_like_model() {
    let _r = env_logger::try_init();
    let config = Config {
        cases: 128,
        source_file: Some("src/manager/test.rs"),
        ..Config::default()
    };
    let mut runner = TestRunner::new(config);
    let res = runner.run(
        &prop::collection::vec(any::<Action>(), 0..32),
        |actions: Vec<Action>| {
            let client = FakeSpannerClient::new();
            let mut manager = builder()
                .set_monitoring_client(FakeMonitoringClient::with_values(0.5, 0.75))
                .build(client.clone())
                .unwrap();
            let mut model = Model {
                state: ResourceState::Uninitialized,
                ddl_failures: VecDeque::new(),
                rows: Vec::new(),
            };

            for (i, action) in actions.into_iter().enumerate() {
                let (expected, actual) = match action {
                    Action::ExecuteDdl => (
                        model.execute_ddl(),
                        outcome(&manager.execute_ddl_statement(CREATE_TABLE)),
                    ),
                    Action::Write(id) => (
                        model.write(id),
                        outcome(&manager.write(&singer(id, &singer_name(id)))),
                    ),
                    Action::WriteInTransaction(id) => (
                        model.write(id),
                        outcome(&manager.write_in_transaction(&[singer(id, &singer_name(id))])),
                    ),
                    Action::ExecuteDml => (
                        model.require(ResourceState::Ready),
                        outcome(&manager.execute_dml_statements(&[
                            "UPDATE Singers SET FirstName = FirstName WHERE TRUE".to_string(),
                        ])),
                    ),
                    Action::Read => {
                        let result = manager.read_table_records("Singers", &["SingerId", "FirstName"]);
                        if let Ok(rows) = &result {
                            let expected: Vec<Struct> = model
                                .rows
                                .iter()
                                .map(|id| singer_row(*id, &singer_name(*id)))
                                .collect();
                            prop_assert_eq!(rows, &expected, "rows after action {}", i);
                        }
                        (model.require(ResourceState::Ready), outcome(&result))
                    }
                    Action::CollectMetrics => {
                        let mut metrics = HashMap::new();
                        let result = manager.collect_metrics(&mut metrics);
                        if result.is_ok() {
                            prop_assert_eq!(metrics.len(), 2);
                        }
                        (model.require(ResourceState::Ready), outcome(&result))
                    }
                    Action::Cleanup => (model.cleanup(), outcome(&manager.cleanup_all())),
                    Action::FailNextDdl(transient) => {
                        let error = if transient {
                            resource_exhausted()
                        } else {
                            RemoteError::new(ErrorCode::InvalidArgument, "syntax error")
                        };
                        client.fail_next(Operation::UpdateDatabaseDdl, error);
                        model.ddl_failures.push_back(transient);
                        (Outcome::Ok, Outcome::Ok)
                    }
                };
                prop_assert_eq!(expected, actual, "outcome of action {}", i);
                prop_assert_eq!(model.state, manager.state(), "state after action {}", i);
            }
            Ok(())
        },
    );
    if let Err(e) = res {
        panic!("{e:#}");
    }
}
