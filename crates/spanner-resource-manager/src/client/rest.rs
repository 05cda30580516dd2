//! Blocking [`SpannerClient`] over the Cloud Spanner REST API (v1).
//!
//! Admin calls return long-running operations which are polled until done.
//! Data calls go through one session per database, created lazily and
//! deleted by [`SpannerClient::close`]. Read-write transactions that the
//! service aborts are re-run from the start, as the official clients do.

use crate::client::types::{
    DatabaseName, Dialect, InstanceConfig, InstanceName, KeySet, Mutation, MutationOp, Statement,
    Struct, Value,
};
use crate::client::{
    BufferedResultSet, ErrorCode, RemoteError, ResultSet, SpannerClient, TransactionContext,
    TransactionWork,
};
use crate::config::DEFAULT_SPANNER_HOST;
use anyhow::{anyhow, bail, Context};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use log::{debug, trace, warn};
use reqwest::blocking::Client as HttpClient;
use reqwest::{Method, StatusCode};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use url::Url;

/// Attempts of a read-write transaction before an `ABORTED` error is returned.
const MAX_TRANSACTION_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct RestClientConfig {
    /// Base URL, e.g. `https://spanner.googleapis.com` or `http://localhost:9020`.
    pub endpoint: String,
    /// Bearer token; omitted from requests when `None`.
    pub access_token: Option<String>,
    pub request_timeout: Duration,
    pub operation_poll_interval: Duration,
    /// Upper bound on waiting for a long-running operation.
    pub operation_timeout: Duration,
}

impl Default for RestClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_SPANNER_HOST.to_string(),
            access_token: None,
            request_timeout: Duration::from_secs(60),
            operation_poll_interval: Duration::from_secs(1),
            operation_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// JSON-over-HTTP plumbing shared by the Spanner and Monitoring clients.
pub(crate) struct HttpTransport {
    http: HttpClient,
    base: Url,
    access_token: Option<String>,
}

impl HttpTransport {
    pub(crate) fn new(
        endpoint: &str,
        access_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let mut base = Url::parse(endpoint).map_err(|e| {
            RemoteError::new(
                ErrorCode::InvalidArgument,
                format!("invalid endpoint '{endpoint}': {e}"),
            )
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(transport_error)?;
        Ok(Self {
            http,
            base,
            access_token,
        })
    }

    /// Resolves `path` relative to the endpoint.
    pub(crate) fn url(&self, path: &str) -> Result<Url, RemoteError> {
        self.base.join(path).map_err(|e| {
            RemoteError::new(
                ErrorCode::InvalidArgument,
                format!("invalid request path '{path}': {e}"),
            )
        })
    }

    pub(crate) fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<&JsonValue>,
    ) -> Result<T, RemoteError> {
        trace!("{method} {url}");
        let mut request = self.http.request(method, url);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().map_err(transport_error)?;
        let status = response.status();
        let text = response.text().map_err(transport_error)?;
        if !status.is_success() {
            return Err(http_error(status, &text));
        }
        decode_body(&text).map_err(|e| {
            RemoteError::new(
                ErrorCode::Internal,
                format!("unable to decode response: {e:#}"),
            )
        })
    }
}

fn decode_body<T: DeserializeOwned>(text: &str) -> anyhow::Result<T> {
    let text = if text.trim().is_empty() { "{}" } else { text };
    serde_json::from_str(text).context("malformed response body")
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetails,
}

#[derive(Deserialize)]
struct ErrorDetails {
    #[serde(default)]
    message: String,
    status: Option<String>,
}

/// Maps a non-2xx response to a [`RemoteError`], preferring the status name
/// of a Google JSON error body over the HTTP status.
pub(crate) fn http_error(status: StatusCode, body: &str) -> RemoteError {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody { error }) => {
            let code = error
                .status
                .as_deref()
                .and_then(ErrorCode::from_status_name)
                .unwrap_or_else(|| ErrorCode::from_http_status(status.as_u16()));
            RemoteError::new(code, error.message)
        }
        Err(_) => RemoteError::new(
            ErrorCode::from_http_status(status.as_u16()),
            format!("HTTP {status}: {}", body.trim()),
        ),
    }
}

pub(crate) fn transport_error(error: reqwest::Error) -> RemoteError {
    let code = if error.is_timeout() {
        ErrorCode::DeadlineExceeded
    } else if error.is_connect() {
        ErrorCode::Unavailable
    } else {
        ErrorCode::Unknown
    };
    RemoteError::new(code, error.to_string())
}

#[derive(Deserialize)]
struct Operation {
    #[serde(default)]
    name: String,
    #[serde(default)]
    done: bool,
    error: Option<Status>,
}

#[derive(Deserialize)]
struct Status {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

impl Status {
    fn into_error(self) -> Option<RemoteError> {
        (self.code != 0)
            .then(|| RemoteError::new(ErrorCode::from_grpc_code(self.code), self.message))
    }
}

#[derive(Deserialize)]
struct Session {
    name: String,
}

#[derive(Deserialize)]
struct Transaction {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitResponse {
    commit_timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteBatchDmlResponse {
    #[serde(default)]
    result_sets: Vec<ResultSetJson>,
    status: Option<Status>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetJson {
    metadata: Option<ResultSetMetadata>,
    #[serde(default)]
    rows: Vec<Vec<JsonValue>>,
    stats: Option<ResultSetStats>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetadata {
    row_type: StructType,
}

#[derive(Deserialize)]
struct StructType {
    #[serde(default)]
    fields: Vec<Field>,
}

#[derive(Deserialize)]
struct Field {
    #[serde(default)]
    name: String,
    #[serde(rename = "type")]
    field_type: FieldType,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FieldType {
    code: String,
    array_element_type: Option<Box<FieldType>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetStats {
    /// INT64 values are strings in JSON.
    row_count_exact: Option<String>,
}

pub struct RestSpannerClient {
    transport: HttpTransport,
    poll_interval: Duration,
    operation_timeout: Duration,
    sessions: Mutex<HashMap<DatabaseName, String>>,
    closed: bool,
}

impl RestSpannerClient {
    pub fn new(config: RestClientConfig) -> Result<Self, RemoteError> {
        Ok(Self {
            transport: HttpTransport::new(
                &config.endpoint,
                config.access_token,
                config.request_timeout,
            )?,
            poll_interval: config.operation_poll_interval,
            operation_timeout: config.operation_timeout,
            sessions: Mutex::new(HashMap::new()),
            closed: false,
        })
    }

    fn check_open(&self) -> Result<(), RemoteError> {
        if self.closed {
            Err(RemoteError::new(
                ErrorCode::FailedPrecondition,
                "Spanner client has been closed",
            ))
        } else {
            Ok(())
        }
    }

    fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&JsonValue>,
    ) -> Result<T, RemoteError> {
        self.check_open()?;
        let url = self.transport.url(&format!("v1/{path}"))?;
        self.transport.send(method, url, body)
    }

    fn wait_for_operation(&self, mut operation: Operation) -> Result<(), RemoteError> {
        let started = Instant::now();
        while !operation.done {
            if started.elapsed() > self.operation_timeout {
                return Err(RemoteError::new(
                    ErrorCode::DeadlineExceeded,
                    format!(
                        "operation '{}' did not complete within {:?}",
                        operation.name, self.operation_timeout
                    ),
                ));
            }
            thread::sleep(self.poll_interval);
            let name = operation.name;
            operation = self.call(Method::GET, &name, None)?;
            if operation.name.is_empty() {
                operation.name = name;
            }
        }
        debug!("Operation '{}' completed", operation.name);
        match operation.error.and_then(Status::into_error) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn session(&self, database: &DatabaseName) -> Result<String, RemoteError> {
        let cached = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(database)
            .cloned();
        if let Some(session) = cached {
            return Ok(session);
        }
        let session: Session =
            self.call(Method::POST, &format!("{database}/sessions"), Some(&json!({})))?;
        debug!("Created session '{}'", session.name);
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(database.clone(), session.name.clone());
        Ok(session.name)
    }

    fn begin_transaction(&self, session: &str) -> Result<String, RemoteError> {
        let transaction: Transaction = self.call(
            Method::POST,
            &format!("{session}:beginTransaction"),
            Some(&json!({"options": {"readWrite": {}}})),
        )?;
        Ok(transaction.id)
    }

    /// Commits `mutations`, inside `transaction_id` or as a single-use transaction.
    fn commit(
        &self,
        session: &str,
        transaction_id: Option<&str>,
        mutations: &[Mutation],
    ) -> Result<DateTime<Utc>, RemoteError> {
        let mut body = json!({
            "mutations": mutations.iter().map(encode_mutation).collect::<Vec<_>>(),
        });
        match transaction_id {
            Some(id) => body["transactionId"] = json!(id),
            None => body["singleUseTransaction"] = json!({"readWrite": {}}),
        }
        let response: CommitResponse =
            self.call(Method::POST, &format!("{session}:commit"), Some(&body))?;
        Ok(response.commit_timestamp)
    }

    fn rollback(&self, session: &str, transaction_id: &str) {
        if let Err(e) = self.call::<IgnoredAny>(
            Method::POST,
            &format!("{session}:rollback"),
            Some(&json!({"transactionId": transaction_id})),
        ) {
            warn!("Unable to roll back transaction: {e}");
        }
    }
}

struct RestTransactionContext<'a> {
    client: &'a RestSpannerClient,
    session: &'a str,
    transaction_id: &'a str,
    mutations: Vec<Mutation>,
    seqno: i64,
}

impl TransactionContext for RestTransactionContext<'_> {
    fn buffer(&mut self, mutations: &[Mutation]) {
        self.mutations.extend_from_slice(mutations);
    }

    fn batch_update(&mut self, statements: &[Statement]) -> Result<Vec<i64>, RemoteError> {
        self.seqno += 1;
        let body = json!({
            "transaction": {"id": self.transaction_id},
            "statements": statements.iter().map(|s| json!({"sql": s.sql()})).collect::<Vec<_>>(),
            "seqno": self.seqno.to_string(),
        });
        let response: ExecuteBatchDmlResponse = self.client.call(
            Method::POST,
            &format!("{}:executeBatchDml", self.session),
            Some(&body),
        )?;
        // A non-OK status means the statement after the returned result sets failed.
        if let Some(error) = response.status.and_then(Status::into_error) {
            return Err(error);
        }
        Ok(response
            .result_sets
            .iter()
            .map(|result_set| {
                result_set
                    .stats
                    .as_ref()
                    .and_then(|stats| stats.row_count_exact.as_deref())
                    .and_then(|count| count.parse().ok())
                    .unwrap_or(0)
            })
            .collect())
    }
}

impl SpannerClient for RestSpannerClient {
    fn create_instance(&self, instance: &InstanceConfig) -> Result<(), RemoteError> {
        let body = json!({
            "instanceId": instance.name.instance_id,
            "instance": {
                "config": format!(
                    "projects/{}/instanceConfigs/{}",
                    instance.name.project_id, instance.config
                ),
                "displayName": instance.display_name,
                "nodeCount": instance.node_count,
            },
        });
        let operation: Operation = self.call(
            Method::POST,
            &format!("projects/{}/instances", instance.name.project_id),
            Some(&body),
        )?;
        self.wait_for_operation(operation)
    }

    fn delete_instance(&self, instance: &InstanceName) -> Result<(), RemoteError> {
        self.call::<IgnoredAny>(Method::DELETE, &instance.to_string(), None)?;
        Ok(())
    }

    fn create_database(
        &self,
        database: &DatabaseName,
        dialect: Dialect,
    ) -> Result<(), RemoteError> {
        let body = json!({
            "createStatement": dialect.create_database_statement(&database.database_id),
            "databaseDialect": dialect.to_string(),
        });
        let operation: Operation = self.call(
            Method::POST,
            &format!("{}/databases", database.instance()),
            Some(&body),
        )?;
        self.wait_for_operation(operation)
    }

    fn update_database_ddl(
        &self,
        database: &DatabaseName,
        statements: &[String],
    ) -> Result<(), RemoteError> {
        let operation: Operation = self.call(
            Method::PATCH,
            &format!("{database}/ddl"),
            Some(&json!({"statements": statements})),
        )?;
        self.wait_for_operation(operation)
    }

    fn drop_database(&self, database: &DatabaseName) -> Result<(), RemoteError> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(database);
        self.call::<IgnoredAny>(Method::DELETE, &database.to_string(), None)?;
        Ok(())
    }

    fn write(
        &self,
        database: &DatabaseName,
        mutations: &[Mutation],
    ) -> Result<DateTime<Utc>, RemoteError> {
        let session = self.session(database)?;
        self.commit(&session, None, mutations)
    }

    fn read_write_transaction(
        &self,
        database: &DatabaseName,
        work: &mut TransactionWork<'_>,
    ) -> Result<(), RemoteError> {
        let session = self.session(database)?;
        let mut attempt = 1;
        loop {
            let transaction_id = self.begin_transaction(&session)?;
            let mut context = RestTransactionContext {
                client: self,
                session: &session,
                transaction_id: &transaction_id,
                mutations: Vec::new(),
                seqno: 0,
            };
            let result = match work(&mut context) {
                Ok(()) => self
                    .commit(&session, Some(&transaction_id), &context.mutations)
                    .map(|_| ()),
                Err(e) => {
                    self.rollback(&session, &transaction_id);
                    Err(e)
                }
            };
            match result {
                Err(e) if e.is_aborted() && attempt < MAX_TRANSACTION_ATTEMPTS => {
                    debug!("Transaction aborted on attempt {attempt}, retrying: {e}");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn read(
        &self,
        database: &DatabaseName,
        table: &str,
        key_set: &KeySet,
        columns: &[String],
    ) -> Result<Box<dyn ResultSet>, RemoteError> {
        let session = self.session(database)?;
        let body = json!({
            "transaction": {"singleUse": {"readOnly": {"strong": true}}},
            "table": table,
            "columns": columns,
            "keySet": encode_key_set(key_set),
        });
        let response: ResultSetJson =
            self.call(Method::POST, &format!("{session}:read"), Some(&body))?;
        let rows = decode_rows(&response).map_err(|e| {
            RemoteError::new(
                ErrorCode::Internal,
                format!("unable to decode rows of table '{table}': {e:#}"),
            )
        })?;
        Ok(Box::new(BufferedResultSet::new(rows)))
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        let sessions: Vec<String> = self
            .sessions
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in sessions {
            if let Err(e) = self.call::<IgnoredAny>(Method::DELETE, &session, None) {
                debug!("Unable to delete session '{session}': {e}");
            }
        }
        self.closed = true;
    }
}

fn encode_value(value: &Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => json!(b),
        Value::Int64(i) => json!(i.to_string()),
        Value::Float64(f) if f.is_nan() => json!("NaN"),
        Value::Float64(f) if f.is_infinite() => {
            json!(if *f > 0.0 { "Infinity" } else { "-Infinity" })
        }
        Value::Float64(f) => json!(f),
        Value::String(s) | Value::Numeric(s) => json!(s),
        Value::Bytes(bytes) => json!(BASE64.encode(bytes)),
        Value::Timestamp(ts) => json!(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        Value::Date(date) => json!(date.format("%Y-%m-%d").to_string()),
        Value::Json(doc) => json!(doc.to_string()),
        Value::Array(items) => JsonValue::Array(items.iter().map(encode_value).collect()),
    }
}

fn encode_key_set(key_set: &KeySet) -> JsonValue {
    match key_set {
        KeySet::All => json!({"all": true}),
        KeySet::Keys(keys) => json!({
            "keys": keys
                .iter()
                .map(|key| key.iter().map(encode_value).collect::<Vec<_>>())
                .collect::<Vec<_>>(),
        }),
    }
}

fn encode_mutation(mutation: &Mutation) -> JsonValue {
    let write = match (mutation.op(), mutation.key_set()) {
        (MutationOp::Delete, Some(key_set)) => json!({
            "table": mutation.table(),
            "keySet": encode_key_set(key_set),
        }),
        _ => json!({
            "table": mutation.table(),
            "columns": mutation.columns(),
            "values": [mutation.values().iter().map(encode_value).collect::<Vec<_>>()],
        }),
    };
    let mut object = Map::new();
    object.insert(mutation.op().json_name().to_string(), write);
    JsonValue::Object(object)
}

fn decode_rows(result_set: &ResultSetJson) -> anyhow::Result<Vec<Struct>> {
    let fields = result_set
        .metadata
        .as_ref()
        .map(|metadata| metadata.row_type.fields.as_slice())
        .unwrap_or_default();
    result_set
        .rows
        .iter()
        .map(|row| {
            if row.len() != fields.len() {
                bail!(
                    "row has {} values but the row type has {} fields",
                    row.len(),
                    fields.len()
                );
            }
            fields
                .iter()
                .zip(row)
                .map(|(field, value)| {
                    let value = decode_value(value, &field.field_type)
                        .with_context(|| format!("column '{}'", field.name))?;
                    Ok((field.name.clone(), value))
                })
                .collect::<anyhow::Result<Struct>>()
        })
        .collect()
}

fn decode_value(value: &JsonValue, field_type: &FieldType) -> anyhow::Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    Ok(match field_type.code.as_str() {
        "BOOL" => Value::Bool(
            value
                .as_bool()
                .ok_or_else(|| anyhow!("expected a boolean, found {value}"))?,
        ),
        "INT64" => Value::Int64(as_str(value)?.parse().context("invalid INT64")?),
        "FLOAT64" | "FLOAT32" => Value::Float64(match value {
            JsonValue::Number(n) => n
                .as_f64()
                .ok_or_else(|| anyhow!("invalid float {n}"))?,
            JsonValue::String(s) => match s.as_str() {
                "NaN" => f64::NAN,
                "Infinity" => f64::INFINITY,
                "-Infinity" => f64::NEG_INFINITY,
                other => other.parse().context("invalid FLOAT64")?,
            },
            other => bail!("expected a number, found {other}"),
        }),
        "STRING" => Value::String(as_str(value)?.to_string()),
        "BYTES" => Value::Bytes(BASE64.decode(as_str(value)?).context("invalid BYTES")?),
        "TIMESTAMP" => Value::Timestamp(
            DateTime::parse_from_rfc3339(as_str(value)?)
                .context("invalid TIMESTAMP")?
                .with_timezone(&Utc),
        ),
        "DATE" => Value::Date(
            NaiveDate::parse_from_str(as_str(value)?, "%Y-%m-%d").context("invalid DATE")?,
        ),
        "JSON" => Value::Json(serde_json::from_str(as_str(value)?).context("invalid JSON")?),
        "NUMERIC" => Value::Numeric(as_str(value)?.to_string()),
        "ARRAY" => {
            let element_type = field_type
                .array_element_type
                .as_deref()
                .ok_or_else(|| anyhow!("ARRAY without element type"))?;
            let items = value
                .as_array()
                .ok_or_else(|| anyhow!("expected an array, found {value}"))?;
            Value::Array(
                items
                    .iter()
                    .map(|item| decode_value(item, element_type))
                    .collect::<anyhow::Result<_>>()?,
            )
        }
        other => bail!("unsupported column type {other}"),
    })
}

fn as_str(value: &JsonValue) -> anyhow::Result<&str> {
    value
        .as_str()
        .ok_or_else(|| anyhow!("expected a string, found {value}"))
}
