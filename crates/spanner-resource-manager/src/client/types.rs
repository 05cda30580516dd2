//! Values exchanged with the remote client: resource names, cell values,
//! rows, mutations and statements.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// SQL dialect of a database.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Dialect {
    #[default]
    GoogleStandardSql,
    Postgresql,
}

impl Dialect {
    /// Statement creating `database_id`, quoted the way the dialect expects.
    pub fn create_database_statement(&self, database_id: &str) -> String {
        match self {
            Self::GoogleStandardSql => format!("CREATE DATABASE `{database_id}`"),
            Self::Postgresql => format!("CREATE DATABASE \"{database_id}\""),
        }
    }
}

impl Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GoogleStandardSql => write!(f, "GOOGLE_STANDARD_SQL"),
            Self::Postgresql => write!(f, "POSTGRESQL"),
        }
    }
}

/// Fully qualified instance name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceName {
    pub project_id: String,
    pub instance_id: String,
}

impl InstanceName {
    pub fn new(project_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/instances/{}",
            self.project_id, self.instance_id
        )
    }
}

/// Fully qualified database name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatabaseName {
    pub project_id: String,
    pub instance_id: String,
    pub database_id: String,
}

impl DatabaseName {
    pub fn new(
        project_id: impl Into<String>,
        instance_id: impl Into<String>,
        database_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            instance_id: instance_id.into(),
            database_id: database_id.into(),
        }
    }

    pub fn instance(&self) -> InstanceName {
        InstanceName::new(&self.project_id, &self.instance_id)
    }
}

impl Display for DatabaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/instances/{}/databases/{}",
            self.project_id, self.instance_id, self.database_id
        )
    }
}

/// Everything needed to create an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    pub name: InstanceName,
    /// Instance configuration id, e.g. `regional-us-east1`.
    pub config: String,
    pub display_name: String,
    pub node_count: u32,
}

impl InstanceConfig {
    /// Regional configuration for `region`.
    pub fn regional(name: InstanceName, region: &str, node_count: u32) -> Self {
        Self {
            display_name: name.instance_id.clone(),
            config: format!("regional-{region}"),
            name,
            node_count,
        }
    }
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    Json(serde_json::Value),
    /// Decimal kept in its textual form to avoid losing precision.
    Numeric(String),
    Array(Vec<Value>),
}

impl Value {
    pub fn int64(v: i64) -> Self {
        Self::Int64(v)
    }

    pub fn string(v: impl Into<String>) -> Self {
        Self::String(v.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int64(v.into())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// An ordered row of named values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Struct {
    fields: Vec<(String, Value)>,
}

impl Struct {
    pub fn builder() -> StructBuilder {
        StructBuilder::default()
    }

    /// Value of the first field called `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Copy of the row restricted to `columns`, in the order given. Missing
    /// columns are `Null`.
    pub fn project(&self, columns: &[String]) -> Struct {
        Struct {
            fields: columns
                .iter()
                .map(|c| (c.clone(), self.get(c).cloned().unwrap_or(Value::Null)))
                .collect(),
        }
    }
}

impl FromIterator<(String, Value)> for Struct {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Struct {
            fields: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Default)]
pub struct StructBuilder {
    fields: Vec<(String, Value)>,
}

impl StructBuilder {
    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn build(self) -> Struct {
        Struct {
            fields: self.fields,
        }
    }
}

/// Set of primary keys addressed by a read or a delete.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySet {
    All,
    /// Individual keys, each a list of key column values.
    Keys(Vec<Vec<Value>>),
}

impl KeySet {
    pub fn all() -> Self {
        Self::All
    }

    pub fn single_key(key: Vec<Value>) -> Self {
        Self::Keys(vec![key])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOp {
    Insert,
    Update,
    InsertOrUpdate,
    Replace,
    Delete,
}

impl MutationOp {
    /// Field name of this operation in the JSON `Mutation` message.
    pub fn json_name(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::InsertOrUpdate => "insertOrUpdate",
            Self::Replace => "replace",
            Self::Delete => "delete",
        }
    }
}

/// A write to a single row (or, for deletes, a set of rows).
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    op: MutationOp,
    table: String,
    columns: Vec<String>,
    values: Vec<Value>,
    key_set: Option<KeySet>,
}

impl Mutation {
    pub fn new_insert_builder(table: impl Into<String>) -> MutationBuilder {
        MutationBuilder::new(MutationOp::Insert, table)
    }

    pub fn new_update_builder(table: impl Into<String>) -> MutationBuilder {
        MutationBuilder::new(MutationOp::Update, table)
    }

    pub fn new_insert_or_update_builder(table: impl Into<String>) -> MutationBuilder {
        MutationBuilder::new(MutationOp::InsertOrUpdate, table)
    }

    pub fn new_replace_builder(table: impl Into<String>) -> MutationBuilder {
        MutationBuilder::new(MutationOp::Replace, table)
    }

    pub fn delete(table: impl Into<String>, key_set: KeySet) -> Self {
        Self {
            op: MutationOp::Delete,
            table: table.into(),
            columns: Vec::new(),
            values: Vec::new(),
            key_set: Some(key_set),
        }
    }

    pub fn op(&self) -> MutationOp {
        self.op
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Keys removed by a delete mutation; `None` for every other operation.
    pub fn key_set(&self) -> Option<&KeySet> {
        self.key_set.as_ref()
    }
}

#[derive(Debug)]
pub struct MutationBuilder {
    op: MutationOp,
    table: String,
    columns: Vec<String>,
    values: Vec<Value>,
}

impl MutationBuilder {
    fn new(op: MutationOp, table: impl Into<String>) -> Self {
        Self {
            op,
            table: table.into(),
            columns: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.columns.push(column.into());
        self.values.push(value.into());
        self
    }

    pub fn build(self) -> Mutation {
        Mutation {
            op: self.op,
            table: self.table,
            columns: self.columns,
            values: self.values,
            key_set: None,
        }
    }
}

/// A SQL statement without parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Statement {
    sql: String,
}

impl Statement {
    pub fn of(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

impl Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}
