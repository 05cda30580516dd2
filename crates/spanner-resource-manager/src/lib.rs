//! Lifecycle manager for ephemeral Cloud Spanner resources.
//!
//! A [`SpannerResourceManager`] provisions an instance and a database on the
//! first DDL statement, mediates writes, reads and DML against it, and tears
//! everything down again in [`SpannerResourceManager::cleanup_all`]. After
//! cleanup the manager refuses every further operation.
//!
//! ```no_run
//! use spanner_resource_manager::{Dialect, Mutation, ResourceManagerConfig};
//!
//! # fn main() -> Result<(), spanner_resource_manager::ResourceManagerError> {
//! let mut manager =
//!     ResourceManagerConfig::builder("my-test", "my-project", "us-east1", Dialect::GoogleStandardSql)
//!         .build_with_rest_client()?;
//! manager.execute_ddl_statement(
//!     "CREATE TABLE Singers (SingerId INT64 NOT NULL, FirstName STRING(1024)) PRIMARY KEY (SingerId)",
//! )?;
//! manager.write(
//!     &Mutation::new_insert_or_update_builder("Singers")
//!         .set("SingerId", 1)
//!         .set("FirstName", "Marc")
//!         .build(),
//! )?;
//! let rows = manager.read_table_records("Singers", &["SingerId", "FirstName"])?;
//! assert_eq!(rows.len(), 1);
//! manager.cleanup_all()?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod ids;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod monitoring;
pub mod retry;

pub use client::types::{
    DatabaseName, Dialect, InstanceConfig, InstanceName, KeySet, Mutation, MutationOp, Statement,
    Struct, Value,
};
pub use client::{ErrorCode, RemoteError, ResultSet, SpannerClient, TransactionContext};
pub use config::{ResourceManagerBuilder, ResourceManagerConfig, SpannerEnvironmentConfig};
pub use error::ResourceManagerError;
pub use manager::{ResourceState, SpannerResourceManager};
pub use monitoring::MonitoringClient;
