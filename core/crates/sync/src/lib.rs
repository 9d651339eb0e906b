#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

use synq_utils::error::FileIOError;

mod config;
mod integrity;
mod log;
mod manager;
mod merge;
mod persist;
mod replica;
mod resolver;
mod store;
mod transaction;
mod winners;

pub use config::{Config, ForeignKey, OnDelete, UniqueKey};
pub use integrity::Resolution;
pub use log::UnifiedLog;
pub use manager::{GetOpsArgs, Manager as SyncManager};
pub use merge::MergeResult;
pub use persist::ReplicaSnapshot;
pub use replica::{Delta, Replica, Written};
pub use resolver::ResolverStats;
pub use store::{Materializer, MemoryStore, RowChange, StoredRow, StoredValue};
pub use winners::RowView;

pub use synq_sync::{
	ClockSaturated, CompressedLogEntries, Context, FakeTimeSource, FieldValue, LogEntry,
	LogicalClock, LogicalTimestamp, Mutation, Payload, PeerId, RowIdentity, SystemTimeSource,
	TimeSource, MAX_COUNTER, ROW_FIELD,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncEvent {
	Ingested,
	Created,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error(transparent)]
	Sync(#[from] synq_sync::Error),
	#[error("serialization error: {0}")]
	Serialization(#[from] rmp_serde::encode::Error),
	#[error("deserialization error: {0}")]
	Deserialization(#[from] rmp_serde::decode::Error),
	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error("invalid config: {0}")]
	ConfigParse(#[from] toml::de::Error),
	#[error("failed to serialize config: {0}")]
	ConfigSerialize(#[from] toml::ser::Error),
	#[error("host store failed to apply changes: {0}")]
	Materialize(#[source] Box<dyn std::error::Error + Send + Sync>),
	#[error("row not found: {0}")]
	UnknownRow(RowIdentity),
	#[error("row was deleted: {0}")]
	RowDeleted(RowIdentity),
	#[error("reference to a row that doesn't exist: {0}")]
	DanglingReference(RowIdentity),
	#[error("row is still referenced by a restricting key: {0}")]
	Restricted(RowIdentity),
	#[error("unique key of `{table}` already taken, {row} would be hidden")]
	UniqueViolation { table: String, row: RowIdentity },
	#[error(transparent)]
	Clock(#[from] ClockSaturated),
	#[error("tried to insert a row without a table name")]
	EmptyTable,
	#[error("invalid field `{field}`: {reason}")]
	InvalidField { field: String, reason: &'static str },
	#[error("persisting on commit needs a snapshot path")]
	NoSnapshotPath,
}
