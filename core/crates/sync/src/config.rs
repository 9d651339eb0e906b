use synq_utils::error::FileIOError;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::Error;

/// What happens to the rows referencing a row that gets deleted.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OnDelete {
	/// Referencing rows are deleted too.
	Cascade,
	/// The delete is undone while a live row still references the target.
	Restrict,
	/// The reference reads as nil while its target is gone.
	SetNull,
	/// Same as `Restrict`, or `Cascade` when `no_action_is_cascade` is set.
	#[default]
	NoAction,
}

/// Declares that `table.field` holds references, and what deleting their target does.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
	pub table: String,
	pub field: String,
	#[serde(default)]
	pub on_delete: OnDelete,
}

impl ForeignKey {
	#[must_use]
	pub fn new(table: impl Into<String>, field: impl Into<String>, on_delete: OnDelete) -> Self {
		Self {
			table: table.into(),
			field: field.into(),
			on_delete,
		}
	}
}

/// No two live rows of `table` may hold the same values for all of `fields`.
///
/// Rows missing one of the fields, or holding nil in one of them, never conflict.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UniqueKey {
	pub table: String,
	pub fields: Vec<String>,
}

impl UniqueKey {
	pub fn new<F: Into<String>>(
		table: impl Into<String>,
		fields: impl IntoIterator<Item = F>,
	) -> Self {
		Self {
			table: table.into(),
			fields: fields.into_iter().map(Into::into).collect(),
		}
	}
}

/// Replica settings, every key is optional in the TOML form.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
	/// Seed counters from the system clock. Disable for small, deterministic counters.
	pub physical_clock: bool,
	/// Also tombstone every live field when a row is deleted, not only its existence.
	pub tombstone_fields: bool,
	/// Upper bound on the entries handed out per request.
	pub max_batch_size: usize,
	pub snapshot_path: Option<PathBuf>,
	/// Save a snapshot after every committed write or merge, needs `snapshot_path`.
	pub persist_on_commit: bool,
	pub no_action_is_cascade: bool,
	/// Reference fields without a declaration read as nil while their target is gone.
	pub foreign_keys: Vec<ForeignKey>,
	pub unique: Vec<UniqueKey>,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			physical_clock: true,
			tombstone_fields: true,
			max_batch_size: 1000,
			snapshot_path: None,
			persist_on_commit: false,
			no_action_is_cascade: false,
			foreign_keys: vec![],
			unique: vec![],
		}
	}
}

impl Config {
	/// Pure logical counters, what tests usually want.
	#[must_use]
	pub fn logical() -> Self {
		Self {
			physical_clock: false,
			..Default::default()
		}
	}

	pub fn from_toml(source: &str) -> Result<Self, Error> {
		toml::from_str(source).map_err(Into::into)
	}

	pub fn to_toml(&self) -> Result<String, Error> {
		toml::to_string(self).map_err(Into::into)
	}

	pub async fn load(path: impl AsRef<Path> + Send) -> Result<Self, Error> {
		let path = path.as_ref();

		let source = fs::read_to_string(path)
			.await
			.map_err(|e| FileIOError::from((path, e, "reading replica config")))?;

		Self::from_toml(&source)
	}
}
