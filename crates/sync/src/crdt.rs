use std::fmt;

use serde::{Deserialize, Serialize};

use crate::PeerId;

/// Implicit field every row carries to record its existence.
///
/// Creating a row writes `true` to it, deleting a row writes a [`Payload::Tombstone`].
pub const ROW_FIELD: &str = "$row";

/// Highest counter a stamp may carry. `u64::MAX` is reserved so a saturated clock can never hand
/// out a stamp that already exists.
pub const MAX_COUNTER: u64 = u64::MAX - 1;

/// A version stamp. Deriving `Ord` compares `counter` first and breaks ties with `peer`,
/// which is the total order every replica must agree on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalTimestamp {
	pub counter: u64,
	pub peer: PeerId,
}

impl LogicalTimestamp {
	#[must_use]
	pub const fn new(counter: u64, peer: PeerId) -> Self {
		Self { counter, peer }
	}
}

impl fmt::Display for LogicalTimestamp {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "({}, {})", self.counter, self.peer)
	}
}

/// Replica independent identity of a row: the stamp of the write that created it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowIdentity(LogicalTimestamp);

impl RowIdentity {
	#[must_use]
	pub const fn new(counter: u64, creator: PeerId) -> Self {
		Self(LogicalTimestamp::new(counter, creator))
	}

	#[must_use]
	pub const fn created_at(&self) -> LogicalTimestamp {
		self.0
	}

	#[must_use]
	pub const fn creator(&self) -> PeerId {
		self.0.peer
	}
}

impl From<LogicalTimestamp> for RowIdentity {
	fn from(stamp: LogicalTimestamp) -> Self {
		Self(stamp)
	}
}

impl fmt::Display for RowIdentity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "row{}", self.0)
	}
}

/// What a log entry carries for its field.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
	Scalar(rmpv::Value),
	Foreign(RowIdentity),
	Tombstone,
}

impl Payload {
	#[must_use]
	pub const fn foreign_target(&self) -> Option<&RowIdentity> {
		match self {
			Self::Foreign(target) => Some(target),
			Self::Scalar(_) | Self::Tombstone => None,
		}
	}

	#[must_use]
	pub const fn is_tombstone(&self) -> bool {
		matches!(self, Self::Tombstone)
	}

	#[must_use]
	pub const fn kind(&self) -> PayloadKind {
		match self {
			Self::Scalar(_) => PayloadKind::Scalar,
			Self::Foreign(_) => PayloadKind::Foreign,
			Self::Tombstone => PayloadKind::Tombstone,
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadKind {
	Scalar,
	Foreign,
	Tombstone,
}

impl fmt::Display for PayloadKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Scalar => "scalar",
			Self::Foreign => "foreign",
			Self::Tombstone => "tombstone",
		})
	}
}

/// A live field value, as written by the host or read back from a materialized row.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum FieldValue {
	Scalar(rmpv::Value),
	Reference(RowIdentity),
}

impl From<FieldValue> for Payload {
	fn from(value: FieldValue) -> Self {
		match value {
			FieldValue::Scalar(value) => Self::Scalar(value),
			FieldValue::Reference(target) => Self::Foreign(target),
		}
	}
}

impl From<rmpv::Value> for FieldValue {
	fn from(value: rmpv::Value) -> Self {
		Self::Scalar(value)
	}
}

impl From<RowIdentity> for FieldValue {
	fn from(target: RowIdentity) -> Self {
		Self::Reference(target)
	}
}

/// Identifies a log entry for deduplication purposes.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryKey {
	pub row: RowIdentity,
	pub field: String,
	pub stamp: LogicalTimestamp,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedEntry {
	#[error("entry has an empty table name")]
	EmptyTable,
	#[error("entry has an empty field name")]
	EmptyField,
	#[error("entry stamp has a zero counter")]
	ZeroStamp,
	#[error("entry stamp {0} is past the counter ceiling")]
	CounterCeiling(LogicalTimestamp),
	#[error("row identity has a zero counter")]
	ZeroRow,
	#[error("entry stamp {stamp} precedes the creation of {row}")]
	PrecedesRow {
		stamp: LogicalTimestamp,
		row: RowIdentity,
	},
	#[error("existence field only accepts `true` or a tombstone")]
	InvalidExistence,
	#[error("{row} belongs to table `{expected}`, entry says `{found}`")]
	TableMismatch {
		row: RowIdentity,
		expected: String,
		found: String,
	},
}

/// One mutation unit: the new value of one field of one row at one stamp.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LogEntry {
	pub row: RowIdentity,
	pub table: String,
	pub field: String,
	pub stamp: LogicalTimestamp,
	pub payload: Payload,
}

impl LogEntry {
	#[must_use]
	pub fn key(&self) -> EntryKey {
		EntryKey {
			row: self.row,
			field: self.field.clone(),
			stamp: self.stamp,
		}
	}

	#[must_use]
	pub fn is_row_field(&self) -> bool {
		self.field == ROW_FIELD
	}

	/// Checks everything that can be checked without looking at replica state.
	pub fn validate(&self) -> Result<(), MalformedEntry> {
		if self.table.is_empty() {
			return Err(MalformedEntry::EmptyTable);
		}

		if self.field.is_empty() {
			return Err(MalformedEntry::EmptyField);
		}

		if self.stamp.counter == 0 {
			return Err(MalformedEntry::ZeroStamp);
		}

		if self.stamp.counter > MAX_COUNTER {
			return Err(MalformedEntry::CounterCeiling(self.stamp));
		}

		if self.row.created_at().counter == 0 {
			return Err(MalformedEntry::ZeroRow);
		}

		if self.stamp < self.row.created_at() {
			return Err(MalformedEntry::PrecedesRow {
				stamp: self.stamp,
				row: self.row,
			});
		}

		if self.is_row_field()
			&& !matches!(
				self.payload,
				Payload::Tombstone | Payload::Scalar(rmpv::Value::Boolean(true))
			) {
			return Err(MalformedEntry::InvalidExistence);
		}

		Ok(())
	}
}
