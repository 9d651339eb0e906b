use crate::{
	ClockSaturated, FieldValue, LogEntry, LogicalTimestamp, Payload, RowIdentity, ROW_FIELD,
};

/// A committed local change, handed to the replica's write path before it becomes visible.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
	Insert {
		table: String,
		fields: Vec<(String, FieldValue)>,
	},
	Update {
		row: RowIdentity,
		fields: Vec<(String, FieldValue)>,
	},
	Delete {
		row: RowIdentity,
	},
}

impl Mutation {
	pub fn insert<K: Into<String>, V: Into<FieldValue>>(
		table: impl Into<String>,
		fields: impl IntoIterator<Item = (K, V)>,
	) -> Self {
		Self::Insert {
			table: table.into(),
			fields: collect_fields(fields),
		}
	}

	pub fn update<K: Into<String>, V: Into<FieldValue>>(
		row: RowIdentity,
		fields: impl IntoIterator<Item = (K, V)>,
	) -> Self {
		Self::Update {
			row,
			fields: collect_fields(fields),
		}
	}

	#[must_use]
	pub const fn delete(row: RowIdentity) -> Self {
		Self::Delete { row }
	}

	#[must_use]
	pub fn fields(&self) -> &[(String, FieldValue)] {
		match self {
			Self::Insert { fields, .. } | Self::Update { fields, .. } => fields,
			Self::Delete { .. } => &[],
		}
	}
}

fn collect_fields<K: Into<String>, V: Into<FieldValue>>(
	fields: impl IntoIterator<Item = (K, V)>,
) -> Vec<(String, FieldValue)> {
	fields
		.into_iter()
		.map(|(name, value)| (name.into(), value.into()))
		.collect()
}

/// Turns local mutations into log entries.
///
/// Every builder takes exactly one stamp, so all the entries of one row level mutation share it.
pub trait EntryFactory {
	fn new_stamp(&mut self) -> Result<LogicalTimestamp, ClockSaturated>;

	/// Entries for a new row: one per initial field plus the existence field.
	fn insert_entries(
		&mut self,
		table: &str,
		fields: impl IntoIterator<Item = (String, FieldValue)>,
	) -> Result<(RowIdentity, Vec<LogEntry>), ClockSaturated> {
		let stamp = self.new_stamp()?;
		let row = RowIdentity::from(stamp);

		let entries = std::iter::once(new_entry(
			row,
			table,
			ROW_FIELD.to_string(),
			stamp,
			Payload::Scalar(rmpv::Value::Boolean(true)),
		))
		.chain(
			fields
				.into_iter()
				.map(|(field, value)| new_entry(row, table, field, stamp, value.into())),
		)
		.collect();

		Ok((row, entries))
	}

	/// Entries for the fields that changed. Nothing changed means no stamp is consumed.
	fn update_entries(
		&mut self,
		row: RowIdentity,
		table: &str,
		changed: Vec<(String, FieldValue)>,
	) -> Result<Vec<LogEntry>, ClockSaturated> {
		if changed.is_empty() {
			return Ok(vec![]);
		}

		let stamp = self.new_stamp()?;

		Ok(changed
			.into_iter()
			.map(|(field, value)| new_entry(row, table, field, stamp, value.into()))
			.collect())
	}

	/// Tombstones for the existence field and for each of `live_fields`.
	fn delete_entries(
		&mut self,
		row: RowIdentity,
		table: &str,
		live_fields: impl IntoIterator<Item = String>,
	) -> Result<Vec<LogEntry>, ClockSaturated> {
		let stamp = self.new_stamp()?;

		Ok(std::iter::once(ROW_FIELD.to_string())
			.chain(live_fields)
			.map(|field| new_entry(row, table, field, stamp, Payload::Tombstone))
			.collect())
	}
}

fn new_entry(
	row: RowIdentity,
	table: &str,
	field: String,
	stamp: LogicalTimestamp,
	payload: Payload,
) -> LogEntry {
	LogEntry {
		row,
		table: table.to_string(),
		field,
		stamp,
		payload,
	}
}

/// Builds a `(field, FieldValue)` pair out of anything serializable.
#[macro_export]
macro_rules! sync_field {
	($name:expr, $v:expr) => {
		(
			::std::string::String::from($name),
			$crate::FieldValue::Scalar($crate::synq_utils::msgpack!($v)),
		)
	};
}

/// Like [`sync_field!`] but for optional values, `None` yields `None`.
#[macro_export]
macro_rules! option_sync_field {
	($name:expr, $v:expr) => {
		$v.map(|v| $crate::sync_field!($name, v))
	};
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::PeerId;

	const X: PeerId = PeerId::from_u128(1);

	struct Counter(u64);

	impl EntryFactory for Counter {
		fn new_stamp(&mut self) -> Result<LogicalTimestamp, ClockSaturated> {
			self.0 += 1;
			Ok(LogicalTimestamp::new(self.0, X))
		}
	}

	#[test]
	fn insert_writes_existence_and_fields_at_one_stamp() {
		let mut factory = Counter(0);

		let (row, entries) = factory.insert_entries(
			"person",
			[sync_field!("name", "ada"), sync_field!("age", 36)],
		)
		.unwrap();

		assert_eq!(row, RowIdentity::new(1, X));
		assert_eq!(entries.len(), 3);
		assert!(entries[0].is_row_field());
		assert!(entries.iter().all(|e| e.stamp == row.created_at()));
		assert!(entries.iter().all(|e| e.validate().is_ok()));
	}

	#[test]
	fn empty_update_consumes_no_stamp() {
		let mut factory = Counter(4);
		let row = RowIdentity::new(1, X);

		assert!(factory
			.update_entries(row, "person", vec![])
			.unwrap()
			.is_empty());
		assert_eq!(factory.0, 4);

		let entries = factory
			.update_entries(row, "person", vec![sync_field!("age", 37)])
			.unwrap();
		assert_eq!(entries.len(), 1);
		assert_eq!(entries[0].stamp, LogicalTimestamp::new(5, X));
	}

	#[test]
	fn delete_tombstones_existence_and_live_fields() {
		let mut factory = Counter(2);
		let row = RowIdentity::new(1, X);

		let entries = factory
			.delete_entries(row, "person", ["name".to_string()])
			.unwrap();

		assert_eq!(
			entries.iter().map(|e| e.field.as_str()).collect::<Vec<_>>(),
			vec![ROW_FIELD, "name"]
		);
		assert!(entries.iter().all(|e| e.payload.is_tombstone()));
	}

	#[test]
	fn optional_fields() {
		let present: Option<&str> = Some("x");
		let absent: Option<&str> = None;

		assert!(option_sync_field!("name", present).is_some());
		assert!(option_sync_field!("name", absent).is_none());
	}
}
