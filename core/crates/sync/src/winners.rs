use synq_sync::{EntryKey, FieldValue, LogEntry, LogicalTimestamp, Payload, RowIdentity, ROW_FIELD};

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Current winner of every field of one row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowWinners {
	table: String,
	fields: BTreeMap<String, LogEntry>,
}

impl RowWinners {
	#[must_use]
	pub fn table(&self) -> &str {
		&self.table
	}

	/// The winner with the greatest stamp across all fields.
	#[must_use]
	pub fn latest(&self) -> Option<&LogEntry> {
		self.fields.values().max_by_key(|entry| entry.stamp)
	}

	/// A row is deleted when its most recent winner is a tombstone.
	#[must_use]
	pub fn is_deleted(&self) -> bool {
		self.latest().map_or(true, |entry| entry.payload.is_tombstone())
	}

	pub fn winners(&self) -> impl Iterator<Item = &LogEntry> {
		self.fields.values()
	}
}

/// Derived index answering "who currently wins `(row, field)`" without scanning the log.
#[derive(Debug, Default, Clone)]
pub struct WinnerIndex {
	rows: HashMap<RowIdentity, RowWinners>,
}

/// What [`WinnerIndex::set`] replaced, so the change can be undone.
#[derive(Debug, Clone)]
pub struct Replaced {
	pub created_row: bool,
	pub previous: Option<LogEntry>,
}

impl WinnerIndex {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Whether any entry of `row` was ever applied.
	#[must_use]
	pub fn is_known(&self, row: &RowIdentity) -> bool {
		self.rows.contains_key(row)
	}

	#[must_use]
	pub fn table_of(&self, row: &RowIdentity) -> Option<&str> {
		self.rows.get(row).map(RowWinners::table)
	}

	#[must_use]
	pub fn get(&self, row: &RowIdentity, field: &str) -> Option<&LogEntry> {
		self.rows.get(row).and_then(|winners| winners.fields.get(field))
	}

	#[must_use]
	pub fn row(&self, row: &RowIdentity) -> Option<&RowWinners> {
		self.rows.get(row)
	}

	#[must_use]
	pub fn is_winner(&self, key: &EntryKey) -> bool {
		self.get(&key.row, &key.field)
			.is_some_and(|winner| winner.stamp == key.stamp)
	}

	/// Makes `entry` the winner of its field, without looking at the current winner.
	pub fn set(&mut self, entry: LogEntry) -> Replaced {
		let mut created_row = false;

		let winners = self.rows.entry(entry.row).or_insert_with(|| {
			created_row = true;
			RowWinners {
				table: entry.table.clone(),
				fields: BTreeMap::new(),
			}
		});

		let previous = winners.fields.insert(entry.field.clone(), entry);

		Replaced {
			created_row,
			previous,
		}
	}

	/// Reverts a [`WinnerIndex::set`] of `(row, field)`.
	pub fn restore(&mut self, row: RowIdentity, field: &str, replaced: Replaced) {
		let Replaced {
			created_row,
			previous,
		} = replaced;

		if created_row {
			self.rows.remove(&row);
			return;
		}

		if let Some(winners) = self.rows.get_mut(&row) {
			match previous {
				Some(previous) => {
					winners.fields.insert(field.to_string(), previous);
				}
				None => {
					winners.fields.remove(field);
				}
			}
		}
	}

	/// Live view of `row`, `None` when unknown or deleted.
	#[must_use]
	pub fn view(&self, row: &RowIdentity) -> Option<RowView> {
		self.rows
			.get(row)
			.filter(|winners| !winners.is_deleted())
			.map(|winners| RowView::new(*row, winners))
	}

	/// Recomputes the winners of `row` from all of its logged entries, ordered by stamp.
	///
	/// The earliest entry names the row's table and entries naming another table never win.
	/// Returns what was there before, so the change can be undone.
	pub fn rebuild_row<'a>(
		&mut self,
		row: RowIdentity,
		entries: impl IntoIterator<Item = &'a LogEntry>,
	) -> Option<RowWinners> {
		let previous = self.rows.remove(&row);
		let mut entries = entries.into_iter().peekable();

		let Some(table) = entries.peek().map(|entry| entry.table.clone()) else {
			return previous;
		};

		let mut fields = BTreeMap::<String, LogEntry>::new();

		for entry in entries.filter(|entry| entry.table == table) {
			if fields
				.get(&entry.field)
				.map_or(true, |winner| entry.stamp > winner.stamp)
			{
				fields.insert(entry.field.clone(), entry.clone());
			}
		}

		self.rows.insert(row, RowWinners { table, fields });

		previous
	}

	/// Reverts a [`WinnerIndex::rebuild_row`].
	pub fn restore_row(&mut self, row: RowIdentity, previous: Option<RowWinners>) {
		match previous {
			Some(winners) => {
				self.rows.insert(row, winners);
			}
			None => {
				self.rows.remove(&row);
			}
		}
	}

	pub fn iter(&self) -> impl Iterator<Item = (&RowIdentity, &RowWinners)> {
		self.rows.iter()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.rows.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.rows.is_empty()
	}
}

/// Materialized image of a live row.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RowView {
	pub row: RowIdentity,
	pub table: String,
	pub fields: BTreeMap<String, FieldValue>,
	pub updated_at: LogicalTimestamp,
}

impl RowView {
	pub(crate) fn new(row: RowIdentity, winners: &RowWinners) -> Self {
		let fields = winners
			.fields
			.iter()
			.filter(|(field, _)| field.as_str() != ROW_FIELD)
			.filter_map(|(field, entry)| {
				let value = match &entry.payload {
					Payload::Scalar(value) => FieldValue::Scalar(value.clone()),
					Payload::Foreign(target) => FieldValue::Reference(*target),
					Payload::Tombstone => return None,
				};

				Some((field.clone(), value))
			})
			.collect();

		Self {
			row,
			table: winners.table.clone(),
			fields,
			updated_at: winners
				.latest()
				.map_or_else(|| row.created_at(), |entry| entry.stamp),
		}
	}

	#[must_use]
	pub fn get(&self, field: &str) -> Option<&FieldValue> {
		self.fields.get(field)
	}

	/// Scalar value of `field`, `None` for references and absent fields.
	#[must_use]
	pub fn scalar(&self, field: &str) -> Option<&rmpv::Value> {
		match self.fields.get(field) {
			Some(FieldValue::Scalar(value)) => Some(value),
			Some(FieldValue::Reference(_)) | None => None,
		}
	}

	#[must_use]
	pub fn reference(&self, field: &str) -> Option<RowIdentity> {
		match self.fields.get(field) {
			Some(FieldValue::Reference(target)) => Some(*target),
			Some(FieldValue::Scalar(_)) | None => None,
		}
	}
}
