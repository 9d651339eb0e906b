use crate::{Error, LogEntry, LogicalTimestamp, Payload, PeerId, RowIdentity};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CompressedLogEntriesPerTable(pub Vec<(String, CompressedLogEntriesPerRow)>);

pub type CompressedLogEntriesPerRow = Vec<(RowIdentity, Vec<CompressedLogEntry>)>;

/// Stores a batch of [`LogEntry`]s grouped by stamp peer, then table, then row, so none of
/// those identifiers is repeated on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct CompressedLogEntries(pub Vec<(PeerId, CompressedLogEntriesPerTable)>);

impl CompressedLogEntries {
	#[must_use]
	pub fn new(entries: Vec<LogEntry>) -> Self {
		let mut compressed_map = BTreeMap::<
			PeerId,
			BTreeMap<String, BTreeMap<RowIdentity, Vec<CompressedLogEntry>>>,
		>::new();

		for LogEntry {
			row,
			table,
			field,
			stamp,
			payload,
		} in entries
		{
			compressed_map
				.entry(stamp.peer)
				.or_default()
				.entry(table)
				.or_default()
				.entry(row)
				.or_default()
				.push(CompressedLogEntry {
					counter: stamp.counter,
					field,
					payload,
				});
		}

		Self(
			compressed_map
				.into_iter()
				.map(|(peer, table_map)| {
					(
						peer,
						CompressedLogEntriesPerTable(
							table_map
								.into_iter()
								.map(|(table, rows)| (table, rows.into_iter().collect()))
								.collect(),
						),
					)
				})
				.collect(),
		)
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.0.iter().map(|(_, per_table)| per_table.len()).sum()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	#[must_use]
	pub fn into_entries(self) -> Vec<LogEntry> {
		let mut entries = Vec::with_capacity(self.len());

		for (peer, per_table) in self.0 {
			per_table.flatten_into(peer, &mut entries);
		}

		entries
	}

	pub fn encode(&self) -> Result<Vec<u8>, Error> {
		rmp_serde::to_vec_named(self).map_err(Into::into)
	}

	pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
		rmp_serde::from_slice(bytes).map_err(Into::into)
	}
}

impl CompressedLogEntriesPerTable {
	#[must_use]
	pub fn len(&self) -> usize {
		self.0
			.iter()
			.map(|(_, rows)| rows.iter().map(|(_, entries)| entries.len()).sum::<usize>())
			.sum()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	fn flatten_into(self, peer: PeerId, entries: &mut Vec<LogEntry>) {
		for (table, rows) in self.0 {
			for (row, row_entries) in rows {
				entries.extend(row_entries.into_iter().map(|entry| LogEntry {
					row,
					table: table.clone(),
					field: entry.field,
					stamp: LogicalTimestamp::new(entry.counter, peer),
					payload: entry.payload,
				}));
			}
		}
	}
}

#[derive(PartialEq, Serialize, Deserialize, Clone, Debug)]
pub struct CompressedLogEntry {
	pub counter: u64,
	pub field: String,
	pub payload: Payload,
}

#[cfg(test)]
mod test {
	use super::*;

	const X: PeerId = PeerId::from_u128(1);
	const Y: PeerId = PeerId::from_u128(2);

	fn entry(table: &str, row: RowIdentity, field: &str, stamp: LogicalTimestamp) -> LogEntry {
		LogEntry {
			row,
			table: table.to_string(),
			field: field.to_string(),
			stamp,
			payload: Payload::Scalar(rmpv::Value::from(stamp.counter)),
		}
	}

	#[test]
	fn compress() {
		let a = RowIdentity::new(1, X);
		let b = RowIdentity::new(2, Y);

		let uncompressed = vec![
			entry("person", a, "name", LogicalTimestamp::new(1, X)),
			entry("person", a, "age", LogicalTimestamp::new(1, X)),
			entry("pet", b, "name", LogicalTimestamp::new(2, Y)),
			entry("person", a, "name", LogicalTimestamp::new(3, Y)),
			entry("pet", b, "owner", LogicalTimestamp::new(4, X)),
		];

		let CompressedLogEntries(compressed) = CompressedLogEntries::new(uncompressed);

		assert_eq!(compressed.len(), 2);
		assert_eq!(compressed[0].0, X);
		assert_eq!(compressed[0].1 .0[0].0, "person");
		assert_eq!(compressed[0].1 .0[0].1[0].1.len(), 2);
		assert_eq!(compressed[0].1 .0[1].0, "pet");
		assert_eq!(compressed[1].0, Y);
		assert_eq!(compressed[1].1.len(), 2);
	}

	#[test]
	fn into_entries_restores_stamps() {
		let row = RowIdentity::new(1, X);

		let compressed = CompressedLogEntries(vec![(
			Y,
			CompressedLogEntriesPerTable(vec![(
				"person".to_string(),
				vec![(
					row,
					vec![
						CompressedLogEntry {
							counter: 5,
							field: "name".to_string(),
							payload: Payload::Tombstone,
						},
						CompressedLogEntry {
							counter: 6,
							field: "age".to_string(),
							payload: Payload::Foreign(row),
						},
					],
				)],
			)]),
		)]);

		let entries = compressed.into_entries();

		assert_eq!(entries.len(), 2);
		assert_eq!(entries[0].stamp, LogicalTimestamp::new(5, Y));
		assert_eq!(entries[1].stamp, LogicalTimestamp::new(6, Y));
		assert!(entries.iter().all(|e| e.row == row && e.table == "person"));
	}

	#[test]
	fn wire_bytes_decode_to_same_batch() {
		let row = RowIdentity::new(7, X);
		let batch = CompressedLogEntries::new(vec![
			entry("person", row, "name", LogicalTimestamp::new(7, X)),
			LogEntry {
				payload: Payload::Foreign(RowIdentity::new(2, Y)),
				..entry("person", row, "friend", LogicalTimestamp::new(8, X))
			},
		]);

		let bytes = batch.encode().unwrap();

		assert_eq!(CompressedLogEntries::decode(&bytes).unwrap(), batch);
		assert!(CompressedLogEntries::decode(&[0xc1]).is_err());
	}
}
