use synq_sync::{Context, EntryKey, LogEntry, LogicalTimestamp, PeerId, RowIdentity};

use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Append-only store of every applied entry, in insertion order.
///
/// Entries are also indexed by key for deduplication, by stamp peer and counter, so
/// exporting what a peer is missing never scans the whole log, and by row in stamp order.
#[derive(Debug, Default, Clone)]
pub struct UnifiedLog {
	entries: BTreeMap<u64, LogEntry>,
	next_seq: u64,
	by_key: HashMap<EntryKey, u64>,
	by_peer: BTreeMap<PeerId, BTreeSet<(u64, u64)>>,
	by_row: HashMap<RowIdentity, BTreeMap<(LogicalTimestamp, String), u64>>,
}

impl UnifiedLog {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Appends `entry` unless an entry with the same key is already logged.
	///
	/// Returns the sequence number the entry was stored under.
	pub fn append(&mut self, entry: LogEntry) -> Option<u64> {
		let key = entry.key();

		if self.by_key.contains_key(&key) {
			return None;
		}

		let seq = self.next_seq;
		self.next_seq += 1;

		self.by_key.insert(key, seq);
		self.by_peer
			.entry(entry.stamp.peer)
			.or_default()
			.insert((entry.stamp.counter, seq));
		self.by_row
			.entry(entry.row)
			.or_default()
			.insert((entry.stamp, entry.field.clone()), seq);
		self.entries.insert(seq, entry);

		Some(seq)
	}

	pub fn remove_seq(&mut self, seq: u64) -> Option<LogEntry> {
		let entry = self.entries.remove(&seq)?;

		self.by_key.remove(&entry.key());

		if let Some(counters) = self.by_peer.get_mut(&entry.stamp.peer) {
			counters.remove(&(entry.stamp.counter, seq));
			if counters.is_empty() {
				self.by_peer.remove(&entry.stamp.peer);
			}
		}

		if let Some(fields) = self.by_row.get_mut(&entry.row) {
			fields.remove(&(entry.stamp, entry.field.clone()));
			if fields.is_empty() {
				self.by_row.remove(&entry.row);
			}
		}

		Some(entry)
	}

	pub fn remove(&mut self, key: &EntryKey) -> Option<LogEntry> {
		let seq = *self.by_key.get(key)?;
		self.remove_seq(seq)
	}

	#[must_use]
	pub fn contains(&self, key: &EntryKey) -> bool {
		self.by_key.contains_key(key)
	}

	#[must_use]
	pub fn get(&self, key: &EntryKey) -> Option<&LogEntry> {
		self.by_key.get(key).and_then(|seq| self.entries.get(seq))
	}

	/// Entries whose counter is strictly above `recipient`'s watermark for their stamp peer.
	pub fn select_unsent<'a>(
		&'a self,
		recipient: &'a Context,
	) -> impl Iterator<Item = &'a LogEntry> + 'a {
		self.by_peer.iter().flat_map(move |(peer, counters)| {
			let watermark = recipient.watermark_of(peer);

			counters
				.range((watermark.saturating_add(1), 0)..)
				.filter(move |(counter, _)| *counter > watermark)
				.filter_map(|(_, seq)| self.entries.get(seq))
		})
	}

	/// Entries of `row` ordered by stamp, then field.
	pub fn row_entries(&self, row: &RowIdentity) -> impl DoubleEndedIterator<Item = &LogEntry> {
		self.by_row
			.get(row)
			.into_iter()
			.flat_map(|fields| fields.values())
			.filter_map(|seq| self.entries.get(seq))
	}

	/// The entry that decides which table `row` belongs to.
	#[must_use]
	pub fn earliest(&self, row: &RowIdentity) -> Option<&LogEntry> {
		self.row_entries(row).next()
	}

	/// Most recent value of `(row, field)` that isn't a tombstone, what a deleted row shows
	/// again when it has to come back.
	#[must_use]
	pub fn latest_value(
		&self,
		row: &RowIdentity,
		field: &str,
		table: &str,
	) -> Option<&LogEntry> {
		self.row_entries(row).rev().find(|entry| {
			entry.field == field && entry.table == table && !entry.payload.is_tombstone()
		})
	}

	pub fn rows(&self) -> impl Iterator<Item = &RowIdentity> {
		self.by_row.keys()
	}

	/// Every entry, oldest first.
	pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
		self.entries.values()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

impl FromIterator<LogEntry> for UnifiedLog {
	fn from_iter<T: IntoIterator<Item = LogEntry>>(iter: T) -> Self {
		let mut log = Self::new();
		for entry in iter {
			log.append(entry);
		}
		log
	}
}

#[cfg(test)]
mod test {
	use super::*;

	use synq_sync::Payload;

	const X: PeerId = PeerId::from_u128(1);
	const Y: PeerId = PeerId::from_u128(2);

	fn entry(field: &str, counter: u64, peer: PeerId) -> LogEntry {
		LogEntry {
			row: RowIdentity::new(1, X),
			table: "person".to_string(),
			field: field.to_string(),
			stamp: LogicalTimestamp::new(counter, peer),
			payload: Payload::Scalar(rmpv::Value::from(counter)),
		}
	}

	#[test]
	fn duplicates_are_not_appended() {
		let mut log = UnifiedLog::new();

		assert!(log.append(entry("name", 1, X)).is_some());
		assert!(log.append(entry("name", 1, X)).is_none());
		// same stamp, different field
		assert!(log.append(entry("age", 1, X)).is_some());

		assert_eq!(log.len(), 2);
	}

	#[test]
	fn select_unsent_uses_watermark_of_stamp_peer() {
		let log = [
			entry("name", 1, X),
			entry("name", 2, Y),
			entry("name", 3, X),
			entry("age", 3, X),
			entry("name", 5, Y),
		]
		.into_iter()
		.collect::<UnifiedLog>();

		let recipient = [(X, 1), (Y, 4)].into_iter().collect::<Context>();

		let mut unsent = log
			.select_unsent(&recipient)
			.map(|e| (e.stamp.counter, e.stamp.peer, e.field.as_str()))
			.collect::<Vec<_>>();
		unsent.sort_unstable();

		assert_eq!(unsent, vec![(3, X, "age"), (3, X, "name"), (5, Y, "name")]);

		assert_eq!(log.select_unsent(&Context::default()).count(), 5);
	}

	#[test]
	fn removal_keeps_indexes_consistent() {
		let mut log = UnifiedLog::new();
		let first = log.append(entry("name", 1, X)).unwrap();
		log.append(entry("name", 2, X));

		assert_eq!(log.remove_seq(first).map(|e| e.stamp.counter), Some(1));
		assert!(!log.contains(&entry("name", 1, X).key()));
		assert_eq!(log.select_unsent(&Context::default()).count(), 1);

		assert!(log.remove(&entry("name", 2, X).key()).is_some());
		assert!(log.is_empty());
		assert_eq!(log.select_unsent(&Context::default()).count(), 0);
	}

	#[test]
	fn row_index_is_ordered_by_stamp() {
		let mut log = [
			entry("name", 4, Y),
			entry("name", 2, X),
			LogEntry {
				payload: Payload::Tombstone,
				..entry("name", 6, X)
			},
			entry("age", 2, X),
		]
		.into_iter()
		.collect::<UnifiedLog>();

		let row = RowIdentity::new(1, X);

		assert_eq!(
			log.row_entries(&row)
				.map(|e| (e.stamp.counter, e.field.as_str()))
				.collect::<Vec<_>>(),
			vec![(2, "age"), (2, "name"), (4, "name"), (6, "name")]
		);
		assert_eq!(log.earliest(&row).map(|e| e.field.as_str()), Some("age"));
		// the tombstone is skipped
		assert_eq!(
			log.latest_value(&row, "name", "person").map(|e| e.stamp),
			Some(LogicalTimestamp::new(4, Y))
		);
		assert!(log.latest_value(&row, "name", "pet").is_none());

		log.remove(&entry("age", 2, X).key());
		assert_eq!(log.earliest(&row).map(|e| e.field.as_str()), Some("name"));
		assert_eq!(log.rows().count(), 1);
	}

	#[test]
	fn iteration_follows_insertion_order() {
		let log = [entry("b", 9, Y), entry("a", 2, X)]
			.into_iter()
			.collect::<UnifiedLog>();

		assert_eq!(
			log.iter().map(|e| e.field.as_str()).collect::<Vec<_>>(),
			vec!["b", "a"]
		);
	}
}
