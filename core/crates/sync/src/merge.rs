use synq_sync::{ClockSaturated, EntryFactory, LogEntry, LogicalTimestamp, MalformedEntry};

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace, warn};

use crate::transaction::{ReplicaState, Transaction};

/// Counters describing what a batch did.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeResult {
	/// Entries that became the winner of their field.
	pub applied: usize,
	/// Entries that lost against the current winner, they are still logged.
	pub stale: usize,
	/// Entries of this batch still waiting for their foreign target.
	pub deferred: usize,
	pub rejected: usize,
	/// Entries naming another table than the one their row belongs to. They are logged and
	/// forwarded but never win.
	pub mismatched: usize,
	pub duplicates: usize,
	/// Entries queued by earlier batches that this batch unblocked.
	pub resolved: usize,
	pub passes: usize,
	/// Everything still waiting after the batch, from this batch or earlier ones.
	pub pending: usize,
}

impl MergeResult {
	/// Whether the batch changed the replica at all.
	#[must_use]
	pub const fn changed(&self) -> bool {
		self.applied + self.stale + self.deferred + self.mismatched > 0
	}
}

enum Outcome {
	Applied { newly_known: bool },
	Stale,
	Deferred,
	Mismatched,
}

/// Last writer wins merge over the state borrowed by a [`Transaction`].
pub struct MergeEngine<'tx, 'state> {
	tx: &'tx mut Transaction<'state>,
}

impl<'tx, 'state> MergeEngine<'tx, 'state> {
	pub fn new(tx: &'tx mut Transaction<'state>) -> Self {
		Self { tx }
	}

	#[must_use]
	pub fn state(&self) -> &ReplicaState {
		self.tx.state()
	}

	/// Applies a batch of remote entries until no more foreign references can be resolved.
	#[instrument(skip_all, fields(entries = entries.len()))]
	pub fn apply_batch(&mut self, entries: Vec<LogEntry>) -> MergeResult {
		let mut result = MergeResult::default();
		let mut batch_keys = HashSet::with_capacity(entries.len());
		let mut wave = Vec::with_capacity(entries.len());

		for entry in entries {
			if let Err(e) = entry.validate() {
				warn!(row = %entry.row, field = entry.field, stamp = %entry.stamp, ?e, "rejecting malformed entry");
				result.rejected += 1;
				continue;
			}

			let key = entry.key();
			let state = self.tx.state();

			if state.log.contains(&key) || state.resolver.contains(&key) || !batch_keys.insert(key) {
				result.duplicates += 1;
				continue;
			}

			wave.push(entry);
		}

		while !wave.is_empty() {
			result.passes += 1;

			// processing in stamp order keeps the outcome independent of how the batch was built
			wave.sort_unstable_by(|a, b| {
				a.stamp
					.cmp(&b.stamp)
					.then_with(|| a.row.cmp(&b.row))
					.then_with(|| a.field.cmp(&b.field))
			});

			let mut newly_known = vec![];

			for entry in wave.drain(..) {
				let from_batch = batch_keys.contains(&entry.key());
				let row = entry.row;

				match self.process(entry) {
					Outcome::Applied { newly_known: known } => {
						result.applied += 1;
						if !from_batch {
							result.resolved += 1;
						}
						if known {
							newly_known.push(row);
						}
					}
					Outcome::Stale => {
						result.stale += 1;
						if !from_batch {
							result.resolved += 1;
						}
					}
					Outcome::Deferred => {}
					Outcome::Mismatched => result.mismatched += 1,
				}
			}

			wave = newly_known
				.iter()
				.flat_map(|row| self.tx.take_pending(row))
				.collect();

			trace!(pass = result.passes, woken = wave.len(), "finished merge pass");
		}

		let resolver = &self.tx.state().resolver;
		result.deferred = batch_keys.iter().filter(|key| resolver.contains(key)).count();
		result.pending = resolver.len();

		debug!(?result, "merged batch");

		result
	}

	/// Applies an entry produced by a local write.
	pub fn apply_local(&mut self, entry: LogEntry) {
		let field = entry.field.clone();
		let row = entry.row;

		if matches!(self.process(entry), Outcome::Deferred | Outcome::Mismatched) {
			// local writes check their references up front, this only trips on a bug
			warn!(%row, field, "local entry was not applied");
		}
	}

	fn process(&mut self, entry: LogEntry) -> Outcome {
		let state = self.tx.state();

		if let Some(target) = entry.payload.foreign_target() {
			if *target != entry.row && !state.winners.is_known(target) {
				trace!(row = %entry.row, %target, "deferring entry until its target exists");
				self.tx.defer(entry);

				return Outcome::Deferred;
			}
		}

		// the earliest logged entry of a row names its table, whatever the arrival order
		let earliest = state.log.earliest(&entry.row);
		let precedes = earliest.map_or(true, |first| {
			(entry.stamp, &entry.field) < (first.stamp, &first.field)
		});

		if let Some(table) = state.winners.table_of(&entry.row) {
			if table != entry.table {
				let e = MalformedEntry::TableMismatch {
					row: entry.row,
					expected: table.to_string(),
					found: entry.table.clone(),
				};

				let (row, key, stamp) = (entry.row, entry.key(), entry.stamp);

				self.tx.append(entry);
				self.tx.observe(&stamp);

				if !precedes {
					warn!(%stamp, %e, "entry names another table than its row, it won't win");
					return Outcome::Mismatched;
				}

				warn!(%stamp, %e, "earlier entry moves the row to another table");
				self.tx.rebuild_row(row);

				return if self.tx.state().winners.is_winner(&key) {
					Outcome::Applied { newly_known: false }
				} else {
					Outcome::Stale
				};
			}
		}

		let newly_known = !state.winners.is_known(&entry.row);
		let wins = state
			.winners
			.get(&entry.row, &entry.field)
			.map_or(true, |winner| entry.stamp > winner.stamp);

		let stamp = entry.stamp;

		if wins {
			self.tx.set_winner(entry.clone());
		}

		self.tx.append(entry);
		self.tx.observe(&stamp);

		if wins {
			Outcome::Applied { newly_known }
		} else {
			Outcome::Stale
		}
	}
}

impl EntryFactory for MergeEngine<'_, '_> {
	fn new_stamp(&mut self) -> Result<LogicalTimestamp, ClockSaturated> {
		self.tx.new_stamp()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	use synq_sync::{Context, LogicalClock, Payload, PeerId, RowIdentity, ROW_FIELD};

	use crate::{log::UnifiedLog, resolver::ForeignKeyResolver, winners::WinnerIndex};

	const X: PeerId = PeerId::from_u128(1);
	const Y: PeerId = PeerId::from_u128(2);

	fn state() -> ReplicaState {
		ReplicaState {
			clock: LogicalClock::logical(X, 0),
			context: Context::new(X),
			log: UnifiedLog::new(),
			winners: WinnerIndex::new(),
			resolver: ForeignKeyResolver::new(),
		}
	}

	fn create(table: &str, counter: u64, peer: PeerId) -> LogEntry {
		let stamp = LogicalTimestamp::new(counter, peer);
		LogEntry {
			row: RowIdentity::from(stamp),
			table: table.to_string(),
			field: ROW_FIELD.to_string(),
			stamp,
			payload: Payload::Scalar(true.into()),
		}
	}

	fn set(row: RowIdentity, table: &str, field: &str, counter: u64, payload: Payload) -> LogEntry {
		LogEntry {
			row,
			table: table.to_string(),
			field: field.to_string(),
			stamp: LogicalTimestamp::new(counter, row.creator()),
			payload,
		}
	}

	fn merge(state: &mut ReplicaState, entries: Vec<LogEntry>) -> MergeResult {
		let mut tx = Transaction::begin(state);
		let result = MergeEngine::new(&mut tx).apply_batch(entries);
		tx.commit();

		result
	}

	#[test]
	fn older_entries_lose_against_the_winner() {
		let mut state = state();
		let person = create("person", 1, X);
		let newer = set(person.row, "person", "name", 3, Payload::Scalar("b".into()));

		merge(&mut state, vec![person.clone(), newer.clone()]);

		let result = merge(
			&mut state,
			vec![
				set(person.row, "person", "name", 2, Payload::Scalar("a".into())),
				newer,
			],
		);

		assert_eq!(result.applied, 0);
		assert_eq!(result.stale, 1);
		assert_eq!(result.duplicates, 1);
		assert_eq!(
			state.winners.get(&person.row, "name").map(|w| w.stamp.counter),
			Some(3)
		);
		// losers are still logged
		assert_eq!(state.log.len(), 3);
		assert_eq!(state.context.watermark_of(&X), 3);
	}

	#[test]
	fn duplicates_and_malformed_entries_are_counted() {
		let mut state = state();
		let person = create("person", 1, X);

		merge(&mut state, vec![person.clone()]);

		let malformed = set(person.row, "person", "", 2, Payload::Tombstone);

		let result = merge(&mut state, vec![person.clone(), malformed]);

		assert_eq!(result.duplicates, 1);
		assert_eq!(result.rejected, 1);
		assert_eq!(result.applied, 0);
		assert!(!result.changed());
	}

	#[test]
	fn table_follows_the_earliest_entry_whatever_the_arrival_order() {
		let person = create("person", 1, X);
		let stray = set(person.row, "pet", "name", 3, Payload::Scalar("rex".into()));
		let name = set(person.row, "person", "name", 2, Payload::Scalar("ada".into()));

		let mut in_order = state();
		merge(&mut in_order, vec![person.clone(), name.clone()]);
		let result = merge(&mut in_order, vec![stray.clone()]);

		assert_eq!(result.mismatched, 1);
		assert!(result.changed());

		let mut reversed = state();
		let result = merge(&mut reversed, vec![stray]);
		assert_eq!(result.applied, 1);
		assert_eq!(reversed.winners.table_of(&person.row), Some("pet"));

		merge(&mut reversed, vec![name]);
		merge(&mut reversed, vec![person.clone()]);

		for state in [&in_order, &reversed] {
			assert_eq!(state.winners.table_of(&person.row), Some("person"));
			assert_eq!(
				state
					.winners
					.view(&person.row)
					.and_then(|view| view.scalar("name").cloned()),
				Some("ada".into())
			);
			// the stray entry is kept so it reaches every replica
			assert_eq!(state.log.len(), 3);
		}
	}

	#[test]
	fn chain_resolves_in_one_batch() {
		let mut state = state();

		// c -> b -> a, delivered children first
		let a = create("node", 1, X);
		let b = create("node", 2, X);
		let c = create("node", 3, X);

		let result = merge(
			&mut state,
			vec![
				set(c.row, "node", "parent", 4, Payload::Foreign(b.row)),
				set(b.row, "node", "parent", 4, Payload::Foreign(a.row)),
				c,
				b,
				a,
			],
		);

		assert_eq!(result.applied, 5);
		assert_eq!(result.pending, 0);
		assert!(result.passes <= 3);
		assert_eq!(state.winners.len(), 3);
	}

	#[test]
	fn missing_target_waits_across_batches() {
		let mut state = state();
		let pet = create("pet", 1, Y);
		let owner = create("person", 5, X);

		let first = merge(
			&mut state,
			vec![
				pet.clone(),
				set(pet.row, "pet", "owner", 6, Payload::Foreign(owner.row)),
			],
		);

		assert_eq!(first.applied, 1);
		assert_eq!(first.deferred, 1);
		assert_eq!(state.resolver.missing_targets(), vec![owner.row]);
		// deferred entries are not observed
		assert_eq!(state.context.watermark_of(&Y), 1);

		let second = merge(&mut state, vec![owner.clone()]);

		assert_eq!(second.applied, 2);
		assert_eq!(second.resolved, 1);
		assert_eq!(second.pending, 0);
		assert_eq!(
			state.winners.view(&pet.row).and_then(|v| v.reference("owner")),
			Some(owner.row)
		);
	}

	#[test]
	fn self_reference_applies_immediately() {
		let mut state = state();
		let node = create("node", 1, X);

		let result = merge(
			&mut state,
			vec![set(node.row, "node", "parent", 2, Payload::Foreign(node.row))],
		);

		assert_eq!(result.applied, 1);
		assert_eq!(result.deferred, 0);
	}

	#[test]
	fn tombstone_deletes_the_row() {
		let mut state = state();
		let person = create("person", 1, X);
		merge(&mut state, vec![person.clone()]);

		let result = merge(
			&mut state,
			vec![set(person.row, "person", ROW_FIELD, 2, Payload::Tombstone)],
		);

		assert_eq!(result.applied, 1);
		assert!(state.winners.view(&person.row).is_none());
		assert!(state.winners.is_known(&person.row));
	}
}
