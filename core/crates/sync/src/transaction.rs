//! Undo journal making every write and merge all or nothing.
//!
//! A [`Transaction`] mutably borrows the replica state and records how to revert each change.
//! Dropping it without calling [`Transaction::commit`] replays the journal backwards, which
//! covers early returns, panics and cancelled futures alike.

use synq_sync::{
	ClockSaturated, Context, EntryFactory, EntryKey, LogEntry, LogicalClock, LogicalTimestamp,
	RowIdentity,
};

use tracing::debug;

use crate::{
	log::UnifiedLog,
	resolver::ForeignKeyResolver,
	winners::{Replaced, RowWinners, WinnerIndex},
};

/// Everything a merge or a local write can touch.
#[derive(Debug, Clone)]
pub struct ReplicaState {
	pub clock: LogicalClock,
	pub context: Context,
	pub log: UnifiedLog,
	pub winners: WinnerIndex,
	pub resolver: ForeignKeyResolver,
}

enum Undo {
	Appended(u64),
	Winner {
		row: RowIdentity,
		field: String,
		replaced: Replaced,
	},
	Deferred {
		target: RowIdentity,
		key: EntryKey,
	},
	Taken {
		target: RowIdentity,
		entries: Vec<LogEntry>,
	},
	Row {
		row: RowIdentity,
		previous: Option<RowWinners>,
	},
}

pub struct Transaction<'state> {
	state: &'state mut ReplicaState,
	journal: Vec<Undo>,
	context: Context,
	clock: LogicalClock,
	committed: bool,
}

impl<'state> Transaction<'state> {
	pub fn begin(state: &'state mut ReplicaState) -> Self {
		let context = state.context.clone();
		let clock = state.clock.clone();

		Self {
			state,
			journal: vec![],
			context,
			clock,
			committed: false,
		}
	}

	#[must_use]
	pub fn state(&self) -> &ReplicaState {
		&*self.state
	}

	pub fn append(&mut self, entry: LogEntry) -> bool {
		self.state.log.append(entry).map_or(false, |seq| {
			self.journal.push(Undo::Appended(seq));
			true
		})
	}

	pub fn set_winner(&mut self, entry: LogEntry) {
		let row = entry.row;
		let field = entry.field.clone();
		let replaced = self.state.winners.set(entry);

		self.journal.push(Undo::Winner {
			row,
			field,
			replaced,
		});
	}

	/// Recomputes every winner of `row` from the log, used when the row's table changes.
	pub fn rebuild_row(&mut self, row: RowIdentity) {
		let ReplicaState { log, winners, .. } = &mut *self.state;
		let previous = winners.rebuild_row(row, log.row_entries(&row));

		self.journal.push(Undo::Row { row, previous });
	}

	pub fn defer(&mut self, entry: LogEntry) -> bool {
		let (Some(target), key) = (entry.payload.foreign_target().copied(), entry.key()) else {
			return false;
		};

		let deferred = self.state.resolver.defer(entry);
		if deferred {
			self.journal.push(Undo::Deferred { target, key });
		}

		deferred
	}

	pub fn take_pending(&mut self, target: &RowIdentity) -> Vec<LogEntry> {
		let entries = self.state.resolver.take(target);

		if !entries.is_empty() {
			self.journal.push(Undo::Taken {
				target: *target,
				entries: entries.clone(),
			});
		}

		entries
	}

	pub fn observe(&mut self, stamp: &LogicalTimestamp) {
		self.state.context.observe_stamp(stamp);
	}

	pub fn merge_context(&mut self, other: &Context) {
		self.state.context.merge(other);
	}

	pub fn commit(mut self) {
		debug!(changes = self.journal.len(), "committing transaction");
		self.journal.clear();
		self.committed = true;
	}

	fn rollback(&mut self) {
		debug!(changes = self.journal.len(), "rolling back transaction");

		while let Some(undo) = self.journal.pop() {
			match undo {
				Undo::Appended(seq) => {
					self.state.log.remove_seq(seq);
				}
				Undo::Winner {
					row,
					field,
					replaced,
				} => self.state.winners.restore(row, &field, replaced),
				Undo::Deferred { target, key } => self.state.resolver.remove(&target, &key),
				Undo::Taken { target, entries } => self.state.resolver.restore(target, entries),
				Undo::Row { row, previous } => self.state.winners.restore_row(row, previous),
			}
		}

		std::mem::swap(&mut self.state.context, &mut self.context);
		std::mem::swap(&mut self.state.clock, &mut self.clock);
	}
}

impl EntryFactory for Transaction<'_> {
	fn new_stamp(&mut self) -> Result<LogicalTimestamp, ClockSaturated> {
		let ReplicaState { clock, context, .. } = &mut *self.state;
		clock.advance(context)
	}
}

impl Drop for Transaction<'_> {
	fn drop(&mut self) {
		if !self.committed {
			self.rollback();
		}
	}
}
