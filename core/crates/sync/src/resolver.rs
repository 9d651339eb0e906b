use synq_sync::{Context, EntryKey, LogEntry, RowIdentity};

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Foreign entries waiting for their target row to be materialized, keyed by that target.
#[derive(Debug, Default, Clone)]
pub struct ForeignKeyResolver {
	waiting_for: HashMap<RowIdentity, Vec<LogEntry>>,
	keys: HashSet<EntryKey>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverStats {
	pub pending: usize,
	pub missing_targets: Vec<RowIdentity>,
}

impl ForeignKeyResolver {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Queues `entry` behind its target. Returns `false` for non foreign entries and for
	/// entries already queued.
	pub fn defer(&mut self, entry: LogEntry) -> bool {
		let Some(target) = entry.payload.foreign_target().copied() else {
			return false;
		};

		if !self.keys.insert(entry.key()) {
			return false;
		}

		self.waiting_for.entry(target).or_default().push(entry);

		true
	}

	/// Removes and returns every entry waiting on `target`.
	pub fn take(&mut self, target: &RowIdentity) -> Vec<LogEntry> {
		let entries = self.waiting_for.remove(target).unwrap_or_default();

		for entry in &entries {
			self.keys.remove(&entry.key());
		}

		entries
	}

	/// Undoes a [`ForeignKeyResolver::take`].
	pub fn restore(&mut self, target: RowIdentity, entries: Vec<LogEntry>) {
		if entries.is_empty() {
			return;
		}

		self.keys.extend(entries.iter().map(LogEntry::key));
		self.waiting_for.entry(target).or_default().extend(entries);
	}

	/// Undoes a [`ForeignKeyResolver::defer`].
	pub fn remove(&mut self, target: &RowIdentity, key: &EntryKey) {
		if !self.keys.remove(key) {
			return;
		}

		if let Some(entries) = self.waiting_for.get_mut(target) {
			entries.retain(|entry| entry.key() != *key);
			if entries.is_empty() {
				self.waiting_for.remove(target);
			}
		}
	}

	#[must_use]
	pub fn contains(&self, key: &EntryKey) -> bool {
		self.keys.contains(key)
	}

	#[must_use]
	pub fn is_waiting_on(&self, target: &RowIdentity) -> bool {
		self.waiting_for.contains_key(target)
	}

	/// Pending entries whose counter is above `recipient`'s watermark for their stamp peer.
	pub fn select_unsent<'a>(
		&'a self,
		recipient: &'a Context,
	) -> impl Iterator<Item = &'a LogEntry> + 'a {
		self.iter().filter(|entry| !recipient.covers(&entry.stamp))
	}

	pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
		self.waiting_for.values().flatten()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.keys.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.keys.is_empty()
	}

	#[must_use]
	pub fn missing_targets(&self) -> Vec<RowIdentity> {
		let mut targets = self.waiting_for.keys().copied().collect::<Vec<_>>();
		targets.sort_unstable();
		targets
	}

	#[must_use]
	pub fn stats(&self) -> ResolverStats {
		ResolverStats {
			pending: self.len(),
			missing_targets: self.missing_targets(),
		}
	}
}
