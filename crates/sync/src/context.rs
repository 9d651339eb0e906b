use std::collections::{btree_map, BTreeMap};

use serde::{Deserialize, Serialize};

use crate::{LogicalTimestamp, PeerId};

/// Per peer watermark: the highest counter known from each peer.
///
/// Watermarks only ever move forward. A peer that was never seen has a watermark of `0`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct Context(BTreeMap<PeerId, u64>);

impl Context {
	/// Context of a fresh replica, which only knows about itself.
	#[must_use]
	pub fn new(own: PeerId) -> Self {
		let mut context = Self::default();
		context.register(own);
		context
	}

	/// Adds `peer` at watermark `0` if it is not known yet.
	pub fn register(&mut self, peer: PeerId) {
		self.0.entry(peer).or_insert(0);
	}

	/// Raises the watermark of `peer` to `counter`, returns whether anything changed.
	pub fn observe(&mut self, peer: PeerId, counter: u64) -> bool {
		match self.0.entry(peer) {
			btree_map::Entry::Vacant(entry) => {
				entry.insert(counter);
				true
			}
			btree_map::Entry::Occupied(mut entry) => {
				if *entry.get() < counter {
					entry.insert(counter);
					true
				} else {
					false
				}
			}
		}
	}

	pub fn observe_stamp(&mut self, stamp: &LogicalTimestamp) -> bool {
		self.observe(stamp.peer, stamp.counter)
	}

	#[must_use]
	pub fn watermark_of(&self, peer: &PeerId) -> u64 {
		self.0.get(peer).copied().unwrap_or_default()
	}

	#[must_use]
	pub fn contains(&self, peer: &PeerId) -> bool {
		self.0.contains_key(peer)
	}

	/// Whether the stamp is at or below the watermark of its peer.
	#[must_use]
	pub fn covers(&self, stamp: &LogicalTimestamp) -> bool {
		self.watermark_of(&stamp.peer) >= stamp.counter
	}

	#[must_use]
	pub fn max_counter(&self) -> u64 {
		self.0.values().copied().max().unwrap_or_default()
	}

	/// Pointwise maximum with `other`.
	pub fn merge(&mut self, other: &Self) {
		for (peer, counter) in other.iter() {
			self.observe(peer, counter);
		}
	}

	/// The part of this context made of stamps up to `bound`, in stamp order.
	///
	/// Peers ordered after `bound.peer` stop one counter short of it, since their stamps at
	/// `bound.counter` come after `bound`.
	#[must_use]
	pub fn capped_at(&self, bound: &LogicalTimestamp) -> Self {
		self.iter()
			.map(|(peer, counter)| {
				let cap = if peer <= bound.peer {
					bound.counter
				} else {
					bound.counter.saturating_sub(1)
				};

				(peer, counter.min(cap))
			})
			.collect()
	}

	/// Lowers the watermark of the stamp's peer until it no longer covers `stamp`.
	pub fn uncover(&mut self, stamp: &LogicalTimestamp) {
		if let Some(counter) = self.0.get_mut(&stamp.peer) {
			*counter = (*counter).min(stamp.counter.saturating_sub(1));
		}
	}

	pub fn iter(&self) -> impl Iterator<Item = (PeerId, u64)> + '_ {
		self.0.iter().map(|(peer, counter)| (*peer, *counter))
	}

	pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
		self.0.keys()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.0.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl FromIterator<(PeerId, u64)> for Context {
	fn from_iter<T: IntoIterator<Item = (PeerId, u64)>>(iter: T) -> Self {
		let mut context = Self::default();
		for (peer, counter) in iter {
			context.observe(peer, counter);
		}
		context
	}
}
