//! Integrity constraints, resolved after every write and merge.
//!
//! Last writer wins settles every field on its own, so concurrent writes can leave two live rows
//! sharing a unique key, or a live row pointing at a deleted one. A [`Resolution`] is derived
//! from the winners alone, so replicas holding the same entries show the same rows whatever
//! order the entries arrived in. The rules run in a fixed order:
//!
//! 1. a deleted row referenced by a live row through a restricting key comes back, along with
//!    every row it needs through its own keys;
//! 2. among live rows sharing a unique key only the one created first stays visible;
//! 3. rows referencing a row that is gone through a cascading or restricting key go too;
//! 4. the remaining references to rows that are gone read as nil.

use synq_sync::{FieldValue, Payload, RowIdentity};

use std::collections::{hash_map, BTreeSet, HashMap, HashSet};

use tracing::{debug, warn};

use crate::{
	config::{Config, OnDelete},
	log::UnifiedLog,
	store::RowChange,
	winners::{RowView, RowWinners, WinnerIndex},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
	Cascade,
	Restrict,
	SetNull,
}

/// Declarations of a [`Config`], indexed by table.
#[derive(Debug, Clone, Default)]
pub struct Constraints {
	foreign_keys: HashMap<String, HashMap<String, Action>>,
	unique: Vec<(String, Vec<String>)>,
}

impl Constraints {
	#[must_use]
	pub fn new(config: &Config) -> Self {
		let mut foreign_keys = HashMap::<String, HashMap<String, Action>>::new();

		for key in &config.foreign_keys {
			let action = match key.on_delete {
				OnDelete::Cascade => Action::Cascade,
				OnDelete::Restrict => Action::Restrict,
				OnDelete::SetNull => Action::SetNull,
				OnDelete::NoAction if config.no_action_is_cascade => Action::Cascade,
				OnDelete::NoAction => Action::Restrict,
			};

			foreign_keys
				.entry(key.table.clone())
				.or_default()
				.insert(key.field.clone(), action);
		}

		let unique = config
			.unique
			.iter()
			.filter(|key| !key.fields.is_empty())
			.map(|key| (key.table.clone(), key.fields.clone()))
			.collect();

		Self {
			foreign_keys,
			unique,
		}
	}

	fn action(&self, table: &str, field: &str) -> Action {
		self.foreign_keys
			.get(table)
			.and_then(|fields| fields.get(field))
			.copied()
			.unwrap_or(Action::SetNull)
	}

	/// Targets of `view` along with what deleting them does to it.
	fn references<'a>(
		&'a self,
		view: &'a RowView,
	) -> impl Iterator<Item = (RowIdentity, Action)> + 'a {
		view.fields.iter().filter_map(|(field, value)| match value {
			FieldValue::Reference(target) => Some((*target, self.action(&view.table, field))),
			FieldValue::Scalar(_) => None,
		})
	}
}

/// Rows visible once every constraint is resolved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
	views: HashMap<RowIdentity, RowView>,
	revived: BTreeSet<RowIdentity>,
	suppressed: BTreeSet<RowIdentity>,
	cascaded: BTreeSet<RowIdentity>,
}

impl Resolution {
	#[must_use]
	pub fn resolve(winners: &WinnerIndex, log: &UnifiedLog, constraints: &Constraints) -> Self {
		let mut views = winners
			.iter()
			.filter(|(_, row_winners)| !row_winners.is_deleted())
			.map(|(row, row_winners)| (*row, RowView::new(*row, row_winners)))
			.collect::<HashMap<_, _>>();

		let revived = revive_restricted(&mut views, winners, log, constraints);
		let suppressed = suppress_duplicates(&views, constraints);

		let mut live = views
			.keys()
			.filter(|row| !suppressed.contains(row))
			.copied()
			.collect::<HashSet<_>>();

		let cascaded = cascade(&views, &mut live, constraints);

		views.retain(|row, _| live.contains(row));

		for view in views.values_mut() {
			for value in view.fields.values_mut() {
				if let FieldValue::Reference(target) = &*value {
					if !live.contains(target) {
						*value = FieldValue::Scalar(rmpv::Value::Nil);
					}
				}
			}
		}

		if !(revived.is_empty() && suppressed.is_empty() && cascaded.is_empty()) {
			debug!(
				revived = revived.len(),
				suppressed = suppressed.len(),
				cascaded = cascaded.len(),
				"resolved integrity constraints"
			);
		}

		Self {
			views,
			revived,
			suppressed,
			cascaded,
		}
	}

	#[must_use]
	pub fn view(&self, row: &RowIdentity) -> Option<&RowView> {
		self.views.get(row)
	}

	/// Visible rows of `table`, in creation order.
	#[must_use]
	pub fn views(&self, table: &str) -> Vec<RowView> {
		let mut views = self
			.views
			.values()
			.filter(|view| view.table == table)
			.cloned()
			.collect::<Vec<_>>();

		views.sort_unstable_by_key(|view| view.row);

		views
	}

	#[must_use]
	pub fn is_live(&self, row: &RowIdentity) -> bool {
		self.views.contains_key(row)
	}

	/// Deleted rows shown again because a live row still needs them.
	#[must_use]
	pub fn is_revived(&self, row: &RowIdentity) -> bool {
		self.revived.contains(row) && self.is_live(row)
	}

	/// Rows hidden because an older row holds the same unique key.
	#[must_use]
	pub const fn suppressed(&self) -> &BTreeSet<RowIdentity> {
		&self.suppressed
	}

	/// Rows hidden because a row they depend on is gone.
	#[must_use]
	pub const fn cascaded(&self) -> &BTreeSet<RowIdentity> {
		&self.cascaded
	}

	/// What the host store has to do to go from `self` to `next`, in creation order.
	///
	/// A row shows up whenever its image changes, which includes references turning nil or
	/// coming back as their target goes or returns.
	#[must_use]
	pub fn changes(&self, next: &Self) -> Vec<RowChange> {
		self.views
			.keys()
			.chain(next.views.keys())
			.collect::<BTreeSet<_>>()
			.into_iter()
			.filter_map(|row| match (self.views.get(row), next.views.get(row)) {
				(previous, Some(view)) if previous != Some(view) => Some(RowChange::Upsert {
					row: view.row,
					table: view.table.clone(),
					fields: view.fields.clone(),
				}),
				(Some(previous), None) => Some(RowChange::Delete {
					row: *row,
					table: previous.table.clone(),
				}),
				_ => None,
			})
			.collect()
	}
}

fn revive_restricted(
	views: &mut HashMap<RowIdentity, RowView>,
	winners: &WinnerIndex,
	log: &UnifiedLog,
	constraints: &Constraints,
) -> BTreeSet<RowIdentity> {
	let mut queue = views
		.values()
		.flat_map(|view| constraints.references(view))
		.filter(|(_, action)| *action == Action::Restrict)
		.map(|(target, _)| target)
		.collect::<Vec<_>>();

	let mut reached = HashSet::new();
	let mut revived = BTreeSet::new();

	while let Some(row) = queue.pop() {
		if !reached.insert(row) {
			continue;
		}

		let view = match views.entry(row) {
			hash_map::Entry::Occupied(entry) => entry.into_mut(),
			hash_map::Entry::Vacant(entry) => {
				let Some(row_winners) = winners.row(&row) else {
					continue;
				};

				debug!(%row, "reviving a deleted row that is still referenced");
				revived.insert(row);

				entry.insert(restored(row, row_winners, log))
			}
		};

		// whatever keeps this row alive has to stay too
		queue.extend(
			constraints
				.references(view)
				.filter(|(_, action)| *action != Action::SetNull)
				.map(|(target, _)| target),
		);
	}

	revived
}

/// Image of a deleted row with every field the delete tombstoned back to its last value.
fn restored(row: RowIdentity, row_winners: &RowWinners, log: &UnifiedLog) -> RowView {
	let mut view = RowView::new(row, row_winners);

	for winner in row_winners
		.winners()
		.filter(|winner| !winner.is_row_field() && winner.payload.is_tombstone())
	{
		let value = log
			.latest_value(&row, &winner.field, row_winners.table())
			.and_then(|entry| match &entry.payload {
				Payload::Scalar(value) => Some(FieldValue::Scalar(value.clone())),
				Payload::Foreign(target) => Some(FieldValue::Reference(*target)),
				Payload::Tombstone => None,
			});

		if let Some(value) = value {
			view.fields.insert(winner.field.clone(), value);
		}
	}

	view
}

fn suppress_duplicates(
	views: &HashMap<RowIdentity, RowView>,
	constraints: &Constraints,
) -> BTreeSet<RowIdentity> {
	let mut rows = views.keys().copied().collect::<Vec<_>>();
	rows.sort_unstable();

	let mut suppressed = BTreeSet::new();

	for (table, fields) in &constraints.unique {
		let mut holders = HashMap::<Vec<u8>, RowIdentity>::new();

		for row in &rows {
			let view = &views[row];
			if view.table != *table {
				continue;
			}

			let Some(values) = fields
				.iter()
				.map(|field| {
					view.get(field)
						.filter(|value| **value != FieldValue::Scalar(rmpv::Value::Nil))
				})
				.collect::<Option<Vec<_>>>()
			else {
				continue;
			};

			let key = match rmp_serde::to_vec(&values) {
				Ok(key) => key,
				Err(e) => {
					warn!(%row, ?e, "failed to encode unique key, skipping the row");
					continue;
				}
			};

			match holders.entry(key) {
				hash_map::Entry::Vacant(entry) => {
					entry.insert(*row);
				}
				hash_map::Entry::Occupied(entry) => {
					debug!(%row, holder = %entry.get(), table, "unique key already taken");
					suppressed.insert(*row);
				}
			}
		}
	}

	suppressed
}

fn cascade(
	views: &HashMap<RowIdentity, RowView>,
	live: &mut HashSet<RowIdentity>,
	constraints: &Constraints,
) -> BTreeSet<RowIdentity> {
	let mut referrers = HashMap::<RowIdentity, Vec<RowIdentity>>::new();
	let mut dangling = vec![];

	for row in live.iter() {
		for (target, action) in constraints.references(&views[row]) {
			if action == Action::SetNull {
				continue;
			}

			referrers.entry(target).or_default().push(*row);

			if !live.contains(&target) {
				dangling.push(*row);
			}
		}
	}

	let mut cascaded = BTreeSet::new();

	while let Some(row) = dangling.pop() {
		if !live.remove(&row) {
			continue;
		}

		cascaded.insert(row);

		if let Some(rows) = referrers.get(&row) {
			dangling.extend(rows.iter().copied());
		}
	}

	cascaded
}
