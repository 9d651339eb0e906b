//! Boundary between the replication engine and the host database.
//!
//! The engine hands every committed batch to a [`Materializer`] as a list of row images. The
//! host keeps its own local keys, so references arrive as [`RowIdentity`]s and it is up to the
//! store to map them onto whatever it uses locally.

use synq_sync::{FieldValue, RowIdentity};

use std::{
	collections::{BTreeMap, HashMap, HashSet},
	convert::Infallible,
};

use serde::{Deserialize, Serialize};
use tracing::trace;

/// New state of one row touched by a batch.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum RowChange {
	Upsert {
		row: RowIdentity,
		table: String,
		fields: BTreeMap<String, FieldValue>,
	},
	Delete {
		row: RowIdentity,
		table: String,
	},
}

impl RowChange {
	#[must_use]
	pub const fn row(&self) -> RowIdentity {
		match self {
			Self::Upsert { row, .. } | Self::Delete { row, .. } => *row,
		}
	}

	#[must_use]
	pub fn table(&self) -> &str {
		match self {
			Self::Upsert { table, .. } | Self::Delete { table, .. } => table,
		}
	}
}

/// Applies row changes to the host store.
///
/// Called inside the engine's transaction, right before commit. Returning an error rolls the
/// whole batch back, so implementations must apply all changes or none of them.
pub trait Materializer {
	type Error: std::error::Error + Send + Sync + 'static;

	fn apply(&mut self, changes: &[RowChange]) -> Result<(), Self::Error>;
}

/// Column value as stored locally: references point at local ids.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum StoredValue {
	Scalar(rmpv::Value),
	Reference(Option<u64>),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredRow {
	pub identity: RowIdentity,
	pub fields: BTreeMap<String, StoredValue>,
}

#[derive(Debug, Clone, Default)]
struct StoredTable {
	next_id: u64,
	rows: BTreeMap<u64, StoredRow>,
}

/// In memory host store with auto-increment keys per table.
///
/// Local ids survive deletion, a resurrected row comes back under the id it had. A reference
/// only resolves to a local id while its target is stored, whatever order changes came in.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
	tables: BTreeMap<String, StoredTable>,
	ids: HashMap<RowIdentity, (String, u64)>,
}

impl MemoryStore {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn local_id(&self, row: &RowIdentity) -> Option<u64> {
		self.ids.get(row).map(|(_, id)| *id)
	}

	#[must_use]
	pub fn get(&self, table: &str, id: u64) -> Option<&StoredRow> {
		self.tables.get(table).and_then(|table| table.rows.get(&id))
	}

	#[must_use]
	pub fn by_identity(&self, row: &RowIdentity) -> Option<&StoredRow> {
		self.ids
			.get(row)
			.and_then(|(table, id)| self.get(table, *id))
	}

	/// Rows of `table` ordered by local id.
	pub fn rows(&self, table: &str) -> impl Iterator<Item = (u64, &StoredRow)> {
		self.tables
			.get(table)
			.into_iter()
			.flat_map(|table| table.rows.iter().map(|(id, row)| (*id, row)))
	}

	#[must_use]
	pub fn len(&self, table: &str) -> usize {
		self.tables.get(table).map_or(0, |table| table.rows.len())
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.tables.values().all(|table| table.rows.is_empty())
	}

	/// Local id of `row` if it is stored, or about to be.
	fn stored_id(&self, row: &RowIdentity, upserted: &HashSet<RowIdentity>) -> Option<u64> {
		let (table, id) = self.ids.get(row)?;

		(upserted.contains(row) || self.get(table, *id).is_some()).then_some(*id)
	}

	fn assign_id(&mut self, row: RowIdentity, table: &str) -> u64 {
		if let Some((_, id)) = self.ids.get(&row) {
			return *id;
		}

		let stored = self.tables.entry(table.to_string()).or_default();
		stored.next_id += 1;
		let id = stored.next_id;

		self.ids.insert(row, (table.to_string(), id));

		id
	}
}

impl Materializer for MemoryStore {
	type Error = Infallible;

	fn apply(&mut self, changes: &[RowChange]) -> Result<(), Self::Error> {
		for change in changes {
			if let RowChange::Delete { row, table } = change {
				if let Some(id) = self.local_id(row) {
					trace!(%row, table, id, "deleting row");

					if let Some(stored) = self.tables.get_mut(table) {
						stored.rows.remove(&id);
					}
				}
			}
		}

		// ids first, so references between rows of the same batch resolve
		let mut upserted = HashSet::new();
		for change in changes {
			if let RowChange::Upsert { row, table, .. } = change {
				self.assign_id(*row, table);
				upserted.insert(*row);
			}
		}

		for change in changes {
			let RowChange::Upsert { row, table, fields } = change else {
				continue;
			};

			let fields = fields
				.iter()
				.map(|(name, value)| {
					let value = match value {
						FieldValue::Scalar(value) => StoredValue::Scalar(value.clone()),
						FieldValue::Reference(target) => {
							StoredValue::Reference(self.stored_id(target, &upserted))
						}
					};

					(name.clone(), value)
				})
				.collect();

			let id = self.assign_id(*row, table);

			trace!(%row, table, id, "upserting row");

			self.tables.entry(table.clone()).or_default().rows.insert(
				id,
				StoredRow {
					identity: *row,
					fields,
				},
			);
		}

		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	use synq_sync::PeerId;

	const X: PeerId = PeerId::from_u128(1);

	fn upsert(row: RowIdentity, table: &str, fields: Vec<(&str, FieldValue)>) -> RowChange {
		RowChange::Upsert {
			row,
			table: table.to_string(),
			fields: fields
				.into_iter()
				.map(|(name, value)| (name.to_string(), value))
				.collect(),
		}
	}

	#[test]
	fn references_resolve_within_a_batch() {
		let owner = RowIdentity::new(2, X);
		let pet = RowIdentity::new(1, X);
		let mut store = MemoryStore::new();

		store
			.apply(&[
				upsert(pet, "pet", vec![("owner", FieldValue::Reference(owner))]),
				upsert(
					owner,
					"person",
					vec![("name", FieldValue::Scalar("ada".into()))],
				),
			])
			.unwrap();

		let owner_id = store.local_id(&owner).unwrap();

		assert_eq!(
			store.by_identity(&pet).unwrap().fields["owner"],
			StoredValue::Reference(Some(owner_id))
		);
		assert_eq!(store.len("person"), 1);
	}

	#[test]
	fn ids_are_per_table_and_survive_deletion() {
		let a = RowIdentity::new(1, X);
		let b = RowIdentity::new(2, X);
		let mut store = MemoryStore::new();

		store
			.apply(&[upsert(a, "person", vec![]), upsert(b, "pet", vec![])])
			.unwrap();
		assert_eq!(store.local_id(&a), Some(1));
		assert_eq!(store.local_id(&b), Some(1));

		store
			.apply(&[RowChange::Delete {
				row: a,
				table: "person".to_string(),
			}])
			.unwrap();
		assert!(store.by_identity(&a).is_none());
		assert_eq!(store.len("person"), 0);

		store.apply(&[upsert(a, "person", vec![])]).unwrap();
		assert_eq!(store.rows("person").map(|(id, _)| id).collect::<Vec<_>>(), vec![1]);
	}

	#[test]
	fn references_to_deleted_rows_are_null_in_any_batching() {
		let owner = RowIdentity::new(1, X);
		let pet = RowIdentity::new(2, X);
		let delete_owner = RowChange::Delete {
			row: owner,
			table: "person".to_string(),
		};
		let adopt = upsert(pet, "pet", vec![("owner", FieldValue::Reference(owner))]);

		let mut stored = MemoryStore::new();
		stored.apply(&[upsert(owner, "person", vec![])]).unwrap();

		let mut one_by_one = stored.clone();
		one_by_one.apply(&[delete_owner.clone()]).unwrap();
		one_by_one.apply(&[adopt.clone()]).unwrap();

		let mut together = stored;
		together.apply(&[adopt, delete_owner]).unwrap();

		for store in [&one_by_one, &together] {
			assert_eq!(
				store.by_identity(&pet).unwrap().fields["owner"],
				StoredValue::Reference(None)
			);
		}

		// the owner coming back under its old id makes the reference resolve again
		one_by_one
			.apply(&[
				upsert(owner, "person", vec![]),
				upsert(pet, "pet", vec![("owner", FieldValue::Reference(owner))]),
			])
			.unwrap();
		assert_eq!(
			one_by_one.by_identity(&pet).unwrap().fields["owner"],
			StoredValue::Reference(Some(1))
		);
	}

	#[test]
	fn unknown_reference_is_null() {
		let mut store = MemoryStore::new();
		let row = RowIdentity::new(1, X);

		store
			.apply(&[upsert(
				row,
				"pet",
				vec![("owner", FieldValue::Reference(RowIdentity::new(7, X)))],
			)])
			.unwrap();

		assert_eq!(
			store.get("pet", 1).unwrap().fields["owner"],
			StoredValue::Reference(None)
		);
	}
}
