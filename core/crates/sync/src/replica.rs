use synq_sync::{
	CompressedLogEntries, Context, EntryFactory, FieldValue, LogEntry, LogicalClock, Mutation,
	Payload, PeerId, RowIdentity, TimeSource, ROW_FIELD,
};

use std::{
	cmp::Ordering,
	collections::{BTreeMap, HashSet},
	path::Path,
	sync::Arc,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{
	integrity::{Constraints, Resolution},
	log::UnifiedLog,
	merge::{MergeEngine, MergeResult},
	persist::ReplicaSnapshot,
	resolver::{ForeignKeyResolver, ResolverStats},
	store::Materializer,
	transaction::{ReplicaState, Transaction},
	winners::{RowView, WinnerIndex},
	Config, Error,
};

/// Answer to a fingerprint: the entries the requester is missing.
#[derive(Debug, Clone, PartialEq)]
pub struct Delta {
	pub sender: PeerId,
	pub entries: Vec<LogEntry>,
	/// The entries were cut short by a count limit, ask again with an updated fingerprint.
	/// Entries the sender still defers only come with the last page.
	pub has_more: bool,
	/// What the receiver knows once the entries are applied: the sender's whole context when
	/// nothing was left out. Otherwise it is capped at the last stamp sent and stays below
	/// the sender's deferred entries.
	pub context: Option<Context>,
}

#[derive(Serialize, Deserialize)]
struct WireDelta {
	sender: PeerId,
	entries: CompressedLogEntries,
	has_more: bool,
	context: Option<Context>,
}

impl Delta {
	pub fn encode(&self) -> Result<Vec<u8>, Error> {
		rmp_serde::to_vec_named(&WireDelta {
			sender: self.sender,
			entries: CompressedLogEntries::new(self.entries.clone()),
			has_more: self.has_more,
			context: self.context.clone(),
		})
		.map_err(Into::into)
	}

	pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
		let WireDelta {
			sender,
			entries,
			has_more,
			context,
		} = rmp_serde::from_slice(bytes)?;

		Ok(Self {
			sender,
			entries: entries.into_entries(),
			has_more,
			context,
		})
	}

	#[must_use]
	pub fn is_complete(&self) -> bool {
		!self.has_more
	}
}

/// Outcome of a local write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Written {
	/// Identity of every inserted row, in mutation order.
	pub created: Vec<RowIdentity>,
	pub entries: Vec<LogEntry>,
}

/// One replica of the replicated database.
#[derive(Debug, Clone)]
pub struct Replica {
	peer: PeerId,
	config: Config,
	constraints: Constraints,
	state: ReplicaState,
	/// Rows as the host store currently holds them.
	resolution: Resolution,
	remote_contexts: BTreeMap<PeerId, Context>,
}

impl Replica {
	#[must_use]
	pub fn init(peer: PeerId, config: Config) -> Self {
		let clock = if config.physical_clock {
			LogicalClock::new(peer, 0)
		} else {
			LogicalClock::logical(peer, 0)
		};

		Self::with_clock(peer, config, clock)
	}

	/// Like [`Replica::init`], reading physical time from `time_source` when the config asks
	/// for a physical clock.
	#[must_use]
	pub fn with_time_source(
		peer: PeerId,
		config: Config,
		time_source: Arc<dyn TimeSource>,
	) -> Self {
		let clock = LogicalClock::with_time_source(
			peer,
			0,
			config.physical_clock.then_some(time_source),
		);

		Self::with_clock(peer, config, clock)
	}

	fn with_clock(peer: PeerId, config: Config, clock: LogicalClock) -> Self {
		debug!(%peer, physical_clock = clock.is_physical(), "initializing replica");

		Self {
			peer,
			constraints: Constraints::new(&config),
			config,
			state: ReplicaState {
				clock,
				context: Context::new(peer),
				log: UnifiedLog::new(),
				winners: WinnerIndex::new(),
				resolver: ForeignKeyResolver::new(),
			},
			resolution: Resolution::default(),
			remote_contexts: BTreeMap::new(),
		}
	}

	/// Copy of the whole replica under a new identity.
	#[must_use]
	pub fn clone_to(&self, peer: PeerId) -> Self {
		let mut state = self.state.clone();

		state.context.register(peer);
		state.clock.rebind(peer);
		state.clock.reseed(self.state.clock.last(), &state.context);

		debug!(from = %self.peer, to = %peer, entries = state.log.len(), "cloned replica");

		Self {
			peer,
			config: self.config.clone(),
			constraints: self.constraints.clone(),
			state,
			resolution: self.resolution.clone(),
			remote_contexts: BTreeMap::new(),
		}
	}

	#[must_use]
	pub const fn peer(&self) -> PeerId {
		self.peer
	}

	#[must_use]
	pub const fn config(&self) -> &Config {
		&self.config
	}

	#[must_use]
	pub const fn context(&self) -> &Context {
		&self.state.context
	}

	/// What a requester sends to ask for the entries it is missing.
	#[must_use]
	pub fn fingerprint(&self) -> Context {
		self.state.context.clone()
	}

	#[must_use]
	pub const fn log(&self) -> &UnifiedLog {
		&self.state.log
	}

	#[must_use]
	pub const fn clock(&self) -> &LogicalClock {
		&self.state.clock
	}

	#[must_use]
	pub fn pending(&self) -> ResolverStats {
		self.state.resolver.stats()
	}

	#[must_use]
	pub fn remote_context(&self, peer: &PeerId) -> Option<&Context> {
		self.remote_contexts.get(peer)
	}

	/// Visible image of `row`, `None` when unknown, deleted or hidden by a constraint.
	#[must_use]
	pub fn row(&self, row: &RowIdentity) -> Option<RowView> {
		self.resolution.view(row).cloned()
	}

	/// Visible rows of `table`, in creation order.
	#[must_use]
	pub fn rows(&self, table: &str) -> Vec<RowView> {
		self.resolution.views(table)
	}

	/// Whether `row` is known but not visible.
	#[must_use]
	pub fn is_deleted(&self, row: &RowIdentity) -> bool {
		self.state.winners.is_known(row) && !self.resolution.is_live(row)
	}

	#[must_use]
	pub const fn resolution(&self) -> &Resolution {
		&self.resolution
	}

	/// Entries above the watermarks of `fingerprint`, pending ones included, in stamp order.
	///
	/// With a `limit` the answer may hold a few more entries than asked for, so the entries
	/// sharing a stamp always travel together.
	#[must_use]
	pub fn delta(&self, fingerprint: &Context, limit: Option<usize>) -> Delta {
		let mut entries = self
			.state
			.log
			.select_unsent(fingerprint)
			.cloned()
			.collect::<Vec<_>>();

		entries.sort_unstable_by(by_stamp);

		let total = entries.len();

		if let Some(limit) = limit.map(|limit| limit.max(1)).filter(|limit| *limit < total) {
			let boundary = entries[limit - 1].stamp;
			let end = limit
				+ entries[limit..]
					.iter()
					.take_while(|entry| entry.stamp == boundary)
					.count();

			entries.truncate(end);
		}

		let has_more = entries.len() < total;

		// pending entries only travel with the last page, a requester deferring them can't
		// move its fingerprint past them and would be served the same page forever
		let context = match entries.last() {
			Some(last) if has_more => {
				let mut capped = self.state.context.capped_at(&last.stamp);
				for entry in self.state.resolver.iter() {
					capped.uncover(&entry.stamp);
				}
				capped
			}
			_ => {
				entries.extend(self.state.resolver.select_unsent(fingerprint).cloned());
				entries.sort_unstable_by(by_stamp);
				self.state.context.clone()
			}
		};

		debug!(
			to_send = entries.len(),
			total, has_more, "selected entries for fingerprint"
		);

		Delta {
			sender: self.peer,
			entries,
			has_more,
			context: Some(context),
		}
	}

	/// Merges a delta, then adopts the context it carries.
	#[instrument(
		skip_all,
		fields(peer = %self.peer, sender = %delta.sender, entries = delta.entries.len()),
		err
	)]
	pub fn pull<S: Materializer>(
		&mut self,
		delta: Delta,
		store: &mut S,
	) -> Result<MergeResult, Error> {
		let Delta {
			sender,
			entries,
			has_more,
			context,
		} = delta;

		let mut tx = Transaction::begin(&mut self.state);
		let result = MergeEngine::new(&mut tx).apply_batch(entries);

		if let Some(context) = &context {
			tx.merge_context(context);
		}

		let next = Resolution::resolve(&tx.state().winners, &tx.state().log, &self.constraints);
		materialize(store, &self.resolution, &next)?;

		tx.commit();
		self.resolution = next;

		if let Some(context) = context.filter(|_| !has_more) {
			self.record_remote_context(sender, context);
		}

		Ok(result)
	}

	/// Merges loose entries, without any context exchange.
	#[instrument(skip_all, fields(peer = %self.peer, entries = entries.len()), err)]
	pub fn apply_batch<S: Materializer>(
		&mut self,
		entries: Vec<LogEntry>,
		store: &mut S,
	) -> Result<MergeResult, Error> {
		let mut tx = Transaction::begin(&mut self.state);
		let result = MergeEngine::new(&mut tx).apply_batch(entries);

		let next = Resolution::resolve(&tx.state().winners, &tx.state().log, &self.constraints);
		materialize(store, &self.resolution, &next)?;

		tx.commit();
		self.resolution = next;

		Ok(result)
	}

	/// Captures local mutations: every row level mutation gets its own stamp, and the whole
	/// list commits or fails together.
	///
	/// Fails when the result breaks a declared constraint: deleting a row a live row still
	/// restricts, or taking a unique key a row created earlier holds.
	#[instrument(skip_all, fields(peer = %self.peer, mutations = mutations.len()), err)]
	pub fn write<S: Materializer>(
		&mut self,
		mutations: Vec<Mutation>,
		store: &mut S,
	) -> Result<Written, Error> {
		let tombstone_fields = self.config.tombstone_fields;
		let previous = &self.resolution;

		let mut tx = Transaction::begin(&mut self.state);
		let mut engine = MergeEngine::new(&mut tx);
		let mut written = Written::default();
		let mut touched = HashSet::new();
		let mut deleted = vec![];

		for mutation in mutations {
			let entries = match mutation {
				Mutation::Insert { table, fields } => {
					if table.is_empty() {
						return Err(Error::EmptyTable);
					}

					let visible = Visible::new(&engine.state().winners, previous, &touched);
					check_fields(&visible, &fields)?;

					let (row, entries) = engine.insert_entries(&table, fields)?;
					written.created.push(row);
					touched.insert(row);

					entries
				}

				Mutation::Update { row, fields } => {
					let winners = &engine.state().winners;
					let visible = Visible::new(winners, previous, &touched);
					let table = visible.table(&row)?;

					check_fields(&visible, &fields)?;

					let mut changed = if visible.is_revived(&row) {
						// a row only kept for its referrers gets back everything it shows
						let shown = previous
							.view(&row)
							.map(|view| view.fields.clone())
							.unwrap_or_default();

						let mut changed = fields;
						for (field, value) in shown {
							if !changed.iter().any(|(name, _)| *name == field) {
								changed.push((field, value));
							}
						}

						changed
					} else {
						fields
							.into_iter()
							.filter(|(field, value)| {
								winners.get(&row, field).map_or(true, |winner| {
									winner.payload != Payload::from(value.clone())
								})
							})
							.collect::<Vec<_>>()
					};

					if visible.is_revived(&row) && !changed.is_empty() {
						changed.push((
							ROW_FIELD.to_string(),
							FieldValue::Scalar(rmpv::Value::Boolean(true)),
						));
					}

					touched.insert(row);

					engine.update_entries(row, &table, changed)?
				}

				Mutation::Delete { row } => {
					let winners = &engine.state().winners;
					let visible = Visible::new(winners, previous, &touched);
					let table = visible.table(&row)?;

					let live_fields = if tombstone_fields {
						visible
							.view(&row)
							.map(|view| view.fields.into_keys().collect::<Vec<_>>())
							.unwrap_or_default()
					} else {
						vec![]
					};

					touched.insert(row);
					deleted.push(row);

					engine.delete_entries(row, &table, live_fields)?
				}
			};

			for entry in &entries {
				engine.apply_local(entry.clone());
			}

			written.entries.extend(entries);
		}

		let next = Resolution::resolve(&tx.state().winners, &tx.state().log, &self.constraints);

		if let Some(row) = deleted.iter().find(|row| next.is_live(row)) {
			return Err(Error::Restricted(*row));
		}

		if let Some(row) = next.suppressed().difference(previous.suppressed()).next() {
			return Err(Error::UniqueViolation {
				table: tx
					.state()
					.winners
					.table_of(row)
					.unwrap_or_default()
					.to_string(),
				row: *row,
			});
		}

		materialize(store, previous, &next)?;

		tx.commit();
		self.resolution = next;

		debug!(entries = written.entries.len(), "captured local write");

		Ok(written)
	}

	/// Remembers what `peer` reported having seen, which is what allows compaction.
	pub fn record_remote_context(&mut self, peer: PeerId, context: Context) {
		if peer == self.peer {
			return;
		}

		self.state.context.register(peer);

		self.remote_contexts
			.entry(peer)
			.and_modify(|known| known.merge(&context))
			.or_insert(context);
	}

	/// Drops superseded entries every known peer already has. Returns how many were dropped.
	#[instrument(skip(self), fields(peer = %self.peer))]
	pub fn compact(&mut self) -> usize {
		let others = self
			.state
			.context
			.peers()
			.filter(|peer| **peer != self.peer)
			.map(|peer| self.remote_contexts.get(peer))
			.collect::<Option<Vec<_>>>();

		let Some(others) = others else {
			debug!("not every peer reported its context yet, skipping compaction");
			return 0;
		};

		let ReplicaState { log, winners, .. } = &self.state;

		let removable = log
			.iter()
			.filter(|entry| others.iter().all(|context| context.covers(&entry.stamp)))
			.map(LogEntry::key)
			.filter(|key| !winners.is_winner(key))
			// the row's table and the values a revived row shows come from these
			.filter(|key| log.earliest(&key.row).map(LogEntry::key).as_ref() != Some(key))
			.filter(|key| {
				let table = winners.table_of(&key.row).unwrap_or_default();
				log.latest_value(&key.row, &key.field, table)
					.map_or(true, |entry| entry.stamp != key.stamp)
			})
			.collect::<Vec<_>>();

		for key in &removable {
			self.state.log.remove(key);
		}

		debug!(
			removed = removable.len(),
			remaining = self.state.log.len(),
			"compacted log"
		);

		removable.len()
	}

	#[must_use]
	pub fn snapshot(&self) -> ReplicaSnapshot {
		ReplicaSnapshot {
			peer: self.peer,
			config: self.config.clone(),
			clock: self.state.clock.last(),
			context: self.state.context.clone(),
			log: self.state.log.iter().cloned().collect(),
			pending: self.state.resolver.iter().cloned().collect(),
			remote_contexts: self
				.remote_contexts
				.iter()
				.map(|(peer, context)| (*peer, context.clone()))
				.collect(),
		}
	}

	#[must_use]
	pub fn from_snapshot(snapshot: ReplicaSnapshot) -> Self {
		let clock = if snapshot.config.physical_clock {
			LogicalClock::new(snapshot.peer, snapshot.clock)
		} else {
			LogicalClock::logical(snapshot.peer, snapshot.clock)
		};

		Self::restore(snapshot, clock)
	}

	#[must_use]
	pub fn from_snapshot_with_time_source(
		snapshot: ReplicaSnapshot,
		time_source: Arc<dyn TimeSource>,
	) -> Self {
		let clock = LogicalClock::with_time_source(
			snapshot.peer,
			snapshot.clock,
			snapshot.config.physical_clock.then_some(time_source),
		);

		Self::restore(snapshot, clock)
	}

	fn restore(snapshot: ReplicaSnapshot, mut clock: LogicalClock) -> Self {
		let ReplicaSnapshot {
			peer,
			config,
			clock: stored,
			mut context,
			log,
			pending,
			remote_contexts,
		} = snapshot;

		context.register(peer);
		clock.reseed(stored, &context);

		let log = log.into_iter().collect::<UnifiedLog>();

		let mut winners = WinnerIndex::new();
		for row in log.rows() {
			winners.rebuild_row(*row, log.row_entries(row));
		}

		let mut resolver = ForeignKeyResolver::new();
		for entry in pending {
			resolver.defer(entry);
		}

		let constraints = Constraints::new(&config);
		let resolution = Resolution::resolve(&winners, &log, &constraints);

		debug!(%peer, entries = log.len(), pending = resolver.len(), "restored replica");

		Self {
			peer,
			config,
			constraints,
			state: ReplicaState {
				clock,
				context,
				log,
				winners,
				resolver,
			},
			resolution,
			remote_contexts: remote_contexts.into_iter().collect(),
		}
	}

	pub async fn save(&self, path: impl AsRef<Path> + Send) -> Result<(), Error> {
		self.snapshot().save(path.as_ref()).await
	}

	pub async fn load(path: impl AsRef<Path> + Send) -> Result<Self, Error> {
		ReplicaSnapshot::load(path.as_ref())
			.await
			.map(Self::from_snapshot)
	}
}

fn materialize<S: Materializer>(
	store: &mut S,
	previous: &Resolution,
	next: &Resolution,
) -> Result<(), Error> {
	store
		.apply(&previous.changes(next))
		.map_err(|e| Error::Materialize(Box::new(e)))
}

fn by_stamp(a: &LogEntry, b: &LogEntry) -> Ordering {
	a.stamp
		.cmp(&b.stamp)
		.then_with(|| a.row.cmp(&b.row))
		.then_with(|| a.field.cmp(&b.field))
}

/// Rows as a local write sees them: the ones it already touched as last writer wins leaves
/// them, every other one as the host store holds it.
struct Visible<'a> {
	winners: &'a WinnerIndex,
	resolution: &'a Resolution,
	touched: &'a HashSet<RowIdentity>,
}

impl<'a> Visible<'a> {
	const fn new(
		winners: &'a WinnerIndex,
		resolution: &'a Resolution,
		touched: &'a HashSet<RowIdentity>,
	) -> Self {
		Self {
			winners,
			resolution,
			touched,
		}
	}

	fn is_live(&self, row: &RowIdentity) -> bool {
		if self.touched.contains(row) {
			self.winners
				.row(row)
				.is_some_and(|row_winners| !row_winners.is_deleted())
		} else {
			self.resolution.is_live(row)
		}
	}

	fn is_revived(&self, row: &RowIdentity) -> bool {
		!self.touched.contains(row) && self.resolution.is_revived(row)
	}

	fn view(&self, row: &RowIdentity) -> Option<RowView> {
		if self.touched.contains(row) {
			self.winners.view(row)
		} else {
			self.resolution.view(row).cloned()
		}
	}

	/// Table of a visible row.
	fn table(&self, row: &RowIdentity) -> Result<String, Error> {
		let row_winners = self.winners.row(row).ok_or(Error::UnknownRow(*row))?;

		if !self.is_live(row) {
			return Err(Error::RowDeleted(*row));
		}

		Ok(row_winners.table().to_string())
	}
}

fn check_fields(visible: &Visible<'_>, fields: &[(String, FieldValue)]) -> Result<(), Error> {
	let mut seen = HashSet::with_capacity(fields.len());

	for (field, value) in fields {
		let reason = if field.is_empty() {
			Some("field names can't be empty")
		} else if field == ROW_FIELD {
			Some("reserved for row existence")
		} else if !seen.insert(field.as_str()) {
			Some("field written twice in one mutation")
		} else {
			None
		};

		if let Some(reason) = reason {
			return Err(Error::InvalidField {
				field: field.clone(),
				reason,
			});
		}

		if let FieldValue::Reference(target) = value {
			if !visible.is_live(target) {
				return Err(Error::DanglingReference(*target));
			}
		}
	}

	Ok(())
}
