use synq_sync::{Context, Mutation, PeerId};

use std::{
	fmt,
	path::Path,
	sync::atomic::{AtomicBool, Ordering},
};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, instrument, warn};

use super::{
	merge::MergeResult,
	replica::{Delta, Replica, Written},
	store::Materializer,
	Error, SyncEvent,
};

struct Shared<S> {
	replica: Replica,
	store: S,
}

/// Owns a replica and its host store, serializing every write and merge.
pub struct Manager<S> {
	pub tx: broadcast::Sender<SyncEvent>,
	shared: Mutex<Shared<S>>,
	merging: AtomicBool,
}

impl<S> fmt::Debug for Manager<S> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SyncManager")
			.field("merging", &self.merging.load(Ordering::Relaxed))
			.finish_non_exhaustive()
	}
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GetOpsArgs {
	pub clocks: Vec<(PeerId, u64)>,
	pub count: u32,
}

/// Clears the merging flag however the merge ends.
struct MergingGuard<'a>(&'a AtomicBool);

impl<'a> MergingGuard<'a> {
	fn new(flag: &'a AtomicBool) -> Self {
		flag.store(true, Ordering::Release);
		Self(flag)
	}
}

impl Drop for MergingGuard<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::Release);
	}
}

impl<S: Materializer + Send> Manager<S> {
	/// Sync events are received on the returned [`broadcast::Receiver<SyncEvent>`].
	pub fn new(replica: Replica, store: S) -> (Self, broadcast::Receiver<SyncEvent>) {
		let (tx, rx) = broadcast::channel(64);

		(
			Self {
				tx,
				shared: Mutex::new(Shared { replica, store }),
				merging: AtomicBool::new(false),
			},
			rx,
		)
	}

	/// Restores the replica saved at `path` on top of an existing host store.
	pub async fn load(
		path: impl AsRef<Path> + Send,
		store: S,
	) -> Result<(Self, broadcast::Receiver<SyncEvent>), Error> {
		Ok(Self::new(Replica::load(path).await?, store))
	}

	pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
		self.tx.subscribe()
	}

	/// Whether a remote batch is being merged right now.
	pub fn is_merging(&self) -> bool {
		self.merging.load(Ordering::Acquire)
	}

	pub async fn peer(&self) -> PeerId {
		self.shared.lock().await.replica.peer()
	}

	pub async fn fingerprint(&self) -> Context {
		self.shared.lock().await.replica.fingerprint()
	}

	/// Runs `f` with shared access to the replica and its store.
	pub async fn read<R>(&self, f: impl FnOnce(&Replica, &S) -> R) -> R {
		let shared = self.shared.lock().await;
		f(&shared.replica, &shared.store)
	}

	pub async fn write(&self, mutations: Vec<Mutation>) -> Result<Written, Error> {
		let mut shared = self.shared.lock().await;
		let Shared { replica, store } = &mut *shared;

		let written = replica.write(mutations, store)?;

		if !written.entries.is_empty() {
			Self::persist(&shared.replica).await?;

			if self.tx.send(SyncEvent::Created).is_err() {
				warn!("failed to send created message on `write`");
			}
		}

		Ok(written)
	}

	/// Entries the peer described by `args.clocks` is missing, at most `args.count` of them
	/// (capped by the configured batch size).
	pub async fn get_ops(&self, args: GetOpsArgs) -> Result<Delta, Error> {
		let shared = self.shared.lock().await;

		let count = usize::try_from(args.count)
			.unwrap_or(usize::MAX)
			.min(shared.replica.config().max_batch_size);

		let fingerprint = args.clocks.into_iter().collect::<Context>();

		Ok(shared.replica.delta(&fingerprint, Some(count)))
	}

	#[instrument(skip_all, fields(sender = %delta.sender, entries = delta.entries.len()), err)]
	pub async fn ingest(&self, delta: Delta) -> Result<MergeResult, Error> {
		let mut shared = self.shared.lock().await;
		let _merging = MergingGuard::new(&self.merging);

		let Shared { replica, store } = &mut *shared;

		let sender = delta.sender;
		let context = replica.fingerprint();
		let remote = replica.remote_context(&sender).cloned();

		let result = replica.pull(delta, store)?;

		// an empty delta can still move our context or what we know of the sender's
		let advanced = *replica.context() != context
			|| replica.remote_context(&sender) != remote.as_ref();

		if result.changed() || advanced {
			Self::persist(replica).await?;
		}

		if result.changed() && self.tx.send(SyncEvent::Ingested).is_err() {
			warn!("failed to send ingested message on `ingest`");
		}

		debug!(?result, "ingested delta");

		Ok(result)
	}

	/// Decodes a delta as produced by [`Delta::encode`] and ingests it.
	pub async fn ingest_bytes(&self, bytes: &[u8]) -> Result<MergeResult, Error> {
		self.ingest(Delta::decode(bytes)?).await
	}

	pub async fn record_remote_context(&self, peer: PeerId, context: Context) {
		self.shared
			.lock()
			.await
			.replica
			.record_remote_context(peer, context);
	}

	pub async fn compact(&self) -> usize {
		self.shared.lock().await.replica.compact()
	}

	pub async fn save(&self, path: impl AsRef<Path> + Send) -> Result<(), Error> {
		let shared = self.shared.lock().await;
		shared.replica.save(path).await
	}

	async fn persist(replica: &Replica) -> Result<(), Error> {
		let config = replica.config();

		match (&config.snapshot_path, config.persist_on_commit) {
			(Some(path), true) => replica.save(path).await,
			(None, true) => Err(Error::NoSnapshotPath),
			(_, false) => Ok(()),
		}
	}
}
