use synq_sync::{Context, LogEntry, PeerId};
use synq_utils::error::FileIOError;

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, instrument};

use crate::{Config, Error};

/// Everything needed to bring a replica back after a restart.
///
/// The winner index is not stored, it is rebuilt from the log on load.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReplicaSnapshot {
	pub peer: PeerId,
	pub config: Config,
	pub clock: u64,
	pub context: Context,
	pub log: Vec<LogEntry>,
	pub pending: Vec<LogEntry>,
	pub remote_contexts: Vec<(PeerId, Context)>,
}

impl ReplicaSnapshot {
	pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
		rmp_serde::to_vec_named(self).map_err(Into::into)
	}

	pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
		rmp_serde::from_slice(bytes).map_err(Into::into)
	}

	/// Writes the snapshot next to `path` and renames it into place, so a crash never leaves
	/// a half written file behind.
	#[instrument(skip(self), fields(peer = %self.peer, entries = self.log.len()), err)]
	pub async fn save(&self, path: &Path) -> Result<(), Error> {
		let bytes = self.to_bytes()?;

		if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
			fs::create_dir_all(parent)
				.await
				.map_err(|e| FileIOError::from((parent, e, "creating snapshot directory")))?;
		}

		let tmp = path.with_extension("tmp");

		fs::write(&tmp, &bytes)
			.await
			.map_err(|e| FileIOError::from((tmp.as_path(), e, "writing snapshot")))?;

		fs::rename(&tmp, path)
			.await
			.map_err(|e| FileIOError::from((path, e, "moving snapshot into place")))?;

		debug!(bytes = bytes.len(), "saved replica snapshot");

		Ok(())
	}

	#[instrument(err)]
	pub async fn load(path: &Path) -> Result<Self, Error> {
		let bytes = fs::read(path)
			.await
			.map_err(|e| FileIOError::from((path, e, "reading snapshot")))?;

		Self::from_bytes(&bytes)
	}
}
