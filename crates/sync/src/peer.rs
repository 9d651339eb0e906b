use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a replica, assigned once when the replica is initialized.
///
/// Peers are totally ordered so they can break ties between equal counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Uuid);

impl PeerId {
	#[must_use]
	pub fn new() -> Self {
		Self(Uuid::now_v7())
	}

	#[must_use]
	pub const fn from_u128(value: u128) -> Self {
		Self(Uuid::from_u128(value))
	}

	#[must_use]
	pub const fn as_uuid(&self) -> &Uuid {
		&self.0
	}
}

impl Default for PeerId {
	fn default() -> Self {
		Self::new()
	}
}

impl From<Uuid> for PeerId {
	fn from(uuid: Uuid) -> Self {
		Self(uuid)
	}
}

impl From<PeerId> for Uuid {
	fn from(PeerId(uuid): PeerId) -> Self {
		uuid
	}
}

impl fmt::Display for PeerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}
