//! Logical clock producing the stamps of local writes.
//!
//! Counters are seeded from the local history, the highest counter seen from any peer and,
//! unless disabled, the physical clock. Pure logical mode keeps counters small and deterministic,
//! which is what tests want.

use std::{
	fmt,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
};

use tracing::{trace, warn};

use crate::{Context, LogicalTimestamp, PeerId, MAX_COUNTER};

/// Abstracts the physical time source used to seed counters.
///
/// Readings only have to be monotonic-ish: regressions are absorbed by the clock.
pub trait TimeSource: Send + Sync {
	fn now(&self) -> u64;
}

/// Production time source, reading the system clock as an NTP64 value.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
	fn now(&self) -> u64 {
		uhlc::system_time_clock().as_u64()
	}
}

/// Manually driven time source.
///
/// Clones share the same reading, so a test can hand one to several clocks and still
/// move time forward (or backward, to simulate skew) from the outside.
#[derive(Debug, Clone)]
pub struct FakeTimeSource {
	time: Arc<AtomicU64>,
}

impl Default for FakeTimeSource {
	fn default() -> Self {
		Self::new(1000)
	}
}

impl FakeTimeSource {
	#[must_use]
	pub fn new(initial: u64) -> Self {
		Self {
			time: Arc::new(AtomicU64::new(initial)),
		}
	}

	pub fn advance(&self, delta: u64) {
		self.time.fetch_add(delta, Ordering::SeqCst);
	}

	pub fn set(&self, time: u64) {
		self.time.store(time, Ordering::SeqCst);
	}

	#[must_use]
	pub fn get(&self) -> u64 {
		self.time.load(Ordering::SeqCst)
	}
}

impl TimeSource for FakeTimeSource {
	fn now(&self) -> u64 {
		self.get()
	}
}

/// The next counter would reach the reserved ceiling, no further stamp can be issued.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("logical clock of {peer} cannot advance past {last}")]
pub struct ClockSaturated {
	pub peer: PeerId,
	pub last: u64,
}

#[derive(Clone)]
pub struct LogicalClock {
	peer: PeerId,
	last: u64,
	time_source: Option<Arc<dyn TimeSource>>,
}

impl fmt::Debug for LogicalClock {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("LogicalClock")
			.field("peer", &self.peer)
			.field("last", &self.last)
			.field("physical", &self.time_source.is_some())
			.finish()
	}
}

impl LogicalClock {
	/// Clock seeded from the system time.
	#[must_use]
	pub fn new(peer: PeerId, last: u64) -> Self {
		Self::with_time_source(peer, last, Some(Arc::new(SystemTimeSource)))
	}

	/// Clock without a physical component, counters only grow by one per write.
	#[must_use]
	pub const fn logical(peer: PeerId, last: u64) -> Self {
		Self {
			peer,
			last,
			time_source: None,
		}
	}

	#[must_use]
	pub fn with_time_source(
		peer: PeerId,
		last: u64,
		time_source: Option<Arc<dyn TimeSource>>,
	) -> Self {
		Self {
			peer,
			last,
			time_source,
		}
	}

	#[must_use]
	pub const fn peer(&self) -> PeerId {
		self.peer
	}

	/// Counter of the last stamp handed out.
	#[must_use]
	pub const fn last(&self) -> u64 {
		self.last
	}

	#[must_use]
	pub const fn is_physical(&self) -> bool {
		self.time_source.is_some()
	}

	/// Re-seeds after a restart or a clone, never moving backwards.
	pub fn reseed(&mut self, stored: u64, context: &Context) {
		self.last = self.last.max(stored).max(context.max_counter());
	}

	/// Moves the clock under a new identity, used when a replica is cloned.
	pub fn rebind(&mut self, peer: PeerId) {
		self.peer = peer;
	}

	/// Produces a stamp greater than every stamp this clock produced and every counter in
	/// `context`.
	///
	/// Fails instead of handing out a stamp twice once the counter space is exhausted, the clock
	/// is left untouched in that case.
	pub fn advance(&mut self, context: &Context) -> Result<LogicalTimestamp, ClockSaturated> {
		let observed = context.max_counter();
		let mut base = self.last.max(observed);

		if let Some(time_source) = &self.time_source {
			let now = time_source.now();

			if now < self.last {
				warn!(
					now,
					last = self.last,
					"physical clock is behind the logical clock, keeping the logical counter"
				);
			}

			base = base.max(now);
		}

		let Some(counter) = base.checked_add(1).filter(|counter| *counter <= MAX_COUNTER) else {
			warn!(base, peer = %self.peer, "logical counter saturated");
			return Err(ClockSaturated {
				peer: self.peer,
				last: base,
			});
		};

		self.last = counter;

		trace!(counter, peer = %self.peer, "advanced logical clock");

		Ok(LogicalTimestamp::new(counter, self.peer))
	}
}

#[cfg(test)]
mod test {
	use super::*;

	const X: PeerId = PeerId::from_u128(1);
	const Y: PeerId = PeerId::from_u128(2);

	#[test]
	fn logical_counters_grow_by_one() {
		let mut clock = LogicalClock::logical(X, 0);
		let context = Context::new(X);

		assert_eq!(clock.advance(&context), Ok(LogicalTimestamp::new(1, X)));
		assert_eq!(clock.advance(&context), Ok(LogicalTimestamp::new(2, X)));
		assert_eq!(clock.last(), 2);
	}

	#[test]
	fn advance_jumps_past_observed_counters() {
		let mut clock = LogicalClock::logical(X, 3);
		let mut context = Context::new(X);
		context.observe(Y, 10);

		assert_eq!(clock.advance(&context).unwrap().counter, 11);
	}

	#[test]
	fn physical_time_seeds_counter() {
		let time = FakeTimeSource::new(500);
		let mut clock = LogicalClock::with_time_source(X, 0, Some(Arc::new(time.clone())));
		let context = Context::new(X);

		assert_eq!(clock.advance(&context).unwrap().counter, 501);

		// time going backwards never lets the counter regress
		time.set(100);
		assert_eq!(clock.advance(&context).unwrap().counter, 502);

		time.advance(1000);
		assert_eq!(clock.advance(&context).unwrap().counter, 1101);
	}

	#[test]
	fn reseed_never_goes_backwards() {
		let mut clock = LogicalClock::logical(X, 8);
		let mut context = Context::new(X);

		clock.reseed(2, &context);
		assert_eq!(clock.last(), 8);

		context.observe(Y, 20);
		clock.reseed(2, &context);
		assert_eq!(clock.last(), 20);
	}

	#[test]
	fn saturated_clock_refuses_to_reuse_stamps() {
		let mut clock = LogicalClock::logical(X, MAX_COUNTER - 1);
		let context = Context::new(X);

		assert_eq!(
			clock.advance(&context),
			Ok(LogicalTimestamp::new(MAX_COUNTER, X))
		);
		assert_eq!(
			clock.advance(&context),
			Err(ClockSaturated {
				peer: X,
				last: MAX_COUNTER,
			})
		);
		assert_eq!(clock.last(), MAX_COUNTER);

		// a peer announcing the ceiling itself saturates the clock too
		let mut clock = LogicalClock::logical(X, 0);
		let mut context = Context::new(X);
		context.observe(Y, u64::MAX);
		assert!(clock.advance(&context).is_err());
		assert_eq!(clock.last(), 0);
	}

	#[test]
	fn fake_time_default() {
		assert_eq!(FakeTimeSource::default().now(), 1000);
	}
}
