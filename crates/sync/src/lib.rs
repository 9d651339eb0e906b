#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

//! Data types shared by every replica: stamps, entries, the per peer context, the logical clock
//! and the wire form of entry batches.

mod clock;
mod compressed;
mod context;
mod crdt;
mod factory;
mod peer;

pub use clock::*;
pub use compressed::*;
pub use context::*;
pub use crdt::*;
pub use factory::*;
pub use peer::*;

pub use rmpv;
pub use uhlc::NTP64;

#[doc(hidden)]
pub use synq_utils;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("failed to encode entries: {0}")]
	Serialization(#[from] rmp_serde::encode::Error),
	#[error("failed to decode entries: {0}")]
	Deserialization(#[from] rmp_serde::decode::Error),
}
