pub mod error;

#[doc(hidden)]
pub use rmpv;

/// Builds a [`rmpv::Value`] out of anything serializable.
///
/// # Panics
///
/// Panics if the expression can't be represented as MessagePack, which only happens
/// for maps with non string keys coming from hand written `Serialize` impls.
#[macro_export]
macro_rules! msgpack {
	(nil) => {
		$crate::rmpv::Value::Nil
	};
	($e:expr) => {{
		$crate::rmpv::ext::to_value(&$e).expect("failed to serialize msgpack")
	}};
}
