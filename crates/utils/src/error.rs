use std::{fmt::Display, path::Path};

use thiserror::Error;

/// File I/O error that includes the path that caused the error
#[derive(Error, Debug)]
pub struct FileIOError {
	pub path: Box<Path>,
	#[source]
	pub source: std::io::Error,
	pub maybe_context: Option<&'static str>,
}

impl Display for FileIOError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(
			f,
			"file I/O error{}: {}; path: '{}'",
			self.maybe_context
				.map(|ctx| format!(" ({ctx})"))
				.unwrap_or_default(),
			self.source,
			self.path.display()
		)
	}
}

impl From<(&Path, std::io::Error)> for FileIOError {
	fn from((path, source): (&Path, std::io::Error)) -> Self {
		Self {
			path: path.into(),
			source,
			maybe_context: None,
		}
	}
}

impl From<(&Path, std::io::Error, &'static str)> for FileIOError {
	fn from((path, source, context): (&Path, std::io::Error, &'static str)) -> Self {
		Self {
			path: path.into(),
			source,
			maybe_context: Some(context),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn display_includes_path_and_context() {
		let err = FileIOError::from((
			Path::new("/tmp/replica.snapshot"),
			std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
			"reading snapshot",
		));

		let message = err.to_string();

		assert!(message.contains("(reading snapshot)"));
		assert!(message.contains("/tmp/replica.snapshot"));
		assert!(message.contains("gone"));
	}
}
