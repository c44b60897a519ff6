//! Utilities for command handlers.

use std::{
	env,
	io::{self, ErrorKind, Write},
	path::PathBuf,
};

use anyhow::{Context, Result};
use clap::Args;

use crate::config::ShipConfig;

/// Options shared by every command that works on a stored overlay.
#[derive(Args, Debug, Clone, Default)]
pub struct OverlayArgs {
	/// Directory holding the upstream (base) manifests
	#[arg(long)]
	pub base: Option<PathBuf>,

	/// Directory the overlay is generated into
	#[arg(long)]
	pub overlay: Option<PathBuf>,

	/// Name the overlay is stored under in the state file
	#[arg(long)]
	pub overlay_name: Option<String>,

	/// Directory holding `.ship/state.json`
	#[arg(long, default_value = ".")]
	pub state_root: PathBuf,
}

impl OverlayArgs {
	/// The flags as a config layer, to merge over the config file.
	pub fn as_config(&self) -> ShipConfig {
		ShipConfig {
			overlay_name: self.overlay_name.clone(),
			base_path: self.base.clone(),
			overlay_path: self.overlay.clone(),
			..Default::default()
		}
	}
}

/// Load `.ship-config.yaml` from the working directory upward and merge
/// `flags` over it.
pub fn resolve_config(flags: &ShipConfig) -> Result<ShipConfig> {
	let cwd = env::current_dir().context("getting current directory")?;
	let mut config = ShipConfig::load_from_directory(&cwd)?.unwrap_or_default();
	config.merge_from(flags);
	Ok(config)
}

/// The base directory, which has no default.
pub fn require_base(config: &ShipConfig) -> Result<PathBuf> {
	config
		.base_path
		.clone()
		.context("no base directory: pass --base or set basePath in .ship-config.yaml")
}

/// A writer wrapper that silently handles broken pipe errors.
///
/// When the underlying writer returns a broken pipe error (EPIPE), this wrapper
/// converts it to a successful write. This allows commands to exit cleanly when
/// output is piped to a process that closes early (e.g., `ship build . | head -1`).
pub struct BrokenPipeGuard<W> {
	inner: W,
}

impl<W> BrokenPipeGuard<W> {
	pub fn new(inner: W) -> Self {
		Self { inner }
	}
}

impl<W: Write> Write for BrokenPipeGuard<W> {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		match self.inner.write(buf) {
			Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(buf.len()),
			other => other,
		}
	}

	fn flush(&mut self) -> io::Result<()> {
		match self.inner.flush() {
			Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
			other => other,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct ClosedPipe;

	impl Write for ClosedPipe {
		fn write(&mut self, _: &[u8]) -> io::Result<usize> {
			Err(ErrorKind::BrokenPipe.into())
		}

		fn flush(&mut self) -> io::Result<()> {
			Err(ErrorKind::BrokenPipe.into())
		}
	}

	#[test]
	fn test_broken_pipe_is_swallowed() {
		let mut out = BrokenPipeGuard::new(ClosedPipe);
		writeln!(out, "ignored").unwrap();
		out.flush().unwrap();
	}

	#[test]
	fn test_flags_override_nothing_when_unset() {
		let flags = OverlayArgs::default().as_config();
		let mut config = ShipConfig {
			overlay_name: Some("prod".to_string()),
			..Default::default()
		};
		config.merge_from(&flags);
		assert_eq!(config.overlay_name(), "prod");
		assert!(require_base(&config).is_err());
	}
}
