//! Configuration file support for ship
//!
//! Supports `.ship-config.yaml` files that can be placed anywhere in the directory
//! hierarchy. ship searches from the working directory upward to the filesystem root.

use std::{
	fs,
	path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Deserialize;

/// The name of the config file ship looks for
pub const CONFIG_FILE_NAME: &str = ".ship-config.yaml";

/// Overlay name used when neither the CLI nor the config file names one
pub const DEFAULT_OVERLAY_NAME: &str = "ship";

/// Poll interval of the confirmation checkpoint when none is configured
pub const DEFAULT_CONFIRM_POLL_INTERVAL_MS: u64 = 500;

/// Root configuration structure for .ship-config.yaml
///
/// Every field is optional; unset fields fall back to CLI flags or defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipConfig {
	/// Name the overlay is stored under in the state file
	#[serde(default)]
	pub overlay_name: Option<String>,

	/// Directory holding the upstream (base) manifests
	#[serde(default)]
	pub base_path: Option<PathBuf>,

	/// Directory the overlay is generated into
	#[serde(default)]
	pub overlay_path: Option<PathBuf>,

	/// File the final rendered manifests are written to
	#[serde(default)]
	pub destination: Option<PathBuf>,

	/// How often to poll the confirmation gate, in milliseconds
	#[serde(default)]
	pub confirm_poll_interval_ms: Option<u64>,
}

impl ShipConfig {
	/// Load config by searching from the given directory upward
	pub fn load_from_directory(start_dir: &Path) -> Result<Option<Self>> {
		if let Some(config_path) = find_config_file(start_dir) {
			let config = Self::load_from_file(&config_path)?;
			Ok(Some(config))
		} else {
			Ok(None)
		}
	}

	/// Load config from a specific file path
	pub fn load_from_file(path: &Path) -> Result<Self> {
		let content = fs::read_to_string(path)
			.with_context(|| format!("failed to read config file: {}", path.display()))?;
		let mut config: ShipConfig = serde_yaml_with_quirks::from_str(&content)
			.with_context(|| format!("failed to parse config file: {}", path.display()))?;

		// Relative paths are relative to the config file, not the working directory
		let root = path.parent().unwrap_or_else(|| Path::new("."));
		for field in [
			&mut config.base_path,
			&mut config.overlay_path,
			&mut config.destination,
		] {
			if let Some(p) = field.as_mut() {
				if p.is_relative() {
					*p = root.join(&*p);
				}
			}
		}
		Ok(config)
	}

	/// Merge `other` over this config: fields set in `other` win.
	pub fn merge_from(&mut self, other: &ShipConfig) {
		if other.overlay_name.is_some() {
			self.overlay_name.clone_from(&other.overlay_name);
		}
		if other.base_path.is_some() {
			self.base_path.clone_from(&other.base_path);
		}
		if other.overlay_path.is_some() {
			self.overlay_path.clone_from(&other.overlay_path);
		}
		if other.destination.is_some() {
			self.destination.clone_from(&other.destination);
		}
		if other.confirm_poll_interval_ms.is_some() {
			self.confirm_poll_interval_ms = other.confirm_poll_interval_ms;
		}
	}

	pub fn overlay_name(&self) -> &str {
		self.overlay_name.as_deref().unwrap_or(DEFAULT_OVERLAY_NAME)
	}

	pub fn confirm_poll_interval_ms(&self) -> u64 {
		self.confirm_poll_interval_ms
			.unwrap_or(DEFAULT_CONFIRM_POLL_INTERVAL_MS)
	}
}

/// Search for a config file starting from `start_dir` and walking up to the filesystem root
pub fn find_config_file(start_dir: &Path) -> Option<PathBuf> {
	let mut current = start_dir.to_path_buf();

	// Canonicalize if possible to handle relative paths
	if let Ok(canonical) = current.canonicalize() {
		current = canonical;
	}

	loop {
		let config_path = current.join(CONFIG_FILE_NAME);
		if config_path.exists() {
			return Some(config_path);
		}

		match current.parent() {
			Some(parent) if parent != current => current = parent.to_path_buf(),
			_ => break,
		}
	}

	None
}
