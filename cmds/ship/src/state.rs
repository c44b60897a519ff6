//! Durable overlay state.
//!
//! The overlay computed by an unfork is stored in `.ship/state.json` under
//! `v1.kustomize.overlays.<name>`. Saving replaces the named overlay as a
//! whole; nothing is merged with what was stored before.

use std::{
	collections::BTreeMap,
	fs,
	io::{self, Write},
	path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::split::ListContainer;

pub const STATE_DIR: &str = ".ship";
pub const STATE_FILE: &str = "state.json";

#[derive(Debug, Error)]
pub enum StateError {
	#[error("reading state file {}", path.display())]
	Read {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	#[error("decoding state file {}", path.display())]
	Decode {
		path: PathBuf,
		#[source]
		source: serde_json::Error,
	},

	#[error("encoding state")]
	Encode(#[source] serde_json::Error),

	#[error("writing state file {}", path.display())]
	Write {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
}

/// A user's customizations on top of an upstream base.
///
/// Keys of `patches` and `resources` are `/`-prefixed paths relative to the
/// overlay directory. Entries of `excluded_bases` are `/`-prefixed paths
/// relative to the base directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Overlay {
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub patches: BTreeMap<String, String>,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub resources: BTreeMap<String, String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub excluded_bases: Vec<String>,
	/// `List` groupings found in the upstream base. A local base is split in
	/// place, so later runs only find them here.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub lists: Vec<ListContainer>,
}

impl Overlay {
	pub fn is_excluded(&self, resource: &str) -> bool {
		self.excluded_bases.iter().any(|b| b == resource)
	}

	/// Record `resource` as excluded. Returns `false` if it already was.
	pub fn exclude(&mut self, resource: &str) -> bool {
		if self.is_excluded(resource) {
			return false;
		}
		self.excluded_bases.push(resource.to_string());
		true
	}

	/// Forget an exclusion. Returns `false` if `resource` was not excluded.
	pub fn include(&mut self, resource: &str) -> bool {
		let before = self.excluded_bases.len();
		self.excluded_bases.retain(|b| b != resource);
		self.excluded_bases.len() != before
	}
}

/// Description of the application an overlay was computed for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppMetadata {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub upstream: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub version: Option<String>,
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
	#[serde(default)]
	pub v1: StateV1,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateV1 {
	#[serde(default)]
	pub kustomize: KustomizeState,
	#[serde(default)]
	pub metadata: AppMetadata,
	/// Sections owned by other parts of ship, kept as they are.
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KustomizeState {
	#[serde(default)]
	pub overlays: BTreeMap<String, Overlay>,
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

/// Storage for ship state.
pub trait StateManager {
	/// Load the stored state; an empty state when nothing was stored yet.
	fn try_load(&self) -> Result<State, StateError>;

	/// Replace the overlay stored under `name`.
	fn save_kustomize(&self, name: &str, overlay: &Overlay) -> Result<(), StateError>;

	/// Replace the stored application metadata.
	fn serialize_app_metadata(&self, metadata: &AppMetadata) -> Result<(), StateError>;
}

/// [`StateManager`] backed by a JSON file.
#[derive(Debug, Clone)]
pub struct FileStateManager {
	path: PathBuf,
}

impl FileStateManager {
	/// State stored at `{root}/.ship/state.json`.
	pub fn new(root: &Path) -> Self {
		Self::at(root.join(STATE_DIR).join(STATE_FILE))
	}

	pub fn at(path: PathBuf) -> Self {
		Self { path }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	fn update(&self, f: impl FnOnce(&mut State)) -> Result<(), StateError> {
		let mut state = self.try_load()?;
		f(&mut state);
		self.write(&state)
	}

	/// Write through a temp file in the same directory so readers never see
	/// a partial state.
	fn write(&self, state: &State) -> Result<(), StateError> {
		let write_err = |source| StateError::Write {
			path: self.path.clone(),
			source,
		};
		let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
		fs::create_dir_all(dir).map_err(write_err)?;

		let mut encoded = serde_json::to_vec_pretty(state).map_err(StateError::Encode)?;
		encoded.push(b'\n');

		let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
		tmp.write_all(&encoded).map_err(write_err)?;
		tmp.persist(&self.path).map_err(|e| write_err(e.error))?;
		Ok(())
	}
}

impl StateManager for FileStateManager {
	fn try_load(&self) -> Result<State, StateError> {
		let bytes = match fs::read(&self.path) {
			Ok(bytes) => bytes,
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				debug!(path = %self.path.display(), "no state file, starting empty");
				return Ok(State::default());
			}
			Err(source) => {
				return Err(StateError::Read {
					path: self.path.clone(),
					source,
				})
			}
		};
		serde_json::from_slice(&bytes).map_err(|source| StateError::Decode {
			path: self.path.clone(),
			source,
		})
	}

	#[instrument(skip_all, fields(overlay = name))]
	fn save_kustomize(&self, name: &str, overlay: &Overlay) -> Result<(), StateError> {
		self.update(|state| {
			state
				.v1
				.kustomize
				.overlays
				.insert(name.to_string(), overlay.clone());
		})
	}

	fn serialize_app_metadata(&self, metadata: &AppMetadata) -> Result<(), StateError> {
		self.update(|state| state.v1.metadata = metadata.clone())
	}
}

/// One named overlay in a [`StateManager`].
pub struct OverlayStore<'a> {
	manager: &'a dyn StateManager,
	name: &'a str,
}

impl<'a> OverlayStore<'a> {
	pub fn new(manager: &'a dyn StateManager, name: &'a str) -> Self {
		Self { manager, name }
	}

	/// The stored overlay, or an empty one if none is stored under this name.
	pub fn load(&self) -> Result<Overlay, StateError> {
		let mut state = self.manager.try_load()?;
		Ok(state
			.v1
			.kustomize
			.overlays
			.remove(self.name)
			.unwrap_or_default())
	}

	pub fn save(&self, overlay: &Overlay) -> Result<(), StateError> {
		self.manager.save_kustomize(self.name, overlay)
	}
}
