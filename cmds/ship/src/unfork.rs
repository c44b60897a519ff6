//! Turning a fork of an upstream manifest tree into a kustomize overlay.
//!
//! An unfork matches every resource of the forked tree to its upstream
//! counterpart by identity (kind, name, namespace), so files may be moved or
//! renamed freely. Resources present in both trees become strategic merge
//! patches, resources only in the fork become new resources, and upstream
//! resources missing from the fork are excluded from the base. The overlay is
//! written next to a regenerated base kustomization and can be built into a
//! single rendered file, with exploded `List` documents regrouped.

use std::{
	collections::BTreeMap,
	fs, io,
	io::Write as _,
	path::{Path, PathBuf},
	time::Duration,
};

use serde_json::{json, Value};
use ship_k8s::{
	contains_only_identity_keys, decode, decode_minimal, decode_stream, is_kubernetes_yaml, yaml,
	CodecError, MinimalDocument, Resource,
};
use tempfile::{NamedTempFile, TempDir};
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use crate::{
	collaborators::{
		copy_tree, wait_for_confirmation, CancellationToken, ChartCommands, CollaboratorError,
		ConfirmationGate, ContentFetcher,
	},
	config::{DEFAULT_CONFIRM_POLL_INTERVAL_MS, DEFAULT_OVERLAY_NAME},
	kustomize::{self, Kustomization, KustomizeError},
	patch::{PatchEngine, PatchError},
	split::{self, ListContainer, SplitError},
	state::{Overlay, OverlayStore, StateError, StateManager},
};

/// File a rendered Helm chart is written to inside the upstream base.
const RENDERED_CHART_FILE: &str = "rendered.yaml";

#[derive(Debug, Error)]
pub enum UnforkError {
	#[error("splitting manifests")]
	Split(#[from] SplitError),

	#[error("persisting state")]
	State(#[from] StateError),

	#[error(transparent)]
	Kustomize(#[from] KustomizeError),

	#[error("computing patch for {}", path.display())]
	Patch {
		path: PathBuf,
		#[source]
		source: PatchError,
	},

	#[error("reading {}", path.display())]
	Read {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	#[error("writing {}", path.display())]
	Write {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	#[error("base {} would contain no Kubernetes resources", path.display())]
	EmptyBase { path: PathBuf },

	#[error("resolving upstream")]
	Upstream(#[source] CollaboratorError),

	#[error("copying forked tree {}", path.display())]
	Fork {
		path: PathBuf,
		#[source]
		source: CollaboratorError,
	},

	#[error("{0} is required for this upstream but none was provided")]
	MissingCollaborator(&'static str),

	#[error("cancelled")]
	Cancelled,

	#[error("decoding built documents")]
	Codec(#[source] CodecError),
}

/// Where the upstream manifests come from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum UpstreamSource {
	/// The upstream base directory already holds the manifests.
	#[default]
	Local,
	/// Fetched into the upstream base with a [`ContentFetcher`]; the directory
	/// it returns becomes the base root.
	Remote(String),
	/// Rendered into the upstream base with [`ChartCommands`].
	HelmChart { chart_root: PathBuf, args: Vec<String> },
}

/// Inputs of one unfork.
#[derive(Debug, Clone)]
pub struct UnforkConfig {
	pub upstream_base: PathBuf,
	pub forked: PathBuf,
	pub overlay: PathBuf,
	/// Build the overlay into this file when set.
	pub destination: Option<PathBuf>,
	pub overlay_name: String,
	pub confirm_poll_interval: Duration,
	pub source: UpstreamSource,
}

impl UnforkConfig {
	pub fn new(
		upstream_base: impl Into<PathBuf>,
		forked: impl Into<PathBuf>,
		overlay: impl Into<PathBuf>,
	) -> Self {
		Self {
			upstream_base: upstream_base.into(),
			forked: forked.into(),
			overlay: overlay.into(),
			destination: None,
			overlay_name: DEFAULT_OVERLAY_NAME.to_string(),
			confirm_poll_interval: Duration::from_millis(DEFAULT_CONFIRM_POLL_INTERVAL_MS),
			source: UpstreamSource::Local,
		}
	}
}

/// Summary of a finished unfork.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnforkReport {
	pub patches: usize,
	pub resources: usize,
	pub excluded: usize,
	pub destination: Option<PathBuf>,
}

/// One document of the build output.
#[derive(Debug, Clone, PartialEq)]
pub struct PostProcessedFile {
	/// Position in the build output.
	pub order: usize,
	pub minimal: MinimalDocument,
	pub document: Value,
	/// The document as built, newline-terminated.
	pub content: String,
}

pub struct Unforker {
	config: UnforkConfig,
	state: Box<dyn StateManager>,
	patcher: PatchEngine,
	fetcher: Option<Box<dyn ContentFetcher>>,
	charts: Option<Box<dyn ChartCommands>>,
	gate: Option<Box<dyn ConfirmationGate>>,
	cancel: CancellationToken,
	/// Directory holding the upstream manifests once resolved.
	upstream_root: PathBuf,
	overlay: Overlay,
	lists: Vec<ListContainer>,
}

impl Unforker {
	pub fn new(config: UnforkConfig, state: Box<dyn StateManager>) -> Self {
		Self {
			upstream_root: config.upstream_base.clone(),
			config,
			state,
			patcher: PatchEngine,
			fetcher: None,
			charts: None,
			gate: None,
			cancel: CancellationToken::new(),
			overlay: Overlay::default(),
			lists: Vec::new(),
		}
	}

	#[must_use]
	pub fn with_fetcher(mut self, fetcher: Box<dyn ContentFetcher>) -> Self {
		self.fetcher = Some(fetcher);
		self
	}

	#[must_use]
	pub fn with_charts(mut self, charts: Box<dyn ChartCommands>) -> Self {
		self.charts = Some(charts);
		self
	}

	/// Wait for `gate` after the overlay is computed and before anything is
	/// written.
	#[must_use]
	pub fn with_confirmation(mut self, gate: Box<dyn ConfirmationGate>) -> Self {
		self.gate = Some(gate);
		self
	}

	#[must_use]
	pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
		self.cancel = cancel;
		self
	}

	/// The overlay computed by the last [`Unforker::execute`].
	pub fn overlay(&self) -> &Overlay {
		&self.overlay
	}

	/// Lists found while splitting the trees, including ones remembered from
	/// earlier runs.
	pub fn lists(&self) -> &[ListContainer] {
		&self.lists
	}

	fn store(&self) -> OverlayStore<'_> {
		OverlayStore::new(self.state.as_ref(), &self.config.overlay_name)
	}

	/// Run the whole unfork.
	#[instrument(skip_all, fields(overlay = %self.config.overlay_name))]
	pub fn execute(&mut self) -> Result<UnforkReport, UnforkError> {
		let fork = self.init()?;
		let upstream = self.map_upstream()?;
		self.walk_forked(fork.path(), upstream)?;
		drop(fork);
		self.store().save(&self.overlay)?;
		info!(
			patches = self.overlay.patches.len(),
			resources = self.overlay.resources.len(),
			excluded = self.overlay.excluded_bases.len(),
			"computed overlay"
		);

		self.confirm()?;
		self.write_base()?;
		self.write_patches_and_resources()?;
		self.write_overlay_manifest()?;

		let destination = match self.config.destination.clone() {
			Some(destination) => {
				let built = self.build()?;
				let output = reconstruct(&built, &self.lists)?;
				if self.cancel.is_cancelled() {
					return Err(UnforkError::Cancelled);
				}
				write_atomically(&destination, output.as_bytes())?;
				info!(destination = %destination.display(), "wrote rendered manifests");
				Some(destination)
			}
			None => None,
		};

		Ok(UnforkReport {
			patches: self.overlay.patches.len(),
			resources: self.overlay.resources.len(),
			excluded: self.overlay.excluded_bases.len(),
			destination,
		})
	}

	/// Resolve the upstream, split the base and a working copy of the fork,
	/// and clear the overlay directory.
	///
	/// The forked tree itself is never modified. The returned directory holds
	/// the split copy and lives until the walk is done.
	#[instrument(skip_all)]
	fn init(&mut self) -> Result<TempDir, UnforkError> {
		let previous = self.store().load()?;
		self.overlay = Overlay::default();
		let base = self.config.upstream_base.clone();

		let (upstream, root) = match &self.config.source {
			UpstreamSource::Local => (base.display().to_string(), base),
			UpstreamSource::Remote(upstream) => {
				let fetcher = self
					.fetcher
					.as_deref()
					.ok_or(UnforkError::MissingCollaborator("content fetcher"))?;
				reset_dir(&base)?;
				let root = fetcher
					.get_files(&self.cancel, upstream, &base)
					.map_err(UnforkError::Upstream)?;
				(upstream.clone(), root)
			}
			UpstreamSource::HelmChart { chart_root, args } => {
				let charts = self
					.charts
					.as_deref()
					.ok_or(UnforkError::MissingCollaborator("chart commands"))?;
				charts.init().map_err(UnforkError::Upstream)?;
				charts
					.dependency_update(chart_root)
					.map_err(UnforkError::Upstream)?;
				let rendered = charts
					.template(chart_root, args)
					.map_err(UnforkError::Upstream)?;
				reset_dir(&base)?;
				write_file(&base.join(RENDERED_CHART_FILE), rendered.as_bytes())?;
				(chart_root.display().to_string(), base)
			}
		};
		debug!(root = %root.display(), "resolved upstream");
		self.upstream_root = root;
		let mut metadata = self.state.try_load()?.v1.metadata;
		metadata.upstream = Some(upstream);
		self.state.serialize_app_metadata(&metadata)?;

		let fork = self.copy_fork()?;
		let mut lists = split::split_tree(fork.path())?;
		for list in &mut lists {
			if let Ok(relative) = list.path.strip_prefix(fork.path()) {
				list.path = self.config.forked.join(relative);
			}
		}

		let mut base_lists = split::split_tree(&self.upstream_root)?;
		if self.config.source == UpstreamSource::Local {
			// Already split by an earlier run
			push_new_lists(&mut base_lists, previous.lists);
		}
		push_new_lists(&mut lists, base_lists.iter().cloned());
		self.overlay.lists = base_lists;
		self.lists = lists;

		reset_dir(&self.config.overlay)?;
		Ok(fork)
	}

	fn copy_fork(&self) -> Result<TempDir, UnforkError> {
		let fork_err = |source| UnforkError::Fork {
			path: self.config.forked.clone(),
			source,
		};
		if !self.config.forked.is_dir() {
			return Err(fork_err(CollaboratorError::NotFound(
				self.config.forked.display().to_string(),
			)));
		}
		let copy = TempDir::new().map_err(|source| {
			fork_err(CollaboratorError::Io {
				path: std::env::temp_dir(),
				source,
			})
		})?;
		copy_tree(&self.cancel, &self.config.forked, copy.path()).map_err(|e| match e {
			CollaboratorError::Cancelled => UnforkError::Cancelled,
			other => fork_err(other),
		})?;
		Ok(copy)
	}

	/// Identity of every upstream resource, with the file it lives in.
	#[instrument(skip_all)]
	fn map_upstream(&self) -> Result<BTreeMap<MinimalDocument, PathBuf>, UnforkError> {
		let mut upstream = BTreeMap::new();
		for path in split::manifest_files(&self.upstream_root)? {
			let minimal = decode_minimal(&read_file(&path)?);
			if minimal.kind.is_empty() {
				trace!(path = %path.display(), "not a resource");
				continue;
			}
			if let Some(previous) = upstream.insert(minimal, path.clone()) {
				warn!(
					path = %path.display(),
					previous = %previous.display(),
					"resource defined twice upstream, using the later file"
				);
			}
		}
		debug!(resources = upstream.len(), "mapped upstream");
		Ok(upstream)
	}

	/// Match every file of the split fork in `fork` against `upstream`.
	#[instrument(skip_all)]
	fn walk_forked(
		&mut self,
		fork: &Path,
		mut upstream: BTreeMap<MinimalDocument, PathBuf>,
	) -> Result<(), UnforkError> {
		for path in split::manifest_files(fork)? {
			let bytes = read_file(&path)?;
			let key = relative_key(fork, &path);
			let resource = match decode(&bytes).and_then(|r| r.ensure_known().map(|()| r)) {
				Ok(resource) => resource,
				Err(e) => {
					// Still accounted for, so the upstream copy stays in the base
					if upstream.remove(&decode_minimal(&bytes)).is_some() {
						debug!(%key, error = %e, "not a known Kubernetes type, keeping upstream copy");
					} else {
						debug!(%key, error = %e, "skipping, not a known Kubernetes resource");
					}
					continue;
				}
			};
			let source = self.config.forked.join(key.trim_start_matches('/'));
			self.record(&resource, &mut upstream, key, &source, bytes)?;
		}

		let base = &self.upstream_root;
		let mut excluded: Vec<String> = upstream
			.into_values()
			.map(|path| relative_key(base, &path))
			.collect();
		excluded.sort();
		self.overlay.excluded_bases = excluded;
		Ok(())
	}

	fn record(
		&mut self,
		resource: &Resource,
		upstream: &mut BTreeMap<MinimalDocument, PathBuf>,
		key: String,
		path: &Path,
		bytes: Vec<u8>,
	) -> Result<(), UnforkError> {
		let Some(upstream_path) = upstream.remove(&resource.id().minimal()) else {
			debug!(%key, resource = %resource.id(), "new resource");
			self.overlay
				.resources
				.insert(key, String::from_utf8_lossy(&bytes).into_owned());
			return Ok(());
		};

		let original = read_file(&upstream_path)?;
		let patch = self
			.patcher
			.create_two_way_merge_patch(&original, &bytes)
			.map_err(|source| UnforkError::Patch {
				path: path.to_path_buf(),
				source,
			})?;
		if is_noop_patch(path, &patch)? {
			trace!(%key, "unchanged");
			return Ok(());
		}
		debug!(%key, resource = %resource.id(), "patched resource");
		self.overlay.patches.insert(key, patch);
		Ok(())
	}

	fn confirm(&self) -> Result<(), UnforkError> {
		if let Some(gate) = self.gate.as_deref() {
			info!("waiting for confirmation");
			wait_for_confirmation(gate, self.config.confirm_poll_interval, &self.cancel)
				.map_err(|_| UnforkError::Cancelled)?;
		}
		if self.cancel.is_cancelled() {
			return Err(UnforkError::Cancelled);
		}
		Ok(())
	}

	/// Regenerate the base kustomization from what is on disk, minus exclusions.
	#[instrument(skip_all)]
	fn write_base(&self) -> Result<(), UnforkError> {
		let base = &self.upstream_root;
		let mut resources = Vec::new();
		for path in split::manifest_files(base)? {
			let key = relative_key(base, &path);
			if self.overlay.is_excluded(&key) {
				trace!(%key, "excluded");
				continue;
			}
			if !is_kubernetes_yaml(&read_file(&path)?) {
				continue;
			}
			resources.push(key.trim_start_matches('/').to_string());
		}
		if resources.is_empty() {
			return Err(UnforkError::EmptyBase { path: base.clone() });
		}
		debug!(resources = resources.len(), "writing base kustomization");
		Kustomization {
			resources,
			..Default::default()
		}
		.save(base)?;
		Ok(())
	}

	fn write_patches_and_resources(&self) -> Result<(), UnforkError> {
		let files: BTreeMap<&String, &String> = self
			.overlay
			.patches
			.iter()
			.chain(&self.overlay.resources)
			.collect();
		for (key, content) in files {
			let path = self.config.overlay.join(key.trim_start_matches('/'));
			if let Some(parent) = path.parent() {
				fs::create_dir_all(parent).map_err(|source| UnforkError::Write {
					path: parent.to_path_buf(),
					source,
				})?;
			}
			write_file(&path, content.as_bytes())?;
		}
		Ok(())
	}

	fn write_overlay_manifest(&self) -> Result<(), UnforkError> {
		let entries = |map: &BTreeMap<String, String>| -> Vec<String> {
			map.keys()
				.map(|k| k.trim_start_matches('/').to_string())
				.collect()
		};
		Kustomization {
			bases: vec![relative_base(&self.upstream_root, &self.config.overlay)],
			patches_strategic_merge: entries(&self.overlay.patches),
			resources: entries(&self.overlay.resources),
			..Default::default()
		}
		.save(&self.config.overlay)?;
		Ok(())
	}

	#[instrument(skip_all)]
	fn build(&self) -> Result<Vec<PostProcessedFile>, UnforkError> {
		let output = self.patcher.run_kustomize(&self.config.overlay)?;
		post_process(&output)
	}

	/// Exclude a base resource (a `/`-prefixed path relative to the base)
	/// from the stored overlay and the base kustomization.
	///
	/// Returns `false` if it was already excluded.
	#[instrument(skip_all, fields(resource = %resource))]
	pub fn exclude_base(&mut self, resource: &str) -> Result<bool, UnforkError> {
		self.overlay = self.store().load()?;
		if self.overlay.is_excluded(resource) {
			debug!("already excluded");
			return Ok(false);
		}
		kustomize::exclude_resource(&self.config.upstream_base, resource)?;
		self.overlay.exclude(resource);
		self.store().save(&self.overlay)?;
		Ok(true)
	}

	/// Undo [`Unforker::exclude_base`]. Returns `false` if `resource` was not
	/// excluded.
	#[instrument(skip_all, fields(resource = %resource))]
	pub fn include_base(&mut self, resource: &str) -> Result<bool, UnforkError> {
		self.overlay = self.store().load()?;
		if !self.overlay.is_excluded(resource) {
			debug!("not excluded");
			return Ok(false);
		}
		kustomize::include_resource(&self.config.upstream_base, resource)?;
		self.overlay.include(resource);
		self.store().save(&self.overlay)?;
		Ok(true)
	}
}

/// Split a build output into tagged documents.
pub fn post_process(stream: &str) -> Result<Vec<PostProcessedFile>, UnforkError> {
	yaml::split_documents(stream)
		.into_iter()
		.enumerate()
		.map(|(order, chunk)| -> Result<PostProcessedFile, UnforkError> {
			let document = decode_stream(chunk.as_bytes())
				.map_err(UnforkError::Codec)?
				.into_iter()
				.next()
				.unwrap_or(Value::Null);
			Ok(PostProcessedFile {
				order,
				minimal: MinimalDocument::from_value(&document),
				document,
				content: yaml::normalize_document(chunk),
			})
		})
		.collect()
}

/// Regroup built documents into the lists they were split from.
///
/// Each list claims its members by identity, in member order, and takes the
/// position of its first claimed member. Lists with no built member are
/// dropped; unclaimed documents are emitted as they are.
pub fn reconstruct(files: &[PostProcessedFile], lists: &[ListContainer]) -> Result<String, UnforkError> {
	let mut claimed = vec![false; files.len()];
	let mut out: Vec<(usize, String)> = Vec::with_capacity(files.len());

	for list in lists {
		let mut order = None;
		let mut items = Vec::with_capacity(list.items.len());
		for member in list.items.iter().filter(|m| !m.kind.is_empty()) {
			let Some(idx) = (0..files.len()).find(|&i| !claimed[i] && files[i].minimal == *member)
			else {
				trace!(%member, "list member not built");
				continue;
			};
			claimed[idx] = true;
			if order.is_none() {
				order = Some(files[idx].order);
			}
			items.push(files[idx].document.clone());
		}
		let Some(order) = order else {
			debug!(path = %list.path.display(), "no list member was built, dropping list");
			continue;
		};
		let document = json!({
			"apiVersion": list.api_version,
			"kind": "List",
			"items": items,
		});
		let rendered =
			yaml::to_yaml(&document).map_err(|e| UnforkError::Codec(CodecError::Serialize(e)))?;
		out.push((order, rendered));
	}

	for (file, _) in files.iter().zip(&claimed).filter(|(_, claimed)| !**claimed) {
		out.push((file.order, file.content.clone()));
	}
	out.sort_by_key(|(order, _)| *order);
	Ok(yaml::join_documents(out.into_iter().map(|(_, doc)| doc)))
}

/// Append the lists of `new` whose members are not already grouped in `lists`.
fn push_new_lists(lists: &mut Vec<ListContainer>, new: impl IntoIterator<Item = ListContainer>) {
	for list in new {
		if !lists.iter().any(|l| l.items == list.items) {
			lists.push(list);
		}
	}
}

/// Whether `patch` carries nothing besides the identity of its target.
fn is_noop_patch(path: &Path, patch: &str) -> Result<bool, UnforkError> {
	contains_only_identity_keys(patch.as_bytes()).map_err(|source| UnforkError::Patch {
		path: path.to_path_buf(),
		source: PatchError::Decode {
			which: "patch",
			source,
		},
	})
}

/// `/`-prefixed path of `path` relative to `root`, with `/` separators.
fn relative_key(root: &Path, path: &Path) -> String {
	let relative = path.strip_prefix(root).unwrap_or(path);
	let parts: Vec<String> = relative
		.components()
		.map(|c| c.as_os_str().to_string_lossy().into_owned())
		.collect();
	format!("/{}", parts.join("/"))
}

/// Path of `base` as seen from `overlay`.
fn relative_base(base: &Path, overlay: &Path) -> String {
	let absolute = |p: &Path| p.canonicalize().unwrap_or_else(|_| p.to_path_buf());
	let (base, overlay) = (absolute(base), absolute(overlay));
	let relative = pathdiff::diff_paths(&base, &overlay).unwrap_or(base);
	relative.to_string_lossy().replace('\\', "/")
}

fn read_file(path: &Path) -> Result<Vec<u8>, UnforkError> {
	fs::read(path).map_err(|source| UnforkError::Read {
		path: path.to_path_buf(),
		source,
	})
}

fn write_file(path: &Path, content: &[u8]) -> Result<(), UnforkError> {
	fs::write(path, content).map_err(|source| UnforkError::Write {
		path: path.to_path_buf(),
		source,
	})
}

/// Remove `dir` if it exists and create it empty.
fn reset_dir(dir: &Path) -> Result<(), UnforkError> {
	let write_err = |source| UnforkError::Write {
		path: dir.to_path_buf(),
		source,
	};
	match fs::remove_dir_all(dir) {
		Ok(()) => {}
		Err(e) if e.kind() == io::ErrorKind::NotFound => {}
		Err(e) => return Err(write_err(e)),
	}
	fs::create_dir_all(dir).map_err(write_err)
}

/// Write through a temp file next to `path`, so `path` is either untouched
/// or complete.
fn write_atomically(path: &Path, content: &[u8]) -> Result<(), UnforkError> {
	let write_err = |source| UnforkError::Write {
		path: path.to_path_buf(),
		source,
	};
	let dir = match path.parent() {
		Some(dir) if !dir.as_os_str().is_empty() => dir,
		_ => Path::new("."),
	};
	fs::create_dir_all(dir).map_err(write_err)?;
	let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
	tmp.write_all(content).map_err(write_err)?;
	tmp.persist(path).map_err(|e| write_err(e.error))?;
	Ok(())
}
