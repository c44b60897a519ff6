//! Kustomization manifests and the build step.
//!
//! Only the subset ship generates and consumes is supported: `bases`,
//! `resources`, `patchesStrategicMerge` and `patchesJson6902`. Other keys are
//! preserved when a manifest is rewritten but ignored by the build.

use std::{
	collections::{BTreeMap, HashSet},
	fs, io,
	path::{Component, Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ship_k8s::{
	apply_strategic_merge_patch, decode_stream, yaml, CodecError, Gvk, Manifest, MergeError,
	Resource, ResourceId,
};
use thiserror::Error;
use tracing::{debug, instrument, trace};

pub const KUSTOMIZATION_FILE: &str = "kustomization.yaml";

/// Kinds emitted first, in this order.
const ORDER_FIRST: &[&str] = &[
	"Namespace",
	"ResourceQuota",
	"StorageClass",
	"CustomResourceDefinition",
	"ServiceAccount",
	"PodSecurityPolicy",
	"Role",
	"ClusterRole",
	"RoleBinding",
	"ClusterRoleBinding",
	"ConfigMap",
	"Secret",
	"Endpoints",
	"Service",
	"LimitRange",
	"PriorityClass",
	"PersistentVolume",
	"PersistentVolumeClaim",
	"Deployment",
	"StatefulSet",
	"CronJob",
	"PodDisruptionBudget",
];

/// Kinds emitted last, in this order.
const ORDER_LAST: &[&str] = &[
	"MutatingWebhookConfiguration",
	"ValidatingWebhookConfiguration",
];

#[derive(Debug, Error)]
pub enum KustomizeError {
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

	#[error("parsing kustomization {}", path.display())]
	Parse {
		path: PathBuf,
		#[source]
		source: serde_yaml::Error,
	},

	#[error("serializing kustomization")]
	Serialize(#[source] serde_yaml::Error),

	#[error("encoding build output")]
	Encode(#[source] CodecError),

	#[error("{} does not exist", path.display())]
	MissingFile { path: PathBuf },

	#[error("kustomization {} includes itself", path.display())]
	Cycle { path: PathBuf },

	#[error("decoding {}", path.display())]
	Decode {
		path: PathBuf,
		#[source]
		source: CodecError,
	},

	#[error("patch {} targets {target}, which is not in the build", path.display())]
	PatchTargetNotFound { path: PathBuf, target: String },

	#[error("resource {id} is defined more than once")]
	Conflict { id: String },

	#[error("applying patch {}", path.display())]
	Merge {
		path: PathBuf,
		#[source]
		source: MergeError,
	},

	#[error("applying JSON patch {}", path.display())]
	JsonPatch {
		path: PathBuf,
		#[source]
		source: json_patch::PatchError,
	},

	#[error("resource {resource} is not listed in {}", dir.display())]
	ResourceNotFound { dir: PathBuf, resource: String },
}

/// A `kustomization.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kustomization {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub api_version: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub kind: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub bases: Vec<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub resources: Vec<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub patches_strategic_merge: Vec<String>,
	#[serde(
		default,
		rename = "patchesJson6902",
		skip_serializing_if = "Vec::is_empty"
	)]
	pub patches_json6902: Vec<JsonPatchRef>,
	#[serde(flatten)]
	pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// An RFC 6902 patch file and the resource it applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonPatchRef {
	pub path: String,
	pub target: PatchTarget,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchTarget {
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub group: String,
	pub version: String,
	pub kind: String,
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub namespace: Option<String>,
}

impl PatchTarget {
	fn id(&self) -> ResourceId {
		ResourceId::new(
			Gvk::new(&self.group, &self.version, &self.kind),
			&self.name,
			self.namespace.as_deref(),
		)
	}
}

impl Kustomization {
	/// Load `{dir}/kustomization.yaml`.
	pub fn load(dir: &Path) -> Result<Self, KustomizeError> {
		let path = dir.join(KUSTOMIZATION_FILE);
		let content = fs::read_to_string(&path).map_err(|source| {
			if source.kind() == io::ErrorKind::NotFound {
				KustomizeError::MissingFile { path: path.clone() }
			} else {
				KustomizeError::Read {
					path: path.clone(),
					source,
				}
			}
		})?;
		serde_yaml::from_str(&content).map_err(|source| KustomizeError::Parse { path, source })
	}

	/// Load `{dir}/kustomization.yaml` if there is one.
	pub fn load_if_exists(dir: &Path) -> Result<Option<Self>, KustomizeError> {
		match Self::load(dir) {
			Ok(k) => Ok(Some(k)),
			Err(KustomizeError::MissingFile { .. }) => Ok(None),
			Err(e) => Err(e),
		}
	}

	/// Write `{dir}/kustomization.yaml`.
	pub fn save(&self, dir: &Path) -> Result<(), KustomizeError> {
		let path = dir.join(KUSTOMIZATION_FILE);
		let content = serde_yaml::to_string(self).map_err(KustomizeError::Serialize)?;
		fs::write(&path, content).map_err(|source| KustomizeError::Write { path, source })
	}
}

/// Normalize a manifest entry for comparison: no leading `/` or `./`.
fn entry_path(entry: &str) -> PathBuf {
	Path::new(entry)
		.components()
		.filter(|c| !matches!(c, Component::RootDir | Component::CurDir))
		.collect()
}

fn same_entry(a: &str, b: &str) -> bool {
	entry_path(a) == entry_path(b)
}

/// Build the kustomization in `dir` and render it as a YAML stream.
pub fn run(dir: &Path) -> Result<String, KustomizeError> {
	let manifests = build(dir)?;
	render(&manifests)
}

/// Render documents as a stream, one `---` line between each.
pub fn render(manifests: &[Manifest]) -> Result<String, KustomizeError> {
	let docs = manifests
		.iter()
		.map(|m| m.to_yaml().map_err(KustomizeError::Encode))
		.collect::<Result<Vec<_>, _>>()?;
	Ok(yaml::join_documents(docs))
}

/// Build the kustomization in `dir`: every base, every resource, all
/// patches applied, ordered by kind.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn build(dir: &Path) -> Result<Vec<Manifest>, KustomizeError> {
	let mut manifests = build_dir(dir, &mut Vec::new())?;
	sort_legacy(&mut manifests);
	debug!(count = manifests.len(), "built kustomization");
	Ok(manifests)
}

fn build_dir(dir: &Path, stack: &mut Vec<PathBuf>) -> Result<Vec<Manifest>, KustomizeError> {
	let canonical = dir
		.canonicalize()
		.map_err(|_| KustomizeError::MissingFile {
			path: dir.to_path_buf(),
		})?;
	if stack.contains(&canonical) {
		return Err(KustomizeError::Cycle { path: canonical });
	}
	stack.push(canonical);

	let kustomization = Kustomization::load(dir)?;
	let mut manifests = Vec::new();

	for base in &kustomization.bases {
		let base_dir = existing(dir, base)?;
		trace!(base = %base_dir.display(), "building base");
		manifests.extend(build_dir(&base_dir, stack)?);
	}
	for resource in &kustomization.resources {
		let path = existing(dir, resource)?;
		if path.is_dir() {
			manifests.extend(build_dir(&path, stack)?);
		} else {
			manifests.extend(load_documents(&path)?);
		}
	}
	check_conflicts(&manifests)?;

	for patch in &kustomization.patches_strategic_merge {
		let path = existing(dir, patch)?;
		apply_strategic_patch_file(&mut manifests, &path)?;
	}
	for patch in &kustomization.patches_json6902 {
		let path = existing(dir, &patch.path)?;
		apply_json_patch_file(&mut manifests, &path, &patch.target)?;
	}

	stack.pop();
	Ok(manifests)
}

fn existing(dir: &Path, entry: &str) -> Result<PathBuf, KustomizeError> {
	let path = dir.join(entry);
	if path.exists() {
		Ok(path)
	} else {
		Err(KustomizeError::MissingFile { path })
	}
}

fn read(path: &Path) -> Result<Vec<u8>, KustomizeError> {
	fs::read(path).map_err(|source| KustomizeError::Read {
		path: path.to_path_buf(),
		source,
	})
}

fn decode_file(path: &Path) -> Result<Vec<Value>, KustomizeError> {
	decode_stream(&read(path)?).map_err(|source| KustomizeError::Decode {
		path: path.to_path_buf(),
		source,
	})
}

/// Documents of a resource file, with `*List` documents expanded into their
/// items.
fn load_documents(path: &Path) -> Result<Vec<Manifest>, KustomizeError> {
	let mut out = Vec::new();
	for doc in decode_file(path)? {
		let is_list = doc
			.get("kind")
			.and_then(Value::as_str)
			.is_some_and(|kind| kind.ends_with("List"));
		match doc {
			Value::Object(mut map) if is_list && map.get("items").is_some_and(Value::is_array) => {
				if let Some(Value::Array(items)) = map.remove("items") {
					out.extend(items.into_iter().map(Manifest::from_value));
				}
			}
			doc => out.push(Manifest::from_value(doc)),
		}
	}
	Ok(out)
}

fn check_conflicts(manifests: &[Manifest]) -> Result<(), KustomizeError> {
	let mut seen = HashSet::new();
	for manifest in manifests {
		if let Manifest::Known(resource) = manifest {
			if !seen.insert(resource.id()) {
				return Err(KustomizeError::Conflict {
					id: resource.id().to_string(),
				});
			}
		}
	}
	Ok(())
}

fn find_target<'m>(manifests: &'m mut [Manifest], id: &ResourceId) -> Option<&'m mut Resource> {
	manifests.iter_mut().find_map(|m| match m {
		Manifest::Known(resource) if resource.id() == id => Some(resource),
		_ => None,
	})
}

fn apply_strategic_patch_file(manifests: &mut [Manifest], path: &Path) -> Result<(), KustomizeError> {
	for doc in decode_file(path)? {
		let patch = Resource::from_value(doc).map_err(|source| KustomizeError::Decode {
			path: path.to_path_buf(),
			source,
		})?;
		let target =
			find_target(manifests, patch.id()).ok_or_else(|| KustomizeError::PatchTargetNotFound {
				path: path.to_path_buf(),
				target: patch.id().to_string(),
			})?;
		trace!(target = %patch.id(), "applying strategic merge patch");
		apply_strategic_merge_patch(target, &patch).map_err(|source| KustomizeError::Merge {
			path: path.to_path_buf(),
			source,
		})?;
	}
	Ok(())
}

fn apply_json_patch_file(
	manifests: &mut [Manifest],
	path: &Path,
	target: &PatchTarget,
) -> Result<(), KustomizeError> {
	// YAML is a superset of JSON, so one parser covers both patch formats
	let content = read(path)?;
	let ops: json_patch::Patch =
		serde_yaml::from_slice(&content).map_err(|source| KustomizeError::Parse {
			path: path.to_path_buf(),
			source,
		})?;

	let id = target.id();
	let resource = find_target(manifests, &id).ok_or_else(|| KustomizeError::PatchTargetNotFound {
		path: path.to_path_buf(),
		target: id.to_string(),
	})?;
	let mut doc = resource.clone().into_value();
	json_patch::patch(&mut doc, &ops.0).map_err(|source| KustomizeError::JsonPatch {
		path: path.to_path_buf(),
		source,
	})?;
	*resource = Resource::from_value(doc).map_err(|source| KustomizeError::Decode {
		path: path.to_path_buf(),
		source,
	})?;
	Ok(())
}

fn kind_of(manifest: &Manifest) -> &str {
	match manifest {
		Manifest::Known(resource) => &resource.gvk().kind,
		Manifest::Unknown(value) => value.get("kind").and_then(Value::as_str).unwrap_or(""),
	}
}

fn kind_priority(kind: &str) -> usize {
	if let Some(pos) = ORDER_FIRST.iter().position(|k| *k == kind) {
		return pos;
	}
	match ORDER_LAST.iter().position(|k| *k == kind) {
		Some(pos) => ORDER_FIRST.len() + 1 + pos,
		None => ORDER_FIRST.len(),
	}
}

/// Order documents by kind. Documents of the same priority keep their
/// relative order.
pub fn sort_legacy(manifests: &mut [Manifest]) {
	manifests.sort_by_key(|m| kind_priority(kind_of(m)));
}

/// Remove `resource` from the kustomization in `dir`: from `resources`, else
/// from `patchesStrategicMerge`, else from one of the `bases`.
#[instrument(skip_all, fields(dir = %dir.display(), resource = %resource))]
pub fn exclude_resource(dir: &Path, resource: &str) -> Result<(), KustomizeError> {
	if remove_entry(dir, &entry_path(resource))? {
		Ok(())
	} else {
		Err(KustomizeError::ResourceNotFound {
			dir: dir.to_path_buf(),
			resource: resource.to_string(),
		})
	}
}

fn remove_entry(dir: &Path, resource: &Path) -> Result<bool, KustomizeError> {
	let mut kustomization = Kustomization::load(dir)?;
	let resource_str = resource.to_string_lossy();

	if remove_listed(&mut kustomization.resources, &resource_str)
		|| remove_listed(&mut kustomization.patches_strategic_merge, &resource_str)
	{
		kustomization.save(dir)?;
		debug!("removed from kustomization");
		return Ok(true);
	}

	for base in &kustomization.bases {
		let base_path = entry_path(base);
		// A resource inside a base is addressed relative to that base
		let Ok(relative) = resource.strip_prefix(&base_path) else {
			continue;
		};
		if remove_entry(&dir.join(base), relative)? {
			return Ok(true);
		}
	}
	Ok(false)
}

fn remove_listed(list: &mut Vec<String>, entry: &str) -> bool {
	match list.iter().position(|e| same_entry(e, entry)) {
		Some(pos) => {
			list.remove(pos);
			true
		}
		None => false,
	}
}

/// Re-add a previously excluded file to the `resources` of the kustomization
/// in `dir`. Returns `false` if there was nothing to add.
#[instrument(skip_all, fields(dir = %dir.display(), resource = %resource))]
pub fn include_resource(dir: &Path, resource: &str) -> Result<bool, KustomizeError> {
	let relative = entry_path(resource);
	if !dir.join(&relative).is_file() {
		debug!("file is gone, nothing to include");
		return Ok(false);
	}
	let mut kustomization = Kustomization::load_if_exists(dir)?.unwrap_or_default();
	if kustomization.resources.iter().any(|e| same_entry(e, resource)) {
		return Ok(false);
	}
	kustomization
		.resources
		.push(relative.to_string_lossy().replace('\\', "/"));
	kustomization.save(dir)?;
	Ok(true)
}
