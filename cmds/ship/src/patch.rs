//! Byte-level patch operations used by the unforker.

use std::{
	fs, io,
	path::{Path, PathBuf},
};

use serde_json::Value;
use ship_k8s::{
	create_two_way_merge_patch, decode, merge_patches, yaml, CodecError, Manifest, MergeError,
	Resource,
};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::kustomize::{self, Kustomization, KustomizeError};

const PATCH_FILE: &str = "patch.yaml";

#[derive(Debug, Error)]
pub enum PatchError {
	#[error("decoding {which} document")]
	Decode {
		which: &'static str,
		#[source]
		source: CodecError,
	},

	#[error("creating patch for {resource}")]
	Create {
		resource: String,
		#[source]
		source: MergeError,
	},

	#[error("merging patches for {resource}")]
	Merge {
		resource: String,
		#[source]
		source: MergeError,
	},

	#[error("applying patch for {resource} to {}", base.display())]
	Apply {
		resource: String,
		base: PathBuf,
		#[source]
		source: Box<KustomizeError>,
	},

	#[error("{resource} is not produced by the build of {}", base.display())]
	TargetNotBuilt { resource: String, base: PathBuf },

	#[error("encoding patch")]
	Encode(#[source] CodecError),

	#[error("preparing scratch directory")]
	Scratch(#[source] io::Error),
}

fn decode_side(bytes: &[u8], which: &'static str) -> Result<Resource, PatchError> {
	decode(bytes).map_err(|source| PatchError::Decode { which, source })
}

fn encode(patch: serde_json::Map<String, Value>) -> Result<String, PatchError> {
	yaml::to_yaml(&Value::Object(patch))
		.map_err(|e| PatchError::Encode(CodecError::Serialize(e)))
}

/// Patch creation, merging and application on raw YAML documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatchEngine;

impl PatchEngine {
	/// Patch that turns `original` into `modified`, as YAML.
	pub fn create_two_way_merge_patch(
		&self,
		original: &[u8],
		modified: &[u8],
	) -> Result<String, PatchError> {
		let original = decode_side(original, "original")?;
		let modified = decode_side(modified, "modified")?;
		let patch = create_two_way_merge_patch(&original, &modified).map_err(|source| {
			PatchError::Create {
				resource: original.id().to_string(),
				source,
			}
		})?;
		encode(patch)
	}

	/// One patch with the effect of `current` followed by `new`, as YAML.
	pub fn merge_patches(&self, current: &[u8], new: &[u8]) -> Result<String, PatchError> {
		let current = decode_side(current, "current patch")?;
		let new = decode_side(new, "new patch")?;
		let merged = merge_patches(&current, &new).map_err(|source| PatchError::Merge {
			resource: current.id().to_string(),
			source,
		})?;
		encode(merged)
	}

	/// Apply `patch` on top of the kustomization in `base_dir` and return the
	/// patched target document.
	///
	/// The patch is applied through a throwaway kustomization that uses
	/// `base_dir` as its base.
	#[instrument(skip_all, fields(base = %base_dir.display()))]
	pub fn apply_patch(&self, patch: &[u8], base_dir: &Path) -> Result<String, PatchError> {
		let target = decode_side(patch, "patch")?;
		let resource = target.id().to_string();
		let base = base_dir.canonicalize().map_err(|source| PatchError::Apply {
			resource: resource.clone(),
			base: base_dir.to_path_buf(),
			source: Box::new(KustomizeError::Read {
				path: base_dir.to_path_buf(),
				source,
			}),
		})?;

		let scratch = TempDir::new().map_err(PatchError::Scratch)?;
		fs::write(scratch.path().join(PATCH_FILE), patch).map_err(PatchError::Scratch)?;
		let kustomization = Kustomization {
			bases: vec![base.to_string_lossy().into_owned()],
			patches_strategic_merge: vec![PATCH_FILE.to_string()],
			..Default::default()
		};

		let apply_err = |source| PatchError::Apply {
			resource: resource.clone(),
			base: base.clone(),
			source: Box::new(source),
		};
		kustomization.save(scratch.path()).map_err(apply_err)?;
		let manifests = kustomize::build(scratch.path()).map_err(apply_err)?;

		let built = manifests
			.into_iter()
			.find_map(|m| match m {
				Manifest::Known(r) if r.id() == target.id() => Some(r),
				_ => None,
			})
			.ok_or_else(|| PatchError::TargetNotBuilt {
				resource: resource.clone(),
				base: base.clone(),
			})?;
		debug!(%resource, "applied patch");
		built.to_yaml().map_err(PatchError::Encode)
	}

	/// Build the kustomization in `dir` into a YAML stream.
	pub fn run_kustomize(&self, dir: &Path) -> Result<String, KustomizeError> {
		kustomize::run(dir)
	}
}
