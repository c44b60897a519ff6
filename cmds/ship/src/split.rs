//! Splitting multi-document YAML files into one file per resource.
//!
//! Matching resources across two trees only works when every resource lives
//! in its own file, so both trees are normalized before an unfork. `List`
//! documents are exploded into their items; the original grouping is kept as
//! a [`ListContainer`] so the list can be rebuilt after the final build.

use std::{
	collections::HashSet,
	fs, io,
	path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use ship_k8s::{decode_list, decode_minimal, yaml, CodecError, MinimalDocument};
use thiserror::Error;
use tracing::{debug, instrument, trace};
use walkdir::WalkDir;

use crate::kustomize::{Kustomization, KustomizeError, KUSTOMIZATION_FILE};

/// Files that describe packaging rather than resources.
const PACKAGING_FILES: &[&str] = &[KUSTOMIZATION_FILE, "Chart.yaml", "values.yaml"];

#[derive(Debug, Error)]
pub enum SplitError {
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

	#[error("encoding item of list {}", path.display())]
	Encode {
		path: PathBuf,
		#[source]
		source: CodecError,
	},

	#[error("walking {}", root.display())]
	Walk {
		root: PathBuf,
		#[source]
		source: walkdir::Error,
	},

	#[error("updating kustomization next to {}", path.display())]
	Kustomization {
		path: PathBuf,
		#[source]
		source: Box<KustomizeError>,
	},
}

/// The original grouping of resources that were packaged in one `List`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListContainer {
	pub api_version: String,
	/// File the list was read from.
	pub path: PathBuf,
	/// Identities of the items, in list order.
	pub items: Vec<MinimalDocument>,
}

/// What splitting one file produced.
#[derive(Debug, Default)]
pub struct SplitOutcome {
	/// Files written, in document order. Empty if the file was left alone.
	pub written: Vec<PathBuf>,
	pub lists: Vec<ListContainer>,
}

/// Whether the path has a `.yaml` or `.yml` extension.
pub fn is_yaml_file(path: &Path) -> bool {
	matches!(
		path.extension().and_then(|e| e.to_str()),
		Some("yaml" | "yml")
	)
}

/// Whether the file is packaging metadata (kustomization, chart, values).
pub fn is_packaging_file(path: &Path) -> bool {
	path.file_name()
		.and_then(|n| n.to_str())
		.is_some_and(|name| PACKAGING_FILES.contains(&name))
}

/// Manifest files below `root`, depth first, in file name order.
pub fn manifest_files(root: &Path) -> Result<Vec<PathBuf>, SplitError> {
	let mut files = Vec::new();
	for entry in WalkDir::new(root).sort_by_file_name() {
		let entry = entry.map_err(|source| SplitError::Walk {
			root: root.to_path_buf(),
			source,
		})?;
		let path = entry.path();
		if entry.file_type().is_file() && is_yaml_file(path) && !is_packaging_file(path) {
			files.push(path.to_path_buf());
		}
	}
	Ok(files)
}

/// Split every manifest file below `root`, returning all lists found.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn split_tree(root: &Path) -> Result<Vec<ListContainer>, SplitError> {
	let mut lists = Vec::new();
	for file in manifest_files(root)? {
		lists.extend(split(&file)?.lists);
	}
	debug!(lists = lists.len(), "split tree");
	Ok(lists)
}

/// One output file: its stem and content.
struct Part {
	stem: String,
	content: String,
}

/// Split `file` into one file per document, next to it.
///
/// A file holding a single non-list document is left untouched, so splitting
/// is idempotent.
#[instrument(skip_all, fields(file = %file.display()))]
pub fn split(file: &Path) -> Result<SplitOutcome, SplitError> {
	let contents = fs::read_to_string(file).map_err(|source| SplitError::Read {
		path: file.to_path_buf(),
		source,
	})?;
	let docs = yaml::split_documents(&contents);

	let untouched = match docs.as_slice() {
		[] => true,
		[only] => !decode_minimal(only.as_bytes()).is_list(),
		_ => false,
	};
	if untouched {
		trace!("nothing to split");
		return Ok(SplitOutcome::default());
	}

	let file_stem = file
		.file_stem()
		.and_then(|s| s.to_str())
		.unwrap_or("document");
	let mut parts = Vec::new();
	let mut lists = Vec::new();
	for (idx, doc) in docs.iter().enumerate() {
		let minimal = decode_minimal(doc.as_bytes());
		if minimal.is_list() {
			if let Ok(list) = decode_list(doc.as_bytes()) {
				lists.push(explode_list(file, list, &mut parts)?);
				continue;
			}
		}
		let stem = if minimal.kind.is_empty() {
			format!("{file_stem}-{idx}")
		} else {
			minimal.file_stem(idx)
		};
		parts.push(Part {
			stem,
			content: yaml::normalize_document(doc),
		});
	}

	let dir = file.parent().unwrap_or_else(|| Path::new("."));
	fs::remove_file(file).map_err(|source| SplitError::Write {
		path: file.to_path_buf(),
		source,
	})?;

	let mut used = HashSet::new();
	let mut written = Vec::with_capacity(parts.len());
	for (idx, part) in parts.into_iter().enumerate() {
		// Never overwrite a sibling, whether written now or by an earlier split
		let mut name = format!("{}.yaml", part.stem);
		let mut suffix = idx;
		while used.contains(&name) || dir.join(&name).exists() {
			name = format!("{}-{suffix}.yaml", part.stem);
			suffix += 1;
		}
		used.insert(name.clone());
		let path = dir.join(&name);
		fs::write(&path, part.content).map_err(|source| SplitError::Write {
			path: path.clone(),
			source,
		})?;
		written.push(path);
	}
	debug!(files = written.len(), "split file");

	rewrite_kustomization(file, &written).map_err(|source| SplitError::Kustomization {
		path: file.to_path_buf(),
		source: Box::new(source),
	})?;

	Ok(SplitOutcome { written, lists })
}

fn explode_list(
	file: &Path,
	list: ship_k8s::ListDocument,
	parts: &mut Vec<Part>,
) -> Result<ListContainer, SplitError> {
	let mut container = ListContainer {
		api_version: list.api_version,
		path: file.to_path_buf(),
		items: Vec::with_capacity(list.items.len()),
	};
	for (idx, item) in list.items.iter().enumerate() {
		let minimal = MinimalDocument::from_value(item);
		let content = yaml::to_yaml(item).map_err(|source| SplitError::Encode {
			path: file.to_path_buf(),
			source: CodecError::Serialize(source),
		})?;
		parts.push(Part {
			stem: minimal.file_stem(idx),
			content,
		});
		container.items.push(minimal);
	}
	Ok(container)
}

/// Point the kustomization next to `file` at the files it was split into.
fn rewrite_kustomization(file: &Path, written: &[PathBuf]) -> Result<(), KustomizeError> {
	let dir = file.parent().unwrap_or_else(|| Path::new("."));
	let Some(mut kustomization) = Kustomization::load_if_exists(dir)? else {
		return Ok(());
	};
	let Some(original) = file.file_name().and_then(|n| n.to_str()) else {
		return Ok(());
	};
	let names: Vec<String> = written
		.iter()
		.filter_map(|p| p.file_name().and_then(|n| n.to_str()))
		.map(str::to_string)
		.collect();

	let mut changed = false;
	for list in [
		&mut kustomization.resources,
		&mut kustomization.patches_strategic_merge,
	] {
		changed |= replace_entry(list, original, &names);
	}
	if changed {
		kustomization.save(dir)?;
	}
	Ok(())
}

/// Drop `original` from `list` and append `names`. Returns whether `original`
/// was listed.
fn replace_entry(list: &mut Vec<String>, original: &str, names: &[String]) -> bool {
	let before = list.len();
	list.retain(|entry| entry.trim_start_matches("./") != original);
	if list.len() == before {
		return false;
	}
	list.extend(names.iter().cloned());
	true
}
