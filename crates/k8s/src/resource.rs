//! Decoding Kubernetes documents into identities and back.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{registry, yaml};

/// Top-level keys that identify a resource but carry no content.
const IDENTITY_KEYS: &[&str] = &["apiVersion", "kind", "metadata"];

/// Errors that can occur while decoding or encoding a document.
#[derive(Debug, Error)]
pub enum CodecError {
	#[error("document is not valid UTF-8")]
	Utf8(#[source] std::str::Utf8Error),

	#[error("parsing YAML document")]
	Yaml(#[source] serde_yaml::Error),

	#[error("expected exactly one document, found {0}")]
	DocumentCount(usize),

	#[error("document is not a mapping")]
	NotAMapping,

	#[error("manifest missing apiVersion or kind")]
	MissingApiVersionOrKind,

	#[error("manifest missing metadata.name")]
	MissingName,

	#[error("{kind} is not a list kind")]
	NotAList { kind: String },

	#[error("unknown resource type: {api_version}/{kind}")]
	UnknownKind { api_version: String, kind: String },

	#[error("serializing document to YAML")]
	Serialize(#[source] serde_yaml::Error),
}

/// Group, version and kind of a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gvk {
	pub group: String,
	pub version: String,
	pub kind: String,
}

impl Gvk {
	pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
		Self {
			group: group.into(),
			version: version.into(),
			kind: kind.into(),
		}
	}

	/// Build from an `apiVersion` string (`group/version` or bare `version`).
	pub fn from_api_version(api_version: &str, kind: &str) -> Self {
		match api_version.split_once('/') {
			Some((group, version)) => Self::new(group, version, kind),
			None => Self::new("", api_version, kind),
		}
	}

	pub fn api_version(&self) -> String {
		if self.group.is_empty() {
			self.version.clone()
		} else {
			format!("{}/{}", self.group, self.version)
		}
	}

	pub fn is_list(&self) -> bool {
		self.kind.ends_with("List")
	}
}

impl fmt::Display for Gvk {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.api_version(), self.kind)
	}
}

/// `default` and a missing namespace are the same namespace.
pub fn normalize_namespace(namespace: Option<&str>) -> Option<String> {
	match namespace {
		None | Some("" | "default") => None,
		Some(ns) => Some(ns.to_string()),
	}
}

/// Full identity of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
	pub gvk: Gvk,
	pub name: String,
	/// Normalized: `None` for both a missing and the `default` namespace.
	pub namespace: Option<String>,
}

impl ResourceId {
	pub fn new(gvk: Gvk, name: impl Into<String>, namespace: Option<&str>) -> Self {
		Self {
			gvk,
			name: name.into(),
			namespace: normalize_namespace(namespace),
		}
	}

	pub fn minimal(&self) -> MinimalDocument {
		MinimalDocument {
			kind: self.gvk.kind.clone(),
			name: self.name.clone(),
			namespace: self.namespace.clone(),
		}
	}
}

impl fmt::Display for ResourceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.namespace {
			Some(ns) => write!(f, "{}/{}/{}", ns, self.gvk, self.name),
			None => write!(f, "{}/{}", self.gvk, self.name),
		}
	}
}

/// The `{kind, metadata: {name, namespace}}` view of a document.
///
/// Used for matching resources across trees without knowing their schema. The
/// zero value (empty kind) means "not a Kubernetes resource".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MinimalDocument {
	pub kind: String,
	#[serde(default)]
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub namespace: Option<String>,
}

impl MinimalDocument {
	pub fn from_value(value: &Value) -> Self {
		let metadata = value.get("metadata");
		let field = |v: Option<&Value>, key: &str| {
			v.and_then(|v| v.get(key))
				.and_then(Value::as_str)
				.unwrap_or_default()
				.to_string()
		};
		Self {
			kind: field(Some(value), "kind"),
			name: field(metadata, "name"),
			namespace: normalize_namespace(
				metadata
					.and_then(|m| m.get("namespace"))
					.and_then(Value::as_str),
			),
		}
	}

	pub fn is_list(&self) -> bool {
		self.kind.ends_with("List")
	}

	/// A kind, and either a name or a list kind.
	pub fn is_kubernetes(&self) -> bool {
		!self.kind.is_empty() && (!self.name.is_empty() || self.is_list())
	}

	/// File stem for this document when it is written to its own file.
	///
	/// `{Kind}-{name}`, suffixed with `-{namespace}` outside the default
	/// namespace; `{Kind}-{index}` when the document has no name.
	pub fn file_stem(&self, index: usize) -> String {
		if self.name.is_empty() {
			return format!("{}-{}", self.kind, index);
		}
		match &self.namespace {
			Some(ns) => format!("{}-{}-{}", self.kind, self.name, ns),
			None => format!("{}-{}", self.kind, self.name),
		}
	}
}

impl fmt::Display for MinimalDocument {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.namespace {
			Some(ns) => write!(f, "{}/{}/{}", ns, self.kind, self.name),
			None => write!(f, "{}/{}", self.kind, self.name),
		}
	}
}

/// A decoded resource: its identity plus the full document body.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
	id: ResourceId,
	root: Map<String, Value>,
}

impl Resource {
	pub fn from_value(value: Value) -> Result<Self, CodecError> {
		let Value::Object(root) = value else {
			return Err(CodecError::NotAMapping);
		};
		let api_version = root.get("apiVersion").and_then(Value::as_str);
		let kind = root.get("kind").and_then(Value::as_str);
		let (Some(api_version), Some(kind)) = (api_version, kind) else {
			return Err(CodecError::MissingApiVersionOrKind);
		};
		if api_version.is_empty() || kind.is_empty() {
			return Err(CodecError::MissingApiVersionOrKind);
		}
		let metadata = root.get("metadata");
		let name = metadata
			.and_then(|m| m.get("name"))
			.and_then(Value::as_str)
			.filter(|n| !n.is_empty())
			.ok_or(CodecError::MissingName)?;
		let namespace = metadata
			.and_then(|m| m.get("namespace"))
			.and_then(Value::as_str);

		let id = ResourceId::new(Gvk::from_api_version(api_version, kind), name, namespace);
		Ok(Self { id, root })
	}

	pub fn id(&self) -> &ResourceId {
		&self.id
	}

	pub fn gvk(&self) -> &Gvk {
		&self.id.gvk
	}

	pub fn root(&self) -> &Map<String, Value> {
		&self.root
	}

	/// Mutable access to the body. Identity fields must not be changed
	/// through this.
	pub fn root_mut(&mut self) -> &mut Map<String, Value> {
		&mut self.root
	}

	pub fn into_value(self) -> Value {
		Value::Object(self.root)
	}

	/// Fail unless the kind is one of the built-in Kubernetes types.
	pub fn ensure_known(&self) -> Result<(), CodecError> {
		registry::resolve(self.gvk())
	}

	pub fn to_yaml(&self) -> Result<String, CodecError> {
		yaml::to_yaml(&Value::Object(self.root.clone())).map_err(CodecError::Serialize)
	}
}

/// A document whose shape is either a known resource or anything else.
///
/// Unknown shapes are carried verbatim so they round-trip exactly.
#[derive(Debug, Clone, PartialEq)]
pub enum Manifest {
	Known(Resource),
	Unknown(Value),
}

impl Manifest {
	pub fn from_value(value: Value) -> Self {
		match Resource::from_value(value.clone()) {
			Ok(resource) => Self::Known(resource),
			Err(_) => Self::Unknown(value),
		}
	}

	pub fn into_value(self) -> Value {
		match self {
			Self::Known(resource) => resource.into_value(),
			Self::Unknown(value) => value,
		}
	}

	pub fn to_yaml(&self) -> Result<String, CodecError> {
		match self {
			Self::Known(resource) => resource.to_yaml(),
			Self::Unknown(value) => yaml::to_yaml(value).map_err(CodecError::Serialize),
		}
	}
}

/// Typed view of a `*List` document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDocument {
	#[serde(default)]
	pub api_version: String,
	pub kind: String,
	#[serde(default)]
	pub items: Vec<Value>,
}

fn as_text(bytes: &[u8]) -> Result<&str, CodecError> {
	std::str::from_utf8(bytes).map_err(CodecError::Utf8)
}

/// Decode every non-empty document of a YAML (or JSON) stream.
pub fn decode_stream(bytes: &[u8]) -> Result<Vec<Value>, CodecError> {
	let text = as_text(bytes)?;
	let mut docs = Vec::new();
	for document in serde_yaml::Deserializer::from_str(text) {
		let value = Value::deserialize(document).map_err(CodecError::Yaml)?;
		if !value.is_null() {
			docs.push(value);
		}
	}
	Ok(docs)
}

fn decode_single(bytes: &[u8]) -> Result<Value, CodecError> {
	let mut docs = decode_stream(bytes)?;
	if docs.len() != 1 {
		return Err(CodecError::DocumentCount(docs.len()));
	}
	Ok(docs.remove(0))
}

/// Decode exactly one document into a resource.
pub fn decode(bytes: &[u8]) -> Result<Resource, CodecError> {
	Resource::from_value(decode_single(bytes)?)
}

/// Decode exactly one document, keeping unknown shapes as-is.
pub fn decode_manifest(bytes: &[u8]) -> Result<Manifest, CodecError> {
	Ok(Manifest::from_value(decode_single(bytes)?))
}

/// Decode the identity of the first document. Never fails: unparseable input
/// yields the zero value.
pub fn decode_minimal(bytes: &[u8]) -> MinimalDocument {
	decode_stream(bytes)
		.ok()
		.and_then(|docs| docs.into_iter().next())
		.map(|doc| MinimalDocument::from_value(&doc))
		.unwrap_or_default()
}

/// Decode a `*List` document.
pub fn decode_list(bytes: &[u8]) -> Result<ListDocument, CodecError> {
	let list: ListDocument =
		serde_json::from_value(decode_single(bytes)?).map_err(|_| CodecError::NotAMapping)?;
	if !list.kind.ends_with("List") {
		return Err(CodecError::NotAList { kind: list.kind });
	}
	Ok(list)
}

/// Whether the bytes hold exactly one document with a kind and either a name
/// or a list kind.
pub fn is_kubernetes_yaml(bytes: &[u8]) -> bool {
	decode_single(bytes)
		.map(|doc| MinimalDocument::from_value(&doc).is_kubernetes())
		.unwrap_or(false)
}

/// Whether the document only has `apiVersion`, `kind` and `metadata` at the
/// top level. A patch for which this holds changes nothing.
pub fn contains_only_identity_keys(bytes: &[u8]) -> Result<bool, CodecError> {
	let Value::Object(doc) = decode_single(bytes)? else {
		return Err(CodecError::NotAMapping);
	};
	Ok(doc.keys().all(|key| IDENTITY_KEYS.contains(&key.as_str())))
}
