//! Shared Kubernetes document utilities for ship.
//!
//! Everything in here works on plain YAML/JSON documents and never talks to a
//! cluster: decoding manifests into identities, the registry of built-in
//! types and their merge keys, strategic merge patches, and YAML stream
//! helpers.

pub mod registry;
pub mod resource;
pub mod strategic;
pub mod yaml;

pub use resource::{
	contains_only_identity_keys, decode, decode_list, decode_manifest, decode_minimal,
	decode_stream, is_kubernetes_yaml, CodecError, Gvk, ListDocument, Manifest, MinimalDocument,
	Resource, ResourceId,
};
pub use strategic::{apply_strategic_merge_patch, create_two_way_merge_patch, merge_patches, MergeError};
