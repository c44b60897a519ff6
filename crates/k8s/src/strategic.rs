//! Strategic merge patches.
//!
//! Maps merge recursively and lists of objects with a merge key merge
//! element by element; every other list is replaced as a whole. Patches use
//! the usual directives: `null` deletes a key, `$patch: delete` removes a
//! keyed list element or a whole map, `$patch: replace` replaces a map, and
//! `$setElementOrder/<field>` fixes the order of a keyed list.

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::instrument;

use crate::{
	registry,
	resource::{CodecError, Resource},
};

const PATCH_DIRECTIVE: &str = "$patch";
const SET_ELEMENT_ORDER_PREFIX: &str = "$setElementOrder/";

/// Errors that can occur while computing, applying or merging patches.
#[derive(Debug, Error)]
pub enum MergeError {
	#[error("{left} and {right} are different kinds of resource")]
	KindMismatch { left: String, right: String },

	#[error("unsupported patch directive `{0}`")]
	UnknownDirective(String),

	#[error(transparent)]
	Codec(#[from] CodecError),
}

/// List merge behavior for one document kind.
struct Schema<'a> {
	kind: &'a str,
}

impl Schema<'_> {
	fn merge_key(&self, path: &[String]) -> Option<&'static str> {
		let path: Vec<&str> = path.iter().map(String::as_str).collect();
		registry::merge_key(self.kind, &path)
	}
}

fn ensure_same_kind(left: &Resource, right: &Resource) -> Result<(), MergeError> {
	if left.gvk() != right.gvk() {
		return Err(MergeError::KindMismatch {
			left: left.id().to_string(),
			right: right.id().to_string(),
		});
	}
	Ok(())
}

/// Compute the patch that turns `original` into `modified`.
///
/// The patch carries `apiVersion`, `kind` and `metadata.name`/`namespace` of
/// the original so it can be applied on its own.
#[instrument(skip_all, fields(resource = %original.id()))]
pub fn create_two_way_merge_patch(
	original: &Resource,
	modified: &Resource,
) -> Result<Map<String, Value>, MergeError> {
	ensure_same_kind(original, modified)?;
	original.ensure_known()?;

	let schema = Schema {
		kind: &original.gvk().kind,
	};
	let mut diff = diff_maps(&schema, &mut Vec::new(), original.root(), modified.root());

	let mut metadata = match diff.remove("metadata") {
		Some(Value::Object(metadata)) => metadata,
		_ => Map::new(),
	};
	let original_metadata = original.root().get("metadata");
	for key in ["name", "namespace"] {
		if let Some(value) = original_metadata.and_then(|m| m.get(key)) {
			metadata.insert(key.to_string(), value.clone());
		}
	}

	let mut patch = Map::new();
	for key in ["apiVersion", "kind"] {
		if let Some(value) = original.root().get(key) {
			patch.insert(key.to_string(), value.clone());
		}
	}
	patch.insert("metadata".to_string(), Value::Object(metadata));
	patch.extend(diff);
	Ok(patch)
}

fn diff_maps(
	schema: &Schema<'_>,
	path: &mut Vec<String>,
	original: &Map<String, Value>,
	modified: &Map<String, Value>,
) -> Map<String, Value> {
	let mut patch = Map::new();
	for (key, before) in original {
		let Some(after) = modified.get(key) else {
			patch.insert(key.clone(), Value::Null);
			continue;
		};
		if before == after {
			continue;
		}
		path.push(key.clone());
		match (before, after) {
			(Value::Object(before), Value::Object(after)) => {
				let nested = diff_maps(schema, path, before, after);
				if !nested.is_empty() {
					patch.insert(key.clone(), Value::Object(nested));
				}
			}
			(Value::Array(before), Value::Array(after)) => {
				match schema
					.merge_key(path)
					.filter(|mk| all_keyed(before, mk) && all_keyed(after, mk))
				{
					Some(merge_key) => {
						let (items, order) = diff_keyed_list(schema, path, merge_key, before, after);
						if !items.is_empty() {
							patch.insert(key.clone(), Value::Array(items));
						}
						patch.insert(format!("{SET_ELEMENT_ORDER_PREFIX}{key}"), Value::Array(order));
					}
					None => {
						patch.insert(key.clone(), Value::Array(after.clone()));
					}
				}
			}
			_ => {
				patch.insert(key.clone(), after.clone());
			}
		}
		path.pop();
	}
	for (key, after) in modified {
		if !original.contains_key(key) {
			patch.insert(key.clone(), after.clone());
		}
	}
	patch
}

fn all_keyed(items: &[Value], merge_key: &str) -> bool {
	items
		.iter()
		.all(|item| item.get(merge_key).is_some_and(|k| !k.is_null()))
}

fn key_of<'v>(item: &'v Value, merge_key: &str) -> Option<&'v Value> {
	item.get(merge_key)
}

fn key_map(merge_key: &str, value: &Value) -> Value {
	let mut entry = Map::new();
	entry.insert(merge_key.to_string(), value.clone());
	Value::Object(entry)
}

/// Diff two lists that merge by `merge_key`. Returns the patch elements and
/// the element order of `after`.
fn diff_keyed_list(
	schema: &Schema<'_>,
	path: &mut Vec<String>,
	merge_key: &str,
	before: &[Value],
	after: &[Value],
) -> (Vec<Value>, Vec<Value>) {
	let mut claimed = vec![false; before.len()];
	let mut items = Vec::new();
	let mut order = Vec::with_capacity(after.len());

	for item in after {
		let key = key_of(item, merge_key);
		if let Some(key) = key {
			order.push(key_map(merge_key, key));
		}
		let matched = before
			.iter()
			.enumerate()
			.position(|(idx, old)| !claimed[idx] && key_of(old, merge_key) == key);
		match (matched, item) {
			(Some(idx), Value::Object(new)) => {
				claimed[idx] = true;
				let Value::Object(old) = &before[idx] else {
					continue;
				};
				let mut nested = diff_maps(schema, path, old, new);
				if !nested.is_empty() {
					if let Some(key) = key {
						nested.insert(merge_key.to_string(), key.clone());
					}
					items.push(Value::Object(nested));
				}
			}
			_ => items.push(item.clone()),
		}
	}

	for (idx, old) in before.iter().enumerate() {
		if claimed[idx] {
			continue;
		}
		if let Some(key) = key_of(old, merge_key) {
			let mut removal = Map::new();
			removal.insert(merge_key.to_string(), key.clone());
			removal.insert(PATCH_DIRECTIVE.to_string(), Value::String("delete".into()));
			items.push(Value::Object(removal));
		}
	}

	(items, order)
}

/// Apply a strategic merge patch to `base` in place.
///
/// The patch's name and namespace select the target and are never copied
/// onto it.
#[instrument(skip_all, fields(resource = %base.id()))]
pub fn apply_strategic_merge_patch(base: &mut Resource, patch: &Resource) -> Result<(), MergeError> {
	ensure_same_kind(base, patch)?;
	let mut patch_root = patch.root().clone();
	if let Some(Value::Object(metadata)) = patch_root.get_mut("metadata") {
		metadata.remove("name");
		metadata.remove("namespace");
	}
	let kind = base.gvk().kind.clone();
	let schema = Schema { kind: &kind };
	apply_map(&schema, &mut Vec::new(), base.root_mut(), patch_root)?;
	Ok(())
}

/// Returns `false` when the map itself was deleted by a `$patch: delete`.
fn apply_map(
	schema: &Schema<'_>,
	path: &mut Vec<String>,
	base: &mut Map<String, Value>,
	mut patch: Map<String, Value>,
) -> Result<bool, MergeError> {
	match take_directive(&mut patch)?.as_deref() {
		Some("delete") => {
			base.clear();
			return Ok(false);
		}
		Some("replace") => {
			*base = strip_directives_map(patch);
			return Ok(true);
		}
		_ => {}
	}

	let mut orders = Vec::new();
	for (key, value) in patch {
		if let Some(field) = key.strip_prefix(SET_ELEMENT_ORDER_PREFIX) {
			orders.push((field.to_string(), value));
			continue;
		}
		if value.is_null() {
			base.remove(&key);
			continue;
		}
		path.push(key.clone());
		match base.get_mut(&key) {
			Some(existing) => {
				if !apply_value(schema, path, existing, value)? {
					base.remove(&key);
				}
			}
			None => {
				if let Some(value) = strip_directives(value) {
					base.insert(key.clone(), value);
				}
			}
		}
		path.pop();
	}

	for (field, order) in orders {
		path.push(field.clone());
		let merge_key = schema.merge_key(path);
		path.pop();
		if let (Some(merge_key), Some(Value::Array(items)), Value::Array(order)) =
			(merge_key, base.get_mut(&field), order)
		{
			reorder(items, merge_key, &order);
		}
	}
	Ok(true)
}

fn apply_value(
	schema: &Schema<'_>,
	path: &mut Vec<String>,
	base: &mut Value,
	patch: Value,
) -> Result<bool, MergeError> {
	match (base, patch) {
		(Value::Object(base), Value::Object(patch)) => apply_map(schema, path, base, patch),
		(Value::Array(base), Value::Array(patch)) => {
			match schema.merge_key(path) {
				Some(merge_key) if all_keyed(base, merge_key) => {
					apply_keyed_list(schema, path, merge_key, base, patch)?;
				}
				_ => {
					*base = patch.into_iter().filter_map(strip_directives).collect();
				}
			}
			Ok(true)
		}
		(base, patch) => {
			match strip_directives(patch) {
				Some(patch) => *base = patch,
				None => return Ok(false),
			}
			Ok(true)
		}
	}
}

fn apply_keyed_list(
	schema: &Schema<'_>,
	path: &mut Vec<String>,
	merge_key: &str,
	base: &mut Vec<Value>,
	patch: Vec<Value>,
) -> Result<(), MergeError> {
	for item in patch {
		let position = key_of(&item, merge_key)
			.and_then(|key| base.iter().position(|b| key_of(b, merge_key) == Some(key)));
		match (position, item) {
			(Some(pos), Value::Object(patch_item)) => {
				let Value::Object(existing) = &mut base[pos] else {
					continue;
				};
				if !apply_map(schema, path, existing, patch_item)? {
					base.remove(pos);
				}
			}
			(Some(pos), other) => base[pos] = other,
			(None, item) => {
				if is_delete_directive(&item) {
					continue;
				}
				if let Some(item) = strip_directives(item) {
					base.push(item);
				}
			}
		}
	}
	Ok(())
}

/// Order `items` by `order`; items not named there keep their relative order
/// after the named ones.
fn reorder(items: &mut Vec<Value>, merge_key: &str, order: &[Value]) {
	let mut remaining: Vec<Option<Value>> = items.drain(..).map(Some).collect();
	for entry in order {
		let Some(key) = key_of(entry, merge_key) else {
			continue;
		};
		let found = remaining
			.iter_mut()
			.find(|slot| matches!(slot, Some(item) if key_of(item, merge_key) == Some(key)));
		if let Some(item) = found.and_then(Option::take) {
			items.push(item);
		}
	}
	items.extend(remaining.into_iter().flatten());
}

fn take_directive(map: &mut Map<String, Value>) -> Result<Option<String>, MergeError> {
	match map.remove(PATCH_DIRECTIVE) {
		None => Ok(None),
		Some(Value::String(directive)) => match directive.as_str() {
			"delete" | "replace" | "merge" => Ok(Some(directive)),
			_ => Err(MergeError::UnknownDirective(directive)),
		},
		Some(other) => Err(MergeError::UnknownDirective(other.to_string())),
	}
}

fn is_delete_directive(value: &Value) -> bool {
	value.get(PATCH_DIRECTIVE).and_then(Value::as_str) == Some("delete")
}

/// Turn patch content into plain document content: drop nulls, directives
/// and deleted elements. `None` if nothing is left of a deleted map.
fn strip_directives(value: Value) -> Option<Value> {
	match value {
		Value::Null => None,
		Value::Object(map) => {
			if map.get(PATCH_DIRECTIVE).and_then(Value::as_str) == Some("delete") {
				return None;
			}
			Some(Value::Object(strip_directives_map(map)))
		}
		Value::Array(items) => Some(Value::Array(
			items.into_iter().filter_map(strip_directives).collect(),
		)),
		other => Some(other),
	}
}

fn strip_directives_map(map: Map<String, Value>) -> Map<String, Value> {
	map.into_iter()
		.filter(|(key, _)| key != PATCH_DIRECTIVE && !key.starts_with(SET_ELEMENT_ORDER_PREFIX))
		.filter_map(|(key, value)| strip_directives(value).map(|value| (key, value)))
		.collect()
}

/// Combine two patches for the same resource into one that has the effect of
/// applying `current` and then `new`.
#[instrument(skip_all, fields(resource = %current.id()))]
pub fn merge_patches(current: &Resource, new: &Resource) -> Result<Map<String, Value>, MergeError> {
	ensure_same_kind(current, new)?;
	let schema = Schema {
		kind: &current.gvk().kind,
	};
	let mut merged = current.root().clone();
	let mut incoming = new.root().clone();
	// The target is fixed by `current`.
	if let Some(Value::Object(metadata)) = incoming.get_mut("metadata") {
		metadata.remove("name");
		metadata.remove("namespace");
	}
	merge_patch_maps(&schema, &mut Vec::new(), &mut merged, incoming);
	Ok(merged)
}

fn merge_patch_maps(
	schema: &Schema<'_>,
	path: &mut Vec<String>,
	current: &mut Map<String, Value>,
	new: Map<String, Value>,
) {
	if new.contains_key(PATCH_DIRECTIVE) {
		*current = new;
		return;
	}
	for (key, value) in new {
		if key.starts_with(SET_ELEMENT_ORDER_PREFIX) {
			current.insert(key, value);
			continue;
		}
		path.push(key.clone());
		match value {
			Value::Object(mut incoming) => match current.get_mut(&key) {
				Some(Value::Object(existing)) => merge_patch_maps(schema, path, existing, incoming),
				Some(Value::Null) => {
					// The key was deleted by `current`; start over from scratch.
					incoming.insert(PATCH_DIRECTIVE.to_string(), Value::String("replace".into()));
					current.insert(key.clone(), Value::Object(incoming));
				}
				_ => {
					current.insert(key.clone(), Value::Object(incoming));
				}
			},
			Value::Array(incoming) => match current.get_mut(&key) {
				Some(Value::Array(existing)) => match schema.merge_key(path) {
					Some(merge_key) if all_keyed(existing, merge_key) && all_keyed(&incoming, merge_key) => {
						merge_patch_lists(schema, path, merge_key, existing, incoming);
					}
					_ => *existing = incoming,
				},
				_ => {
					current.insert(key.clone(), Value::Array(incoming));
				}
			},
			value => {
				current.insert(key.clone(), value);
			}
		}
		path.pop();
	}
}

fn merge_patch_lists(
	schema: &Schema<'_>,
	path: &mut Vec<String>,
	merge_key: &str,
	current: &mut Vec<Value>,
	new: Vec<Value>,
) {
	for item in new {
		let position = key_of(&item, merge_key)
			.and_then(|key| current.iter().position(|c| key_of(c, merge_key) == Some(key)));
		let Some(pos) = position else {
			current.push(item);
			continue;
		};
		let replace = is_delete_directive(&item) || is_delete_directive(&current[pos]);
		match (&mut current[pos], item) {
			(Value::Object(existing), Value::Object(incoming)) if !replace => {
				merge_patch_maps(schema, path, existing, incoming);
			}
			(slot, item) => *slot = item,
		}
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use indoc::indoc;
	use serde_json::json;

	use super::*;
	use crate::resource::decode;

	fn resource(yaml: &str) -> Resource {
		decode(yaml.as_bytes()).unwrap()
	}

	fn patch_resource(patch: Map<String, Value>) -> Resource {
		Resource::from_value(Value::Object(patch)).unwrap()
	}

	const DEPLOYMENT: &str = indoc! {"
		apiVersion: apps/v1
		kind: Deployment
		metadata:
		  name: web
		  labels:
		    app: web
		spec:
		  replicas: 1
		  template:
		    spec:
		      containers:
		      - name: app
		        image: app:1
		        env:
		        - name: A
		          value: a
		        - name: B
		          value: b
		      - name: sidecar
		        image: sidecar:1
		      tolerations:
		      - key: x
	"};

	fn assert_round_trip(original: &str, modified: &str) {
		let original = resource(original);
		let modified = resource(modified);
		let patch = create_two_way_merge_patch(&original, &modified).unwrap();
		let mut applied = original.clone();
		apply_strategic_merge_patch(&mut applied, &patch_resource(patch)).unwrap();
		assert_eq!(applied.into_value(), modified.into_value());
	}

	#[test]
	fn test_identical_documents_only_carry_identity() {
		let original = resource(DEPLOYMENT);
		let patch = create_two_way_merge_patch(&original, &original).unwrap();
		assert_eq!(
			Value::Object(patch),
			json!({
				"apiVersion": "apps/v1",
				"kind": "Deployment",
				"metadata": { "name": "web" },
			})
		);
	}

	#[test]
	fn test_added_label_only() {
		let original = resource(DEPLOYMENT);
		let modified = resource(&DEPLOYMENT.replace("    app: web\n", "    app: web\n    tier: frontend\n"));
		let patch = create_two_way_merge_patch(&original, &modified).unwrap();
		assert_eq!(
			Value::Object(patch),
			json!({
				"apiVersion": "apps/v1",
				"kind": "Deployment",
				"metadata": { "labels": { "tier": "frontend" }, "name": "web" },
			})
		);
	}

	#[test]
	fn test_container_patch_is_keyed_by_name() {
		let original = resource(DEPLOYMENT);
		let modified = resource(&DEPLOYMENT.replace("image: sidecar:1", "image: sidecar:2"));
		let patch = create_two_way_merge_patch(&original, &modified).unwrap();
		assert_eq!(
			patch["spec"],
			json!({
				"template": {
					"spec": {
						"containers": [{ "image": "sidecar:2", "name": "sidecar" }],
						"$setElementOrder/containers": [{ "name": "app" }, { "name": "sidecar" }],
					}
				}
			})
		);
	}

	#[test]
	fn test_removed_container_becomes_delete_directive() {
		let original = resource(DEPLOYMENT);
		let modified = resource(&DEPLOYMENT.replace("      - name: sidecar\n        image: sidecar:1\n", ""));
		let patch = create_two_way_merge_patch(&original, &modified).unwrap();
		assert_eq!(
			patch["spec"]["template"]["spec"]["containers"],
			json!([{ "name": "sidecar", "$patch": "delete" }])
		);
	}

	#[test]
	fn test_removed_key_becomes_null() {
		let original = resource(DEPLOYMENT);
		let modified = resource(&DEPLOYMENT.replace("  replicas: 1\n", ""));
		let patch = create_two_way_merge_patch(&original, &modified).unwrap();
		assert_eq!(patch["spec"], json!({ "replicas": null }));
	}

	#[test]
	fn test_round_trip() {
		assert_round_trip(DEPLOYMENT, &DEPLOYMENT.replace("replicas: 1", "replicas: 3"));
		assert_round_trip(DEPLOYMENT, &DEPLOYMENT.replace("value: b", "value: changed"));
		assert_round_trip(DEPLOYMENT, &DEPLOYMENT.replace("      tolerations:\n      - key: x\n", ""));
		assert_round_trip(
			DEPLOYMENT,
			&DEPLOYMENT.replace("      - name: sidecar\n        image: sidecar:1\n", ""),
		);
		assert_round_trip(
			DEPLOYMENT,
			&DEPLOYMENT.replace(
				"      tolerations:\n",
				"      - name: third\n        image: third:1\n      tolerations:\n",
			),
		);
	}

	#[test]
	fn test_round_trip_reordered_containers() {
		let reordered = indoc! {"
			apiVersion: apps/v1
			kind: Deployment
			metadata:
			  name: web
			  labels:
			    app: web
			spec:
			  replicas: 1
			  template:
			    spec:
			      containers:
			      - name: sidecar
			        image: sidecar:1
			      - name: app
			        image: app:1
			        env:
			        - name: A
			          value: a
			        - name: B
			          value: b
			      tolerations:
			      - key: x
		"};
		assert_round_trip(DEPLOYMENT, reordered);
	}

	#[test]
	fn test_kind_mismatch() {
		let deployment = resource(DEPLOYMENT);
		let service = resource("apiVersion: v1\nkind: Service\nmetadata:\n  name: web\n");
		assert_matches!(
			create_two_way_merge_patch(&deployment, &service),
			Err(MergeError::KindMismatch { .. })
		);
	}

	#[test]
	fn test_unknown_kind() {
		let widget = resource("apiVersion: example.com/v1\nkind: Widget\nmetadata:\n  name: w\n");
		assert_matches!(
			create_two_way_merge_patch(&widget, &widget),
			Err(MergeError::Codec(CodecError::UnknownKind { .. }))
		);
	}

	#[test]
	fn test_merge_patches() {
		let current = resource(indoc! {"
			apiVersion: apps/v1
			kind: Deployment
			metadata:
			  name: web
			spec:
			  replicas: 2
			  template:
			    spec:
			      containers:
			      - name: app
			        image: app:2
		"});
		let new = resource(indoc! {"
			apiVersion: apps/v1
			kind: Deployment
			metadata:
			  name: web
			  labels:
			    team: a
			spec:
			  template:
			    spec:
			      containers:
			      - name: app
			        imagePullPolicy: Always
			      - name: sidecar
			        image: sidecar:1
		"});
		let merged = merge_patches(&current, &new).unwrap();
		assert_eq!(
			Value::Object(merged),
			json!({
				"apiVersion": "apps/v1",
				"kind": "Deployment",
				"metadata": { "name": "web", "labels": { "team": "a" } },
				"spec": {
					"replicas": 2,
					"template": {
						"spec": {
							"containers": [
								{ "name": "app", "image": "app:2", "imagePullPolicy": "Always" },
								{ "name": "sidecar", "image": "sidecar:1" },
							]
						}
					}
				}
			})
		);
	}

	#[test]
	fn test_merged_patch_matches_sequential_application() {
		let base = resource(DEPLOYMENT);
		let first = resource(&DEPLOYMENT.replace("replicas: 1", "replicas: 2"));
		let second = resource(&DEPLOYMENT.replace("image: app:1", "image: app:2"));
		let p1 = patch_resource(create_two_way_merge_patch(&base, &first).unwrap());
		let p2 = patch_resource(create_two_way_merge_patch(&base, &second).unwrap());

		let mut sequential = base.clone();
		apply_strategic_merge_patch(&mut sequential, &p1).unwrap();
		apply_strategic_merge_patch(&mut sequential, &p2).unwrap();

		let merged = patch_resource(merge_patches(&p1, &p2).unwrap());
		let mut combined = base.clone();
		apply_strategic_merge_patch(&mut combined, &merged).unwrap();

		assert_eq!(combined, sequential);
	}

	#[test]
	fn test_merge_patches_kind_mismatch() {
		let deployment = resource(DEPLOYMENT);
		let service = resource("apiVersion: v1\nkind: Service\nmetadata:\n  name: web\n");
		assert_matches!(merge_patches(&deployment, &service), Err(MergeError::KindMismatch { .. }));
	}

	#[test]
	fn test_unknown_directive() {
		let mut base = resource(DEPLOYMENT);
		let patch = resource("apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  $patch: explode\n");
		assert_matches!(
			apply_strategic_merge_patch(&mut base, &patch),
			Err(MergeError::UnknownDirective(d)) if d == "explode"
		);
	}
}
