//! YAML stream helpers.
//!
//! Manifests are written with keys sorted the way go-yaml sorts map keys, so
//! files produced by ship diff cleanly against files produced by kustomize.

use std::cmp::Ordering;

use serde_json::Value as JsonValue;

/// Separator between documents in a multi-document stream.
pub const DOCUMENT_SEPARATOR: &str = "\n---\n";

/// Split a multi-document YAML stream on `\n---\n`.
///
/// A leading `---` line and a trailing `---` are tolerated. Documents that only
/// hold whitespace or comments are dropped.
///
/// A `---` line inside a block scalar is indistinguishable from a real
/// separator and splits the stream there.
pub fn split_documents(stream: &str) -> Vec<&str> {
	let stream = stream.strip_prefix("---\n").unwrap_or(stream);
	stream
		.split(DOCUMENT_SEPARATOR)
		.map(|doc| doc.strip_suffix("\n---").unwrap_or(doc))
		.filter(|doc| !is_blank_document(doc))
		.collect()
}

/// Whether a document has no content besides whitespace, comments and separators.
pub fn is_blank_document(doc: &str) -> bool {
	doc.lines().all(|line| {
		let line = line.trim();
		line.is_empty() || line.starts_with('#') || line == "---"
	})
}

/// Normalize a raw document chunk for writing to its own file.
pub fn normalize_document(doc: &str) -> String {
	let mut out = doc.trim_start_matches('\n').trim_end().to_string();
	out.push('\n');
	out
}

/// Join documents into a stream, one `---` line between each.
pub fn join_documents<I, S>(docs: I) -> String
where
	I: IntoIterator<Item = S>,
	S: AsRef<str>,
{
	let mut out = String::new();
	for (idx, doc) in docs.into_iter().enumerate() {
		if idx > 0 {
			out.push_str("---\n");
		}
		out.push_str(doc.as_ref());
		if !out.ends_with('\n') {
			out.push('\n');
		}
	}
	out
}

/// Sort object keys recursively.
pub fn sort_json_keys(value: JsonValue) -> JsonValue {
	match value {
		JsonValue::Object(map) => {
			let mut entries: Vec<(String, JsonValue)> = map.into_iter().collect();
			entries.sort_by(|(a, _), (b, _)| natural_key_cmp(a, b));
			JsonValue::Object(
				entries
					.into_iter()
					.map(|(k, v)| (k, sort_json_keys(v)))
					.collect(),
			)
		}
		JsonValue::Array(items) => JsonValue::Array(items.into_iter().map(sort_json_keys).collect()),
		other => other,
	}
}

/// Natural key order: runs of ASCII digits compare numerically, everything
/// else compares by character.
fn natural_key_cmp(a: &str, b: &str) -> Ordering {
	let (mut a, mut b) = (a.as_bytes(), b.as_bytes());
	loop {
		match (a.first(), b.first()) {
			(None, None) => return Ordering::Equal,
			(None, Some(_)) => return Ordering::Less,
			(Some(_), None) => return Ordering::Greater,
			(Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
				let a_len = a.iter().take_while(|c| c.is_ascii_digit()).count();
				let b_len = b.iter().take_while(|c| c.is_ascii_digit()).count();
				let (a_run, b_run) = (&a[..a_len], &b[..b_len]);
				let a_trim = trim_leading_zeros(a_run);
				let b_trim = trim_leading_zeros(b_run);
				let ord = a_trim
					.len()
					.cmp(&b_trim.len())
					.then_with(|| a_trim.cmp(b_trim))
					.then_with(|| a_len.cmp(&b_len));
				if ord != Ordering::Equal {
					return ord;
				}
				a = &a[a_len..];
				b = &b[b_len..];
			}
			(Some(x), Some(y)) => {
				if x != y {
					return x.cmp(y);
				}
				a = &a[1..];
				b = &b[1..];
			}
		}
	}
}

fn trim_leading_zeros(run: &[u8]) -> &[u8] {
	let zeros = run.iter().take_while(|c| **c == b'0').count();
	&run[zeros.min(run.len().saturating_sub(1))..]
}

/// Serialize a JSON value to YAML with sorted keys.
pub fn to_yaml(value: &JsonValue) -> Result<String, serde_yaml::Error> {
	serde_yaml::to_string(&sort_json_keys(value.clone()))
}

#[cfg(test)]
mod tests {
	use indoc::indoc;
	use rstest::rstest;
	use serde_json::json;

	use super::*;

	#[test]
	fn test_split_documents() {
		let stream = indoc! {"
			---
			kind: A
			---
			# only a comment
			---
			kind: B
			---
		"};
		assert_eq!(split_documents(stream), vec!["kind: A", "kind: B"]);
	}

	#[test]
	fn test_split_single_document() {
		assert_eq!(split_documents("kind: A\n"), vec!["kind: A\n"]);
	}

	#[test]
	fn test_join_then_split_is_stable() {
		let docs = vec!["kind: A\n".to_string(), "kind: B\n".to_string()];
		let joined = join_documents(&docs);
		assert_eq!(joined, "kind: A\n---\nkind: B\n");
		let resplit: Vec<String> = split_documents(&joined)
			.into_iter()
			.map(normalize_document)
			.collect();
		assert_eq!(resplit, docs);
	}

	#[rstest]
	#[case("a", "b", Ordering::Less)]
	#[case("item2", "item10", Ordering::Less)]
	#[case("item10", "item10", Ordering::Equal)]
	#[case("apiVersion", "kind", Ordering::Less)]
	#[case("kind", "metadata", Ordering::Less)]
	fn test_natural_key_cmp(#[case] a: &str, #[case] b: &str, #[case] expected: Ordering) {
		assert_eq!(natural_key_cmp(a, b), expected);
	}

	#[test]
	fn test_to_yaml_sorts_keys() {
		let value = json!({
			"metadata": { "name": "web" },
			"kind": "Service",
			"apiVersion": "v1",
		});
		assert_eq!(
			to_yaml(&value).unwrap(),
			"apiVersion: v1\nkind: Service\nmetadata:\n  name: web\n"
		);
	}
}
