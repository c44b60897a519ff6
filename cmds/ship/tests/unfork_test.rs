//! Integration tests for the unforker.
//!
//! Each test lays out an upstream tree and a forked tree in a temp directory,
//! runs a full unfork through the public API and inspects what lands on disk.

use std::{
	cell::RefCell,
	fs,
	path::{Path, PathBuf},
	rc::Rc,
};

use assert_matches::assert_matches;
use indoc::indoc;
use serde_json::Value;
use ship::{
	collaborators::{CancellationToken, ChartCommands, CollaboratorError, ContentFetcher},
	kustomize::{Kustomization, KustomizeError},
	state::{FileStateManager, OverlayStore, StateManager},
	unfork::{UnforkConfig, UnforkError, Unforker, UpstreamSource},
};
use ship_k8s::decode_stream;
use tempfile::TempDir;

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
"};

const SERVICE: &str = indoc! {"
	apiVersion: v1
	kind: Service
	metadata:
	  name: web
	spec:
	  ports:
	  - port: 80
"};

const ANIMALS: &str = indoc! {"
	apiVersion: v1
	kind: List
	items:
	- apiVersion: v1
	  kind: ConfigMap
	  metadata:
	    name: cat
	  data:
	    sound: meow
	- apiVersion: v1
	  kind: ConfigMap
	  metadata:
	    name: dog
	  data:
	    sound: woof
"};

struct Workspace {
	temp: TempDir,
}

impl Workspace {
	fn new() -> Self {
		let temp = TempDir::new().unwrap();
		fs::create_dir_all(temp.path().join("base")).unwrap();
		fs::create_dir_all(temp.path().join("fork")).unwrap();
		Self { temp }
	}

	fn path(&self, relative: &str) -> PathBuf {
		self.temp.path().join(relative)
	}

	fn write(&self, relative: &str, content: &str) {
		let path = self.path(relative);
		fs::create_dir_all(path.parent().unwrap()).unwrap();
		fs::write(path, content).unwrap();
	}

	fn read(&self, relative: &str) -> String {
		fs::read_to_string(self.path(relative)).unwrap()
	}

	fn config(&self) -> UnforkConfig {
		UnforkConfig::new(self.path("base"), self.path("fork"), self.path("overlays/ship"))
	}

	fn state(&self) -> FileStateManager {
		FileStateManager::new(self.temp.path())
	}

	fn unforker(&self, config: UnforkConfig) -> Unforker {
		Unforker::new(config, Box::new(self.state()))
	}
}

fn documents(stream: &str) -> Vec<Value> {
	decode_stream(stream.as_bytes()).unwrap()
}

#[test]
fn test_unchanged_fork_gives_empty_overlay() {
	let ws = Workspace::new();
	for dir in ["base", "fork"] {
		ws.write(&format!("{dir}/deployment.yaml"), DEPLOYMENT);
		ws.write(&format!("{dir}/service.yaml"), SERVICE);
	}

	for _ in 0..2 {
		let mut unforker = ws.unforker(ws.config());
		let report = unforker.execute().unwrap();
		assert_eq!(report.patches, 0);
		assert_eq!(report.resources, 0);
		assert_eq!(report.excluded, 0);
	}

	let base = Kustomization::load(&ws.path("base")).unwrap();
	assert_eq!(base.resources, vec!["deployment.yaml", "service.yaml"]);
	let overlay = Kustomization::load(&ws.path("overlays/ship")).unwrap();
	assert_eq!(overlay.bases, vec!["../../base"]);
	assert!(overlay.patches_strategic_merge.is_empty());
}

#[test]
fn test_files_are_matched_by_identity_not_path() {
	let ws = Workspace::new();
	ws.write("base/deployment.yaml", DEPLOYMENT);
	ws.write("fork/apps/renamed.yaml", DEPLOYMENT);

	let mut unforker = ws.unforker(ws.config());
	unforker.execute().unwrap();
	assert!(unforker.overlay().patches.is_empty());
	assert!(unforker.overlay().resources.is_empty());
	assert!(unforker.overlay().excluded_bases.is_empty());
}

#[test]
fn test_label_only_change_becomes_label_only_patch() {
	let ws = Workspace::new();
	ws.write("base/deployment.yaml", DEPLOYMENT);
	ws.write(
		"fork/deployment.yaml",
		&DEPLOYMENT.replace("    app: web\n", "    app: web\n    team: payments\n"),
	);

	let mut unforker = ws.unforker(ws.config());
	unforker.execute().unwrap();

	let patch = &unforker.overlay().patches["/deployment.yaml"];
	assert_eq!(
		patch,
		indoc! {"
			apiVersion: apps/v1
			kind: Deployment
			metadata:
			  labels:
			    team: payments
			  name: web
		"}
	);
	assert_eq!(ws.read("overlays/ship/deployment.yaml"), *patch);
	let overlay = Kustomization::load(&ws.path("overlays/ship")).unwrap();
	assert_eq!(overlay.patches_strategic_merge, vec!["deployment.yaml"]);
}

#[test]
fn test_new_resource_is_never_a_patch() {
	let ws = Workspace::new();
	ws.write("base/deployment.yaml", DEPLOYMENT);
	ws.write("fork/deployment.yaml", DEPLOYMENT);
	ws.write("fork/service.yaml", SERVICE);

	let mut unforker = ws.unforker(ws.config());
	unforker.execute().unwrap();

	let overlay = unforker.overlay();
	assert!(overlay.patches.is_empty());
	assert_eq!(overlay.resources["/service.yaml"], SERVICE);
	assert_eq!(ws.read("overlays/ship/service.yaml"), SERVICE);
	assert_eq!(
		Kustomization::load(&ws.path("overlays/ship")).unwrap().resources,
		vec!["service.yaml"]
	);
}

#[test]
fn test_removed_resource_is_excluded_from_base() {
	let ws = Workspace::new();
	ws.write("base/deployment.yaml", DEPLOYMENT);
	ws.write("base/extra/service.yaml", SERVICE);
	ws.write("fork/deployment.yaml", DEPLOYMENT);

	let mut unforker = ws.unforker(ws.config());
	unforker.execute().unwrap();

	assert_eq!(unforker.overlay().excluded_bases, vec!["/extra/service.yaml"]);
	assert_eq!(
		Kustomization::load(&ws.path("base")).unwrap().resources,
		vec!["deployment.yaml"]
	);
	let stored = OverlayStore::new(&ws.state(), "ship").load().unwrap();
	assert_eq!(stored, *unforker.overlay());
}

#[test]
fn test_unknown_kinds_in_fork_are_skipped() {
	let ws = Workspace::new();
	ws.write("base/deployment.yaml", DEPLOYMENT);
	ws.write("fork/deployment.yaml", DEPLOYMENT);
	ws.write(
		"fork/widget.yaml",
		"apiVersion: example.com/v1\nkind: Widget\nmetadata:\n  name: w\n",
	);
	ws.write("fork/values.yaml", "replicas: 3\n");

	let mut unforker = ws.unforker(ws.config());
	unforker.execute().unwrap();
	assert!(unforker.overlay().resources.is_empty());
}

const WIDGET: &str = indoc! {"
	apiVersion: example.com/v1
	kind: Widget
	metadata:
	  name: w
"};

#[test]
fn test_unknown_kind_in_both_trees_stays_in_base() {
	let ws = Workspace::new();
	for dir in ["base", "fork"] {
		ws.write(&format!("{dir}/deployment.yaml"), DEPLOYMENT);
		ws.write(&format!("{dir}/widget.yaml"), WIDGET);
	}

	let mut config = ws.config();
	config.destination = Some(ws.path("rendered.yaml"));
	let mut unforker = ws.unforker(config);
	let report = unforker.execute().unwrap();

	assert_eq!(report.excluded, 0);
	assert!(unforker.overlay().excluded_bases.is_empty());
	assert_eq!(
		base_resources(&ws.path("base")),
		vec!["deployment.yaml", "widget.yaml"]
	);
	let rendered = documents(&ws.read("rendered.yaml"));
	assert!(rendered.iter().any(|d| d["kind"] == "Widget" && d["metadata"]["name"] == "w"));
}

#[test]
fn test_list_members_are_regrouped_in_order() {
	let ws = Workspace::new();
	ws.write("base/animals.yaml", ANIMALS);
	ws.write(
		"fork/animals.yaml",
		&ANIMALS
			.replace("sound: meow\n", "sound: meow\n    hi: hello\n")
			.replace("sound: woof\n", "sound: woof\n    bye: goodbye\n"),
	);

	let mut config = ws.config();
	config.destination = Some(ws.path("out/rendered.yaml"));
	let mut unforker = ws.unforker(config);
	let report = unforker.execute().unwrap();
	assert_eq!(report.patches, 2);
	assert_eq!(report.destination, Some(ws.path("out/rendered.yaml")));
	assert_eq!(unforker.lists().len(), 1);

	let rendered = documents(&ws.read("out/rendered.yaml"));
	assert_eq!(rendered.len(), 1);
	let list = &rendered[0];
	assert_eq!(list["apiVersion"], "v1");
	assert_eq!(list["kind"], "List");
	let items = list["items"].as_array().unwrap();
	assert_eq!(items.len(), 2);
	assert_eq!(items[0]["metadata"]["name"], "cat");
	assert_eq!(items[0]["data"]["hi"], "hello");
	assert_eq!(items[1]["metadata"]["name"], "dog");
	assert_eq!(items[1]["data"]["bye"], "goodbye");
}

#[test]
fn test_rerun_renders_the_same_lists() {
	let ws = Workspace::new();
	ws.write("base/animals.yaml", ANIMALS);
	let fork = ANIMALS.replace("sound: meow\n", "sound: meow\n    hi: hello\n");
	ws.write("fork/animals.yaml", &fork);

	let mut config = ws.config();
	config.destination = Some(ws.path("rendered.yaml"));
	let mut runs = Vec::new();
	for _ in 0..2 {
		ws.unforker(config.clone()).execute().unwrap();
		runs.push(ws.read("rendered.yaml"));
	}

	assert_eq!(runs[0], runs[1]);
	let rendered = documents(&runs[1]);
	assert_eq!(rendered.len(), 1);
	assert_eq!(rendered[0]["kind"], "List");
	// The fork is only ever split in a working copy
	assert_eq!(ws.read("fork/animals.yaml"), fork);
	assert!(!ws.path("fork/ConfigMap-cat.yaml").exists());
}

#[test]
fn test_base_lists_are_remembered_across_runs() {
	let ws = Workspace::new();
	ws.write("base/animals.yaml", ANIMALS);
	// The fork holds the members as standalone files
	for (name, sound) in [("cat", "meow"), ("dog", "woof")] {
		ws.write(
			&format!("fork/{name}.yaml"),
			&format!(
				"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\ndata:\n  sound: {sound}\n  extra: yes-{name}\n"
			),
		);
	}

	let mut config = ws.config();
	config.destination = Some(ws.path("rendered.yaml"));
	let mut runs = Vec::new();
	for _ in 0..2 {
		let mut unforker = ws.unforker(config.clone());
		unforker.execute().unwrap();
		assert_eq!(unforker.lists().len(), 1);
		runs.push(ws.read("rendered.yaml"));
	}

	assert_eq!(runs[0], runs[1]);
	let rendered = documents(&runs[1]);
	assert_eq!(rendered.len(), 1);
	assert_eq!(rendered[0]["kind"], "List");
	let stored = OverlayStore::new(&ws.state(), "ship").load().unwrap();
	assert_eq!(stored.lists.len(), 1);
	assert_eq!(stored.lists[0].items.len(), 2);
}

#[test]
fn test_destination_keeps_standalone_documents() {
	let ws = Workspace::new();
	ws.write("base/deployment.yaml", DEPLOYMENT);
	ws.write("fork/deployment.yaml", &DEPLOYMENT.replace("replicas: 1", "replicas: 3"));
	ws.write("fork/service.yaml", SERVICE);

	let mut config = ws.config();
	config.destination = Some(ws.path("rendered.yaml"));
	ws.unforker(config).execute().unwrap();

	let rendered = documents(&ws.read("rendered.yaml"));
	let kinds: Vec<&str> = rendered.iter().filter_map(|d| d["kind"].as_str()).collect();
	assert_eq!(kinds, vec!["Service", "Deployment"]);
	assert_eq!(rendered[1]["spec"]["replicas"], 3);
}

#[test]
fn test_empty_base_is_an_error() {
	let ws = Workspace::new();
	ws.write("base/notes.txt", "not a manifest");

	assert_matches!(
		ws.unforker(ws.config()).execute(),
		Err(UnforkError::EmptyBase { .. })
	);
}

#[test]
fn test_cancelled_before_writing() {
	let ws = Workspace::new();
	ws.write("base/deployment.yaml", DEPLOYMENT);
	ws.write("fork/deployment.yaml", &DEPLOYMENT.replace("replicas: 1", "replicas: 3"));

	let cancel = CancellationToken::new();
	cancel.cancel();
	let mut config = ws.config();
	config.destination = Some(ws.path("rendered.yaml"));
	let result = ws.unforker(config).with_cancellation(cancel).execute();

	assert_matches!(result, Err(UnforkError::Cancelled));
	assert!(!ws.path("rendered.yaml").exists());
	assert!(!ws.path("base/kustomization.yaml").exists());
}

#[test]
fn test_metadata_records_upstream() {
	let ws = Workspace::new();
	ws.write("base/deployment.yaml", DEPLOYMENT);
	ws.write("fork/deployment.yaml", DEPLOYMENT);

	ws.unforker(ws.config()).execute().unwrap();
	let metadata = ws.state().try_load().unwrap().v1.metadata;
	assert_eq!(metadata.upstream, Some(ws.path("base").display().to_string()));
}

fn exclusion_base(ws: &Workspace) {
	ws.write("base/myresource.yaml", DEPLOYMENT);
	ws.write("base/notmyresource.yaml", SERVICE);
	Kustomization {
		resources: vec!["myresource.yaml".to_string(), "notmyresource.yaml".to_string()],
		..Default::default()
	}
	.save(&ws.path("base"))
	.unwrap();
}

fn base_resources(base: &Path) -> Vec<String> {
	Kustomization::load(base).unwrap().resources
}

#[test]
fn test_exclude_base_resource() {
	let ws = Workspace::new();
	exclusion_base(&ws);
	let mut unforker = ws.unforker(ws.config());

	assert!(unforker.exclude_base("/myresource.yaml").unwrap());
	assert_eq!(base_resources(&ws.path("base")), vec!["notmyresource.yaml"]);

	// Excluding again is a no-op
	assert!(!unforker.exclude_base("/myresource.yaml").unwrap());
	let stored = OverlayStore::new(&ws.state(), "ship").load().unwrap();
	assert_eq!(stored.excluded_bases, vec!["/myresource.yaml"]);
}

#[test]
fn test_exclude_missing_resource_leaves_manifest_unchanged() {
	let ws = Workspace::new();
	exclusion_base(&ws);
	let before = ws.read("base/kustomization.yaml");

	assert_matches!(
		ws.unforker(ws.config()).exclude_base("/notexist-resource.yaml"),
		Err(UnforkError::Kustomize(KustomizeError::ResourceNotFound { .. }))
	);
	assert_eq!(ws.read("base/kustomization.yaml"), before);
	assert!(OverlayStore::new(&ws.state(), "ship")
		.load()
		.unwrap()
		.excluded_bases
		.is_empty());
}

#[test]
fn test_include_reverses_exclude() {
	let ws = Workspace::new();
	exclusion_base(&ws);
	let mut unforker = ws.unforker(ws.config());

	// Including something never excluded succeeds and changes nothing
	assert!(!unforker.include_base("/myresource.yaml").unwrap());

	unforker.exclude_base("/myresource.yaml").unwrap();
	assert!(unforker.include_base("/myresource.yaml").unwrap());
	assert_eq!(
		base_resources(&ws.path("base")),
		vec!["notmyresource.yaml", "myresource.yaml"]
	);
	assert!(unforker.overlay().excluded_bases.is_empty());
}

/// Writes the upstream into a subdirectory of the base, like an archive
/// with a top-level folder.
struct SubdirFetcher {
	calls: Rc<RefCell<Vec<String>>>,
}

impl ContentFetcher for SubdirFetcher {
	fn get_files(
		&self,
		_cancel: &CancellationToken,
		upstream: &str,
		dest: &Path,
	) -> Result<PathBuf, CollaboratorError> {
		self.calls.borrow_mut().push(upstream.to_string());
		let root = dest.join("web-1.0");
		fs::create_dir_all(&root).unwrap();
		fs::write(root.join("deployment.yaml"), DEPLOYMENT).unwrap();
		fs::write(root.join("service.yaml"), SERVICE).unwrap();
		Ok(root)
	}
}

#[test]
fn test_remote_upstream_uses_fetched_root() {
	let ws = Workspace::new();
	ws.write("base/stale.yaml", SERVICE);
	ws.write("fork/deployment.yaml", &DEPLOYMENT.replace("replicas: 1", "replicas: 3"));

	let calls = Rc::new(RefCell::new(Vec::new()));
	let mut config = ws.config();
	config.source = UpstreamSource::Remote("https://example.com/web.tgz".to_string());
	config.destination = Some(ws.path("rendered.yaml"));
	let mut unforker = ws.unforker(config).with_fetcher(Box::new(SubdirFetcher {
		calls: calls.clone(),
	}));
	let report = unforker.execute().unwrap();

	assert_eq!(*calls.borrow(), vec!["https://example.com/web.tgz"]);
	assert!(!ws.path("base/stale.yaml").exists());
	assert_eq!(report.patches, 1);
	assert_eq!(unforker.overlay().excluded_bases, vec!["/service.yaml"]);
	assert_eq!(base_resources(&ws.path("base/web-1.0")), vec!["deployment.yaml"]);
	let overlay = Kustomization::load(&ws.path("overlays/ship")).unwrap();
	assert_eq!(overlay.bases, vec!["../../base/web-1.0"]);

	let rendered = documents(&ws.read("rendered.yaml"));
	assert_eq!(rendered.len(), 1);
	assert_eq!(rendered[0]["spec"]["replicas"], 3);
	let metadata = ws.state().try_load().unwrap().v1.metadata;
	assert_eq!(metadata.upstream.as_deref(), Some("https://example.com/web.tgz"));
}

struct FakeCharts {
	calls: Rc<RefCell<Vec<String>>>,
}

impl ChartCommands for FakeCharts {
	fn init(&self) -> Result<(), CollaboratorError> {
		self.calls.borrow_mut().push("init".to_string());
		Ok(())
	}

	fn dependency_update(&self, chart_root: &Path) -> Result<(), CollaboratorError> {
		self.calls
			.borrow_mut()
			.push(format!("dependency update {}", chart_root.display()));
		Ok(())
	}

	fn template(&self, _chart_root: &Path, args: &[String]) -> Result<String, CollaboratorError> {
		self.calls
			.borrow_mut()
			.push(format!("template {}", args.join(" ")));
		Ok(format!("{DEPLOYMENT}---\n{SERVICE}"))
	}

	fn fetch(
		&self,
		_chart_ref: &str,
		_repo_url: Option<&str>,
		_version: Option<&str>,
		_dest: &Path,
		_home: &Path,
	) -> Result<(), CollaboratorError> {
		unreachable!("charts are rendered from a local root")
	}
}

#[test]
fn test_chart_upstream_is_rendered_into_fresh_base() {
	let ws = Workspace::new();
	ws.write("base/stale.yaml", SERVICE);
	ws.write("chart/Chart.yaml", "name: web\nversion: 1.0.0\n");
	ws.write("fork/deployment.yaml", &DEPLOYMENT.replace("replicas: 1", "replicas: 3"));
	ws.write("fork/service.yaml", SERVICE);

	let calls = Rc::new(RefCell::new(Vec::new()));
	let mut config = ws.config();
	config.source = UpstreamSource::HelmChart {
		chart_root: ws.path("chart"),
		args: vec!["--set".to_string(), "replicas=1".to_string()],
	};
	let mut unforker = ws.unforker(config).with_charts(Box::new(FakeCharts {
		calls: calls.clone(),
	}));
	let report = unforker.execute().unwrap();

	assert_eq!(
		*calls.borrow(),
		vec![
			"init".to_string(),
			format!("dependency update {}", ws.path("chart").display()),
			"template --set replicas=1".to_string(),
		]
	);
	assert!(!ws.path("base/stale.yaml").exists());
	assert_eq!(report.patches, 1);
	assert_eq!(report.resources, 0);
	assert_eq!(report.excluded, 0);
	assert_eq!(base_resources(&ws.path("base")).len(), 2);
	let metadata = ws.state().try_load().unwrap().v1.metadata;
	assert_eq!(metadata.upstream, Some(ws.path("chart").display().to_string()));
}

#[test]
fn test_missing_collaborators_are_reported() {
	let ws = Workspace::new();
	ws.write("base/deployment.yaml", DEPLOYMENT);
	ws.write("fork/deployment.yaml", DEPLOYMENT);

	let mut config = ws.config();
	config.source = UpstreamSource::Remote("https://example.com/web.tgz".to_string());
	assert_matches!(
		ws.unforker(config).execute(),
		Err(UnforkError::MissingCollaborator("content fetcher"))
	);

	let mut config = ws.config();
	config.source = UpstreamSource::HelmChart {
		chart_root: ws.path("chart"),
		args: Vec::new(),
	};
	assert_matches!(
		ws.unforker(config).execute(),
		Err(UnforkError::MissingCollaborator("chart commands"))
	);
	// Nothing was reset
	assert_eq!(ws.read("base/deployment.yaml"), DEPLOYMENT);
}
