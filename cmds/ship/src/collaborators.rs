//! External capabilities the unforker depends on.
//!
//! Each collaborator is a narrow trait so the unforker can be driven with
//! fakes in tests. The provided implementations shell out to `helm`, copy
//! local directories, and poll for a marker file.

use std::{
	fs, io,
	path::{Path, PathBuf},
	process::Command,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	thread,
	time::Duration,
};

use thiserror::Error;
use tracing::{debug, instrument, trace};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum CollaboratorError {
	#[error("failed to execute {command}")]
	Spawn {
		command: String,
		#[source]
		source: io::Error,
	},

	#[error("{command} failed: {stderr}")]
	CommandFailed { command: String, stderr: String },

	#[error("invalid UTF-8 in {command} output")]
	Utf8 { command: String },

	#[error("copying {}", path.display())]
	Io {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	#[error("{0} does not exist")]
	NotFound(String),

	#[error("cancelled")]
	Cancelled,
}

/// Shared flag that asks long-running work to stop.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
	flag: Arc<AtomicBool>,
}

impl CancellationToken {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn cancel(&self) {
		self.flag.store(true, Ordering::Relaxed);
	}

	pub fn is_cancelled(&self) -> bool {
		self.flag.load(Ordering::Relaxed)
	}
}

/// Helm chart operations.
pub trait ChartCommands {
	fn init(&self) -> Result<(), CollaboratorError>;

	fn dependency_update(&self, chart_root: &Path) -> Result<(), CollaboratorError>;

	/// Render the chart; returns the multi-document YAML stream.
	fn template(&self, chart_root: &Path, args: &[String]) -> Result<String, CollaboratorError>;

	fn fetch(
		&self,
		chart_ref: &str,
		repo_url: Option<&str>,
		version: Option<&str>,
		dest: &Path,
		home: &Path,
	) -> Result<(), CollaboratorError>;
}

/// Downloads upstream content.
pub trait ContentFetcher {
	/// Fetch `upstream` into `dest` and return the directory holding the files.
	fn get_files(
		&self,
		cancel: &CancellationToken,
		upstream: &str,
		dest: &Path,
	) -> Result<PathBuf, CollaboratorError>;
}

/// Decides when an unfork may proceed past its checkpoint.
pub trait ConfirmationGate {
	fn is_confirmed(&self) -> bool;
}

/// [`ChartCommands`] backed by the `helm` binary.
#[derive(Debug, Clone)]
pub struct HelmCommands {
	binary: PathBuf,
	/// Passed as `HELM_HOME` when set.
	home: Option<PathBuf>,
}

impl Default for HelmCommands {
	fn default() -> Self {
		Self {
			binary: PathBuf::from("helm"),
			home: None,
		}
	}
}

impl HelmCommands {
	pub fn new(binary: impl Into<PathBuf>) -> Self {
		Self {
			binary: binary.into(),
			home: None,
		}
	}

	#[must_use]
	pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
		self.home = Some(home.into());
		self
	}

	fn run(&self, args: &[&str]) -> Result<String, CollaboratorError> {
		let command = format!("helm {}", args.first().copied().unwrap_or_default());
		let mut cmd = Command::new(&self.binary);
		cmd.args(args);
		if let Some(home) = &self.home {
			cmd.env("HELM_HOME", home);
		}
		trace!(?args, "running helm");

		let output = cmd.output().map_err(|source| CollaboratorError::Spawn {
			command: command.clone(),
			source,
		})?;
		if !output.status.success() {
			return Err(CollaboratorError::CommandFailed {
				command,
				stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
			});
		}
		String::from_utf8(output.stdout).map_err(|_| CollaboratorError::Utf8 { command })
	}
}

fn path_arg(path: &Path) -> String {
	path.to_string_lossy().into_owned()
}

impl ChartCommands for HelmCommands {
	fn init(&self) -> Result<(), CollaboratorError> {
		// helm 3 has no init; `env` is the cheapest command that proves helm runs
		self.run(&["env"]).map(drop)
	}

	fn dependency_update(&self, chart_root: &Path) -> Result<(), CollaboratorError> {
		let chart = path_arg(chart_root);
		self.run(&["dependency", "update", chart.as_str()]).map(drop)
	}

	#[instrument(skip_all, fields(chart = %chart_root.display()))]
	fn template(&self, chart_root: &Path, args: &[String]) -> Result<String, CollaboratorError> {
		let chart = path_arg(chart_root);
		let mut full = vec!["template", chart.as_str()];
		full.extend(args.iter().map(String::as_str));
		self.run(&full)
	}

	fn fetch(
		&self,
		chart_ref: &str,
		repo_url: Option<&str>,
		version: Option<&str>,
		dest: &Path,
		home: &Path,
	) -> Result<(), CollaboratorError> {
		let dest = path_arg(dest);
		let mut args = vec!["pull", chart_ref, "--untar", "--untardir", dest.as_str()];
		if let Some(repo) = repo_url {
			args.extend(["--repo", repo]);
		}
		if let Some(version) = version {
			args.extend(["--version", version]);
		}
		self.clone().with_home(home).run(&args).map(drop)
	}
}

/// [`ContentFetcher`] for upstreams that are local directories.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFetcher;

impl ContentFetcher for LocalFetcher {
	#[instrument(skip_all, fields(upstream = %upstream, dest = %dest.display()))]
	fn get_files(
		&self,
		cancel: &CancellationToken,
		upstream: &str,
		dest: &Path,
	) -> Result<PathBuf, CollaboratorError> {
		let source = Path::new(upstream);
		if !source.is_dir() {
			return Err(CollaboratorError::NotFound(upstream.to_string()));
		}
		copy_tree(cancel, source, dest)?;
		debug!("copied upstream");
		Ok(dest.to_path_buf())
	}
}

/// Copy every directory and file below `source` into `dest`.
pub fn copy_tree(
	cancel: &CancellationToken,
	source: &Path,
	dest: &Path,
) -> Result<(), CollaboratorError> {
	let io_err = |path: &Path| {
		let path = path.to_path_buf();
		move |source| CollaboratorError::Io { path, source }
	};

	for entry in WalkDir::new(source).sort_by_file_name() {
		if cancel.is_cancelled() {
			return Err(CollaboratorError::Cancelled);
		}
		let entry = entry.map_err(|e| CollaboratorError::Io {
			path: source.to_path_buf(),
			source: e.into(),
		})?;
		let Ok(relative) = entry.path().strip_prefix(source) else {
			continue;
		};
		let target = dest.join(relative);
		if entry.file_type().is_dir() {
			fs::create_dir_all(&target).map_err(io_err(&target))?;
		} else if entry.file_type().is_file() {
			fs::copy(entry.path(), &target).map_err(io_err(&target))?;
		}
	}
	Ok(())
}

/// Confirms once a marker file exists.
#[derive(Debug, Clone)]
pub struct MarkerFileGate {
	path: PathBuf,
}

impl MarkerFileGate {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}
}

impl ConfirmationGate for MarkerFileGate {
	fn is_confirmed(&self) -> bool {
		self.path.exists()
	}
}

/// Shortest wait between confirmation polls.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Longest wait between confirmation polls.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// `interval` clamped to [`MIN_POLL_INTERVAL`]..=[`MAX_POLL_INTERVAL`].
pub fn bounded_poll_interval(interval: Duration) -> Duration {
	interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
}

/// Block until `gate` confirms, checking every `interval` (bounded by
/// [`bounded_poll_interval`]).
///
/// Returns [`CollaboratorError::Cancelled`] as soon as `cancel` is set.
pub fn wait_for_confirmation(
	gate: &dyn ConfirmationGate,
	interval: Duration,
	cancel: &CancellationToken,
) -> Result<(), CollaboratorError> {
	let interval = bounded_poll_interval(interval);
	loop {
		if cancel.is_cancelled() {
			return Err(CollaboratorError::Cancelled);
		}
		if gate.is_confirmed() {
			return Ok(());
		}
		thread::sleep(interval);
	}
}
