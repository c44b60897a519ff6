//! Unfork command handler.

use std::{io::Write, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use super::util::{require_base, resolve_config, OverlayArgs};
use crate::{
	collaborators::{HelmCommands, LocalFetcher, MarkerFileGate},
	config::ShipConfig,
	state::FileStateManager,
	unfork::{UnforkConfig, Unforker, UpstreamSource},
};

/// Overlay directory used when neither the CLI nor the config file names one.
const DEFAULT_OVERLAY_DIR: &str = "overlays/ship";

#[derive(Args)]
pub struct UnforkArgs {
	/// Directory holding the forked manifests
	pub forked: PathBuf,

	#[command(flatten)]
	pub overlay: OverlayArgs,

	/// Also build the overlay into this file
	#[arg(long)]
	pub destination: Option<PathBuf>,

	/// Copy the upstream from this directory into the base first
	#[arg(long, conflicts_with = "chart")]
	pub upstream: Option<String>,

	/// Render this Helm chart into the base first
	#[arg(long)]
	pub chart: Option<PathBuf>,

	/// Extra argument for `helm template`, may be repeated
	#[arg(long = "chart-arg", requires = "chart", allow_hyphen_values = true)]
	pub chart_args: Vec<String>,

	/// Helm binary used with --chart
	#[arg(long, default_value = "helm")]
	pub helm: PathBuf,

	/// Wait for this file to exist before writing anything
	#[arg(long)]
	pub wait_for: Option<PathBuf>,

	/// How often to check for --wait-for, in milliseconds
	#[arg(long)]
	pub confirm_poll_interval_ms: Option<u64>,
}

impl UnforkArgs {
	fn as_config(&self) -> ShipConfig {
		let mut config = self.overlay.as_config();
		config.destination.clone_from(&self.destination);
		config.confirm_poll_interval_ms = self.confirm_poll_interval_ms;
		config
	}

	fn source(&self) -> UpstreamSource {
		match (&self.upstream, &self.chart) {
			(Some(upstream), _) => UpstreamSource::Remote(upstream.clone()),
			(None, Some(chart_root)) => UpstreamSource::HelmChart {
				chart_root: chart_root.clone(),
				args: self.chart_args.clone(),
			},
			(None, None) => UpstreamSource::Local,
		}
	}
}

/// Run the unfork command.
pub fn run<W: Write>(args: UnforkArgs, mut writer: W) -> Result<()> {
	let config = resolve_config(&args.as_config())?;
	let base = require_base(&config)?;

	let mut unfork = UnforkConfig::new(
		base,
		&args.forked,
		config
			.overlay_path
			.clone()
			.unwrap_or_else(|| PathBuf::from(DEFAULT_OVERLAY_DIR)),
	);
	unfork.destination.clone_from(&config.destination);
	unfork.overlay_name = config.overlay_name().to_string();
	unfork.confirm_poll_interval = Duration::from_millis(config.confirm_poll_interval_ms());
	unfork.source = args.source();

	let state = FileStateManager::new(&args.overlay.state_root);
	let mut unforker = Unforker::new(unfork, Box::new(state))
		.with_fetcher(Box::new(LocalFetcher))
		.with_charts(Box::new(HelmCommands::new(&args.helm)));
	if let Some(marker) = &args.wait_for {
		info!(marker = %marker.display(), "will wait for confirmation marker");
		unforker = unforker.with_confirmation(Box::new(MarkerFileGate::new(marker)));
	}

	let report = unforker
		.execute()
		.with_context(|| format!("unforking {}", args.forked.display()))?;

	writeln!(
		writer,
		"{} patches, {} new resources, {} excluded base resources",
		report.patches, report.resources, report.excluded
	)?;
	if let Some(destination) = report.destination {
		writeln!(writer, "wrote {}", destination.display())?;
	}
	Ok(())
}
