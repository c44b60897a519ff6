use anyhow::Result;
use clap::{Parser, Subcommand};
use ship::{
	commands::{self, util::BrokenPipeGuard},
	telemetry::{self, LogFormat},
};
use tracing::Level;

#[derive(Parser)]
#[command(name = "ship")]
#[command(about = "Turn forked Kubernetes manifests into kustomize overlays", long_about = None)]
#[command(version = env!("SHIP_VERSION"))]
struct Cli {
	/// Log level (trace, debug, info, warn, error); overrides RUST_LOG
	#[arg(long, global = true)]
	log_level: Option<Level>,

	/// Log output format
	#[arg(long, global = true, value_enum, default_value_t)]
	log_format: LogFormat,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Compute an overlay from a fork of the upstream manifests
	Unfork(commands::unfork::UnforkArgs),

	/// Exclude a base resource from the overlay
	Exclude(commands::exclude::ExcludeArgs),

	/// Undo a previous exclude
	Include(commands::exclude::ExcludeArgs),

	/// Build a kustomization and print the result
	Build(commands::build::BuildArgs),

	/// Split multi-document manifests into one file per resource
	Split(commands::split::SplitArgs),
}

fn main() -> Result<()> {
	let cli = Cli::parse();
	let _telemetry = telemetry::init(cli.log_level, cli.log_format)?;

	let stdout = BrokenPipeGuard::new(std::io::stdout());

	match cli.command {
		Commands::Unfork(args) => commands::unfork::run(args, stdout),
		Commands::Exclude(args) => commands::exclude::run_exclude(args, stdout),
		Commands::Include(args) => commands::exclude::run_include(args, stdout),
		Commands::Build(args) => commands::build::run(args, stdout),
		Commands::Split(args) => commands::split::run(args, stdout),
	}
}
