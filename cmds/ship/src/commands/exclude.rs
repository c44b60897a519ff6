//! Exclude and include command handlers.

use std::{io::Write, path::PathBuf};

use anyhow::{Context, Result};
use clap::Args;

use super::util::{require_base, resolve_config, OverlayArgs};
use crate::{
	state::FileStateManager,
	unfork::{UnforkConfig, Unforker},
};

#[derive(Args)]
pub struct ExcludeArgs {
	/// Base resource, as a `/`-prefixed path relative to the base directory
	pub resource: String,

	#[command(flatten)]
	pub overlay: OverlayArgs,
}

fn unforker(args: &OverlayArgs) -> Result<Unforker> {
	let config = resolve_config(&args.as_config())?;
	let mut unfork = UnforkConfig::new(
		require_base(&config)?,
		PathBuf::new(),
		config.overlay_path.clone().unwrap_or_default(),
	);
	unfork.overlay_name = config.overlay_name().to_string();
	Ok(Unforker::new(
		unfork,
		Box::new(FileStateManager::new(&args.state_root)),
	))
}

fn normalize(resource: &str) -> String {
	format!("/{}", resource.trim_start_matches('/'))
}

/// Run the exclude command.
pub fn run_exclude<W: Write>(args: ExcludeArgs, mut writer: W) -> Result<()> {
	let resource = normalize(&args.resource);
	let changed = unforker(&args.overlay)?
		.exclude_base(&resource)
		.with_context(|| format!("excluding {resource}"))?;
	if changed {
		writeln!(writer, "excluded {resource}")?;
	} else {
		writeln!(writer, "{resource} is already excluded")?;
	}
	Ok(())
}

/// Run the include command.
pub fn run_include<W: Write>(args: ExcludeArgs, mut writer: W) -> Result<()> {
	let resource = normalize(&args.resource);
	let changed = unforker(&args.overlay)?
		.include_base(&resource)
		.with_context(|| format!("including {resource}"))?;
	if changed {
		writeln!(writer, "included {resource}")?;
	} else {
		writeln!(writer, "{resource} is not excluded")?;
	}
	Ok(())
}
