//! Build command handler.

use std::{io::Write, path::PathBuf};

use anyhow::{Context, Result};
use clap::Args;

use crate::patch::PatchEngine;

#[derive(Args)]
pub struct BuildArgs {
	/// Directory holding a kustomization.yaml
	#[arg(default_value = ".")]
	pub dir: PathBuf,
}

/// Run the build command.
pub fn run<W: Write>(args: BuildArgs, mut writer: W) -> Result<()> {
	let output = PatchEngine
		.run_kustomize(&args.dir)
		.with_context(|| format!("building {}", args.dir.display()))?;
	writer.write_all(output.as_bytes())?;
	Ok(())
}
