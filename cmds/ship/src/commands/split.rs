//! Split command handler.

use std::{io::Write, path::PathBuf};

use anyhow::{Context, Result};
use clap::Args;

use crate::split;

#[derive(Args)]
pub struct SplitArgs {
	/// Manifest file, or a directory to split every manifest file under
	pub path: PathBuf,
}

/// Run the split command.
pub fn run<W: Write>(args: SplitArgs, mut writer: W) -> Result<()> {
	let context = || format!("splitting {}", args.path.display());
	if args.path.is_dir() {
		let lists = split::split_tree(&args.path).with_context(context)?;
		for list in lists {
			writeln!(
				writer,
				"{}: exploded list of {} items",
				list.path.display(),
				list.items.len()
			)?;
		}
		return Ok(());
	}

	let outcome = split::split(&args.path).with_context(context)?;
	for path in outcome.written {
		writeln!(writer, "{}", path.display())?;
	}
	Ok(())
}
