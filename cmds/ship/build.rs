use std::process::Command;

fn main() {
	// Re-run if git HEAD changes
	println!("cargo:rerun-if-changed=.git/HEAD");
	println!("cargo:rerun-if-changed=.git/refs/");

	let version = get_version();
	println!("cargo:rustc-env=SHIP_VERSION={}", version);
}

fn get_version() -> String {
	let cargo_version = env!("CARGO_PKG_VERSION");

	// A release build sets the crate version; dev builds keep the placeholder
	if cargo_version != "0.1.0" {
		return cargo_version.to_string();
	}

	if let Some(tag) = git(&["describe", "--tags", "--exact-match", "HEAD"]) {
		return tag.strip_prefix('v').unwrap_or(&tag).to_string();
	}

	git(&["rev-parse", "--short", "HEAD"]).unwrap_or_else(|| cargo_version.to_string())
}

fn git(args: &[&str]) -> Option<String> {
	let output = Command::new("git").args(args).output().ok()?;
	if !output.status.success() {
		return None;
	}
	let out = String::from_utf8(output.stdout).ok()?;
	Some(out.trim().to_string())
}
