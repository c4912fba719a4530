use std::path::PathBuf;
use std::process::Command;

use anyhow::Context as _;
use clap::Parser;

#[derive(Debug, Parser)]
pub struct Options {
    /// BPF target triple to build for
    #[clap(
        long,
        default_value = "bpfel-unknown-none",
        value_parser = ["bpfel-unknown-none", "bpfeb-unknown-none"],
    )]
    pub target: String,
    /// Build the release target
    #[clap(long)]
    pub release: bool,
}

/// Build the kernel-side object in its own workspace; it only compiles for
/// the BPF targets and needs core rebuilt for them.
pub fn build_ebpf(opts: Options) -> anyhow::Result<()> {
    let target = format!("--target={}", opts.target);
    let mut args = vec!["build", target.as_str(), "-Z", "build-std=core"];
    if opts.release {
        args.push("--release");
    }
    let status = Command::new("cargo")
        .current_dir(PathBuf::from("pytail-ebpf"))
        .args(&args)
        .status()
        .context("failed to run cargo")?;
    anyhow::ensure!(status.success(), "failed to build the BPF object");
    Ok(())
}
