//! Build script for the strata agent.
//!
//! Builds the eBPF probe crate for the BPF target before the main crate and
//! exports the object's path as `STRATA_EBPF_PATH`.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::process::Command;

fn main() -> Result<()> {
    println!("cargo:rerun-if-changed=../strata-ebpf/src/");
    println!("cargo:rerun-if-changed=../strata-common/src/");

    let manifest_dir = env::var("CARGO_MANIFEST_DIR")?;
    let workspace_root = PathBuf::from(&manifest_dir).parent().unwrap().to_path_buf();
    let ebpf_dir = workspace_root.join("strata-ebpf");
    let out_dir = env::var("OUT_DIR")?;

    // Endianness of the BPF target follows the host target.
    let target = match env::var("CARGO_CFG_TARGET_ENDIAN")
        .as_deref()
        .unwrap_or("little")
    {
        "big" => "bpfeb-unknown-none",
        _ => "bpfel-unknown-none",
    };

    let target_arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_else(|_| "x86_64".to_string());

    let status = Command::new("rustup")
        .current_dir(&ebpf_dir)
        .env_remove("RUSTC")
        .env_remove("RUSTC_WORKSPACE_WRAPPER")
        .env(
            "CARGO_ENCODED_RUSTFLAGS",
            format!(
                "--cfg=bpf_target_arch=\"{}\"\x1f-Cdebuginfo=2\x1f-Clink-arg=--btf",
                target_arch
            ),
        )
        .args([
            "run",
            "nightly",
            "cargo",
            "build",
            "--release",
            "-Z",
            "build-std=core",
            "--target",
            target,
            "--target-dir",
            &out_dir,
        ])
        .status()
        .context("Failed to run cargo build for the eBPF probes")?;

    if !status.success() {
        anyhow::bail!("Failed to build the eBPF probes");
    }

    let ebpf_binary = PathBuf::from(&out_dir)
        .join(target)
        .join("release")
        .join("strata-probes");

    // Copy to a predictable location in the target directory.
    let target_dir = workspace_root.join("target").join("bpf");
    std::fs::create_dir_all(&target_dir)?;
    let dest_path = target_dir.join("strata-probes");
    std::fs::copy(&ebpf_binary, &dest_path).context("Failed to copy the eBPF object")?;

    println!("cargo:rustc-env=STRATA_EBPF_PATH={}", dest_path.display());

    Ok(())
}
