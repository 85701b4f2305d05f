use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

fn main() {
    // memory.x must be on the linker search path for cortex-m-rt.
    let out = PathBuf::from(env::var_os("OUT_DIR").expect("OUT_DIR set by cargo"));
    fs::write(out.join("memory.x"), include_bytes!("memory.x")).expect("write memory.x");
    println!("cargo:rustc-link-search={}", out.display());
    println!("cargo:rerun-if-changed=memory.x");

    println!("cargo:rustc-link-arg-bins=--nmagic");
    println!("cargo:rustc-link-arg-bins=-Tlink.x");
    println!("cargo:rustc-link-arg-bins=-Tlink-rp.x");
    println!("cargo:rustc-link-arg-bins=-Tdefmt.x");

    // Exports:
    //   - POLLER_FW_VERSION: "<crate> <semver> (profile <profile>, git <describe|unknown>)"
    println!("cargo:rerun-if-changed=src/");
    if let Some(head) = git_head_path() {
        println!("cargo:rerun-if-changed={}", head.display());
    }

    let env_path = repo_root_from_manifest().map(|root| root.join(".env"));
    if let Some(path) = env_path.as_ref().filter(|p| p.exists()) {
        println!("cargo:rerun-if-changed={}", path.display());
    }

    let pkg_name = env::var("CARGO_PKG_NAME").unwrap_or_else(|_| "unknown".to_string());
    let pkg_ver = env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.0.0".to_string());
    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    let git_info = git_describe().unwrap_or_else(|| "git unknown".to_string());
    println!(
        "cargo:rustc-env=POLLER_FW_VERSION={pkg_name} {pkg_ver} (profile {profile}, {git_info})"
    );

    // API credentials and network overrides, from .env or the environment.
    let mut file_cfg = HashMap::new();
    if let Some(path) = env_path.as_ref().filter(|p| p.exists()) {
        file_cfg.extend(load_env_file(path));
    }

    for key in ["ALPHAESS_APP_ID", "ALPHAESS_APP_SECRET", "ALPHAESS_SYS_SN"] {
        println!("cargo:rerun-if-env-changed={key}");
        match get_cfg(key, &file_cfg) {
            Some(value) => println!("cargo:rustc-env={key}={value}"),
            None => {
                eprintln!("error: {key} missing. Set it in .env or the environment.");
                std::process::exit(1);
            }
        }
    }

    for key in [
        "POLLER_MAC",
        "POLLER_STATIC_IP",
        "POLLER_NETMASK",
        "POLLER_GATEWAY",
        "POLLER_DNS",
    ] {
        println!("cargo:rerun-if-env-changed={key}");
        if let Some(value) = get_cfg(key, &file_cfg) {
            println!("cargo:rustc-env={key}={value}");
        }
    }
}

fn repo_root_from_manifest() -> Option<PathBuf> {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").ok()?);
    manifest_dir.parent()?.parent().map(|p| p.to_path_buf())
}

fn git_head_path() -> Option<PathBuf> {
    let head = repo_root_from_manifest()?.join(".git/HEAD");
    if head.exists() { Some(head) } else { None }
}

fn git_describe() -> Option<String> {
    let repo_root = repo_root_from_manifest()?;
    let output = Command::new("git")
        .arg("-C")
        .arg(&repo_root)
        .args(["describe", "--tags", "--dirty", "--always"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let s = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if s.is_empty() { None } else { Some(format!("git {s}")) }
}

fn load_env_file(path: &Path) -> HashMap<String, String> {
    let mut map = HashMap::new();

    let Ok(contents) = fs::read_to_string(path) else {
        return map;
    };

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"');
            if !key.is_empty() && !value.is_empty() {
                map.insert(key.to_string(), value.to_string());
            }
        }
    }

    map
}

/// Process environment wins over `.env`.
fn get_cfg(key: &str, file_cfg: &HashMap<String, String>) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| {
            file_cfg
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        })
}
