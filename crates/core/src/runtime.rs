//! Locating the external programs a run depends on: `ffprobe`, `ffmpeg`
//! and the interpolation engine.

use std::env;
#[cfg(windows)]
use std::path::Path;
use std::path::PathBuf;
use std::process::Command as ProcessCommand;

use tracing::{info, warn};

/// Directories searched before falling back to `PATH`: next to the
/// executable, its `bin/` siblings, then the working directory.
fn candidate_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("bin"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("bin"));
            }
        }
    }

    if let Ok(cwd) = env::current_dir() {
        if !dirs.contains(&cwd) {
            dirs.push(cwd.clone());
        }
        let cwd_bin = cwd.join("bin");
        if !dirs.contains(&cwd_bin) {
            dirs.push(cwd_bin);
        }
    }

    dirs
}

fn path_dirs() -> Vec<PathBuf> {
    env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).collect())
        .unwrap_or_default()
}

#[cfg(unix)]
fn candidate_binary_names(binary: &str) -> Vec<String> {
    vec![binary.to_string()]
}

#[cfg(windows)]
fn candidate_binary_names(binary: &str) -> Vec<String> {
    if Path::new(binary).components().count() > 1
        || binary.to_ascii_lowercase().ends_with(".exe")
    {
        return vec![binary.to_string()];
    }
    vec![format!("{binary}.exe"), binary.to_string()]
}

fn find_binary_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let names = candidate_binary_names(binary);
    for dir in dirs {
        for name in &names {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Full path of `binary` if it can be found locally or on `PATH`.
pub fn resolve_binary(binary: &str) -> Option<PathBuf> {
    find_binary_in_dirs(binary, &candidate_bin_dirs())
        .or_else(|| find_binary_in_dirs(binary, &path_dirs()))
}

/// A [`ProcessCommand`] for `binary`, preferring a copy shipped next to
/// the executable over the one on `PATH`.
pub fn command_for(binary: &str) -> ProcessCommand {
    if let Some(path) = find_binary_in_dirs(binary, &candidate_bin_dirs()) {
        return ProcessCommand::new(path);
    }
    ProcessCommand::new(binary)
}

/// Log where each required tool resolves to. Missing tools are only
/// warned about here; the spawn that needs them reports the hard error.
pub fn log_tool_status(engine_program: &str) {
    for tool in ["ffprobe", "ffmpeg", engine_program] {
        match resolve_binary(tool) {
            Some(path) => info!(tool, path = %path.display(), "external tool found"),
            None => warn!(tool, "external tool not found locally or on PATH"),
        }
    }
}
