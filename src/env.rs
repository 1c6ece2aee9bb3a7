use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Load `.env` files before clap reads flag defaults from the environment.
pub fn bootstrap_from_args(args: &[OsString]) -> Result<()> {
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let explicit = extract_env_file_arg(args);
    for (key, value) in collect_env_values(&cwd, explicit.as_deref())? {
        std::env::set_var(key, value);
    }
    Ok(())
}

/// Values to export. Variables already present in the process environment
/// are never overridden; among files, later ones win.
fn collect_env_values(cwd: &Path, explicit: Option<&Path>) -> Result<Vec<(String, String)>> {
    let mut loaded = HashMap::new();
    for env_file in resolve_env_files(cwd, explicit) {
        if !env_file.exists() && explicit.is_none() {
            continue;
        }
        let parsed = dotenvy::from_path_iter(&env_file)
            .with_context(|| format!("failed to read env file {}", env_file.display()))?;
        for item in parsed {
            let (key, value) =
                item.with_context(|| format!("failed to parse env file {}", env_file.display()))?;
            if std::env::var_os(&key).is_none() {
                loaded.insert(key, value);
            }
        }
    }
    let mut values: Vec<(String, String)> = loaded.into_iter().collect();
    values.sort();
    Ok(values)
}

fn extract_env_file_arg(args: &[OsString]) -> Option<PathBuf> {
    let mut explicit = None;
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        let Some(arg) = arg.to_str() else {
            continue;
        };
        if arg == "--" {
            break;
        }
        if arg == "--env-file" {
            explicit = iter.next().map(PathBuf::from);
        } else if let Some(value) = arg.strip_prefix("--env-file=") {
            explicit = Some(PathBuf::from(value));
        }
    }
    explicit
}

fn resolve_env_files(cwd: &Path, explicit: Option<&Path>) -> Vec<PathBuf> {
    match explicit {
        Some(path) if path.is_absolute() => vec![path.to_path_buf()],
        Some(path) => vec![cwd.join(path)],
        None => vec![cwd.join(".env"), cwd.join(".env.local")],
    }
}
