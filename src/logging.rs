use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

pub const LOG_LEVEL_ENV: &str = "COINFER_LOG_LEVEL";

/// Install the stderr subscriber. `--verbose` forces debug; otherwise
/// `COINFER_LOG_LEVEL`, then `RUST_LOG`, then `info`.
pub fn init(verbose: bool) -> Result<()> {
    let directive = resolve_directive(
        verbose,
        std::env::var(LOG_LEVEL_ENV).ok(),
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
    );
    let filter = EnvFilter::try_new(&directive)
        .map_err(|err| anyhow!("invalid log filter {directive:?}: {err}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("failed to install logger: {err}"))
}

fn resolve_directive(verbose: bool, level: Option<String>, rust_log: Option<String>) -> String {
    if verbose {
        return "debug".to_string();
    }
    level
        .map(|l| l.trim().to_lowercase())
        .filter(|l| !l.is_empty())
        .or_else(|| rust_log.filter(|l| !l.trim().is_empty()))
        .unwrap_or_else(|| "info".to_string())
}

/// Copy of `envs` with secret-looking values replaced by `*`.
pub fn mask_envs<'a, I>(envs: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    envs.into_iter()
        .map(|(key, value)| {
            let secret = key
                .to_lowercase()
                .split('_')
                .any(|part| matches!(part, "key" | "secret" | "secrets" | "token"));
            let shown = if secret { "*".to_string() } else { value.clone() };
            (key.clone(), shown)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn directive_precedence() {
        assert_eq!(resolve_directive(true, Some("warn".into()), None), "debug");
        assert_eq!(resolve_directive(false, Some("WARN".into()), Some("trace".into())), "warn");
        assert_eq!(resolve_directive(false, None, Some("trace".into())), "trace");
        assert_eq!(resolve_directive(false, Some(" ".into()), None), "info");
    }

    #[test]
    fn masks_secret_keys_only() {
        let envs: BTreeMap<String, String> = [
            ("COINFER_AUTH_TOKEN", "abc"),
            ("AWS_SECRET_ACCESS_KEY", "xyz"),
            ("TOKENIZER_PATH", "/models"),
            ("EXPERIMENT_ID", "exp1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let masked: BTreeMap<String, String> = mask_envs(&envs).into_iter().collect();
        assert_eq!(masked["COINFER_AUTH_TOKEN"], "*");
        assert_eq!(masked["AWS_SECRET_ACCESS_KEY"], "*");
        assert_eq!(masked["TOKENIZER_PATH"], "/models");
        assert_eq!(masked["EXPERIMENT_ID"], "exp1");
    }
}
