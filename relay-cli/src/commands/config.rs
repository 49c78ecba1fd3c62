use std::{fs, path::PathBuf};

use anyhow::{Context, Result, bail};
use shared::config::server::Config;

/// Writes a default server configuration file and returns where it went.
///
/// # Arguments
/// * `format` - `"yaml"` or `"json"`.
/// * `output` - Target path; defaults to `config.yaml` / `config.json` in the working directory.
///
/// # Errors
/// Returns an error if the format is unsupported or writing the file fails.
pub fn generate_config(format: &str, output: Option<PathBuf>) -> Result<PathBuf> {
    let config = Config::with_defaults();
    let (default_name, serialized) = match format {
        "yaml" | "yml" => (
            "config.yaml",
            serde_yml::to_string(&config).context("serializing configuration as yaml")?,
        ),
        "json" => (
            "config.json",
            serde_json::to_string_pretty(&config).context("serializing configuration as json")?,
        ),
        other => bail!("unsupported format '{other}'; use 'yaml' or 'json'"),
    };

    let path = output.unwrap_or_else(|| PathBuf::from(default_name));
    fs::write(&path, serialized)
        .with_context(|| format!("writing configuration to {}", path.display()))?;

    println!("Configuration file '{}' generated successfully.", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generated_files_load_back() {
        let dir = tempdir().unwrap();
        for format in ["yaml", "json"] {
            let path = dir.path().join(format!("relay.{format}"));
            let written = generate_config(format, Some(path.clone())).unwrap();
            assert_eq!(written, path);

            let loaded = Config::load_with_env(Some(path), None, |_| None).unwrap();
            assert_eq!(loaded.bus, Config::with_defaults().bus);
        }
    }

    #[test]
    fn unknown_format_is_rejected() {
        let dir = tempdir().unwrap();
        let err = generate_config("toml", Some(dir.path().join("relay.toml"))).unwrap_err();
        assert!(err.to_string().contains("unsupported format"));
    }
}
