//! Configuration loading for lx.
//!
//! Reads `lx-config.yaml` from the working directory, falling back to the
//! user's home directory. The local file wins when both exist.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

pub const CONFIG_FILE: &str = "lx-config.yaml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub bin_path: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Load the configuration and a display tag naming where it came from.
pub fn load() -> Result<(Config, String)> {
    let local = Path::new(CONFIG_FILE);
    if local.exists() {
        let cfg = parse_file(local)?;
        return Ok((cfg, format!("./{CONFIG_FILE} [local]")));
    }

    if let Some(home) = dirs::home_dir() {
        let global = home.join(CONFIG_FILE);
        if global.exists() {
            let cfg = parse_file(&global)?;
            return Ok((cfg, format!("~/{CONFIG_FILE} [global]")));
        }
    }

    bail!("could not find '{CONFIG_FILE}' in the current or home directory")
}

fn parse_file(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("malformed YAML in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_full_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "provider: gemini\napi_key: k\nmodel: gemini-2.0-flash\n"
        )
        .unwrap();
        let cfg = parse_file(file.path()).unwrap();
        assert_eq!(cfg.provider, "gemini");
        assert_eq!(cfg.api_key, "k");
        assert_eq!(cfg.model, "gemini-2.0-flash");
        assert!(cfg.args.is_empty());
    }

    #[test]
    fn test_parse_command_provider_with_args() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "provider: command\nmodel: m\nbin_path: /usr/bin/llm\nargs:\n  - \"{{{{prompt}}}}\"\n  - \"{{{{model}}}}\"\n"
        )
        .unwrap();
        let cfg = parse_file(file.path()).unwrap();
        assert_eq!(cfg.bin_path, "/usr/bin/llm");
        assert_eq!(cfg.args, ["{{prompt}}", "{{model}}"]);
    }

    #[test]
    fn test_malformed_yaml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "provider: [unclosed").unwrap();
        assert!(parse_file(file.path()).is_err());
    }
}
