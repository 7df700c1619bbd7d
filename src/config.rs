#![forbid(unsafe_code)]

//! Runtime configuration shared by the tokgrab binaries.
//!
//! Values are resolved with the same precedence everywhere: explicit
//! override (CLI flag) > process environment > `.env` file > built-in
//! default. The extraction API credentials have no default on purpose; the
//! backend refuses to start without a key.

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_API_HOST: &str = "social-media-video-downloader.p.rapidapi.com";

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Root under which the per-job download files live.
    pub media_root: PathBuf,
    /// Static front-end files served by the backend fallback route.
    pub www_root: PathBuf,
    pub port: u16,
    pub host: String,
    pub api_host: String,
    /// Extraction API credential. Optional here; the backend errors out when
    /// it is missing, the CLI client never needs it.
    pub api_key: Option<String>,
}

/// Values a binary wants to force regardless of the environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub media_root: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn load_runtime_config() -> Result<RuntimeConfig> {
    resolve_runtime_config(ConfigOverrides::default())
}

pub fn resolve_runtime_config(overrides: ConfigOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config(&file_vars, env_var_string, overrides)
}

fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ConfigOverrides,
) -> Result<RuntimeConfig> {
    let media_root = overrides
        .media_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("TOKGRAB_MEDIA_ROOT", file_vars, &env_lookup))
        .ok_or_else(|| anyhow!("TOKGRAB_MEDIA_ROOT not set"))?;
    let www_root = overrides
        .www_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("TOKGRAB_WWW_ROOT", file_vars, &env_lookup))
        .ok_or_else(|| anyhow!("TOKGRAB_WWW_ROOT not set"))?;
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("TOKGRAB_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() { None } else { Some(trimmed) }
        })
        .or_else(|| lookup_value("TOKGRAB_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let api_host = lookup_value("TOKGRAB_API_HOST", file_vars, &env_lookup)
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_API_HOST.to_string());
    let api_key =
        lookup_value("TOKGRAB_API_KEY", file_vars, &env_lookup).filter(|value| !value.is_empty());

    Ok(RuntimeConfig {
        media_root: PathBuf::from(media_root),
        www_root: PathBuf::from(www_root),
        port,
        host,
        api_host,
        api_key,
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

/// Parses a simple `.env` file. `export` prefixes, quoting, blank lines and
/// `#` comments are all tolerated; malformed lines are skipped.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_env(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn config_from(contents: &str) -> RuntimeConfig {
        let cfg = make_env(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_config(&vars, |_| None, ConfigOverrides::default()).unwrap()
    }

    #[test]
    fn reads_port_and_roots() {
        let config = config_from(
            "TOKGRAB_MEDIA_ROOT=\"/data\"\nTOKGRAB_WWW_ROOT=\"/www\"\nTOKGRAB_PORT=\"4242\"\n",
        );
        assert_eq!(config.media_root, PathBuf::from("/data"));
        assert_eq!(config.www_root, PathBuf::from("/www"));
        assert_eq!(config.port, 4242);
        assert_eq!(config.host, DEFAULT_HOST);
    }

    #[test]
    fn missing_media_root_is_an_error() {
        let cfg = make_env("TOKGRAB_WWW_ROOT=\"/www\"\n");
        let vars = read_env_file(cfg.path()).unwrap();
        let err = build_runtime_config(&vars, |_| None, ConfigOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("TOKGRAB_MEDIA_ROOT"));
    }

    #[test]
    fn api_host_defaults_and_key_is_optional() {
        let config = config_from("TOKGRAB_MEDIA_ROOT=\"/m\"\nTOKGRAB_WWW_ROOT=\"/w\"\n");
        assert_eq!(config.api_host, DEFAULT_API_HOST);
        assert!(config.api_key.is_none());
    }

    #[test]
    fn api_key_read_from_file() {
        let config = config_from(
            "TOKGRAB_MEDIA_ROOT=\"/m\"\nTOKGRAB_WWW_ROOT=\"/w\"\nTOKGRAB_API_KEY=\"secret\"\n",
        );
        assert_eq!(config.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn env_beats_file() {
        let vars = read_env_file(
            make_env("TOKGRAB_MEDIA_ROOT=\"/file\"\nTOKGRAB_WWW_ROOT=\"/www\"\n").path(),
        )
        .unwrap();
        let config = build_runtime_config(
            &vars,
            |key| {
                if key == "TOKGRAB_MEDIA_ROOT" {
                    Some("/env".to_string())
                } else {
                    None
                }
            },
            ConfigOverrides::default(),
        )
        .unwrap();
        assert_eq!(config.media_root, PathBuf::from("/env"));
    }

    #[test]
    fn overrides_beat_everything() {
        let mut vars = HashMap::new();
        vars.insert("TOKGRAB_MEDIA_ROOT".to_string(), "/file-media".to_string());
        vars.insert("TOKGRAB_WWW_ROOT".to_string(), "/file-www".to_string());
        vars.insert("TOKGRAB_PORT".to_string(), "7000".to_string());

        let overrides = ConfigOverrides {
            media_root: Some(PathBuf::from("/override-media")),
            port: Some(9000),
            host: Some("0.0.0.0".into()),
            ..ConfigOverrides::default()
        };

        let config = build_runtime_config(
            &vars,
            |key| {
                if key == "TOKGRAB_PORT" {
                    Some("8000".to_string())
                } else {
                    None
                }
            },
            overrides,
        )
        .unwrap();

        assert_eq!(config.media_root, PathBuf::from("/override-media"));
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "0.0.0.0");
    }

    #[test]
    fn blank_host_override_falls_back() {
        let vars = read_env_file(
            make_env("TOKGRAB_MEDIA_ROOT=\"/m\"\nTOKGRAB_WWW_ROOT=\"/w\"\n").path(),
        )
        .unwrap();
        let config = build_runtime_config(
            &vars,
            |_| None,
            ConfigOverrides {
                host: Some("   ".into()),
                ..ConfigOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(config.host, DEFAULT_HOST);
    }

    #[test]
    fn env_file_handles_export_quotes_and_comments() {
        let cfg = make_env(
            r#"
            export TOKGRAB_MEDIA_ROOT="/media"
            TOKGRAB_WWW_ROOT='/www'
            TOKGRAB_PORT=9090
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("TOKGRAB_MEDIA_ROOT").unwrap(), "/media");
        assert_eq!(vars.get("TOKGRAB_WWW_ROOT").unwrap(), "/www");
        assert_eq!(vars.get("TOKGRAB_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn missing_env_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn invalid_port_falls_back_to_default() {
        let config = config_from(
            "TOKGRAB_MEDIA_ROOT=\"/m\"\nTOKGRAB_WWW_ROOT=\"/w\"\nTOKGRAB_PORT=\"nope\"\n",
        );
        assert_eq!(config.port, DEFAULT_PORT);
    }
}
