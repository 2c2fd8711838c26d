use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::Deserialize;

/// Fallback listen address when neither config nor CLI provide one.
///
/// `":2011"` is shorthand for "all interfaces, port 2011"; see
/// [`crate::ferry::net::normalize_bind_addr`].
pub const DEFAULT_LISTEN_ADDR: &str = ":2011";

const DEFAULT_BUFFER_SIZE: usize = 65536;
const DEFAULT_MAX_HANDSHAKE_BYTES: usize = 512;

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        if p.as_os_str().is_empty() {
            anyhow::bail!("config: empty config path");
        }
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap already maps FERRY_CONFIG into the flag value when unset, but keep the precedence
    // explicit by treating it as "env" when present.
    if let Some(p) = std::env::var_os("FERRY_CONFIG") {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: PathBuf::from(p),
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    let candidates = ["ferry.toml", "ferry.yaml", "ferry.yml"];
    for c in candidates {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Some(p);
            }
        }
    }
    None
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    // Linux: system-wide default.
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/ferry/ferry.toml"))
    }

    // Other OSes: per-user config dir.
    #[cfg(not(target_os = "linux"))]
    {
        let proj = directories::ProjectDirs::from("com", "ferry", "ferry")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("ferry.toml"))
    }
}

/// Load the config at `path`, falling back to built-in defaults when the file
/// does not exist. Ferry runs fine with no config at all.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = match fs::read(path) {
        Ok(d) => d,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Config::from_file_config(FileConfig::default()));
        }
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {ext:?} (expected .toml or .yaml/.yml)"),
    };

    Ok(Config::from_file_config(fc))
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub buffer_size: usize,
    pub max_handshake_bytes: usize,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Config {
    fn from_file_config(fc: FileConfig) -> Self {
        let listen_addr = if fc.listen_addr.trim().is_empty() {
            DEFAULT_LISTEN_ADDR.to_string()
        } else {
            fc.listen_addr.trim().to_string()
        };

        // Clamp nonsensical sizes back to defaults rather than failing startup.
        let buffer_size = if fc.buffer_size <= 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            fc.buffer_size as usize
        };
        let max_handshake_bytes = if fc.max_handshake_bytes <= 0 {
            DEFAULT_MAX_HANDSHAKE_BYTES
        } else {
            fc.max_handshake_bytes as usize
        };

        let fl = fc.logging.unwrap_or_default();
        let logging = LoggingConfig {
            level: or_default(fl.level, "info"),
            format: or_default(fl.format, "text"),
            output: or_default(fl.output, "stderr"),
            add_source: fl.add_source.unwrap_or(false),
        };

        Self {
            listen_addr,
            buffer_size,
            max_handshake_bytes,
            logging,
        }
    }
}

fn or_default(v: Option<String>, def: &str) -> String {
    match v {
        Some(s) if !s.trim().is_empty() => s.trim().to_string(),
        _ => def.to_string(),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    listen_addr: String,

    #[serde(default)]
    buffer_size: i64,

    #[serde(default)]
    max_handshake_bytes: i64,

    logging: Option<FileLogging>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    add_source: Option<bool>,
}
