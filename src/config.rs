use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  /// The application's own origin. Requests to any other origin bypass the cache.
  pub origin: Option<Url>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Namespace prefix; names are `{prefix}-{version}` and `{prefix}-api-{version}`
  pub prefix: String,
  /// Bump whenever the manifest changes so activation evicts the old shell
  pub version: String,
  /// Application shell paths, relative to the origin
  pub manifest: Vec<String>,
  /// Path substrings that mark a request as an API call
  pub api_markers: Vec<String>,
  /// `error` text of the synthesized offline payload
  pub offline_message: String,
  /// Database location (defaults to the user data directory)
  pub database: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "app-shell".to_string(),
      version: "v1".to_string(),
      manifest: ["/", "/index.html", "/styles.css", "/script.js"]
        .into_iter()
        .map(String::from)
        .collect(),
      api_markers: vec!["/odata/".to_string(), "/web-service/".to_string()],
      offline_message: "no connectivity".to_string(),
      database: None,
    }
  }
}

impl CacheConfig {
  /// Namespace holding the static manifest.
  pub fn shell_namespace(&self) -> String {
    format!("{}-{}", self.prefix, self.version)
  }

  /// Namespace holding write-through API responses.
  pub fn api_namespace(&self) -> String {
    format!("{}-api-{}", self.prefix, self.version)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkConfig {
  /// Transport-level timeout. The cache policy itself never times out.
  pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Default filter when RUST_LOG is unset
  pub level: String,
  /// Write daily-rolling log files here instead of stderr
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shellcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shellcache/config.yaml
  ///
  /// Falls back to defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shellcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shellcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.cache.prefix.is_empty() || self.cache.version.is_empty() {
      return Err(eyre!("cache.prefix and cache.version must not be empty"));
    }
    if self.cache.api_markers.iter().any(String::is_empty) {
      return Err(eyre!("cache.api_markers must not contain empty markers"));
    }
    if let Some(origin) = &self.origin {
      for path in &self.cache.manifest {
        origin
          .join(path)
          .map_err(|e| eyre!("Invalid manifest path '{}': {}", path, e))?;
      }
    }
    Ok(())
  }

  /// The configured origin, required by every command that touches the network.
  pub fn origin(&self) -> Result<&Url> {
    self.origin.as_ref().ok_or_else(|| {
      eyre!("No origin configured. Set `origin` in the config file or pass --origin.")
    })
  }
}
