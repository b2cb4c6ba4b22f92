use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::CacheOptions;
use crate::session::PageContext;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// URL of the page the cache runs in; origin-absolute paths resolve against it
  #[serde(default = "default_page_url")]
  pub page_url: String,
  /// Cookies in `document.cookie` format (`a=1; b=2`)
  #[serde(default)]
  pub cookies: Option<String>,
  /// Cookie feeding the `bkn` token
  #[serde(default = "default_session_cookie")]
  pub session_cookie: String,
  /// Request timeout for descriptors that do not set one
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
  /// Write logs to daily files in this directory instead of stderr
  pub log_dir: Option<PathBuf>,
}

fn default_page_url() -> String {
  "http://localhost/".to_string()
}

fn default_session_cookie() -> String {
  "skey".to_string()
}

fn default_timeout_ms() -> u64 {
  30_000
}

impl Default for Config {
  fn default() -> Self {
    Self {
      page_url: default_page_url(),
      cookies: None,
      session_cookie: default_session_cookie(),
      timeout_ms: default_timeout_ms(),
      log_dir: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./preload.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/preload/config.yaml
  ///
  /// Without any file the defaults apply.
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
    let local = PathBuf::from("preload.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("preload").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Cookie string, with `PRELOAD_COOKIES` taking precedence over the file.
  pub fn get_cookies(&self) -> String {
    std::env::var("PRELOAD_COOKIES")
      .ok()
      .or_else(|| self.cookies.clone())
      .unwrap_or_default()
  }

  pub fn page_context(&self) -> Result<PageContext> {
    let url = Url::parse(&self.page_url)
      .map_err(|e| eyre!("Invalid page_url '{}': {}", self.page_url, e))?;
    Ok(PageContext::new(url, self.get_cookies()))
  }

  pub fn cache_options(&self) -> CacheOptions {
    CacheOptions {
      session_cookie: self.session_cookie.clone(),
      default_timeout: Duration::from_millis(self.timeout_ms),
    }
  }
}
