use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// Directory name holding config, state db, and tmp files under a sync root.
pub const CONTROL_DIR_NAME: &str = ".wpdrive";
const CONFIG_FILE_NAME: &str = "config.json";
const DEFAULT_IGNORE: &str = ".wpdrive/**";

#[derive(Debug, Default, Deserialize, Clone)]
struct PartialConfig {
    #[serde(default)]
    root: Option<PathBuf>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    app_password: Option<String>,
    #[serde(default)]
    chunk_size_mb: Option<u64>,
    #[serde(default)]
    min_chunk_size_mb: Option<u64>,
    #[serde(default)]
    timeout_seconds: Option<u64>,
    #[serde(default)]
    ignore: Option<Vec<String>>,
    #[serde(default)]
    device_label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    pub url: String,
    pub user: String,
    pub app_password: String,
    pub chunk_size_mb: u64,
    pub min_chunk_size_mb: u64,
    pub timeout_seconds: u64,
    pub ignore: Vec<String>,
    pub device_label: Option<String>,
    pub config_path: PathBuf,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub root: Option<PathBuf>,
    pub url: Option<String>,
    pub user: Option<String>,
    pub app_password: Option<String>,
    pub chunk_size_mb: Option<u64>,
    pub min_chunk_size_mb: Option<u64>,
    pub timeout_seconds: Option<u64>,
    pub device_label: Option<String>,
}

impl Config {
    pub fn default_chunk_size_mb() -> u64 {
        32
    }

    pub fn default_min_chunk_size_mb() -> u64 {
        4
    }

    pub fn default_timeout_seconds() -> u64 {
        60
    }

    pub fn default_ignore() -> Vec<String> {
        vec![DEFAULT_IGNORE.to_string()]
    }

    pub fn control_dir(&self) -> PathBuf {
        self.root.join(CONTROL_DIR_NAME)
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.control_dir().join("wpdrive.log")
    }

    pub fn resolved_device_label(&self) -> String {
        self.device_label.clone().unwrap_or_else(|| {
            hostname().unwrap_or_else(|| "device".to_string())
        })
    }

    /// Walks up from `start_dir` looking for `.wpdrive/config.json`.
    /// Returns `None` if no ancestor has one.
    pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
        let mut dir = Some(absolutize(start_dir));
        while let Some(d) = dir {
            let candidate = d.join(CONTROL_DIR_NAME).join(CONFIG_FILE_NAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            dir = d.parent().map(|p| p.to_path_buf());
        }
        None
    }

    pub fn load_with_overrides(path: &Path, overrides: ConfigOverrides) -> Result<Self> {
        let file_cfg = load_partial(path)?;
        let env_cfg = read_env_config();

        let root_default = path
            .parent()
            .and_then(|control_dir| control_dir.parent())
            .map(|p| p.to_path_buf());

        let root = overrides
            .root
            .or(env_cfg.root)
            .or(file_cfg.root)
            .or(root_default)
            .context("root directory could not be determined")?;
        let url = overrides
            .url
            .or(env_cfg.url)
            .or(file_cfg.url)
            .context("url is required")?;
        let user = overrides
            .user
            .or(env_cfg.user)
            .or(file_cfg.user)
            .unwrap_or_default();
        let app_password = overrides
            .app_password
            .or(env_cfg.app_password)
            .or(file_cfg.app_password)
            .unwrap_or_default();
        let chunk_size_mb = overrides
            .chunk_size_mb
            .or(env_cfg.chunk_size_mb)
            .or(file_cfg.chunk_size_mb)
            .unwrap_or_else(Self::default_chunk_size_mb);
        let min_chunk_size_mb = overrides
            .min_chunk_size_mb
            .or(env_cfg.min_chunk_size_mb)
            .or(file_cfg.min_chunk_size_mb)
            .unwrap_or_else(Self::default_min_chunk_size_mb);
        let timeout_seconds = overrides
            .timeout_seconds
            .or(env_cfg.timeout_seconds)
            .or(file_cfg.timeout_seconds)
            .unwrap_or_else(Self::default_timeout_seconds);
        let ignore = file_cfg.ignore.unwrap_or_else(Self::default_ignore);
        let device_label = overrides
            .device_label
            .or(env_cfg.device_label)
            .or(file_cfg.device_label);

        let cfg = Config {
            root: absolutize(&root),
            url,
            user,
            app_password,
            chunk_size_mb,
            min_chunk_size_mb,
            timeout_seconds,
            ignore,
            device_label,
            config_path: absolutize(path),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Builds and persists a fresh config for `wpdrive init`.
    pub fn init(path: &Path, root: &Path, url: &str, user: &str, app_password: &str) -> Result<Self> {
        let cfg = Config {
            root: absolutize(root),
            url: url.to_string(),
            user: user.to_string(),
            app_password: app_password.to_string(),
            chunk_size_mb: Self::default_chunk_size_mb(),
            min_chunk_size_mb: Self::default_min_chunk_size_mb(),
            timeout_seconds: Self::default_timeout_seconds(),
            ignore: Self::default_ignore(),
            device_label: None,
            config_path: absolutize(path),
        };
        cfg.validate()?;
        cfg.save()?;
        Ok(cfg)
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let persisted = PersistedConfig {
            root: &self.root,
            url: &self.url,
            user: &self.user,
            app_password: &self.app_password,
            chunk_size_mb: self.chunk_size_mb,
            min_chunk_size_mb: self.min_chunk_size_mb,
            timeout_seconds: self.timeout_seconds,
            ignore: &self.ignore,
            device_label: &self.device_label,
        };
        let data = serde_json::to_vec_pretty(&persisted).context("serialize config")?;
        std::fs::write(&self.config_path, data)
            .with_context(|| format!("write {}", self.config_path.display()))?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        validate_url(&self.url).context("url")?;
        if self.user.trim().is_empty() {
            anyhow::bail!("user must not be empty");
        }
        if self.app_password.trim().is_empty() {
            anyhow::bail!("app_password must not be empty");
        }
        if self.min_chunk_size_mb == 0 {
            anyhow::bail!("min_chunk_size_mb must be at least 1");
        }
        if self.chunk_size_mb < self.min_chunk_size_mb {
            anyhow::bail!("chunk_size_mb must be >= min_chunk_size_mb");
        }
        if self.timeout_seconds == 0 {
            anyhow::bail!("timeout_seconds must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct PersistedConfig<'a> {
    root: &'a PathBuf,
    url: &'a str,
    user: &'a str,
    app_password: &'a str,
    chunk_size_mb: u64,
    min_chunk_size_mb: u64,
    timeout_seconds: u64,
    ignore: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    device_label: &'a Option<String>,
}

fn load_partial(path: &Path) -> Result<PartialConfig> {
    if !path.exists() {
        return Ok(PartialConfig::default());
    }
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    serde_json::from_str(&data).context("parse config json")
}

pub(crate) fn validate_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)?;
    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("url must be http or https");
    }
    Ok(())
}

fn read_env_config() -> PartialConfig {
    let mut out = PartialConfig::default();
    if let Ok(v) = std::env::var("WPDRIVE_ROOT") {
        if !v.trim().is_empty() {
            out.root = Some(PathBuf::from(v.trim()));
        }
    }
    if let Ok(v) = std::env::var("WPDRIVE_URL") {
        if !v.trim().is_empty() {
            out.url = Some(v.trim().to_string());
        }
    }
    if let Ok(v) = std::env::var("WPDRIVE_USER") {
        if !v.trim().is_empty() {
            out.user = Some(v.trim().to_string());
        }
    }
    if let Ok(v) = std::env::var("WPDRIVE_APP_PASSWORD") {
        if !v.trim().is_empty() {
            out.app_password = Some(v.trim().to_string());
        }
    }
    if let Ok(v) = std::env::var("WPDRIVE_CHUNK_SIZE_MB") {
        if let Ok(n) = v.trim().parse() {
            out.chunk_size_mb = Some(n);
        }
    }
    if let Ok(v) = std::env::var("WPDRIVE_MIN_CHUNK_SIZE_MB") {
        if let Ok(n) = v.trim().parse() {
            out.min_chunk_size_mb = Some(n);
        }
    }
    if let Ok(v) = std::env::var("WPDRIVE_TIMEOUT_SECONDS") {
        if let Ok(n) = v.trim().parse() {
            out.timeout_seconds = Some(n);
        }
    }
    if let Ok(v) = std::env::var("WPDRIVE_DEVICE_LABEL") {
        if !v.trim().is_empty() {
            out.device_label = Some(v.trim().to_string());
        }
    }
    out
}

fn hostname() -> Option<String> {
    #[cfg(unix)]
    {
        let out = std::process::Command::new("hostname").output().ok()?;
        if out.status.success() {
            let s = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if !s.is_empty() {
                return Some(s);
            }
        }
    }
    None
}

fn absolutize(path: &Path) -> PathBuf {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    };
    std::fs::canonicalize(&abs).unwrap_or(abs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::{env, fs};

    static ENV_LOCK: once_cell::sync::Lazy<Mutex<()>> =
        once_cell::sync::Lazy::new(|| Mutex::new(()));

    const ENV_KEYS: &[&str] = &[
        "WPDRIVE_ROOT",
        "WPDRIVE_URL",
        "WPDRIVE_USER",
        "WPDRIVE_APP_PASSWORD",
        "WPDRIVE_CHUNK_SIZE_MB",
        "WPDRIVE_MIN_CHUNK_SIZE_MB",
        "WPDRIVE_TIMEOUT_SECONDS",
        "WPDRIVE_DEVICE_LABEL",
    ];

    struct EnvGuard {
        saved: HashMap<String, Option<String>>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let mut saved = HashMap::new();
            for k in keys {
                saved.insert((*k).to_string(), env::var(k).ok());
                env::remove_var(k);
            }
            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (k, v) in self.saved.drain() {
                match v {
                    Some(val) => env::set_var(k, val),
                    None => env::remove_var(k),
                }
            }
        }
    }

    fn tmp(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "wpdrive-config-test-{prefix}-{}",
            uuid::Uuid::new_v4()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn init_writes_config_with_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(ENV_KEYS);

        let root = tmp("init-root");
        let cfg_path = root.join(CONTROL_DIR_NAME).join(CONFIG_FILE_NAME);
        let cfg = Config::init(&cfg_path, &root, "https://example.com", "alice", "secret").unwrap();
        assert_eq!(cfg.chunk_size_mb, 32);
        assert_eq!(cfg.min_chunk_size_mb, 4);
        assert_eq!(cfg.ignore, vec![".wpdrive/**".to_string()]);
        assert!(cfg_path.exists());

        let reloaded = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap();
        assert_eq!(reloaded.url, "https://example.com");
        assert_eq!(reloaded.user, "alice");
        assert_eq!(reloaded.app_password, "secret");
    }

    #[test]
    fn find_config_walks_up_ancestors() {
        let root = tmp("find-config");
        let cfg_dir = root.join(CONTROL_DIR_NAME);
        fs::create_dir_all(&cfg_dir).unwrap();
        fs::write(cfg_dir.join(CONFIG_FILE_NAME), "{}").unwrap();

        let nested = root.join("a").join("b");
        fs::create_dir_all(&nested).unwrap();

        let found = Config::find_config(&nested).unwrap();
        assert_eq!(found, cfg_dir.join(CONFIG_FILE_NAME));
    }

    #[test]
    fn find_config_returns_none_when_absent() {
        let root = tmp("find-config-absent");
        assert!(Config::find_config(&root).is_none());
    }

    #[test]
    fn reject_invalid_url_scheme() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(ENV_KEYS);

        let root = tmp("bad-url");
        let cfg_path = root.join(CONTROL_DIR_NAME).join(CONFIG_FILE_NAME);
        fs::create_dir_all(cfg_path.parent().unwrap()).unwrap();
        fs::write(
            &cfg_path,
            r#"{"url":"ftp://bad.example.com","user":"alice","app_password":"x"}"#,
        )
        .unwrap();
        let err = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("url"));
    }

    #[test]
    fn reject_chunk_size_smaller_than_min() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(ENV_KEYS);

        let root = tmp("bad-chunk-size");
        let cfg_path = root.join(CONTROL_DIR_NAME).join(CONFIG_FILE_NAME);
        fs::create_dir_all(cfg_path.parent().unwrap()).unwrap();
        fs::write(
            &cfg_path,
            r#"{"url":"https://example.com","user":"alice","app_password":"x","chunk_size_mb":2,"min_chunk_size_mb":4}"#,
        )
        .unwrap();
        let err = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("chunk_size_mb"));
    }

    #[test]
    fn overrides_beat_env_beat_file() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(ENV_KEYS);

        let root = tmp("precedence");
        let cfg_path = root.join(CONTROL_DIR_NAME).join(CONFIG_FILE_NAME);
        fs::create_dir_all(cfg_path.parent().unwrap()).unwrap();
        fs::write(
            &cfg_path,
            r#"{"url":"https://file.example.com","user":"file-user","app_password":"file-pw"}"#,
        )
        .unwrap();

        env::set_var("WPDRIVE_USER", "env-user");
        env::set_var("WPDRIVE_URL", "https://env.example.com");

        let cfg = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.user, "env-user");
        assert_eq!(cfg.url, "https://env.example.com");

        let overrides = ConfigOverrides {
            user: Some("flag-user".to_string()),
            ..Default::default()
        };
        let cfg = Config::load_with_overrides(&cfg_path, overrides).unwrap();
        assert_eq!(cfg.user, "flag-user");
        assert_eq!(cfg.url, "https://env.example.com");
    }

    #[test]
    fn default_device_label_falls_back_when_unset() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(ENV_KEYS);

        let root = tmp("device-label");
        let cfg_path = root.join(CONTROL_DIR_NAME).join(CONFIG_FILE_NAME);
        let cfg = Config::init(&cfg_path, &root, "https://example.com", "alice", "secret").unwrap();
        assert!(!cfg.resolved_device_label().is_empty());
    }

    #[test]
    fn control_dir_and_log_path_are_under_root() {
        let root = PathBuf::from("/tmp/example-root");
        let cfg = Config {
            root: root.clone(),
            url: "https://example.com".to_string(),
            user: "alice".to_string(),
            app_password: "secret".to_string(),
            chunk_size_mb: 32,
            min_chunk_size_mb: 4,
            timeout_seconds: 60,
            ignore: Config::default_ignore(),
            device_label: None,
            config_path: root.join(CONTROL_DIR_NAME).join(CONFIG_FILE_NAME),
        };
        assert_eq!(cfg.control_dir(), root.join(".wpdrive"));
        assert_eq!(cfg.log_file_path(), root.join(".wpdrive").join("wpdrive.log"));
    }
}
