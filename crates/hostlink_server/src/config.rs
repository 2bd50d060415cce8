use hostlink_core::ShellPolicy;
use hostlink_core::router::{DEFAULT_MAX_CHUNK_SIZE, DEFAULT_MAX_FILE_SIZE, RouterConfig};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Token used when `SERVER_TOKEN` is unset. Startup warns loudly about it.
pub const DEFAULT_TOKEN: &str = "CHANGE_ME_TOKEN";

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: localhost)
    pub host: String,
    /// Server port (default: 8443)
    pub port: u16,
    /// Shared secret for WebSocket auth and the file API
    pub token: String,
    /// Largest declared transfer or upload in bytes (default: 500 MiB)
    pub max_file_size: u64,
    /// Largest decoded relay chunk in bytes (default: 64 KiB)
    pub max_chunk_size: u64,
    /// Sandbox root (default: the user's home directory)
    pub root_dir: PathBuf,
    /// Let devices overwrite the host clipboard (default: false)
    pub allow_remote_clipboard_set: bool,
    /// Let devices run commands on the host (default: false)
    pub allow_shell: bool,
    /// Allowed command base names; empty allows any (comma-separated)
    pub shell_whitelist: Vec<String>,
    /// Concurrently running commands (default: 4)
    pub shell_max_concurrent: usize,
    /// Poll the host clipboard for changes (default: true)
    pub clipboard_watcher: bool,
    /// Host clipboard poll interval (default: 2000 ms)
    pub clipboard_poll: Duration,
    /// WebSocket ping interval; a connection missing one pong is dropped (default: 30 s)
    pub heartbeat_interval: Duration,
    /// CORS allowed origins (comma-separated)
    pub cors_origins: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_source(|key| env::var(key).ok())
    }

    /// Load configuration from any key lookup.
    pub fn from_source(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = var("HOST").unwrap_or_else(|| "localhost".to_string());
        let port = var("PORT")
            .unwrap_or_else(|| "8443".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let token = var("SERVER_TOKEN")
            .filter(|token| !token.is_empty())
            .unwrap_or_else(|| DEFAULT_TOKEN.to_string());

        let max_file_size = parse_or(var("MAX_FILE_SIZE"), DEFAULT_MAX_FILE_SIZE);
        let max_chunk_size = parse_or(var("MAX_CHUNK_SIZE"), DEFAULT_MAX_CHUNK_SIZE);

        let root_dir = match var("ROOT_DIR").filter(|dir| !dir.is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir().ok_or(ConfigError::MissingRootDir)?,
        };

        let shell_whitelist = list(var("SHELL_WHITELIST"));
        let cors_origins = list(var("CORS_ORIGINS"));

        Ok(Config {
            host,
            port,
            token,
            max_file_size,
            max_chunk_size,
            root_dir,
            allow_remote_clipboard_set: flag(var("ALLOW_REMOTE_CLIPBOARD_SET"), false),
            allow_shell: flag(var("ALLOW_SHELL"), false),
            shell_whitelist,
            shell_max_concurrent: parse_or(var("SHELL_MAX_CONCURRENT"), 4usize).max(1),
            clipboard_watcher: flag(var("CLIPBOARD_WATCHER"), true),
            clipboard_poll: Duration::from_millis(parse_or(var("CLIPBOARD_POLL_MS"), 2000u64).max(100)),
            heartbeat_interval: Duration::from_secs(
                parse_or(var("HEARTBEAT_INTERVAL_SECS"), 30u64).max(1),
            ),
            cors_origins,
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn uses_default_token(&self) -> bool {
        self.token == DEFAULT_TOKEN
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            token: self.token.clone(),
            allow_remote_clipboard_set: self.allow_remote_clipboard_set,
            max_file_size: self.max_file_size,
            max_chunk_size: self.max_chunk_size,
        }
    }

    pub fn shell_policy(&self) -> ShellPolicy {
        ShellPolicy {
            enabled: self.allow_shell,
            whitelist: self.shell_whitelist.clone(),
        }
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn flag(value: Option<String>, default: bool) -> bool {
    match value {
        Some(v) => v.trim().eq_ignore_ascii_case("true"),
        None => default,
    }
}

fn list(value: Option<String>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    MissingRootDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "Invalid PORT environment variable"),
            ConfigError::MissingRootDir => {
                write!(f, "ROOT_DIR is not set and no home directory was found")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_source(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[("ROOT_DIR", "/srv/share")]).unwrap();
        assert_eq!(config.server_addr(), "localhost:8443");
        assert!(config.uses_default_token());
        assert_eq!(config.max_file_size, 524_288_000);
        assert_eq!(config.max_chunk_size, 65_536);
        assert_eq!(config.root_dir, PathBuf::from("/srv/share"));
        assert!(!config.allow_shell);
        assert!(!config.allow_remote_clipboard_set);
        assert!(config.clipboard_watcher);
        assert_eq!(config.clipboard_poll, Duration::from_secs(2));
        assert_eq!(config.shell_max_concurrent, 4);
    }

    #[test]
    fn flags_and_lists() {
        let config = load(&[
            ("ROOT_DIR", "/srv"),
            ("SERVER_TOKEN", "s3cret"),
            ("ALLOW_SHELL", "true"),
            ("ALLOW_REMOTE_CLIPBOARD_SET", "yes"),
            ("SHELL_WHITELIST", " ls, git ,,echo"),
            ("CLIPBOARD_WATCHER", "false"),
        ])
        .unwrap();
        assert!(!config.uses_default_token());
        assert!(config.allow_shell);
        // Only the literal "true" enables a flag.
        assert!(!config.allow_remote_clipboard_set);
        assert!(!config.clipboard_watcher);
        assert_eq!(config.shell_whitelist, vec!["ls", "git", "echo"]);
        assert!(config.shell_policy().authorize("git").is_ok());
        assert_eq!(config.router_config().token, "s3cret");
    }

    #[test]
    fn bad_numbers_fall_back_but_bad_port_fails() {
        let config = load(&[("ROOT_DIR", "/srv"), ("MAX_FILE_SIZE", "lots")]).unwrap();
        assert_eq!(config.max_file_size, 524_288_000);

        let err = load(&[("ROOT_DIR", "/srv"), ("PORT", "http")]).unwrap_err();
        assert_eq!(err.to_string(), "Invalid PORT environment variable");
    }
}
