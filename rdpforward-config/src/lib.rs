use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Runtime configuration for the rdpforward server.
///
/// Built from an optional JSON file overlaid with command-line flags and
/// frozen at startup; every task holds it behind an `Arc` and nothing mutates
/// it afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    /// Local bind endpoint, e.g. `":3389"` or `"0.0.0.0:3389"`.
    pub listen: String,
    /// Upstream `host:port`. Required before the server can run.
    pub target: String,
    /// Exact-match whitelist for TLS SNI values. Empty means unrestricted.
    pub sni_whitelist: Whitelist,
    /// Exact-match whitelist for heuristic RDP client names. Empty means unrestricted.
    pub client_whitelist: Whitelist,
    /// Enables DEBUG-level per-packet logging.
    pub debug: bool,
    /// Optional append-only log file. `None` means console only.
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ":3389".to_string(),
            target: String::new(),
            sni_whitelist: Whitelist::default(),
            client_whitelist: Whitelist::default(),
            debug: false,
            log_file: None,
        }
    }
}

/// JSON file model. Unknown keys are ignored; every key is optional.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    listen: String,
    #[serde(default)]
    target: String,
    #[serde(default)]
    sni_whitelist: Vec<String>,
    #[serde(default)]
    client_whitelist: Vec<String>,
    #[serde(default)]
    debug: bool,
    #[serde(default)]
    log_file: String,
}

impl Config {
    /// Loads configuration from a JSON file.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use rdpforward_config::Config;
    /// use std::path::Path;
    ///
    /// let config = Config::from_file(Path::new("config.json")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(ConfigError::Read)?;
        Self::parse(&contents)
    }

    /// Parses configuration from a JSON string.
    ///
    /// # Examples
    ///
    /// ```
    /// use rdpforward_config::Config;
    ///
    /// let config = Config::parse(r#"{"target": "10.0.0.2:3389"}"#).unwrap();
    /// assert_eq!(config.listen, ":3389");
    /// assert_eq!(config.target, "10.0.0.2:3389");
    /// ```
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = serde_json::from_str(contents).map_err(ConfigError::Parse)?;

        let mut config = Config {
            target: file.target,
            sni_whitelist: Whitelist::from_entries(file.sni_whitelist),
            client_whitelist: Whitelist::from_entries(file.client_whitelist),
            debug: file.debug,
            ..Config::default()
        };
        if !file.listen.is_empty() {
            config.listen = file.listen;
        }
        if !file.log_file.is_empty() {
            config.log_file = Some(PathBuf::from(file.log_file));
        }
        Ok(config)
    }

    /// Checks that every field required to run the server is present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target.is_empty() {
            return Err(ConfigError::MissingTarget);
        }
        Ok(())
    }

    /// The address handed to the TCP listener. A bare `":port"` value binds
    /// all interfaces.
    pub fn bind_addr(&self) -> String {
        if self.listen.starts_with(':') {
            format!("0.0.0.0{}", self.listen)
        } else {
            self.listen.clone()
        }
    }
}

/// A set of case-sensitive exact-match admission keys.
///
/// Entries are trimmed of surrounding whitespace and empty entries are
/// dropped; insertion order is preserved for display.
///
/// # Examples
///
/// ```
/// use rdpforward_config::Whitelist;
///
/// let list = Whitelist::from_csv("a.example, b.example,,");
/// assert!(list.contains("a.example"));
/// assert!(!list.contains("A.example"));
/// assert_eq!(list.to_string(), "a.example,b.example");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Whitelist {
    entries: Vec<String>,
}

impl Whitelist {
    /// Builds a whitelist from raw entries, trimming each and dropping
    /// empties and duplicates.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let entries = entries
            .into_iter()
            .map(|entry| entry.as_ref().trim().to_string())
            .filter(|entry| !entry.is_empty())
            .filter(|entry| seen.insert(entry.clone()))
            .collect();
        Self { entries }
    }

    /// Builds a whitelist from a comma-separated command-line value.
    pub fn from_csv(csv: &str) -> Self {
        Self::from_entries(csv.split(','))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Exact byte-for-byte membership. No case folding, no punycode
    /// normalization, no suffix matching.
    pub fn contains(&self, value: &str) -> bool {
        self.entries.iter().any(|entry| entry == value)
    }
}

impl fmt::Display for Whitelist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entries.join(","))
    }
}

/// Errors raised while building the runtime configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    Read(std::io::Error),
    /// The configuration file is not valid JSON.
    Parse(serde_json::Error),
    /// No upstream target was provided by either the file or the flags.
    MissingTarget,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read(e) => write!(f, "读取配置文件失败: {}", e),
            ConfigError::Parse(e) => write!(f, "解析配置文件失败: {}", e),
            ConfigError::MissingTarget => write!(f, "必须指定 --target 参数或配置文件"),
        }
    }
}

impl std::error::Error for ConfigError {}
