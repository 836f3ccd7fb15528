#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::{
    collections::HashMap,
    env, fmt, fs,
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_CONFIG_PATH: &str = "mp4titles.toml";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_UPLOADS_DIR: &str = "uploads";
pub const DEFAULT_WWW_ROOT: &str = "www";
pub const DEFAULT_MAX_UPLOAD_MB: usize = 512;
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_MAX_PROCESSING_SECS: u64 = 600;
pub const DEFAULT_SUBTITLE_PROMPT: &str = "Generate subtitles for the speech in this video in SRT \
format. Use the original spoken language, keep each cue short, and return only the subtitle \
content without any commentary or code fences.";

/// Deployment mode. Decides where uploaded videos are staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Some(Self::Production),
            "development" | "dev" => Some(Self::Development),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
        }
    }
}

/// Everything the backend needs, resolved once at startup and handed to the
/// router. Handlers never look at the process environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: IpAddr,
    pub port: u16,
    pub environment: Environment,
    pub uploads_dir: PathBuf,
    pub www_root: PathBuf,
    pub max_upload_bytes: usize,
    pub allowed_origins: Vec<String>,
    pub gemini: GeminiConfig,
}

#[derive(Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub prompt: String,
    pub poll_interval: Duration,
    pub max_processing_wait: Duration,
}

// Hand-written so the API key never ends up in logs.
impl fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("poll_interval", &self.poll_interval)
            .field("max_processing_wait", &self.max_processing_wait)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<IpAddr>,
    pub port: Option<u16>,
    pub www_root: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

/// Optional TOML file. Every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    server: ServerSection,
    cors: CorsSection,
    gemini: GeminiSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ServerSection {
    host: Option<String>,
    port: Option<u16>,
    environment: Option<String>,
    uploads_dir: Option<PathBuf>,
    www_root: Option<PathBuf>,
    max_upload_mb: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct CorsSection {
    allowed_origins: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct GeminiSection {
    api_key: Option<String>,
    model: Option<String>,
    base_url: Option<String>,
    prompt: Option<String>,
    poll_interval_secs: Option<u64>,
    max_processing_secs: Option<u64>,
}

/// Resolves the configuration in precedence order: explicit overrides, process
/// environment, `.env` file, TOML file, built-in defaults.
pub fn load_config(overrides: ConfigOverrides) -> Result<AppConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    let file_config = match overrides.config_path.as_deref() {
        Some(path) => read_config_file(path)?
            .ok_or_else(|| anyhow!("config file {} does not exist", path.display()))?,
        None => read_config_file(Path::new(DEFAULT_CONFIG_PATH))?.unwrap_or_default(),
    };
    build_config(&file_config, &file_vars, env_var_string, overrides)
}

fn read_config_file(path: &Path) -> Result<Option<FileConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let parsed = toml::from_str(&raw).with_context(|| format!("Parsing {}", path.display()))?;
    Ok(Some(parsed))
}

fn build_config(
    file_config: &FileConfig,
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ConfigOverrides,
) -> Result<AppConfig> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let server = &file_config.server;
    let gemini = &file_config.gemini;

    let host = match overrides.host {
        Some(host) => host,
        None => {
            let raw = lookup("HOST")
                .or_else(|| non_blank(server.host.as_deref()))
                .unwrap_or_else(|| DEFAULT_HOST.to_string());
            parse_host(&raw)?
        }
    };
    let port = overrides
        .port
        .or_else(|| lookup("PORT").and_then(|value| value.parse::<u16>().ok()))
        .or(server.port)
        .unwrap_or(DEFAULT_PORT);

    let environment = match lookup("APP_ENV").or_else(|| non_blank(server.environment.as_deref()))
    {
        Some(raw) => Environment::parse(&raw)
            .ok_or_else(|| anyhow!("APP_ENV must be `production` or `development`, got `{raw}`"))?,
        None => Environment::Development,
    };

    let uploads_dir = lookup("UPLOAD_DIR")
        .map(PathBuf::from)
        .or_else(|| server.uploads_dir.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOADS_DIR));
    let www_root = overrides
        .www_root
        .or_else(|| lookup("WWW_ROOT").map(PathBuf::from))
        .or_else(|| server.www_root.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WWW_ROOT));
    let max_upload_mb = lookup("MAX_UPLOAD_MB")
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .or(server.max_upload_mb.filter(|value| *value > 0))
        .unwrap_or(DEFAULT_MAX_UPLOAD_MB);

    let allowed_origins = match lookup("ALLOWED_ORIGINS") {
        Some(raw) => parse_origins(raw.split(',')),
        None => parse_origins(file_config.cors.allowed_origins.iter().map(String::as_str)),
    };

    let api_key = lookup("GEMINI_API_KEY")
        .or_else(|| non_blank(gemini.api_key.as_deref()))
        .ok_or_else(|| anyhow!("GEMINI_API_KEY not set"))?;
    let model = lookup("GEMINI_MODEL")
        .or_else(|| non_blank(gemini.model.as_deref()))
        .unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string());
    let base_url = lookup("GEMINI_BASE_URL")
        .or_else(|| non_blank(gemini.base_url.as_deref()))
        .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_string())
        .trim_end_matches('/')
        .to_string();
    let prompt = lookup("GEMINI_PROMPT")
        .or_else(|| non_blank(gemini.prompt.as_deref()))
        .unwrap_or_else(|| DEFAULT_SUBTITLE_PROMPT.to_string());
    let poll_interval = Duration::from_secs(
        gemini
            .poll_interval_secs
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
    );
    let max_processing_wait = Duration::from_secs(
        gemini
            .max_processing_secs
            .unwrap_or(DEFAULT_MAX_PROCESSING_SECS),
    );

    Ok(AppConfig {
        host,
        port,
        environment,
        uploads_dir,
        www_root,
        max_upload_bytes: max_upload_mb.saturating_mul(1024 * 1024),
        allowed_origins,
        gemini: GeminiConfig {
            api_key,
            model,
            base_url,
            prompt,
            poll_interval,
            max_processing_wait,
        },
    })
}

fn parse_host(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse::<IpAddr>()
        .with_context(|| format!("expected a valid IPv4 or IPv6 address for HOST, got `{value}`"))
}

/// Origins are compared byte for byte against the `Origin` header, which never
/// carries a trailing slash.
fn parse_origins<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut origins: Vec<String> = Vec::new();
    for value in values {
        let origin = value.trim().trim_end_matches('/');
        if origin.is_empty() || origins.iter().any(|known| known == origin) {
            continue;
        }
        origins.push(origin.to_string());
    }
    origins
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| non_blank(Some(&value)))
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| non_blank(file_vars.get(key).map(String::as_str)))
}

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
        if key.contains(char::is_whitespace) {
            bail!("invalid key `{key}` in {}", path.display());
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
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn config_from_env(contents: &str) -> Result<AppConfig> {
        let file = make_file(contents);
        let vars = read_env_file(file.path()).unwrap();
        build_config(
            &FileConfig::default(),
            &vars,
            |_| None,
            ConfigOverrides::default(),
        )
    }

    fn file_config(contents: &str) -> FileConfig {
        toml::from_str(contents).unwrap()
    }

    #[test]
    fn defaults_apply_when_only_key_is_set() {
        let config = config_from_env("GEMINI_API_KEY=\"secret\"\n").unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.host, DEFAULT_HOST.parse::<IpAddr>().unwrap());
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.uploads_dir, PathBuf::from(DEFAULT_UPLOADS_DIR));
        assert_eq!(config.www_root, PathBuf::from(DEFAULT_WWW_ROOT));
        assert_eq!(config.max_upload_bytes, DEFAULT_MAX_UPLOAD_MB * 1024 * 1024);
        assert!(config.allowed_origins.is_empty());
        assert_eq!(config.gemini.model, DEFAULT_GEMINI_MODEL);
        assert_eq!(config.gemini.base_url, DEFAULT_GEMINI_BASE_URL);
        assert_eq!(config.gemini.prompt, DEFAULT_SUBTITLE_PROMPT);
    }

    #[test]
    fn missing_api_key_is_an_error() {
        let err = config_from_env("PORT=9000\n").unwrap_err();
        assert!(err.to_string().contains("GEMINI_API_KEY"));
    }

    #[test]
    fn env_file_values_are_read() {
        let config = config_from_env(
            "GEMINI_API_KEY=k\nPORT=\"4242\"\nHOST=0.0.0.0\nAPP_ENV=production\n\
             ALLOWED_ORIGINS=\"https://mp4titles.app/, http://localhost:5173\"\nMAX_UPLOAD_MB=64\n",
        )
        .unwrap();
        assert_eq!(config.port, 4242);
        assert_eq!(config.host, "0.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(
            config.allowed_origins,
            vec!["https://mp4titles.app", "http://localhost:5173"]
        );
        assert_eq!(config.max_upload_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn invalid_port_and_limit_fall_back_to_defaults() {
        let config =
            config_from_env("GEMINI_API_KEY=k\nPORT=nope\nMAX_UPLOAD_MB=0\n").unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.max_upload_bytes, DEFAULT_MAX_UPLOAD_MB * 1024 * 1024);
    }

    #[test]
    fn unknown_environment_is_rejected() {
        let err = config_from_env("GEMINI_API_KEY=k\nAPP_ENV=staging\n").unwrap_err();
        assert!(err.to_string().contains("staging"));
    }

    #[test]
    fn invalid_host_is_rejected() {
        let err = config_from_env("GEMINI_API_KEY=k\nHOST=localhost\n").unwrap_err();
        assert!(err.to_string().contains("HOST"));
    }

    #[test]
    fn process_env_beats_env_file() {
        let vars = read_env_file(make_file("GEMINI_API_KEY=k\nPORT=7000\n").path()).unwrap();
        let config = build_config(
            &FileConfig::default(),
            &vars,
            |key| (key == "PORT").then(|| "8000".to_string()),
            ConfigOverrides::default(),
        )
        .unwrap();
        assert_eq!(config.port, 8000);
    }

    #[test]
    fn toml_file_fills_gaps_below_env() {
        let toml = file_config(
            r#"
            [server]
            port = 3000
            environment = "prod"
            uploads_dir = "/srv/uploads"
            www_root = "/srv/www"

            [cors]
            allowed_origins = ["https://mp4titles.app", "https://mp4titles.app/"]

            [gemini]
            api_key = "from-toml"
            model = "gemini-2.0-flash"
            base_url = "http://127.0.0.1:9999/"
            poll_interval_secs = 1
            max_processing_secs = 30
            "#,
        );
        let vars = HashMap::from([("PORT".to_string(), "3100".to_string())]);
        let config = build_config(&toml, &vars, |_| None, ConfigOverrides::default()).unwrap();
        assert_eq!(config.port, 3100);
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.uploads_dir, PathBuf::from("/srv/uploads"));
        assert_eq!(config.www_root, PathBuf::from("/srv/www"));
        assert_eq!(config.allowed_origins, vec!["https://mp4titles.app"]);
        assert_eq!(config.gemini.api_key, "from-toml");
        assert_eq!(config.gemini.model, "gemini-2.0-flash");
        assert_eq!(config.gemini.base_url, "http://127.0.0.1:9999");
        assert_eq!(config.gemini.poll_interval, Duration::from_secs(1));
        assert_eq!(config.gemini.max_processing_wait, Duration::from_secs(30));
    }

    #[test]
    fn toml_rejects_unknown_keys() {
        let parsed: Result<FileConfig, _> = toml::from_str("[server]\nprot = 1\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn overrides_take_precedence() {
        let vars = HashMap::from([
            ("GEMINI_API_KEY".to_string(), "k".to_string()),
            ("PORT".to_string(), "7000".to_string()),
            ("HOST".to_string(), "10.0.0.1".to_string()),
            ("WWW_ROOT".to_string(), "/file-www".to_string()),
        ]);
        let config = build_config(
            &FileConfig::default(),
            &vars,
            |_| None,
            ConfigOverrides {
                host: Some("0.0.0.0".parse().unwrap()),
                port: Some(9000),
                www_root: Some(PathBuf::from("/override-www")),
                ..ConfigOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "0.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(config.www_root, PathBuf::from("/override-www"));
    }

    #[test]
    fn blank_values_count_as_unset() {
        let vars = read_env_file(make_file("GEMINI_API_KEY=k\nGEMINI_MODEL=\"  \"\n").path())
            .unwrap();
        let config = build_config(
            &FileConfig::default(),
            &vars,
            |_| None,
            ConfigOverrides::default(),
        )
        .unwrap();
        assert_eq!(config.gemini.model, DEFAULT_GEMINI_MODEL);
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_file(
            r#"
            export GEMINI_API_KEY="abc"
            APP_ENV='production'
            HOST =  "0.0.0.0"
            PORT=9090
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("GEMINI_API_KEY").unwrap(), "abc");
        assert_eq!(vars.get("APP_ENV").unwrap(), "production");
        assert_eq!(vars.get("HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn load_config_requires_explicit_config_file_to_exist() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(ConfigOverrides {
            config_path: Some(dir.path().join("absent.toml")),
            env_path: Some(dir.path().join("absent.env")),
            ..ConfigOverrides::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn debug_output_redacts_api_key() {
        let config = config_from_env("GEMINI_API_KEY=super-secret\n").unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn environment_parse_accepts_short_names() {
        assert_eq!(Environment::parse("PROD"), Some(Environment::Production));
        assert_eq!(Environment::parse(" dev "), Some(Environment::Development));
        assert_eq!(Environment::parse("qa"), None);
        assert_eq!(Environment::Production.as_str(), "production");
    }
}
