use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Runtime settings, read from the environment (and `.env` via dotenvy).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub data_dir: PathBuf,
    pub port: u16,
    pub public_base_url: String,
    pub lrs_endpoint: String,
    pub actor_home_page: String,
    pub fetch_token_ttl_secs: i64,
    pub max_package_bytes: u64,
    pub remote_lrs_url: Option<String>,
    pub remote_lrs_auth: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port: u16 = parse_or("PORT", 8081)?;
        let public_base_url = env::var("PUBLIC_BASE_URL")
            .unwrap_or_else(|_| format!("http://localhost:{port}"))
            .trim_end_matches('/')
            .to_string();
        Ok(Config {
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://cmi5.db".into()),
            data_dir: PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "./data".into())),
            port,
            lrs_endpoint: env::var("LRS_ENDPOINT").unwrap_or_else(|_| format!("{public_base_url}/xapi")),
            actor_home_page: env::var("ACTOR_HOME_PAGE").unwrap_or_else(|_| public_base_url.clone()),
            fetch_token_ttl_secs: parse_or("FETCH_TOKEN_TTL_SECS", 3600)?,
            max_package_bytes: parse_or("MAX_PACKAGE_BYTES", 100 * 1024 * 1024)?,
            remote_lrs_url: env::var("REMOTE_LRS_URL").ok().filter(|s| !s.is_empty()),
            remote_lrs_auth: env::var("REMOTE_LRS_AUTH").ok().filter(|s| !s.is_empty()),
            public_base_url,
        })
    }
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().with_context(|| format!("{key} has invalid value '{raw}'")),
        Err(_) => Ok(default),
    }
}
