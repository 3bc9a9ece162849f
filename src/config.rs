use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SecurityConfig {
    /// Bearer token that authenticates as platform super admin. Unset disables it.
    pub admin_token: Option<String>,
    pub enable_hsts: Option<bool>,
    pub hsts_max_age: Option<u64>,
    pub hsts_include_subdomains: Option<bool>,
    pub csp: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaginationConfig {
    pub default_page_size: u64,
    pub max_page_size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    pub max_rows: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub security: Option<SecurityConfig>,
    pub cache: CacheConfig,
    pub pagination: PaginationConfig,
    pub export: ExportConfig,
    pub jobs: JobsConfig,
}

const DEFAULTS: &str = include_str!("../config/default.toml");

impl Default for AppConfig {
    fn default() -> Self {
        // Fallback: parse the embedded default TOML
        match ::config::Config::builder()
            .add_source(::config::File::from_str(DEFAULTS, ::config::FileFormat::Toml))
            .build()
            .and_then(|cfg| cfg.try_deserialize())
        {
            Ok(app_cfg) => app_cfg,
            Err(e) => panic!("embedded default config is invalid: {}", e),
        }
    }
}

impl AppConfig {
    pub fn admin_token(&self) -> Option<&str> {
        self.security
            .as_ref()
            .and_then(|s| s.admin_token.as_deref())
            .filter(|t| !t.trim().is_empty())
    }
}

pub fn load() -> anyhow::Result<AppConfig> {
    // Load .env first (optional)
    let _ = dotenvy::dotenv();

    let mut builder = ::config::Config::builder()
        .add_source(::config::File::from_str(DEFAULTS, ::config::FileFormat::Toml))
        // Optional local file: admitdesk.toml (in CWD)
        .add_source(::config::File::with_name("admitdesk").required(false));

    if let Ok(custom_path) = std::env::var("ADMITDESK_CONFIG") {
        builder = builder.add_source(::config::File::with_name(&custom_path).required(false));
    }
    // Environment variables last to have highest precedence
    builder = builder.add_source(::config::Environment::with_prefix("ADMITDESK").separator("__"));

    let cfg = builder.build()?;
    let app_cfg: AppConfig = cfg.try_deserialize()?;
    validate(&app_cfg)?;
    Ok(app_cfg)
}

pub fn validate(cfg: &AppConfig) -> anyhow::Result<()> {
    if cfg.server.port == 0 {
        return Err(anyhow::anyhow!("invalid server.port: {}", cfg.server.port));
    }
    #[cfg(unix)]
    if cfg.server.port < 1024 {
        tracing::warn!("Using privileged port {} - may require elevated permissions", cfg.server.port);
    }

    if cfg.database.max_connections == 0 {
        return Err(anyhow::anyhow!("database.max_connections must be > 0"));
    }
    if cfg.cache.capacity == 0 {
        return Err(anyhow::anyhow!("cache.capacity must be > 0"));
    }
    if cfg.pagination.default_page_size == 0 || cfg.pagination.max_page_size == 0 {
        return Err(anyhow::anyhow!("pagination page sizes must be > 0"));
    }
    if cfg.pagination.default_page_size > cfg.pagination.max_page_size {
        return Err(anyhow::anyhow!("pagination.default_page_size must be <= max_page_size"));
    }
    if cfg.export.max_rows == 0 {
        return Err(anyhow::anyhow!("export.max_rows must be > 0"));
    }
    if cfg.jobs.max_concurrent == 0 || cfg.jobs.max_concurrent > 64 {
        return Err(anyhow::anyhow!("jobs.max_concurrent must be in 1..=64"));
    }
    if let Some(token) = cfg.admin_token() {
        if token.len() < 16 {
            return Err(anyhow::anyhow!("security.admin_token must be at least 16 characters"));
        }
    }

    Ok(())
}

pub fn ensure_sqlite_parent_dir(url: &str) -> anyhow::Result<()> {
    if let Some(path) = url.strip_prefix("sqlite://") {
        let p = Path::new(path);
        if let Some(parent) = p.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }
    Ok(())
}
