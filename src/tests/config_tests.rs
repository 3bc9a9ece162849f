#[cfg(test)]
mod tests {
    use crate::config::{self, AppConfig, SecurityConfig};
    use std::env;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // load() reads process-wide environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn write_temp_config(content: &str) -> NamedTempFile {
        let temp_file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        fs::write(temp_file.path(), content).unwrap();
        temp_file
    }

    #[test]
    fn test_valid_config_does_not_error() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        assert!(config::load().is_ok());
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.database.url, "sqlite://data/admitdesk.db");
        assert_eq!(config.database.max_connections, 16);
        assert_eq!(config.pagination.default_page_size, 25);
        assert_eq!(config.pagination.max_page_size, 500);
        assert_eq!(config.cache.ttl_seconds, 60);
        assert_eq!(config.jobs.max_concurrent, 4);
        assert!(config.admin_token().is_none());
        assert!(config::validate(&config).is_ok());
    }

    #[test]
    fn test_invalid_server_port() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        env::set_var("ADMITDESK__SERVER__PORT", "0");
        let result = config::load();
        env::remove_var("ADMITDESK__SERVER__PORT");
        assert!(result.unwrap_err().to_string().contains("invalid server.port"));
    }

    #[test]
    fn test_config_from_env() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        env::set_var("ADMITDESK__SERVER__HOST", "0.0.0.0");
        env::set_var("ADMITDESK__SERVER__PORT", "3000");
        env::set_var("ADMITDESK__DATABASE__URL", "sqlite://test.db");
        env::set_var("ADMITDESK__JOBS__MAX_CONCURRENT", "8");

        let result = config::load();

        env::remove_var("ADMITDESK__SERVER__HOST");
        env::remove_var("ADMITDESK__SERVER__PORT");
        env::remove_var("ADMITDESK__DATABASE__URL");
        env::remove_var("ADMITDESK__JOBS__MAX_CONCURRENT");

        let config = result.unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.database.url, "sqlite://test.db");
        assert_eq!(config.jobs.max_concurrent, 8);
    }

    #[test]
    fn test_config_from_file_and_env_priority() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let temp_file = write_temp_config(
            r#"
[server]
host = "192.168.1.1"
port = 9000

[pagination]
default_page_size = 10
max_page_size = 50

[security]
admin_token = "a-long-enough-admin-token"
enable_hsts = true
"#,
        );
        env::set_var("ADMITDESK_CONFIG", temp_file.path().to_str().unwrap());
        env::set_var("ADMITDESK__SERVER__PORT", "8888");

        let result = config::load();

        env::remove_var("ADMITDESK_CONFIG");
        env::remove_var("ADMITDESK__SERVER__PORT");

        let config = result.unwrap();
        assert_eq!(config.server.host, "192.168.1.1");
        // environment wins over the file
        assert_eq!(config.server.port, 8888);
        assert_eq!(config.pagination.default_page_size, 10);
        assert_eq!(config.pagination.max_page_size, 50);
        // untouched sections keep the embedded defaults
        assert_eq!(config.cache.capacity, 1024);
        assert_eq!(config.admin_token(), Some("a-long-enough-admin-token"));
        assert_eq!(config.security.as_ref().and_then(|s| s.enable_hsts), Some(true));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.pagination.default_page_size = 100;
        config.pagination.max_page_size = 50;
        assert!(config::validate(&config).unwrap_err().to_string().contains("default_page_size must be <= max_page_size"));

        let mut config = AppConfig::default();
        config.jobs.max_concurrent = 0;
        assert!(config::validate(&config).unwrap_err().to_string().contains("jobs.max_concurrent"));

        let mut config = AppConfig::default();
        config.database.max_connections = 0;
        assert!(config::validate(&config).is_err());

        let mut config = AppConfig::default();
        config.export.max_rows = 0;
        assert!(config::validate(&config).is_err());
    }

    #[test]
    fn test_admin_token_rules() {
        let mut config = AppConfig::default();
        config.security = Some(SecurityConfig { admin_token: Some("short".to_string()), ..Default::default() });
        assert!(config::validate(&config).unwrap_err().to_string().contains("at least 16 characters"));

        // blank tokens count as unset
        config.security = Some(SecurityConfig { admin_token: Some("   ".to_string()), ..Default::default() });
        assert!(config.admin_token().is_none());
        assert!(config::validate(&config).is_ok());
    }

    #[test]
    fn test_ensure_sqlite_parent_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("subdir/test.db");
        let db_url = format!("sqlite://{}", db_path.display());

        assert!(!db_path.parent().unwrap().exists());
        config::ensure_sqlite_parent_dir(&db_url).unwrap();
        assert!(db_path.parent().unwrap().exists());
    }

    #[test]
    fn test_ensure_sqlite_parent_dir_non_sqlite() {
        assert!(config::ensure_sqlite_parent_dir("sqlite::memory:").is_ok());
        assert!(config::ensure_sqlite_parent_dir("postgres://localhost/db").is_ok());
    }
}
