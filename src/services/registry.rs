//! Built-in service definitions.

use std::collections::HashMap;

/// How to launch and address one kind of service container.
///
/// String fields support placeholder substitution: `{scheme}`, `{user}`,
/// `{password}`, `{host}`, `{port}`, `{db}`.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub image: String,
    pub version: String,
    pub scheme: String,

    /// Named container ports; `default` is the primary port.
    pub ports: HashMap<String, u16>,

    /// Env variable the service reads its password from; `None` falls back
    /// to a plain `password` key.
    pub password_env: Option<String>,

    /// Prefix for the `MOAT_<PREFIX>_*` variables exposed to the run.
    pub env_prefix: String,

    pub default_user: String,
    pub default_db: String,

    /// Env variable users set to override the database name.
    pub db_env: Option<String>,

    /// Connection URL template.
    pub url_format: String,

    /// Additional container env; values may use `{db}` and `{password}`.
    pub extra_env: HashMap<String, String>,

    /// Command override; tokens may use `{password}`.
    pub extra_cmd: Vec<String>,

    /// Readiness probe executed inside the service container.
    pub readiness_cmd: Vec<String>,
}

/// Registry of launchable services, keyed by grant name.
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    entries: HashMap<String, ServiceSpec>,
}

impl ServiceRegistry {
    /// Registry with the built-in postgres, redis, and mysql entries.
    pub fn builtin() -> Self {
        let mut entries = HashMap::new();

        entries.insert(
            "postgres".to_string(),
            ServiceSpec {
                image: "postgres:16".to_string(),
                version: "16".to_string(),
                scheme: "postgresql".to_string(),
                ports: HashMap::from([("default".to_string(), 5432)]),
                password_env: Some("POSTGRES_PASSWORD".to_string()),
                env_prefix: "POSTGRES".to_string(),
                default_user: "postgres".to_string(),
                default_db: "postgres".to_string(),
                db_env: Some("POSTGRES_DB".to_string()),
                url_format: "{scheme}://{user}:{password}@{host}:{port}/{db}".to_string(),
                extra_env: HashMap::new(),
                extra_cmd: Vec::new(),
                readiness_cmd: vec![
                    "pg_isready".to_string(),
                    "-U".to_string(),
                    "{user}".to_string(),
                ],
            },
        );

        entries.insert(
            "redis".to_string(),
            ServiceSpec {
                image: "redis:7".to_string(),
                version: "7".to_string(),
                scheme: "redis".to_string(),
                ports: HashMap::from([("default".to_string(), 6379)]),
                password_env: None,
                env_prefix: "REDIS".to_string(),
                default_user: "default".to_string(),
                default_db: "0".to_string(),
                db_env: None,
                url_format: "{scheme}://:{password}@{host}:{port}/{db}".to_string(),
                extra_env: HashMap::new(),
                extra_cmd: vec![
                    "redis-server".to_string(),
                    "--requirepass".to_string(),
                    "{password}".to_string(),
                ],
                readiness_cmd: vec![
                    "redis-cli".to_string(),
                    "-a".to_string(),
                    "{password}".to_string(),
                    "ping".to_string(),
                ],
            },
        );

        entries.insert(
            "mysql".to_string(),
            ServiceSpec {
                image: "mysql:8".to_string(),
                version: "8".to_string(),
                scheme: "mysql".to_string(),
                ports: HashMap::from([("default".to_string(), 3306)]),
                password_env: Some("MYSQL_ROOT_PASSWORD".to_string()),
                env_prefix: "MYSQL".to_string(),
                default_user: "root".to_string(),
                default_db: "moat".to_string(),
                db_env: Some("MYSQL_DATABASE".to_string()),
                url_format: "{scheme}://{user}:{password}@{host}:{port}/{db}".to_string(),
                extra_env: HashMap::from([("MYSQL_DATABASE".to_string(), "{db}".to_string())]),
                extra_cmd: Vec::new(),
                readiness_cmd: vec![
                    "mysqladmin".to_string(),
                    "ping".to_string(),
                    "-p{password}".to_string(),
                ],
            },
        );

        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&ServiceSpec> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}
