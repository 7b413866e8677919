use alarmd_engine::config::EngineConfig;
use alarmd_notify::config::NotificationConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    /// Snowflake machine/node ids; set them apart when several daemons
    /// share one database.
    #[serde(default)]
    pub node: NodeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseConfig {
    /// Connection url with any password replaced, for logging.
    pub fn redacted_url(&self) -> String {
        let Some((scheme, rest)) = self.url.split_once("://") else {
            return self.url.clone();
        };
        match rest.split_once('@') {
            Some((userinfo, host)) => {
                let user = userinfo.split(':').next().unwrap_or_default();
                format!("{scheme}://{user}:***@{host}")
            }
            None => self.url.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_id")]
    pub machine_id: i32,
    #[serde(default = "default_node_id")]
    pub node_id: i32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            machine_id: default_node_id(),
            node_id: default_node_id(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite://data/alarmd.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_node_id() -> i32 {
    1
}

impl ServerConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config '{}': {}", path, e))?;
        Self::parse(&content).map_err(|e| anyhow::anyhow!("Invalid config '{}': {}", path, e))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }
}
