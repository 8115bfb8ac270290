use std::time::Duration;

/// Server configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    // Core server settings
    pub host: String,
    pub port: u16,
    pub debug: bool,

    // Room settings
    pub open_rooms: bool,
    pub workspaces: Vec<String>,
    pub auth_token: Option<String>,
    pub ping_interval_secs: u64,
    pub eviction_delay_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8787,
            debug: false,
            open_rooms: true,
            workspaces: Vec::new(),
            auth_token: None,
            ping_interval_secs: 30,
            eviction_delay_secs: 60,
        }
    }
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn eviction_delay(&self) -> Duration {
        Duration::from_secs(self.eviction_delay_secs)
    }
}

pub fn load_config() -> anyhow::Result<Config> {
    let host = std::env::var("TABULA_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

    let port = match std::env::var("PORT") {
        Ok(value) => value
            .parse()
            .map_err(|_| anyhow::anyhow!("PORT must be a number, got `{value}`"))?,
        Err(_) => 8787,
    };

    let debug = std::env::var("DEBUG").is_ok();

    // Rooms are open unless a workspace list is configured.
    let workspaces: Vec<String> = std::env::var("TABULA_WORKSPACES")
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let open_rooms = match std::env::var("TABULA_OPEN_ROOMS") {
        Ok(value) => value == "1" || value.to_lowercase() == "true",
        Err(_) => workspaces.is_empty(),
    };

    let auth_token = std::env::var("TABULA_AUTH_TOKEN").ok();

    let ping_interval_secs = std::env::var("TABULA_PING_INTERVAL_SECS")
        .unwrap_or_else(|_| "30".to_string())
        .parse()
        .unwrap_or(30);

    let eviction_delay_secs = std::env::var("TABULA_EVICTION_DELAY_SECS")
        .unwrap_or_else(|_| "60".to_string())
        .parse()
        .unwrap_or(60);

    Ok(Config {
        host,
        port,
        debug,
        open_rooms,
        workspaces,
        auth_token,
        ping_interval_secs,
        eviction_delay_secs,
    })
}
