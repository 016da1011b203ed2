use std::net::SocketAddr;

use anyhow::Context;

use retro_board::ManagerConfig;
use retro_board::manager::DEFAULT_COLUMNS;

/// Process settings, read from `RETRO_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// SQLite file, or `:memory:` for a throwaway store.
    pub db_path: String,
    pub initial_columns: Vec<String>,
    pub timer_enabled: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let host = get("RETRO_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = get("RETRO_PORT")
            .unwrap_or_else(|| "8080".into())
            .parse()
            .context("RETRO_PORT")?;
        let db_path = get("RETRO_DB_PATH").unwrap_or_else(|| "retro.db".into());

        let initial_columns = match get("RETRO_INITIAL_COLUMNS") {
            Some(raw) => parse_columns(&raw),
            None => DEFAULT_COLUMNS.iter().map(|c| c.to_string()).collect(),
        };

        let timer_enabled = match get("RETRO_TIMER").as_deref() {
            None => true,
            Some("1" | "true" | "yes" | "on") => true,
            Some("0" | "false" | "no" | "off") => false,
            Some(other) => anyhow::bail!("RETRO_TIMER: expected true or false, got `{other}`"),
        };

        Ok(Self {
            host,
            port,
            db_path,
            initial_columns,
            timer_enabled,
        })
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }

    pub fn manager(&self) -> ManagerConfig {
        ManagerConfig {
            initial_columns: self.initial_columns.clone(),
            timer_enabled: self.timer_enabled,
            ..ManagerConfig::default()
        }
    }
}

/// Comma separated column names; blanks are skipped.
fn parse_columns(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.addr().unwrap().port(), 8080);
        assert_eq!(cfg.db_path, "retro.db");
        assert_eq!(cfg.initial_columns, DEFAULT_COLUMNS);
        assert!(cfg.timer_enabled);
    }

    #[test]
    fn overrides() {
        let cfg = config(&[
            ("RETRO_PORT", "9000"),
            ("RETRO_INITIAL_COLUMNS", "Start, Stop,,Continue "),
            ("RETRO_TIMER", "off"),
        ])
        .unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.manager().initial_columns, ["Start", "Stop", "Continue"]);
        assert!(!cfg.manager().timer_enabled);
    }

    #[test]
    fn rejects_garbage() {
        assert!(config(&[("RETRO_PORT", "http")]).is_err());
        assert!(config(&[("RETRO_TIMER", "maybe")]).is_err());
    }
}
