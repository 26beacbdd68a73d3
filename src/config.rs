use std::{env, fmt::Display, path::PathBuf, str::FromStr, time::Duration};

use anyhow::Context;
use tracing::{debug, info};

pub const MAX_DOCS_PER_COLLECTION: usize = 8000;
pub const ANALYTICS_DEBOUNCE_MS: u64 = 2000;

pub struct Config {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub max_docs_per_collection: usize,
    pub debounce: Duration,
    pub export_dir: PathBuf,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL").ok(),
            max_connections: try_load("RECORDS_MAX_CONNECTIONS", 5)?,
            max_docs_per_collection: try_load("RECORDS_MAX_DOCS", MAX_DOCS_PER_COLLECTION)?,
            debounce: Duration::from_millis(try_load("RECORDS_DEBOUNCE_MS", ANALYTICS_DEBOUNCE_MS)?),
            export_dir: env::var("RECORDS_EXPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        })
    }

    pub fn database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set to a production Postgres instance")
    }
}

fn try_load<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr + Display,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => {
            debug!("{key} set to {raw}");
            raw.trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid {key} value {raw:?}: {e}"))
        }
        Err(_) => {
            info!("{key} not set, using default: {default}");
            Ok(default)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_keys_fall_back_to_defaults() {
        let value: usize = try_load("RECORDS_TEST_UNSET_KEY_7F3A", 8000).unwrap();
        assert_eq!(value, 8000);
    }

    #[test]
    fn invalid_values_are_errors() {
        env::set_var("RECORDS_TEST_BAD_KEY_7F3A", "soon");
        let result: anyhow::Result<u64> = try_load("RECORDS_TEST_BAD_KEY_7F3A", 2000);
        assert!(result.is_err());
        env::remove_var("RECORDS_TEST_BAD_KEY_7F3A");
    }

    #[test]
    fn set_values_are_parsed() {
        env::set_var("RECORDS_TEST_GOOD_KEY_7F3A", " 250 ");
        let value: u64 = try_load("RECORDS_TEST_GOOD_KEY_7F3A", 2000).unwrap();
        assert_eq!(value, 250);
        env::remove_var("RECORDS_TEST_GOOD_KEY_7F3A");
    }
}
