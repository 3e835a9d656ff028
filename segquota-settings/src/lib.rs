//! Daemon settings objects and initialization.
#[macro_use]
extern crate slog_scope;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

static PREFIX: &str = "segquota";

/// Default capacity of the shared active-table map (`1 << 20` entries).
pub const DEFAULT_MAX_ACTIVE_TABLES: usize = 1 << 20;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Sqlite database holding quota config, table sizes and install state.
    pub database_url: String,
    pub database_pool_max_size: u32,
    /// Pool timeout when waiting for a slot to become available, in seconds
    pub database_pool_connection_timeout: Option<u32>,
    #[cfg(debug_assertions)]
    pub database_use_test_transactions: bool,

    /// Seconds a per-database worker sleeps between refresh epochs.
    pub naptime_secs: u64,
    /// Capacity of the shared active-table map on every node.
    pub max_active_tables: usize,
    /// Capacity of the per-node relation metadata cache.
    pub relation_cache_capacity: usize,
    /// How long a management call waits on the launcher mailbox, in seconds.
    pub ddl_wait_timeout_secs: u64,
    /// Backoff before the launcher restarts a worker that died, in seconds.
    pub worker_restart_backoff_secs: u64,

    pub statsd_host: Option<String>,
    pub statsd_port: u16,
    pub statsd_label: String,

    pub human_logs: bool,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            database_url: "segquota.db".to_string(),
            database_pool_max_size: 10,
            database_pool_connection_timeout: Some(30),
            #[cfg(debug_assertions)]
            database_use_test_transactions: false,
            naptime_secs: 2,
            max_active_tables: DEFAULT_MAX_ACTIVE_TABLES,
            relation_cache_capacity: 8192,
            ddl_wait_timeout_secs: 10,
            worker_restart_backoff_secs: 5,
            statsd_host: None,
            statsd_port: 8125,
            statsd_label: "segquota".to_string(),
            human_logs: false,
        }
    }
}

impl Settings {
    /// Load the settings from the config file if supplied, then the environment.
    pub fn with_env_and_config_file(filename: Option<&str>) -> Result<Self, ConfigError> {
        let mut s = Config::default();

        // Merge the config file if supplied
        if let Some(config_filename) = filename {
            s.merge(File::with_name(config_filename))?;
        }

        // Merge the environment overrides. This accepts environment
        // variables specified as `SEGQUOTA_FOO__BAR_VALUE="gorp"` as
        // `foo.bar_value = "gorp"`.
        s.merge(Environment::with_prefix(&PREFIX.to_uppercase()).separator("__"))?;

        match s.try_into::<Self>() {
            Ok(mut s) => {
                s.normalize();
                Ok(s)
            }
            // Configuration errors are not very sysop friendly. Try to make
            // them a bit more 3AM useful.
            Err(ConfigError::Message(v)) => {
                println!("Bad configuration: {:?}", &v);
                println!("Please set in config file or use environment variable.");
                println!(
                    "For example to set `database_url` use env var `{}_DATABASE_URL`\n",
                    PREFIX.to_uppercase()
                );
                error!("Configuration error: Value undefined {:?}", &v);
                Err(ConfigError::NotFound(v))
            }
            Err(e) => {
                error!("Configuration error: Other: {:?}", &e);
                Err(e)
            }
        }
    }

    /// Clamp out-of-range values rather than refusing to start.
    pub fn normalize(&mut self) {
        if self.naptime_secs < 1 {
            self.naptime_secs = 1;
        }
        if self.max_active_tables < 1 {
            self.max_active_tables = 1;
        }
        if self.relation_cache_capacity < 1 {
            self.relation_cache_capacity = 1;
        }
    }

    #[cfg(debug_assertions)]
    pub fn test_settings() -> Self {
        let mut settings =
            Self::with_env_and_config_file(None).expect("Could not get Settings in test_settings");
        settings.database_url = ":memory:".to_owned();
        settings.database_pool_max_size = 1;
        settings.database_use_test_transactions = true;
        settings.naptime_secs = 1;
        settings
    }

    pub fn banner(&self) -> String {
        format!(
            "segquota (naptime {}s, {} active-table slots) -> {}",
            self.naptime_secs, self.max_active_tables, self.database_url
        )
    }
}
