//! Resolved runtime configuration
//!
//! The pipeline consumes already-resolved configuration structs; parsing of
//! command-line flags lives in the binary. Environment variables are read
//! here (after `dotenv`), with built-in defaults underneath. Precedence is
//! flags over environment over defaults.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// PostgreSQL connection parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "skype_archive".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
        }
    }
}

impl DatabaseConfig {
    /// Load connection parameters from `POSTGRES_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("POSTGRES_HOST") {
            config.host = host;
        }
        if let Ok(port) = std::env::var("POSTGRES_PORT") {
            config.port = port.parse().map_err(|_| {
                Error::Configuration(format!("POSTGRES_PORT is not a valid port: {port}"))
            })?;
        }
        if let Ok(dbname) = std::env::var("POSTGRES_DB") {
            config.dbname = dbname;
        }
        if let Ok(user) = std::env::var("POSTGRES_USER") {
            config.user = user;
        }
        if let Ok(password) = std::env::var("POSTGRES_PASSWORD") {
            config.password = password;
        }

        Ok(config)
    }

    /// Connection URL in the form sqlx expects.
    ///
    /// The password is percent-encoded just enough for the characters that
    /// actually break URL parsing.
    pub fn url(&self) -> String {
        let password = self
            .password
            .replace('%', "%25")
            .replace('@', "%40")
            .replace('/', "%2F")
            .replace(':', "%3A");
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, password, self.host, self.port, self.dbname
        )
    }
}

/// Tunables for a single pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Directory for intermediate files, checkpoints and run summaries
    pub output_dir: Option<String>,

    /// Advisory memory budget; crossing 80% of it logs a warning
    pub memory_limit_mb: u64,

    /// Conversations per parallel work unit
    pub chunk_size: usize,

    /// Rows per database round-trip
    pub batch_size: usize,

    /// Worker cap for conversation-level parallelism (None = core count)
    pub max_workers: Option<usize>,

    /// Whether to fan conversations out across workers
    pub parallel_processing: bool,

    /// Messages between streaming checkpoints
    pub checkpoint_interval: u64,

    /// Streaming checkpoints retained on disk
    pub checkpoints_to_keep: usize,

    // Attachment policy. Downloads themselves are out of scope here; the
    // flags ride along in the context so checkpointed runs keep them.
    pub download_attachments: bool,
    pub generate_thumbnails: bool,
    pub extract_metadata: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            memory_limit_mb: 1024,
            chunk_size: 1000,
            batch_size: 100,
            max_workers: None,
            parallel_processing: false,
            checkpoint_interval: 10_000,
            checkpoints_to_keep: 5,
            download_attachments: false,
            generate_thumbnails: true,
            extract_metadata: true,
        }
    }
}

impl PipelineConfig {
    /// Apply `OUTPUT_DIR` from the environment when no directory was set.
    pub fn with_env_output_dir(mut self) -> Self {
        if self.output_dir.is_none() {
            if let Ok(dir) = std::env::var("OUTPUT_DIR") {
                self.output_dir = Some(dir);
            }
        }
        self
    }

    /// Effective worker count for parallel transformation.
    pub fn effective_workers(&self) -> usize {
        self.max_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_database_config_from_env() {
        std::env::set_var("POSTGRES_HOST", "db.example.com");
        std::env::set_var("POSTGRES_PORT", "5433");
        std::env::set_var("POSTGRES_DB", "skype_test");
        std::env::set_var("POSTGRES_USER", "tester");
        std::env::set_var("POSTGRES_PASSWORD", "secret");

        let config = DatabaseConfig::from_env().unwrap();
        assert_eq!(config.host, "db.example.com");
        assert_eq!(config.port, 5433);
        assert_eq!(config.dbname, "skype_test");
        assert_eq!(config.user, "tester");
        assert_eq!(config.password, "secret");

        std::env::remove_var("POSTGRES_HOST");
        std::env::remove_var("POSTGRES_PORT");
        std::env::remove_var("POSTGRES_DB");
        std::env::remove_var("POSTGRES_USER");
        std::env::remove_var("POSTGRES_PASSWORD");
    }

    #[test]
    #[serial]
    fn test_database_config_defaults() {
        std::env::remove_var("POSTGRES_HOST");
        std::env::remove_var("POSTGRES_PORT");
        std::env::remove_var("POSTGRES_DB");
        std::env::remove_var("POSTGRES_USER");
        std::env::remove_var("POSTGRES_PASSWORD");

        let config = DatabaseConfig::from_env().unwrap();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 5432);
        assert_eq!(config.dbname, "skype_archive");
    }

    #[test]
    #[serial]
    fn test_invalid_port_rejected() {
        std::env::set_var("POSTGRES_PORT", "not-a-port");
        let result = DatabaseConfig::from_env();
        std::env::remove_var("POSTGRES_PORT");

        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_url_escapes_password() {
        let config = DatabaseConfig {
            password: "p@ss/word".to_string(),
            ..Default::default()
        };
        let url = config.url();
        assert!(url.contains("p%40ss%2Fword"));
        assert!(url.starts_with("postgres://postgres:"));
    }

    #[test]
    fn test_effective_workers_defaults_to_cores() {
        let config = PipelineConfig::default();
        assert!(config.effective_workers() >= 1);

        let config = PipelineConfig {
            max_workers: Some(3),
            ..Default::default()
        };
        assert_eq!(config.effective_workers(), 3);
    }
}
