//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides. The file path defaults to `config.yaml` but can be specified via
//! the `-f` flag or the `PODCTL_CONFIG` environment variable.
//!
//! ## Loading Priority
//!
//! Sources are merged in order (later sources override earlier ones):
//!
//! 1. **YAML config file** - base configuration
//! 2. **Environment variables** - `PODCTL_`-prefixed, `__` for nesting
//!    (`PODCTL_SPAWNER__WORKERS=8` sets `spawner.workers`)
//! 3. **DATABASE_URL** - overrides `database.url` if set

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Simple CLI args - just for specifying the config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "PODCTL_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting any services.
    /// Useful for CI/CD pipelines to catch config errors before deployment.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// The site (deployment region/cluster) this process serves.
    pub site_id: String,
    /// Special-case override for `database.url`, fed by `DATABASE_URL`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    pub database: DatabaseConfig,
    /// Kubernetes namespace all workloads are provisioned into.
    pub namespace: String,
    /// Domain under which pod endpoints are exposed through the reverse proxy.
    pub proxy_domain: String,
    /// Per-tenant allowlists of custom image prefixes. A tenant absent from
    /// the map may not run `custom-` templates at all.
    pub custom_image_allowlist: HashMap<String, Vec<String>>,
    pub spawner: SpawnerConfig,
    pub host_reconciler: HostReconcilerConfig,
    pub site_sweep: SiteSweepConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// Startup connection attempts before the process aborts.
    pub connect_attempts: u32,
    /// Delay between startup connection attempts.
    #[serde(with = "humantime_serde")]
    pub connect_delay: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/podctl".to_string(),
            max_connections: 10,
            connect_attempts: 100,
            connect_delay: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpawnerConfig {
    pub enabled: bool,
    /// Worker pool size; global provisioning concurrency is bounded by this.
    pub workers: usize,
    /// Bounded retry policy for transient orchestration-API errors during
    /// provisioning: exponential backoff starting at `provision_backoff`,
    /// doubling per attempt, `provision_attempts` attempts total.
    pub provision_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub provision_backoff: Duration,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 6,
            provision_attempts: 5,
            provision_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostReconcilerConfig {
    pub enabled: bool,
    /// Fixed poll interval of the container/worker sweep.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// How long a pod may lack a running workload before its record is
    /// hard-deleted.
    #[serde(with = "humantime_serde")]
    pub missing_grace: Duration,
    /// How long a pod may sit in SPAWNER_SETUP/CREATING_CONTAINER before it
    /// is escalated to ERROR (covers the ack-before-process crash window).
    #[serde(with = "humantime_serde")]
    pub stuck_grace: Duration,
    /// How long a pod may sit in SHUTTING_DOWN before it is force-deleted.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    /// Timeout of the per-workload liveness probe.
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
}

impl Default for HostReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5),
            missing_grace: Duration::from_secs(120),
            stuck_grace: Duration::from_secs(600),
            shutdown_grace: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SiteSweepConfig {
    pub enabled: bool,
    /// Delay between sweep passes.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Root of the site's shared filesystem
    /// (`{nfs_root}/{tenant}/volumes/...`).
    pub nfs_root: PathBuf,
    /// Where the generated reverse-proxy routing config is written.
    pub proxy_config_path: PathBuf,
    /// Startup polling for the shared filesystem's backing service; the
    /// process terminates fatally if discovery never succeeds.
    pub discovery_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub discovery_delay: Duration,
}

impl Default for SiteSweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(10),
            nfs_root: PathBuf::from("/srv/podctl"),
            proxy_config_path: PathBuf::from("/etc/podctl/proxy-routes.json"),
            discovery_attempts: 20,
            discovery_delay: Duration::from_secs(3),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: "local".to_string(),
            database_url: None,
            database: DatabaseConfig::default(),
            namespace: "podctl".to_string(),
            proxy_domain: "pods.localhost".to_string(),
            custom_image_allowlist: HashMap::new(),
            spawner: SpawnerConfig::default(),
            host_reconciler: HostReconcilerConfig::default(),
            site_sweep: SiteSweepConfig::default(),
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let mut config: Self = Self::figment(args).extract()?;

        // if database_url is set, use it
        if let Some(url) = config.database_url.take() {
            config.database.url = url;
        }

        config.validate().map_err(figment::Error::from)?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can still override specific values
            .merge(Env::prefixed("PODCTL_").split("__"))
            // Common DATABASE_URL pattern
            .merge(Env::raw().only(&["DATABASE_URL"]))
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), String> {
        if self.site_id.is_empty() || !self.site_id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
            return Err(format!(
                "site_id '{}' must be non-empty lowercase alphanumeric (it is embedded in workload names)",
                self.site_id
            ));
        }
        if self.spawner.enabled && self.spawner.workers == 0 {
            return Err("spawner.workers must be at least 1".to_string());
        }
        if self.spawner.provision_attempts == 0 {
            return Err("spawner.provision_attempts must be at least 1".to_string());
        }
        if self.site_sweep.enabled && self.site_sweep.discovery_attempts == 0 {
            return Err("site_sweep.discovery_attempts must be at least 1".to_string());
        }
        if self.proxy_domain.is_empty() {
            return Err("proxy_domain must not be empty".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_and_yaml() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
site_id: eu1
proxy_domain: pods.example.com
spawner:
  workers: 4
site_sweep:
  nfs_root: /mnt/pods
  interval: 30s
"#,
            )?;

            let args = Args {
                config: "test.yaml".to_string(),
                validate: false,
            };

            let config = Config::load(&args)?;

            assert_eq!(config.site_id, "eu1");
            assert_eq!(config.spawner.workers, 4);
            assert_eq!(config.spawner.provision_attempts, 5); // default
            assert_eq!(config.site_sweep.nfs_root, PathBuf::from("/mnt/pods"));
            assert_eq!(config.site_sweep.interval, Duration::from_secs(30));
            assert_eq!(config.site_sweep.discovery_attempts, 20); // default
            assert_eq!(config.host_reconciler.interval, Duration::from_secs(5)); // default

            Ok(())
        });
    }

    #[test]
    fn test_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "site_id: eu1\n")?;

            jail.set_env("PODCTL_SPAWNER__WORKERS", "12");
            jail.set_env("DATABASE_URL", "postgresql://db.internal/pods");

            let args = Args {
                config: "test.yaml".to_string(),
                validate: false,
            };

            let config = Config::load(&args)?;

            assert_eq!(config.spawner.workers, 12);
            assert_eq!(config.database.url, "postgresql://db.internal/pods");

            Ok(())
        });
    }

    #[test]
    fn test_invalid_site_id_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "site_id: EU-West\n")?;

            let args = Args {
                config: "test.yaml".to_string(),
                validate: false,
            };

            assert!(Config::load(&args).is_err());
            Ok(())
        });
    }
}
