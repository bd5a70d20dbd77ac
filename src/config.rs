use std::time::Duration;

use crate::secret::Redacted;

/// Process-wide configuration, loaded once from the environment at startup.
///
/// There is no live reconfiguration: every field here is read once in
/// [`crate::main`] and handed down to the components that need it.
#[derive(clap::Parser, Debug)]
pub struct Args {
    /// Connection string for the durable store.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Apply pending schema migrations automatically at startup instead of
    /// refusing to start when the schema is behind.
    #[arg(long, env = "AUTO_MIGRATE", default_value_t = false)]
    pub auto_migrate: bool,

    /// How long to wait for in-flight queries to reach a terminal state
    /// during a graceful shutdown before exiting anyway.
    #[arg(long, env = "SHUTDOWN_DEADLINE_SECONDS", default_value_t = 30)]
    pub shutdown_deadline_seconds: u64,

    #[command(flatten)]
    pub scheduler: SchedulerConfig,

    #[command(flatten)]
    pub export: ExportConfig,

    #[command(flatten)]
    pub ssh: SshDefaults,
}

#[derive(clap::Args, Debug, Clone)]
pub struct SchedulerConfig {
    /// The period with which the admission scheduler polls the store for
    /// pending queries.
    #[arg(long, env = "CHECK_INTERVAL_SECONDS", default_value_t = 10)]
    pub check_interval_seconds: u64,

    /// Absolute cap on concurrently admitted queries across all users.
    #[arg(long, env = "GLOBAL_MAX_PARALLEL", default_value_t = 50)]
    pub global_max_parallel: usize,

    /// Per-user cap used when `UserSettings.max_parallel_queries` is unset.
    #[arg(long, env = "DEFAULT_USER_MAX_PARALLEL", default_value_t = 3)]
    pub default_user_max_parallel: usize,

    /// Reserved: not enforced by the core scheduler today, but threaded
    /// through so a future queue-timeout policy has somewhere to live.
    #[arg(long, env = "DEFAULT_QUEUE_TIMEOUT_SECONDS", default_value_t = 3600)]
    pub default_queue_timeout_seconds: u64,

    /// Age after which a `running`/`transferring` query with no owning
    /// worker is considered stuck by a periodic (non-startup) reaper sweep.
    #[arg(
        long,
        env = "REAPER_STUCK_THRESHOLD_SECONDS",
        default_value_t = 3600
    )]
    pub reaper_stuck_threshold_seconds: u64,
}

impl SchedulerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }

    pub fn reaper_stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.reaper_stuck_threshold_seconds)
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct ExportConfig {
    /// Export format used when a query and its owner's settings both leave
    /// `export_type` unset.
    #[arg(long, env = "DEFAULT_EXPORT_TYPE", default_value = "csv")]
    pub default_export_type: String,

    /// Destination directory used when a query and its owner's settings both
    /// leave `export_location` unset.
    #[arg(long, env = "DEFAULT_EXPORT_LOCATION", default_value = "./exports")]
    pub default_export_location: String,

    /// Scratch directory materialised result files are written to before
    /// being handed to the transfer service.
    #[arg(long, env = "TMP_EXPORT_LOCATION", default_value = "./tmp/exports")]
    pub tmp_export_location: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct SshDefaults {
    #[arg(long, env = "SSH_HOST", default_value = "localhost")]
    pub host: String,

    #[arg(long, env = "SSH_PORT", default_value_t = 22)]
    pub port: u16,

    #[arg(long, env = "SSH_USERNAME", default_value = "")]
    pub username: String,

    #[arg(long, env = "SSH_PASSWORD")]
    pub password: Option<Redacted<String>>,

    #[arg(long, env = "SSH_KEY")]
    pub key: Option<Redacted<String>>,

    #[arg(long, env = "SSH_KEY_PASSPHRASE")]
    pub key_passphrase: Option<Redacted<String>>,

    /// Path to a known_hosts file used to validate remote host keys. When
    /// unset, host key verification is skipped (logged loudly at startup).
    #[arg(long, env = "SSH_KNOWN_HOSTS")]
    pub known_hosts: Option<String>,

    #[arg(long, env = "SSH_TIMEOUT_SECONDS", default_value_t = 30)]
    pub timeout_seconds: u64,

    #[arg(long, env = "SSH_KEEPALIVE_INTERVAL_SECONDS", default_value_t = 30)]
    pub keepalive_interval_seconds: u64,
}

impl SshDefaults {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}
