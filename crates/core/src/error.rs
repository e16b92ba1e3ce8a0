use thiserror::Error;

/// Errors surfaced by the computer scheduler.
///
/// Timeouts and workload failures are handled inside the scheduler and never
/// appear here. Only misuse of the lifecycle and OS-level failures do.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("computer thread is no longer running")]
    NotRunning,

    #[error("computer thread has been dropped")]
    Closed,

    #[error("failed to spawn thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors produced while loading or validating a [`crate::SchedulerConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid scheduler config: {0}")]
    Invalid(String),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
}
