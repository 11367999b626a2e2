use thiserror::Error;

/// The only user-visible failure: the capture could not be started. Every
/// error class that can occur after a successful start is counted and
/// periodically logged instead.
#[derive(Debug, Error)]
pub enum TracerError {
    #[error("failed to open {source_name} events: {error}")]
    PerfEventOpen {
        source_name: String,
        #[source]
        error: std::io::Error,
    },

    #[error("could not inspect target process {pid}: {error}")]
    TargetProcess {
        pid: i32,
        #[source]
        error: std::io::Error,
    },

    #[error("invalid capture options: {0}")]
    InvalidOptions(String),

    #[error("no event sources were requested or could be opened")]
    NoEventSources,
}
