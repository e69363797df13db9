use std::path::PathBuf;
use std::process::ExitCode;

/// Exit code reported when the supervised child cannot be started or its
/// wait status cannot be decoded.
pub const EXIT_SPAWN_FAILED: u8 = 255;

#[derive(Debug, thiserror::Error)]
pub enum EntrypointError {
    #[error("discovery error for '{dependency}': {detail}")]
    Discovery { dependency: String, detail: String },

    #[error("{action} '{}': {source}", path.display())]
    LocalIo {
        action: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("gave up on {what} after {attempts} attempts")]
    RetriesExhausted { what: String, attempts: u32 },

    #[error("signal setup: {0}")]
    Signal(String),

    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

impl EntrypointError {
    pub fn local_io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::LocalIo {
            action,
            path: path.into(),
            source,
        }
    }

    /// Process exit code for a startup failure of this kind.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Discovery { .. } => 1,
            Self::LocalIo { .. } => 2,
            Self::Config(_) => 3,
            Self::RetriesExhausted { .. } => 4,
            Self::Signal(_) => 5,
            Self::Spawn { .. } => EXIT_SPAWN_FAILED,
        }
    }
}

impl From<&EntrypointError> for ExitCode {
    fn from(err: &EntrypointError) -> Self {
        ExitCode::from(err.exit_code())
    }
}

pub type EntrypointResult<T> = Result<T, EntrypointError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_category() {
        let io = std::io::Error::other("boom");
        let errors = [
            EntrypointError::Discovery {
                dependency: "kafka".into(),
                detail: "connection refused".into(),
            },
            EntrypointError::local_io("read", "/tmp/x", std::io::Error::other("x")),
            EntrypointError::Config("bad".into()),
            EntrypointError::RetriesExhausted {
                what: "endpoint 'kafka'".into(),
                attempts: 3,
            },
            EntrypointError::Signal("nope".into()),
            EntrypointError::Spawn {
                program: "/bin/false".into(),
                source: io,
            },
        ];
        let mut codes: Vec<u8> = errors.iter().map(EntrypointError::exit_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(codes.iter().all(|c| *c != 0));
    }

    #[test]
    fn local_io_message_names_the_file() {
        let err = EntrypointError::local_io(
            "read",
            "/var/run/secrets/namespace",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        let msg = err.to_string();
        assert!(msg.contains("/var/run/secrets/namespace"), "got: {msg}");
        assert!(msg.starts_with("read"), "got: {msg}");
    }

    #[test]
    fn spawn_failure_uses_sentinel_code() {
        let err = EntrypointError::Spawn {
            program: "missing".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(err.exit_code(), EXIT_SPAWN_FAILED);
    }
}
