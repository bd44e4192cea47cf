use thiserror::Error;

/// Failure kinds that callers need to tell apart.
///
/// Everything else travels as a plain `anyhow::Error`. These variants are
/// wrapped into `anyhow` at the point of failure and recovered with
/// [`RallyError::find`] where the distinction matters (a Job recording a
/// timeout, a caller retrying a dropped connection).
#[derive(Debug, Error)]
pub enum RallyError {
    #[error("connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    #[error("remote command failed with exit code {code}: {command}")]
    RemoteCommandFailed { command: String, code: i32 },

    #[error("remote command killed by signal {signal}: {command}")]
    RemoteCommandKilled { command: String, signal: i32 },

    #[error("no host can satisfy {memory_kib} KiB / {vcpus} vcpus")]
    ResourceUnavailable { memory_kib: u64, vcpus: u32 },

    #[error("timed out after {secs}s waiting for {what}")]
    Timeout { what: String, secs: u64 },

    #[error("build of {name} failed: {reason}")]
    BuildFailed { name: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,
}

impl RallyError {
    /// Find a typed error anywhere in an `anyhow` context chain.
    pub fn find(err: &anyhow::Error) -> Option<&RallyError> {
        err.chain().find_map(|e| e.downcast_ref::<RallyError>())
    }

    pub fn is_cancelled(err: &anyhow::Error) -> bool {
        matches!(Self::find(err), Some(RallyError::Cancelled))
    }

    pub fn is_timeout(err: &anyhow::Error) -> bool {
        matches!(Self::find(err), Some(RallyError::Timeout { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_find_through_context() {
        let err: anyhow::Result<()> = Err(RallyError::Timeout {
            what: "address".into(),
            secs: 5,
        })
        .context("booting vm");
        let err = err.unwrap_err();
        assert!(RallyError::is_timeout(&err));
        assert!(!RallyError::is_cancelled(&err));
    }

    #[test]
    fn test_find_absent() {
        let err = anyhow::anyhow!("plain failure");
        assert!(RallyError::find(&err).is_none());
    }

    #[test]
    fn test_display_messages() {
        let e = RallyError::RemoteCommandFailed {
            command: "false".into(),
            code: 1,
        };
        assert_eq!(e.to_string(), "remote command failed with exit code 1: false");
        let e = RallyError::RemoteCommandKilled {
            command: "sleep 100".into(),
            signal: 9,
        };
        assert!(e.to_string().contains("signal 9"));
    }
}
