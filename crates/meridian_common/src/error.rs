use thiserror::Error;

/// Convenience alias for `Result<T, MeridianError>`.
pub type MeridianResult<T> = Result<T, MeridianError>;

/// Error classification for reply/retry decisions.
///
/// - `Argument`     — malformed command; returned immediately, no state change
/// - `Policy`       — read-only, not-leader, catching-up; no state change
/// - `Resource`     — pool exhaustion; no state change
/// - `Deadline`     — operation exceeded its deadline; sticky on the txn status
/// - `Interruption` — scheduler-requested scan abort; never surfaced to clients
/// - `Internal`     — script panic, parse error, store error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Argument,
    Policy,
    Resource,
    Deadline,
    Interruption,
    Internal,
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum MeridianError {
    #[error("Txn error: {0}")]
    Txn(#[from] TxnError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Transaction status errors. Once observed on a status they are sticky
/// until the status is retried (interruption) or the operation ends.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnError {
    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("interrupted")]
    Interrupted,

    #[error("closed")]
    Closed,
}

/// Wire protocol errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("truncated frame: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("invalid frame: {0}")]
    Invalid(String),

    #[error("invalid utf-8 in {field}")]
    InvalidUtf8 { field: &'static str },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

/// Collection / object store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("key not found")]
    KeyNotFound,

    #[error("id not found")]
    IdNotFound,

    #[error("invalid geojson: {0}")]
    InvalidGeoJson(String),

    #[error("snapshot failed: {0}")]
    Snapshot(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Scripting engine errors.
#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("no interpreters available")]
    NoInterpreters,

    #[error("sha not found")]
    ShaNotFound,

    #[error("command not supported in scripts")]
    CmdNotSupported,

    #[error("{0}")]
    Runtime(String),
}

/// Command routing / policy errors. `Display` renders the exact
/// client-visible message minus the `ERR ` prefix, which the reply writer
/// adds.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    Unknown(String),

    #[error("invalid number of arguments")]
    InvalidArgCount,

    #[error("invalid argument '{0}'")]
    InvalidArg(String),

    #[error("read only")]
    ReadOnly,

    #[error("not the leader")]
    NotLeader,

    #[error("catching up to leader")]
    CatchingUp,

    #[error("timeout")]
    Timeout,

    #[error("timeout not supported for '{0}'")]
    TimeoutNotSupported(String),

    #[error("fence not supported")]
    FenceNotSupported,
}

impl MeridianError {
    /// Classify this error for the reply path.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MeridianError::Command(CommandError::Unknown(_))
            | MeridianError::Command(CommandError::InvalidArgCount)
            | MeridianError::Command(CommandError::InvalidArg(_))
            | MeridianError::Command(CommandError::TimeoutNotSupported(_))
            | MeridianError::Command(CommandError::FenceNotSupported) => ErrorKind::Argument,

            MeridianError::Command(CommandError::ReadOnly)
            | MeridianError::Command(CommandError::NotLeader)
            | MeridianError::Command(CommandError::CatchingUp) => ErrorKind::Policy,

            MeridianError::Script(ScriptError::NoInterpreters) => ErrorKind::Resource,

            MeridianError::Command(CommandError::Timeout)
            | MeridianError::Txn(TxnError::DeadlineExceeded) => ErrorKind::Deadline,

            MeridianError::Txn(TxnError::Interrupted) => ErrorKind::Interruption,

            _ => ErrorKind::Internal,
        }
    }

    /// The single-line message written to the client. Deadline errors all
    /// surface as `timeout`; newlines are replaced by the two-character
    /// sequence `\n` because RESP errors cannot span lines.
    pub fn client_message(&self) -> String {
        let msg = match self {
            MeridianError::Txn(TxnError::DeadlineExceeded) => "timeout".to_string(),
            MeridianError::Command(e) => e.to_string(),
            MeridianError::Script(e) => e.to_string(),
            MeridianError::Txn(e) => e.to_string(),
            MeridianError::Store(e) => e.to_string(),
            MeridianError::Protocol(e) => e.to_string(),
            MeridianError::Io(e) => e.to_string(),
            MeridianError::Internal(msg) => msg.clone(),
        };
        msg.replace('\n', "\\n")
    }

    /// Interruptions are retried transparently and must never reach a client.
    pub fn is_interruption(&self) -> bool {
        matches!(self.kind(), ErrorKind::Interruption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argument_errors_classify() {
        let e = MeridianError::Command(CommandError::Unknown("bogus".into()));
        assert_eq!(e.kind(), ErrorKind::Argument);
        assert_eq!(e.client_message(), "unknown command 'bogus'");
    }

    #[test]
    fn test_policy_errors_classify() {
        for (err, msg) in [
            (CommandError::ReadOnly, "read only"),
            (CommandError::NotLeader, "not the leader"),
            (CommandError::CatchingUp, "catching up to leader"),
        ] {
            let e = MeridianError::Command(err);
            assert_eq!(e.kind(), ErrorKind::Policy);
            assert_eq!(e.client_message(), msg);
        }
    }

    #[test]
    fn test_pool_exhaustion_is_resource() {
        let e = MeridianError::Script(ScriptError::NoInterpreters);
        assert_eq!(e.kind(), ErrorKind::Resource);
        assert_eq!(e.client_message(), "no interpreters available");
    }

    #[test]
    fn test_deadline_surfaces_as_timeout() {
        let e = MeridianError::Txn(TxnError::DeadlineExceeded);
        assert_eq!(e.kind(), ErrorKind::Deadline);
        assert_eq!(e.client_message(), "timeout");
    }

    #[test]
    fn test_interruption_never_client_visible() {
        let e = MeridianError::Txn(TxnError::Interrupted);
        assert!(e.is_interruption());
    }

    #[test]
    fn test_newlines_flattened_in_client_message() {
        let e = MeridianError::Internal("line one\nline two".into());
        assert_eq!(e.client_message(), "line one\\nline two");
    }

    #[test]
    fn test_sha_not_found_message() {
        let e = MeridianError::Script(ScriptError::ShaNotFound);
        assert_eq!(e.client_message(), "sha not found");
    }
}
