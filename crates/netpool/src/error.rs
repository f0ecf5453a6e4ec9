//! Error types for the network slot pool.
//!
//! Low-level failures are [`NetworkError`]s carrying the operation that failed.
//! Pool-level failures wrap them in [`PoolError`] together with the slot identity.

use thiserror::Error;

/// Errors from the slot identity allocator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocatorError {
    #[error("slot acquisition cancelled")]
    Cancelled,

    #[error("slot allocator closed")]
    Closed,

    /// Releasing an identity that is not currently held.
    #[error("slot {0} is not held")]
    NotHeld(u32),
}

/// Errors from OS-level network operations.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// An external tool (`ip`, `iptables`) exited unsuccessfully.
    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("failed to run `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{op} failed: {errno}")]
    Nix { op: String, errno: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The target of a lookup or deletion does not exist.
    #[error("{0} not found")]
    NotFound(String),

    #[error("slot {0} has no firewall")]
    FirewallMissing(u32),

    #[error("namespace worker is not running")]
    WorkerGone,

    #[error("{step}: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: Box<NetworkError>,
    },

    #[error("{}", join_errors(.0))]
    Multiple(Vec<NetworkError>),
}

fn join_errors(errors: &[NetworkError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl NetworkError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            return Self::NotFound(context.into());
        }
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// True when the error (or the error it wraps) reports an absent resource.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Step { source, .. } => source.is_not_found(),
            Self::Multiple(errors) => !errors.is_empty() && errors.iter().all(|e| e.is_not_found()),
            _ => false,
        }
    }

    /// Collapse a list of errors: `Ok` when empty, the error itself when single.
    pub fn from_many(mut errors: Vec<NetworkError>) -> Result<(), NetworkError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(errors)),
        }
    }
}

/// Attach the name of the failing step to a [`NetworkError`].
pub trait StepContext<T> {
    fn step(self, step: &'static str) -> Result<T, NetworkError>;
}

impl<T> StepContext<T> for Result<T, NetworkError> {
    fn step(self, step: &'static str) -> Result<T, NetworkError> {
        self.map_err(|source| NetworkError::Step {
            step,
            source: Box::new(source),
        })
    }
}

/// Treat "already absent" as success.
pub(crate) fn tolerate_absent(result: Result<(), NetworkError>) -> Result<(), NetworkError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Errors surfaced by [`crate::NetworkPool`].
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("waiting for a network slot was cancelled")]
    Cancelled,

    #[error("network slot pool is closed")]
    Closed,

    #[error("failed to acquire slot: {0}")]
    Acquire(#[from] AllocatorError),

    #[error("failed to create network for slot {idx}: {source}{}", describe_repair(.cleanup, .release))]
    CreateNetwork {
        idx: u32,
        #[source]
        source: NetworkError,
        cleanup: Option<NetworkError>,
        release: Option<AllocatorError>,
    },

    #[error("firewall failure on slot {idx}: {source}{}", describe_teardown(.teardown))]
    Firewall {
        idx: u32,
        #[source]
        source: NetworkError,
        teardown: Option<Box<PoolError>>,
    },

    #[error("failed to tear down slot {idx}: {source}")]
    Teardown {
        idx: u32,
        #[source]
        source: NetworkError,
    },

    #[error("failed to check namespace of slot {idx}: {source}")]
    Probe {
        idx: u32,
        #[source]
        source: NetworkError,
    },

    #[error("{}", join_pool_errors(.0))]
    Multiple(Vec<PoolError>),

    #[error("failed to register pool metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("namespace worker failed: {0}")]
    Worker(#[source] NetworkError),

    #[error("failed to detect egress interface: {0}")]
    Egress(#[source] NetworkError),

    #[error("invalid pool configuration: {0}")]
    Config(String),
}

fn describe_repair(cleanup: &Option<NetworkError>, release: &Option<AllocatorError>) -> String {
    let mut out = String::new();
    if let Some(e) = cleanup {
        out.push_str(&format!(" (cleanup: {e})"));
    }
    if let Some(e) = release {
        out.push_str(&format!(" (release: {e})"));
    }
    out
}

fn describe_teardown(teardown: &Option<Box<PoolError>>) -> String {
    match teardown {
        Some(e) => format!(" (teardown: {e})"),
        None => String::new(),
    }
}

fn join_pool_errors(errors: &[PoolError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl PoolError {
    pub(crate) fn from_many(mut errors: Vec<PoolError>) -> Result<(), PoolError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(errors)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_context_wraps_and_keeps_not_found() {
        let err = Err::<(), _>(NetworkError::NotFound("veth-3".to_string()))
            .step("deleting veth")
            .unwrap_err();
        assert_eq!(err.to_string(), "deleting veth: veth-3 not found");
        assert!(err.is_not_found());
    }

    #[test]
    fn tolerate_absent_passes_other_errors() {
        assert!(tolerate_absent(Err(NetworkError::NotFound("x".into()))).is_ok());
        let err = tolerate_absent(Err(NetworkError::WorkerGone)).unwrap_err();
        assert!(matches!(err, NetworkError::WorkerGone));
    }

    #[test]
    fn from_many_collapses() {
        assert!(NetworkError::from_many(vec![]).is_ok());

        let single = NetworkError::from_many(vec![NetworkError::WorkerGone]).unwrap_err();
        assert!(matches!(single, NetworkError::WorkerGone));

        let joined = NetworkError::from_many(vec![
            NetworkError::FirewallMissing(1),
            NetworkError::NotFound("ns-1".into()),
        ])
        .unwrap_err();
        assert_eq!(
            joined.to_string(),
            "slot 1 has no firewall; ns-1 not found"
        );
        assert!(!joined.is_not_found());
    }

    #[test]
    fn create_network_error_mentions_repair() {
        let err = PoolError::CreateNetwork {
            idx: 4,
            source: NetworkError::WorkerGone,
            cleanup: None,
            release: Some(AllocatorError::NotHeld(4)),
        };
        assert_eq!(
            err.to_string(),
            "failed to create network for slot 4: namespace worker is not running (release: slot 4 is not held)"
        );
    }
}
