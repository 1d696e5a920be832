use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ElectError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("lock {0} is not held")]
    LockNotHeld(String),

    #[error("lock owned by `{found}`, expected `{expected}`")]
    OwnerMismatch { expected: String, found: String },

    #[error("invalid lock record `{0}`")]
    InvalidRecord(String),

    #[error("store client disconnected")]
    Disconnected,

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[cfg(feature = "etcd")]
    #[error("etcd `{0}`")]
    Etcd(#[from] etcd_client::Error),

    #[cfg(feature = "redis")]
    #[error("redis `{0}`")]
    Redis(#[from] redis::RedisError),

    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl ElectError {
    /// Whether the current session or lock handle is dead and must be rebuilt
    /// before the next acquisition attempt.
    pub fn is_session_invalid(&self) -> bool {
        match self {
            Self::SessionExpired(_) => true,
            #[cfg(feature = "etcd")]
            Self::Etcd(etcd_client::Error::GRpcStatus(status)) => {
                // gRPC NOT_FOUND: the lease was reaped by the server.
                i32::from(status.code()) == 5
            }
            _ => false,
        }
    }

    /// Whether retrying the same call after a backoff may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            Self::InvalidArgument(_) | Self::SessionExpired(_) | Self::InvalidRecord(_)
        ) && !self.is_session_invalid()
    }
}

pub type Result<T> = std::result::Result<T, ElectError>;
