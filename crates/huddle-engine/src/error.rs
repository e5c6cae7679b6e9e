use huddle_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("persistence error: {0}")]
    Persistence(StoreError),

    #[error("subscription error: {0}")]
    Subscription(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("capacity exceeded: {0}")]
    Capacity(String),
}

impl From<StoreError> for RoomError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => RoomError::NotFound(what),
            other => RoomError::Persistence(other),
        }
    }
}

impl RoomError {
    /// Failures the caller cannot fix by changing the request.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::Persistence(_) | Self::Subscription(_) | Self::Capacity(_)
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Validation(_) => "validation",
            Self::Persistence(_) => "persistence",
            Self::Subscription(_) => "subscription",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Capacity(_) => "capacity",
        }
    }
}
