//! Typed errors surfaced by the library's external seams.

/// A push notification line that could not be turned into a typed notification.
#[derive(thiserror::Error, Debug)]
pub enum NotificationError {
    #[error("invalid notification JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{kind} notification carries no user id")]
    MissingUserId { kind: String },
}

/// Failure reported by an identity lookup collaborator.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("identity lookup failed: {0}")]
    Failed(String),
}

/// Failure reported by a presence snapshot collaborator.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot request failed: {0}")]
    Request(String),

    #[error("no snapshot available for {0}")]
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_user_id_display() {
        let err = NotificationError::MissingUserId {
            kind: "friend-offline".to_string(),
        };
        assert_eq!(err.to_string(), "friend-offline notification carries no user id");
    }

    #[test]
    fn snapshot_error_display() {
        assert_eq!(
            SnapshotError::NotFound("usr_a".to_string()).to_string(),
            "no snapshot available for usr_a"
        );
        assert_eq!(
            SnapshotError::Request("timeout".to_string()).to_string(),
            "snapshot request failed: timeout"
        );
    }
}
