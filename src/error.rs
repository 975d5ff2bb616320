use serde::Serialize;

/// Every failure the simulator can surface to a caller.
///
/// `Configuration` is fatal to starting a session. `TransientFetch` and
/// `Validation` are always recoverable: the dashboard retries them with
/// backoff and the game degrades to "no data".
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("fetch failed: {0}")]
    TransientFetch(String),

    #[error("unexpected response shape: {0}")]
    Validation(String),

    #[error("cannot {action} while {phase}")]
    InvalidPhase {
        action: &'static str,
        phase: &'static str,
    },

    #[error("cell ({row}, {col}) is outside the {rows}x{cols} grid")]
    CellOutOfBounds {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },

    #[error("device store error: {0}")]
    Store(String),
}

impl SimError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SimError::TransientFetch(_) | SimError::Validation(_))
    }
}

impl From<reqwest::Error> for SimError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SimError::Validation(err.to_string())
        } else {
            SimError::TransientFetch(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SimError {
    fn from(err: serde_json::Error) -> Self {
        SimError::Validation(err.to_string())
    }
}

impl From<anyhow::Error> for SimError {
    fn from(err: anyhow::Error) -> Self {
        SimError::Store(format!("{err:#}"))
    }
}

// Front ends show errors as plain strings.
impl Serialize for SimError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_fetch_and_validation_are_recoverable() {
        assert!(SimError::TransientFetch("timeout".into()).is_recoverable());
        assert!(SimError::Validation("missing stats".into()).is_recoverable());
        assert!(!SimError::Configuration("flag".into()).is_recoverable());
        assert!(!SimError::Store("disk".into()).is_recoverable());
    }

    #[test]
    fn json_errors_become_validation_errors() {
        let err = serde_json::from_str::<u32>("\"nope\"").unwrap_err();
        assert!(matches!(SimError::from(err), SimError::Validation(_)));
    }

    #[test]
    fn serializes_as_message() {
        let err = SimError::InvalidPhase {
            action: "start",
            phase: "hunting",
        };
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            "\"cannot start while hunting\""
        );
    }
}
