//! Error taxonomy shared by every stage of an ensemble run.

use std::fmt;
use thiserror::Error;

/// Phase of a member's lifecycle, reported when that member fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Features,
    Split,
    Reduce,
    Train,
    Load,
    Save,
    Predict,
    Combine,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Features => "features",
            Phase::Split => "split",
            Phase::Reduce => "reduce",
            Phase::Train => "train",
            Phase::Load => "load",
            Phase::Save => "save",
            Phase::Predict => "predict",
            Phase::Combine => "combine",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the ensemble pipeline.
#[derive(Debug, Error)]
pub enum EnsembleError {
    /// Invalid or inconsistent configuration. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Degenerate numeric input that would otherwise propagate NaNs.
    #[error("numeric instability: {0}")]
    NumericInstability(String),

    /// A single ensemble member failed; the whole run is aborted.
    #[error("member {index} ({name}) failed during {phase}")]
    Member {
        index: usize,
        name: String,
        phase: Phase,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl EnsembleError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn numeric(message: impl Into<String>) -> Self {
        Self::NumericInstability(message.into())
    }

    /// Wrap a failure of member `index` in `phase`.
    pub fn member(index: usize, name: &str, phase: Phase, source: anyhow::Error) -> Self {
        Self::Member {
            index,
            name: name.to_string(),
            phase,
            source: source.into(),
        }
    }

    /// Phase of a member failure, if this is one.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Member { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_error_message_names_phase() {
        let err = EnsembleError::member(
            2,
            "mean_random",
            Phase::Predict,
            anyhow::anyhow!("width mismatch"),
        );
        let message = err.to_string();
        assert!(message.contains("member 2"));
        assert!(message.contains("mean_random"));
        assert!(message.contains("predict"));
        assert_eq!(err.phase(), Some(Phase::Predict));

        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("width mismatch"));
    }
}
