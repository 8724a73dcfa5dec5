//! Error taxonomy for the decision loop.
//! Every kind except `ConfigInvalid` is retryable: the scheduler and the engine
//! worker absorb them and surface a transient status instead of halting.

use thiserror::Error;

use crate::board::Pos;
use crate::rules::Forbidden;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AssistError {
    /// Some cells could not be classified; the cycle is skipped.
    #[error("Recognition ambiguous: {unknown} cell(s) could not be classified")]
    RecognitionAmbiguous { unknown: usize },

    /// The stable board does not follow from the move history by one legal stone.
    #[error("Recognition inconsistent with move history: {changed} cell(s) changed")]
    RecognitionInconsistent { changed: usize },

    /// Captured region has the wrong dimensions for the configured board.
    #[error("Frame is {width}x{height}, expected {expected}x{expected}")]
    FrameSize {
        width: u32,
        height: u32,
        expected: u32,
    },

    #[error("Engine handshake failed: {0}")]
    EngineHandshakeFailed(String),

    #[error("Engine crashed: {0}")]
    EngineCrashed(String),

    #[error("Engine timed out while {0}")]
    EngineTimeout(String),

    /// The requester dropped the analysis before it finished.
    #[error("Analysis abandoned before completion")]
    AnalysisAbandoned,

    #[error("Move {pos} rejected: {reason}")]
    RuleViolation { pos: Pos, reason: Forbidden },

    #[error("Chess manual corrupt: {0}")]
    CacheCorrupt(String),

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl AssistError {
    /// Only an invalid configuration is fatal.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AssistError::ConfigInvalid(_))
    }

    /// Engine-side failures that put the session into `Faulted`.
    pub fn is_engine_fault(&self) -> bool {
        matches!(
            self,
            AssistError::EngineHandshakeFailed(_)
                | AssistError::EngineCrashed(_)
                | AssistError::EngineTimeout(_)
        )
    }
}

pub type AssistResult<T> = Result<T, AssistError>;
