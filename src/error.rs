use thiserror::Error;

/// Engine-level error taxonomy. The split matters operationally:
/// `Transient` failures are retried at the gateway boundary, everything
/// else aborts the triggering operation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Broker I/O failed but may succeed on retry (disconnect, timeout).
    #[error("transient broker error: {0}")]
    Transient(String),

    /// A computed value is unusable (NaN price, non-positive quantity,
    /// unresolved contract). The operation is aborted, never submitted.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The broker refused an order. Not retried automatically.
    #[error("order rejected by broker: {0}")]
    Rejected(String),

    /// The daily-loss breaker has tripped; new entries are refused.
    #[error("risk breaker triggered, new entries suppressed")]
    RiskHalted,

    /// Bad configuration (unknown timeframe string, malformed file).
    #[error("configuration error: {0}")]
    Config(String),

    /// Unrecoverable: reconnect attempts exhausted. The engine can no
    /// longer safely manage live risk and must surface this upstream.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
