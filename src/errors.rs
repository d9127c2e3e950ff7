use thiserror::Error;

/// Full error taxonomy for the trading brain. The dispatcher classifies every
/// stage's `Result` into one of these; nothing here is allowed to propagate as
/// a panic or an unhandled exception.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("risk rejection ({limit}): {reason}")]
    RiskRejection { limit: String, reason: String },

    #[error("conflict rejection ({policy}): {reason}")]
    ConflictRejection { policy: String, reason: String },

    #[error("transient exchange error: {0}")]
    TransientExchange(String),

    #[error("permanent exchange error: {0}")]
    PermanentExchange(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("lock timeout on {symbol} after {attempted:?}")]
    LockTimeout {
        symbol: String,
        attempted: std::time::Duration,
    },

    #[error("cancelled: {0}")]
    Cancellation(String),
}

impl EngineError {
    /// Non-retryable kinds abort the pipeline and release the lock immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransientExchange(_) | EngineError::Persistence(_))
    }

    /// Short machine-readable tag, used as the audit "reason" and in metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::RiskRejection { .. } => "risk_rejection",
            EngineError::ConflictRejection { .. } => "conflict_rejection",
            EngineError::TransientExchange(_) => "transient_exchange_error",
            EngineError::PermanentExchange(_) => "permanent_exchange_error",
            EngineError::Persistence(_) => "persistence_error",
            EngineError::LockTimeout { .. } => "lock_timeout",
            EngineError::Cancellation(_) => "cancellation",
        }
    }
}

/// Errors the exchange gateway itself raises, before they are folded into
/// `EngineError` by the dispatcher.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("unsupported order type: {0:?}")]
    UnsupportedOrderType(crate::types::OrderType),

    #[error("insufficient balance")]
    InsufficientBalance,

    #[error("invalid price")]
    InvalidPrice,

    #[error("invalid quantity")]
    InvalidQuantity,

    #[error("notional below minimum")]
    NotionalBelowMinimum,

    #[error("reduce_only must not be sent together with position_side in hedge mode")]
    ReduceOnlyNotRequiredInHedgeMode,

    #[error("authentication failure")]
    AuthFailure,

    #[error("timeout")]
    Timeout,

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("transient server error: {0}")]
    TransientServer(String),

    #[error("order not found")]
    NotFound,
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout | GatewayError::RateLimited { .. } | GatewayError::TransientServer(_)
        )
    }
}

impl From<GatewayError> for EngineError {
    fn from(e: GatewayError) -> Self {
        if e.is_retryable() {
            EngineError::TransientExchange(e.to_string())
        } else {
            EngineError::PermanentExchange(e.to_string())
        }
    }
}
