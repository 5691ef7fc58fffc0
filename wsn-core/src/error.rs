use thiserror::Error;

/// Errors the engine can surface to its caller.
///
/// Per the error-handling design, most failure modes (transient radio
/// errors, HMAC mismatches, table-full, lock timeouts, persistence write
/// failures, config-parse failures) are logged and absorbed internally —
/// they never reach this type. Only the two fatal conditions (radio or
/// persistence layer failing to initialize) are represented here, plus a
/// handful of caller-misuse cases that are cheap to check at the API
/// boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("radio layer failed to initialize: {0}")]
    RadioInit(String),

    #[error("persistence layer failed to initialize: {0}")]
    PersistenceInit(String),

    #[error("node_id {0:#x} is an invalid sentinel (0 or 0xFFFFFFFF)")]
    InvalidNodeId(u32),

    #[error("neighbor table lock timed out")]
    LockTimeout,
}

pub type EngineResult<T> = Result<T, EngineError>;
