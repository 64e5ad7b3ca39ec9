use thiserror::Error;

/// Errors that abort a load test before or instead of producing a report.
#[derive(Debug, Error)]
pub enum LoadTestError {
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("{role} count {count} exceeds the limit of {limit} for cloud hosts")]
    CloudLimitExceeded {
        role: &'static str,
        count: u32,
        limit: u32,
    },

    #[error("load test cancelled")]
    Cancelled,
}
