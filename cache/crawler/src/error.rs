//! Crawler error and result types.

/// Why a crawl could not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    /// The crawler worker thread is not running.
    #[error("crawler worker is not running")]
    NotRunning,

    /// Another crawl is already in flight (or autoexpire is suppressed).
    #[error("a crawl is already running")]
    Busy,

    /// The request is malformed: hash walk with a non-dump mode, or a
    /// client-requiring mode without a client.
    #[error("invalid crawl request")]
    Invalid,

    /// The worker thread was already started.
    #[error("crawler worker already started")]
    AlreadyStarted,

    /// Buffer or thread allocation failed.
    #[error("allocation failed")]
    Alloc,
}

/// Wire-level result of a `crawl` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlOutcome {
    /// Crawl started.
    Ok,
    /// A crawl is already running.
    Running,
    /// A slab class id was out of range or unparseable.
    Badclass,
    /// No classes matched (nothing to do).
    Notstarted,
    /// Any other failure.
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_error_display() {
        assert_eq!(
            StartError::NotRunning.to_string(),
            "crawler worker is not running"
        );
        assert_eq!(StartError::Busy.to_string(), "a crawl is already running");
    }
}
