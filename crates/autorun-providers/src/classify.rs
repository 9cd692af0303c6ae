//! Outcome classification for provider errors.
//!
//! Providers report failures as free text, so classification is a lowercase
//! substring match over the rendered error chain.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    RateLimited,
    Transient,
    Other,
}

pub fn classify_error(error: &str) -> ErrorClass {
    if is_rate_limit_error(error) {
        return ErrorClass::RateLimited;
    }
    if is_transient_error(error) {
        return ErrorClass::Transient;
    }
    ErrorClass::Other
}

pub fn is_rate_limit_error(error: &str) -> bool {
    let e = error.to_lowercase();
    e.contains("rate limit")
        || e.contains("rate_limit")
        || e.contains("ratelimit")
        || e.contains("too many requests")
        || e.contains("http 429")
        || e.contains("status 429")
        || e.contains("429")
        || e.contains("overloaded")
}

pub fn is_transient_error(error: &str) -> bool {
    let e = error.to_lowercase();
    e.contains("timed out")
        || e.contains("timeout")
        || e.contains("connection reset")
        || e.contains("connection refused")
        || e.contains("connection closed")
        || e.contains("broken pipe")
        || e.contains("network")
        || e.contains("dns")
        || e.contains("temporarily unavailable")
        || e.contains("service unavailable")
        || e.contains("bad gateway")
        || e.contains("gateway timeout")
        || e.contains("internal server error")
        || e.contains("502")
        || e.contains("503")
        || e.contains("504")
}
