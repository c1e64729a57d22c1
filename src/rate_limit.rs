use crate::constants;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::{num::NonZeroU32, sync::Arc};

#[derive(Clone)]
pub struct RateLimitConfig {
    pub general_limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    pub job_submit_limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl RateLimitConfig {
    pub fn new() -> Self {
        let general_quota =
            Quota::per_minute(NonZeroU32::new(constants::REQUESTS_PER_MINUTE).unwrap());
        let job_submit_quota = Quota::per_minute(
            NonZeroU32::new(constants::JOB_SUBMIT_REQUESTS_PER_MINUTE).unwrap(),
        );

        Self {
            general_limiter: Arc::new(RateLimiter::direct(general_quota)),
            job_submit_limiter: Arc::new(RateLimiter::direct(job_submit_quota)),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies the general limiter to every request, and the stricter job-submit
/// limiter to `POST /jobs` specifically.
pub async fn rate_limit_middleware(
    State(limits): State<Arc<RateLimitConfig>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let is_job_submit = request.method() == "POST" && request.uri().path() == "/jobs";

    if limits.general_limiter.check().is_err() {
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }
    if is_job_submit && limits.job_submit_limiter.check().is_err() {
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_initial_requests() {
        let config = RateLimitConfig::new();
        assert!(config.general_limiter.check().is_ok());
        assert!(config.job_submit_limiter.check().is_ok());
    }

    #[test]
    fn job_submit_quota_is_stricter_than_general() {
        let config = RateLimitConfig::new();
        let mut job_submit_allowed = 0;
        for _ in 0..(constants::REQUESTS_PER_MINUTE + 1) {
            if config.job_submit_limiter.check().is_ok() {
                job_submit_allowed += 1;
            }
        }
        assert!(job_submit_allowed <= constants::JOB_SUBMIT_REQUESTS_PER_MINUTE as usize);
    }
}
