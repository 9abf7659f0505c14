// Weekly profit-share settlement
pub mod calculator;
pub mod scheduler;
pub mod service;

use std::future::Future;
use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Bound a collaborator call; an elapsed deadline becomes a retryable timeout
pub async fn with_timeout<T, F>(limit: Duration, operation: &str, fut: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Timeout(format!("{} exceeded {:?}", operation, limit))),
    }
}
