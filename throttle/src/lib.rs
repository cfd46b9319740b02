//! Request, bandwidth and open-file limits for object transfers
//!
//! A [`Throttle`] is created once per run and shared (behind an `Arc`) by every worker of that run.
//! It carries three independent limits:
//!
//! 1. **Open files** - caps the number of local files held open at once (multipart part readers
//!    each open their own handle)
//! 2. **Requests** - caps the number of storage requests issued per second
//! 3. **Transfer chunks** - caps the number of `chunk_size` sized pieces of payload moved per
//!    second, which bounds bandwidth
//!
//! Every limit set to zero is disabled and never blocks.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use throttle::{Limits, Throttle};
//!
//! # async fn example() {
//! let throttle = Arc::new(Throttle::new(Limits {
//!     max_open_files: 256,
//!     ops_per_second: 500,
//!     chunks_per_second: 100,
//!     chunk_size: 1024 * 1024,
//! }));
//! let replenish = tokio::spawn({
//!     let throttle = throttle.clone();
//!     async move { throttle.run_replenish().await }
//! });
//!
//! throttle.get_ops_token().await;
//! throttle.get_transfer_tokens(8 * 1024 * 1024).await;
//! let _guard = throttle.open_file_permit().await;
//! // ... issue the request
//! replenish.abort();
//! # }
//! ```
//!
//! # Token Calculation
//!
//! For transfer throttling, the number of tokens required for a payload is:
//!
//! ```text
//! tokens = ⌈len / chunk_size⌉
//! ```
//!
//! # Replenishment
//!
//! Rates are configured per second. Rates of at least 10/s are replenished every 100ms in tenths,
//! lower rates once per second, so that short bursts stay close to the configured rate.

mod semaphore;

/// Limits for one [`Throttle`], zero disables the respective limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct Limits {
    pub max_open_files: usize,
    pub ops_per_second: usize,
    pub chunks_per_second: usize,
    pub chunk_size: u64,
}

pub struct Throttle {
    open_files: semaphore::Semaphore,
    ops: semaphore::Semaphore,
    chunks: semaphore::Semaphore,
    limits: Limits,
}

pub struct OpenFileGuard<'a> {
    _permit: Option<tokio::sync::SemaphorePermit<'a>>,
}

/// Splits a per-second rate into (tokens, interval) replenish steps.
#[must_use]
pub fn replenish_schedule(per_second: usize) -> (usize, std::time::Duration) {
    if per_second >= 10 {
        (per_second / 10, std::time::Duration::from_millis(100))
    } else {
        (per_second, std::time::Duration::from_secs(1))
    }
}

impl Throttle {
    #[must_use]
    pub fn new(limits: Limits) -> Self {
        let (ops_tokens, _) = replenish_schedule(limits.ops_per_second);
        let chunk_tokens = if limits.chunk_size > 0 {
            replenish_schedule(limits.chunks_per_second).0
        } else {
            0
        };
        Self {
            open_files: semaphore::Semaphore::new(limits.max_open_files),
            ops: semaphore::Semaphore::new(ops_tokens),
            chunks: semaphore::Semaphore::new(chunk_tokens),
            limits,
        }
    }

    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(Limits::default())
    }

    #[must_use]
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub async fn open_file_permit(&self) -> OpenFileGuard<'_> {
        OpenFileGuard {
            _permit: self.open_files.acquire().await,
        }
    }

    pub async fn get_ops_token(&self) {
        self.ops.consume().await;
    }

    /// Waits for enough transfer tokens to move `len` bytes.
    pub async fn get_transfer_tokens(&self, len: u64) {
        if !self.chunks.is_enabled() {
            return;
        }
        let chunk_size = self.limits.chunk_size;
        let tokens = 1 + (std::cmp::max(1, len) - 1) / chunk_size;
        // a single request can never need more tokens than one replenish step provides
        let cap = replenish_schedule(self.limits.chunks_per_second).0 as u64;
        let tokens = tokens.min(cap.max(1));
        match u32::try_from(tokens) {
            Ok(tokens) => self.chunks.consume_many(tokens).await,
            Err(_) => tracing::error!(
                "chunk size: {} is too small to limit throughput for payloads this big, size: {}",
                chunk_size,
                len,
            ),
        }
    }

    /// Replenishes the request and transfer buckets until the future is dropped.
    pub async fn run_replenish(&self) {
        let (ops, ops_interval) = replenish_schedule(self.limits.ops_per_second);
        let (chunks, chunks_interval) = replenish_schedule(self.limits.chunks_per_second);
        tokio::join!(
            self.ops.run_replenish(ops, ops_interval),
            self.chunks.run_replenish(chunks, chunks_interval),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_splits_fast_rates() {
        assert_eq!(
            replenish_schedule(500),
            (50, std::time::Duration::from_millis(100))
        );
        assert_eq!(
            replenish_schedule(5),
            (5, std::time::Duration::from_secs(1))
        );
    }

    #[tokio::test]
    async fn unlimited_never_blocks() {
        let throttle = Throttle::unlimited();
        for _ in 0..1000 {
            throttle.get_ops_token().await;
            throttle.get_transfer_tokens(u64::MAX).await;
        }
        let _a = throttle.open_file_permit().await;
        let _b = throttle.open_file_permit().await;
    }

    #[tokio::test(start_paused = true)]
    async fn ops_wait_for_replenish() {
        let throttle = std::sync::Arc::new(Throttle::new(Limits {
            ops_per_second: 20,
            ..Default::default()
        }));
        // two tokens available per 100ms step
        throttle.get_ops_token().await;
        throttle.get_ops_token().await;
        let waiter = tokio::spawn({
            let throttle = throttle.clone();
            async move { throttle.get_ops_token().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        let replenish = tokio::spawn({
            let throttle = throttle.clone();
            async move { throttle.run_replenish().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        waiter.await.unwrap();
        replenish.abort();
    }

    #[tokio::test]
    async fn open_files_are_capped() {
        let throttle = Throttle::new(Limits {
            max_open_files: 1,
            ..Default::default()
        });
        let guard = throttle.open_file_permit().await;
        assert_eq!(throttle.open_files.available(), 0);
        drop(guard);
        assert_eq!(throttle.open_files.available(), 1);
    }
}
