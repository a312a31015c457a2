/*
 * Copyright (C) 2025 The Cacheset Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Exponential backoff schedule: `steps` attempts, delays starting at `base`
/// and multiplied by `factor` between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub steps: u32,
    pub base: Duration,
    pub factor: f64,
}

impl Backoff {
    pub const fn new(steps: u32, base: Duration, factor: f64) -> Self {
        Self {
            steps,
            base,
            factor,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let scale = self.factor.powi(attempt as i32);
        self.base.mul_f64(scale)
    }
}

/// Invokes `operation` until it succeeds, the error stops matching
/// `should_retry`, or the backoff schedule is exhausted. The attempt index is
/// passed to the operation so callers can re-read state before retrying.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    backoff: Backoff,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt + 1 >= backoff.steps || !should_retry(&error) {
                    return Err(error);
                }
                sleep(backoff.delay(attempt)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_backoff(steps: u32) -> Backoff {
        Backoff::new(steps, Duration::from_millis(1), 1.5)
    }

    #[tokio::test]
    async fn returns_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(
            fast_backoff(4),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(7) }
            },
            |_| true,
        )
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_matching_errors_until_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(
            fast_backoff(3),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("conflict".to_string()) }
            },
            |e| e == "conflict",
        )
        .await;
        assert_eq!(result, Err("conflict".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_matching_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(
            fast_backoff(5),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal".to_string()) }
            },
            |e| e == "conflict",
        )
        .await;
        assert_eq!(result, Err("fatal".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempt_index_advances() {
        let result: Result<u32, String> = retry_with_backoff(
            fast_backoff(3),
            |attempt| async move {
                if attempt == 2 {
                    Ok(attempt)
                } else {
                    Err("conflict".to_string())
                }
            },
            |_| true,
        )
        .await;
        assert_eq!(result, Ok(2));
    }
}
