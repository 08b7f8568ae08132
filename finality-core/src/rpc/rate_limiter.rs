// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Sliding-window limiter: at most `max_requests` slots per `window`.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    issued: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            issued: Mutex::new(VecDeque::with_capacity(max_requests.max(1))),
        }
    }

    /// Waits until the window has capacity and takes a slot.
    ///
    /// Returns whether the caller had to wait.
    pub async fn wait_for_slot(&self) -> bool {
        let mut waited = false;
        loop {
            let resume_at = {
                let mut issued = self.issued.lock().unwrap_or_else(|e| e.into_inner());
                let now = Instant::now();
                while let Some(oldest) = issued.front() {
                    if now.duration_since(*oldest) >= self.window {
                        issued.pop_front();
                    } else {
                        break;
                    }
                }
                if issued.len() < self.max_requests {
                    issued.push_back(now);
                    return waited;
                }
                match issued.front() {
                    Some(oldest) => *oldest + self.window,
                    None => now,
                }
            };
            waited = true;
            tokio::time::sleep_until(resume_at).await;
        }
    }

    /// Slots currently held inside the window.
    pub fn in_flight(&self) -> usize {
        let issued = self.issued.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        issued
            .iter()
            .filter(|t| now.duration_since(**t) < self.window)
            .count()
    }
}
