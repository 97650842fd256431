// Sliding-window request limits per (user, bucket).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use uuid::Uuid;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateBucket {
    /// Page mutations, snapshots and restores.
    Mutate,
    /// History listing.
    Search,
}

impl RateBucket {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mutate => "mutate",
            Self::Search => "search",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited { retry_after_secs: u64 },
}

#[derive(Debug)]
pub struct RateLimiter {
    mutate_per_window: usize,
    search_per_window: usize,
    window: Duration,
    state: Mutex<WindowState>,
}

#[derive(Debug)]
struct WindowState {
    requests: HashMap<(Uuid, RateBucket), VecDeque<Instant>>,
    last_sweep: Option<Instant>,
}

impl WindowState {
    /// Drop every key whose newest request has left the window. Runs at most
    /// once per window.
    fn sweep(&mut self, now: Instant, window: Duration) {
        if self.last_sweep.is_some_and(|last| now.duration_since(last) < window) {
            return;
        }
        self.requests.retain(|_, requests| {
            requests.back().is_some_and(|newest| now.duration_since(*newest) < window)
        });
        self.last_sweep = Some(now);
    }
}

impl RateLimiter {
    pub fn per_minute(mutate: usize, search: usize) -> Self {
        Self {
            mutate_per_window: mutate,
            search_per_window: search,
            window: WINDOW,
            state: Mutex::new(WindowState { requests: HashMap::new(), last_sweep: None }),
        }
    }

    pub async fn check(&self, user_id: Uuid, bucket: RateBucket) -> RateLimitDecision {
        self.check_at(user_id, bucket, Instant::now()).await
    }

    async fn check_at(&self, user_id: Uuid, bucket: RateBucket, now: Instant) -> RateLimitDecision {
        let max_requests = match bucket {
            RateBucket::Mutate => self.mutate_per_window,
            RateBucket::Search => self.search_per_window,
        };
        // Zero disables the bucket.
        if max_requests == 0 {
            return RateLimitDecision::Allowed;
        }

        let mut guard = self.state.lock().await;
        guard.sweep(now, self.window);
        let requests = guard.requests.entry((user_id, bucket)).or_default();
        while requests.front().is_some_and(|oldest| now.duration_since(*oldest) >= self.window) {
            requests.pop_front();
        }

        if requests.len() >= max_requests {
            let retry_after_secs = requests
                .front()
                .map(|oldest| {
                    self.window
                        .checked_sub(now.duration_since(*oldest))
                        .unwrap_or_default()
                        .as_secs()
                        .max(1)
                })
                .unwrap_or(1);
            return RateLimitDecision::Limited { retry_after_secs };
        }

        requests.push_back(now);
        RateLimitDecision::Allowed
    }

    #[cfg(test)]
    async fn tracked_keys(&self) -> usize {
        self.state.lock().await.requests.len()
    }
}
