//! Sliding-window rate limiting per session per command class.
//!
//! Each window keeps the instants of accepted requests within the last
//! `window_secs`. A request is admitted while fewer than `max_requests`
//! remain in the window; rejected requests are not recorded.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use neural_bridge_core::config::{RateLimitConfig, RateLimitRule};

/// Class name shared by every command without its own rule.
pub const DEFAULT_CLASS: &str = "default";

/// Result of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

/// Accepted-request log for one (session, class) pair.
#[derive(Debug, Default, Clone)]
pub struct SlidingWindow {
    hits: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    fn evict(&mut self, window: Duration, now: Instant) {
        while let Some(&oldest) = self.hits.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    /// Admit and record one request, or report how long until a slot frees.
    pub fn try_acquire(&mut self, rule: RateLimitRule, now: Instant) -> RateDecision {
        let window = rule.window();
        self.evict(window, now);

        if self.hits.len() >= rule.max_requests as usize {
            let retry_after = self
                .hits
                .front()
                .map(|&oldest| window.saturating_sub(now.saturating_duration_since(oldest)))
                .unwrap_or(window);
            return RateDecision::Limited { retry_after };
        }

        self.hits.push_back(now);
        RateDecision::Allowed {
            remaining: rule.max_requests - self.hits.len() as u32,
        }
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    /// Requests recorded less than `window` before `now`.
    pub fn count_within(&self, window: Duration, now: Instant) -> usize {
        self.hits
            .iter()
            .filter(|&&hit| now.saturating_duration_since(hit) < window)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

/// Maps command names to their class and rule.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    config: RateLimitConfig,
}

impl RateLimitPolicy {
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config }
    }

    /// A command with its own rule forms its own class; all others share `default`.
    pub fn class_of<'a>(&self, command: &'a str) -> &'a str {
        if self.config.commands.contains_key(command) {
            command
        } else {
            DEFAULT_CLASS
        }
    }

    pub fn rule_for(&self, class: &str) -> RateLimitRule {
        self.config
            .commands
            .get(class)
            .copied()
            .unwrap_or(self.config.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn rule(max_requests: u32, window_secs: u64) -> RateLimitRule {
        RateLimitRule {
            max_requests,
            window_secs,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_admits_up_to_limit() {
        let mut window = SlidingWindow::new();
        let rule = rule(2, 60);

        assert_eq!(window.try_acquire(rule, Instant::now()), RateDecision::Allowed { remaining: 1 });
        assert_eq!(window.try_acquire(rule, Instant::now()), RateDecision::Allowed { remaining: 0 });
        assert!(!window.try_acquire(rule, Instant::now()).is_allowed());
        // Rejections are not recorded.
        assert_eq!(window.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let mut window = SlidingWindow::new();
        let rule = rule(2, 60);

        window.try_acquire(rule, Instant::now());
        tokio::time::advance(Duration::from_secs(30)).await;
        window.try_acquire(rule, Instant::now());

        match window.try_acquire(rule, Instant::now()) {
            RateDecision::Limited { retry_after } => assert_eq!(retry_after, Duration::from_secs(30)),
            other => panic!("expected limit, got {:?}", other),
        }

        // The first hit ages out; the second is still inside the window.
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(window.try_acquire(rule, Instant::now()).is_allowed());
        assert!(!window.try_acquire(rule, Instant::now()).is_allowed());
    }

    #[test]
    fn test_command_classes() {
        let policy = RateLimitPolicy::new(RateLimitConfig {
            default: rule(100, 60),
            commands: HashMap::from([("execute".to_string(), rule(10, 60))]),
        });
        assert_eq!(policy.class_of("execute"), "execute");
        assert_eq!(policy.class_of("list_sandboxes"), DEFAULT_CLASS);
        assert_eq!(policy.rule_for("execute").max_requests, 10);
        assert_eq!(policy.rule_for(DEFAULT_CLASS).max_requests, 100);
    }
}
