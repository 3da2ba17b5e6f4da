//! Per-user request and spend counters behind the safety gate.
//!
//! The in-memory store is process-local: separate instances each enforce
//! their own limits. A shared implementation of [`SafetyMetricsStore`] is
//! needed for global enforcement across instances.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;

/// Result of trying to record a request inside the sliding window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Requests in the window, including the recorded one when allowed
    pub count: u32,
    /// Oldest request still in the window
    pub oldest: Option<DateTime<Utc>>,
    pub allowed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DailyUsage {
    pub tokens: u64,
    pub cost: f64,
}

#[async_trait]
pub trait SafetyMetricsStore: Send + Sync {
    /// Drop requests older than `window_start` and record one at `now` if
    /// fewer than `limit` remain.
    async fn try_record_request(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        window_start: DateTime<Utc>,
        limit: u32,
    ) -> anyhow::Result<WindowState>;

    /// Window state without recording anything.
    async fn peek_requests(
        &self,
        user_id: &str,
        window_start: DateTime<Utc>,
    ) -> anyhow::Result<WindowState>;

    /// Spend so far on `day`.
    async fn daily_usage(&self, user_id: &str, day: NaiveDate) -> anyhow::Result<DailyUsage>;

    /// Add spend on `day`, returning the new totals.
    async fn add_usage(
        &self,
        user_id: &str,
        day: NaiveDate,
        tokens: u64,
        cost: f64,
    ) -> anyhow::Result<DailyUsage>;

    async fn reset(&self, user_id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
struct UserMetrics {
    requests: VecDeque<DateTime<Utc>>,
    last_request: Option<DateTime<Utc>>,
    day: NaiveDate,
    usage: DailyUsage,
}

impl UserMetrics {
    fn new(day: NaiveDate) -> Self {
        Self {
            requests: VecDeque::new(),
            last_request: None,
            day,
            usage: DailyUsage::default(),
        }
    }

    /// Clear spend when the wall-clock day changed.
    fn roll_day(&mut self, day: NaiveDate) {
        if self.day != day {
            self.day = day;
            self.usage = DailyUsage::default();
        }
    }

    fn expire(&mut self, window_start: DateTime<Utc>) {
        while self.requests.front().is_some_and(|t| *t <= window_start) {
            self.requests.pop_front();
        }
    }

    fn window_state(&self, allowed: bool) -> WindowState {
        WindowState {
            count: self.requests.len() as u32,
            oldest: self.requests.front().copied(),
            allowed,
        }
    }
}

/// Entries are created on first use and never persisted.
#[derive(Default)]
pub struct InMemorySafetyMetricsStore {
    users: DashMap<String, UserMetrics>,
}

impl InMemorySafetyMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracked_users(&self) -> usize {
        self.users.len()
    }

    pub fn last_request(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.users.get(user_id).and_then(|m| m.last_request)
    }
}

#[async_trait]
impl SafetyMetricsStore for InMemorySafetyMetricsStore {
    async fn try_record_request(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        window_start: DateTime<Utc>,
        limit: u32,
    ) -> anyhow::Result<WindowState> {
        let mut entry = self
            .users
            .entry(user_id.to_string())
            .or_insert_with(|| UserMetrics::new(now.date_naive()));
        entry.roll_day(now.date_naive());
        entry.expire(window_start);

        if entry.requests.len() as u32 >= limit {
            return Ok(entry.window_state(false));
        }
        entry.requests.push_back(now);
        entry.last_request = Some(now);
        Ok(entry.window_state(true))
    }

    async fn peek_requests(
        &self,
        user_id: &str,
        window_start: DateTime<Utc>,
    ) -> anyhow::Result<WindowState> {
        let state = match self.users.get(user_id) {
            Some(metrics) => {
                let in_window: Vec<_> = metrics.requests.iter().filter(|t| **t > window_start).collect();
                WindowState {
                    count: in_window.len() as u32,
                    oldest: in_window.first().map(|t| **t),
                    allowed: true,
                }
            }
            None => WindowState { count: 0, oldest: None, allowed: true },
        };
        Ok(state)
    }

    async fn daily_usage(&self, user_id: &str, day: NaiveDate) -> anyhow::Result<DailyUsage> {
        Ok(match self.users.get(user_id) {
            Some(metrics) if metrics.day == day => metrics.usage,
            _ => DailyUsage::default(),
        })
    }

    async fn add_usage(
        &self,
        user_id: &str,
        day: NaiveDate,
        tokens: u64,
        cost: f64,
    ) -> anyhow::Result<DailyUsage> {
        let mut entry = self
            .users
            .entry(user_id.to_string())
            .or_insert_with(|| UserMetrics::new(day));
        entry.roll_day(day);
        entry.usage.tokens += tokens;
        entry.usage.cost += cost;
        Ok(entry.usage)
    }

    async fn reset(&self, user_id: &str) -> anyhow::Result<()> {
        self.users.remove(user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::base_time;
    use chrono::Duration;

    #[tokio::test]
    async fn test_window_records_until_limit() {
        let store = InMemorySafetyMetricsStore::new();
        let now = base_time();
        let window_start = now - Duration::seconds(60);

        for _ in 0..2 {
            assert!(store.try_record_request("u1", now, window_start, 2).await.unwrap().allowed);
        }
        let denied = store.try_record_request("u1", now, window_start, 2).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.count, 2);
        assert_eq!(store.last_request("u1"), Some(now));

        // Other users are unaffected.
        assert!(store.try_record_request("u2", now, window_start, 2).await.unwrap().allowed);
        assert_eq!(store.tracked_users(), 2);
    }

    #[tokio::test]
    async fn test_usage_resets_on_new_day() {
        let store = InMemorySafetyMetricsStore::new();
        let today = base_time().date_naive();
        let tomorrow = today.succ_opt().unwrap();

        store.add_usage("u1", today, 500, 0.01).await.unwrap();
        let usage = store.add_usage("u1", today, 250, 0.02).await.unwrap();
        assert_eq!(usage.tokens, 750);
        assert!((usage.cost - 0.03).abs() < 1e-9);

        assert_eq!(store.daily_usage("u1", tomorrow).await.unwrap(), DailyUsage::default());
        let usage = store.add_usage("u1", tomorrow, 10, 0.0).await.unwrap();
        assert_eq!(usage.tokens, 10);
    }

    #[tokio::test]
    async fn test_reset_forgets_user() {
        let store = InMemorySafetyMetricsStore::new();
        let today = base_time().date_naive();
        store.add_usage("u1", today, 500, 0.01).await.unwrap();

        store.reset("u1").await.unwrap();

        assert_eq!(store.daily_usage("u1", today).await.unwrap(), DailyUsage::default());
        assert_eq!(store.tracked_users(), 0);
    }
}
