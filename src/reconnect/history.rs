//! Bounded log of recent failures.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Layer a failure happened at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureLayer {
    /// Association with the wireless network.
    Network,
    /// Encrypted session to the endpoint.
    Session,
}

/// What failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// An association attempt failed.
    AttachFailed,
    /// An established association was lost.
    AttachmentLost,
    /// A connect attempt failed.
    ConnectFailed,
    /// A live session closed.
    SessionClosed,
}

impl FailureKind {
    /// Layer this kind of failure belongs to.
    pub fn layer(self) -> FailureLayer {
        match self {
            Self::AttachFailed | Self::AttachmentLost => FailureLayer::Network,
            Self::ConnectFailed | Self::SessionClosed => FailureLayer::Session,
        }
    }
}

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureEvent {
    /// When it happened.
    pub at: Instant,
    /// What failed.
    pub kind: FailureKind,
    /// Human-readable cause.
    pub detail: String,
}

impl FailureEvent {
    /// Create a failure event.
    pub fn new(at: Instant, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            at,
            kind,
            detail: detail.into(),
        }
    }

    /// Layer of the failure.
    pub fn layer(&self) -> FailureLayer {
        self.kind.layer()
    }
}

impl fmt::Display for FailureEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}

/// Ordered, bounded failure history. Oldest entries are dropped first.
///
/// A success marker splits the log: entries after it are "recent". Marking
/// success empties the recent window but keeps older entries until the
/// session proves stable and [`clear`](Self::clear) is called.
#[derive(Debug, Clone)]
pub struct FailureHistory {
    events: VecDeque<FailureEvent>,
    capacity: usize,
    /// Number of newest entries recorded since the last success.
    recent_len: usize,
    total_network: u64,
    total_session: u64,
}

impl FailureHistory {
    /// Create an empty history holding at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            recent_len: 0,
            total_network: 0,
            total_session: 0,
        }
    }

    /// Append an event, evicting the oldest if full.
    pub fn record(&mut self, event: FailureEvent) {
        match event.layer() {
            FailureLayer::Network => self.total_network += 1,
            FailureLayer::Session => self.total_session += 1,
        }
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
        self.recent_len = (self.recent_len + 1).min(self.events.len());
    }

    /// Empty the recent window after a successful connect.
    pub fn mark_success(&mut self) {
        self.recent_len = 0;
    }

    /// Drop every entry after sustained success. Lifetime totals are kept.
    pub fn clear(&mut self) {
        self.events.clear();
        self.recent_len = 0;
    }

    /// Failures since the last success, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = &FailureEvent> {
        self.events.iter().skip(self.events.len() - self.recent_len)
    }

    /// All retained failures, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &FailureEvent> {
        self.events.iter()
    }

    /// Most recent failure.
    pub fn last(&self) -> Option<&FailureEvent> {
        self.events.back()
    }

    /// Session closures no older than `window` at `now`.
    pub fn closures_within(&self, now: Instant, window: Duration) -> usize {
        self.events
            .iter()
            .rev()
            .take_while(|e| now.saturating_duration_since(e.at) <= window)
            .filter(|e| e.kind == FailureKind::SessionClosed)
            .count()
    }

    /// Retained entries.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns true if nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Network-layer failures over the lifetime of the history.
    pub fn total_network(&self) -> u64 {
        self.total_network
    }

    /// Session-layer failures over the lifetime of the history.
    pub fn total_session(&self) -> u64 {
        self.total_session
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(at: Instant, kind: FailureKind) -> FailureEvent {
        FailureEvent::new(at, kind, "test")
    }

    #[test]
    fn test_bounded_drops_oldest() {
        let now = Instant::now();
        let mut history = FailureHistory::new(3);
        for i in 0..5 {
            history.record(event(now + Duration::from_secs(i), FailureKind::ConnectFailed));
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.iter().next().unwrap().at, now + Duration::from_secs(2));
        assert_eq!(history.total_session(), 5);
    }

    #[test]
    fn test_layers() {
        let now = Instant::now();
        let mut history = FailureHistory::new(8);
        history.record(event(now, FailureKind::AttachFailed));
        history.record(event(now, FailureKind::AttachmentLost));
        history.record(event(now, FailureKind::SessionClosed));
        assert_eq!(history.total_network(), 2);
        assert_eq!(history.total_session(), 1);
        assert_eq!(history.last().unwrap().layer(), FailureLayer::Session);
    }

    #[test]
    fn test_mark_success_empties_recent_only() {
        let now = Instant::now();
        let mut history = FailureHistory::new(8);
        history.record(event(now, FailureKind::ConnectFailed));
        history.record(event(now, FailureKind::ConnectFailed));
        assert_eq!(history.recent().count(), 2);

        history.mark_success();
        assert_eq!(history.recent().count(), 0);
        assert_eq!(history.len(), 2);

        history.record(event(now, FailureKind::SessionClosed));
        assert_eq!(history.recent().count(), 1);
        assert_eq!(history.recent().next().unwrap().kind, FailureKind::SessionClosed);
    }

    #[test]
    fn test_recent_survives_eviction() {
        let now = Instant::now();
        let mut history = FailureHistory::new(2);
        for _ in 0..4 {
            history.record(event(now, FailureKind::ConnectFailed));
        }
        assert_eq!(history.recent().count(), 2);
    }

    #[test]
    fn test_clear_keeps_totals() {
        let now = Instant::now();
        let mut history = FailureHistory::new(8);
        history.record(event(now, FailureKind::AttachmentLost));
        history.clear();
        assert!(history.is_empty());
        assert_eq!(history.total_network(), 1);
    }

    #[test]
    fn test_closures_within_window() {
        let start = Instant::now();
        let mut history = FailureHistory::new(8);
        history.record(event(start, FailureKind::SessionClosed));
        history.record(event(start + Duration::from_secs(5), FailureKind::ConnectFailed));
        history.record(event(start + Duration::from_secs(40), FailureKind::SessionClosed));

        let now = start + Duration::from_secs(41);
        assert_eq!(history.closures_within(now, Duration::from_secs(10)), 1);
        assert_eq!(history.closures_within(now, Duration::from_secs(60)), 2);
    }
}
