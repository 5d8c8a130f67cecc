//! Per-connection metadata and lifecycle states.

use std::fmt;
use std::time::{Duration, Instant};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Identifier of a connection, unique within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    /// The raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle state of a pooled connection.
///
/// Legal moves: `Idle -> InUse`, `InUse -> Idle`, `Idle | InUse -> Unhealthy`,
/// `Unhealthy -> Closed`, and `Idle | InUse -> Closed` on eviction, expiry or
/// shutdown. `Closed` is terminal; a closed connection is no longer tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ConnectionState {
    /// Available for checkout.
    Idle,
    /// Checked out by a caller.
    InUse,
    /// Failed a probe or was released as broken; waiting to be closed.
    Unhealthy,
    /// Torn down.
    Closed,
}

impl ConnectionState {
    pub(crate) const fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::InUse | Self::Unhealthy | Self::Closed)
                | (Self::InUse, Self::Idle | Self::Unhealthy | Self::Closed)
                | (Self::Unhealthy, Self::Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::InUse => "in_use",
            Self::Unhealthy => "unhealthy",
            Self::Closed => "closed",
        })
    }
}

/// Snapshot of one connection's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Identifier within the pool.
    pub id: ConnectionId,
    /// Current state.
    pub state: ConnectionState,
    /// When the connection was opened.
    pub created_at: Instant,
    /// When it was last checked out or returned.
    pub last_used_at: Instant,
    /// When it last passed a probe.
    pub last_health_check_at: Option<Instant>,
    /// How many times it has been checked out.
    pub use_count: u64,
}

impl ConnectionInfo {
    pub(crate) fn new(id: ConnectionId, state: ConnectionState, now: Instant) -> Self {
        Self {
            id,
            state,
            created_at: now,
            last_used_at: now,
            last_health_check_at: None,
            use_count: 0,
        }
    }

    /// Time since the connection was opened.
    #[must_use]
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Time since the connection was last used.
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used_at)
    }

    /// Whether the connection has outlived `max_lifetime`.
    #[must_use]
    pub fn is_expired(&self, max_lifetime: Duration, now: Instant) -> bool {
        self.age(now) >= max_lifetime
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::{Closed, Idle, InUse, Unhealthy};
    use rstest::rstest;

    #[rstest]
    #[case(Idle, InUse, true)]
    #[case(InUse, Idle, true)]
    #[case(Idle, Unhealthy, true)]
    #[case(InUse, Unhealthy, true)]
    #[case(Unhealthy, Closed, true)]
    #[case(Idle, Closed, true)]
    #[case(Unhealthy, Idle, false)]
    #[case(Unhealthy, InUse, false)]
    #[case(Closed, Idle, false)]
    #[case(Idle, Idle, false)]
    fn transitions(#[case] from: ConnectionState, #[case] to: ConnectionState, #[case] ok: bool) {
        assert_eq!(from.can_become(to), ok);
    }

    #[test]
    fn expiry_uses_age() {
        let start = Instant::now();
        let info = ConnectionInfo::new(ConnectionId(1), Idle, start);
        let later = start + Duration::from_secs(10);
        assert_eq!(info.age(later), Duration::from_secs(10));
        assert!(info.is_expired(Duration::from_secs(10), later));
        assert!(!info.is_expired(Duration::from_secs(11), later));
    }

    #[test]
    fn id_display() {
        assert_eq!(ConnectionId(7).to_string(), "conn-7");
    }
}
