//! Lock-protected bookkeeping behind a [`Pool`](crate::Pool).
//!
//! Nothing in this module awaits. Every method runs under the pool mutex and
//! leaves the counters consistent with the tracked slots when it returns.
//! Connections that must be torn down are parked in a graveyard; the caller
//! takes them after dropping the lock and closes them through the factory.

use std::collections::{BTreeMap, VecDeque};
use std::mem;
use std::time::{Duration, Instant};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::connection::{ConnectionId, ConnectionInfo, ConnectionState};
use crate::error::PoolError;

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PoolStats {
    /// Connections available for checkout, including those being probed.
    pub idle: usize,
    /// Connections checked out.
    pub in_use: usize,
    /// Connections marked unhealthy and not yet closed.
    pub unhealthy: usize,
    /// Connections tracked by the pool.
    pub total: usize,
    /// Connections being opened right now.
    pub pending: usize,
    /// Callers queued for a connection.
    pub waiting: usize,
    /// Connections opened since the pool was built.
    pub created: u64,
    /// Connections closed since the pool was built.
    pub closed: u64,
    /// Successful checkouts.
    pub acquired: u64,
    /// Acquires that gave up at their deadline.
    pub timeouts: u64,
    /// Health probes that failed or overran.
    pub probe_failures: u64,
}

impl PoolStats {
    /// Whether `idle + in_use + unhealthy == total`.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.idle + self.in_use + self.unhealthy == self.total
    }
}

/// What a parked waiter is handed.
#[derive(Debug)]
pub(crate) enum Handoff<C> {
    /// A checked-out idle connection.
    Connection(ConnectionId, C),
    /// A capacity reservation; the waiter opens the connection itself.
    Create,
}

struct Slot<C> {
    info: ConnectionInfo,
    /// `None` while the connection is checked out, being probed, or closing.
    conn: Option<C>,
}

struct Waiter<C> {
    id: u64,
    tx: oneshot::Sender<Handoff<C>>,
}

#[derive(Debug, Default)]
struct Totals {
    created: u64,
    closed: u64,
    acquired: u64,
    timeouts: u64,
    probe_failures: u64,
}

pub(crate) struct PoolState<C> {
    max_size: usize,
    max_lifetime: Duration,
    slots: BTreeMap<ConnectionId, Slot<C>>,
    idle: VecDeque<ConnectionId>,
    idle_count: usize,
    in_use: usize,
    unhealthy: usize,
    probing: usize,
    pending: usize,
    waiters: VecDeque<Waiter<C>>,
    graveyard: Vec<C>,
    next_conn: u64,
    next_waiter: u64,
    closed: bool,
    totals: Totals,
}

impl<C> PoolState<C> {
    pub(crate) fn new(max_size: usize, max_lifetime: Duration) -> Self {
        Self {
            max_size,
            max_lifetime,
            slots: BTreeMap::new(),
            idle: VecDeque::new(),
            idle_count: 0,
            in_use: 0,
            unhealthy: 0,
            probing: 0,
            pending: 0,
            waiters: VecDeque::new(),
            graveyard: Vec::new(),
            next_conn: 1,
            next_waiter: 1,
            closed: false,
            totals: Totals::default(),
        }
    }

    pub(crate) const fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    /// Anything still outstanding that a draining shutdown must wait for.
    pub(crate) const fn is_busy(&self) -> bool {
        self.in_use + self.probing + self.pending + self.unhealthy > 0
    }

    /// Connections still missing to reach `min_size`, counting those being opened.
    pub(crate) fn deficit(&self, min_size: usize) -> usize {
        min_size.saturating_sub(self.slots.len() + self.pending)
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle_count,
            in_use: self.in_use,
            unhealthy: self.unhealthy,
            total: self.slots.len(),
            pending: self.pending,
            waiting: self.waiters.len(),
            created: self.totals.created,
            closed: self.totals.closed,
            acquired: self.totals.acquired,
            timeouts: self.totals.timeouts,
            probe_failures: self.totals.probe_failures,
        }
    }

    pub(crate) fn connections(&self) -> Vec<ConnectionInfo> {
        self.slots.values().map(|slot| slot.info.clone()).collect()
    }

    /// Verify that the counters add up to the tracked connections.
    pub(crate) fn check_invariant(&self) -> Result<(), PoolError> {
        let total = self.slots.len();
        let consistent = self.idle_count + self.in_use + self.unhealthy == total
            && self.idle.len() + self.probing == self.idle_count
            && total + self.pending <= self.max_size;

        #[cfg(debug_assertions)]
        let consistent = consistent && self.recount_matches();

        if consistent {
            Ok(())
        } else {
            Err(PoolError::InvariantViolation {
                idle: self.idle_count,
                in_use: self.in_use,
                unhealthy: self.unhealthy,
                total,
            })
        }
    }

    #[cfg(debug_assertions)]
    fn recount_matches(&self) -> bool {
        let (mut idle, mut in_use, mut unhealthy) = (0, 0, 0);
        for slot in self.slots.values() {
            match slot.info.state {
                ConnectionState::Idle => idle += 1,
                ConnectionState::InUse => in_use += 1,
                ConnectionState::Unhealthy => unhealthy += 1,
                ConnectionState::Closed => return false,
            }
        }
        (idle, in_use, unhealthy) == (self.idle_count, self.in_use, self.unhealthy)
    }

    pub(crate) fn take_graveyard(&mut self) -> Vec<C> {
        mem::take(&mut self.graveyard)
    }

    pub(crate) fn record_timeout(&mut self) {
        self.totals.timeouts += 1;
    }

    // --- capacity ---------------------------------------------------------

    /// Reserve room for one connection about to be opened.
    pub(crate) fn try_reserve(&mut self) -> bool {
        if self.closed || self.slots.len() + self.pending >= self.max_size {
            return false;
        }
        self.pending += 1;
        true
    }

    /// Give back a reservation whose connection was never opened.
    pub(crate) fn release_reservation(&mut self, now: Instant) {
        self.pending = self.pending.saturating_sub(1);
        self.dispatch(now);
    }

    /// Turn a reservation into a connection the caller already holds.
    ///
    /// `None` when the pool closed while the connection was being opened.
    pub(crate) fn commit_in_use(&mut self, now: Instant) -> Option<ConnectionId> {
        self.pending = self.pending.saturating_sub(1);
        if self.closed {
            return None;
        }
        let id = self.track(ConnectionState::InUse, None, now);
        self.totals.acquired += 1;
        Some(id)
    }

    /// Turn a reservation into an idle connection.
    ///
    /// Hands the connection back when the pool closed while it was being opened.
    pub(crate) fn commit_idle(&mut self, conn: C, now: Instant) -> Result<ConnectionId, C> {
        self.pending = self.pending.saturating_sub(1);
        if self.closed {
            return Err(conn);
        }
        let id = self.track(ConnectionState::Idle, Some(conn), now);
        self.idle.push_back(id);
        self.dispatch(now);
        Ok(id)
    }

    fn track(&mut self, state: ConnectionState, conn: Option<C>, now: Instant) -> ConnectionId {
        let id = ConnectionId(self.next_conn);
        self.next_conn += 1;
        self.totals.created += 1;

        let mut info = ConnectionInfo::new(id, state, now);
        if state == ConnectionState::InUse {
            info.use_count = 1;
        }
        self.slots.insert(id, Slot { info, conn });
        self.recount(ConnectionState::Closed, state);
        trace!(conn = %id, %state, "connection opened");
        id
    }

    // --- transitions ------------------------------------------------------

    fn counter(&mut self, state: ConnectionState) -> Option<&mut usize> {
        match state {
            ConnectionState::Idle => Some(&mut self.idle_count),
            ConnectionState::InUse => Some(&mut self.in_use),
            ConnectionState::Unhealthy => Some(&mut self.unhealthy),
            ConnectionState::Closed => None,
        }
    }

    fn recount(&mut self, from: ConnectionState, to: ConnectionState) {
        if let Some(count) = self.counter(from) {
            *count = count.saturating_sub(1);
        }
        if let Some(count) = self.counter(to) {
            *count += 1;
        }
    }

    fn move_to(&mut self, id: ConnectionId, to: ConnectionState) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        let from = slot.info.state;
        debug_assert!(from.can_become(to), "illegal transition {from} -> {to}");
        slot.info.state = to;
        self.recount(from, to);
        trace!(conn = %id, %from, %to, "connection state changed");
    }

    /// Stop tracking a connection, returning whatever it still held.
    fn retire_slot(&mut self, id: ConnectionId) -> Option<C> {
        let slot = self.slots.remove(&id)?;
        let from = slot.info.state;
        self.recount(from, ConnectionState::Closed);
        self.totals.closed += 1;
        trace!(conn = %id, %from, to = %ConnectionState::Closed, "connection state changed");
        slot.conn
    }

    // --- checkout / checkin -----------------------------------------------

    /// Pop the oldest-returned idle connection that has not outlived
    /// `max_lifetime`. Expired ones met on the way are retired.
    pub(crate) fn checkout_idle(&mut self, now: Instant) -> Option<(ConnectionId, C)> {
        while let Some(id) = self.idle.pop_front() {
            let expired = match self.slots.get(&id) {
                Some(slot) => slot.info.is_expired(self.max_lifetime, now),
                None => continue,
            };
            if expired {
                debug!(conn = %id, "idle connection outlived max_lifetime, retiring");
                if let Some(conn) = self.retire_slot(id) {
                    self.graveyard.push(conn);
                }
                continue;
            }

            let taken = self.slots.get_mut(&id).and_then(|slot| {
                let conn = slot.conn.take()?;
                slot.info.use_count += 1;
                slot.info.last_used_at = now;
                Some(conn)
            });
            if let Some(conn) = taken {
                self.move_to(id, ConnectionState::InUse);
                self.totals.acquired += 1;
                return Some((id, conn));
            }
        }
        None
    }

    /// Reverse a checkout whose connection never reached a caller.
    fn undo_checkout(&mut self, id: ConnectionId, conn: C) {
        let Some(slot) = self.slots.get_mut(&id) else {
            self.graveyard.push(conn);
            return;
        };
        slot.conn = Some(conn);
        slot.info.use_count = slot.info.use_count.saturating_sub(1);
        self.move_to(id, ConnectionState::Idle);
        self.idle.push_front(id);
        self.totals.acquired = self.totals.acquired.saturating_sub(1);
    }

    /// Return a healthy connection. Expired connections, and every connection
    /// once the pool is closed, are retired instead.
    pub(crate) fn checkin(&mut self, id: ConnectionId, conn: C, now: Instant) {
        let expired = self
            .slots
            .get(&id)
            .is_none_or(|slot| slot.info.is_expired(self.max_lifetime, now));

        if self.closed || expired {
            debug!(conn = %id, closed = self.closed, "retiring released connection");
            self.retire_slot(id);
            self.graveyard.push(conn);
        } else if let Some(slot) = self.slots.get_mut(&id) {
            slot.conn = Some(conn);
            slot.info.last_used_at = now;
            self.move_to(id, ConnectionState::Idle);
            self.idle.push_back(id);
        }
        self.dispatch(now);
    }

    /// `InUse -> Unhealthy`. The caller keeps the connection and closes it.
    pub(crate) fn mark_unhealthy(&mut self, id: ConnectionId) {
        self.move_to(id, ConnectionState::Unhealthy);
    }

    /// `Unhealthy -> Closed`, once the connection has been torn down.
    pub(crate) fn remove_unhealthy(&mut self, id: ConnectionId, now: Instant) {
        self.retire_slot(id);
        self.dispatch(now);
    }

    // --- waiters ----------------------------------------------------------

    pub(crate) fn register_waiter(&mut self) -> (u64, oneshot::Receiver<Handoff<C>>) {
        let (tx, rx) = oneshot::channel();
        let id = self.next_waiter;
        self.next_waiter += 1;
        self.waiters.push_back(Waiter { id, tx });
        (id, rx)
    }

    /// Withdraw a waiter and recover anything already handed to it.
    ///
    /// Handoffs happen under the same lock, so once the waiter is out of the
    /// queue nothing else can arrive on `rx`.
    pub(crate) fn reclaim_waiter(
        &mut self,
        id: u64,
        rx: &mut oneshot::Receiver<Handoff<C>>,
    ) -> Option<Handoff<C>> {
        self.waiters.retain(|waiter| waiter.id != id);
        rx.close();
        rx.try_recv().ok()
    }

    /// Put back a handoff its waiter will never use.
    pub(crate) fn abandon(&mut self, handoff: Handoff<C>, now: Instant) {
        match handoff {
            Handoff::Connection(id, conn) => {
                self.undo_checkout(id, conn);
                self.dispatch(now);
            }
            Handoff::Create => self.release_reservation(now),
        }
    }

    /// Serve queued waiters, oldest first, from idle connections and then
    /// from spare capacity.
    pub(crate) fn dispatch(&mut self, now: Instant) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.tx.is_closed() {
                continue;
            }
            if let Some((id, conn)) = self.checkout_idle(now) {
                if let Err(Handoff::Connection(id, conn)) =
                    waiter.tx.send(Handoff::Connection(id, conn))
                {
                    self.undo_checkout(id, conn);
                }
                continue;
            }
            if self.try_reserve() {
                if waiter.tx.send(Handoff::Create).is_err() {
                    self.pending -= 1;
                }
                continue;
            }
            self.waiters.push_front(waiter);
            break;
        }
    }

    // --- maintenance ------------------------------------------------------

    /// Start a health cycle: retire expired connections and those idle past
    /// `max_idle_time` (never dropping below `min_size`), then take every
    /// remaining idle connection out for probing. Probed connections stay
    /// `Idle` but cannot be checked out until [`end_probe`](Self::end_probe).
    pub(crate) fn begin_health_cycle(
        &mut self,
        min_size: usize,
        max_idle_time: Duration,
        now: Instant,
    ) -> Vec<(ConnectionId, C)> {
        let mut total = self.slots.len();
        let mut probes = Vec::new();
        let candidates: Vec<ConnectionId> = self.idle.drain(..).collect();

        for id in candidates {
            let Some(slot) = self.slots.get_mut(&id) else {
                continue;
            };
            let expired = slot.info.is_expired(self.max_lifetime, now);
            let stale = slot.info.idle_for(now) >= max_idle_time;

            if expired || (stale && total > min_size) {
                debug!(conn = %id, expired, stale, "evicting idle connection");
                if let Some(conn) = self.retire_slot(id) {
                    self.graveyard.push(conn);
                }
                total -= 1;
            } else if let Some(conn) = slot.conn.take() {
                self.probing += 1;
                probes.push((id, conn));
            }
        }
        probes
    }

    /// Finish probing one connection.
    ///
    /// Returns the connection when it failed and is now `Unhealthy`; the
    /// caller closes it and then calls [`remove_unhealthy`](Self::remove_unhealthy).
    pub(crate) fn end_probe(
        &mut self,
        id: ConnectionId,
        conn: C,
        healthy: bool,
        now: Instant,
    ) -> Option<C> {
        self.probing = self.probing.saturating_sub(1);

        if self.closed {
            self.retire_slot(id);
            self.graveyard.push(conn);
            return None;
        }
        if !healthy {
            self.totals.probe_failures += 1;
            self.move_to(id, ConnectionState::Unhealthy);
            return Some(conn);
        }

        match self.slots.get_mut(&id) {
            Some(slot) => {
                slot.conn = Some(conn);
                slot.info.last_health_check_at = Some(now);
                self.idle.push_back(id);
                self.dispatch(now);
            }
            None => self.graveyard.push(conn),
        }
        None
    }

    /// Close the pool: fail every waiter and retire idle connections.
    /// Connections out with callers or probes are retired when they return.
    pub(crate) fn close(&mut self) {
        self.closed = true;
        self.waiters.clear();
        let idle: Vec<ConnectionId> = self.idle.drain(..).collect();
        for id in idle {
            if let Some(conn) = self.retire_slot(id) {
                self.graveyard.push(conn);
            }
        }
    }
}
