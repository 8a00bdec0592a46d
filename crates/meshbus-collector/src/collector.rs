//! Response aggregation state machine.
//!
//! A [`Collector`] turns three independently arriving signals into one
//! terminating decision:
//!
//! 1. **Payload envelopes** - real replies, appended to `payload_messages`.
//! 2. **Ack envelopes** - payload-less replies whose ack block lets a
//!    responder raise the deadline or announce more replies.
//! 3. **Timers** - the master deadline and the optional ack-grace window.
//!
//! The collector does no I/O and reads no clock: callers pass `now` and
//! drive timers themselves (see [`crate::driver`]). Every extension is a
//! ratchet (timeouts only grow, quotas only grow or are reset to zero) so
//! a collection always reaches a finite deadline.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use meshbus_protocol::{Ack, Envelope};

use crate::config::CollectorConfig;
use crate::TransportError;

/// Predicate deciding whether an envelope on the response topic belongs to
/// this collection.
pub type AcceptFn = dyn Fn(&Envelope) -> bool + Send + Sync;

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Number of responses still expected.
///
/// `Count` sorts below `Unbounded`, so `max` picks the larger target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Remaining {
    Count(u64),
    Unbounded,
}

impl Remaining {
    pub fn from_target(target: Option<u64>) -> Self {
        target.map_or(Remaining::Unbounded, Remaining::Count)
    }

    pub fn is_positive(&self) -> bool {
        *self > Remaining::Count(0)
    }

    /// Add `delta`, flooring at zero. Unbounded absorbs everything.
    fn offset(self, delta: i64) -> Self {
        match self {
            Remaining::Unbounded => Remaining::Unbounded,
            Remaining::Count(n) => Remaining::Count(n.saturating_add_signed(delta)),
        }
    }
}

/// A responder's change to the number of replies it still owes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaAdjustment {
    /// More replies are coming.
    Increase(u64),
    /// The responder is done, whatever it said before.
    Reset,
    /// Replies were delivered.
    Decrease(u64),
}

impl QuotaAdjustment {
    /// Map the signed wire hint (`responsesRemaining`) to an adjustment.
    pub fn from_hint(hint: i64) -> Self {
        match hint {
            0 => QuotaAdjustment::Reset,
            n if n > 0 => QuotaAdjustment::Increase(n.unsigned_abs()),
            n => QuotaAdjustment::Decrease(n.unsigned_abs()),
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Final aggregate of a collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collected {
    pub payload_messages: Vec<Envelope>,
    pub ack_messages: Vec<Envelope>,
}

impl Collected {
    /// Payload bodies in arrival order.
    pub fn payloads(&self) -> impl Iterator<Item = &serde_json::Value> {
        self.payload_messages.iter().filter_map(|m| m.payload.as_ref())
    }
}

/// Notification raised towards whoever observes a collection.
#[derive(Debug)]
pub enum CollectorEvent {
    /// An accepted reply carrying a payload.
    Payload(Envelope),
    /// An accepted reply without a payload.
    Ack(Envelope),
    /// The collection concluded.
    End(Collected),
    /// Publishing the request failed; nothing will follow.
    Error(TransportError),
}

/// Lifecycle of a collector. `Ended` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorPhase {
    Created,
    Collecting,
    Ended,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckTimer {
    Idle,
    Pending(Instant),
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

/// State of one in-flight scatter-gather collection.
///
/// Lifecycle:
/// 1. `new()` - configure targets and timeouts
/// 2. `begin_listening()` - arm the bootstrap ack window
/// 3. `on_response_message()` / `on_ack_timeout()` - feed arrivals and timers
/// 4. `end()` or `cancel()` - terminal, idempotent, mutually exclusive
///
/// Notifications accumulate in an outbox drained with `drain_events()`.
#[derive(Debug)]
pub struct Collector {
    started_at: Instant,
    phase: CollectorPhase,
    /// Global target, decremented by every accepted envelope.
    base_remaining: Remaining,
    /// Replies still owed per responder. Absent means untracked, not zero.
    remaining_by_id: HashMap<String, u64>,
    base_timeout: Duration,
    /// Deadline hints per responder, relative to `started_at`. Never shrink.
    timeout_by_id: HashMap<String, Duration>,
    /// Deadline currently scheduled, relative to `started_at`.
    current_timeout: Duration,
    wait_for_acks: Option<Duration>,
    wait_for_acks_until: Option<Instant>,
    ack_timer: AckTimer,
    payload_messages: Vec<Envelope>,
    ack_messages: Vec<Envelope>,
    outbox: Vec<CollectorEvent>,
}

impl Collector {
    /// Create a collector whose clock starts at `started_at`.
    pub fn new(config: &CollectorConfig, started_at: Instant) -> Self {
        let base_timeout = config.response_timeout();
        Self {
            started_at,
            phase: CollectorPhase::Created,
            base_remaining: Remaining::from_target(config.wait_for_responses),
            remaining_by_id: HashMap::new(),
            base_timeout,
            timeout_by_id: HashMap::new(),
            current_timeout: base_timeout,
            wait_for_acks: config.ack_timeout(),
            wait_for_acks_until: None,
            ack_timer: AckTimer::Idle,
            payload_messages: Vec::new(),
            ack_messages: Vec::new(),
            outbox: Vec::new(),
        }
    }

    /// Mark the collector as attached to its response topic.
    ///
    /// With an ack window configured, the window opens immediately so that
    /// it is valid before the first ack arrives.
    pub fn begin_listening(&mut self, now: Instant) {
        if self.phase != CollectorPhase::Created {
            return;
        }
        self.phase = CollectorPhase::Collecting;
        if let Some(window) = self.wait_for_acks {
            self.wait_for_acks_until = Some(now + window);
        }
    }

    // -- queries ------------------------------------------------------------

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn phase(&self) -> CollectorPhase {
        self.phase
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.phase, CollectorPhase::Ended | CollectorPhase::Cancelled)
    }

    pub fn is_cancelled(&self) -> bool {
        self.phase == CollectorPhase::Cancelled
    }

    pub fn payload_messages(&self) -> &[Envelope] {
        &self.payload_messages
    }

    pub fn ack_messages(&self) -> &[Envelope] {
        &self.ack_messages
    }

    /// Replies still owed by `responder_id`, if it ever declared any.
    pub fn responses_remaining_for(&self, responder_id: &str) -> Option<u64> {
        self.remaining_by_id.get(responder_id).copied()
    }

    pub fn wait_for_acks_until(&self) -> Option<Instant> {
        self.wait_for_acks_until
    }

    /// Effective target: the global count, raised by what responders owe.
    pub fn responses_remaining(&self) -> Remaining {
        let owed: u64 = self.remaining_by_id.values().sum();
        self.base_remaining.max(Remaining::Count(owed))
    }

    pub fn is_awaiting_responses(&self) -> bool {
        self.responses_remaining().is_positive()
    }

    /// `None` when no ack window is open, else whether `now` is inside it.
    pub fn is_awaiting_acks(&self, now: Instant) -> Option<bool> {
        self.wait_for_acks_until.map(|until| now < until)
    }

    /// Largest deadline among the base timeout and every responder that has
    /// not declared itself done.
    pub fn max_timeout(&self) -> Duration {
        self.timeout_by_id
            .iter()
            .filter(|(id, _)| self.remaining_by_id.get(id.as_str()) != Some(&0))
            .map(|(_, timeout)| *timeout)
            .fold(self.base_timeout, Duration::max)
    }

    /// Deadline currently scheduled, relative to the start.
    pub fn current_timeout(&self) -> Duration {
        self.current_timeout
    }

    /// Absolute instant at which the collection ends if nothing else does.
    pub fn deadline(&self) -> Instant {
        self.started_at + self.current_timeout
    }

    /// Absolute instant at which the pending ack-grace timer fires.
    pub fn ack_timer_deadline(&self) -> Option<Instant> {
        match self.ack_timer {
            AckTimer::Pending(at) => Some(at),
            AckTimer::Idle => None,
        }
    }

    // -- counters -------------------------------------------------------------

    /// Adjust the global target by `delta`, flooring at zero.
    pub fn inc_responses_remaining(&mut self, delta: i64) -> Remaining {
        self.base_remaining = self.base_remaining.offset(delta);
        self.base_remaining
    }

    /// Apply a responder's quota change.
    ///
    /// Returns the new quota, or `None` when a decrease had nothing to take.
    pub fn adjust_responses_remaining(
        &mut self,
        responder_id: &str,
        adjustment: QuotaAdjustment,
    ) -> Option<u64> {
        match adjustment {
            QuotaAdjustment::Increase(n) => {
                let entry = self.remaining_by_id.entry(responder_id.to_string()).or_insert(0);
                *entry = entry.saturating_add(n);
                Some(*entry)
            }
            QuotaAdjustment::Reset => {
                self.remaining_by_id.insert(responder_id.to_string(), 0);
                Some(0)
            }
            QuotaAdjustment::Decrease(n) => {
                let prev = self.remaining_by_id.get(responder_id).copied().unwrap_or(0);
                let next = prev.saturating_sub(n);
                if next == prev {
                    return None;
                }
                self.remaining_by_id.insert(responder_id.to_string(), next);
                Some(next)
            }
        }
    }

    /// Raise `responder_id`'s deadline hint. Returns the new value only if it grew.
    pub fn set_timeout_for_responder(&mut self, responder_id: &str, timeout: Duration) -> Option<Duration> {
        let entry = self
            .timeout_by_id
            .entry(responder_id.to_string())
            .or_insert(Duration::ZERO);
        if timeout <= *entry {
            return None;
        }
        *entry = timeout;
        Some(timeout)
    }

    /// Fold an ack block into the deadline and quota bookkeeping.
    ///
    /// Returns `true` when the scheduled deadline moved later.
    pub fn process_ack(&mut self, ack: Option<&Ack>) -> bool {
        let Some(ack) = ack else {
            return false;
        };

        let mut extended = false;
        if let Some(ms) = ack.timeout_ms {
            self.set_timeout_for_responder(&ack.responder_id, Duration::from_millis(ms));
            let max = self.max_timeout();
            if max > self.current_timeout {
                tracing::debug!(
                    responder_id = %ack.responder_id,
                    from_ms = self.current_timeout.as_millis() as u64,
                    to_ms = max.as_millis() as u64,
                    "Collector deadline extended"
                );
                self.current_timeout = max;
                extended = true;
            }
        }

        if let Some(hint) = ack.responses_remaining {
            self.adjust_responses_remaining(&ack.responder_id, QuotaAdjustment::from_hint(hint));
        }

        extended
    }

    // -- arrivals and timers --------------------------------------------------

    /// Handle an envelope delivered on the response topic.
    pub fn on_response_message(&mut self, accept: Option<&AcceptFn>, envelope: Envelope, now: Instant) {
        if self.is_terminated() {
            return;
        }
        if let Some(accept) = accept {
            if !accept(&envelope) {
                tracing::trace!(id = %envelope.id, "Ignoring unaccepted envelope");
                return;
            }
        }

        let ack = envelope.ack.clone();
        if envelope.is_ack_only() {
            if let Some(window) = self.wait_for_acks {
                let reopened = now + window;
                if self.wait_for_acks_until.map_or(true, |until| reopened > until) {
                    self.wait_for_acks_until = Some(reopened);
                }
            }
            self.ack_messages.push(envelope.clone());
            self.outbox.push(CollectorEvent::Ack(envelope));
        } else {
            self.payload_messages.push(envelope.clone());
            self.outbox.push(CollectorEvent::Payload(envelope));
        }

        self.inc_responses_remaining(-1);
        self.process_ack(ack.as_ref());

        if self.is_awaiting_acks(now) == Some(true) {
            self.enable_ack_timeout();
        } else if !self.is_awaiting_responses() {
            self.end();
        }
    }

    /// Arm the ack-grace timer for the end of the current window.
    ///
    /// No-op while a timer is already pending.
    fn enable_ack_timeout(&mut self) {
        if let (AckTimer::Idle, Some(until)) = (self.ack_timer, self.wait_for_acks_until) {
            self.ack_timer = AckTimer::Pending(until);
        }
    }

    /// Handle the ack-grace timer firing.
    pub fn on_ack_timeout(&mut self, now: Instant) {
        self.ack_timer = AckTimer::Idle;
        if self.is_terminated() || self.is_awaiting_responses() {
            return;
        }
        if self.is_awaiting_acks(now) == Some(true) {
            // a later ack reopened the window
            self.enable_ack_timeout();
            return;
        }
        self.end();
    }

    /// Handle the master deadline firing.
    pub fn on_deadline(&mut self, now: Instant) {
        if now >= self.deadline() {
            self.end();
        }
    }

    // -- terminal transitions -------------------------------------------------

    /// Conclude the collection and queue the final aggregate.
    ///
    /// Returns `false` if the collector had already terminated.
    pub fn end(&mut self) -> bool {
        if self.is_terminated() {
            return false;
        }
        self.phase = CollectorPhase::Ended;
        self.ack_timer = AckTimer::Idle;
        self.outbox.push(CollectorEvent::End(Collected {
            payload_messages: self.payload_messages.clone(),
            ack_messages: self.ack_messages.clone(),
        }));
        true
    }

    /// Abandon the collection. Later arrivals and timers become no-ops.
    pub fn cancel(&mut self) -> bool {
        if self.is_terminated() {
            return false;
        }
        self.phase = CollectorPhase::Cancelled;
        self.ack_timer = AckTimer::Idle;
        true
    }

    /// Take the notifications queued since the last call.
    pub fn drain_events(&mut self) -> Vec<CollectorEvent> {
        std::mem::take(&mut self.outbox)
    }
}
