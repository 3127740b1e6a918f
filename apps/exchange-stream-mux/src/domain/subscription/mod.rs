//! Subscriber Bookkeeping
//!
//! Pure data structures behind the stream manager: the per-symbol
//! subscriber registry, the latest-value cache, and the pause/buffer
//! ledger used during symbol switches.
//!
//! # Design
//!
//! None of these types lock; every mutation happens under the stream
//! manager's single mutual-exclusion domain. Keeping them lock-free makes
//! the ordering and atomicity guarantees easy to reason about: whatever
//! sequence of operations the manager performs under its guard is the
//! sequence every observer sees.
//!
//! The registry is generic over the sink type so the domain layer does not
//! depend on the application-layer port trait.

use std::collections::HashMap;
use std::fmt;

use crate::domain::envelope::{StreamEnvelope, StreamKind};

// =============================================================================
// Subscription Handles
// =============================================================================

/// Opaque handle identifying one subscriber registration.
///
/// Returned by `StreamManager::subscribe`; callers pass it back to
/// `unsubscribe` and `switch_symbol`. Handles are never reused within a
/// manager instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// One registered subscriber: its handle, requested kinds, and sink.
#[derive(Debug, Clone)]
pub struct SubscriberEntry<S> {
    /// Handle returned to the caller.
    pub id: SubscriptionId,
    /// Stream kinds the subscriber asked for; carried along on a symbol
    /// switch so the new symbol is opened with the same kinds.
    pub kinds: Vec<StreamKind>,
    /// Delivery target.
    pub sink: S,
}

// =============================================================================
// Subscriber Registry
// =============================================================================

/// Per-symbol ordered subscriber lists.
///
/// Entries are kept in registration order so fan-out is deterministic.
/// Symbol keys are canonical uppercase symbols.
#[derive(Debug)]
pub struct SubscriberRegistry<S> {
    entries: HashMap<String, Vec<SubscriberEntry<S>>>,
    next_id: u64,
}

impl<S> Default for SubscriberRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> SubscriberRegistry<S> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 0,
        }
    }

    /// Register a sink under a symbol, returning its fresh handle.
    pub fn add(&mut self, symbol: &str, kinds: &[StreamKind], sink: S) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.entries
            .entry(symbol.to_string())
            .or_default()
            .push(SubscriberEntry {
                id,
                kinds: kinds.to_vec(),
                sink,
            });
        id
    }

    /// Remove a registration. Idempotent: removing an absent handle is a
    /// no-op and returns `false`.
    pub fn remove(&mut self, symbol: &str, id: SubscriptionId) -> bool {
        let Some(list) = self.entries.get_mut(symbol) else {
            return false;
        };
        let before = list.len();
        list.retain(|entry| entry.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.entries.remove(symbol);
        }
        removed
    }

    /// Relocate a registration from one symbol to another, preserving its
    /// handle, kinds, and sink. Returns the moved entry's kinds, or `None`
    /// if the handle is not registered under `old`.
    pub fn relocate(
        &mut self,
        old: &str,
        new: &str,
        id: SubscriptionId,
    ) -> Option<Vec<StreamKind>> {
        let list = self.entries.get_mut(old)?;
        let pos = list.iter().position(|entry| entry.id == id)?;
        let entry = list.remove(pos);
        if list.is_empty() {
            self.entries.remove(old);
        }
        let kinds = entry.kinds.clone();
        self.entries.entry(new.to_string()).or_default().push(entry);
        Some(kinds)
    }

    /// Subscribers of a symbol, in registration order.
    #[must_use]
    pub fn subscribers(&self, symbol: &str) -> &[SubscriberEntry<S>] {
        self.entries.get(symbol).map_or(&[], Vec::as_slice)
    }

    /// Whether the handle is currently registered under the symbol.
    #[must_use]
    pub fn contains(&self, symbol: &str, id: SubscriptionId) -> bool {
        self.subscribers(symbol).iter().any(|entry| entry.id == id)
    }

    /// Number of subscribers on a symbol.
    #[must_use]
    pub fn subscriber_count(&self, symbol: &str) -> usize {
        self.subscribers(symbol).len()
    }

    /// Number of symbols with at least one subscriber.
    #[must_use]
    pub fn symbol_count(&self) -> usize {
        self.entries.len()
    }

    /// Total registrations across all symbols.
    #[must_use]
    pub fn total_subscriptions(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

// =============================================================================
// Latest-Value Cache
// =============================================================================

/// Most recent Ticker envelope per symbol.
///
/// Overwritten unconditionally on every Ticker envelope; never cleared on
/// disconnect or unsubscribe. Staleness is the caller's concern,
/// observable via the envelope timestamp.
#[derive(Debug, Default)]
pub struct LatestCache {
    entries: HashMap<String, StreamEnvelope>,
}

impl LatestCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the envelope if it is a Ticker; other kinds are ignored.
    pub fn update(&mut self, envelope: &StreamEnvelope) {
        if envelope.kind == StreamKind::Ticker {
            self.entries
                .insert(envelope.symbol.clone(), envelope.clone());
        }
    }

    /// Cached envelope for a symbol, if any Ticker has been seen.
    #[must_use]
    pub fn get(&self, symbol: &str) -> Option<&StreamEnvelope> {
        self.entries.get(symbol)
    }

    /// Number of cached symbols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Pause/Buffer Ledger
// =============================================================================

/// Per-symbol pause state with an ordered envelope buffer.
///
/// A symbol is paused while present in the ledger. Pausing an already
/// paused symbol keeps the existing buffer; resuming removes the entry
/// and hands back everything buffered, in arrival order.
#[derive(Debug, Default)]
pub struct PauseLedger {
    buffers: HashMap<String, Vec<StreamEnvelope>>,
}

impl PauseLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a symbol paused. Idempotent.
    pub fn pause(&mut self, symbol: &str) {
        self.buffers.entry(symbol.to_string()).or_default();
    }

    /// Whether the symbol is currently paused.
    #[must_use]
    pub fn is_paused(&self, symbol: &str) -> bool {
        self.buffers.contains_key(symbol)
    }

    /// Append the envelope to the symbol's buffer if paused.
    ///
    /// Returns `true` when buffered (delivery must be withheld), `false`
    /// when the symbol is not paused.
    pub fn buffer_if_paused(&mut self, envelope: &StreamEnvelope) -> bool {
        match self.buffers.get_mut(&envelope.symbol) {
            Some(buffer) => {
                buffer.push(envelope.clone());
                true
            }
            None => false,
        }
    }

    /// Unmark the symbol and drain its buffer in arrival order.
    ///
    /// Resuming a symbol that is not paused yields an empty buffer.
    pub fn resume(&mut self, symbol: &str) -> Vec<StreamEnvelope> {
        self.buffers.remove(symbol).unwrap_or_default()
    }

    /// Number of currently paused symbols.
    #[must_use]
    pub fn paused_count(&self) -> usize {
        self.buffers.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
