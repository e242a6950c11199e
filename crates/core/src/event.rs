//! Domain event system — decoupled observation of loop progress.
//!
//! Events are published as the loop moves through its phases. Reporting
//! layers can subscribe to react without tight coupling; publishing with
//! no subscribers is a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use crate::run::Phase;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// The loop moved to a new phase of an iteration.
    PhaseChanged {
        run_id: String,
        iteration: u32,
        phase: Phase,
        timestamp: DateTime<Utc>,
    },

    /// A search round completed.
    SearchCompleted {
        run_id: String,
        iteration: u32,
        start: u32,
        new_results: usize,
        duplicates_dropped: usize,
        timestamp: DateTime<Utc>,
    },

    /// One URL finished fetching (possibly with a contained failure).
    SourceFetched {
        run_id: String,
        url: String,
        ok: bool,
        timestamp: DateTime<Utc>,
    },

    /// One URL finished summarizing (possibly with a contained failure).
    SummaryReady {
        run_id: String,
        url: String,
        ok: bool,
        timestamp: DateTime<Utc>,
    },

    /// The observe phase finalized an observation.
    ObservationSynthesized {
        run_id: String,
        iteration: u32,
        quality: String,
        sources: usize,
        artifacts: usize,
        claims: usize,
        timestamp: DateTime<Utc>,
    },

    /// The reflect phase recorded its judgment.
    ReflectionRecorded {
        run_id: String,
        iteration: u32,
        goal_satisfied: bool,
        fallback: bool,
        timestamp: DateTime<Utc>,
    },

    /// A generation finished and reported usage.
    GenerationUsage {
        run_id: String,
        model: String,
        tokens_used: u32,
        timestamp: DateTime<Utc>,
    },

    /// Persistence produced no durable record for an authoritative value.
    PersistDegraded {
        run_id: String,
        context: String,
        timestamp: DateTime<Utc>,
    },

    /// The Run reached a terminal status.
    RunFinished {
        run_id: String,
        status: String,
        iterations: u32,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub. Components can
/// subscribe to receive all events and filter for what they care about.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // Ignore send errors (no subscribers = that's fine)
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
