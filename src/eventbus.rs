//! Process-wide ordered event log with filtered subscription and gap-free
//! `since=` replay (§4.4).
//!
//! Follows the general pub/sub shape of `src/notifications/integration.rs`'s
//! dispatch loop, adapted into a ring buffer with monotonic ids. A plain
//! `Vec<Subscription>` guarded by a mutex is used instead of
//! `tokio::sync::broadcast`, since broadcast channels can't express
//! per-subscriber `{project?, agentId?, types?}` AND-filters without a
//! wrapper layer, and `rest/server.rs`'s `RestApiServer` already favors
//! explicit `Arc<Mutex<...>>` state over channel abstractions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::ids::{AgentId, EventId, ProjectName};
use crate::model::NormalizedEvent;

/// AND-filter over populated fields; `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub project: Option<ProjectName>,
    pub agent_id: Option<AgentId>,
    pub types: Option<Vec<String>>,
}

impl EventFilter {
    pub fn matches(&self, event: &NormalizedEvent) -> bool {
        if let Some(ref project) = self.project {
            if &event.project != project {
                return false;
            }
        }
        if let Some(ref agent_id) = self.agent_id {
            if &event.agent_id != agent_id {
                return false;
            }
        }
        if let Some(ref types) = self.types {
            if !types.iter().any(|t| t == event.type_name()) {
                return false;
            }
        }
        true
    }
}

pub type SubscriptionId = u64;

struct Subscription {
    id: SubscriptionId,
    filter: EventFilter,
    callback: Box<dyn Fn(&NormalizedEvent) + Send + Sync>,
}

struct Inner {
    ring: VecDeque<NormalizedEvent>,
    capacity: usize,
    subscriptions: Vec<Subscription>,
    next_sub_id: SubscriptionId,
}

/// Ring buffer of size `maxEventHistory`, monotonic `evt-<N>` ids.
pub struct EventBus {
    next_event_id: AtomicU64,
    inner: Mutex<Inner>,
}

impl EventBus {
    pub fn new(max_event_history: usize) -> Self {
        Self {
            next_event_id: AtomicU64::new(1),
            inner: Mutex::new(Inner {
                ring: VecDeque::with_capacity(max_event_history),
                capacity: max_event_history.max(1),
                subscriptions: Vec::new(),
                next_sub_id: 1,
            }),
        }
    }

    pub fn next_id(&self) -> EventId {
        EventId(self.next_event_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Append the event; drop the oldest if over capacity; synchronously
    /// invoke every subscriber whose filter matches, in subscription order.
    /// Panics inside a callback are not caught here — callers should keep
    /// callbacks infallible (SSE send errors are handled at the send site).
    pub fn emit(&self, event: NormalizedEvent) {
        let mut inner = self.inner.lock().unwrap();
        if inner.ring.len() >= inner.capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(event.clone());
        for sub in &inner.subscriptions {
            if sub.filter.matches(&event) {
                (sub.callback)(&event);
            }
        }
    }

    pub fn subscribe(
        &self,
        filter: EventFilter,
        callback: impl Fn(&NormalizedEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_sub_id;
        inner.next_sub_id += 1;
        inner.subscriptions.push(Subscription { id, filter, callback: Box::new(callback) });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscriptions.retain(|s| s.id != id);
    }

    /// Events strictly newer than `event_id` that are still in the ring and
    /// satisfy `filter`, in emit order. If `event_id` was already evicted,
    /// returns whatever remains — resumption is best-effort, not durable.
    pub fn since(&self, event_id: EventId, filter: &EventFilter) -> Vec<NormalizedEvent> {
        let inner = self.inner.lock().unwrap();
        inner
            .ring
            .iter()
            .filter(|e| e.id.0 > event_id.0 && filter.matches(e))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ProjectName;
    use crate::model::EventPayload;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn make_event(bus: &EventBus, project: &str, agent: &str, payload: EventPayload) -> NormalizedEvent {
        NormalizedEvent {
            id: bus.next_id(),
            ts: chrono::Utc::now(),
            project: ProjectName::parse(project).unwrap(),
            agent_id: AgentId::parse(agent).unwrap(),
            payload,
        }
    }

    #[test]
    fn emit_notifies_matching_subscribers_in_order() {
        let bus = EventBus::new(100);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        bus.subscribe(EventFilter::default(), move |e| {
            seen_clone.lock().unwrap().push(e.id.0);
        });
        let e1 = make_event(&bus, "p1", "codex-a", EventPayload::Output { text: "hi".into() });
        bus.emit(e1);
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn filter_by_agent_id_excludes_others() {
        let bus = EventBus::new(100);
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        bus.subscribe(
            EventFilter { agent_id: Some(AgentId::parse("codex-a").unwrap()), ..Default::default() },
            move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            },
        );
        bus.emit(make_event(&bus, "p1", "codex-a", EventPayload::Output { text: "x".into() }));
        bus.emit(make_event(&bus, "p1", "codex-b", EventPayload::Output { text: "y".into() }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn since_returns_strictly_newer_matching_events() {
        let bus = EventBus::new(100);
        let e1 = make_event(&bus, "p1", "codex-a", EventPayload::Output { text: "a".into() });
        let id1 = e1.id;
        bus.emit(e1);
        bus.emit(make_event(&bus, "p1", "codex-a", EventPayload::Output { text: "b".into() }));
        let results = bus.since(id1, &EventFilter::default());
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn ring_drops_oldest_over_capacity() {
        let bus = EventBus::new(2);
        bus.emit(make_event(&bus, "p1", "codex-a", EventPayload::Output { text: "1".into() }));
        bus.emit(make_event(&bus, "p1", "codex-a", EventPayload::Output { text: "2".into() }));
        bus.emit(make_event(&bus, "p1", "codex-a", EventPayload::Output { text: "3".into() }));
        assert_eq!(bus.len(), 2);
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let bus = EventBus::new(100);
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let sub_id = bus.subscribe(EventFilter::default(), move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        bus.unsubscribe(sub_id);
        bus.emit(make_event(&bus, "p1", "codex-a", EventPayload::Output { text: "x".into() }));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
