//! SSE bridge from the EventBus's subscribe/since contract to axum's
//! `Sse` response type (§6.1, §4.4).
//!
//! No direct precedent elsewhere in this codebase — there are no other
//! streaming endpoints — but expressible with crates already in the
//! dependency stack: `tokio_stream`'s
//! `ReceiverStream`/`IntervalStream` plus `futures_util::StreamExt::merge`
//! to interleave the 15s heartbeat with live events, axum's
//! `response::sse::Sse`. `EventStream` is a thin manual `Stream` wrapper
//! (all fields `Unpin`, so projection needs no `unsafe`) whose `Drop` calls
//! `EventBus::unsubscribe` — without it, a client disconnecting from an SSE
//! stream would leave its subscription registered forever.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{IntervalStream, ReceiverStream};

use crate::eventbus::{EventBus, EventFilter, SubscriptionId};
use crate::ids::EventId;
use crate::model::NormalizedEvent;

const CHANNEL_CAPACITY: usize = 256;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

fn to_sse_event(event: &NormalizedEvent) -> Event {
    Event::default()
        .id(event.id.to_string())
        .event(event.type_name())
        .json_data(event)
        .unwrap_or_else(|_| Event::default().event("error").data("serialization failed"))
}

/// Unsubscribes from the EventBus when the stream (and thus the SSE
/// connection) is dropped.
struct EventStream {
    inner: ReceiverStream<Event>,
    bus: Arc<EventBus>,
    sub_id: SubscriptionId,
}

impl Stream for EventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_next(cx).map(|opt| opt.map(Ok))
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.sub_id);
    }
}

/// Builds an SSE response for `filter`, optionally replaying events strictly
/// newer than `since` before switching to live delivery, plus a 15s
/// `event: heartbeat` frame. Subscribing before computing the replay backlog
/// means a handful of events may be delivered twice across that race window
/// (clients dedupe on `id`) rather than ever silently dropped — matching
/// §4.4's "best-effort, not a durable log" resumption contract.
pub fn stream_events(
    event_bus: Arc<EventBus>,
    filter: EventFilter,
    since: Option<EventId>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<Event>(CHANNEL_CAPACITY);

    let sub_filter = filter.clone();
    let sub_tx = tx.clone();
    let sub_id = event_bus.subscribe(sub_filter, move |event| {
        let _ = sub_tx.try_send(to_sse_event(event));
    });

    if let Some(since) = since {
        for event in event_bus.since(since, &filter) {
            let _ = tx.try_send(to_sse_event(&event));
        }
    }
    drop(tx);

    let event_stream = EventStream { inner: ReceiverStream::new(rx), bus: event_bus, sub_id };

    let heartbeat = IntervalStream::new(tokio::time::interval(HEARTBEAT_INTERVAL))
        .map(|_| Ok(Event::default().event("heartbeat").data("")));

    let merged = event_stream.merge(heartbeat);

    Sse::new(merged).keep_alive(KeepAlive::new().interval(Duration::from_secs(30)))
}
