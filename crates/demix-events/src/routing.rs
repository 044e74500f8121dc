//! In-process event bus with a bounded replay journal.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::Sender;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};

use crate::payloads::{DEFAULT_REPLAY_CAPACITY, Event, EventEnvelope, EventId};

/// Stream handed to subscribers: replayed backlog first, then live events.
///
/// A lagging subscriber sees a [`BroadcastStreamRecvError`] item and keeps
/// receiving from the oldest event still buffered.
pub type EventStream =
    Pin<Box<dyn Stream<Item = Result<EventEnvelope, BroadcastStreamRecvError>> + Send>>;

/// Shared event bus built on top of `tokio::broadcast`.
///
/// Ids are assigned, journaled and broadcast under one lock, so the journal and
/// every subscriber see events in id order.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    journal: Arc<Mutex<Journal>>,
}

/// Recent envelopes kept for replay and per-job history.
struct Journal {
    next_id: EventId,
    recent: VecDeque<EventEnvelope>,
    capacity: usize,
}

impl Journal {
    fn since(&self, id: EventId) -> Vec<EventEnvelope> {
        self.recent.iter().filter(|env| env.id > id).cloned().collect()
    }
}

impl EventBus {
    /// Construct a bus with a custom replay capacity (clamped to at least one).
    #[must_use]
    pub fn with_capacity(replay_capacity: usize) -> Self {
        let capacity = replay_capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            journal: Arc::new(Mutex::new(Journal {
                next_id: 1,
                recent: VecDeque::with_capacity(capacity),
                capacity,
            })),
        }
    }

    /// Construct a bus with the default replay capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Subscribe to the bus, replaying journaled events newer than `last_event_id`.
    ///
    /// The backlog and the live receiver are cut under the journal lock, so every
    /// event is delivered exactly once.
    #[must_use]
    pub fn subscribe(&self, last_event_id: Option<EventId>) -> EventStream {
        let journal = self.lock_journal();
        let receiver = self.sender.subscribe();
        let backlog = last_event_id.map_or_else(Vec::new, |last| journal.since(last));
        drop(journal);
        let live = BroadcastStream::new(receiver);
        Box::pin(tokio_stream::iter(backlog.into_iter().map(Ok)).chain(live))
    }

    /// Publish an event and return its assigned identifier.
    ///
    /// Having no subscribers is not an error; the event is still journaled.
    pub fn publish(&self, event: Event) -> EventId {
        let mut journal = self.lock_journal();
        let id = journal.next_id;
        journal.next_id = id.saturating_add(1);
        let envelope = EventEnvelope {
            id,
            timestamp: Utc::now(),
            event,
        };
        if journal.recent.len() == journal.capacity {
            let _ = journal.recent.pop_front();
        }
        journal.recent.push_back(envelope.clone());
        let _ = self.sender.send(envelope);
        id
    }

    /// Id of the newest journaled event.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        self.lock_journal().recent.back().map(|env| env.id)
    }

    /// Journaled events newer than `id`, oldest first.
    #[must_use]
    pub fn backlog_since(&self, id: EventId) -> Vec<EventEnvelope> {
        self.lock_journal().since(id)
    }

    /// Events recorded for one job, oldest first.
    #[must_use]
    pub fn history_for(&self, job_id: &str) -> Vec<EventEnvelope> {
        self.lock_journal()
            .recent
            .iter()
            .filter(|env| env.event.job_id() == Some(job_id))
            .cloned()
            .collect()
    }

    fn lock_journal(&self) -> MutexGuard<'_, Journal> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    fn running(job_id: &str) -> Event {
        Event::JobRunning {
            job_id: job_id.into(),
        }
    }

    #[tokio::test]
    async fn publish_and_replay_from_id() {
        let bus = EventBus::with_capacity(4);
        let first = bus.publish(running("a"));
        let second = bus.publish(Event::HealthChanged {
            degraded: vec!["workspace".into()],
        });

        assert_eq!(bus.last_event_id(), Some(second));
        let backlog = bus.backlog_since(first);
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].id, second);
    }

    #[tokio::test]
    async fn replay_buffer_drops_oldest_when_full() {
        let bus = EventBus::with_capacity(2);
        for job in ["a", "b", "c"] {
            let _ = bus.publish(running(job));
        }
        let backlog = bus.backlog_since(0);
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog[0].id, 2);
    }

    #[tokio::test]
    async fn history_filters_by_job() {
        let bus = EventBus::new();
        let _ = bus.publish(running("a"));
        let _ = bus.publish(running("b"));
        let _ = bus.publish(Event::JobReleased {
            job_id: "a".into(),
            complete: true,
        });
        let kinds: Vec<_> = bus
            .history_for("a")
            .into_iter()
            .map(|env| env.event.kind())
            .collect();
        assert_eq!(kinds, vec!["job_running", "job_released"]);
    }

    #[tokio::test]
    async fn subscribe_streams_live_events() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::new();
        let mut stream = bus.subscribe(None);
        let id = bus.publish(running("live"));
        let envelope = stream.next().await.ok_or("stream closed")??;
        assert_eq!(envelope.id, id);
        assert!(matches!(envelope.event, Event::JobRunning { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn subscribe_replays_backlog_before_live_events() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::new();
        let first = bus.publish(running("a"));
        let second = bus.publish(running("b"));
        let other = bus.subscribe(None);

        let mut stream = bus.subscribe(Some(first));
        let third = bus.publish(running("c"));
        let replayed = stream.next().await.ok_or("stream closed")??;
        assert_eq!(replayed.id, second);
        let live = stream.next().await.ok_or("stream closed")??;
        assert_eq!(live.id, third);

        let mut other = other;
        let seen = other.next().await.ok_or("stream closed")??;
        assert_eq!(seen.id, third, "replay must not leak into other subscribers");
        Ok(())
    }

    #[test]
    fn concurrent_publishers_journal_in_id_order() {
        let bus = EventBus::with_capacity(512);
        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let bus = bus.clone();
                std::thread::spawn(move || {
                    for n in 0..100 {
                        let _ = bus.publish(running(&format!("{worker}-{n}")));
                    }
                })
            })
            .collect();
        for worker in workers {
            assert!(worker.join().is_ok());
        }

        let ids: Vec<EventId> = bus.backlog_since(0).iter().map(|env| env.id).collect();
        assert_eq!(ids.len(), 400);
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(bus.last_event_id(), Some(400));
    }
}
