//! Type-routed publish/subscribe fan-out of gateway events.
//!
//! Handlers subscribe with a [`Filter`] and receive matching events either
//! through a callback or a channel. Every subscription returns a [`Handle`]
//! whose `remove` is idempotent and wakes any delivery task still blocked on
//! the subscription's channel.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{Error, Result};
use crate::model::{Event, EventType};
use crate::signal::Flag;

/// What events a subscription wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    /// Only events of exactly this variant.
    Exact(EventType),
    /// Every event, of every variant.
    Any,
}

impl Filter {
    fn matches(&self, kind: EventType) -> bool {
        match *self {
            Filter::Any => true,
            Filter::Exact(want) => want == kind,
        }
    }
}

/// How a matched event reaches the subscriber.
enum Deliverer {
    /// Invoked on the dispatching task. Must not block.
    SyncCallback(Arc<dyn Fn(&Event) + Send + Sync>),
    /// Invoked on a freshly spawned task.
    Callback(Arc<dyn Fn(&Event) + Send + Sync>),
    /// Awaited on the dispatching task; a full channel suspends dispatch
    /// until there is room or the subscription is removed.
    BlockingChannel(mpsc::Sender<Event>),
    /// Sent from a detached task. A never-draining channel leaks one task
    /// per event until the subscription is removed.
    Channel(mpsc::Sender<Event>),
}

impl Clone for Deliverer {
    fn clone(&self) -> Self {
        match self {
            Deliverer::SyncCallback(f) => Deliverer::SyncCallback(f.clone()),
            Deliverer::Callback(f) => Deliverer::Callback(f.clone()),
            Deliverer::BlockingChannel(tx) => Deliverer::BlockingChannel(tx.clone()),
            Deliverer::Channel(tx) => Deliverer::Channel(tx.clone()),
        }
    }
}

struct Entry {
    filter: Filter,
    deliverer: Deliverer,
    /// Co-closed by removal so blocked channel sends wake and abandon.
    cancel: Flag,
}

/// Subscription storage: a slab with a free-list. Slot indices are stable
/// until removal and may be reused afterwards; iteration runs in slot order.
#[derive(Default)]
struct Slab {
    entries: Vec<Option<Entry>>,
    free: Vec<usize>,
}

impl Slab {
    fn insert(&mut self, entry: Entry) -> usize {
        match self.free.pop() {
            Some(index) => {
                self.entries[index] = Some(entry);
                index
            }
            None => {
                self.entries.push(Some(entry));
                self.entries.len() - 1
            }
        }
    }

    fn remove(&mut self, index: usize) -> Option<Entry> {
        let entry = self.entries.get_mut(index)?.take();
        if entry.is_some() {
            self.free.push(index);
        }
        entry
    }
}

/// Called when a subscriber callback panics during delivery.
pub type ErrorSink = Arc<dyn Fn(EventType, Box<dyn std::any::Any + Send>) + Send + Sync>;

struct Shared {
    slab: RwLock<Slab>,
    error_sink: ErrorSink,
}

/// The event fan-out hub.
///
/// Cloning is cheap and clones share the subscription table.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher::new()
    }
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher::with_error_sink(Arc::new(|kind, _panic| {
            warn!(event = ?kind, "event handler panicked");
        }))
    }

    /// Create a dispatcher reporting handler panics to the given sink.
    pub fn with_error_sink(error_sink: ErrorSink) -> Dispatcher {
        Dispatcher {
            shared: Arc::new(Shared {
                slab: RwLock::new(Slab::default()),
                error_sink,
            }),
        }
    }

    fn insert(&self, filter: Filter, deliverer: Deliverer) -> Handle {
        let cancel = Flag::new();
        let index = self
            .shared
            .slab
            .write()
            .expect("dispatcher lock poisoned")
            .insert(Entry {
                filter,
                deliverer,
                cancel,
            });
        Handle {
            shared: self.shared.clone(),
            index,
            removed: AtomicBool::new(false),
        }
    }

    /// Subscribe a callback, invoked on a fresh task per matching event.
    pub fn subscribe<F>(&self, filter: Filter, f: F) -> Handle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.insert(filter, Deliverer::Callback(Arc::new(f)))
    }

    /// Subscribe a callback, invoked synchronously on the dispatching task.
    ///
    /// The callback must not block; it holds up every later delivery of the
    /// same event.
    pub fn subscribe_sync<F>(&self, filter: Filter, f: F) -> Handle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.insert(filter, Deliverer::SyncCallback(Arc::new(f)))
    }

    /// Subscribe a channel; sends are performed from detached tasks so a
    /// full channel never suspends dispatch.
    pub fn subscribe_channel(&self, filter: Filter, tx: mpsc::Sender<Event>) -> Handle {
        self.insert(filter, Deliverer::Channel(tx))
    }

    /// Subscribe a channel; sends are awaited during dispatch, so a full
    /// channel applies backpressure to the event pump.
    pub fn subscribe_channel_blocking(&self, filter: Filter, tx: mpsc::Sender<Event>) -> Handle {
        self.insert(filter, Deliverer::BlockingChannel(tx))
    }

    /// Wait for the next event matching `filter`.
    ///
    /// Yields [`Error::Cancelled`] if `cancel` trips first. Not meant for
    /// high-throughput filtering; subscribe a channel for that.
    pub async fn expect(&self, filter: Filter, cancel: &Flag) -> Result<Event> {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = self.subscribe_channel(filter, tx);
        let received = tokio::select! {
            event = rx.recv() => event.ok_or(Error::Cancelled),
            _ = cancel.triggered() => Err(Error::Cancelled),
        };
        handle.remove();
        received
    }

    /// Deliver an event to every matching subscription, in slot order.
    pub async fn dispatch(&self, event: &Event) {
        self.fan_out(event, false).await
    }

    /// Deliver an event to exact-type subscriptions only.
    ///
    /// Used by the state layer for derived events, whose originating generic
    /// event has already been seen by the all-events subscribers.
    pub async fn dispatch_direct(&self, event: &Event) {
        self.fan_out(event, true).await
    }

    async fn fan_out(&self, event: &Event, direct: bool) {
        let kind = event.kind();

        // Snapshot matches under the read lock, deliver outside it, so a
        // blocked channel send cannot hold up unsubscription.
        let targets: Vec<(Deliverer, Flag)> = {
            let slab = self.shared.slab.read().expect("dispatcher lock poisoned");
            slab.entries
                .iter()
                .flatten()
                .filter(|entry| !(direct && entry.filter == Filter::Any))
                .filter(|entry| entry.filter.matches(kind))
                .map(|entry| (entry.deliverer.clone(), entry.cancel.clone()))
                .collect()
        };

        for (deliverer, cancel) in targets {
            match deliverer {
                Deliverer::SyncCallback(f) => {
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| f(event))) {
                        (self.shared.error_sink)(kind, panic);
                    }
                }
                Deliverer::Callback(f) => {
                    let event = event.clone();
                    let sink = self.shared.error_sink.clone();
                    tokio::spawn(async move {
                        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| f(&event))) {
                            sink(kind, panic);
                        }
                    });
                }
                Deliverer::BlockingChannel(tx) => {
                    let event = event.clone();
                    tokio::select! {
                        _ = tx.send(event) => {}
                        _ = cancel.triggered() => {}
                    }
                }
                Deliverer::Channel(tx) => {
                    let event = event.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = tx.send(event) => {}
                            _ = cancel.triggered() => {}
                        }
                    });
                }
            }
        }
    }
}

/// Removal handle returned by the subscribe family.
///
/// Dropping the handle does *not* unsubscribe; call [`Handle::remove`].
pub struct Handle {
    shared: Arc<Shared>,
    index: usize,
    removed: AtomicBool,
}

impl Handle {
    /// Unsubscribe. Idempotent; pending channel sends for this subscription
    /// are abandoned.
    pub fn remove(&self) {
        if self.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        let entry = self
            .shared
            .slab
            .write()
            .expect("dispatcher lock poisoned")
            .remove(self.index);
        if let Some(entry) = entry {
            entry.cancel.trigger();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelId, ChannelType, GuildDeleteEvent, GuildId};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    fn message_event(content: &str) -> Event {
        let msg: crate::model::Message = serde_json::from_value(serde_json::json!({
            "id": "1",
            "channel_id": "2",
            "author": {"id": "3", "username": "u"},
            "content": content,
            "timestamp": "2020-01-01T00:00:00+00:00"
        }))
        .unwrap();
        Event::MessageCreate(Box::new(msg))
    }

    fn channel_delete_event() -> Event {
        Event::ChannelDelete(crate::model::Channel {
            id: ChannelId(9),
            kind: ChannelType::Text,
            guild_id: Some(GuildId(1)),
            name: None,
            topic: None,
            position: None,
            parent_id: None,
            last_message_id: None,
            recipients: vec![],
            permission_overwrites: vec![],
        })
    }

    #[tokio::test]
    async fn subscribe_dispatch_remove() {
        let dispatcher = Dispatcher::new();
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();

        let handle = {
            let seen = seen.clone();
            dispatcher.subscribe_sync(Filter::Exact(EventType::MessageCreate), move |event| {
                if let Event::MessageCreate(msg) = event {
                    seen.lock().unwrap().push(msg.content.clone());
                }
            })
        };

        dispatcher.dispatch(&message_event("hime arikawa")).await;
        dispatcher.dispatch(&channel_delete_event()).await;
        assert_eq!(*seen.lock().unwrap(), vec!["hime arikawa".to_owned()]);

        handle.remove();
        handle.remove(); // idempotent
        dispatcher.dispatch(&message_event("after removal")).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn any_filter_observes_every_variant() {
        let dispatcher = Dispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let _handle = {
            let count = count.clone();
            dispatcher.subscribe_sync(Filter::Any, move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        dispatcher.dispatch(&message_event("a")).await;
        dispatcher.dispatch(&channel_delete_event()).await;
        dispatcher
            .dispatch(&Event::GuildUnavailable(GuildId(1)))
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn direct_dispatch_skips_any_filters() {
        let dispatcher = Dispatcher::new();
        let any = Arc::new(AtomicUsize::new(0));
        let exact = Arc::new(AtomicUsize::new(0));
        let _a = {
            let any = any.clone();
            dispatcher.subscribe_sync(Filter::Any, move |_| {
                any.fetch_add(1, Ordering::SeqCst);
            })
        };
        let _e = {
            let exact = exact.clone();
            dispatcher.subscribe_sync(Filter::Exact(EventType::GuildLeave), move |_| {
                exact.fetch_add(1, Ordering::SeqCst);
            })
        };

        dispatcher
            .dispatch_direct(&Event::GuildLeave(GuildId(1)))
            .await;
        assert_eq!(any.load(Ordering::SeqCst), 0);
        assert_eq!(exact.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sync_subscribers_observe_events_in_order() {
        let dispatcher = Dispatcher::new();
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let _h = {
            let seen = seen.clone();
            dispatcher.subscribe_sync(Filter::Exact(EventType::MessageCreate), move |event| {
                if let Event::MessageCreate(msg) = event {
                    seen.lock().unwrap().push(msg.content.clone());
                }
            })
        };

        for content in ["one", "two", "three"] {
            dispatcher.dispatch(&message_event(content)).await;
        }
        assert_eq!(*seen.lock().unwrap(), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn removal_unblocks_pending_channel_send() {
        let dispatcher = Dispatcher::new();
        let (tx, mut rx) = mpsc::channel(1);
        let handle = Arc::new(
            dispatcher.subscribe_channel_blocking(Filter::Exact(EventType::MessageCreate), tx),
        );

        // Fill the channel so the next dispatch blocks on the send.
        dispatcher.dispatch(&message_event("fill")).await;

        let blocked = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch(&message_event("stuck")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        handle.remove();
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("dispatch did not unblock after removal")
            .unwrap();

        // Only the first event made it through.
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn slab_reuses_slots() {
        let dispatcher = Dispatcher::new();
        let a = dispatcher.subscribe_sync(Filter::Any, |_| {});
        let index_a = a.index;
        a.remove();
        let b = dispatcher.subscribe_sync(Filter::Any, |_| {});
        assert_eq!(b.index, index_a);
    }

    #[tokio::test]
    async fn handler_panic_is_reported_not_fatal() {
        let panics = Arc::new(AtomicUsize::new(0));
        let dispatcher = {
            let panics = panics.clone();
            Dispatcher::with_error_sink(Arc::new(move |_, _| {
                panics.fetch_add(1, Ordering::SeqCst);
            }))
        };
        let after = Arc::new(AtomicUsize::new(0));

        let _bad = dispatcher.subscribe_sync(Filter::Any, |_| panic!("boom"));
        let _good = {
            let after = after.clone();
            dispatcher.subscribe_sync(Filter::Any, move |_| {
                after.fetch_add(1, Ordering::SeqCst);
            })
        };

        dispatcher.dispatch(&message_event("x")).await;
        assert_eq!(panics.load(Ordering::SeqCst), 1);
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expect_yields_event_or_cancellation() {
        let dispatcher = Dispatcher::new();
        let cancel = Flag::new();

        let waiting = {
            let dispatcher = dispatcher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                dispatcher
                    .expect(Filter::Exact(EventType::MessageCreate), &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        dispatcher.dispatch(&message_event("expected")).await;
        match waiting.await.unwrap() {
            Ok(Event::MessageCreate(msg)) => assert_eq!(msg.content, "expected"),
            other => panic!("unexpected result: {:?}", other),
        }

        let cancelled = {
            let dispatcher = dispatcher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                dispatcher
                    .expect(Filter::Exact(EventType::GuildDelete), &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.trigger();
        assert!(matches!(cancelled.await.unwrap(), Err(Error::Cancelled)));

        // Unrelated to the filter, just exercises the payload type.
        let _ = Event::GuildDelete(GuildDeleteEvent {
            id: GuildId(3),
            unavailable: false,
        });
    }
}
