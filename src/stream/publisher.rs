//! # Publisher and Subscription
//!
//! Per-type fan-out of change events to the streamers of every subscribed
//! connection.
//!
//! ## Locking
//! One mutex per publisher guards both the subscriber list and delivery, so
//! a broadcast never observes a half-applied register or unregister.

use std::cell::OnceCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::error;

use super::msg::{Event, Msg, PreparedMessage};
use super::streamer::Outbox;

/// Subscription predicate
pub type Filter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Wrap a closure as a [`Filter`]
pub fn filter_fn<T, F>(f: F) -> Filter<T>
where
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Conjunction of two filters
pub fn all_of<T: 'static>(a: Filter<T>, b: Filter<T>) -> Filter<T> {
    Arc::new(move |msg: &T| a(msg) && b(msg))
}

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

struct Subscriber<T> {
    id: u64,
    outbox: Arc<dyn Outbox>,
    filter: Filter<T>,
}

/// Result of a broadcast
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Subscribers that received at least one frame
    pub woken: usize,
    /// Frames queued across all subscribers
    pub delivered: usize,
}

/// Broadcast hub for one entity type.
pub struct Publisher<T> {
    subscribers: Mutex<Vec<Subscriber<T>>>,
}

impl<T> fmt::Debug for Publisher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("subscribers", &self.lock().len())
            .finish()
    }
}

impl<T: Msg> Default for Publisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Publisher<T> {
    fn lock(&self) -> MutexGuard<'_, Vec<Subscriber<T>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of registered subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Close every streamer reachable through this publisher
    pub fn close_all_streamers(&self) {
        for subscriber in self.lock().iter() {
            subscriber.outbox.close();
        }
    }
}

impl<T: Msg> Publisher<T> {
    /// Create a publisher with no subscribers
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Deliver a batch of events to every matching subscriber.
    ///
    /// Each subscriber gets all of its frames in event order with a single
    /// wakeup. An after-image that passes the filter is sent as an upsert;
    /// otherwise a before-image that passes is sent as a deletion, which is
    /// how rows falling out of a subscriber's view are reported.
    pub fn broadcast(&self, events: &[Event<T>]) -> BroadcastStats {
        let mut stats = BroadcastStats::default();
        if events.is_empty() {
            return stats;
        }

        // Frames are prepared at most once per event and shared
        let upserts: Vec<OnceCell<Option<PreparedMessage>>> =
            events.iter().map(|_| OnceCell::new()).collect();
        let deletes: Vec<OnceCell<PreparedMessage>> =
            events.iter().map(|_| OnceCell::new()).collect();

        let subscribers = self.lock();
        for subscriber in subscribers.iter() {
            let mut batch = Vec::new();
            for (i, event) in events.iter().enumerate() {
                if let Some(after) = event.after.as_ref().filter(|m| (subscriber.filter)(*m)) {
                    let prepared = upserts[i].get_or_init(|| match PreparedMessage::upsert(after) {
                        Ok(msg) => Some(msg),
                        Err(e) => {
                            error!(key = T::UPSERT_KEY, error = %e, "unable to prepare upsert");
                            None
                        }
                    });
                    if let Some(msg) = prepared {
                        batch.push(msg.clone());
                    }
                } else if let Some(before) = event.before.as_ref().filter(|m| (subscriber.filter)(*m)) {
                    batch.push(deletes[i].get_or_init(|| PreparedMessage::delete(before)).clone());
                }
            }
            if !batch.is_empty() {
                stats.woken += 1;
                stats.delivered += batch.len();
                subscriber.outbox.push_batch(batch);
            }
        }
        stats
    }
}

/// One connection's registration with one publisher.
///
/// The effective predicate is the permission filter AND the spec filter.
/// Dropping a subscription unregisters it.
pub struct Subscription<T: Msg> {
    id: u64,
    outbox: Arc<dyn Outbox>,
    publisher: Arc<Publisher<T>>,
    permission_filter: Filter<T>,
    spec_filter: Filter<T>,
    active: Option<Filter<T>>,
}

impl<T: Msg> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("key", &T::UPSERT_KEY)
            .field("registered", &self.active.is_some())
            .finish()
    }
}

impl<T: Msg> Subscription<T> {
    /// Create an unregistered subscription
    pub fn new(
        outbox: Arc<dyn Outbox>,
        publisher: Arc<Publisher<T>>,
        permission_filter: Filter<T>,
        spec_filter: Filter<T>,
    ) -> Self {
        Self {
            id: NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed),
            outbox,
            publisher,
            permission_filter,
            spec_filter,
            active: None,
        }
    }

    /// Subscription id, unique within the process
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the subscription is attached to its publisher
    pub fn is_registered(&self) -> bool {
        self.active.is_some()
    }

    /// Evaluate the combined predicate
    pub fn matches(&self, msg: &T) -> bool {
        (self.permission_filter)(msg) && (self.spec_filter)(msg)
    }

    /// Attach to the publisher with the combined predicate
    pub fn register(&mut self) {
        let filter = all_of(
            Arc::clone(&self.permission_filter),
            Arc::clone(&self.spec_filter),
        );
        self.configure(Some(filter));
    }

    /// Detach from the publisher
    pub fn unregister(&mut self) {
        self.configure(None);
    }

    /// Change the registered predicate atomically with respect to broadcasts.
    ///
    /// `None -> None` returns without touching the publisher lock.
    pub fn configure(&mut self, filter: Option<Filter<T>>) {
        match (self.active.is_some(), filter) {
            (false, None) => {}
            (false, Some(filter)) => {
                let mut subscribers = self.publisher.lock();
                subscribers.push(Subscriber {
                    id: self.id,
                    outbox: Arc::clone(&self.outbox),
                    filter: Arc::clone(&filter),
                });
                self.active = Some(filter);
            }
            (true, None) => {
                let mut subscribers = self.publisher.lock();
                if let Some(pos) = subscribers.iter().position(|s| s.id == self.id) {
                    subscribers.swap_remove(pos);
                }
                self.active = None;
            }
            (true, Some(filter)) => {
                let mut subscribers = self.publisher.lock();
                if let Some(subscriber) = subscribers.iter_mut().find(|s| s.id == self.id) {
                    subscriber.filter = Arc::clone(&filter);
                }
                self.active = Some(filter);
            }
        }
    }
}

impl<T: Msg> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::msg::MessageKind;
    use crate::stream::streamer::{Streamer, Wakeup};
    use serde::Serialize;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct Widget {
        id: i64,
        seq: i64,
        workspace: i32,
    }

    impl Msg for Widget {
        const UPSERT_KEY: &'static str = "widget";
        const DELETE_KEY: &'static str = "widgets_deleted";

        fn id(&self) -> i64 {
            self.id
        }

        fn seq_num(&self) -> i64 {
            self.seq
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct Gadget {
        id: i64,
        seq: i64,
    }

    impl Msg for Gadget {
        const UPSERT_KEY: &'static str = "gadget";
        const DELETE_KEY: &'static str = "gadgets_deleted";

        fn id(&self) -> i64 {
            self.id
        }

        fn seq_num(&self) -> i64 {
            self.seq
        }
    }

    fn widget(id: i64, seq: i64) -> Widget {
        Widget { id, seq, workspace: 1 }
    }

    fn always<T: 'static>(value: bool) -> Filter<T> {
        filter_fn(move |_: &T| value)
    }

    fn true_after_n<T: 'static>(n: usize) -> Filter<T> {
        let count = AtomicUsize::new(0);
        filter_fn(move |_: &T| count.fetch_add(1, Ordering::SeqCst) + 1 > n)
    }

    fn streamer() -> Arc<Streamer<()>> {
        Arc::new(Streamer::new())
    }

    #[test]
    fn test_configure_subscription() {
        let s = streamer();
        let publisher = Arc::new(Publisher::<Widget>::new());

        let mut sub = Subscription::new(s.clone(), publisher.clone(), always(true), always(true));
        assert_eq!(publisher.subscriber_count(), 0);
        assert!(!sub.is_registered());

        sub.register();
        assert_eq!(publisher.subscriber_count(), 1);
        assert!(sub.matches(&widget(1, 1)));

        let mut sub2 = Subscription::new(s.clone(), publisher.clone(), always(true), always(false));
        sub2.register();
        assert_eq!(publisher.subscriber_count(), 2);
        assert!(!sub2.matches(&widget(1, 1)));

        sub.unregister();
        assert_eq!(publisher.subscriber_count(), 1);

        // the remaining registration is sub2's, which rejects everything
        publisher.broadcast(&[Event::insert(widget(1, 1))]);
        assert_eq!(s.pending(), 0);

        // unregistering twice is a no-op
        sub.unregister();
        assert_eq!(publisher.subscriber_count(), 1);
    }

    #[test]
    fn test_reconfigure_swaps_filter_in_place() {
        let s = streamer();
        let publisher = Arc::new(Publisher::<Widget>::new());
        let mut sub = Subscription::new(s.clone(), publisher.clone(), always(true), always(true));
        sub.configure(Some(always(false)));
        assert_eq!(publisher.subscriber_count(), 1);

        publisher.broadcast(&[Event::insert(widget(1, 1))]);
        assert_eq!(s.pending(), 0);

        sub.configure(Some(always(true)));
        assert_eq!(publisher.subscriber_count(), 1);
        publisher.broadcast(&[Event::insert(widget(1, 2))]);
        assert_eq!(s.pending(), 1);
    }

    #[test]
    fn test_drop_unregisters() {
        let s = streamer();
        let publisher = Arc::new(Publisher::<Widget>::new());
        {
            let mut sub = Subscription::new(s.clone(), publisher.clone(), always(true), always(true));
            sub.register();
            assert_eq!(publisher.subscriber_count(), 1);
        }
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[test]
    fn test_broadcast() {
        let s = streamer();
        let publisher = Arc::new(Publisher::<Widget>::new());
        let mut true_sub = Subscription::new(s.clone(), publisher.clone(), always(true), always(true));
        let mut false_sub = Subscription::new(s.clone(), publisher.clone(), always(true), always(false));
        true_sub.register();
        false_sub.register();

        publisher.broadcast(&[Event::insert(widget(0, 0))]);
        let msgs = s.take_pending();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind(), MessageKind::Upsert { id: 0, seq: 0 });

        publisher.broadcast(&[Event::delete(widget(1, 1))]);
        let msgs = s.take_pending();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind(), MessageKind::Delete);
        assert_eq!(msgs[0].to_json()["widgets_deleted"], "1");
    }

    #[test]
    fn test_broadcast_with_filters() {
        let s = streamer();
        let publisher = Arc::new(Publisher::<Widget>::new());
        let publisher_two = Arc::new(Publisher::<Widget>::new());

        let mut one_sub =
            Subscription::new(s.clone(), publisher_two.clone(), always(true), true_after_n(2));
        let mut false_sub = Subscription::new(s.clone(), publisher.clone(), always(true), always(false));
        one_sub.register();
        false_sub.register();

        publisher.broadcast(&[Event::insert(widget(0, 0))]);
        publisher.broadcast(&[Event::delete(widget(1, 1))]);
        assert_eq!(s.pending(), 0, "picked up message we don't want");

        // first two filter calls fail
        publisher_two.broadcast(&[Event::insert(widget(1, 1))]);
        publisher_two.broadcast(&[Event::delete(widget(2, 2))]);
        assert_eq!(s.pending(), 0, "picked up message we don't want");

        publisher_two.broadcast(&[Event::insert(widget(3, 3))]);
        publisher_two.broadcast(&[Event::delete(widget(4, 4))]);
        let msgs = s.take_pending();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].kind(), MessageKind::Upsert { id: 3, seq: 3 });
        assert_eq!(msgs[1].to_json()["widgets_deleted"], "4");
    }

    #[test]
    fn test_broadcast_separate_types() {
        let s = streamer();
        let s2 = streamer();
        let widgets = Arc::new(Publisher::<Widget>::new());
        let gadgets = Arc::new(Publisher::<Gadget>::new());
        let gadgets_two = Arc::new(Publisher::<Gadget>::new());

        let mut a = Subscription::new(s.clone(), widgets.clone(), always(true), always(true));
        let mut separate = Subscription::new(s2.clone(), gadgets.clone(), always(true), always(true));
        let mut together = Subscription::new(s.clone(), gadgets_two.clone(), always(true), always(true));
        a.register();
        separate.register();
        together.register();

        widgets.broadcast(&[Event::insert(widget(1, 1))]);
        gadgets.broadcast(&[Event::insert(Gadget { id: 2, seq: 2 })]);
        gadgets_two.broadcast(&[Event::insert(Gadget { id: 3, seq: 3 })]);

        let msgs = s.take_pending();
        assert_eq!(msgs.len(), 2);
        assert!(msgs[0].to_json().get("widget").is_some());
        assert!(msgs[1].to_json().get("gadget").is_some());

        let msgs = s2.take_pending();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].to_json()["gadget"]["id"], 2);
    }

    #[test]
    fn test_fallout_is_delivered_as_delete() {
        let s = streamer();
        let publisher = Arc::new(Publisher::<Widget>::new());
        let visible: Filter<Widget> = filter_fn(|w: &Widget| w.workspace == 1);
        let mut sub = Subscription::new(s.clone(), publisher.clone(), visible, always(true));
        sub.register();

        let before = Widget { id: 5, seq: 1, workspace: 1 };
        let after = Widget { id: 5, seq: 2, workspace: 2 };
        publisher.broadcast(&[Event::update(before, after)]);

        let msgs = s.take_pending();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind(), MessageKind::Delete);
        assert_eq!(msgs[0].to_json()["widgets_deleted"], "5");

        // and fall-in arrives as an upsert of the after-image
        let before = Widget { id: 6, seq: 3, workspace: 2 };
        let after = Widget { id: 6, seq: 4, workspace: 1 };
        publisher.broadcast(&[Event::update(before, after)]);
        let msgs = s.take_pending();
        assert_eq!(msgs[0].kind(), MessageKind::Upsert { id: 6, seq: 4 });
    }

    #[tokio::test]
    async fn test_batched_wakeup() {
        let s = streamer();
        let publisher = Arc::new(Publisher::<Widget>::new());
        let mut sub = Subscription::new(s.clone(), publisher.clone(), always(true), always(true));
        sub.register();

        let events: Vec<_> = (1..=5).map(|i| Event::insert(widget(i, i))).collect();
        let stats = publisher.broadcast(&events);
        assert_eq!(stats, BroadcastStats { woken: 1, delivered: 5 });
        assert_eq!(s.signal_count(), 1);

        match s.wait().await {
            Wakeup::Messages(msgs) => {
                let seqs: Vec<i64> = msgs
                    .iter()
                    .map(|m| match m.kind() {
                        MessageKind::Upsert { seq, .. } => seq,
                        other => panic!("unexpected frame {:?}", other),
                    })
                    .collect();
                assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
            }
            other => panic!("unexpected wakeup: {:?}", other),
        }
    }

    #[test]
    fn test_close_all_streamers() {
        let s = streamer();
        let s2 = streamer();
        let publisher = Arc::new(Publisher::<Widget>::new());
        let mut a = Subscription::new(s.clone(), publisher.clone(), always(true), always(true));
        let mut b = Subscription::new(s2.clone(), publisher.clone(), always(true), always(true));
        a.register();
        b.register();

        publisher.close_all_streamers();
        assert!(s.is_closed());
        assert!(s2.is_closed());
    }
}
