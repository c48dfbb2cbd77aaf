use crate::fault::{self, Fault};
use crossbeam::epoch::{self, Atomic, Owned, Shared};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Tag bit on the listener list pointer. Once set, the list has been taken
/// by the completing thread and late registrations fire on their own thread.
const SEALED: usize = 1;

static NEXT_LISTENER_KEY: AtomicU64 = AtomicU64::new(1);

/// Identifies one listener registration so it can later be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerKey(u64);

/// Passed to completion listeners; carries the completed future.
pub struct CompletionEvent<V> {
    future: CompletionFuture<V>,
}

impl<V> CompletionEvent<V> {
    pub fn future(&self) -> &CompletionFuture<V> {
        &self.future
    }
}

struct ListenerEntry<V> {
    key: ListenerKey,
    callback: Arc<dyn Fn(&CompletionEvent<V>) + Send + Sync>,
}

impl<V> Clone for ListenerEntry<V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            callback: Arc::clone(&self.callback),
        }
    }
}

/// One-shot latch for the outcome of an asynchronous operation.
///
/// The latch is created pending and flips to ready exactly once; the first
/// `complete` wins and later calls return silently without touching the
/// value. Threads may block on the outcome with [`wait`] or
/// [`wait_timeout`], or register listeners that are each invoked exactly
/// once: by the completing thread for registrations that landed before
/// completion (in registration order), or synchronously on the registering
/// thread for registrations that landed after.
///
/// The latch itself never fails to complete; whether the outcome denotes
/// success is encoded in the value type `V`. Cancellation, where a domain
/// needs it, is just another ready value.
///
/// Handles are cheap to clone and all refer to the same latch.
///
/// [`wait`]: CompletionFuture::wait
/// [`wait_timeout`]: CompletionFuture::wait_timeout
pub struct CompletionFuture<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for CompletionFuture<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<V> {
    // Flag and value flip together under this mutex; listener dispatch
    // happens strictly outside it so a listener may re-enter the latch.
    state: Mutex<Option<V>>,
    ready: AtomicBool,
    completed: Condvar,

    // Copy-on-write snapshot list, edited by compare-and-swap so concurrent
    // adds and removes never lose registrations. The completing thread takes
    // the whole list with a single sealed swap.
    listeners: Atomic<Vec<ListenerEntry<V>>>,
}

impl<V> CompletionFuture<V> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(None),
                ready: AtomicBool::new(false),
                completed: Condvar::new(),
                listeners: Atomic::new(Vec::new()),
            }),
        }
    }

    /// Flips the latch to ready with `value`. The first call wins; later
    /// calls are silent no-ops. Wakes every blocked waiter, then invokes the
    /// listeners registered so far in registration order. A panicking
    /// listener is reported to the fault sink and does not disturb the
    /// remaining listeners or this caller.
    pub fn complete(&self, value: V) {
        {
            let mut slot = self.inner.state.lock().expect("completion state lock poisoned");
            if slot.is_some() {
                return;
            }
            *slot = Some(value);
            self.inner.ready.store(true, Ordering::Release);
            self.inner.completed.notify_all();
        }

        self.dispatch_captured();
    }

    pub fn is_done(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    /// Current value slot; `None` until the latch is ready. Callers that
    /// need a completed value should [`wait`] first.
    ///
    /// [`wait`]: CompletionFuture::wait
    pub fn value(&self) -> Option<V>
    where
        V: Clone,
    {
        self.inner
            .state
            .lock()
            .expect("completion state lock poisoned")
            .clone()
    }

    /// Blocks until the latch is ready. Returns `self` for chaining.
    pub fn wait(&self) -> &Self {
        let mut slot = self.inner.state.lock().expect("completion state lock poisoned");
        while slot.is_none() {
            slot = self
                .inner
                .completed
                .wait(slot)
                .expect("completion state lock poisoned");
        }
        drop(slot);
        self
    }

    /// Blocks until the latch is ready or `timeout` elapses. Returns true
    /// iff the latch is ready at return. `Duration::MAX` waits indefinitely.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let slot = self.inner.state.lock().expect("completion state lock poisoned");
        if slot.is_some() {
            return true;
        }

        let (slot, _timed_out) = self
            .inner
            .completed
            .wait_timeout_while(slot, timeout, |value| value.is_none())
            .expect("completion state lock poisoned");
        slot.is_some()
    }

    /// Registers a completion listener and returns a key for later removal.
    ///
    /// If the latch is still pending the listener is appended to the
    /// snapshot list; if it already completed, the listener runs
    /// synchronously on this thread before `add_listener` returns. Either
    /// way it runs exactly once.
    pub fn add_listener<F>(&self, listener: F) -> ListenerKey
    where
        F: Fn(&CompletionEvent<V>) + Send + Sync + 'static,
    {
        let entry = ListenerEntry {
            key: ListenerKey(NEXT_LISTENER_KEY.fetch_add(1, Ordering::Relaxed)),
            callback: Arc::new(listener),
        };
        let key = entry.key;

        {
            let guard = epoch::pin();
            loop {
                let current = self.inner.listeners.load(Ordering::Acquire, &guard);
                if current.tag() == SEALED {
                    break;
                }

                // SAFETY: the pointer is only null once sealed, which the
                // tag check above excludes; reclamation is deferred past
                // every pinned reader.
                let snapshot = unsafe { current.as_ref() }
                    .expect("listener list is never null before sealing");
                let mut next = snapshot.clone();
                next.push(entry.clone());

                match self.inner.listeners.compare_exchange(
                    current,
                    Owned::new(next),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    &guard,
                ) {
                    Ok(_) => {
                        // SAFETY: the old snapshot is unreachable for new
                        // readers; epoch reclamation waits out current ones.
                        unsafe { guard.defer_destroy(current) };
                        return key;
                    }
                    Err(_) => continue,
                }
            }
        }

        // The completing thread sealed the list before our append landed,
        // so delivery is ours.
        self.invoke(&entry);
        key
    }

    /// Removes a listener registration. Returns false when the key is not
    /// registered or the latch already completed (the listener has fired or
    /// is firing).
    pub fn remove_listener(&self, key: ListenerKey) -> bool {
        let guard = epoch::pin();
        loop {
            let current = self.inner.listeners.load(Ordering::Acquire, &guard);
            if current.tag() == SEALED {
                return false;
            }

            // SAFETY: as in `add_listener`.
            let snapshot =
                unsafe { current.as_ref() }.expect("listener list is never null before sealing");
            let Some(index) = snapshot.iter().position(|entry| entry.key == key) else {
                return false;
            };

            let mut next = snapshot.clone();
            next.remove(index);

            match self.inner.listeners.compare_exchange(
                current,
                Owned::new(next),
                Ordering::AcqRel,
                Ordering::Acquire,
                &guard,
            ) {
                Ok(_) => {
                    // SAFETY: as in `add_listener`.
                    unsafe { guard.defer_destroy(current) };
                    return true;
                }
                Err(_) => continue,
            }
        }
    }

    /// Seals the listener list and fires everything the seal captured. Runs
    /// outside the state mutex. Registrations that lose the race to the seal
    /// observe the sealed tag and fire on their own thread instead, so every
    /// listener fires exactly once.
    fn dispatch_captured(&self) {
        let captured = {
            let guard = epoch::pin();
            let previous = self.inner.listeners.swap(
                Shared::null().with_tag(SEALED),
                Ordering::AcqRel,
                &guard,
            );

            // SAFETY: `complete` seals at most once, so the previous pointer
            // is still the live, non-null snapshot.
            let entries = unsafe { previous.as_ref() }
                .expect("listener list is never null before sealing")
                .clone();
            // SAFETY: as in `add_listener`.
            unsafe { guard.defer_destroy(previous) };
            entries
        };

        for entry in &captured {
            self.invoke(entry);
        }
    }

    fn invoke(&self, entry: &ListenerEntry<V>) {
        let event = CompletionEvent {
            future: self.clone(),
        };
        let callback = Arc::clone(&entry.callback);

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| (callback)(&event))) {
            fault::report(Fault::from_panic("completion listener", payload.as_ref()));
        }
    }
}

impl<V> Default for CompletionFuture<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Drop for Inner<V> {
    fn drop(&mut self) {
        // Sole owner at this point; reclaim the final snapshot if the latch
        // never completed.
        let guard = unsafe { epoch::unprotected() };
        let current = self.listeners.load(Ordering::Relaxed, guard);
        if !current.is_null() {
            // SAFETY: no other handle exists, nothing can still read this.
            drop(unsafe { current.into_owned() });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::testing;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn latch_completes_across_threads() {
        let future = CompletionFuture::<i32>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let observed = Arc::new(Mutex::new(None));

        future.add_listener({
            let hits = Arc::clone(&hits);
            let observed = Arc::clone(&observed);
            move |event| {
                hits.fetch_add(1, Ordering::SeqCst);
                *observed.lock().unwrap() = event.future().value();
            }
        });

        let waiter = thread::spawn({
            let future = future.clone();
            move || {
                future.wait();
                future.value()
            }
        });

        let producer = thread::spawn({
            let future = future.clone();
            move || future.complete(42)
        });

        producer.join().unwrap();
        assert_eq!(waiter.join().unwrap(), Some(42));

        assert!(future.wait_timeout(Duration::ZERO));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(*observed.lock().unwrap(), Some(42));
    }

    #[test]
    fn late_listener_fires_synchronously() {
        let future = CompletionFuture::<u32>::new();
        future.complete(7);

        let observed = Arc::new(Mutex::new(None));
        future.add_listener({
            let observed = Arc::clone(&observed);
            move |event| {
                *observed.lock().unwrap() = event.future().value();
            }
        });

        // Delivery happened before add_listener returned.
        assert_eq!(*observed.lock().unwrap(), Some(7));
    }

    #[test]
    fn timeout_expires_without_completion() {
        let future = CompletionFuture::<()>::new();

        let start = Instant::now();
        let ready = future.wait_timeout(Duration::from_millis(50));

        assert!(!ready);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(!future.is_done());
    }

    #[test]
    fn unbounded_wait_is_permitted() {
        let future = CompletionFuture::<u8>::new();

        let producer = thread::spawn({
            let future = future.clone();
            move || {
                thread::sleep(Duration::from_millis(10));
                future.complete(1);
            }
        });

        assert!(future.wait_timeout(Duration::MAX));
        producer.join().unwrap();
    }

    #[test]
    fn panicking_listener_does_not_disturb_the_rest() {
        let sink = testing::recording();

        let future = CompletionFuture::<u32>::new();
        let survivor_fired = Arc::new(AtomicUsize::new(0));

        future.add_listener(|_| panic!("completion-panic-marker"));
        future.add_listener({
            let survivor_fired = Arc::clone(&survivor_fired);
            move |_| {
                survivor_fired.fetch_add(1, Ordering::SeqCst);
            }
        });

        future.complete(5);

        assert_eq!(survivor_fired.load(Ordering::SeqCst), 1);
        assert_eq!(sink.count_containing("completion-panic-marker"), 1);
    }

    #[test]
    fn first_completion_wins() {
        let future = CompletionFuture::<u32>::new();

        future.complete(1);
        future.complete(2);

        assert_eq!(future.value(), Some(1));
    }

    #[test]
    fn listeners_fire_in_registration_order() {
        let future = CompletionFuture::<()>::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for index in 0..5 {
            future.add_listener({
                let order = Arc::clone(&order);
                move |_| order.lock().unwrap().push(index)
            });
        }

        future.complete(());

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn removed_listener_never_fires() {
        let future = CompletionFuture::<u32>::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let key = future.add_listener({
            let fired = Arc::clone(&fired);
            move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert!(future.remove_listener(key));
        future.complete(3);

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        // Once completed, removal is refused.
        let late = future.add_listener(|_| {});
        assert!(!future.remove_listener(late));
    }

    /// Adversarial schedule: many threads racing registrations against one
    /// completing thread. Every registration must fire exactly once no
    /// matter which side of the seal it lands on.
    #[test]
    fn concurrent_registration_never_loses_or_duplicates() {
        const ADDERS: usize = 8;
        const PER_ADDER: usize = 64;

        let future = CompletionFuture::<u32>::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(ADDERS + 1));

        let mut handles = Vec::new();
        for _ in 0..ADDERS {
            handles.push(thread::spawn({
                let future = future.clone();
                let fired = Arc::clone(&fired);
                let barrier = Arc::clone(&barrier);
                move || {
                    barrier.wait();
                    for _ in 0..PER_ADDER {
                        future.add_listener({
                            let fired = Arc::clone(&fired);
                            move |_| {
                                fired.fetch_add(1, Ordering::SeqCst);
                            }
                        });
                    }
                }
            }));
        }

        handles.push(thread::spawn({
            let future = future.clone();
            let barrier = Arc::clone(&barrier);
            move || {
                barrier.wait();
                future.complete(9);
            }
        }));

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(fired.load(Ordering::SeqCst), ADDERS * PER_ADDER);
    }

    #[test]
    fn value_is_stable_after_completion() {
        let future = CompletionFuture::<String>::new();
        future.complete("done".to_string());

        for _ in 0..3 {
            assert!(future.is_done());
            assert_eq!(future.value().as_deref(), Some("done"));
        }
    }
}
