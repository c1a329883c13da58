use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, trace};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::engine::Transition;
use crate::error::GpioError;
use crate::gpio::{TransitionEvent, UserData, epoch_millis};
use crate::table::PinTable;

const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(1);

pub type Callback = Arc<dyn Fn(TransitionEvent) + Send + Sync>;

struct Subscription {
    callback: Callback,
    user_data: UserData,
}

#[derive(Default)]
struct SubscriptionSlot {
    generation: u64,
    current: Option<Arc<Subscription>>,
}

struct Pending {
    transition: Transition,
    generation: u64,
    timestamp_ms: u64,
}

/// Producer side of the dispatch queue, owned by the monitor.
#[derive(Clone)]
pub struct EventSink {
    slot: Arc<Mutex<SubscriptionSlot>>,
    tx: mpsc::Sender<Pending>,
}

impl EventSink {
    /// Generation of the current subscriber, `None` when nobody listens.
    /// Taken before a scan so events go to whoever subscribed at detection.
    pub fn stamp(&self) -> Option<u64> {
        let slot = self.slot.lock();
        slot.current.as_ref().map(|_| slot.generation)
    }

    /// Queues a transition detected under `generation`, retrying while the
    /// queue is full. Returns false once the dispatcher is gone or `cancel`
    /// is raised.
    pub fn emit(&self, transition: Transition, generation: Option<u64>, cancel: &AtomicBool) -> bool {
        let Some(generation) = generation else {
            trace!("no subscriber, dropping event for pin {}", transition.pin);
            return true;
        };

        let mut pending = Pending {
            transition,
            generation,
            timestamp_ms: epoch_millis(),
        };
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return true,
                Err(TrySendError::Closed(_)) => return false,
                Err(TrySendError::Full(p)) => {
                    if cancel.load(Ordering::Relaxed) {
                        return false;
                    }
                    pending = p;
                    thread::sleep(QUEUE_FULL_BACKOFF);
                }
            }
        }
    }
}

/// Single-subscriber event delivery on a dedicated thread.
pub struct Dispatcher {
    slot: Arc<Mutex<SubscriptionSlot>>,
    tx: Option<mpsc::Sender<Pending>>,
    worker: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn spawn(table: Arc<PinTable>, capacity: usize) -> Result<Self, GpioError> {
        let slot = Arc::new(Mutex::new(SubscriptionSlot::default()));
        let (tx, mut rx) = mpsc::channel::<Pending>(capacity);

        let worker_slot = slot.clone();
        let worker = thread::Builder::new()
            .name("mica-gpio-dispatch".into())
            .spawn(move || {
                while let Some(pending) = rx.blocking_recv() {
                    deliver(&worker_slot, &table, pending);
                }
                debug!("dispatcher stopped");
            })
            .map_err(|e| GpioError::HardwareFault(format!("spawn dispatch thread: {e}")))?;

        Ok(Self {
            slot,
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    pub fn sink(&self) -> Option<EventSink> {
        self.tx.as_ref().map(|tx| EventSink {
            slot: self.slot.clone(),
            tx: tx.clone(),
        })
    }

    /// Replaces the subscription and returns the previous one's user data.
    /// Events queued for the previous subscriber are dropped; a callback
    /// already running is left to finish.
    pub fn subscribe(&self, callback: Callback, user_data: UserData) -> Option<UserData> {
        self.replace(Some(Arc::new(Subscription {
            callback,
            user_data,
        })))
    }

    pub fn unsubscribe(&self) -> Option<UserData> {
        self.replace(None)
    }

    fn replace(&self, next: Option<Arc<Subscription>>) -> Option<UserData> {
        let mut slot = self.slot.lock();
        slot.generation += 1;
        std::mem::replace(&mut slot.current, next).map(|s| s.user_data)
    }

    pub fn pending(&self) -> usize {
        self.tx
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.unsubscribe();
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() == thread::current().id() {
                // dropped from inside a callback; the loop ends on its own
                return;
            }
            let _ = worker.join();
        }
    }
}

fn deliver(slot: &Mutex<SubscriptionSlot>, table: &PinTable, pending: Pending) {
    let Transition { pin, state, epoch } = pending.transition;

    let subscription = {
        let slot = slot.lock();
        if slot.generation != pending.generation {
            trace!("subscription replaced, dropping event for pin {pin}");
            return;
        }
        match &slot.current {
            Some(s) => s.clone(),
            None => return,
        }
    };

    if !table.is_current(pin, epoch) {
        trace!("pin {pin} disarmed, dropping stale event");
        return;
    }

    let event = TransitionEvent {
        pin,
        state,
        user_data: subscription.user_data,
        timestamp_ms: pending.timestamp_ms,
    };
    let callback = &subscription.callback;
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!("subscriber failed on pin {pin} -> {state}: {reason}");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc as std_mpsc;

    use super::*;
    use crate::backend::MockGpioBackend;
    use crate::gpio::State;
    use crate::registers::RegisterAccess;

    fn dispatcher(capacity: usize) -> Dispatcher {
        let registers = RegisterAccess::new(Arc::new(MockGpioBackend::new()), 8);
        let table = PinTable::new(registers).unwrap();
        Dispatcher::spawn(Arc::new(table), capacity).unwrap()
    }

    fn rising(pin: u32) -> Transition {
        Transition {
            pin,
            state: State::High,
            epoch: 0,
        }
    }

    fn forward(tx: std_mpsc::Sender<(usize, u32)>, id: usize) -> Callback {
        Arc::new(move |event: TransitionEvent| {
            let _ = tx.send((id, event.pin));
        })
    }

    #[test]
    fn events_follow_subscriber_current_at_detection() {
        let dispatcher = dispatcher(4);
        let sink = dispatcher.sink().unwrap();
        let cancel = AtomicBool::new(false);
        let (tx, rx) = std_mpsc::channel();

        let unheard = sink.stamp();
        assert_eq!(dispatcher.subscribe(forward(tx.clone(), 1), UserData(1)), None);
        let stale = sink.stamp();
        assert_eq!(dispatcher.subscribe(forward(tx, 2), UserData(2)), Some(UserData(1)));
        let fresh = sink.stamp();

        assert_eq!(unheard, None);
        assert!(sink.emit(rising(0), unheard, &cancel));
        assert!(sink.emit(rising(1), stale, &cancel));
        assert!(sink.emit(rising(2), fresh, &cancel));

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), (2, 2));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(dispatcher.unsubscribe(), Some(UserData(2)));
    }

    #[test]
    fn cancelled_emit_gives_up_on_full_queue() {
        let dispatcher = dispatcher(1);
        let sink = dispatcher.sink().unwrap();
        let (entered_tx, entered) = std_mpsc::channel();
        let (release, released) = std_mpsc::channel::<()>();
        let released = Mutex::new(released);
        dispatcher.subscribe(
            Arc::new(move |_event: TransitionEvent| {
                let _ = entered_tx.send(());
                let _ = released.lock().recv_timeout(Duration::from_secs(2));
            }),
            UserData(0),
        );

        let running = AtomicBool::new(false);
        let stamp = sink.stamp();
        assert!(sink.emit(rising(0), stamp, &running));
        entered.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(sink.emit(rising(1), stamp, &running));

        let cancelled = AtomicBool::new(true);
        assert!(!sink.emit(rising(2), stamp, &cancelled));
        assert_eq!(dispatcher.pending(), 1);

        drop(release);
        drop(sink);
    }
}
