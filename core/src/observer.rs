//! A subject/observer abstraction parameterized by dispatch mode (spec §5,
//! §9 "observer subjects"): synchronous (file pipeline) or asynchronous
//! (stream pipeline) notification, behind one interface.
//!
//! Grounded on moonfire-nvr's pattern of a `Subject`-like fan-out (e.g.
//! `db`'s watch senders) generalized here into an explicit two-mode type,
//! since the spec requires both in the same binary.

use std::sync::{Arc, Mutex};

use base::{Error, ErrorKind};
use tokio::task::JoinHandle;
use tracing::warn;

/// An observer callback. Failures are isolated: logged and swallowed, per
/// spec §5 (`ObserverFailure` is never propagated to the notifier).
pub trait Observer<E>: Send + Sync {
    fn notify(&self, event: &E) -> Result<(), Error>;
}

impl<E, F> Observer<E> for F
where
    F: Fn(&E) -> Result<(), Error> + Send + Sync,
{
    fn notify(&self, event: &E) -> Result<(), Error> {
        self(event)
    }
}

/// Synchronous subject: observers run in registration order on the
/// notifying thread. A failing observer never blocks later observers.
pub struct SyncSubject<E> {
    observers: Mutex<Vec<Arc<dyn Observer<E>>>>,
}

impl<E> Default for SyncSubject<E> {
    fn default() -> Self {
        SyncSubject {
            observers: Mutex::new(Vec::new()),
        }
    }
}

impl<E> SyncSubject<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn Observer<E>>) {
        self.observers.lock().unwrap().push(observer);
    }

    pub fn notify(&self, event: &E) {
        let observers = self.observers.lock().unwrap().clone();
        for obs in observers {
            if let Err(e) = obs.notify(event) {
                warn!(error = %e.chain(), kind = ?ErrorKind::ObserverFailure, "observer failed");
            }
        }
    }
}

/// Asynchronous subject: each observer is dispatched as a detached tokio
/// task; `notify` returns immediately. `wait_for_all_observers` is for test
/// synchronization.
pub struct AsyncSubject<E> {
    observers: Mutex<Vec<Arc<dyn Observer<E> + 'static>>>,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl<E: Send + Sync + 'static> Default for AsyncSubject<E> {
    fn default() -> Self {
        AsyncSubject {
            observers: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
        }
    }
}

impl<E: Send + Sync + 'static> AsyncSubject<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn Observer<E> + 'static>) {
        self.observers.lock().unwrap().push(observer);
    }

    /// Dispatches `event` to every registered observer as a detached task.
    /// Returns immediately; does not wait for observers to run.
    pub fn notify(&self, event: E)
    where
        E: Clone,
    {
        let event = Arc::new(event);
        let observers = self.observers.lock().unwrap().clone();
        let mut pending = self.pending.lock().unwrap();
        pending.retain(|h| !h.is_finished());
        for obs in observers {
            let event = event.clone();
            pending.push(tokio::spawn(async move {
                if let Err(e) = obs.notify(&event) {
                    warn!(error = %e.chain(), kind = ?ErrorKind::ObserverFailure, "observer failed");
                }
            }));
        }
    }

    /// Awaits every currently-pending dispatched observer task. Intended
    /// for test synchronization per spec §5.
    pub async fn wait_for_all_observers(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.pending.lock().unwrap());
        for h in handles {
            let _ = h.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn sync_subject_runs_observers_in_order_and_survives_failure() {
        let subject: SyncSubject<u32> = SyncSubject::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let order = order.clone();
            subject.register(Arc::new(move |e: &u32| -> Result<(), Error> {
                order.lock().unwrap().push(*e);
                Err(Error::new(ErrorKind::ObserverFailure, "boom"))
            }));
        }
        {
            let order = order.clone();
            subject.register(Arc::new(move |e: &u32| {
                order.lock().unwrap().push(*e * 10);
                Ok(())
            }));
        }
        subject.notify(&1);
        assert_eq!(*order.lock().unwrap(), vec![1, 10]);
    }

    #[tokio::test]
    async fn async_subject_dispatches_and_can_be_awaited() {
        let subject: AsyncSubject<u32> = AsyncSubject::new();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            subject.register(Arc::new(move |_: &u32| {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        subject.notify(1);
        subject.notify(2);
        subject.wait_for_all_observers().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
