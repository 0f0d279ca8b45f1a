//! Tools for propagating a graceful shutdown signal through the pipeline.
//!
//! Grounded on moonfire-nvr's `base::shutdown`: the receiver can be cloned,
//! checked synchronously, or awaited as a future. Dropping the last
//! `Sender` wakes every outstanding receiver exactly once.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use slab::Slab;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownRequested;

impl std::fmt::Display for ShutdownRequested {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownRequested {}

struct Inner {
    /// `None` once shutdown has been requested.
    wakers: Mutex<Option<Slab<Waker>>>,
}

pub struct Sender(Arc<Inner>);

impl Drop for Sender {
    fn drop(&mut self) {
        let mut wakers = self
            .0
            .wakers
            .lock()
            .unwrap()
            .take()
            .expect("only the single Sender takes the slab");
        for (_, w) in wakers.drain() {
            w.wake();
        }
    }
}

#[derive(Clone)]
pub struct Receiver(Arc<Inner>);

pub struct ReceiverFuture {
    receiver: Arc<Inner>,
    waker_i: Option<usize>,
}

impl Receiver {
    /// Non-blocking check: `Err` iff shutdown has been requested.
    pub fn check(&self) -> Result<(), ShutdownRequested> {
        if self.0.wakers.lock().unwrap().is_none() {
            Err(ShutdownRequested)
        } else {
            Ok(())
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.check().is_err()
    }

    /// Returns a future that resolves once shutdown has been requested.
    pub fn future(&self) -> ReceiverFuture {
        ReceiverFuture {
            receiver: self.0.clone(),
            waker_i: None,
        }
    }
}

impl std::future::Future for ReceiverFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = Pin::into_inner(self);
        let mut l = this.receiver.wakers.lock().unwrap();
        let wakers = match &mut *l {
            None => return Poll::Ready(()),
            Some(w) => w,
        };
        let new_waker = cx.waker();
        match this.waker_i {
            None => this.waker_i = Some(wakers.insert(new_waker.clone())),
            Some(i) => {
                if !new_waker.will_wake(&wakers[i]) {
                    wakers[i] = new_waker.clone();
                }
            }
        }
        Poll::Pending
    }
}

impl Drop for ReceiverFuture {
    fn drop(&mut self) {
        if let Some(i) = self.waker_i {
            if let Some(wakers) = &mut *self.receiver.wakers.lock().unwrap() {
                wakers.remove(i);
            }
        }
    }
}

/// Returns a sender and receiver for graceful shutdown. Dropping the
/// sender (or calling nothing at all — it's just a marker) requests
/// shutdown for every clone of the receiver.
pub fn channel() -> (Sender, Receiver) {
    let inner = Arc::new(Inner {
        wakers: Mutex::new(Some(Slab::new())),
    });
    (Sender(inner.clone()), Receiver(inner))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_reflects_shutdown() {
        let (tx, rx) = channel();
        rx.check().unwrap();
        drop(tx);
        rx.check().unwrap_err();
    }

    #[test]
    fn future_resolves_on_drop() {
        let (tx, rx) = channel();
        let waker = futures::task::noop_waker_ref();
        let mut cx = Context::from_waker(waker);
        let mut f = rx.future();
        assert_eq!(Pin::new(&mut f).poll(&mut cx), Poll::Pending);
        drop(tx);
        assert_eq!(Pin::new(&mut f).poll(&mut cx), Poll::Ready(()));
    }

    #[test]
    fn clones_all_observe_shutdown() {
        let (tx, rx) = channel();
        let rx2 = rx.clone();
        drop(tx);
        assert!(rx.is_shutdown());
        assert!(rx2.is_shutdown());
    }
}
