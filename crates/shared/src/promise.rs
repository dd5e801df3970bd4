//! Single-resolution deferred values.
//!
//! A [`Promise`] moves from pending to either resolved or rejected exactly
//! once. It supports a single continuation (`then`, `and_then`, `fail`,
//! `always`), each of which returns a fresh promise for the next link of the
//! chain. Outcomes realized before a continuation is attached are kept and
//! delivered as soon as one is.
//!
//! Continuations run synchronously on whichever thread realizes the promise,
//! outside of any internal lock. Panics in a continuation are not caught.
//!
//! Promises are also futures: `promise.await` yields the outcome without
//! consuming the continuation slot.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::error::PromiseError;

type Continuation<T, E> = Box<dyn FnOnce(Result<T, E>) + Send>;

enum Slot<T, E> {
    Pending,
    Realized(Result<T, E>),
}

struct Inner<T, E> {
    slot: Slot<T, E>,
    next: Option<Continuation<T, E>>,
    chained: bool,
    wakers: Vec<Waker>,
}

/// A shared handle to a one-shot asynchronous outcome.
pub struct Promise<T, E> {
    inner: Arc<Mutex<Inner<T, E>>>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> std::fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        let state = match &inner.slot {
            Slot::Pending => "pending",
            Slot::Realized(Ok(_)) => "resolved",
            Slot::Realized(Err(_)) => "rejected",
        };
        f.debug_struct("Promise")
            .field("state", &state)
            .field("chained", &inner.chained)
            .finish()
    }
}

impl<T, E> Default for Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                slot: Slot::Pending,
                next: None,
                chained: false,
                wakers: Vec::new(),
            })),
        }
    }

    pub fn resolved(value: T) -> Self {
        Self::realized(Ok(value))
    }

    pub fn rejected(error: E) -> Self {
        Self::realized(Err(error))
    }

    fn realized(outcome: Result<T, E>) -> Self {
        let promise = Self::new();
        promise.inner.lock().slot = Slot::Realized(outcome);
        promise
    }

    #[must_use = "resolving twice is a bug and is reported through this result"]
    pub fn resolve(&self, value: T) -> Result<(), PromiseError> {
        self.settle(Ok(value))
    }

    #[must_use = "rejecting twice is a bug and is reported through this result"]
    pub fn reject(&self, error: E) -> Result<(), PromiseError> {
        self.settle(Err(error))
    }

    /// Realize this promise with whatever `other` eventually realizes with.
    ///
    /// Takes `other`'s continuation slot.
    pub fn resolve_with(&self, other: &Promise<T, E>) -> Result<(), PromiseError> {
        let target = self.clone();
        other.chain(Box::new(move |outcome| target.settle_from_chain(outcome)))
    }

    /// Settle a promise handed out by a continuation. Losing the outcome
    /// because the holder realized it first is a bug, so it panics.
    fn settle_from_chain(&self, outcome: Result<T, E>) {
        if let Err(e) = self.settle(outcome) {
            panic!("chained promise was realized elsewhere: {e}");
        }
    }

    #[must_use]
    pub fn settle(&self, outcome: Result<T, E>) -> Result<(), PromiseError> {
        let (next, wakers) = {
            let mut inner = self.inner.lock();
            if let Slot::Realized(_) = inner.slot {
                return Err(PromiseError::AlreadyRealized);
            }
            inner.slot = Slot::Realized(outcome.clone());
            (inner.next.take(), std::mem::take(&mut inner.wakers))
        };

        for waker in wakers {
            waker.wake();
        }
        if let Some(next) = next {
            next(outcome);
        }
        Ok(())
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.inner.lock().slot, Slot::Pending)
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.inner.lock().slot, Slot::Realized(Ok(_)))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.inner.lock().slot, Slot::Realized(Err(_)))
    }

    pub fn value(&self) -> Option<T> {
        match &self.inner.lock().slot {
            Slot::Realized(Ok(value)) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<E> {
        match &self.inner.lock().slot {
            Slot::Realized(Err(error)) => Some(error.clone()),
            _ => None,
        }
    }

    fn chain(&self, next: Continuation<T, E>) -> Result<(), PromiseError> {
        let mut inner = self.inner.lock();
        if inner.chained {
            return Err(PromiseError::AlreadyChained);
        }
        inner.chained = true;

        let ready = match &inner.slot {
            Slot::Realized(outcome) => outcome.clone(),
            Slot::Pending => {
                inner.next = Some(next);
                return Ok(());
            }
        };
        drop(inner);

        next(ready);
        Ok(())
    }

    /// Map a resolved value. Rejections pass through untouched.
    pub fn then<U, F>(&self, f: F) -> Result<Promise<U, E>, PromiseError>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let next = Promise::new();
        let out = next.clone();
        self.chain(Box::new(move |outcome| {
            out.settle_from_chain(outcome.map(f));
        }))?;
        Ok(next)
    }

    /// Like [`then`](Self::then), but the handler returns a promise that the
    /// chain waits on.
    pub fn and_then<U, F>(&self, f: F) -> Result<Promise<U, E>, PromiseError>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Promise<U, E> + Send + 'static,
    {
        let next = Promise::new();
        let out = next.clone();
        self.chain(Box::new(move |outcome| match outcome {
            Ok(value) => {
                let inner = f(value);
                if let Err(e) = out.resolve_with(&inner) {
                    panic!("and_then handler returned an already chained promise: {e}");
                }
            }
            Err(error) => out.settle_from_chain(Err(error)),
        }))?;
        Ok(next)
    }

    /// Recover from a rejection. Resolved values pass through untouched.
    pub fn fail<F>(&self, f: F) -> Result<Promise<T, E>, PromiseError>
    where
        F: FnOnce(E) -> T + Send + 'static,
    {
        let next = Promise::new();
        let out = next.clone();
        self.chain(Box::new(move |outcome| {
            out.settle_from_chain(Ok(outcome.unwrap_or_else(f)));
        }))?;
        Ok(next)
    }

    /// Run `f` on either outcome.
    pub fn always<U, F>(&self, f: F) -> Result<Promise<U, E>, PromiseError>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Result<T, E>) -> U + Send + 'static,
    {
        let next = Promise::new();
        let out = next.clone();
        self.chain(Box::new(move |outcome| {
            out.settle_from_chain(Ok(f(outcome)));
        }))?;
        Ok(next)
    }

    /// Resolve with every value, in input order, once all inputs resolve.
    /// The first rejection wins and later outcomes are ignored.
    ///
    /// Fails with [`PromiseError::AlreadyChained`] before touching any input
    /// if one of them already has a continuation.
    pub fn when(promises: Vec<Promise<T, E>>) -> Result<Promise<Vec<T>, E>, PromiseError> {
        if promises.iter().any(|p| p.inner.lock().chained) {
            return Err(PromiseError::AlreadyChained);
        }

        let combined = Promise::new();
        if promises.is_empty() {
            let _ = combined.resolve(Vec::new());
            return Ok(combined);
        }

        let slots = Arc::new(Mutex::new((vec![None; promises.len()], promises.len())));
        for (index, promise) in promises.iter().enumerate() {
            let slots = Arc::clone(&slots);
            let combined = combined.clone();
            promise.chain(Box::new(move |outcome| match outcome {
                Ok(value) => {
                    let ready = {
                        let mut guard = slots.lock();
                        let (values, remaining) = &mut *guard;
                        values[index] = Some(value);
                        *remaining -= 1;
                        (*remaining == 0).then(|| values.drain(..).flatten().collect::<Vec<T>>())
                    };
                    if let Some(values) = ready {
                        let _ = combined.resolve(values);
                    }
                }
                Err(error) => {
                    // Later rejections find the combinator already realized.
                    let _ = combined.reject(error);
                }
            }))?;
        }
        Ok(combined)
    }
}

impl<T: Clone, E: Clone> Future for Promise<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.lock();
        match &inner.slot {
            Slot::Realized(outcome) => Poll::Ready(outcome.clone()),
            Slot::Pending => {
                if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    inner.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}
