//! The write side of a promise. A [`Deferred`] owns the only right to
//! settle the [`Promise`] it was created with.
//!
use crate::promise::{Promise, Reaction, State, Step, WeakPromise};
use log::{debug, error, trace, warn};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::task::Waker;

type Hook<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Creates a pending promise along with the deferred that settles it.
pub fn defer<T, E>() -> Deferred<T, E> {
    Deferred::new()
}

/// Settles a [`Promise`] exactly once.
///
/// Only the first call to [`resolve`](Deferred::resolve) or
/// [`reject`](Deferred::reject) counts; later calls are ignored. Dropping a
/// deferred that never settled makes anyone awaiting its promise see
/// [`Error::Abandoned`](crate::Error::Abandoned).
pub struct Deferred<T, E> {
    driver: Driver<T, E>,
}

/// Configures a [`Deferred`] before it is created.
pub struct Builder<E> {
    catch_panics: bool,
    unhandled: Option<Hook<E>>,
}

struct Options<E> {
    catch_panics: bool,
    unhandled: Option<Hook<E>>,
}

// Runs the drain. Chained promises hold a clone of this so they can feed
// their outcome back into the promise that adopted them.
struct Driver<T, E> {
    promise: Promise<T, E>,
    options: Arc<Options<E>>,
}

impl<T, E> Clone for Driver<T, E> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
            options: self.options.clone(),
        }
    }
}

impl<E> Default for Builder<E> {
    fn default() -> Self {
        Self {
            catch_panics: true,
            unhandled: None,
        }
    }
}

impl<E> fmt::Debug for Builder<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("catch_panics", &self.catch_panics)
            .field("unhandled", &self.unhandled.is_some())
            .finish()
    }
}

impl<E> Builder<E> {
    /// Whether a panicking continuation is caught and logged (the default)
    /// or unwinds out of `resolve`/`reject`, abandoning the promise and the
    /// rest of its queue.
    pub fn catch_panics(mut self, catch_panics: bool) -> Self {
        self.catch_panics = catch_panics;
        self
    }

    /// Called when a rejection finds no failure continuation to deliver to.
    pub fn on_unhandled_rejection<H>(mut self, hook: H) -> Self
    where
        H: Fn(&E) + Send + Sync + 'static,
    {
        self.unhandled = Some(Arc::new(hook));
        self
    }

    pub fn build<T>(self) -> Deferred<T, E> {
        Deferred {
            driver: Driver {
                promise: Promise::pending(),
                options: Arc::new(Options {
                    catch_panics: self.catch_panics,
                    unhandled: self.unhandled,
                }),
            },
        }
    }
}

impl<T, E> Default for Deferred<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("promise", &self.driver.promise)
            .finish()
    }
}

impl<T, E> Deferred<T, E> {
    pub fn new() -> Self {
        Builder::default().build()
    }

    pub fn builder() -> Builder<E> {
        Builder::default()
    }

    /// The promise this deferred settles. Every call hands out the same one.
    pub fn promise(&self) -> Promise<T, E> {
        self.driver.promise.clone()
    }

    pub fn status(&self) -> crate::Status {
        self.driver.promise.status()
    }
}

impl<T, E> Deferred<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Fulfils the promise with `value`.
    ///
    /// Queued success continuations run in registration order before this
    /// returns. If one of them returns a pending promise, the rest wait for
    /// it and receive whatever it resolves with instead; if it rejects, the
    /// rest receive the rejection.
    ///
    /// # Examples
    ///
    /// ```
    /// use oath::defer;
    /// use std::sync::{Arc, Mutex};
    /// let outer = defer::<i32, String>();
    /// let inner = defer::<i32, String>();
    /// let seen = Arc::new(Mutex::new(vec![]));
    ///
    /// let chained = inner.promise();
    /// outer.promise().on_success(move |_| chained);
    /// let slot = seen.clone();
    /// outer.promise().on_success(move |v| slot.lock().unwrap().push(v));
    ///
    /// outer.resolve(1);
    /// assert!(seen.lock().unwrap().is_empty());
    /// inner.resolve(42);
    /// assert_eq!(*seen.lock().unwrap(), vec![42]);
    /// ```
    pub fn resolve(&self, value: T) {
        if self.driver.begin() {
            self.driver.fulfil(value);
        } else {
            debug!("ignoring resolve, promise already settled");
        }
    }

    /// Rejects the promise with `error`, handing it to every queued failure
    /// continuation in registration order.
    pub fn reject(&self, error: E) {
        if self.driver.begin() {
            self.driver.fail(error);
        } else {
            debug!("ignoring reject, promise already settled");
        }
    }
}

impl<T, E> Driver<T, E> {
    /// Claims the single transition out of `Pending`.
    fn begin(&self) -> bool {
        let mut inner = self.promise.lock();
        if !matches!(inner.state, State::Pending) {
            return false;
        }
        inner.state = State::Settling;
        true
    }

    // Once the chained promise has fed us, its later fate is none of our
    // business.
    fn detach_from(&self, source: &WeakPromise<T, E>) {
        if let Some(source) = source.upgrade() {
            source
                .lock()
                .adopters
                .retain(|adopter| !adopter.ptr_eq(&self.promise));
        }
    }

    fn invoke<R>(&self, continuation: impl FnOnce() -> R) -> Option<R> {
        if !self.options.catch_panics {
            let guard = AbandonOnUnwind(&self.promise);
            let result = continuation();
            std::mem::forget(guard);
            return Some(result);
        }
        match panic::catch_unwind(AssertUnwindSafe(continuation)) {
            Ok(result) => Some(result),
            Err(payload) => {
                error!("continuation panicked: {}", panic_message(&*payload));
                None
            }
        }
    }
}

impl<T, E> Driver<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn fulfil(&self, mut value: T) {
        loop {
            let reaction = {
                let mut inner = self.promise.lock();
                match inner.reactions.pop_front() {
                    Some(reaction) => reaction,
                    None => {
                        let wakers = inner.settle(State::Fulfilled(value));
                        drop(inner);
                        trace!("promise fulfilled");
                        wake_all(wakers);
                        return;
                    }
                }
            };
            let Reaction { on_success, .. } = reaction;
            let Some(on_success) = on_success else {
                continue;
            };
            match self.invoke(|| on_success(value.clone())) {
                Some(Step::Chain(next)) if next.ptr_eq(&self.promise) => {
                    warn!("continuation returned the promise it belongs to, ignoring");
                }
                Some(Step::Chain(next)) => match self.adopt(&next) {
                    Some(Ok(chained)) => value = chained,
                    Some(Err(error)) => return self.fail(error),
                    None => return,
                },
                Some(Step::Done) | None => {}
            }
        }
    }

    fn fail(&self, error: E) {
        let mut delivered = false;
        loop {
            let reaction = {
                let mut inner = self.promise.lock();
                match inner.reactions.pop_front() {
                    Some(reaction) => reaction,
                    None => {
                        let wakers = inner.settle(State::Rejected(error.clone()));
                        drop(inner);
                        trace!("promise rejected");
                        if !delivered {
                            self.unhandled(&error);
                        }
                        wake_all(wakers);
                        return;
                    }
                }
            };
            if let Reaction {
                on_failure: Some(on_failure),
                ..
            } = reaction
            {
                delivered = true;
                self.invoke(|| on_failure(error.clone()));
            }
        }
    }

    /// Hands back the outcome of `next` if it already has one. Otherwise
    /// the drain is suspended until `next` settles and carries on from there.
    fn adopt(&self, next: &Promise<T, E>) -> Option<Result<T, E>> {
        let mut guard = next.lock();
        let inner = &mut *guard;
        match &inner.state {
            State::Fulfilled(value) => return Some(Ok(value.clone())),
            State::Rejected(error) => return Some(Err(error.clone())),
            State::Pending | State::Settling => {}
        }
        if inner.abandoned {
            drop(guard);
            debug!("chained promise was abandoned");
            self.promise.abandon();
            return None;
        }
        trace!("waiting on chained promise");
        let (on_value, on_error) = (self.clone(), self.clone());
        let (source, source_again) = (next.downgrade(), next.downgrade());
        inner.reactions.push_back(Reaction {
            on_success: Some(Box::new(move |value| {
                on_value.detach_from(&source);
                on_value.fulfil(value);
                Step::Done
            })),
            on_failure: Some(Box::new(move |error| {
                on_error.detach_from(&source_again);
                on_error.fail(error)
            })),
        });
        inner.adopters.push(self.promise.clone());
        None
    }

    fn unhandled(&self, error: &E) {
        match &self.options.unhandled {
            Some(hook) => {
                self.invoke(|| hook(error));
            }
            None => debug!("rejection had no failure continuation, dropping it"),
        }
    }
}

impl<T, E> Drop for Deferred<T, E> {
    /// If this deferred never settled, wake anyone awaiting with an error.
    fn drop(&mut self) {
        let pending = matches!(self.driver.promise.lock().state, State::Pending);
        if pending {
            debug!("deferred dropped while pending");
            self.driver.promise.abandon();
        }
    }
}

// Armed around a continuation whose panic is allowed to unwind out of
// `resolve`/`reject`. The drain cannot finish, so the promise is abandoned.
struct AbandonOnUnwind<'a, T, E>(&'a Promise<T, E>);

impl<T, E> Drop for AbandonOnUnwind<'_, T, E> {
    fn drop(&mut self) {
        warn!("continuation panicked, abandoning promise");
        self.0.abandon();
    }
}

fn wake_all(wakers: Vec<Waker>) {
    for waker in wakers {
        waker.wake()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
