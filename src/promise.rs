//! The read side of a promise. A [`Promise`] can be cloned and handed to
//! any number of consumers; only the [`Deferred`](crate::Deferred) that
//! created it may settle it.
//!
use crate::Error;
use log::trace;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll, Waker};

/// Where a promise is in its life. It moves out of `Pending` once and
/// never again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Pending,
    Fulfilled,
    Rejected,
}

/// What a success continuation hands back.
///
/// Returning `()` gives [`Step::Done`]. Returning a promise gives
/// [`Step::Chain`], and the promise being resolved takes on the outcome of
/// the returned one before any later continuation runs.
pub enum Step<T, E> {
    Done,
    Chain(Promise<T, E>),
}

impl<T, E> From<()> for Step<T, E> {
    fn from(_: ()) -> Self {
        Step::Done
    }
}

impl<T, E> From<Promise<T, E>> for Step<T, E> {
    fn from(promise: Promise<T, E>) -> Self {
        Step::Chain(promise)
    }
}

impl<T, E> fmt::Debug for Step<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Done => f.write_str("Done"),
            Step::Chain(promise) => f.debug_tuple("Chain").field(promise).finish(),
        }
    }
}

pub(crate) type OnSuccess<T, E> = Box<dyn FnOnce(T) -> Step<T, E> + Send>;
pub(crate) type OnFailure<E> = Box<dyn FnOnce(E) + Send>;

/// One `then` registration. Keeping both halves together keeps the success
/// and failure queues aligned; a missing half is a no-op.
pub(crate) struct Reaction<T, E> {
    pub(crate) on_success: Option<OnSuccess<T, E>>,
    pub(crate) on_failure: Option<OnFailure<E>>,
}

pub(crate) enum State<T, E> {
    Pending,
    // The producer has settled but continuations are still draining, or a
    // success continuation chained onto another promise that is pending.
    Settling,
    Fulfilled(T),
    Rejected(E),
}

pub(crate) struct Inner<T, E> {
    pub(crate) state: State<T, E>,
    pub(crate) reactions: VecDeque<Reaction<T, E>>,
    pub(crate) wakers: Vec<Waker>,
    // Promises whose drain is suspended on this one.
    pub(crate) adopters: Vec<Promise<T, E>>,
    pub(crate) abandoned: bool,
}

impl<T, E> Inner<T, E> {
    /// Moves to a terminal state and hands back the wakers to wake once the
    /// lock is released.
    pub(crate) fn settle(&mut self, state: State<T, E>) -> Vec<Waker> {
        debug_assert!(self.reactions.is_empty());
        self.state = state;
        self.adopters.clear();
        std::mem::take(&mut self.wakers)
    }
}

/// A value that may not exist yet.
///
/// # Examples
///
/// ```
/// use oath::{defer, Status};
/// use futures::executor::block_on;
/// use std::thread;
/// let deferred = defer::<String, String>();
/// let promise = deferred.promise();
/// let task1 = thread::spawn(move || block_on(async {
///     println!("Received {:?}", promise.await);
/// }));
/// deferred.resolve("Hi".into());
/// task1.join().expect("The task1 thread has panicked.");
/// assert_eq!(deferred.status(), Status::Fulfilled);
/// ```
pub struct Promise<T, E> {
    inner: Arc<Mutex<Inner<T, E>>>,
}

// Lets a continuation queued on a promise refer back to it without keeping
// it alive.
pub(crate) struct WeakPromise<T, E>(Weak<Mutex<Inner<T, E>>>);

impl<T, E> WeakPromise<T, E> {
    pub(crate) fn upgrade(&self) -> Option<Promise<T, E>> {
        self.0.upgrade().map(|inner| Promise { inner })
    }
}

impl<T, E> Clone for WeakPromise<T, E> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl<T, E> Promise<T, E> {
    pub(crate) fn pending() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: State::Pending,
                reactions: VecDeque::new(),
                wakers: vec![],
                adopters: vec![],
                abandoned: false,
            })),
        }
    }

    // Continuations never run under this lock, so a poisoned guard still
    // holds consistent state.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner<T, E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> WeakPromise<T, E> {
        WeakPromise(Arc::downgrade(&self.inner))
    }

    /// Gives up on a promise that can no longer settle: waiters see
    /// [`Error::Abandoned`] and so does every promise chained onto it.
    pub(crate) fn abandon(&self) {
        let mut pending = vec![self.clone()];
        while let Some(promise) = pending.pop() {
            let (reactions, wakers, adopters) = {
                let mut inner = promise.lock();
                if inner.abandoned || !matches!(inner.state, State::Pending | State::Settling) {
                    continue;
                }
                inner.abandoned = true;
                (
                    std::mem::take(&mut inner.reactions),
                    std::mem::take(&mut inner.wakers),
                    std::mem::take(&mut inner.adopters),
                )
            };
            // Continuations that will never run may own values whose drop
            // needs this lock.
            drop(reactions);
            trace!("promise abandoned, {} chained promise(s) follow", adopters.len());
            for waker in wakers {
                waker.wake()
            }
            pending.extend(adopters);
        }
    }

    pub fn status(&self) -> Status {
        match self.lock().state {
            State::Pending | State::Settling => Status::Pending,
            State::Fulfilled(_) => Status::Fulfilled,
            State::Rejected(_) => Status::Rejected,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status() == Status::Pending
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Registers a pair of continuations and returns this same promise.
    ///
    /// While pending, both are queued behind earlier registrations. Once
    /// settled, the matching one runs right away on the calling thread,
    /// before `then` returns. A promise returned by `on_success` at that
    /// point has nothing left to feed and is ignored.
    ///
    /// # Examples
    ///
    /// ```
    /// use oath::defer;
    /// use std::sync::{Arc, Mutex};
    /// let deferred = defer::<i32, String>();
    /// let log = Arc::new(Mutex::new(vec![]));
    /// let (ok, err) = (log.clone(), log.clone());
    /// deferred.promise().then(
    ///     move |v| ok.lock().unwrap().push(format!("ok {v}")),
    ///     move |e| err.lock().unwrap().push(format!("err {e}")),
    /// );
    /// deferred.reject("💥".into());
    /// assert_eq!(*log.lock().unwrap(), vec!["err 💥".to_string()]);
    /// ```
    pub fn then<S, R, F>(&self, on_success: S, on_failure: F) -> Self
    where
        S: FnOnce(T) -> R + Send + 'static,
        R: Into<Step<T, E>>,
        F: FnOnce(E) + Send + 'static,
    {
        self.register(
            Some(Box::new(move |value| on_success(value).into())),
            Some(Box::new(on_failure)),
        )
    }

    /// `then` without a failure continuation.
    pub fn on_success<S, R>(&self, on_success: S) -> Self
    where
        S: FnOnce(T) -> R + Send + 'static,
        R: Into<Step<T, E>>,
    {
        self.register(Some(Box::new(move |value| on_success(value).into())), None)
    }

    /// `then` without a success continuation.
    pub fn catch<F>(&self, on_failure: F) -> Self
    where
        F: FnOnce(E) + Send + 'static,
    {
        self.register(None, Some(Box::new(on_failure)))
    }

    /// The settled payload, or `None` while pending.
    pub fn value(&self) -> Option<Result<T, E>> {
        match &self.lock().state {
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Rejected(error) => Some(Err(error.clone())),
            State::Pending | State::Settling => None,
        }
    }

    fn register(&self, on_success: Option<OnSuccess<T, E>>, on_failure: Option<OnFailure<E>>) -> Self {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let settled = match &inner.state {
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Rejected(error) => Some(Err(error.clone())),
            State::Pending | State::Settling => None,
        };
        match settled {
            None => {
                inner.reactions.push_back(Reaction {
                    on_success,
                    on_failure,
                });
                trace!("queued continuation #{}", inner.reactions.len());
            }
            Some(Ok(value)) => {
                drop(guard);
                if let Some(on_success) = on_success {
                    trace!("promise already fulfilled, running continuation now");
                    on_success(value);
                }
            }
            Some(Err(error)) => {
                drop(guard);
                if let Some(on_failure) = on_failure {
                    trace!("promise already rejected, running continuation now");
                    on_failure(error);
                }
            }
        }
        self.clone()
    }
}

impl<T, E> Future for Promise<T, E>
where
    T: Clone,
    E: Clone,
{
    type Output = Result<T, Error<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        match &inner.state {
            State::Fulfilled(value) => Poll::Ready(Ok(value.clone())),
            State::Rejected(error) => Poll::Ready(Err(Error::Rejected(error.clone()))),
            State::Pending | State::Settling if inner.abandoned => {
                Poll::Ready(Err(Error::Abandoned))
            }
            State::Pending | State::Settling => {
                if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    inner.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}
