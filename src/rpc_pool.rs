use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::RemoteError;

type CompletionResult = Result<Box<dyn Any + Send>, RemoteError>;

enum Completion {
    /// Plain continuation: resolves with the decoded response or the error.
    Eager(oneshot::Sender<CompletionResult>),
    /// Cancellable-without-error continuation: on failure the sender is
    ///  dropped (the awaiting side resolves to `None` and whatever follows the
    ///  await never sees a value) and the error callback runs instead. Lets
    ///  hot paths skip error plumbing in the normal case.
    Lazy {
        sender: oneshot::Sender<Box<dyn Any + Send>>,
        on_error: Box<dyn FnOnce(RemoteError) + Send>,
    },
}

struct RpcEntry {
    started_at: Instant,
    expected_type: std::any::TypeId,
    expected_type_name: &'static str,
    completion: Completion,
}

impl RpcEntry {
    /// Consumes the entry, firing its continuation exactly once. Entries are
    ///  removed from the map before this runs, so a correlation id can never
    ///  fire twice.
    fn fire(self, result: CompletionResult) {
        match self.completion {
            Completion::Eager(sender) => {
                let _ = sender.send(result);
            }
            Completion::Lazy { sender, on_error } => match result {
                Ok(message) => {
                    let _ = sender.send(message);
                }
                Err(error) => {
                    drop(sender);
                    on_error(error);
                }
            },
        }
    }
}

struct PoolInner {
    next_id: i16,
    entries: FxHashMap<i16, RpcEntry>,
}

/// Per-session bookkeeping for in-flight request/response exchanges:
///  allocates short correlation ids, stores the pending continuations and
///  enforces the timeout.
///
/// `register` runs on the caller's thread while `try_complete` runs on an I/O
///  task, so the map sits behind a mutex. The lock is never held while a
///  continuation fires.
pub struct RpcPool {
    timeout: Duration,
    inner: Mutex<PoolInner>,
}

impl RpcPool {
    pub fn new(timeout: Duration) -> RpcPool {
        RpcPool {
            timeout,
            inner: Mutex::new(PoolInner {
                next_id: 0,
                entries: FxHashMap::default(),
            }),
        }
    }

    /// Allocates a correlation id and registers a continuation expecting a
    ///  response of type `R`.
    pub fn register<R: Send + 'static>(&self) -> (i16, RpcFuture<R>) {
        let (sender, receiver) = oneshot::channel();
        let rpc_id = self.insert(Completion::Eager(sender), std::any::TypeId::of::<R>(), std::any::type_name::<R>());
        (rpc_id, RpcFuture { receiver, _response: PhantomData })
    }

    /// As [RpcPool::register], but with the cancellable continuation form: on
    ///  failure the awaitable resolves to `None` and `on_error` is invoked
    ///  with the cause.
    pub fn register_lazy<R: Send + 'static>(
        &self,
        on_error: impl FnOnce(RemoteError) + Send + 'static,
    ) -> (i16, LazyRpcFuture<R>) {
        let (sender, receiver) = oneshot::channel();
        let completion = Completion::Lazy { sender, on_error: Box::new(on_error) };
        let rpc_id = self.insert(completion, std::any::TypeId::of::<R>(), std::any::type_name::<R>());
        (rpc_id, LazyRpcFuture { receiver, _response: PhantomData })
    }

    fn insert(&self, completion: Completion, expected_type: std::any::TypeId, expected_type_name: &'static str) -> i16 {
        let mut inner = self.inner.lock().unwrap();

        // monotonic modulo i16::MAX, skipping ids still in flight
        let mut candidate = inner.next_id;
        loop {
            candidate = if candidate == i16::MAX { 1 } else { candidate + 1 };
            if !inner.entries.contains_key(&candidate) {
                break;
            }
            assert_ne!(candidate, inner.next_id, "all {} correlation ids are in flight", i16::MAX);
        }
        inner.next_id = candidate;

        inner.entries.insert(candidate, RpcEntry {
            started_at: Instant::now(),
            expected_type,
            expected_type_name,
            completion,
        });
        trace!("registered rpc {} ({} pending)", candidate, inner.entries.len());
        candidate
    }

    /// Atomically removes and fires the entry for `rpc_id`. Returns false for
    ///  an unknown id (late or duplicate response - the caller discards).
    pub fn try_complete(&self, rpc_id: i16, message: Box<dyn Any + Send>) -> bool {
        let entry = self.inner.lock().unwrap().entries.remove(&rpc_id);

        let Some(entry) = entry else {
            return false;
        };

        if message.as_ref().type_id() == entry.expected_type {
            entry.fire(Ok(message));
        }
        else {
            debug!("rpc {} response is not assignable to {}", rpc_id, entry.expected_type_name);
            let expected = entry.expected_type_name;
            entry.fire(Err(RemoteError::TypeMismatch { expected }));
        }
        true
    }

    /// Atomically removes and fires the entry for `rpc_id` with an error.
    pub fn try_fail(&self, rpc_id: i16, error: RemoteError) -> bool {
        let entry = self.inner.lock().unwrap().entries.remove(&rpc_id);

        match entry {
            Some(entry) => {
                entry.fire(Err(error));
                true
            }
            None => false,
        }
    }

    /// Removes all entries older than the timeout, firing each with
    ///  [RemoteError::Timeout].
    pub fn sweep(&self, now: Instant) {
        let expired = {
            let mut inner = self.inner.lock().unwrap();
            let expired_ids = inner.entries.iter()
                .filter(|(_, entry)| now.duration_since(entry.started_at) > self.timeout)
                .map(|(&id, _)| id)
                .collect::<Vec<_>>();
            expired_ids.into_iter()
                .filter_map(|id| inner.entries.remove(&id).map(|e| (id, e)))
                .collect::<Vec<_>>()
        };

        for (rpc_id, entry) in expired {
            debug!("rpc {} timed out after {:?}", rpc_id, self.timeout);
            entry.fire(Err(RemoteError::Timeout));
        }
    }

    /// Drains every pending entry with the given error. Called on session
    ///  teardown.
    pub fn fail_all(&self, error: RemoteError) {
        let drained = {
            let mut inner = self.inner.lock().unwrap();
            inner.entries.drain().collect::<Vec<_>>()
        };

        for (_, entry) in drained {
            entry.fire(Err(error.clone()));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

/// Awaitable handle for a registered RPC. Dropping it does *not* release the
///  correlation id - the slot frees when the response arrives or times out.
pub struct RpcFuture<R> {
    receiver: oneshot::Receiver<CompletionResult>,
    _response: PhantomData<fn() -> R>,
}

impl<R> RpcFuture<R> {
    /// A handle that is already resolved with `error`, for failures detected
    ///  before an entry was ever registered.
    pub(crate) fn failed(error: RemoteError) -> RpcFuture<R> {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(Err(error));
        RpcFuture { receiver, _response: PhantomData }
    }
}

impl<R: Send + 'static> Future for RpcFuture<R> {
    type Output = Result<R, RemoteError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(Ok(message))) => Poll::Ready(
                message.downcast::<R>()
                    .map(|boxed| *boxed)
                    .map_err(|_| RemoteError::TypeMismatch { expected: std::any::type_name::<R>() })
            ),
            Poll::Ready(Ok(Err(error))) => Poll::Ready(Err(error)),
            // the pool never drops an entry without firing it, but a dropped
            //  pool behaves like a disconnect
            Poll::Ready(Err(_)) => Poll::Ready(Err(RemoteError::Disconnected)),
        }
    }
}

/// Awaitable for the cancellable registration form: resolves to `None` when
///  the rpc failed (the error went to the callback instead).
pub struct LazyRpcFuture<R> {
    receiver: oneshot::Receiver<Box<dyn Any + Send>>,
    _response: PhantomData<fn() -> R>,
}

impl<R> LazyRpcFuture<R> {
    /// A handle that is already cancelled, for failures detected before an
    ///  entry was ever registered.
    pub(crate) fn cancelled() -> LazyRpcFuture<R> {
        let (sender, receiver) = oneshot::channel();
        drop(sender);
        LazyRpcFuture { receiver, _response: PhantomData }
    }
}

impl<R: Send + 'static> Future for LazyRpcFuture<R> {
    type Output = Option<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(message)) => Poll::Ready(message.downcast::<R>().ok().map(|boxed| *boxed)),
            Poll::Ready(Err(_)) => Poll::Ready(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Pong(u32);

    #[tokio::test]
    async fn test_complete_resolves_future() {
        let pool = RpcPool::new(Duration::from_secs(30));
        let (rpc_id, future) = pool.register::<Pong>();

        assert!(pool.try_complete(rpc_id, Box::new(Pong(7))));
        assert_eq!(future.await, Ok(Pong(7)));
        assert_eq!(pool.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_complete_checks_response_type() {
        let pool = RpcPool::new(Duration::from_secs(30));
        let (rpc_id, future) = pool.register::<Pong>();

        assert!(pool.try_complete(rpc_id, Box::new("wrong".to_string())));
        assert_eq!(future.await, Err(RemoteError::TypeMismatch { expected: std::any::type_name::<Pong>() }));
    }

    #[tokio::test]
    async fn test_unknown_and_duplicate_ids_are_discarded() {
        let pool = RpcPool::new(Duration::from_secs(30));
        let (rpc_id, future) = pool.register::<Pong>();

        assert!(!pool.try_complete(rpc_id + 1, Box::new(Pong(1))));
        assert!(pool.try_complete(rpc_id, Box::new(Pong(2))));
        assert!(!pool.try_complete(rpc_id, Box::new(Pong(3))));

        assert_eq!(future.await, Ok(Pong(2)));
    }

    #[tokio::test]
    async fn test_fail_resolves_with_error() {
        let pool = RpcPool::new(Duration::from_secs(30));
        let (rpc_id, future) = pool.register::<Pong>();

        assert!(pool.try_fail(rpc_id, RemoteError::Disconnected));
        assert_eq!(future.await, Err(RemoteError::Disconnected));
    }

    #[tokio::test]
    async fn test_sweep_times_out_old_entries() {
        let pool = RpcPool::new(Duration::from_millis(50));
        let (_, old) = pool.register::<Pong>();

        pool.sweep(Instant::now() + Duration::from_millis(100));
        assert_eq!(pool.pending_count(), 0);
        assert_eq!(old.await, Err(RemoteError::Timeout));
    }

    #[tokio::test]
    async fn test_sweep_keeps_fresh_entries() {
        let pool = RpcPool::new(Duration::from_millis(50));
        let (rpc_id, future) = pool.register::<Pong>();

        pool.sweep(Instant::now());
        assert_eq!(pool.pending_count(), 1);

        assert!(pool.try_complete(rpc_id, Box::new(Pong(1))));
        assert_eq!(future.await, Ok(Pong(1)));
    }

    #[tokio::test]
    async fn test_fail_all_drains_everything() {
        let pool = RpcPool::new(Duration::from_secs(30));
        let (_, f1) = pool.register::<Pong>();
        let (_, f2) = pool.register::<Pong>();
        let (_, f3) = pool.register::<Pong>();

        pool.fail_all(RemoteError::Disconnected);
        assert_eq!(pool.pending_count(), 0);
        assert_eq!(f1.await, Err(RemoteError::Disconnected));
        assert_eq!(f2.await, Err(RemoteError::Disconnected));
        assert_eq!(f3.await, Err(RemoteError::Disconnected));
    }

    #[test]
    fn test_id_allocation_skips_live_ids() {
        let pool = RpcPool::new(Duration::from_secs(30));

        let (id1, _f1) = pool.register::<Pong>();
        let (id2, _f2) = pool.register::<Pong>();
        assert_eq!(id1, 1);
        assert_eq!(id2, 2);

        // free id1, keep id2: the allocator continues monotonically
        assert!(pool.try_fail(id1, RemoteError::Disconnected));
        let (id3, _f3) = pool.register::<Pong>();
        assert_eq!(id3, 3);

        // wrap the counter around the end of the id space
        pool.inner.lock().unwrap().next_id = i16::MAX - 1;
        let (id4, _f4) = pool.register::<Pong>();
        let (id5, _f5) = pool.register::<Pong>();
        assert_eq!(id4, i16::MAX);
        // 1 is free again, but 2 and 3 are still pending
        assert_eq!(id5, 1);

        let (id6, _f6) = pool.register::<Pong>();
        assert_eq!(id6, 4);
    }

    #[tokio::test]
    async fn test_lazy_completion_resolves_some() {
        let pool = RpcPool::new(Duration::from_secs(30));
        let errors = Arc::new(AtomicUsize::new(0));

        let errors2 = errors.clone();
        let (rpc_id, future) = pool.register_lazy::<Pong>(move |_| { errors2.fetch_add(1, Ordering::SeqCst); });

        assert!(pool.try_complete(rpc_id, Box::new(Pong(3))));
        assert_eq!(future.await, Some(Pong(3)));
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_lazy_failure_cancels_and_reports() {
        let pool = RpcPool::new(Duration::from_secs(30));
        let reported = Arc::new(Mutex::new(None));

        let reported2 = reported.clone();
        let (rpc_id, future) = pool.register_lazy::<Pong>(move |e| { *reported2.lock().unwrap() = Some(e); });

        assert!(pool.try_fail(rpc_id, RemoteError::Timeout));
        assert_eq!(future.await, None);
        assert_eq!(*reported.lock().unwrap(), Some(RemoteError::Timeout));
    }
}
