//! Reference-counted sharing of one expensive device context between many renderers.
//!
//! A pool holds at most one live context. It is created lazily by the first
//! [`ContextPool::acquire`] and torn down when the last [`Lease`] is released. Whatever state a
//! user leaves on the context is clobberable: users must rebind everything they need before each
//! frame.

use std::{
    cell::RefCell,
    fmt,
    future::{Future, poll_fn},
    rc::Rc,
    task::{Poll, Waker},
};

use crate::foundation::error::{StackedAlphaError, StackedAlphaResult};

/// Creates the context a [`ContextPool`] shares.
pub trait ContextFactory {
    /// The shared context type.
    type Context;

    /// Create a fresh context. Called lazily, once per pool lifetime (and again after teardown).
    fn create(&self) -> impl Future<Output = StackedAlphaResult<Self::Context>>;

    /// Short name used in logs.
    fn label(&self) -> &'static str {
        "context"
    }
}

struct PoolState<C> {
    context: Option<Rc<RefCell<C>>>,
    // Set while one acquirer is awaiting `ContextFactory::create`; others park in `waiters`.
    creating: bool,
    waiters: Vec<Waker>,
    leases: usize,
    generation: u64,
    created: u64,
    destroyed: u64,
}

struct PoolInner<F: ContextFactory> {
    factory: F,
    state: RefCell<PoolState<F::Context>>,
}

/// An explicitly constructed, cheaply cloneable handle to one shared context slot.
///
/// Pools are plain values: build as many independent pools as needed and pass them to the
/// renderers that should share them.
pub struct ContextPool<F: ContextFactory> {
    inner: Rc<PoolInner<F>>,
}

impl<F: ContextFactory> Clone for ContextPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<F: ContextFactory> fmt::Debug for ContextPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.inner.state.borrow();
        f.debug_struct("ContextPool")
            .field("label", &self.inner.factory.label())
            .field("live", &s.context.is_some())
            .field("leases", &s.leases)
            .field("created", &s.created)
            .field("destroyed", &s.destroyed)
            .finish()
    }
}

impl<F: ContextFactory> ContextPool<F> {
    /// A pool with no context yet.
    pub fn new(factory: F) -> Self {
        Self {
            inner: Rc::new(PoolInner {
                factory,
                state: RefCell::new(PoolState {
                    context: None,
                    creating: false,
                    waiters: Vec::new(),
                    leases: 0,
                    generation: 0,
                    created: 0,
                    destroyed: 0,
                }),
            }),
        }
    }

    /// Take a lease on the shared context, creating it if this is the first live lease.
    ///
    /// Concurrent acquirers share a single creation: while one is awaiting the factory the others
    /// wait for its outcome. Creation failures propagate and leave the pool unchanged.
    pub async fn acquire(&self) -> StackedAlphaResult<Lease<F>> {
        loop {
            {
                let mut s = self.inner.state.borrow_mut();
                if s.context.is_some() {
                    s.leases += 1;
                    return Ok(Lease {
                        pool: self.clone(),
                        generation: s.generation,
                    });
                }
                if !s.creating {
                    s.creating = true;
                    break;
                }
            }
            self.creation_settled().await;
        }

        let guard = CreationGuard { pool: self };
        let ctx = self.inner.factory.create().await;
        drop(guard);

        let ctx = ctx?;
        let mut s = self.inner.state.borrow_mut();
        s.context = Some(Rc::new(RefCell::new(ctx)));
        s.created += 1;
        s.leases += 1;
        tracing::debug!(
            pool = self.inner.factory.label(),
            generation = s.generation,
            "shared context created"
        );
        Ok(Lease {
            pool: self.clone(),
            generation: s.generation,
        })
    }

    /// [`ContextPool::acquire`], blocking the current thread.
    pub fn acquire_blocking(&self) -> StackedAlphaResult<Lease<F>> {
        pollster::block_on(self.acquire())
    }

    /// Give a lease back. Equivalent to dropping it.
    pub fn release(&self, lease: Lease<F>) {
        drop(lease);
    }

    /// Destroy the context immediately, invalidating every outstanding lease. A no-op when no
    /// lease is live.
    pub fn teardown(&self) {
        let mut s = self.inner.state.borrow_mut();
        if s.leases == 0 {
            return;
        }
        tracing::debug!(
            pool = self.inner.factory.label(),
            stale_leases = s.leases,
            "shared context torn down"
        );
        s.leases = 0;
        self.destroy_locked(&mut s);
    }

    /// Number of leases currently holding the context.
    pub fn live_leases(&self) -> usize {
        self.inner.state.borrow().leases
    }

    /// Whether a context currently exists.
    pub fn is_live(&self) -> bool {
        self.inner.state.borrow().context.is_some()
    }

    /// How many contexts this pool has created over its lifetime.
    pub fn contexts_created(&self) -> u64 {
        self.inner.state.borrow().created
    }

    /// How many contexts this pool has destroyed over its lifetime.
    pub fn contexts_destroyed(&self) -> u64 {
        self.inner.state.borrow().destroyed
    }

    /// Whether two handles refer to the same pool.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    fn creation_settled(&self) -> impl Future<Output = ()> + '_ {
        poll_fn(move |cx| {
            let mut s = self.inner.state.borrow_mut();
            if s.creating {
                s.waiters.push(cx.waker().clone());
                Poll::Pending
            } else {
                Poll::Ready(())
            }
        })
    }

    fn finish_creation(&self) {
        let waiters = {
            let mut s = self.inner.state.borrow_mut();
            s.creating = false;
            std::mem::take(&mut s.waiters)
        };
        for waker in waiters {
            waker.wake();
        }
    }

    fn destroy_locked(&self, s: &mut PoolState<F::Context>) {
        if s.context.take().is_some() {
            s.destroyed += 1;
        }
        s.generation += 1;
    }

    fn return_lease(&self, generation: u64) {
        let mut s = self.inner.state.borrow_mut();
        if s.generation != generation || s.leases == 0 {
            return;
        }
        s.leases -= 1;
        if s.leases == 0 {
            self.destroy_locked(&mut s);
            tracing::debug!(
                pool = self.inner.factory.label(),
                "last lease released, shared context destroyed"
            );
        }
    }

    fn context_for(&self, generation: u64) -> StackedAlphaResult<Rc<RefCell<F::Context>>> {
        let s = self.inner.state.borrow();
        match &s.context {
            Some(ctx) if s.generation == generation => Ok(Rc::clone(ctx)),
            _ => Err(StackedAlphaError::context_unavailable(format!(
                "{} lease is stale (pool was torn down)",
                self.inner.factory.label()
            ))),
        }
    }
}

/// Clears the in-flight flag even when the creating future is dropped mid-await.
struct CreationGuard<'a, F: ContextFactory> {
    pool: &'a ContextPool<F>,
}

impl<F: ContextFactory> Drop for CreationGuard<'_, F> {
    fn drop(&mut self) {
        self.pool.finish_creation();
    }
}

/// One user's share of a pooled context. Dropping it releases the share.
pub struct Lease<F: ContextFactory> {
    pool: ContextPool<F>,
    generation: u64,
}

impl<F: ContextFactory> Lease<F> {
    /// Run `f` with exclusive access to the shared context.
    ///
    /// Fails with [`StackedAlphaError::ContextUnavailable`] if the pool was torn down after this
    /// lease was taken.
    pub fn with<R>(&self, f: impl FnOnce(&mut F::Context) -> R) -> StackedAlphaResult<R> {
        let ctx = self.pool.context_for(self.generation)?;
        let mut ctx = ctx.borrow_mut();
        Ok(f(&mut ctx))
    }

    /// Whether the context behind this lease still exists.
    pub fn is_valid(&self) -> bool {
        self.pool.context_for(self.generation).is_ok()
    }

    /// The pool this lease belongs to.
    pub fn pool(&self) -> &ContextPool<F> {
        &self.pool
    }
}

impl<F: ContextFactory> fmt::Debug for Lease<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("generation", &self.generation)
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl<F: ContextFactory> Drop for Lease<F> {
    fn drop(&mut self) {
        self.pool.return_lease(self.generation);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    struct Counting {
        live: Rc<Cell<i32>>,
    }

    impl Drop for Counting {
        fn drop(&mut self) {
            self.live.set(self.live.get() - 1);
        }
    }

    struct CountingFactory {
        live: Rc<Cell<i32>>,
        fail: bool,
    }

    impl ContextFactory for CountingFactory {
        type Context = Counting;

        async fn create(&self) -> StackedAlphaResult<Counting> {
            if self.fail {
                return Err(StackedAlphaError::context_unavailable("no device"));
            }
            self.live.set(self.live.get() + 1);
            Ok(Counting {
                live: Rc::clone(&self.live),
            })
        }
    }

    fn pool() -> (ContextPool<CountingFactory>, Rc<Cell<i32>>) {
        let live = Rc::new(Cell::new(0));
        (
            ContextPool::new(CountingFactory {
                live: Rc::clone(&live),
                fail: false,
            }),
            live,
        )
    }

    #[test]
    fn context_created_lazily_and_destroyed_at_zero() {
        let (pool, live) = pool();
        assert!(!pool.is_live());

        let leases: Vec<_> = (0..5).map(|_| pool.acquire_blocking().unwrap()).collect();
        assert_eq!(live.get(), 1);
        assert_eq!(pool.contexts_created(), 1);
        assert_eq!(pool.live_leases(), 5);

        for lease in leases {
            pool.release(lease);
        }
        assert_eq!(pool.live_leases(), 0);
        assert!(!pool.is_live());
        assert_eq!(live.get(), 0);
    }

    #[test]
    fn partial_release_keeps_context() {
        let (pool, live) = pool();
        let mut leases: Vec<_> = (0..4).map(|_| pool.acquire_blocking().unwrap()).collect();
        leases.truncate(1);
        assert_eq!(pool.live_leases(), 1);
        assert!(pool.is_live());
        assert_eq!(live.get(), 1);
    }

    #[test]
    fn teardown_invalidates_leases_and_ignores_their_drop() {
        let (pool, live) = pool();
        let a = pool.acquire_blocking().unwrap();
        let b = pool.acquire_blocking().unwrap();
        pool.teardown();
        assert_eq!(live.get(), 0);
        assert!(!a.is_valid());
        assert!(a.with(|_| ()).is_err());
        drop(a);
        drop(b);
        assert_eq!(pool.live_leases(), 0);

        let c = pool.acquire_blocking().unwrap();
        assert!(c.is_valid());
        assert_eq!(pool.contexts_created(), 2);
        assert_eq!(pool.live_leases(), 1);
    }

    #[test]
    fn teardown_without_leases_is_noop() {
        let (pool, _) = pool();
        pool.teardown();
        assert_eq!(pool.contexts_destroyed(), 0);
    }

    #[test]
    fn creation_failure_propagates() {
        let pool = ContextPool::new(CountingFactory {
            live: Rc::new(Cell::new(0)),
            fail: true,
        });
        assert!(matches!(
            pool.acquire_blocking(),
            Err(StackedAlphaError::ContextUnavailable(_))
        ));
        assert_eq!(pool.live_leases(), 0);
    }

    #[test]
    fn state_left_on_context_is_visible_to_next_user() {
        struct Slot(u32);
        struct SlotFactory;
        impl ContextFactory for SlotFactory {
            type Context = Slot;
            async fn create(&self) -> StackedAlphaResult<Slot> {
                Ok(Slot(0))
            }
        }
        let pool = ContextPool::new(SlotFactory);
        let a = pool.acquire_blocking().unwrap();
        let b = pool.acquire_blocking().unwrap();
        a.with(|s| s.0 = 7).unwrap();
        assert_eq!(b.with(|s| s.0).unwrap(), 7);
    }

    /// A factory whose `create` suspends once before finishing, like a real device request.
    #[derive(Default)]
    struct YieldingFactory {
        calls: Cell<u32>,
        live: Rc<Cell<i32>>,
        peak: Cell<i32>,
    }

    impl ContextFactory for YieldingFactory {
        type Context = Counting;

        async fn create(&self) -> StackedAlphaResult<Counting> {
            self.calls.set(self.calls.get() + 1);
            let mut yielded = false;
            poll_fn(|cx| {
                if yielded {
                    Poll::Ready(())
                } else {
                    yielded = true;
                    cx.waker().wake_by_ref();
                    Poll::Pending
                }
            })
            .await;
            self.live.set(self.live.get() + 1);
            self.peak.set(self.peak.get().max(self.live.get()));
            Ok(Counting {
                live: Rc::clone(&self.live),
            })
        }
    }

    /// Poll two futures to completion together.
    async fn join<A: Future, B: Future>(a: A, b: B) -> (A::Output, B::Output) {
        let mut a = std::pin::pin!(a);
        let mut b = std::pin::pin!(b);
        let mut out_a = None;
        let mut out_b = None;
        poll_fn(|cx| {
            if out_a.is_none()
                && let Poll::Ready(v) = a.as_mut().poll(cx)
            {
                out_a = Some(v);
            }
            if out_b.is_none()
                && let Poll::Ready(v) = b.as_mut().poll(cx)
            {
                out_b = Some(v);
            }
            if out_a.is_some() && out_b.is_some() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await;
        match (out_a, out_b) {
            (Some(a), Some(b)) => (a, b),
            _ => unreachable!("both futures completed"),
        }
    }

    #[test]
    fn concurrent_acquires_share_one_creation() {
        let pool = ContextPool::new(YieldingFactory::default());
        let (a, b) = pollster::block_on(join(pool.acquire(), pool.acquire()));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(pool.inner.factory.calls.get(), 1);
        assert_eq!(pool.inner.factory.peak.get(), 1);
        assert_eq!(pool.contexts_created(), 1);
        assert_eq!(pool.live_leases(), 2);
        assert!(a.is_valid() && b.is_valid());
    }

    #[test]
    fn dropped_creation_lets_the_next_acquirer_create() {
        let pool = ContextPool::new(YieldingFactory::default());
        {
            let mut pending = std::pin::pin!(pool.acquire());
            let waker = Waker::noop();
            let mut cx = std::task::Context::from_waker(waker);
            assert!(pending.as_mut().poll(&mut cx).is_pending());
        }
        let lease = pool.acquire_blocking().unwrap();
        assert!(lease.is_valid());
        assert_eq!(pool.contexts_created(), 1);
    }
}
