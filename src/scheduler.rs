//! Single-threaded event scheduling
//!
//! Every callback, timer and readiness notification runs on one thread, one at
//! a time. [`Scheduler`] is the contract the client needs; [`TokioScheduler`]
//! implements it on a current-thread tokio runtime with a [`LocalSet`], so
//! callbacks may capture `Rc` state.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::task::{AbortHandle, LocalSet};
use tokio::time::{Instant, MissedTickBehavior};

/// Shortest period `TokioScheduler::call_every` will run at
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// A scheduled callback that can be cancelled before it runs
pub trait TimerHandle {
    /// Prevent any further invocation; no-op if already fired or cancelled
    fn cancel(&self);
}

/// Event queue contract
///
/// Callbacks never run re-entrantly: a callback scheduled with
/// [`call_now`](Scheduler::call_now) runs after the current one returns.
pub trait Scheduler: Clone + 'static {
    /// Handle returned for delayed and periodic callbacks
    type Handle: TimerHandle;

    /// Run `f` on the next turn of the event loop
    fn call_now<F>(&self, f: F)
    where
        F: FnOnce() + 'static;

    /// Run `f` once after `delay`
    fn call_after<F>(&self, delay: Duration, f: F) -> Self::Handle
    where
        F: FnOnce() + 'static;

    /// Run `f` every `period`, first after one full period
    ///
    /// A zero `period` must not panic; implementations may round it up.
    fn call_every<F>(&self, period: Duration, f: F) -> Self::Handle
    where
        F: FnMut() + 'static;

    /// Current time on the scheduler's clock
    fn now(&self) -> Instant;
}

impl TimerHandle for AbortHandle {
    fn cancel(&self) {
        self.abort();
    }
}

/// Scheduler backed by tokio's `spawn_local`
///
/// Must be used from inside a [`LocalSet`], as set up by [`dispatch_forever`]
/// and [`dispatch_until`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    type Handle = AbortHandle;

    fn call_now<F>(&self, f: F)
    where
        F: FnOnce() + 'static,
    {
        tokio::task::spawn_local(async move { f() });
    }

    fn call_after<F>(&self, delay: Duration, f: F) -> AbortHandle
    where
        F: FnOnce() + 'static,
    {
        tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            f();
        })
        .abort_handle()
    }

    fn call_every<F>(&self, period: Duration, mut f: F) -> AbortHandle
    where
        F: FnMut() + 'static,
    {
        // tokio intervals panic on a zero period
        let period = period.max(MIN_PERIOD);
        tokio::task::spawn_local(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                f();
            }
        })
        .abort_handle()
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Run the event loop until `fut` completes
pub fn dispatch_until<F>(fut: F) -> io::Result<F::Output>
where
    F: Future,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = LocalSet::new();
    Ok(local.block_on(&runtime, fut))
}

/// Run `setup` on the event loop, then dispatch events forever
///
/// Whatever `setup` returns stays alive for as long as the loop runs.
pub fn dispatch_forever<F, T>(setup: F) -> io::Result<()>
where
    F: FnOnce() -> T,
{
    dispatch_until(async move {
        let _guard = setup();
        std::future::pending::<()>().await;
    })
}
