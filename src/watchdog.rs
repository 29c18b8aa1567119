//! Blocking-call watchdog for async runtime workers.
//!
//! A `Watchdog` is installed into a tokio runtime builder before the runtime
//! starts. Worker threads of that runtime (and any future wrapped with
//! [`Watchdog::scope`]) form a non-blocking context; instrumented operations
//! from [`crate::blocking`] that run inside such a context are reported
//! through the configured callback. Scoped futures are also timed per poll,
//! so raw std blocking that bypasses the wrappers still shows up as a long
//! poll. Reporting never stops execution.

use crate::blocking::{self, BlockingOperation};
use chrono::{DateTime, Utc};
use futures::future::Either;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Handle};
use tokio::task::JoinHandle;

/// Call site the reporting callback runs inside. Always allow-listed by default.
pub const REPORTER_SITE: &str = "blockwatch::watchdog::report";

/// Polls of a scoped future at or above this duration are reported.
pub const DEFAULT_LONG_POLL_THRESHOLD: Duration = Duration::from_millis(50);

const SELF_TEST_DELAY: Duration = Duration::from_millis(1);

type Callback = Arc<dyn Fn(&BlockingCall) + Send + Sync>;

/// Identity of the thread a blocking call was detected on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadIdentity {
    pub name: String,
    pub id: String,
}

impl ThreadIdentity {
    fn current() -> Self {
        let thread = std::thread::current();
        Self {
            name: thread.name().unwrap_or("<unnamed>").to_string(),
            id: format!("{:?}", thread.id()),
        }
    }
}

impl std::fmt::Display for ThreadIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Thread[{},{}]", self.name, self.id)
    }
}

/// A detected blocking call, handed to the reporting callback.
#[derive(Debug, Clone)]
pub struct BlockingCall {
    pub operation: BlockingOperation,
    pub thread: ThreadIdentity,
    /// Innermost call site entered on this thread, if any.
    pub site: Option<&'static str>,
    pub detected_at: DateTime<Utc>,
}

/// Errors that can occur while installing a watchdog.
#[derive(Debug)]
pub enum WatchdogError {
    /// An allow-list entry is empty or whitespace.
    InvalidSite { site: String },
}

impl std::fmt::Display for WatchdogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchdogError::InvalidSite { site } => {
                write!(f, "invalid allow-list call site {:?}", site)
            }
        }
    }
}

impl std::error::Error for WatchdogError {}

struct Inner {
    allowed: BTreeSet<String>,
    callback: Callback,
    long_poll: Option<Duration>,
    reports: AtomicU64,
}

impl Inner {
    fn allows(&self, sites: &[&'static str]) -> bool {
        sites.iter().any(|site| self.allowed.contains(*site))
    }

    fn report(&self, operation: BlockingOperation, site: Option<&'static str>) {
        let call = BlockingCall {
            operation,
            thread: ThreadIdentity::current(),
            site,
            detected_at: Utc::now(),
        };
        self.reports.fetch_add(1, Ordering::Relaxed);

        let _reporting = ContextGuard::reporting();
        enter_site(REPORTER_SITE, || (self.callback)(&call));
    }
}

/// Handle to an installed watchdog. Cheap to clone.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("allowed", &self.inner.allowed)
            .field("reports", &self.reports())
            .finish()
    }
}

/// Builder for [`Watchdog`].
pub struct WatchdogBuilder {
    allowed: BTreeSet<String>,
    callback: Callback,
    long_poll: Option<Duration>,
}

impl Default for WatchdogBuilder {
    fn default() -> Self {
        Self {
            allowed: BTreeSet::from([REPORTER_SITE.to_string()]),
            callback: Arc::new(log_blocking),
            long_poll: Some(DEFAULT_LONG_POLL_THRESHOLD),
        }
    }
}

impl WatchdogBuilder {
    /// Exempt blocking calls made while `site` is entered.
    pub fn allow_blocking_calls_inside(mut self, site: impl Into<String>) -> Self {
        self.allowed.insert(site.into());
        self
    }

    /// Remove a previously exempted site.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn disallow_blocking_calls_inside(mut self, site: &str) -> Self {
        self.allowed.remove(site);
        self
    }

    /// Replace the reporting callback (default: [`log_blocking`]).
    pub fn blocking_call_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&BlockingCall) + Send + Sync + 'static,
    {
        self.callback = Arc::new(callback);
        self
    }

    /// Report scoped polls that run at least `threshold`; `None` turns timing off.
    pub fn long_poll_threshold(mut self, threshold: Option<Duration>) -> Self {
        self.long_poll = threshold;
        self
    }

    /// Validate the configuration and create the watchdog without touching a runtime.
    pub fn build(self) -> Result<Watchdog, WatchdogError> {
        if let Some(site) = self.allowed.iter().find(|s| s.trim().is_empty()) {
            return Err(WatchdogError::InvalidSite { site: site.clone() });
        }
        Ok(Watchdog {
            inner: Arc::new(Inner {
                allowed: self.allowed,
                callback: self.callback,
                long_poll: self.long_poll,
                reports: AtomicU64::new(0),
            }),
        })
    }

    /// Build the watchdog and register it with the runtime's worker threads.
    ///
    /// Must be called before `runtime.build()`; threads started by the
    /// resulting runtime's worker pool become non-blocking contexts.
    pub fn install(self, runtime: &mut Builder) -> Result<Watchdog, WatchdogError> {
        let watchdog = self.build()?;

        // Park/unpark callbacks only fire on worker threads, never on the
        // blocking pool used by `spawn_blocking`.
        let on_park = Arc::clone(&watchdog.inner);
        let on_unpark = Arc::clone(&watchdog.inner);
        runtime
            .on_thread_park(move || mark_worker(&on_park))
            .on_thread_unpark(move || mark_worker(&on_unpark));

        tracing::info!(
            allowed = ?watchdog.allowed_sites().collect::<Vec<_>>(),
            long_poll = ?watchdog.inner.long_poll,
            "blocking-call watchdog installed"
        );
        Ok(watchdog)
    }
}

impl Watchdog {
    pub fn builder() -> WatchdogBuilder {
        WatchdogBuilder::default()
    }

    /// Wrap a future so that every poll of it runs in this watchdog's context.
    pub fn scope<F: Future>(&self, future: F) -> Scoped<F> {
        Scoped {
            inner: Arc::clone(&self.inner),
            future: Box::pin(future),
        }
    }

    /// Number of blocking calls reported so far.
    pub fn reports(&self) -> u64 {
        self.inner.reports.load(Ordering::Relaxed)
    }

    pub fn allowed_sites(&self) -> impl Iterator<Item = &str> {
        self.inner.allowed.iter().map(String::as_str)
    }

    /// Fire-and-forget check that detection is live.
    ///
    /// Schedules a delayed task on `handle` that deliberately sleeps the
    /// thread, which should produce exactly one report.
    pub fn self_test(&self, handle: &Handle) -> JoinHandle<()> {
        tracing::debug!("scheduling watchdog self-test");
        handle.spawn(self.scope(async {
            tokio::time::sleep(SELF_TEST_DELAY).await;
            blocking::sleep(SELF_TEST_DELAY);
        }))
    }
}

/// Scope `future` to `watchdog` when there is one, otherwise run it as is.
pub fn scope_with<F: Future>(watchdog: Option<&Watchdog>, future: F) -> Either<Scoped<F>, F> {
    match watchdog {
        Some(watchdog) => Either::Left(watchdog.scope(future)),
        None => Either::Right(future),
    }
}

/// Future returned by [`Watchdog::scope`].
pub struct Scoped<F: Future> {
    inner: Arc<Inner>,
    future: Pin<Box<F>>,
}

impl<F: Future> Future for Scoped<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let this = self.get_mut();
        let scope = ContextGuard::scoped(&this.inner);
        let start = Instant::now();
        let poll = this.future.as_mut().poll(cx);
        let elapsed = start.elapsed();

        // Only the outermost scope on a thread times the poll; a poll that
        // already reported or ran exempted code is not reported again.
        let quiet = scope.is_outermost()
            && with_context(|ctx| {
                ctx.poll_reports == 0 && !ctx.poll_excused && ctx.permits == 0 && !ctx.reporting
            })
            .unwrap_or(false);
        drop(scope);

        if quiet && this.inner.long_poll.is_some_and(|limit| elapsed >= limit) {
            this.inner.report(BlockingOperation::LongPoll { elapsed }, None);
        }
        poll
    }
}

/// Default reporter: one diagnostic line plus a backtrace on stderr.
pub fn log_blocking(call: &BlockingCall) {
    tracing::debug!(
        operation = %call.operation,
        thread = %call.thread,
        site = call.site.unwrap_or("-"),
        detected_at = %call.detected_at,
        "blocking call inside non-blocking context"
    );

    let backtrace = std::backtrace::Backtrace::force_capture();
    let message = format!(
        "Blocking Call inside: {} in Thread: {}\n{}",
        call.operation, call.thread, backtrace
    );
    if let Err(e) = blocking::write_stderr(&message) {
        tracing::warn!(error = %e, "failed to write blocking call report");
    }
}

// --- Thread-local context ---

#[derive(Default)]
struct ThreadContext {
    /// Watchdog that owns this thread as a runtime worker.
    worker: Option<Arc<Inner>>,
    /// Watchdog of the innermost scoped future being polled here.
    scoped: Option<Arc<Inner>>,
    sites: Vec<&'static str>,
    permits: u32,
    reporting: bool,
    /// Nesting depth of scoped polls on this thread.
    poll_depth: u32,
    /// Reports issued during the current outermost scoped poll.
    poll_reports: u32,
    /// Set when the current outermost poll entered exempted code.
    poll_excused: bool,
}

thread_local! {
    static CONTEXT: RefCell<ThreadContext> = RefCell::new(ThreadContext::default());
}

fn mark_worker(inner: &Arc<Inner>) {
    let _ = CONTEXT.try_with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        if ctx.worker.is_none() {
            ctx.worker = Some(Arc::clone(inner));
        }
    });
}

/// Report `operation` if the current thread is in a non-blocking context.
///
/// Called by every wrapper in [`crate::blocking`].
pub fn checkpoint(operation: BlockingOperation) {
    let hit = with_context(|ctx| {
        if ctx.reporting || ctx.permits > 0 {
            return None;
        }
        let inner = Arc::clone(ctx.scoped.as_ref().or(ctx.worker.as_ref())?);
        if inner.allows(&ctx.sites) {
            ctx.poll_excused = true;
            return None;
        }
        ctx.poll_reports += 1;
        Some((inner, ctx.sites.last().copied()))
    })
    .flatten();

    if let Some((inner, site)) = hit {
        inner.report(operation, site);
    }
}

/// Run `f` with `site` entered as the current call site.
pub fn enter_site<R>(site: &'static str, f: impl FnOnce() -> R) -> R {
    let _site = ContextGuard::site(site);
    f()
}

/// Run `f` with detection lifted, for code that blocks on purpose.
#[cfg_attr(not(test), allow(dead_code))]
pub fn permit_blocking<R>(f: impl FnOnce() -> R) -> R {
    let _permit = ContextGuard::permit();
    f()
}

/// Restores the thread context on drop, including during unwinding.
enum ContextGuard {
    Scoped {
        previous: Option<Arc<Inner>>,
        outermost: bool,
    },
    Site,
    Permit,
    Reporting(bool),
}

impl ContextGuard {
    fn scoped(inner: &Arc<Inner>) -> Self {
        let entered = with_context(|ctx| {
            let outermost = ctx.poll_depth == 0;
            if outermost {
                ctx.poll_reports = 0;
                ctx.poll_excused = false;
            }
            ctx.poll_depth += 1;
            (ctx.scoped.replace(Arc::clone(inner)), outermost)
        });
        let (previous, outermost) = entered.unwrap_or((None, false));
        ContextGuard::Scoped {
            previous,
            outermost,
        }
    }

    fn is_outermost(&self) -> bool {
        matches!(self, ContextGuard::Scoped { outermost: true, .. })
    }

    fn site(site: &'static str) -> Self {
        with_context(|ctx| {
            ctx.sites.push(site);
            let active = ctx.scoped.as_ref().or(ctx.worker.as_ref());
            if active.is_some_and(|inner| inner.allowed.contains(site)) {
                ctx.poll_excused = true;
            }
        });
        ContextGuard::Site
    }

    fn permit() -> Self {
        with_context(|ctx| {
            ctx.permits += 1;
            ctx.poll_excused = true;
        });
        ContextGuard::Permit
    }

    fn reporting() -> Self {
        let previous = with_context(|ctx| std::mem::replace(&mut ctx.reporting, true));
        ContextGuard::Reporting(previous.unwrap_or(false))
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        match self {
            ContextGuard::Scoped { previous, .. } => {
                let previous = previous.take();
                with_context(|ctx| {
                    ctx.scoped = previous;
                    ctx.poll_depth -= 1;
                });
            }
            ContextGuard::Site => {
                with_context(|ctx| ctx.sites.pop());
            }
            ContextGuard::Permit => {
                with_context(|ctx| ctx.permits -= 1);
            }
            ContextGuard::Reporting(previous) => {
                let previous = *previous;
                with_context(|ctx| ctx.reporting = previous);
            }
        }
    }
}

fn with_context<R>(f: impl FnOnce(&mut ThreadContext) -> R) -> Option<R> {
    CONTEXT.try_with(|ctx| f(&mut ctx.borrow_mut())).ok()
}
