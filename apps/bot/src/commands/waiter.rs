//! "Wait for the next matching message" continuations.
//!
//! A waiter is keyed by service, source and expression set. At most one is
//! active per key; the first matching message from the same source claims it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::models::{MessageEvent, SourceKey};

/// Flags applied when compiling command and continuation patterns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegexOptions {
    pub case_insensitive: bool,
    pub multi_line: bool,
    pub dot_matches_new_line: bool,
    pub ignore_whitespace: bool,
}

impl RegexOptions {
    pub fn compile(&self, pattern: &str) -> Result<Regex, regex::Error> {
        RegexBuilder::new(pattern)
            .case_insensitive(self.case_insensitive)
            .multi_line(self.multi_line)
            .dot_matches_new_line(self.dot_matches_new_line)
            .ignore_whitespace(self.ignore_whitespace)
            .build()
    }
}

pub type TimeoutCallback = Box<dyn FnOnce() + Send>;

/// Parameters for [`WaitRegistry::register_wait`].
pub struct WaitRequest {
    pub service_id: String,
    pub source: SourceKey,
    pub expressions: Vec<String>,
    pub options: RegexOptions,
    /// `None` waits until a match arrives or the service is disposed.
    pub timeout: Option<Duration>,
    pub on_timeout: Option<TimeoutCallback>,
}

impl WaitRequest {
    pub fn new<I, S>(service_id: impl Into<String>, source: SourceKey, expressions: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            service_id: service_id.into(),
            source,
            expressions: expressions.into_iter().map(Into::into).collect(),
            options: RegexOptions::default(),
            timeout: Some(timeout),
            on_timeout: None,
        }
    }

    pub fn options(mut self, options: RegexOptions) -> Self {
        self.options = options;
        self
    }

    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    pub fn on_timeout(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_timeout = Some(Box::new(callback));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WaitResult {
    Matched(MessageEvent),
    TimedOut,
    /// The service was disposed before or while waiting.
    Cancelled,
    /// An identical waiter was already active, or a pattern did not compile.
    Rejected,
}

impl WaitResult {
    pub fn into_event(self) -> Option<MessageEvent> {
        match self {
            Self::Matched(event) => Some(event),
            _ => None,
        }
    }
}

/// Result of offering a message to the active waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Delivered,
    /// A matching waiter exists but a racing message already claimed it.
    AlreadyClaimed,
    NoWaiter,
}

enum WaitSignal {
    Matched(MessageEvent),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WaitKey {
    service_id: String,
    source: SourceKey,
    expressions: Vec<String>,
}

struct WaitingContext {
    id: u64,
    expressions: Vec<Regex>,
    tx: Mutex<Option<oneshot::Sender<WaitSignal>>>,
    created_at: Instant,
}

impl WaitingContext {
    fn matches(&self, text: &str) -> bool {
        self.expressions.iter().any(|re| re.is_match(text))
    }

    /// Take the result slot. `None` once claimed.
    fn claim(&self) -> Option<oneshot::Sender<WaitSignal>> {
        self.tx.lock().take()
    }
}

/// Removes the waiter when `register_wait` returns or is dropped, unless a
/// newer waiter already replaced it.
struct WaitGuard<'a> {
    waits: &'a DashMap<WaitKey, Arc<WaitingContext>>,
    key: &'a WaitKey,
    id: u64,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.waits.remove_if(self.key, |_, ctx| ctx.id == self.id);
    }
}

pub struct WaitRegistry {
    waits: DashMap<WaitKey, Arc<WaitingContext>>,
    /// Services whose waiters were cancelled; new waits on them end at once.
    disposed: DashSet<String>,
    next_id: AtomicU64,
}

impl WaitRegistry {
    pub fn new() -> Self {
        Self {
            waits: DashMap::new(),
            disposed: DashSet::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Suspend until a matching message arrives from `request.source`, the
    /// timeout elapses, or the service is disposed.
    pub async fn register_wait(&self, request: WaitRequest) -> WaitResult {
        let WaitRequest {
            service_id,
            source,
            expressions,
            options,
            timeout,
            on_timeout,
        } = request;

        let mut compiled = Vec::with_capacity(expressions.len());
        for pattern in &expressions {
            match options.compile(pattern) {
                Ok(re) => compiled.push(re),
                Err(e) => {
                    tracing::warn!(%service_id, %pattern, error = %e, "invalid continuation pattern");
                    return WaitResult::Rejected;
                }
            }
        }

        let key = WaitKey {
            service_id,
            source,
            expressions,
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();
        let ctx = Arc::new(WaitingContext {
            id,
            expressions: compiled,
            tx: Mutex::new(Some(tx)),
            created_at: Instant::now(),
        });

        match self.waits.entry(key.clone()) {
            Entry::Occupied(_) => {
                tracing::debug!(service_id = %key.service_id, user_id = key.source.user_id, "duplicate waiter rejected");
                return WaitResult::Rejected;
            }
            Entry::Vacant(slot) => {
                slot.insert(ctx.clone());
            }
        }
        let _guard = WaitGuard {
            waits: &self.waits,
            key: &key,
            id,
        };
        // Checked after insertion: `cancel_service` marks the service before
        // it scans, so either it sees this waiter or this check sees the mark.
        if self.disposed.contains(&key.service_id) && ctx.claim().is_some() {
            tracing::debug!(service_id = %key.service_id, "wait on disposed service cancelled");
            return WaitResult::Cancelled;
        }

        let signal = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, &mut rx).await.ok(),
            None => Some((&mut rx).await),
        };
        match signal {
            Some(Ok(WaitSignal::Matched(event))) => WaitResult::Matched(event),
            Some(Ok(WaitSignal::Cancelled)) | Some(Err(_)) => WaitResult::Cancelled,
            None => {
                // Close the slot, then pick up a message that won the race.
                drop(ctx.claim());
                if let Ok(WaitSignal::Matched(event)) = rx.try_recv() {
                    return WaitResult::Matched(event);
                }
                tracing::debug!(
                    service_id = %key.service_id,
                    user_id = key.source.user_id,
                    waited_ms = ctx.created_at.elapsed().as_millis() as u64,
                    "waiter timed out"
                );
                if let Some(callback) = on_timeout {
                    callback();
                }
                WaitResult::TimedOut
            }
        }
    }

    /// Offer a message to the waiters of its source.
    pub fn try_resolve(&self, service_id: &str, event: &MessageEvent) -> ResolveOutcome {
        let source = event.source_key();
        let text = event.text();
        let mut candidates: Vec<(WaitKey, Arc<WaitingContext>)> = self
            .waits
            .iter()
            .filter(|entry| entry.key().service_id == service_id && entry.key().source == source)
            .filter(|entry| entry.value().matches(&text))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        candidates.sort_by_key(|(_, ctx)| ctx.id);

        let mut claimed = false;
        for (key, ctx) in candidates {
            let Some(tx) = ctx.claim() else {
                claimed = true;
                continue;
            };
            self.waits.remove_if(&key, |_, current| current.id == ctx.id);
            if tx.send(WaitSignal::Matched(event.clone())).is_ok() {
                return ResolveOutcome::Delivered;
            }
        }
        if claimed {
            ResolveOutcome::AlreadyClaimed
        } else {
            ResolveOutcome::NoWaiter
        }
    }

    /// Release every waiter of `service_id` with [`WaitResult::Cancelled`].
    ///
    /// Later waits on the service are cancelled immediately until
    /// [`reopen_service`](Self::reopen_service) is called.
    pub fn cancel_service(&self, service_id: &str) -> usize {
        self.disposed.insert(service_id.to_string());
        let keys: Vec<WaitKey> = self
            .waits
            .iter()
            .filter(|entry| entry.key().service_id == service_id)
            .map(|entry| entry.key().clone())
            .collect();
        let mut cancelled = 0;
        for key in keys {
            if let Some((_, ctx)) = self.waits.remove(&key) {
                if let Some(tx) = ctx.claim() {
                    let _ = tx.send(WaitSignal::Cancelled);
                    cancelled += 1;
                }
            }
        }
        cancelled
    }

    /// Accept waits for `service_id` again after it was cancelled.
    pub fn reopen_service(&self, service_id: &str) {
        self.disposed.remove(service_id);
    }

    pub fn len(&self) -> usize {
        self.waits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waits.is_empty()
    }
}

impl Default for WaitRegistry {
    fn default() -> Self {
        Self::new()
    }
}
