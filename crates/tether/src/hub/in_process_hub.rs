//! Typed async pub/sub between daemon components.
//!
//! Events are a closed enum implementing [`HubEvent`]. Every event names the
//! session it concerns so handlers can subscribe globally or to one session.
//! Delivery is always asynchronous: `emit` enqueues and returns, a dispatcher
//! task fans each event out, and every subscriber drains its own queue on its
//! own task. A subscriber sees events in emission order, and a slow or hung
//! subscriber only delays itself.

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::InProcessHubError;
use super::subscription::Unsubscribe;

/// An event routable by kind and session id.
pub trait HubEvent: Clone + Send + Sync + 'static {
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;

    /// Session the event concerns, used for scoped dispatch.
    fn session_id(&self) -> &str;
}

type Handler<E> = Arc<dyn Fn(E) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Subscription<E> {
    id: u64,
    handler: Handler<E>,
    /// Set for `once` subscriptions; the first delivery claims it.
    once: Option<Arc<AtomicBool>>,
    /// Feeds this subscriber's worker, started on first delivery.
    queue: Arc<OnceLock<mpsc::UnboundedSender<E>>>,
}

impl<E> Clone for Subscription<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            handler: Arc::clone(&self.handler),
            once: self.once.clone(),
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<E: HubEvent> Subscription<E> {
    /// Hand `event` to this subscriber's worker without waiting for it.
    fn deliver(&self, event: E, shutdown: &CancellationToken) {
        if let Some(fired) = &self.once
            && fired.swap(true, Ordering::SeqCst)
        {
            return;
        }
        let queue = self.queue.get_or_init(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_subscriber(
                Arc::clone(&self.handler),
                rx,
                shutdown.clone(),
            ));
            tx
        });
        if queue.send(event).is_err() {
            debug!(subscription = self.id, "subscriber worker gone, dropping event");
        }
    }
}

struct Inner<E: HubEvent> {
    global: DashMap<E::Kind, Vec<Subscription<E>>>,
    scoped: DashMap<E::Kind, HashMap<String, Vec<Subscription<E>>>>,
    next_id: AtomicU64,
    tx: OnceLock<mpsc::UnboundedSender<E>>,
    shutdown: CancellationToken,
}

/// In-process event hub. Cheap to clone; clones share subscribers.
pub struct InProcessHub<E: HubEvent> {
    inner: Arc<Inner<E>>,
}

impl<E: HubEvent> Clone for InProcessHub<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: HubEvent> Default for InProcessHub<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: HubEvent> InProcessHub<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                global: DashMap::new(),
                scoped: DashMap::new(),
                next_id: AtomicU64::new(1),
                tx: OnceLock::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Start the dispatcher. Must run inside a tokio runtime. Calling it again
    /// is a no-op.
    pub fn initialize(&self) -> Result<(), InProcessHubError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(InProcessHubError::Closed);
        }
        if self.inner.tx.get().is_some() {
            return Ok(());
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<E>();
        if self.inner.tx.set(tx).is_err() {
            return Ok(());
        }

        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = rx.recv() => event,
                    _ = shutdown.cancelled() => break,
                };
                let Some(event) = event else { break };
                let Some(inner) = weak.upgrade() else { break };
                for subscription in inner.subscribers_for(&event) {
                    subscription.deliver(event.clone(), &shutdown);
                }
            }
            debug!("in-process hub dispatcher stopped");
        });
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.tx.get().is_some() && !self.inner.shutdown.is_cancelled()
    }

    /// Queue an event for delivery. Never runs handlers inline.
    pub fn emit(&self, event: E) -> Result<(), InProcessHubError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(InProcessHubError::Closed);
        }
        let tx = self.inner.tx.get().ok_or(InProcessHubError::NotInitialized)?;
        tx.send(event).map_err(|_| InProcessHubError::Closed)
    }

    /// Subscribe to `kind`, globally or for one session.
    pub fn on<F, Fut>(&self, kind: E::Kind, session_id: Option<&str>, handler: F) -> Unsubscribe
    where
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribe(id, kind, session_id, boxed_handler(handler), None)
    }

    /// Subscribe one handler to several kinds. Events of all those kinds share
    /// one queue, so the handler sees them in emission order.
    pub fn on_kinds<F, Fut>(
        &self,
        kinds: &[E::Kind],
        session_id: Option<&str>,
        handler: F,
    ) -> Unsubscribe
    where
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let subscription = Subscription {
            id,
            handler: boxed_handler(handler),
            once: None,
            queue: Arc::new(OnceLock::new()),
        };
        let guards: Vec<Unsubscribe> = kinds
            .iter()
            .map(|kind| self.attach(*kind, session_id, subscription.clone()))
            .collect();
        Unsubscribe::new(move || guards.into_iter().for_each(Unsubscribe::unsubscribe))
    }

    /// Like [`on`](Self::on), but the handler runs at most once.
    pub fn once<F, Fut>(&self, kind: E::Kind, session_id: Option<&str>, handler: F) -> Unsubscribe
    where
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let fired = Arc::new(AtomicBool::new(false));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(&self.inner);
        let scope = session_id.map(str::to_string);
        let handler = Arc::new(handler);
        self.subscribe(
            id,
            kind,
            session_id,
            Arc::new(move |event: E| {
                if let Some(inner) = weak.upgrade() {
                    inner.remove(kind, scope.as_deref(), id);
                }
                handler(event).boxed()
            }),
            Some(fired),
        )
    }

    pub fn handler_count(&self, kind: E::Kind) -> usize {
        let global = self.inner.global.get(&kind).map(|v| v.len()).unwrap_or(0);
        let scoped = self
            .inner
            .scoped
            .get(&kind)
            .map(|by_session| by_session.values().map(Vec::len).sum())
            .unwrap_or(0);
        global + scoped
    }

    /// Stop the dispatcher and drop every subscriber. Queued events are discarded.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.global.clear();
        self.inner.scoped.clear();
    }

    fn subscribe(
        &self,
        id: u64,
        kind: E::Kind,
        session_id: Option<&str>,
        handler: Handler<E>,
        once: Option<Arc<AtomicBool>>,
    ) -> Unsubscribe {
        let subscription = Subscription {
            id,
            handler,
            once,
            queue: Arc::new(OnceLock::new()),
        };
        self.attach(kind, session_id, subscription)
    }

    fn attach(
        &self,
        kind: E::Kind,
        session_id: Option<&str>,
        subscription: Subscription<E>,
    ) -> Unsubscribe {
        let id = subscription.id;
        match session_id {
            Some(session_id) => self
                .inner
                .scoped
                .entry(kind)
                .or_default()
                .entry(session_id.to_string())
                .or_default()
                .push(subscription),
            None => self.inner.global.entry(kind).or_default().push(subscription),
        }

        let weak: Weak<Inner<E>> = Arc::downgrade(&self.inner);
        let scope = session_id.map(str::to_string);
        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove(kind, scope.as_deref(), id);
            }
        })
    }
}

impl<E: HubEvent> Inner<E> {
    /// Global subscribers first, then those scoped to the event's session.
    fn subscribers_for(&self, event: &E) -> Vec<Subscription<E>> {
        let kind = event.kind();
        let mut subscribers: Vec<Subscription<E>> = self
            .global
            .get(&kind)
            .map(|subs| subs.clone())
            .unwrap_or_default();
        if let Some(by_session) = self.scoped.get(&kind)
            && let Some(subs) = by_session.get(event.session_id())
        {
            subscribers.extend(subs.iter().cloned());
        }
        subscribers
    }

    fn remove(&self, kind: E::Kind, session_id: Option<&str>, id: u64) {
        match session_id {
            Some(session_id) => {
                if let Some(mut by_session) = self.scoped.get_mut(&kind) {
                    if let Some(subs) = by_session.get_mut(session_id) {
                        subs.retain(|s| s.id != id);
                        if subs.is_empty() {
                            by_session.remove(session_id);
                        }
                    }
                }
                self.scoped.remove_if(&kind, |_, by_session| by_session.is_empty());
            }
            None => {
                if let Some(mut subs) = self.global.get_mut(&kind) {
                    subs.retain(|s| s.id != id);
                }
                self.global.remove_if(&kind, |_, subs| subs.is_empty());
            }
        }
    }
}

/// Run one subscriber's handler over its queue, one event at a time. Exits
/// when the subscription is dropped or the hub closes.
async fn run_subscriber<E: HubEvent>(
    handler: Handler<E>,
    mut rx: mpsc::UnboundedReceiver<E>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = shutdown.cancelled() => break,
        };
        let Some(event) = event else { break };
        let kind = event.kind();
        let outcome = AssertUnwindSafe(handler(event.clone()))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                event = ?kind,
                session_id = %event.session_id(),
                error = %format!("{e:#}"),
                "in-process event handler failed"
            ),
            Err(_) => warn!(
                event = ?kind,
                session_id = %event.session_id(),
                "in-process event handler panicked"
            ),
        }
    }
}

fn boxed_handler<E, F, Fut>(handler: F) -> Handler<E>
where
    E: HubEvent,
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event: E| handler(event).boxed())
}
