use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use foreman_coordination::{
    CoordinationClient,
    CoordinationError,
    NodePath,
    Payload,
    WatchEvent,
};
use parking_lot::RwLock;
use tokio::task::JoinHandle;

const RESUBSCRIBE_BACKOFF: Duration = if cfg!(test) {
    Duration::from_millis(20)
} else {
    Duration::from_millis(500)
};

#[derive(Debug, Clone, PartialEq, Eq)]
/// A change in the tracked set of children.
pub enum TrackerEvent {
    Added { id: String, payload: Payload },
    Removed { id: String },
    Updated { id: String, payload: Payload },
}

type Cache = BTreeMap<String, Payload>;

/// A locally cached view of the children of a node and their payloads.
///
/// The cache is kept eventually consistent with the coordination service.
/// Whenever the change subscription is lost, the children are listed again
/// and the differences to the cache are emitted as events, so missed or
/// batched notifications never lose a change.
pub struct MembershipTracker {
    path: NodePath,
    cache: Arc<RwLock<Cache>>,
    kill_switch: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl MembershipTracker {
    /// Lists the children of `path`, loads their payloads and starts
    /// forwarding changes into `sink`.
    ///
    /// The children present at start up are available through
    /// [MembershipTracker::snapshot] and are not emitted as events.
    pub async fn start<C, E, F>(
        client: Arc<C>,
        path: NodePath,
        sink: flume::Sender<E>,
        map: F,
    ) -> Result<Self, CoordinationError>
    where
        C: CoordinationClient,
        E: Send + 'static,
        F: Fn(TrackerEvent) -> E + Send + Sync + 'static,
    {
        let watch = client.watch_children(&path).await?;

        let cache = Arc::new(RwLock::new(Cache::new()));
        resync(client.as_ref(), &path, &cache, watch.children, |_| {}).await?;

        debug!(
            path = %path,
            num_children = cache.read().len(),
            "Membership tracker started."
        );

        let kill_switch = Arc::new(AtomicBool::new(false));
        let ctx = TrackerContext {
            client,
            path: path.clone(),
            cache: cache.clone(),
            kill_switch: kill_switch.clone(),
        };
        let task = tokio::spawn(track_changes(ctx, watch.events, sink, map));

        Ok(Self {
            path,
            cache,
            kill_switch,
            task,
        })
    }

    #[inline]
    pub fn path(&self) -> &NodePath {
        &self.path
    }

    /// A point in time copy of the tracked children.
    pub fn snapshot(&self) -> Vec<(String, Payload)> {
        self.cache
            .read()
            .iter()
            .map(|(id, payload)| (id.clone(), payload.clone()))
            .collect()
    }

    /// The ids of the tracked children.
    pub fn ids(&self) -> Vec<String> {
        self.cache.read().keys().cloned().collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }

    /// Stops the tracker, no further events are emitted.
    pub fn stop(self) {
        drop(self)
    }
}

impl Drop for MembershipTracker {
    fn drop(&mut self) {
        self.kill_switch.store(true, Ordering::Relaxed);
        self.task.abort();
        debug!(path = %self.path, "Membership tracker stopped.");
    }
}

struct TrackerContext<C> {
    client: Arc<C>,
    path: NodePath,
    cache: Arc<RwLock<Cache>>,
    kill_switch: Arc<AtomicBool>,
}

async fn track_changes<C, E, F>(
    ctx: TrackerContext<C>,
    mut events: flume::Receiver<WatchEvent>,
    sink: flume::Sender<E>,
    map: F,
) where
    C: CoordinationClient,
    F: Fn(TrackerEvent) -> E,
{
    let emit = |event: TrackerEvent| {
        let _ = sink.send(map(event));
    };

    loop {
        if ctx.kill_switch.load(Ordering::Relaxed) || sink.is_disconnected() {
            break;
        }

        let needs_resync = match events.recv_async().await {
            Ok(event) => match handle_watch_event(&ctx, event).await {
                Ok(Some(change)) => {
                    if !ctx.kill_switch.load(Ordering::Relaxed) {
                        emit(change);
                    }
                    false
                },
                Ok(None) => false,
                Err(CoordinationError::SessionExpired) => break,
                Err(e) => {
                    warn!(
                        error = ?e,
                        path = %ctx.path,
                        "Failed to load changed child, re-listing."
                    );
                    true
                },
            },
            Err(_) => {
                debug!(path = %ctx.path, "Change subscription closed, re-listing.");
                true
            },
        };

        if needs_resync {
            match resubscribe(&ctx, &emit).await {
                Some(new_events) => events = new_events,
                None => break,
            }
        }
    }

    debug!(path = %ctx.path, "Membership tracker task exited.");
}

async fn handle_watch_event<C: CoordinationClient>(
    ctx: &TrackerContext<C>,
    event: WatchEvent,
) -> Result<Option<TrackerEvent>, CoordinationError> {
    let id = match event {
        WatchEvent::ChildDeleted(id) => {
            let removed = ctx.cache.write().remove(&id);
            return Ok(removed.map(|_| TrackerEvent::Removed { id }));
        },
        WatchEvent::ChildCreated(id) | WatchEvent::DataChanged(id) => id,
    };

    let child = match ctx.path.join(&id) {
        Ok(child) => child,
        Err(e) => {
            error!(error = ?e, path = %ctx.path, child = %id, "Ignoring malformed child.");
            return Ok(None);
        },
    };

    match ctx.client.get_data(&child).await {
        Ok(payload) => Ok(upsert(&ctx.cache, id, payload)),
        // The deletion will follow as its own notification.
        Err(CoordinationError::NoNode(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Re-establishes the change subscription and catches the cache up.
///
/// Returns `None` if the tracker should stop.
async fn resubscribe<C: CoordinationClient>(
    ctx: &TrackerContext<C>,
    emit: &impl Fn(TrackerEvent),
) -> Option<flume::Receiver<WatchEvent>> {
    loop {
        if ctx.kill_switch.load(Ordering::Relaxed) {
            return None;
        }

        let res = match ctx.client.watch_children(&ctx.path).await {
            Ok(watch) => {
                resync(ctx.client.as_ref(), &ctx.path, &ctx.cache, watch.children, |e| {
                    if !ctx.kill_switch.load(Ordering::Relaxed) {
                        emit(e)
                    }
                })
                .await
                .map(|_| watch.events)
            },
            Err(e) => Err(e),
        };

        match res {
            Ok(events) => {
                info!(path = %ctx.path, "Membership tracker resubscribed.");
                return Some(events);
            },
            Err(CoordinationError::SessionExpired) => return None,
            Err(e) => {
                debug!(error = ?e, path = %ctx.path, "Failed to resubscribe, retrying.");
                tokio::time::sleep(RESUBSCRIBE_BACKOFF).await;
            },
        }
    }
}

/// Aligns the cache with a fresh listing of the children.
async fn resync<C: CoordinationClient + ?Sized>(
    client: &C,
    path: &NodePath,
    cache: &RwLock<Cache>,
    listing: Vec<String>,
    mut on_change: impl FnMut(TrackerEvent),
) -> Result<(), CoordinationError> {
    let listed = listing.into_iter().collect::<BTreeSet<_>>();

    let gone = cache
        .read()
        .keys()
        .filter(|id| !listed.contains(*id))
        .cloned()
        .collect::<Vec<_>>();
    for id in gone {
        if cache.write().remove(&id).is_some() {
            on_change(TrackerEvent::Removed { id });
        }
    }

    for id in listed {
        let child = match path.join(&id) {
            Ok(child) => child,
            Err(e) => {
                error!(error = ?e, path = %path, child = %id, "Ignoring malformed child.");
                continue;
            },
        };

        match client.get_data(&child).await {
            Ok(payload) => {
                if let Some(change) = upsert(cache, id, payload) {
                    on_change(change);
                }
            },
            Err(CoordinationError::NoNode(_)) => {
                if cache.write().remove(&id).is_some() {
                    on_change(TrackerEvent::Removed { id });
                }
            },
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

fn upsert(cache: &RwLock<Cache>, id: String, payload: Payload) -> Option<TrackerEvent> {
    let mut lock = cache.write();
    match lock.insert(id.clone(), payload.clone()) {
        None => Some(TrackerEvent::Added { id, payload }),
        Some(previous) if previous != payload => {
            Some(TrackerEvent::Updated { id, payload })
        },
        Some(_) => None,
    }
}
