//! Observer contracts and the registries dispatching to them.
//!
//! Registration accepts either a type implementing the observer trait or a
//! plain closure with the matching signature; both become an
//! `Arc<dyn Trait>` on the way in, so dispatch never cares which it was.
//!
//! Dispatch order: observers registered with a priority fire first, in
//! ascending priority; observers without one fire afterwards. Ties, and
//! all unprioritized observers, keep registration order.
//!
//! A panicking observer is logged and skipped. It never prevents delivery to
//! the remaining observers and never reaches the code that triggered the event.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use super::info::{JobInfo, Warn, WarnEventCtx};

pub trait ExecutionStateObserver: Send + Sync {
    /// Called after every state change of an instance.
    fn state_update(&self, job_info: &JobInfo);
}

impl<F> ExecutionStateObserver for F
where
    F: Fn(&JobInfo) + Send + Sync,
{
    fn state_update(&self, job_info: &JobInfo) {
        self(job_info)
    }
}

pub trait WarningObserver: Send + Sync {
    fn new_warning(&self, job_info: &JobInfo, warning: &Warn, event_ctx: WarnEventCtx);
}

impl<F> WarningObserver for F
where
    F: Fn(&JobInfo, &Warn, WarnEventCtx) + Send + Sync,
{
    fn new_warning(&self, job_info: &JobInfo, warning: &Warn, event_ctx: WarnEventCtx) {
        self(job_info, warning, event_ctx)
    }
}

pub trait JobOutputObserver: Send + Sync {
    fn output_update(&self, job_info: &JobInfo, output: &str);
}

impl<F> JobOutputObserver for F
where
    F: Fn(&JobInfo, &str) + Send + Sync,
{
    fn output_update(&self, job_info: &JobInfo, output: &str) {
        self(job_info, output)
    }
}

/// Handle returned on registration, used to de-register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct Entry<O: ?Sized> {
    id: ObserverId,
    priority: Option<i32>,
    observer: Arc<O>,
}

impl<O: ?Sized> Entry<O> {
    fn sort_key(&self) -> (bool, i32, u64) {
        (self.priority.is_none(), self.priority.unwrap_or(0), self.id.0)
    }
}

pub struct ObserverRegistry<O: ?Sized> {
    kind: &'static str,
    entries: RwLock<Vec<Entry<O>>>,
    next_id: AtomicU64,
}

impl<O: ?Sized> ObserverRegistry<O> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn add(&self, observer: Arc<O>, priority: Option<i32>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Entry {
            id,
            priority,
            observer,
        };
        let key = entry.sort_key();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let pos = entries.partition_point(|e| e.sort_key() <= key);
        entries.insert(pos, entry);
        id
    }

    pub fn remove(&self, id: ObserverId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Observers in dispatch order.
    pub fn observers(&self) -> Vec<Arc<O>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|e| Arc::clone(&e.observer))
            .collect()
    }

    /// Calls `notify` for every observer. The registry lock is not held while
    /// observers run, so they may register or remove observers themselves.
    pub fn notify(&self, notify: impl Fn(&O)) {
        for observer in self.observers() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| notify(&*observer)));
            if let Err(payload) = result {
                tracing::error!(
                    observer_kind = self.kind,
                    reason = %panic_message(payload.as_ref()),
                    "observer_failed"
                );
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
