use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

use super::BriefcaseEntry;

type Subscriber = Box<dyn Fn(&BriefcaseEntry) + Send + Sync>;

/// Subscriber lists invoked synchronously at the documented transition
/// points. No ordering between subscribers is promised; a panicking
/// subscriber is logged and never aborts the transition.
#[derive(Default)]
pub struct BriefcaseEvents {
    before_close: Mutex<Vec<Subscriber>>,
    after_open: Mutex<Vec<Subscriber>>,
    changeset_applied: Mutex<Vec<Subscriber>>,
    before_version_update: Mutex<Vec<Subscriber>>,
}

impl BriefcaseEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_before_close<F>(&self, subscriber: F)
    where
        F: Fn(&BriefcaseEntry) + Send + Sync + 'static,
    {
        self.before_close.lock().unwrap().push(Box::new(subscriber));
    }

    pub fn on_after_open<F>(&self, subscriber: F)
    where
        F: Fn(&BriefcaseEntry) + Send + Sync + 'static,
    {
        self.after_open.lock().unwrap().push(Box::new(subscriber));
    }

    pub fn on_changeset_applied<F>(&self, subscriber: F)
    where
        F: Fn(&BriefcaseEntry) + Send + Sync + 'static,
    {
        self.changeset_applied
            .lock()
            .unwrap()
            .push(Box::new(subscriber));
    }

    pub fn on_before_version_update<F>(&self, subscriber: F)
    where
        F: Fn(&BriefcaseEntry) + Send + Sync + 'static,
    {
        self.before_version_update
            .lock()
            .unwrap()
            .push(Box::new(subscriber));
    }

    fn fire(list: &Mutex<Vec<Subscriber>>, event: &str, entry: &BriefcaseEntry) {
        let subscribers = list.lock().unwrap();
        for subscriber in subscribers.iter() {
            if catch_unwind(AssertUnwindSafe(|| subscriber(entry))).is_err() {
                log::error!("{} subscriber panicked for briefcase {}", event, entry.key());
            }
        }
    }

    pub(crate) fn fire_before_close(&self, entry: &BriefcaseEntry) {
        Self::fire(&self.before_close, "before-close", entry);
    }

    pub(crate) fn fire_after_open(&self, entry: &BriefcaseEntry) {
        Self::fire(&self.after_open, "after-open", entry);
    }

    pub(crate) fn fire_changeset_applied(&self, entry: &BriefcaseEntry) {
        Self::fire(&self.changeset_applied, "changeset-applied", entry);
    }

    pub(crate) fn fire_before_version_update(&self, entry: &BriefcaseEntry) {
        Self::fire(&self.before_version_update, "before-version-update", entry);
    }
}
