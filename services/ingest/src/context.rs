//! Per-stream state shared by the rollover workers and the reconciler.
//!
//! The parent record and its dirty flag sit behind one short-held lock that
//! is never kept across catalog I/O. Only parent creation is serialized
//! across an await, so each stream gets exactly one parent.

use crate::record::{attribute, AttributeValue, Record};
use crate::security::Subject;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

#[derive(Debug, Default)]
struct ParentState {
    parent: Option<Record>,
    dirty: bool,
}

#[derive(Debug)]
pub struct StreamContext {
    title: String,
    subject: RwLock<Option<Subject>>,
    state: Mutex<ParentState>,
    creation_permit: AsyncMutex<()>,
}

impl StreamContext {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            subject: RwLock::new(None),
            state: Mutex::new(ParentState::default()),
            creation_permit: AsyncMutex::new(()),
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn subject(&self) -> Option<Subject> {
        self.subject.read().clone()
    }

    /// Record the stream's subject. Only the first call has an effect.
    pub fn set_subject_if_absent(&self, subject: Subject) -> bool {
        let mut current = self.subject.write();
        if current.is_some() {
            return false;
        }
        *current = Some(subject);
        true
    }

    pub fn parent(&self) -> Option<Record> {
        self.state.lock().parent.clone()
    }

    pub fn set_parent(&self, parent: Record) {
        self.state.lock().parent = Some(parent);
    }

    /// Replace the cached parent with a freshly persisted version.
    ///
    /// Updates race: a version persisted from an older snapshot can lack
    /// child links the cache already knows about. Those links are kept and
    /// the parent stays dirty so the next reconciliation persists them.
    pub fn refresh_parent(&self, mut persisted: Record) {
        let mut state = self.state.lock();
        let missing: Vec<AttributeValue> = match &state.parent {
            Some(cached) if cached.id == persisted.id => cached
                .values(attribute::DERIVED)
                .iter()
                .filter(|&id| !persisted.values(attribute::DERIVED).contains(id))
                .cloned()
                .collect(),
            _ => Vec::new(),
        };

        if !missing.is_empty() {
            for id in missing {
                persisted.add_distinct(attribute::DERIVED, id);
            }
            state.dirty = true;
        }
        state.parent = Some(persisted);
    }

    /// Add a child link to the cached parent and return the new snapshot.
    pub fn add_derived(&self, child_id: &str) -> Option<Record> {
        let mut state = self.state.lock();
        let parent = state.parent.as_mut()?;
        parent.add_distinct(attribute::DERIVED, child_id);
        Some(parent.clone())
    }

    pub fn mark_dirty(&self) {
        self.state.lock().dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Clear the dirty flag and return the parent, if the parent is stale.
    ///
    /// The flag stays set when there is no parent to reconcile yet.
    pub fn take_dirty_parent(&self) -> Option<Record> {
        let mut state = self.state.lock();
        if !state.dirty {
            return None;
        }
        let parent = state.parent.clone()?;
        state.dirty = false;
        Some(parent)
    }

    /// Serialize parent creation. Hold only while no parent exists.
    pub async fn lock_creation(&self) -> AsyncMutexGuard<'_, ()> {
        self.creation_permit.lock().await
    }
}
