//! Per-key single-flight coordination of fetches.
//!
//! The [`Coordinator`] keeps one [`FetchRecord`] per key that is currently being fetched. The
//! first caller for a key becomes the owner and receives a [`Resolver`]; every caller arriving
//! while the fetch is still running receives a [`RecordHandle`] to wait on instead.
//!
//! Records only live for the duration of the fetch. Resolving a record removes it from the table
//! in the same critical section, so the next request for the key starts a fresh fetch.
//!
//! A successful resolution carries a value of type `T` that every handle receives a clone of. The
//! resolved value lives until the last handle has been dropped or has taken its clone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::error::{FetchError, FetchResult};
use crate::types::FetchKey;

/// The state of an in-flight fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordState<T = ()> {
    Pending,
    Ready(T),
    Failed(FetchError),
}

impl<T> RecordState<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

#[derive(Debug)]
struct FetchRecord<T> {
    key: FetchKey,
    state: watch::Sender<RecordState<T>>,
}

type RecordTable<T> = HashMap<FetchKey, Arc<FetchRecord<T>>>;

fn lock<T>(table: &Mutex<RecordTable<T>>) -> MutexGuard<'_, RecordTable<T>> {
    // The table is consistent after every single operation, so a panic elsewhere can not have
    // left it in a broken state.
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Deduplicates concurrent fetches of the same key.
#[derive(Debug)]
pub struct Coordinator<T = ()> {
    records: Arc<Mutex<RecordTable<T>>>,
}

impl<T> Clone for Coordinator<T> {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
        }
    }
}

impl<T> Default for Coordinator<T> {
    fn default() -> Self {
        Self {
            records: Default::default(),
        }
    }
}

/// The result of [`Coordinator::acquire`].
#[derive(Debug)]
pub enum Acquisition<T = ()> {
    /// The caller is the first one for this key and has to run the fetch.
    Owner(Resolver<T>),
    /// A fetch for this key is already running.
    Waiter(RecordHandle<T>),
}

impl<T> Acquisition<T> {
    pub fn is_owner(&self) -> bool {
        matches!(self, Self::Owner(_))
    }

    /// A handle to wait for the resolution of the record.
    pub fn handle(&self) -> RecordHandle<T> {
        match self {
            Self::Owner(resolver) => resolver.handle(),
            Self::Waiter(handle) => handle.clone(),
        }
    }
}

impl<T> Coordinator<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in `key`.
    ///
    /// Exactly one caller per in-flight fetch is made the [`Owner`](Acquisition::Owner).
    pub fn acquire(&self, key: &FetchKey) -> Acquisition<T> {
        let mut records = lock(&self.records);
        if let Some(record) = records.get(key) {
            return Acquisition::Waiter(RecordHandle::new(record));
        }

        let (state, _) = watch::channel(RecordState::Pending);
        let record = Arc::new(FetchRecord {
            key: key.clone(),
            state,
        });
        records.insert(key.clone(), Arc::clone(&record));
        drop(records);

        tracing::trace!(%key, "Acquired fetch ownership");
        Acquisition::Owner(Resolver {
            record,
            records: Arc::clone(&self.records),
            resolved: false,
        })
    }

    /// The number of fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        lock(&self.records).len()
    }

    /// Whether a fetch for `key` is currently in flight.
    pub fn is_in_flight(&self, key: &FetchKey) -> bool {
        lock(&self.records).contains_key(key)
    }
}

/// Grants the right, and the duty, to resolve a record.
///
/// Dropping an unresolved `Resolver` resolves the record as
/// [`Abandoned`](FetchError::Abandoned), so a crashed or cancelled owner never leaves its key
/// stuck in the table.
#[derive(Debug)]
pub struct Resolver<T = ()> {
    record: Arc<FetchRecord<T>>,
    records: Arc<Mutex<RecordTable<T>>>,
    resolved: bool,
}

impl<T> Resolver<T> {
    pub fn key(&self) -> &FetchKey {
        &self.record.key
    }

    pub fn handle(&self) -> RecordHandle<T> {
        RecordHandle::new(&self.record)
    }

    /// Marks the record `Ready` or `Failed`, removes it, and releases all waiters.
    pub fn resolve(mut self, result: FetchResult<T>) {
        let state = match result {
            Ok(value) => RecordState::Ready(value),
            Err(err) => RecordState::Failed(err),
        };
        self.finish(state);
    }

    fn finish(&mut self, state: RecordState<T>) {
        if self.resolved {
            return;
        }
        self.resolved = true;

        let mut records = lock(&self.records);
        let key = &self.record.key;
        if records
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, &self.record))
        {
            records.remove(key);
        }
        self.record.state.send_replace(state);
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        if !self.resolved {
            tracing::warn!(key = %self.record.key, "Fetch owner went away without a result");
            self.finish(RecordState::Failed(FetchError::Abandoned));
        }
    }
}

/// Observes the resolution of a record.
#[derive(Debug)]
pub struct RecordHandle<T = ()> {
    key: FetchKey,
    state: watch::Receiver<RecordState<T>>,
}

impl<T> Clone for RecordHandle<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            state: self.state.clone(),
        }
    }
}

impl<T> RecordHandle<T> {
    fn new(record: &FetchRecord<T>) -> Self {
        Self {
            key: record.key.clone(),
            state: record.state.subscribe(),
        }
    }

    pub fn key(&self) -> &FetchKey {
        &self.key
    }
}

impl<T: Clone> RecordHandle<T> {
    /// The current state, without waiting.
    pub fn state(&self) -> RecordState<T> {
        self.state.borrow().clone()
    }

    /// Waits until the record left `Pending`.
    ///
    /// Returns the value or the error the owner resolved the record with.
    pub async fn wait(mut self) -> FetchResult<T> {
        let resolved = match self.state.wait_for(|state| !state.is_pending()).await {
            Ok(state) => (*state).clone(),
            Err(_) => RecordState::Failed(FetchError::Abandoned),
        };
        match resolved {
            RecordState::Ready(value) => Ok(value),
            RecordState::Failed(err) => Err(err),
            RecordState::Pending => Err(FetchError::Abandoned),
        }
    }
}
