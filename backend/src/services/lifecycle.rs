//! Ordering and lifetime primitives shared by the ledger components.
//!
//! Remote calls cannot be cancelled, so every write that follows an `.await`
//! is checked against a [`Generation`] first. Timers live in a [`TaskSlot`]
//! owned by the component that started them and die with it.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::LedgerError;
use crate::models::OperationKind;

/// Identity tag of an account binding. Results stamped with an older
/// generation are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Generation(u64);

impl Generation {
    pub const NONE: Generation = Generation(0);

    pub fn value(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Default)]
pub struct GenerationCounter {
    current: AtomicU64,
}

impl GenerationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Supersede everything issued so far.
    pub fn advance(&self) -> Generation {
        Generation(self.current.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn current(&self) -> Generation {
        Generation(self.current.load(Ordering::SeqCst))
    }

    pub fn is_current(&self, generation: Generation) -> bool {
        self.current() == generation
    }
}

/// Holds at most one background task; replacing or dropping the slot aborts it.
#[derive(Debug, Default)]
pub struct TaskSlot {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, handle: JoinHandle<()>) {
        if let Some(old) = self.handle.lock().replace(handle) {
            old.abort();
        }
    }

    pub fn clear(&self) {
        if let Some(old) = self.handle.lock().take() {
            old.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}

/// Single-outstanding guard per logical action.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    active: Arc<Mutex<BTreeSet<OperationKind>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` when the action is already running.
    pub fn try_begin(&self, kind: OperationKind) -> Option<FlightGuard> {
        let inserted = self.active.lock().insert(kind);
        inserted.then(|| FlightGuard {
            active: self.active.clone(),
            kind,
        })
    }

    pub fn begin_or_busy(&self, kind: OperationKind) -> Result<FlightGuard, LedgerError> {
        self.try_begin(kind)
            .ok_or_else(|| LedgerError::Busy(kind.as_str().replace('_', " ")))
    }

    pub fn contains(&self, kind: OperationKind) -> bool {
        self.active.lock().contains(&kind)
    }

    pub fn snapshot(&self) -> Vec<OperationKind> {
        self.active.lock().iter().copied().collect()
    }
}

#[derive(Debug)]
pub struct FlightGuard {
    active: Arc<Mutex<BTreeSet<OperationKind>>>,
    kind: OperationKind,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.kind);
    }
}

/// Revision counter bumped on every observable state change.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: Arc<watch::Sender<u64>>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn notify(&self) {
        self.tx.send_modify(|rev| *rev = rev.wrapping_add(1));
    }

    pub fn revision(&self) -> u64 {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

/// Things components report upward without calling into the controller.
#[derive(Debug, Clone)]
pub enum ComponentEvent {
    BackgroundFailure {
        operation: OperationKind,
        error: LedgerError,
    },
}

pub type EventSender = mpsc::UnboundedSender<ComponentEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ComponentEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
