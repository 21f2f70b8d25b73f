use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::OperationKind;
use crate::services::clock::Clock;
use crate::services::lifecycle::{ChangeNotifier, TaskSlot};

/// The single error banner. A newer notice replaces an older one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub id: Uuid,
    pub message: String,
    pub kind: &'static str,
    pub transient: bool,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pulse {
    pub kind: OperationKind,
    pub outcome_id: Uuid,
}

#[derive(Clone)]
pub struct Notices {
    inner: Arc<Inner>,
}

struct Inner {
    current: Mutex<Option<Notice>>,
    pulses: Mutex<BTreeMap<OperationKind, Uuid>>,
    clear_timer: TaskSlot,
    pulse_timers: Mutex<BTreeMap<OperationKind, TaskSlot>>,
    notice_duration: Duration,
    pulse_duration: Duration,
    notifier: ChangeNotifier,
    clock: Arc<dyn Clock>,
}

impl Notices {
    pub fn new(
        notice_duration: Duration,
        pulse_duration: Duration,
        notifier: ChangeNotifier,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                current: Mutex::new(None),
                pulses: Mutex::new(BTreeMap::new()),
                clear_timer: TaskSlot::new(),
                pulse_timers: Mutex::new(BTreeMap::new()),
                notice_duration,
                pulse_duration,
                notifier,
                clock,
            }),
        }
    }

    /// Shows `error`. Transient errors clear themselves after the notice duration.
    pub fn raise(&self, error: &LedgerError) -> Uuid {
        let notice = Notice {
            id: Uuid::new_v4(),
            message: error.to_string(),
            kind: error.kind(),
            transient: error.is_transient(),
            raised_at: self.inner.clock.now(),
        };
        let id = notice.id;
        *self.inner.current.lock() = Some(notice.clone());
        self.inner.clear_timer.clear();

        if notice.transient {
            let weak = Arc::downgrade(&self.inner);
            // deadline counts from the raise, not from the timer task's first poll
            let deadline = tokio::time::Instant::now() + self.inner.notice_duration;
            self.inner.clear_timer.set(tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                if let Some(inner) = weak.upgrade() {
                    inner.clear_if(id);
                }
            }));
        }
        self.inner.notifier.notify();
        id
    }

    pub fn dismiss(&self) {
        self.inner.clear_timer.clear();
        if self.inner.current.lock().take().is_some() {
            self.inner.notifier.notify();
        }
    }

    pub fn current(&self) -> Option<Notice> {
        self.inner.current.lock().clone()
    }

    /// Marks `kind` as just succeeded for the pulse duration.
    pub fn pulse(&self, kind: OperationKind, outcome_id: Uuid) {
        self.inner.pulses.lock().insert(kind, outcome_id);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let deadline = tokio::time::Instant::now() + self.inner.pulse_duration;
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                let removed = {
                    let mut pulses = inner.pulses.lock();
                    match pulses.get(&kind) {
                        Some(current) if *current == outcome_id => pulses.remove(&kind).is_some(),
                        _ => false,
                    }
                };
                if removed {
                    inner.notifier.notify();
                }
            }
        });
        self.inner.pulse_timers.lock().entry(kind).or_default().set(handle);
        self.inner.notifier.notify();
    }

    pub fn pulses(&self) -> Vec<Pulse> {
        self.inner
            .pulses
            .lock()
            .iter()
            .map(|(kind, id)| Pulse {
                kind: *kind,
                outcome_id: *id,
            })
            .collect()
    }

    /// Drops every notice and pulse and aborts their timers.
    pub fn reset(&self) {
        self.inner.clear_timer.clear();
        for slot in self.inner.pulse_timers.lock().values() {
            slot.clear();
        }
        *self.inner.current.lock() = None;
        self.inner.pulses.lock().clear();
        self.inner.notifier.notify();
    }
}

impl Inner {
    fn clear_if(&self, id: Uuid) {
        let cleared = {
            let mut current = self.current.lock();
            match current.as_ref() {
                Some(notice) if notice.id == id => {
                    *current = None;
                    true
                }
                _ => false,
            }
        };
        if cleared {
            self.notifier.notify();
        }
    }
}
