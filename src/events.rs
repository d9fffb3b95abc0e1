//! Events emitted to the presentation layer
//!
//! Running transfer progress is high volume and only the latest value
//! matters, so it rides a bounded broadcast channel where a slow subscriber
//! skips old updates. Everything else (listings, failures, backend switches
//! and the final progress of each job) is queued per subscriber and never
//! dropped.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::mpsc;

use crate::providers::{BackendSummary, Entry, ErrorKind};
use crate::transfer_pool::{JobId, TransferState};

const PROGRESS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VaultEvent {
    DirectoryListed {
        backend: String,
        path: String,
        entries: Vec<Entry>,
    },
    TransferProgress {
        job_id: JobId,
        bytes_done: u64,
        bytes_total: Option<u64>,
        state: TransferState,
    },
    /// Sent once per failed job
    TransferFailed {
        job_id: JobId,
        error_kind: ErrorKind,
        message: String,
    },
    BackendSwitched {
        backend: BackendSummary,
    },
}

impl VaultEvent {
    /// Superseded by a later event for the same job
    fn is_coalescable(&self) -> bool {
        matches!(self, VaultEvent::TransferProgress { state, .. } if !state.is_terminal())
    }
}

/// Fan-out of [`VaultEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    progress: broadcast::Sender<VaultEvent>,
    notices: Arc<Mutex<Vec<mpsc::UnboundedSender<VaultEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (progress, _) = broadcast::channel(PROGRESS_CAPACITY);
        Self {
            progress,
            notices: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn emit(&self, event: VaultEvent) {
        if event.is_coalescable() {
            // No subscribers is fine
            let _ = self.progress.send(event);
            return;
        }
        self.notices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscribe(&self) -> EventSubscription {
        let (tx, notices) = mpsc::unbounded_channel();
        // Subscribe to both under the lock so no event lands in only one
        let mut senders = self.notices.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        senders.push(tx);
        EventSubscription {
            progress: self.progress.subscribe(),
            progress_open: true,
            notices,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's view of the bus
#[derive(Debug)]
pub struct EventSubscription {
    progress: broadcast::Receiver<VaultEvent>,
    progress_open: bool,
    notices: mpsc::UnboundedReceiver<VaultEvent>,
}

impl EventSubscription {
    /// Next event, or `None` once the bus is gone. Pending progress is
    /// delivered ahead of queued notices so a job's final state comes last.
    pub async fn recv(&mut self) -> Option<VaultEvent> {
        loop {
            tokio::select! {
                biased;
                progress = self.progress.recv(), if self.progress_open => match progress {
                    Ok(event) => return Some(event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("[Events] Subscriber skipped {} progress updates", skipped);
                    }
                    Err(RecvError::Closed) => self.progress_open = false,
                },
                notice = self.notices.recv() => return notice,
            }
        }
    }

    /// Next event if one is ready
    pub fn try_recv(&mut self) -> Option<VaultEvent> {
        loop {
            match self.progress.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::debug!("[Events] Subscriber skipped {} progress updates", skipped);
                }
                Err(_) => break,
            }
        }
        self.notices.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{BackendId, BackendKind};

    #[test]
    fn test_event_json_shape() {
        let event = VaultEvent::TransferFailed {
            job_id: 7,
            error_kind: ErrorKind::ConnectionError,
            message: "reset".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "transfer_failed");
        assert_eq!(json["error_kind"], "connection_error");
        assert_eq!(json["job_id"], 7);

        let switched = VaultEvent::BackendSwitched {
            backend: BackendSummary {
                id: BackendId::new("smb://nas/media"),
                kind: BackendKind::Smb,
                display_name: r"\\nas\media".to_string(),
            },
        };
        let json = serde_json::to_value(&switched).unwrap();
        assert_eq!(json["backend"]["kind"], "smb");
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_events() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit(VaultEvent::TransferProgress {
            job_id: 1,
            bytes_done: 10,
            bytes_total: Some(20),
            state: TransferState::Running,
        });
        assert!(matches!(a.recv().await.unwrap(), VaultEvent::TransferProgress { bytes_done: 10, .. }));
        assert!(matches!(b.recv().await.unwrap(), VaultEvent::TransferProgress { job_id: 1, .. }));
    }

    fn progress(job_id: JobId, bytes_done: u64, state: TransferState) -> VaultEvent {
        VaultEvent::TransferProgress {
            job_id,
            bytes_done,
            bytes_total: None,
            state,
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_keeps_failures_and_final_states() {
        let bus = EventBus::new();
        let mut slow = bus.subscribe();

        bus.emit(VaultEvent::TransferFailed {
            job_id: 1,
            error_kind: ErrorKind::NotFound,
            message: "gone".to_string(),
        });
        bus.emit(progress(1, 0, TransferState::Failed));
        for n in 0..(PROGRESS_CAPACITY as u64 * 6) {
            bus.emit(progress(2, n, TransferState::Running));
        }
        bus.emit(progress(2, 1600, TransferState::Succeeded));

        let mut failed = 0;
        let mut finals = Vec::new();
        let mut running = 0;
        while let Some(event) = slow.try_recv() {
            match event {
                VaultEvent::TransferFailed { job_id, .. } => {
                    assert_eq!(job_id, 1);
                    failed += 1;
                }
                VaultEvent::TransferProgress { job_id, state, .. } if state.is_terminal() => {
                    finals.push((job_id, state));
                }
                VaultEvent::TransferProgress { .. } => running += 1,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(failed, 1);
        assert_eq!(
            finals,
            vec![(1, TransferState::Failed), (2, TransferState::Succeeded)]
        );
        assert!(running <= PROGRESS_CAPACITY);
    }

    #[tokio::test]
    async fn test_recv_ends_when_bus_dropped() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.emit(VaultEvent::TransferFailed {
            job_id: 3,
            error_kind: ErrorKind::ConnectionError,
            message: "reset".to_string(),
        });
        drop(bus);
        assert!(matches!(sub.recv().await, Some(VaultEvent::TransferFailed { job_id: 3, .. })));
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn test_dropped_subscribers_are_forgotten() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        bus.emit(progress(1, 1, TransferState::Cancelled));
        assert_eq!(bus.notices.lock().unwrap().len(), 1);
        drop(kept);
    }
}
