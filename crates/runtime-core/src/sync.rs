//! Process group and barrier synchronization
//!
//! All cooperating processes run the same program in lockstep. A barrier
//! blocks each caller until every process has reached the same tag, and
//! [`Barrier::any`] turns per-process flags into one group-wide decision.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::types::{BarrierState, ProcessIndex};
use crate::{Error, Result};

/// Position of this process within the fixed group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGroup {
    pub process_index: ProcessIndex,
    pub process_count: usize,
}

impl ProcessGroup {
    pub fn new(process_index: ProcessIndex, process_count: usize) -> Result<Self> {
        if process_count == 0 || process_index >= process_count {
            return Err(Error::invalid_config(
                "process_index",
                process_index,
                format!("must be below process_count ({process_count})"),
            ));
        }
        Ok(Self {
            process_index,
            process_count,
        })
    }

    /// A group with a single process
    pub fn single() -> Self {
        Self {
            process_index: 0,
            process_count: 1,
        }
    }

    /// The process that owns shared writes (commit markers, deletions)
    pub fn is_primary(&self) -> bool {
        self.process_index == 0
    }
}

/// Collective synchronization point
#[async_trait]
pub trait Barrier: Send + Sync {
    /// Block until every process has called `wait` with the same tag
    async fn wait(&self, tag: &str) -> Result<()> {
        self.any(tag, false).await.map(|_| ())
    }

    /// Block until every process has arrived at `tag`, then return whether
    /// any of them passed `flag = true`. Every process sees the same answer.
    async fn any(&self, tag: &str, flag: bool) -> Result<bool>;

    /// The group this barrier synchronizes
    fn group(&self) -> ProcessGroup;
}

/// Barrier for a group of one
#[derive(Debug, Default, Clone)]
pub struct LocalBarrier;

#[async_trait]
impl Barrier for LocalBarrier {
    async fn any(&self, tag: &str, flag: bool) -> Result<bool> {
        debug!(tag, flag, "Local barrier passed");
        Ok(flag)
    }

    fn group(&self) -> ProcessGroup {
        ProcessGroup::single()
    }
}

/// Active barrier tracking
struct Slot {
    state: BarrierState,
    raised: bool,
    waiters: Vec<oneshot::Sender<bool>>,
}

struct Shared {
    process_count: usize,
    timeout: Duration,
    slots: DashMap<String, Arc<Mutex<Slot>>>,
}

/// Barrier shared by processes simulated as tasks inside one OS process
#[derive(Clone)]
pub struct InMemoryBarrier {
    shared: Arc<Shared>,
    group: ProcessGroup,
}

impl InMemoryBarrier {
    /// Create one barrier handle per process of the group
    pub fn new_group(process_count: usize, timeout: Duration) -> Vec<InMemoryBarrier> {
        let shared = Arc::new(Shared {
            process_count,
            timeout,
            slots: DashMap::new(),
        });
        (0..process_count)
            .map(|process_index| InMemoryBarrier {
                shared: Arc::clone(&shared),
                group: ProcessGroup {
                    process_index,
                    process_count,
                },
            })
            .collect()
    }
}

#[async_trait]
impl Barrier for InMemoryBarrier {
    async fn any(&self, tag: &str, flag: bool) -> Result<bool> {
        let slot = self
            .shared
            .slots
            .entry(tag.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Slot {
                    state: BarrierState::new(tag.to_string(), self.shared.process_count),
                    raised: false,
                    waiters: Vec::new(),
                }))
            })
            .clone();

        let rx = {
            let mut slot = slot.lock();
            slot.raised |= flag;
            if slot.state.arrive(self.group.process_index) {
                let raised = slot.raised;
                for waiter in slot.waiters.drain(..) {
                    let _ = waiter.send(raised);
                }
                self.shared.slots.remove(tag);
                debug!(tag, process = self.group.process_index, raised, "Barrier released");
                return Ok(raised);
            }
            let (tx, rx) = oneshot::channel();
            slot.waiters.push(tx);
            rx
        };

        match tokio::time::timeout(self.shared.timeout, rx).await {
            Ok(Ok(raised)) => Ok(raised),
            Ok(Err(_)) => Err(Error::ChannelClosed {
                channel: format!("barrier {tag}"),
            }),
            Err(_) => {
                let arrived = slot.lock().state.arrived.len();
                warn!(tag, arrived, "Barrier timed out");
                Err(Error::BarrierTimeout {
                    tag: tag.to_string(),
                    timeout_ms: self.shared.timeout.as_millis() as u64,
                    arrived,
                    expected: self.shared.process_count,
                })
            }
        }
    }

    fn group(&self) -> ProcessGroup {
        self.group
    }
}
