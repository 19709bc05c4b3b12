//! Process group abstraction and the in-process implementation

use candle_core::Tensor;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use uniseq_types::{LaneKind, Result, UniseqError};

/// Collective communication over a fixed set of ranks
///
/// Every primitive takes the lane it is issued from. Implementations keep a
/// separate communicator channel per lane, so an all-to-all on the input
/// lane and one on the output lane may be in flight at the same time.
pub trait ProcessGroup: Send + Sync {
    /// This process's rank in the group
    fn rank(&self) -> usize;

    /// Number of ranks in the group
    fn world_size(&self) -> usize;

    /// Send `inputs[j]` to rank `j`; returns the tensors received from every
    /// rank, indexed by source rank
    fn all_to_all(&self, inputs: Vec<Tensor>, channel: LaneKind) -> Result<Vec<Tensor>>;

    /// Point-to-point send
    fn send(&self, tensor: &Tensor, dst: usize, channel: LaneKind) -> Result<()>;

    /// Point-to-point receive
    fn recv(&self, src: usize, channel: LaneKind) -> Result<Tensor>;

    /// Check if this is rank 0
    fn is_master(&self) -> bool {
        self.rank() == 0
    }
}

type MailKey = (usize, usize, LaneKind);

struct Mailbox {
    queues: Mutex<HashMap<MailKey, VecDeque<Tensor>>>,
    arrived: Condvar,
}

/// Process group whose ranks are threads of the current process
///
/// Messages travel through a shared mailbox with one FIFO per
/// `(source, destination, channel)`, so matching order follows issue order
/// on each lane.
#[derive(Clone)]
pub struct LocalProcessGroup {
    rank: usize,
    world_size: usize,
    mailbox: Arc<Mailbox>,
    recv_timeout: Option<Duration>,
}

impl LocalProcessGroup {
    /// Create handles for every rank of a new group
    pub fn new_group(world_size: usize) -> Result<Vec<Self>> {
        if world_size == 0 {
            return Err(UniseqError::config("process group needs at least one rank"));
        }
        let mailbox = Arc::new(Mailbox {
            queues: Mutex::new(HashMap::new()),
            arrived: Condvar::new(),
        });
        debug!("Created local process group of {} ranks", world_size);
        Ok((0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                mailbox: Arc::clone(&mailbox),
                recv_timeout: None,
            })
            .collect())
    }

    /// Single-rank group
    pub fn solo() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            mailbox: Arc::new(Mailbox {
                queues: Mutex::new(HashMap::new()),
                arrived: Condvar::new(),
            }),
            recv_timeout: None,
        }
    }

    /// Fail receives that wait longer than `timeout` instead of stalling
    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = Some(timeout);
        self
    }

    fn check_peer(&self, peer: usize) -> Result<()> {
        if peer >= self.world_size {
            return Err(UniseqError::collective(format!(
                "peer rank {} outside group of {}",
                peer, self.world_size
            )));
        }
        Ok(())
    }

    fn post(&self, tensor: Tensor, dst: usize, channel: LaneKind) {
        let mut queues = self.mailbox.queues.lock();
        queues
            .entry((self.rank, dst, channel))
            .or_default()
            .push_back(tensor);
        self.mailbox.arrived.notify_all();
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_to_all(&self, inputs: Vec<Tensor>, channel: LaneKind) -> Result<Vec<Tensor>> {
        if inputs.len() != self.world_size {
            return Err(UniseqError::collective(format!(
                "all_to_all expects {} inputs, got {}",
                self.world_size,
                inputs.len()
            )));
        }

        let mut own = None;
        for (dst, tensor) in inputs.into_iter().enumerate() {
            if dst == self.rank {
                own = Some(tensor);
            } else {
                self.post(tensor, dst, channel);
            }
        }

        let mut received = Vec::with_capacity(self.world_size);
        for src in 0..self.world_size {
            if src == self.rank {
                received.push(
                    own.take()
                        .ok_or_else(|| UniseqError::internal("own all_to_all part missing"))?,
                );
            } else {
                received.push(self.recv(src, channel)?);
            }
        }
        trace!("Rank {} finished all_to_all on {}", self.rank, channel);
        Ok(received)
    }

    fn send(&self, tensor: &Tensor, dst: usize, channel: LaneKind) -> Result<()> {
        self.check_peer(dst)?;
        self.post(tensor.clone(), dst, channel);
        Ok(())
    }

    fn recv(&self, src: usize, channel: LaneKind) -> Result<Tensor> {
        self.check_peer(src)?;
        let key = (src, self.rank, channel);
        let mut queues = self.mailbox.queues.lock();
        loop {
            if let Some(tensor) = queues.get_mut(&key).and_then(|q| q.pop_front()) {
                return Ok(tensor);
            }
            match self.recv_timeout {
                Some(timeout) => {
                    if self.mailbox.arrived.wait_for(&mut queues, timeout).timed_out() {
                        return Err(UniseqError::collective(format!(
                            "rank {} timed out receiving from rank {} on {}",
                            self.rank, src, channel
                        )));
                    }
                }
                None => self.mailbox.arrived.wait(&mut queues),
            }
        }
    }
}
