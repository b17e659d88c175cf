//! # Priority Queues
//!
//! The handoff point between the stage stack and the pacer threads. The
//! send side is ten FIFO queues indexed by packet priority (1 = highest);
//! pop takes from the lowest-indexed non-empty queue, giving strict
//! preemption across classes and FIFO order within one. The receive side
//! is a single FIFO filled by the pacer's receive thread and drained by the
//! application.
//!
//! Each direction has its own mutex and every operation holds it O(1).

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::packet::{Packet, PRIORITY_LOWEST};

const CLASS_COUNT: usize = PRIORITY_LOWEST as usize;

pub struct PriorityQueues {
    send: Mutex<[VecDeque<Packet>; CLASS_COUNT]>,
    recv: Mutex<VecDeque<Packet>>,
}

impl PriorityQueues {
    pub fn new() -> Self {
        PriorityQueues {
            send: Mutex::new(std::array::from_fn(|_| VecDeque::new())),
            recv: Mutex::new(VecDeque::new()),
        }
    }

    /// Enqueue an outbound packet into its priority class.
    pub fn push_send(&self, packet: Packet) {
        let class = (packet.priority() as usize).clamp(1, CLASS_COUNT) - 1;
        self.send.lock().unwrap()[class].push_back(packet);
    }

    /// Pop the most urgent outbound packet, if any.
    pub fn pop_send(&self) -> Option<Packet> {
        let mut queues = self.send.lock().unwrap();
        queues.iter_mut().find_map(|q| q.pop_front())
    }

    pub fn send_len(&self) -> usize {
        self.send.lock().unwrap().iter().map(|q| q.len()).sum()
    }

    /// Enqueue an inbound packet for the application.
    pub fn push_recv(&self, packet: Packet) {
        self.recv.lock().unwrap().push_back(packet);
    }

    /// Pop the next inbound packet, if any.
    pub fn pop_recv(&self) -> Option<Packet> {
        self.recv.lock().unwrap().pop_front()
    }

    pub fn recv_len(&self) -> usize {
        self.recv.lock().unwrap().len()
    }
}

impl Default for PriorityQueues {
    fn default() -> Self {
        Self::new()
    }
}
