use std::collections::VecDeque;
use std::net::SocketAddr;

/// Context carried through the completion mechanism: an index into the
/// session's fixed arena of buffer descriptors.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SlotIndex(pub u32);

impl SlotIndex {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// One posted-but-not-completed operation.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Op {
    /// Receive into the slot, recording the datagram's source address into
    /// the paired address-capture slot.
    Recv { addr_slot: u32 },
    /// Send the slot's bytes to `to`.
    Send { to: SocketAddr },
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Pending {
    pub slot: SlotIndex,
    pub op: Op,
}

/// One finished operation as drained from the completion queue.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Completion {
    pub slot: SlotIndex,
    pub op: Op,
    /// Bytes actually transferred. The engines compare this against the fixed
    /// payload size; anything else is an "other" completion.
    pub bytes: usize,
}

/// The single request queue shared by receive and send operations, consumed
/// in FIFO order by the completion pump.
#[derive(Debug, Default)]
pub struct RequestQueue {
    queue: VecDeque<Pending>,
}

impl RequestQueue {
    pub fn new() -> RequestQueue {
        RequestQueue::default()
    }

    pub fn post(&mut self, pending: Pending) {
        self.queue.push_back(pending);
    }

    pub fn pop(&mut self) -> Option<Pending> {
        self.queue.pop_front()
    }

    /// Put an unfulfilled request back at the head so completion order stays
    /// post order.
    pub fn push_front(&mut self, pending: Pending) {
        self.queue.push_front(pending);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Staging queue for finished operations. `notify` arms exactly one wake-up;
/// the arming does not auto-renew, so the engine loop re-arms after every
/// drain (and skips the re-arm after a timed-out wait).
#[derive(Debug)]
pub struct CompletionQueue {
    capacity: usize,
    queue: VecDeque<Completion>,
    armed: bool,
}

impl CompletionQueue {
    pub fn new(capacity: usize) -> CompletionQueue {
        CompletionQueue {
            capacity,
            queue: VecDeque::new(),
            armed: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn notify(&mut self) {
        self.armed = true;
    }

    /// Consume the pending arm, if any. Called once per wait.
    pub fn take_armed(&mut self) -> bool {
        std::mem::take(&mut self.armed)
    }

    pub fn push(&mut self, completion: Completion) {
        debug_assert!(
            self.queue.len() < self.capacity,
            "completion queue overflow - more outstanding operations than queue capacity"
        );
        self.queue.push_back(completion);
    }

    pub fn pop(&mut self) -> Option<Completion> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
