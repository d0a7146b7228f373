pub mod arena;
pub mod completion;
pub mod socket;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use anyhow::Context;
use tracing::{debug, info};
use crate::config::BenchConfig;
use crate::session::arena::{BufDescriptor, BufferArena, RegionId};
use crate::session::completion::{Completion, CompletionQueue, Op, Pending, RequestQueue, SlotIndex};
use crate::session::socket::CompletionSocket;
use crate::stats::GroupStatsMap;

/// Upper bound on completions taken out of the queue per wake-up.
pub const MAX_COMPLETION_BATCH: usize = 1000;

/// Run timing anchored to a base instant so start/stop marks can live in
/// atomics and be moved from any thread without locking.
pub struct Timing {
    base: Instant,
    start_ns: AtomicU64,
    stop_ns: AtomicU64,
}

impl Timing {
    fn new() -> Timing {
        Timing {
            base: Instant::now(),
            start_ns: AtomicU64::new(0),
            stop_ns: AtomicU64::new(0),
        }
    }

    pub fn set_start(&self) {
        self.start_ns.store(self.base.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn set_stop(&self) {
        self.stop_ns.store(self.base.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ns() / 1_000_000
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.elapsed_ns() / 1_000_000_000
    }

    fn elapsed_ns(&self) -> u64 {
        let start = self.start_ns.load(Ordering::Relaxed);
        let stop = self.stop_ns.load(Ordering::Relaxed);
        stop.saturating_sub(start)
    }
}

/// State shared between the I/O thread and the background worker: the stats
/// map, the total-packet counter the stop predicate watches, run timing, and
/// the external shutdown flag.
pub struct Shared {
    pub stats: GroupStatsMap,
    pub total_packets: AtomicU64,
    pub timing: Timing,
    stop_flag: Arc<AtomicBool>,
    config: Arc<BenchConfig>,
}

impl Shared {
    pub fn new(config: Arc<BenchConfig>, stop_flag: Arc<AtomicBool>) -> Arc<Shared> {
        Arc::new(Shared {
            stats: GroupStatsMap::new(&config.groups),
            total_packets: AtomicU64::new(0),
            timing: Timing::new(),
            stop_flag,
            config,
        })
    }

    pub fn count_packet(&self) {
        self.total_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total_packets.load(Ordering::Relaxed)
    }

    /// The loop-continuation predicate: true while no shutdown signal has
    /// been raised AND the packet limit (if any) is not reached AND the time
    /// limit (if any) is not reached. Also refreshes the cached stop
    /// timestamp, so elapsed-time accounting tracks the last evaluation.
    pub fn should_run(&self) -> bool {
        let not_signalled = !self.stop_flag.load(Ordering::Relaxed);

        let below_packet_limit = self.config.total_packets == 0
            || self.total() < self.config.total_packets;

        self.timing.set_stop();
        let below_time_limit = self.config.run_secs == 0
            || self.timing.elapsed_secs() < self.config.run_secs;

        not_signalled && below_packet_limit && below_time_limit
    }

    /// Final run summary: elapsed time, packet counts, achieved rate.
    pub fn print_final_summary(&self, pkts_processed: u64, pkts_other: u64) {
        let elapsed_ms = self.timing.elapsed_ms();
        println!("Results:");
        println!("\tComplete in {}ms", elapsed_ms);
        println!("\tProcessed a total of: {} packets", pkts_processed);
        println!("\tWith {} other received packets", pkts_other);
        if elapsed_ms != 0 {
            let per_sec = pkts_processed as f64 / (elapsed_ms as f64 / 1000.0);
            println!("\t{:.2} datagrams per second", per_sec);
        }
    }
}

/// Owns the OS-level resources common to both roles: the socket (behind the
/// mockable seam), the registered buffer regions with their descriptor arena,
/// the address-capture ring, and the request/completion queues.
///
/// The completion machinery emulates a kernel completion port over a BSD-style
/// socket: posted receives are fulfilled by the pump (a blocking first
/// fulfilment bounded by the socket read timeout, then a non-blocking batch),
/// posted sends complete at submission and are delivered through the queue.
/// Completions are FIFO in post order.
pub struct Session {
    socket: Arc<dyn CompletionSocket>,
    regions: Vec<BufferArena>,
    descriptors: Vec<BufDescriptor>,
    addr_ring: Vec<SocketAddr>,
    request_queue: RequestQueue,
    completion_queue: CompletionQueue,
    pub shared: Arc<Shared>,
}

impl Session {
    pub fn new(socket: Arc<dyn CompletionSocket>, shared: Arc<Shared>) -> Session {
        Session {
            socket,
            regions: Vec::new(),
            descriptors: Vec::new(),
            addr_ring: Vec::new(),
            request_queue: RequestQueue::new(),
            completion_queue: CompletionQueue::new(0),
            shared,
        }
    }

    /// Reserve and register a region for `count` messages of `message_size`
    /// bytes. Allocation failure aborts (this is a benchmark tool; resource
    /// exhaustion at startup is unrecoverable by design).
    pub fn allocate_and_register(&mut self, message_size: usize, count: usize) -> RegionId {
        let id = RegionId(self.regions.len() as u32);
        let arena = BufferArena::allocate(id, message_size, count);
        info!(
            "registered buffer region {:?}: {} slots of {} bytes ({} bytes total)",
            id, count, message_size, arena.region_len()
        );
        self.regions.push(arena);
        id
    }

    pub fn create_completion_queue(&mut self, capacity: usize) {
        debug!("creating completion queue with capacity {}", capacity);
        self.completion_queue = CompletionQueue::new(capacity);
    }

    pub fn create_request_queue(&mut self) {
        self.request_queue = RequestQueue::new();
    }

    /// Descriptor for slot `index` of a registered region.
    pub fn region_descriptor(&self, region: RegionId, index: usize) -> BufDescriptor {
        self.regions[region.0 as usize].descriptor(index)
    }

    pub fn region_slot_count(&self, region: RegionId) -> usize {
        self.regions[region.0 as usize].slot_count()
    }

    /// Add one descriptor to the fixed descriptor arena; the returned slot
    /// index is the context carried through the completion mechanism.
    pub fn push_descriptor(&mut self, desc: BufDescriptor) -> SlotIndex {
        let slot = SlotIndex(self.descriptors.len() as u32);
        self.descriptors.push(desc);
        slot
    }

    pub fn descriptor(&self, slot: SlotIndex) -> BufDescriptor {
        self.descriptors[slot.as_usize()]
    }

    /// Pre-size the address-capture ring with one slot per outstanding
    /// receive.
    pub fn init_addr_ring(&mut self, count: usize) {
        let placeholder = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        self.addr_ring = vec![placeholder; count];
    }

    pub fn captured_addr(&self, addr_slot: u32) -> SocketAddr {
        self.addr_ring[addr_slot as usize]
    }

    pub fn slot_bytes(&self, slot: SlotIndex) -> &[u8] {
        let desc = self.descriptors[slot.as_usize()];
        self.regions[desc.region.0 as usize].slot(desc)
    }

    pub fn slot_bytes_mut(&mut self, slot: SlotIndex) -> &mut [u8] {
        let desc = self.descriptors[slot.as_usize()];
        self.regions[desc.region.0 as usize].slot_mut(desc)
    }

    /// Arm the completion queue for exactly one wake-up. Must be re-armed
    /// after every drain; arming does not auto-renew.
    pub fn notify_completion_queue(&mut self) {
        self.completion_queue.notify();
    }

    /// Queue one receive request for the slot, paired with an address-capture
    /// slot for the datagram's source address.
    pub fn post_recv(&mut self, slot: SlotIndex, addr_slot: u32) {
        debug_assert!((addr_slot as usize) < self.addr_ring.len());
        self.request_queue.post(Pending {
            slot,
            op: Op::Recv { addr_slot },
        });
    }

    /// Submit one send. The datagram goes out here; the completion is
    /// delivered through the completion queue like any other.
    pub fn post_send(&mut self, slot: SlotIndex, to: SocketAddr) -> anyhow::Result<()> {
        let desc = self.descriptors[slot.as_usize()];
        let buf = self.regions[desc.region.0 as usize].slot(desc);
        let bytes = self.socket.send_to(buf, to)
            .with_context(|| format!("send to {} failed", to))?;
        self.completion_queue.push(Completion {
            slot,
            op: Op::Send { to },
            bytes,
        });
        Ok(())
    }

    /// Block until at least one completion is available or the completion
    /// wait times out. Returns true when a wake-up was delivered.
    pub fn wait_for_wakeup(&mut self) -> anyhow::Result<bool> {
        self.completion_queue.take_armed();

        if !self.completion_queue.is_empty() {
            return Ok(true);
        }
        self.pump_next()
    }

    /// Drain up to `max` completions into `out`, pumping the socket
    /// non-blocking to fulfil as many posted requests as it has data for.
    pub fn drain_completions(&mut self, max: usize, out: &mut Vec<Completion>) -> anyhow::Result<usize> {
        if !self.request_queue.is_empty() {
            self.socket.set_nonblocking(true).context("set_nonblocking failed")?;
            while self.completion_queue.len() < max && self.pump_next()? {}
            self.socket.set_nonblocking(false).context("set_nonblocking failed")?;
        }

        out.clear();
        while out.len() < max {
            match self.completion_queue.pop() {
                Some(completion) => out.push(completion),
                None => break,
            }
        }
        Ok(out.len())
    }

    /// Fulfil the oldest posted request, if possible. Returns false when the
    /// request queue is empty or the socket has no datagram to offer.
    fn pump_next(&mut self) -> anyhow::Result<bool> {
        let Some(pending) = self.request_queue.pop() else {
            return Ok(false);
        };

        match pending.op {
            Op::Recv { addr_slot } => {
                let desc = self.descriptors[pending.slot.as_usize()];
                let buf = self.regions[desc.region.0 as usize].slot_mut(desc);
                match self.socket.recv_into(buf).context("receive failed")? {
                    Some((bytes, from)) => {
                        self.addr_ring[addr_slot as usize] = from;
                        self.completion_queue.push(Completion {
                            slot: pending.slot,
                            op: pending.op,
                            bytes,
                        });
                        Ok(true)
                    }
                    None => {
                        self.request_queue.push_front(pending);
                        Ok(false)
                    }
                }
            }
            Op::Send { to } => {
                let desc = self.descriptors[pending.slot.as_usize()];
                let buf = self.regions[desc.region.0 as usize].slot(desc);
                let bytes = self.socket.send_to(buf, to)
                    .with_context(|| format!("send to {} failed", to))?;
                self.completion_queue.push(Completion {
                    slot: pending.slot,
                    op: pending.op,
                    bytes,
                });
                Ok(true)
            }
        }
    }

    pub fn outstanding_requests(&self) -> usize {
        self.request_queue.len()
    }

    /// Release the socket and all registered regions. Consuming `self` makes
    /// a second clean-up unrepresentable.
    pub fn clean_up(self) {
        info!("session cleaned up: socket closed, {} buffer region(s) released", self.regions.len());
        drop(self);
    }
}
