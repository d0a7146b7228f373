use std::hash::Hash;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use rustc_hash::FxHashMap;

/// A map that is swapped wholesale through an atomic pointer. Readers take a
/// cheap snapshot; writers clone-modify-CAS. Entries are inserted rarely (once
/// per group, plus lazy inserts for unexpected sources) and never removed, so
/// the copy-on-write update cost is irrelevant while reads stay lock-free.
///
/// A reader may have loaded the current pointer and not yet cloned the `Arc`
/// behind it when a writer swaps it out, so an unlinked map must not be freed
/// immediately. Writers park unlinked pointers in `retired` instead;
/// reclamation happens in `Drop`, where exclusive access guarantees no reader
/// is left. Memory held this way is bounded by the number of inserts.
pub struct AtomicMap<K, V> {
    map: AtomicPtr<Arc<FxHashMap<K, V>>>,
    retired: Mutex<Vec<*mut Arc<FxHashMap<K, V>>>>,
}

// raw pointers suppress the auto traits; the pointees are heap-allocated
// `Arc<FxHashMap>` instances owned by this struct
unsafe impl<K: Send + Sync, V: Send + Sync> Send for AtomicMap<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for AtomicMap<K, V> {}

impl<K: Hash + Eq + Clone + Sync + Send, V: Clone + Sync + Send> Default for AtomicMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone + Sync + Send, V: Clone + Sync + Send> AtomicMap<K, V> {
    pub fn new() -> AtomicMap<K, V> {
        let map = Arc::new(FxHashMap::<K, V>::default());
        let raw = Box::into_raw(Box::new(map));

        AtomicMap {
            map: AtomicPtr::new(raw),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// A snapshot of the current map contents. The snapshot stays valid (and
    /// consistent) however many updates happen after it is taken.
    pub fn load(&self) -> Arc<FxHashMap<K, V>> {
        unsafe { (*self.map.load(Ordering::Acquire)).clone() }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        unsafe { (*self.map.load(Ordering::Acquire)).get(key).cloned() }
    }

    pub fn update(&self, f: impl Fn(&mut FxHashMap<K, V>)) {
        loop {
            let old = self.map.load(Ordering::Acquire);

            let mut map: FxHashMap<K, V> = unsafe { (**old).clone() };
            f(&mut map);
            let new = Box::into_raw(Box::new(Arc::new(map)));

            match self.map.compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(prev) => {
                    // a concurrent load() may still hold this pointer
                    self.retired.lock().unwrap().push(prev);
                    return;
                }
                Err(_) => {
                    // never published, no reader can have seen it
                    unsafe { drop(Box::from_raw(new)); }
                }
            }
        }
    }
}

impl<K, V> Drop for AtomicMap<K, V> {
    fn drop(&mut self) {
        unsafe {
            let raw = self.map.load(Ordering::Acquire);
            drop(Box::from_raw(raw));
            for retired in self.retired.get_mut().unwrap().drain(..) {
                drop(Box::from_raw(retired));
            }
        }
    }
}

/// Counters for one multicast group (producer) or one traffic source
/// (consumer). All fields are written by the single I/O thread and read
/// concurrently by the report worker, hence the per-field atomics; there is
/// exactly one writer, so load/modify/store without RMW is sound.
#[derive(Debug, Default)]
pub struct GroupStats {
    pub packets: AtomicU64,
    pub bytes: AtomicU64,
    /// Last sequence number seen (receiver) or assigned (producer).
    pub sequence: AtomicU64,
    /// Receiver only: the sequence number the next in-order packet must carry.
    pub expected_sequence: AtomicU64,
    pub out_of_order: AtomicU64,
    /// Receiver only: estimated number of dropped packets. Approximate by
    /// construction - a late arrival retroactively decrements it, with no
    /// bound on how late.
    pub rx_dropped: AtomicU64,
}

impl GroupStats {
    /// Sequence/loss accounting for one received datagram.
    ///
    /// In-order packets advance the expectation; a gap ahead of the
    /// expectation is booked as drops (unless this is the first packet seen
    /// for the group); anything behind the expectation is reordering and pays
    /// back one assumed drop if any are booked.
    pub fn record_rx(&self, seq: u64, payload_len: u64) {
        let expected = self.expected_sequence.load(Ordering::Relaxed);

        if seq == expected {
            self.expected_sequence.store(expected + 1, Ordering::Relaxed);
            self.sequence.store(seq, Ordering::Relaxed);
        } else if seq > expected {
            if self.packets.load(Ordering::Relaxed) != 0 {
                self.rx_dropped.fetch_add(seq - expected, Ordering::Relaxed);
            }
            self.expected_sequence.store(seq + 1, Ordering::Relaxed);
            self.sequence.store(seq, Ordering::Relaxed);
        } else {
            if self.rx_dropped.load(Ordering::Relaxed) > 0 {
                self.rx_dropped.fetch_sub(1, Ordering::Relaxed);
            }
            self.out_of_order.fetch_add(1, Ordering::Relaxed);
        }

        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(payload_len, Ordering::Relaxed);
    }

    /// Accounting for one sent datagram. The recorded sequence intentionally
    /// lags the packet count by one.
    pub fn record_tx(&self, payload_len: u64) {
        self.sequence.store(self.packets.load(Ordering::Relaxed), Ordering::Relaxed);
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(payload_len, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters the reports care about.
    pub fn snapshot(&self) -> TotalStats {
        TotalStats {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            drops: self.rx_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Aggregate over all group records, computed on demand.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct TotalStats {
    pub packets: u64,
    pub bytes: u64,
    pub out_of_order: u64,
    pub drops: u64,
}

/// The per-group statistics map shared between the I/O thread and the report
/// worker. Seeded with one entry per configured group; the receive path lazily
/// inserts entries for source addresses it has never seen before.
pub struct GroupStatsMap {
    map: AtomicMap<Ipv4Addr, Arc<GroupStats>>,
}

impl GroupStatsMap {
    pub fn new(groups: &[Ipv4Addr]) -> GroupStatsMap {
        let map = AtomicMap::new();
        map.update(|m| {
            for group in groups {
                m.insert(*group, Arc::new(GroupStats::default()));
            }
        });
        GroupStatsMap { map }
    }

    /// The stats record for `addr`, inserting a fresh one on first sight.
    pub fn entry(&self, addr: Ipv4Addr) -> Arc<GroupStats> {
        if let Some(stats) = self.map.get(&addr) {
            return stats;
        }

        let stats = Arc::new(GroupStats::default());
        let inserted = stats.clone();
        self.map.update(move |m| {
            m.entry(addr).or_insert_with(|| inserted.clone());
        });
        // re-read in case a concurrent insert won the race
        self.map.get(&addr).unwrap_or(stats)
    }

    pub fn totals(&self) -> TotalStats {
        let mut totals = TotalStats::default();
        for stats in self.map.load().values() {
            totals.packets += stats.packets.load(Ordering::Relaxed);
            totals.bytes += stats.bytes.load(Ordering::Relaxed);
            totals.out_of_order += stats.out_of_order.load(Ordering::Relaxed);
            totals.drops += stats.rx_dropped.load(Ordering::Relaxed);
        }
        totals
    }

    /// All entries ordered by address, for the final tables.
    pub fn sorted(&self) -> Vec<(Ipv4Addr, Arc<GroupStats>)> {
        let mut entries: Vec<_> = self.map.load()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        entries.sort_by_key(|(addr, _)| u32::from(*addr));
        entries
    }

    /// Per-group receive table with loss/reorder columns and a totals row.
    pub fn print_consumer_table(&self) {
        println!();
        println!("  Group           Packets        Bytes      Last Seq   OutOfOrder    Drops");
        println!("-----------------------------------------------------------------------------");

        let mut totals = TotalStats::default();
        for (addr, stats) in self.sorted() {
            let packets = stats.packets.load(Ordering::Relaxed);
            let bytes = stats.bytes.load(Ordering::Relaxed);
            let out_of_order = stats.out_of_order.load(Ordering::Relaxed);
            let drops = stats.rx_dropped.load(Ordering::Relaxed);
            println!(
                "{:<15} {:>10}  {:>12}  {:>10}  {:>10}  {:>10}",
                addr, packets, bytes,
                stats.sequence.load(Ordering::Relaxed),
                out_of_order, drops
            );
            totals.packets += packets;
            totals.bytes += bytes;
            totals.out_of_order += out_of_order;
            totals.drops += drops;
        }
        println!("-----------------------------------------------------------------------------");
        println!(
            "Totals:         {:>10}  {:>12}              {:>10}  {:>10}",
            totals.packets, totals.bytes, totals.out_of_order, totals.drops
        );
        println!();
    }

    /// Per-group send table. No loss/reorder columns - the producer has no
    /// notion of receive-side gaps.
    pub fn print_producer_table(&self) {
        println!();
        println!("  Group           Packets        Bytes      Last Seq");
        println!("---------------------------------------------------------");

        for (addr, stats) in self.sorted() {
            println!(
                "{:<15} {:>10}  {:>12}  {:>10}",
                addr,
                stats.packets.load(Ordering::Relaxed),
                stats.bytes.load(Ordering::Relaxed),
                stats.sequence.load(Ordering::Relaxed)
            );
        }
        println!();
    }
}
