use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{info, warn};
use crate::config::BenchConfig;
use crate::session::arena::RegionId;
use crate::session::completion::{Completion, Op};
use crate::session::socket::bind_consumer_socket;
use crate::session::{Session, Shared, MAX_COMPLETION_BATCH};
use crate::stats::TotalStats;
use crate::util::format_si;
use crate::wire::{ProtocolHeader, PAYLOAD_SIZE};

/// Receives stay posted in this quantity at all times; each drained
/// completion re-posts its descriptor immediately.
const MAX_PENDING_RECVS: usize = 1_500_000;

/// Interval between periodic stats rows.
const REPORT_PERIOD: Duration = Duration::from_secs(4);

/// Granularity at which the report worker polls for shutdown.
const REPORT_POLL: Duration = Duration::from_millis(100);

/// Column header is re-printed every this many report rows.
const ROWS_PER_HEADER: u32 = 16;

pub struct Consumer {
    session: Session,
    config: Arc<BenchConfig>,
    pkts_other: u64,
}

impl Consumer {
    pub fn new(config: Arc<BenchConfig>, stop_flag: Arc<AtomicBool>) -> anyhow::Result<Consumer> {
        let socket = bind_consumer_socket(&config)?;
        let shared = Shared::new(config.clone(), stop_flag);

        let mut session = Session::new(Arc::new(socket), shared);
        session.create_completion_queue(MAX_PENDING_RECVS);
        session.create_request_queue();
        session.allocate_and_register(PAYLOAD_SIZE, MAX_PENDING_RECVS);
        session.init_addr_ring(MAX_PENDING_RECVS);

        Ok(Consumer {
            session,
            config,
            pkts_other: 0,
        })
    }

    #[cfg(test)]
    fn with_session(session: Session, config: Arc<BenchConfig>) -> Consumer {
        Consumer {
            session,
            config,
            pkts_other: 0,
        }
    }

    /// Fill the request queue: one posted receive per slot of the registered
    /// region, each paired with its address-capture slot.
    fn post_first_recvs(&mut self) {
        let region = RegionId(0);
        let count = self.session.region_slot_count(region);
        for i in 0..count {
            let desc = self.session.region_descriptor(region, i);
            let slot = self.session.push_descriptor(desc);
            self.session.post_recv(slot, i as u32);
        }
        info!("posted {} initial receives", count);
    }

    /// Conforming packets seen so far; wrong-size and malformed datagrams are
    /// excluded.
    fn processed(&self) -> u64 {
        self.session.shared.total() - self.pkts_other
    }

    pub fn run(&mut self) -> anyhow::Result<()> {
        self.post_first_recvs();
        info!(
            "consuming {} group(s) on port {}",
            self.config.groups.len(), self.config.port
        );

        let reporter = spawn_report_worker(self.session.shared.clone());

        let mut batch = Vec::with_capacity(MAX_COMPLETION_BATCH);
        let mut should_notify = true;
        while self.session.shared.should_run() {
            if should_notify {
                self.session.notify_completion_queue();
            }
            if !self.session.wait_for_wakeup()? {
                // timed out; the queue is still armed from before
                should_notify = false;
                continue;
            }
            should_notify = true;

            self.session.drain_completions(MAX_COMPLETION_BATCH, &mut batch)?;
            for i in 0..batch.len() {
                self.process_completion(batch[i]);
            }
        }

        let _ = reporter.join();

        let shared = &self.session.shared;
        shared.print_final_summary(self.processed(), self.pkts_other);
        shared.stats.print_consumer_table();
        Ok(())
    }

    fn process_completion(&mut self, completion: Completion) {
        let shared = &self.session.shared;
        if shared.total() == 0 {
            shared.timing.set_start();
        }
        shared.count_packet();

        if completion.bytes != PAYLOAD_SIZE {
            // unknown traffic on the group; counted but its slot is not
            // recycled
            self.pkts_other += 1;
            return;
        }
        let Op::Recv { addr_slot } = completion.op else {
            return;
        };

        let from = self.session.captured_addr(addr_slot);
        let mut payload = self.session.slot_bytes(completion.slot);
        match ProtocolHeader::deser(&mut payload) {
            Ok(header) => {
                if let Some(source) = ipv4_of(from) {
                    shared.stats.entry(source).record_rx(header.seq, completion.bytes as u64);
                }
            }
            Err(e) => {
                self.pkts_other += 1;
                warn!("malformed datagram from {}: {}", from, e);
            }
        }

        // the drained buffer and its address slot go straight back out
        self.session.post_recv(completion.slot, addr_slot);
    }

    pub fn clean_up(self) {
        self.session.clean_up();
    }
}

fn ipv4_of(addr: SocketAddr) -> Option<Ipv4Addr> {
    match addr {
        SocketAddr::V4(sa) => Some(*sa.ip()),
        SocketAddr::V6(_) => None,
    }
}

/// One periodic report row: cumulative totals across all sources plus the
/// rates and deltas of the period just ended. A negative drop delta is a late
/// arrival paying back an assumed drop.
fn format_report_row(now: &TotalStats, prev: &TotalStats, period: Duration) -> String {
    let secs = period.as_secs_f64();
    let pps = (now.packets - prev.packets) as f64 / secs;
    let bps = (now.bytes - prev.bytes) as f64 * 8.0 / secs;
    format!(
        "{:>12} {:>10} {:>12} {:>10} {:>10} {:>10} {:>10}",
        now.packets,
        format_si(pps),
        format_si(bps),
        now.drops,
        now.drops as i64 - prev.drops as i64,
        now.out_of_order,
        now.out_of_order - prev.out_of_order
    )
}

/// Periodic receive-side report: one aggregate row per period. Runs until the
/// stop predicate trips.
fn spawn_report_worker(shared: Arc<Shared>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut prev = TotalStats::default();
        let mut elapsed = Duration::ZERO;
        let mut rows: u32 = 0;

        while shared.should_run() {
            thread::sleep(REPORT_POLL);
            elapsed += REPORT_POLL;
            if elapsed < REPORT_PERIOD {
                continue;
            }
            elapsed = Duration::ZERO;

            if rows % ROWS_PER_HEADER == 0 {
                println!();
                println!(
                    "{:>12} {:>10} {:>12} {:>10} {:>10} {:>10} {:>10}",
                    "TotalPkts", "pps", "bps", "Drops", "dDrops", "OoO", "dOoO"
                );
            }
            rows += 1;

            let now = shared.stats.totals();
            println!("{}", format_report_row(&now, &prev, REPORT_PERIOD));
            prev = now;
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use crate::config::Role;
    use crate::session::socket::MockCompletionSocket;
    use super::*;

    fn test_config(groups: Vec<Ipv4Addr>, total_packets: u64) -> Arc<BenchConfig> {
        Arc::new(BenchConfig {
            role: Role::Consumer,
            groups,
            port: 10000,
            interface_addr: Ipv4Addr::UNSPECIFIED,
            total_packets,
            run_secs: 0,
            rate_pps: 1,
        })
    }

    fn datagram(seq: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PAYLOAD_SIZE);
        ProtocolHeader::new(seq, 1).ser(&mut buf);
        buf.resize(PAYLOAD_SIZE, 0);
        buf
    }

    fn consumer_with_script(
        config: Arc<BenchConfig>,
        pending_recvs: usize,
        datagrams: Vec<(Vec<u8>, SocketAddr)>,
    ) -> Consumer {
        let mut mock = MockCompletionSocket::new();
        let script = Mutex::new(VecDeque::from(datagrams));
        mock.expect_recv_into().returning(move |buf| {
            match script.lock().unwrap().pop_front() {
                Some((data, from)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(Some((data.len(), from)))
                }
                None => Ok(None),
            }
        });
        mock.expect_set_nonblocking().returning(|_| Ok(()));

        let stop = Arc::new(AtomicBool::new(false));
        let shared = Shared::new(config.clone(), stop);
        let mut session = Session::new(Arc::new(mock), shared);
        session.create_completion_queue(pending_recvs);
        session.create_request_queue();
        session.allocate_and_register(PAYLOAD_SIZE, pending_recvs);
        session.init_addr_ring(pending_recvs);

        Consumer::with_session(session, config)
    }

    #[test]
    fn test_end_to_end_two_groups_until_packet_limit() {
        let source_a: SocketAddr = "10.0.0.1:7000".parse().unwrap();
        let source_b: SocketAddr = "10.0.0.2:7000".parse().unwrap();

        let mut datagrams = Vec::new();
        for seq in 0..500u64 {
            datagrams.push((datagram(seq), source_a));
            datagrams.push((datagram(seq), source_b));
        }

        let config = test_config(
            vec![Ipv4Addr::new(239, 5, 69, 2), Ipv4Addr::new(239, 5, 69, 3)],
            1000,
        );
        let mut consumer = consumer_with_script(config, 2048, datagrams);
        consumer.run().unwrap();

        let shared = &consumer.session.shared;
        assert_eq!(shared.total(), 1000);
        assert_eq!(consumer.pkts_other, 0);

        for source in [Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)] {
            let stats = shared.stats.entry(source).snapshot();
            assert_eq!(stats.packets, 500);
            assert_eq!(stats.bytes, 500 * PAYLOAD_SIZE as u64);
            assert_eq!(stats.drops, 0);
            assert_eq!(stats.out_of_order, 0);
        }
    }

    #[test]
    fn test_wrong_size_datagram_counts_as_other_and_is_not_reposted() {
        let source: SocketAddr = "10.0.0.1:7000".parse().unwrap();
        let datagrams = vec![
            (vec![0u8; 40], source),
            (datagram(0), source),
        ];

        let config = test_config(vec![Ipv4Addr::new(239, 5, 69, 2)], 2);
        let mut consumer = consumer_with_script(config, 8, datagrams);
        consumer.run().unwrap();

        assert_eq!(consumer.pkts_other, 1);
        assert_eq!(consumer.session.shared.total(), 2);
        assert_eq!(consumer.processed(), 1);
        // of the two drained slots only the conforming one was re-posted
        assert_eq!(consumer.session.outstanding_requests(), 8 - 1);
    }

    #[test]
    fn test_initial_recv_window_matches_region_size() {
        let source: SocketAddr = "10.0.0.1:7000".parse().unwrap();
        let config = test_config(vec![Ipv4Addr::new(239, 5, 69, 2)], 1);
        let mut consumer = consumer_with_script(config, 16, vec![(datagram(0), source)]);
        consumer.run().unwrap();

        // one receive per region slot went out, and the drained one came back
        assert_eq!(consumer.session.outstanding_requests(), 16);
    }

    #[test]
    fn test_report_row_aggregates_the_period() {
        let prev = TotalStats { packets: 0, bytes: 0, out_of_order: 1, drops: 5 };
        let now = TotalStats { packets: 8000, bytes: 800_000, out_of_order: 4, drops: 3 };

        let row = format_report_row(&now, &prev, Duration::from_secs(4));
        assert!(row.contains("8000"));
        assert!(row.contains("2.0K"));
        assert!(row.contains("1.6M"));
        assert!(row.contains("-2"));
    }

    #[test]
    fn test_gaps_are_reported_per_source() {
        let source: SocketAddr = "10.0.0.1:7000".parse().unwrap();
        let datagrams: Vec<_> = [0u64, 1, 2, 5]
            .iter()
            .map(|&seq| (datagram(seq), source))
            .collect();

        let config = test_config(vec![Ipv4Addr::new(239, 5, 69, 2)], 4);
        let mut consumer = consumer_with_script(config, 8, datagrams);
        consumer.run().unwrap();

        let stats = consumer.session.shared.stats
            .entry(Ipv4Addr::new(10, 0, 0, 1))
            .snapshot();
        assert_eq!(stats.packets, 4);
        assert_eq!(stats.drops, 2);
    }
}
