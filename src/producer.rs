use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::info;
use crate::config::BenchConfig;
use crate::session::completion::SlotIndex;
use crate::session::socket::bind_producer_socket;
use crate::session::{Session, Shared, MAX_COMPLETION_BATCH};
use crate::util::{format_si, now_unix_nanos, spin};
use crate::wire::{ProtocolHeader, PAYLOAD_SIZE};

/// Interval between rate-controller adjustments.
const TUNE_PERIOD: Duration = Duration::from_millis(100);

/// One progress line per this many tuning intervals.
const TUNES_PER_REPORT: u32 = 10;

pub struct Producer {
    session: Session,
    config: Arc<BenchConfig>,
    /// Send counter; `n % groups` selects the destination, and a wrap to
    /// destination 0 marks a full round.
    n: u64,
    seq: u64,
    /// Nanoseconds to burn per full round. Written by the tuning worker, read
    /// on the send path.
    spin_ns: Arc<AtomicU64>,
}

impl Producer {
    pub fn new(config: Arc<BenchConfig>, stop_flag: Arc<AtomicBool>) -> anyhow::Result<Producer> {
        let socket = bind_producer_socket(&config)?;
        let shared = Shared::new(config.clone(), stop_flag);

        let mut session = Session::new(Arc::new(socket), shared);
        Self::set_up_session(&mut session, &config);
        Ok(Producer {
            session,
            n: 0,
            seq: 0,
            spin_ns: Arc::new(AtomicU64::new(initial_spin_ns(config.rate_pps))),
            config,
        })
    }

    #[cfg(test)]
    fn with_session(mut session: Session, config: Arc<BenchConfig>) -> Producer {
        Self::set_up_session(&mut session, &config);
        Producer {
            session,
            n: 0,
            seq: 0,
            spin_ns: Arc::new(AtomicU64::new(initial_spin_ns(config.rate_pps))),
            config,
        }
    }

    /// One buffer slot per packet of a one-second window, shared by one
    /// descriptor per destination group. The buffers carry their full header
    /// from the start; the send path only patches sequence and timestamp.
    fn set_up_session(session: &mut Session, config: &BenchConfig) {
        let slots = config.rate_pps as usize;
        let outstanding = slots * config.groups.len();

        session.create_completion_queue(outstanding);
        session.create_request_queue();
        let region = session.allocate_and_register(PAYLOAD_SIZE, slots);

        let header = ProtocolHeader::new(0, now_unix_nanos());
        for i in 0..slots {
            let desc = session.region_descriptor(region, i);
            let first = session.push_descriptor(desc);
            for _ in 1..config.groups.len() {
                session.push_descriptor(desc);
            }
            header.ser(session.slot_bytes_mut(first));
        }
    }

    /// Burst out one full window of sends; from here on every completion
    /// triggers the next send, so the loop stays closed.
    fn post_first_sends(&mut self) -> anyhow::Result<()> {
        let outstanding = self.config.rate_pps as usize * self.config.groups.len();
        for i in 0..outstanding {
            self.send_next(SlotIndex(i as u32))?;
        }
        info!("posted {} initial sends", outstanding);
        Ok(())
    }

    fn send_next(&mut self, slot: SlotIndex) -> anyhow::Result<()> {
        let dest_index = (self.n % self.config.groups.len() as u64) as usize;
        if dest_index == 0 && self.n > 0 {
            // a full round across all groups completed; the first round goes
            // out unpaced with sequence 0
            self.seq += 1;
            spin(self.spin_ns.load(Ordering::Relaxed));
        }

        ProtocolHeader::patch_seq_and_timestamp(
            self.session.slot_bytes_mut(slot),
            self.seq,
            now_unix_nanos(),
        );

        let group = self.config.groups[dest_index];
        let to = SocketAddr::V4(SocketAddrV4::new(group, self.config.port));
        self.session.post_send(slot, to)?;

        self.session.shared.stats.entry(group).record_tx(PAYLOAD_SIZE as u64);
        self.session.shared.count_packet();
        self.n += 1;
        Ok(())
    }

    pub fn run(&mut self) -> anyhow::Result<()> {
        info!(
            "producing to {} group(s) on port {} at {} pps per group",
            self.config.groups.len(), self.config.port, self.config.rate_pps
        );

        self.session.shared.timing.set_start();
        self.post_first_sends()?;

        let tuner = spawn_tuning_worker(
            self.session.shared.clone(),
            self.spin_ns.clone(),
            self.config.clone(),
        );

        let mut batch = Vec::with_capacity(MAX_COMPLETION_BATCH);
        while self.session.shared.should_run() {
            self.session.notify_completion_queue();
            if !self.session.wait_for_wakeup()? {
                continue;
            }

            self.session.drain_completions(MAX_COMPLETION_BATCH, &mut batch)?;
            for i in 0..batch.len() {
                self.send_next(batch[i].slot)?;
            }
        }

        let _ = tuner.join();

        let shared = &self.session.shared;
        shared.print_final_summary(shared.total(), 0);
        shared.stats.print_producer_table();
        Ok(())
    }

    pub fn clean_up(self) {
        self.session.clean_up();
    }
}

fn initial_spin_ns(rate_pps: u64) -> u64 {
    1_000_000_000 / rate_pps.max(1)
}

/// Proportional adjustment of the per-round spin. Compares the packets sent
/// during one tuning interval against the target for that interval and nudges
/// the spin by 10ns per threshold of error. Spins below 1us are below the
/// pacer's resolution, so such results collapse to a token 100ns.
fn retune(spin_ns: u64, sent_in_interval: u64, rate_pps: u64, group_count: u64) -> u64 {
    let expected = (rate_pps * group_count / 10) as i64;
    let threshold = ((rate_pps * group_count / 2000) as i64).max(1);
    let delta = sent_in_interval as i64 - expected;

    let mut spin = spin_ns as i64;
    if delta.abs() > threshold {
        spin += (delta / threshold) * 10;
    }
    if spin < 1000 {
        spin = 100;
    }
    spin as u64
}

/// Closed-loop rate controller plus the periodic progress line.
fn spawn_tuning_worker(
    shared: Arc<Shared>,
    spin_ns: Arc<AtomicU64>,
    config: Arc<BenchConfig>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let group_count = config.groups.len() as u64;
        let mut prev_total = shared.total();
        let mut prev_report_total = prev_total;
        let mut ticks: u32 = 0;

        while shared.should_run() {
            thread::sleep(TUNE_PERIOD);

            let total = shared.total();
            let tuned = retune(
                spin_ns.load(Ordering::Relaxed),
                total - prev_total,
                config.rate_pps,
                group_count,
            );
            spin_ns.store(tuned, Ordering::Relaxed);
            prev_total = total;

            ticks += 1;
            if ticks % TUNES_PER_REPORT == 0 {
                let secs = TUNE_PERIOD.as_secs_f64() * TUNES_PER_REPORT as f64;
                let pps = (total - prev_report_total) as f64 / secs;
                println!(
                    "tx {}pps  {}bps  spin {}ns",
                    format_si(pps),
                    format_si(pps * PAYLOAD_SIZE as f64 * 8.0),
                    tuned
                );
                prev_report_total = total;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use rstest::rstest;
    use crate::config::Role;
    use crate::session::socket::MockCompletionSocket;
    use super::*;

    // 1000 pps per group over 2 groups: the interval target is 200 packets
    // and the adjustment threshold is 1 packet
    #[rstest]
    #[case::on_target(10_000, 200, 10_000)]
    #[case::slightly_fast_within_threshold(10_000, 201, 10_000)]
    #[case::too_fast_spins_longer(10_000, 220, 10_200)]
    #[case::too_slow_spins_shorter(10_000, 180, 9_800)]
    #[case::floor_collapses_small_spins(1_000, 0, 100)]
    fn test_retune(#[case] spin: u64, #[case] sent: u64, #[case] expected: u64) {
        assert_eq!(retune(spin, sent, 1000, 2), expected);
    }

    #[test]
    fn test_retune_never_goes_negative() {
        // the downward correction exceeds the current spin; the result snaps
        // to the floor instead of wrapping
        assert_eq!(retune(100, 0, 1000, 2), 100);
    }

    fn test_config(groups: Vec<Ipv4Addr>, rate_pps: u64, total_packets: u64) -> Arc<BenchConfig> {
        Arc::new(BenchConfig {
            role: Role::Producer,
            groups,
            port: 10000,
            interface_addr: Ipv4Addr::UNSPECIFIED,
            total_packets,
            run_secs: 0,
            rate_pps,
        })
    }

    fn producer_with_recorder(
        config: Arc<BenchConfig>,
        sent: Arc<Mutex<Vec<(u64, SocketAddr)>>>,
    ) -> Producer {
        let mut mock = MockCompletionSocket::new();
        let recorder = sent.clone();
        mock.expect_send_to().returning(move |buf, to| {
            let seq = u64::from_le_bytes(buf[4..12].try_into().unwrap());
            recorder.lock().unwrap().push((seq, to));
            Ok(buf.len())
        });
        mock.expect_set_nonblocking().returning(|_| Ok(()));

        let stop = Arc::new(AtomicBool::new(false));
        let shared = Shared::new(config.clone(), stop);
        let session = Session::new(Arc::new(mock), shared);
        Producer::with_session(session, config)
    }

    #[test]
    fn test_round_robin_across_groups_with_shared_sequence() {
        let group_a = Ipv4Addr::new(239, 5, 69, 2);
        let group_b = Ipv4Addr::new(239, 5, 69, 3);
        let config = test_config(vec![group_a, group_b], 1000, 20);

        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut producer = producer_with_recorder(config.clone(), sent.clone());
        producer.run().unwrap();

        let sent = sent.lock().unwrap();
        assert!(sent.len() >= 20);

        for (i, (seq, to)) in sent.iter().enumerate() {
            let expected_group = if i % 2 == 0 { group_a } else { group_b };
            assert_eq!(*to, SocketAddr::V4(SocketAddrV4::new(expected_group, 10000)));
            // every destination of one round carries the same sequence,
            // starting at 0 and advancing by one per round
            assert_eq!(*seq, (i / 2) as u64);
        }
    }

    #[test]
    fn test_stats_track_sends_per_group() {
        let group = Ipv4Addr::new(239, 5, 69, 2);
        let config = test_config(vec![group], 1000, 10);

        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut producer = producer_with_recorder(config, sent);
        producer.run().unwrap();

        let stats = producer.session.shared.stats.entry(group).snapshot();
        assert_eq!(stats.packets, producer.session.shared.total());
        assert!(stats.packets >= 10);
        assert_eq!(stats.bytes, stats.packets * PAYLOAD_SIZE as u64);
    }

    #[test]
    fn test_send_failure_aborts_the_run() {
        let config = test_config(vec![Ipv4Addr::new(239, 5, 69, 2)], 10, 0);

        let mut mock = MockCompletionSocket::new();
        mock.expect_send_to().returning(|_, _| {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no route"))
        });
        mock.expect_set_nonblocking().returning(|_| Ok(()));

        let stop = Arc::new(AtomicBool::new(false));
        let shared = Shared::new(config.clone(), stop);
        let session = Session::new(Arc::new(mock), shared);
        let mut producer = Producer::with_session(session, config);

        assert!(producer.run().is_err());
    }
}
