use std::net::Ipv4Addr;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use anyhow::Context;
use clap::Parser;
use tracing::{error, Level};
use mcperf::config::{parse_group_range, BenchConfig, Role};
use mcperf::consumer::Consumer;
use mcperf::producer::Producer;

#[derive(Debug, Parser)]
#[command(name = "mcperf", version, about = "High-rate multicast UDP producer/consumer benchmark")]
struct Cli {
    /// Role to run.
    #[arg(value_enum)]
    role: Role,

    /// Multicast group IP or range of group IPs (a.b.c.d or a.b.c.d-e.f.g.h).
    #[arg(long, default_value = "239.5.69.2")]
    mcast_ip: String,

    /// Multicast port.
    #[arg(long, default_value_t = 10000)]
    mcast_port: u16,

    /// IPv4 address of the local interface to join/send on.
    #[arg(long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    ifaddr: Ipv4Addr,

    /// Total packets to send/receive; 0 = unbounded.
    #[arg(long, default_value_t = 20_000_000)]
    total_pkts: u64,

    /// Producer only: target packet rate per group in packets/sec.
    #[arg(long, default_value_t = 1)]
    pps: u64,

    /// Number of seconds to run; 0 = unbounded.
    #[arg(long, default_value_t = 0)]
    seconds: u64,
}

fn build_config(cli: &Cli) -> anyhow::Result<BenchConfig> {
    let config = BenchConfig {
        role: cli.role,
        groups: parse_group_range(&cli.mcast_ip)?,
        port: cli.mcast_port,
        interface_addr: cli.ifaddr,
        total_packets: cli.total_pkts,
        run_secs: cli.seconds,
        rate_pps: cli.pps,
    };
    config.validate()?;
    Ok(config)
}

fn print_run_parameters(config: &BenchConfig) {
    println!("Running as {:?}:", config.role);
    println!(
        "\tgroups:    {} .. {} ({} group(s)) on port {}",
        config.groups[0],
        config.groups[config.groups.len() - 1],
        config.groups.len(),
        config.port
    );
    println!("\tinterface: {}", config.interface_addr);
    println!("\tlimits:    {} packets, {} seconds (0 = unbounded)", config.total_packets, config.run_secs);
    if config.role == Role::Producer {
        println!("\trate:      {} pps per group", config.rate_pps);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Arc::new(build_config(&cli)?);
    print_run_parameters(&config);

    let stop_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = stop_flag.clone();
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::Relaxed))
        .context("installing the interrupt handler failed")?;

    match config.role {
        Role::Consumer => {
            let mut consumer = Consumer::new(config, stop_flag)?;
            consumer.run()?;
            consumer.clean_up();
        }
        Role::Producer => {
            let mut producer = Producer::new(config, stop_flag)?;
            producer.run()?;
            producer.clean_up();
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
