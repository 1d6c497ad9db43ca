use anyhow::{Context, Result};
use can_fabric::{CycleClock, Fabric, NullStatusSink, SimClock};
use can_fabric_remote::{FabricServer, ServerConfig};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about = "virtual CAN bus fabric server")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8888")]
    listen: SocketAddr,

    /// CPU to pin worker threads to; omit to leave affinity alone.
    #[arg(long)]
    cpu: Option<usize>,

    /// SCHED_FIFO priority for worker threads (1-99); omit to stay with
    /// the default scheduler.
    #[arg(long)]
    rt_priority: Option<i32>,

    /// Arena capacity for connection buffers, in MiB.
    #[arg(long, default_value_t = 32)]
    arena_mib: usize,

    /// Simulation cycle period, in milliseconds.
    #[arg(long, default_value_t = 10)]
    cycle_ms: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let clock = Arc::new(SimClock::new(Duration::from_millis(args.cycle_ms)));
    let fabric = Arc::new(Fabric::new(clock.clone(), Arc::new(NullStatusSink)));

    let config = ServerConfig {
        listen_addr: args.listen,
        worker_cpu: args.cpu,
        rt_priority: args.rt_priority,
        arena_capacity: args.arena_mib * 1024 * 1024,
        ..ServerConfig::default()
    };
    let server =
        FabricServer::start(fabric, config).context("failed to start the fabric server")?;

    println!("fabric server listening on {}", server.local_addr());
    println!("press Ctrl+C to stop");

    let period = clock.period();
    while !server.is_shut_down() {
        thread::sleep(period);
        let cycle = clock.advance();
        server.notify_cycle(cycle);
    }
    Ok(())
}
