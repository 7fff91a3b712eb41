use std::{error::Error, net::Ipv4Addr, process::ExitCode, time::Duration};

use clap::{Args, Parser, Subcommand};
use quadra::{
    cluster::{
        affinity::process_affinity,
        net::{starter::run_starter, worker::run_worker},
    },
    config::{self, ClusterConfig},
    CpuTopology, Executor, Integrand, ProcessorSet,
};
use tokio::{task::spawn_blocking, time::Instant};
use tracing::{debug, error, info, warn};

/// Numerical integration over the cores of this machine or a LAN of workers.
#[derive(Parser, Debug)]
#[command(name = "quadra", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Broadcast for workers, split the range between them and sum the results
    Starter {
        #[command(flatten)]
        range: RangeArgs,
        #[command(flatten)]
        net: NetArgs,
        /// Where to send the discovery datagram
        #[arg(long, default_value_t = Ipv4Addr::BROADCAST)]
        broadcast: Ipv4Addr,
        /// Accept at most this many workers
        #[arg(long, default_value_t = config::MAX_WORKERS)]
        max_workers: usize,
        /// How long to accept workers for, in milliseconds
        #[arg(long, default_value_t = config::ACCEPT_WINDOW.as_millis() as u64)]
        accept_window_ms: u64,
    },
    /// Wait for starters and compute whatever share they hand out, forever
    Worker {
        /// Compute threads per share (defaults to one per usable processor)
        #[arg(short, long)]
        threads: Option<usize>,
        /// Speed rating reported to the starter (defaults to the thread count)
        #[arg(long)]
        speed: Option<i32>,
        /// Use one processor per physical core instead of every logical one
        #[arg(long, default_value_t = false)]
        per_core: bool,
        /// Give up on a starter that sends no task within this many ms
        #[arg(long)]
        task_timeout_ms: Option<u64>,
        /// Function to integrate; must match the starter's
        #[arg(long, default_value = "arctan")]
        integrand: Integrand,
        #[command(flatten)]
        net: NetArgs,
    },
    /// Integrate on this machine only and report the wall time
    Local {
        /// Compute threads (defaults to one per usable processor)
        #[arg(short, long)]
        threads: Option<usize>,
        /// Use one processor per physical core instead of every logical one
        #[arg(long, default_value_t = false)]
        per_core: bool,
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Print the probed cpu topology and the usable processor sets
    Topology,
}

#[derive(Args, Debug)]
struct RangeArgs {
    #[arg(long, default_value_t = 0.)]
    from: f64,
    #[arg(long, default_value_t = 50_000.)]
    to: f64,
    /// Step width (defaults to 1 / to)
    #[arg(long)]
    step: Option<f64>,
    #[arg(long, default_value = "arctan")]
    integrand: Integrand,
}

impl RangeArgs {
    fn step(&self) -> f64 {
        self.step.unwrap_or(1. / self.to)
    }

    fn total_steps(&self) -> Result<u64, String> {
        let step = self.step();
        if !(step > 0.) || !(self.to > self.from) {
            return Err(format!(
                "need from < to and a positive step, got [{}, {}) by {}",
                self.from, self.to, step
            ));
        }
        Ok(((self.to - self.from) / step) as u64)
    }
}

#[derive(Args, Debug)]
struct NetArgs {
    #[arg(long, default_value_t = config::DISCOVERY_PORT)]
    discovery_port: u16,
    #[arg(long, default_value_t = config::TASK_PORT)]
    task_port: u16,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    match run(Cli::parse().command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Starter {
            range,
            net,
            broadcast,
            max_workers,
            accept_window_ms,
        } => {
            let total_steps = range.total_steps()?;
            let config = ClusterConfig::builder()
                .discovery_port(net.discovery_port)
                .task_port(net.task_port)
                .broadcast_addr(broadcast)
                .max_workers(max_workers)
                .accept_window(Duration::from_millis(accept_window_ms))
                .integrand(range.integrand)
                .build();

            let started = Instant::now();
            let (from, step) = (range.from, range.step());
            let summary = run_starter(config, total_steps, from, step).await?;
            if !summary.is_complete() {
                warn!(
                    lost = ?summary.lost,
                    "result is missing the share of lost workers"
                );
            }
            report(summary.result, range.to, started);
        }
        Command::Worker {
            threads,
            speed,
            per_core,
            task_timeout_ms,
            integrand,
            net,
        } => {
            let set = processor_set(per_core)?;
            let threads = threads.unwrap_or(set.len());
            let speed = match speed {
                Some(speed) => speed,
                None => i32::try_from(threads)?,
            };
            let mut config = ClusterConfig::builder()
                .discovery_port(net.discovery_port)
                .task_port(net.task_port)
                .integrand(integrand)
                .build();
            config.task_timeout = task_timeout_ms.map(Duration::from_millis);

            info!(%set, threads, speed, "starting worker");
            run_worker(config, speed, set, threads).await?;
        }
        Command::Local {
            threads,
            per_core,
            range,
        } => {
            let total_steps = range.total_steps()?;
            let set = processor_set(per_core)?;
            let threads = threads.unwrap_or(set.len());
            let executor = Executor::new(range.integrand);
            let (from, step) = (range.from, range.step());

            info!(%set, threads, total_steps, "integrating locally");
            let started = Instant::now();
            let result = spawn_blocking(move || {
                executor.run_local_scalable(
                    threads,
                    &set,
                    total_steps,
                    from,
                    step,
                )
            })
            .await??;
            report(result, range.to, started);
        }
        Command::Topology => {
            let topology = CpuTopology::probe()?;
            print!("{}", topology);
            println!("usable:          {}", topology.usable_all());
            println!("usable per core: {}", topology.usable());
        }
    }
    Ok(())
}

fn report(result: f64, to: f64, started: Instant) {
    println!("result: {:.15}", result);
    println!("+1/to : {:.15}", result + 1. / to);
    println!("time  : {:?}", started.elapsed());
}

/// The processors to compute on. Falls back to the affinity mask when sysfs
/// cannot be read.
fn processor_set(per_core: bool) -> Result<ProcessorSet, Box<dyn Error>> {
    let set = match CpuTopology::probe() {
        Ok(topology) => {
            debug!("{}", topology);
            if per_core {
                topology.usable()
            } else {
                topology.usable_all()
            }
        }
        Err(e) => {
            warn!("cpu topology unavailable, using the affinity mask: {}", e);
            process_affinity()?
        }
    };
    if set.is_empty() {
        return Err("no usable processors".into());
    }
    debug!(%set, "processor set");
    Ok(set)
}
