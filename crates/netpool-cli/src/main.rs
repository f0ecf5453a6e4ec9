//! Operator tool for the netpool network slot pool.

use std::process;

use anyhow::{Context, Result, bail};
use netpool::Slot;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "\
Usage: netpool <command> [options]

Commands:
  topology <idx>                     Print the addressing plan of a slot as JSON
  reap <from> <to>                   Remove leftover resources of slots in [from, to)
  smoke [--count N] [--allow-internet]
                                     Take N slots from a fresh pool, print them, return them

Configuration is read from NETPOOL_* environment variables.";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Topology { idx: u32 },
    Reap { from: u32, to: u32 },
    Smoke { count: usize, allow_internet: bool },
}

/// Initialize tracing with NETPOOL_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("NETPOOL_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("netpool={level},netpool_cli={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(command).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let mut rest = args.iter().skip(1).map(String::as_str); // skip argv[0]

    let command = match rest.next() {
        Some("topology") => {
            let idx = parse_idx(rest.next(), "<idx>", netpool::MAX_SLOTS - 1)?;
            Command::Topology { idx }
        }
        Some("reap") => {
            let from = parse_idx(rest.next(), "<from>", netpool::MAX_SLOTS - 1)?;
            // Exclusive bound.
            let to = parse_idx(rest.next(), "<to>", netpool::MAX_SLOTS)?;
            if from >= to {
                return Err(format!("empty range: {from}..{to}"));
            }
            Command::Reap { from, to }
        }
        Some("smoke") => {
            let mut count = 1;
            let mut allow_internet = false;
            while let Some(arg) = rest.next() {
                match arg {
                    "--count" => {
                        let value = rest.next().ok_or("--count requires a value")?;
                        count = value
                            .parse()
                            .map_err(|_| format!("invalid --count: {value}"))?;
                    }
                    "--allow-internet" => allow_internet = true,
                    other => return Err(format!("unknown flag: {other}")),
                }
            }
            if count == 0 {
                return Err("--count must be at least 1".to_string());
            }
            return Ok(Command::Smoke {
                count,
                allow_internet,
            });
        }
        Some("--help") | Some("-h") | None => return Err(String::new()),
        Some(other) => return Err(format!("unknown command: {other}")),
    };

    match rest.next() {
        Some(extra) => Err(format!("unexpected argument: {extra}")),
        None => Ok(command),
    }
}

fn parse_idx(arg: Option<&str>, name: &str, max: u32) -> Result<u32, String> {
    let arg = arg.ok_or_else(|| format!("missing required argument: {name}"))?;
    let idx: u32 = arg.parse().map_err(|_| format!("invalid {name}: {arg}"))?;
    if idx > max {
        return Err(format!("{name} must be at most {max}"));
    }
    Ok(idx)
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Topology { idx } => {
            let topology = Slot::new(idx).topology();
            println!("{}", serde_json::to_string_pretty(&topology)?);
            Ok(())
        }
        Command::Reap { from, to } => reap(from, to).await,
        Command::Smoke {
            count,
            allow_internet,
        } => smoke(count, allow_internet).await,
    }
}

#[cfg(target_os = "linux")]
async fn reap(from: u32, to: u32) -> Result<()> {
    use netpool::{LinuxNetOps, NamespaceWorker, PoolConfig, reap_dangling};

    let config = PoolConfig::from_env();
    let ops = LinuxNetOps::new(config.netns_dir.clone());
    let worker = NamespaceWorker::spawn(Box::new(ops)).context("failed to start namespace worker")?;

    let egress = match config.egress_interface {
        Some(interface) => interface,
        None => worker
            .run(|ops| ops.egress_interface())
            .await?
            .context("failed to detect egress interface")?,
    };

    let mut failed = 0usize;
    for idx in from..to {
        let egress = egress.clone();
        let (_, result) = worker
            .with_slot(Slot::new(idx), move |ops, slot| reap_dangling(ops, slot, &egress))
            .await?;
        if result.is_err() {
            failed += 1;
        }
    }

    tracing::info!(from, to, failed, "Reap finished");
    if failed > 0 {
        bail!("{failed} slot(s) could not be fully reaped");
    }
    Ok(())
}

#[cfg(target_os = "linux")]
async fn smoke(count: usize, allow_internet: bool) -> Result<()> {
    use netpool::{NetworkPool, PoolConfig};
    use prometheus::Registry;
    use tokio_util::sync::CancellationToken;

    let config = PoolConfig::from_env();
    let lifetime = CancellationToken::new();
    let registry = Registry::new();
    let pool = NetworkPool::new(&lifetime, &registry, config).context("failed to start pool")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, cancelling");
                cancel.cancel();
            }
        });
    }

    let mut slots = Vec::with_capacity(count);
    let mut outcome: Result<()> = Ok(());
    for _ in 0..count {
        match pool.get(&cancel, allow_internet).await {
            Ok(slot) => slots.push(slot),
            Err(e) => {
                outcome = Err(e).context("failed to get slot");
                break;
            }
        }
    }

    let topologies: Vec<_> = slots.iter().map(Slot::topology).collect();
    println!("{}", serde_json::to_string_pretty(&topologies)?);

    for slot in slots {
        let idx = slot.idx();
        if let Err(e) = pool.put_back(slot).await {
            tracing::error!(slot = idx, error = %e, "Failed to return slot");
        }
    }

    for family in registry.gather() {
        for metric in family.get_metric() {
            tracing::info!(
                metric = family.get_name(),
                value = metric.get_gauge().get_value(),
                "Pool gauge"
            );
        }
    }

    pool.close().await.context("failed to close pool")?;
    outcome
}

#[cfg(not(target_os = "linux"))]
async fn reap(_from: u32, _to: u32) -> Result<()> {
    bail!("reap requires Linux network namespaces")
}

#[cfg(not(target_os = "linux"))]
async fn smoke(_count: usize, _allow_internet: bool) -> Result<()> {
    bail!("smoke requires Linux network namespaces")
}
