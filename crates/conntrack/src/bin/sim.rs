//! conntrack-sim: drive an Instance with synthetic UDP flows and dump its state.

use std::process;
use std::time::{Duration, Instant};

use anyhow::Context;
use conntrack::config::parse_capacity;
use conntrack::{
    CancellationToken, Capacity, ConntrackConfig, Entry, Instance, Priority, cancel_after,
};
use tokio::task::JoinSet;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const MAX_PRIORITY_CLASSES: usize = 1024;
/// Remote addresses are drawn from 10.0.0.0/8.
const MAX_DISTINCT_ENTRIES: usize = 1 << 24;

#[derive(Debug)]
struct Args {
    flows: usize,
    distinct: Option<usize>,
    capacity: Option<Capacity>,
    timeout: Option<Duration>,
    hold: Duration,
    deadline: Option<Duration>,
    priorities: usize,
    json: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            flows: 64,
            distinct: None,
            capacity: None,
            timeout: None,
            hold: Duration::from_millis(10),
            deadline: None,
            priorities: 2,
            json: false,
        }
    }
}

#[tokio::main]
async fn main() {
    let argv: Vec<String> = std::env::args().collect();

    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: conntrack-sim [options]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --flows <n>               Number of simulated flows [default: 64]");
            eprintln!("  --distinct <n>            Distinct entries shared by the flows, at most 16777216 [default: flows]");
            eprintln!("  --max-entries <n|unlimited>  Slot ceiling [default: CONNTRACK_MAX_ENTRIES or 16384]");
            eprintln!("  --timeout-ms <ms>         Linger after release [default: CONNTRACK_TIMEOUT or 30s]");
            eprintln!("  --hold-ms <ms>            How long each flow keeps its slot [default: 10]");
            eprintln!("  --deadline-ms <ms>        Give up waiting after this long [default: never]");
            eprintln!("  --priorities <n>          Number of priority classes [default: 2]");
            eprintln!("  --json                    Print status snapshots as JSON");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(args).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("CONNTRACK_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("conntrack={level},conntrack_sim={level}"))
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

fn parse_args(argv: &[String]) -> Result<Args, String> {
    fn value<'a>(argv: &'a [String], i: usize, flag: &str) -> Result<&'a str, String> {
        argv.get(i)
            .map(String::as_str)
            .ok_or_else(|| format!("{flag} requires a value"))
    }

    fn number(raw: &str, flag: &str) -> Result<u64, String> {
        raw.parse::<u64>()
            .map_err(|_| format!("{flag} expects a non-negative integer, got '{raw}'"))
    }

    fn count(raw: &str, flag: &str) -> Result<usize, String> {
        usize::try_from(number(raw, flag)?)
            .map_err(|_| format!("{flag} is too large for this platform, got '{raw}'"))
    }

    let mut args = Args::default();
    let mut i = 1; // skip argv[0]
    while i < argv.len() {
        let flag = argv[i].as_str();
        match flag {
            "--flows" => {
                i += 1;
                args.flows = count(value(argv, i, flag)?, flag)?;
            }
            "--distinct" => {
                i += 1;
                let n = count(value(argv, i, flag)?, flag)?;
                if n == 0 || n > MAX_DISTINCT_ENTRIES {
                    return Err(format!(
                        "--distinct must be between 1 and {MAX_DISTINCT_ENTRIES}"
                    ));
                }
                args.distinct = Some(n);
            }
            "--max-entries" => {
                i += 1;
                let raw = value(argv, i, flag)?;
                args.capacity = Some(parse_capacity(raw).ok_or_else(|| {
                    format!("--max-entries expects an integer or 'unlimited', got '{raw}'")
                })?);
            }
            "--timeout-ms" => {
                i += 1;
                args.timeout = Some(Duration::from_millis(number(value(argv, i, flag)?, flag)?));
            }
            "--hold-ms" => {
                i += 1;
                args.hold = Duration::from_millis(number(value(argv, i, flag)?, flag)?);
            }
            "--deadline-ms" => {
                i += 1;
                args.deadline = Some(Duration::from_millis(number(value(argv, i, flag)?, flag)?));
            }
            "--priorities" => {
                i += 1;
                let n = count(value(argv, i, flag)?, flag)?;
                if n == 0 || n > MAX_PRIORITY_CLASSES {
                    return Err(format!(
                        "--priorities must be between 1 and {MAX_PRIORITY_CLASSES}"
                    ));
                }
                args.priorities = n;
            }
            "--json" => args.json = true,
            "--help" | "-h" => return Err(String::new()),
            other => return Err(format!("unknown argument: {other}")),
        }
        i += 1;
    }
    Ok(args)
}

fn flow_entry(flow: usize, distinct: usize) -> Entry {
    let n = flow % distinct;
    Entry::new(
        "udp",
        "127.0.0.1:6881",
        format!("10.{}.{}.{}:6881", (n >> 16) & 0xff, (n >> 8) & 0xff, n & 0xff),
    )
}

fn print_status(instance: &Instance, json: bool) -> anyhow::Result<()> {
    if json {
        let status = serde_json::to_string_pretty(&instance.status())
            .context("serializing status snapshot")?;
        println!("{status}");
    } else {
        instance
            .write_status(&mut std::io::stdout().lock())
            .context("writing status")?;
    }
    Ok(())
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = ConntrackConfig::from_env().context("reading configuration from environment")?;
    if let Some(capacity) = args.capacity {
        config.capacity = capacity;
    }
    if let Some(timeout) = args.timeout {
        config.default_timeout = timeout;
    }

    tracing::info!(
        capacity = ?config.capacity,
        linger = ?config.default_timeout,
        flows = args.flows,
        "Starting simulation"
    );

    let instance = Instance::with_config(config);
    let root = CancellationToken::new();
    let distinct = args
        .distinct
        .unwrap_or(args.flows.clamp(1, MAX_DISTINCT_ENTRIES));
    let started = Instant::now();

    let mut flows = JoinSet::new();
    for flow in 0..args.flows {
        let instance = instance.clone();
        let cancel = match args.deadline {
            Some(deadline) => cancel_after(&root, deadline),
            None => root.child_token(),
        };
        let priority = Priority((flow % args.priorities) as i32);
        let entry = flow_entry(flow, distinct);
        let reason = format!("class-{priority}");
        let hold = args.hold;

        flows.spawn(async move {
            let Some(handle) = instance.wait(&cancel, entry, reason, priority).await else {
                return false;
            };
            tokio::time::sleep(hold).await;
            handle.done();
            true
        });
    }

    tokio::time::sleep(args.hold / 2).await;
    println!("== while running");
    print_status(&instance, args.json)?;

    let (mut admitted, mut cancelled) = (0usize, 0usize);
    while let Some(outcome) = flows.join_next().await {
        if outcome.context("flow task failed")? {
            admitted += 1;
        } else {
            cancelled += 1;
        }
    }

    println!();
    println!("== finished");
    print_status(&instance, args.json)?;
    println!();
    println!(
        "{admitted} admitted, {cancelled} cancelled in {:?}",
        started.elapsed()
    );

    tracing::info!(admitted, cancelled, "Simulation complete");
    Ok(())
}
