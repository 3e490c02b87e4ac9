//! tracecmd: inspect trace-cmd `trace.dat` captures
//!
//! Prints per-CPU event summaries, header information and the event format
//! catalog of a capture.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::warn;
use serde::Serialize;

use tracecmd::{CpuSelector, EventView, Trace, TraceConfig, TraceSeq, Value};

#[derive(Parser)]
#[command(name = "tracecmd")]
#[command(about = "Read trace-cmd trace.dat captures")]
#[command(version)]
struct Cli {
    /// JSON file with reader options
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Skip malformed event formats instead of failing
    #[arg(long, global = true)]
    lenient: bool,

    /// Ignore the capture's time offset option
    #[arg(long, global = true)]
    no_time_offset: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every event, one CPU after another
    Report {
        /// Path to trace.dat
        file: PathBuf,

        /// Only report this CPU
        #[arg(long)]
        cpu: Option<usize>,

        /// Skip events before this timestamp (ns)
        #[arg(long, default_value_t = 0)]
        start: u64,

        /// Stop at events after this timestamp (ns)
        #[arg(long)]
        end: Option<u64>,

        /// Emit one JSON object per event
        #[arg(long)]
        json: bool,
    },
    /// Show header information and time ranges
    Info {
        /// Path to trace.dat
        file: PathBuf,
    },
    /// List event formats
    Formats {
        /// Path to trace.dat
        file: PathBuf,

        /// Only list this system
        #[arg(long)]
        system: Option<String>,
    },
}

#[derive(Serialize)]
struct EventJson<'a> {
    cpu: usize,
    timestamp: u64,
    system: &'a str,
    name: &'a str,
    pid: Option<i32>,
    comm: &'a str,
    fields: serde_json::Map<String, serde_json::Value>,
}

fn event_json(event: &EventView) -> Result<serde_json::Value> {
    let mut fields = serde_json::Map::new();
    for key in event.keys() {
        let value = match event.field(key) {
            Ok(value) => serde_json::to_value(value)?,
            Err(err) => serde_json::Value::String(format!("<{err}>")),
        };
        fields.insert(key.to_string(), value);
    }
    let json = EventJson {
        cpu: event.cpu(),
        timestamp: event.timestamp(),
        system: event.system(),
        name: event.name(),
        pid: event.pid().ok(),
        comm: event.comm(),
        fields,
    };
    Ok(serde_json::to_value(json)?)
}

fn sched_switch(seq: &mut TraceSeq, event: &EventView) {
    let comm = |name| event.str_field_lossy(name).unwrap_or_default();
    let pid = |name| event.num_field(name).unwrap_or(-1);
    seq.puts(&format!(
        " {}:{} ==> {}:{}",
        comm("prev_comm"),
        pid("prev_pid"),
        comm("next_comm"),
        pid("next_pid")
    ));
}

fn sched_wakeup(seq: &mut TraceSeq, event: &EventView) {
    seq.puts(&format!(
        " {}:{}",
        event.str_field_lossy("comm").unwrap_or_default(),
        event.num_field("pid").unwrap_or(-1)
    ));
}

fn load_config(cli: &Cli) -> Result<TraceConfig> {
    let mut config = match &cli.config {
        Some(path) => TraceConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => TraceConfig::default(),
    };
    if cli.lenient {
        config.strict_catalog = false;
    }
    if cli.no_time_offset {
        config.apply_time_offset = false;
    }
    Ok(config)
}

fn open(file: &Path, config: TraceConfig) -> Result<Trace> {
    if !file.exists() {
        bail!("Trace file not found: {}", file.display());
    }
    Trace::open_with(file, config).with_context(|| format!("Failed to open {}", file.display()))
}

fn run_report(
    mut trace: Trace,
    cpu: Option<usize>,
    start: u64,
    end: Option<u64>,
    json: bool,
) -> Result<()> {
    if let Some(cpu) = cpu {
        if cpu >= trace.cpus() {
            bail!("CPU {cpu} out of range (trace has {} cpus)", trace.cpus());
        }
    }
    trace.register_event_handler("sched", "sched_switch", sched_switch);
    trace.register_event_handler("sched", "sched_wakeup", sched_wakeup);

    let cpus: Vec<usize> = match cpu {
        Some(cpu) => vec![cpu],
        None => (0..trace.cpus()).collect(),
    };
    let mut seq = TraceSeq::new();
    let mut count = 0usize;
    for cpu in cpus {
        trace.seek(cpu, start)?;
        loop {
            let event = match trace.read_event(cpu) {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(err) => {
                    warn!("{err}");
                    break;
                }
            };
            if end.is_some_and(|end| event.timestamp() > end) {
                break;
            }
            count += 1;
            if json {
                println!("{}", event_json(&event)?);
                continue;
            }
            seq.clear();
            trace.dispatch(&event, &mut seq);
            println!("{event}{seq}");
        }
    }
    log::info!("Reported {count} events");
    Ok(())
}

fn format_time(ts: Option<u64>) -> String {
    match ts {
        Some(ts) => format!("{}.{:09}", ts / 1_000_000_000, ts % 1_000_000_000),
        None => "-".to_string(),
    }
}

fn run_info(mut trace: Trace) -> Result<()> {
    let header = trace.header();
    println!("version:     {}", header.version);
    println!("endian:      {:?}", trace.file_endian());
    println!("long size:   {}", header.long_size);
    println!("page size:   {}", header.page_size);
    println!("cpus:        {}", trace.cpus());
    println!("events:      {} formats", trace.catalog().len());
    println!("systems:     {}", trace.catalog().systems().join(", "));
    if let Some(uname) = header.uname() {
        println!("uname:       {uname}");
    }
    if let Some(clock) = header.trace_clock() {
        println!("clock:       {clock}");
    }
    if let Some(version) = header.tracer_version() {
        println!("trace-cmd:   {version}");
    }
    if header.time_offset() != 0 {
        println!("time offset: {}ns", header.time_offset());
    }

    for cpu in 0..trace.cpus() {
        let start = trace.start_time(CpuSelector::Cpu(cpu));
        let end = trace.end_time(CpuSelector::Cpu(cpu));
        println!("cpu{cpu:<3}      {} .. {}", format_time(start), format_time(end));
    }
    let start = trace.start_time(CpuSelector::All);
    let end = trace.end_time(CpuSelector::All);
    println!("trace:       {} .. {}", format_time(start), format_time(end));

    let mut total = 0usize;
    let mut corrupt = 0usize;
    for event in trace.events(CpuSelector::All, 0, None) {
        match event {
            Ok(_) => total += 1,
            Err(err) => {
                warn!("{err}");
                corrupt += 1;
            }
        }
    }
    println!("records:     {total} decoded, {corrupt} corrupt streams");
    Ok(())
}

fn run_formats(trace: Trace, system: Option<String>) -> Result<()> {
    for schema in trace.catalog().iter() {
        if system.as_deref().is_some_and(|s| s != schema.system) {
            continue;
        }
        println!("{} (id {})", schema.full_name(), schema.id);
        for field in &schema.fields {
            println!(
                "    {:>4}:{:<4} {} {} ({})",
                field.offset,
                field.size,
                field.type_name,
                field.name,
                serde_json::to_value(field.kind)?
            );
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = load_config(&cli)?;
    match cli.command {
        Commands::Report {
            file,
            cpu,
            start,
            end,
            json,
        } => run_report(open(&file, config)?, cpu, start, end, json),
        Commands::Info { file } => run_info(open(&file, config)?),
        Commands::Formats { file, system } => run_formats(open(&file, config)?, system),
    }
}
