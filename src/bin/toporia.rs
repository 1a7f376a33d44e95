use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};

use toporia_realtime::broker::{Broker, GuardedBroker, MemoryBroker};
use toporia_realtime::channel::{ChannelRoute, ChannelRouter};
use toporia_realtime::circuit::CircuitBreaker;
use toporia_realtime::clock::{Clock, SystemClock};
use toporia_realtime::config::Config;
use toporia_realtime::consumer::records::pid_alive;
use toporia_realtime::consumer::{
    ConsumerWorker, ExecLauncher, Handler, HandlerContext, HandlerRegistry, ProcessRecordStore,
    Supervisor,
};
use toporia_realtime::error::Error;
use toporia_realtime::message::Message;
use toporia_realtime::task::{runner, JobRegistry};

#[derive(Parser)]
#[command(name = "toporia", version, about = "Toporia realtime broker tooling")]
struct Cli {
    /// JSON config file; defaults apply when omitted
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a supervised consumer (master/worker when --workers > 1)
    #[command(name = "broker:consume-scaled")]
    ConsumeScaled(ConsumeArgs),

    /// Inspect or control supervised workers
    #[command(name = "broker:consumer:status")]
    ConsumerStatus(StatusArgs),

    /// Emit producer/consumer/broker metrics
    #[command(name = "broker:metrics")]
    Metrics(MetricsArgs),

    /// List registered channel routes by type
    #[command(name = "channel:list")]
    ChannelList,

    /// Internal work-unit runner entry point
    #[command(name = "task:run", hide = true)]
    TaskRun,
}

#[derive(Args)]
struct ConsumeArgs {
    #[arg(long)]
    handler: String,
    #[arg(long)]
    driver: Option<String>,
    #[arg(long)]
    workers: Option<u32>,
    #[arg(long = "batch-size")]
    batch_size: Option<usize>,
    #[arg(long = "batch-timeout")]
    batch_timeout: Option<u64>,
    #[arg(long)]
    timeout: Option<u64>,
    #[arg(long = "max-messages")]
    max_messages: Option<u64>,
    #[arg(long = "memory-limit")]
    memory_limit: Option<u64>,
    #[arg(long = "graceful-timeout")]
    graceful_timeout: Option<u64>,
    #[arg(long = "state-dir", hide = true)]
    state_dir: Option<PathBuf>,
}

#[derive(Args)]
struct StatusArgs {
    /// Worker process id; omit to list recent processes
    process_id: Option<String>,
    /// Send SIGTERM to the recorded pid
    #[arg(long)]
    stop: bool,
    /// Send SIGKILL to the recorded pid
    #[arg(long)]
    kill: bool,
    /// Remove records of dead workers
    #[arg(long)]
    cleanup: bool,
    /// Remove every record
    #[arg(long = "clear-all")]
    clear_all: bool,
}

#[derive(Args)]
struct MetricsArgs {
    #[arg(long)]
    driver: Option<String>,
    #[arg(long, value_parser = ["table", "json", "prometheus"], default_value = "table")]
    format: String,
    /// Re-render every --interval seconds
    #[arg(long)]
    watch: bool,
    #[arg(long, default_value_t = 5)]
    interval: u64,
}

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_stop_signal(_sig: libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_stop_handler() {
    unsafe {
        libc::signal(libc::SIGTERM, on_stop_signal as libc::sighandler_t);
        libc::signal(libc::SIGINT, on_stop_signal as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_stop_handler() {}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::ConsumeScaled(args) => cmd_consume_scaled(config, args),
        Commands::ConsumerStatus(args) => cmd_consumer_status(config, args),
        Commands::Metrics(args) => cmd_metrics(config, args),
        Commands::ChannelList => cmd_channel_list(config),
        Commands::TaskRun => {
            let code = runner::run_from_env(&builtin_jobs());
            std::process::exit(code);
        }
    }
}

/// Handler that logs every message; the stand-in until applications
/// register their own handlers.
struct LogHandler {
    channels: Vec<String>,
}

impl Handler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }
    fn channels(&self) -> Vec<String> {
        self.channels.clone()
    }
    fn handle(&self, msg: &Message, ctx: &HandlerContext) -> toporia_realtime::Result<()> {
        log::info!(
            "[{}] {} on {:?}: {}",
            ctx.process_id,
            msg.id,
            msg.channel,
            msg.data
        );
        Ok(())
    }
}

fn builtin_handlers(config: &Config) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(LogHandler {
        channels: config.broker.topics.clone(),
    }));
    registry
}

fn builtin_jobs() -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry.register("ping", |_| Ok(serde_json::json!("pong")));
    registry.register("echo", |args| Ok(args));
    registry.register("sleep", |args| {
        let ms = args.as_u64().ok_or("sleep wants milliseconds")?;
        std::thread::sleep(Duration::from_millis(ms));
        Ok(serde_json::json!(ms))
    });
    registry
}

fn build_broker(driver: &str) -> anyhow::Result<Arc<dyn Broker>> {
    match driver {
        "memory" => Ok(Arc::new(MemoryBroker::new())),
        other => Err(anyhow!(Error::Fatal(format!(
            "unknown broker driver '{other}'"
        )))),
    }
}

fn cmd_consume_scaled(mut config: Config, args: ConsumeArgs) -> anyhow::Result<()> {
    let consumer = &mut config.consumer;
    consumer.handler = args.handler;
    if let Some(driver) = args.driver {
        consumer.driver = driver;
    }
    if let Some(workers) = args.workers {
        consumer.workers = workers;
    }
    if let Some(batch_size) = args.batch_size {
        consumer.batch_size = batch_size;
    }
    if let Some(ms) = args.batch_timeout {
        consumer.batch_timeout_ms = ms;
    }
    if let Some(ms) = args.timeout {
        consumer.timeout_ms = ms;
    }
    if let Some(n) = args.max_messages {
        consumer.max_messages = n;
    }
    if let Some(mb) = args.memory_limit {
        consumer.memory_limit_mb = mb;
    }
    if let Some(s) = args.graceful_timeout {
        consumer.graceful_timeout_s = s;
    }
    if let Some(dir) = args.state_dir {
        consumer.state_dir = dir;
    }

    let registry = builtin_handlers(&config);
    // Validate the handler before anything spawns; a bad name is a
    // misconfiguration, exit 1.
    let handler = registry.resolve(&config.consumer.handler)?;
    let clock = Arc::new(SystemClock);

    if config.consumer.workers >= 2 {
        drop(handler);
        let supervisor = Supervisor::new(config.consumer.clone(), clock)?;
        let launcher = ExecLauncher::new(config.consumer.clone());
        let stats = supervisor.run(&launcher)?;
        log::info!(
            "supervisor done: spawned={} reaped={}",
            stats.spawned,
            stats.reaped
        );
        return Ok(());
    }

    // Single-worker mode: consume in this process.
    install_stop_handler();
    let broker = build_broker(&config.consumer.driver)?;
    let breaker = Arc::new(CircuitBreaker::new(config.circuit.clone(), clock.clone()));
    let guarded: Arc<dyn Broker> = Arc::new(GuardedBroker::new(broker, breaker));

    let store = ProcessRecordStore::open(&config.consumer.state_dir)?;
    let mut worker = ConsumerWorker::new(guarded, handler, config.consumer.clone(), clock)
        .with_record_store(store);
    if let Ok(worker_id) = std::env::var(toporia_realtime::consumer::supervisor::WORKER_ID_ENV) {
        worker = worker.with_worker_id(worker_id);
    }

    let stop = worker.stop_flag();
    std::thread::spawn(move || loop {
        if STOP_REQUESTED.load(Ordering::SeqCst) {
            stop.store(true, Ordering::SeqCst);
            return;
        }
        std::thread::sleep(Duration::from_millis(200));
    });

    let stats = worker.run()?;
    log::info!(
        "worker done: {} messages, {} errors",
        stats.message_count,
        stats.error_count
    );
    Ok(())
}

fn cmd_consumer_status(config: Config, args: StatusArgs) -> anyhow::Result<()> {
    let store = ProcessRecordStore::open(&config.consumer.state_dir)?;
    let mut out = io::BufWriter::new(io::stdout());

    if args.clear_all {
        let removed = store.clear_all()?;
        writeln!(out, "removed {removed} records")?;
        return Ok(());
    }
    if args.cleanup {
        let now = SystemClock.now_ns();
        let removed = store.cleanup_stale(now, 60 * 1_000_000_000)?;
        writeln!(out, "removed {} stale records", removed.len())?;
        return Ok(());
    }

    let Some(process_id) = args.process_id else {
        let records = store.list()?;
        writeln!(
            out,
            "{:<38} {:<10} {:>8} {:<9} {:>10} {:>8}",
            "id", "handler", "pid", "status", "messages", "errors"
        )?;
        for record in records.iter().take(20) {
            writeln!(
                out,
                "{:<38} {:<10} {:>8} {:<9} {:>10} {:>8}",
                record.id,
                record.handler_name,
                record.pid,
                record.status.as_str(),
                record.message_count,
                record.error_count
            )?;
        }
        return Ok(());
    };

    let record = store.load(&process_id)?;
    if args.stop || args.kill {
        if !pid_alive(record.pid) {
            return Err(anyhow!("pid {} is not running", record.pid));
        }
        signal_pid(record.pid, args.kill)?;
        writeln!(
            out,
            "sent {} to pid {}",
            if args.kill { "SIGKILL" } else { "SIGTERM" },
            record.pid
        )?;
        return Ok(());
    }

    writeln!(out, "{}", serde_json::to_string_pretty(&record)?)?;
    Ok(())
}

#[cfg(unix)]
fn signal_pid(pid: u32, force: bool) -> anyhow::Result<()> {
    let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
    let res = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if res == 0 {
        Ok(())
    } else {
        Err(anyhow!(std::io::Error::last_os_error()).context("kill failed"))
    }
}

#[cfg(not(unix))]
fn signal_pid(_pid: u32, _force: bool) -> anyhow::Result<()> {
    Err(anyhow!("signalling is not supported on this platform"))
}

fn cmd_metrics(config: Config, args: MetricsArgs) -> anyhow::Result<()> {
    let driver = args.driver.as_deref().unwrap_or(&config.broker.driver);
    let broker = build_broker(driver)?;
    let store = ProcessRecordStore::open(&config.consumer.state_dir)?;

    loop {
        let snapshot = broker.metrics();
        let health = broker.health_check();
        let records = store.list().unwrap_or_default();
        let (worker_messages, worker_errors) = records
            .iter()
            .fold((0u64, 0u64), |(m, e), r| (m + r.message_count, e + r.error_count));

        let mut out = io::BufWriter::new(io::stdout());
        match args.format.as_str() {
            "json" => {
                let doc = serde_json::json!({
                    "broker": snapshot,
                    "health": health,
                    "workers": {
                        "records": records.len(),
                        "messages": worker_messages,
                        "errors": worker_errors,
                    },
                });
                writeln!(out, "{}", serde_json::to_string_pretty(&doc)?)?;
            }
            "prometheus" => {
                write!(out, "{}", snapshot.render_prometheus("toporia"))?;
                writeln!(out, "toporia_worker_messages_total {worker_messages}")?;
                writeln!(out, "toporia_worker_errors_total {worker_errors}")?;
            }
            _ => {
                write!(out, "{}", snapshot.render_table())?;
                writeln!(out, "health     {:>12?}", health.status)?;
                writeln!(out, "workers    {:>12}", records.len())?;
                writeln!(out, "w.messages {worker_messages:>12}")?;
                writeln!(out, "w.errors   {worker_errors:>12}")?;
            }
        }
        out.flush()?;

        if !args.watch {
            return Ok(());
        }
        std::thread::sleep(Duration::from_secs(args.interval.max(1)));
    }
}

fn cmd_channel_list(config: Config) -> anyhow::Result<()> {
    let mut router = ChannelRouter::new();
    for route_config in &config.realtime.channels {
        let route = ChannelRoute::new(route_config.pattern.clone())
            .with_context(|| format!("bad channel pattern '{}'", route_config.pattern))?
            .guards(route_config.guards.clone());
        router.add(route);
    }

    let mut out = io::BufWriter::new(io::stdout());
    writeln!(out, "{:<40} {:<10} guards", "pattern", "type")?;
    for route in router.routes() {
        writeln!(
            out,
            "{:<40} {:<10} {}",
            route.pattern,
            route.kind_label(),
            if route.guard_names().is_empty() {
                "-".to_string()
            } else {
                route.guard_names().join(",")
            }
        )?;
    }
    Ok(())
}
