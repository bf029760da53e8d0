//! payout-runner: scheduler-side driver for the ledger engine.
//!
//! Usage:
//!   payout-runner --db ledger.db --ticks 60 --workers 4
//!   payout-runner --db ledger.db --plans plans.json --ipc-mode
//!
//! Flags:
//!   --db PATH        database file (created and migrated if missing)
//!   --config PATH    engine config JSON (defaults otherwise)
//!   --plans PATH     JSON array of plan specs to publish at startup
//!   --ticks N        ticks to run; 0 runs until Ctrl-C (default 1)
//!   --workers N      concurrent processor workers (default 1)
//!   --reconcile      run a reconciliation pass before exiting
//!   --ipc-mode       read JSON-lines commands on stdin instead of ticking
//!
//! Ctrl-C raises the shared shutdown flag: every worker finishes its
//! current batch and the summary is still printed. A second Ctrl-C exits
//! at once.

use anyhow::{bail, Result};
use ledger_core::{
    catalog::PlanSpec,
    clock::{Clock, SystemClock},
    config::EngineConfig,
    engine::LedgerEngine,
    error::LedgerError,
    ledger::TransactionFilter,
    lifecycle::{CloseOptions, OpenRequest},
    processor::TickReport,
    types::{InvestmentStatus, Money},
};
use serde_json::json;
use std::env;
use std::io::{self, BufRead, Write};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

/// Longest stretch a sleeping worker goes without checking for shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcCommand {
    CreatePlan {
        plan: PlanSpec,
    },
    ListPlans,
    DeactivatePlan {
        plan_id: String,
    },
    Deposit {
        user_id:   String,
        amount:    Money,
        reference: String,
    },
    Withdraw {
        user_id:   String,
        amount:    Money,
        reference: String,
    },
    Open {
        request: OpenRequest,
    },
    Close {
        investment_id: String,
        reason:        String,
        #[serde(default)]
        admin_override: bool,
    },
    Balance {
        user_id: String,
    },
    History {
        user_id: String,
        #[serde(default)]
        filter:  TransactionFilter,
        #[serde(default)]
        limit:   Option<usize>,
    },
    Tick,
    Reconcile,
    Quit,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let ticks = parse_arg(&args, "--ticks", 1u64);
    let workers = parse_arg(&args, "--workers", 1usize).max(1);
    let ipc_mode = args.iter().any(|a| a == "--ipc-mode");
    let reconcile = args.iter().any(|a| a == "--reconcile");
    let db = arg_value(&args, "--db").unwrap_or("ledger.db").to_string();
    let config = match arg_value(&args, "--config") {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    if db == ":memory:" && workers > 1 {
        bail!("--workers > 1 needs a file database; in-memory connections are isolated");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let engine = LedgerEngine::open(&db, config.clone(), Arc::clone(&clock))?
        .with_worker_id("runner-0");

    if let Some(path) = arg_value(&args, "--plans") {
        publish_plans(&engine, path)?;
    }

    if ipc_mode {
        return run_ipc_loop(&engine);
    }

    println!("payout-runner");
    println!("  db:        {db}");
    println!("  ticks:     {}", if ticks == 0 { "unbounded".to_string() } else { ticks.to_string() });
    println!("  workers:   {workers}");
    println!("  interval:  {}s", config.tick_interval_secs);
    println!();

    let shutdown = engine.shutdown_handle();
    stop_on_ctrl_c(Arc::clone(&shutdown))?;
    let mut reports = Vec::new();
    if workers == 1 {
        reports.extend(run_worker(&engine, ticks, &shutdown)?);
    } else {
        let handles: Vec<_> = (0..workers)
            .map(|i| {
                let db = db.clone();
                let config = config.clone();
                let clock = Arc::clone(&clock);
                let shutdown = Arc::clone(&shutdown);
                thread::spawn(move || -> Result<Vec<TickReport>> {
                    let engine = LedgerEngine::open(&db, config, clock)?
                        .with_worker_id(&format!("runner-{i}"));
                    run_worker(&engine, ticks, &shutdown)
                })
            })
            .collect();
        for handle in handles {
            match handle.join() {
                Ok(result) => reports.extend(result?),
                Err(_) => bail!("worker thread panicked"),
            }
        }
    }

    print_summary(&engine, &reports)?;

    if reconcile {
        let report = engine.reconcile()?;
        println!();
        println!("=== RECONCILIATION ===");
        println!("  users checked:  {}", report.users_checked);
        println!("  cache entries:  {}", report.cache_entries_checked);
        println!("  drifts:         {}", report.drifts.len());
        for d in &report.drifts {
            println!("    {} {:?}: stored {} derived {}", d.user_id, d.source, d.stored, d.derived);
        }
    }
    Ok(())
}

fn run_worker(engine: &LedgerEngine, ticks: u64, shutdown: &Arc<AtomicBool>) -> Result<Vec<TickReport>> {
    let processor = engine.processor().with_shutdown(Arc::clone(shutdown));
    let interval = engine.config.tick_interval();
    let mut reports = Vec::new();
    let mut n = 0u64;
    loop {
        match processor.tick() {
            Ok(report) => reports.push(report),
            // The whole tick failed (e.g. claiming stayed busy). Next tick retries.
            Err(e) => log::error!("runner[{}]: tick failed: {e}", engine.worker_id()),
        }
        n += 1;
        if ticks != 0 && n >= ticks {
            break;
        }
        if !sleep_unless_stopped(interval, shutdown) {
            log::info!("runner[{}]: stopping after {n} tick(s)", engine.worker_id());
            break;
        }
    }
    Ok(reports)
}

/// Sleep for `interval`, waking early if shutdown is raised.
/// Returns false when the worker should stop.
fn sleep_unless_stopped(interval: Duration, shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + interval;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(SHUTDOWN_POLL.min(deadline - now));
    }
}

/// Raise `shutdown` on the first Ctrl-C; exit on the second.
fn stop_on_ctrl_c(shutdown: Arc<AtomicBool>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    thread::Builder::new()
        .name("ctrl-c".into())
        .spawn(move || {
            runtime.block_on(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    log::warn!("runner: cannot listen for Ctrl-C: {e}");
                    return;
                }
                log::info!("runner: Ctrl-C received, finishing the current batch");
                shutdown.store(true, Ordering::SeqCst);

                if tokio::signal::ctrl_c().await.is_ok() {
                    log::warn!("runner: second Ctrl-C, exiting now");
                    std::process::exit(130);
                }
            })
        })?;
    Ok(())
}

fn publish_plans(engine: &LedgerEngine, path: &str) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
    let specs: Vec<PlanSpec> = serde_json::from_str(&content)?;
    let existing = engine.catalog().list_all_plans()?;
    for spec in specs {
        if existing.iter().any(|p| p.terms.name == spec.name) {
            log::info!("runner: plan '{}' already published, skipping", spec.name);
            continue;
        }
        engine.create_plan(spec)?;
    }
    Ok(())
}

fn run_ipc_loop(engine: &LedgerEngine) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        let bytes_read = handle.read_line(&mut buffer)?;
        if bytes_read == 0 {
            break; // EOF
        }
        if buffer.trim().is_empty() {
            continue;
        }

        let cmd: IpcCommand = match serde_json::from_str(&buffer) {
            Ok(c) => c,
            Err(e) => {
                writeln!(stdout, "{}", json!({ "error": e.to_string(), "retryable": false }))?;
                stdout.flush()?;
                continue;
            }
        };
        if matches!(cmd, IpcCommand::Quit) {
            break;
        }

        let response = match handle_command(engine, cmd) {
            Ok(value) => json!({ "ok": value }),
            Err(e) => json!({ "error": e.to_string(), "retryable": e.is_retryable() }),
        };
        writeln!(stdout, "{response}")?;
        stdout.flush()?;
    }
    Ok(())
}

fn handle_command(engine: &LedgerEngine, cmd: IpcCommand) -> Result<serde_json::Value, LedgerError> {
    let value = match cmd {
        IpcCommand::CreatePlan { plan } => serde_json::to_value(engine.create_plan(plan)?)?,
        IpcCommand::ListPlans => serde_json::to_value(engine.list_active_plans()?)?,
        IpcCommand::DeactivatePlan { plan_id } => {
            serde_json::to_value(engine.catalog().deactivate_plan(&plan_id)?)?
        }
        IpcCommand::Deposit { user_id, amount, reference } => {
            serde_json::to_value(engine.deposit(&user_id, amount, &reference)?.into_transaction())?
        }
        IpcCommand::Withdraw { user_id, amount, reference } => {
            serde_json::to_value(engine.withdraw(&user_id, amount, &reference)?.into_transaction())?
        }
        IpcCommand::Open { request } => serde_json::to_value(engine.lifecycle().open(request)?)?,
        IpcCommand::Close { investment_id, reason, admin_override } => serde_json::to_value(
            engine.close(&investment_id, &reason, CloseOptions { admin_override })?,
        )?,
        IpcCommand::Balance { user_id } => json!({
            "user_id": user_id,
            "balance": engine.compute_balance(&user_id)?,
        }),
        IpcCommand::History { user_id, filter, limit } => {
            let rows = engine
                .list_for_user(&user_id, filter)
                .take(limit.unwrap_or(usize::MAX))
                .collect::<Result<Vec<_>, _>>()?;
            serde_json::to_value(rows)?
        }
        IpcCommand::Tick => serde_json::to_value(engine.tick()?)?,
        IpcCommand::Reconcile => serde_json::to_value(engine.reconcile()?)?,
        IpcCommand::Quit => serde_json::Value::Null,
    };
    Ok(value)
}

fn print_summary(engine: &LedgerEngine, reports: &[TickReport]) -> Result<()> {
    let credited: usize = reports.iter().map(|r| r.credited).sum();
    let replayed: usize = reports.iter().map(|r| r.replayed).sum();
    let matured: usize = reports.iter().map(|r| r.matured).sum();
    let failed: usize = reports.iter().map(|r| r.failed.len()).sum();
    let now = engine.clock().now();

    println!("=== RUN SUMMARY ===");
    println!("  ticks run:      {}", reports.len());
    println!("  credited:       {credited}");
    println!("  replayed:       {replayed}");
    println!("  matured:        {matured}");
    println!("  failed:         {failed}");
    println!("  still due:      {}", engine.store.due_count(now)?);
    println!("  active:         {}", engine.store.investment_count_by_status(InvestmentStatus::Active)?);
    println!("  paused:         {}", engine.store.investment_count_by_status(InvestmentStatus::Paused)?);
    println!("  matured total:  {}", engine.store.investment_count_by_status(InvestmentStatus::Matured)?);
    println!("  closed:         {}", engine.store.investment_count_by_status(InvestmentStatus::Closed)?);
    println!("  ledger rows:    {}", engine.store.transaction_count()?);
    Ok(())
}

fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
