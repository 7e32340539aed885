//! pulse-runner: line-oriented command runner for the Money Pulse core.
//!
//! Reads one JSON request per line from stdin (or `--input`), writes one JSON
//! response per line to stdout.
//!
//! Usage:
//!   pulse-runner --db pulse.db --config data/core_config.json
//!   pulse-runner --user 6f1c7b8e-8a52-4a8e-9a0c-1d2e3f405162 < commands.jsonl
//!
//! A request is a command object, optionally carrying the caller:
//!   {"cmd":"get_account","account_id":"…"}
//!   {"cmd":"review_transaction","transaction_id":"…","decision":"approve",
//!    "principal":{"user_id":"…","role":"reviewer"},"timeout_ms":5000}

use anyhow::{Context, Result};
use pulse_core::{
    aml_scorer::StaticScreening,
    clock::SystemClock,
    command::{Command, Response},
    config::CoreConfig,
    context::{Principal, RequestContext},
    engine::Engine,
    error::{ErrorKind, ErrorResponse},
    rng::{SeededSuffixes, SuffixSource, ThreadRngSuffixes},
    store::Store,
};
use std::env;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(serde::Deserialize)]
struct Request {
    #[serde(default)]
    principal: Option<Principal>,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(flatten)]
    command: Command,
}

/// Screening lists loaded with `--screening`.
#[derive(serde::Deserialize, Default)]
#[serde(default)]
struct ScreeningLists {
    sanctions: Vec<Uuid>,
    pep: Vec<Uuid>,
    watchlist: Vec<Uuid>,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let db = flag(&args, "--db").unwrap_or(":memory:");
    let config = match flag(&args, "--config") {
        Some(path) => CoreConfig::load(path)?,
        None => CoreConfig::default(),
    };
    let user = match flag(&args, "--user") {
        Some(raw) => Uuid::parse_str(raw).with_context(|| format!("--user '{raw}' is not a uuid"))?,
        None => Uuid::nil(),
    };
    let default_principal = if user.is_nil() { Principal::system() } else { Principal::customer(user) };

    let suffixes: Arc<dyn SuffixSource> = match flag(&args, "--seed") {
        Some(raw) => Arc::new(SeededSuffixes::new(raw.parse().context("--seed must be an integer")?)),
        None => Arc::new(ThreadRngSuffixes),
    };
    let screening = match flag(&args, "--screening") {
        Some(path) => load_screening(path)?,
        None => StaticScreening::new(),
    };

    let store = if db == ":memory:" {
        Store::in_memory()?
    } else {
        Store::open(db, &config.store)?
    };
    let engine = Engine::build(store, config, Arc::new(SystemClock), suffixes, Arc::new(screening))?;
    log::info!("pulse-runner ready on {db}");

    let input: Box<dyn BufRead> = match flag(&args, "--input") {
        Some(path) => Box::new(BufReader::new(File::open(path).with_context(|| format!("Cannot open {path}"))?)),
        None => Box::new(BufReader::new(io::stdin())),
    };
    run(&engine, input, &default_principal)
}

fn run(engine: &Engine, input: Box<dyn BufRead>, default_principal: &Principal) -> Result<()> {
    let mut stdout = io::stdout().lock();
    let (mut ok, mut failed) = (0u64, 0u64);

    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        // Through a `Value` so flattened float fields decode beside exact amounts.
        let request = serde_json::from_str::<serde_json::Value>(&line).and_then(serde_json::from_value::<Request>);
        let response = match request {
            Ok(req) => {
                let ctx = context_for(&req, default_principal);
                engine.dispatch(&ctx, req.command)
            }
            Err(e) => Response::Error {
                error: ErrorResponse {
                    code: "malformed_request".into(),
                    kind: ErrorKind::Validation,
                    message: e.to_string(),
                    fields: Vec::new(),
                    correlation_id: Uuid::new_v4().to_string(),
                },
            },
        };
        if response.is_ok() {
            ok += 1;
        } else {
            failed += 1;
        }
        writeln!(stdout, "{}", serde_json::to_string(&response)?)?;
        stdout.flush()?;
    }

    log::info!("processed {} request(s): {ok} ok, {failed} failed", ok + failed);
    let audit_rows = engine
        .store()
        .read(&RequestContext::system())
        .and_then(|uow| uow.audit_count())?;
    log::info!("audit log holds {audit_rows} record(s)");
    Ok(())
}

fn context_for(req: &Request, default_principal: &Principal) -> RequestContext {
    let principal = req.principal.clone().unwrap_or_else(|| default_principal.clone());
    let mut ctx = RequestContext::new(principal);
    if let Some(id) = &req.correlation_id {
        ctx = ctx.with_correlation_id(id.clone());
    }
    if let Some(ms) = req.timeout_ms {
        ctx = ctx.with_timeout(Duration::from_millis(ms));
    }
    ctx
}

fn load_screening(path: &str) -> Result<StaticScreening> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Cannot read {path}"))?;
    let lists: ScreeningLists = serde_json::from_str(&content).with_context(|| format!("Cannot parse {path}"))?;
    let mut screening = StaticScreening::new();
    for id in lists.sanctions {
        screening = screening.with_sanctioned(id);
    }
    for id in lists.pep {
        screening = screening.with_pep(id);
    }
    for id in lists.watchlist {
        screening = screening.with_watchlist(id);
    }
    Ok(screening)
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == name).map(|w| w[1].as_str())
}
