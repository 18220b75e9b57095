//! Workload generator for exercising a relay cluster through its proxy.
//!
//! Each client opens one PostgreSQL connection, inserts users with generated
//! ids and then reads random inserted rows back. A read that does not see a
//! row the same client inserted is counted as stale.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::time;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "relay-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Proxy address, `host:port`.
    #[arg(long, default_value = "127.0.0.1:5432")]
    addr: String,

    /// Inserts issued by each client.
    #[arg(long, default_value_t = 100)]
    inserts: usize,

    /// Reads issued by each client after its inserts.
    #[arg(long, default_value_t = 100)]
    reads: usize,

    /// Number of concurrent clients (each client uses one connection).
    #[arg(long, default_value_t = 1)]
    clients: usize,

    #[arg(long, default_value = "app")]
    user: String,

    #[arg(long, default_value = "app")]
    dbname: String,

    /// Per-statement timeout.
    #[arg(long, default_value = "10s")]
    op_timeout: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Optionally write the JSON report to this path.
    #[arg(long)]
    out: Option<PathBuf>,
}

/// Totals for one client, summed into the run report.
#[derive(serde::Serialize, Debug, Clone, Default)]
struct Report {
    inserts_ok: u64,
    inserts_failed: u64,
    reads_ok: u64,
    reads_stale: u64,
    reads_failed: u64,
    elapsed_ms: u64,
    errors: Vec<String>,
}

/// Errors kept per report; the counters still cover every failure.
const MAX_REPORTED_ERRORS: usize = 20;

impl Report {
    fn record_error(&mut self, error: String) {
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push(error);
        }
    }

    fn merge(&mut self, other: Report) {
        self.inserts_ok += other.inserts_ok;
        self.inserts_failed += other.inserts_failed;
        self.reads_ok += other.reads_ok;
        self.reads_stale += other.reads_stale;
        self.reads_failed += other.reads_failed;
        for error in other.errors {
            self.record_error(error);
        }
    }

    fn failures(&self) -> u64 {
        self.inserts_failed + self.reads_stale + self.reads_failed
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.clients > 0, "--clients must be > 0");
    let (host, port) = args
        .addr
        .rsplit_once(':')
        .with_context(|| format!("invalid proxy address {:?} (expected host:port)", args.addr))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in {:?}", args.addr))?;
    let config = format!(
        "host={host} port={port} user={} dbname={}",
        args.user, args.dbname
    );

    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    let op_timeout: Duration = args.op_timeout.into();

    let setup = connect(&config).await?;
    time::timeout(
        op_timeout,
        setup.simple_query("CREATE TABLE IF NOT EXISTS users (id TEXT PRIMARY KEY, name TEXT, email TEXT)"),
    )
    .await
    .context("create table timed out")?
    .context("create table")?;
    drop(setup);

    let start = time::Instant::now();
    let mut tasks = Vec::with_capacity(args.clients);
    for client_id in 0..args.clients {
        let config = config.clone();
        let (inserts, reads) = (args.inserts, args.reads);
        // Mix the base seed with the client id for deterministic per-client RNG.
        let seed = seed ^ (client_id as u64).wrapping_mul(0x9e3779b97f4a7c15);
        tasks.push(tokio::spawn(async move {
            run_client(client_id, &config, inserts, reads, seed, op_timeout).await
        }));
    }

    let mut report = Report::default();
    for task in tasks {
        report.merge(task.await.context("client task panicked")??);
    }
    report.elapsed_ms = start.elapsed().as_millis() as u64;

    let json = serde_json::to_string_pretty(&report).context("serialize report")?;
    println!("{json}");
    if let Some(path) = &args.out {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
        std::fs::write(path, &json).with_context(|| format!("write {}", path.display()))?;
        eprintln!("wrote report: {}", path.display());
    }

    anyhow::ensure!(
        report.failures() == 0,
        "{} of {} operations failed (seed {seed})",
        report.failures(),
        (args.inserts + args.reads) * args.clients
    );
    Ok(())
}

async fn connect(config: &str) -> anyhow::Result<Client> {
    let (client, connection) = tokio_postgres::connect(config, NoTls)
        .await
        .with_context(|| format!("connect with {config:?}"))?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            eprintln!("connection error: {err}");
        }
    });
    Ok(client)
}

async fn run_client(
    client_id: usize,
    config: &str,
    inserts: usize,
    reads: usize,
    seed: u64,
    op_timeout: Duration,
) -> anyhow::Result<Report> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut report = Report::default();
    let client = connect(config).await?;

    let mut inserted = Vec::with_capacity(inserts);
    for seq in 0..inserts {
        let id = uuid::Uuid::new_v4().to_string();
        let sql = format!(
            "INSERT INTO users (id, name, email) VALUES ('{id}', 'client {client_id} user {seq}', 'u{seq}@c{client_id}.example') RETURNING *"
        );
        match query(&client, &sql, op_timeout).await {
            Ok(rows) if rows.iter().any(|row| row.first() == Some(&Some(id.clone()))) => {
                report.inserts_ok += 1;
                inserted.push(id);
            }
            Ok(rows) => {
                report.inserts_failed += 1;
                report.record_error(format!("insert {id} returned {rows:?}"));
            }
            Err(err) => {
                report.inserts_failed += 1;
                report.record_error(format!("insert {id}: {err:#}"));
            }
        }
    }

    if inserted.is_empty() {
        return Ok(report);
    }
    for _ in 0..reads {
        let id = &inserted[rng.gen_range(0..inserted.len())];
        let sql = format!("SELECT id, name, email FROM users WHERE id = '{id}'");
        match query(&client, &sql, op_timeout).await {
            Ok(rows) if rows.len() == 1 => report.reads_ok += 1,
            Ok(rows) => {
                report.reads_stale += 1;
                report.record_error(format!("read {id} returned {} rows", rows.len()));
            }
            Err(err) => {
                report.reads_failed += 1;
                report.record_error(format!("read {id}: {err:#}"));
            }
        }
    }
    Ok(report)
}

/// Run one statement over the simple-query protocol and collect its rows.
async fn query(
    client: &Client,
    sql: &str,
    op_timeout: Duration,
) -> anyhow::Result<Vec<Vec<Option<String>>>> {
    let messages = time::timeout(op_timeout, client.simple_query(sql))
        .await
        .context("timed out")??;
    Ok(messages
        .iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(
                (0..row.len())
                    .map(|idx| row.get(idx).map(str::to_string))
                    .collect(),
            ),
            _ => None,
        })
        .collect())
}
