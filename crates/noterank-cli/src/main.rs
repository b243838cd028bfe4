use std::io::{self, BufRead};
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use noterank_core::{EngineError, MetricSpec, RecordStore, RoundView, SessionManager, Slot};
use noterank_store_sqlite::SqliteStore;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const EXCERPT_CHARS: usize = 400;

#[derive(Debug, Parser)]
#[command(name = "noterank")]
#[command(about = "Rank notes along a metric through pairwise comparisons")]
struct Cli {
    #[arg(long, default_value = "./noterank.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Metric {
        #[command(subcommand)]
        command: MetricCommand,
    },
    Note {
        #[command(subcommand)]
        command: NoteCommand,
    },
    /// Run an interactive reorder session for one registered metric.
    Reorder(ReorderArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate,
}

#[derive(Debug, Subcommand)]
enum MetricCommand {
    List,
    Add(MetricAddArgs),
    Update(MetricUpdateArgs),
    Remove(MetricRemoveArgs),
    Discover,
}

#[derive(Debug, Args)]
struct MetricAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long, action = ArgAction::Set, default_value_t = false)]
    ascending: bool,
}

#[derive(Debug, Args)]
struct MetricUpdateArgs {
    #[arg(long)]
    name: String,
    #[arg(long, action = ArgAction::Set)]
    ascending: bool,
}

#[derive(Debug, Args)]
struct MetricRemoveArgs {
    #[arg(long)]
    name: String,
}

#[derive(Debug, Subcommand)]
enum NoteCommand {
    Import(NoteImportArgs),
    List,
    Set(NoteSetArgs),
    Show(NoteShowArgs),
}

#[derive(Debug, Args)]
struct NoteImportArgs {
    #[arg(long)]
    dir: PathBuf,
}

#[derive(Debug, Args)]
struct NoteSetArgs {
    #[arg(long)]
    path: String,
    #[arg(long)]
    metric: String,
    #[arg(long)]
    value: String,
}

#[derive(Debug, Args)]
struct NoteShowArgs {
    #[arg(long)]
    path: String,
}

#[derive(Debug, Args)]
struct ReorderArgs {
    /// Name of a registered metric.
    metric: String,
    /// Seed the round selection for reproducible sessions.
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AnswerInput {
    Pick(Slot),
    Quit,
    Unknown,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut store = SqliteStore::open(&cli.db)?;
    match cli.command {
        Command::Db { command } => run_db(&command, &mut store),
        Command::Metric { command } => run_metric(command, &mut store),
        Command::Note { command } => run_note(command, &mut store),
        Command::Reorder(args) => run_reorder(&args, &mut store),
    }
}

fn run_db(command: &DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate => {
            let before = store.schema_status()?;
            store.migrate()?;
            let after = store.schema_status()?;
            emit_json(serde_json::json!({
                "before_version": before.current_version,
                "applied_versions": before.pending_versions,
                "after_version": after.current_version
            }))
        }
    }
}

fn run_metric(command: MetricCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        MetricCommand::List => {
            let metrics = store.list_metrics()?;
            let entries: Vec<Value> = metrics.iter().map(metric_json).collect();
            emit_json(serde_json::json!({ "metrics": entries }))
        }
        MetricCommand::Add(args) => {
            let spec = MetricSpec::new(args.name, args.ascending);
            store.add_metric(&spec)?;
            emit_json(metric_json(&spec))
        }
        MetricCommand::Update(args) => {
            let spec = MetricSpec::new(args.name, args.ascending);
            store.update_metric(&spec)?;
            emit_json(metric_json(&spec))
        }
        MetricCommand::Remove(args) => {
            store.remove_metric(&args.name)?;
            emit_json(serde_json::json!({ "removed": args.name }))
        }
        MetricCommand::Discover => {
            let discovered = store.discover_metrics()?;
            emit_json(serde_json::json!({
                "discovered": serde_json::to_value(&discovered)
                    .context("failed to serialize discovered metrics")?
            }))
        }
    }
}

fn metric_json(spec: &MetricSpec) -> Value {
    serde_json::json!({
        "name": spec.name,
        "ascending": spec.ascending,
        "slug": spec.slug()
    })
}

fn run_note(command: NoteCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        NoteCommand::Import(args) => {
            let summary = store.import_dir(&args.dir)?;
            emit_json(serde_json::to_value(&summary).context("failed to serialize import summary")?)
        }
        NoteCommand::List => {
            let notes = store.list_notes()?;
            emit_json(serde_json::json!({
                "notes": serde_json::to_value(&notes).context("failed to serialize notes")?
            }))
        }
        NoteCommand::Set(args) => {
            store.set_metric_value(&args.path, &args.metric, &args.value)?;
            emit_json(serde_json::json!({
                "path": args.path,
                "metric": args.metric,
                "value": args.value
            }))
        }
        NoteCommand::Show(args) => {
            let Some(note) = store.get_note(&args.path)? else {
                return Err(anyhow!("note not found: {}", args.path));
            };
            emit_json(serde_json::to_value(&note).context("failed to serialize note")?)
        }
    }
}

fn run_reorder(args: &ReorderArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let spec = store
        .find_metric(&args.metric)?
        .ok_or_else(|| anyhow!("metric not registered: {}", args.metric))?;
    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut manager = SessionManager::new();
    let first = manager.open(spec.clone(), store, &mut rng)?;
    tracing::info!(metric = %spec.name, "reorder session opened");

    let mut rounds = 0_u64;
    let mut swaps = 0_u64;
    let stdin = io::stdin();
    let loop_result = reorder_loop(
        &mut manager,
        store,
        &mut rng,
        &spec,
        first,
        &mut stdin.lock(),
        &mut rounds,
        &mut swaps,
    );

    // The final flush runs even when the loop aborted, so the last shown
    // pair is never lost.
    let close_result = manager.close(store);
    loop_result?;
    close_result?;

    tracing::info!(metric = %spec.name, rounds, swaps, "reorder session closed");
    emit_json(serde_json::json!({
        "metric": spec.name,
        "ascending": spec.ascending,
        "rounds": rounds,
        "swaps": swaps
    }))
}

#[allow(clippy::too_many_arguments)]
fn reorder_loop<R: rand::Rng>(
    manager: &mut SessionManager,
    store: &mut SqliteStore,
    rng: &mut R,
    spec: &MetricSpec,
    mut view: RoundView,
    input: &mut impl BufRead,
    rounds: &mut u64,
    swaps: &mut u64,
) -> Result<()> {
    loop {
        render_round(store, spec, &view)?;
        let Some(line) = read_answer_line(input)? else {
            return Ok(());
        };
        match parse_answer(&line) {
            AnswerInput::Pick(slot) => match manager.answer(slot, store, rng) {
                Ok(outcome) => {
                    *rounds += 1;
                    if outcome.swapped {
                        *swaps += 1;
                    }
                    view = outcome.next;
                }
                Err(err @ EngineError::StoreWrite(_)) => {
                    // In-memory state is intact; the same answer can be
                    // re-applied to retry the flush.
                    eprintln!("write failed, answer again to retry: {err}");
                }
                Err(err) => return Err(err.into()),
            },
            AnswerInput::Quit => return Ok(()),
            AnswerInput::Unknown => {
                eprintln!("answers: j/left, l/right, q/quit");
            }
        }
    }
}

fn render_round(store: &SqliteStore, spec: &MetricSpec, view: &RoundView) -> Result<()> {
    // Fetch both bodies before showing either side.
    let left_body = store
        .read_content(&view.left.id)
        .map_err(|err| anyhow!("failed to load note content: {err}"))?;
    let right_body = store
        .read_content(&view.right.id)
        .map_err(|err| anyhow!("failed to load note content: {err}"))?;

    eprintln!();
    eprintln!("Which is better by \"{}\"?", spec.name);
    eprintln!();
    eprintln!("[j] {}", view.left.label);
    eprintln!("    {}", excerpt(&left_body));
    eprintln!("[l] {}", view.right.label);
    eprintln!("    {}", excerpt(&right_body));
    eprintln!();
    Ok(())
}

fn excerpt(body: &str) -> String {
    let flat = body.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= EXCERPT_CHARS {
        flat
    } else {
        let truncated: String = flat.chars().take(EXCERPT_CHARS).collect();
        format!("{truncated}…")
    }
}

fn read_answer_line(input: &mut impl BufRead) -> Result<Option<String>> {
    let mut line = String::new();
    let read = input.read_line(&mut line).context("failed to read answer from stdin")?;
    if read == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_ascii_lowercase()))
}

fn parse_answer(line: &str) -> AnswerInput {
    match line {
        "j" | "left" => AnswerInput::Pick(Slot::Left),
        "l" | "right" => AnswerInput::Pick(Slot::Right),
        "q" | "quit" | "exit" => AnswerInput::Quit,
        _ => AnswerInput::Unknown,
    }
}
