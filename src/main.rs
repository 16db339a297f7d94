use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::info;
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use dynamic_subledger::{
    file_sink, get_entries, insert_event, insert_rules, insert_source_rows, load_records,
    render_summary, setup_database, Config, Event, Formula, OutputFormat, ResultSink, RuleFile,
    RuleProcessor, RuleSource, RunContext, SqliteExecutor, SqliteRuleStore, SqliteSink,
};

const DEFAULT_CONFIG: &str = "subledger.yaml";

#[derive(Parser, Debug)]
#[command(name = "subledger")]
#[command(version)]
#[command(about = "Rule-driven sub-ledger engine", long_about = None)]
struct Args {
    /// Configuration file path (defaults apply when subledger.yaml is absent)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load a JSON or CSV data file into a dataset
    ImportData {
        file: PathBuf,
        #[arg(short, long)]
        dataset: String,
    },
    /// Store rules from a JSON or CSV file in the database
    ImportRules { file: PathBuf },
    /// Process rules and write ledger entries
    Run {
        /// Rules file; otherwise rules.path from config, then the database
        #[arg(short, long)]
        rules: Option<PathBuf>,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short, long)]
        format: Option<OutputFormat>,
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Print the account summary of stored entries
    Summary {
        /// Limit to one run
        #[arg(long)]
        run: Option<String>,
    },
    /// Evaluate a formula against JSON values
    Eval {
        formula: String,
        #[arg(long, default_value = "{}")]
        values: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();

    match args.command {
        Command::ImportData { file, dataset } => run_import_data(&config, &file, &dataset),
        Command::ImportRules { file } => run_import_rules(&config, &file),
        Command::Run {
            rules,
            output,
            format,
            workers,
        } => run_rules(&config, rules, output, format, workers),
        Command::Summary { run } => run_summary(&config, run.as_deref()),
        Command::Eval { formula, values } => run_eval(&formula, &values),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path).with_context(|| format!("Failed to load config {:?}", path)),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            Config::load(DEFAULT_CONFIG).context("Failed to load subledger.yaml")
        }
        None => Ok(Config::default()),
    }
}

fn open_database(config: &Config) -> Result<Connection> {
    let conn = Connection::open(&config.database.path)
        .with_context(|| format!("Failed to open database {:?}", config.database.path))?;
    setup_database(&conn)?;
    Ok(conn)
}

fn run_import_data(config: &Config, file: &Path, dataset: &str) -> Result<()> {
    println!("🗄️  Data Import - {} → {}", file.display(), dataset);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    println!("\n📂 Loading records...");
    let records = load_records(file)?;
    println!("✓ Loaded {} records", records.len());

    println!("\n💾 Inserting into dataset '{}'...", dataset);
    let conn = open_database(config)?;
    let inserted = insert_source_rows(&conn, dataset, &records)?;
    println!("✓ Inserted {} rows", inserted);

    Ok(())
}

fn run_import_rules(config: &Config, file: &Path) -> Result<()> {
    println!("🏷️  Rule Import - {}", file.display());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let (rules, unreadable): (Vec<_>, Vec<_>) = RuleFile::new(file)
        .all_rules()?
        .into_iter()
        .partition(|r| r.load_error.is_none());
    for rule in &unreadable {
        if let Err(e) = rule.validate() {
            println!("❌ {} not stored: {}", rule.display_name(), e);
        }
    }

    let invalid: Vec<_> = rules
        .iter()
        .filter_map(|r| {
            r.validate()
                .err()
                .filter(|_| r.is_active())
                .map(|e| (r.display_name().to_string(), e))
        })
        .collect();
    for (name, error) in &invalid {
        println!("⚠️  {}: {}", name, error);
    }

    let conn = open_database(config)?;
    let stored = insert_rules(&conn, &rules)?;
    println!(
        "✓ Stored {} rules ({} need attention, {} unreadable)",
        stored,
        invalid.len(),
        unreadable.len()
    );

    Ok(())
}

fn run_rules(
    config: &Config,
    rules_path: Option<PathBuf>,
    output: Option<PathBuf>,
    format: Option<OutputFormat>,
    workers: Option<usize>,
) -> Result<()> {
    println!("🚀 Dynamic Sub-Ledger Processor");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let db = Arc::new(Mutex::new(open_database(config)?));

    // 1. Rules: --rules, then rules.path from config, then the database
    let source: Box<dyn RuleSource> = match rules_path.or_else(|| config.rules.path.clone()) {
        Some(path) => {
            println!("\n📋 Rules from {}", path.display());
            Box::new(RuleFile::new(path))
        }
        None => {
            println!("\n📋 Rules from the ledger_rules table");
            Box::new(SqliteRuleStore::new(db.clone()))
        }
    };

    // 2. Process
    let mut options = config.run_options();
    if let Some(workers) = workers {
        options.workers = workers.max(1);
    }
    let ctx = RunContext::new(options);
    println!("\n⚙️  Processing (run {})...", ctx.run_id);
    let processor = RuleProcessor::new(SqliteExecutor::new(db.clone()));
    let outcome = processor.run_from_source(source.as_ref(), &ctx)?;
    if outcome.rules_total == 0 {
        bail!("No rules found; import rules or pass --rules");
    }
    println!("✓ Loaded {} rules", outcome.rules_total);

    for issue in &outcome.issues {
        println!("⚠️  {}", issue);
    }
    println!(
        "✓ {} entries from {} rules ({} skipped, {} failed)",
        outcome.entry_count(),
        outcome.rules_processed,
        outcome.rules_skipped,
        outcome.rules_failed
    );

    // 3. Output file
    let path = output.unwrap_or_else(|| config.output.path.clone());
    let format = format.unwrap_or(config.output.format);
    let written = file_sink(format, &path).write(&outcome.entries)?;
    println!("\n💾 Results saved to {} ({} entries, {})", path.display(), written, format);

    // 4. Database
    let conn = db.lock().map_err(|_| anyhow!("Database lock poisoned"))?;
    let stored = SqliteSink::new(&conn).write(&outcome.entries)?;
    println!("✓ Stored {} new entries", stored);

    let event = Event::new(
        "run_completed",
        "run",
        &outcome.run_id,
        json!({
            "rules_total": outcome.rules_total,
            "rules_skipped": outcome.rules_skipped,
            "rules_failed": outcome.rules_failed,
            "entries": outcome.entry_count(),
            "zeroed": outcome.zeroed_count(),
            "rows_skipped": outcome.skipped_rows(),
        }),
        "subledger_cli",
    );
    insert_event(&conn, &event)?;
    info!("Run {} recorded", outcome.run_id);

    println!("{}", render_summary(&outcome.entries, outcome.finished_at));

    Ok(())
}

fn run_summary(config: &Config, run: Option<&str>) -> Result<()> {
    let conn = open_database(config)?;
    let entries = get_entries(&conn, run)?;
    println!("{}", render_summary(&entries, Utc::now()));
    Ok(())
}

fn run_eval(formula: &str, values: &str) -> Result<()> {
    let values: Map<String, Value> =
        serde_json::from_str(values).context("--values must be a JSON object")?;

    match Formula::new(formula).try_evaluate(&values) {
        Ok(result) => {
            println!("✓ {} = {}", formula, result);
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ {}", e);
            Err(e.into())
        }
    }
}
