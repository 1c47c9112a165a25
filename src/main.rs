use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use qualer_dl::session::TerminalPrompt;
use qualer_dl::{
    CollectionMode, Config, Credential, Database, Error, ErrorKind, Event, FailurePolicy,
    Harvester, IfExists, Job, OutputTarget, RunSummary,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "qualer-dl", version)]
#[command(about = "Extract Qualer uncertainty budgets and capabilities into CSV or SQLite", long_about = None)]
struct Cli {
    /// JSON configuration file (defaults are used for anything it leaves out)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database (overrides output.database_path)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and run extraction jobs
    Run(RunArgs),
    /// Load a CSV file into a table
    Import {
        /// CSV file with a header row
        csv: PathBuf,
        /// Destination table
        table: String,
        #[arg(long, value_enum, default_value_t = IfExistsArg::Replace)]
        if_exists: IfExistsArg,
    },
    /// Keep only the last row per key value
    Dedupe {
        table: String,
        key: String,
    },
    /// Add a foreign key constraint by rebuilding the table
    AddFk {
        table: String,
        column: String,
        /// Referenced column as TABLE.COLUMN
        references: String,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Jobs to run
    #[arg(value_enum, default_value_t = JobArg::All)]
    jobs: JobArg,

    #[arg(short, long, value_enum)]
    output: Option<OutputArg>,

    /// Directory for CSV output (overrides output.csv_dir)
    #[arg(long)]
    csv_dir: Option<PathBuf>,

    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    #[arg(long, value_enum)]
    policy: Option<PolicyArg>,

    /// Maximum concurrent lookups
    #[arg(short, long)]
    workers: Option<usize>,

    /// Take technique ids from an existing TABLE.COLUMN instead of the techniques list
    #[arg(long, value_name = "TABLE.COLUMN")]
    technique_ids_from: Option<String>,

    /// Take uncertainty budget ids for the components job from TABLE.COLUMN
    #[arg(long, value_name = "TABLE.COLUMN")]
    budget_ids_from: Option<String>,

    #[arg(long)]
    no_progress: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum JobArg {
    Budgets,
    Capabilities,
    Components,
    All,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputArg {
    Csv,
    Db,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Stream,
    Buffer,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PolicyArg {
    BestEffort,
    FailFast,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum IfExistsArg {
    Replace,
    Append,
}

impl JobArg {
    fn jobs(self) -> Vec<Job> {
        match self {
            JobArg::Budgets => vec![Job::UncertaintyBudgets],
            JobArg::Capabilities => vec![Job::Capabilities],
            JobArg::Components => vec![Job::UncertaintyComponents],
            JobArg::All => Job::ALL.to_vec(),
        }
    }
}

impl From<IfExistsArg> for IfExists {
    fn from(arg: IfExistsArg) -> Self {
        match arg {
            IfExistsArg::Replace => IfExists::Replace,
            IfExistsArg::Append => IfExists::Append,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match load_config(&cli) {
        Ok(config) => match cli.command {
            Command::Run(args) => run(config, args).await,
            Command::Import {
                csv,
                table,
                if_exists,
            } => import(&config, &csv, &table, if_exists.into()).await,
            Command::Dedupe { table, key } => dedupe(&config, &table, &key).await,
            Command::AddFk {
                table,
                column,
                references,
            } => add_fk(&config, &table, &column, &references).await,
        },
        Err(e) => Err(e),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, code = e.error_code(), "qualer-dl failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> qualer_dl::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    };
    if let Some(database) = &cli.database {
        config.output.database_path = database.clone();
    }
    Ok(config)
}

async fn run(mut config: Config, args: RunArgs) -> qualer_dl::Result<ExitCode> {
    if let Some(output) = args.output {
        config.output.target = match output {
            OutputArg::Csv => OutputTarget::Csv,
            OutputArg::Db => OutputTarget::Database,
        };
    }
    if let Some(dir) = args.csv_dir {
        config.output.csv_dir = dir;
    }
    if let Some(mode) = args.mode {
        config.fanout.mode = match mode {
            ModeArg::Stream => CollectionMode::Stream,
            ModeArg::Buffer => CollectionMode::Buffer,
        };
    }
    if let Some(policy) = args.policy {
        config.fanout.failure_policy = match policy {
            PolicyArg::BestEffort => FailurePolicy::BestEffort,
            PolicyArg::FailFast => FailurePolicy::FailFast,
        };
    }
    if let Some(workers) = args.workers {
        config.fanout.workers = workers;
    }
    config.validate()?;

    let technique_source = args
        .technique_ids_from
        .as_deref()
        .map(split_column)
        .transpose()?;
    let budget_source = args
        .budget_ids_from
        .as_deref()
        .map(split_column)
        .transpose()?;
    let jobs = args.jobs.jobs();

    let credential = Credential::from_env_or_prompt(&config.auth, &TerminalPrompt)?;
    let database_path = config.output.database_path.clone();
    let harvester = Harvester::connect(config, credential)?;

    let progress = if args.no_progress {
        None
    } else {
        Some(tokio::spawn(show_progress(harvester.subscribe())))
    };

    let work = async {
        harvester.login().await?;
        let mut refs = harvester.collect_reference_data().await?;
        if let Some((table, column)) = technique_source {
            let db = Database::new(&database_path).await?;
            refs.technique_ids = db.reference_ids(table, column).await?;
            db.close().await;
            tracing::info!(
                table,
                column,
                techniques = refs.technique_ids.len(),
                "Technique ids taken from table"
            );
        }
        if let Some((table, column)) = budget_source {
            let db = Database::new(&database_path).await?;
            let ids = db.reference_ids(table, column).await?;
            db.close().await;
            tracing::info!(table, column, budgets = ids.len(), "Budget ids taken from table");
            refs.uncertainty_budget_ids = Some(ids);
        }
        harvester.run_with_references(&jobs, &refs).await
    };

    let result = tokio::select! {
        result = work => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C signal");
            Err(Error::Other("interrupted".into()))
        }
    };

    harvester.close().await;
    drop(harvester);
    if let Some(progress) = progress {
        progress.await.ok();
    }

    let summary = match result {
        Ok(summary) => summary,
        Err(e @ Error::Task { .. }) => {
            eprintln!("error: {} ({})", e, e.kind());
            return Ok(ExitCode::FAILURE);
        }
        Err(e) if e.kind() == ErrorKind::Authentication => {
            eprintln!("error: {}", e);
            return Ok(ExitCode::from(2));
        }
        Err(e) => return Err(e),
    };

    print_summary(&summary);
    Ok(if summary.is_complete() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn import(
    config: &Config,
    csv: &std::path::Path,
    table: &str,
    if_exists: IfExists,
) -> qualer_dl::Result<ExitCode> {
    let db = Database::new(&config.output.database_path).await?;
    let rows = db
        .import_csv(table, csv, if_exists, config.output.chunk_size)
        .await?;
    db.close().await;
    println!("Imported {} rows from {} into {}", rows, csv.display(), table);
    Ok(ExitCode::SUCCESS)
}

async fn dedupe(config: &Config, table: &str, key: &str) -> qualer_dl::Result<ExitCode> {
    let db = Database::new(&config.output.database_path).await?;
    let removed = db.dedupe_by_key(table, key).await?;
    db.close().await;
    println!("Removed {} duplicate rows from {} (key {})", removed, table, key);
    Ok(ExitCode::SUCCESS)
}

async fn add_fk(
    config: &Config,
    table: &str,
    column: &str,
    references: &str,
) -> qualer_dl::Result<ExitCode> {
    let (ref_table, ref_column) = split_column(references)?;
    let db = Database::new(&config.output.database_path).await?;
    let added = db
        .add_foreign_key(table, column, ref_table, ref_column)
        .await?;
    db.close().await;
    if added {
        println!("{}.{} now references {}", table, column, references);
    } else {
        println!("{}.{} already references {}", table, column, references);
    }
    Ok(ExitCode::SUCCESS)
}

fn split_column(value: &str) -> qualer_dl::Result<(&str, &str)> {
    match value.split_once('.') {
        Some((table, column)) if !table.is_empty() && !column.is_empty() => Ok((table, column)),
        _ => Err(Error::Config {
            message: format!("expected TABLE.COLUMN, got {:?}", value),
            key: None,
        }),
    }
}

/// Drive a progress bar from the event stream until the harvester is dropped
async fn show_progress(mut events: broadcast::Receiver<Event>) {
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    let mut bar: Option<ProgressBar> = None;

    loop {
        match events.recv().await {
            Ok(Event::ReferencesLoaded {
                service_groups,
                techniques,
            }) => {
                eprintln!(
                    "Loaded {} service groups and {} techniques",
                    service_groups, techniques
                );
            }
            Ok(Event::BatchStarted { job, total }) => {
                let pb = ProgressBar::new(total as u64);
                pb.set_style(style.clone());
                pb.set_message(job);
                bar = Some(pb);
            }
            Ok(Event::TaskCompleted { .. }) => {
                if let Some(pb) = &bar {
                    pb.inc(1);
                }
            }
            Ok(Event::TaskFailed { pair, kind, .. }) => {
                if let Some(pb) = &bar {
                    pb.inc(1);
                    pb.println(format!("failed {} ({})", pair, kind));
                }
            }
            Ok(Event::BatchFinished {
                job, rows_written, ..
            }) => {
                if let Some(pb) = bar.take() {
                    pb.finish_with_message(format!("{}: {} rows", job, rows_written));
                }
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_summary(summary: &RunSummary) {
    println!(
        "Service groups: {}, techniques: {}",
        summary.service_groups, summary.techniques
    );
    for report in &summary.reports {
        println!(
            "{}: {}/{} pairs succeeded, {} rows written",
            report.job, report.succeeded, report.total, report.rows_written
        );
    }

    let failed: Vec<_> = summary.failed_pairs().collect();
    if !failed.is_empty() {
        println!("Failed pairs ({}):", failed.len());
        for (job, failure) in failed {
            println!(
                "  {} {} [{}] {}",
                job, failure.pair, failure.kind, failure.message
            );
        }
    }
}
