//! examsync: exam management CLI over the offline-tolerant sync store
//!
//! Commands:
//!   status                         - connectivity, queue depth, dashboard figures
//!   config show                    - display current configuration
//!   sync                           - replay queued offline changes
//!   failed                         - list operations that exhausted their retries
//!   students list|add|remove       - manage the roster
//!   questions list|add|remove      - manage the question bank
//!   exams list|create|remove|take  - schedule exams and sit them
//!   results list|export            - browse and export scores
//!   record get|set|remove <path>   - raw record access

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use examsync_core::config::{ExamSyncConfig, RemoteBackend};
use examsync_core::{Ack, RecordPath};
use examsync_exam::{ExamDraft, ExamError, ExamService, QuestionDraft, ResultFilter, StudentDraft};
use examsync_storage::{JsonFileCache, OperatorStore, RemoteStore};
use examsync_sync::{Connectivity, ConnectivityState, HealthProbe, SyncOptions, SyncStore};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "examsync",
    version,
    about = "Exam management that keeps working offline",
    long_about = "examsync: manage students, questions, exams and results; changes made \
                  while the remote store is unreachable are queued and replayed later"
)]
struct Cli {
    /// Path to examsync.toml configuration file
    #[arg(long, short = 'c', env = "EXAMSYNC_CONFIG", default_value = "examsync.toml")]
    config: PathBuf,

    /// Log level (overrides [app] log_level)
    #[arg(long, env = "EXAMSYNC_LOG")]
    log: Option<String>,

    /// Log format (overrides [app] log_format)
    #[arg(long, env = "EXAMSYNC_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Do not contact the remote store; queue every change locally
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show connectivity, pending work, and dashboard figures
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Replay changes queued while offline
    Sync,

    /// List queued operations that were given up on
    Failed,

    /// Student roster
    Students {
        #[command(subcommand)]
        action: StudentAction,
    },

    /// Question bank
    Questions {
        #[command(subcommand)]
        action: QuestionAction,
    },

    /// Exam scheduling and sittings
    Exams {
        #[command(subcommand)]
        action: ExamAction,
    },

    /// Exam results
    Results {
        #[command(subcommand)]
        action: ResultAction,
    },

    /// Raw record access by path
    Record {
        #[command(subcommand)]
        action: RecordAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
}

#[derive(Subcommand, Debug)]
enum StudentAction {
    List,
    Add {
        #[arg(long)]
        name: String,
        /// Roll number; must be unique
        #[arg(long = "student-id")]
        student_id: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        grade: String,
    },
    Remove {
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum QuestionAction {
    List,
    Add {
        #[arg(long)]
        text: String,
        /// Exactly four options, in order
        #[arg(long = "option", num_args = 1)]
        options: Vec<String>,
        /// Correct option, 1-based
        #[arg(long)]
        correct: usize,
        #[arg(long)]
        difficulty: String,
        #[arg(long)]
        subject: String,
    },
    Remove {
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum ExamAction {
    List,
    /// Schedule an exam over a random sample of the question bank
    Create {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Minutes (default from [exam] default_duration_minutes)
        #[arg(long)]
        duration: Option<u32>,
        /// RFC 3339 start time
        #[arg(long)]
        start: DateTime<Utc>,
        /// RFC 3339 end time
        #[arg(long)]
        end: DateTime<Utc>,
        #[arg(long)]
        questions: usize,
    },
    Remove {
        id: String,
    },
    /// Sit an exam non-interactively
    Take {
        exam_id: String,
        /// Student record id
        #[arg(long)]
        student: String,
        /// Comma-separated 1-based choices, one per question; 0 skips
        #[arg(long, value_delimiter = ',')]
        answers: Vec<usize>,
    },
}

#[derive(Subcommand, Debug)]
enum ResultAction {
    List {
        #[arg(long)]
        exam: Option<String>,
        #[arg(long)]
        student: Option<String>,
    },
    /// Write results as CSV (stdout when no path is given)
    Export {
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum RecordAction {
    Get { path: String },
    Set { path: String, json: String },
    Remove { path: String },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.app.log_level.clone());
    let format = cli.log_format.clone().unwrap_or(match config.app.log_format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, &format);
    if !cli.config.exists() {
        warn!(path = %cli.config.display(), "config file not found, using defaults");
    }

    if let Commands::Config { action: ConfigAction::Show } = cli.command {
        return cmd_config_show(&config, &cli.config);
    }

    let store = open_store(&config, cli.offline).await?;
    // One drain per reconnect; `sync` drains itself so it can report.
    if store.is_online() && !matches!(cli.command, Commands::Sync) {
        let report = store.drain_pending().await.context("replaying queued changes")?;
        if report.replayed > 0 {
            info!(replayed = report.replayed, "queued changes replayed");
        }
    }
    let svc = ExamService::new(store.clone());

    let outcome = match cli.command {
        Commands::Config { .. } => Ok(()),
        Commands::Status => cmd_status(&svc).await,
        Commands::Sync => cmd_sync(&store).await,
        Commands::Failed => cmd_failed(&store),
        Commands::Students { action } => cmd_students(&svc, action).await,
        Commands::Questions { action } => cmd_questions(&svc, action).await,
        Commands::Exams { action } => cmd_exams(&svc, &config, action).await,
        Commands::Results { action } => cmd_results(&svc, action).await,
        Commands::Record { action } => cmd_record(&store, action).await,
    };

    store.flush().context("flushing local cache")?;
    outcome
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

async fn load_config(path: &Path) -> Result<ExamSyncConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))
    } else {
        Ok(ExamSyncConfig::default())
    }
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(format!("{home}/{rest}"))
    } else {
        path.to_path_buf()
    }
}

// ── Store wiring ──────────────────────────────────────────────────────────────

/// Build the remote operator.
///
/// For the S3 backend, credentials come from AWS_ACCESS_KEY_ID and
/// AWS_SECRET_ACCESS_KEY (standard S3 env vars).
fn build_remote(config: &ExamSyncConfig) -> Result<OperatorStore> {
    let mut remote = config.remote.clone();
    remote.root = expand_tilde(Path::new(&remote.root))
        .to_string_lossy()
        .into_owned();

    let (access_key, secret_key) = if remote.backend == RemoteBackend::S3 {
        let access_key = std::env::var("AWS_ACCESS_KEY_ID").context(
            "S3 credentials not set\n\
             Set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY environment variables.\n\
             Example:\n\
             \texport AWS_ACCESS_KEY_ID=your-key\n\
             \texport AWS_SECRET_ACCESS_KEY=your-secret",
        )?;
        let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        (access_key, secret_key)
    } else {
        (String::new(), String::new())
    };

    let op = examsync_storage::operator::build_from_core_config(&remote, &access_key, &secret_key)
        .context("building remote operator")?;
    Ok(OperatorStore::new(op, remote.object_key.clone()))
}

async fn open_store(config: &ExamSyncConfig, offline: bool) -> Result<SyncStore> {
    let remote: Arc<dyn RemoteStore> = Arc::new(build_remote(config)?);

    let cache_path = expand_tilde(&config.cache.path);
    let cache = JsonFileCache::open(&cache_path, config.cache.max_bytes)
        .with_context(|| format!("opening local cache: {}", cache_path.display()))?;

    let connectivity = Connectivity::new(ConnectivityState::Offline);
    let store = SyncStore::open(
        remote.clone(),
        Box::new(cache),
        connectivity.subscribe(),
        SyncOptions::from(&config.sync),
    )
    .context("loading local state")?;

    if !offline {
        let probe = HealthProbe::new(
            remote,
            connectivity.clone(),
            Duration::from_secs(config.sync.probe_interval_secs.max(1)),
        );
        probe.probe().await;
    }
    Ok(store)
}

// ── Output helpers ────────────────────────────────────────────────────────────

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn ack_label(ack: Ack) -> &'static str {
    match ack {
        Ack::Synced => "synced",
        Ack::Queued => "queued (offline)",
    }
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

fn parse_path(raw: &str) -> Result<RecordPath> {
    RecordPath::parse(raw).with_context(|| format!("invalid record path: {raw}"))
}

// ── `examsync status` ─────────────────────────────────────────────────────────

async fn cmd_status(svc: &ExamService) -> Result<()> {
    let stats = svc.store().stats();
    let dash = svc.dashboard(Utc::now()).await?;

    println!("examsync v{}", env!("CARGO_PKG_VERSION"));
    println!("  remote:      {}", if stats.online { "online" } else { "offline" });
    println!("  pending:     {}", stats.pending_operations);
    println!("  failed:      {}", stats.failed_operations);
    println!("  local cache: {}", fmt_bytes(stats.local_cache_bytes));
    match stats.last_sync {
        Some(t) => println!("  last sync:   {}", t.to_rfc3339()),
        None => println!("  last sync:   never"),
    }
    println!();
    println!("  students:     {}", dash.total_students);
    println!("  questions:    {}", dash.total_questions);
    println!("  active exams: {}", dash.active_exams);
    println!("  results:      {}", dash.total_results);
    if let Some(avg) = dash.average_percentage {
        println!("  average:      {avg}%");
    }
    Ok(())
}

// ── `examsync config show` ────────────────────────────────────────────────────

fn cmd_config_show(config: &ExamSyncConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── `examsync sync` / `examsync failed` ───────────────────────────────────────

async fn cmd_sync(store: &SyncStore) -> Result<()> {
    if !store.is_online() {
        let pending = store.stats().pending_operations;
        println!("Remote unreachable; {pending} change(s) stay queued.");
        return Ok(());
    }

    let pb = make_spinner("sync");
    pb.set_message(format!("replaying {} change(s)...", store.stats().pending_operations));
    let report = store.drain_pending().await.context("replaying queued changes")?;
    pb.finish_with_message("done".to_string());

    println!("Sync complete:");
    println!("  replayed: {}", report.replayed);
    println!("  requeued: {}", report.requeued);
    println!("  failed:   {}", report.failed.len());
    for dead in &report.failed {
        println!("    {}", dead.to_error());
    }
    Ok(())
}

fn cmd_failed(store: &SyncStore) -> Result<()> {
    let failed = store.failed_operations();
    if failed.is_empty() {
        println!("No failed operations.");
        return Ok(());
    }
    for dead in failed {
        println!(
            "{}  {} {}  ({} attempts): {}",
            dead.failed_at.to_rfc3339(),
            dead.op.kind,
            dead.op.path,
            dead.op.attempts,
            dead.reason
        );
    }
    Ok(())
}

// ── `examsync students` ───────────────────────────────────────────────────────

async fn cmd_students(svc: &ExamService, action: StudentAction) -> Result<()> {
    match action {
        StudentAction::List => {
            let students = svc.students().await?;
            if students.is_empty() {
                println!("No students.");
            }
            for s in students {
                println!("{}  {}  {}  {}  grade {}", s.id, s.student_id, s.name, s.email, s.grade);
            }
        }
        StudentAction::Add {
            name,
            student_id,
            email,
            grade,
        } => {
            let saved = svc
                .add_student(StudentDraft {
                    name,
                    student_id,
                    email,
                    grade,
                })
                .await?;
            println!("Added student {} [{}]", saved.record.id, ack_label(saved.ack));
        }
        StudentAction::Remove { id } => {
            let ack = svc.remove_student(&id).await?;
            println!("Removed student {id} [{}]", ack_label(ack));
        }
    }
    Ok(())
}

// ── `examsync questions` ──────────────────────────────────────────────────────

async fn cmd_questions(svc: &ExamService, action: QuestionAction) -> Result<()> {
    match action {
        QuestionAction::List => {
            let questions = svc.questions().await?;
            if questions.is_empty() {
                println!("No questions.");
            }
            for q in questions {
                println!("{}  [{} / {}] {}", q.id, q.subject, q.difficulty, q.text);
                for (i, opt) in q.options.iter().enumerate() {
                    let mark = if q.is_correct(i) { "*" } else { " " };
                    println!("    {mark} {}. {opt}", i + 1);
                }
            }
        }
        QuestionAction::Add {
            text,
            options,
            correct,
            difficulty,
            subject,
        } => {
            let correct_answer = correct
                .checked_sub(1)
                .context("--correct is 1-based")?;
            let saved = svc
                .add_question(QuestionDraft {
                    text,
                    options,
                    correct_answer,
                    difficulty,
                    subject,
                })
                .await?;
            println!("Added question {} [{}]", saved.record.id, ack_label(saved.ack));
        }
        QuestionAction::Remove { id } => {
            let ack = svc.remove_question(&id).await?;
            println!("Removed question {id} [{}]", ack_label(ack));
        }
    }
    Ok(())
}

// ── `examsync exams` ──────────────────────────────────────────────────────────

async fn cmd_exams(svc: &ExamService, config: &ExamSyncConfig, action: ExamAction) -> Result<()> {
    match action {
        ExamAction::List => {
            let exams = svc.exams().await?;
            if exams.is_empty() {
                println!("No exams.");
            }
            let now = Utc::now();
            for e in exams {
                println!(
                    "{}  {}  {:?}  {} → {}  {} questions, {} min",
                    e.id,
                    e.title,
                    e.status(now),
                    e.start_time.to_rfc3339(),
                    e.end_time.to_rfc3339(),
                    e.question_count,
                    e.duration
                );
            }
        }
        ExamAction::Create {
            title,
            description,
            duration,
            start,
            end,
            questions,
        } => {
            let saved = svc
                .create_exam(ExamDraft {
                    title,
                    description,
                    duration: duration.unwrap_or(config.exam.default_duration_minutes),
                    start_time: start,
                    end_time: end,
                    question_count: questions,
                })
                .await?;
            println!("Scheduled exam {} [{}]", saved.record.id, ack_label(saved.ack));
        }
        ExamAction::Remove { id } => {
            let ack = svc.remove_exam(&id).await?;
            println!("Removed exam {id} [{}]", ack_label(ack));
        }
        ExamAction::Take {
            exam_id,
            student,
            answers,
        } => {
            let now = Utc::now();
            let mut session = svc.start_session(&exam_id, &student, now).await?;
            println!(
                "{} sitting {} ({} questions, due {})",
                session.student().name,
                session.exam().title,
                session.total(),
                session.deadline().to_rfc3339()
            );
            for choice in answers {
                if let Some(idx) = choice.checked_sub(1) {
                    match session.answer(idx, Utc::now()) {
                        Ok(()) => {}
                        Err(ExamError::TimeUp(at)) => {
                            warn!(deadline = %at, "time ran out, submitting answers so far");
                            break;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                if !session.next() {
                    break;
                }
            }
            let saved = svc.submit(session, Utc::now()).await?;
            let r = &saved.record;
            println!(
                "Score: {}/{} ({}%) {} [{}]",
                r.score,
                r.total_questions,
                r.percentage,
                if r.passed() { "pass" } else { "fail" },
                ack_label(saved.ack)
            );
        }
    }
    Ok(())
}

// ── `examsync results` ────────────────────────────────────────────────────────

async fn cmd_results(svc: &ExamService, action: ResultAction) -> Result<()> {
    match action {
        ResultAction::List { exam, student } => {
            let results = svc
                .results(&ResultFilter {
                    exam_id: exam,
                    student_id: student,
                })
                .await?;
            if results.is_empty() {
                println!("No results.");
            }
            for r in results {
                println!(
                    "{}  {}  {}/{}  {}%  {}  {}",
                    r.student_name,
                    r.exam_title,
                    r.score,
                    r.total_questions,
                    r.percentage,
                    r.completed_at.to_rfc3339(),
                    if r.passed() { "pass" } else { "fail" }
                );
            }
        }
        ResultAction::Export { output } => {
            let results = svc.results(&ResultFilter::default()).await?;
            if results.is_empty() {
                println!("No results to export.");
                return Ok(());
            }
            let csv = examsync_exam::report::results_csv(&results)?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, csv)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Exported {} result(s) to {}", results.len(), path.display());
                }
                None => print!("{csv}"),
            }
        }
    }
    Ok(())
}

// ── `examsync record` ─────────────────────────────────────────────────────────

async fn cmd_record(store: &SyncStore, action: RecordAction) -> Result<()> {
    match action {
        RecordAction::Get { path } => match store.read(&parse_path(&path)?).await {
            Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            None => println!("(absent)"),
        },
        RecordAction::Set { path, json } => {
            let value: serde_json::Value =
                serde_json::from_str(&json).context("parsing record JSON")?;
            let ack = store.write(&parse_path(&path)?, value).await?;
            println!("Wrote {path} [{}]", ack_label(ack));
        }
        RecordAction::Remove { path } => {
            let ack = store.remove(&parse_path(&path)?).await?;
            println!("Removed {path} [{}]", ack_label(ack));
        }
    }
    Ok(())
}
