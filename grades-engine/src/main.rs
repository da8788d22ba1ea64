//! grades-engine - Grades pipeline command line
//!
//! Feeds inbound score events through the grading pipeline, runs course
//! reports, and answers point reads against the grades database.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use grades_common::config::GradesConfig;
use grades_common::db::init_database;
use grades_common::events::InboundEvent;
use grades_common::{CourseKey, LearnerId, UsageKey};
use grades_engine::directory::InMemoryLearnerDirectory;
use grades_engine::grader::LoggingExternalGrader;
use grades_engine::reports::{AssignmentRange, FsReportStore, ReportFilter, ReportKind, ReportRequest};
use grades_engine::structure::InMemoryCourseStructure;
use grades_engine::{GradesService, HandleOutcome, RuntimeSettings, ServiceDeps};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "grades-engine")]
#[command(about = "Learner grade computation pipeline")]
#[command(version)]
struct Cli {
    /// Bootstrap TOML file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path, overrides the config file
    #[arg(long, global = true, env = "GRADES_DATABASE")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process JSON-lines inbound events until EOF or Ctrl-C
    Run {
        /// Event file, or `-` for stdin
        #[arg(long, default_value = "-")]
        events: String,
    },
    /// Generate a course report
    Report(ReportArgs),
    /// Print a learner's course grade as JSON
    Grade {
        #[arg(long)]
        learner: LearnerId,
        #[arg(long)]
        course: CourseKey,
    },
    /// Freeze a course's grades
    Freeze {
        #[arg(long)]
        course: CourseKey,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Lift an explicit freeze
    Unfreeze {
        #[arg(long)]
        course: CourseKey,
    },
}

#[derive(Args, Debug)]
struct ReportArgs {
    #[arg(long)]
    course: CourseKey,

    /// gradebook, progress or problem
    #[arg(long)]
    kind: ReportKind,

    /// Case-insensitive substring of username or email
    #[arg(long)]
    user: Option<String>,

    #[arg(long)]
    cohort: Option<String>,

    #[arg(long)]
    enrollment_mode: Option<String>,

    /// Subsection for the assignment grade range
    #[arg(long)]
    assignment: Option<UsageKey>,

    #[arg(long, requires = "assignment")]
    assignment_min: Option<f64>,

    #[arg(long, requires = "assignment")]
    assignment_max: Option<f64>,

    /// Course grade lower bound in percent points
    #[arg(long)]
    grade_min: Option<f64>,

    /// Course grade upper bound in percent points
    #[arg(long)]
    grade_max: Option<f64>,
}

impl ReportArgs {
    fn filter(&self) -> ReportFilter {
        ReportFilter {
            user_contains: self.user.clone(),
            cohort: self.cohort.clone(),
            enrollment_mode: self.enrollment_mode.clone(),
            assignment: self.assignment.as_ref().map(|subsection_id| AssignmentRange {
                subsection_id: subsection_id.clone(),
                min: self.assignment_min,
                max: self.assignment_max,
            }),
            course_grade_min: self.grade_min,
            course_grade_max: self.grade_max,
        }
    }
}

fn init_tracing(config: &GradesConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match &config.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = GradesConfig::load(cli.config.as_deref())?;
    if let Some(database) = &cli.database {
        config.database_path = database.clone();
    }
    init_tracing(&config)?;

    info!(
        "Starting grades-engine v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    info!("Database path: {}", config.database_path.display());

    let service = start_service(&config).await?;
    let outcome = match cli.command {
        Command::Run { events } => run_events(&service, &events).await,
        Command::Report(args) => run_report(&service, &args).await,
        Command::Grade { learner, course } => {
            let grade = service.reader().get_course_grade(learner, &course).await?;
            println!("{}", serde_json::to_string_pretty(&grade)?);
            Ok(())
        }
        Command::Freeze { course, reason } => {
            let frozen = service.freeze_course(&course, None, reason.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&frozen)?);
            Ok(())
        }
        Command::Unfreeze { course } => {
            if !service.unfreeze_course(&course).await? {
                warn!(course = %course, "Course was not explicitly frozen");
            }
            Ok(())
        }
    };

    service.shutdown().await;
    outcome
}

async fn start_service(config: &GradesConfig) -> Result<GradesService> {
    let pool = init_database(&config.database_path)
        .await
        .context("Failed to open grades database")?;
    let settings = RuntimeSettings::load(&pool).await?;

    let structure = match &config.structure_dir {
        Some(dir) => InMemoryCourseStructure::load_dir(dir)
            .await
            .with_context(|| format!("Failed to load course structures from {}", dir.display()))?,
        None => {
            warn!("No structure_dir configured; every course will be unavailable");
            InMemoryCourseStructure::new()
        }
    };
    let directory = match &config.roster_path {
        Some(path) => InMemoryLearnerDirectory::load_roster(path)
            .await
            .with_context(|| format!("Failed to load roster {}", path.display()))?,
        None => {
            warn!("No roster_path configured; no learners are enrolled");
            InMemoryLearnerDirectory::new()
        }
    };

    Ok(GradesService::start(ServiceDeps {
        pool,
        settings,
        structure: Arc::new(structure),
        directory: Arc::new(directory),
        report_store: Arc::new(FsReportStore::new(config.report_dir.clone())),
        grader: Arc::new(LoggingExternalGrader),
        work_dir: config.report_dir.join(".work"),
    }))
}

async fn run_events(service: &GradesService, source: &str) -> Result<()> {
    if source == "-" {
        let reader = BufReader::new(tokio::io::stdin());
        feed(service, reader).await
    } else {
        let file = tokio::fs::File::open(source)
            .await
            .with_context(|| format!("Failed to open event file {}", source))?;
        feed(service, BufReader::new(file)).await
    }
}

async fn feed<R: AsyncBufRead + Unpin>(service: &GradesService, reader: R) -> Result<()> {
    let cancel = service.cancel_token();
    let mut lines = reader.lines();
    let (mut handled, mut ignored, mut failed) = (0u64, 0u64, 0u64);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            _ = &mut shutdown => {
                cancel.cancel();
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let outcome = match InboundEvent::from_json_line(&line) {
            Ok(event) => service.handle(event).await.map_err(anyhow::Error::from),
            Err(e) => Err(e.into()),
        };
        match outcome {
            Ok(HandleOutcome::Ignored { reason }) => {
                ignored += 1;
                info!(reason = %reason, "Inbound event ignored");
            }
            Ok(_) => handled += 1,
            Err(e) => {
                failed += 1;
                warn!(error = %e, "Inbound event rejected");
            }
        }
    }

    if !cancel.is_cancelled() {
        service.wait_idle().await;
    }
    info!(handled, ignored, failed, "Event stream finished");
    Ok(())
}

async fn run_report(service: &GradesService, args: &ReportArgs) -> Result<()> {
    let request = ReportRequest {
        course_id: args.course.clone(),
        kind: args.kind,
        filter: args.filter(),
    };
    let cancel = service.cancel_token();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            cancel.cancel();
        })
    };
    let task = service.reports().start(&request, &cancel).await;
    watcher.abort();

    let task = task?;
    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
