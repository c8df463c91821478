use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sha2::{Digest, Sha256};

use verdex_context::{walk_files, RiskIndex, ScanMode, WalkOptions};
use verdex_core::pipeline::{run_verify, run_watch_cycle, PipelineDeps, PipelineOptions};
use verdex_core::scanner::Debouncer;
use verdex_core::VerifyError;

const EXIT_OK: i32 = 0;
const EXIT_VERDICT: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_INTERRUPT: i32 = 130;

#[derive(Parser)]
#[command(name = "verdex", about = "Consensus verifier: multi-model tribunal for code verification", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify a repository against a specification
    Verify {
        /// Target directory to verify
        #[arg(short, long, default_value = ".")]
        dir: String,

        /// Path to the specification file
        #[arg(short, long, default_value = "spec.txt")]
        spec: String,

        /// Path to the configuration file
        #[arg(short, long)]
        config: Option<String>,

        /// Git repository URL to clone and verify
        #[arg(short, long)]
        git: Option<String>,

        /// Watch mode: re-verify on changes via the layered scanner
        #[arg(short, long)]
        watch: bool,

        /// Scan all files instead of only changed ones
        #[arg(long)]
        full: bool,

        /// Enable verbose/debug output
        #[arg(short, long)]
        verbose: bool,
    },
    /// Build the per-file risk index consumed by context windowing
    Index {
        /// Target directory to index
        #[arg(short, long, default_value = ".")]
        dir: String,

        /// Rebuild even if an index already exists
        #[arg(short, long)]
        force: bool,

        /// Enable verbose/debug output
        #[arg(short, long)]
        verbose: bool,
    },
    /// Report how many provider credentials are configured
    CheckEnv,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Verify {
            dir,
            spec,
            config,
            git,
            watch,
            full,
            verbose,
        } => {
            init_logging(verbose);
            run_verify_command(dir, spec, config, git, watch, full).await
        }
        Commands::Index { dir, force, verbose } => {
            init_logging(verbose);
            run_index_command(&dir, force)
        }
        Commands::CheckEnv => {
            init_logging(false);
            let (present, total) = verdex_config::Config::credential_counts();
            println!("{present}/{total} provider credentials configured");
            EXIT_OK
        }
    };

    std::process::exit(code);
}

async fn run_verify_command(
    dir: String,
    spec: String,
    config_path: Option<String>,
    git: Option<String>,
    watch: bool,
    full: bool,
) -> i32 {
    let config = match verdex_config::Config::load(config_path.as_deref().map(Path::new)) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            return EXIT_USAGE;
        }
    };

    // --git clones into a temp dir and verifies that checkout.
    let (root, _clone_guard) = match git {
        Some(url) => match clone_repo(&url).await {
            Ok((path, guard)) => (path, Some(guard)),
            Err(e) => {
                tracing::error!(error = %e, "git clone failed");
                return EXIT_USAGE;
            }
        },
        None => (PathBuf::from(&dir), None),
    };

    if !root.is_dir() {
        tracing::error!(dir = %root.display(), "target directory does not exist");
        return EXIT_USAGE;
    }

    let spec_path = if Path::new(&spec).is_absolute() {
        PathBuf::from(&spec)
    } else if root.join(&spec).is_file() {
        root.join(&spec)
    } else {
        PathBuf::from(&spec)
    };
    if !spec_path.is_file() {
        tracing::error!(spec = %spec_path.display(), "specification file not found");
        return EXIT_USAGE;
    }

    let opts = PipelineOptions {
        root,
        spec_path,
        mode: if full { ScanMode::Full } else { ScanMode::Diff },
        config,
    };

    let result = tokio::select! {
        result = run(&opts, watch) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            return EXIT_INTERRUPT;
        }
    };

    match result {
        Ok(code) => code,
        Err(VerifyError::Config(e)) => {
            tracing::error!(error = %e, "configuration error");
            EXIT_USAGE
        }
        Err(VerifyError::SpecMissing(path)) => {
            tracing::error!(path = %path, "specification file not found");
            EXIT_USAGE
        }
        Err(e) => {
            tracing::error!(error = %e, "verification failed");
            EXIT_VERDICT
        }
    }
}

async fn run(opts: &PipelineOptions, watch: bool) -> Result<i32, VerifyError> {
    if watch {
        return watch_loop(opts).await;
    }

    let outcome = run_verify(opts, &PipelineDeps::default()).await?;
    print_summary(&outcome.verdict);
    Ok(outcome.verdict.exit_code())
}

/// Layered continuous verification: poll for changes, debounce bursts, run
/// the cheap scanner, escalate to the tribunal past the risk threshold.
async fn watch_loop(opts: &PipelineOptions) -> Result<i32, VerifyError> {
    let poll = Duration::from_secs(opts.config.watcher.poll_interval_seconds.max(1));
    let mut debouncer = Debouncer::new(Duration::from_secs(opts.config.watcher.debounce_seconds));
    let deps = PipelineDeps {
        cache: Some(std::sync::Arc::new(
            verdex_provider::cache::ResponseCache::new(512),
        )),
        ..PipelineDeps::default()
    };
    let walk = WalkOptions {
        allowed_extensions: opts.config.watcher.supported_extensions.clone(),
        ignore_dirs: opts.config.watcher.ignore_patterns.clone(),
    };
    let mut last_tree_hash = String::new();

    tracing::info!(
        root = %opts.root.display(),
        poll_seconds = poll.as_secs(),
        debounce_seconds = opts.config.watcher.debounce_seconds,
        "watching for changes (ctrl-c to stop)"
    );

    loop {
        tokio::time::sleep(poll).await;

        let tree_hash = tree_content_hash(&opts.root, &walk);
        if tree_hash != last_tree_hash {
            last_tree_hash = tree_hash;
            debouncer.record_event();
            tracing::debug!("change observed; debounce window restarted");
        }

        if !debouncer.try_fire() {
            continue;
        }

        match run_watch_cycle(opts, &deps).await {
            Ok(cycle) => {
                if let Some(verdict) = &cycle.verdict {
                    print_summary(verdict);
                } else {
                    tracing::info!(
                        violations = cycle.scan.violations.len(),
                        score = cycle.scan.total_risk_score,
                        "cycle complete, no escalation"
                    );
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "watch cycle failed");
            }
        }
    }
}

/// Cheap idempotence probe: hash of every watched file's content. A cycle
/// only counts as a change when some content actually changed.
fn tree_content_hash(root: &Path, walk: &WalkOptions) -> String {
    let mut hasher = Sha256::new();
    for rel in walk_files(root, walk) {
        hasher.update(rel.as_bytes());
        if let Ok(data) = std::fs::read(root.join(&rel)) {
            hasher.update(&data);
        }
    }
    format!("{:x}", hasher.finalize())
}

fn print_summary(verdict: &verdex_core::TribunalVerdict) {
    println!("Verdict: {}", verdict.overall_verdict);
    println!("Score: {:.1}/10", verdict.overall_score);
    println!(
        "Criteria: {} passed / {} failed / {} total",
        verdict.passed_criteria, verdict.failed_criteria, verdict.total_criteria
    );
    if verdict.veto.triggered {
        println!(
            "VETO by {} on invariant #{}",
            verdict.veto.judge.as_deref().unwrap_or("?"),
            verdict.veto.invariant_id.unwrap_or(0)
        );
    }
    if verdict.fail_fast.aborted {
        println!(
            "Aborted by static gate: {}",
            verdict.fail_fast.reason.as_deref().unwrap_or("critical findings")
        );
    }
}

fn run_index_command(dir: &str, force: bool) -> i32 {
    let root = PathBuf::from(dir);
    if !root.is_dir() {
        tracing::error!(dir = %root.display(), "target directory does not exist");
        return EXIT_USAGE;
    }

    if !force && RiskIndex::load(&root).is_some() {
        tracing::info!("risk index already present; use --force to rebuild");
        return EXIT_OK;
    }

    let files = walk_files(&root, &WalkOptions::default());
    let index = RiskIndex::build(&root, &files, 512 * 1024);
    let scored = index.scores.len();
    match index.save(&root) {
        Ok(()) => {
            println!(
                "Indexed {} files, {scored} carry risk scores",
                index.files_scanned
            );
            EXIT_OK
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to write risk index");
            EXIT_VERDICT
        }
    }
}

/// Shallow clone via the system git binary; the temp dir is removed when
/// the guard drops.
async fn clone_repo(url: &str) -> Result<(PathBuf, tempfile::TempDir)> {
    let guard = tempfile::TempDir::new()?;
    let target = guard.path().join("repo");

    tracing::info!(%url, "cloning repository");
    let status = tokio::process::Command::new("git")
        .args(["clone", "--depth", "1", url])
        .arg(&target)
        .status()
        .await?;

    if !status.success() {
        anyhow::bail!("git clone exited with {status}");
    }

    Ok((target, guard))
}
