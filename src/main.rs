//! FPGA runner JIT token tool - main entry point.
//!
//! One-shot CLI: mints a just-in-time GitHub Actions registration token
//! for a self-hosted FPGA runner and delivers it to stdout, a file, or a
//! runner process. Exits with a distinct code per failure category so the
//! provisioning automation can tell retryable failures from ones that
//! need an operator.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fpga_runner_jit::config::{Config, RunnerScope, Stage};
use fpga_runner_jit::delivery::Destination;
use fpga_runner_jit::error::Error;
use fpga_runner_jit::github::{DryRunPlatform, GitHubClient, JitTokenRequester, TokenExchanger};
use fpga_runner_jit::pipeline::Pipeline;
use fpga_runner_jit::retry::{RetryPolicy, TokioSleeper};
use fpga_runner_jit::runner::{derive_runner_name, FpgaTarget, RunnerSpec};
use fpga_runner_jit::signer::{AssertionSigner, RsaSigner, SignedAssertion};

/// Mint a JIT registration token for an FPGA CI runner
#[derive(Parser, Debug)]
#[command(name = "fpga-runner-jit", version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Deployment stage (selects the baked-in App profile)
    #[arg(short, long, value_enum, value_name = "STAGE")]
    stage: Option<Stage>,

    /// FPGA board attached to this runner host
    #[arg(short, long, value_enum, value_name = "FPGA_TARGET")]
    fpga_target: FpgaTarget,

    /// Unique number differentiating boards of the same type, e.g. "07"
    #[arg(short = 'i', long, value_name = "FPGA_IDENTIFIER")]
    fpga_identifier: String,

    /// Physical location of the runner, for example "kir"
    #[arg(short, long, value_name = "LOCATION")]
    location: String,

    /// Path to the GitHub App private key PEM
    #[arg(short, long, value_name = "KEY_PATH")]
    key_path: Option<PathBuf>,

    /// GitHub App id (overrides stage profile and config file)
    #[arg(long)]
    app_id: Option<u64>,

    /// Installation id (skips auto-discovery)
    #[arg(long)]
    installation_id: Option<u64>,

    /// Register under this organization
    #[arg(long, conflicts_with = "repo")]
    org: Option<String>,

    /// Register under this repository, as OWNER/NAME
    #[arg(long)]
    repo: Option<String>,

    /// Explicit runner name (default: derived from target/identifier/location)
    #[arg(long)]
    runner_name: Option<String>,

    /// Extra capability labels beyond the target's defaults
    #[arg(long = "label", value_name = "LABEL")]
    labels: Vec<String>,

    /// Write the token to this file instead of stdout
    #[arg(short, long, conflicts_with = "exec")]
    output: Option<PathBuf>,

    /// Launch this runner binary with the token instead of printing it
    #[arg(long, value_name = "RUNNER_BIN")]
    exec: Option<PathBuf>,

    /// Arguments passed to the runner binary before --jitconfig
    #[arg(long = "exec-arg", requires = "exec")]
    exec_args: Vec<String>,

    /// Abort the whole pipeline after this many seconds
    #[arg(long, value_name = "SECONDS")]
    deadline_secs: Option<u64>,

    /// App assertion time-to-live in seconds (clamped to GitHub's maximum)
    #[arg(long, value_name = "SECONDS", default_value_t = 540)]
    jwt_ttl_secs: u32,

    /// Use staging labels and a stub platform (no key or network needed)
    #[arg(short, long)]
    dry_run: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Logs go to stderr: stdout is reserved for the token itself.
    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    match run(args).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!("{e}");
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(args: Args) -> Result<(), Error> {
    let mut config =
        Config::load(args.config.as_deref()).map_err(|e| Error::config(e.to_string()))?;

    // CLI flags override config; the stage profile only fills gaps.
    if let Some(app_id) = args.app_id {
        config.github.app_id = app_id;
    }
    if let Some(installation_id) = args.installation_id {
        config.github.installation_id = Some(installation_id);
    }
    if let Some(key_path) = &args.key_path {
        config.github.private_key_path = key_path.clone();
    }
    if let Some(org) = &args.org {
        config.scope = Some(RunnerScope::Organization { name: org.clone() });
    } else if let Some(repo) = &args.repo {
        config.scope = Some(parse_repo_scope(repo)?);
    }
    if let Some(stage) = args.stage {
        info!("Running for stage: {stage:?}");
        config.apply_stage(stage);
    }

    if !args.dry_run {
        config.validate()?;
    }

    let staging = args.dry_run || args.stage == Some(Stage::Staging);
    let mut labels = args.fpga_target.labels(staging);
    labels.extend(args.labels.iter().cloned());

    let name = args.runner_name.clone().unwrap_or_else(|| {
        derive_runner_name(args.fpga_target, &args.fpga_identifier, &args.location)
    });

    let spec = RunnerSpec {
        name,
        labels,
        scope: config.scope.clone().unwrap_or(RunnerScope::Organization {
            name: "dry-run-org".into(),
        }),
        runner_group_id: config.runner_group_id,
    };
    info!(
        "Minting JIT token for runner '{}' with labels {:?} ({})",
        spec.name, spec.labels, spec.scope
    );

    let destination = match (&args.output, &args.exec) {
        (Some(path), _) => Destination::File { path: path.clone() },
        (None, Some(program)) => Destination::RunnerProcess {
            program: program.clone(),
            args: args.exec_args.clone(),
        },
        (None, None) => Destination::Stdout,
    };

    let (signer, exchanger, requester): (
        Arc<dyn AssertionSigner>,
        Arc<dyn TokenExchanger>,
        Arc<dyn JitTokenRequester>,
    ) = if args.dry_run {
        warn!("DRY-RUN MODE: using a stub platform, the minted token is fake");
        let platform = Arc::new(DryRunPlatform);
        (Arc::new(DryRunSigner), platform.clone(), platform)
    } else {
        let signer = Arc::new(RsaSigner::from_pem_file(
            config.github.app_id,
            &config.github.private_key_path,
        )?);
        let scope = spec.scope.clone();
        let client = Arc::new(GitHubClient::new(&config.github, &config.http, &scope)?);
        (signer, client.clone(), client)
    };

    // Cancellation: SIGINT or the optional deadline, whichever comes first.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            signal_cancel.cancel();
        }
    });
    if let Some(secs) = args.deadline_secs {
        let deadline_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
            warn!("Deadline of {secs}s reached, cancelling");
            deadline_cancel.cancel();
        });
    }

    let mut pipeline = Pipeline::new(
        signer,
        exchanger,
        requester,
        Arc::new(TokioSleeper),
        RetryPolicy::from(&config.http),
        cancel,
    )
    .with_jwt_ttl(chrono::Duration::seconds(i64::from(args.jwt_ttl_secs)));

    pipeline.run(&spec, &destination).await
}

/// Parse `OWNER/NAME` into a repository scope.
fn parse_repo_scope(repo: &str) -> Result<RunnerScope, Error> {
    match repo.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() => {
            Ok(RunnerScope::Repository {
                owner: owner.to_string(),
                repo: name.to_string(),
            })
        }
        _ => Err(Error::config(format!(
            "invalid --repo '{repo}': expected OWNER/NAME"
        ))),
    }
}

/// Signer for dry runs: a placeholder assertion, no key material involved.
struct DryRunSigner;

impl AssertionSigner for DryRunSigner {
    fn sign(&self, ttl: chrono::Duration) -> Result<SignedAssertion, Error> {
        let now = chrono::Utc::now();
        Ok(SignedAssertion::new(
            "dry-run-assertion".into(),
            now,
            now + ttl,
            uuid::Uuid::new_v4().to_string(),
        ))
    }
}
