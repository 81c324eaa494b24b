// Taskscan CLI - Parallel Scheduled-Task Inventory

use std::io::{self, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use taskscan::collect::ScheduledTaskCollector;
use taskscan::config::{dedupe_targets, parse_host_list, read_hosts_file, ScanConfig, ScanFile};
use taskscan::engine::{aggregate::recap, Credential, LocalHostSet};
use taskscan::output::report::{write_json, write_text};
use taskscan::output::{EventEmitter, OutputFormat, ScanError, ScanEvent};

#[derive(Parser)]
#[command(
    name = "taskscan",
    about = "Inventory scheduled tasks across many hosts in parallel",
    version,
    author,
    disable_colored_help = true,
    term_width = 0,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode - only show errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    output_format: String,
}

#[derive(Subcommand)]
#[command(disable_colored_help = true)]
enum Commands {
    /// Collect cron entries and systemd timers from every target
    Scan {
        /// Comma-separated host list
        #[arg(short = 'H', long)]
        hosts: Option<String>,

        /// File with one host per line (`#` comments allowed)
        #[arg(short = 'f', long)]
        hosts_file: Option<PathBuf>,

        /// YAML scan file (hosts, throttle_limit, timeout_secs, user, ...)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Maximum hosts scanned at once [default: 32]
        #[arg(short = 't', long)]
        throttle_limit: Option<usize>,

        /// Per-host timeout in seconds (unset waits forever)
        #[arg(long)]
        timeout: Option<u64>,

        /// Milliseconds between checks on running hosts
        #[arg(long, default_value = "100")]
        poll_interval_ms: u64,

        /// Reach every host over SSH, localhost included
        #[arg(long)]
        use_remoting: bool,

        /// SSH user
        #[arg(short, long)]
        user: Option<String>,

        /// SSH password (insecure - prefer --ask-pass)
        #[arg(long)]
        password: Option<String>,

        /// Prompt for SSH password
        #[arg(short = 'k', long)]
        ask_pass: bool,

        /// Path to SSH private key
        #[arg(long)]
        private_key: Option<PathBuf>,

        /// SSH port [default: 22]
        #[arg(short, long)]
        port: Option<u16>,

        /// Show a progress bar while hosts complete
        #[arg(long)]
        progress: bool,
    },

    /// Show the names this machine answers to
    LocalHosts,
}

struct ScanArgs {
    hosts: Option<String>,
    hosts_file: Option<PathBuf>,
    config: Option<PathBuf>,
    throttle_limit: Option<usize>,
    timeout: Option<u64>,
    poll_interval_ms: u64,
    use_remoting: bool,
    user: Option<String>,
    password: Option<String>,
    ask_pass: bool,
    private_key: Option<PathBuf>,
    port: Option<u16>,
    progress: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet);

    let output_format = OutputFormat::from_str(&cli.output_format).unwrap_or_else(|_| {
        eprintln!("Invalid output format: {}. Using 'text'.", cli.output_format);
        OutputFormat::Text
    });

    let result = match cli.command {
        Commands::Scan {
            hosts,
            hosts_file,
            config,
            throttle_limit,
            timeout,
            poll_interval_ms,
            use_remoting,
            user,
            password,
            ask_pass,
            private_key,
            port,
            progress,
        } => {
            let args = ScanArgs {
                hosts,
                hosts_file,
                config,
                throttle_limit,
                timeout,
                poll_interval_ms,
                use_remoting,
                user,
                password,
                ask_pass,
                private_key,
                port,
                progress,
            };
            run_scan(args, output_format, cli.verbose, cli.quiet).await
        }
        Commands::LocalHosts => {
            list_local_hosts(output_format);
            Ok(true)
        }
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}

/// RUST_LOG wins; otherwise the level follows --verbose / --quiet
fn init_tracing(verbose: bool, quiet: bool) {
    let default_level = if quiet {
        "error"
    } else if verbose {
        "info"
    } else {
        "warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

/// Returns Ok(false) when any host failed or timed out
async fn run_scan(
    args: ScanArgs,
    output_format: OutputFormat,
    verbose: bool,
    quiet: bool,
) -> Result<bool, ScanError> {
    let file = match &args.config {
        Some(path) => ScanFile::from_file(path)?,
        None => ScanFile::default(),
    };

    // Target priority: --hosts, then --hosts-file, then the scan file
    let mut targets = Vec::new();
    if let Some(ref list) = args.hosts {
        targets.extend(parse_host_list(list));
    }
    if let Some(ref path) = args.hosts_file {
        targets.extend(read_hosts_file(path)?);
    }
    if targets.is_empty() {
        targets.extend(file.hosts.iter().cloned());
    }
    let targets = dedupe_targets(targets);

    if targets.is_empty() {
        return Err(ScanError::Config {
            message: "no targets to scan".to_string(),
            suggestion: Some(
                "Pass --hosts, --hosts-file, or a --config file with a hosts list".to_string(),
            ),
        });
    }

    let mut config = ScanConfig::default()
        .with_poll_interval(Duration::from_millis(args.poll_interval_ms))
        .with_force_remote(args.use_remoting)
        .with_progress(args.progress);

    if let Some(limit) = args.throttle_limit.or(file.throttle_limit) {
        config = config.with_throttle_limit(limit);
    }
    if let Some(secs) = args.timeout.or(file.timeout_secs) {
        config = config.with_timeout(Duration::from_secs(secs));
    }
    if let Some(credential) = build_credential(&args, &file)? {
        config = config.with_credential(credential);
    }

    let local_hosts = LocalHostSet::discover();
    let collector = ScheduledTaskCollector::new(local_hosts.clone())
        .with_port(args.port.or(file.port).unwrap_or(22));

    tracing::info!(
        hosts = targets.len(),
        throttle_limit = config.throttle_limit,
        "starting scan"
    );

    let show_bar = args.progress && !quiet && output_format == OutputFormat::Text;
    let (emitter, events) = EventEmitter::channel();
    let progress_task = tokio::spawn(drive_progress(events, targets.len() as u64, show_bar));

    let results = taskscan::run(&config, local_hosts, collector, targets, Some(emitter)).await;
    // The emitter is gone once the run ends, which ends the progress task
    progress_task.await.ok();
    let results = results?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    match output_format {
        OutputFormat::Json => write_json(&mut out, &results)?,
        OutputFormat::Text => write_text(&mut out, &results, verbose)?,
    }
    out.flush()?;

    Ok(!recap(&results).has_failures())
}

fn build_credential(args: &ScanArgs, file: &ScanFile) -> Result<Option<Credential>, ScanError> {
    let user = args.user.clone().or_else(|| file.user.clone());
    let private_key = args.private_key.clone().or_else(|| file.private_key.clone());

    let password = if args.ask_pass {
        Some(prompt_password("SSH password: ")?)
    } else {
        args.password.clone()
    };

    if user.is_none() && password.is_none() && private_key.is_none() {
        return Ok(None);
    }

    let mut credential = Credential::new(user.unwrap_or_default());
    if let Some(password) = password {
        credential = credential.with_password(password);
    }
    if let Some(key) = private_key {
        credential = credential.with_private_key(key);
    }
    Ok(Some(credential))
}

fn prompt_password(prompt: &str) -> Result<String, ScanError> {
    // Prompt on stderr so it shows even with redirected stdout
    eprint!("{}", prompt.cyan());
    io::stderr().flush().ok();

    let password = rpassword::read_password().map_err(|e| ScanError::Io {
        message: format!("Failed to read password: {}", e),
        path: None,
    })?;
    let password = password.trim().to_string();

    if password.is_empty() {
        return Err(ScanError::Config {
            message: "empty password".to_string(),
            suggestion: Some("Use --password or key-based authentication".to_string()),
        });
    }

    Ok(password)
}

/// Consume scan events until the sender is dropped
async fn drive_progress(mut events: mpsc::UnboundedReceiver<ScanEvent>, total: u64, show: bool) {
    let bar = if show {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap()
                .progress_chars("=> "),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Some(bar)
    } else {
        None
    };

    while let Some(event) = events.recv().await {
        let Some(ref bar) = bar else {
            continue;
        };
        match event {
            ScanEvent::JobStarted { target, .. } => bar.set_message(target),
            ScanEvent::JobCompleted { .. } => bar.inc(1),
            ScanEvent::JobFailed { target, .. } => {
                bar.println(format!("{} {}", "FAILED".red().bold(), target));
                bar.inc(1);
            }
            ScanEvent::JobTimedOut { target, .. } => {
                bar.println(format!("{} {}", "TIMEOUT".yellow().bold(), target));
                bar.inc(1);
            }
            ScanEvent::Progress(_) => {}
        }
    }

    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
}

fn list_local_hosts(output_format: OutputFormat) {
    let hosts = LocalHostSet::discover();
    match output_format {
        OutputFormat::Json => {
            let names: Vec<&str> = hosts.iter().collect();
            println!("{}", serde_json::json!({ "local_hosts": names }));
        }
        OutputFormat::Text => {
            println!("{}", "LOCAL HOSTS".green().bold());
            for name in hosts.iter() {
                println!("  {}", name);
            }
        }
    }
}
