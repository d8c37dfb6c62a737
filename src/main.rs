//! sshterm - interactive SSH terminal with inline ZMODEM upload
//!
//! `sshterm connect` opens a shell and renders its output with colors. When
//! the remote side runs `rz`, the file given with `--upload` (or one typed at
//! the prompt) is sent over the same channel.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::{Receiver, TryRecvError};
use sshterm_core::cli::{format_command_output, CliResult, ExitCodes, OutputFormat};
use sshterm_core::config::{AppConfig, ConnectionProfile, LoggingConfig};
use sshterm_core::core::session::{SessionEvent, TerminalSession};
use sshterm_core::core::terminal::{DisplaySurface, StyleState, StyledRun};
use sshterm_core::core::transfer::{FilePicker, TransferEvent, TransferState};
use sshterm_core::core::transport::{spawn_connect, ExecOutcome, SshAuth, SshConfig};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Poll period while an upload is running
const TRANSFER_POLL: Duration = Duration::from_millis(10);

/// sshterm CLI
#[derive(Parser, Debug)]
#[command(name = "sshterm", version, about = "Interactive SSH terminal with inline ZMODEM upload")]
struct Cli {
    /// Config file (default: platform config dir)
    #[arg(long, env = "SSHTERM_CONFIG")]
    config: Option<PathBuf>,

    /// Output format for one-shot commands
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open an interactive shell
    Connect {
        #[command(flatten)]
        target: TargetArgs,

        /// File to send when the remote side starts `rz`
        #[arg(short, long)]
        upload: Option<PathBuf>,
    },

    /// Run one command and print its output
    Exec {
        #[command(flatten)]
        target: TargetArgs,

        /// Command line to run
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Manage saved connection profiles
    Profiles {
        #[command(subcommand)]
        action: ProfileAction,
    },
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// Profile name or [user@]host[:port]
    destination: String,

    /// Port (overrides destination and profile)
    #[arg(short, long)]
    port: Option<u16>,

    /// Login name
    #[arg(short = 'l', long)]
    user: Option<String>,

    /// Private key file
    #[arg(short, long)]
    identity: Option<PathBuf>,

    /// Password (prompted for when neither this nor a key is given)
    #[arg(long, env = "SSHTERM_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

#[derive(Subcommand, Debug)]
enum ProfileAction {
    /// List saved profiles
    List,
    /// Save a profile
    Add {
        /// Profile name
        name: String,
        /// [user@]host[:port]
        destination: String,
        /// Private key file
        #[arg(short, long)]
        identity: Option<PathBuf>,
    },
    /// Delete a profile
    Remove {
        /// Profile name
        name: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(ExitCodes::CONFIG_ERROR);
        }
    };
    let _guard = init_logging(&cli, &config.logging);
    tracing::debug!("Starting sshterm v{}", sshterm_core::VERSION);

    let result = match run(&cli, config).await {
        Ok(result) => result,
        Err(e) => CliResult::from_anyhow(&e),
    };
    if let CliResult::Error(_, msg) = &result {
        if !cli.quiet {
            eprintln!("Error: {}", msg);
        }
    }
    result.to_exit_code()
}

fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    Ok(config)
}

/// Install the tracing subscriber
///
/// Logs go to stderr unless a log directory is configured; the returned guard
/// flushes the file writer on exit.
fn init_logging(cli: &Cli, logging: &LoggingConfig) -> Option<WorkerGuard> {
    let directive = match (cli.quiet, cli.verbose) {
        (true, _) => "error".to_string(),
        (false, 0) => logging.level.clone(),
        (false, 1) => "debug".to_string(),
        (false, _) => "trace".to_string(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &logging.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "sshterm.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let builder = builder.with_writer(writer).with_ansi(false);
            if logging.json {
                builder.json().init();
            } else {
                builder.init();
            }
            Some(guard)
        }
        None => {
            let builder = builder.with_writer(io::stderr);
            if logging.json {
                builder.json().init();
            } else {
                builder.init();
            }
            None
        }
    }
}

async fn run(cli: &Cli, mut config: AppConfig) -> anyhow::Result<CliResult> {
    match &cli.command {
        Commands::Connect { target, upload } => {
            let ssh = resolve_target(&config, target)?;
            connect(cli, &config, ssh, upload.clone()).await
        }
        Commands::Exec { target, command } => {
            let ssh = resolve_target(&config, target)?;
            exec(cli, ssh, command.join(" ")).await
        }
        Commands::Profiles { action } => handle_profiles(cli, &mut config, action),
    }
}

/// Split `[user@]host[:port]`
fn parse_destination(destination: &str) -> anyhow::Result<(Option<String>, String, Option<u16>)> {
    let (user, rest) = match destination.rsplit_once('@') {
        Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
        Some(_) => bail!("empty user name in {:?}", destination),
        None => (None, destination),
    };
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("invalid port in {:?}", destination))?;
            (host, Some(port))
        }
        _ => (rest, None),
    };
    if host.is_empty() {
        bail!("missing host in {:?}", destination);
    }
    Ok((user, host.to_string(), port))
}

/// Build the SSH settings from a profile or destination plus flags
fn resolve_target(config: &AppConfig, target: &TargetArgs) -> anyhow::Result<SshConfig> {
    let mut profile = match config.profile(&target.destination) {
        Some(profile) => profile.clone(),
        None => {
            let (user, host, port) = parse_destination(&target.destination)?;
            let user = user
                .or_else(|| target.user.clone())
                .or_else(|| std::env::var("USER").ok())
                .context("no user name given (use user@host or --user)")?;
            let mut profile = ConnectionProfile::new(&target.destination, &host, &user);
            if let Some(port) = port {
                profile.port = port;
            }
            profile
        }
    };
    if let Some(user) = &target.user {
        profile.username = user.clone();
    }
    if let Some(port) = target.port {
        profile.port = port;
    }
    if let Some(identity) = &target.identity {
        profile.key_file = Some(identity.clone());
    }

    let mut ssh = profile.ssh_config(&config.terminal);
    if let SshAuth::Password(_) = ssh.auth {
        let password = match &target.password {
            Some(password) => password.clone(),
            None => prompt_line(&format!("{}'s password: ", ssh.target()))?,
        };
        ssh = ssh.password(&password);
    }
    Ok(ssh)
}

fn prompt_line(prompt: &str) -> anyhow::Result<String> {
    eprint!("{}", prompt);
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn connect(
    cli: &Cli,
    config: &AppConfig,
    ssh: SshConfig,
    upload: Option<PathBuf>,
) -> anyhow::Result<CliResult> {
    let style = config.terminal.style();
    let mut display = StdoutDisplay::default();
    status(&mut display, &style, &format!("Connecting to {}...", ssh.target()));

    let target = ssh.target();
    let mut handle = spawn_connect(ssh, true).context("starting connect worker")?;
    let poll = config.terminal.poll_interval();
    let transport = loop {
        if let Some(result) = handle.try_take() {
            break result.with_context(|| format!("connecting to {}", target))?;
        }
        tokio::time::sleep(poll).await;
    };
    status(&mut display, &style, "Connection established.");

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("installing Ctrl+C handler")?;

    let input = spawn_stdin_reader()?;
    let mut picker = PromptPicker {
        preset: upload,
        input: input.clone(),
    };
    let mut session = TerminalSession::new(transport, style, config.session_config());
    let mut result = CliResult::success();
    let mut stdin_closed = false;

    loop {
        if interrupted.swap(false, Ordering::SeqCst) {
            session.interrupt();
        }
        loop {
            match input.try_recv() {
                Ok(line) => session.submit_line(&line),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    stdin_closed = true;
                    break;
                }
            }
        }

        for event in session.tick(Instant::now(), &mut display, &mut picker) {
            match event {
                SessionEvent::Transfer(event) => report_transfer(cli, &event),
                SessionEvent::PromptChanged(prompt) => tracing::debug!("Prompt now {:?}", prompt),
                SessionEvent::Disconnected(Some(e)) => result = CliResult::from(e),
                SessionEvent::Disconnected(None) => {}
            }
        }

        if !session.is_active() {
            break;
        }
        if stdin_closed && !session.is_transferring() {
            if let Some(mut transport) = session.into_channel() {
                transport.disconnect();
            }
            status(&mut display, &style, "Disconnected from server.");
            break;
        }

        let pause = if session.is_transferring() {
            TRANSFER_POLL
        } else {
            poll
        };
        tokio::time::sleep(pause).await;
    }
    Ok(result)
}

fn report_transfer(cli: &Cli, event: &TransferEvent) {
    if cli.quiet {
        return;
    }
    match event {
        TransferEvent::Started { name, size } => eprintln!("\r\nUploading {} ({} bytes)", name, size),
        TransferEvent::Progress { sent, total } => {
            eprint!("\r  {}/{} bytes", sent, total);
            let _ = io::stderr().flush();
        }
        TransferEvent::Finished {
            state: TransferState::Completed,
            ..
        } => eprintln!("\r\nUpload complete"),
        TransferEvent::Finished { state, error } => match error {
            Some(e) => eprintln!("\r\nUpload {}: {}", state, e),
            None => eprintln!("\r\nUpload {}", state),
        },
    }
}

async fn exec(cli: &Cli, ssh: SshConfig, command: String) -> anyhow::Result<CliResult> {
    let wait = Duration::from_secs(ssh.timeout_secs + 5);
    let target = ssh.target();
    let handle = spawn_connect(ssh, false).context("starting connect worker")?;

    let output = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let mut transport = handle
            .wait(wait)
            .with_context(|| format!("connecting to {}: no answer", target))?
            .with_context(|| format!("connecting to {}", target))?;
        let outcome = transport.exec_command(&command);
        transport.disconnect();
        match outcome? {
            ExecOutcome::Captured(output) => Ok(output),
            ExecOutcome::SentToShell => bail!("command went to an interactive shell"),
        }
    })
    .await
    .context("exec worker")??;

    print!("{}", format_command_output(&output, cli.format));
    if cli.format == OutputFormat::Json {
        println!();
    }
    io::stdout().flush()?;

    if output.exit_status == 0 {
        Ok(CliResult::success())
    } else {
        Ok(CliResult::error(
            ExitCodes::REMOTE_FAILED,
            format!("remote command exited with status {}", output.exit_status),
        ))
    }
}

fn handle_profiles(
    cli: &Cli,
    config: &mut AppConfig,
    action: &ProfileAction,
) -> anyhow::Result<CliResult> {
    match action {
        ProfileAction::List => {
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config.profiles)?),
                OutputFormat::Text => {
                    if config.profiles.is_empty() && !cli.quiet {
                        println!("No saved profiles.");
                    }
                    for profile in &config.profiles {
                        let key = profile
                            .key_file
                            .as_ref()
                            .map(|k| format!(" (key {})", k.display()))
                            .unwrap_or_default();
                        println!("{:<16} {}{}", profile.name, profile.target(), key);
                    }
                }
            }
            Ok(CliResult::success())
        }
        ProfileAction::Add {
            name,
            destination,
            identity,
        } => {
            if config.profile(name).is_some() {
                return Ok(CliResult::error(
                    ExitCodes::INVALID_ARGS,
                    format!("profile {:?} already exists", name),
                ));
            }
            let (user, host, port) = parse_destination(destination)?;
            let user = user
                .or_else(|| std::env::var("USER").ok())
                .context("no user name given (use user@host)")?;
            let mut profile = ConnectionProfile::new(name, &host, &user);
            if let Some(port) = port {
                profile.port = port;
            }
            profile.key_file = identity.clone();
            config.profiles.push(profile);
            save_config(cli, config)?;
            Ok(CliResult::success())
        }
        ProfileAction::Remove { name } => {
            let before = config.profiles.len();
            config.profiles.retain(|p| &p.name != name);
            if config.profiles.len() == before {
                return Ok(CliResult::error(
                    ExitCodes::INVALID_ARGS,
                    format!("no profile named {:?}", name),
                ));
            }
            save_config(cli, config)?;
            Ok(CliResult::success())
        }
    }
}

fn save_config(cli: &Cli, config: &AppConfig) -> anyhow::Result<()> {
    match &cli.config {
        Some(path) => config.save_to(path)?,
        None => config.save()?,
    }
    Ok(())
}

fn status(display: &mut dyn DisplaySurface, style: &StyleState, text: &str) {
    let mut style = *style;
    style.reset();
    display.append_run(&StyledRun::new(format!("{}\n", text), &style));
}

/// Read stdin lines on a thread; the channel closes at EOF
fn spawn_stdin_reader() -> anyhow::Result<Receiver<Vec<u8>>> {
    let (tx, rx) = crossbeam_channel::unbounded();
    std::thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            let mut lock = stdin.lock();
            loop {
                let mut line = Vec::new();
                match lock.read_until(b'\n', &mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("stdin: {}", e);
                        break;
                    }
                }
            }
        })
        .context("starting stdin reader")?;
    Ok(rx)
}

/// Asks for the upload path, unless one was given on the command line
struct PromptPicker {
    preset: Option<PathBuf>,
    input: Receiver<Vec<u8>>,
}

impl FilePicker for PromptPicker {
    fn pick_upload(&mut self) -> Option<PathBuf> {
        if let Some(path) = self.preset.take() {
            return Some(path);
        }
        eprint!("\r\nFile to upload (empty to skip): ");
        let _ = io::stderr().flush();
        let line = self.input.recv().ok()?;
        let path = String::from_utf8_lossy(&line).trim().to_string();
        if path.is_empty() {
            None
        } else {
            Some(PathBuf::from(path))
        }
    }
}

/// Renders styled runs to stdout with 24-bit SGR sequences
#[derive(Default)]
struct StdoutDisplay {
    title: Option<String>,
}

impl StdoutDisplay {
    fn write(&self, bytes: &[u8]) {
        let mut out = io::stdout().lock();
        if let Err(e) = out.write_all(bytes).and_then(|()| out.flush()) {
            tracing::debug!("stdout: {}", e);
        }
    }
}

impl DisplaySurface for StdoutDisplay {
    fn append_run(&mut self, run: &StyledRun) {
        let mut sgr = format!(
            "\x1b[0;38;2;{};{};{};48;2;{};{};{}",
            run.fg.r, run.fg.g, run.fg.b, run.bg.r, run.bg.g, run.bg.b
        );
        if run.bold {
            sgr.push_str(";1");
        }
        if run.italic {
            sgr.push_str(";3");
        }
        if run.underline {
            sgr.push_str(";4");
        }
        let text = run.text.replace('\n', "\x1b[0m\n");
        self.write(format!("{}m{}\x1b[0m", sgr, text).as_bytes());
    }

    fn clear(&mut self) {
        self.write(b"\x1b[2J\x1b[H");
    }

    fn set_title(&mut self, title: &str) {
        if self.title.as_deref() != Some(title) {
            self.title = Some(title.to_string());
            self.write(format!("\x1b]0;{}\x07", title).as_bytes());
        }
    }
}
