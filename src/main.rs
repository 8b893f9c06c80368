mod colors;
mod config;
mod error;
mod probe;
mod remote;
mod xmlrpc;

use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dialoguer::{Confirm, theme::ColorfulTheme};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use colors::*;
use config::{Config, Overrides};
use probe::{CallEnd, CallPlan};
use remote::discuss;
use remote::{CallType, HttpTransport, RemoteModelClient, Transport};

/// A simple animated spinner for terminal feedback
struct Spinner {
    running: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Spinner {
    fn new(message: &str) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();
        let message = message.to_string();

        let handle = std::thread::spawn(move || {
            let frames = ['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];
            let mut i = 0;
            while running_clone.load(Ordering::Relaxed) {
                eprint!("\r{CYAN}{}{RESET} {}", frames[i % frames.len()], message);
                let _ = std::io::stderr().flush();
                std::thread::sleep(Duration::from_millis(80));
                i += 1;
            }
            eprint!("\r\x1b[K");
            let _ = std::io::stderr().flush();
        });

        Self {
            running,
            handle: Some(handle),
        }
    }

    fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        self.halt();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Call,
    Sessions,
    Clean,
    Members,
    Doctor,
    Config,
    Help,
    Version,
}

/// Parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Cli {
    command: Command,
    channel_id: Option<i64>,
    call_type: Option<CallType>,
    hold_secs: Option<u64>,
    no_clean: bool,
    keep: bool,
    json: bool,
    yes: bool,
    debug: bool,
    config_path: Option<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            channel_id: self.channel_id,
            call_type: self.call_type,
            hold_secs: self.hold_secs,
            clean_before_call: self.no_clean.then_some(false),
            debug: self.debug,
        }
    }
}

fn parse_args(args: &[String]) -> Result<Cli, String> {
    let mut iter = args.iter();

    let command = match iter.next().map(String::as_str) {
        None | Some("-h" | "--help" | "help") => Command::Help,
        Some("-V" | "--version" | "version") => Command::Version,
        Some("call") => Command::Call,
        Some("sessions") => Command::Sessions,
        Some("clean") => Command::Clean,
        Some("members") => Command::Members,
        Some("doctor") => Command::Doctor,
        Some("config") => Command::Config,
        Some(other) => return Err(format!("unknown command '{other}'")),
    };

    let mut cli = Cli {
        command,
        channel_id: None,
        call_type: None,
        hold_secs: None,
        no_clean: false,
        keep: false,
        json: false,
        yes: false,
        debug: false,
        config_path: None,
    };

    fn value<'a>(iter: &mut impl Iterator<Item = &'a String>, flag: &str) -> Result<&'a str, String> {
        iter.next()
            .map(String::as_str)
            .ok_or_else(|| format!("{flag} needs a value"))
    }

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--channel" | "-c" => {
                let raw = value(&mut iter, arg)?;
                cli.channel_id = Some(
                    raw.parse()
                        .map_err(|_| format!("invalid channel id '{raw}'"))?,
                );
            }
            "--hold" => {
                let raw = value(&mut iter, arg)?;
                cli.hold_secs = Some(
                    raw.parse()
                        .map_err(|_| format!("invalid hold seconds '{raw}'"))?,
                );
            }
            "--config" => cli.config_path = Some(PathBuf::from(value(&mut iter, arg)?)),
            "--video" => cli.call_type = Some(CallType::Video),
            "--audio" => cli.call_type = Some(CallType::Audio),
            "--no-clean" => cli.no_clean = true,
            "--keep" => cli.keep = true,
            "--json" => cli.json = true,
            "--yes" | "-y" => cli.yes = true,
            "--debug" | "-d" => cli.debug = true,
            other => return Err(format!("unknown option '{other}'")),
        }
    }

    Ok(cli)
}

/// Status for any failed command, including bad arguments.
const EXIT_FAILURE: i32 = 1;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let args: Vec<String> = env::args().skip(1).collect();
    let code = run(&args).await;
    if code != 0 {
        std::process::exit(code);
    }
}

async fn run(args: &[String]) -> i32 {
    let cli = match parse_args(args) {
        Ok(cli) => cli,
        Err(msg) => {
            eprintln!("{RED}error:{RESET} {msg}");
            eprintln!("  {DIM}Run 'rtcprobe help' for usage{RESET}");
            return EXIT_FAILURE;
        }
    };

    match cli.command {
        Command::Help => {
            print_help();
            return 0;
        }
        Command::Version => {
            println!("rtcprobe {}", env!("CARGO_PKG_VERSION"));
            return 0;
        }
        _ => {}
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => return report(&e),
    };
    init_logging(config.logging.debug);

    let result = match cli.command {
        Command::Call => run_call_command(&cli, &config).await,
        Command::Sessions => run_sessions_command(&cli, &config).await,
        Command::Clean => run_clean_command(&cli, &config).await,
        Command::Members => run_members_command(&cli, &config).await,
        Command::Doctor => run_doctor_command(&config).await,
        Command::Config => run_config_command(&config),
        Command::Help | Command::Version => Ok(()),
    };

    match result {
        Ok(()) => 0,
        Err(e) => report(&e),
    }
}

fn load_config(cli: &Cli) -> error::Result<Config> {
    let config = match &cli.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    Ok(config.with_overrides(&cli.overrides()))
}

fn report(e: &error::Error) -> i32 {
    eprintln!("{RED}Failed:{RESET} {e}");
    if let Some(suggestion) = e.suggestion() {
        eprintln!();
        eprintln!("  {YELLOW}Tip:{RESET} {suggestion}");
    }
    EXIT_FAILURE
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rtcprobe=debug,warn"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rtcprobe=warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

fn client_for(config: &Config) -> error::Result<RemoteModelClient> {
    let credentials = config.credentials()?;
    Ok(
        RemoteModelClient::new(credentials, HttpTransport::new(config.timeout()))
            .with_request_logging(config.logging.log_requests),
    )
}

async fn authenticated(config: &Config, quiet: bool) -> error::Result<RemoteModelClient> {
    let mut client = client_for(config)?;

    let spinner = (!quiet).then(|| Spinner::new("Authenticating..."));
    let result = client.authenticate().await;
    if let Some(spinner) = spinner {
        spinner.stop();
    }

    let handle = result?;
    if !quiet {
        println!(
            "{GREEN}✓{RESET} Authenticated as {} on {} {DIM}(uid {handle}){RESET}",
            client.credentials().username,
            client.credentials().database
        );
    }
    Ok(client)
}

fn print_json<T: serde::Serialize>(value: &T) -> error::Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    println!("{text}");
    Ok(())
}

async fn run_call_command(cli: &Cli, config: &Config) -> error::Result<()> {
    let Some(channel_id) = config.call.channel_id else {
        return Err(config::ConfigError::MissingValue {
            path: config.source.clone().unwrap_or_else(Config::path),
            field: "call.channel_id (or --channel)".to_string(),
        }
        .into());
    };

    let plan = CallPlan {
        channel_id,
        call_type: config.call_type(),
        clean_first: config.call.clean_before_call,
    };

    let client = authenticated(config, cli.json).await?;
    let outcome = probe::place_call(&client, plan).await?;

    if cli.json {
        print_json(&outcome)?;
    } else {
        println!(
            "{GREEN}✓{RESET} Calling as {} {DIM}(partner {}){RESET}",
            outcome.user.name, outcome.user.partner_id
        );
        println!(
            "{GREEN}✓{RESET} Channel {BOLD}{}{RESET} {DIM}({}, {} members){RESET}",
            outcome.channel.name, outcome.channel.channel_type, outcome.channel.member_count
        );
        if plan.clean_first {
            println!(
                "{GREEN}✓{RESET} Removed {} stale call session(s)",
                outcome.cleaned
            );
        }
        let verb = if outcome.member.created { "Created" } else { "Using" };
        println!("{GREEN}✓{RESET} {verb} membership {}", outcome.member.id);
        println!(
            "{GREEN}✓{RESET} {} call session {BOLD}{}{RESET} open",
            plan.call_type, outcome.session_id
        );
        match &outcome.session {
            Some(session) => println!(
                "  {DIM}member {}, camera {}, muted {}, created {}{RESET}",
                session.member.as_ref().map_or(0, |(id, _)| *id),
                if session.is_camera_on { "on" } else { "off" },
                if session.is_muted { "yes" } else { "no" },
                session.created_at.as_deref().unwrap_or("-")
            ),
            None => println!("{YELLOW}!{RESET} Session could not be read back"),
        }
        match (&outcome.message_id, &outcome.message_error) {
            (Some(id), _) => println!("{GREEN}✓{RESET} Chat message {id} posted"),
            (None, Some(err)) => println!("{YELLOW}!{RESET} Chat message failed: {err}"),
            (None, None) => {}
        }
    }

    if cli.keep {
        if !cli.json {
            println!(
                "{DIM}Leaving session {} open (--keep){RESET}",
                outcome.session_id
            );
        }
        return Ok(());
    }

    if hold_call(&client, outcome.session_id, config.call.hold_secs, cli.json).await == Hold::Gone {
        if !cli.json {
            println!(
                "{YELLOW}!{RESET} Call session {} was deleted elsewhere",
                outcome.session_id
            );
        }
        return Ok(());
    }

    match probe::end_call(&client, outcome.session_id).await {
        Ok(CallEnd::Removed) => {
            if !cli.json {
                println!("{GREEN}✓{RESET} Call session {} removed", outcome.session_id);
            }
        }
        Ok(CallEnd::AlreadyGone) => {
            if !cli.json {
                println!(
                    "{DIM}Call session {} was already removed{RESET}",
                    outcome.session_id
                );
            }
        }
        Err(e) => {
            warn!(session_id = outcome.session_id, error = %e, "Could not remove call session");
            eprintln!(
                "{YELLOW}!{RESET} Could not remove call session {}: {e}",
                outcome.session_id
            );
            eprintln!("  {DIM}Run 'rtcprobe clean --channel {channel_id}' to remove it{RESET}");
        }
    }

    Ok(())
}

/// Seconds between checks that the held session still exists.
const HOLD_CHECK_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    Elapsed,
    Interrupted,
    /// The session disappeared while held.
    Gone,
}

/// Keep the call open for `secs`, ending early on Ctrl-C or when the session
/// is deleted by someone else.
async fn hold_call<T: Transport>(
    client: &RemoteModelClient<T>,
    session_id: i64,
    secs: u64,
    quiet: bool,
) -> Hold {
    if secs == 0 {
        return Hold::Elapsed;
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut end = Hold::Elapsed;
    for elapsed in 0..secs {
        if elapsed > 0 && elapsed % HOLD_CHECK_SECS == 0 {
            match discuss::call_session_exists(client, session_id).await {
                Ok(true) => {}
                Ok(false) => {
                    end = Hold::Gone;
                    break;
                }
                Err(e) => warn!(session_id = session_id, error = %e, "Cannot check call session"),
            }
        }

        if !quiet {
            let remaining = secs - elapsed;
            print!("\r{DIM}Call open, ending in {remaining:>3}s (Ctrl-C ends now){RESET}");
            let _ = std::io::stdout().flush();
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            _ = &mut ctrl_c => {
                end = Hold::Interrupted;
                break;
            }
        }
    }

    if !quiet {
        print!("\r\x1b[K");
        let _ = std::io::stdout().flush();
    }
    end
}

async fn run_sessions_command(cli: &Cli, config: &Config) -> error::Result<()> {
    let client = authenticated(config, cli.json).await?;
    let sessions = discuss::list_call_sessions(&client, cli.channel_id).await?;

    if cli.json {
        return print_json(&sessions);
    }

    if sessions.is_empty() {
        println!("{DIM}No call sessions{RESET}");
        return Ok(());
    }

    println!();
    println!("{BOLD}{:>8}  {:<28} {:<24} {}{RESET}", "SESSION", "CHANNEL", "PARTNER", "STATE");
    for s in &sessions {
        let channel = s
            .channel
            .as_ref()
            .map(|(id, name)| format!("{name} ({id})"))
            .unwrap_or_else(|| "-".to_string());
        let partner = s
            .partner
            .as_ref()
            .map(|(_, name)| name.clone())
            .unwrap_or_else(|| "-".to_string());
        let mut state = Vec::new();
        if s.is_camera_on {
            state.push("camera");
        }
        if s.is_muted {
            state.push("muted");
        }
        println!("{:>8}  {:<28} {:<24} {}", s.id, channel, partner, state.join(","));
    }
    println!();
    println!("{DIM}{} session(s){RESET}", sessions.len());
    Ok(())
}

async fn run_clean_command(cli: &Cli, config: &Config) -> error::Result<()> {
    let client = authenticated(config, false).await?;
    let ids = discuss::find_call_sessions(&client, cli.channel_id).await?;

    if ids.is_empty() {
        println!("{GREEN}✓{RESET} No call sessions to remove");
        return Ok(());
    }

    let scope = match cli.channel_id {
        Some(id) => format!("in channel {id}"),
        None => "across all channels".to_string(),
    };

    if !cli.yes {
        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Delete {} call session(s) {scope}?", ids.len()))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("{DIM}Nothing deleted{RESET}");
            return Ok(());
        }
    }

    let removed = discuss::delete_call_sessions(&client, &ids).await?;
    println!("{GREEN}✓{RESET} Removed {removed} call session(s) {scope}");
    Ok(())
}

async fn run_members_command(cli: &Cli, config: &Config) -> error::Result<()> {
    let client = authenticated(config, cli.json).await?;
    let report = probe::channel_visibility(&client).await?;

    if cli.json {
        return print_json(&report);
    }

    println!();
    println!(
        "{BOLD}Channel memberships for {}{RESET} {DIM}(partner {}){RESET}",
        report.user.name, report.user.partner_id
    );
    for m in &report.memberships {
        let fold = m.fold_state.as_deref().unwrap_or("open");
        let marker = if m.visible() {
            format!("{GREEN}●{RESET}")
        } else {
            format!("{DIM}○{RESET}")
        };
        println!(
            "  {marker} {:>6}  {:<32} {DIM}{fold}{RESET}",
            m.channel_id, m.channel_name
        );
    }
    println!();
    println!(
        "{DIM}{} membership(s), {} visible{RESET}",
        report.memberships.len(),
        report.visible.len()
    );

    println!();
    println!("{BOLD}Active visible channels{RESET}");
    for c in &report.channels {
        let members = c
            .member_count
            .map_or_else(|| "?".to_string(), |n| n.to_string());
        println!(
            "  {:>6}  {:<32} {DIM}{}, {members} members{RESET}",
            c.id, c.name, c.channel_type
        );
    }
    let types: Vec<String> = report
        .by_type
        .iter()
        .map(|(kind, count)| format!("{kind}: {count}"))
        .collect();
    if !types.is_empty() {
        println!("  {DIM}{}{RESET}", types.join(", "));
    }

    println!();
    println!(
        "{BOLD}Compared with the is_member filter{RESET} {DIM}({} channel(s)){RESET}",
        report.is_member.len()
    );
    if report.consistent() {
        println!("{GREEN}✓{RESET} Both return the same channels");
    } else {
        if !report.only_in_memberships.is_empty() {
            println!(
                "{YELLOW}!{RESET} Only in memberships: {:?}",
                report.only_in_memberships
            );
        }
        if !report.only_in_is_member.is_empty() {
            println!(
                "{YELLOW}!{RESET} Only in is_member: {:?}",
                report.only_in_is_member
            );
        }
    }
    Ok(())
}

async fn run_doctor_command(config: &Config) -> error::Result<()> {
    println!();
    println!("{BOLD}{GREEN}rtcprobe doctor{RESET}");
    println!("{DIM}Running diagnostics...{RESET}");
    println!();

    // Check 1: config file
    let path = config.source.clone().unwrap_or_else(Config::path);
    if path.exists() {
        println!("{GREEN}✓{RESET} Config file: {}", path.display());
    } else {
        println!("{DIM}○{RESET} Config file not found {DIM}{}{RESET}", path.display());
    }

    // Check 2: credentials present
    let mut client = client_for(config)?;
    println!(
        "{GREEN}✓{RESET} Server {} database {}",
        client.credentials().server_url,
        client.credentials().database
    );

    // Check 3: server reachable
    let spinner = Spinner::new("Contacting server...");
    let version = client.server_version().await;
    spinner.stop();
    match version {
        Ok(info) => {
            let server_version = info
                .get("server_version")
                .and_then(xmlrpc::Value::as_str)
                .unwrap_or("unknown");
            println!("{GREEN}✓{RESET} Server reachable (version {server_version})");
        }
        Err(e) => {
            println!("{RED}✗{RESET} Server unreachable: {e}");
            return Err(e.into());
        }
    }

    // Check 4: authentication
    let handle = client.authenticate().await?;
    println!("{GREEN}✓{RESET} Authenticated {DIM}(uid {handle}){RESET}");

    // Check 5: call session model
    let fields = discuss::call_session_fields(&client).await?;
    println!(
        "{GREEN}✓{RESET} {} exposes {} fields",
        discuss::CALL_SESSIONS,
        fields.len()
    );
    let signaling: Vec<_> = fields
        .iter()
        .filter(|f| f.signaling)
        .map(|f| f.name.as_str())
        .collect();
    if signaling.is_empty() {
        println!(
            "{YELLOW}!{RESET} No signaling fields (sdp/ice/offer/answer) on call sessions; \
             media negotiation happens outside the record"
        );
    } else {
        println!(
            "{GREEN}✓{RESET} Signaling fields: {}",
            signaling.join(", ")
        );
    }

    // Check 6: RTC server configuration
    match discuss::rtc_parameters(&client).await {
        Ok(params) if params.is_empty() => {
            println!("{YELLOW}!{RESET} No RTC or ICE server parameters configured");
        }
        Ok(params) => {
            println!("{GREEN}✓{RESET} RTC configuration:");
            for p in &params {
                println!("    {CYAN}{}{RESET} = {}", p.key, p.value);
            }
        }
        Err(e) => {
            println!("{YELLOW}!{RESET} Cannot read {}: {e}", discuss::CONFIG_PARAMETERS);
        }
    }

    println!();
    println!("{GREEN}All checks passed{RESET}");
    Ok(())
}

fn run_config_command(config: &Config) -> error::Result<()> {
    let path = config.source.clone().unwrap_or_else(Config::path);
    println!("{BOLD}Config file:{RESET} {}", path.display());
    if !path.exists() {
        println!("{DIM}(not found, showing defaults){RESET}");
    }
    println!();

    let text = toml::to_string_pretty(&config.redacted())
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    println!("{text}");
    Ok(())
}

fn print_help() {
    println!(
        r#"
{BOLD}rtcprobe{RESET} {DIM}{}{RESET}
{DIM}Probe a remote discuss/call subsystem over XML-RPC{RESET}

{BOLD}USAGE:{RESET}  {GREEN}rtcprobe{RESET} <COMMAND> [OPTIONS]

{BOLD}COMMANDS{RESET}
  {YELLOW}call{RESET}       Open a call session in a channel, hold it, then remove it
  {YELLOW}sessions{RESET}   List call sessions
  {YELLOW}clean{RESET}      Delete call sessions
  {YELLOW}members{RESET}    List your channel memberships
  {YELLOW}doctor{RESET}     Check configuration, connectivity and the session model
  {YELLOW}config{RESET}     Show the effective configuration
  {YELLOW}help{RESET}       Show this help
  {YELLOW}version{RESET}    Show version

{BOLD}OPTIONS{RESET}
  {CYAN}-c, --channel <ID>{RESET}   Channel to act on
  {CYAN}--video{RESET} / {CYAN}--audio{RESET}    Call type (call)
  {CYAN}--hold <SECS>{RESET}        Seconds to keep the call open (call)
  {CYAN}--no-clean{RESET}           Keep existing sessions before calling (call)
  {CYAN}--keep{RESET}               Leave the new session open (call)
  {CYAN}--json{RESET}               Machine-readable output (call, sessions, members)
  {CYAN}-y, --yes{RESET}            Do not ask for confirmation (clean)
  {CYAN}-d, --debug{RESET}          Debug logging
  {CYAN}--config <PATH>{RESET}      Config file (default: {})

{BOLD}ENVIRONMENT{RESET}
  {CYAN}{}{RESET}     API key, overrides server.api_key
  {CYAN}{}{RESET}      Config file path
  {CYAN}RUST_LOG{RESET}             Log filter
"#,
        env!("CARGO_PKG_VERSION"),
        Config::path().display(),
        config::API_KEY_ENV,
        config::CONFIG_PATH_ENV,
    );
}
