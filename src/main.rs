//! DRNAT - Dumb Rust NAT
//!
//! Command-line front end for port forwards into LXD containers.
//!
//! # Usage
//!
//! ```bash
//! drnat init --listen-ip 203.0.113.10 --uplink eth0   # Write a config file
//! drnat add web1 tcp 8080 80                           # Forward :8080 to web1:80
//! drnat list web1                                      # Show web1's forwards
//! drnat remove web1 tcp 8080 80                        # Remove it again
//! drnat verify                                         # Compare ledger and kernel
//! drnat teardown web1                                  # Before deleting/reinstalling web1
//! drnat bootstrap web1                                 # SSH forward on a random port
//! ```
//!
//! Exit code 0 on success, 1 on failure.

use clap::{Parser, Subcommand};
use drnat::audit::AuditLog;
use drnat::config::{self, AppConfig};
use drnat::core::backend::ComputeBackend;
use drnat::core::error::{Error, ErrorTranslation, IptablesErrorPattern};
use drnat::core::ledger::Ledger;
use drnat::core::lifecycle::{BootstrapOutcome, LifecycleCoordinator};
use drnat::core::sync::{KernelState, RuleSynchronizer};
use drnat::core::rule::{Protocol, RuleRecord};
use drnat::validators::{check_well_known_port, validate_protocol};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "drnat")]
#[command(version = build::CLAP_LONG_VERSION)]
#[command(about = "Dumb Rust NAT - port forwards for LXD containers", long_about = None)]
struct Cli {
    /// Config file (default: $DRNAT_CONFIG, else /etc/drnat/config.json as root or ~/.config/drnat/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file
    Init {
        /// Host address external clients connect to
        #[arg(long)]
        listen_ip: Ipv4Addr,
        /// Outbound interface for MASQUERADE rules
        #[arg(long, value_name = "IFACE")]
        uplink: Option<String>,
        /// Do not create MASQUERADE rules
        #[arg(long)]
        skip_masquerade: bool,
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    #[command(flatten)]
    Forward(ForwardCommand),
}

/// Commands that need a loaded config
#[derive(Subcommand)]
enum ForwardCommand {
    /// Forward an external port to a port inside an instance
    Add {
        instance: String,
        #[arg(value_parser = validate_protocol)]
        protocol: Protocol,
        external: u16,
        internal: u16,
    },
    /// Remove a forward (succeeds if it does not exist)
    Remove {
        instance: String,
        #[arg(value_parser = validate_protocol)]
        protocol: Protocol,
        external: u16,
        internal: u16,
        /// Instance address to use if the ledger has no record
        #[arg(long)]
        ip: Option<Ipv4Addr>,
    },
    /// Show one forward by rule id
    Show { rule_id: String },
    /// List an instance's forwards
    List {
        instance: String,
        /// Print the records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Compare ledger records with the kernel and live instance addresses
    Verify { instance: Option<String> },
    /// Remove all of an instance's forwards (run before deleting or reinstalling it)
    Teardown { instance: String },
    /// Create the remote-access (SSH) forward for an instance
    Bootstrap {
        instance: String,
        /// External port (default: random from the configured range)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Show configuration, ledger and backend health
    Status,
}

fn main() -> ExitCode {
    let _ = drnat::utils::ensure_dirs();
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool, to_file: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else if to_file {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };

    if to_file && let Some(mut log_path) = drnat::utils::get_state_dir() {
        log_path.push("drnat.log");
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
        {
            tracing_subscriber::fmt()
                .with_writer(file)
                .with_ansi(false)
                .with_max_level(level)
                .init();
            return;
        }
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();
}

fn translate(error: &Error) -> Option<ErrorTranslation> {
    match error {
        Error::Command(cmd) => {
            let detail = if cmd.stderr().is_empty() {
                cmd.to_string()
            } else {
                cmd.stderr().to_string()
            };
            Some(IptablesErrorPattern::match_error(&detail))
        }
        Error::QuotaExceeded { instance_id, .. } => Some(
            ErrorTranslation::new(format!("{instance_id} has no forwards left"))
                .with_suggestion(format!("Remove one first: drnat list {instance_id}"))
                .with_suggestion(format!(
                    "Or raise the limit: lxc config set {instance_id} user.nat_acl_limit <N>"
                )),
        ),
        Error::Conflict { .. } => Some(
            ErrorTranslation::new("That forward or external port is already in use")
                .with_suggestion("Pick another external port"),
        ),
        Error::UpstreamUnavailable(_) => Some(
            ErrorTranslation::new("LXD did not answer as expected")
                .with_suggestion("Check the daemon: lxc list")
                .with_suggestion("A freshly started instance may not have an address yet"),
        ),
        _ => None,
    }
}

fn report_error(error: &Error) {
    eprintln!("Error: {error}");
    if let Some(translation) = translate(error) {
        eprintln!("  {}", translation.user_message);
        for suggestion in &translation.suggestions {
            eprintln!("  - {suggestion}");
        }
        if let Some(url) = &translation.help_url {
            eprintln!("  See: {url}");
        }
    }
}

struct Stack {
    sync: Arc<RuleSynchronizer>,
    lifecycle: LifecycleCoordinator,
    backend: Arc<dyn ComputeBackend>,
}

/// Wires config into the synchronizer; `ping` makes an unreachable LXD fatal
async fn build_stack(config: &AppConfig, ping: bool) -> drnat::Result<Stack> {
    let backend: Arc<dyn ComputeBackend> = Arc::new(config.lxd_backend());
    if ping {
        backend.ping().await?;
    }

    let ledger = Arc::new(Ledger::new(config.resolved_ledger_path()?));
    let mut sync = RuleSynchronizer::new(
        ledger,
        Arc::new(config.iptables_driver()),
        backend.clone(),
        config.nat_settings(),
    );
    match AuditLog::new() {
        Ok(audit) => sync = sync.with_audit(audit),
        Err(e) => tracing::warn!("Audit log unavailable: {e}"),
    }

    let sync = Arc::new(sync);
    let lifecycle = LifecycleCoordinator::new(sync.clone(), config.bootstrap_settings());
    Ok(Stack {
        sync,
        lifecycle,
        backend,
    })
}

fn print_record(record: &RuleRecord, listen_ip: Ipv4Addr) {
    println!(
        "  {:<28} {}:{}/{} -> {}:{}",
        record.rule_id,
        listen_ip,
        record.external_port,
        record.protocol,
        record.instance_ip,
        record.internal_port
    );
}

fn kernel_state(state: &KernelState) -> String {
    match state {
        KernelState::Present => "ok".to_string(),
        KernelState::Missing => "MISSING".to_string(),
        KernelState::Unknown(e) => format!("unknown ({e})"),
    }
}

async fn init_config(
    config_path: &Path,
    listen_ip: Ipv4Addr,
    uplink: Option<String>,
    skip_masquerade: bool,
    force: bool,
) -> drnat::Result<()> {
    if !force && tokio::fs::try_exists(config_path).await.unwrap_or(false) {
        return Err(Error::Config(format!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        )));
    }

    let mut config = AppConfig::new(listen_ip);
    config.uplink_interface = uplink;
    config.skip_masquerade = skip_masquerade;
    config.validate()?;
    for warning in config.warnings() {
        println!("Warning: {warning}");
    }
    config::save_config(&config, config_path).await?;
    println!("✓ Wrote {}", config_path.display());
    Ok(())
}

async fn handle_cli(cli: Cli) -> drnat::Result<()> {
    let config_path = config::config_path(cli.config.as_deref());

    let command = match cli.command {
        Commands::Init {
            listen_ip,
            uplink,
            skip_masquerade,
            force,
        } => {
            init_logging(cli.verbose, false);
            return init_config(&config_path, listen_ip, uplink, skip_masquerade, force).await;
        }
        Commands::Forward(command) => command,
    };

    let config = config::load_config(&config_path).await?;
    init_logging(cli.verbose, config.log_to_file);
    for warning in config.warnings() {
        tracing::warn!("{warning}");
    }

    match command {
        ForwardCommand::Add {
            instance,
            protocol,
            external,
            internal,
        } => {
            let stack = build_stack(&config, true).await?;
            if let Some(note) = check_well_known_port(external) {
                println!("Note: {note}");
            }
            let record = stack
                .sync
                .add_rule(&instance, protocol, external, internal)
                .await?;
            println!("✓ Forward created:");
            print_record(&record, config.listen_ip);
        }
        ForwardCommand::Remove {
            instance,
            protocol,
            external,
            internal,
            ip,
        } => {
            let stack = build_stack(&config, true).await?;
            let report = stack
                .sync
                .remove_rule(&instance, protocol, external, internal, ip)
                .await?;
            if report.was_noop() {
                println!("Nothing to remove for {}", report.rule_id);
            } else {
                println!("✓ Removed {}", report.rule_id);
            }
            for (label, outcome) in [("dnat", &report.dnat), ("masquerade", &report.masquerade)] {
                if let Some(outcome) = outcome {
                    println!("  {label}: {}", outcome.as_str());
                }
            }
            if !report.is_clean() {
                println!("Warning: a kernel rule could not be deleted; see `drnat verify`");
            }
        }
        ForwardCommand::Show { rule_id } => {
            let stack = build_stack(&config, false).await?;
            let record = stack.sync.find_rule(&rule_id).await?;
            print_record(&record, config.listen_ip);
            if let Some(created) = record.created_at {
                println!("  created {}", created.format("%Y-%m-%d %H:%M:%S UTC"));
            }
        }
        ForwardCommand::List { instance, json } => {
            let stack = build_stack(&config, false).await?;
            let records = stack.sync.list_rules(&instance).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No forwards for {instance}");
            } else {
                println!("Forwards for {instance}:");
                for record in &records {
                    print_record(record, config.listen_ip);
                }
            }
        }
        ForwardCommand::Verify { instance } => {
            let stack = build_stack(&config, true).await?;
            let reports = stack.sync.verify_rules(instance.as_deref()).await;
            let drifted = reports.iter().filter(|r| !r.is_in_sync()).count();

            for report in &reports {
                let mark = if report.is_in_sync() { "✓" } else { "✗" };
                println!(
                    "{mark} {}  dnat: {}{}{}",
                    report.record.rule_id,
                    kernel_state(&report.dnat),
                    report
                        .masquerade
                        .as_ref()
                        .map(|m| format!("  masquerade: {}", kernel_state(m)))
                        .unwrap_or_default(),
                    match report.live_address {
                        Some(ip) if report.snapshot_stale() => format!(
                            "  address changed: {} -> {ip}",
                            report.record.instance_ip
                        ),
                        _ => String::new(),
                    }
                );
            }
            println!("{} record(s), {drifted} drifted", reports.len());
            if drifted > 0 {
                return Err(Error::Internal(format!(
                    "{drifted} record(s) out of sync with the kernel"
                )));
            }
        }
        ForwardCommand::Teardown { instance } => {
            let stack = build_stack(&config, true).await?;
            let report = stack.lifecycle.teardown(&instance).await;
            println!(
                "✓ Removed {} forward(s) for {instance}",
                report.removed_count()
            );
            if report.discrepancies() > 0 {
                println!(
                    "Warning: {} kernel rule(s) could not be deleted",
                    report.discrepancies()
                );
            }
            for (rule_id, error) in &report.failures {
                println!("✗ {rule_id}: {error}");
            }
            if !report.failures.is_empty() {
                return Err(Error::Internal(format!(
                    "{} record(s) could not be removed",
                    report.failures.len()
                )));
            }
        }
        ForwardCommand::Bootstrap { instance, port } => {
            let stack = build_stack(&config, true).await?;
            let outcome = match port {
                Some(port) => {
                    stack
                        .lifecycle
                        .on_first_boot_with_port(&instance, port)
                        .await
                }
                None => stack.lifecycle.on_first_boot(&instance).await,
            };
            match outcome {
                BootstrapOutcome::Provisioned(record) => {
                    println!("✓ Remote access for {instance}:");
                    print_record(&record, config.listen_ip);
                }
                BootstrapOutcome::PortCollision(port) => {
                    return Err(Error::conflict(
                        format!("{instance}:{port}"),
                        format!("external port {port} is already in use"),
                    ));
                }
                BootstrapOutcome::AddressUnresolved => {
                    return Err(Error::UpstreamUnavailable(format!(
                        "{instance} never reported an address"
                    )));
                }
                BootstrapOutcome::Failed(reason) => return Err(Error::Internal(reason)),
            }
        }
        ForwardCommand::Status => {
            let stack = build_stack(&config, false).await?;
            println!("Config:      {}", config_path.display());
            println!("Listen IP:   {}", config.listen_ip);
            println!(
                "Masquerade:  {}",
                config.masquerade_interface().unwrap_or("disabled")
            );
            println!("Ledger:      {}", stack.sync.ledger().path().display());
            match stack.sync.ledger().try_load().await {
                Ok(records) => println!("Forwards:    {}", records.len()),
                Err(e) => println!("Forwards:    ✗ {e}"),
            }
            match stack.backend.ping().await {
                Ok(()) => println!("LXD:         ok"),
                Err(e) => println!("LXD:         ✗ {e}"),
            }
            if !nix::unistd::getuid().is_root() {
                println!("Note: Not running as root. Will use sudo/pkexec for iptables.");
            }
            if let Ok(audit) = AuditLog::new()
                && let Ok(events) = audit.read_recent(1).await
                && let Some(last) = events.first()
            {
                println!(
                    "Last change: {:?} at {} ({})",
                    last.event_type,
                    last.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
                    if last.success { "ok" } else { "failed" }
                );
            }
        }
    }
    Ok(())
}
