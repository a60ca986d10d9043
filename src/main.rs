use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use opsguard::cli::{AuditCommands, Cli, Commands, LimitCommands};
use opsguard::config::{Settings, CONFIG_FILE};
use opsguard::core::audit::AuditSeverity;
use opsguard::core::safe_json::{safe_json_parse, DEFAULT_MAX_DEPTH};
use opsguard::core::{CheckOptions, EventContext, RateLimitError, SecurityCore, VerifyOptions};
use opsguard::ui::Console;

/// Exit code for a call rejected by the rate limiter
const EXIT_RATE_LIMITED: u8 = 2;

fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let home = match &cli.home {
        Some(home) => PathBuf::from(home),
        None => Settings::home_dir()?,
    };
    let settings = Settings::load_from(&home.join(CONFIG_FILE))?;
    let console = Console::new();

    let core = SecurityCore::open(&home, &settings);

    match cli.command {
        Commands::Limits { command } => run_limits(&core, &console, command),
        Commands::Audit { command } => run_audit(&core, &console, command, cli.verbose),
        Commands::Config => {
            console.show_config(&settings, &home);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_limits(core: &SecurityCore, console: &Console, command: LimitCommands) -> Result<ExitCode> {
    let limiter = core.limiter();

    match command {
        LimitCommands::Status { json } => {
            let status = limiter.status();
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                console.limit_status(&status);
            }
        }
        LimitCommands::Check {
            command,
            no_increment,
        } => {
            let options = if no_increment {
                CheckOptions::peek()
            } else {
                CheckOptions::default()
            };
            let decision = limiter.check(&command, options)?;
            console.decision(&decision);
        }
        LimitCommands::Enforce { command } => {
            let context = EventContext::current_user(&command).with_source("cli");
            match limiter.enforce(&command, &context) {
                Ok(decision) => console.decision(&decision),
                Err(RateLimitError::Exceeded(decision)) => {
                    console.decision(&decision);
                    return Ok(ExitCode::from(EXIT_RATE_LIMITED));
                }
                Err(e) => return Err(e.into()),
            }
        }
        LimitCommands::Reset { command, force } => match limiter.reset(command.as_deref(), force) {
            Ok(true) => console.success(&format!(
                "Rate limits reset for {}",
                command.as_deref().unwrap_or("all commands")
            )),
            Ok(false) => {
                console.warn("Rate limits were cleared in memory but could not be saved");
                return Ok(ExitCode::FAILURE);
            }
            Err(RateLimitError::ForceRequired) => {
                console.error("Refusing to reset rate limits without --force");
                return Ok(ExitCode::FAILURE);
            }
            Err(e) => return Err(e.into()),
        },
    }

    Ok(ExitCode::SUCCESS)
}

fn run_audit(
    core: &SecurityCore,
    console: &Console,
    command: AuditCommands,
    verbose: bool,
) -> Result<ExitCode> {
    let audit = core.audit();

    match command {
        AuditCommands::Verify { hours, json } => {
            let report = audit.verify_integrity(VerifyOptions { hours, verbose });
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                console.integrity_report(&report);
            }
            if !report.valid {
                return Ok(ExitCode::FAILURE);
            }
        }
        AuditCommands::Log {
            event_type,
            details,
            severity,
        } => {
            let severity: AuditSeverity = severity.parse().map_err(|e: String| anyhow!(e))?;
            let details = match details {
                Some(raw) => safe_json_parse(&raw, DEFAULT_MAX_DEPTH, false)
                    .context("--details must be valid JSON without reserved keys")?,
                None => serde_json::Value::Null,
            };

            if !audit.settings().enabled {
                console.warn("Audit logging is disabled in config; nothing written");
                return Ok(ExitCode::FAILURE);
            }

            if audit.log_event(&event_type, severity, details) {
                console.success(&format!("Logged {}", event_type));
            } else {
                console.error("Failed to write audit entry");
                return Ok(ExitCode::FAILURE);
            }
        }
        AuditCommands::Tail { count } => {
            console.entries(&audit.read_recent(count));
        }
        AuditCommands::RotateKey => {
            let rotation = audit.rotate_signing_key()?;
            console.key_rotation(&rotation);
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "opsguard=debug" } else { "opsguard=info" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
