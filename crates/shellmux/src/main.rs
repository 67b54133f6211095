//! shellmux
//!
//! Opens an SSH or local shell session on the multiplexer and drives it from
//! the terminal: stdin lines are sent to the shell and the emulator's changed
//! rows are printed back.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use shellmux::config::{default_config_path, Config, LoggingConfig};
use shellmux::session::{SessionId, SessionManager, TerminalSession};
use shellmux::transport::{Credentials, SshTarget};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// shellmux - multiplexed SSH and local shell sessions.
#[derive(Parser, Debug)]
#[command(name = "shellmux")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Open a shell on a remote host over SSH
    Ssh {
        /// Host name or address
        host: String,

        /// Port (defaults to the configured SSH port)
        #[arg(long, short)]
        port: Option<u16>,

        /// User name (defaults to the configured user, then $USER)
        #[arg(long, short)]
        user: Option<String>,

        /// Read the password from this environment variable
        #[arg(long, value_name = "VAR", conflicts_with = "identity")]
        password_env: Option<String>,

        /// Authenticate with this private key file
        #[arg(long, short, value_name = "FILE")]
        identity: Option<PathBuf>,

        /// Read the key passphrase from this environment variable
        #[arg(long, value_name = "VAR", requires = "identity")]
        passphrase_env: Option<String>,
    },

    /// Open a local shell on a pseudo-terminal
    Local {
        /// Shell to run (defaults to the configured shell)
        #[arg(long, short)]
        shell: Option<String>,
    },

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone();
    let mut config = match &config_path {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();

    let _log_guard = init_logging(&config.logging, cli.verbose)?;
    if let Some(path) = &config_path {
        tracing::info!("Using config file: {:?}", path);
    }

    config.validate()?;

    match cli.command {
        Commands::Ssh {
            host,
            port,
            user,
            password_env,
            identity,
            passphrase_env,
        } => {
            let credentials = credentials(password_env, identity, passphrase_env)?;
            let username = config.ssh.resolve_username(user.as_deref());
            let target = SshTarget::new(host, username, credentials)
                .with_port(port.unwrap_or(config.ssh.port));

            let (cols, rows) = (config.terminal.cols, config.terminal.rows);
            let manager = Arc::new(SessionManager::new(config));
            let id = manager.create_ssh(cols, rows, target)?;
            run_interactive(manager, id).await?;
        }
        Commands::Local { shell } => {
            let (cols, rows) = (config.terminal.cols, config.terminal.rows);
            let manager = Arc::new(SessionManager::new(config));
            let id = manager.create_local(cols, rows, shell)?;
            run_interactive(manager, id).await?;
        }
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
        }
        Commands::Config(ConfigCommands::Init { force }) => {
            let path = config_path.unwrap_or_else(default_config_path);
            if path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default().save(&path)?;
            println!("Wrote default configuration to {}", path.display());
        }
    }

    Ok(())
}

/// Set up tracing to stderr, plus a log file when one is configured.
///
/// The returned guard must be held until exit so buffered file output is
/// flushed.
fn init_logging(config: &LoggingConfig, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose { "debug" } else { config.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let stderr = fmt::layer().with_writer(std::io::stderr);

    let Some(path) = &config.file else {
        tracing_subscriber::registry().with(filter).with(stderr).init();
        return Ok(None);
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let name = path
        .file_name()
        .with_context(|| format!("Log file path has no file name: {}", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();

    Ok(Some(guard))
}

/// Build SSH credentials from the command line flags.
fn credentials(
    password_env: Option<String>,
    identity: Option<PathBuf>,
    passphrase_env: Option<String>,
) -> anyhow::Result<Credentials> {
    if let Some(var) = password_env {
        let password = std::env::var(&var)
            .with_context(|| format!("Password variable {} is not set", var))?;
        return Ok(Credentials::Password(password));
    }

    if let Some(path) = identity {
        let passphrase = match passphrase_env {
            Some(var) => Some(
                std::env::var(&var)
                    .with_context(|| format!("Passphrase variable {} is not set", var))?,
            ),
            None => None,
        };
        return Ok(Credentials::PrivateKeyFile { path, passphrase });
    }

    Ok(Credentials::None)
}

/// Drive one session from the terminal until it ends, stdin closes or
/// Ctrl-C is pressed.
async fn run_interactive(manager: Arc<SessionManager>, id: SessionId) -> anyhow::Result<()> {
    let session = manager
        .get(&id)
        .with_context(|| format!("Session {} vanished", id))?;

    let cleanup = match manager.config().session.cleanup_interval_secs {
        0 => None,
        secs => Some(manager.start_cleanup_task(std::time::Duration::from_secs(secs))),
    };

    let result = drive(&manager, &session).await;

    if let Some(task) = cleanup {
        task.abort();
    }
    manager.shutdown().await;
    result
}

async fn drive(manager: &SessionManager, session: &Arc<TerminalSession>) -> anyhow::Result<()> {
    let mut output = session.subscribe();
    let mut state = session.subscribe_state();

    session
        .wait_connected()
        .await
        .with_context(|| format!("Failed to connect to {}", session.target()))?;
    tracing::info!(session_id = %session.id(), target = %session.target(), "Connected");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = stdin.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    tracing::debug!("stdin closed");
                    break;
                };
                let mut data = line.into_bytes();
                data.push(b'\n');
                manager.send(session.id(), &data).await?;
            }
            chunk = output.recv() => match chunk {
                Ok(_) | Err(RecvError::Lagged(_)) => print_dirty_rows(session),
                Err(RecvError::Closed) => break,
            },
            changed = state.changed() => {
                if changed.is_err() || state.borrow().is_terminal() {
                    tracing::info!(session_id = %session.id(), "Session ended");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl-C");
                break;
            }
        }
    }

    print_dirty_rows(session);
    Ok(())
}

fn print_dirty_rows(session: &TerminalSession) {
    let dirty = session.take_dirty();
    if dirty.is_empty() {
        return;
    }

    let contents = session.contents();
    let lines: Vec<&str> = contents.lines().collect();
    for row in dirty {
        let text = lines.get(usize::from(row)).copied().unwrap_or("");
        println!("{:>3} | {}", row, text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        // Verify the CLI structure is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_ssh_command() {
        let cli = Cli::try_parse_from(["shellmux", "ssh", "example.com"]).unwrap();
        match cli.command {
            Commands::Ssh {
                host,
                port,
                user,
                password_env,
                identity,
                passphrase_env,
            } => {
                assert_eq!(host, "example.com");
                assert!(port.is_none());
                assert!(user.is_none());
                assert!(password_env.is_none());
                assert!(identity.is_none());
                assert!(passphrase_env.is_none());
            }
            _ => panic!("Expected Ssh command"),
        }
    }

    #[test]
    fn test_ssh_with_options() {
        let cli = Cli::try_parse_from([
            "shellmux",
            "ssh",
            "example.com",
            "--port",
            "2222",
            "--user",
            "alice",
            "--identity",
            "/tmp/id_ed25519",
        ])
        .unwrap();
        match cli.command {
            Commands::Ssh {
                port,
                user,
                identity,
                ..
            } => {
                assert_eq!(port, Some(2222));
                assert_eq!(user.as_deref(), Some("alice"));
                assert_eq!(identity, Some(PathBuf::from("/tmp/id_ed25519")));
            }
            _ => panic!("Expected Ssh command"),
        }
    }

    #[test]
    fn test_ssh_password_and_identity_conflict() {
        let result = Cli::try_parse_from([
            "shellmux",
            "ssh",
            "example.com",
            "--password-env",
            "PW",
            "--identity",
            "/tmp/key",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_ssh_passphrase_requires_identity() {
        let result =
            Cli::try_parse_from(["shellmux", "ssh", "example.com", "--passphrase-env", "PP"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_ssh_requires_host() {
        assert!(Cli::try_parse_from(["shellmux", "ssh"]).is_err());
    }

    #[test]
    fn test_local_command() {
        let cli = Cli::try_parse_from(["shellmux", "local"]).unwrap();
        assert!(matches!(cli.command, Commands::Local { shell: None }));
    }

    #[test]
    fn test_local_with_shell() {
        let cli = Cli::try_parse_from(["shellmux", "local", "--shell", "/bin/bash"]).unwrap();
        match cli.command {
            Commands::Local { shell } => assert_eq!(shell.as_deref(), Some("/bin/bash")),
            _ => panic!("Expected Local command"),
        }
    }

    #[test]
    fn test_config_show() {
        let cli = Cli::try_parse_from(["shellmux", "config", "show"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(ConfigCommands::Show)));
    }

    #[test]
    fn test_config_init_force() {
        let cli = Cli::try_parse_from(["shellmux", "config", "init", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config(ConfigCommands::Init { force: true })
        ));
    }

    #[test]
    fn test_config_without_subcommand_fails() {
        assert!(Cli::try_parse_from(["shellmux", "config"]).is_err());
    }

    #[test]
    fn test_global_flags_after_command() {
        let cli =
            Cli::try_parse_from(["shellmux", "local", "--verbose", "--config", "/tmp/c.toml"])
                .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
    }

    #[test]
    fn test_missing_subcommand_fails() {
        assert!(Cli::try_parse_from(["shellmux"]).is_err());
    }

    #[test]
    fn test_credentials_default_to_none() {
        assert!(matches!(
            credentials(None, None, None).unwrap(),
            Credentials::None
        ));
    }

    #[test]
    fn test_credentials_from_identity() {
        let creds = credentials(None, Some(PathBuf::from("/tmp/key")), None).unwrap();
        match creds {
            Credentials::PrivateKeyFile { path, passphrase } => {
                assert_eq!(path, PathBuf::from("/tmp/key"));
                assert!(passphrase.is_none());
            }
            _ => panic!("Expected key credentials"),
        }
    }

    #[test]
    fn test_credentials_missing_password_var() {
        let result = credentials(Some("SHELLMUX_TEST_UNSET_PASSWORD_VAR".into()), None, None);
        assert!(result.is_err());
    }
}
