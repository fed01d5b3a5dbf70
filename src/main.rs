//! desktop-host: local service supervisor for the desktop shell.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, opens the settings store and wires the web server supervisor and
//! the update checker to the notification bus.

mod bus;
mod config;
mod events;
mod output;
mod process;
mod runner;
mod signal;
mod store;
mod update;
mod web;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::bus::NotificationBus;
use crate::events::{Notification, Topic};
use crate::output::MarkerClassifier;
use crate::process::ProcessSpec;
use crate::runner::{StartOutcome, Supervisor, SupervisorOptions};
use crate::store::{ConfigStore, FileStorage, MemoryStorage};
use crate::update::{GithubReleaseBackend, UpdateBackend, UpdateChecker, UpdateState};
use crate::web::WebService;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "desktop-host",
    version,
    about = "Runs the bundled web server and keeps its settings",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Directory holding config.json.
    #[arg(long, global = true, env = "DESKTOP_HOST_CONFIG_DIR")]
    config_dir: Option<PathBuf>,
    /// Keep settings in memory only.
    #[arg(long, global = true)]
    ephemeral: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the web server and stream its events until interrupted.
    Serve(ServeArgs),
    /// Stop a web server left running by another invocation.
    Stop,
    /// Inspect or edit the stored settings.
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
    /// Ask the release feed whether a newer version exists.
    CheckUpdate(UpdateArgs),
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// Command line of the web server.
    #[arg(long, default_value = web::DEFAULT_COMMAND)]
    server_cmd: String,
    /// Working directory of the web server.
    #[arg(long)]
    cwd: Option<PathBuf>,
    /// Output line that means the server is ready.
    #[arg(long, default_value = web::READY_MARKER)]
    ready_marker: String,
    /// Output that means the server cannot run; replaces the built-in patterns.
    #[arg(long = "critical-pattern")]
    critical_patterns: Vec<String>,
    /// Give up if the server is not ready after this many seconds.
    #[arg(long)]
    startup_timeout: Option<u64>,
    /// Time to wait after the termination request before force-killing (ms).
    #[arg(long, default_value_t = 5000)]
    stop_timeout: u64,
    #[command(flatten)]
    update: UpdateArgs,
}

#[derive(Debug, Args)]
struct UpdateArgs {
    /// GitHub repository publishing the releases.
    #[arg(long, default_value = update::DEFAULT_REPOSITORY)]
    repository: String,
    /// Download the installer when an update is found.
    #[arg(long)]
    download: bool,
    /// Launch the installer once it is downloaded.
    #[arg(long, requires = "download")]
    install: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the whole settings document.
    Show,
    /// Print where the settings are stored.
    Path,
    /// Deep-merge a JSON object into the `config` document.
    Set { json: String },
    /// Merge server settings and validate them.
    Server { json: String },
    /// Reset the server section to its defaults.
    Defaults,
}

/// Everything the shell keeps alive while it runs.
struct AppRuntime {
    store: Arc<ConfigStore>,
    bus: NotificationBus,
    web_server: Supervisor<WebService>,
    updater: UpdateChecker,
    shutdown: watch::Sender<bool>,
}

impl AppRuntime {
    fn new(
        store: Arc<ConfigStore>,
        service: WebService,
        options: SupervisorOptions,
        backend: impl UpdateBackend,
    ) -> Self {
        let bus = NotificationBus::new();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let web_server = Supervisor::new(service, store.clone(), bus.clone(), options)
            .with_shutdown(shutdown_rx);
        let updater = UpdateChecker::new(backend, bus.clone());
        Self {
            store,
            bus,
            web_server,
            updater,
            shutdown,
        }
    }

    fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.web_server.stop().await {
            warn!(error = %err, "failed to stop web server during shutdown");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match &cli.command {
        Commands::Serve(args) => serve(&cli, args).await,
        Commands::Stop => stop(&cli).await,
        Commands::Config { action } => run_config(&cli, action),
        Commands::CheckUpdate(args) => check_update(args).await,
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("desktop_host=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_store(cli: &Cli) -> Result<Arc<ConfigStore>> {
    if cli.ephemeral {
        return Ok(Arc::new(ConfigStore::open(MemoryStorage::default())));
    }
    let dir = match &cli.config_dir {
        Some(dir) => dir.clone(),
        None => FileStorage::default_dir()
            .ok_or_else(|| anyhow!("cannot locate a config directory; pass --config-dir"))?,
    };
    Ok(Arc::new(ConfigStore::open(FileStorage::in_dir(&dir))))
}

fn web_service(args: &ServeArgs) -> Result<WebService> {
    let mut spec = ProcessSpec::parse(&args.server_cmd)
        .with_context(|| format!("failed to parse server command {:?}", args.server_cmd))?;
    if spec.cmd.is_empty() {
        bail!("empty server command");
    }
    spec.cwd = args.cwd.clone();
    let mut classifier = MarkerClassifier::new(args.ready_marker.clone());
    if !args.critical_patterns.is_empty() {
        classifier = classifier.with_critical_patterns(args.critical_patterns.iter().cloned());
    }
    Ok(WebService::new(spec).with_classifier(classifier))
}

async fn serve(cli: &Cli, args: &ServeArgs) -> Result<()> {
    let store = open_store(cli)?;
    let settings = store.apply_defaults_on_first_run();
    let options = SupervisorOptions {
        startup_timeout: args.startup_timeout.map(Duration::from_secs),
        stop_timeout: Duration::from_millis(args.stop_timeout),
        ..SupervisorOptions::default()
    };
    let runtime = AppRuntime::new(
        store,
        web_service(args)?,
        options,
        GithubReleaseBackend::new(&args.update.repository, args.update.download),
    );

    // A pid left over from a crashed run would hold the port.
    if let Err(err) = runtime.web_server.kill(false).await {
        warn!(error = %err, "failed to clean up previous web server");
    }

    let printer = runtime.bus.subscribe_many(&Topic::ALL, print_notification);
    let announcer = runtime.bus.subscribe(Topic::ServiceStarted, {
        let store = runtime.store.clone();
        move |event| {
            if let Notification::ServiceStarted { pid, .. } = event {
                info!(pid, url = %web::local_url(&store.server()), "web server is up");
            }
        }
    });
    let (stopped, mut stopped_rx) = runtime.bus.subscribe_channel(&[Topic::ServiceStopped]);
    spawn_signal_listener(runtime.shutdown.clone());
    let (reload_tx, mut reload_rx) = mpsc::unbounded_channel();
    spawn_reload_listener(reload_tx);

    if settings.general.auto_update {
        let period = Duration::from_secs(settings.general.update_check_period.max(1) * 60);
        runtime
            .updater
            .spawn_periodic(period, runtime.shutdown_signal());
    }

    let result = match runtime.web_server.start().await {
        Ok(StartOutcome::Started { .. }) => {
            let mut shutdown = runtime.shutdown_signal();
            loop {
                tokio::select! {
                    _ = shutdown.wait_for(|stop| *stop) => break Ok(()),
                    Some(()) = reload_rx.recv() => {
                        info!("reloading settings, restarting web server");
                        match runtime.web_server.restart().await {
                            Ok(StartOutcome::Started { .. }) => {
                                // The stop that belongs to the restart.
                                while stopped_rx.try_recv().is_ok() {}
                            }
                            Ok(StartOutcome::Cancelled) => break Ok(()),
                            Err(err) => break Err(err).context("web server failed to restart"),
                        }
                    }
                    Some(event) = stopped_rx.recv() => {
                        if let Notification::ServiceStopped { error: Some(error), .. } = event {
                            warn!(%error, "web server stopped");
                        } else {
                            info!("web server exited");
                        }
                        break Ok(());
                    }
                }
            }
        }
        Ok(StartOutcome::Cancelled) => Ok(()),
        Err(err) => {
            let handle = runtime.web_server.handle();
            for line in runtime.web_server.recent_output() {
                eprintln!("{}", line.text);
            }
            Err(err).with_context(|| {
                format!("{} failed to start (state {})", handle.logical_name, handle.state)
            })
        }
    };

    runtime.shutdown().await;
    stopped.unsubscribe();
    announcer.unsubscribe();
    printer.unsubscribe();
    result
}

async fn stop(cli: &Cli) -> Result<()> {
    let store = open_store(cli)?;
    let Some(pid) = store.pid(web::WEB_SERVER) else {
        println!("web server is not running");
        return Ok(());
    };
    let service = WebService::new(ProcessSpec::parse(web::DEFAULT_COMMAND)?);
    let supervisor = Supervisor::new(
        service,
        store,
        NotificationBus::new(),
        SupervisorOptions::default(),
    );
    supervisor
        .kill(true)
        .await
        .with_context(|| format!("failed to stop web server (pid {})", pid))?;
    println!("stopped web server (pid {})", pid);
    Ok(())
}

fn run_config(cli: &Cli, action: &ConfigCommand) -> Result<()> {
    let store = open_store(cli)?;
    match action {
        ConfigCommand::Show => {
            let document = store.config_document();
            println!("{}", serde_json::to_string_pretty(&document)?);
        }
        ConfigCommand::Path => match store.location() {
            Some(path) => println!("{}", path.display()),
            None => println!("(in memory)"),
        },
        ConfigCommand::Set { json } => {
            store.update_config(parse_object(json)?);
        }
        ConfigCommand::Server { json } => {
            store
                .save_server_config(parse_object(json)?)
                .context("server settings were not saved")?;
        }
        ConfigCommand::Defaults => store.set_default_server_config(),
    }
    Ok(())
}

fn parse_object(raw: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(raw).context("argument is not valid JSON")?;
    if !value.is_object() {
        bail!("expected a JSON object, got {}", value);
    }
    Ok(value)
}

async fn check_update(args: &UpdateArgs) -> Result<()> {
    let bus = NotificationBus::new();
    let (subscription, mut rx) = bus.subscribe_channel(&Topic::ALL);
    let checker = UpdateChecker::new(
        GithubReleaseBackend::new(&args.repository, args.download),
        bus,
    );
    checker.check_update();
    let mut interrupted = false;
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                info!("cancelling update download");
                interrupted = true;
                checker.cancel_download();
                continue;
            }
        };
        let Some(event) = event else { break };
        print_notification(&event);
        let done = match event {
            Notification::UpdateAvailable(_) => !args.download,
            Notification::UpdateProgress(_) => false,
            _ => true,
        };
        if done {
            break;
        }
    }
    subscription.unsubscribe();
    match checker.state() {
        UpdateState::Error(message) => bail!("update check failed: {}", message),
        UpdateState::Downloaded(info) if args.install => {
            info!(version = %info.version, "installing update");
            checker.install_update().context("failed to install update")?;
        }
        _ => {}
    }
    Ok(())
}

fn print_notification(notification: &Notification) {
    let line = json!({
        "event": notification.wire_name(),
        "payload": notification.payload(),
    });
    println!("{}", line);
}

fn spawn_signal_listener(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("received Ctrl-C, shutting down");
        }
        let _ = shutdown.send(true);
    });
}

// SIGHUP restarts the web server with freshly read settings.
fn spawn_reload_listener(tx: mpsc::UnboundedSender<()>) {
    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let Ok(mut hangup) = signal(SignalKind::hangup()) else {
            return;
        };
        while hangup.recv().await.is_some() {
            if tx.send(()).is_err() {
                break;
            }
        }
    });
    #[cfg(not(unix))]
    drop(tx);
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{HealthClassifier, LineClass, StreamKind};
    use crate::runner::Service;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_arguments_build_the_service() {
        let cli = Cli::parse_from([
            "desktop-host",
            "--ephemeral",
            "serve",
            "--server-cmd",
            "node apps/web/server.js",
            "--cwd",
            "/opt/app",
            "--startup-timeout",
            "30",
            "--critical-pattern",
            "FATAL",
        ]);
        let Commands::Serve(args) = &cli.command else {
            panic!("expected serve");
        };
        assert!(cli.ephemeral);
        assert_eq!(args.startup_timeout, Some(30));
        assert_eq!(args.stop_timeout, 5000);
        assert_eq!(args.ready_marker, web::READY_MARKER);

        let service = web_service(args).unwrap();
        let spec = service.command(&Default::default());
        assert_eq!(spec.cmd, "node");
        assert_eq!(spec.args, vec!["apps/web/server.js"]);
        assert_eq!(spec.cwd, Some(PathBuf::from("/opt/app")));
        assert_eq!(args.critical_patterns, vec!["FATAL"]);
        let classifier = service.classifier();
        assert_eq!(
            classifier.classify(StreamKind::Stdout, "FATAL: no build"),
            LineClass::Critical("FATAL".to_string())
        );
        assert_eq!(
            classifier.classify(StreamKind::Stdout, "EADDRINUSE"),
            LineClass::Info
        );
    }

    #[test]
    fn config_arguments_must_be_objects() {
        assert!(parse_object(r#"{"general":{"lang":"fr"}}"#).is_ok());
        assert!(parse_object("[1, 2]").is_err());
        assert!(parse_object("not json").is_err());
    }

    #[test]
    fn ephemeral_store_starts_with_defaults() {
        let cli = Cli::parse_from(["desktop-host", "--ephemeral", "config", "show"]);
        let store = open_store(&cli).unwrap();
        assert!(store.location().is_none());
        let config = store.apply_defaults_on_first_run();
        assert_eq!(config.server.port, config::DEFAULT_PORT);
    }
}
