extern crate fastcgi_host;
use fastcgi_host::*;

#[macro_use] extern crate log;

use clap::{Args, Parser, Subcommand};
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use tokio::signal::unix::{signal, SignalKind};

use std::io;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Parser)]
#[command(name = "fastcgi-host", version, about = "FastCGI application host")]
struct Cli {
    /// TOML file of host settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve FastCGI requests on the listen socket.
    Serve {
        #[command(flatten)]
        options: HostOptions,
    },
    /// Run one worker per application config and hand connections to them.
    Manage {
        #[command(flatten)]
        options: HostOptions,
        /// Directory of per-application *.toml files.
        #[arg(long)]
        apps_dir: Option<String>,
        /// Command that starts a worker; `--app-config <file>` is appended.
        #[arg(long)]
        launcher: Option<String>,
        /// Run workers as this user instead of each config file's owner.
        #[arg(long)]
        user: Option<String>,
    },
    /// Serve connections passed in by `manage`.
    Worker {
        #[command(flatten)]
        options: HostOptions,
        #[arg(long)]
        app_config: Option<PathBuf>,
        /// Descriptor of the channel connections arrive on.
        #[arg(long, default_value_t = 0)]
        channel_fd: RawFd,
    },
}

#[derive(Args)]
struct HostOptions {
    /// Listen address: tcp:HOST:PORT, unix:PATH, abstract:NAME, or fd:N.
    #[arg(long)]
    socket: Option<String>,
    /// Octal permissions for a Unix socket path.
    #[arg(long)]
    socket_mode: Option<String>,
    #[arg(long)]
    max_connections: Option<String>,
    #[arg(long)]
    max_requests: Option<String>,
    /// Allow several requests at once per connection (true/false).
    #[arg(long)]
    multiplex: Option<String>,
    #[arg(long)]
    backlog: Option<String>,
}

impl HostOptions {
    fn apply(&self, settings: &mut HostSettings) -> Result<()> {
        let options = [
            ("socket", &self.socket),
            ("socket_mode", &self.socket_mode),
            ("max_connections", &self.max_connections),
            ("max_requests", &self.max_requests),
            ("multiplex", &self.multiplex),
            ("backlog", &self.backlog),
        ];
        for (name, value) in options {
            if let Some(value) = value {
                settings.apply(name, value, SettingSource::CommandLine)?;
            }
        }
        Ok(())
    }
}

fn load_settings(config: Option<&Path>, options: &HostOptions) -> Result<HostSettings> {
    let mut settings = HostSettings::default();
    if let Ok(exe) = std::env::current_exe() {
        settings.launcher.set(format!("{} worker", exe.display()), SettingSource::Default);
    }
    if let Some(path) = config {
        settings.apply_file(path)?;
    }
    settings.apply_environment(std::env::vars())?;
    options.apply(&mut settings)?;
    Ok(settings)
}

struct HelloResponder {
    app: String,
    request_count: AtomicUsize,
}

impl HelloResponder {
    pub fn new(app: String) -> HelloResponder {
        HelloResponder {
            app,
            request_count: AtomicUsize::new(1),
        }
    }
}

impl FastcgiResponder for HelloResponder {
    fn respond(&self, request: FastcgiRequest) -> BoxFuture<'static, io::Result<FastcgiResponse>> {
        let count = self.request_count.fetch_add(1, Ordering::SeqCst);
        let mut response = FastcgiResponse::new();
        response.set_header("Content-Type", "text/plain");
        response.body = format!("Hello from {:?} ({}): {}\n",
                                request.param("REQUEST_URI").unwrap_or(""), self.app, count)
            .into_bytes();
        future::ready(Ok(response)).boxed()
    }
}

async fn shutdown_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            error!("cannot listen for SIGTERM: {}", e);
            return future::pending().await;
        },
    };
    tokio::select! {
        _ = terminate.recv() => info!("got SIGTERM"),
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("got interrupt"),
            Err(e) => error!("cannot listen for interrupt: {}", e),
        },
    }
}

async fn serve(settings: HostSettings) -> Result<()> {
    let server = FastcgiServer::new(settings.listen_address(), settings.server_config()?,
                                    HelloResponder::new("fastcgi-host".to_owned()));
    if !server.start(true, *settings.backlog.get()).await? {
        return Err(io::Error::from(io::ErrorKind::PermissionDenied).into());
    }
    tokio::select! {
        _ = shutdown_signal() => (),
        _ = server.closed() => warn!("listener closed"),
    }
    server.stop().await;
    Ok(())
}

async fn manage(settings: HostSettings) -> Result<()> {
    let apps = AppConfig::load_dir(settings.apps_dir.get(), &settings)?;
    let manager = ProcessManager::new(settings.listen_address());
    if manager.start_children(&apps) == 0 {
        warn!("no workers running; connections will be dropped");
    }
    if let Err(e) = manager.start(*settings.backlog.get()).await {
        manager.kill_children().await;
        return Err(e);
    }
    shutdown_signal().await;
    manager.stop().await;
    Ok(())
}

async fn worker(settings: HostSettings, app_config: Option<PathBuf>, channel_fd: RawFd)
    -> Result<()>
{
    let app = app_config
        .as_deref()
        .and_then(Path::file_stem)
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "worker".to_owned());
    info!("worker for {} starting", app);

    let server = OnDemandServer::new(channel_fd, settings.server_config()?,
                                     HelloResponder::new(app));
    server.start().await?;
    tokio::select! {
        _ = shutdown_signal() => (),
        _ = server.closed() => info!("front end closed the channel"),
    }
    server.stop().await;
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.config.as_deref();
    match cli.command {
        Command::Serve { options } => serve(load_settings(config, &options)?).await,
        Command::Manage { options, apps_dir, launcher, user } => {
            let mut settings = load_settings(config, &options)?;
            for (name, value) in [("apps_dir", apps_dir), ("launcher", launcher), ("user", user)] {
                if let Some(value) = value {
                    settings.apply(name, &value, SettingSource::CommandLine)?;
                }
            }
            manage(settings).await
        },
        Command::Worker { options, app_config, channel_fd } => {
            worker(load_settings(config, &options)?, app_config, channel_fd).await
        },
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        },
    }
}
