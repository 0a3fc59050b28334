#![cfg_attr(test, allow(clippy::unwrap_used))]

mod accesslog;
mod cgi;
mod config;
mod coordinator;
mod delivery;
mod error;
mod fetcher;
mod handler;
mod http_range;
mod humanfmt;
mod lock;
mod log_once;
mod resource;
mod store;

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use clap::Parser;
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::Response;
use hyper::header::HeaderValue;
use hyper::header::SERVER;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{LevelFilter, debug, error, info, trace, warn};
use simplelog::CombinedLogger;
use simplelog::ConfigBuilder;
use simplelog::WriteLogger;
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use tokio::net::TcpListener;
use tokio::runtime::Builder;
use tokio::signal::unix::SignalKind;

use crate::accesslog::AccessLog;
use crate::config::Config;
use crate::config::Reloadable;
use crate::error::PkgCacherError;
use crate::humanfmt::HumanFmt;
use crate::resource::Classifier;

const APP_NAME: &str = env!("CARGO_PKG_NAME");
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

const ERROR_LOG_FILE: &str = "error.log";
const BIND_RETRY_DELAY: Duration = Duration::from_secs(1);

pub(crate) type HttpResponse = Response<BoxBody<bytes::Bytes, PkgCacherError>>;

#[must_use]
pub(crate) fn empty() -> BoxBody<bytes::Bytes, PkgCacherError> {
    Empty::<bytes::Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

#[must_use]
pub(crate) fn full<T: Into<bytes::Bytes>>(chunk: T) -> BoxBody<bytes::Bytes, PkgCacherError> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

#[must_use]
pub(crate) fn quick_response<T: Into<bytes::Bytes>>(
    status: hyper::StatusCode,
    message: T,
) -> HttpResponse {
    Response::builder()
        .status(status)
        .header(SERVER, HeaderValue::from_static(APP_NAME))
        .header(
            hyper::header::CONNECTION,
            HeaderValue::from_static("close"),
        )
        .body(full(message))
        .expect("Response is valid")
}

#[derive(Debug)]
struct RuntimeDetails {
    config: Config,
    reloadable: std::sync::RwLock<Arc<Reloadable>>,
    https_client: std::sync::RwLock<fetcher::Client>,
    access_log: AccessLog,
    classifier: Classifier,
    base_log_level: LevelFilter,
    debug_forced: AtomicBool,
}

static RUNTIMEDETAILS: OnceLock<RuntimeDetails> = OnceLock::new();

#[must_use]
fn runtime_details() -> &'static RuntimeDetails {
    RUNTIMEDETAILS
        .get()
        .expect("Global was initialized in main()")
}

#[must_use]
pub(crate) fn global_config() -> &'static Config {
    &runtime_details().config
}

#[must_use]
pub(crate) fn global_config_opt() -> Option<&'static Config> {
    RUNTIMEDETAILS.get().map(|rd| &rd.config)
}

#[must_use]
pub(crate) fn reloadable_config() -> Arc<Reloadable> {
    runtime_details()
        .reloadable
        .read()
        .expect("Other users should not panic")
        .clone()
}

#[must_use]
pub(crate) fn current_client() -> fetcher::Client {
    runtime_details()
        .https_client
        .read()
        .expect("Other users should not panic")
        .clone()
}

#[must_use]
pub(crate) fn access_log() -> &'static AccessLog {
    &runtime_details().access_log
}

#[must_use]
pub(crate) fn classifier() -> &'static Classifier {
    &runtime_details().classifier
}

fn reload_configuration(config_path: &std::path::Path) {
    let rd = runtime_details();

    let new_config = match Config::new(config_path) {
        Ok((c, _fallback)) => c,
        Err(err) => {
            error!("Reload failed, keeping previous configuration:  {err}");
            return;
        }
    };

    /* Only the enumerated reloadable fields are swapped; structural
     * fields keep their startup values. */
    let reloadable = Arc::new(new_config.reloadable());

    match fetcher::build_client(&reloadable) {
        Ok(client) => {
            *rd.https_client.write().expect("Other users should not panic") = client;
        }
        Err(err) => {
            error!("Reload kept the previous upstream client:  {err}");
        }
    }

    *rd.reloadable.write().expect("Other users should not panic") = reloadable;

    info!("Configuration reloaded from `{}`", config_path.display());
}

fn toggle_debug() {
    let rd = runtime_details();

    let was_forced = rd.debug_forced.fetch_xor(true, Ordering::Relaxed);
    let level = if was_forced {
        rd.base_log_level
    } else {
        rd.base_log_level.max(LevelFilter::Debug)
    };

    log::set_max_level(level);
    info!("Log level now {level}");
}

#[must_use]
fn is_iokind(err: &hyper::Error, kind: std::io::ErrorKind) -> bool {
    std::error::Error::source(&err)
        .and_then(|src| src.downcast_ref::<std::io::Error>())
        .is_some_and(|ioerr| ioerr.kind() == kind)
}

async fn handle_connection<S>(stream: S, client: SocketAddr)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let client_start = Instant::now();

    let service = service_fn(move |req| {
        let state = handler::State {
            https_client: current_client(),
            reloadable: reloadable_config(),
        };
        async move { Ok::<_, PkgCacherError>(handler::handle_request(client, req, state).await) }
    });

    if let Err(err) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        if err.is_incomplete_message() || is_iokind(&err, std::io::ErrorKind::ConnectionReset) {
            info!(
                "Connection to client {} cancelled",
                client.ip().to_canonical()
            );
        } else if is_iokind(&err, std::io::ErrorKind::BrokenPipe) {
            info!("Broken pipe for client {}:  {err}", client.ip().to_canonical());
        } else {
            error!(
                "Error serving connection for client {}:  {err}",
                client.ip().to_canonical()
            );
        }
    }

    debug!(
        "Closed connection to {} after {}",
        client.ip().to_canonical(),
        HumanFmt::Time(client_start.elapsed())
    );
}

async fn bind_listener(addr: SocketAddr, attempts: u32) -> std::io::Result<TcpListener> {
    let mut tries = 0;

    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                tries += 1;
                if tries > attempts {
                    return Err(err);
                }
                warn!("Bind on {addr} failed (attempt {tries}/{attempts}):  {err}");
                tokio::time::sleep(BIND_RETRY_DELAY).await;
            }
        }
    }
}

async fn accept_loop(listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, client)) => {
                trace!("New client connection from {}", client.ip().to_canonical());
                tokio::task::spawn(handle_connection(stream, client));
            }
            Err(err) => {
                error!("Error accepting connection:  {err}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn main_loop(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = global_config();
    let port = config.daemon_port.get();

    let mut listeners = Vec::new();

    if config.daemon_addr.is_empty() {
        let addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
        match bind_listener(addr, config.retry).await {
            Ok(listener) => {
                info!("Listening on http://{addr}");
                listeners.push(listener);
            }
            Err(err) => {
                warn!("Error binding on {addr}, falling back to IPv4:  {err}");

                /* hosts without IPv6 get the v4 wildcard */
                let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
                let listener = bind_listener(addr, config.retry).await.map_err(|err| {
                    error!("Error binding fallback on {addr}:  {err}");
                    err
                })?;
                info!("Listening on http://{addr}");
                listeners.push(listener);
            }
        }
    } else {
        for ip in &config.daemon_addr {
            let addr = SocketAddr::from((*ip, port));
            let listener = bind_listener(addr, config.retry).await.map_err(|err| {
                error!("Error binding on {addr}:  {err}");
                err
            })?;
            info!("Listening on http://{addr}");
            listeners.push(listener);
        }
    }

    let accept_tasks: Vec<_> = listeners
        .into_iter()
        .map(|listener| tokio::task::spawn(accept_loop(listener)))
        .collect();

    let mut term_signal = tokio::signal::unix::signal(SignalKind::terminate())?;
    let mut hangup_signal = tokio::signal::unix::signal(SignalKind::hangup())?;
    let mut usr2_signal = tokio::signal::unix::signal(SignalKind::user_defined2())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, stopping...");
                break;
            },
            _ = term_signal.recv() => {
                info!("SIGTERM received, stopping...");
                break;
            },
            _ = hangup_signal.recv() => {
                info!("SIGHUP received, reloading configuration...");
                reload_configuration(&config_path);
            },
            _ = usr2_signal.recv() => {
                toggle_debug();
            },
        }
    }

    for task in accept_tasks {
        task.abort();
    }

    Ok(())
}

/// Stdin/stdout joined into one duplex stream for inetd mode.
struct StdioStream {
    stdin: tokio::io::Stdin,
    stdout: tokio::io::Stdout,
}

impl tokio::io::AsyncRead for StdioStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdin).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for StdioStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stdout).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_shutdown(cx)
    }
}

/// Inetd mode: exactly one connection is already attached to
/// stdin/stdout; serve it and exit.
async fn inetd_serve() {
    let client = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));

    let stream = StdioStream {
        stdin: tokio::io::stdin(),
        stdout: tokio::io::stdout(),
    };

    handle_connection(stream, client).await;
}

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Logging level
    #[arg(short, long, value_name = "SEVERITY")]
    log_level: Option<LevelFilter>,
    /// Configuration file path
    #[arg(
        short = 'c',
        long,
        default_value = config::DEFAULT_CONFIGURATION_PATH,
        value_name = "PATH"
    )]
    config_path: PathBuf,
    /// Skip timestamp in log messages
    #[arg(long, default_value = "false")]
    skip_log_timestamp: bool,
    /// Serve a single connection attached to stdin/stdout
    #[arg(long, default_value = "false", conflicts_with = "cgi")]
    inetd: bool,
    /// Serve a single request taken from the CGI environment
    #[arg(long, default_value = "false")]
    cgi: bool,
    /// Permit daemon running as root user (potentially dangerous)
    #[arg(long, default_value = "false")]
    permit_running_daemon_as_root: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Cli::parse();

    let (config, cfg_fallback) = Config::new(&args.config_path)?;

    let base_log_level = {
        let configured = args.log_level.unwrap_or(config.log_level);
        if config.debug {
            configured.max(LevelFilter::Debug)
        } else {
            configured
        }
    };

    std::fs::create_dir_all(&config.logdir)?;
    let error_log_file = std::fs::File::options()
        .create(true)
        .append(true)
        .open(config.logdir.join(ERROR_LOG_FILE))?;

    let term_log_config = if args.skip_log_timestamp {
        ConfigBuilder::new()
            .set_time_level(LevelFilter::Off)
            .build()
    } else {
        simplelog::Config::default()
    };

    let error_log_config = ConfigBuilder::new()
        .set_level_padding(simplelog::LevelPadding::Right)
        .set_time_format_rfc2822()
        .build();

    /* Loggers pass everything; the effective filter is the global max
     * level so the debug-toggle signal can flip it at runtime. */
    CombinedLogger::init(vec![
        TermLogger::new(
            LevelFilter::Trace,
            term_log_config,
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::Warn, error_log_config, error_log_file),
    ])?;
    log::set_max_level(base_log_level);

    debug!("Logger initialized");

    if cfg_fallback {
        info!(
            "Default configuration file {} not found, using defaults",
            args.config_path.display()
        );
    }

    debug!("Configuration: {config:?}");

    if nix::unistd::getuid().is_root() {
        if args.permit_running_daemon_as_root {
            warn!("!! Running as root is not recommended !!");
        } else {
            error!("Running as root is not recommended and not permitted by default");
            std::process::exit(1);
        }
    }

    info!("Using cache directory `{}`", config.cache_dir.display());

    store::setup_layout(&config.cache_dir).map_err(|err| {
        error!("Error during cache setup:  {err}");
        err
    })?;

    let classifier = Classifier::new(&config.static_files, &config.index_files).map_err(|err| {
        error!("Error compiling file classification patterns:  {err}");
        err
    })?;

    let access_log = AccessLog::open(&config.logdir).map_err(|err| {
        error!("Error opening access log:  {err}");
        err
    })?;

    let reloadable = Arc::new(config.reloadable());
    let https_client = fetcher::build_client(&reloadable).map_err(|err| {
        error!("Error building upstream client:  {err}");
        err
    })?;

    RUNTIMEDETAILS
        .set(RuntimeDetails {
            config,
            reloadable: std::sync::RwLock::new(reloadable),
            https_client: std::sync::RwLock::new(https_client),
            access_log,
            classifier,
            base_log_level,
            debug_forced: AtomicBool::new(false),
        })
        .expect("Initial set should succeed");

    std::panic::set_hook(Box::new(move |panic_info| {
        error!("{panic_info}");
        eprintln!("{panic_info}");
    }));

    scopeguard::defer! {
        info!("Stopped.");
    }

    info!("{APP_NAME} {APP_VERSION} starting");

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .thread_name("pkg-cacher-w")
        .build()
        .expect("Should succeed");

    if args.cgi {
        runtime.block_on(cgi::run_cgi())?;
        Ok(())
    } else if args.inetd {
        runtime.block_on(inetd_serve());
        Ok(())
    } else {
        runtime.block_on(main_loop(args.config_path))
    }
}
