//! CGI adapter mode.
//!
//! Builds a synthetic request from the CGI environment, runs it through
//! the normal handler pipeline, and writes the response to stdout with a
//! `Status:` line instead of an HTTP status line. `Connection: Close` is
//! forced; configuration keys are overridable through `PKG_CACHER_<KEY>`
//! environment variables (applied at configuration load).

use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;

use http_body_util::BodyExt;
use hyper::Request;
use hyper::header::CONNECTION;
use log::info;
use log::warn;
use tokio::io::AsyncWriteExt;

use crate::handler;

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Serves exactly one request taken from the CGI environment.
pub(crate) async fn run_cgi() -> anyhow::Result<()> {
    use anyhow::Context as _;
    use anyhow::bail;

    let method = env_nonempty("REQUEST_METHOD").unwrap_or_else(|| "GET".to_string());
    match method.as_str() {
        "GET" | "HEAD" => (),
        other => bail!("Unsupported CGI request method `{other}`"),
    }

    let path = env_nonempty("PATH_INFO")
        .or_else(|| env_nonempty("QUERY_STRING"))
        .context("Neither PATH_INFO nor QUERY_STRING is set")?;

    let client_ip: IpAddr = env_nonempty("REMOTE_ADDR")
        .and_then(|addr| addr.parse().ok())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let client = SocketAddr::new(client_ip, 0);

    info!("CGI request {method} {path} for client {}", client_ip.to_canonical());

    let mut builder = Request::builder().method(method.as_str()).uri(&path);

    for (env_name, header) in [
        ("HTTP_HOST", "host"),
        ("HTTP_RANGE", "range"),
        ("HTTP_IF_RANGE", "if-range"),
        ("HTTP_IF_MODIFIED_SINCE", "if-modified-since"),
        ("HTTP_PRAGMA", "pragma"),
        ("HTTP_CACHE_CONTROL", "cache-control"),
    ] {
        if let Some(value) = env_nonempty(env_name) {
            builder = builder.header(header, value);
        }
    }

    if let Some("HTTP/1.0") = env_nonempty("SERVER_PROTOCOL").as_deref() {
        builder = builder.version(hyper::Version::HTTP_10);
    }

    /* gateways do not always forward a Host header */
    if builder.headers_ref().is_none_or(|h| !h.contains_key("host")) {
        let host = env_nonempty("SERVER_NAME").unwrap_or_else(|| "localhost".to_string());
        builder = builder.header("host", host);
    }

    let request = builder
        .body(crate::empty())
        .context("Failed to build CGI request")?;

    let state = handler::State {
        https_client: crate::current_client(),
        reloadable: crate::reloadable_config(),
    };

    let mut response = handler::handle_request(client, request, state).await;

    let mut stdout = tokio::io::stdout();

    /* CGI response head: Status line plus headers, Connection forced. */
    let status = response.status();
    let mut head = format!(
        "Status: {} {}\r\n",
        status.as_str(),
        status.canonical_reason().unwrap_or("")
    );
    for (name, value) in response.headers() {
        if name == CONNECTION {
            continue;
        }
        head.push_str(&format!("{name}: {}\r\n", value.to_str().unwrap_or_default()));
    }
    if crate::global_config().cgi_advise_to_use {
        head.push_str(&format!(
            "X-Pkg-Cacher: consider using the daemon on port {}\r\n",
            crate::global_config().daemon_port
        ));
    }
    head.push_str("Connection: Close\r\n\r\n");

    stdout.write_all(head.as_bytes()).await?;

    while let Some(next) = response.body_mut().frame().await {
        match next {
            Ok(frame) => {
                if let Ok(data) = frame.into_data() {
                    stdout.write_all(&data).await?;
                }
            }
            Err(err) => {
                warn!("CGI body transfer aborted:  {err}");
                break;
            }
        }
    }

    stdout.flush().await?;

    Ok(())
}
