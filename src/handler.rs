//! Request handler: per-request pipeline from the parsed HTTP request to
//! the streamed response. Wire parsing, keep-alive and request
//! serialisation per connection are hyper's job; authorisation,
//! classification and coordination happen here.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::Method;
use hyper::Request;
use hyper::StatusCode;
use hyper::header::CACHE_CONTROL;
use hyper::header::HOST;
use hyper::header::IF_MODIFIED_SINCE;
use hyper::header::IF_RANGE;
use hyper::header::PRAGMA;
use hyper::header::RANGE;
use log::debug;
use log::error;
use log::trace;

use crate::config::Reloadable;
use crate::coordinator;
use crate::coordinator::Decision;
use crate::delivery;
use crate::delivery::RequestMeta;
use crate::delivery::ServeContext;
use crate::delivery::Served;
use crate::fetcher;
use crate::quick_response;
use crate::resource::ClassifyReject;
use crate::warn_once_or_info;

/// Per-request state snapshot: a consistent reloadable-config view and
/// the upstream client built for it.
pub(crate) struct State {
    pub(crate) https_client: fetcher::Client,
    pub(crate) reloadable: Arc<Reloadable>,
}

fn header_str<'r, B>(req: &'r Request<B>, name: hyper::header::HeaderName) -> Option<&'r str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// An absolute-form request is honoured only when its authority names
/// this server; anything else would make us an open relay.
fn authority_is_self(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');

    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        let ip = ip.to_canonical();
        if ip.is_loopback() || ip.is_unspecified() {
            return true;
        }
        if crate::global_config_opt().is_some_and(|cfg| cfg.daemon_addr.contains(&ip)) {
            return true;
        }
    }

    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .is_some_and(|h| h.eq_ignore_ascii_case(host))
}

pub(crate) async fn handle_request<B>(
    client: SocketAddr,
    req: Request<B>,
    state: State,
) -> crate::HttpResponse {
    trace!("Incoming request: {} {}", req.method(), req.uri());

    let client_ip = client.ip().to_canonical();

    /* AUTHORISE */
    if !state.reloadable.client_permitted(&client_ip) {
        warn_once_or_info!("Unauthorized client {client_ip}");
        return quick_response(StatusCode::FORBIDDEN, "Access denied");
    }

    let head_only = match *req.method() {
        Method::GET => false,
        Method::HEAD => true,
        _ => {
            warn_once_or_info!("Unsupported request method {}", req.method());
            return quick_response(StatusCode::BAD_REQUEST, "Method not supported");
        }
    };

    /* hyper accepts HTTP/1.1 requests without Host; the protocol does not */
    if req.version() == hyper::Version::HTTP_11 && req.headers().get(HOST).is_none() {
        return quick_response(StatusCode::BAD_REQUEST, "Missing Host header");
    }

    /* No general proxying: absolute URLs must name this server. */
    if let Some(authority) = req.uri().authority() {
        if !authority_is_self(authority.host()) {
            warn_once_or_info!("Refusing proxy request for foreign host {authority}");
            return quick_response(StatusCode::FORBIDDEN, "Not a general proxy");
        }
    }

    /* CLASSIFY */
    let (key, kind) = match crate::classifier().classify(
        req.uri().path(),
        &state.reloadable.path_map,
    ) {
        Ok(r) => r,
        Err(ClassifyReject::BadEncoding) => {
            return quick_response(StatusCode::BAD_REQUEST, "Unsupported URL encoding");
        }
        Err(ClassifyReject::Malformed(reason)) => {
            warn_once_or_info!("Malformed request path `{}`: {reason}", req.uri().path());
            return quick_response(StatusCode::FORBIDDEN, "Unsupported path");
        }
        Err(ClassifyReject::UnknownVhost(vhost)) => {
            warn_once_or_info!("Request for unknown vhost `{vhost}`");
            return quick_response(StatusCode::NOT_FOUND, "Unknown repository");
        }
        Err(ClassifyReject::ForbiddenBasename(name)) => {
            warn_once_or_info!("Refusing non-repository file `{name}`");
            return quick_response(StatusCode::FORBIDDEN, "Unsupported file type");
        }
    };

    debug!("Client {client_ip} requests {key} ({kind:?})");

    let client_no_cache = [PRAGMA, CACHE_CONTROL].into_iter().any(|h| {
        header_str(&req, h).is_some_and(|v| v.to_ascii_lowercase().contains("no-cache"))
    });

    let meta = RequestMeta {
        head_only,
        range: header_str(&req, RANGE).map(ToOwned::to_owned),
        if_range: header_str(&req, IF_RANGE).map(ToOwned::to_owned),
        if_modified_since: header_str(&req, IF_MODIFIED_SINCE).map(ToOwned::to_owned),
        client: client_ip,
    };

    let ctx = ServeContext {
        access_log: crate::access_log().clone(),
        stall_timeout: state.reloadable.fetch_timeout,
    };

    let cache_dir = &crate::global_config().cache_dir;

    /* COORDINATE + STREAM, re-entered once if the reader reports a
     * crashed fetcher. */
    for attempt in 0..2 {
        let decision = match coordinator::coordinate(
            &state.https_client,
            &state.reloadable,
            cache_dir,
            &key,
            kind,
            client_ip,
            client_no_cache,
        )
        .await
        {
            Ok(d) => d,
            Err(err) => {
                error!("Coordination of {key} failed:  {err}");
                return quick_response(StatusCode::INTERNAL_SERVER_ERROR, "Configuration error");
            }
        };

        let served = match decision {
            Decision::Refuse(status, message) => {
                return quick_response(status, message);
            }
            Decision::Complete {
                file,
                sidecar,
                paths,
                log_status,
            } => {
                delivery::serve_entry(file, paths, Some(sidecar), &key, &meta, log_status, &ctx)
                    .await
            }
            Decision::Follow {
                file,
                paths,
                log_status,
            } => delivery::serve_entry(file, paths, None, &key, &meta, log_status, &ctx).await,
        };

        match served {
            Served::Response(response) => return response,
            Served::RetryFetch => {
                debug!("Reader observed crashed fetcher for {key}, retry {attempt}");
            }
        }
    }

    error!("Repeatedly failed to obtain a response header for {key}");
    quick_response(StatusCode::INTERNAL_SERVER_ERROR, "Fetch repeatedly crashed")
}
