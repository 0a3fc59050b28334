//! Upstream fetcher.
//!
//! Walks the ordered candidate list of a virtual host, with per-candidate
//! retry and redirect budgets, and writes the winning response into the
//! content store. The header sidecar is staged to scratch and renamed
//! into place as soon as the final (post-redirect) response is known, so
//! concurrent readers can start streaming while the body is still being
//! written; a successful download ends with the commit sequence (length
//! check, pool link, completion marker).

use std::net::IpAddr;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use base64::Engine as _;
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use hyper::Request;
use hyper::StatusCode;
use hyper::Uri;
use hyper::body::Incoming;
use hyper::header::CACHE_CONTROL;
use hyper::header::HOST;
use hyper::header::HeaderName;
use hyper::header::HeaderValue;
use hyper::header::LOCATION;
use hyper::header::PRAGMA;
use hyper::header::PROXY_AUTHORIZATION;
use hyper::header::USER_AGENT;
use hyper_util::client::legacy::connect::HttpConnector;
use log::debug;
use log::error;
use log::info;
use log::trace;
use log::warn;
use tokio::io::AsyncSeekExt;
use tokio::io::AsyncWriteExt;

use crate::config::Reloadable;
use crate::error::PkgCacherError;
use crate::humanfmt::HumanFmt;
use crate::resource::ObjectKey;
use crate::store;
use crate::store::CreatedEntry;
use crate::store::EntryPaths;
use crate::warn_once_or_info;

#[cfg(feature = "tls_rustls")]
use hyper_rustls::HttpsConnector;
#[cfg(all(feature = "tls_default", not(feature = "tls_rustls")))]
use hyper_tls::HttpsConnector;

const RETRY_BUDGET: u32 = 5;
const REDIRECT_BUDGET: u32 = 5;

/// Requests whose URI is plain `http` are redirected to the parent proxy
/// at the connection level; the request itself keeps the absolute-form
/// target so the proxy can route it. The returned IO is marked as
/// proxied so the client does not rewrite the target to origin-form.
#[derive(Clone, Debug)]
pub(crate) struct ParentProxyConnector<C> {
    inner: C,
    proxy: Option<Uri>,
}

impl<C> ParentProxyConnector<C> {
    pub(crate) const fn new(inner: C, proxy: Option<Uri>) -> Self {
        Self { inner, proxy }
    }
}

#[pin_project::pin_project]
pub(crate) struct ProxiedIo<T> {
    #[pin]
    inner: T,
    via_proxy: bool,
}

impl<T> hyper_util::client::legacy::connect::Connection for ProxiedIo<T>
where
    T: hyper_util::client::legacy::connect::Connection,
{
    fn connected(&self) -> hyper_util::client::legacy::connect::Connected {
        let connected = self.inner.connected();
        if self.via_proxy {
            connected.proxy(true)
        } else {
            connected
        }
    }
}

impl<T: hyper::rt::Read> hyper::rt::Read for ProxiedIo<T> {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl<T: hyper::rt::Write> hyper::rt::Write for ProxiedIo<T> {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<Result<usize, std::io::Error>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        self.project().inner.poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> std::task::Poll<Result<usize, std::io::Error>> {
        self.project().inner.poll_write_vectored(cx, bufs)
    }
}

impl<C> tower_service::Service<Uri> for ParentProxyConnector<C>
where
    C: tower_service::Service<Uri>,
    C::Future: Send + 'static,
    C::Response: Send + 'static,
{
    type Response = ProxiedIo<C::Response>;
    type Error = C::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let (target, via_proxy) = match &self.proxy {
            Some(proxy) if dst.scheme_str() == Some("http") => (proxy.clone(), true),
            _ => (dst, false),
        };

        let fut = self.inner.call(target);
        Box::pin(async move {
            Ok(ProxiedIo {
                inner: fut.await?,
                via_proxy,
            })
        })
    }
}

pub(crate) type Client = hyper_util::client::legacy::Client<
    hyper_timeout::TimeoutConnector<ParentProxyConnector<HttpsConnector<HttpConnector>>>,
    BoxBody<bytes::Bytes, PkgCacherError>,
>;

/// Builds the upstream client from the current reloadable configuration.
/// Rebuilt on a reload signal so proxy and TLS settings take effect.
pub(crate) fn build_client(reloadable: &Reloadable) -> anyhow::Result<Client> {
    use anyhow::Context as _;

    #[cfg(all(feature = "tls_default", not(feature = "tls_rustls")))]
    let https_connector = {
        if !reloadable.require_valid_ssl {
            warn!("require_valid_ssl=false needs the tls_rustls build, certificates are verified");
        }
        if reloadable.use_interface.is_some() {
            warn!("use_interface needs the tls_rustls build, using the default route");
        }
        HttpsConnector::new()
    };

    #[cfg(feature = "tls_rustls")]
    let https_connector = {
        use hyper_rustls::ConfigBuilderExt;

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);
        if let Some(iface) = &reloadable.use_interface {
            let local: IpAddr = iface
                .parse()
                .with_context(|| format!("Invalid use_interface address `{iface}`"))?;
            http_connector.set_local_address(Some(local));
        }

        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let tls_cfg = if reloadable.require_valid_ssl {
            rustls::ClientConfig::builder()
                .with_native_roots()
                .context("Failed to load native TLS roots")?
                .with_no_client_auth()
        } else {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::NoVerification::new()))
                .with_no_client_auth()
        };
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_cfg)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector)
    };

    let proxy = match (&reloadable.http_proxy, reloadable.use_proxy) {
        (Some(p), true) => {
            let host = p.strip_prefix("http://").unwrap_or(p);
            Some(
                format!("http://{host}")
                    .parse::<Uri>()
                    .with_context(|| format!("Invalid http_proxy `{p}`"))?,
            )
        }
        _ => None,
    };

    let proxied = ParentProxyConnector::new(https_connector, proxy);

    let mut timeout_connector = hyper_timeout::TimeoutConnector::new(proxied);
    timeout_connector.set_connect_timeout(Some(crate::config::CONNECT_TIMEOUT));
    timeout_connector.set_read_timeout(Some(reloadable.fetch_timeout));
    timeout_connector.set_write_timeout(Some(reloadable.fetch_timeout));

    Ok(
        hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
            .build(timeout_connector),
    )
}

#[cfg(feature = "tls_rustls")]
mod danger {
    //! Certificate verifier for `require_valid_ssl = false`.

    use rustls::DigitallySignedStruct;
    use rustls::client::danger::HandshakeSignatureValid;
    use rustls::client::danger::ServerCertVerified;
    use rustls::client::danger::ServerCertVerifier;
    use rustls::crypto::CryptoProvider;

    #[derive(Debug)]
    pub(super) struct NoVerification(CryptoProvider);

    impl NoVerification {
        pub(super) fn new() -> Self {
            Self(rustls::crypto::aws_lc_rs::default_provider())
        }
    }

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::pki_types::CertificateDer<'_>,
            _intermediates: &[rustls::pki_types::CertificateDer<'_>],
            _server_name: &rustls::pki_types::ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls::pki_types::UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &rustls::pki_types::CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &rustls::pki_types::CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}

/// Resolves a candidate base plus a request uri into the upstream URL.
/// A uri already carrying a scheme is used as-is; otherwise the decoded
/// cache path is re-encoded segment-wise for the wire.
fn candidate_uri(candidate: &str, uri: &str) -> Result<Uri, hyper::http::uri::InvalidUri> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return uri.parse();
    }

    let mut encoded = String::with_capacity(uri.len());
    for (i, segment) in uri.split('/').enumerate() {
        if i > 0 {
            encoded.push('/');
        }
        /* keep the characters repository tools use verbatim */
        let needs_encoding = segment
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || "-._~+:=@,".contains(c)));
        if needs_encoding {
            encoded.push_str(&urlencoding::encode(segment));
        } else {
            encoded.push_str(segment);
        }
    }

    format!("http://{candidate}/{encoded}").parse()
}

fn build_request(
    target: &Uri,
    method: hyper::Method,
    reloadable: &Reloadable,
    client_no_cache: bool,
) -> Result<Request<BoxBody<bytes::Bytes, PkgCacherError>>, PkgCacherError> {
    let host = target
        .authority()
        .map(hyper::http::uri::Authority::as_str)
        .unwrap_or_default();

    let mut request = Request::builder()
        .method(method)
        .uri(target.clone())
        .header(USER_AGENT, HeaderValue::from_static(crate::APP_USER_AGENT))
        .header(HOST, HeaderValue::from_str(host)?)
        .body(crate::empty())?;

    if client_no_cache {
        /* forward the client's refresh demand */
        request
            .headers_mut()
            .insert(PRAGMA, HeaderValue::from_static("no-cache"));
        request
            .headers_mut()
            .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    } else {
        /* suppress any injected Pragma */
        request
            .headers_mut()
            .insert(PRAGMA, HeaderValue::from_static(""));
    }

    if reloadable.use_proxy && reloadable.use_proxy_auth && target.scheme_str() == Some("http") {
        if let Some(credentials) = &reloadable.http_proxy_auth {
            let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
            request.headers_mut().insert(
                PROXY_AUTHORIZATION,
                HeaderValue::from_str(&format!("Basic {encoded}"))?,
            );
        }
    }

    Ok(request)
}

/// Resolves a `Location` value against the current target.
fn resolve_redirect(target: &Uri, location: &str) -> Option<Uri> {
    if location.contains("://") {
        return location.parse().ok();
    }

    /* relative redirect */
    let mut parts = target.clone().into_parts();
    parts.path_and_query = location.parse().ok();
    Uri::from_parts(parts).ok()
}

/// Caps the upstream transfer rate by sleeping away the rest of each
/// one-second window once the byte budget is spent.
struct RateLimiter {
    limit: u64,
    window_start: Instant,
    window_bytes: u64,
}

impl RateLimiter {
    fn new(limit: u64) -> Self {
        Self {
            limit,
            window_start: Instant::now(),
            window_bytes: 0,
        }
    }

    async fn throttle(&mut self, transferred: usize) {
        self.window_bytes += transferred as u64;

        let elapsed = self.window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            self.window_start = Instant::now();
            self.window_bytes = 0;
        } else if self.window_bytes >= self.limit {
            tokio::time::sleep(Duration::from_secs(1) - elapsed).await;
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }
    }
}

enum AttemptOutcome {
    /// 2xx received, sidecar published, body fully on disk.
    Success { bytes: u64, target: Uri },
    /// Terminal client error from the origin: persist and stop.
    Terminal(hyper::http::response::Parts),
    /// Candidate exhausted; remember the response if there was one.
    CandidateFailed(Option<hyper::http::response::Parts>, Option<String>),
}

async fn reset_attempt(
    writer: &mut tokio::fs::File,
    paths: &EntryPaths,
) -> std::io::Result<()> {
    writer.set_len(0).await?;
    writer.seek(std::io::SeekFrom::Start(0)).await?;

    /* a prior attempt may have published a header already */
    for path in [&paths.header, &paths.marker] {
        match tokio::fs::remove_file(path).await {
            Ok(()) => (),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

async fn download_body(
    body: Incoming,
    writer: &mut tokio::fs::File,
    reloadable: &Reloadable,
) -> Result<u64, PkgCacherError> {
    let mut body = body;
    let mut bytes: u64 = 0;
    let mut limiter = reloadable.limit.map(|l| RateLimiter::new(l.get()));

    let mut buf_writer = tokio::io::BufWriter::with_capacity(64 * 1024, writer);

    while let Some(next) = body.frame().await {
        let frame = next?;
        if let Ok(mut chunk) = frame.into_data() {
            let len = chunk.len();
            bytes += len as u64;

            buf_writer.write_all_buf(&mut chunk).await?;

            if let Some(limiter) = &mut limiter {
                limiter.throttle(len).await;
            }
        }
    }

    buf_writer.flush().await?;

    Ok(bytes)
}

#[expect(clippy::too_many_arguments)]
async fn try_candidate(
    client: &Client,
    reloadable: &Reloadable,
    cache_dir: &Path,
    paths: &EntryPaths,
    candidate: &str,
    key: &ObjectKey,
    writer: &mut tokio::fs::File,
    client_no_cache: bool,
) -> AttemptOutcome {
    let base = match candidate_uri(candidate, &key.uri) {
        Ok(u) => u,
        Err(err) => {
            warn!("Invalid upstream URL for candidate `{candidate}`:  {err}");
            return AttemptOutcome::CandidateFailed(None, Some(err.to_string()));
        }
    };

    let mut target = base.clone();
    let mut retries = 0;
    let mut redirects = 0;
    let mut last_parts = None;
    let mut last_error = None;

    loop {
        /* every attempt restarts the entry from scratch */
        if let Err(err) = reset_attempt(writer, paths).await {
            error!("Failed to reset entry {key}:  {err}");
            return AttemptOutcome::CandidateFailed(last_parts, Some(err.to_string()));
        }

        let request = match build_request(&target, hyper::Method::GET, reloadable, client_no_cache)
        {
            Ok(r) => r,
            Err(err) => {
                return AttemptOutcome::CandidateFailed(last_parts, Some(err.to_string()));
            }
        };

        trace!("Upstream request: {request:?}");

        let response = match client.request(request).await {
            Ok(r) => r,
            Err(err) => {
                debug!("No response from `{target}` (attempt {retries}):  {err}");
                last_error = Some(err.to_string());
                retries += 1;
                if retries >= RETRY_BUDGET {
                    return AttemptOutcome::CandidateFailed(last_parts, last_error);
                }
                continue;
            }
        };

        trace!("Upstream response: {response:?}");

        let status = response.status();

        if status.is_redirection() {
            redirects += 1;
            if redirects > REDIRECT_BUDGET {
                info!("Redirect budget exhausted for candidate `{candidate}`");
                return AttemptOutcome::CandidateFailed(Some(response.into_parts().0), last_error);
            }

            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(ToOwned::to_owned);

            match location {
                Some(loc) if loc.starts_with("ftp://") => {
                    /* unusable scheme: retry the candidate at its base */
                    warn_once_or_info!("Ignoring ftp redirect to `{loc}` from `{target}`");
                    target = base.clone();
                }
                Some(loc) => match resolve_redirect(&target, &loc) {
                    Some(next) => {
                        debug!("Following redirect `{target}` -> `{next}`");
                        target = next;
                    }
                    None => {
                        warn!("Unresolvable redirect `{loc}` from `{target}`");
                        return AttemptOutcome::CandidateFailed(
                            Some(response.into_parts().0),
                            last_error,
                        );
                    }
                },
                None => {
                    warn!("Redirect without Location from `{target}`");
                    return AttemptOutcome::CandidateFailed(
                        Some(response.into_parts().0),
                        last_error,
                    );
                }
            }
            continue;
        }

        if status == StatusCode::BAD_REQUEST {
            /* counted against the retry budget like a missing response */
            last_parts = Some(response.into_parts().0);
            retries += 1;
            if retries >= RETRY_BUDGET {
                return AttemptOutcome::CandidateFailed(last_parts, last_error);
            }
            continue;
        }

        if status.is_client_error() {
            info!("Upstream `{target}` answered {status} for {key}");
            return AttemptOutcome::Terminal(response.into_parts().0);
        }

        if !status.is_success() {
            info!("Upstream `{target}` answered {status} for {key}, trying next candidate");
            return AttemptOutcome::CandidateFailed(Some(response.into_parts().0), last_error);
        }

        let (parts, body) = response.into_parts();

        /* The final response is known: publish the sidecar before the
         * body transfer so waiting readers start streaming now. */
        let text = store::format_sidecar(parts.version, parts.status, &parts.headers);
        if let Err(err) = store::publish_sidecar(cache_dir, paths, &text).await {
            error!("Failed to publish sidecar for {key}:  {err}");
            return AttemptOutcome::CandidateFailed(Some(parts), Some(err.to_string()));
        }

        match download_body(body, writer, reloadable).await {
            Ok(bytes) => {
                return AttemptOutcome::Success { bytes, target };
            }
            Err(err) => {
                warn!("Body transfer from `{target}` failed:  {err}");
                last_error = Some(err.to_string());
                retries += 1;
                if retries >= RETRY_BUDGET {
                    return AttemptOutcome::CandidateFailed(last_parts, last_error);
                }
            }
        }
    }
}

async fn publish_error_sidecar(
    cache_dir: &Path,
    paths: &EntryPaths,
    status: StatusCode,
    detail: &str,
) {
    let mut headers = hyper::HeaderMap::new();
    headers.insert(hyper::header::CONTENT_LENGTH, HeaderValue::from_static("0"));
    if let Ok(value) = HeaderValue::from_str(detail) {
        headers.insert(HeaderName::from_static("x-pkg-cacher-error"), value);
    }

    let text = store::format_sidecar(hyper::Version::HTTP_11, status, &headers);
    if let Err(err) = store::publish_sidecar(cache_dir, paths, &text).await {
        error!(
            "Failed to persist error sidecar `{}`:  {err}",
            paths.header.display()
        );
    }
}

/// Downloads one object into its created entry. Runs as a spawned task;
/// every reader, including the request that triggered the fetch, follows
/// the growing body file independently.
pub(crate) async fn fetch_object(
    client: Client,
    reloadable: Arc<Reloadable>,
    cache_dir: PathBuf,
    key: ObjectKey,
    mut entry: CreatedEntry,
    client_ip: IpAddr,
    client_no_cache: bool,
) {
    let start = Instant::now();
    let paths = entry.paths.clone();

    debug!(
        "Starting fetch of {key} for client {}...",
        client_ip.to_canonical()
    );

    let Some(candidates) = reloadable.path_map.get(&key.vhost).cloned() else {
        /* vhost vanished in a reload between classify and fetch */
        warn!("No upstream candidates for vhost `{}`", key.vhost);
        if let Err(err) = store::unlink_body_only(&paths) {
            error!("Failed to unlink body of {key}:  {err}");
        }
        publish_error_sidecar(
            &cache_dir,
            &paths,
            StatusCode::BAD_GATEWAY,
            "no upstream candidates",
        )
        .await;
        return;
    };

    let mut last_parts: Option<hyper::http::response::Parts> = None;
    let mut last_error: Option<String> = None;

    for candidate in &candidates {
        match try_candidate(
            &client,
            &reloadable,
            &cache_dir,
            &paths,
            candidate,
            &key,
            &mut entry.writer,
            client_no_cache,
        )
        .await
        {
            AttemptOutcome::Success { bytes, target } => {
                match store::commit_entry(&cache_dir, &key, &paths, &target.to_string()).await {
                    Ok(()) => {
                        let elapsed = start.elapsed();
                        info!(
                            "Fetched {key} from `{target}` in {} (size={}, rate={})",
                            HumanFmt::Time(elapsed),
                            HumanFmt::Size(bytes),
                            HumanFmt::Rate(bytes, elapsed)
                        );
                    }
                    Err(err) => {
                        error!("Failed to commit {key}:  {err}");
                        if let Err(uerr) = store::unlink_entry(&paths) {
                            error!("Failed to unlink broken entry {key}:  {uerr}");
                        }
                    }
                }
                return;
            }
            AttemptOutcome::Terminal(parts) => {
                /* definitive origin 4xx: persist the error, drop the body.
                 * Sidecar first, so a waiting reader never observes the
                 * entry as crashed. */
                let text = store::format_sidecar(parts.version, parts.status, &parts.headers);
                if let Err(err) = store::publish_sidecar(&cache_dir, &paths, &text).await {
                    error!("Failed to publish error sidecar for {key}:  {err}");
                }
                if let Err(err) = store::unlink_body_only(&paths) {
                    error!("Failed to unlink body of {key}:  {err}");
                }
                return;
            }
            AttemptOutcome::CandidateFailed(parts, err) => {
                if parts.is_some() {
                    last_parts = parts;
                }
                if err.is_some() {
                    last_error = err;
                }
            }
        }
    }

    /* all candidates failed; readers observe the last response */
    warn!(
        "All {} upstream candidates failed for {key}",
        candidates.len()
    );

    match last_parts {
        Some(parts) => {
            let text = store::format_sidecar(parts.version, parts.status, &parts.headers);
            if let Err(err) = store::publish_sidecar(&cache_dir, &paths, &text).await {
                error!("Failed to publish failure sidecar for {key}:  {err}");
            }
        }
        None => {
            let detail = last_error.unwrap_or_else(|| "no response".to_string());
            publish_error_sidecar(
                &cache_dir,
                &paths,
                StatusCode::BAD_GATEWAY,
                &format!("upstream error: {detail}"),
            )
            .await;
        }
    }

    if let Err(err) = store::unlink_body_only(&paths) {
        error!("Failed to unlink body of {key}:  {err}");
    }
}

/// Issues a revalidation HEAD for an index file, walking the candidate
/// list like a GET but without touching the store.
pub(crate) async fn head_object(
    client: &Client,
    reloadable: &Reloadable,
    key: &ObjectKey,
) -> Result<(StatusCode, hyper::HeaderMap), PkgCacherError> {
    let candidates = reloadable
        .path_map
        .get(&key.vhost)
        .ok_or_else(|| std::io::Error::other(format!("no candidates for vhost {}", key.vhost)))?;

    let mut last_err: Option<PkgCacherError> = None;

    for candidate in candidates {
        let base = match candidate_uri(candidate, &key.uri) {
            Ok(u) => u,
            Err(err) => {
                warn!("Invalid upstream URL for candidate `{candidate}`:  {err}");
                continue;
            }
        };

        let mut target = base.clone();
        let mut redirects = 0;

        loop {
            let request = build_request(&target, hyper::Method::HEAD, reloadable, false)?;

            let response = match client.request(request).await {
                Ok(r) => r,
                Err(err) => {
                    debug!("HEAD `{target}` failed:  {err}");
                    last_err = Some(err.into());
                    break;
                }
            };

            let status = response.status();

            if status.is_redirection() {
                redirects += 1;
                if redirects > REDIRECT_BUDGET {
                    break;
                }
                let Some(next) = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .filter(|loc| !loc.starts_with("ftp://"))
                    .and_then(|loc| resolve_redirect(&target, loc))
                else {
                    break;
                };
                target = next;
                continue;
            }

            if status.is_success() {
                let (parts, _body) = response.into_parts();
                return Ok((parts.status, parts.headers));
            }

            last_err =
                Some(std::io::Error::other(format!("HEAD `{target}` answered {status}")).into());
            break;
        }
    }

    Err(last_err.unwrap_or_else(|| std::io::Error::other("no upstream candidates").into()))
}
