//! Streaming reader.
//!
//! Emits the response for a cache entry whose body may still be growing
//! under a concurrent fetcher: awaits the header sidecar, sanitises the
//! stored headers, applies conditional and range semantics, and streams
//! the body in 64 KiB reads that follow the writer until the completion
//! marker appears. Every transfer is bounded by the stall timeout.

use std::net::IpAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;
use std::time::Instant;

use bytes::Bytes;
use bytes::BytesMut;
use http_body_util::combinators::BoxBody;
use hyper::Response;
use hyper::StatusCode;
use hyper::body::Body;
use hyper::body::Frame;
use hyper::body::SizeHint;
use hyper::header::ACCEPT_RANGES;
use hyper::header::CONNECTION;
use hyper::header::CONTENT_LENGTH;
use hyper::header::CONTENT_RANGE;
use hyper::header::CONTENT_TYPE;
use hyper::header::HeaderName;
use hyper::header::HeaderValue;
use hyper::header::SERVER;
use log::debug;
use log::error;
use log::info;
use log::warn;
use pin_project::pin_project;
use pin_project::pinned_drop;
use rand::Rng;
use rand::SeedableRng;
use rand::distr::Alphanumeric;
use rand::rngs::SmallRng;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeekExt;

use crate::accesslog::AccessLog;
use crate::accesslog::CacheStatus;
use crate::error::PkgCacherError;
use crate::error::StallError;
use crate::http_range::ByteRange;
use crate::http_range::RangeOutcome;
use crate::http_range::http_parse_ranges;
use crate::humanfmt::HumanFmt;
use crate::lock::BodyProbe;
use crate::resource::ObjectKey;
use crate::store::EntryPaths;
use crate::store::Sidecar;

const READ_CHUNK: usize = 64 * 1024;
const FOLLOW_POLL: Duration = Duration::from_millis(100);

/// The request fields the reader consumes.
#[derive(Debug)]
pub(crate) struct RequestMeta {
    pub(crate) head_only: bool,
    pub(crate) range: Option<String>,
    pub(crate) if_range: Option<String>,
    pub(crate) if_modified_since: Option<String>,
    pub(crate) client: IpAddr,
}

/// Shared per-request context for the reader.
pub(crate) struct ServeContext {
    pub(crate) access_log: AccessLog,
    pub(crate) stall_timeout: Duration,
}

pub(crate) enum Served {
    Response(crate::HttpResponse),
    /// The sidecar vanished before it was published: the previous
    /// fetcher crashed; the coordinator should fetch this time.
    RetryFetch,
}

enum SidecarWait {
    Ready(Sidecar),
    Crashed,
    Timeout,
    Failed(PkgCacherError),
}

/// Polls for a non-empty header sidecar, bounded by the stall timeout.
/// A free body lock with no marker and no sidecar means the fetcher
/// died before publishing anything.
async fn await_sidecar(paths: &EntryPaths, stall_timeout: Duration) -> SidecarWait {
    let start = Instant::now();
    let mut crash_suspicion = 0;

    loop {
        match crate::store::read_sidecar(&paths.header).await {
            Ok(Some(sidecar)) => return SidecarWait::Ready(sidecar),
            Ok(None) => (),
            Err(err) => return SidecarWait::Failed(err),
        }

        let crashed = if paths.body.exists() {
            !paths.is_complete()
                && matches!(
                    crate::lock::probe_body_lock(&paths.body),
                    Ok(BodyProbe::Unlocked)
                )
        } else {
            true
        };

        if crashed {
            /* require two consecutive observations to shake off races
             * with the fetcher's own create/publish window */
            crash_suspicion += 1;
            if crash_suspicion >= 2 {
                return SidecarWait::Crashed;
            }
        } else {
            crash_suspicion = 0;
        }

        if start.elapsed() > stall_timeout {
            return SidecarWait::Timeout;
        }

        tokio::time::sleep(FOLLOW_POLL).await;
    }
}

/// Header fields forwarded from the stored upstream response. Hop-by-hop
/// fields are dropped; `Content-Length` is extracted separately as the
/// authoritative total.
fn sanitize_headers(sidecar: &Sidecar) -> Vec<(HeaderName, HeaderValue)> {
    let mut out = Vec::with_capacity(sidecar.headers.len());

    for (name, value) in &sidecar.headers {
        let lower = name.to_ascii_lowercase();

        let keep = matches!(lower.as_str(), "last-modified" | "etag" | "age")
            || (lower.starts_with("content-") && lower != "content-length")
            || lower.starts_with("accept-");

        if !keep {
            continue;
        }

        let Ok(name) = HeaderName::try_from(lower) else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            continue;
        };
        out.push((name, value));
    }

    out
}

struct ResponseSpec {
    status: StatusCode,
    forwarded: Vec<(HeaderName, HeaderValue)>,
    content_length: Option<u64>,
    content_range: Option<String>,
    content_type_override: Option<String>,
    keepalive: bool,
}

fn assemble(
    spec: ResponseSpec,
    body: BoxBody<Bytes, PkgCacherError>,
) -> crate::HttpResponse {
    let mut builder = Response::builder()
        .status(spec.status)
        .header(SERVER, HeaderValue::from_static(crate::APP_NAME))
        .header(
            CONNECTION,
            HeaderValue::from_static(if spec.keepalive { "keep-alive" } else { "close" }),
        );

    if spec.status.is_success() {
        builder = builder.header(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    }

    let mut response = builder.body(body).expect("response is valid");
    let headers = response.headers_mut();

    for (name, value) in spec.forwarded {
        if spec.content_type_override.is_some() && name == CONTENT_TYPE {
            continue;
        }
        headers.append(name, value);
    }

    if let Some(ct) = spec.content_type_override {
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(&ct).expect("content type is valid"),
        );
    }

    if let Some(cl) = spec.content_length {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(cl));
    }

    if let Some(cr) = spec.content_range {
        headers.insert(
            CONTENT_RANGE,
            HeaderValue::from_str(&cr).expect("content range is valid"),
        );
    }

    response
}

/// One part of the emission plan.
enum Plan {
    /// The full body; length may be unknown while a chunked fetch runs.
    Whole { total: Option<u64> },
    Single {
        part: ByteRange,
        total: u64,
    },
    Multi {
        parts: Vec<ByteRange>,
        preambles: Vec<String>,
        epilogue: String,
        total_length: u64,
    },
}

/// Renders the multipart/byteranges framing and its exact total length.
fn multipart_plan(
    parts: Vec<ByteRange>,
    total: u64,
    content_type: Option<&str>,
    boundary: &str,
) -> Plan {
    let mut preambles = Vec::with_capacity(parts.len());
    let mut total_length = 0u64;

    for (i, part) in parts.iter().enumerate() {
        let mut preamble = String::new();
        if i > 0 {
            preamble.push_str("\r\n");
        }
        preamble.push_str(&format!("--{boundary}\r\n"));
        if let Some(ct) = content_type {
            preamble.push_str(&format!("Content-Type: {ct}\r\n"));
        }
        preamble.push_str(&format!("Content-Range: {}\r\n\r\n", part.content_range(total)));

        total_length += preamble.len() as u64 + part.len();
        preambles.push(preamble);
    }

    let epilogue = format!("\r\n--{boundary}--\r\n");
    total_length += epilogue.len() as u64;

    Plan::Multi {
        parts,
        preambles,
        epilogue,
        total_length,
    }
}

/// Streaming body fed by the reader task.
struct ChannelBody {
    receiver: tokio::sync::mpsc::Receiver<Result<Bytes, PkgCacherError>>,
    remaining: SizeHint,
    complete: bool,
}

impl ChannelBody {
    fn new(
        receiver: tokio::sync::mpsc::Receiver<Result<Bytes, PkgCacherError>>,
        content_length: Option<u64>,
    ) -> Self {
        let remaining = match content_length {
            Some(size) => SizeHint::with_exact(size),
            None => SizeHint::new(),
        };

        Self {
            receiver,
            remaining,
            complete: false,
        }
    }
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = PkgCacherError;

    fn size_hint(&self) -> SizeHint {
        self.remaining.clone()
    }

    fn is_end_stream(&self) -> bool {
        self.complete
    }

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        if self.complete {
            return std::task::Poll::Ready(None);
        }

        let msg = self.receiver.poll_recv(cx);
        if matches!(msg, std::task::Poll::Ready(None)) {
            self.complete = true;
        }

        msg.map(|item| {
            item.map(|result| {
                result.map(|data| {
                    if let Some(exact) = self.remaining.exact() {
                        self.remaining
                            .set_exact(exact.saturating_sub(data.len() as u64));
                    }
                    Frame::data(data)
                })
            })
        })
    }
}

struct LogDetails {
    access_log: AccessLog,
    client: IpAddr,
    status: CacheStatus,
    basename: String,
}

/// Counts the bytes actually handed to the client and registers the
/// access-log line once the response body is dropped.
#[pin_project(PinnedDrop)]
struct DeliveryBody {
    #[pin]
    inner: ChannelBody,
    expected: Option<u64>,
    transferred: u64,
    start: Instant,
    details: Option<LogDetails>,
    error: Option<String>,
}

impl DeliveryBody {
    fn new(inner: ChannelBody, expected: Option<u64>, details: LogDetails) -> Self {
        Self {
            inner,
            expected,
            transferred: 0,
            start: Instant::now(),
            details: Some(details),
            error: None,
        }
    }
}

impl Body for DeliveryBody {
    type Data = Bytes;
    type Error = PkgCacherError;

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.as_mut().project();

        match this.inner.poll_frame(cx) {
            std::task::Poll::Ready(Some(result)) => {
                match &result {
                    Ok(frame) => {
                        if let Some(data) = frame.data_ref() {
                            *this.transferred += data.len() as u64;
                        }
                    }
                    Err(err) => *this.error = Some(err.to_string()),
                }
                std::task::Poll::Ready(Some(result))
            }
            other => other,
        }
    }
}

#[pinned_drop]
impl PinnedDrop for DeliveryBody {
    fn drop(self: Pin<&mut Self>) {
        let expected = self.expected;
        let transferred = self.transferred;
        let duration = self.start.elapsed();
        let project = self.project();
        let details = project.details.take().expect("details set in new()");
        let error = project.error.take();

        tokio::task::spawn(async move {
            if expected.is_none_or(|e| e == transferred) {
                info!(
                    "Served {} ({}) to client {} in {} (size={}, rate={})",
                    details.basename,
                    details.status,
                    details.client.to_canonical(),
                    HumanFmt::Time(duration),
                    HumanFmt::Size(transferred),
                    HumanFmt::Rate(transferred, duration)
                );
            } else {
                warn!(
                    "Aborted serving {} to client {} after {} (transferred={}):  {}",
                    details.basename,
                    details.client.to_canonical(),
                    HumanFmt::Time(duration),
                    HumanFmt::Size(transferred),
                    error.unwrap_or_else(|| "client disconnect".to_string()),
                );
            }

            details
                .access_log
                .register(details.client, details.status, transferred, &details.basename)
                .await;
        });
    }
}

/// Reads one span of the body, following the writer past the current
/// end-of-file until the completion marker shows up.
async fn stream_span(
    file: &mut tokio::fs::File,
    marker: &std::path::Path,
    start: u64,
    length: Option<u64>,
    stall_timeout: Duration,
    tx: &tokio::sync::mpsc::Sender<Result<Bytes, PkgCacherError>>,
    basename: &str,
    client: IpAddr,
) -> Result<(), ()> {
    if let Err(err) = file.seek(std::io::SeekFrom::Start(start)).await {
        error!("Failed to seek body of {basename} to {start}:  {err}");
        let _ = tx.send(Err(err.into())).await;
        return Err(());
    }

    let mut remaining = length;
    let mut last_progress = Instant::now();
    let mut drained_after_complete = false;

    loop {
        if remaining == Some(0) {
            return Ok(());
        }

        let cap = remaining.map_or(READ_CHUNK, |r| r.min(READ_CHUNK as u64) as usize);
        let mut buf = BytesMut::with_capacity(cap);

        let n = match file.read_buf(&mut buf).await {
            Ok(n) => n,
            Err(err) => {
                error!("Failed to read body of {basename}:  {err}");
                let _ = tx.send(Err(err.into())).await;
                return Err(());
            }
        };

        if n == 0 {
            let complete = tokio::fs::try_exists(marker).await.unwrap_or(false);

            if complete {
                /* one extra read drains bytes racing the marker */
                if drained_after_complete {
                    match remaining {
                        None => return Ok(()),
                        Some(r) => {
                            debug!("Body of {basename} ended {r} bytes short");
                            let _ = tx
                                .send(Err(PkgCacherError::BodyTruncated {
                                    expected: length.unwrap_or(0),
                                    actual: length.unwrap_or(0) - r,
                                }))
                                .await;
                            return Err(());
                        }
                    }
                }
                drained_after_complete = true;
                continue;
            }

            if last_progress.elapsed() > stall_timeout {
                info!(
                    "Stall timeout following body of {basename} for client {}",
                    client.to_canonical()
                );
                let _ = tx
                    .send(Err(PkgCacherError::Stall(StallError {
                        timeout_secs: stall_timeout.as_secs(),
                        client_ip: Some(client),
                        basename: basename.to_string(),
                    })))
                    .await;
                return Err(());
            }

            tokio::time::sleep(FOLLOW_POLL).await;
            continue;
        }

        drained_after_complete = false;
        last_progress = Instant::now();
        if let Some(r) = &mut remaining {
            *r -= n as u64;
        }

        if tx.send(Ok(buf.freeze())).await.is_err() {
            debug!("Client {} stopped reading {basename}", client.to_canonical());
            return Err(());
        }
    }
}

async fn stream_task(
    mut file: tokio::fs::File,
    plan: Plan,
    marker: PathBuf,
    stall_timeout: Duration,
    tx: tokio::sync::mpsc::Sender<Result<Bytes, PkgCacherError>>,
    basename: String,
    client: IpAddr,
) {
    match plan {
        Plan::Whole { total } => {
            let _ = stream_span(
                &mut file,
                &marker,
                0,
                total,
                stall_timeout,
                &tx,
                &basename,
                client,
            )
            .await;
        }
        Plan::Single { part, total: _ } => {
            let _ = stream_span(
                &mut file,
                &marker,
                part.start,
                Some(part.len()),
                stall_timeout,
                &tx,
                &basename,
                client,
            )
            .await;
        }
        Plan::Multi {
            parts,
            preambles,
            epilogue,
            total_length: _,
        } => {
            for (part, preamble) in parts.iter().zip(preambles) {
                if tx.send(Ok(Bytes::from(preamble))).await.is_err() {
                    return;
                }

                if stream_span(
                    &mut file,
                    &marker,
                    part.start,
                    Some(part.len()),
                    stall_timeout,
                    &tx,
                    &basename,
                    client,
                )
                .await
                .is_err()
                {
                    return;
                }
            }

            let _ = tx.send(Ok(Bytes::from(epilogue))).await;
        }
    }
}

/// Emits the response for a coordinated entry.
#[expect(clippy::too_many_lines)]
pub(crate) async fn serve_entry(
    file: tokio::fs::File,
    paths: EntryPaths,
    sidecar: Option<Sidecar>,
    key: &ObjectKey,
    meta: &RequestMeta,
    log_status: CacheStatus,
    ctx: &ServeContext,
) -> Served {
    let sidecar = match sidecar {
        Some(s) => s,
        None => match await_sidecar(&paths, ctx.stall_timeout).await {
            SidecarWait::Ready(s) => s,
            SidecarWait::Crashed => return Served::RetryFetch,
            SidecarWait::Timeout => {
                info!(
                    "Timed out awaiting response header of {key} for client {}",
                    meta.client.to_canonical()
                );
                return Served::Response(crate::quick_response(
                    StatusCode::GATEWAY_TIMEOUT,
                    "Upstream fetch stalled",
                ));
            }
            SidecarWait::Failed(err) => {
                error!("Failed to read sidecar of {key}:  {err}");
                return Served::Response(crate::quick_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Cache access failure",
                ));
            }
        },
    };

    let forwarded = sanitize_headers(&sidecar);
    let total_length = sidecar.content_length();

    /* Non-200 shortcut: pass the stored upstream response through. */
    if sidecar.status != StatusCode::OK {
        debug!(
            "Passing through stored {} response of {key}",
            sidecar.status
        );
        ctx.access_log
            .register(meta.client, log_status, 0, &key.basename)
            .await;
        return Served::Response(assemble(
            ResponseSpec {
                status: sidecar.status,
                forwarded,
                content_length: Some(0),
                content_range: None,
                content_type_override: None,
                keepalive: false,
            },
            crate::empty(),
        ));
    }

    /* Conditional request: not newer than the client's copy. */
    if crate::coordinator::not_modified(&sidecar, meta.if_modified_since.as_deref()) {
        debug!("Cached {key} not newer than client copy, 304");
        ctx.access_log
            .register(meta.client, log_status, 0, &key.basename)
            .await;
        return Served::Response(assemble(
            ResponseSpec {
                status: StatusCode::NOT_MODIFIED,
                forwarded,
                content_length: None,
                content_range: None,
                content_type_override: None,
                keepalive: true,
            },
            crate::empty(),
        ));
    }

    if meta.head_only {
        ctx.access_log
            .register(meta.client, log_status, 0, &key.basename)
            .await;
        return Served::Response(assemble(
            ResponseSpec {
                status: StatusCode::OK,
                forwarded,
                content_length: total_length,
                content_range: None,
                content_type_override: None,
                keepalive: true,
            },
            crate::empty(),
        ));
    }

    /* Range evaluation needs the authoritative total; while a chunked
     * fetch is still running there is none and the full body wins. */
    let outcome = match total_length {
        Some(total) => http_parse_ranges(meta.range.as_deref(), meta.if_range.as_deref(), total),
        None => RangeOutcome::Full,
    };

    let content_type = sidecar.get("content-type").map(ToOwned::to_owned);

    let (plan, spec) = match outcome {
        RangeOutcome::Unsatisfiable => {
            let total = total_length.expect("ranges only evaluated with a total");
            info!(
                "Unsatisfiable range `{}` for {key} (total={total})",
                meta.range.as_deref().unwrap_or_default()
            );
            ctx.access_log
                .register(meta.client, log_status, 0, &key.basename)
                .await;
            return Served::Response(assemble(
                ResponseSpec {
                    status: StatusCode::RANGE_NOT_SATISFIABLE,
                    forwarded,
                    content_length: Some(0),
                    content_range: Some(format!("bytes */{total}")),
                    content_type_override: None,
                    keepalive: true,
                },
                crate::empty(),
            ));
        }
        RangeOutcome::Full => (
            Plan::Whole {
                total: total_length,
            },
            ResponseSpec {
                status: StatusCode::OK,
                forwarded,
                content_length: total_length,
                content_range: None,
                content_type_override: None,
                keepalive: true,
            },
        ),
        RangeOutcome::Partial(mut parts) => {
            let total = total_length.expect("ranges only evaluated with a total");

            if parts.len() == 1 {
                let part = parts.pop().expect("one part");
                (
                    Plan::Single { part, total },
                    ResponseSpec {
                        status: StatusCode::PARTIAL_CONTENT,
                        forwarded,
                        content_length: Some(part.len()),
                        content_range: Some(part.content_range(total)),
                        content_type_override: None,
                        keepalive: true,
                    },
                )
            } else {
                let mut rng = SmallRng::from_os_rng();
                let boundary: String = (&mut rng)
                    .sample_iter(Alphanumeric)
                    .take(24)
                    .map(char::from)
                    .collect();

                let plan = multipart_plan(parts, total, content_type.as_deref(), &boundary);
                let Plan::Multi { total_length, .. } = &plan else {
                    unreachable!("multipart_plan returns Plan::Multi");
                };

                let spec = ResponseSpec {
                    status: StatusCode::PARTIAL_CONTENT,
                    forwarded,
                    content_length: Some(*total_length),
                    content_range: None,
                    content_type_override: Some(format!(
                        "multipart/byteranges; boundary={boundary}"
                    )),
                    keepalive: true,
                };
                (plan, spec)
            }
        }
    };

    let expected = spec.content_length;

    let (tx, rx) = tokio::sync::mpsc::channel(64);

    tokio::task::spawn(stream_task(
        file,
        plan,
        paths.marker.clone(),
        ctx.stall_timeout,
        tx,
        key.basename.clone(),
        meta.client,
    ));

    let channel_body = ChannelBody::new(rx, expected);
    let delivery_body = DeliveryBody::new(
        channel_body,
        expected,
        LogDetails {
            access_log: ctx.access_log.clone(),
            client: meta.client,
            status: log_status,
            basename: key.basename.clone(),
        },
    );

    Served::Response(assemble(spec, BoxBody::new(delivery_body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sidecar(text: &str) -> Sidecar {
        Sidecar::parse(text).unwrap()
    }

    #[test]
    fn sanitize_keeps_cache_relevant_headers() {
        let s = sidecar(
            "HTTP/1.1 200 OK\r\n\
             Connection: keep-alive\r\n\
             Content-Length: 100\r\n\
             Content-Type: application/vnd.debian.binary-package\r\n\
             Transfer-Encoding: chunked\r\n\
             Last-Modified: Thu, 01 Jan 1970 00:00:00 GMT\r\n\
             ETag: \"abc123\"\r\n\
             Age: 12\r\n\
             Accept-Ranges: bytes\r\n\
             X-Served-By: cache-ams1\r\n\
             \r\n",
        );

        let kept = sanitize_headers(&s);
        let names: Vec<&str> = kept.iter().map(|(n, _)| n.as_str()).collect();

        assert!(names.contains(&"content-type"));
        assert!(names.contains(&"last-modified"));
        assert!(names.contains(&"etag"));
        assert!(names.contains(&"age"));
        assert!(names.contains(&"accept-ranges"));

        /* hop-by-hop and noise dropped, content-length extracted apart */
        assert!(!names.contains(&"connection"));
        assert!(!names.contains(&"transfer-encoding"));
        assert!(!names.contains(&"content-length"));
        assert!(!names.contains(&"x-served-by"));
    }

    #[test]
    fn multipart_framing_length() {
        let parts = vec![
            ByteRange { start: 0, end: 9 },
            ByteRange {
                start: 100,
                end: 109,
            },
        ];

        let plan = multipart_plan(parts, 1000, Some("text/plain"), "BOUND");
        let Plan::Multi {
            parts,
            preambles,
            epilogue,
            total_length,
        } = plan
        else {
            panic!("expected multi plan");
        };

        let body_len: u64 = preambles.iter().map(|p| p.len() as u64).sum::<u64>()
            + parts.iter().map(ByteRange::len).sum::<u64>()
            + epilogue.len() as u64;
        assert_eq!(total_length, body_len);

        assert!(preambles[0].starts_with("--BOUND\r\n"));
        assert!(preambles[1].starts_with("\r\n--BOUND\r\n"));
        assert!(preambles[0].contains("Content-Range: bytes 0-9/1000"));
        assert!(preambles[1].contains("Content-Range: bytes 100-109/1000"));
        assert!(epilogue.ends_with("--BOUND--\r\n"));
    }

    #[tokio::test]
    async fn stream_follows_growing_file() {
        use tokio::io::AsyncWriteExt;

        let dir = tempfile::tempdir().unwrap();
        let body_path = dir.path().join("body");
        let marker_path = dir.path().join("marker");

        let mut writer = tokio::fs::File::create(&body_path).await.unwrap();
        writer.write_all(b"hello ").await.unwrap();
        writer.flush().await.unwrap();

        let reader = tokio::fs::File::open(&body_path).await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);

        let marker_clone = marker_path.clone();
        let handle = tokio::task::spawn(stream_task(
            reader,
            Plan::Whole { total: Some(11) },
            marker_clone,
            Duration::from_secs(5),
            tx,
            "test".to_string(),
            "127.0.0.1".parse().unwrap(),
        ));

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(&first[..], b"hello ");

        /* writer appends while the reader waits at end-of-file */
        tokio::time::sleep(Duration::from_millis(150)).await;
        writer.write_all(b"world").await.unwrap();
        writer.flush().await.unwrap();
        tokio::fs::write(&marker_path, b"http://src").await.unwrap();

        let mut rest = Vec::new();
        while let Some(chunk) = rx.recv().await {
            rest.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(&rest[..], b"world");

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn stream_single_range_of_complete_file() {
        let dir = tempfile::tempdir().unwrap();
        let body_path = dir.path().join("body");
        let marker_path = dir.path().join("marker");

        tokio::fs::write(&body_path, b"0123456789").await.unwrap();
        tokio::fs::write(&marker_path, b"src").await.unwrap();

        let reader = tokio::fs::File::open(&body_path).await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);

        tokio::task::spawn(stream_task(
            reader,
            Plan::Single {
                part: ByteRange { start: 2, end: 5 },
                total: 10,
            },
            marker_path,
            Duration::from_secs(5),
            tx,
            "test".to_string(),
            "127.0.0.1".parse().unwrap(),
        ));

        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(&out[..], b"2345");
    }
}
