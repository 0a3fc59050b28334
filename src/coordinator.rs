//! Cache coordinator.
//!
//! Computes the cache status of a request, enforces at-most-one
//! concurrent fetcher per object through the body-file lock, and hands
//! the streaming reader either a complete file or one that a fetcher is
//! still writing. All multi-path state transitions happen under the
//! global lock; the revalidation HEAD is issued before acquiring it.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;

use hyper::StatusCode;
use log::debug;
use log::error;
use log::info;
use log::warn;

use crate::accesslog::CacheStatus;
use crate::config::Reloadable;
use crate::error::PkgCacherError;
use crate::fetcher;
use crate::http_range::http_datetime_to_systemtime;
use crate::lock::BodyProbe;
use crate::lock::GlobalLock;
use crate::resource::FileKind;
use crate::resource::ObjectKey;
use crate::store;
use crate::store::EntryPaths;
use crate::store::Sidecar;

/// What the streaming reader receives from the coordinator.
#[derive(Debug)]
pub(crate) enum Decision {
    /// The entry is complete; the sidecar was read under the global lock.
    Complete {
        file: tokio::fs::File,
        sidecar: Sidecar,
        paths: EntryPaths,
        log_status: CacheStatus,
    },
    /// A fetcher is writing the entry; the reader follows the file and
    /// awaits the sidecar itself.
    Follow {
        file: tokio::fs::File,
        paths: EntryPaths,
        log_status: CacheStatus,
    },
    /// Terminal condition, answered with a plain status response.
    Refuse(StatusCode, &'static str),
}

/// Index freshness against the origin: age expiry first, then validator
/// comparison via a HEAD, network failure meaning "serve stale".
async fn index_freshness(
    client: &fetcher::Client,
    reloadable: &Reloadable,
    key: &ObjectKey,
    paths: &EntryPaths,
    sidecar: &Sidecar,
) -> CacheStatus {
    if reloadable.expire_hours > 0 {
        let age_limit = std::time::Duration::from_secs(u64::from(reloadable.expire_hours) * 3600);
        let expired = tokio::fs::metadata(&paths.body)
            .await
            .ok()
            .and_then(|md| md.modified().ok())
            .and_then(|mtime| mtime.elapsed().ok())
            .is_some_and(|age| age > age_limit);

        if expired {
            debug!("Index {key} exceeded expire_hours={}", reloadable.expire_hours);
            return CacheStatus::Expired;
        }
    }

    let (status, headers) = match fetcher::head_object(client, reloadable, key).await {
        Ok(r) => r,
        Err(err) => {
            info!("Revalidation HEAD for {key} failed, serving stale:  {err}");
            return CacheStatus::Offline;
        }
    };

    debug!("Revalidation HEAD for {key} answered {status}");

    if reloadable.use_etags {
        let cached_etag = sidecar.get("etag");
        let upstream_etag = headers.get(hyper::header::ETAG).and_then(|v| v.to_str().ok());

        if let (Some(cached), Some(upstream)) = (cached_etag, upstream_etag) {
            return if cached == upstream {
                CacheStatus::Hit
            } else {
                debug!("ETag changed for {key}: `{cached}` -> `{upstream}`");
                CacheStatus::Expired
            };
        }
    }

    let cached_modified = sidecar
        .get("last-modified")
        .and_then(http_datetime_to_systemtime);
    let upstream_modified = headers
        .get(hyper::header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(http_datetime_to_systemtime);

    match (cached_modified, upstream_modified) {
        (Some(cached), Some(upstream)) => {
            if cached >= upstream {
                CacheStatus::Hit
            } else {
                debug!("Upstream copy of {key} is newer");
                CacheStatus::Expired
            }
        }
        _ => {
            /* no validators at all; behaviour is configurable */
            if reloadable.expire_on_missing_validators {
                CacheStatus::Expired
            } else {
                CacheStatus::Hit
            }
        }
    }
}

/// Computes the cache status before any state transition. Never called
/// while holding the global lock: the revalidation HEAD is network I/O.
async fn compute_status(
    client: &fetcher::Client,
    reloadable: &Reloadable,
    key: &ObjectKey,
    kind: FileKind,
    paths: &EntryPaths,
    client_no_cache: bool,
) -> CacheStatus {
    let sidecar = match store::read_sidecar(&paths.header).await {
        Ok(s) => s,
        Err(err) => {
            warn!("Unreadable sidecar for {key}, treating as miss:  {err}");
            None
        }
    };

    let Some(sidecar) = sidecar else {
        return CacheStatus::Miss;
    };
    if !paths.body.exists() || !paths.is_complete() {
        return CacheStatus::Miss;
    }

    if client_no_cache {
        debug!("Client forced refresh of {key}");
        return CacheStatus::Expired;
    }

    if kind == FileKind::Static {
        return CacheStatus::Hit;
    }

    if reloadable.offline_mode {
        /* complete copy, never ask upstream */
        return CacheStatus::Hit;
    }

    index_freshness(client, reloadable, key, paths, &sidecar).await
}

/// The decision-to-fetch path of the cache coordinator. Re-entered by
/// the handler when a reader observed a crashed fetcher.
pub(crate) async fn coordinate(
    client: &fetcher::Client,
    reloadable: &Arc<Reloadable>,
    cache_dir: &std::path::Path,
    key: &ObjectKey,
    kind: FileKind,
    client_ip: IpAddr,
    client_no_cache: bool,
) -> Result<Decision, PkgCacherError> {
    let paths = EntryPaths::new(cache_dir, key);

    let status = compute_status(client, reloadable, key, kind, &paths, client_no_cache).await;

    debug!("Cache status of {key}: {status}");

    if reloadable.offline_mode && status != CacheStatus::Hit {
        return Ok(Decision::Refuse(
            StatusCode::SERVICE_UNAVAILABLE,
            "Offline mode and not cached",
        ));
    }

    /* State transitions below run under the global lock and never block
     * on the network. */
    let lock = GlobalLock::acquire(cache_dir).await.map_err(|err| {
        error!("Failed to acquire global lock:  {err}");
        err
    })?;

    match status {
        CacheStatus::Hit | CacheStatus::Offline => {
            if paths.is_complete() {
                let file = tokio::fs::File::open(&paths.body).await?;
                let sidecar = store::read_sidecar(&paths.header)
                    .await?
                    .ok_or_else(|| PkgCacherError::BadSidecar("vanished under lock".to_string()))?;
                drop(lock);

                return Ok(Decision::Complete {
                    file,
                    sidecar,
                    paths,
                    log_status: status,
                });
            }
            /* entry vanished between status computation and the lock */
            debug!("Entry {key} vanished before serving, refetching");
        }
        CacheStatus::Expired => {
            /* invalidate only while the stale complete entry is still
             * there; a sibling may have unlinked and re-created it
             * between our freshness check and this lock */
            if paths.is_complete() {
                store::unlink_entry(&paths)?;
            }
        }
        CacheStatus::Miss => (),
    }

    /* MISS or invalidated: decide who fetches. */

    if paths.body.exists() && !paths.is_complete() {
        match crate::lock::probe_body_lock(&paths.body) {
            Ok(BodyProbe::FetcherActive) => {
                /* another fetcher is running: follow its writes */
                let file = tokio::fs::File::open(&paths.body).await?;
                drop(lock);

                debug!("Following concurrent fetch of {key}");
                return Ok(Decision::Follow {
                    file,
                    paths,
                    log_status: status,
                });
            }
            Ok(BodyProbe::Unlocked) => {
                /* previous fetch crashed between creation and commit */
                info!("Removing crashed partial entry {key}");
                store::unlink_entry(&paths)?;
            }
            Err(err) => {
                warn!("Body lock probe for {key} failed:  {err}");
                store::unlink_entry(&paths)?;
            }
        }
    }

    /* We are the fetcher. */
    let entry = match store::create_entry(cache_dir, key) {
        Ok(e) => e,
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            /* lost a cross-process race; the winner is fetching */
            let file = tokio::fs::File::open(&paths.body).await?;
            drop(lock);

            return Ok(Decision::Follow {
                file,
                paths,
                log_status: status,
            });
        }
        Err(err) => {
            error!("Failed to create entry {key}:  {err}");
            return Err(err.into());
        }
    };

    let reader_file = tokio::fs::File::open(&paths.body).await?;

    drop(lock);

    tokio::task::spawn(fetcher::fetch_object(
        client.clone(),
        Arc::clone(reloadable),
        cache_dir.to_path_buf(),
        key.clone(),
        entry,
        client_ip,
        client_no_cache,
    ));

    Ok(Decision::Follow {
        file: reader_file,
        paths,
        log_status: status,
    })
}

/// Compares a client's `If-Modified-Since` against the cached copy.
/// Not-newer cached content yields a `304`.
#[must_use]
pub(crate) fn not_modified(sidecar: &Sidecar, if_modified_since: Option<&str>) -> bool {
    let Some(ims) = if_modified_since.and_then(http_datetime_to_systemtime) else {
        return false;
    };

    let cached: Option<SystemTime> = sidecar
        .get("last-modified")
        .and_then(http_datetime_to_systemtime);

    cached.is_some_and(|cached| cached <= ims)
}

#[cfg(test)]
mod e2e {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use http_body_util::BodyExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::accesslog::AccessLog;
    use crate::delivery;
    use crate::delivery::RequestMeta;
    use crate::delivery::Served;
    use crate::resource::FileKind;

    struct MockUpstream {
        addr: std::net::SocketAddr,
        get_count: Arc<AtomicUsize>,
        head_count: Arc<AtomicUsize>,
    }

    /// A single-purpose origin: answers every request on a fresh
    /// connection with whatever `respond` renders for the method.
    async fn mock_upstream<F>(respond: F) -> MockUpstream
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let get_count = Arc::new(AtomicUsize::new(0));
        let head_count = Arc::new(AtomicUsize::new(0));

        let gets = get_count.clone();
        let heads = head_count.clone();
        tokio::task::spawn(async move {
            loop {
                let Ok((mut stream, _peer)) = listener.accept().await else {
                    return;
                };

                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }

                let head = String::from_utf8_lossy(&buf);
                let method = head.split(' ').next().unwrap_or("").to_string();
                match method.as_str() {
                    "GET" => gets.fetch_add(1, Ordering::SeqCst),
                    "HEAD" => heads.fetch_add(1, Ordering::SeqCst),
                    _ => 0,
                };

                let response = respond(&method);
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.flush().await;
            }
        });

        MockUpstream {
            addr,
            get_count,
            head_count,
        }
    }

    fn test_reloadable(upstream: std::net::SocketAddr, use_etags: bool) -> Arc<Reloadable> {
        let mut path_map = HashMap::new();
        path_map.insert("debian".to_string(), vec![upstream.to_string()]);

        Arc::new(Reloadable {
            path_map,
            allowed_hosts: Vec::new(),
            denied_hosts: Vec::new(),
            allowed_hosts_6: Vec::new(),
            denied_hosts_6: Vec::new(),
            offline_mode: false,
            expire_hours: 0,
            use_etags,
            expire_on_missing_validators: false,
            http_proxy: None,
            https_proxy: None,
            use_proxy: false,
            http_proxy_auth: None,
            https_proxy_auth: None,
            use_proxy_auth: false,
            require_valid_ssl: false,
            limit: None,
            fetch_timeout: std::time::Duration::from_secs(5),
            use_interface: None,
            debug: false,
        })
    }

    fn static_key() -> ObjectKey {
        ObjectKey {
            vhost: "debian".to_string(),
            uri: "pool/main/f/foo/foo_1.0.deb".to_string(),
            basename: "foo_1.0.deb".to_string(),
        }
    }

    fn index_key() -> ObjectKey {
        ObjectKey {
            vhost: "debian".to_string(),
            uri: "dists/sid/main/binary-amd64/Packages.gz".to_string(),
            basename: "Packages.gz".to_string(),
        }
    }

    fn meta(client: &str) -> RequestMeta {
        RequestMeta {
            head_only: false,
            range: None,
            if_range: None,
            if_modified_since: None,
            client: client.parse().unwrap(),
        }
    }

    async fn run_request(
        client: &fetcher::Client,
        reloadable: &Arc<Reloadable>,
        cache_dir: &std::path::Path,
        logdir: &std::path::Path,
        key: &ObjectKey,
        kind: FileKind,
    ) -> (CacheStatus, hyper::StatusCode, Vec<u8>) {
        let ctx = delivery::ServeContext {
            access_log: AccessLog::open(logdir).unwrap(),
            stall_timeout: std::time::Duration::from_secs(5),
        };
        let request_meta = meta("127.0.0.1");

        let decision = coordinate(
            client,
            reloadable,
            cache_dir,
            key,
            kind,
            request_meta.client,
            false,
        )
        .await
        .unwrap();

        let (file, paths, sidecar, log_status) = match decision {
            Decision::Complete {
                file,
                sidecar,
                paths,
                log_status,
            } => (file, paths, Some(sidecar), log_status),
            Decision::Follow {
                file,
                paths,
                log_status,
            } => (file, paths, None, log_status),
            Decision::Refuse(status, message) => panic!("refused: {status} {message}"),
        };

        let served =
            delivery::serve_entry(file, paths, sidecar, key, &request_meta, log_status, &ctx).await;

        let response = match served {
            Served::Response(r) => r,
            Served::RetryFetch => panic!("unexpected retry sentinel"),
        };

        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();

        (log_status, status, body.to_vec())
    }

    fn ok_response(body: &str, validators: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{validators}Connection: close\r\n\r\n{body}",
            body.len()
        )
    }

    /// The reader can drain the body slightly before the fetch task
    /// writes the completion marker; wait for the commit.
    async fn wait_complete(cache_dir: &std::path::Path, key: &ObjectKey) {
        let paths = EntryPaths::new(cache_dir, key);
        for _ in 0..100 {
            if paths.is_complete() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("entry {key} was never committed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cold_miss_then_warm_hit() {
        let cache = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        crate::store::setup_layout(cache.path()).unwrap();

        let body = "deadbeef-package-bytes".repeat(64);
        let canned = body.clone();
        let upstream = mock_upstream(move |method| {
            if method == "GET" {
                ok_response(&canned, "Last-Modified: Tue, 01 Jan 2024 00:00:00 GMT\r\n")
            } else {
                "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_string()
            }
        })
        .await;

        let reloadable = test_reloadable(upstream.addr, false);
        let client = fetcher::build_client(&reloadable).unwrap();
        let key = static_key();

        let (status, http_status, served) = run_request(
            &client,
            &reloadable,
            cache.path(),
            logs.path(),
            &key,
            FileKind::Static,
        )
        .await;
        assert_eq!(status, CacheStatus::Miss);
        assert_eq!(http_status, hyper::StatusCode::OK);
        assert_eq!(served, body.as_bytes());
        assert_eq!(upstream.get_count.load(Ordering::SeqCst), 1);

        /* marker implies the committed length matches the header */
        wait_complete(cache.path(), &key).await;
        let paths = EntryPaths::new(cache.path(), &key);
        assert!(paths.is_complete());

        let (status, http_status, served) = run_request(
            &client,
            &reloadable,
            cache.path(),
            logs.path(),
            &key,
            FileKind::Static,
        )
        .await;
        assert_eq!(status, CacheStatus::Hit);
        assert_eq!(http_status, hyper::StatusCode::OK);
        assert_eq!(served, body.as_bytes());

        /* a warm hit issues no upstream call at all */
        assert_eq!(upstream.get_count.load(Ordering::SeqCst), 1);
        assert_eq!(upstream.head_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_clients_share_one_fetch() {
        let cache = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        crate::store::setup_layout(cache.path()).unwrap();

        /* upstream trickles the body so the second client arrives
         * while the download is in flight */
        let body = "0123456789abcdef".repeat(256);
        let (first, second) = body.split_at(body.len() / 2);
        let (first, second) = (first.to_string(), second.to_string());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let get_count = Arc::new(AtomicUsize::new(0));

        let gets = get_count.clone();
        let total = body.len();
        tokio::task::spawn(async move {
            loop {
                let Ok((mut stream, _peer)) = listener.accept().await else {
                    return;
                };
                let mut chunk = [0u8; 1024];
                let mut buf = Vec::new();
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                gets.fetch_add(1, Ordering::SeqCst);

                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {total}\r\nConnection: close\r\n\r\n"
                );
                let _ = stream.write_all(head.as_bytes()).await;
                let _ = stream.write_all(first.as_bytes()).await;
                let _ = stream.flush().await;
                tokio::time::sleep(std::time::Duration::from_millis(300)).await;
                let _ = stream.write_all(second.as_bytes()).await;
                let _ = stream.flush().await;
            }
        });

        let reloadable = test_reloadable(addr, false);
        let client = fetcher::build_client(&reloadable).unwrap();
        let key = static_key();

        let task_a = {
            let client = client.clone();
            let reloadable = reloadable.clone();
            let cache_dir = cache.path().to_path_buf();
            let logdir = logs.path().to_path_buf();
            let key = key.clone();
            tokio::task::spawn(async move {
                run_request(
                    &client,
                    &reloadable,
                    &cache_dir,
                    &logdir,
                    &key,
                    FileKind::Static,
                )
                .await
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let task_b = {
            let client = client.clone();
            let reloadable = reloadable.clone();
            let cache_dir = cache.path().to_path_buf();
            let logdir = logs.path().to_path_buf();
            let key = key.clone();
            tokio::task::spawn(async move {
                run_request(
                    &client,
                    &reloadable,
                    &cache_dir,
                    &logdir,
                    &key,
                    FileKind::Static,
                )
                .await
            })
        };

        let (_status_a, http_a, body_a) = task_a.await.unwrap();
        let (_status_b, http_b, body_b) = task_b.await.unwrap();

        assert_eq!(http_a, hyper::StatusCode::OK);
        assert_eq!(http_b, hyper::StatusCode::OK);
        assert_eq!(body_a, body.as_bytes());
        assert_eq!(body_b, body.as_bytes());

        /* exactly one upstream transfer despite two clients */
        assert_eq!(get_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn index_revalidation_hit_and_etag_expiry() {
        let cache = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        crate::store::setup_layout(cache.path()).unwrap();

        let generation = Arc::new(AtomicUsize::new(0));
        let generation_clone = generation.clone();
        let upstream = mock_upstream(move |method| {
            let generation = generation_clone.load(Ordering::SeqCst);
            let etag = format!("\"gen-{generation}\"");
            let validators = format!(
                "Last-Modified: Tue, 01 Jan 2024 00:00:00 GMT\r\nETag: {etag}\r\n"
            );
            if method == "HEAD" {
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n{validators}Connection: close\r\n\r\n"
                )
            } else {
                ok_response(&format!("index-generation-{generation}"), &validators)
            }
        })
        .await;

        let reloadable = test_reloadable(upstream.addr, true);
        let client = fetcher::build_client(&reloadable).unwrap();
        let key = index_key();

        /* prime the cache */
        let (status, _http, body) = run_request(
            &client,
            &reloadable,
            cache.path(),
            logs.path(),
            &key,
            FileKind::Index,
        )
        .await;
        assert_eq!(status, CacheStatus::Miss);
        assert_eq!(body, b"index-generation-0");
        assert_eq!(upstream.get_count.load(Ordering::SeqCst), 1);
        wait_complete(cache.path(), &key).await;

        /* unchanged validators: HIT via revalidation HEAD, no body GET */
        let (status, _http, body) = run_request(
            &client,
            &reloadable,
            cache.path(),
            logs.path(),
            &key,
            FileKind::Index,
        )
        .await;
        assert_eq!(status, CacheStatus::Hit);
        assert_eq!(body, b"index-generation-0");
        assert_eq!(upstream.head_count.load(Ordering::SeqCst), 1);
        assert_eq!(upstream.get_count.load(Ordering::SeqCst), 1);

        /* upstream changed: ETag mismatch forces a refresh */
        generation.store(1, Ordering::SeqCst);

        let (status, _http, body) = run_request(
            &client,
            &reloadable,
            cache.path(),
            logs.path(),
            &key,
            FileKind::Index,
        )
        .await;
        assert_eq!(status, CacheStatus::Expired);
        assert_eq!(body, b"index-generation-1");
        assert_eq!(upstream.get_count.load(Ordering::SeqCst), 2);

        wait_complete(cache.path(), &key).await;
        let paths = EntryPaths::new(cache.path(), &key);
        assert!(paths.is_complete());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn crashed_partial_entry_is_refetched() {
        let cache = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        crate::store::setup_layout(cache.path()).unwrap();

        let body = "recovered-content".to_string();
        let canned = body.clone();
        let upstream = mock_upstream(move |_method| ok_response(&canned, "")).await;

        let reloadable = test_reloadable(upstream.addr, false);
        let client = fetcher::build_client(&reloadable).unwrap();
        let key = static_key();

        /* simulate a fetcher that died mid-download: partial body, no
         * completion marker, no live lock holder */
        let paths = EntryPaths::new(cache.path(), &key);
        std::fs::create_dir_all(paths.body.parent().unwrap()).unwrap();
        std::fs::write(&paths.body, b"partial garbage").unwrap();

        let (status, http_status, served) = run_request(
            &client,
            &reloadable,
            cache.path(),
            logs.path(),
            &key,
            FileKind::Static,
        )
        .await;

        assert_eq!(status, CacheStatus::Miss);
        assert_eq!(http_status, hyper::StatusCode::OK);
        assert_eq!(served, body.as_bytes());
        assert_eq!(upstream.get_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn offline_mode_refuses_uncached() {
        let cache = tempfile::tempdir().unwrap();
        crate::store::setup_layout(cache.path()).unwrap();

        let mut reloadable = (*test_reloadable(
            std::net::SocketAddr::from(([127, 0, 0, 1], 1)),
            false,
        ))
        .clone();
        reloadable.offline_mode = true;
        let reloadable = Arc::new(reloadable);

        let client = fetcher::build_client(&reloadable).unwrap();

        let decision = coordinate(
            &client,
            &reloadable,
            cache.path(),
            &static_key(),
            FileKind::Static,
            "127.0.0.1".parse().unwrap(),
            false,
        )
        .await
        .unwrap();

        assert!(matches!(
            decision,
            Decision::Refuse(StatusCode::SERVICE_UNAVAILABLE, _)
        ));
    }
}
