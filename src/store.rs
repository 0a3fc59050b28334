//! On-disk content store.
//!
//! Each object key owns three sibling paths below the cache root: the raw
//! body under `packages/`, the HTTP header sidecar under `headers/` and a
//! completion marker under `private/`. Identical bodies are deduplicated
//! through hard links into the content-addressed pool `cache/`.

use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;

use hyper::StatusCode;
use log::debug;
use log::warn;
use rand::Rng;
use rand::SeedableRng;
use rand::distr::Alphanumeric;
use rand::rngs::SmallRng;
use sha1::Digest;
use sha1::Sha1;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;

use crate::lock::BodyLock;
use crate::resource::ObjectKey;

pub(crate) const PACKAGES_DIR: &str = "packages";
pub(crate) const HEADERS_DIR: &str = "headers";
pub(crate) const PRIVATE_DIR: &str = "private";
pub(crate) const POOL_DIR: &str = "cache";
pub(crate) const TEMP_DIR: &str = "temp";

const COMPLETE_SUFFIX: &str = ".complete";

/// The three sibling paths of one cache entry.
#[derive(Clone, Debug)]
pub(crate) struct EntryPaths {
    pub(crate) body: PathBuf,
    pub(crate) header: PathBuf,
    pub(crate) marker: PathBuf,
}

impl EntryPaths {
    #[must_use]
    pub(crate) fn new(cache_dir: &Path, key: &ObjectKey) -> Self {
        let body: PathBuf = [
            cache_dir,
            Path::new(PACKAGES_DIR),
            Path::new(&key.vhost),
            Path::new(&key.uri),
        ]
        .iter()
        .collect();

        let header: PathBuf = [
            cache_dir,
            Path::new(HEADERS_DIR),
            Path::new(&key.vhost),
            Path::new(&key.uri),
        ]
        .iter()
        .collect();

        let marker: PathBuf = [
            cache_dir,
            Path::new(PRIVATE_DIR),
            Path::new(&key.vhost),
            Path::new(&format!("{}{COMPLETE_SUFFIX}", key.uri)),
        ]
        .iter()
        .collect();

        Self {
            body,
            header,
            marker,
        }
    }

    #[must_use]
    pub(crate) fn is_complete(&self) -> bool {
        self.marker.exists()
    }
}

#[must_use]
pub(crate) fn pool_path(cache_dir: &Path, basename: &str, digest: &str) -> PathBuf {
    [
        cache_dir,
        Path::new(POOL_DIR),
        Path::new(&format!("{basename}.{digest}")),
    ]
    .iter()
    .collect()
}

#[must_use]
pub(crate) fn temp_dir(cache_dir: &Path) -> PathBuf {
    cache_dir.join(TEMP_DIR)
}

/// Creates the top-level layout at startup and empties the scratch
/// directory.
pub(crate) fn setup_layout(cache_dir: &Path) -> anyhow::Result<()> {
    use anyhow::Context as _;

    for dir in [PACKAGES_DIR, HEADERS_DIR, PRIVATE_DIR, POOL_DIR, TEMP_DIR] {
        let path = cache_dir.join(dir);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create directory `{}`", path.display()))?;
    }

    let scratch = temp_dir(cache_dir);
    for entry in std::fs::read_dir(&scratch)
        .with_context(|| format!("Failed to list directory `{}`", scratch.display()))?
    {
        let entry_path = entry?.path();
        debug!("Removing stale scratch file `{}`", entry_path.display());
        std::fs::remove_file(&entry_path)
            .with_context(|| format!("Failed to remove entry `{}`", entry_path.display()))?;
    }

    Ok(())
}

/// A freshly created entry, owned by the fetcher.
#[derive(Debug)]
pub(crate) struct CreatedEntry {
    pub(crate) writer: tokio::fs::File,
    pub(crate) lock: BodyLock,
    pub(crate) paths: EntryPaths,
}

/// Creates an empty entry. The caller must hold the global lock; the
/// exclusive body-file creation doubles as a double-create guard.
pub(crate) fn create_entry(cache_dir: &Path, key: &ObjectKey) -> std::io::Result<CreatedEntry> {
    let paths = EntryPaths::new(cache_dir, key);

    for path in [&paths.body, &paths.header, &paths.marker] {
        let parent = path.parent().expect("entry paths have parents");
        std::fs::create_dir_all(parent)?;
    }

    let body = std::fs::File::options()
        .create_new(true)
        .write(true)
        .read(true)
        .open(&paths.body)?;

    let lock = BodyLock::lock(&body)?;

    Ok(CreatedEntry {
        writer: tokio::fs::File::from_std(body),
        lock,
        paths,
    })
}

/// Removes an entry's three paths. Absent paths are not an error; open
/// readers keep their handles.
pub(crate) fn unlink_entry(paths: &EntryPaths) -> std::io::Result<()> {
    for path in [&paths.body, &paths.header, &paths.marker] {
        match std::fs::remove_file(path) {
            Ok(()) => (),
            Err(err) if err.kind() == ErrorKind::NotFound => (),
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Removes only the body path, keeping the sidecar so readers observe a
/// persisted error response.
pub(crate) fn unlink_body_only(paths: &EntryPaths) -> std::io::Result<()> {
    for path in [&paths.body, &paths.marker] {
        match std::fs::remove_file(path) {
            Ok(()) => (),
            Err(err) if err.kind() == ErrorKind::NotFound => (),
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// The parsed header sidecar: the exact status line and header fields
/// as received from upstream.
#[derive(Clone, Debug)]
pub(crate) struct Sidecar {
    pub(crate) status: StatusCode,
    pub(crate) headers: Vec<(String, String)>,
}

impl Sidecar {
    #[must_use]
    pub(crate) fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub(crate) fn content_length(&self) -> Option<u64> {
        self.get("content-length").and_then(|v| v.parse().ok())
    }

    pub(crate) fn parse(text: &str) -> Result<Self, crate::error::PkgCacherError> {
        use crate::error::PkgCacherError;

        let mut lines = text.lines();

        let status_line = lines
            .next()
            .ok_or_else(|| PkgCacherError::BadSidecar("empty".to_string()))?;

        let mut parts = status_line.splitn(3, ' ');
        let version = parts
            .next()
            .ok_or_else(|| PkgCacherError::BadSidecar(status_line.to_string()))?;
        if !version.starts_with("HTTP/") {
            return Err(PkgCacherError::BadSidecar(status_line.to_string()));
        }
        let status = parts
            .next()
            .and_then(|c| c.parse::<u16>().ok())
            .and_then(|c| StatusCode::from_u16(c).ok())
            .ok_or_else(|| PkgCacherError::BadSidecar(status_line.to_string()))?;

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(PkgCacherError::BadSidecar(line.to_string()));
            };
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self { status, headers })
    }
}

/// Renders a response head into the sidecar wire format: the raw status
/// line first, then the header lines as received.
#[must_use]
pub(crate) fn format_sidecar(
    version: hyper::Version,
    status: StatusCode,
    headers: &hyper::HeaderMap,
) -> String {
    let mut out = String::with_capacity(256);

    let version = match version {
        hyper::Version::HTTP_10 => "HTTP/1.0",
        hyper::Version::HTTP_2 => "HTTP/2.0",
        _ => "HTTP/1.1",
    };

    out.push_str(version);
    out.push(' ');
    out.push_str(status.as_str());
    if let Some(reason) = status.canonical_reason() {
        out.push(' ');
        out.push_str(reason);
    }
    out.push_str("\r\n");

    for (name, value) in headers {
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(value.to_str().unwrap_or_default());
        out.push_str("\r\n");
    }
    out.push_str("\r\n");

    out
}

/// Reads and parses a sidecar. Returns `None` while the file is absent
/// or still empty (the fetcher has not committed a response yet).
pub(crate) async fn read_sidecar(
    path: &Path,
) -> Result<Option<Sidecar>, crate::error::PkgCacherError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(t) => t,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    if text.is_empty() {
        return Ok(None);
    }

    Sidecar::parse(&text).map(Some)
}

/// Creates an exclusively-named scratch file below `temp/`.
pub(crate) async fn mkstemp_scratch(
    cache_dir: &Path,
    hint: &str,
) -> std::io::Result<(tokio::fs::File, PathBuf)> {
    let mut rng = SmallRng::from_os_rng();

    let mut tries = 0;
    loop {
        const MAX_TRIES: u32 = 10;

        let suffix: String = (&mut rng)
            .sample_iter(Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();

        let path = temp_dir(cache_dir).join(format!("{hint}.{suffix}"));

        match tokio::fs::File::options()
            .create_new(true)
            .write(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((file, path)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                tries += 1;
                if tries > MAX_TRIES {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// Writes the sidecar content to scratch and atomically renames it over
/// the entry's header path, so readers never observe a partial or
/// transient header.
pub(crate) async fn publish_sidecar(
    cache_dir: &Path,
    paths: &EntryPaths,
    content: &str,
) -> std::io::Result<()> {
    let (mut file, scratch_path) = mkstemp_scratch(cache_dir, "hdr").await?;

    file.write_all(content.as_bytes()).await?;
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&scratch_path, &paths.header).await
}

async fn sha1_of_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Commits a fully downloaded entry: verifies (or synthesises) the
/// `Content-Length` header, links the body into the dedup pool under the
/// global lock, then creates the completion marker whose contents record
/// the source URL.
pub(crate) async fn commit_entry(
    cache_dir: &Path,
    key: &ObjectKey,
    paths: &EntryPaths,
    source_url: &str,
) -> Result<(), crate::error::PkgCacherError> {
    use crate::error::PkgCacherError;

    let lock = crate::lock::GlobalLock::acquire(cache_dir).await?;

    let actual_len = tokio::fs::metadata(&paths.body).await?.len();

    let sidecar = read_sidecar(&paths.header)
        .await?
        .ok_or_else(|| PkgCacherError::BadSidecar("missing at commit".to_string()))?;

    match sidecar.content_length() {
        Some(expected) if expected != actual_len => {
            return Err(PkgCacherError::BodyTruncated {
                expected,
                actual: actual_len,
            });
        }
        Some(_) => (),
        None => {
            /* chunked upstream: synthesise the header */
            let mut text = tokio::fs::read_to_string(&paths.header).await?;
            let insert = text.find("\r\n\r\n").map_or(text.len(), |p| p + 2);
            text.insert_str(insert, &format!("Content-Length: {actual_len}\r\n"));
            publish_sidecar(cache_dir, paths, &text).await?;
        }
    }

    let digest = sha1_of_file(&paths.body).await?;
    let pool = pool_path(cache_dir, &key.basename, &digest);

    if tokio::fs::try_exists(&pool).await.unwrap_or(false) {
        /* identical content already pooled: reuse it */
        tokio::fs::remove_file(&paths.body).await?;
        tokio::fs::hard_link(&pool, &paths.body).await?;
        debug!("Reusing pool entry `{}`", pool.display());
    } else {
        match tokio::fs::hard_link(&paths.body, &pool).await {
            Ok(()) => (),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                warn!("Pool entry `{}` appeared concurrently", pool.display());
            }
            Err(err) => return Err(err.into()),
        }
    }

    drop(lock);

    tokio::fs::write(&paths.marker, source_url.as_bytes()).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(uri: &str) -> ObjectKey {
        ObjectKey {
            vhost: "debian".to_string(),
            uri: uri.to_string(),
            basename: uri.rsplit('/').next().unwrap().to_string(),
        }
    }

    #[test]
    fn entry_paths_layout() {
        let paths = EntryPaths::new(Path::new("/cache"), &key("pool/main/f/foo/foo_1.deb"));

        assert_eq!(
            paths.body,
            Path::new("/cache/packages/debian/pool/main/f/foo/foo_1.deb")
        );
        assert_eq!(
            paths.header,
            Path::new("/cache/headers/debian/pool/main/f/foo/foo_1.deb")
        );
        assert_eq!(
            paths.marker,
            Path::new("/cache/private/debian/pool/main/f/foo/foo_1.deb.complete")
        );
    }

    #[test]
    fn sidecar_roundtrip() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert("Content-Length", "1234".parse().unwrap());
        headers.insert("Last-Modified", "Thu, 01 Jan 1970 00:00:00 GMT".parse().unwrap());

        let text = format_sidecar(hyper::Version::HTTP_11, StatusCode::OK, &headers);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\n"));

        let sidecar = Sidecar::parse(&text).unwrap();
        assert_eq!(sidecar.status, StatusCode::OK);
        assert_eq!(sidecar.content_length(), Some(1234));
        assert_eq!(
            sidecar.get("LAST-MODIFIED"),
            Some("Thu, 01 Jan 1970 00:00:00 GMT")
        );
        assert_eq!(sidecar.get("etag"), None);
    }

    #[test]
    fn sidecar_rejects_garbage() {
        assert!(Sidecar::parse("").is_err());
        assert!(Sidecar::parse("garbage\r\n\r\n").is_err());
        assert!(Sidecar::parse("HTTP/1.1 nonnumeric\r\n\r\n").is_err());
    }

    #[tokio::test]
    async fn create_commit_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path();
        setup_layout(cache_dir).unwrap();

        let key_a = key("pool/main/f/foo/foo_1.deb");
        let mut entry = create_entry(cache_dir, &key_a).unwrap();

        /* double-create guard */
        assert!(create_entry(cache_dir, &key_a).is_err());

        entry.writer.write_all(b"cached body bytes").await.unwrap();
        entry.writer.flush().await.unwrap();

        let mut headers = hyper::HeaderMap::new();
        headers.insert("Content-Length", "17".parse().unwrap());
        let text = format_sidecar(hyper::Version::HTTP_11, StatusCode::OK, &headers);
        publish_sidecar(cache_dir, &entry.paths, &text).await.unwrap();

        commit_entry(cache_dir, &key_a, &entry.paths, "http://example.org/foo_1.deb")
            .await
            .unwrap();
        drop(entry);

        let paths_a = EntryPaths::new(cache_dir, &key_a);
        assert!(paths_a.is_complete());
        assert_eq!(
            tokio::fs::read_to_string(&paths_a.marker).await.unwrap(),
            "http://example.org/foo_1.deb"
        );

        /* same content under a second key dedups into the pool */
        let key_b = ObjectKey {
            vhost: "mirror".to_string(),
            uri: "pool/f/foo_1.deb".to_string(),
            basename: "foo_1.deb".to_string(),
        };
        let mut entry_b = create_entry(cache_dir, &key_b).unwrap();
        entry_b.writer.write_all(b"cached body bytes").await.unwrap();
        entry_b.writer.flush().await.unwrap();
        publish_sidecar(cache_dir, &entry_b.paths, &text).await.unwrap();
        commit_entry(cache_dir, &key_b, &entry_b.paths, "http://example.org/2")
            .await
            .unwrap();

        let meta_a = std::fs::metadata(&paths_a.body).unwrap();
        let meta_b = std::fs::metadata(&entry_b.paths.body).unwrap();
        assert_eq!(
            std::os::unix::fs::MetadataExt::ino(&meta_a),
            std::os::unix::fs::MetadataExt::ino(&meta_b)
        );

        assert_eq!(
            tokio::fs::read(&entry_b.paths.body).await.unwrap(),
            b"cached body bytes"
        );
    }

    #[tokio::test]
    async fn commit_rejects_truncated_body() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path();
        setup_layout(cache_dir).unwrap();

        let k = key("pool/main/b/bar/bar_2.deb");
        let mut entry = create_entry(cache_dir, &k).unwrap();
        entry.writer.write_all(b"short").await.unwrap();
        entry.writer.flush().await.unwrap();

        let mut headers = hyper::HeaderMap::new();
        headers.insert("Content-Length", "9999".parse().unwrap());
        let text = format_sidecar(hyper::Version::HTTP_11, StatusCode::OK, &headers);
        publish_sidecar(cache_dir, &entry.paths, &text).await.unwrap();

        let err = commit_entry(cache_dir, &k, &entry.paths, "http://example.org/bar")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::PkgCacherError::BodyTruncated { .. }
        ));
        assert!(!entry.paths.is_complete());
    }

    #[tokio::test]
    async fn commit_synthesises_content_length() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path();
        setup_layout(cache_dir).unwrap();

        let k = key("dists/sid/InRelease");
        let mut entry = create_entry(cache_dir, &k).unwrap();
        entry.writer.write_all(b"index data").await.unwrap();
        entry.writer.flush().await.unwrap();

        /* chunked upstream: no Content-Length in the sidecar */
        let text = format_sidecar(
            hyper::Version::HTTP_11,
            StatusCode::OK,
            &hyper::HeaderMap::new(),
        );
        publish_sidecar(cache_dir, &entry.paths, &text).await.unwrap();

        commit_entry(cache_dir, &k, &entry.paths, "http://example.org/InRelease")
            .await
            .unwrap();

        let sidecar = read_sidecar(&entry.paths.header).await.unwrap().unwrap();
        assert_eq!(sidecar.content_length(), Some(10));
    }
}
