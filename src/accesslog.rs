//! The access log: one line per served request, written under a lock so
//! concurrent workers never interleave partial lines. External report
//! generation consumes this file.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use log::error;
use time::format_description::FormatItem;
use time::macros::format_description;
use tokio::io::AsyncWriteExt;

pub(crate) const ACCESS_LOG_FILE: &str = "access.log";

const TIMESTAMP_FORMAT: &[FormatItem<'_>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// The cache status recorded per request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum CacheStatus {
    Hit,
    Miss,
    Expired,
    Offline,
}

impl std::fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Expired => "EXPIRED",
            Self::Offline => "OFFLINE",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct AccessLog {
    file: Arc<tokio::sync::Mutex<tokio::fs::File>>,
}

impl AccessLog {
    pub(crate) fn open(logdir: &Path) -> anyhow::Result<Self> {
        use anyhow::Context as _;

        std::fs::create_dir_all(logdir)
            .with_context(|| format!("Failed to create directory `{}`", logdir.display()))?;

        let path = logdir.join(ACCESS_LOG_FILE);
        let file = std::fs::File::options()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open access log `{}`", path.display()))?;

        Ok(Self {
            file: Arc::new(tokio::sync::Mutex::new(tokio::fs::File::from_std(file))),
        })
    }

    /// Appends one `time|pid|client|status|size|basename` line.
    pub(crate) async fn register(
        &self,
        client: IpAddr,
        status: CacheStatus,
        size: u64,
        basename: &str,
    ) {
        let timestamp = time::OffsetDateTime::now_utc()
            .format(TIMESTAMP_FORMAT)
            .expect("timestamp format is valid");

        let line = format!(
            "{timestamp}|{}|{}|{status}|{size}|{basename}\n",
            std::process::id(),
            client.to_canonical(),
        );

        let mut file = self.file.lock().await;
        if let Err(err) = file.write_all(line.as_bytes()).await {
            error!("Failed to write access log line:  {err}");
        }
        if let Err(err) = file.flush().await {
            error!("Failed to flush access log:  {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_line_format() {
        let dir = tempfile::tempdir().unwrap();
        let log = AccessLog::open(dir.path()).unwrap();

        log.register(
            "192.168.1.4".parse().unwrap(),
            CacheStatus::Miss,
            1_048_576,
            "foo_1.0.deb",
        )
        .await;
        log.register("::1".parse().unwrap(), CacheStatus::Hit, 42, "Packages.gz")
            .await;

        let content =
            std::fs::read_to_string(dir.path().join(ACCESS_LOG_FILE)).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let fields: Vec<&str> = lines[0].split('|').collect();
        assert_eq!(fields.len(), 6);
        assert_eq!(fields[1], std::process::id().to_string());
        assert_eq!(fields[2], "192.168.1.4");
        assert_eq!(fields[3], "MISS");
        assert_eq!(fields[4], "1048576");
        assert_eq!(fields[5], "foo_1.0.deb");

        assert!(lines[1].ends_with("|HIT|42|Packages.gz"));
    }
}
