use std::net::IpAddr;

#[derive(Debug)]
#[non_exhaustive]
pub(crate) enum PkgCacherError {
    Io(std::io::Error),
    Hyper(hyper::Error),
    HyperUtil(hyper_util::client::legacy::Error),
    Http(hyper::http::Error),
    SystemTime(std::time::SystemTimeError),
    /// No forward progress was made within the configured stall budget.
    Stall(StallError),
    /// The on-disk entry does not match what the fetcher announced.
    BodyTruncated { expected: u64, actual: u64 },
    /// The header sidecar could not be parsed.
    BadSidecar(String),
}

#[derive(Clone, Debug)]
pub(crate) struct StallError {
    pub(crate) timeout_secs: u64,
    pub(crate) client_ip: Option<IpAddr>,
    pub(crate) basename: String,
}

impl std::fmt::Display for PkgCacherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => e.fmt(f),
            Self::Hyper(e) => e.fmt(f),
            Self::HyperUtil(e) => e.fmt(f),
            Self::Http(e) => e.fmt(f),
            Self::SystemTime(e) => e.fmt(f),
            Self::Stall(StallError {
                timeout_secs,
                client_ip,
                basename,
            }) => match client_ip {
                Some(ip) => write!(
                    f,
                    "No progress serving {basename} to client {} for {timeout_secs}s",
                    ip.to_canonical()
                ),
                None => write!(f, "No progress fetching {basename} for {timeout_secs}s"),
            },
            Self::BodyTruncated { expected, actual } => {
                write!(
                    f,
                    "Cached body has {actual} bytes, header announced {expected}"
                )
            }
            Self::BadSidecar(msg) => write!(f, "Malformed header sidecar: {msg}"),
        }
    }
}

impl std::error::Error for PkgCacherError {}

impl From<std::io::Error> for PkgCacherError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<hyper::Error> for PkgCacherError {
    fn from(value: hyper::Error) -> Self {
        Self::Hyper(value)
    }
}

impl From<hyper_util::client::legacy::Error> for PkgCacherError {
    fn from(value: hyper_util::client::legacy::Error) -> Self {
        Self::HyperUtil(value)
    }
}

impl From<hyper::http::Error> for PkgCacherError {
    fn from(value: hyper::http::Error) -> Self {
        Self::Http(value)
    }
}

impl From<hyper::header::InvalidHeaderValue> for PkgCacherError {
    fn from(value: hyper::header::InvalidHeaderValue) -> Self {
        Self::Http(value.into())
    }
}

impl From<std::time::SystemTimeError> for PkgCacherError {
    fn from(value: std::time::SystemTimeError) -> Self {
        Self::SystemTime(value)
    }
}
