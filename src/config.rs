use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::num::NonZero;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr as _;
use std::time::Duration;

use anyhow::Context as _;
use anyhow::anyhow;
use anyhow::bail;
use ipnet::IpNet;
use ipnet::Ipv4Net;
use log::LevelFilter;
use serde::Deserialize;
use serde::Deserializer;

#[macro_export]
macro_rules! nonzero {
    ($exp:expr) => {
        const {
            match NonZero::new($exp) {
                Some(v) => v,
                None => panic!("Value is zero"),
            }
        }
    };
}

pub(crate) const DEFAULT_BIND_PORT: NonZero<u16> = nonzero!(3142);
pub(crate) const DEFAULT_CACHE_DIR: &str = "/var/cache/pkg-cacher";
pub(crate) const DEFAULT_LOG_DIR: &str = "/var/log/pkg-cacher";
pub(crate) const DEFAULT_CONFIGURATION_PATH: &str = "/etc/pkg-cacher/pkg-cacher.conf";
pub(crate) const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Info;
pub(crate) const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(120);
pub(crate) const DEFAULT_BIND_RETRIES: u32 = 5;
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment prefix for configuration overrides (CGI mode and testing).
pub(crate) const ENV_PREFIX: &str = "PKG_CACHER_";

/// An access control entry for client authorisation.
///
/// Accepted forms: a single address, a `base/mask` CIDR (numeric prefix
/// length or dotted mask), a `start-end` range, or `*` for any address.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum HostSpec {
    Any,
    Addr(IpAddr),
    Net(IpNet),
    Range(IpAddr, IpAddr),
}

impl HostSpec {
    pub(crate) fn parse(entry: &str) -> anyhow::Result<Self> {
        let entry = entry.trim();

        if entry == "*" {
            return Ok(Self::Any);
        }

        if let Ok(ip) = entry.parse::<IpAddr>() {
            return Ok(Self::Addr(ip));
        }

        if let Some((base, mask)) = entry.split_once('/') {
            if let Ok(net) = entry.parse::<IpNet>() {
                return Ok(Self::Net(net));
            }

            /* dotted netmask, IPv4 only */
            let base = base
                .parse::<Ipv4Addr>()
                .map_err(|err| anyhow!("Invalid ACL base address `{base}`: {err}"))?;
            let mask = mask
                .parse::<Ipv4Addr>()
                .map_err(|err| anyhow!("Invalid ACL netmask `{mask}`: {err}"))?;
            let net = Ipv4Net::with_netmask(base, mask)
                .map_err(|err| anyhow!("Invalid ACL netmask `{mask}`: {err}"))?;
            return Ok(Self::Net(IpNet::V4(net)));
        }

        if let Some((start, end)) = entry.split_once('-') {
            let start = start
                .trim()
                .parse::<IpAddr>()
                .map_err(|err| anyhow!("Invalid ACL range start `{start}`: {err}"))?;
            let end = end
                .trim()
                .parse::<IpAddr>()
                .map_err(|err| anyhow!("Invalid ACL range end `{end}`: {err}"))?;
            if start.is_ipv4() != end.is_ipv4() {
                bail!("ACL range `{entry}` mixes address families");
            }
            if start > end {
                bail!("ACL range `{entry}` is reversed");
            }
            return Ok(Self::Range(start, end));
        }

        bail!("Unparsable ACL entry `{entry}`")
    }

    /// The address must already be normalised via `to_canonical()`.
    #[must_use]
    pub(crate) fn contains(&self, ip: &IpAddr) -> bool {
        match self {
            Self::Any => true,
            Self::Addr(a) => a == ip,
            Self::Net(net) => net.contains(ip),
            Self::Range(start, end) => start <= ip && ip <= end,
        }
    }
}

fn parse_host_list(list: &str) -> anyhow::Result<Vec<HostSpec>> {
    list.split([',', ' '])
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(HostSpec::parse)
        .collect()
}

fn from_host_list<'de, D>(deserializer: D) -> Result<Vec<HostSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    let s: String = Deserialize::deserialize(deserializer)?;

    parse_host_list(&s).map_err(D::Error::custom)
}

/// Parses the `path_map` value: a semicolon separated list of
/// `vhost host1 host2 …` groups, each an ordered candidate list.
fn parse_path_map(map: &str) -> anyhow::Result<HashMap<String, Vec<String>>> {
    let mut result = HashMap::new();

    for group in map.split(';').map(str::trim).filter(|g| !g.is_empty()) {
        let mut parts = group.split([',', ' ']).map(str::trim).filter(|p| !p.is_empty());

        let vhost = parts
            .next()
            .ok_or_else(|| anyhow!("Empty path_map group"))?;
        if !valid_vhost(vhost) {
            bail!("Invalid path_map vhost `{vhost}`");
        }

        let candidates: Vec<String> = parts.map(ToOwned::to_owned).collect();
        if candidates.is_empty() {
            bail!("path_map vhost `{vhost}` has no upstream candidates");
        }

        if result.insert(vhost.to_owned(), candidates).is_some() {
            bail!("Duplicate path_map vhost `{vhost}`");
        }
    }

    Ok(result)
}

fn from_path_map<'de, D>(deserializer: D) -> Result<HashMap<String, Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    let s: String = Deserialize::deserialize(deserializer)?;

    parse_path_map(&s).map_err(D::Error::custom)
}

#[must_use]
pub(crate) fn valid_vhost(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && name != "."
        && name != ".."
}

/// Parses a byte count with an optional `k` or `m` magnitude suffix.
fn parse_limit(s: &str) -> anyhow::Result<u64> {
    debug_assert_eq!(s, s.trim(), "Should be trimmed by deserializer");

    if let Ok(val) = s.parse::<u64>() {
        return Ok(val);
    }

    let Some(x) = s.find(|c| !char::is_ascii_digit(&c)) else {
        bail!("Could not split input");
    };

    let (val, mag) = s.split_at(x);
    let val = val.parse::<u64>()?;

    match mag.trim() {
        "k" => val
            .checked_mul(1024)
            .ok_or_else(|| anyhow!("Multiplication overflow")),
        "m" => val
            .checked_mul(1024 * 1024)
            .ok_or_else(|| anyhow!("Multiplication overflow")),
        other => bail!("Invalid magnitude `{other}`, expected `k` or `m`"),
    }
}

fn from_limit<'de, D>(deserializer: D) -> Result<Option<NonZero<u64>>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum LimitRepr {
        Bytes(u64),
        WithMagnitude(String),
    }

    match LimitRepr::deserialize(deserializer)? {
        LimitRepr::Bytes(v) => Ok(NonZero::new(v)),
        LimitRepr::WithMagnitude(s) => {
            parse_limit(&s).map(NonZero::new).map_err(D::Error::custom)
        }
    }
}

fn from_level_name<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    let s: String = Deserialize::deserialize(deserializer)?;

    LevelFilter::from_str(&s).map_err(D::Error::custom)
}

fn from_secs_u64<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s: u64 = Deserialize::deserialize(deserializer)?;

    Ok(Duration::from_secs(s))
}

fn from_addr_list<'de, D>(deserializer: D) -> Result<Vec<IpAddr>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    let s: String = Deserialize::deserialize(deserializer)?;

    s.split([',', ' '])
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(|e| e.parse::<IpAddr>().map_err(D::Error::custom))
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    /// Minimum log level severity to output.
    /// Can be overridden via program options.
    #[serde(default = "default_log_level", deserialize_with = "from_level_name")]
    pub(crate) log_level: LevelFilter,

    /// Root of the on-disk cache layout.
    #[serde(default = "default_cache_dir")]
    pub(crate) cache_dir: PathBuf,

    /// Directory for the access and error logs.
    #[serde(default = "default_log_dir")]
    pub(crate) logdir: PathBuf,

    /// Port to listen on.
    #[serde(default = "default_daemon_port")]
    pub(crate) daemon_port: NonZero<u16>,

    /// Addresses to listen on. Empty means all addresses.
    #[serde(default, deserialize_with = "from_addr_list")]
    pub(crate) daemon_addr: Vec<IpAddr>,

    /// Number of attempts to bind a listener socket.
    #[serde(default = "default_bind_retries")]
    pub(crate) retry: u32,

    /* Daemon lifecycle keys, consumed by the external daemonisation wrapper. */
    #[serde(default)]
    pub(crate) user: Option<String>,
    #[serde(default)]
    pub(crate) group: Option<String>,
    #[serde(default)]
    pub(crate) chroot: Option<PathBuf>,
    #[serde(default)]
    pub(crate) pidfile: Option<PathBuf>,
    #[serde(default)]
    pub(crate) fork: bool,

    /// Ordered upstream candidates per virtual host:
    /// `vhost host1 host2; other host3`.
    #[serde(default, deserialize_with = "from_path_map")]
    pub(crate) path_map: HashMap<String, Vec<String>>,

    /// IPv4 clients permitted to use the proxy. Empty means none.
    #[serde(default, deserialize_with = "from_host_list")]
    pub(crate) allowed_hosts: Vec<HostSpec>,

    /// IPv4 clients refused even when matched by `allowed_hosts`.
    #[serde(default, deserialize_with = "from_host_list")]
    pub(crate) denied_hosts: Vec<HostSpec>,

    /// IPv6 variant of `allowed_hosts`.
    #[serde(default, deserialize_with = "from_host_list")]
    pub(crate) allowed_hosts_6: Vec<HostSpec>,

    /// IPv6 variant of `denied_hosts`.
    #[serde(default, deserialize_with = "from_host_list")]
    pub(crate) denied_hosts_6: Vec<HostSpec>,

    /// Never issue upstream requests; serve only what the cache holds.
    #[serde(default)]
    pub(crate) offline_mode: bool,

    /// Maximum age in hours before an index file is unconditionally
    /// refreshed. `0` means always revalidate against the origin.
    #[serde(default)]
    pub(crate) expire_hours: u32,

    /// Prefer ETag comparison over Last-Modified for index revalidation.
    #[serde(default)]
    pub(crate) use_etags: bool,

    /// Treat a revalidation response without validators as expired.
    #[serde(default)]
    pub(crate) expire_on_missing_validators: bool,

    /* Parent proxy */
    #[serde(default)]
    pub(crate) http_proxy: Option<String>,
    #[serde(default)]
    pub(crate) https_proxy: Option<String>,
    #[serde(default)]
    pub(crate) use_proxy: bool,
    #[serde(default)]
    pub(crate) http_proxy_auth: Option<String>,
    #[serde(default)]
    pub(crate) https_proxy_auth: Option<String>,
    #[serde(default)]
    pub(crate) use_proxy_auth: bool,

    /// Verify upstream TLS certificates.
    #[serde(default = "default_true")]
    pub(crate) require_valid_ssl: bool,

    /// Upstream bandwidth cap in bytes per second (`N`, `Nk` or `Nm`).
    #[serde(default, deserialize_with = "from_limit")]
    pub(crate) limit: Option<NonZero<u64>>,

    /// Stall budget: abort transfers making no progress for this long.
    #[serde(default = "default_fetch_timeout", deserialize_with = "from_secs_u64")]
    pub(crate) fetch_timeout: Duration,

    /// Local address to bind upstream connections to.
    #[serde(default)]
    pub(crate) use_interface: Option<String>,

    /* Diagnostics and mode flags for external collaborators. */
    #[serde(default)]
    pub(crate) debug: bool,
    #[serde(default)]
    pub(crate) generate_reports: bool,
    #[serde(default)]
    pub(crate) clean_cache: bool,
    #[serde(default)]
    pub(crate) cgi_advise_to_use: bool,

    /// Extra basename patterns treated as immutable package files.
    #[serde(default)]
    pub(crate) static_files: Vec<String>,

    /// Extra basename patterns treated as mutable index files.
    #[serde(default)]
    pub(crate) index_files: Vec<String>,
}

/// The subset of fields swapped on a reload signal.
///
/// Structural fields (cache dir, log dir, listener binding) stay fixed
/// for the lifetime of the process.
#[derive(Clone, Debug)]
pub(crate) struct Reloadable {
    pub(crate) path_map: HashMap<String, Vec<String>>,
    pub(crate) allowed_hosts: Vec<HostSpec>,
    pub(crate) denied_hosts: Vec<HostSpec>,
    pub(crate) allowed_hosts_6: Vec<HostSpec>,
    pub(crate) denied_hosts_6: Vec<HostSpec>,
    pub(crate) offline_mode: bool,
    pub(crate) expire_hours: u32,
    pub(crate) use_etags: bool,
    pub(crate) expire_on_missing_validators: bool,
    pub(crate) http_proxy: Option<String>,
    pub(crate) https_proxy: Option<String>,
    pub(crate) use_proxy: bool,
    pub(crate) http_proxy_auth: Option<String>,
    pub(crate) https_proxy_auth: Option<String>,
    pub(crate) use_proxy_auth: bool,
    pub(crate) require_valid_ssl: bool,
    pub(crate) limit: Option<NonZero<u64>>,
    pub(crate) fetch_timeout: Duration,
    pub(crate) use_interface: Option<String>,
    pub(crate) debug: bool,
}

const fn default_log_level() -> LevelFilter {
    DEFAULT_LOG_LEVEL
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CACHE_DIR)
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_DIR)
}

const fn default_daemon_port() -> NonZero<u16> {
    DEFAULT_BIND_PORT
}

const fn default_bind_retries() -> u32 {
    DEFAULT_BIND_RETRIES
}

const fn default_true() -> bool {
    true
}

const fn default_fetch_timeout() -> Duration {
    DEFAULT_FETCH_TIMEOUT
}

impl Config {
    fn default() -> Self {
        /* An absent configuration file yields a proxy that refuses all
         * non-local clients and knows no upstreams; still useful for
         * smoke testing. */
        toml::from_str("").expect("empty configuration is valid")
    }

    pub(crate) fn new(file: &Path) -> anyhow::Result<(Self, bool)> {
        let content = match std::fs::read_to_string(file) {
            Ok(c) => c,
            Err(err)
                if err.kind() == std::io::ErrorKind::NotFound
                    && file == Path::new(DEFAULT_CONFIGURATION_PATH) =>
            {
                let mut config = Self::default();
                config.apply_env_overrides()?;
                config.validate()?;
                return Ok((config, true));
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read file `{}`", file.display()));
            }
        };

        let mut config: Self = toml::from_str(&content).context("Failed to parse configuration")?;

        config.apply_env_overrides()?;
        config.validate()?;

        Ok((config, false))
    }

    /// `PKG_CACHER_<KEY>` environment variables override the lowercased
    /// configuration key. Used by the CGI adapter and the test suite.
    fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        for (name, value) in std::env::vars() {
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let key = key.to_lowercase();

            self.apply_override(&key, &value)
                .with_context(|| format!("Invalid environment override {name}={value}"))?;
        }

        Ok(())
    }

    fn apply_override(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        fn parse_bool(value: &str) -> anyhow::Result<bool> {
            match value {
                "1" | "true" | "yes" => Ok(true),
                "0" | "false" | "no" => Ok(false),
                other => bail!("Invalid boolean `{other}`"),
            }
        }

        match key {
            "cache_dir" => self.cache_dir = PathBuf::from(value),
            "logdir" => self.logdir = PathBuf::from(value),
            "daemon_port" => self.daemon_port = value.parse()?,
            "path_map" => self.path_map = parse_path_map(value)?,
            "allowed_hosts" => self.allowed_hosts = parse_host_list(value)?,
            "denied_hosts" => self.denied_hosts = parse_host_list(value)?,
            "allowed_hosts_6" => self.allowed_hosts_6 = parse_host_list(value)?,
            "denied_hosts_6" => self.denied_hosts_6 = parse_host_list(value)?,
            "offline_mode" => self.offline_mode = parse_bool(value)?,
            "expire_hours" => self.expire_hours = value.parse()?,
            "use_etags" => self.use_etags = parse_bool(value)?,
            "expire_on_missing_validators" => {
                self.expire_on_missing_validators = parse_bool(value)?;
            }
            "http_proxy" => self.http_proxy = Some(value.to_owned()),
            "https_proxy" => self.https_proxy = Some(value.to_owned()),
            "use_proxy" => self.use_proxy = parse_bool(value)?,
            "http_proxy_auth" => self.http_proxy_auth = Some(value.to_owned()),
            "https_proxy_auth" => self.https_proxy_auth = Some(value.to_owned()),
            "use_proxy_auth" => self.use_proxy_auth = parse_bool(value)?,
            "require_valid_ssl" => self.require_valid_ssl = parse_bool(value)?,
            "limit" => self.limit = NonZero::new(parse_limit(value)?),
            "fetch_timeout" => self.fetch_timeout = Duration::from_secs(value.parse()?),
            "use_interface" => self.use_interface = Some(value.to_owned()),
            "debug" => self.debug = parse_bool(value)?,
            other => crate::warn_once_or_info!("Ignoring unknown override key `{other}`"),
        }

        Ok(())
    }

    fn validate(&mut self) -> anyhow::Result<()> {
        if self.fetch_timeout > Duration::from_secs(6 * 60) {
            bail!(
                "Invalid fetch_timeout value of {}: must be less or equal to 360s",
                self.fetch_timeout.as_secs()
            );
        }

        if self.cache_dir == Path::new("") {
            bail!("Empty cache_dir");
        }

        for (vhost, candidates) in &self.path_map {
            for candidate in candidates {
                if candidate.contains("://") && !candidate.starts_with("http") {
                    bail!("Unsupported upstream scheme in `{candidate}` for vhost `{vhost}`");
                }
            }
        }

        if self.use_proxy && self.http_proxy.is_none() && self.https_proxy.is_none() {
            bail!("use_proxy enabled without http_proxy or https_proxy");
        }

        if self.use_proxy_auth
            && self.http_proxy_auth.is_none()
            && self.https_proxy_auth.is_none()
        {
            bail!("use_proxy_auth enabled without proxy credentials");
        }

        Ok(())
    }

    #[must_use]
    pub(crate) fn reloadable(&self) -> Reloadable {
        Reloadable {
            path_map: self.path_map.clone(),
            allowed_hosts: self.allowed_hosts.clone(),
            denied_hosts: self.denied_hosts.clone(),
            allowed_hosts_6: self.allowed_hosts_6.clone(),
            denied_hosts_6: self.denied_hosts_6.clone(),
            offline_mode: self.offline_mode,
            expire_hours: self.expire_hours,
            use_etags: self.use_etags,
            expire_on_missing_validators: self.expire_on_missing_validators,
            http_proxy: self.http_proxy.clone(),
            https_proxy: self.https_proxy.clone(),
            use_proxy: self.use_proxy,
            http_proxy_auth: self.http_proxy_auth.clone(),
            https_proxy_auth: self.https_proxy_auth.clone(),
            use_proxy_auth: self.use_proxy_auth,
            require_valid_ssl: self.require_valid_ssl,
            limit: self.limit,
            fetch_timeout: self.fetch_timeout,
            use_interface: self.use_interface.clone(),
            debug: self.debug,
        }
    }
}

impl Reloadable {
    /// Evaluates the client ACLs. The peer address must be normalised
    /// with `to_canonical()` beforehand so IPv4-mapped IPv6 peers are
    /// matched against the IPv4 lists.
    #[must_use]
    pub(crate) fn client_permitted(&self, ip: &IpAddr) -> bool {
        if ip_is_localhost(ip) {
            return true;
        }

        let (allowed, denied) = match ip {
            IpAddr::V4(_) => (&self.allowed_hosts, &self.denied_hosts),
            IpAddr::V6(_) => (&self.allowed_hosts_6, &self.denied_hosts_6),
        };

        allowed.iter().any(|spec| spec.contains(ip)) && !denied.iter().any(|spec| spec.contains(ip))
    }
}

#[must_use]
pub(crate) fn ip_is_localhost(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => *v4 == Ipv4Addr::LOCALHOST,
        IpAddr::V6(v6) => *v6 == Ipv6Addr::LOCALHOST,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_limit() {
        assert_eq!(0, parse_limit("0").unwrap());

        assert_eq!(1024, parse_limit("1024").unwrap());

        assert_eq!(2048, parse_limit("2k").unwrap());

        assert_eq!(5 * 1024 * 1024, parse_limit("5m").unwrap());

        assert!(parse_limit("1K").is_err());

        assert!(parse_limit("-5k").is_err());

        assert!(parse_limit("0x1000").is_err());
    }

    #[test]
    fn test_parse_host_spec() {
        assert_eq!(HostSpec::parse("*").unwrap(), HostSpec::Any);

        assert_eq!(
            HostSpec::parse("192.168.1.1").unwrap(),
            HostSpec::Addr("192.168.1.1".parse().unwrap())
        );

        assert_eq!(
            HostSpec::parse("10.0.0.0/8").unwrap(),
            HostSpec::Net("10.0.0.0/8".parse().unwrap())
        );

        /* dotted netmask */
        assert_eq!(
            HostSpec::parse("192.168.0.0/255.255.255.0").unwrap(),
            HostSpec::Net("192.168.0.0/24".parse().unwrap())
        );

        assert_eq!(
            HostSpec::parse("10.0.0.1-10.0.0.9").unwrap(),
            HostSpec::Range("10.0.0.1".parse().unwrap(), "10.0.0.9".parse().unwrap())
        );

        assert_eq!(
            HostSpec::parse("2001:db8::/32").unwrap(),
            HostSpec::Net("2001:db8::/32".parse().unwrap())
        );

        assert!(HostSpec::parse("10.0.0.9-10.0.0.1").is_err());

        assert!(HostSpec::parse("10.0.0.1-2001:db8::1").is_err());

        assert!(HostSpec::parse("notanaddress").is_err());

        assert!(HostSpec::parse("10.0.0.0/33").is_err());
    }

    #[test]
    fn test_host_spec_contains() {
        let range = HostSpec::parse("10.0.0.5-10.0.0.10").unwrap();
        assert!(range.contains(&"10.0.0.5".parse().unwrap()));
        assert!(range.contains(&"10.0.0.10".parse().unwrap()));
        assert!(!range.contains(&"10.0.0.11".parse().unwrap()));

        let net = HostSpec::parse("192.168.0.0/255.255.0.0").unwrap();
        assert!(net.contains(&"192.168.47.11".parse().unwrap()));
        assert!(!net.contains(&"192.169.0.1".parse().unwrap()));
    }

    #[test]
    fn test_parse_path_map() {
        let map =
            parse_path_map("debian deb.debian.org/debian ftp.de.debian.org/debian; ubuntu archive.ubuntu.com/ubuntu")
                .unwrap();

        assert_eq!(map.len(), 2);
        assert_eq!(
            map["debian"],
            vec![
                "deb.debian.org/debian".to_string(),
                "ftp.de.debian.org/debian".to_string()
            ]
        );
        assert_eq!(map["ubuntu"], vec!["archive.ubuntu.com/ubuntu".to_string()]);

        assert!(parse_path_map("debian").is_err());

        assert!(parse_path_map("debian host1; debian host2").is_err());

        assert!(parse_path_map("bad/../vhost host1").is_err());

        assert!(parse_path_map("").unwrap().is_empty());
    }

    #[test]
    fn test_client_permitted() {
        let (config, _fallback) = {
            let mut config: Config = toml::from_str(
                r#"
                allowed_hosts = "192.168.0.0/24, 10.1.1.1-10.1.1.5"
                denied_hosts = "192.168.0.13"
                allowed_hosts_6 = "*"
                "#,
            )
            .unwrap();
            config.validate().unwrap();
            (config, false)
        };
        let reloadable = config.reloadable();

        /* localhost always wins */
        assert!(reloadable.client_permitted(&"127.0.0.1".parse().unwrap()));
        assert!(reloadable.client_permitted(&"::1".parse().unwrap()));

        assert!(reloadable.client_permitted(&"192.168.0.7".parse().unwrap()));
        assert!(!reloadable.client_permitted(&"192.168.0.13".parse().unwrap()));
        assert!(!reloadable.client_permitted(&"192.168.1.7".parse().unwrap()));

        assert!(reloadable.client_permitted(&"10.1.1.3".parse().unwrap()));
        assert!(!reloadable.client_permitted(&"10.1.1.6".parse().unwrap()));

        assert!(reloadable.client_permitted(&"2001:db8::42".parse().unwrap()));

        /* IPv4-mapped peers are normalised before evaluation */
        let mapped: IpAddr = "::ffff:192.168.0.7".parse().unwrap();
        assert!(reloadable.client_permitted(&mapped.to_canonical()));
    }

    #[test]
    fn test_valid_vhost() {
        assert!(valid_vhost("debian"));
        assert!(valid_vhost("debian-security"));
        assert!(valid_vhost("fedora_updates"));
        assert!(!valid_vhost(""));
        assert!(!valid_vhost("."));
        assert!(!valid_vhost(".."));
        assert!(!valid_vhost("a/b"));
        assert!(!valid_vhost("a b"));
    }
}
