//! Provider options and the sources they are read from.
//!
//! The hosting runtime hands the provider a [`ConfigSource`]; how it was
//! filled (property bag, config file section, environment) is up to the host.

use crate::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use url::{Host, Url};

pub const SERVER_ADDRESSES: &str = "ServerAddresses";
pub const BUCKET_NAME: &str = "BucketName";
pub const BUCKET_PASSWORD: &str = "BucketPassword";
pub const USE_TRANSPORT_SECURITY: &str = "UseTransportSecurity";
pub const OPERATION_TIMEOUT_MS: &str = "OperationTimeoutMs";
pub const TLS_CA_FILE: &str = "TlsCaFile";
pub const TLS_SERVER_NAME: &str = "TlsServerName";

const SERVERS_ALIAS: &str = "Servers";
const USE_SSL_ALIAS: &str = "UseSsl";

pub const DEFAULT_PORT: u16 = 7001;
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(2500);

/// A flat string-to-string option lookup.
pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

impl ConfigSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

impl ConfigSource for BTreeMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        BTreeMap::get(self, key).cloned()
    }
}

/// Reads options from environment variables.
///
/// `BucketName` is looked up as `<prefix>BUCKET_NAME`.
#[derive(Debug, Clone)]
pub struct EnvSource {
    prefix: String,
}

impl EnvSource {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn var_name(&self, key: &str) -> String {
        let mut name = self.prefix.clone();
        for (i, c) in key.chars().enumerate() {
            if c.is_ascii_uppercase() && i > 0 {
                name.push('_');
            }
            name.push(c.to_ascii_uppercase());
        }
        name
    }
}

impl Default for EnvSource {
    fn default() -> Self {
        Self::new("GRAINKV_")
    }
}

impl ConfigSource for EnvSource {
    fn get(&self, key: &str) -> Option<String> {
        env::var(self.var_name(key)).ok()
    }
}

/// Consults each source in order; the first one that has a key wins.
pub struct Layered {
    sources: Vec<Box<dyn ConfigSource>>,
}

impl Layered {
    pub fn new() -> Self {
        Self { sources: Vec::new() }
    }

    pub fn with(mut self, source: impl ConfigSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }
}

impl Default for Layered {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigSource for Layered {
    fn get(&self, key: &str) -> Option<String> {
        self.sources.iter().find_map(|s| s.get(key))
    }
}

/// One endpoint of the key-value service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    /// Parses an endpoint URI such as `couchbase://host:port/path`, or a bare
    /// `host[:port]`. The port defaults to the scheme's known port, then to
    /// [`DEFAULT_PORT`].
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = |why: String| Error::Configuration(format!("invalid server address '{}': {}", s, why));

        // "kv:7001" would otherwise parse as scheme "kv".
        let url = if s.contains("://") {
            Url::parse(s)
        } else {
            Url::parse(&format!("tcp://{}", s))
        }
        .map_err(|e| invalid(e.to_string()))?;

        let host = match url.host() {
            Some(Host::Domain(d)) if !d.is_empty() => d.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err(invalid("missing host".to_string())),
        };
        let port = match url.port_or_known_default() {
            Some(0) => return Err(invalid("bad port".to_string())),
            Some(port) => port,
            None => DEFAULT_PORT,
        };

        Ok(Self { host, port })
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Transport security settings.
///
/// Without a CA file the Mozilla roots from `webpki-roots` are trusted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TlsOptions {
    pub ca_file: Option<PathBuf>,
    pub server_name: Option<String>,
}

/// Everything needed to open a bucket connection.
#[derive(Clone, PartialEq, Eq)]
pub struct StorageOptions {
    pub servers: Vec<ServerAddress>,
    pub bucket_name: String,
    pub bucket_password: String,
    pub tls: Option<TlsOptions>,
    pub operation_timeout: Duration,
}

impl fmt::Debug for StorageOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageOptions")
            .field("servers", &self.servers)
            .field("bucket_name", &self.bucket_name)
            .field("bucket_password", &"<redacted>")
            .field("tls", &self.tls)
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

impl StorageOptions {
    pub fn new(servers: Vec<ServerAddress>, bucket_name: impl Into<String>, bucket_password: impl Into<String>) -> Self {
        Self {
            servers,
            bucket_name: bucket_name.into(),
            bucket_password: bucket_password.into(),
            tls: None,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Reads and validates options from `source`.
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self> {
        let servers_raw = lookup(source, &[SERVER_ADDRESSES, SERVERS_ALIAS]).unwrap_or_default();
        let servers = servers_raw
            .split([';', ','])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ServerAddress::parse)
            .collect::<Result<Vec<_>>>()?;
        if servers.is_empty() {
            return Err(Error::Configuration(format!("{} property not set", SERVER_ADDRESSES)));
        }

        let bucket_name = required(source, BUCKET_NAME)?;
        let bucket_password = required(source, BUCKET_PASSWORD)?;

        let use_tls = match lookup(source, &[USE_TRANSPORT_SECURITY, USE_SSL_ALIAS]) {
            Some(raw) => parse_bool(USE_TRANSPORT_SECURITY, &raw)?,
            None => false,
        };

        let tls = if use_tls {
            Some(TlsOptions {
                ca_file: lookup(source, &[TLS_CA_FILE]).map(PathBuf::from),
                server_name: lookup(source, &[TLS_SERVER_NAME]),
            })
        } else {
            None
        };

        let operation_timeout = match lookup(source, &[OPERATION_TIMEOUT_MS]) {
            Some(raw) => {
                let ms = raw
                    .parse::<u64>()
                    .ok()
                    .filter(|ms| *ms > 0)
                    .ok_or_else(|| Error::Configuration(format!("{} must be a positive integer, got '{}'", OPERATION_TIMEOUT_MS, raw)))?;
                Duration::from_millis(ms)
            }
            None => DEFAULT_OPERATION_TIMEOUT,
        };

        Ok(Self {
            servers,
            bucket_name,
            bucket_password,
            tls,
            operation_timeout,
        })
    }
}

/// First non-blank value among `keys`.
fn lookup(source: &dyn ConfigSource, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| source.get(k))
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

fn required(source: &dyn ConfigSource, key: &str) -> Result<String> {
    lookup(source, &[key]).ok_or_else(|| Error::Configuration(format!("{} property not set", key)))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(Error::Configuration(format!("{} must be a boolean, got '{}'", key, raw))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn base() -> Vec<(&'static str, &'static str)> {
        vec![
            ("ServerAddresses", "tcp://kv1:7001;kv2"),
            ("BucketName", "grains"),
            ("BucketPassword", "secret"),
        ]
    }

    #[test]
    fn test_from_source_defaults() {
        let opts = StorageOptions::from_source(&props(&base())).unwrap();
        assert_eq!(
            opts.servers,
            vec![
                ServerAddress { host: "kv1".into(), port: 7001 },
                ServerAddress { host: "kv2".into(), port: DEFAULT_PORT },
            ]
        );
        assert_eq!(opts.bucket_name, "grains");
        assert_eq!(opts.bucket_password, "secret");
        assert_eq!(opts.tls, None);
        assert_eq!(opts.operation_timeout, DEFAULT_OPERATION_TIMEOUT);
    }

    #[test]
    fn test_legacy_aliases() {
        let p = props(&[
            ("Servers", "couchbase://10.0.0.1:8091/pools,10.0.0.2:9000"),
            ("BucketName", "grains"),
            ("BucketPassword", "secret"),
            ("UseSsl", "True"),
            ("TlsCaFile", "/etc/ca.pem"),
        ]);
        let opts = StorageOptions::from_source(&p).unwrap();
        assert_eq!(opts.servers.len(), 2);
        assert_eq!(opts.servers[0], ServerAddress { host: "10.0.0.1".into(), port: 8091 });
        assert_eq!(opts.tls.unwrap().ca_file, Some(PathBuf::from("/etc/ca.pem")));
    }

    #[test]
    fn test_empty_server_list_is_rejected() {
        let mut p = props(&base());
        p.insert("ServerAddresses".into(), "".into());
        assert!(matches!(StorageOptions::from_source(&p), Err(Error::Configuration(_))));
        p.insert("ServerAddresses".into(), " ; ;".into());
        assert!(matches!(StorageOptions::from_source(&p), Err(Error::Configuration(_))));
        p.remove("ServerAddresses");
        assert!(matches!(StorageOptions::from_source(&p), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_missing_bucket_and_password() {
        let mut p = props(&base());
        p.insert("BucketName".into(), "  ".into());
        assert!(matches!(StorageOptions::from_source(&p), Err(Error::Configuration(m)) if m.contains("BucketName")));

        let mut p = props(&base());
        p.remove("BucketPassword");
        assert!(matches!(StorageOptions::from_source(&p), Err(Error::Configuration(m)) if m.contains("BucketPassword")));
    }

    #[test]
    fn test_malformed_values() {
        let mut p = props(&base());
        p.insert("UseTransportSecurity".into(), "maybe".into());
        assert!(matches!(StorageOptions::from_source(&p), Err(Error::Configuration(_))));

        let mut p = props(&base());
        p.insert("OperationTimeoutMs".into(), "0".into());
        assert!(matches!(StorageOptions::from_source(&p), Err(Error::Configuration(_))));

        let mut p = props(&base());
        p.insert("ServerAddresses".into(), "kv1:notaport".into());
        assert!(matches!(StorageOptions::from_source(&p), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_tls_ca_file_is_optional() {
        let mut p = props(&base());
        p.insert("UseTransportSecurity".into(), "true".into());
        let tls = StorageOptions::from_source(&p).unwrap().tls.unwrap();
        assert_eq!(tls, TlsOptions::default());

        p.insert("TlsCaFile".into(), "ca.pem".into());
        p.insert("TlsServerName".into(), "kv.internal".into());
        let tls = StorageOptions::from_source(&p).unwrap().tls.unwrap();
        assert_eq!(tls.ca_file, Some(PathBuf::from("ca.pem")));
        assert_eq!(tls.server_name.as_deref(), Some("kv.internal"));
    }

    #[test]
    fn test_operation_timeout() {
        let mut p = props(&base());
        p.insert("OperationTimeoutMs".into(), "150".into());
        assert_eq!(StorageOptions::from_source(&p).unwrap().operation_timeout, Duration::from_millis(150));
    }

    #[test]
    fn test_server_address_forms() {
        assert_eq!(ServerAddress::parse("kv").unwrap().to_string(), "kv:7001");
        assert_eq!(ServerAddress::parse("tcp://user@kv:1234/x").unwrap().to_string(), "kv:1234");
        assert_eq!(ServerAddress::parse("kv:7002?timeout=5").unwrap().to_string(), "kv:7002");
        assert_eq!(ServerAddress::parse("https://kv.internal").unwrap().port, 443);
        let v6 = ServerAddress::parse("[::1]:7005").unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.to_string(), "[::1]:7005");
        assert!(ServerAddress::parse("tcp://").is_err());
        assert!(ServerAddress::parse("kv:0").is_err());
        assert!(ServerAddress::parse("kv:99999").is_err());
        assert!(ServerAddress::parse("[::1").is_err());
    }

    #[test]
    fn test_env_var_names() {
        let env = EnvSource::default();
        assert_eq!(env.var_name("BucketName"), "GRAINKV_BUCKET_NAME");
        assert_eq!(env.var_name("UseTransportSecurity"), "GRAINKV_USE_TRANSPORT_SECURITY");
        assert_eq!(env.var_name("TlsCaFile"), "GRAINKV_TLS_CA_FILE");
    }

    #[test]
    fn test_layered_first_source_wins() {
        let layered = Layered::new()
            .with(props(&[("BucketName", "override")]))
            .with(props(&base()));
        let opts = StorageOptions::from_source(&layered).unwrap();
        assert_eq!(opts.bucket_name, "override");
        assert_eq!(opts.bucket_password, "secret");
    }

    #[test]
    fn test_debug_redacts_password() {
        let opts = StorageOptions::from_source(&props(&base())).unwrap();
        assert!(!format!("{:?}", opts).contains("secret"));
    }
}
