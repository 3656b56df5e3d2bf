use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

/// Process settings, read once from `FACILITY_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// Collaborator gateway. Unset means the static directory.
    pub directory_addr: Option<String>,
    pub directory_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            bind: var("FACILITY_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: number(&var, "FACILITY_PORT").unwrap_or(5434),
            data_dir: var("FACILITY_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password: var("FACILITY_PASSWORD").unwrap_or_else(|| "facility".into()),
            max_connections: number(&var, "FACILITY_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: number(&var, "FACILITY_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: number(&var, "FACILITY_METRICS_PORT"),
            tls_cert: var("FACILITY_TLS_CERT"),
            tls_key: var("FACILITY_TLS_KEY"),
            directory_addr: var("FACILITY_DIRECTORY_ADDR"),
            directory_file: var("FACILITY_DIRECTORY_FILE").map(PathBuf::from),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("facility.wal")
    }

    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        load_tls_acceptor(self.tls_cert.as_deref(), self.tls_key.as_deref())
    }
}

/// A numeric variable; unset or malformed reads as `None`.
fn number<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    var(key).and_then(|s| s.trim().parse().ok())
}

pub fn load_tls_acceptor(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both FACILITY_TLS_CERT and FACILITY_TLS_KEY must be set, or neither",
            ));
        }
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}
