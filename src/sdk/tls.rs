use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use crate::config::TlsOptions;
use crate::{Error, Result};

/// A connector that trusts the configured CA file, or the Mozilla root
/// program when no CA file is set.
pub fn connector(options: &TlsOptions) -> Result<TlsConnector> {
    let roots = match &options.ca_file {
        Some(path) => roots_from_file(path)?,
        None => {
            let mut roots = RootCertStore::empty();
            roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
                OwnedTrustAnchor::from_subject_spki_name_constraints(ta.subject, ta.spki, ta.name_constraints)
            }));
            roots
        }
    };

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

fn roots_from_file(path: &Path) -> Result<RootCertStore> {
    let file = File::open(path)
        .map_err(|e| Error::Configuration(format!("cannot open TLS CA file {}: {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .map_err(|e| Error::Configuration(format!("cannot parse TLS CA file {}: {}", path.display(), e)))?;

    let mut roots = RootCertStore::empty();
    let (added, _ignored) = roots.add_parsable_certificates(&certs[..]);
    if added == 0 {
        return Err(Error::Configuration(format!(
            "TLS CA file {} contains no usable certificates",
            path.display()
        )));
    }
    Ok(roots)
}

pub fn server_name(name: &str) -> Result<ServerName> {
    ServerName::try_from(name).map_err(|_| Error::Configuration(format!("invalid TLS server name '{}'", name)))
}
