//! Certificate contexts for the two protocol generations.

use super::ChannelError;
use crate::config::{ConfigError, ServerSettings};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConfig, SupportedProtocolVersion};
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::sync::OnceCell;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

static CURRENT_VERSIONS: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// Protocol generation served by a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolGeneration {
    /// Older clients: TLS 1.2 and TLS 1.3.
    Legacy,
    /// TLS 1.3 only.
    Current,
}

impl ProtocolGeneration {
    /// Generation for a certificate index. Anything but 1 or 2 is a configuration error.
    pub fn from_index(index: u8) -> Result<Self, ConfigError> {
        match index {
            1 => Ok(ProtocolGeneration::Legacy),
            2 => Ok(ProtocolGeneration::Current),
            other => Err(ConfigError::UnknownCertificateIndex(other)),
        }
    }

    pub fn index(self) -> u8 {
        match self {
            ProtocolGeneration::Legacy => 1,
            ProtocolGeneration::Current => 2,
        }
    }

    pub fn versions(self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            ProtocolGeneration::Legacy => rustls::ALL_VERSIONS,
            ProtocolGeneration::Current => CURRENT_VERSIONS,
        }
    }
}

/// Concatenate the end-entity certificate and the CA certificate of a
/// listener into a temporary `*-cert-chain` file.
///
/// The bytes are copied as-is, end-entity first. The file is removed when
/// the returned handle is dropped.
pub fn build_certificate_chain(
    settings: &ServerSettings,
    index: u8,
) -> Result<NamedTempFile, ChannelError> {
    ProtocolGeneration::from_index(index)?;
    let listener = settings
        .listener(index)
        .ok_or(ConfigError::UnknownCertificateIndex(index))?;

    let certificate = read(&listener.certificate)?;
    let ca_certificate = read(&listener.ca_certificate)?;

    let mut chain = tempfile::Builder::new()
        .prefix("gatewayctl-")
        .suffix("-cert-chain")
        .tempfile()?;
    chain.write_all(&certificate)?;
    chain.write_all(&ca_certificate)?;
    chain.flush()?;

    debug!(
        "certificate chain {} written to {}",
        index,
        chain.path().display()
    );
    Ok(chain)
}

fn read(path: &Path) -> Result<Vec<u8>, ChannelError> {
    std::fs::read(path).map_err(|source| ChannelError::Certificate {
        path: path.to_path_buf(),
        source,
    })
}

/// Key material for one listener. The rustls configuration is built on
/// first use and shared by every connection afterwards.
#[derive(Debug)]
pub struct CertificateContext {
    generation: ProtocolGeneration,
    private_key: PathBuf,
    chain: NamedTempFile,
    config: OnceCell<Arc<ServerConfig>>,
}

impl CertificateContext {
    /// Context for the listener configured with certificate index `index`.
    pub fn for_listener(settings: &ServerSettings, index: u8) -> Result<Self, ChannelError> {
        let generation = ProtocolGeneration::from_index(index)?;
        let chain = build_certificate_chain(settings, index)?;
        let listener = settings
            .listener(index)
            .ok_or(ConfigError::UnknownCertificateIndex(index))?;
        Ok(Self {
            generation,
            private_key: listener.private_key.clone(),
            chain,
            config: OnceCell::new(),
        })
    }

    pub fn generation(&self) -> ProtocolGeneration {
        self.generation
    }

    pub fn chain_path(&self) -> &Path {
        self.chain.path()
    }

    /// The shared server configuration, loading keys on the first call.
    pub async fn server_config(&self) -> Result<Arc<ServerConfig>, ChannelError> {
        self.config
            .get_or_try_init(|| async { self.build().map(Arc::new) })
            .await
            .cloned()
    }

    pub async fn acceptor(&self) -> Result<TlsAcceptor, ChannelError> {
        Ok(TlsAcceptor::from(self.server_config().await?))
    }

    fn build(&self) -> Result<ServerConfig, ChannelError> {
        let chain = load_certificates(self.chain_path())?;
        let key = load_private_key(&self.private_key)?;
        debug!(
            "building TLS context for generation {} ({} certificates from {})",
            self.generation.index(),
            chain.len(),
            self.chain_path().display()
        );

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(self.generation.versions())?
            .with_no_client_auth()
            .with_single_cert(chain, key)?;
        Ok(config)
    }
}

/// All certificates in a PEM file, in file order.
pub fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, ChannelError> {
    let io_error = |source: std::io::Error| ChannelError::Certificate {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = BufReader::new(File::open(path).map_err(io_error)?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_error)?;
    if certs.is_empty() {
        return Err(ChannelError::NoCertificate(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ChannelError> {
    let io_error = |source: std::io::Error| ChannelError::Certificate {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = BufReader::new(File::open(path).map_err(io_error)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(io_error)?
        .ok_or_else(|| ChannelError::NoPrivateKey(path.to_path_buf()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ListenerSettings;
    use rcgen::{
        BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    };
    use tempfile::{tempdir, TempDir};

    /// Writes a CA and a `localhost` server certificate for each generation.
    pub(crate) fn test_pki(generations: &[u8]) -> (TempDir, ServerSettings) {
        let dir = tempdir().unwrap();
        let mut settings = ServerSettings {
            listeners: Vec::new(),
            ..ServerSettings::default()
        };

        for &generation in generations {
            let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
            ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            ca_params
                .distinguished_name
                .push(DnType::CommonName, format!("gatewayctl test CA {generation}"));
            let ca_key = KeyPair::generate().unwrap();
            let ca_cert = ca_params.self_signed(&ca_key).unwrap();

            let mut leaf_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
            leaf_params
                .distinguished_name
                .push(DnType::CommonName, format!("gateway {generation}"));
            leaf_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
            let leaf_key = KeyPair::generate().unwrap();
            let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

            let mut listener = ListenerSettings::in_dir(generation, dir.path());
            listener.address = "127.0.0.1".to_string();
            std::fs::write(&listener.private_key, leaf_key.serialize_pem()).unwrap();
            std::fs::write(&listener.certificate, leaf_cert.pem()).unwrap();
            std::fs::write(&listener.ca_certificate, ca_cert.pem()).unwrap();
            settings.listeners.push(listener);
        }

        (dir, settings)
    }

    #[test]
    fn test_generation_from_index() {
        assert_eq!(ProtocolGeneration::from_index(1).unwrap(), ProtocolGeneration::Legacy);
        assert_eq!(ProtocolGeneration::from_index(2).unwrap().index(), 2);
        assert_eq!(
            ProtocolGeneration::from_index(3).unwrap_err(),
            ConfigError::UnknownCertificateIndex(3)
        );
        assert_eq!(ProtocolGeneration::Legacy.versions().len(), 2);
        assert_eq!(ProtocolGeneration::Current.versions().len(), 1);
    }

    #[test]
    fn test_chain_is_certificate_then_ca() {
        let dir = tempdir().unwrap();
        let listener = ListenerSettings::in_dir(1, dir.path());
        std::fs::write(&listener.certificate, b"END-ENTITY").unwrap();
        std::fs::write(&listener.ca_certificate, b"AUTHORITY").unwrap();
        let settings = ServerSettings {
            listeners: vec![listener],
            ..ServerSettings::default()
        };

        let chain = build_certificate_chain(&settings, 1).unwrap();
        assert!(chain
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with("-cert-chain")));
        assert_eq!(std::fs::read(chain.path()).unwrap(), b"END-ENTITYAUTHORITY");

        let path = chain.path().to_path_buf();
        drop(chain);
        assert!(!path.exists());
    }

    #[test]
    fn test_unknown_chain_index_is_config_error() {
        let dir = tempdir().unwrap();
        let settings = ServerSettings {
            listeners: vec![ListenerSettings::in_dir(1, dir.path())],
            ..ServerSettings::default()
        };
        assert!(matches!(
            build_certificate_chain(&settings, 7),
            Err(ChannelError::Config(ConfigError::UnknownCertificateIndex(7)))
        ));
        // valid index, but not configured
        assert!(matches!(
            build_certificate_chain(&settings, 2),
            Err(ChannelError::Config(ConfigError::UnknownCertificateIndex(2)))
        ));
    }

    #[test]
    fn test_missing_certificate_file() {
        let dir = tempdir().unwrap();
        let settings = ServerSettings {
            listeners: vec![ListenerSettings::in_dir(2, dir.path())],
            ..ServerSettings::default()
        };
        assert!(matches!(
            build_certificate_chain(&settings, 2),
            Err(ChannelError::Certificate { .. })
        ));
    }

    #[tokio::test]
    async fn test_server_config_is_cached() {
        let (_dir, settings) = test_pki(&[1, 2]);
        for index in [1, 2] {
            let context = CertificateContext::for_listener(&settings, index).unwrap();
            let first = context.server_config().await.unwrap();
            let second = context.server_config().await.unwrap();
            assert!(Arc::ptr_eq(&first, &second));
            assert_eq!(load_certificates(context.chain_path()).unwrap().len(), 2);
        }
    }

    #[tokio::test]
    async fn test_chain_without_pem_is_rejected() {
        let dir = tempdir().unwrap();
        let listener = ListenerSettings::in_dir(1, dir.path());
        std::fs::write(&listener.certificate, b"not pem").unwrap();
        std::fs::write(&listener.ca_certificate, b"still not pem").unwrap();
        std::fs::write(&listener.private_key, b"nope").unwrap();
        let settings = ServerSettings {
            listeners: vec![listener],
            ..ServerSettings::default()
        };

        let context = CertificateContext::for_listener(&settings, 1).unwrap();
        assert!(matches!(
            context.server_config().await,
            Err(ChannelError::NoCertificate(_))
        ));
    }
}
