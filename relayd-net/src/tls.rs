//! TLS contexts and per-connection sessions.
//!
//! Context construction turns PEM files into rustls configs once, at
//! configuration time; connections then run the handshake asynchronously on
//! the event loop. Peer-certificate accessors expose the SHA-256 digest and
//! the URI SAN, both returning the empty string when not applicable, and the
//! optional pinning checks (certificate hash, expected SANs) run right after
//! the handshake completes.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mio::net::TcpStream;
use rustls::pki_types::ServerName;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tracing::debug;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::Error;

/// TLS material and verification policy for one listener or upstream.
///
/// Mirrors the `ssl_context` configuration block: certificate chain and key,
/// optional trusted CA (enables peer certificate verification), ALPN
/// protocols, optional cipher suite restriction, and the post-handshake
/// pinning constraints.
#[derive(Debug, Clone, Default)]
pub struct TlsContextConfig {
    pub cert_chain_file: Option<PathBuf>,
    pub private_key_file: Option<PathBuf>,
    pub ca_cert_file: Option<PathBuf>,
    pub alpn_protocols: Vec<String>,
    pub cipher_suites: Vec<String>,
    pub verify_certificate_hash: Option<String>,
    pub verify_subject_alt_name: Vec<String>,
}

/// Constraints applied to the peer certificate after the handshake.
#[derive(Debug, Clone, Default)]
struct PeerConstraints {
    certificate_hash: Option<String>,
    subject_alt_names: Vec<String>,
}

impl PeerConstraints {
    fn from_config(config: &TlsContextConfig) -> PeerConstraints {
        PeerConstraints {
            certificate_hash: config.verify_certificate_hash.clone(),
            subject_alt_names: config.verify_subject_alt_name.clone(),
        }
    }

    fn is_empty(&self) -> bool {
        self.certificate_hash.is_none() && self.subject_alt_names.is_empty()
    }
}

/// Server-side TLS context shared by every connection of a listener.
#[derive(Clone)]
pub struct ServerTlsContext {
    config: Arc<ServerConfig>,
    constraints: PeerConstraints,
}

impl ServerTlsContext {
    pub fn new(config: &TlsContextConfig) -> Result<ServerTlsContext, Error> {
        let cert_file = config
            .cert_chain_file
            .as_ref()
            .ok_or_else(|| Error::TlsContext("cert_chain_file is required".to_string()))?;
        let key_file = config
            .private_key_file
            .as_ref()
            .ok_or_else(|| Error::TlsContext("private_key_file is required".to_string()))?;

        let certs = load_certs(cert_file)?;
        let key = load_key(key_file)?;
        let provider = build_provider(&config.cipher_suites)?;

        let builder = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::TlsContext(e.to_string()))?;

        let builder = match &config.ca_cert_file {
            Some(ca_file) => {
                let roots = load_root_store(ca_file)?;
                let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                    .build()
                    .map_err(|e| Error::TlsContext(e.to_string()))?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let mut server_config = builder
            .with_single_cert(certs, key)
            .map_err(|e| Error::TlsContext(e.to_string()))?;
        server_config.alpn_protocols = config
            .alpn_protocols
            .iter()
            .map(|p| p.as_bytes().to_vec())
            .collect();

        Ok(ServerTlsContext {
            config: Arc::new(server_config),
            constraints: PeerConstraints::from_config(config),
        })
    }
}

/// Client-side TLS context for upstream or test connections.
#[derive(Clone)]
pub struct ClientTlsContext {
    config: Arc<ClientConfig>,
    constraints: PeerConstraints,
}

impl ClientTlsContext {
    pub fn new(config: &TlsContextConfig) -> Result<ClientTlsContext, Error> {
        let ca_file = config
            .ca_cert_file
            .as_ref()
            .ok_or_else(|| Error::TlsContext("ca_cert_file is required".to_string()))?;
        let roots = load_root_store(ca_file)?;
        let provider = build_provider(&config.cipher_suites)?;

        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::TlsContext(e.to_string()))?
            .with_root_certificates(roots);

        let mut client_config = match (&config.cert_chain_file, &config.private_key_file) {
            (Some(cert_file), Some(key_file)) => {
                let certs = load_certs(cert_file)?;
                let key = load_key(key_file)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| Error::TlsContext(e.to_string()))?
            }
            _ => builder.with_no_client_auth(),
        };
        client_config.alpn_protocols = config
            .alpn_protocols
            .iter()
            .map(|p| p.as_bytes().to_vec())
            .collect();

        Ok(ClientTlsContext {
            config: Arc::new(client_config),
            constraints: PeerConstraints::from_config(config),
        })
    }
}

pub(crate) enum HandshakeResult {
    InProgress,
    Complete,
    Failed(String),
}

/// One TLS session bound to one connection.
pub(crate) struct TlsSession {
    conn: rustls::Connection,
    constraints: PeerConstraints,
    handshake_complete: bool,
}

impl TlsSession {
    pub(crate) fn new_server(ctx: &ServerTlsContext) -> Result<TlsSession, Error> {
        let conn = rustls::ServerConnection::new(Arc::clone(&ctx.config))
            .map_err(|e| Error::TlsContext(e.to_string()))?;
        Ok(TlsSession {
            conn: rustls::Connection::Server(conn),
            constraints: ctx.constraints.clone(),
            handshake_complete: false,
        })
    }

    pub(crate) fn new_client(
        ctx: &ClientTlsContext,
        server_name: &str,
    ) -> Result<TlsSession, Error> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| Error::TlsContext(format!("invalid server name '{server_name}'")))?;
        let conn = rustls::ClientConnection::new(Arc::clone(&ctx.config), name)
            .map_err(|e| Error::TlsContext(e.to_string()))?;
        Ok(TlsSession {
            conn: rustls::Connection::Client(conn),
            constraints: ctx.constraints.clone(),
            handshake_complete: false,
        })
    }

    pub(crate) fn is_handshaking(&self) -> bool {
        !self.handshake_complete
    }

    /// Drive the handshake as far as current socket readiness allows.
    pub(crate) fn advance_handshake(&mut self, sock: &mut TcpStream) -> HandshakeResult {
        loop {
            if self.conn.wants_write() {
                match self.conn.write_tls(sock) {
                    Ok(_) => continue,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return HandshakeResult::InProgress
                    }
                    Err(e) => return HandshakeResult::Failed(e.to_string()),
                }
            }

            if !self.conn.is_handshaking() {
                break;
            }

            match self.conn.read_tls(sock) {
                Ok(0) => return HandshakeResult::Failed("peer closed during handshake".to_string()),
                Ok(_) => {
                    if let Err(e) = self.conn.process_new_packets() {
                        // Best effort to flush the alert before giving up.
                        let _ = self.conn.write_tls(sock);
                        return HandshakeResult::Failed(e.to_string());
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return HandshakeResult::InProgress
                }
                Err(e) => return HandshakeResult::Failed(e.to_string()),
            }
        }

        self.handshake_complete = true;
        if let Err(reason) = self.verify_constraints() {
            return HandshakeResult::Failed(reason);
        }
        debug!("tls handshake complete");
        HandshakeResult::Complete
    }

    /// Read decrypted bytes. `Ok(0)` means the peer closed (cleanly or not);
    /// `WouldBlock` means no records are available yet.
    pub(crate) fn read_plaintext(
        &mut self,
        sock: &mut TcpStream,
        buf: &mut [u8],
    ) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                Err(e) => return Err(e),
            }

            match self.conn.read_tls(sock) {
                Ok(0) => return Ok(0),
                Ok(_) => {
                    self.conn
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Encrypt and queue plaintext; returns how much was accepted. Zero
    /// means the record buffer is full and the caller should retry after a
    /// flush.
    pub(crate) fn write_plaintext(
        &mut self,
        sock: &mut TcpStream,
        data: &[u8],
    ) -> io::Result<usize> {
        let n = self.conn.writer().write(data)?;
        self.flush_records(sock)?;
        Ok(n)
    }

    /// Push buffered records to the socket. `Ok(false)` means the kernel
    /// buffer filled and records remain queued.
    pub(crate) fn flush_records(&mut self, sock: &mut TcpStream) -> io::Result<bool> {
        while self.conn.wants_write() {
            match self.conn.write_tls(sock) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    pub(crate) fn has_pending_records(&self) -> bool {
        self.conn.wants_write()
    }

    pub(crate) fn send_close_notify(&mut self, sock: &mut TcpStream) {
        self.conn.send_close_notify();
        let _ = self.flush_records(sock);
    }

    fn peer_certificate_der(&self) -> Option<&[u8]> {
        self.conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref())
    }

    /// SHA-256 digest of the peer certificate, lowercase hex. Empty when the
    /// peer presented no certificate (the usual case for plain server-side
    /// connections without client auth).
    pub(crate) fn sha256_peer_certificate_digest(&self) -> String {
        match self.peer_certificate_der() {
            Some(der) => hex(ring::digest::digest(&ring::digest::SHA256, der).as_ref()),
            None => String::new(),
        }
    }

    /// URI entry of the peer certificate's subjectAltName. Empty when there
    /// is no peer certificate, no SAN extension, or no URI entry.
    pub(crate) fn uri_san_peer_certificate(&self) -> String {
        let Some(der) = self.peer_certificate_der() else {
            return String::new();
        };
        let Ok((_, cert)) = X509Certificate::from_der(der) else {
            return String::new();
        };
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                if let GeneralName::URI(uri) = name {
                    return (*uri).to_string();
                }
            }
        }
        String::new()
    }

    fn all_peer_sans(&self) -> Vec<String> {
        let Some(der) = self.peer_certificate_der() else {
            return Vec::new();
        };
        let Ok((_, cert)) = X509Certificate::from_der(der) else {
            return Vec::new();
        };
        let mut sans = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::URI(uri) => sans.push((*uri).to_string()),
                    GeneralName::DNSName(dns) => sans.push((*dns).to_string()),
                    _ => {}
                }
            }
        }
        sans
    }

    fn verify_constraints(&self) -> Result<(), String> {
        if self.constraints.is_empty() {
            return Ok(());
        }
        if self.peer_certificate_der().is_none() {
            return Err("peer presented no certificate to verify".to_string());
        }

        if let Some(expected) = &self.constraints.certificate_hash {
            let expected_norm = expected.replace(':', "").to_ascii_lowercase();
            let actual = self.sha256_peer_certificate_digest();
            if actual != expected_norm {
                return Err(format!(
                    "peer certificate hash mismatch: got {actual}, want {expected_norm}"
                ));
            }
        }

        if !self.constraints.subject_alt_names.is_empty() {
            let sans = self.all_peer_sans();
            if !self
                .constraints
                .subject_alt_names
                .iter()
                .any(|expected| sans.iter().any(|san| san == expected))
            {
                return Err(format!("no peer SAN matched; presented {sans:?}"));
            }
        }

        Ok(())
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn build_provider(
    cipher_suites: &[String],
) -> Result<Arc<rustls::crypto::CryptoProvider>, Error> {
    let mut provider = rustls::crypto::ring::default_provider();
    if !cipher_suites.is_empty() {
        let selected: Vec<_> = provider
            .cipher_suites
            .iter()
            .filter(|suite| {
                let name = format!("{:?}", suite.suite());
                cipher_suites.iter().any(|wanted| wanted == &name)
            })
            .copied()
            .collect();
        if selected.is_empty() {
            return Err(Error::TlsContext(format!(
                "no supported cipher suite among {cipher_suites:?}"
            )));
        }
        provider.cipher_suites = selected;
    }
    Ok(Arc::new(provider))
}

fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|e| pem_error(path, &e.to_string()))?;
    let mut reader = BufReader::new(file);
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    let certs = certs.map_err(|e| pem_error(path, &e.to_string()))?;
    if certs.is_empty() {
        return Err(pem_error(path, "no certificates found"));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>, Error> {
    let file = File::open(path).map_err(|e| pem_error(path, &e.to_string()))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| pem_error(path, &e.to_string()))?
        .ok_or_else(|| pem_error(path, "no private key found"))
}

fn load_root_store(path: &Path) -> Result<RootCertStore, Error> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| pem_error(path, &e.to_string()))?;
    }
    Ok(roots)
}

fn pem_error(path: &Path, detail: &str) -> Error {
    Error::TlsContext(format!("{}: {detail}", path.display()))
}
