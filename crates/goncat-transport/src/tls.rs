//! Application-layer TLS upgrade of an established peer connection.
//!
//! With a pre-shared key both sides derive the same CA (see
//! [`cert`](crate::cert)) and authenticate each other against it: the
//! client through a wrapped webpki server verifier, the server through
//! mandatory client auth with the matching client verifier. Both wrappers
//! additionally insist the peer presented exactly one certificate.
//! Without a key the upgrade still encrypts but verifies nothing.
//!
//! Not used for udp://, whose QUIC handshake brings its own TLS 1.3
//! and is never double-wrapped.

use std::{sync::Arc, time::Duration};

use goncat_core::PeerConn;
use rustls::{
	ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig, SignatureScheme,
	client::{
		WebPkiServerVerifier,
		danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
	},
	crypto::CryptoProvider,
	pki_types::{CertificateDer, ServerName, UnixTime},
	server::{
		WebPkiClientVerifier,
		danger::{ClientCertVerified, ClientCertVerifier},
	},
};
use snafu::ResultExt as _;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::{
	CertificateSnafu, TransportError,
	cert::{Identity, TLS_SERVER_NAME},
	with_timeout,
};

/// Make the ring provider the process default. Idempotent; every config
/// builder below goes through it.
pub fn init_crypto() {
	static ONCE: std::sync::Once = std::sync::Once::new();
	ONCE.call_once(|| {
		let _ = rustls::crypto::ring::default_provider().install_default();
	});
}

/// Client-side upgrade. `key` selects mutual authentication.
pub async fn upgrade_client(conn: PeerConn, key: Option<&str>, timeout: Duration) -> Result<PeerConn, TransportError> {
	init_crypto();
	let identity = match key {
		Some(secret) => Identity::derived(secret),
		None => Identity::ephemeral(),
	}
	.context(CertificateSnafu)?;

	let verifier: Arc<dyn ServerCertVerifier> = match &identity.ca {
		Some(ca) => Arc::new(MutualServerVerifier::new(ca)?),
		None => Arc::new(InsecureVerifier::new()),
	};
	let config = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
		.dangerous()
		.with_custom_certificate_verifier(verifier)
		.with_client_auth_cert(identity.cert_chain, identity.key)
		.map_err(|e| config_error("tls client config", e))?;

	let connector = TlsConnector::from(Arc::new(config));
	let server_name = ServerName::try_from(TLS_SERVER_NAME).expect("fixed server name is valid");
	let stream = with_timeout("tls connect", timeout, async {
		connector.connect(server_name, conn).await.map_err(classify_tls_io)
	})
	.await?;
	debug!(target: "[TLS]", "client upgrade complete (mutual auth: {})", key.is_some());
	Ok(Box::new(stream))
}

/// Server-side upgrade. `key` makes client auth mandatory.
pub async fn upgrade_server(conn: PeerConn, key: Option<&str>, timeout: Duration) -> Result<PeerConn, TransportError> {
	init_crypto();
	let identity = match key {
		Some(secret) => Identity::derived(secret),
		None => Identity::ephemeral(),
	}
	.context(CertificateSnafu)?;

	let builder = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13]);
	let config = match &identity.ca {
		Some(ca) => builder
			.with_client_cert_verifier(Arc::new(MutualClientVerifier::new(ca)?))
			.with_single_cert(identity.cert_chain, identity.key),
		None => builder.with_no_client_auth().with_single_cert(identity.cert_chain, identity.key),
	}
	.map_err(|e| config_error("tls server config", e))?;

	let acceptor = TlsAcceptor::from(Arc::new(config));
	let stream = with_timeout("tls accept", timeout, async {
		acceptor.accept(conn).await.map_err(classify_tls_io)
	})
	.await?;
	debug!(target: "[TLS]", "server upgrade complete (mutual auth: {})", key.is_some());
	Ok(Box::new(stream))
}

/// TLS 1.3-only client config trusting anything, for transport-internal
/// TLS (QUIC, WSS) where authentication is the application layer's job.
pub(crate) fn insecure_client_config(alpn: Vec<Vec<u8>>) -> ClientConfig {
	init_crypto();
	let mut config = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
		.dangerous()
		.with_custom_certificate_verifier(Arc::new(InsecureVerifier::new()))
		.with_no_client_auth();
	config.alpn_protocols = alpn;
	config
}

/// Server config around an ephemeral identity, for transport-internal TLS.
pub(crate) fn transport_server_config(identity: Identity, alpn: Vec<Vec<u8>>) -> Result<ServerConfig, TransportError> {
	init_crypto();
	let mut config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
		.with_no_client_auth()
		.with_single_cert(identity.cert_chain, identity.key)
		.map_err(|e| config_error("tls server config", e))?;
	config.alpn_protocols = alpn;
	Ok(config)
}

fn config_error(op: &'static str, err: rustls::Error) -> TransportError {
	crate::HandshakeSnafu { op, message: err.to_string() }.build()
}

/// rustls failures surface through io::Error here; verifier rejections
/// become authentication errors, everything else stays a handshake error.
fn classify_tls_io(err: std::io::Error) -> TransportError {
	let is_auth = err
		.get_ref()
		.and_then(|inner| inner.downcast_ref::<rustls::Error>())
		.is_some_and(|e| matches!(e, rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented));
	if is_auth {
		crate::AuthSnafu { message: err.to_string() }.build()
	} else {
		crate::HandshakeSnafu {
			op:      "tls handshake",
			message: err.to_string(),
		}
		.build()
	}
}

fn exactly_one_cert(intermediates: &[CertificateDer<'_>]) -> Result<(), rustls::Error> {
	if intermediates.is_empty() {
		Ok(())
	} else {
		// The peer must present its leaf and nothing else.
		Err(rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer))
	}
}

/// Server verifier: exactly one peer certificate, validated against the
/// locally derived CA pool. Name checks ride on the fixed SAN.
#[derive(Debug)]
struct MutualServerVerifier {
	inner: Arc<WebPkiServerVerifier>,
}

impl MutualServerVerifier {
	fn new(ca: &CertificateDer<'static>) -> Result<Self, TransportError> {
		let mut roots = RootCertStore::empty();
		roots
			.add(ca.clone())
			.map_err(|e| config_error("tls trust anchor", e))?;
		let inner = WebPkiServerVerifier::builder(Arc::new(roots))
			.build()
			.map_err(|e| crate::HandshakeSnafu {
				op:      "tls verifier",
				message: e.to_string(),
			}
			.build())?;
		Ok(Self { inner })
	}
}

impl ServerCertVerifier for MutualServerVerifier {
	fn verify_server_cert(
		&self,
		end_entity: &CertificateDer<'_>,
		intermediates: &[CertificateDer<'_>],
		server_name: &ServerName<'_>,
		ocsp_response: &[u8],
		now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		exactly_one_cert(intermediates)?;
		self.inner
			.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		self.inner.verify_tls12_signature(message, cert, dss)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		self.inner.verify_tls13_signature(message, cert, dss)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.inner.supported_verify_schemes()
	}
}

/// Client verifier counterpart for the listening side.
#[derive(Debug)]
struct MutualClientVerifier {
	inner: Arc<dyn ClientCertVerifier>,
}

impl MutualClientVerifier {
	fn new(ca: &CertificateDer<'static>) -> Result<Self, TransportError> {
		let mut roots = RootCertStore::empty();
		roots
			.add(ca.clone())
			.map_err(|e| config_error("tls trust anchor", e))?;
		let inner = WebPkiClientVerifier::builder(Arc::new(roots))
			.build()
			.map_err(|e| crate::HandshakeSnafu {
				op:      "tls verifier",
				message: e.to_string(),
			}
			.build())?;
		Ok(Self { inner })
	}
}

impl ClientCertVerifier for MutualClientVerifier {
	fn root_hint_subjects(&self) -> &[DistinguishedName] {
		self.inner.root_hint_subjects()
	}

	fn verify_client_cert(
		&self,
		end_entity: &CertificateDer<'_>,
		intermediates: &[CertificateDer<'_>],
		now: UnixTime,
	) -> Result<ClientCertVerified, rustls::Error> {
		exactly_one_cert(intermediates)?;
		self.inner.verify_client_cert(end_entity, intermediates, now)
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		self.inner.verify_tls12_signature(message, cert, dss)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		self.inner.verify_tls13_signature(message, cert, dss)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.inner.supported_verify_schemes()
	}
}

/// Accept-anything verifier for transport-internal TLS.
#[derive(Debug)]
pub(crate) struct InsecureVerifier {
	provider: CryptoProvider,
}

impl InsecureVerifier {
	pub(crate) fn new() -> Self {
		Self {
			provider: rustls::crypto::ring::default_provider(),
		}
	}
}

impl ServerCertVerifier for InsecureVerifier {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		_now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.provider.signature_verification_algorithms.supported_schemes()
	}
}
