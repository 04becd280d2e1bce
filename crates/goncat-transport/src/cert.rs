//! Certificate material for the TLS layers.
//!
//! Two flavours: a throwaway self-signed identity for transports whose
//! TLS only provides confidentiality (QUIC, the WSS outer layer), and a
//! deterministic identity derived from the pre-shared key for mutual
//! authentication. For the latter, both peers hash the salted key into
//! the same ECDSA-P256 CA keypair and the same CA subject, so each side
//! can validate the other's leaf against a CA pool it built locally,
//! without ever exchanging certificate material out of band.

use rcgen::{
	BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
	PKCS_ECDSA_P256_SHA256, date_time_ymd,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};
use snafu::{Backtrace, ResultExt as _, Snafu};

/// Fixed process-wide salt mixed into the pre-shared key before any
/// derivation. Changing it invalidates interop with older builds.
const KEY_SALT: &[u8] = b"goncat.tls.v1:";

/// SAN on every leaf; dialers connect with this server name, which makes
/// webpki's name check a formality and leaves the CA pool as the only
/// thing that decides trust.
pub const TLS_SERVER_NAME: &str = "goncat";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CertError {
	#[snafu(display("certificate generation failed"))]
	Generate {
		source:    rcgen::Error,
		backtrace: Backtrace,
	},
	#[snafu(display("key encoding failed"))]
	KeyEncoding {
		source:    p256::pkcs8::Error,
		backtrace: Backtrace,
	},
}

/// A local TLS identity: leaf chain, private key and, when derived from
/// a shared secret, the CA both peers agree on.
pub struct Identity {
	pub ca:         Option<CertificateDer<'static>>,
	pub cert_chain: Vec<CertificateDer<'static>>,
	pub key:        PrivateKeyDer<'static>,
}

impl Identity {
	/// Fresh random self-signed identity.
	pub fn ephemeral() -> Result<Self, CertError> {
		let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).context(GenerateSnafu)?;
		let mut params = CertificateParams::new(vec![TLS_SERVER_NAME.to_string()]).context(GenerateSnafu)?;
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, TLS_SERVER_NAME);
		params.distinguished_name = dn;
		let cert = params.self_signed(&key).context(GenerateSnafu)?;
		Ok(Self {
			ca:         None,
			cert_chain: vec![cert.der().clone()],
			key:        pkcs8_key(&key),
		})
	}

	/// Identity under the CA both holders of `secret` derive.
	///
	/// The CA keypair and subject come from the salted secret alone; the
	/// leaf keypair is random (signing with a fixed key would leak it
	/// through repeated randomless issuance, so only generation is
	/// deterministic). Certificate validity is pinned to fixed dates.
	pub fn derived(secret: &str) -> Result<Self, CertError> {
		let seed: [u8; 32] = Sha256::new()
			.chain_update(KEY_SALT)
			.chain_update(secret.as_bytes())
			.finalize()
			.into();
		let suffix = subject_suffix(&seed);
		let ca_key = deterministic_keypair(seed)?;

		let mut ca_params = CertificateParams::new(vec![]).context(GenerateSnafu)?;
		ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, format!("goncat-ca-{suffix}"));
		dn.push(DnType::OrganizationName, format!("goncat-{suffix}"));
		ca_params.distinguished_name = dn;
		ca_params.not_before = date_time_ymd(1970, 1, 1);
		ca_params.not_after = date_time_ymd(4096, 1, 1);
		let ca_cert = ca_params.self_signed(&ca_key).context(GenerateSnafu)?;

		let leaf_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).context(GenerateSnafu)?;
		let mut leaf_params = CertificateParams::new(vec![TLS_SERVER_NAME.to_string()]).context(GenerateSnafu)?;
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, format!("goncat-{suffix}"));
		leaf_params.distinguished_name = dn;
		leaf_params.not_before = date_time_ymd(1970, 1, 1);
		leaf_params.not_after = date_time_ymd(4096, 1, 1);
		let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).context(GenerateSnafu)?;

		Ok(Self {
			ca:         Some(ca_cert.der().clone()),
			cert_chain: vec![leaf_cert.der().clone()],
			key:        pkcs8_key(&leaf_key),
		})
	}
}

fn pkcs8_key(key: &KeyPair) -> PrivateKeyDer<'static> {
	PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()))
}

/// Derive an ECDSA-P256 keypair from the seed, rehashing until the bytes
/// land inside the scalar field (one round almost always suffices, and
/// the walk is identical on both peers).
fn deterministic_keypair(seed: [u8; 32]) -> Result<KeyPair, CertError> {
	let mut candidate = seed;
	loop {
		if let Ok(secret) = p256::SecretKey::from_bytes(p256::FieldBytes::from_slice(&candidate)) {
			use p256::pkcs8::EncodePrivateKey as _;
			let der = secret.to_pkcs8_der().context(KeyEncodingSnafu)?;
			let der = PrivatePkcs8KeyDer::from(der.as_bytes());
			return KeyPair::from_pkcs8_der_and_sign_algo(&der, &PKCS_ECDSA_P256_SHA256).context(GenerateSnafu);
		}
		candidate = Sha256::digest(candidate).into();
	}
}

fn subject_suffix(seed: &[u8; 32]) -> String {
	let digest = Sha256::new().chain_update(seed).chain_update(b"subject").finalize();
	hex::encode(&digest[..6])
}

#[cfg(test)]
mod test {
	use sha2::{Digest as _, Sha256};
	use x509_parser::prelude::{FromDer as _, X509Certificate};

	use super::Identity;

	fn subject_of(der: &[u8]) -> String {
		let (_, cert) = X509Certificate::from_der(der).unwrap();
		cert.subject().to_string()
	}

	/// Two independent derivations from the same secret agree on the CA
	/// subject and key, so each side's leaf validates against the other
	/// side's locally built pool.
	#[test]
	fn same_secret_same_ca() {
		let a = Identity::derived("correcthorse").unwrap();
		let b = Identity::derived("correcthorse").unwrap();
		let ca_a = a.ca.as_ref().unwrap();
		let ca_b = b.ca.as_ref().unwrap();

		assert_eq!(subject_of(ca_a), subject_of(ca_b));

		let (_, ca_cert_a) = X509Certificate::from_der(ca_a).unwrap();
		let (_, ca_cert_b) = X509Certificate::from_der(ca_b).unwrap();
		assert_eq!(
			ca_cert_a.public_key().subject_public_key.data,
			ca_cert_b.public_key().subject_public_key.data,
		);

		// Cross-validation: a's leaf is signed by the CA key b derived.
		let (_, leaf_a) = X509Certificate::from_der(&a.cert_chain[0]).unwrap();
		leaf_a
			.verify_signature(Some(ca_cert_b.public_key()))
			.expect("leaf must validate against the peer-derived CA");
	}

	#[test]
	fn different_secret_different_ca() {
		let a = Identity::derived("correcthorse").unwrap();
		let b = Identity::derived("wronghorse").unwrap();
		assert_ne!(
			subject_of(a.ca.as_ref().unwrap()),
			subject_of(b.ca.as_ref().unwrap()),
		);

		let (_, leaf_a) = x509_parser::prelude::X509Certificate::from_der(&a.cert_chain[0]).unwrap();
		let (_, ca_b) = x509_parser::prelude::X509Certificate::from_der(b.ca.as_ref().unwrap()).unwrap();
		assert!(leaf_a.verify_signature(Some(ca_b.public_key())).is_err());
	}

	/// The seed walk is pure: no ambient randomness reaches the CA key.
	#[test]
	fn derivation_is_pure() {
		let seed: [u8; 32] = Sha256::digest(b"fixed").into();
		let k1 = super::deterministic_keypair(seed).unwrap();
		let k2 = super::deterministic_keypair(seed).unwrap();
		assert_eq!(k1.serialize_der(), k2.serialize_der());
	}

	#[test]
	fn ephemeral_identities_differ() {
		let a = Identity::ephemeral().unwrap();
		let b = Identity::ephemeral().unwrap();
		assert!(a.ca.is_none());
		assert_ne!(a.cert_chain[0].as_ref(), b.cert_chain[0].as_ref());
	}
}
