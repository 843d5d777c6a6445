//! rustls client authentication with a delegated key.
//!
//! rustls asks a [`SigningKey`] for a whole TLS signature. The delegated
//! key only offers the store's PKCS#1 v1.5 transform over a caller-built
//! pre-image, so the DigestInfo encoding is done here and the result goes
//! through the key object's `private_encrypt`. Only `RSA_PKCS1_*` schemes
//! can be served that way, which limits the key to TLS 1.2 handshakes.

use std::sync::Arc;

use rustls::client::ResolvesClientCert;
use rustls::pki_types::CertificateDer;
use rustls::sign::{CertifiedKey, Signer, SigningKey};
use rustls::{SignatureAlgorithm, SignatureScheme};
use sha2::{Digest, Sha256, Sha384, Sha512};

use super::{ContextSlots, KeyObject, TlsCertificate, TlsContext};
use crate::error::{Error, Result};
use crate::signing::Padding;

/// Schemes in order of preference.
const SCHEMES: [SignatureScheme; 3] = [
    SignatureScheme::RSA_PKCS1_SHA512,
    SignatureScheme::RSA_PKCS1_SHA384,
    SignatureScheme::RSA_PKCS1_SHA256,
];

const SHA256_PREFIX: [u8; 19] = [
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
    0x05, 0x00, 0x04, 0x20,
];
const SHA384_PREFIX: [u8; 19] = [
    0x30, 0x41, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02,
    0x05, 0x00, 0x04, 0x30,
];
const SHA512_PREFIX: [u8; 19] = [
    0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03,
    0x05, 0x00, 0x04, 0x40,
];

/// DER DigestInfo of `message` for a PKCS#1 v1.5 scheme.
fn digest_info(scheme: SignatureScheme, message: &[u8]) -> Option<Vec<u8>> {
    let (prefix, digest): (&[u8], Vec<u8>) = match scheme {
        SignatureScheme::RSA_PKCS1_SHA256 => {
            (SHA256_PREFIX.as_slice(), Sha256::digest(message).to_vec())
        }
        SignatureScheme::RSA_PKCS1_SHA384 => {
            (SHA384_PREFIX.as_slice(), Sha384::digest(message).to_vec())
        }
        SignatureScheme::RSA_PKCS1_SHA512 => {
            (SHA512_PREFIX.as_slice(), Sha512::digest(message).to_vec())
        }
        _ => return None,
    };
    Some([prefix, digest.as_slice()].concat())
}

/// Certificate and private-key slots for a rustls client.
#[derive(Debug, Default)]
pub struct ClientIdentity {
    slots: ContextSlots,
}

impl ClientIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finish into a resolver for `ClientConfig::with_client_cert_resolver`.
    pub fn into_resolver(self) -> Result<Arc<KeychainClientCert>> {
        let (certificate, key) = self.slots.into_parts();
        let certificate = certificate.ok_or(Error::MissingCertificate)?;
        let key = key.ok_or(Error::IdentityMissing)?;
        Ok(Arc::new(KeychainClientCert::new(certificate, key)))
    }
}

impl TlsContext for ClientIdentity {
    fn use_certificate(&mut self, certificate: TlsCertificate) -> Result<()> {
        self.slots.use_certificate(certificate)
    }

    fn use_private_key(&mut self, key: KeyObject) -> Result<()> {
        self.slots.use_private_key(key)
    }
}

/// Offers the store identity to every server that accepts RSA PKCS#1.
#[derive(Debug)]
pub struct KeychainClientCert {
    certified: Arc<CertifiedKey>,
}

impl KeychainClientCert {
    pub fn new(certificate: TlsCertificate, key: KeyObject) -> Self {
        let chain = vec![CertificateDer::from(certificate.der().to_vec())];
        let signing_key: Arc<dyn SigningKey> = Arc::new(KeychainSigningKey::new(key));
        Self {
            certified: Arc::new(CertifiedKey::new(chain, signing_key)),
        }
    }
}

impl ResolvesClientCert for KeychainClientCert {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        if SCHEMES.iter().any(|scheme| sigschemes.contains(scheme)) {
            Some(self.certified.clone())
        } else {
            tracing::warn!(?sigschemes, "server accepts no RSA PKCS#1 scheme");
            None
        }
    }

    fn has_certs(&self) -> bool {
        true
    }
}

#[derive(Debug)]
pub struct KeychainSigningKey {
    key: Arc<KeyObject>,
}

impl KeychainSigningKey {
    pub fn new(key: KeyObject) -> Self {
        Self { key: Arc::new(key) }
    }
}

impl SigningKey for KeychainSigningKey {
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<Box<dyn Signer>> {
        let scheme = SCHEMES.into_iter().find(|scheme| offered.contains(scheme))?;
        Some(Box::new(KeychainSigner {
            key: self.key.clone(),
            scheme,
        }))
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::RSA
    }
}

#[derive(Debug)]
struct KeychainSigner {
    key: Arc<KeyObject>,
    scheme: SignatureScheme,
}

impl Signer for KeychainSigner {
    fn sign(&self, message: &[u8]) -> std::result::Result<Vec<u8>, rustls::Error> {
        let pre_image = digest_info(self.scheme, message).ok_or_else(|| {
            rustls::Error::General(format!("unsupported scheme {:?}", self.scheme))
        })?;
        let mut signature = vec![0u8; self.key.size()];
        let written = self
            .key
            .private_encrypt(&pre_image, &mut signature, Padding::Pkcs1)
            .map_err(|e| rustls::Error::General(e.to_string()))?;
        signature.truncate(written);
        Ok(signature)
    }

    fn scheme(&self) -> SignatureScheme {
        self.scheme
    }
}
