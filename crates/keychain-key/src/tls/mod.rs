//! The TLS library side: key objects driven through a method table, and the
//! certificate/private-key slots of a context.

mod plugin;
pub mod rustls_client;

pub use plugin::KeyOperationPlugin;

use std::fmt;

use rsa::RsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use x509_cert::Certificate;
use x509_cert::der::{Decode, Encode};
use x509_cert::spki::ObjectIdentifier;

use crate::error::{Error, Result};
use crate::signing::Padding;

pub(crate) const RSA_ENCRYPTION: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");

/// Capability flags of a key method.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MethodFlags(u32);

impl MethodFlags {
    /// The method enforces padding and sizes itself.
    pub const NO_CHECK: MethodFlags = MethodFlags(0x0001);

    pub const fn empty() -> Self {
        MethodFlags(0)
    }

    pub const fn contains(self, other: MethodFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Operation table a TLS library calls on a private-key object.
pub trait KeyMethod: Send + Sync {
    fn name(&self) -> &str;

    fn flags(&self) -> MethodFlags;

    /// Public-key encryption.
    fn public_encrypt(&self, from: &[u8], to: &mut [u8], padding: Padding) -> Result<usize>;

    /// Public-key decryption, i.e. signature recovery.
    fn public_decrypt(&self, from: &[u8], to: &mut [u8], padding: Padding) -> Result<usize>;

    /// Private-key encryption, i.e. signing.
    fn private_encrypt(&self, from: &[u8], to: &mut [u8], padding: Padding) -> Result<usize>;

    fn private_decrypt(&self, from: &[u8], to: &mut [u8], padding: Padding) -> Result<usize>;

    /// Called once the owning key object is freed.
    fn finish(&mut self);
}

/// Private-key object as held by a TLS context.
///
/// Only the public modulus lives here; every private operation goes
/// through the installed [`KeyMethod`].
pub struct KeyObject {
    public: RsaPublicKey,
    method: Box<dyn KeyMethod>,
}

impl KeyObject {
    pub fn with_method(public: RsaPublicKey, method: Box<dyn KeyMethod>) -> Self {
        tracing::debug!(method = method.name(), bits = public.size() * 8, "installing key method");
        Self { public, method }
    }

    /// Modulus size in bytes, which is also the signature size.
    pub fn size(&self) -> usize {
        self.public.size()
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    pub fn method_name(&self) -> &str {
        self.method.name()
    }

    pub fn flags(&self) -> MethodFlags {
        self.method.flags()
    }

    pub fn public_encrypt(&self, from: &[u8], to: &mut [u8], padding: Padding) -> Result<usize> {
        self.check_output(to)?;
        self.method.public_encrypt(from, to, padding)
    }

    pub fn public_decrypt(&self, from: &[u8], to: &mut [u8], padding: Padding) -> Result<usize> {
        self.check_output(to)?;
        self.method.public_decrypt(from, to, padding)
    }

    pub fn private_encrypt(&self, from: &[u8], to: &mut [u8], padding: Padding) -> Result<usize> {
        self.check_output(to)?;
        self.method.private_encrypt(from, to, padding)
    }

    pub fn private_decrypt(&self, from: &[u8], to: &mut [u8], padding: Padding) -> Result<usize> {
        self.check_output(to)?;
        self.method.private_decrypt(from, to, padding)
    }

    /// Library-side size check, skipped for methods flagged `NO_CHECK`.
    fn check_output(&self, to: &[u8]) -> Result<()> {
        if self.flags().contains(MethodFlags::NO_CHECK) || to.len() >= self.size() {
            Ok(())
        } else {
            Err(Error::OutputTooSmall {
                needed: self.size(),
                available: to.len(),
            })
        }
    }
}

impl Drop for KeyObject {
    fn drop(&mut self) {
        self.method.finish();
    }
}

impl fmt::Debug for KeyObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyObject")
            .field("method", &self.method.name())
            .field("bits", &(self.size() * 8))
            .finish()
    }
}

/// DER certificate accepted into a context's certificate slot.
#[derive(Clone, Debug)]
pub struct TlsCertificate {
    der: Vec<u8>,
    certificate: Certificate,
}

impl TlsCertificate {
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let certificate =
            Certificate::from_der(der).map_err(|e| Error::CertificateDecodeFailure(e.to_string()))?;
        Ok(Self {
            der: der.to_vec(),
            certificate,
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn subject(&self) -> String {
        self.certificate.tbs_certificate.subject.to_string()
    }

    /// RSA public key from the subject public key info.
    pub fn rsa_public_key(&self) -> Result<RsaPublicKey> {
        let spki = &self.certificate.tbs_certificate.subject_public_key_info;
        if spki.algorithm.oid != RSA_ENCRYPTION {
            return Err(Error::UnsupportedKeyType(spki.algorithm.oid.to_string()));
        }
        let der = spki
            .to_der()
            .map_err(|e| Error::CertificateDecodeFailure(e.to_string()))?;
        RsaPublicKey::from_public_key_der(&der)
            .map_err(|e| Error::CertificateDecodeFailure(e.to_string()))
    }
}

/// Certificate and private-key slots of a TLS context.
pub trait TlsContext {
    fn use_certificate(&mut self, certificate: TlsCertificate) -> Result<()>;

    fn use_private_key(&mut self, key: KeyObject) -> Result<()>;
}

/// Plain slot pair; the key must match the installed certificate.
#[derive(Debug, Default)]
pub struct ContextSlots {
    certificate: Option<TlsCertificate>,
    private_key: Option<KeyObject>,
}

impl ContextSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn certificate(&self) -> Option<&TlsCertificate> {
        self.certificate.as_ref()
    }

    pub fn private_key(&self) -> Option<&KeyObject> {
        self.private_key.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.certificate.is_none() && self.private_key.is_none()
    }

    pub fn into_parts(self) -> (Option<TlsCertificate>, Option<KeyObject>) {
        (self.certificate, self.private_key)
    }
}

impl TlsContext for ContextSlots {
    fn use_certificate(&mut self, certificate: TlsCertificate) -> Result<()> {
        if let Some(key) = &self.private_key {
            let matches = certificate
                .rsa_public_key()
                .is_ok_and(|public| public == *key.public_key());
            if !matches {
                tracing::warn!("dropping private key that does not match the new certificate");
                self.private_key = None;
            }
        }
        self.certificate = Some(certificate);
        Ok(())
    }

    fn use_private_key(&mut self, key: KeyObject) -> Result<()> {
        let certificate = self.certificate.as_ref().ok_or(Error::MissingCertificate)?;
        if certificate.rsa_public_key()? != *key.public_key() {
            return Err(Error::KeyMismatch);
        }
        self.private_key = Some(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture_certificate, fixture_public_key};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Method that counts `finish` calls and echoes its input.
    struct Echo {
        finished: Arc<AtomicUsize>,
        flags: MethodFlags,
    }

    impl KeyMethod for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn flags(&self) -> MethodFlags {
            self.flags
        }

        fn public_encrypt(&self, from: &[u8], to: &mut [u8], _: Padding) -> Result<usize> {
            to[..from.len()].copy_from_slice(from);
            Ok(from.len())
        }

        fn public_decrypt(&self, from: &[u8], to: &mut [u8], p: Padding) -> Result<usize> {
            self.public_encrypt(from, to, p)
        }

        fn private_encrypt(&self, from: &[u8], to: &mut [u8], p: Padding) -> Result<usize> {
            self.public_encrypt(from, to, p)
        }

        fn private_decrypt(&self, from: &[u8], to: &mut [u8], p: Padding) -> Result<usize> {
            self.public_encrypt(from, to, p)
        }

        fn finish(&mut self) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn echo_key(label: &str, flags: MethodFlags) -> (KeyObject, Arc<AtomicUsize>) {
        let finished = Arc::new(AtomicUsize::new(0));
        let method = Echo {
            finished: finished.clone(),
            flags,
        };
        (KeyObject::with_method(fixture_public_key(label), Box::new(method)), finished)
    }

    #[test]
    fn dropping_key_object_finishes_method() {
        let (key, finished) = echo_key("test-client", MethodFlags::empty());
        assert_eq!(key.size(), 256);
        drop(key);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn output_size_checked_unless_no_check() {
        let (checked, _) = echo_key("test-client", MethodFlags::empty());
        let mut small = [0u8; 64];
        assert!(matches!(
            checked.private_encrypt(&[1; 36], &mut small, Padding::Pkcs1),
            Err(Error::OutputTooSmall { needed: 256, available: 64 })
        ));

        let (unchecked, _) = echo_key("test-client", MethodFlags::NO_CHECK);
        assert_eq!(unchecked.private_encrypt(&[1; 36], &mut small, Padding::Pkcs1).unwrap(), 36);
    }

    #[test]
    fn certificate_exposes_rsa_key_and_subject() {
        let certificate = fixture_certificate("test-client");
        assert!(certificate.subject().contains("CN=test-client"));
        assert_eq!(certificate.rsa_public_key().unwrap(), fixture_public_key("test-client"));
    }

    #[test]
    fn ec_certificate_is_unsupported() {
        let certificate = fixture_certificate("ec-client");
        assert!(matches!(
            certificate.rsa_public_key(),
            Err(Error::UnsupportedKeyType(_))
        ));
    }

    #[test]
    fn garbage_is_not_a_certificate() {
        assert!(matches!(
            TlsCertificate::from_der(b"not a certificate"),
            Err(Error::CertificateDecodeFailure(_))
        ));
    }

    #[test]
    fn slots_reject_key_without_certificate() {
        let mut slots = ContextSlots::new();
        let (key, finished) = echo_key("test-client", MethodFlags::empty());
        assert!(matches!(slots.use_private_key(key), Err(Error::MissingCertificate)));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(slots.is_empty());
    }

    #[test]
    fn slots_reject_mismatched_key() {
        let mut slots = ContextSlots::new();
        slots.use_certificate(fixture_certificate("test-client")).unwrap();
        let (key, _) = echo_key("no-sign-client", MethodFlags::empty());
        assert!(matches!(slots.use_private_key(key), Err(Error::KeyMismatch)));
        assert!(slots.private_key().is_none());
    }

    #[test]
    fn new_certificate_evicts_mismatched_key() {
        let mut slots = ContextSlots::new();
        slots.use_certificate(fixture_certificate("test-client")).unwrap();
        let (key, finished) = echo_key("test-client", MethodFlags::empty());
        slots.use_private_key(key).unwrap();

        slots.use_certificate(fixture_certificate("no-sign-client")).unwrap();
        assert!(slots.private_key().is_none());
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
