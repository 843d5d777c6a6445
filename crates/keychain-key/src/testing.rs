use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use rsa::pkcs8::DecodePrivateKey;
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::store::{
    ContextHandle, DigestAlgorithm, IdentityRef, IdentityStore, KeyUsage, SignAlgorithm,
    SoftStore, StoreBuffer, StoreManifest, StoreStatus,
};
use crate::tls::TlsCertificate;

pub fn fixture_dir() -> PathBuf {
    PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures"))
}

pub fn fixture_manifest() -> StoreManifest {
    StoreManifest::load(&fixture_dir().join("store.json")).unwrap()
}

pub fn fixture_store() -> Arc<SoftStore> {
    Arc::new(SoftStore::from_manifest(&fixture_manifest(), &fixture_dir()).unwrap())
}

pub fn fixture_certificate(label: &str) -> TlsCertificate {
    let der = std::fs::read(fixture_dir().join(format!("{label}.crt.der"))).unwrap();
    TlsCertificate::from_der(&der).unwrap()
}

pub fn fixture_public_key(label: &str) -> RsaPublicKey {
    let pem = std::fs::read_to_string(fixture_dir().join(format!("{label}.key.pem"))).unwrap();
    RsaPrivateKey::from_pkcs8_pem(&pem).unwrap().to_public_key()
}

#[derive(Debug, Default)]
pub struct StubCounts {
    pub found: usize,
    pub released: usize,
    pub open_contexts: usize,
    pub allocations: usize,
}

/// Single-identity store that hands back fixed certificate and signature
/// bytes, for paths the software store cannot reach.
#[derive(Default)]
pub struct StubStore {
    pub certificate: Vec<u8>,
    pub signature: Vec<u8>,
    pub(crate) counts: Mutex<StubCounts>,
}

impl StubStore {
    pub fn counts(&self) -> MutexGuard<'_, StubCounts> {
        self.counts.lock().unwrap()
    }
}

impl IdentityStore for StubStore {
    fn unlock(&self, _interactive: bool) -> Result<(), StoreStatus> {
        Ok(())
    }

    fn find(&self, _descriptor: &str) -> Option<IdentityRef> {
        self.counts().found += 1;
        Some(IdentityRef(1))
    }

    fn certificate(&self, _identity: &IdentityRef) -> Result<Vec<u8>, StoreStatus> {
        Ok(self.certificate.clone())
    }

    fn key_usage(&self, _identity: &IdentityRef) -> Result<KeyUsage, StoreStatus> {
        Ok(KeyUsage::SIGN)
    }

    fn open_sign_context(
        &self,
        _identity: &IdentityRef,
        _algorithm: SignAlgorithm,
        _digest: DigestAlgorithm,
    ) -> Result<ContextHandle, StoreStatus> {
        self.counts().open_contexts += 1;
        Ok(ContextHandle(1))
    }

    fn sign(&self, _context: ContextHandle, _payload: &[u8]) -> Result<StoreBuffer, StoreStatus> {
        self.counts().allocations += 1;
        Ok(StoreBuffer::new(self.signature.clone(), 1))
    }

    fn close_context(&self, _context: ContextHandle) {
        self.counts().open_contexts -= 1;
    }

    fn free_buffer(&self, _identity: &IdentityRef, _buffer: StoreBuffer) {
        self.counts().allocations -= 1;
    }

    fn release(&self, _identity: IdentityRef) {
        self.counts().released += 1;
    }
}
