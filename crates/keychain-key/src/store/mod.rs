mod manifest;
mod soft;

pub use manifest::{IdentityEntry, StoreManifest};
pub use soft::{SoftStore, StoreStats};

use std::fmt;
use std::ops::BitOr;

/// Opaque reference to a (certificate, private key) pair held by a store.
///
/// Every reference handed out by [`IdentityStore::find`] carries one
/// reference count that must be returned through [`IdentityStore::release`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct IdentityRef(pub u64);

/// Handle of an open signing context.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ContextHandle(pub u64);

/// Non-zero status returned by a store call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StoreStatus(pub i32);

impl StoreStatus {
    pub const INTERACTION_NOT_ALLOWED: StoreStatus = StoreStatus(-25308);
    pub const ITEM_NOT_FOUND: StoreStatus = StoreStatus(-25300);
    pub const INVALID_CONTEXT: StoreStatus = StoreStatus(-2147418111);
    pub const INVALID_DATA: StoreStatus = StoreStatus(-2147418110);
    pub const ALGORITHM_MISMATCH: StoreStatus = StoreStatus(-2147418109);
    pub const FUNCTION_FAILED: StoreStatus = StoreStatus(-2147418108);
}

impl fmt::Display for StoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store status {}", self.0)
    }
}

/// Usage bits recorded in a key header.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct KeyUsage(u32);

impl KeyUsage {
    pub const ENCRYPT: KeyUsage = KeyUsage(0x0001);
    pub const DECRYPT: KeyUsage = KeyUsage(0x0002);
    pub const SIGN: KeyUsage = KeyUsage(0x0004);
    pub const VERIFY: KeyUsage = KeyUsage(0x0008);
    pub const DERIVE: KeyUsage = KeyUsage(0x0040);
    pub const WRAP: KeyUsage = KeyUsage(0x0080);
    pub const UNWRAP: KeyUsage = KeyUsage(0x0100);

    pub const fn empty() -> Self {
        KeyUsage(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: KeyUsage) -> bool {
        self.0 & other.0 == other.0
    }

    /// Parse a usage name as written in a store manifest.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "encrypt" => Some(Self::ENCRYPT),
            "decrypt" => Some(Self::DECRYPT),
            "sign" => Some(Self::SIGN),
            "verify" => Some(Self::VERIFY),
            "derive" => Some(Self::DERIVE),
            "wrap" => Some(Self::WRAP),
            "unwrap" => Some(Self::UNWRAP),
            _ => None,
        }
    }
}

impl BitOr for KeyUsage {
    type Output = KeyUsage;

    fn bitor(self, rhs: KeyUsage) -> KeyUsage {
        KeyUsage(self.0 | rhs.0)
    }
}

/// Asymmetric algorithm requested for a signing context.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignAlgorithm {
    Rsa,
}

/// Digest applied by the store before the private-key transform.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DigestAlgorithm {
    /// Raw transform over the caller's bytes.
    None,
}

/// Signature bytes allocated by the store.
///
/// The allocation belongs to the provider backing the identity that
/// produced it and goes back through [`IdentityStore::free_buffer`].
#[derive(Debug)]
pub struct StoreBuffer {
    data: Box<[u8]>,
    allocation: u64,
}

impl StoreBuffer {
    pub fn new(data: Vec<u8>, allocation: u64) -> Self {
        Self {
            data: data.into_boxed_slice(),
            allocation,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Store-side allocation id.
    pub fn allocation(&self) -> u64 {
        self.allocation
    }
}

/// Platform credential store holding identities whose private keys never
/// leave it.
///
/// Calls may block, e.g. while the platform waits on the user.
pub trait IdentityStore: Send + Sync {
    /// Unlock the store, optionally allowing user interaction.
    fn unlock(&self, interactive: bool) -> Result<(), StoreStatus>;

    /// Look up an identity by a certificate-selection descriptor.
    fn find(&self, descriptor: &str) -> Option<IdentityRef>;

    /// DER encoded certificate of the identity.
    fn certificate(&self, identity: &IdentityRef) -> Result<Vec<u8>, StoreStatus>;

    fn key_usage(&self, identity: &IdentityRef) -> Result<KeyUsage, StoreStatus>;

    fn open_sign_context(
        &self,
        identity: &IdentityRef,
        algorithm: SignAlgorithm,
        digest: DigestAlgorithm,
    ) -> Result<ContextHandle, StoreStatus>;

    fn sign(&self, context: ContextHandle, payload: &[u8]) -> Result<StoreBuffer, StoreStatus>;

    fn close_context(&self, context: ContextHandle);

    /// Return a signature buffer to the allocator of the identity's provider.
    fn free_buffer(&self, identity: &IdentityRef, buffer: StoreBuffer);

    /// Drop one reference count of the identity.
    fn release(&self, identity: IdentityRef);
}
