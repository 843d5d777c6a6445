use super::{IdentityHandle, SignatureBuffer};
use crate::error::{Error, Result};
use crate::report::{self, Function};
use crate::store::{
    ContextHandle, DigestAlgorithm, IdentityRef, IdentityStore, KeyUsage, SignAlgorithm,
    StoreBuffer, StoreStatus,
};

/// Length of the MD5+SHA1 pre-image signed by the legacy TLS RSA scheme.
pub const SSL_SIG_LENGTH: usize = 36;

/// Padding requested by the TLS library, with its numeric codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Padding {
    Pkcs1,
    SslV23,
    None,
    Pkcs1Oaep,
    X931,
    Pkcs1Pss,
    Other(i32),
}

impl Padding {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Padding::Pkcs1,
            2 => Padding::SslV23,
            3 => Padding::None,
            4 => Padding::Pkcs1Oaep,
            5 => Padding::X931,
            6 => Padding::Pkcs1Pss,
            other => Padding::Other(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Padding::Pkcs1 => 1,
            Padding::SslV23 => 2,
            Padding::None => 3,
            Padding::Pkcs1Oaep => 4,
            Padding::X931 => 5,
            Padding::Pkcs1Pss => 6,
            Padding::Other(code) => code,
        }
    }
}

/// One signature requested during a handshake.
#[derive(Clone, Copy, Debug)]
pub struct SigningRequest<'a> {
    /// Pre-image to sign; the store applies PKCS#1 v1.5 block formatting.
    pub payload: &'a [u8],
    pub padding: Padding,
    /// Capacity of the caller's output buffer.
    pub max_output: usize,
}

impl<'a> SigningRequest<'a> {
    pub fn new(payload: &'a [u8], padding: Padding) -> Self {
        Self {
            payload,
            padding,
            max_output: usize::MAX,
        }
    }

    pub fn with_max_output(mut self, max_output: usize) -> Self {
        self.max_output = max_output;
        self
    }
}

/// Open signing context, closed when dropped.
struct SignContext<'s> {
    store: &'s dyn IdentityStore,
    handle: ContextHandle,
}

impl<'s> SignContext<'s> {
    fn open(store: &'s dyn IdentityStore, identity: &IdentityRef) -> Result<Self> {
        let handle = store
            .open_sign_context(identity, DelegatedSigner::ALGORITHM, DigestAlgorithm::None)
            .map_err(|status| {
                tracing::warn!(%status, ?identity, "unable to create signature context");
                sign_data_failure(status)
            })?;
        Ok(Self { store, handle })
    }

    fn sign(&self, payload: &[u8]) -> Result<StoreBuffer> {
        self.store.sign(self.handle, payload).map_err(|status| {
            tracing::warn!(%status, len = payload.len(), "store refused to sign");
            sign_data_failure(status)
        })
    }
}

impl Drop for SignContext<'_> {
    fn drop(&mut self) {
        self.store.close_context(self.handle);
    }
}

/// Store failures are queued against the sign-data function code.
#[track_caller]
fn sign_data_failure(status: StoreStatus) -> Error {
    let error = Error::SignatureContextFailure(status);
    report::put_error(Function::SignData, &error);
    error
}

/// Runs the private-key transform inside the store.
///
/// The caller has already produced the pre-image, so the store is asked
/// for a raw RSA transform with no digest step.
pub struct DelegatedSigner;

impl DelegatedSigner {
    pub const ALGORITHM: SignAlgorithm = SignAlgorithm::Rsa;

    pub fn sign<'h>(
        identity: Option<&'h IdentityHandle>,
        request: &SigningRequest<'_>,
    ) -> Result<SignatureBuffer<'h>> {
        let handle = identity.ok_or(Error::IdentityMissing)?;
        let identity = handle.identity().ok_or(Error::IdentityMissing)?;

        if request.padding != Padding::Pkcs1 {
            return Err(Error::UnsupportedPadding(request.padding));
        }

        let store = handle.store();
        let usage = store.key_usage(identity).map_err(Error::SignatureContextFailure)?;
        if !usage.contains(KeyUsage::SIGN) {
            tracing::warn!(?identity, usage = usage.bits(), "key is not usable for signing");
            return Err(Error::KeyUsageMismatch);
        }

        let signature = {
            let context = SignContext::open(store, identity)?;
            context
                .sign(request.payload)
                .map(|buffer| SignatureBuffer::from_store(handle, buffer))?
        };

        if signature.is_empty() {
            let error = Error::AllocationFailure;
            report::put_error(Function::SignData, &error);
            return Err(error);
        }
        if signature.len() > request.max_output {
            return Err(Error::OutputTooSmall {
                needed: signature.len(),
                available: request.max_output,
            });
        }

        tracing::debug!(?identity, len = signature.len(), "signed with store key");
        Ok(signature)
    }
}
