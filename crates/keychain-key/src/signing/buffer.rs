use std::fmt;

use super::IdentityHandle;
use crate::error::{Error, Result};
use crate::store::StoreBuffer;

/// Store-allocated signature, scoped to the identity that produced it.
///
/// Borrowing the [`IdentityHandle`] keeps the identity retained for as long
/// as the buffer lives, and the buffer always goes back through that
/// identity's allocator, exactly once, when released or dropped.
pub struct SignatureBuffer<'h> {
    handle: &'h IdentityHandle,
    buffer: Option<StoreBuffer>,
}

impl<'h> SignatureBuffer<'h> {
    pub fn from_store(handle: &'h IdentityHandle, buffer: StoreBuffer) -> Self {
        Self {
            handle,
            buffer: Some(buffer),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.as_ref().map(StoreBuffer::as_bytes).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// Copy the signature into caller-owned memory.
    pub fn copy_out(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    /// Copy into `to`, returning the number of bytes written.
    pub fn copy_into(&self, to: &mut [u8]) -> Result<usize> {
        let signature = self.as_bytes();
        let available = to.len();
        let target = to.get_mut(..signature.len()).ok_or(Error::OutputTooSmall {
            needed: signature.len(),
            available,
        })?;
        target.copy_from_slice(signature);
        Ok(signature.len())
    }

    pub fn release(mut self) {
        self.free();
    }

    fn free(&mut self) {
        let Some(buffer) = self.buffer.take() else {
            return;
        };
        // The borrow of `handle` keeps its identity retained.
        match self.handle.identity() {
            Some(identity) => self.handle.store().free_buffer(identity, buffer),
            None => tracing::error!(
                allocation = buffer.allocation(),
                "signature buffer outlived its identity"
            ),
        }
    }
}

impl Drop for SignatureBuffer<'_> {
    fn drop(&mut self) {
        self.free();
    }
}

impl fmt::Debug for SignatureBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureBuffer")
            .field("identity", &self.handle.identity())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DigestAlgorithm, IdentityStore, SignAlgorithm};
    use crate::testing::fixture_store;

    fn store_signature(handle: &IdentityHandle) -> StoreBuffer {
        let store = handle.store();
        let identity = handle.identity().unwrap();
        let context = store
            .open_sign_context(identity, SignAlgorithm::Rsa, DigestAlgorithm::None)
            .unwrap();
        let buffer = store.sign(context, &[7; 36]).unwrap();
        store.close_context(context);
        buffer
    }

    #[test]
    fn release_returns_buffer_to_its_provider() {
        let store = fixture_store();
        let handle = IdentityHandle::new(store.clone(), store.find("CN=test-client").unwrap());

        let buffer = SignatureBuffer::from_store(&handle, store_signature(&handle));
        assert_eq!(store.outstanding_allocations(), 1);
        let copy = buffer.copy_out();
        buffer.release();

        assert_eq!(copy.len(), 256);
        assert_eq!(store.outstanding_allocations(), 0);
        assert_eq!(store.stats().free_calls, 1);
        assert_eq!(store.stats().mismatched_frees, 0);
    }

    #[test]
    fn drop_frees_exactly_once() {
        let store = fixture_store();
        let handle = IdentityHandle::new(store.clone(), store.find("CN=test-client").unwrap());
        {
            let _buffer = SignatureBuffer::from_store(&handle, store_signature(&handle));
        }
        assert_eq!(store.stats().free_calls, 1);
        assert_eq!(store.outstanding_allocations(), 0);
    }

    #[test]
    fn copy_into_checks_capacity() {
        let store = fixture_store();
        let handle = IdentityHandle::new(store.clone(), store.find("CN=test-client").unwrap());
        let buffer = SignatureBuffer::from_store(&handle, store_signature(&handle));

        let mut small = [0u8; 128];
        assert!(matches!(
            buffer.copy_into(&mut small),
            Err(Error::OutputTooSmall { needed: 256, available: 128 })
        ));

        let mut large = [0u8; 512];
        assert_eq!(buffer.copy_into(&mut large).unwrap(), 256);
        assert_eq!(&large[..256], buffer.as_bytes());
    }
}
