use std::fmt;
use std::sync::Arc;

use crate::store::{IdentityRef, IdentityStore};

/// Owner of one retained identity reference.
///
/// The reference goes back to the store exactly once, either through
/// [`IdentityHandle::release`] or when the handle is dropped.
pub struct IdentityHandle {
    store: Arc<dyn IdentityStore>,
    identity: Option<IdentityRef>,
}

impl IdentityHandle {
    /// Take ownership of a reference returned by [`IdentityStore::find`].
    pub fn new(store: Arc<dyn IdentityStore>, identity: IdentityRef) -> Self {
        Self {
            store,
            identity: Some(identity),
        }
    }

    pub fn store(&self) -> &dyn IdentityStore {
        self.store.as_ref()
    }

    /// The held reference, `None` once released.
    pub fn identity(&self) -> Option<&IdentityRef> {
        self.identity.as_ref()
    }

    pub fn is_released(&self) -> bool {
        self.identity.is_none()
    }

    pub(crate) fn release(&mut self) {
        if let Some(identity) = self.identity.take() {
            tracing::trace!(?identity, "releasing identity");
            self.store.release(identity);
        }
    }
}

impl Drop for IdentityHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for IdentityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityHandle")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}
