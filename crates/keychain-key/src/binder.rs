use std::sync::Arc;

use rsa::RsaPublicKey;
use rsa::traits::PublicKeyParts;

use crate::error::{Error, Result};
use crate::report::{self, Function};
use crate::signing::IdentityHandle;
use crate::store::IdentityStore;
use crate::tls::{KeyObject, KeyOperationPlugin, TlsCertificate, TlsContext};

/// Installs a store identity into a TLS context.
///
/// The certificate goes into the certificate slot and a key object driven
/// by a bound [`KeyOperationPlugin`] into the private-key slot. The private
/// key itself never leaves the store.
pub struct ContextBinder {
    store: Arc<dyn IdentityStore>,
    interactive: bool,
}

impl ContextBinder {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self {
            store,
            interactive: false,
        }
    }

    /// Allow the store to prompt when unlocking.
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn attach<C>(&self, context: &mut C, descriptor: &str) -> Result<()>
    where
        C: TlsContext + ?Sized,
    {
        if let Err(status) = self.store.unlock(self.interactive) {
            tracing::warn!(%status, "unable to unlock identity store, continuing");
        }

        let Some(identity) = self.store.find(descriptor) else {
            let error = Error::IdentityNotFound(descriptor.to_string());
            let function = if descriptor.trim().is_empty() {
                Function::ParseDescriptor
            } else {
                Function::FindIdentity
            };
            report::put_error(function, &error);
            return Err(error);
        };
        // Dropping the handle on any early return below releases the reference.
        let identity = IdentityHandle::new(self.store.clone(), identity);

        let (certificate, public) = self.load_certificate(&identity).inspect_err(|error| {
            report::put_error(Function::UseCertificate, error);
        })?;
        tracing::info!(
            descriptor,
            subject = %certificate.subject(),
            bits = public.size() * 8,
            "attaching store identity"
        );

        context.use_certificate(certificate).inspect_err(|error| {
            report::put_error(Function::UseCertificate, error);
        })?;

        let key = KeyObject::with_method(public, Box::new(KeyOperationPlugin::bound(identity)));
        context.use_private_key(key).inspect_err(|error| {
            report::put_error(Function::UsePrivateKey, error);
        })
    }

    fn load_certificate(&self, identity: &IdentityHandle) -> Result<(TlsCertificate, RsaPublicKey)> {
        let identity_ref = identity.identity().ok_or(Error::IdentityMissing)?;
        let der = self.store.certificate(identity_ref).map_err(|status| {
            tracing::warn!(%status, "unable to copy certificate from identity");
            Error::CertificateDecodeFailure(status.to_string())
        })?;
        let certificate = TlsCertificate::from_der(&der)?;
        let public = certificate.rsa_public_key()?;
        Ok((certificate, public))
    }
}
