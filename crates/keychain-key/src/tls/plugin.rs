use super::{KeyMethod, MethodFlags};
use crate::error::{Error, Result};
use crate::report::{self, Function};
use crate::signing::{DelegatedSigner, IdentityHandle, Padding, SigningRequest};

enum PluginState {
    Unbound,
    Bound(IdentityHandle),
    Finalized,
}

/// Sign-only key method backed by a store identity.
///
/// Only `private_encrypt` is implemented. The other three slots panic: a
/// TLS stack reaching them has broken the sign-only contract.
pub struct KeyOperationPlugin {
    state: PluginState,
}

impl KeyOperationPlugin {
    pub const NAME: &'static str = "Mac OSX Keychain RSA Method";

    pub fn new() -> Self {
        Self {
            state: PluginState::Unbound,
        }
    }

    pub fn bound(identity: IdentityHandle) -> Self {
        Self {
            state: PluginState::Bound(identity),
        }
    }

    /// Bind an identity to an unbound plugin.
    ///
    /// On failure the handle is dropped, which releases it.
    pub fn bind(&mut self, identity: IdentityHandle) -> Result<()> {
        match self.state {
            PluginState::Unbound => {
                self.state = PluginState::Bound(identity);
                Ok(())
            }
            PluginState::Bound(_) => Err(Error::PluginState("already bound")),
            PluginState::Finalized => Err(Error::PluginState("finalized")),
        }
    }

    /// Release the bound identity. No-op unless bound.
    pub fn finalize(&mut self) {
        if !self.is_bound() {
            return;
        }
        if let PluginState::Bound(mut identity) =
            std::mem::replace(&mut self.state, PluginState::Finalized)
        {
            identity.release();
            tracing::debug!("key method finalized");
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(self.state, PluginState::Bound(_))
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self.state, PluginState::Finalized)
    }

    fn identity(&self) -> Option<&IdentityHandle> {
        match &self.state {
            PluginState::Bound(identity) => Some(identity),
            _ => None,
        }
    }

    /// Sign `from` into `to`, returning the signature length.
    ///
    /// Failures are also queued on the host error channel.
    pub fn sign_private(&self, from: &[u8], to: &mut [u8], padding: Padding) -> Result<usize> {
        let request = SigningRequest::new(from, padding).with_max_output(to.len());
        let result = DelegatedSigner::sign(self.identity(), &request).and_then(|signature| {
            let written = signature.copy_into(to)?;
            signature.release();
            Ok(written)
        });
        if let Err(error) = &result {
            report::put_error(Function::PrivateEncrypt, error);
        }
        result
    }
}

impl Default for KeyOperationPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for KeyOperationPlugin {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[track_caller]
fn unsupported(operation: &'static str) -> ! {
    let error = Error::UnsupportedOperation(operation);
    report::put_error(Function::PrivateEncrypt, &error);
    tracing::error!("{error}: the sign-only key method cannot serve this call");
    panic!("{error}");
}

impl KeyMethod for KeyOperationPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn flags(&self) -> MethodFlags {
        MethodFlags::NO_CHECK
    }

    fn public_encrypt(&self, _from: &[u8], _to: &mut [u8], _padding: Padding) -> Result<usize> {
        unsupported("public encrypt")
    }

    fn public_decrypt(&self, _from: &[u8], _to: &mut [u8], _padding: Padding) -> Result<usize> {
        unsupported("public decrypt")
    }

    fn private_encrypt(&self, from: &[u8], to: &mut [u8], padding: Padding) -> Result<usize> {
        self.sign_private(from, to, padding)
    }

    fn private_decrypt(&self, _from: &[u8], _to: &mut [u8], _padding: Padding) -> Result<usize> {
        unsupported("private decrypt")
    }

    fn finish(&mut self) {
        self.finalize();
    }
}
