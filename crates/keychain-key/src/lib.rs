//! Delegated RSA private key for TLS client authentication.
//!
//! A [`ContextBinder`] looks up an identity (certificate plus private key)
//! in an [`IdentityStore`], hands the certificate to a TLS context and
//! installs a sign-only key object whose private operations run inside the
//! store. The private key never leaves the store.

pub mod binder;
pub mod error;
pub mod report;
pub mod signing;
pub mod store;
pub mod tls;

#[cfg(test)]
mod testing;

pub use binder::ContextBinder;
pub use error::{Error, Result};
pub use signing::{DelegatedSigner, IdentityHandle, Padding, SignatureBuffer, SigningRequest};
pub use store::{IdentityStore, SoftStore, StoreManifest};
pub use tls::rustls_client::{ClientIdentity, KeychainClientCert};
pub use tls::{ContextSlots, KeyObject, KeyOperationPlugin, TlsContext};
