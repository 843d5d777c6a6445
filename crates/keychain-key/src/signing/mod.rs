mod buffer;
mod identity;
mod signer;

pub use buffer::SignatureBuffer;
pub use identity::IdentityHandle;
pub use signer::{DelegatedSigner, Padding, SSL_SIG_LENGTH, SigningRequest};
