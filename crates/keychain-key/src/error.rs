use crate::signing::Padding;
use crate::store::StoreStatus;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unable to find identity in keychain (certificate + private key): {0}")]
    IdentityNotFound(String),
    #[error("No identity bound to the key object")]
    IdentityMissing,
    #[error("Key usage does not permit signing")]
    KeyUsageMismatch,
    #[error("Unsupported padding type: {0:?}")]
    UnsupportedPadding(Padding),
    #[error("Unable to decode certificate: {0}")]
    CertificateDecodeFailure(String),
    #[error("Unable to sign data with private key: {0}")]
    SignatureContextFailure(StoreStatus),
    #[error("Store returned no signature data")]
    AllocationFailure,
    #[error("Unsupported key operation: {0}")]
    UnsupportedOperation(&'static str),
    #[error("Signature of {needed} bytes does not fit in {available} bytes")]
    OutputTooSmall { needed: usize, available: usize },
    #[error("Unsupported key type: {0}")]
    UnsupportedKeyType(String),
    #[error("Private key does not match the installed certificate")]
    KeyMismatch,
    #[error("No certificate installed in the context")]
    MissingCertificate,
    #[error("Key plugin is {0}")]
    PluginState(&'static str),
    #[error("Invalid store manifest: {0}")]
    Manifest(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Reason code reported on the host error channel.
    pub fn reason(&self) -> u32 {
        use crate::report::reason;

        match self {
            Error::IdentityNotFound(_) => reason::IDENTITY_NOT_FOUND,
            Error::IdentityMissing => reason::PASSED_NULL_PARAMETER,
            Error::KeyUsageMismatch => reason::KEY_USAGE_MISMATCH,
            Error::UnsupportedPadding(_) => reason::UNKNOWN_PADDING_TYPE,
            Error::CertificateDecodeFailure(_) => reason::ASN1_LIB,
            Error::SignatureContextFailure(_) => reason::SIGN_DATA_FAILED,
            Error::AllocationFailure => reason::MALLOC_FAILURE,
            Error::UnsupportedOperation(_) => reason::UNSUPPORTED_OPERATION,
            Error::OutputTooSmall { .. } => reason::OUTPUT_TOO_SMALL,
            Error::UnsupportedKeyType(_) => reason::UNSUPPORTED_KEY_TYPE,
            Error::KeyMismatch => reason::KEY_MISMATCH,
            Error::MissingCertificate => reason::MISSING_CERTIFICATE,
            Error::PluginState(_) => reason::PLUGIN_STATE,
            Error::Manifest(_) => reason::DESCRIPTOR_PARSE,
        }
    }

    /// Whether the TLS caller can recover from this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::UnsupportedOperation(_))
    }
}
