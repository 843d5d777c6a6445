//! Host error channel.
//!
//! Failures surfaced to the TLS caller are queued per thread, the way a
//! TLS library keeps its error stack, and carry numeric library, function
//! and reason codes. The code-to-string table is process wide and built on
//! first use.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::Location;
use std::sync::OnceLock;

use crate::error::Error;

/// First user library code plus 70.
pub const LIB_KEYCHAIN: u32 = 128 + 70;

/// Oldest records are dropped past this depth.
const MAX_QUEUED_ERRORS: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Function {
    FindIdentity = 101,
    ParseDescriptor = 102,
    SignData = 103,
    PrivateEncrypt = 104,
    UseCertificate = 105,
    UsePrivateKey = 106,
}

pub mod reason {
    pub const IDENTITY_NOT_FOUND: u32 = 101;
    pub const DESCRIPTOR_PARSE: u32 = 102;
    pub const SIGN_DATA_FAILED: u32 = 103;
    pub const KEY_USAGE_MISMATCH: u32 = 104;
    pub const UNSUPPORTED_OPERATION: u32 = 105;
    pub const OUTPUT_TOO_SMALL: u32 = 106;
    pub const UNSUPPORTED_KEY_TYPE: u32 = 107;
    pub const KEY_MISMATCH: u32 = 108;
    pub const MISSING_CERTIFICATE: u32 = 109;
    pub const PLUGIN_STATE: u32 = 110;
    pub const UNKNOWN_PADDING_TYPE: u32 = 118;
    pub const PASSED_NULL_PARAMETER: u32 = 0x43;
    pub const MALLOC_FAILURE: u32 = 0x41;
    pub const ASN1_LIB: u32 = 0x0d;
}

struct StringTable {
    library: &'static str,
    functions: HashMap<u32, &'static str>,
    reasons: HashMap<u32, &'static str>,
}

static STRINGS: OnceLock<StringTable> = OnceLock::new();

fn strings() -> &'static StringTable {
    STRINGS.get_or_init(|| {
        tracing::trace!("registering keychain error strings");
        let functions = HashMap::from([
            (Function::FindIdentity as u32, "findIdentity"),
            (Function::ParseDescriptor as u32, "createCertDataFromString"),
            (Function::SignData as u32, "signData"),
            (Function::PrivateEncrypt as u32, "privateEncrypt"),
            (Function::UseCertificate as u32, "useCertificate"),
            (Function::UsePrivateKey as u32, "usePrivateKey"),
        ]);
        let reasons = HashMap::from([
            (
                reason::IDENTITY_NOT_FOUND,
                "Unable to find identity in keychain (certificate + private key)",
            ),
            (reason::DESCRIPTOR_PARSE, "Unable to parse certificate description string"),
            (reason::SIGN_DATA_FAILED, "Unable to sign data with private key"),
            (reason::KEY_USAGE_MISMATCH, "Key usage does not permit signing"),
            (reason::UNSUPPORTED_OPERATION, "Operation not supported by a sign-only key"),
            (reason::OUTPUT_TOO_SMALL, "Output buffer too small for signature"),
            (reason::UNSUPPORTED_KEY_TYPE, "Unsupported key type"),
            (reason::KEY_MISMATCH, "Private key does not match certificate"),
            (reason::MISSING_CERTIFICATE, "No certificate assigned"),
            (reason::PLUGIN_STATE, "Key method in wrong state"),
            (reason::UNKNOWN_PADDING_TYPE, "unknown padding type"),
            (reason::PASSED_NULL_PARAMETER, "passed a null parameter"),
            (reason::MALLOC_FAILURE, "malloc failure"),
            (reason::ASN1_LIB, "ASN1 lib"),
        ]);
        StringTable {
            library: "Mac OSX Keychain",
            functions,
            reasons,
        }
    })
}

/// Human readable text for a reason code.
pub fn error_string(reason: u32) -> Option<&'static str> {
    strings().reasons.get(&reason).copied()
}

pub fn function_string(function: Function) -> &'static str {
    strings()
        .functions
        .get(&(function as u32))
        .copied()
        .unwrap_or("unknown function")
}

pub fn library_string() -> &'static str {
    strings().library
}

/// One queued failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorRecord {
    pub library: u32,
    pub function: Function,
    pub reason: u32,
    pub file: &'static str,
    pub line: u32,
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "error:{:02X}{:03X}{:03X}:{}:{}:{}:{}:{}",
            self.library,
            self.function as u32,
            self.reason,
            library_string(),
            function_string(self.function),
            error_string(self.reason).unwrap_or("unknown reason"),
            self.file,
            self.line,
        )
    }
}

thread_local! {
    static QUEUE: RefCell<VecDeque<ErrorRecord>> = const { RefCell::new(VecDeque::new()) };
}

/// Queue `error` against `function`, recording the caller's location.
#[track_caller]
pub fn put_error(function: Function, error: &Error) {
    let location = Location::caller();
    let record = ErrorRecord {
        library: LIB_KEYCHAIN,
        function,
        reason: error.reason(),
        file: location.file(),
        line: location.line(),
    };
    tracing::debug!(%record, "{error}");
    QUEUE.with(|queue| {
        let mut queue = queue.borrow_mut();
        if queue.len() == MAX_QUEUED_ERRORS {
            queue.pop_front();
        }
        queue.push_back(record);
    });
}

/// Pop the oldest queued record.
pub fn get_error() -> Option<ErrorRecord> {
    QUEUE.with(|queue| queue.borrow_mut().pop_front())
}

/// Most recent record, left in place.
pub fn peek_last_error() -> Option<ErrorRecord> {
    QUEUE.with(|queue| queue.borrow().back().cloned())
}

pub fn clear_errors() {
    QUEUE.with(|queue| queue.borrow_mut().clear());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_table_is_initialized_once_across_threads() {
        let addresses: Vec<usize> = (0..8)
            .map(|_| std::thread::spawn(|| strings() as *const StringTable as usize))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();
        assert!(addresses.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[test]
    fn keychain_strings_are_registered() {
        assert_eq!(
            error_string(reason::IDENTITY_NOT_FOUND),
            Some("Unable to find identity in keychain (certificate + private key)")
        );
        assert_eq!(function_string(Function::SignData), "signData");
        assert_eq!(library_string(), "Mac OSX Keychain");
        assert_eq!(error_string(9999), None);
    }

    #[test]
    fn queue_is_fifo_and_records_location() {
        clear_errors();
        put_error(Function::FindIdentity, &Error::IdentityNotFound("CN=a".into()));
        put_error(Function::PrivateEncrypt, &Error::KeyUsageMismatch);

        let last = peek_last_error().unwrap();
        assert_eq!(last.function, Function::PrivateEncrypt);

        let first = get_error().unwrap();
        assert_eq!(first.library, LIB_KEYCHAIN);
        assert_eq!(first.reason, reason::IDENTITY_NOT_FOUND);
        assert!(first.file.ends_with("report.rs"));
        assert_eq!(get_error().unwrap().reason, reason::KEY_USAGE_MISMATCH);
        assert!(get_error().is_none());
    }

    #[test]
    fn queue_is_bounded() {
        clear_errors();
        for _ in 0..MAX_QUEUED_ERRORS + 4 {
            put_error(Function::SignData, &Error::AllocationFailure);
        }
        let drained = std::iter::from_fn(get_error).count();
        assert_eq!(drained, MAX_QUEUED_ERRORS);
    }

    #[test]
    fn queue_is_per_thread() {
        clear_errors();
        put_error(Function::SignData, &Error::AllocationFailure);
        let seen_elsewhere = std::thread::spawn(|| get_error().is_some()).join().unwrap();
        assert!(!seen_elsewhere);
        assert!(get_error().is_some());
    }

    #[test]
    fn record_display_names_function_and_reason() {
        let record = ErrorRecord {
            library: LIB_KEYCHAIN,
            function: Function::FindIdentity,
            reason: reason::IDENTITY_NOT_FOUND,
            file: "binder.rs",
            line: 7,
        };
        let text = record.to_string();
        assert!(text.starts_with("error:C6065065:"));
        assert!(text.contains("findIdentity"));
        assert!(text.ends_with("binder.rs:7"));
    }
}
