use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use x509_cert::Certificate;
use x509_cert::der::{Decode, DecodePem, Encode};
use x509_cert::spki::ObjectIdentifier;

use super::{
    ContextHandle, DigestAlgorithm, IdentityEntry, IdentityRef, IdentityStore, KeyUsage,
    SignAlgorithm, StoreBuffer, StoreManifest, StoreStatus,
};
use crate::tls::RSA_ENCRYPTION;

enum SoftKey {
    Rsa(RsaPrivateKey),
    Unsupported(ObjectIdentifier),
}

struct SoftIdentity {
    label: String,
    subject: String,
    /// Subject attributes as (type, value), e.g. ("CN", "test-client").
    attributes: Vec<(String, String)>,
    certificate_der: Vec<u8>,
    key: SoftKey,
    usage: KeyUsage,
    provider: u32,
}

/// Per-operation call counters and misuse counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StoreStats {
    pub unlock_calls: usize,
    pub find_calls: usize,
    pub certificate_calls: usize,
    pub key_usage_calls: usize,
    pub open_context_calls: usize,
    pub sign_calls: usize,
    pub close_context_calls: usize,
    pub free_calls: usize,
    pub release_calls: usize,
    pub double_releases: usize,
    pub mismatched_frees: usize,
}

impl StoreStats {
    /// Calls that reach key material.
    pub fn signing_calls(&self) -> usize {
        self.open_context_calls + self.sign_calls
    }
}

#[derive(Default)]
struct State {
    locked: bool,
    references: HashMap<IdentityRef, usize>,
    contexts: HashMap<ContextHandle, IdentityRef>,
    next_context: u64,
    next_allocation: u64,
    /// Outstanding allocations per provider.
    allocations: HashMap<u32, HashSet<u64>>,
    fail_next_sign: Option<StoreStatus>,
    stats: StoreStats,
}

/// Software identity store backed by PEM/DER files.
///
/// Private keys are loaded into this process, so it only stands in for a
/// platform keychain. It keeps the bookkeeping a real store does: reference
/// counts, open signing contexts, and per-provider buffer allocations.
pub struct SoftStore {
    identities: Vec<SoftIdentity>,
    state: Mutex<State>,
}

impl SoftStore {
    /// Open the store described by a JSON manifest.
    pub fn open(manifest_path: &Path) -> Result<Self> {
        let manifest = StoreManifest::load(manifest_path)?;
        let base = manifest_path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_manifest(&manifest, base)
    }

    pub fn from_manifest(manifest: &StoreManifest, base: &Path) -> Result<Self> {
        let identities = manifest
            .identities
            .iter()
            .map(|entry| {
                load_identity(entry, base)
                    .with_context(|| format!("loading identity `{}`", entry.label))
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(count = identities.len(), locked = manifest.locked, "opened software store");
        Ok(Self {
            identities,
            state: Mutex::new(State {
                locked: manifest.locked,
                ..State::default()
            }),
        })
    }

    /// Label and subject of every identity, in manifest order.
    pub fn entries(&self) -> Vec<(String, String)> {
        self.identities
            .iter()
            .map(|identity| (identity.label.clone(), identity.subject.clone()))
            .collect()
    }

    pub fn is_locked(&self) -> bool {
        self.state().locked
    }

    pub fn stats(&self) -> StoreStats {
        self.state().stats
    }

    /// Identity references handed out and not yet released.
    pub fn outstanding_references(&self) -> usize {
        self.state().references.values().sum()
    }

    /// Signature buffers not yet returned to their provider.
    pub fn outstanding_allocations(&self) -> usize {
        self.state().allocations.values().map(HashSet::len).sum()
    }

    pub fn open_contexts(&self) -> usize {
        self.state().contexts.len()
    }

    /// Make the next `sign` call fail with `status`.
    pub fn fail_next_sign(&self, status: StoreStatus) {
        self.state().fail_next_sign = Some(status);
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, identity: &IdentityRef) -> Option<&SoftIdentity> {
        let index = usize::try_from(identity.0.checked_sub(1)?).ok()?;
        self.identities.get(index)
    }

    /// Identity that is known and currently referenced.
    fn live(&self, state: &State, identity: &IdentityRef) -> Result<&SoftIdentity, StoreStatus> {
        match state.references.get(identity) {
            Some(count) if *count > 0 => self.lookup(identity).ok_or(StoreStatus::ITEM_NOT_FOUND),
            _ => Err(StoreStatus::ITEM_NOT_FOUND),
        }
    }
}

fn load_identity(entry: &IdentityEntry, base: &Path) -> Result<SoftIdentity> {
    let certificate_path = resolve(base, &entry.certificate);
    let raw = std::fs::read(&certificate_path)
        .with_context(|| format!("reading certificate {}", certificate_path.display()))?;
    let certificate = if raw.starts_with(b"-----BEGIN") {
        Certificate::from_pem(&raw).context("parsing PEM certificate")?
    } else {
        Certificate::from_der(&raw).context("parsing DER certificate")?
    };
    let certificate_der = certificate.to_der().context("encoding certificate")?;

    let subject = certificate.tbs_certificate.subject.to_string();
    let attributes = certificate
        .tbs_certificate
        .subject
        .0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .filter_map(|atv| {
            let text = atv.to_string();
            let (kind, value) = text.split_once('=')?;
            Some((kind.to_string(), value.to_string()))
        })
        .collect();

    let algorithm = certificate.tbs_certificate.subject_public_key_info.algorithm.oid;
    let key = if algorithm == RSA_ENCRYPTION {
        let key_path = resolve(base, &entry.private_key);
        let pem = std::fs::read_to_string(&key_path)
            .with_context(|| format!("reading private key {}", key_path.display()))?;
        SoftKey::Rsa(RsaPrivateKey::from_pkcs8_pem(&pem).context("parsing PKCS#8 RSA key")?)
    } else {
        SoftKey::Unsupported(algorithm)
    };

    Ok(SoftIdentity {
        label: entry.label.clone(),
        subject,
        attributes,
        certificate_der,
        key,
        usage: entry.key_usage()?,
        provider: entry.provider,
    })
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

enum Criteria {
    Label(String),
    Subject(Vec<(String, String)>),
}

impl Criteria {
    /// `label:<name>` or comma separated `ATTR=value` pairs.
    fn parse(descriptor: &str) -> Option<Self> {
        let descriptor = descriptor.trim();
        if let Some(label) = descriptor.strip_prefix("label:") {
            return Some(Criteria::Label(label.trim().to_string()));
        }
        let pairs = descriptor
            .split(',')
            .map(|pair| {
                let (kind, value) = pair.split_once('=')?;
                let (kind, value) = (kind.trim(), value.trim());
                (!kind.is_empty()).then(|| (kind.to_string(), value.to_string()))
            })
            .collect::<Option<Vec<_>>>()?;
        (!pairs.is_empty()).then_some(Criteria::Subject(pairs))
    }

    fn matches(&self, identity: &SoftIdentity) -> bool {
        match self {
            Criteria::Label(label) => identity.label == *label,
            Criteria::Subject(pairs) => pairs.iter().all(|(kind, value)| {
                identity.attributes.iter().any(|(have_kind, have_value)| {
                    have_kind.eq_ignore_ascii_case(kind) && have_value.eq_ignore_ascii_case(value)
                })
            }),
        }
    }
}

impl IdentityStore for SoftStore {
    fn unlock(&self, interactive: bool) -> Result<(), StoreStatus> {
        let mut state = self.state();
        state.stats.unlock_calls += 1;
        if state.locked && !interactive {
            return Err(StoreStatus::INTERACTION_NOT_ALLOWED);
        }
        state.locked = false;
        Ok(())
    }

    fn find(&self, descriptor: &str) -> Option<IdentityRef> {
        let mut state = self.state();
        state.stats.find_calls += 1;

        let Some(criteria) = Criteria::parse(descriptor) else {
            tracing::warn!(descriptor, "unable to parse certificate description string");
            return None;
        };
        let index = self.identities.iter().position(|identity| criteria.matches(identity))?;
        let identity = IdentityRef(index as u64 + 1);
        *state.references.entry(identity).or_default() += 1;
        Some(identity)
    }

    fn certificate(&self, identity: &IdentityRef) -> Result<Vec<u8>, StoreStatus> {
        let mut state = self.state();
        state.stats.certificate_calls += 1;
        Ok(self.live(&state, identity)?.certificate_der.clone())
    }

    fn key_usage(&self, identity: &IdentityRef) -> Result<KeyUsage, StoreStatus> {
        let mut state = self.state();
        state.stats.key_usage_calls += 1;
        Ok(self.live(&state, identity)?.usage)
    }

    fn open_sign_context(
        &self,
        identity: &IdentityRef,
        algorithm: SignAlgorithm,
        digest: DigestAlgorithm,
    ) -> Result<ContextHandle, StoreStatus> {
        let mut state = self.state();
        state.stats.open_context_calls += 1;

        let soft = self.live(&state, identity)?;
        if !soft.usage.contains(KeyUsage::SIGN) {
            return Err(StoreStatus::FUNCTION_FAILED);
        }
        match (&soft.key, algorithm, digest) {
            (SoftKey::Rsa(_), SignAlgorithm::Rsa, DigestAlgorithm::None) => {}
            (SoftKey::Unsupported(oid), ..) => {
                tracing::warn!(%oid, "signing context requested for a non-RSA key");
                return Err(StoreStatus::ALGORITHM_MISMATCH);
            }
        }

        state.next_context += 1;
        let context = ContextHandle(state.next_context);
        state.contexts.insert(context, *identity);
        Ok(context)
    }

    fn sign(&self, context: ContextHandle, payload: &[u8]) -> Result<StoreBuffer, StoreStatus> {
        let mut state = self.state();
        state.stats.sign_calls += 1;

        if let Some(status) = state.fail_next_sign.take() {
            return Err(status);
        }
        if state.locked {
            return Err(StoreStatus::INTERACTION_NOT_ALLOWED);
        }
        let identity = *state.contexts.get(&context).ok_or(StoreStatus::INVALID_CONTEXT)?;
        let soft = self.live(&state, &identity)?;
        let SoftKey::Rsa(key) = &soft.key else {
            return Err(StoreStatus::ALGORITHM_MISMATCH);
        };
        let signature = key.sign(Pkcs1v15Sign::new_unprefixed(), payload).map_err(|e| {
            tracing::debug!(error = %e, len = payload.len(), "raw RSA transform rejected payload");
            StoreStatus::INVALID_DATA
        })?;

        let provider = soft.provider;
        state.next_allocation += 1;
        let allocation = state.next_allocation;
        state.allocations.entry(provider).or_default().insert(allocation);
        Ok(StoreBuffer::new(signature, allocation))
    }

    fn close_context(&self, context: ContextHandle) {
        let mut state = self.state();
        state.stats.close_context_calls += 1;
        if state.contexts.remove(&context).is_none() {
            tracing::warn!(?context, "closing unknown signing context");
        }
    }

    fn free_buffer(&self, identity: &IdentityRef, buffer: StoreBuffer) {
        let mut state = self.state();
        state.stats.free_calls += 1;

        let freed = self.lookup(identity).is_some_and(|soft| {
            state
                .allocations
                .get_mut(&soft.provider)
                .is_some_and(|outstanding| outstanding.remove(&buffer.allocation()))
        });
        if !freed {
            state.stats.mismatched_frees += 1;
            tracing::error!(
                ?identity,
                allocation = buffer.allocation(),
                "buffer freed through an allocator that did not produce it"
            );
        }
    }

    fn release(&self, identity: IdentityRef) {
        let mut state = self.state();
        state.stats.release_calls += 1;
        match state.references.get_mut(&identity) {
            Some(count) if *count > 0 => *count -= 1,
            _ => {
                state.stats.double_releases += 1;
                tracing::error!(?identity, "identity released more often than it was retained");
            }
        }
    }
}
