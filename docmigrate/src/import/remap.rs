//! Identifier remapping for a single migration run
//!
//! Every imported record gets a new backend id. Source-system ids are
//! recorded per collection so references can be rewritten after creation.
//! A primary key that cannot be used as an id verbatim is hashed into one,
//! so the same key maps to the same document on every run.
//! Identity-bearing records are deduplicated by email and phone: records
//! sharing a contact value collapse into one canonical id, and each
//! collection's merge map remembers every original id folded into it.

use std::collections::{BTreeMap, HashMap, HashSet};

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use uuid::Uuid;

use crate::api::{BackendError, IdentityRecord, IdentityStore};
use crate::import::IdentityOutcome;

/// Maximum backend id length
pub const MAX_ID_LEN: usize = 36;
/// Length of generated ids
pub const GENERATED_ID_LEN: usize = 20;

static VALID_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._\-]{0,35}$").expect("valid id regex"));

/// Whether `candidate` can be used verbatim as a backend document id
pub fn is_valid_id(candidate: &str) -> bool {
    VALID_ID_RE.is_match(candidate)
}

/// Stable id for a key that is not a valid id itself
pub fn derive_id(collection: &str, key: &str) -> String {
    let name = format!("{}/{}", collection, key);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
        .simple()
        .to_string()
}

/// Lowercase and trim an email; empty values are not indexable
pub fn normalize_email(email: &str) -> Option<String> {
    let email = email.trim().to_lowercase();
    (!email.is_empty()).then_some(email)
}

/// Keep digits and a leading `+`; empty values are not indexable
pub fn normalize_phone(phone: &str) -> Option<String> {
    let trimmed = phone.trim();
    let mut normalized: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if normalized.is_empty() {
        return None;
    }
    if trimmed.starts_with('+') {
        normalized.insert(0, '+');
    }
    Some(normalized)
}

/// Produces random lowercase alphanumeric ids
#[derive(Debug, Clone, Default)]
pub struct IdGenerator;

impl IdGenerator {
    pub fn generate(&self) -> String {
        const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        let mut rng = rand::rng();
        (0..GENERATED_ID_LEN)
            .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
            .collect()
    }
}

/// Error when assigning ids
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemapError {
    /// The original id already has a new id in this run
    DuplicateOriginalId { collection: String, original_id: String },
}

impl std::fmt::Display for RemapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemapError::DuplicateOriginalId {
                collection,
                original_id,
            } => write!(
                f,
                "original id '{}' already imported into '{}' in this run",
                original_id, collection
            ),
        }
    }
}

impl std::error::Error for RemapError {}

/// Old id -> new id for one collection
#[derive(Debug, Clone, Default)]
pub struct IdentifierMap {
    old_to_new: HashMap<String, String>,
    used_new: HashSet<String>,
}

impl IdentifierMap {
    pub fn get(&self, old_id: &str) -> Option<&str> {
        self.old_to_new.get(old_id).map(|s| s.as_str())
    }

    pub fn contains_old(&self, old_id: &str) -> bool {
        self.old_to_new.contains_key(old_id)
    }

    pub fn is_used(&self, new_id: &str) -> bool {
        self.used_new.contains(new_id)
    }

    /// Reserve a new id that has no original id
    fn reserve(&mut self, new_id: &str) {
        self.used_new.insert(new_id.to_string());
    }

    fn bind(&mut self, old_id: &str, new_id: &str) {
        self.old_to_new.insert(old_id.to_string(), new_id.to_string());
        self.used_new.insert(new_id.to_string());
    }

    pub fn len(&self) -> usize {
        self.old_to_new.len()
    }

    pub fn is_empty(&self) -> bool {
        self.old_to_new.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.old_to_new.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Canonical id -> every original id collapsed into it
#[derive(Debug, Clone, Default)]
pub struct IdentityMergeMap {
    merges: BTreeMap<String, Vec<String>>,
    canonical_by_old: HashMap<String, String>,
}

impl IdentityMergeMap {
    /// Record that `old_id` is represented by `canonical`
    pub fn record(&mut self, canonical: &str, old_id: &str) {
        let list = self.merges.entry(canonical.to_string()).or_default();
        if !list.iter().any(|o| o == old_id) {
            list.push(old_id.to_string());
        }
        self.canonical_by_old
            .insert(old_id.to_string(), canonical.to_string());
    }

    pub fn merged(&self, canonical: &str) -> &[String] {
        self.merges.get(canonical).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn canonical_for(&self, old_id: &str) -> Option<&str> {
        self.canonical_by_old.get(old_id).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.merges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.merges.is_empty()
    }
}

/// How to resolve an email match and a phone match that disagree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AmbiguityPolicy {
    /// Bind to the identity matched by email and log the conflict
    #[default]
    PreferEmail,
}

/// Contact details used to match identities
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Contact {
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl Contact {
    pub fn new(email: Option<&str>, phone: Option<&str>) -> Self {
        Contact {
            email: email.and_then(normalize_email),
            phone: phone.and_then(normalize_phone),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.phone.is_none()
    }
}

/// Result of binding an identity record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityBinding {
    pub id: String,
    pub outcome: IdentityOutcome,
}

/// Counters reported at the end of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemapStats {
    pub assigned: usize,
    pub identities_new: usize,
    pub identities_existing: usize,
    pub identities_merged: usize,
    pub ambiguous_merges: usize,
    pub collisions: usize,
}

/// Per-run id assignment state
#[derive(Debug, Default)]
pub struct IdRemapper {
    generator: IdGenerator,
    maps: HashMap<String, IdentifierMap>,
    merges: HashMap<String, IdentityMergeMap>,
    by_email: HashMap<String, String>,
    by_phone: HashMap<String, String>,
    /// Identities present in the store before the run
    seeded: HashSet<String>,
    /// Seeded identities already bound to a record in this run
    claimed: HashSet<String>,
    /// Identity ids in use across all identity collections
    identity_ids: HashSet<String>,
    identities_seeded: bool,
    policy: AmbiguityPolicy,
    stats: RemapStats,
}

impl IdRemapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: AmbiguityPolicy) -> Self {
        IdRemapper {
            policy,
            ..Self::default()
        }
    }

    pub fn stats(&self) -> RemapStats {
        self.stats
    }

    pub fn map(&self, collection: &str) -> Option<&IdentifierMap> {
        self.maps.get(collection)
    }

    pub fn merges(&self, collection: &str) -> Option<&IdentityMergeMap> {
        self.merges.get(collection)
    }

    fn record_merge(&mut self, collection: &str, canonical: &str, old_id: &str) {
        self.merges
            .entry(collection.to_string())
            .or_default()
            .record(canonical, old_id);
    }

    /// Look up the new id of `old_id` in `collection`
    pub fn lookup(&self, collection: &str, old_id: &str) -> Option<&str> {
        self.maps.get(collection).and_then(|m| m.get(old_id))
    }

    /// Look up an identity's canonical id, consulting the collection's merge map first
    pub fn lookup_identity(&self, collection: &str, old_id: &str) -> Option<&str> {
        self.merges
            .get(collection)
            .and_then(|m| m.canonical_for(old_id))
            .or_else(|| self.lookup(collection, old_id))
    }

    /// Whether `old_id` was already assigned in `collection`
    pub fn is_assigned(&self, collection: &str, old_id: &str) -> bool {
        self.maps
            .get(collection)
            .is_some_and(|m| m.contains_old(old_id))
    }

    /// Index the identities already present in the store.
    ///
    /// Runs once per remapper; later calls are no-ops.
    pub async fn seed_identities(
        &mut self,
        store: &dyn IdentityStore,
        page_size: usize,
    ) -> Result<usize, BackendError> {
        if self.identities_seeded {
            return Ok(self.seeded.len());
        }

        let mut cursor: Option<String> = None;
        loop {
            let page = store.list_identities(cursor.as_deref(), page_size).await?;
            let count = page.len();
            for identity in &page {
                self.index_existing(identity);
            }
            cursor = page.last().map(|i| i.id.clone());
            if count < page_size || cursor.is_none() {
                break;
            }
        }

        self.identities_seeded = true;
        log::info!("Seeded identity index with {} existing identities", self.seeded.len());
        Ok(self.seeded.len())
    }

    fn index_existing(&mut self, identity: &IdentityRecord) {
        let contact = Contact::new(identity.email.as_deref(), identity.phone.as_deref());
        if let Some(email) = contact.email {
            self.by_email.entry(email).or_insert_with(|| identity.id.clone());
        }
        if let Some(phone) = contact.phone {
            self.by_phone.entry(phone).or_insert_with(|| identity.id.clone());
        }
        self.seeded.insert(identity.id.clone());
        self.identity_ids.insert(identity.id.clone());
    }

    /// Assign a new id to a record of a non-identity collection
    ///
    /// `preferred` (usually the primary-key value) is used when it is a
    /// valid, unused id. Any other preferred value is hashed with the
    /// collection name; a fresh random id is only generated without one.
    pub fn assign(
        &mut self,
        collection: &str,
        original_id: Option<&str>,
        preferred: Option<&str>,
    ) -> Result<String, RemapError> {
        if let Some(old) = original_id
            && self.is_assigned(collection, old)
        {
            return Err(RemapError::DuplicateOriginalId {
                collection: collection.to_string(),
                original_id: old.to_string(),
            });
        }

        let new_id = self.fresh_id(collection, preferred, false);
        let map = self.maps.entry(collection.to_string()).or_default();
        match original_id {
            Some(old) => map.bind(old, &new_id),
            None => map.reserve(&new_id),
        }
        self.stats.assigned += 1;
        Ok(new_id)
    }

    /// Identity ids must also be unique across identity collections
    fn fresh_id(&mut self, collection: &str, preferred: Option<&str>, identity: bool) -> String {
        let map = self.maps.entry(collection.to_string()).or_default();
        let identity_ids = &self.identity_ids;
        let taken = |id: &str| map.is_used(id) || (identity && identity_ids.contains(id));

        if let Some(candidate) = preferred {
            if is_valid_id(candidate) && !taken(candidate) {
                return candidate.to_string();
            }
            let derived = derive_id(collection, candidate);
            if !taken(&derived) {
                return derived;
            }
        }

        loop {
            let candidate = self.generator.generate();
            if !taken(&candidate) {
                return candidate;
            }
            self.stats.collisions += 1;
            log::debug!("Generated id '{}' already used in '{}', retrying", candidate, collection);
        }
    }

    /// Bind an identity record to its canonical id
    pub fn bind_identity(
        &mut self,
        collection: &str,
        original_id: Option<&str>,
        preferred: Option<&str>,
        contact: &Contact,
    ) -> IdentityBinding {
        // A repeated original id folds into whatever it was bound to before
        if let Some(old) = original_id
            && let Some(canonical) = self.lookup_identity(collection, old).map(str::to_string)
        {
            self.record_merge(collection, &canonical, old);
            self.stats.identities_merged += 1;
            return IdentityBinding {
                id: canonical,
                outcome: IdentityOutcome::Merged,
            };
        }

        if let Some(canonical) = self.match_contact(contact) {
            if let Some(old) = original_id {
                self.record_merge(collection, &canonical, old);
            }
            self.index_contact(contact, &canonical);

            let outcome = if self.seeded.contains(&canonical) && self.claimed.insert(canonical.clone()) {
                self.stats.identities_existing += 1;
                IdentityOutcome::Existing
            } else {
                self.stats.identities_merged += 1;
                IdentityOutcome::Merged
            };
            return IdentityBinding {
                id: canonical,
                outcome,
            };
        }

        let new_id = self.fresh_id(collection, preferred, true);
        self.identity_ids.insert(new_id.clone());
        let map = self.maps.entry(collection.to_string()).or_default();
        match original_id {
            Some(old) => {
                map.bind(old, &new_id);
                self.record_merge(collection, &new_id, old);
            }
            None => map.reserve(&new_id),
        }
        self.index_contact(contact, &new_id);
        self.stats.assigned += 1;
        self.stats.identities_new += 1;

        IdentityBinding {
            id: new_id,
            outcome: IdentityOutcome::New,
        }
    }

    fn match_contact(&mut self, contact: &Contact) -> Option<String> {
        let by_email = contact.email.as_ref().and_then(|e| self.by_email.get(e)).cloned();
        let by_phone = contact.phone.as_ref().and_then(|p| self.by_phone.get(p)).cloned();

        match (by_email, by_phone) {
            (Some(email_id), Some(phone_id)) if email_id != phone_id => {
                self.stats.ambiguous_merges += 1;
                match self.policy {
                    AmbiguityPolicy::PreferEmail => {
                        log::warn!(
                            "Ambiguous identity match: email {:?} -> '{}', phone {:?} -> '{}'; using email match",
                            contact.email,
                            email_id,
                            contact.phone,
                            phone_id
                        );
                        Some(email_id)
                    }
                }
            }
            (Some(id), _) | (None, Some(id)) => Some(id),
            (None, None) => None,
        }
    }

    fn index_contact(&mut self, contact: &Contact, canonical: &str) {
        if let Some(email) = &contact.email {
            self.by_email
                .entry(email.clone())
                .or_insert_with(|| canonical.to_string());
        }
        if let Some(phone) = &contact.phone {
            self.by_phone
                .entry(phone.clone())
                .or_insert_with(|| canonical.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MemoryBackend;

    #[test]
    fn test_generated_ids_are_valid() {
        let id = IdGenerator.generate();
        assert_eq!(id.len(), GENERATED_ID_LEN);
        assert!(is_valid_id(&id));
    }

    #[test]
    fn test_valid_id_rules() {
        assert!(is_valid_id("book-42"));
        assert!(!is_valid_id("_leading"));
        assert!(!is_valid_id("has space"));
        assert!(!is_valid_id(&"x".repeat(37)));
    }

    #[test]
    fn test_contact_normalization() {
        assert_eq!(normalize_email("  Ada@Example.COM "), Some("ada@example.com".into()));
        assert_eq!(normalize_email("   "), None);
        assert_eq!(normalize_phone("+1 (555) 010"), Some("+1555010".into()));
        assert_eq!(normalize_phone("n/a"), None);
    }

    #[test]
    fn test_assign_uses_primary_key_when_valid() {
        let mut remapper = IdRemapper::new();
        let id = remapper.assign("books", Some("b1"), Some("b1")).unwrap();
        assert_eq!(id, "b1");
        assert_eq!(remapper.lookup("books", "b1"), Some("b1"));

        // Invalid candidate is hashed into a valid id
        let id = remapper.assign("books", Some("b 2"), Some("b 2")).unwrap();
        assert_ne!(id, "b 2");
        assert!(is_valid_id(&id));
        assert_eq!(id, derive_id("books", "b 2"));
    }

    #[test]
    fn test_derived_ids_are_stable_per_collection() {
        let key = "ISBN 978/1";
        let mut first = IdRemapper::new();
        let mut second = IdRemapper::new();
        let a = first.assign("books", Some(key), Some(key)).unwrap();
        let b = second.assign("books", Some(key), Some(key)).unwrap();
        assert_eq!(a, b);
        assert!(is_valid_id(&a));
        assert_ne!(derive_id("books", key), derive_id("authors", key));

        let long = "x".repeat(60);
        assert!(is_valid_id(&derive_id("books", &long)));
    }

    #[test]
    fn test_assign_rejects_duplicate_original_id() {
        let mut remapper = IdRemapper::new();
        remapper.assign("books", Some("b1"), None).unwrap();
        let err = remapper.assign("books", Some("b1"), None).unwrap_err();
        assert!(matches!(err, RemapError::DuplicateOriginalId { .. }));

        // Same original id in another collection is fine
        assert!(remapper.assign("authors", Some("b1"), None).is_ok());
    }

    #[test]
    fn test_assign_never_reuses_new_id() {
        let mut remapper = IdRemapper::new();
        let first = remapper.assign("books", Some("x"), Some("same")).unwrap();
        let second = remapper.assign("books", Some("y"), Some("same")).unwrap();
        assert_eq!(first, "same");
        assert_ne!(second, "same");
    }

    #[test]
    fn test_identities_with_same_email_collapse() {
        let mut remapper = IdRemapper::new();
        let contact = Contact::new(Some("ada@example.com"), None);
        let first = remapper.bind_identity("users", Some("u1"), None, &contact);
        let second = remapper.bind_identity(
            "users",
            Some("u2"),
            None,
            &Contact::new(Some("ADA@example.com "), None),
        );

        assert_eq!(first.outcome, IdentityOutcome::New);
        assert_eq!(second.outcome, IdentityOutcome::Merged);
        assert_eq!(first.id, second.id);
        assert_eq!(
            remapper.merges("users").unwrap().merged(&first.id),
            &["u1".to_string(), "u2".to_string()]
        );
        assert_eq!(remapper.lookup_identity("users", "u2"), Some(first.id.as_str()));
    }

    #[test]
    fn test_phone_match_collapses() {
        let mut remapper = IdRemapper::new();
        let first = remapper.bind_identity("users", Some("u1"), None, &Contact::new(None, Some("+1 555 0100")));
        let second = remapper.bind_identity("users", Some("u2"), None, &Contact::new(Some("new@example.com"), Some("+15550100")));
        assert_eq!(first.id, second.id);
        assert_eq!(second.outcome, IdentityOutcome::Merged);
    }

    #[test]
    fn test_ambiguous_match_prefers_email() {
        let mut remapper = IdRemapper::new();
        let by_email = remapper.bind_identity("users", Some("u1"), None, &Contact::new(Some("a@example.com"), None));
        let _by_phone = remapper.bind_identity("users", Some("u2"), None, &Contact::new(None, Some("+1555")));

        let ambiguous = remapper.bind_identity(
            "users",
            Some("u3"),
            None,
            &Contact::new(Some("a@example.com"), Some("+1555")),
        );
        assert_eq!(ambiguous.id, by_email.id);
        assert_eq!(remapper.stats().ambiguous_merges, 1);
    }

    #[tokio::test]
    async fn test_seeded_identity_is_existing_then_merged() {
        let backend = MemoryBackend::new();
        backend.insert_identity("existing01", Some("ada@example.com"), None);

        let mut remapper = IdRemapper::new();
        assert_eq!(remapper.seed_identities(&backend, 100).await.unwrap(), 1);

        let contact = Contact::new(Some("ada@example.com"), None);
        let first = remapper.bind_identity("users", Some("u1"), None, &contact);
        let second = remapper.bind_identity("users", Some("u2"), None, &contact);

        assert_eq!(first.id, "existing01");
        assert_eq!(first.outcome, IdentityOutcome::Existing);
        assert_eq!(second.outcome, IdentityOutcome::Merged);
    }

    #[test]
    fn test_repeated_original_id_merges() {
        let mut remapper = IdRemapper::new();
        let first = remapper.bind_identity("users", Some("u1"), None, &Contact::default());
        let again = remapper.bind_identity("users", Some("u1"), None, &Contact::default());
        assert_eq!(first.id, again.id);
        assert_eq!(again.outcome, IdentityOutcome::Merged);
    }

    #[test]
    fn test_same_original_id_in_other_identity_collection_is_not_merged() {
        let mut remapper = IdRemapper::new();
        let ada = remapper.bind_identity("customers", Some("1"), Some("1"), &Contact::new(Some("ada@example.com"), None));
        let grace = remapper.bind_identity("members", Some("1"), Some("1"), &Contact::new(Some("grace@example.com"), None));

        assert_eq!(grace.outcome, IdentityOutcome::New);
        assert_ne!(ada.id, grace.id);
        assert_eq!(remapper.lookup_identity("customers", "1"), Some(ada.id.as_str()));
        assert_eq!(remapper.lookup_identity("members", "1"), Some(grace.id.as_str()));
        assert!(remapper.merges("members").unwrap().merged(&ada.id).is_empty());
    }
}
