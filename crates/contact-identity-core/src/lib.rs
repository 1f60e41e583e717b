use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod audit;
mod plan;
mod view;

pub use audit::{audit_contacts, AuditFinding, FindingKind};
pub use plan::{plan_merge, LinkChange, MergePlan, PlannedCreate};
pub use view::{build_identity_view, verify_cluster};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IdentityError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl IdentityError {
    /// Only lock timeouts and detected races are safe to retry verbatim.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Failure reported by a [`ContactStore`] implementation.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("{message}")]
pub struct StoreError {
    message: String,
}

impl StoreError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ContactId(pub i64);

impl Display for ContactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkPrecedence {
    Primary,
    Secondary,
}

impl LinkPrecedence {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "primary" => Some(Self::Primary),
            "secondary" => Some(Self::Secondary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Contact {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub linked_id: Option<ContactId>,
    pub precedence: LinkPrecedence,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Contact {
    /// Check the per-row shape rules: an identifying field is present and
    /// `linked_id` is set exactly when the contact is secondary.
    ///
    /// # Errors
    /// Returns [`IdentityError::Validation`] describing the first rule violated.
    pub fn validate(&self) -> Result<(), IdentityError> {
        if self.email.is_none() && self.phone.is_none() {
            return Err(IdentityError::Validation(format!(
                "contact {} MUST carry an email or a phone",
                self.id
            )));
        }

        match (self.precedence, self.linked_id) {
            (LinkPrecedence::Primary, Some(linked_id)) => Err(IdentityError::Validation(format!(
                "primary contact {} MUST NOT link to {linked_id}",
                self.id
            ))),
            (LinkPrecedence::Secondary, None) => Err(IdentityError::Validation(format!(
                "secondary contact {} MUST link to a primary",
                self.id
            ))),
            (LinkPrecedence::Secondary, Some(linked_id)) if linked_id == self.id => Err(
                IdentityError::Validation(format!("contact {} MUST NOT link to itself", self.id)),
            ),
            _ => Ok(()),
        }
    }

    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.precedence == LinkPrecedence::Primary
    }
}

/// Oldest first; equal timestamps fall back to ascending id.
#[must_use]
pub fn creation_order(lhs: &Contact, rhs: &Contact) -> Ordering {
    lhs.created_at
        .cmp(&rhs.created_at)
        .then_with(|| lhs.id.cmp(&rhs.id))
}

/// One submitted pair of identifying fields, at least one of them present.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct Observation {
    email: Option<String>,
    phone: Option<String>,
}

impl Observation {
    /// Normalize and validate a raw submission. Values are trimmed and blank
    /// values count as absent.
    ///
    /// # Errors
    /// Returns [`IdentityError::Validation`] when neither field survives normalization.
    pub fn new(email: Option<&str>, phone: Option<&str>) -> Result<Self, IdentityError> {
        let email = normalize_field(email);
        let phone = normalize_field(phone);
        if email.is_none() && phone.is_none() {
            return Err(IdentityError::Validation(
                "at least one of email or phone MUST be provided".to_string(),
            ));
        }
        Ok(Self { email, phone })
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    #[must_use]
    pub fn phone(&self) -> Option<&str> {
        self.phone.as_deref()
    }

    /// Lock keys covering every stored contact this observation can match.
    /// Case folding only widens the key, so equal fields always share a key.
    #[must_use]
    pub fn lock_keys(&self) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        if let Some(email) = &self.email {
            keys.insert(format!("email:{}", email.to_lowercase()));
        }
        if let Some(phone) = &self.phone {
            keys.insert(format!("phone:{}", phone.to_lowercase()));
        }
        keys
    }
}

fn normalize_field(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// A primary plus every contact whose `linked_id` references it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ContactCluster {
    pub primary: Contact,
    pub secondaries: Vec<Contact>,
}

impl ContactCluster {
    pub fn members(&self) -> impl Iterator<Item = &Contact> {
        std::iter::once(&self.primary).chain(self.secondaries.iter())
    }

    #[must_use]
    pub fn member_ids(&self) -> BTreeSet<ContactId> {
        self.members().map(|contact| contact.id).collect()
    }
}

/// Consolidated identity returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IdentityView {
    pub primary_id: ContactId,
    pub emails: Vec<String>,
    pub phones: Vec<String>,
    pub secondary_ids: Vec<ContactId>,
}

/// Durable keyed storage for contact records.
///
/// Implementations must give read-after-write consistency to a single caller;
/// the engine serializes overlapping reconciliations itself.
pub trait ContactStore: Send + Sync {
    /// Every contact whose email equals `email` or whose phone equals `phone`.
    /// An absent argument disables that half of the filter.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backing storage cannot be read.
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Vec<Contact>, StoreError>;

    /// Insert a new PRIMARY contact, assigning `id` and `created_at`.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the insert fails.
    fn create(&self, email: Option<&str>, phone: Option<&str>) -> Result<Contact, StoreError>;

    /// Overwrite the link fields of one contact.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the contact does not exist or the write fails.
    fn update_link(
        &self,
        id: ContactId,
        linked_id: Option<ContactId>,
        precedence: LinkPrecedence,
    ) -> Result<(), StoreError>;

    /// # Errors
    /// Returns [`StoreError`] when the backing storage cannot be read.
    fn get_by_id(&self, id: ContactId) -> Result<Option<Contact>, StoreError>;

    /// The contact `primary_id` plus all contacts linking directly to it,
    /// secondaries in creation order. `None` when `primary_id` does not exist.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backing storage cannot be read.
    fn get_cluster(&self, primary_id: ContactId) -> Result<Option<ContactCluster>, StoreError>;

    /// All contacts in creation order.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backing storage cannot be read.
    fn list_contacts(&self) -> Result<Vec<Contact>, StoreError>;
}

#[cfg(test)]
pub(crate) mod fixtures {
    use time::Duration;

    use super::{Contact, ContactId, LinkPrecedence};

    pub(crate) fn fixture_time(offset_seconds: i64) -> time::OffsetDateTime {
        time::OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000 + offset_seconds)
    }

    pub(crate) fn primary(id: i64, email: Option<&str>, phone: Option<&str>) -> Contact {
        Contact {
            id: ContactId(id),
            email: email.map(str::to_string),
            phone: phone.map(str::to_string),
            linked_id: None,
            precedence: LinkPrecedence::Primary,
            created_at: fixture_time(id),
            updated_at: fixture_time(id),
        }
    }

    pub(crate) fn secondary(
        id: i64,
        linked_id: i64,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Contact {
        Contact {
            linked_id: Some(ContactId(linked_id)),
            precedence: LinkPrecedence::Secondary,
            ..primary(id, email, phone)
        }
    }
}
