use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Contact, ContactId, LinkPrecedence};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    MissingIdentifier,
    PrimaryWithLink,
    SecondaryWithoutLink,
    SelfLink,
    DanglingLink,
    ChainedLink,
}

impl FindingKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingIdentifier => "missing_identifier",
            Self::PrimaryWithLink => "primary_with_link",
            Self::SecondaryWithoutLink => "secondary_without_link",
            Self::SelfLink => "self_link",
            Self::DanglingLink => "dangling_link",
            Self::ChainedLink => "chained_link",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuditFinding {
    pub contact_id: ContactId,
    pub kind: FindingKind,
    pub detail: String,
}

/// Scan a full contact listing for identity-graph damage. Findings are
/// ordered by contact id, then kind.
#[must_use]
pub fn audit_contacts(contacts: &[Contact]) -> Vec<AuditFinding> {
    let by_id: BTreeMap<ContactId, &Contact> = contacts
        .iter()
        .map(|contact| (contact.id, contact))
        .collect();
    let mut findings = Vec::new();

    for contact in by_id.values() {
        let mut report = |kind: FindingKind, detail: String| {
            findings.push(AuditFinding {
                contact_id: contact.id,
                kind,
                detail,
            });
        };

        if contact.email.is_none() && contact.phone.is_none() {
            report(
                FindingKind::MissingIdentifier,
                "neither email nor phone is set".to_string(),
            );
        }

        match (contact.precedence, contact.linked_id) {
            (LinkPrecedence::Primary, Some(target)) => {
                report(
                    FindingKind::PrimaryWithLink,
                    format!("primary links to {target}"),
                );
            }
            (LinkPrecedence::Primary, None) => {}
            (LinkPrecedence::Secondary, None) => {
                report(
                    FindingKind::SecondaryWithoutLink,
                    "secondary has no linked_id".to_string(),
                );
            }
            (LinkPrecedence::Secondary, Some(target)) if target == contact.id => {
                report(
                    FindingKind::SelfLink,
                    "secondary links to itself".to_string(),
                );
            }
            (LinkPrecedence::Secondary, Some(target)) => match by_id.get(&target) {
                None => report(
                    FindingKind::DanglingLink,
                    format!("linked contact {target} does not exist"),
                ),
                Some(parent) if !parent.is_primary() => report(
                    FindingKind::ChainedLink,
                    format!("links to secondary {target} instead of a primary"),
                ),
                Some(_) => {}
            },
        }
    }

    findings.sort_by_key(|finding| (finding.contact_id, finding.kind));
    findings
}
