use std::collections::BTreeSet;

use crate::{creation_order, Contact, ContactCluster, ContactId, IdentityError, IdentityView};

/// Project a cluster into the consolidated view.
///
/// The primary's own email and phone lead their lists; secondaries follow in
/// creation order and only contribute values not listed yet.
#[must_use]
pub fn build_identity_view(cluster: &ContactCluster) -> IdentityView {
    let mut secondaries: Vec<&Contact> = cluster.secondaries.iter().collect();
    secondaries.sort_by(|lhs, rhs| creation_order(lhs, rhs));

    let mut emails: Vec<String> = Vec::new();
    let mut phones: Vec<String> = Vec::new();
    for contact in std::iter::once(&cluster.primary).chain(secondaries.iter().copied()) {
        push_distinct(&mut emails, contact.email.as_deref());
        push_distinct(&mut phones, contact.phone.as_deref());
    }

    IdentityView {
        primary_id: cluster.primary.id,
        emails,
        phones,
        secondary_ids: secondaries.iter().map(|contact| contact.id).collect(),
    }
}

fn push_distinct(values: &mut Vec<String>, value: Option<&str>) {
    if let Some(value) = value {
        if !values.iter().any(|existing| existing == value) {
            values.push(value.to_string());
        }
    }
}

/// Check a freshly loaded cluster after a plan was applied: one primary, every
/// member pointing straight at it, and every contact the reconciliation
/// touched still inside it.
///
/// # Errors
/// Returns [`IdentityError::InvariantViolation`] naming the first broken rule.
pub fn verify_cluster(
    cluster: &ContactCluster,
    expected_members: &BTreeSet<ContactId>,
) -> Result<(), IdentityError> {
    let primary = &cluster.primary;
    if !primary.is_primary() || primary.linked_id.is_some() {
        return Err(IdentityError::InvariantViolation(format!(
            "cluster root {} is not a primary contact",
            primary.id
        )));
    }

    for contact in cluster.members() {
        if let Err(err) = contact.validate() {
            return Err(IdentityError::InvariantViolation(err.to_string()));
        }
    }

    for secondary in &cluster.secondaries {
        if secondary.is_primary() {
            return Err(IdentityError::InvariantViolation(format!(
                "cluster {} holds a second primary {}",
                primary.id, secondary.id
            )));
        }
        if secondary.linked_id != Some(primary.id) {
            return Err(IdentityError::InvariantViolation(format!(
                "secondary {} is listed under {} but links elsewhere",
                secondary.id, primary.id
            )));
        }
    }

    let members = cluster.member_ids();
    if let Some(missing) = expected_members.iter().find(|id| !members.contains(id)) {
        return Err(IdentityError::InvariantViolation(format!(
            "contact {missing} is not linked directly to primary {}",
            primary.id
        )));
    }

    Ok(())
}
