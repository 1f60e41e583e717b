use std::collections::{BTreeMap, VecDeque};

use contact_identity_core::{
    creation_order, Contact, ContactId, ContactStore, IdentityError, Observation,
};

/// Every stored contact sharing the observation's email OR its phone.
///
/// # Errors
/// Returns [`IdentityError::Store`] when the lookup fails.
pub fn find_matches<S: ContactStore + ?Sized>(
    store: &S,
    observation: &Observation,
) -> Result<Vec<Contact>, IdentityError> {
    let (email, phone) = (observation.email(), observation.phone());
    Ok(store.find_by_email_or_phone(email, phone)?)
}

/// Grow `matches` to every contact reachable through `linked_id` in either
/// direction, returned in creation order.
///
/// Following links upward reaches the primary of a matched secondary; following
/// them downward brings in the secondaries of any matched or reached contact,
/// including those of a primary about to be demoted and the tail of a chain
/// left behind by an interrupted merge.
///
/// # Errors
/// Returns [`IdentityError::Store`] when a fetch fails and
/// [`IdentityError::InvariantViolation`] when a link points at a missing contact.
pub fn expand<S: ContactStore + ?Sized>(
    store: &S,
    matches: Vec<Contact>,
) -> Result<Vec<Contact>, IdentityError> {
    let mut resolved: BTreeMap<ContactId, Contact> = BTreeMap::new();
    let mut frontier: VecDeque<ContactId> = VecDeque::new();
    for contact in matches {
        if !resolved.contains_key(&contact.id) {
            frontier.push_back(contact.id);
            resolved.insert(contact.id, contact);
        }
    }

    while let Some(id) = frontier.pop_front() {
        let linked_id = resolved.get(&id).and_then(|contact| contact.linked_id);
        if let Some(target) = linked_id.filter(|target| !resolved.contains_key(target)) {
            let Some(parent) = store.get_by_id(target)? else {
                tracing::error!(
                    contact_id = id.0,
                    linked_id = target.0,
                    "contact links to a missing contact"
                );
                return Err(IdentityError::InvariantViolation(format!(
                    "contact {id} links to missing contact {target}"
                )));
            };
            frontier.push_back(parent.id);
            resolved.insert(parent.id, parent);
        }

        if let Some(cluster) = store.get_cluster(id)? {
            for member in cluster.secondaries {
                if !resolved.contains_key(&member.id) {
                    frontier.push_back(member.id);
                    resolved.insert(member.id, member);
                }
            }
        }
    }

    let mut contacts: Vec<Contact> = resolved.into_values().collect();
    contacts.sort_by(creation_order);
    Ok(contacts)
}
