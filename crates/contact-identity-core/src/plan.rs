use serde::Serialize;

use crate::{creation_order, Contact, ContactId, LinkPrecedence, Observation};

/// A contact the store must insert. `link_to: None` leaves it primary.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct PlannedCreate {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub link_to: Option<ContactId>,
}

/// Rewrite of one contact into a secondary of `linked_id`.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct LinkChange {
    pub contact_id: ContactId,
    pub previous_precedence: LinkPrecedence,
    pub previous_linked_id: Option<ContactId>,
    pub linked_id: ContactId,
}

/// Structural mutations needed to make a resolved contact set consistent.
///
/// Apply in field order: `create`, `promote`, `demotions`, `relinks`. Every
/// change targets the surviving primary, so no step depends on a later one.
#[derive(Debug, Clone, Default, Serialize, Eq, PartialEq)]
pub struct MergePlan {
    /// Surviving primary; `None` only when the set was empty and the
    /// planned create becomes the primary.
    pub primary_id: Option<ContactId>,
    pub create: Option<PlannedCreate>,
    pub promote: Option<ContactId>,
    pub demotions: Vec<LinkChange>,
    pub relinks: Vec<LinkChange>,
}

impl MergePlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.create.is_none()
            && self.promote.is_none()
            && self.demotions.is_empty()
            && self.relinks.is_empty()
    }

    #[must_use]
    pub fn mutation_count(&self) -> usize {
        usize::from(self.create.is_some())
            + usize::from(self.promote.is_some())
            + self.demotions.len()
            + self.relinks.len()
    }

    pub fn link_changes(&self) -> impl Iterator<Item = &LinkChange> {
        self.demotions.iter().chain(self.relinks.iter())
    }
}

/// Decide how `observation` lands on the resolved contact set `snapshot`.
///
/// The earliest-created PRIMARY survives (earliest contact overall if the set
/// holds no primary) and every other member is pointed straight at it. A
/// contact is created only when the observation adds an email or phone the
/// set does not hold yet.
#[must_use]
pub fn plan_merge(snapshot: &[Contact], observation: &Observation) -> MergePlan {
    let mut ordered: Vec<&Contact> = snapshot.iter().collect();
    ordered.sort_by(|lhs, rhs| creation_order(lhs, rhs));
    ordered.dedup_by_key(|contact| contact.id);

    let selected = ordered.iter().copied().find(|contact| contact.is_primary());
    let Some(primary) = selected.or_else(|| ordered.first().copied()) else {
        return MergePlan {
            primary_id: None,
            create: Some(PlannedCreate {
                email: observation.email().map(str::to_string),
                phone: observation.phone().map(str::to_string),
                link_to: None,
            }),
            ..MergePlan::default()
        };
    };

    let promote = (!primary.is_primary()).then_some(primary.id);

    let create = brings_new_value(observation, &ordered).then(|| PlannedCreate {
        email: observation.email().map(str::to_string),
        phone: observation.phone().map(str::to_string),
        link_to: Some(primary.id),
    });

    let mut demotions = Vec::new();
    let mut relinks = Vec::new();
    for contact in ordered.iter().filter(|contact| contact.id != primary.id) {
        let change = LinkChange {
            contact_id: contact.id,
            previous_precedence: contact.precedence,
            previous_linked_id: contact.linked_id,
            linked_id: primary.id,
        };
        match contact.precedence {
            LinkPrecedence::Primary => demotions.push(change),
            LinkPrecedence::Secondary if contact.linked_id != Some(primary.id) => {
                relinks.push(change);
            }
            LinkPrecedence::Secondary => {}
        }
    }

    MergePlan {
        primary_id: Some(primary.id),
        create,
        promote,
        demotions,
        relinks,
    }
}

/// A contact is only worth creating when it records a value the set lacks.
/// That implies no member carries the exact pair; the converse does not hold
/// when a bridging observation's fields already live on two different members.
fn brings_new_value(observation: &Observation, members: &[&Contact]) -> bool {
    let mut email_is_new = observation.email().is_some();
    let mut phone_is_new = observation.phone().is_some();
    for contact in members {
        if contact.email.is_some() && contact.email.as_deref() == observation.email() {
            email_is_new = false;
        }
        if contact.phone.is_some() && contact.phone.as_deref() == observation.phone() {
            phone_is_new = false;
        }
    }
    email_is_new || phone_is_new
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use proptest::prelude::*;
    use time::Duration;

    use super::*;
    use crate::fixtures::{fixture_time, primary, secondary};

    fn observation(email: Option<&str>, phone: Option<&str>) -> Observation {
        match Observation::new(email, phone) {
            Ok(observation) => observation,
            Err(err) => panic!("fixture observation should be valid: {err}"),
        }
    }

    fn change_ids(changes: &[LinkChange]) -> Vec<i64> {
        changes.iter().map(|change| change.contact_id.0).collect()
    }

    #[test]
    fn empty_snapshot_plans_new_primary() {
        let plan = plan_merge(&[], &observation(Some("a@x.com"), None));

        assert_eq!(plan.primary_id, None);
        assert_eq!(
            plan.create,
            Some(PlannedCreate {
                email: Some("a@x.com".to_string()),
                phone: None,
                link_to: None,
            })
        );
        assert!(plan.demotions.is_empty());
        assert!(plan.relinks.is_empty());
    }

    #[test]
    fn known_phone_produces_empty_plan() {
        let snapshot = [primary(1, Some("a@x.com"), Some("111"))];
        let plan = plan_merge(&snapshot, &observation(None, Some("111")));

        assert!(plan.is_empty());
        assert_eq!(plan.primary_id, Some(ContactId(1)));
    }

    #[test]
    fn new_phone_for_known_email_creates_secondary() {
        let snapshot = [primary(1, Some("a@x.com"), Some("111"))];
        let plan = plan_merge(&snapshot, &observation(Some("a@x.com"), Some("222")));

        assert_eq!(
            plan.create,
            Some(PlannedCreate {
                email: Some("a@x.com".to_string()),
                phone: Some("222".to_string()),
                link_to: Some(ContactId(1)),
            })
        );
        assert_eq!(plan.mutation_count(), 1);
    }

    #[test]
    fn email_only_contact_does_not_carry_email_and_phone() {
        let snapshot = [primary(1, Some("e1"), None)];
        let plan = plan_merge(&snapshot, &observation(Some("e1"), Some("p1")));

        let Some(create) = plan.create else {
            panic!("a novel (email, phone) pair must be created");
        };
        assert_eq!(create.link_to, Some(ContactId(1)));
        assert_eq!(create.email.as_deref(), Some("e1"));
        assert_eq!(create.phone.as_deref(), Some("p1"));
    }

    #[test]
    fn bridging_observation_demotes_younger_primary() {
        let snapshot = [
            primary(2, Some("b@x.com"), Some("222")),
            primary(1, Some("a@x.com"), Some("111")),
        ];
        let plan = plan_merge(&snapshot, &observation(Some("a@x.com"), Some("222")));

        assert_eq!(plan.primary_id, Some(ContactId(1)));
        assert_eq!(change_ids(&plan.demotions), vec![2]);
        let demotion = &plan.demotions[0];
        assert_eq!(demotion.previous_precedence, LinkPrecedence::Primary);
        assert_eq!(demotion.linked_id, ContactId(1));
        assert!(plan.relinks.is_empty());
        // Both fields are already known, split across two contacts.
        assert!(plan.create.is_none());
    }

    #[test]
    fn bridging_observation_with_new_value_also_creates() {
        let snapshot = [
            primary(1, Some("a@x.com"), Some("111")),
            primary(2, None, Some("222")),
        ];
        let plan = plan_merge(&snapshot, &observation(Some("c@x.com"), Some("222")));

        assert_eq!(change_ids(&plan.demotions), vec![2]);
        let Some(create) = plan.create else {
            panic!("c@x.com is new to the merged set");
        };
        assert_eq!(create.link_to, Some(ContactId(1)));
    }

    #[test]
    fn demoted_primary_brings_its_secondaries() {
        let snapshot = [
            primary(1, Some("a@x.com"), None),
            primary(2, Some("b@x.com"), Some("222")),
            secondary(3, 2, Some("c@x.com"), Some("222")),
            secondary(4, 2, Some("b@x.com"), Some("333")),
        ];
        let plan = plan_merge(&snapshot, &observation(Some("a@x.com"), Some("222")));

        assert_eq!(change_ids(&plan.demotions), vec![2]);
        assert_eq!(change_ids(&plan.relinks), vec![3, 4]);
        let mut targets = plan.link_changes().map(|change| change.linked_id);
        assert!(targets.all(|target| target == ContactId(1)));
    }

    #[test]
    fn chained_secondary_is_flattened() {
        let snapshot = [
            primary(1, Some("a@x.com"), None),
            secondary(2, 1, Some("a@x.com"), Some("111")),
            secondary(3, 2, None, Some("111")),
        ];
        let plan = plan_merge(&snapshot, &observation(None, Some("111")));

        assert!(plan.create.is_none());
        assert!(plan.demotions.is_empty());
        assert_eq!(change_ids(&plan.relinks), vec![3]);
        assert_eq!(plan.relinks[0].previous_linked_id, Some(ContactId(2)));
    }

    #[test]
    fn snapshot_without_primary_promotes_oldest() {
        let snapshot = [
            secondary(5, 3, None, Some("555")),
            secondary(4, 3, Some("d@x.com"), Some("555")),
        ];
        let plan = plan_merge(&snapshot, &observation(None, Some("555")));

        assert_eq!(plan.primary_id, Some(ContactId(4)));
        assert_eq!(plan.promote, Some(ContactId(4)));
        assert_eq!(change_ids(&plan.relinks), vec![5]);
    }

    #[test]
    fn equal_timestamps_prefer_lower_id() {
        let mut younger_id = primary(9, Some("a@x.com"), None);
        let mut older_id = primary(8, None, Some("111"));
        younger_id.created_at = fixture_time(0);
        older_id.created_at = fixture_time(0);

        let observed = observation(Some("a@x.com"), Some("111"));
        let plan = plan_merge(&[younger_id, older_id], &observed);

        assert_eq!(plan.primary_id, Some(ContactId(8)));
        assert_eq!(change_ids(&plan.demotions), vec![9]);
    }

    #[test]
    fn oldest_primary_wins_even_when_listed_last() {
        let mut old = primary(40, Some("a@x.com"), None);
        old.created_at = fixture_time(-100);
        let young = primary(10, None, Some("111"));

        let observed = observation(Some("a@x.com"), Some("111"));
        let plan = plan_merge(&[young, old], &observed);

        assert_eq!(plan.primary_id, Some(ContactId(40)));
        assert_eq!(change_ids(&plan.demotions), vec![10]);
    }

    #[test]
    fn duplicate_snapshot_entries_are_planned_once() {
        let two = primary(2, None, Some("222"));
        let snapshot = [primary(1, Some("a@x.com"), None), two.clone(), two];
        let plan = plan_merge(&snapshot, &observation(Some("a@x.com"), Some("222")));

        assert_eq!(change_ids(&plan.demotions), vec![2]);
    }

    // In-memory model of the store and resolver used by the properties below.
    struct Model {
        contacts: BTreeMap<ContactId, Contact>,
        next_id: i64,
    }

    impl Model {
        fn from_seed(seed: &[(Option<u8>, Option<u8>, Option<u8>)]) -> Self {
            let mut contacts = BTreeMap::new();
            let mut primaries: Vec<ContactId> = Vec::new();
            for (index, (email, phone, parent)) in seed.iter().enumerate() {
                let id = i64::try_from(index + 1).unwrap_or(i64::MAX);
                let email = email.map(|value| format!("e{value}@x.com"));
                let phone = match (phone, &email) {
                    (Some(value), _) => Some(format!("{value}00")),
                    (None, Some(_)) => None,
                    (None, None) => Some("000".to_string()),
                };
                let mut contact = primary(id, None, None);
                contact.email = email;
                contact.phone = phone;
                match parent {
                    Some(choice) if !primaries.is_empty() => {
                        let target = primaries[usize::from(*choice) % primaries.len()];
                        contact.linked_id = Some(target);
                        contact.precedence = LinkPrecedence::Secondary;
                    }
                    _ => primaries.push(contact.id),
                }
                contacts.insert(contact.id, contact);
            }
            let next_id = i64::try_from(seed.len() + 1).unwrap_or(i64::MAX);
            Self { contacts, next_id }
        }

        fn resolve(&self, observation: &Observation) -> Vec<Contact> {
            let mut reached: BTreeSet<ContactId> = self
                .contacts
                .values()
                .filter(|contact| {
                    let (email, phone) = (observation.email(), observation.phone());
                    (email.is_some() && contact.email.as_deref() == email)
                        || (phone.is_some() && contact.phone.as_deref() == phone)
                })
                .map(|contact| contact.id)
                .collect();
            loop {
                let mut grown = reached.clone();
                for contact in self.contacts.values() {
                    if reached.contains(&contact.id) {
                        grown.extend(contact.linked_id);
                    }
                    let parent = contact.linked_id;
                    if parent.is_some_and(|target| reached.contains(&target)) {
                        grown.insert(contact.id);
                    }
                }
                if grown == reached {
                    break;
                }
                reached = grown;
            }
            reached
                .iter()
                .filter_map(|id| self.contacts.get(id).cloned())
                .collect()
        }

        fn relink(
            &mut self,
            id: ContactId,
            linked_id: Option<ContactId>,
            precedence: LinkPrecedence,
        ) {
            if let Some(contact) = self.contacts.get_mut(&id) {
                contact.linked_id = linked_id;
                contact.precedence = precedence;
            }
        }

        fn apply(&mut self, plan: &MergePlan) -> ContactId {
            let mut surviving = plan.primary_id;
            if let Some(create) = &plan.create {
                let id = ContactId(self.next_id);
                self.next_id += 1;
                let created_at = fixture_time(0) + Duration::days(1) + Duration::seconds(id.0);
                self.contacts.insert(
                    id,
                    Contact {
                        id,
                        email: create.email.clone(),
                        phone: create.phone.clone(),
                        linked_id: None,
                        precedence: LinkPrecedence::Primary,
                        created_at,
                        updated_at: created_at,
                    },
                );
                match create.link_to {
                    Some(target) => self.relink(id, Some(target), LinkPrecedence::Secondary),
                    None => surviving = Some(id),
                }
            }
            if let Some(id) = plan.promote {
                self.relink(id, None, LinkPrecedence::Primary);
            }
            for change in plan.link_changes() {
                self.relink(
                    change.contact_id,
                    Some(change.linked_id),
                    LinkPrecedence::Secondary,
                );
            }
            match surviving {
                Some(id) => id,
                None => panic!("every plan must name or create a primary"),
            }
        }

        fn assert_no_chains(&self) {
            for contact in self.contacts.values() {
                if let Some(target) = contact.linked_id {
                    let Some(parent) = self.contacts.get(&target) else {
                        panic!("contact {} links to missing {target}", contact.id);
                    };
                    assert!(
                        parent.is_primary(),
                        "contact {} links to secondary {target}",
                        contact.id
                    );
                }
            }
        }
    }

    fn seed_strategy() -> impl Strategy<Value = Vec<(Option<u8>, Option<u8>, Option<u8>)>> {
        prop::collection::vec(
            (
                prop::option::of(0_u8..4),
                prop::option::of(0_u8..4),
                prop::option::of(any::<u8>()),
            ),
            0..12,
        )
    }

    fn observation_strategy() -> impl Strategy<Value = (Option<u8>, Option<u8>)> {
        (prop::option::of(0_u8..5), prop::option::of(0_u8..5))
            .prop_filter("one field is required", |(email, phone)| {
                email.is_some() || phone.is_some()
            })
    }

    proptest! {
        #[test]
        fn property_applied_plan_leaves_one_flat_cluster(
            seed in seed_strategy(),
            (email, phone) in observation_strategy(),
        ) {
            let mut model = Model::from_seed(&seed);
            let email = email.map(|value| format!("e{value}@x.com"));
            let phone = phone.map(|value| format!("{value}00"));
            let observation = match Observation::new(email.as_deref(), phone.as_deref()) {
                Ok(observation) => observation,
                Err(err) => panic!("generated observation should be valid: {err}"),
            };

            let snapshot = model.resolve(&observation);
            let plan = plan_merge(&snapshot, &observation);
            let surviving = model.apply(&plan);
            model.assert_no_chains();

            let cluster = model.resolve(&observation);
            let primaries: Vec<&Contact> = cluster
                .iter()
                .filter(|contact| contact.is_primary())
                .collect();
            prop_assert_eq!(primaries.len(), 1);
            prop_assert_eq!(primaries[0].id, surviving);

            let oldest = cluster.iter().min_by(|lhs, rhs| creation_order(lhs, rhs));
            prop_assert_eq!(oldest.map(|contact| contact.id), Some(surviving));

            if let Some(email) = observation.email() {
                let held = cluster
                    .iter()
                    .any(|contact| contact.email.as_deref() == Some(email));
                prop_assert!(held);
            }
            if let Some(phone) = observation.phone() {
                let held = cluster
                    .iter()
                    .any(|contact| contact.phone.as_deref() == Some(phone));
                prop_assert!(held);
            }
            for contact in &snapshot {
                prop_assert!(cluster.iter().any(|member| member.id == contact.id));
            }
        }
    }

    proptest! {
        #[test]
        fn property_second_submission_plans_nothing(
            seed in seed_strategy(),
            (email, phone) in observation_strategy(),
        ) {
            let mut model = Model::from_seed(&seed);
            let email = email.map(|value| format!("e{value}@x.com"));
            let phone = phone.map(|value| format!("{value}00"));
            let observation = match Observation::new(email.as_deref(), phone.as_deref()) {
                Ok(observation) => observation,
                Err(err) => panic!("generated observation should be valid: {err}"),
            };

            let first = plan_merge(&model.resolve(&observation), &observation);
            let surviving = model.apply(&first);

            let second = plan_merge(&model.resolve(&observation), &observation);
            prop_assert!(second.is_empty(), "second plan was {:?}", second);
            prop_assert_eq!(second.primary_id, Some(surviving));
        }
    }
}
