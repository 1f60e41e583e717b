use std::collections::BTreeSet;
use std::time::Duration;

use contact_identity_core::{
    audit_contacts, build_identity_view, plan_merge, verify_cluster, AuditFinding, Contact,
    ContactId, ContactStore, IdentityError, IdentityView, LinkPrecedence, MergePlan, Observation,
};

mod config;
mod locks;
mod resolve;

pub use config::ReconcilerConfig;
pub use resolve::{expand, find_matches};

use locks::{LockGuard, LockTable};

/// Maps observations onto the stored identity graph.
///
/// Reconciliations whose contacts could overlap are serialized on an
/// in-process lock table: first on the observation's field keys, then on
/// every contact of the resolved set. Share one `Reconciler` (for example
/// behind an `Arc`) between all callers of a store.
pub struct Reconciler<S> {
    store: S,
    config: ReconcilerConfig,
    locks: LockTable,
}

impl<S: ContactStore> Reconciler<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self::with_config(store, ReconcilerConfig::default())
    }

    #[must_use]
    pub fn with_config(store: S, config: ReconcilerConfig) -> Self {
        Self {
            store,
            config,
            locks: LockTable::default(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Record one observation and return the consolidated identity it belongs to.
    ///
    /// # Errors
    /// - [`IdentityError::Validation`] when neither field is present.
    /// - [`IdentityError::Conflict`] when locks cannot be taken in time or the
    ///   cluster keeps changing underneath; retrying is safe.
    /// - [`IdentityError::Store`] when the store fails, possibly after part of
    ///   the plan was applied; retrying completes the merge.
    /// - [`IdentityError::InvariantViolation`] when the stored graph is damaged
    ///   in a way reconciliation cannot repair.
    pub fn reconcile(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<IdentityView, IdentityError> {
        let observation = Observation::new(email, phone)?;
        let _field_guard = self.lock(observation.lock_keys())?;
        let (snapshot, _cluster_guard) = self.lock_snapshot(&observation)?;

        let plan = plan_merge(&snapshot, &observation);
        tracing::debug!(
            matched = snapshot.len(),
            mutations = plan.mutation_count(),
            primary_id = plan.primary_id.map(|id| id.0),
            "planned reconciliation"
        );

        let applied = self.apply(&plan)?;
        let mut expected: BTreeSet<ContactId> = snapshot.iter().map(|contact| contact.id).collect();
        expected.extend(applied.created);

        let primary_id = applied.primary_id;
        let Some(cluster) = self.store.get_cluster(primary_id)? else {
            return Err(violation(format!("primary {primary_id} vanished")));
        };
        verify_cluster(&cluster, &expected).inspect_err(|err| {
            tracing::error!(
                primary_id = primary_id.0,
                error = %err,
                "cluster failed verification"
            );
        })?;

        Ok(build_identity_view(&cluster))
    }

    /// Consolidated identity of the cluster `contact_id` belongs to, or `None`
    /// when no such contact exists.
    ///
    /// # Errors
    /// Returns [`IdentityError::Conflict`] on lock timeout,
    /// [`IdentityError::Store`] on store failure, and
    /// [`IdentityError::InvariantViolation`] when the cluster is not flat.
    pub fn identity_of(
        &self,
        contact_id: ContactId,
    ) -> Result<Option<IdentityView>, IdentityError> {
        for round in 1..=self.config.lock_rounds() {
            let Some(contact) = self.store.get_by_id(contact_id)? else {
                return Ok(None);
            };
            let primary_id = cluster_root(&contact);
            let _guard = self.lock(contact_keys([contact_id, primary_id]))?;

            match self.store.get_by_id(contact_id)? {
                None => return Ok(None),
                Some(current) if cluster_root(&current) == primary_id => {
                    let Some(cluster) = self.store.get_cluster(primary_id)? else {
                        return Err(violation(format!(
                            "contact {contact_id} links to missing contact {primary_id}"
                        )));
                    };
                    verify_cluster(&cluster, &BTreeSet::from([contact_id]))?;
                    return Ok(Some(build_identity_view(&cluster)));
                }
                Some(_) => {
                    tracing::warn!(
                        contact_id = contact_id.0,
                        round,
                        "contact moved while locking its cluster"
                    );
                }
            }
        }
        Err(IdentityError::Conflict(format!(
            "cluster of contact {contact_id} kept changing while it was being locked"
        )))
    }

    /// Audit the whole store for identity-graph damage.
    ///
    /// # Errors
    /// Returns [`IdentityError::Store`] when the contacts cannot be listed.
    pub fn audit(&self) -> Result<Vec<AuditFinding>, IdentityError> {
        let contacts = self.store.list_contacts()?;
        let findings = audit_contacts(&contacts);
        for finding in &findings {
            tracing::warn!(
                contact_id = finding.contact_id.0,
                kind = finding.kind.as_str(),
                detail = %finding.detail,
                "audit found damaged contact"
            );
        }
        tracing::debug!(
            contacts = contacts.len(),
            findings = findings.len(),
            "audited contacts"
        );
        Ok(findings)
    }

    /// Resolve the observation, lock every contact in the result, and resolve
    /// again until the locked set is exactly what was resolved.
    fn lock_snapshot(
        &self,
        observation: &Observation,
    ) -> Result<(Vec<Contact>, Option<LockGuard<'_>>), IdentityError> {
        let mut snapshot = self.resolve(observation)?;
        for round in 1..=self.config.lock_rounds() {
            let keys = contact_keys(snapshot.iter().map(|contact| contact.id));
            if keys.is_empty() {
                // Nothing to lock beyond the field keys: a contact carrying
                // either field could only be created under those keys.
                return Ok((snapshot, None));
            }

            let guard = self.lock(keys)?;
            let current = self.resolve(observation)?;
            if contact_keys(current.iter().map(|contact| contact.id)) == *guard.keys() {
                return Ok((current, Some(guard)));
            }
            tracing::warn!(
                round,
                before = snapshot.len(),
                after = current.len(),
                "cluster changed while locking"
            );
            drop(guard);
            snapshot = current;
        }
        Err(IdentityError::Conflict(format!(
            "cluster kept changing across {} lock rounds",
            self.config.lock_rounds()
        )))
    }

    fn resolve(&self, observation: &Observation) -> Result<Vec<Contact>, IdentityError> {
        expand(&self.store, find_matches(&self.store, observation)?)
    }

    fn apply(&self, plan: &MergePlan) -> Result<AppliedPlan, IdentityError> {
        let mut primary_id = plan.primary_id;
        let mut created = None;

        if let Some(create) = &plan.create {
            let (email, phone) = (create.email.as_deref(), create.phone.as_deref());
            let contact = self.store.create(email, phone)?;
            match create.link_to {
                Some(target) => {
                    self.link_secondary(contact.id, target)?;
                    tracing::info!(
                        contact_id = contact.id.0,
                        primary_id = target.0,
                        "created secondary contact"
                    );
                }
                None => {
                    tracing::info!(contact_id = contact.id.0, "created primary contact");
                    primary_id = Some(contact.id);
                }
            }
            created = Some(contact.id);
        }

        if let Some(id) = plan.promote {
            self.store.update_link(id, None, LinkPrecedence::Primary)?;
            tracing::warn!(
                contact_id = id.0,
                "promoted contact of a cluster without primary"
            );
        }

        for change in plan.link_changes() {
            self.link_secondary(change.contact_id, change.linked_id)?;
            if change.previous_precedence == LinkPrecedence::Primary {
                tracing::info!(
                    contact_id = change.contact_id.0,
                    primary_id = change.linked_id.0,
                    "merged primary into older cluster"
                );
            } else {
                tracing::debug!(
                    contact_id = change.contact_id.0,
                    previous_linked_id = change.previous_linked_id.map(|id| id.0),
                    primary_id = change.linked_id.0,
                    "relinked secondary contact"
                );
            }
        }

        let Some(primary_id) = primary_id else {
            return Err(violation("merge plan names no primary".to_string()));
        };
        Ok(AppliedPlan {
            primary_id,
            created,
        })
    }

    fn link_secondary(&self, id: ContactId, primary_id: ContactId) -> Result<(), IdentityError> {
        let precedence = LinkPrecedence::Secondary;
        self.store.update_link(id, Some(primary_id), precedence)?;
        Ok(())
    }

    fn lock(&self, keys: BTreeSet<String>) -> Result<LockGuard<'_>, IdentityError> {
        let timeout = self.config.lock_timeout;
        let described = keys.iter().cloned().collect::<Vec<_>>().join(",");
        self.locks.acquire(keys, timeout).ok_or_else(|| {
            tracing::warn!(
                keys = %described,
                timeout_ms = millis(timeout),
                "lock acquisition timed out"
            );
            IdentityError::Conflict(format!("timed out waiting for locks on {described}"))
        })
    }
}

fn violation(message: String) -> IdentityError {
    tracing::error!(%message, "identity invariant violated");
    IdentityError::InvariantViolation(message)
}

struct AppliedPlan {
    primary_id: ContactId,
    created: Option<ContactId>,
}

fn cluster_root(contact: &Contact) -> ContactId {
    contact.linked_id.unwrap_or(contact.id)
}

fn contact_keys(ids: impl IntoIterator<Item = ContactId>) -> BTreeSet<String> {
    ids.into_iter().map(|id| format!("contact:{id}")).collect()
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
