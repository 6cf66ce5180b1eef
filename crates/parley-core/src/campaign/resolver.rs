//! Recipient Resolver - Turns a targeting rule into campaign items

use super::manager::CampaignError;
use parley_common::phone::digits_only;
use parley_common::types::TenantScope;
use parley_storage::models::{Contact, FixedGroup, SystemTag, TargetingRule, TeamMember};
use parley_storage::repository::{ContactDirectory, NewCampaignItem};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Resolves targeting rules against the tenant's contact directory
pub struct RecipientResolver {
    contacts: Arc<dyn ContactDirectory>,
}

impl RecipientResolver {
    pub fn new(contacts: Arc<dyn ContactDirectory>) -> Self {
        Self { contacts }
    }

    /// Resolve a rule into items, one per digits-only phone number.
    ///
    /// Directory contacts are added before team members, so a phone that is
    /// both keeps the contact's name and fields.
    pub async fn resolve(
        &self,
        scope: TenantScope,
        rule: &TargetingRule,
    ) -> Result<Vec<NewCampaignItem>, CampaignError> {
        if rule.is_empty() {
            return Err(CampaignError::NoTargetSelected);
        }

        let mut recipients = RecipientSet::default();

        if !rule.tag_ids.is_empty() {
            let contacts = self
                .contacts
                .consented_with_any_tag(scope, &rule.tag_ids)
                .await?;
            recipients.add_contacts(&contacts);
        }

        let mut include_team = false;
        for group in &rule.groups {
            match group {
                FixedGroup::Leads => {
                    self.add_system_tag(scope, SystemTag::Lead, &mut recipients)
                        .await?
                }
                FixedGroup::Supporters => {
                    self.add_system_tag(scope, SystemTag::Supporter, &mut recipients)
                        .await?
                }
                FixedGroup::Team => include_team = true,
            }
        }

        if let Some(segment_id) = rule.segment_id {
            match self.contacts.segment(scope, segment_id).await? {
                Some(segment) => {
                    let contacts = self
                        .contacts
                        .consented_matching(scope, &segment.filter())
                        .await?;
                    recipients.add_contacts(&contacts);
                }
                None => warn!(tenant_id = %scope, segment_id = %segment_id, "Segment not found"),
            }
        }

        if include_team {
            for member in self.contacts.active_team_members(scope).await? {
                recipients.add_team_member(&member);
            }
        }

        debug!(
            tenant_id = %scope,
            recipients = recipients.items.len(),
            "Resolved campaign recipients"
        );
        Ok(recipients.items)
    }

    async fn add_system_tag(
        &self,
        scope: TenantScope,
        kind: SystemTag,
        recipients: &mut RecipientSet,
    ) -> Result<(), CampaignError> {
        let Some(tag) = self.contacts.system_tag(scope, kind).await? else {
            debug!(tenant_id = %scope, tag = kind.as_str(), "System tag not configured");
            return Ok(());
        };
        let contacts = self
            .contacts
            .consented_with_any_tag(scope, &[tag.id])
            .await?;
        recipients.add_contacts(&contacts);
        Ok(())
    }
}

/// Insertion-ordered recipients keyed by digits-only phone
#[derive(Default)]
struct RecipientSet {
    items: Vec<NewCampaignItem>,
    phones: HashSet<String>,
}

impl RecipientSet {
    fn claim_phone(&mut self, raw: &str) -> Option<String> {
        let phone = digits_only(raw);
        if phone.is_empty() || !self.phones.insert(phone.clone()) {
            return None;
        }
        Some(phone)
    }

    fn add_contacts(&mut self, contacts: &[Contact]) {
        for contact in contacts {
            let Some(phone) = self.claim_phone(&contact.phone) else {
                continue;
            };
            let substitutions = json!({
                "name": contact.name,
                "first_name": contact.first_name(),
                "city": contact.city,
                "neighborhood": contact.neighborhood,
                "state": contact.state,
                "phone": phone,
            });
            self.items.push(NewCampaignItem {
                contact_id: Some(contact.id),
                recipient_name: contact.name.clone(),
                recipient_phone: phone,
                substitutions,
            });
        }
    }

    fn add_team_member(&mut self, member: &TeamMember) {
        let Some(phone) = self.claim_phone(&member.phone) else {
            return;
        };
        let first_name = member.name.split_whitespace().next().unwrap_or("");
        let substitutions = json!({
            "name": member.name,
            "first_name": first_name,
            "phone": phone,
        });
        self.items.push(NewCampaignItem {
            contact_id: None,
            recipient_name: member.name.clone(),
            recipient_phone: phone,
            substitutions,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_storage::models::SegmentFilter;
    use parley_storage::repository::{CreateTenant, TenantRepository};
    use parley_storage::MemoryStore;
    use pretty_assertions::assert_eq;

    async fn setup() -> (MemoryStore, TenantScope, RecipientResolver) {
        let store = MemoryStore::new();
        let tenant = store
            .create(CreateTenant {
                name: "Acme".into(),
                slug: "acme".into(),
            })
            .await
            .unwrap();
        let resolver = RecipientResolver::new(Arc::new(store.clone()));
        (store, TenantScope::new(tenant.id), resolver)
    }

    fn phones(items: &[NewCampaignItem]) -> Vec<&str> {
        items.iter().map(|i| i.recipient_phone.as_str()).collect()
    }

    #[tokio::test]
    async fn test_empty_rule_is_rejected() {
        let (_, scope, resolver) = setup().await;
        let err = resolver
            .resolve(scope, &TargetingRule::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CampaignError::NoTargetSelected));
    }

    #[tokio::test]
    async fn test_tags_are_any_of_and_deduplicated() {
        let (store, scope, resolver) = setup().await;
        let vip = store.insert_tag(scope, "vip", None);
        let donors = store.insert_tag(scope, "donors", None);

        let ana = store.insert_contact(scope, "Ana Souza", "+55 (81) 99999-0001");
        let bruno = store.insert_contact(scope, "Bruno", "81 99999-0002");
        let same_as_ana = store.insert_contact(scope, "Ana S.", "5581999990001");
        store.tag_contact(ana.id, vip.id);
        store.tag_contact(ana.id, donors.id);
        store.tag_contact(bruno.id, donors.id);
        store.tag_contact(same_as_ana.id, vip.id);

        let rule = TargetingRule {
            tag_ids: vec![vip.id, donors.id],
            ..Default::default()
        };
        let items = resolver.resolve(scope, &rule).await.unwrap();

        assert_eq!(phones(&items), vec!["5581999990001", "81999990002"]);
        assert_eq!(items[0].recipient_name, "Ana Souza");
        assert_eq!(items[0].substitutions["first_name"], "Ana");
        assert_eq!(items[0].contact_id, Some(ana.id));
    }

    #[tokio::test]
    async fn test_only_consented_contacts_with_digits() {
        let (store, scope, resolver) = setup().await;
        let tag = store.insert_tag(scope, "all", None);

        let yes = store.insert_contact(scope, "Yes", "1111");
        let mut no = store.insert_contact(scope, "No", "2222");
        no.messaging_consent = false;
        store.update_contact(no.clone());
        let blank = store.insert_contact(scope, "Blank", "n/a");
        for id in [yes.id, no.id, blank.id] {
            store.tag_contact(id, tag.id);
        }

        let rule = TargetingRule {
            tag_ids: vec![tag.id],
            ..Default::default()
        };
        let items = resolver.resolve(scope, &rule).await.unwrap();
        assert_eq!(phones(&items), vec!["1111"]);
    }

    #[tokio::test]
    async fn test_fixed_groups_and_team_conflict() {
        let (store, scope, resolver) = setup().await;
        let lead_tag = store.insert_tag(scope, "Leads", Some(SystemTag::Lead));
        let lead = store.insert_contact(scope, "Carla Lima", "3333");
        store.tag_contact(lead.id, lead_tag.id);

        store.insert_team_member(scope, "Carla (staff)", "3333");
        store.insert_team_member(scope, "Davi Rocha", "4444");

        let rule = TargetingRule {
            groups: vec![FixedGroup::Team, FixedGroup::Leads, FixedGroup::Supporters],
            ..Default::default()
        };
        let items = resolver.resolve(scope, &rule).await.unwrap();

        assert_eq!(phones(&items), vec!["3333", "4444"]);
        assert_eq!(items[0].recipient_name, "Carla Lima");
        assert_eq!(items[0].contact_id, Some(lead.id));
        assert_eq!(items[1].contact_id, None);
        assert_eq!(items[1].substitutions["first_name"], "Davi");
    }

    #[tokio::test]
    async fn test_segment_filter() {
        let (store, scope, resolver) = setup().await;
        let mut recife = store.insert_contact(scope, "Eva", "5555");
        recife.city = Some("Recife".into());
        store.update_contact(recife.clone());
        store.insert_contact(scope, "Fabio", "6666");

        let segment = store.insert_segment(
            scope,
            "Recife",
            &SegmentFilter {
                city: Some("recife".into()),
                ..Default::default()
            },
        );
        let rule = TargetingRule {
            segment_id: Some(segment.id),
            ..Default::default()
        };
        let items = resolver.resolve(scope, &rule).await.unwrap();

        assert_eq!(phones(&items), vec!["5555"]);
        assert_eq!(items[0].substitutions["city"], "Recife");
    }

    #[tokio::test]
    async fn test_unmatched_rule_resolves_to_nothing() {
        let (store, scope, resolver) = setup().await;
        let tag = store.insert_tag(scope, "nobody", None);
        let rule = TargetingRule {
            tag_ids: vec![tag.id],
            ..Default::default()
        };
        assert!(resolver.resolve(scope, &rule).await.unwrap().is_empty());
    }
}
