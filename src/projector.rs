//! # Text projection
//!
//! Reduces an [`EntityRecord`] to the single string that gets embedded. Each
//! [`EntityType`] has a fixed, ordered list of HubSpot property names; the
//! non-empty values of those properties are joined with single spaces.
//! Missing properties contribute nothing, and a type with no field list
//! (engagements) projects to `""`.
//!
//! ```rust
//! use hubspot_mcp::entity::{EntityRecord, EntityType};
//! use hubspot_mcp::projector::project;
//!
//! let jane = EntityRecord::new("2")
//!     .with_property("email", "jane@x.com")
//!     .with_property("lastname", "Smith")
//!     .with_property("firstname", "Jane");
//! assert_eq!(project(&jane, EntityType::Contacts), "Jane Smith jane@x.com");
//! ```

use crate::entity::{EntityRecord, EntityType};

const CONTACT_FIELDS: &[&str] = &["firstname", "lastname", "email", "jobtitle", "company", "phone"];
const COMPANY_FIELDS: &[&str] = &["name", "domain", "industry", "description", "city", "country"];
const DEAL_FIELDS: &[&str] = &["dealname", "dealstage", "pipeline", "closedate", "amount"];

/// The ordered property names projected for `entity_type`.
pub fn projection_fields(entity_type: EntityType) -> &'static [&'static str] {
    match entity_type {
        EntityType::Contacts => CONTACT_FIELDS,
        EntityType::Companies => COMPANY_FIELDS,
        EntityType::Deals => DEAL_FIELDS,
        EntityType::Engagements => &[],
    }
}

/// Project `entity` to its embedding input text.
pub fn project(entity: &EntityRecord, entity_type: EntityType) -> String {
    projection_fields(entity_type)
        .iter()
        .filter_map(|field| entity.property(field))
        .filter(|value| !value.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    #[test]
    fn contact_fields_follow_fixed_order() {
        let contact = EntityRecord::new("1")
            .with_property("phone", "555-0100")
            .with_property("company", "Acme")
            .with_property("jobtitle", "CTO")
            .with_property("email", "john@x.com")
            .with_property("lastname", "Doe")
            .with_property("firstname", "John")
            .with_property("hs_object_id", "1");
        assert_eq!(
            project(&contact, EntityType::Contacts),
            "John Doe john@x.com CTO Acme 555-0100"
        );
    }

    #[test]
    fn company_and_deal_projections() {
        let company = EntityRecord::new("10")
            .with_property("name", "Acme")
            .with_property("country", "US")
            .with_property("industry", "");
        assert_eq!(project(&company, EntityType::Companies), "Acme US");

        let deal = EntityRecord::new("20")
            .with_property("amount", "5000")
            .with_property("dealname", "Renewal")
            .with_property("dealstage", "closedwon");
        assert_eq!(project(&deal, EntityType::Deals), "Renewal closedwon 5000");
    }

    #[test]
    fn empty_or_unprojected_entities_give_empty_text() {
        assert_eq!(project(&EntityRecord::new("1"), EntityType::Contacts), "");

        let engagement = EntityRecord::new("30").with_property("hs_body_preview", "Call notes");
        assert_eq!(project(&engagement, EntityType::Engagements), "");

        // Properties that belong to another entity type are ignored.
        let contact = EntityRecord::new("1").with_property("dealname", "Renewal");
        assert_eq!(project(&contact, EntityType::Contacts), "");
    }

    fn property_map() -> impl Strategy<Value = BTreeMap<String, String>> {
        let known: Vec<String> = CONTACT_FIELDS
            .iter()
            .chain(COMPANY_FIELDS)
            .chain(DEAL_FIELDS)
            .map(|f| f.to_string())
            .collect();
        let key = prop_oneof![prop::sample::select(known), "[a-z_]{1,10}"];
        prop::collection::btree_map(key, "[ -~]{0,16}", 0..12)
    }

    fn entity_type() -> impl Strategy<Value = EntityType> {
        prop::sample::select(EntityType::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn projection_is_deterministic(properties in property_map(), t in entity_type()) {
            let entity = EntityRecord { id: "x".into(), properties: properties.clone() };
            let copy = EntityRecord { id: "y".into(), properties };
            prop_assert_eq!(project(&entity, t), project(&entity, t));
            prop_assert_eq!(project(&entity, t), project(&copy, t));
        }

        #[test]
        fn projection_only_uses_listed_fields(properties in property_map(), t in entity_type()) {
            let entity = EntityRecord { id: "x".into(), properties };
            let expected: Vec<&str> = projection_fields(t)
                .iter()
                .filter_map(|f| entity.property(f))
                .filter(|v| !v.is_empty())
                .collect();
            prop_assert_eq!(project(&entity, t), expected.join(" "));
        }
    }
}
