//! # CRM entities
//!
//! The shapes the embedding core consumes from the HubSpot client and the
//! bookkeeping it keeps for every indexed row.
//!
//! ```rust
//! use hubspot_mcp::entity::{EntityRecord, EntityType};
//!
//! let json = r#"{"id": "51", "properties": {"firstname": "John", "phone": null}}"#;
//! let contact: EntityRecord = serde_json::from_str(json).unwrap();
//! assert_eq!(contact.property("firstname"), Some("John"));
//! assert_eq!(contact.property("phone"), None);
//! assert_eq!("contacts".parse::<EntityType>().unwrap(), EntityType::Contacts);
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A CRM record as returned by the HubSpot objects API.
///
/// Only `id` and `properties` matter to the embedding core. HubSpot sends
/// `null` for unset properties; those are dropped on deserialization, and a
/// missing `properties` key yields an empty map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    #[serde(default, deserialize_with = "non_null_properties")]
    pub properties: BTreeMap<String, String>,
}

impl EntityRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Builder-style property setter, mostly useful in tests and fixtures.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

fn non_null_properties<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, Option<String>>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k, v)))
        .collect())
}

/// The CRM object families that can be indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Contacts,
    Companies,
    Deals,
    Engagements,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::Contacts,
        EntityType::Companies,
        EntityType::Deals,
        EntityType::Engagements,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Contacts => "contacts",
            EntityType::Companies => "companies",
            EntityType::Deals => "deals",
            EntityType::Engagements => "engagements",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name one of the four entity families.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownEntityType(pub String);

impl fmt::Display for UnknownEntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown entity type `{}` (expected contacts, companies, deals or engagements)",
            self.0
        )
    }
}

impl std::error::Error for UnknownEntityType {}

impl FromStr for EntityType {
    type Err = UnknownEntityType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownEntityType(s.to_string()))
    }
}

/// What the index remembers about one stored vector.
///
/// `row_index` is the vector's position in the index; it is assigned in
/// insertion order and stays valid until the next clear or rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedEntityMetadata {
    pub row_index: usize,
    pub entity_type: EntityType,
    pub entity: EntityRecord,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EntityBatch {
    Records(Vec<EntityRecord>),
    ListResponse { results: Vec<EntityRecord> },
}

/// Parse a batch of records from either a bare JSON array or a HubSpot list
/// response (`{"results": [...], "paging": ...}`).
pub fn parse_entities(json: &str) -> Result<Vec<EntityRecord>, serde_json::Error> {
    Ok(match serde_json::from_str::<EntityBatch>(json)? {
        EntityBatch::Records(records) => records,
        EntityBatch::ListResponse { results } => results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_parse_from_array_or_list_response() {
        let array = r#"[{"id": "1", "properties": {"name": "Acme"}}, {"id": "2"}]"#;
        let records = parse_entities(array).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].property("name"), Some("Acme"));

        let response = r#"{
            "results": [{"id": "9", "properties": {"dealname": "Renewal", "amount": null}}],
            "paging": {"next": {"after": "10"}}
        }"#;
        let records = parse_entities(response).unwrap();
        assert_eq!(records, vec![EntityRecord::new("9").with_property("dealname", "Renewal")]);

        assert!(parse_entities(r#"{"items": []}"#).is_err());
    }

    #[test]
    fn null_properties_are_dropped() {
        let json = r#"{"id": "7", "properties": {"name": "Acme", "domain": null}}"#;
        let record: EntityRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.properties.len(), 1);
        assert_eq!(record.property("name"), Some("Acme"));
    }

    #[test]
    fn missing_properties_key_is_empty() {
        let record: EntityRecord = serde_json::from_str(r#"{"id": "7"}"#).unwrap();
        assert!(record.properties.is_empty());

        let record: EntityRecord =
            serde_json::from_str(r#"{"id": "8", "properties": null}"#).unwrap();
        assert!(record.properties.is_empty());
    }

    #[test]
    fn entity_type_parses_case_insensitively() {
        assert_eq!("Deals".parse::<EntityType>().unwrap(), EntityType::Deals);
        assert_eq!(
            " engagements ".parse::<EntityType>().unwrap(),
            EntityType::Engagements
        );
        assert!("tickets".parse::<EntityType>().is_err());
    }

    #[test]
    fn entity_type_serializes_lowercase() {
        let yaml = serde_yaml::to_string(&EntityType::Companies).unwrap();
        assert_eq!(yaml.trim(), "companies");
        for t in EntityType::ALL {
            assert_eq!(t.to_string().parse::<EntityType>().unwrap(), t);
        }
    }
}
