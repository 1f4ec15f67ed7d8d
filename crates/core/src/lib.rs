//! vtx core types: the Endpoint model, its field table, and the wire codec.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod codec;
pub mod fields;

pub use fields::{Field, FieldSet, Mutability};

/// Customer-managed encryption key reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionSpec {
    #[serde(default)]
    pub kms_key_name: String,
}

/// Local typed state of one Endpoint instance.
///
/// Empty strings mean "unset". `encryption_spec` is either absent or a single-element list;
/// it is never decoded as an empty list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub metadata_schema_uri: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_spec: Option<Vec<EncryptionSpec>>,
    #[serde(default)]
    pub create_time: String,
    #[serde(default)]
    pub update_time: String,
}

impl Endpoint {
    /// Resource identity, if the server has assigned one.
    pub fn id(&self) -> Option<&str> {
        if self.name.is_empty() { None } else { Some(self.name.as_str()) }
    }
}

/// Caller-declared target configuration. `None` means the field was not written by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredEndpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_schema_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_spec: Option<Vec<EncryptionSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

impl DesiredEndpoint {
    /// Fields the caller set explicitly.
    pub fn explicit(&self) -> FieldSet {
        let mut set = FieldSet::new();
        if self.display_name.is_some() { set.insert(Field::DisplayName); }
        if self.metadata_schema_uri.is_some() { set.insert(Field::MetadataSchemaUri); }
        if self.labels.is_some() { set.insert(Field::Labels); }
        if self.encryption_spec.is_some() { set.insert(Field::EncryptionSpec); }
        if self.region.is_some() { set.insert(Field::Region); }
        if self.project.is_some() { set.insert(Field::Project); }
        set
    }

    /// Required fields that are missing or empty.
    pub fn missing_required(&self) -> FieldSet {
        let mut set = FieldSet::new();
        if self.display_name.as_deref().map_or(true, str::is_empty) { set.insert(Field::DisplayName); }
        if self.metadata_schema_uri.as_deref().map_or(true, str::is_empty) { set.insert(Field::MetadataSchemaUri); }
        set
    }

    /// Materialize the typed local view; unset fields take their zero value.
    pub fn to_endpoint(&self) -> Endpoint {
        Endpoint {
            project: self.project.clone().unwrap_or_default(),
            region: self.region.clone().unwrap_or_default(),
            display_name: self.display_name.clone().unwrap_or_default(),
            metadata_schema_uri: self.metadata_schema_uri.clone().unwrap_or_default(),
            labels: self.labels.clone().unwrap_or_default(),
            encryption_spec: self.encryption_spec.clone(),
            ..Default::default()
        }
    }
}

/// Parsed form of `projects/{project}/locations/{region}/endpoints/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointName {
    pub project: String,
    pub region: String,
    pub id: String,
}

impl EndpointName {
    pub fn parse(name: &str) -> Option<Self> {
        let parts: Vec<&str> = name.split('/').collect();
        match parts.as_slice() {
            ["projects", project, "locations", region, "endpoints", id]
                if !project.is_empty() && !region.is_empty() && !id.is_empty() =>
            {
                Some(Self { project: (*project).to_string(), region: (*region).to_string(), id: (*id).to_string() })
            }
            _ => None,
        }
    }

    /// Collection path used for creation.
    pub fn collection(project: &str, region: &str) -> String {
        format!("projects/{}/locations/{}/endpoints", project, region)
    }
}

impl fmt::Display for EndpointName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Self::collection(&self.project, &self.region), self.id)
    }
}

pub mod prelude {
    pub use super::{DesiredEndpoint, EncryptionSpec, Endpoint, EndpointName, Field, FieldSet, Mutability};
    pub use super::codec::{CodecError, EndpointPayload, IsEmptyValue};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_name_parses_and_renders() {
        let n = EndpointName::parse("projects/p1/locations/us-central1/endpoints/123").expect("parse");
        assert_eq!(n.project, "p1");
        assert_eq!(n.region, "us-central1");
        assert_eq!(n.id, "123");
        assert_eq!(n.to_string(), "projects/p1/locations/us-central1/endpoints/123");
    }

    #[test]
    fn endpoint_name_rejects_other_shapes() {
        assert!(EndpointName::parse("").is_none());
        assert!(EndpointName::parse("projects/p1/locations/us-central1/endpoints").is_none());
        assert!(EndpointName::parse("projects/p1/locations/us-central1/models/1").is_none());
        assert!(EndpointName::parse("projects//locations/r/endpoints/1").is_none());
    }

    #[test]
    fn explicit_tracks_written_fields_only() {
        let d = DesiredEndpoint {
            display_name: Some("svc-a".into()),
            labels: Some(BTreeMap::new()),
            ..Default::default()
        };
        let set = d.explicit();
        assert!(set.contains(Field::DisplayName));
        assert!(set.contains(Field::Labels));
        assert!(!set.contains(Field::EncryptionSpec));
        assert!(!set.contains(Field::MetadataSchemaUri));
    }

    #[test]
    fn missing_required_flags_empty_values() {
        let d = DesiredEndpoint { display_name: Some(String::new()), ..Default::default() };
        let missing = d.missing_required();
        assert!(missing.contains(Field::DisplayName));
        assert!(missing.contains(Field::MetadataSchemaUri));
    }

    #[test]
    fn desired_deserializes_from_yaml_shape() {
        let d: DesiredEndpoint = serde_json::from_value(serde_json::json!({
            "display_name": "svc-a",
            "metadata_schema_uri": "gs://x/schema.yaml",
            "encryption_spec": [{ "kms_key_name": "k" }]
        }))
        .expect("decode");
        let e = d.to_endpoint();
        assert_eq!(e.display_name, "svc-a");
        assert!(e.labels.is_empty());
        assert_eq!(e.encryption_spec, Some(vec![EncryptionSpec { kms_key_name: "k".into() }]));
    }
}
