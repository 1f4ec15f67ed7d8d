//! Field codec: local typed values <-> remote JSON.
//!
//! Encoding produces typed wire records (`EndpointPayload`, `EncryptionSpecWire`) that
//! serialize deterministically. Decoding reads a loosely-shaped `serde_json::Value` and
//! tolerates absent fields, but reports values of the wrong JSON type as `CodecError`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::{EncryptionSpec, Endpoint};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("{field}: expected {expected}, found {found}")]
    TypeMismatch { field: String, expected: &'static str, found: &'static str },
    #[error("{field}: at most {max} element(s) allowed, got {got}")]
    TooManyItems { field: &'static str, max: usize, got: usize },
}

/// Zero-value predicate per field kind.
pub trait IsEmptyValue {
    fn is_empty_value(&self) -> bool;
}

impl IsEmptyValue for String {
    fn is_empty_value(&self) -> bool { self.is_empty() }
}

impl IsEmptyValue for str {
    fn is_empty_value(&self) -> bool { self.is_empty() }
}

impl<K, V> IsEmptyValue for BTreeMap<K, V> {
    fn is_empty_value(&self) -> bool { self.is_empty() }
}

impl<T: IsEmptyValue> IsEmptyValue for Option<T> {
    fn is_empty_value(&self) -> bool { self.as_ref().map_or(true, IsEmptyValue::is_empty_value) }
}

impl<T> IsEmptyValue for Vec<T> {
    fn is_empty_value(&self) -> bool { self.is_empty() }
}

/// Wire form of the encryption spec: a bare object, possibly without keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionSpecWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kms_key_name: Option<String>,
}

impl IsEmptyValue for EncryptionSpecWire {
    fn is_empty_value(&self) -> bool { self.kms_key_name.is_none() }
}

/// Outbound request body. Only populated fields are serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_spec: Option<EncryptionSpecWire>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_schema_uri: Option<String>,
}

impl EndpointPayload {
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none() && self.labels.is_none() && self.encryption_spec.is_none() && self.metadata_schema_uri.is_none()
    }

    pub fn to_json(&self) -> Json {
        // Plain strings and maps only; serialization cannot fail.
        serde_json::to_value(self).unwrap_or_else(|_| Json::Object(Default::default()))
    }
}

// ---------------- encode ----------------

pub fn encode_string(v: &str) -> String { v.to_string() }

pub fn encode_labels(v: &BTreeMap<String, String>) -> BTreeMap<String, String> { v.clone() }

/// Absent or an empty list encode to `None`. An empty key name is dropped from the object,
/// leaving an empty object the caller is expected to omit.
pub fn encode_encryption_spec(v: Option<&[EncryptionSpec]>) -> Result<Option<EncryptionSpecWire>, CodecError> {
    let items = match v {
        None => return Ok(None),
        Some(items) => items,
    };
    match items {
        [] => Ok(None),
        [spec] => {
            let kms = encode_string(&spec.kms_key_name);
            Ok(Some(EncryptionSpecWire { kms_key_name: if kms.is_empty_value() { None } else { Some(kms) } }))
        }
        _ => Err(CodecError::TooManyItems { field: "encryption_spec", max: 1, got: items.len() }),
    }
}

// ---------------- decode ----------------

fn json_kind(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

fn mismatch(field: &str, expected: &'static str, found: &Json) -> CodecError {
    CodecError::TypeMismatch { field: field.to_string(), expected, found: json_kind(found) }
}

/// Scalar pass-through. Absent or null decode to the empty string.
pub fn decode_string(field: &str, v: Option<&Json>) -> Result<String, CodecError> {
    match v {
        None | Some(Json::Null) => Ok(String::new()),
        Some(Json::String(s)) => Ok(s.clone()),
        Some(other) => Err(mismatch(field, "string", other)),
    }
}

/// Absent or null decode to an empty map so comparisons stay stable.
pub fn decode_labels(v: Option<&Json>) -> Result<BTreeMap<String, String>, CodecError> {
    match v {
        None | Some(Json::Null) => Ok(BTreeMap::new()),
        Some(Json::Object(map)) => {
            let mut out = BTreeMap::new();
            for (k, val) in map.iter() {
                match val {
                    Json::String(s) => { out.insert(k.clone(), s.clone()); }
                    other => return Err(mismatch(&format!("labels.{}", k), "string", other)),
                }
            }
            Ok(out)
        }
        Some(other) => Err(mismatch("labels", "object", other)),
    }
}

/// Missing, null or `{}` decode to absent; anything else to a single-element list.
pub fn decode_encryption_spec(v: Option<&Json>) -> Result<Option<Vec<EncryptionSpec>>, CodecError> {
    match v {
        None | Some(Json::Null) => Ok(None),
        Some(Json::Object(map)) if map.is_empty() => Ok(None),
        Some(Json::Object(map)) => {
            let kms_key_name = decode_string("encryptionSpec.kmsKeyName", map.get("kmsKeyName"))?;
            Ok(Some(vec![EncryptionSpec { kms_key_name }]))
        }
        Some(other) => Err(mismatch("encryptionSpec", "object", other)),
    }
}

/// Decode a full remote representation. `project`/`region` are address context and are left
/// for the caller to fill in.
pub fn decode_endpoint(v: &Json) -> Result<Endpoint, CodecError> {
    let obj = match v {
        Json::Object(obj) => obj,
        other => return Err(mismatch("endpoint", "object", other)),
    };
    Ok(Endpoint {
        name: decode_string("name", obj.get("name"))?,
        display_name: decode_string("displayName", obj.get("displayName"))?,
        create_time: decode_string("createTime", obj.get("createTime"))?,
        update_time: decode_string("updateTime", obj.get("updateTime"))?,
        labels: decode_labels(obj.get("labels"))?,
        encryption_spec: decode_encryption_spec(obj.get("encryptionSpec"))?,
        metadata_schema_uri: decode_string("metadataSchemaUri", obj.get("metadataSchemaUri"))?,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(k: &str) -> Vec<EncryptionSpec> { vec![EncryptionSpec { kms_key_name: k.to_string() }] }

    #[test]
    fn encryption_spec_absent_round_trips() {
        let wire = encode_encryption_spec(None).unwrap();
        assert_eq!(wire, None);
        let back = decode_encryption_spec(wire.map(|w| serde_json::to_value(w).unwrap()).as_ref()).unwrap();
        assert_eq!(back, None);
    }

    #[test]
    fn encryption_spec_with_key_round_trips() {
        let local = spec("projects/p/locations/r/keyRings/kr/cryptoKeys/k");
        let wire = encode_encryption_spec(Some(local.as_slice())).unwrap().expect("present");
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json, json!({ "kmsKeyName": "projects/p/locations/r/keyRings/kr/cryptoKeys/k" }));
        assert_eq!(decode_encryption_spec(Some(&json)).unwrap(), Some(local));
    }

    #[test]
    fn encryption_spec_empty_key_encodes_to_empty_object() {
        let wire = encode_encryption_spec(Some(spec("").as_slice())).unwrap().expect("object");
        assert!(wire.is_empty_value());
        assert_eq!(serde_json::to_value(&wire).unwrap(), json!({}));
    }

    #[test]
    fn encryption_spec_empty_list_is_absent() {
        assert_eq!(encode_encryption_spec(Some(&[][..])).unwrap(), None);
    }

    #[test]
    fn encryption_spec_rejects_multiple_items() {
        let two = vec![EncryptionSpec { kms_key_name: "a".into() }, EncryptionSpec { kms_key_name: "b".into() }];
        let err = encode_encryption_spec(Some(two.as_slice())).unwrap_err();
        assert_eq!(err, CodecError::TooManyItems { field: "encryption_spec", max: 1, got: 2 });
    }

    #[test]
    fn encryption_spec_decodes_empty_object_and_null_as_absent() {
        assert_eq!(decode_encryption_spec(Some(&json!({}))).unwrap(), None);
        assert_eq!(decode_encryption_spec(Some(&Json::Null)).unwrap(), None);
        assert_eq!(decode_encryption_spec(None).unwrap(), None);
    }

    #[test]
    fn encryption_spec_object_without_key_decodes_to_blank_entry() {
        let got = decode_encryption_spec(Some(&json!({ "other": 1 }))).unwrap();
        assert_eq!(got, Some(spec("")));
    }

    #[test]
    fn labels_absent_decode_to_empty_map() {
        assert!(decode_labels(None).unwrap().is_empty());
        assert!(decode_labels(Some(&Json::Null)).unwrap().is_empty());
    }

    #[test]
    fn malformed_inputs_are_errors_not_panics() {
        let e = decode_labels(Some(&json!(["a"]))).unwrap_err();
        assert_eq!(e, CodecError::TypeMismatch { field: "labels".into(), expected: "object", found: "array" });

        let e = decode_labels(Some(&json!({ "env": 1 }))).unwrap_err();
        assert_eq!(e, CodecError::TypeMismatch { field: "labels.env".into(), expected: "string", found: "number" });

        let e = decode_encryption_spec(Some(&json!("k"))).unwrap_err();
        assert!(e.to_string().contains("encryptionSpec"), "e={}", e);

        let e = decode_encryption_spec(Some(&json!({ "kmsKeyName": true }))).unwrap_err();
        assert_eq!(e, CodecError::TypeMismatch { field: "encryptionSpec.kmsKeyName".into(), expected: "string", found: "bool" });

        let e = decode_string("displayName", Some(&json!(42))).unwrap_err();
        assert!(e.to_string().contains("displayName: expected string, found number"), "e={}", e);

        assert!(decode_endpoint(&json!([])).is_err());
        assert!(decode_endpoint(&json!({ "createTime": {} })).is_err());
    }

    #[test]
    fn decode_endpoint_tolerates_partial_payload() {
        let e = decode_endpoint(&json!({
            "name": "projects/p/locations/r/endpoints/1",
            "displayName": "svc-a",
            "createTime": "2024-05-01T10:00:00.123456789Z"
        }))
        .unwrap();
        assert_eq!(e.name, "projects/p/locations/r/endpoints/1");
        assert_eq!(e.display_name, "svc-a");
        assert_eq!(e.create_time, "2024-05-01T10:00:00.123456789Z");
        assert_eq!(e.update_time, "");
        assert!(e.labels.is_empty());
        assert_eq!(e.encryption_spec, None);
        assert_eq!(e.metadata_schema_uri, "");
    }

    #[test]
    fn payload_serializes_only_set_fields() {
        let p = EndpointPayload { display_name: Some("svc-a".into()), ..Default::default() };
        assert_eq!(p.to_json(), json!({ "displayName": "svc-a" }));
        assert!(EndpointPayload::default().is_empty());
        assert_eq!(EndpointPayload::default().to_json(), json!({}));
    }

    #[test]
    fn emptiness_predicates() {
        assert!(String::new().is_empty_value());
        assert!(!"x".to_string().is_empty_value());
        assert!(BTreeMap::<String, String>::new().is_empty_value());
        assert!(None::<String>.is_empty_value());
        assert!(Some(String::new()).is_empty_value());
        assert!(Some(EncryptionSpecWire::default()).is_empty_value());
        assert!(!Some(EncryptionSpecWire { kms_key_name: Some("k".into()) }).is_empty_value());
    }
}
