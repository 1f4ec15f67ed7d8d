//! vtx apply: mutation planning.
//!
//! Turns desired state into the smallest request body the remote API needs: a create payload
//! carrying only meaningfully-set fields, or an update payload plus the field mask that tells
//! the server which fields to overwrite.

#![forbid(unsafe_code)]

use serde::Serialize;
use serde_json::Value as Json;
use smallvec::SmallVec;
use tracing::debug;
use vtx_core::codec::{self, CodecError, EncryptionSpecWire, EndpointPayload, IsEmptyValue};
use vtx_core::{DesiredEndpoint, EncryptionSpec, Endpoint, Field, FieldSet};

/// Ordered wire names a PATCH may overwrite.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateMask(SmallVec<[&'static str; 4]>);

impl UpdateMask {
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn as_slice(&self) -> &[&'static str] { &self.0 }

    /// Query-parameter form, e.g. `displayName,labels`.
    pub fn join(&self) -> String { self.0.join(",") }

    fn push(&mut self, wire: &'static str) {
        if !self.0.contains(&wire) { self.0.push(wire); }
    }
}

/// Keep `encoded` when it is non-empty and either set by the caller or different from what was
/// last observed.
fn keep<T: IsEmptyValue + PartialEq>(field: Field, encoded: T, prior: Option<T>, explicit: FieldSet) -> Option<T> {
    if encoded.is_empty_value() { return None; }
    if explicit.contains(field) || prior.as_ref() != Some(&encoded) { Some(encoded) } else { None }
}

fn encode_encryption(spec: &Option<Vec<EncryptionSpec>>) -> Result<Option<EncryptionSpecWire>, CodecError> {
    codec::encode_encryption_spec(spec.as_deref())
}

/// Create body. `prior` is the last observed state, if any; without one every non-empty
/// field differs from "nothing" and is sent.
pub fn build_create_payload(desired: &Endpoint, explicit: FieldSet, prior: Option<&Endpoint>) -> Result<EndpointPayload, CodecError> {
    let prior_encryption = match prior {
        Some(p) => Some(encode_encryption(&p.encryption_spec)?),
        None => None,
    };
    let payload = EndpointPayload {
        display_name: keep(
            Field::DisplayName,
            codec::encode_string(&desired.display_name),
            prior.map(|p| codec::encode_string(&p.display_name)),
            explicit,
        ),
        labels: keep(
            Field::Labels,
            codec::encode_labels(&desired.labels),
            prior.map(|p| codec::encode_labels(&p.labels)),
            explicit,
        ),
        encryption_spec: keep(Field::EncryptionSpec, encode_encryption(&desired.encryption_spec)?, prior_encryption, explicit).flatten(),
        metadata_schema_uri: keep(
            Field::MetadataSchemaUri,
            codec::encode_string(&desired.metadata_schema_uri),
            prior.map(|p| codec::encode_string(&p.metadata_schema_uri)),
            explicit,
        ),
    };
    debug!(fields = %payload_fields(&payload), "planner: create payload built");
    Ok(payload)
}

/// Update body and mask. Only mutable fields in `changed` participate. Every such field gets a
/// mask entry; it is written into the body only when its desired value is non-empty, so an
/// empty value with a mask entry clears the field remotely.
pub fn build_update_payload(desired: &Endpoint, changed: FieldSet) -> Result<(EndpointPayload, UpdateMask), CodecError> {
    let mut payload = EndpointPayload::default();
    let mut mask = UpdateMask::default();
    for field in changed.iter().filter(|f| f.is_mutable()) {
        let Some(wire) = field.wire_name() else { continue };
        mask.push(wire);
        match field {
            Field::DisplayName if !desired.display_name.is_empty_value() => {
                payload.display_name = Some(codec::encode_string(&desired.display_name));
            }
            Field::Labels if !desired.labels.is_empty_value() => {
                payload.labels = Some(codec::encode_labels(&desired.labels));
            }
            _ => {}
        }
    }
    debug!(fields = %payload_fields(&payload), mask = %mask.join(), "planner: update payload built");
    Ok((payload, mask))
}

/// Wire form of the encryption spec, with an empty object read as absent. A list that cannot
/// be encoded compares by its local value so it still shows up as a change.
fn normalized_encryption(spec: &Option<Vec<EncryptionSpec>>) -> Result<Option<EncryptionSpecWire>, Vec<EncryptionSpec>> {
    match encode_encryption(spec) {
        Ok(wire) => Ok(wire.filter(|w| !w.is_empty_value())),
        Err(_) => Err(spec.clone().unwrap_or_default()),
    }
}

/// Fields whose desired value differs from the observed one.
///
/// `labels`, `region` and `project` are optional-and-computed: leaving them out of the desired
/// state keeps whatever the server reports, so only an explicit value can change them.
pub fn changed_fields(prior: &Endpoint, desired: &DesiredEndpoint) -> FieldSet {
    let mut set = FieldSet::new();
    if desired.display_name.as_deref().unwrap_or_default() != prior.display_name {
        set.insert(Field::DisplayName);
    }
    if desired.metadata_schema_uri.as_deref().unwrap_or_default() != prior.metadata_schema_uri {
        set.insert(Field::MetadataSchemaUri);
    }
    if desired.labels.as_ref().is_some_and(|l| *l != prior.labels) {
        set.insert(Field::Labels);
    }
    if normalized_encryption(&desired.encryption_spec) != normalized_encryption(&prior.encryption_spec) {
        set.insert(Field::EncryptionSpec);
    }
    if desired.region.as_deref().is_some_and(|r| !r.is_empty() && r != prior.region) {
        set.insert(Field::Region);
    }
    if desired.project.as_deref().is_some_and(|p| !p.is_empty() && p != prior.project) {
        set.insert(Field::Project);
    }
    set
}

/// One changed field, rendered for humans and JSON output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub field: &'static str,
    pub before: Json,
    pub after: Json,
    pub immutable: bool,
}

fn local_value(e: &Endpoint, field: Field) -> Json {
    use serde_json::json;
    match field {
        Field::Name => json!(e.name),
        Field::DisplayName => json!(e.display_name),
        Field::Labels => json!(e.labels),
        Field::EncryptionSpec => json!(e.encryption_spec),
        Field::MetadataSchemaUri => json!(e.metadata_schema_uri),
        Field::Region => json!(e.region),
        Field::Project => json!(e.project),
        Field::CreateTime => json!(e.create_time),
        Field::UpdateTime => json!(e.update_time),
    }
}

/// Before/after pairs for each field in `changed`.
pub fn describe_changes(prior: &Endpoint, desired: &Endpoint, changed: FieldSet) -> Vec<FieldChange> {
    changed
        .iter()
        .map(|f| FieldChange { field: f.local_name(), before: local_value(prior, f), after: local_value(desired, f), immutable: f.is_immutable() })
        .collect()
}

fn payload_fields(p: &EndpointPayload) -> String {
    p.to_json().as_object().map(|o| o.keys().cloned().collect::<Vec<_>>().join(",")).unwrap_or_default()
}
