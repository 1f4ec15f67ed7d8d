//! Declarative apply: decide what a desired endpoint needs relative to saved state.

use serde::Serialize;
use vtx_apply::{changed_fields, describe_changes, FieldChange};
use vtx_core::{DesiredEndpoint, Endpoint, Field, FieldSet};

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    Create,
    Update { changed: FieldSet },
    Noop,
}

impl Plan {
    pub fn action(&self) -> &'static str {
        match self {
            Plan::Create => "create",
            Plan::Update { .. } => "update",
            Plan::Noop => "noop",
        }
    }
}

/// Renderable form of a plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub changes: Vec<FieldChange>,
}

/// No prior state creates; immutable drift is rejected; any other difference updates.
pub fn plan(desired: &DesiredEndpoint, prior: Option<&Endpoint>) -> Result<Plan, Error> {
    let missing = desired.missing_required();
    if !missing.is_empty() {
        return Err(Error::Validation(format!("missing required fields: {}", missing)));
    }
    let Some(prior) = prior else { return Ok(Plan::Create) };
    let changed = changed_fields(prior, desired);
    let drift = changed.filter(Field::is_immutable);
    if !drift.is_empty() {
        return Err(Error::Validation(format!(
            "{}: immutable fields differ from the existing endpoint: {} (delete and recreate to change them)",
            prior.name, drift
        )));
    }
    Ok(if changed.is_empty() { Plan::Noop } else { Plan::Update { changed } })
}

impl PlanReport {
    pub fn new(plan: &Plan, desired: &DesiredEndpoint, prior: Option<&Endpoint>) -> Self {
        let target = desired.to_endpoint();
        let changes = match (plan, prior) {
            (Plan::Update { changed }, Some(p)) => describe_changes(p, &target, *changed),
            (Plan::Create, _) => describe_changes(&Endpoint::default(), &target, desired.explicit()),
            _ => Vec::new(),
        };
        Self { action: plan.action(), name: prior.and_then(Endpoint::id).map(str::to_string), changes }
    }
}
