//! vtx reconciler: Create / Read / Update / Delete for Endpoints.
//!
//! [`Reconciler`] drives the remote control plane through a [`Transport`], waits on the
//! long-running operations mutating calls return, and re-reads the resource so callers always
//! get server-authoritative state. Entry points take state by reference and return new state;
//! a failed call leaves the caller's state as it was.

#![forbid(unsafe_code)]

use std::time::Duration;

use metrics::{counter, histogram};
use serde_json::Value as Json;
use tokio::time::Instant;
use tracing::{info, warn};
use vtx_apply::{build_create_payload, build_update_payload};
use vtx_core::codec::{decode_endpoint, CodecError};
use vtx_core::{DesiredEndpoint, Endpoint, EndpointName, Field, FieldSet};
use vtx_hub::{add_query_params, Method, Request, Transport, TransportError};
use vtx_ops::{deadline_for, Operation, OperationWaiter, PollError};

pub mod config;
pub mod plan;

pub use config::{CallOptions, ProviderConfig, Timeouts};
pub use plan::{plan, Plan, PlanReport};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing addressing context. Raised before any request is sent.
    #[error("configuration: {0}")]
    Config(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("{context}: {source}")]
    Transport { context: String, #[source] source: TransportError },
    /// The remote accepted the action and then reported that it failed.
    #[error("{context}: operation {operation} failed (code {code}): {message}")]
    OperationFailed { context: String, operation: String, code: i64, message: String },
    /// We stopped waiting; the remote action may still complete.
    #[error("{context}: deadline exceeded after {waited:?} waiting for {operation}{detail}")]
    DeadlineExceeded { context: String, operation: String, waited: Duration, detail: String },
    #[error("{context}: {source}")]
    Codec { context: String, #[source] source: CodecError },
    #[error("{context}: malformed response: {reason}")]
    Malformed { context: String, reason: String },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Transport { source, .. } if source.is_not_found())
    }

    fn poll(context: &str, e: PollError) -> Self {
        let context = context.to_string();
        match e {
            PollError::OperationFailed { operation, code, message, .. } => Error::OperationFailed { context, operation, code, message },
            PollError::DeadlineExceeded { operation, waited, last_error, .. } => Error::DeadlineExceeded {
                context,
                operation,
                waited,
                detail: last_error.map(|e| format!(" (last error: {})", e)).unwrap_or_default(),
            },
            PollError::Transport { operation, source, .. } => Error::Transport { context: format!("{} (operation {})", context, operation), source },
            PollError::Malformed { reason } => Error::Malformed { context, reason },
        }
    }
}

/// Result of a read.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    Found(Endpoint),
    /// The resource no longer exists; the caller should drop its state.
    Gone,
}

/// Executed plan and the state it produced.
#[derive(Debug, Clone)]
pub struct Applied {
    pub plan: Plan,
    pub endpoint: Endpoint,
}

fn record<T>(op: &'static str, started: Instant, res: &Result<T, Error>) {
    counter!("reconcile_total", 1u64, "op" => op);
    if res.is_err() { counter!("reconcile_err_total", 1u64, "op" => op); }
    histogram!("reconcile_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
}

fn region_of(name: &str) -> Option<String> {
    EndpointName::parse(name).map(|n| n.region)
}

fn project_of(name: &str) -> Option<String> {
    EndpointName::parse(name).map(|n| n.project)
}

pub struct Reconciler<T> {
    transport: T,
    config: ProviderConfig,
}

impl<T: Transport> Reconciler<T> {
    pub fn new(transport: T, config: ProviderConfig) -> Self { Self { transport, config } }

    pub fn config(&self) -> &ProviderConfig { &self.config }

    pub fn transport(&self) -> &T { &self.transport }

    /// Status checks are attributed to the resource's own project, not the billing override.
    fn waiter<'a>(&'a self, base: &'a str, project: &'a str) -> OperationWaiter<'a, T> {
        OperationWaiter::new(&self.transport, base, project, self.config.poll)
    }

    /// Project of an existing endpoint: the call override, then saved state, then its name.
    fn resource_project(&self, current: &Endpoint, opts: &CallOptions) -> Result<String, Error> {
        let saved = current.id().map(|_| current.project.as_str()).filter(|s| !s.is_empty());
        let from_name = current.id().and_then(project_of);
        self.config.resolve_project(opts.project.as_deref().or(saved).or(from_name.as_deref()))
    }

    /// Send one request, bounded by `deadline`. Nothing is sent once it has passed.
    async fn send(&self, context: &str, method: Method, billing: &str, url: &str, body: Option<&Json>, started: Instant, deadline: Instant) -> Result<Json, Error> {
        let expired = || Error::DeadlineExceeded {
            context: context.to_string(),
            operation: format!("{} {}", method, url),
            waited: started.elapsed(),
            detail: String::new(),
        };
        let timeout = deadline.saturating_duration_since(Instant::now());
        if timeout.is_zero() { return Err(expired()); }
        let req = Request { method, project: billing, url, body, timeout };
        match tokio::time::timeout_at(deadline, self.transport.send(req)).await {
            Ok(res) => res.map_err(|source| Error::Transport { context: context.to_string(), source }),
            Err(_) => Err(expired()),
        }
    }

    /// Create the endpoint, wait for the operation, then read it back.
    ///
    /// `prior` is the last observed state, if any; fields equal to it and not set explicitly
    /// are left out of the request. On failure no identity is returned.
    pub async fn create(&self, desired: &DesiredEndpoint, prior: Option<&Endpoint>, opts: &CallOptions) -> Result<Endpoint, Error> {
        let t0 = Instant::now();
        let res = self.create_inner(desired, prior, opts, t0).await;
        record("create", t0, &res);
        match &res {
            Ok(e) => info!(name = %e.name, took_ms = %t0.elapsed().as_millis(), "api: create ok"),
            Err(e) => warn!(error = %e, took_ms = %t0.elapsed().as_millis(), "api: create failed"),
        }
        res
    }

    async fn create_inner(&self, desired: &DesiredEndpoint, prior: Option<&Endpoint>, opts: &CallOptions, t0: Instant) -> Result<Endpoint, Error> {
        let project = self.config.resolve_project(opts.project.as_deref().or(desired.project.as_deref()))?;
        let region = self.config.resolve_region(opts.region.as_deref().or(desired.region.as_deref()))?;
        let base = self.config.base_path(&region)?;
        let missing = desired.missing_required();
        if !missing.is_empty() {
            return Err(Error::Validation(format!("missing required fields: {}", missing)));
        }
        let collection = EndpointName::collection(&project, &region);
        let context = format!("creating endpoint in {}", collection);
        let payload = build_create_payload(&desired.to_endpoint(), desired.explicit(), prior)
            .map_err(|source| Error::Codec { context: context.clone(), source })?;
        let billing = self.config.billing(&project);
        let deadline = deadline_for(opts.timeouts.create, opts.deadline);
        info!(project = %project, region = %region, display_name = %desired.display_name.as_deref().unwrap_or(""), "api: create start");

        let body = payload.to_json();
        let url = format!("{}{}", base, collection);
        let resp = self.send(&context, Method::Post, billing, &url, Some(&body), t0, deadline).await?;
        let op = Operation::from_json(&resp).map_err(|e| Error::poll(&context, e))?;
        let op_name = op.name.clone();
        let from_op = op.resource_name().map(str::to_string);
        let done = self
            .waiter(&base, &project)
            .wait(op, "Creating Endpoint", deadline, None)
            .await
            .map_err(|e| Error::poll(&context, e))?;

        let name = done
            .as_ref()
            .and_then(|r| r.get("name"))
            .and_then(Json::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or(from_op)
            .ok_or_else(|| Error::Malformed { context: context.clone(), reason: format!("operation {} finished without a resource name", op_name) })?;
        info!(name = %name, op = %op_name, "api: create accepted; reading back");

        let read_deadline = deadline_for(opts.timeouts.read, opts.deadline);
        match self.read_name(&name, &project, &region, read_deadline).await? {
            ReadOutcome::Found(e) => Ok(e),
            ReadOutcome::Gone => Err(Error::Transport {
                context: format!("reading back {}", name),
                source: TransportError::not_found("endpoint vanished right after creation"),
            }),
        }
    }

    /// Fetch current remote state. Not-found is [`ReadOutcome::Gone`], never an error.
    pub async fn read(&self, current: &Endpoint, opts: &CallOptions) -> Result<ReadOutcome, Error> {
        let t0 = Instant::now();
        let res = async {
            let project = self.resource_project(current, opts)?;
            let name = current.id().ok_or_else(|| Error::Validation("endpoint has no identity; nothing to read".into()))?;
            let region = region_of(name).unwrap_or_else(|| current.region.clone());
            self.read_name(name, &project, &region, deadline_for(opts.timeouts.read, opts.deadline)).await
        }
        .await;
        record("read", t0, &res);
        match &res {
            Ok(ReadOutcome::Found(e)) => info!(name = %e.name, took_ms = %t0.elapsed().as_millis(), "api: read ok"),
            Ok(ReadOutcome::Gone) => info!(name = %current.name, took_ms = %t0.elapsed().as_millis(), "api: read gone"),
            Err(e) => warn!(name = %current.name, error = %e, "api: read failed"),
        }
        res
    }

    async fn read_name(&self, name: &str, project: &str, region: &str, deadline: Instant) -> Result<ReadOutcome, Error> {
        let t0 = Instant::now();
        let context = format!("reading {}", name);
        let base = self.config.base_path(region)?;
        let url = format!("{}{}", base, name);
        let v = match self.send(&context, Method::Get, self.config.billing(project), &url, None, t0, deadline).await {
            Ok(v) => v,
            Err(e) if e.is_not_found() => return Ok(ReadOutcome::Gone),
            Err(e) => return Err(e),
        };
        let mut e = decode_endpoint(&v).map_err(|source| Error::Codec { context, source })?;
        if e.name.is_empty() { e.name = name.to_string(); }
        e.project = project_of(&e.name).unwrap_or_else(|| project.to_string());
        e.region = region_of(&e.name).unwrap_or_else(|| region.to_string());
        Ok(ReadOutcome::Found(e))
    }

    /// Apply the mutable fields in `changed`, then read back. An empty mask sends nothing and
    /// returns `current` unchanged.
    pub async fn update(&self, current: &Endpoint, desired: &DesiredEndpoint, changed: FieldSet, opts: &CallOptions) -> Result<Endpoint, Error> {
        let t0 = Instant::now();
        let res = self.update_inner(current, desired, changed, opts, t0).await;
        record("update", t0, &res);
        match &res {
            Ok(e) => info!(name = %e.name, took_ms = %t0.elapsed().as_millis(), "api: update ok"),
            Err(e) => warn!(name = %current.name, error = %e, "api: update failed"),
        }
        res
    }

    async fn update_inner(&self, current: &Endpoint, desired: &DesiredEndpoint, changed: FieldSet, opts: &CallOptions, t0: Instant) -> Result<Endpoint, Error> {
        let project = self.resource_project(current, opts)?;
        let name = current.id().ok_or_else(|| Error::Validation("endpoint has no identity; create it first".into()))?;
        let context = format!("updating {}", name);
        let ignored = changed.filter(Field::is_immutable);
        if !ignored.is_empty() {
            warn!(name = %name, fields = %ignored, "api: immutable fields changed; not sent");
        }
        let (payload, mask) = build_update_payload(&desired.to_endpoint(), changed)
            .map_err(|source| Error::Codec { context: context.clone(), source })?;
        if mask.is_empty() {
            info!(name = %name, "api: update no-op");
            return Ok(current.clone());
        }

        let region = region_of(name).unwrap_or_else(|| current.region.clone());
        let base = self.config.base_path(&region)?;
        let billing = self.config.billing(&project);
        let deadline = deadline_for(opts.timeouts.update, opts.deadline);
        let mask = mask.join();
        info!(name = %name, mask = %mask, "api: update start");
        let url = add_query_params(&format!("{}{}", base, name), &[("updateMask", mask.as_str())])
            .map_err(|source| Error::Transport { context: context.clone(), source })?;
        let body = payload.to_json();
        let resp = self.send(&context, Method::Patch, billing, &url, Some(&body), t0, deadline).await?;
        let op = Operation::from_json(&resp).map_err(|e| Error::poll(&context, e))?;
        self.waiter(&base, &project)
            .wait(op, "Updating Endpoint", deadline, None)
            .await
            .map_err(|e| Error::poll(&context, e))?;

        let read_deadline = deadline_for(opts.timeouts.read, opts.deadline);
        match self.read_name(name, &project, &region, read_deadline).await? {
            ReadOutcome::Found(e) => Ok(e),
            ReadOutcome::Gone => Err(Error::Transport { context, source: TransportError::not_found("endpoint vanished during update") }),
        }
    }

    /// Delete the endpoint. Already gone counts as success and nothing is polled.
    pub async fn delete(&self, current: &Endpoint, opts: &CallOptions) -> Result<(), Error> {
        let t0 = Instant::now();
        let res = self.delete_inner(current, opts, t0).await;
        record("delete", t0, &res);
        match &res {
            Ok(()) => info!(name = %current.name, took_ms = %t0.elapsed().as_millis(), "api: delete ok"),
            Err(e) => warn!(name = %current.name, error = %e, "api: delete failed"),
        }
        res
    }

    async fn delete_inner(&self, current: &Endpoint, opts: &CallOptions, t0: Instant) -> Result<(), Error> {
        let project = self.resource_project(current, opts)?;
        let name = current.id().ok_or_else(|| Error::Validation("endpoint has no identity; nothing to delete".into()))?;
        let context = format!("deleting {}", name);
        let region = region_of(name).unwrap_or_else(|| current.region.clone());
        let base = self.config.base_path(&region)?;
        let billing = self.config.billing(&project);
        let deadline = deadline_for(opts.timeouts.delete, opts.deadline);
        info!(name = %name, "api: delete start");
        let url = format!("{}{}", base, name);
        let resp = match self.send(&context, Method::Delete, billing, &url, None, t0, deadline).await {
            Ok(v) => v,
            Err(e) if e.is_not_found() => {
                info!(name = %name, "api: delete target already gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let op = Operation::from_json(&resp).map_err(|e| Error::poll(&context, e))?;
        self.waiter(&base, &project)
            .wait(op, "Deleting Endpoint", deadline, None)
            .await
            .map_err(|e| Error::poll(&context, e))?;
        Ok(())
    }

    /// Plan against `prior` and execute the result.
    pub async fn apply(&self, desired: &DesiredEndpoint, prior: Option<&Endpoint>, opts: &CallOptions) -> Result<Applied, Error> {
        let plan = plan::plan(desired, prior)?;
        info!(action = plan.action(), name = %prior.map(|p| p.name.as_str()).unwrap_or("-"), "api: apply");
        let endpoint = match (&plan, prior) {
            (Plan::Update { changed }, Some(p)) => self.update(p, desired, *changed, opts).await?,
            (Plan::Noop, Some(p)) => p.clone(),
            _ => self.create(desired, prior, opts).await?,
        };
        Ok(Applied { plan, endpoint })
    }
}
