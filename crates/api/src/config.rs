//! Provider configuration and per-call options.

use std::time::Duration;

use tokio::time::Instant;
use vtx_ops::PollPolicy;

use crate::Error;

/// Process-wide defaults. Borrowed by the reconciler, never mutated by it.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub project: Option<String>,
    pub region: Option<String>,
    /// Project requests are billed to, when it differs from the resource project.
    pub billing_project: Option<String>,
    /// Overrides `https://{region}-aiplatform.googleapis.com/v1/`.
    pub base_path: Option<String>,
    pub poll: PollPolicy,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl ProviderConfig {
    pub fn from_env() -> Self {
        Self {
            project: env_opt("VTX_PROJECT"),
            region: env_opt("VTX_REGION"),
            billing_project: env_opt("VTX_BILLING_PROJECT"),
            base_path: env_opt("VTX_BASE_PATH"),
            poll: PollPolicy::from_env(),
        }
    }

    /// Per-call override first, then the process default.
    pub fn resolve_project(&self, over: Option<&str>) -> Result<String, Error> {
        over.filter(|s| !s.is_empty())
            .or(self.project.as_deref())
            .map(str::to_string)
            .ok_or_else(|| Error::Config("project is not set; pass --project or set VTX_PROJECT".into()))
    }

    pub fn resolve_region(&self, over: Option<&str>) -> Result<String, Error> {
        over.filter(|s| !s.is_empty())
            .or(self.region.as_deref())
            .map(str::to_string)
            .ok_or_else(|| Error::Config("region is not set; pass --region or set VTX_REGION".into()))
    }

    /// API root for `region`, always ending in `/`.
    pub fn base_path(&self, region: &str) -> Result<String, Error> {
        let mut base = match &self.base_path {
            Some(b) => b.clone(),
            None if region.is_empty() => {
                return Err(Error::Config("cannot derive API base path without a region".into()));
            }
            None => format!("https://{}-aiplatform.googleapis.com/v1/", region),
        };
        if !base.ends_with('/') { base.push('/'); }
        Ok(base)
    }

    /// Project the request is billed to.
    pub fn billing<'a>(&'a self, project: &'a str) -> &'a str {
        self.billing_project.as_deref().unwrap_or(project)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub create: Duration,
    pub read: Duration,
    pub update: Duration,
    pub delete: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            create: Duration::from_secs(6 * 60),
            read: Duration::from_secs(60),
            update: Duration::from_secs(6 * 60),
            delete: Duration::from_secs(10 * 60),
        }
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub project: Option<String>,
    pub region: Option<String>,
    /// Overall deadline; nothing is sent after it.
    pub deadline: Option<Instant>,
    pub timeouts: Timeouts,
}
