//! Harrier gateway CRDs.
//!
//! These are the resources the harness creates and inspects; the control
//! plane that reconciles them is external to this repository.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use gateway_api::apis::standard::httproutes::HTTPRoute;

/// Attaches gateway-specific behavior (retries, header manipulation, fault
/// injection) to an HTTPRoute.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "gateway.harrier.dev",
    version = "v1alpha1",
    kind = "RoutePolicy",
    status = "RoutePolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct RoutePolicySpec {
    pub target_ref: LocalTargetRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault_abort: Option<FaultAbort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<RouteRetries>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<BTreeMap<String, String>>,
}

/// References a namespace-local object, typically an HTTPRoute.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalTargetRef {
    pub group: String,
    pub kind: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FaultAbort {
    pub http_status: u16,
    pub percentage: f64,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteRetries {
    pub num_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_try_timeout: Option<String>,
}

/// Status written by whichever controllers report on this policy, keyed by
/// reporter name. The gateway control plane reports as
/// `gateway-control-plane`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoutePolicyStatus {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub statuses: BTreeMap<String, ReportedStatus>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReportedStatus {
    pub state: PolicyState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum PolicyState {
    Pending,
    Accepted,
    Warning,
    Rejected,
}

impl std::fmt::Display for PolicyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => "Pending".fmt(f),
            Self::Accepted => "Accepted".fmt(f),
            Self::Warning => "Warning".fmt(f),
            Self::Rejected => "Rejected".fmt(f),
        }
    }
}

impl std::str::FromStr for PolicyState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Accepted" => Ok(Self::Accepted),
            "Warning" => Ok(Self::Warning),
            "Rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown policy state: {other}")),
        }
    }
}
