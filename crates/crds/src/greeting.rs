//! Greeting CRD
//!
//! Sample resource managed by the greeting controller: it records the message
//! it last acted on and holds a cleanup finalizer while it exists.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer held by the greeting controller on every Greeting.
pub const GREETING_FINALIZER: &str = "greetings.samples.kube-operator.dev/cleanup";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "samples.kube-operator.dev",
    version = "v1alpha1",
    kind = "Greeting",
    namespaced,
    status = "GreetingStatus",
    shortname = "greet",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Message", "type":"string", "jsonPath":".spec.message"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GreetingSpec {
    /// Message to greet with
    pub message: String,

    /// Number of times to repeat the greeting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct GreetingStatus {
    /// Reconciliation phase
    #[serde(default)]
    pub phase: GreetingPhase,

    /// Message the controller last acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_message: Option<String>,
}

/// Greeting lifecycle phase
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum GreetingPhase {
    /// Not reconciled yet
    #[default]
    Pending,

    /// Message observed and acted on
    Ready,
}
