#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Process wiring for the two halves of the rollout controller: the
//! internet-facing ingress endpoint and the cluster-mutating reconciler.

pub use rollout_controller_bus as bus;
pub use rollout_controller_core as core;
pub use rollout_controller_k8s as k8s;
pub use rollout_controller_oidc as oidc;

mod args;
mod ingress;
mod reconciler;

pub use self::args::Args;
