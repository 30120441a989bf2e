#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Rolling restarts of Deployments that reference a matched image.

use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    Client, ResourceExt,
};

/// The annotation `kubectl rollout restart` uses to trigger a rollout.
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// A Deployment whose pod template references a matched image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchingWorkload {
    pub namespace: String,
    pub name: String,
    /// Names of the containers whose image matched.
    pub containers: Vec<String>,
}

/// Finds and restarts Deployments by exact image reference.
///
/// The cluster client is injected so tests can substitute a mock transport.
pub struct Restarter {
    client: Client,
}

impl Restarter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Lists Deployments across every namespace the credentials grant and
    /// returns those with at least one container whose image equals
    /// `image_ref` exactly.
    pub async fn find_matches(
        &self,
        image_ref: &str,
    ) -> Result<Vec<MatchingWorkload>, kube::Error> {
        let api = Api::<Deployment>::all(self.client.clone());
        let deployments = api.list(&ListParams::default()).await?;

        let mut matches = Vec::new();
        for deployment in deployments.items {
            let containers = matching_containers(&deployment, image_ref);
            if containers.is_empty() {
                continue;
            }
            matches.push(MatchingWorkload {
                namespace: deployment.namespace().unwrap_or_default(),
                name: deployment.name_any(),
                containers,
            });
        }
        Ok(matches)
    }

    /// Triggers a rolling restart by patching the restartedAt annotation on
    /// the pod template. No other field is touched, so repeating the patch
    /// with a later timestamp simply re-triggers the rollout.
    pub async fn restart(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let patch = serde_json::json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": {
                            (RESTARTED_AT_ANNOTATION):
                                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                        }
                    }
                }
            }
        });

        let api = Api::<Deployment>::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::default(), &Patch::Strategic(patch))
            .await?;
        tracing::info!(%namespace, %name, "triggered rollout restart");
        Ok(())
    }
}

/// Names of the containers in the Deployment's pod template whose image
/// equals `image_ref`.
///
/// Comparison is byte-exact: registry paths are case-sensitive, so no
/// normalization is applied.
pub fn matching_containers(deployment: &Deployment, image_ref: &str) -> Vec<String> {
    deployment
        .spec
        .iter()
        .flat_map(|spec| spec.template.spec.iter())
        .flat_map(|pod| pod.containers.iter())
        .filter(|container| container.image.as_deref() == Some(image_ref))
        .map(|container| container.name.clone())
        .collect()
}
