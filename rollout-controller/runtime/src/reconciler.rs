use crate::{bus, core, k8s};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use tokio::time;
use tracing::{error, info, warn};

const RESUBSCRIBE_BACKOFF: time::Duration = time::Duration::from_secs(5);

/// Consumes the event channel until `drain` fires, restarting matched
/// workloads one reconciliation pass per message.
///
/// A dropped broker connection is retried indefinitely with a fixed backoff;
/// the bus is at-most-once, so events published during the gap are lost.
pub async fn run(
    subscriber: bus::Subscriber,
    restarter: k8s::Restarter,
    allowed_prefix: String,
    drain: drain::Watch,
) -> anyhow::Result<()> {
    let mut message_count: u64 = 0;

    loop {
        let restarter = &restarter;
        let allowed_prefix = allowed_prefix.as_str();
        let count = &mut message_count;
        let result = subscriber
            .subscribe(drain.clone(), move |payload| {
                *count += 1;
                let received = *count;
                async move {
                    info!(message_count = received, "received message");
                    handle_message(restarter, allowed_prefix, &payload).await;
                }
            })
            .await;

        match result {
            Ok(bus::SubscribeEnd::Shutdown) => return Ok(()),
            Ok(bus::SubscribeEnd::Disconnected) => {
                warn!(
                    backoff_secs = RESUBSCRIBE_BACKOFF.as_secs(),
                    "broker subscription lost; retrying",
                );
            }
            Err(error) => {
                error!(
                    %error,
                    backoff_secs = RESUBSCRIBE_BACKOFF.as_secs(),
                    "broker subscription failed; retrying",
                );
            }
        }

        let backoff = drain.clone();
        tokio::select! {
            _ = backoff.signaled() => return Ok(()),
            _ = time::sleep(RESUBSCRIBE_BACKOFF) => {}
        }
    }
}

/// One reconciliation pass: revalidate the envelope, expand it into image
/// references, and restart each matched workload exactly once.
async fn handle_message(restarter: &k8s::Restarter, allowed_prefix: &str, payload: &[u8]) {
    let event = match core::Event::parse_and_validate(payload, allowed_prefix) {
        Ok(event) => event,
        Err(error) => {
            error!(%error, "invalid message payload, skipping");
            return;
        }
    };

    let image_refs = event.image_refs();
    info!(
        image = %event.image,
        tags = ?event.tags,
        image_refs = image_refs.len(),
        "processing event",
    );

    let matches = aggregate_matches(restarter, &image_refs).await;
    if matches.is_empty() {
        info!(image = %event.image, "no matching workloads found");
        return;
    }

    for ((namespace, name), containers) in matches {
        let mut containers: Vec<String> = containers.into_iter().collect();
        containers.sort();
        info!(%namespace, %name, ?containers, "restarting workload");
        if let Err(error) = restarter.restart(&namespace, &name).await {
            error!(%namespace, %name, %error, "failed to restart workload");
        }
    }
}

/// Unions matches across every image reference, keyed by workload, so a
/// workload matched through several tags is restarted once.
///
/// A failed list for one reference is logged and the remaining references are
/// still processed.
async fn aggregate_matches(
    restarter: &k8s::Restarter,
    image_refs: &[String],
) -> HashMap<(String, String), HashSet<String>> {
    let mut matches: HashMap<(String, String), HashSet<String>> = HashMap::new();
    for image_ref in image_refs {
        let found = match restarter.find_matches(image_ref).await {
            Ok(found) => found,
            Err(error) => {
                error!(%image_ref, %error, "failed to list matching workloads");
                continue;
            }
        };
        for workload in found {
            matches
                .entry((workload.namespace, workload.name))
                .or_default()
                .extend(workload.containers);
        }
    }
    matches
}
