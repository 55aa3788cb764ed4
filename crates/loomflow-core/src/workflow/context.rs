//! Step input assembly from committed upstream outputs.

use std::collections::BTreeMap;

use loomflow_types::run::Run;

use crate::repository::artifact::ArtifactStore;

use super::idempotency::{IdempotencyStore, StoreError};
use super::work::StepInput;

/// Latest committed output of every step in segments before `segment`.
///
/// Skipped steps have no artifact and are absent from the map.
pub async fn upstream_outputs<A: ArtifactStore>(
    store: &IdempotencyStore<A>,
    run: &Run,
    segment: usize,
) -> Result<BTreeMap<String, serde_json::Value>, StoreError> {
    let mut upstream = BTreeMap::new();
    for step in run.plan.steps_before(segment) {
        if let Some(artifact) = store.get(run.id, &step).await? {
            let output = store.read_output(&artifact).await?;
            upstream.insert(step, output);
        }
    }
    Ok(upstream)
}

/// Build the input for a step in `segment`, carrying its pending feedback.
pub async fn step_input<A: ArtifactStore>(
    store: &IdempotencyStore<A>,
    run: &Run,
    segment: usize,
    feedback: &[String],
) -> Result<StepInput, StoreError> {
    Ok(StepInput {
        run_input: run.input.clone(),
        upstream: upstream_outputs(store, run, segment).await?,
        feedback: feedback.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryArtifactStore, TestHasher, sample_run};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn collects_latest_outputs_of_earlier_segments() {
        let store = IdempotencyStore::new(MemoryArtifactStore::default(), Arc::new(TestHasher));
        let run = sample_run();
        for (step, revision, value) in [("a", 0, json!("a0")), ("a", 1, json!("a1")), ("b", 0, json!("b0"))] {
            let stored = store.put_payload(&value).await.unwrap();
            store
                .commit(&run.tenant_id, run.id, step, revision, &stored.digest, stored.size_bytes, step)
                .await
                .unwrap();
        }

        // Segment 3 (step d) sees a, b and whatever c has committed.
        let input = step_input(&store, &run, 3, &["tighten".to_string()]).await.unwrap();
        assert_eq!(input.upstream["a"], json!("a1"));
        assert_eq!(input.upstream["b"], json!("b0"));
        assert!(!input.upstream.contains_key("c"));
        assert_eq!(input.feedback, vec!["tighten"]);
        assert_eq!(input.run_input, run.input);

        // The first segment has no upstream.
        let first = upstream_outputs(&store, &run, 0).await.unwrap();
        assert!(first.is_empty());
    }
}
