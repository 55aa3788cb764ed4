//! Parallel group coordinator: concurrent fan-out with a full join.
//!
//! Every member runs as its own task in a `JoinSet`. The join never
//! fails fast: a failed member occupies only its own slot in the
//! `GroupResult` while its siblings run to completion.

use std::collections::BTreeMap;
use std::sync::Arc;

use loomflow_types::approval::{GroupResult, StepOutcome};
use loomflow_types::run::{ErrorCode, StepError};
use tokio::task::JoinSet;

use crate::repository::artifact::ArtifactStore;
use crate::repository::run::RunRepository;

use super::executor::{ExecutorError, StepCall, StepExecutor, StepResult};

impl<R, A> StepExecutor<R, A>
where
    R: RunRepository + 'static,
    A: ArtifactStore + 'static,
{
    /// Run the given members concurrently and collect one outcome per step.
    ///
    /// With `review`, completed members are reported as pending review items.
    /// Infrastructure errors are returned only after every task has settled.
    pub async fn run_group(
        self: &Arc<Self>,
        group_id: &str,
        calls: Vec<StepCall>,
        review: bool,
    ) -> Result<GroupResult, ExecutorError> {
        let mut tasks = JoinSet::new();
        for call in calls.iter().cloned() {
            let executor = Arc::clone(self);
            tasks.spawn(async move {
                let result = executor.run(&call).await;
                (call.step.name, result)
            });
        }

        let mut outcomes = BTreeMap::new();
        let mut infra_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(result))) => {
                    outcomes.insert(name, outcome_of(result, review));
                }
                Ok((name, Err(e))) => {
                    tracing::warn!(group = group_id, step = name.as_str(), error = %e, "group member errored");
                    infra_error.get_or_insert(e);
                }
                Err(e) => {
                    tracing::warn!(group = group_id, error = %e, "group member task did not finish");
                }
            }
        }

        if let Some(e) = infra_error {
            return Err(e);
        }

        for call in &calls {
            if outcomes.contains_key(&call.step.name) {
                continue;
            }
            let error = StepError::new(ErrorCode::NonRetryable, "step task aborted");
            let result = self.fail(call, error, None).await?;
            outcomes.insert(call.step.name.clone(), outcome_of(result, review));
        }

        let result = GroupResult {
            group_id: group_id.to_string(),
            outcomes,
        };
        tracing::info!(
            group = group_id,
            members = calls.len(),
            failed = result.failed_steps().len(),
            pending_review = result.pending_review().len(),
            "parallel group settled"
        );
        Ok(result)
    }
}

fn outcome_of(result: StepResult, review: bool) -> StepOutcome {
    match result {
        StepResult::Completed { artifact, .. } if review => StepOutcome::PendingReview {
            digest: artifact.digest,
            summary: artifact.summary,
        },
        StepResult::Completed {
            artifact, cache_hit, ..
        } => StepOutcome::Completed {
            digest: artifact.digest,
            cache_hit,
        },
        StepResult::Failed(error) => StepOutcome::Failed {
            code: error.code,
            message: error.message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestEngine, planned};
    use crate::workflow::work::WorkFailure;

    #[tokio::test]
    async fn partial_failure_does_not_cancel_siblings() {
        let engine = TestEngine::new();
        engine.work.push_failure("b", WorkFailure::non_retryable("rejected by provider"));
        let calls = vec![
            engine.call("a", planned("a")),
            engine.call("b", planned("b")),
            engine.call("c", planned("c")),
        ];

        let result = engine.executor.run_group("g", calls, false).await.unwrap();

        assert!(matches!(result.outcomes["a"], StepOutcome::Completed { .. }));
        assert!(matches!(
            result.outcomes["b"],
            StepOutcome::Failed { code: ErrorCode::NonRetryable, .. }
        ));
        assert!(matches!(result.outcomes["c"], StepOutcome::Completed { .. }));
        assert_eq!(result.failed_steps(), vec!["b"]);

        // Retrying only the failed slot leaves completed siblings alone.
        let retry = engine
            .executor
            .run_group("g", vec![engine.call("b", planned("b"))], false)
            .await
            .unwrap();
        assert!(matches!(retry.outcomes["b"], StepOutcome::Completed { .. }));
        assert_eq!(engine.work.calls("a"), 1);
        assert_eq!(engine.work.calls("b"), 2);
        assert_eq!(engine.work.calls("c"), 1);
    }

    #[tokio::test]
    async fn review_groups_report_pending_items() {
        let engine = TestEngine::new();
        let calls = vec![engine.call("a", planned("a")), engine.call("b", planned("b"))];

        let result = engine.executor.run_group("g", calls, true).await.unwrap();
        assert_eq!(result.pending_review(), vec!["a", "b"]);
        assert!(result.failed_steps().is_empty());
    }
}
