//! Completion tracking.
//!
//! [`CompletionTracker::track`] drives a [`JobHandle`] from `Queued` to
//! a terminal state using observations from a [`StatusSource`]. Time
//! comes from an injected [`Clock`], so the whole loop is deterministic
//! under [`crate::clock::ManualClock`].
//!
//! The loop suspends only while observing or sleeping between polls.
//! Transient observation errors are logged and retried; only the
//! deadline bounds the wait. Reaching the deadline marks the job
//! `TimedOut` but does not touch the engine-side job.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::backoff::{next_delay, PollPolicy};
use crate::clock::Clock;
use crate::error::GenerationError;
use crate::job::{JobHandle, JobStatus};
use crate::status::{Observation, StatusSource};

pub struct CompletionTracker {
    clock: Arc<dyn Clock>,
    policy: PollPolicy,
    timeout: Duration,
}

impl CompletionTracker {
    pub fn new(clock: Arc<dyn Clock>, policy: PollPolicy, timeout: Duration) -> Self {
        Self {
            clock,
            policy,
            timeout,
        }
    }

    /// Track `handle` until it is terminal, `cancel` fires, or the
    /// deadline passes.
    ///
    /// Returns `Ok(())` only for `Completed`. Dropping the returned
    /// future also stops tracking.
    pub async fn track<S: StatusSource + ?Sized>(
        &self,
        handle: &mut JobHandle,
        source: &mut S,
        cancel: &CancellationToken,
    ) -> Result<(), GenerationError> {
        let job_id = handle.job_id().clone();
        let started = self.clock.now();
        let deadline = started + self.timeout;
        let mut delay = self.policy.initial_interval;
        let mut observations = 0u32;

        while !handle.status().is_terminal() {
            let now = self.clock.now();
            if now >= deadline {
                handle.transition(JobStatus::TimedOut, now);
                break;
            }
            let remaining = deadline - now;

            let observed = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(job_id = %job_id, "Tracking abandoned; the engine job is left running");
                    return Err(GenerationError::Cancelled { job_id });
                }
                result = source.observe(&job_id) => Some(result),
                _ = self.clock.sleep(remaining) => None,
            };

            let errored = match observed {
                // Deadline reached while waiting on the source.
                None => continue,
                Some(Ok(observation)) => {
                    observations += 1;
                    tracing::debug!(job_id = %job_id, ?observation, observations, "Job observed");
                    self.apply(handle, observation);
                    false
                }
                Some(Err(e)) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Status check failed, will retry");
                    true
                }
            };

            if handle.status().is_terminal() {
                break;
            }
            if source.is_push() && !errored {
                continue;
            }

            let remaining = deadline.saturating_sub(self.clock.now());
            let pause = delay.min(remaining);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(job_id = %job_id, "Tracking abandoned; the engine job is left running");
                    return Err(GenerationError::Cancelled { job_id });
                }
                _ = self.clock.sleep(pause) => {}
            }
            delay = next_delay(delay, &self.policy);
        }

        let waited = self.clock.now().saturating_sub(started);
        match handle.status() {
            JobStatus::Completed => {
                tracing::info!(job_id = %job_id, waited_ms = waited.as_millis() as u64, observations, "Job completed");
                Ok(())
            }
            JobStatus::Failed => {
                let failure = handle.failure().cloned().unwrap_or_else(|| {
                    crate::status::EngineFailure {
                        node_id: None,
                        message: "engine reported failure".to_string(),
                    }
                });
                tracing::error!(job_id = %job_id, error = %failure, "Job failed on the engine");
                Err(GenerationError::Failed { job_id, failure })
            }
            _ => {
                tracing::warn!(job_id = %job_id, waited_s = waited.as_secs(), "Job timed out");
                Err(GenerationError::TimedOut { job_id, waited })
            }
        }
    }

    fn apply(&self, handle: &mut JobHandle, observation: Observation) {
        let at = self.clock.now();
        match observation {
            // Queued is the state every handle starts in.
            Observation::Pending | Observation::Queued => {}
            Observation::Running => {
                handle.transition(JobStatus::Running, at);
            }
            Observation::Completed { outputs } => {
                if !outputs.is_empty() {
                    handle.record_outputs(outputs);
                }
                handle.transition(JobStatus::Completed, at);
            }
            Observation::Failed(failure) => {
                handle.record_failure(failure);
                handle.transition(JobStatus::Failed, at);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use imagegen_comfyui::api::ComfyUIApiError;

    use crate::clock::ManualClock;
    use crate::job::{JobId, Transition};
    use crate::status::EngineFailure;

    /// Replays a fixed script of observations; the last step repeats.
    struct ScriptedSource {
        script: VecDeque<Step>,
        calls: usize,
        push: bool,
    }

    #[derive(Clone)]
    enum Step {
        See(Observation),
        Error,
        /// Never resolves; stands in for a silent WebSocket.
        Hang,
    }

    impl ScriptedSource {
        fn new(steps: impl IntoIterator<Item = Step>) -> Self {
            Self {
                script: steps.into_iter().collect(),
                calls: 0,
                push: false,
            }
        }

        fn push(mut self) -> Self {
            self.push = true;
            self
        }
    }

    #[async_trait]
    impl StatusSource for ScriptedSource {
        async fn observe(&mut self, _job_id: &JobId) -> Result<Observation, ComfyUIApiError> {
            self.calls += 1;
            let step = if self.script.len() > 1 {
                self.script.pop_front()
            } else {
                self.script.front().cloned()
            };
            match step.unwrap_or(Step::Hang) {
                Step::See(o) => Ok(o),
                Step::Error => Err(ComfyUIApiError::Decode("scripted failure".into())),
                Step::Hang => std::future::pending().await,
            }
        }

        fn is_push(&self) -> bool {
            self.push
        }
    }

    fn completed() -> Observation {
        Observation::Completed { outputs: vec![] }
    }

    fn handle() -> JobHandle {
        JobHandle::new(JobId::new("job-1"), "client", chrono::Utc::now())
    }

    fn tracker(clock: &Arc<ManualClock>, timeout_secs: u64) -> CompletionTracker {
        CompletionTracker::new(
            clock.clone(),
            PollPolicy {
                initial_interval: Duration::from_secs(1),
                max_interval: Duration::from_secs(4),
                multiplier: 2.0,
            },
            Duration::from_secs(timeout_secs),
        )
    }

    #[tokio::test]
    async fn queued_running_completed() {
        let clock = Arc::new(ManualClock::new());
        let mut source = ScriptedSource::new([
            Step::See(Observation::Queued),
            Step::See(Observation::Running),
            Step::See(completed()),
        ]);
        let mut h = handle();

        tracker(&clock, 60)
            .track(&mut h, &mut source, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(h.status(), JobStatus::Completed);
        assert_eq!(source.calls, 3, "polling stops once completed");
        assert_eq!(
            h.transitions(),
            &[
                Transition {
                    from: JobStatus::Queued,
                    to: JobStatus::Running,
                    at: Duration::from_secs(1)
                },
                Transition {
                    from: JobStatus::Running,
                    to: JobStatus::Completed,
                    at: Duration::from_secs(3)
                },
            ]
        );
        // Backoff 1s then 2s, no sleep after the terminal observation.
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[tokio::test]
    async fn queued_reports_keep_the_handle_queued() {
        let clock = Arc::new(ManualClock::new());
        let mut source = ScriptedSource::new([
            Step::See(Observation::Queued),
            Step::See(Observation::Queued),
            Step::See(completed()),
        ]);
        let mut h = handle();

        tracker(&clock, 60)
            .track(&mut h, &mut source, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            h.transitions(),
            &[Transition {
                from: JobStatus::Queued,
                to: JobStatus::Completed,
                at: Duration::from_secs(3)
            }]
        );
    }

    #[tokio::test]
    async fn only_queued_times_out() {
        let clock = Arc::new(ManualClock::new());
        let mut source = ScriptedSource::new([Step::See(Observation::Queued)]);
        let mut h = handle();

        let err = tracker(&clock, 10)
            .track(&mut h, &mut source, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_matches!(err, GenerationError::TimedOut { waited, .. } if waited == Duration::from_secs(10));
        assert_eq!(h.status(), JobStatus::TimedOut);
        assert_eq!(h.transitions().len(), 1);
        assert_eq!(h.transitions()[0].from, JobStatus::Queued);
        // 1 + 2 + 4 + 3 (clamped to the remaining time).
        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(3),
            ]
        );
    }

    #[tokio::test]
    async fn running_then_deadline_times_out_from_running() {
        let clock = Arc::new(ManualClock::new());
        let mut source = ScriptedSource::new([Step::See(Observation::Running)]);
        let mut h = handle();

        let result = tracker(&clock, 5)
            .track(&mut h, &mut source, &CancellationToken::new())
            .await;

        assert_matches!(result, Err(GenerationError::TimedOut { .. }));
        let last = h.transitions().last().copied().unwrap();
        assert_eq!((last.from, last.to), (JobStatus::Running, JobStatus::TimedOut));
    }

    #[tokio::test]
    async fn engine_error_fails_with_payload() {
        let clock = Arc::new(ManualClock::new());
        let failure = EngineFailure {
            node_id: Some("30".into()),
            message: "CUDA out of memory".into(),
        };
        let mut source = ScriptedSource::new([
            Step::See(Observation::Running),
            Step::See(Observation::Failed(failure.clone())),
        ]);
        let mut h = handle();

        let err = tracker(&clock, 60)
            .track(&mut h, &mut source, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_matches!(err, GenerationError::Failed { failure: ref f, .. } if *f == failure);
        assert_eq!(h.status(), JobStatus::Failed);
        assert_eq!(h.failure(), Some(&failure));
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let clock = Arc::new(ManualClock::new());
        let mut source = ScriptedSource::new([
            Step::Error,
            Step::Error,
            Step::See(completed()),
        ]);
        let mut h = handle();

        tracker(&clock, 60)
            .track(&mut h, &mut source, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(source.calls, 3);
        assert_eq!(h.status(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn push_source_is_not_slept_between_events() {
        let clock = Arc::new(ManualClock::new());
        let mut source = ScriptedSource::new([
            Step::See(Observation::Running),
            Step::See(Observation::Running),
            Step::See(completed()),
        ])
        .push();
        let mut h = handle();

        tracker(&clock, 60)
            .track(&mut h, &mut source, &CancellationToken::new())
            .await
            .unwrap();

        assert!(clock.sleeps().is_empty());
        assert_eq!(h.transitions().len(), 2);
    }

    #[tokio::test]
    async fn silent_push_source_hits_deadline() {
        let clock = Arc::new(ManualClock::new());
        let mut source = ScriptedSource::new([Step::Hang]).push();
        let mut h = handle();

        let result = tracker(&clock, 30)
            .track(&mut h, &mut source, &CancellationToken::new())
            .await;

        assert_matches!(result, Err(GenerationError::TimedOut { .. }));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(30)]);
    }

    #[tokio::test]
    async fn completed_outputs_are_kept_on_the_handle() {
        let clock = Arc::new(ManualClock::new());
        let image = imagegen_comfyui::history::ImageRef {
            filename: "out.png".into(),
            subfolder: String::new(),
            folder_type: "output".into(),
        };
        let mut source = ScriptedSource::new([Step::See(Observation::Completed {
            outputs: vec![image.clone()],
        })]);
        let mut h = handle();

        tracker(&clock, 60)
            .track(&mut h, &mut source, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(h.outputs(), &[image]);
        // Straight from Queued.
        assert_eq!(h.transitions()[0].from, JobStatus::Queued);
    }

    #[tokio::test]
    async fn cancellation_stops_tracking() {
        let clock = Arc::new(ManualClock::new());
        let mut source = ScriptedSource::new([Step::See(Observation::Queued)]);
        let mut h = handle();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = tracker(&clock, 60)
            .track(&mut h, &mut source, &cancel)
            .await
            .unwrap_err();

        assert_matches!(err, GenerationError::Cancelled { .. });
        assert_eq!(source.calls, 0);
        assert_eq!(h.status(), JobStatus::Queued);
    }
}
