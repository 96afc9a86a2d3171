//! Bounded worker runtime for packet evaluation.
//!
//! Jobs go through one bounded channel to a fixed set of threads. A full queue
//! is rejected immediately; the transport owns backpressure and redelivery.
//! Nothing serializes jobs for the same detector.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::warn;

use crate::detector::DetectorId;
use crate::error::{ConfigError, DetectorError, DetectorResult, EvaluationError};
use crate::handler::GroupedEvaluationResult;
use crate::packet::DataPacket;
use crate::processor::DetectorProcessor;

const POOL_NAME: &str = "detector-runtime";

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Worker threads.
    pub workers: usize,
    /// Maximum queued packets.
    pub queue_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
        }
    }
}

impl RuntimeConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns `InvalidSetting` for zero workers or zero capacity.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidSetting {
                component: "runtime",
                reason: "workers must be at least 1".to_string(),
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidSetting {
                component: "runtime",
                reason: "queue_capacity must be at least 1".to_string(),
            });
        }
        Ok(self)
    }
}

enum Job {
    Evaluate {
        detector_id: DetectorId,
        packet: DataPacket,
        reply: Sender<DetectorResult<GroupedEvaluationResult>>,
    },

    #[cfg(test)]
    Sleep {
        duration: Duration,
        reply: Sender<()>,
    },
}

/// Handle to a submitted packet.
#[derive(Debug)]
pub struct EvaluationHandle {
    rx: Receiver<DetectorResult<GroupedEvaluationResult>>,
}

impl EvaluationHandle {
    /// Wait for the evaluation to finish.
    ///
    /// # Errors
    /// The evaluation's own error, or `Disconnected` if the worker died.
    pub fn join(self) -> DetectorResult<GroupedEvaluationResult> {
        self.rx.recv().map_err(|_| disconnected())?
    }

    /// Wait at most `timeout` for the evaluation to finish.
    ///
    /// # Errors
    /// As `join`, plus `Timeout`. The evaluation keeps running after a timeout.
    pub fn join_timeout(self, timeout: Duration) -> DetectorResult<GroupedEvaluationResult> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => DetectorError::Evaluation(EvaluationError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            RecvTimeoutError::Disconnected => disconnected(),
        })?
    }
}

fn disconnected() -> DetectorError {
    DetectorError::Evaluation(EvaluationError::Disconnected {
        path: POOL_NAME.to_string(),
    })
}

/// Thread pool evaluating packets through a shared `DetectorProcessor`.
pub struct DetectorRuntime {
    processor: Arc<DetectorProcessor>,
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl DetectorRuntime {
    /// Start the worker threads.
    ///
    /// # Errors
    /// Invalid configuration, or `Internal` if a thread cannot be spawned.
    pub fn start(processor: Arc<DetectorProcessor>, config: RuntimeConfig) -> DetectorResult<Self> {
        let config = config.validate()?;
        let (tx, rx) = bounded::<Job>(config.queue_capacity);

        let mut runtime = Self {
            processor,
            tx: Some(tx),
            workers: Vec::with_capacity(config.workers),
            queue_capacity: config.queue_capacity,
        };
        for idx in 0..config.workers {
            let rx: Receiver<Job> = rx.clone();
            let processor = Arc::clone(&runtime.processor);
            let handle = thread::Builder::new()
                .name(format!("{POOL_NAME}-{idx}"))
                .spawn(move || worker_loop(&rx, &processor))
                .map_err(|e| DetectorError::internal(format!("failed to spawn worker {idx}: {e}")))?;
            runtime.workers.push(handle);
        }
        Ok(runtime)
    }

    /// The processor shared by every worker.
    #[must_use]
    pub fn processor(&self) -> &DetectorProcessor {
        &self.processor
    }

    /// Queue a packet.
    ///
    /// # Errors
    /// `QueueFull` when the queue is at capacity; the caller should redeliver.
    pub fn submit(&self, detector_id: DetectorId, packet: DataPacket) -> DetectorResult<EvaluationHandle> {
        let (reply, rx) = bounded(1);
        self.try_send(Job::Evaluate {
            detector_id,
            packet,
            reply,
        })?;
        Ok(EvaluationHandle { rx })
    }

    /// Queue a packet and wait for its result.
    ///
    /// # Errors
    /// As `submit` and `EvaluationHandle::join`.
    pub fn evaluate(&self, detector_id: DetectorId, packet: DataPacket) -> DetectorResult<GroupedEvaluationResult> {
        self.submit(detector_id, packet)?.join()
    }

    fn try_send(&self, job: Job) -> DetectorResult<()> {
        let tx = self.tx.as_ref().ok_or_else(disconnected)?;
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DetectorError::Evaluation(EvaluationError::QueueFull {
                capacity: self.queue_capacity,
            })),
            Err(TrySendError::Disconnected(_)) => Err(disconnected()),
        }
    }

    #[cfg(test)]
    fn submit_sleep(&self, duration: Duration) -> DetectorResult<Receiver<()>> {
        let (reply, rx) = bounded(1);
        self.try_send(Job::Sleep { duration, reply })?;
        Ok(rx)
    }
}

fn worker_loop(rx: &Receiver<Job>, processor: &DetectorProcessor) {
    while let Ok(job) = rx.recv() {
        match job {
            Job::Evaluate {
                detector_id,
                packet,
                reply,
            } => {
                let result = processor.process_data_packet(detector_id, &packet);
                if let Err(e) = &result {
                    warn!(
                        detector_id = %detector_id,
                        sequence = packet.sequence,
                        retryable = e.is_retryable(),
                        error = %e,
                        "packet evaluation failed"
                    );
                }
                let _ = reply.send(result);
            }

            #[cfg(test)]
            Job::Sleep { duration, reply } => {
                thread::sleep(duration);
                let _ = reply.send(());
            }
        }
    }
}

impl Drop for DetectorRuntime {
    fn drop(&mut self) {
        // Closing the channel lets workers drain queued jobs and exit.
        drop(self.tx.take());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for DetectorRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorRuntime")
            .field("workers", &self.workers.len())
            .field("queue_capacity", &self.queue_capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::condition::{ConditionType, DataCondition, DataConditionGroup};
    use crate::detector::{Detector, ProjectId};
    use crate::handler::{DetectorKindRegistry, HandlerContext};
    use crate::occurrence::CollectingEmitter;
    use crate::processor::InMemoryDetectorCatalog;
    use crate::storage::InMemoryStores;

    fn runtime(config: RuntimeConfig) -> (DetectorRuntime, Arc<CollectingEmitter>) {
        let catalog = InMemoryDetectorCatalog::new();
        let group = DataConditionGroup::any(vec![DataCondition::new(
            1,
            ConditionType::Gte,
            json!(100),
            json!("high"),
        )]);
        catalog
            .upsert(
                Detector::new(DetectorId(7), ProjectId(1), "errors", "grouped_values")
                    .with_condition_group(group),
            )
            .unwrap();
        let stores = InMemoryStores::default();
        let emitter = Arc::new(CollectingEmitter::new());
        let processor = DetectorProcessor::new(
            Arc::new(catalog),
            Arc::new(DetectorKindRegistry::with_builtin_kinds()),
            HandlerContext::new(Arc::new(stores.counters), Arc::new(stores.states)),
            emitter.clone(),
        );
        (
            DetectorRuntime::start(Arc::new(processor), config).unwrap(),
            emitter,
        )
    }

    #[test]
    fn evaluates_on_worker_threads() {
        let (runtime, emitter) = runtime(RuntimeConfig::default());
        let out = runtime
            .evaluate(
                DetectorId(7),
                DataPacket::new("q", 1, json!({"groups": {"a": 150, "b": 3}})),
            )
            .unwrap();
        assert_eq!(out.len(), 1);
        assert!(out.get(&Some("a".to_string())).is_some());
        assert_eq!(emitter.occurrences().len(), 1);
    }

    #[test]
    fn full_queue_is_rejected_as_retryable() {
        let (runtime, _) = runtime(RuntimeConfig {
            workers: 1,
            queue_capacity: 1,
        });
        let busy = runtime.submit_sleep(Duration::from_millis(200)).unwrap();
        // Wait until the worker picked up the sleep so the queue is empty.
        thread::sleep(Duration::from_millis(50));
        let _queued = runtime.submit_sleep(Duration::from_millis(1)).unwrap();

        let err = runtime
            .submit(DetectorId(7), DataPacket::new("q", 1, json!({"groups": {}})))
            .unwrap_err();
        assert!(matches!(
            err,
            DetectorError::Evaluation(EvaluationError::QueueFull { capacity: 1 })
        ));
        assert!(err.is_retryable());
        busy.recv().unwrap();
    }

    #[test]
    fn join_timeout_reports_timeout() {
        let (runtime, _) = runtime(RuntimeConfig {
            workers: 1,
            queue_capacity: 4,
        });
        let _busy = runtime.submit_sleep(Duration::from_millis(200)).unwrap();
        let handle = runtime
            .submit(DetectorId(7), DataPacket::new("q", 1, json!({"groups": {"a": 1}})))
            .unwrap();
        let err = handle.join_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(
            err,
            DetectorError::Evaluation(EvaluationError::Timeout { .. })
        ));
    }

    #[test]
    fn invalid_config_is_rejected() {
        assert!(RuntimeConfig {
            workers: 0,
            queue_capacity: 1
        }
        .validate()
        .is_err());
        assert!(RuntimeConfig {
            workers: 1,
            queue_capacity: 0
        }
        .validate()
        .is_err());
    }
}
