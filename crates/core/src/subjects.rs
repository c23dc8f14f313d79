//! NATS names for the analysis pipeline.
//!
//! The work-queue and fan-out subjects are configurable
//! (`ANALYSIS_QUEUE_NAME`, `ANALYSIS_UPDATES_EXCHANGE`); everything else is
//! fixed here to prevent duplication across binaries.

/// JetStream stream backing the durable work queue
pub const ANALYSIS_STREAM: &str = "ANALYSIS_TASKS";

/// Durable consumer group for analysis workers
pub const ANALYSIS_CONSUMER: &str = "analysis-workers";

/// Dead-letter subject for jobs that exhausted their deliveries
pub const ANALYSIS_DLQ: &str = "dlq.analysis-tasks";

/// Default work-queue subject (overridable via `ANALYSIS_QUEUE_NAME`)
pub const DEFAULT_QUEUE_SUBJECT: &str = "analysis_tasks";

/// Default progress fan-out subject (overridable via `ANALYSIS_UPDATES_EXCHANGE`)
pub const DEFAULT_UPDATES_SUBJECT: &str = "analysis_updates";
