//! WaBridge Campaign Execution Engine
//!
//! Orchestrates the campaign lifecycle over the platform handle: preflight
//! validation, the distributed execution lock, the job queue and worker
//! pool, the template send pipeline, and the scheduler tick. All
//! dependencies are injected at boot; no subsystem reaches for globals.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub mod error;
pub mod preflight;
pub mod scheduler;
pub mod sender;
pub mod service;
pub mod variables;
pub mod worker;

pub use error::{EngineError, Result};
pub use preflight::{PreflightReport, PreflightValidator};
pub use scheduler::CampaignScheduler;
pub use sender::{SendOutcome, SendRequest, TemplateRef, TemplateSender};
pub use service::{CampaignProgress, CampaignService, CampaignSpec, CheckOutcome};
pub use worker::{JobHandler, WorkerPool};

use wab_limits::{BackoffTracker, FailurePolicy, KillSwitch, RateLimiter};
use wab_lock::ExecutionLock;
use wab_provider::{
    CloudApiClient, MediaLink, PhoneCredentials, PhoneNumberInfo, SendResponse,
    TemplateMessageRequest, TextMessageRequest,
};
use wab_queue::JobQueue;
use wab_store::Store;

/// The messaging-provider seam. Production wires the Cloud API client;
/// tests substitute a scripted double.
#[async_trait]
pub trait MessagingProvider: Send + Sync {
    async fn send_template(
        &self,
        creds: &PhoneCredentials,
        request: &TemplateMessageRequest,
    ) -> wab_provider::Result<SendResponse>;

    async fn send_text(
        &self,
        creds: &PhoneCredentials,
        request: &TextMessageRequest,
    ) -> wab_provider::Result<SendResponse>;

    async fn send_media(
        &self,
        creds: &PhoneCredentials,
        to: &str,
        kind: &str,
        media: MediaLink,
    ) -> wab_provider::Result<SendResponse>;

    async fn fetch_phone_number(
        &self,
        creds: &PhoneCredentials,
    ) -> wab_provider::Result<PhoneNumberInfo>;
}

#[async_trait]
impl MessagingProvider for CloudApiClient {
    async fn send_template(
        &self,
        creds: &PhoneCredentials,
        request: &TemplateMessageRequest,
    ) -> wab_provider::Result<SendResponse> {
        CloudApiClient::send_template(self, creds, request).await
    }

    async fn send_text(
        &self,
        creds: &PhoneCredentials,
        request: &TextMessageRequest,
    ) -> wab_provider::Result<SendResponse> {
        CloudApiClient::send_text(self, creds, request).await
    }

    async fn send_media(
        &self,
        creds: &PhoneCredentials,
        to: &str,
        kind: &str,
        media: MediaLink,
    ) -> wab_provider::Result<SendResponse> {
        CloudApiClient::send_media(self, creds, to, kind, media).await
    }

    async fn fetch_phone_number(
        &self,
        creds: &PhoneCredentials,
    ) -> wab_provider::Result<PhoneNumberInfo> {
        CloudApiClient::get_phone_number(self, creds).await
    }
}

/// Engine tunables; defaults match production behavior.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker identity presented to the execution lock.
    pub owner_id: String,
    pub lock_ttl: Duration,
    pub batch_size: u32,
    /// Pause between consecutive sends inside a batch.
    pub inter_message_pause: Duration,
    /// Stagger between batch job start times.
    pub batch_stagger: Duration,
    /// PROCESSING older than this is considered abandoned.
    pub stale_processing_after: Duration,
    pub max_recipients: u64,
    /// Hard cap on the bulk-send surface.
    pub bulk_send_cap: usize,
    pub failure_policy: FailurePolicy,
    pub worker_concurrency: usize,
    /// Outer guardrail across all jobs, per second.
    pub global_jobs_per_second: u32,
    /// Assumed sustained send rate used for duration estimates.
    pub estimated_sends_per_second: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            owner_id: format!("worker-{}", uuid::Uuid::new_v4()),
            lock_ttl: wab_lock::DEFAULT_LOCK_TTL,
            batch_size: wab_store::DEFAULT_BATCH_SIZE,
            inter_message_pause: Duration::from_millis(50),
            batch_stagger: Duration::from_secs(2),
            stale_processing_after: Duration::from_secs(10 * 60),
            max_recipients: 1_000_000,
            bulk_send_cap: 1_000,
            failure_policy: FailurePolicy::default(),
            worker_concurrency: 5,
            global_jobs_per_second: 10,
            estimated_sends_per_second: 10.0,
        }
    }
}

/// Dependency bundle constructed once at boot and passed explicitly into
/// every subsystem.
#[derive(Clone)]
pub struct Platform {
    pub store: Store,
    pub lock: Arc<dyn ExecutionLock>,
    pub limiter: Arc<dyn RateLimiter>,
    pub backoff: Arc<dyn BackoffTracker>,
    pub kill_switch: Arc<dyn KillSwitch>,
    pub provider: Arc<dyn MessagingProvider>,
    pub queue: Arc<dyn JobQueue>,
    pub config: Arc<EngineConfig>,
}
