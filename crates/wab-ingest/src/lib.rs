//! WaBridge Webhook Ingestion
//!
//! The intake endpoint, the BSP multi-tenant router and the status/inbound
//! ingester with its atomic campaign rollups.

pub mod api;
pub mod ingest;
pub mod router;

pub use api::{intake_router, IngestState, SIGNATURE_HEADER};
pub use ingest::WebhookIngester;
pub use router::TenantRouter;
