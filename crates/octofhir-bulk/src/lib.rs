//! Asynchronous FHIR bulk data export engine.
//!
//! A kickoff is validated and recorded as an [`ExportJob`], then queued for
//! the [`WorkerPool`]. Workers compile the request into per-type
//! [`SelectionPlan`]s, narrow them to the export's patients, and write the
//! matching records as NDJSON under `<export_path>/<job_id>/`. Status polls
//! are throttled per job by the [`PollRateLimiter`] and answered with the
//! manifest once the job completes.

pub mod codeset;
pub mod error;
pub mod filter;
pub mod job;
pub mod kickoff;
pub mod manifest;
pub mod materializer;
pub mod membership;
pub mod queue;
pub mod rate_limit;
pub mod service;
pub mod status_store;
pub mod worker;
pub mod writer;

pub use codeset::{CodeSetError, CodeSetResolver, ResolvedCode};
pub use error::ExportError;
pub use filter::{ElementsSpec, FilterCompiler, FilterError, SelectionPlan, TypeFilters};
pub use job::{ExportJob, ExportLevel, ExportRequest, ExportStatus, JobIssue, OutputOrganization};
pub use kickoff::{KickoffError, KickoffMethod};
pub use manifest::{ExportManifest, ManifestEntry};
pub use materializer::{FailurePolicy, MaterializeError, ResourceMaterializer};
pub use membership::{MembershipError, MembershipResolver};
pub use queue::{ExportJobMessage, InMemoryJobQueue, JobQueue, QueueError};
pub use rate_limit::{PollDecision, PollRateLimiter};
pub use service::{BulkExportService, KickoffRequest, ServiceSettings, StatusReport};
pub use status_store::{ExportStatusStore, InMemoryStatusStore, StatusStoreError};
pub use worker::{ExportWorker, WorkerPool};
pub use writer::{NdjsonWriter, NdjsonWriterError};
