//! Message processing pipeline.
//!
//! Stored inbound messages flow through:
//! 1. `intake`: pending messages become queued jobs
//! 2. `WorkflowOrchestrator`: the job handler; categorize, validate, match, draft, send
//! 3. Review exits: low confidence, ambiguity, and high value go to a human
//!
//! External services sit behind the traits in `collaborators`.

pub mod collaborators;
pub mod http;
pub mod intake;
pub mod mail;
pub mod orchestrator;
pub mod state;
pub mod templates;
pub mod types;

pub use collaborators::{
    Categorizer, Collaborators, ItineraryMatcher, MailTransport, ResponseDrafter,
    UnconfiguredMail, VisionExtractor,
};
pub use http::HttpCollaborators;
pub use intake::{intake_pending, recover_stranded, spawn_intake_loop};
pub use mail::SmtpMailer;
pub use orchestrator::WorkflowOrchestrator;
pub use state::{WorkflowOutcome, WorkflowRun, WorkflowStage};
