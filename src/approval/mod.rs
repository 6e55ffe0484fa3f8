//! Manual approval of device operations.
//!
//! The queue is the single shared structure every ingress path funnels
//! into, and `decide` is the only mutation point the presentation layer
//! gets.

mod queue;

pub use queue::{
    ApprovalQueue, Decision, PendingRequest, QueueConfig, QueueEvent, RequestKind, RequestOrigin,
    SubmittedRequest,
};
