//! The delivery pipeline.
//!
//! A pulled message flows through five channel-driven stages:
//!
//! ```text
//! submit → guardian → limiter → preparer ↔ seeker → connector → mailer
//! ```
//!
//! Each stage is a pool of workers on a shared MPMC channel. A stage either
//! forwards the event to the next stage or short-circuits by resolving the
//! event's single-shot result channel with one of the four terminal
//! dispositions. Two periodic workers run beside the stages: the limiter's
//! window cleaner and the connection sweep.

#![deny(clippy::pedantic, clippy::all)]
#![allow(
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions
)]

mod connector;
mod dkim;
mod error;
mod event;
mod guardian;
mod limiter;
mod mailer;
mod pipeline;
mod pool;
mod seeker;

pub use error::{classify_reply, DeliveryError};
pub use event::{Disposition, SendEvent, SendOutcome};
pub use pipeline::{Pipeline, PipelineError};
pub use pool::{ClientPool, ClientState, PooledClient};
pub use seeker::{MailServer, MxHost, RouteState, Seeker};
