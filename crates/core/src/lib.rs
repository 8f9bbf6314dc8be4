//! `jobline-core`: queue primitives shared by every other crate.
//!
//! This crate contains **pure** building blocks (no broker or store IO):
//! identifiers, the wire envelope, the error taxonomy and the clock seam.

pub mod clock;
pub mod envelope;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use envelope::{DELAYED_SUFFIX, Envelope, JobData, delayed_topic, is_delayed_topic};
pub use error::{QueueError, QueueResult};
pub use id::{ConsumerIdentity, MessageId, TenantId};
