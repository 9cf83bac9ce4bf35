//! File integrity monitoring with automatic restore from encrypted backups.
//!
//! [`engine::MonitorService`] is the entry point: enroll files, start the
//! background watch worker, and read status and events back out.

pub mod enforcement;
pub mod engine;
pub mod integrity;
pub mod sink;
pub mod status;

pub use engine::MonitorService;
pub use sink::{ChannelSink, IntegritySink, Notification, NoopSink};
pub use status::StatusReport;
