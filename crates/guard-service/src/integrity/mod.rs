pub mod cooldown;
pub mod pipeline;
pub mod registry;
pub mod verifier;
pub mod watcher;
