pub mod crisis;
pub mod error;
pub mod messages;
pub mod policy;
pub mod realtime;
pub mod sessions;
