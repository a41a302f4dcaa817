pub mod crisis;
pub mod health;
pub mod messages;
pub mod quota;
pub mod realtime;
pub mod sessions;
