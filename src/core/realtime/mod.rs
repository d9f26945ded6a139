// Realtime fan-out: topics, the subscription manager and the broadcaster.

pub mod broadcaster;
pub mod realtime_models;
pub mod subscriptions;

pub use broadcaster::*;
pub use realtime_models::*;
pub use subscriptions::*;
