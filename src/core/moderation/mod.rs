// Core moderation module - the content-safety pipeline.
// Models, the pure decision engine, the classifier adapter, storage ports
// and the service that ties them together.

pub mod classifier;
pub mod decision;
pub mod moderation_models;
pub mod moderation_service;
pub mod moderation_store;

pub use classifier::*;
pub use moderation_models::*;
pub use moderation_service::*;
pub use moderation_store::*;
