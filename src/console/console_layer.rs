// Console layer - a line-oriented front end over the moderation service.
// Reads commands from stdin and prints the room and moderation feeds.

pub mod commands;
pub mod session;

pub use session::run;
