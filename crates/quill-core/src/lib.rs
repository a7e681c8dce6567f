pub mod actions;
pub mod config;
pub mod errors;
pub mod ids;
pub mod messages;
pub mod session;
pub mod validate;

pub use errors::{Classify, CoreError, ErrorKind};
pub use ids::{ActionId, SessionId};
