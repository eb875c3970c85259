pub mod config;
pub mod logging;
pub mod messages;
pub mod workspace;

pub use config::{PathCorrection, Settings};
pub use messages::Messages;
pub use workspace::RunWorkspace;
