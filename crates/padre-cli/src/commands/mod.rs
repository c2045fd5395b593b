//! CLI command implementations

mod config;
mod ps;
mod recent;
mod session;

pub use config::{config_init, config_path, config_show, load_client_config};
pub use ps::{kill_command, ps_command};
pub use recent::{recall_session, recent_command, remember_session};
pub use session::{load_command, resume_command, LoadOptions};
