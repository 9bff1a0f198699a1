//! Core types shared by the grove daemon and CLI.
//!
//! Defines the error type, instance state tags, project registration and
//! overlay configuration, the dotenv-style environment loader, and the
//! data-root path layout.

pub mod config;
pub mod envfile;
pub mod error;
pub mod paths;
pub mod state;

pub use config::{AgentSection, ContainerSection, OverlayConfig, Project, OVERLAY_FILE, PROJECT_FILE};
pub use error::GroveError;
pub use state::InstanceState;
