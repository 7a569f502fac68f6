//! Machine setup catalog and script rendering
//!
//! The catalog maps a machine's role set and desired versions to the
//! startup, shutdown and upgrade scripts that provision it. The renderer
//! prefixes those scripts with an environment preamble describing the
//! machine and its cluster.

pub mod catalog;
pub mod config_watch;
pub mod error;
pub mod render;

pub use catalog::{MachineParams, MachineSetupConfigs, MachineSetupItem, Metadata};
pub use config_watch::{ConfigWatch, MachineSetupConfigGetter, DEFAULT_MACHINE_SETUP_CONFIG_PATH};
pub use error::SetupError;
pub use render::{RenderParams, RenderedScripts, ScriptRenderer};
