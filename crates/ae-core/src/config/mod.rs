//! Engine configuration
//!
//! [`AudioSettings`] is plain serde data persisted as YAML. It can be
//! replaced at runtime through [`crate::AudioEngine::apply_settings`].

mod io;
mod paths;
mod settings;

pub use io::{load_config, read_config, save_config};
pub use paths::{config_dir, default_config_path};
pub use settings::{AudioSettings, BufferingSettings, ConfigMode, PassthroughSettings, SoundMode};
