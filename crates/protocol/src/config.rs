//! Bridge configuration consumed by both sides of the boundary.

use serde::{Deserialize, Serialize};

/// Recognized configuration surface of the bridge.
///
/// Unknown keys in a config file are rejected so that a typo never
/// silently falls back to a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeSettings {
    /// Initial capacity of each command buffer, in bytes.
    pub commands_buffer_size: usize,
    /// Whether a full command buffer may grow. When false, overflowing
    /// writes are dropped (documented data-loss policy, never a stall).
    pub allow_commands_buffer_resize: bool,
    /// Back command buffers with memory shared by both sides instead of
    /// transferring ownership each tick.
    pub use_shared_memory: bool,
    /// Run the backend on a dedicated worker thread instead of in the
    /// caller's context.
    pub use_worker_context: bool,
    /// Fixed simulation timestep, in seconds.
    pub fixed_step: f32,
    /// Constraint-solver sub-steps per fixed step.
    pub sub_steps: u32,
    /// Interpolate poses between the last two fixed steps.
    pub use_motion_states: bool,
    /// Upper bound on catch-up steps after a stall; excess accumulated
    /// time is discarded.
    pub max_skipped_steps: u32,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            commands_buffer_size: 16 * 1024,
            allow_commands_buffer_resize: true,
            use_shared_memory: false,
            use_worker_context: false,
            fixed_step: 1.0 / 60.0,
            sub_steps: 1,
            use_motion_states: true,
            max_skipped_steps: 5,
        }
    }
}

/// Errors raised while loading settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to parse bridge settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid bridge settings: {0}")]
    Invalid(&'static str),
}

impl BridgeSettings {
    /// Parses settings from TOML text, validating ranges.
    ///
    /// # Errors
    /// Returns [`SettingsError::Parse`] for malformed TOML or unknown keys
    /// and [`SettingsError::Invalid`] for out-of-range values.
    pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
        let settings: Self = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.fixed_step <= 0.0 || !self.fixed_step.is_finite() {
            return Err(SettingsError::Invalid("fixed_step must be positive"));
        }
        if self.sub_steps == 0 {
            return Err(SettingsError::Invalid("sub_steps must be at least 1"));
        }
        if self.commands_buffer_size == 0 {
            return Err(SettingsError::Invalid(
                "commands_buffer_size must be nonzero",
            ));
        }
        Ok(())
    }
}
