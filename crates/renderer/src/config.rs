//! Renderer configuration.

use serde::{Deserialize, Serialize};
use vkframe_core::{Error, Result};
use vkframe_rhi::backend::PresentModePreference;

/// Growth policy of the binding pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct BindingPoolConfig {
    /// Factor applied to the allocated capacity when the pool grows.
    pub growth_factor: f32,
    /// Recreations attempted for one request before giving up.
    pub max_recreate_attempts: u32,
}

impl Default for BindingPoolConfig {
    fn default() -> Self {
        Self {
            growth_factor: 2.0,
            max_recreate_attempts: 8,
        }
    }
}

/// Frame pacing, presentation and pool settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RendererConfig {
    /// CPU frames allowed ahead of the GPU.
    pub frames_in_flight: usize,
    /// Acquire attempts per frame before an out-of-date chain is fatal.
    pub max_acquire_attempts: u32,
    /// Preferred present mode; FIFO is the fallback.
    pub present_mode: PresentModePreference,
    /// Requested swap image count, clamped by the surface.
    pub preferred_image_count: Option<u32>,
    /// Clear color of the default render pass.
    pub clear_color: [f32; 4],
    /// Binding pool growth policy.
    pub binding_pool: BindingPoolConfig,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: crate::DEFAULT_FRAMES_IN_FLIGHT,
            max_acquire_attempts: 4,
            present_mode: PresentModePreference::default(),
            preferred_image_count: None,
            clear_color: [0.1, 0.1, 0.15, 1.0],
            binding_pool: BindingPoolConfig::default(),
        }
    }
}

impl RendererConfig {
    /// Rejects values the renderer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !(1..=4).contains(&self.frames_in_flight) {
            return Err(Error::Config(format!(
                "frames_in_flight must be between 1 and 4, got {}",
                self.frames_in_flight
            )));
        }
        if self.max_acquire_attempts == 0 {
            return Err(Error::Config(
                "max_acquire_attempts must be at least 1".to_string(),
            ));
        }
        if let Some(count) = self.preferred_image_count
            && count < 2
        {
            return Err(Error::Config(format!(
                "preferred_image_count must be at least 2, got {count}"
            )));
        }
        let growth = self.binding_pool.growth_factor;
        if !growth.is_finite() || growth < 1.0 {
            return Err(Error::Config(format!(
                "binding_pool.growth_factor must be >= 1.0, got {growth}"
            )));
        }
        if self.binding_pool.max_recreate_attempts == 0 {
            return Err(Error::Config(
                "binding_pool.max_recreate_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = RendererConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frames_in_flight, 2);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: RendererConfig = serde_json::from_str(
            r#"{ "present_mode": "fifo", "binding_pool": { "growth_factor": 1.5 } }"#,
        )
        .unwrap();
        assert_eq!(config.present_mode, PresentModePreference::Fifo);
        assert_eq!(config.binding_pool.max_recreate_attempts, 8);
        approx::assert_relative_eq!(config.binding_pool.growth_factor, 1.5);
        assert_eq!(config.max_acquire_attempts, 4);
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let mut config = RendererConfig {
            frames_in_flight: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.frames_in_flight = 2;
        config.binding_pool.growth_factor = 0.5;
        assert!(config.validate().is_err());

        config.binding_pool.growth_factor = f32::NAN;
        assert!(config.validate().is_err());

        config.binding_pool.growth_factor = 2.0;
        config.preferred_image_count = Some(1);
        assert!(config.validate().is_err());
    }
}
