//! Renderer settings, loadable from JSON.
//!
//! Every field has a default, so a config file only needs the values it changes:
//!
//! ```json
//! {
//!     "shadow": { "technique": "evsm4", "cascadeLevels": 3 },
//!     "taa": { "enabled": false }
//! }
//! ```

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Maximum number of shadow cascades.
pub const MAX_CASCADES: usize = 8;

/// How the shadow map is filtered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShadowType {
    /// Depth comparison with a PCF kernel.
    #[default]
    Hard,
    Vsm,
    Esm,
    Evsm2,
    Evsm4,
}

impl ShadowType {
    /// Techniques that render moments and blur them.
    pub fn is_filterable(self) -> bool {
        self != ShadowType::Hard
    }

    pub fn pass_suffix(self) -> &'static str {
        match self {
            ShadowType::Hard => "Hard",
            ShadowType::Vsm => "Vsm",
            ShadowType::Esm => "Esm",
            ShadowType::Evsm2 => "Evsm2",
            ShadowType::Evsm4 => "Evsm4",
        }
    }
}

/// Where each cascade's depth interval starts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CascadeFit {
    /// Cascade `i` covers `[partition[i - 1], partition[i]]`.
    #[default]
    ToCascade,
    /// Every cascade starts at the camera near plane.
    ToScene,
}

/// How the light-space near and far planes of a cascade are chosen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NearFarFit {
    /// Fixed planes at 0.1 and 10000.
    ZeroOne,
    /// The Z range of the cascade's own light-space box.
    CascadeAabb,
    /// The Z range of the scene box in light space.
    SceneAabb,
    /// The Z range of the scene box clipped to the cascade's XY footprint.
    #[default]
    SceneAabbIntersection,
}

/// How a pixel picks its cascade in the lighting pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CascadeSelection {
    /// By view-space depth against the partition depths.
    #[default]
    Interval,
    /// By the first cascade whose texture coordinates contain the pixel.
    Map,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ShadowConfig {
    pub cascade_levels: usize,
    /// End of each cascade as a fraction of the camera depth range, strictly increasing
    /// within (0, 1].
    pub partitions: Vec<f32>,
    pub shadow_size: u32,
    pub pcf_kernel_size: u32,
    pub depth_offset: f32,
    pub technique: ShadowType,
    pub blur_kernel_size: u32,
    pub blur_sigma: f32,
    /// Positive and negative EVSM exponents. ESM uses the positive one.
    pub evsm_exponents: [f32; 2],
    pub light_bleeding_reduction: f32,
    pub cascade_fit: CascadeFit,
    pub near_far_fit: NearFarFit,
    pub selection: CascadeSelection,
    pub blend_between_cascades: bool,
    pub blend_area: f32,
    pub fixed_size_frustum_aabb: bool,
    pub move_light_texel_size: bool,
    /// Far limit of the shadowed range in world units, capped by the camera far plane.
    pub max_distance: f32,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            cascade_levels: 4,
            partitions: default_partitions(4),
            shadow_size: 1024,
            pcf_kernel_size: 5,
            depth_offset: 0.001,
            technique: ShadowType::Hard,
            blur_kernel_size: 5,
            blur_sigma: 1.5,
            evsm_exponents: [40.0, 5.0],
            light_bleeding_reduction: 0.8,
            cascade_fit: CascadeFit::ToCascade,
            near_far_fit: NearFarFit::SceneAabbIntersection,
            selection: CascadeSelection::Interval,
            blend_between_cascades: true,
            blend_area: 0.005,
            fixed_size_frustum_aabb: true,
            move_light_texel_size: true,
            max_distance: 200.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TaaConfig {
    pub enabled: bool,
    /// Length of the jitter sequence.
    pub sample_count: u32,
    /// Weight of the current frame in the resolve.
    pub blend_factor: f32,
}

impl Default for TaaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_count: 8,
            blend_factor: 0.1,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ShaderCacheConfig {
    pub directory: Option<PathBuf>,
    pub force_write: bool,
}

/// Everything the renderer can be configured with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RenderConfig {
    pub shadow: ShadowConfig,
    pub taa: TaaConfig,
    /// Image-based lighting from the skybox once it has been precomputed.
    pub ibl: bool,
    pub exposure: f32,
    pub shader_cache: ShaderCacheConfig,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            shadow: ShadowConfig::default(),
            taa: TaaConfig::default(),
            ibl: true,
            exposure: 1.0,
            shader_cache: ShaderCacheConfig::default(),
        }
    }
}

impl RenderConfig {
    /// Reads a JSON config file and clamps it into range.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let mut config: RenderConfig =
            serde_json::from_str(&text).map_err(|e| EngineError::Config {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        config.validate();
        log::info!("Loaded render config from {}", path.display());
        Ok(config)
    }

    /// Clamps every setting into its supported range.
    pub fn validate(&mut self) {
        let shadow = &mut self.shadow;
        shadow.cascade_levels = shadow.cascade_levels.clamp(1, MAX_CASCADES);
        if !partitions_are_valid(&shadow.partitions, shadow.cascade_levels) {
            log::warn!(
                "Invalid cascade partitions {:?}; using defaults for {} cascades",
                shadow.partitions,
                shadow.cascade_levels
            );
            shadow.partitions = default_partitions(shadow.cascade_levels);
        }
        shadow.partitions.truncate(shadow.cascade_levels);
        shadow.shadow_size = shadow.shadow_size.clamp(128, 8192);
        shadow.pcf_kernel_size = odd_clamp(shadow.pcf_kernel_size, 1, 11);
        shadow.blur_kernel_size = odd_clamp(shadow.blur_kernel_size, 1, 15);
        shadow.blur_sigma = shadow.blur_sigma.max(0.1);
        shadow.depth_offset = shadow.depth_offset.clamp(0.0, 0.1);
        shadow.evsm_exponents[0] = shadow.evsm_exponents[0].clamp(1.0, 42.0);
        shadow.evsm_exponents[1] = shadow.evsm_exponents[1].clamp(1.0, 42.0);
        shadow.light_bleeding_reduction = shadow.light_bleeding_reduction.clamp(0.0, 0.99);
        shadow.blend_area = shadow.blend_area.clamp(0.0, 0.5);
        shadow.max_distance = shadow.max_distance.max(1.0);

        self.taa.sample_count = self.taa.sample_count.clamp(1, 128);
        self.taa.blend_factor = self.taa.blend_factor.clamp(0.01, 1.0);
        self.exposure = self.exposure.max(0.0);
    }
}

fn odd_clamp(value: u32, min: u32, max: u32) -> u32 {
    let value = value.clamp(min, max);
    if value % 2 == 0 { value + 1 } else { value }
}

/// True when the first `levels` partitions exist, lie in (0, 1] and strictly increase.
pub fn partitions_are_valid(partitions: &[f32], levels: usize) -> bool {
    partitions.len() >= levels
        && partitions[..levels]
            .iter()
            .all(|&p| p > 0.0 && p <= 1.0)
        && partitions[..levels].windows(2).all(|w| w[0] < w[1])
}

/// Geometric split ending at 1.0, e.g. `[0.04, 0.117, 0.342, 1.0]` for four cascades.
pub fn default_partitions(levels: usize) -> Vec<f32> {
    let levels = levels.clamp(1, MAX_CASCADES);
    if levels == 1 {
        return vec![1.0];
    }
    (0..levels)
        .map(|i| {
            let t = (levels - 1 - i) as f32 / (levels - 1) as f32;
            0.04f32.powf(t)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RenderConfig::default();
        assert!(partitions_are_valid(
            &config.shadow.partitions,
            config.shadow.cascade_levels
        ));
        for levels in 1..=MAX_CASCADES {
            let partitions = default_partitions(levels);
            assert_eq!(partitions.len(), levels);
            assert!(partitions_are_valid(&partitions, levels));
            assert_eq!(*partitions.last().unwrap(), 1.0);
        }
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: RenderConfig =
            serde_json::from_str(r#"{ "shadow": { "technique": "evsm4" }, "exposure": 2.0 }"#)
                .unwrap();
        assert_eq!(config.shadow.technique, ShadowType::Evsm4);
        assert_eq!(config.shadow.cascade_levels, 4);
        assert_eq!(config.exposure, 2.0);
        assert!(config.taa.enabled);
    }

    #[test]
    fn validate_clamps_and_repairs() {
        let mut config = RenderConfig::default();
        config.shadow.cascade_levels = 12;
        config.shadow.partitions = vec![0.5, 0.2, 1.0];
        config.shadow.pcf_kernel_size = 4;
        config.taa.sample_count = 0;
        config.validate();

        assert_eq!(config.shadow.cascade_levels, MAX_CASCADES);
        assert_eq!(config.shadow.partitions, default_partitions(MAX_CASCADES));
        assert_eq!(config.shadow.pcf_kernel_size, 5);
        assert_eq!(config.taa.sample_count, 1);
    }

    #[test]
    fn non_monotonic_partitions_are_invalid() {
        assert!(!partitions_are_valid(&[0.2, 0.2, 1.0], 3));
        assert!(!partitions_are_valid(&[0.0, 0.5], 2));
        assert!(!partitions_are_valid(&[0.5, 1.5], 2));
        assert!(!partitions_are_valid(&[0.5], 2));
        assert!(partitions_are_valid(&[0.1, 0.4, 0.9, 3.0], 3));
    }

    #[test]
    fn load_reports_bad_files() {
        let dir = std::env::temp_dir().join(format!("umbra-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("render.json");

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            RenderConfig::load(&path),
            Err(EngineError::Config { .. })
        ));

        std::fs::write(&path, r#"{ "taa": { "sampleCount": 16 } }"#).unwrap();
        assert_eq!(RenderConfig::load(&path).unwrap().taa.sample_count, 16);

        assert!(matches!(
            RenderConfig::load(dir.join("missing.json")),
            Err(EngineError::Io(_))
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
