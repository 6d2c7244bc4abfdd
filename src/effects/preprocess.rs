//! Image-based lighting precomputation on compute shaders.
//!
//! From one environment cube this produces a diffuse irradiance cube, a GGX-prefiltered
//! specular cube with roughness rising across its mips, and the split-sum BRDF lookup
//! table. The results are owned here and read by the lighting pass.

use super::{SamplerStates, ShaderEntry, add_shaders, set_float, set_uint};
use crate::device::{RenderBackend, ResourceView, ViewId};
use crate::effect::{EffectHelper, EffectPassDesc, ShaderCompiler};
use crate::error::EngineError;
use crate::resources::{Texture2D, TextureCube};

const SOURCE: &str = include_str!("../shaders/preprocess.wgsl");

pub const IRRADIANCE_SIZE: u32 = 32;
pub const PREFILTER_SIZE: u32 = 128;
pub const PREFILTER_MIPS: u32 = 5;
pub const BRDF_LUT_SIZE: u32 = 256;

const PREFILTER_SAMPLES: u32 = 256;
const BRDF_SAMPLES: u32 = 512;

const FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;

#[derive(Debug)]
pub struct PreProcessEffect {
    effect: EffectHelper,
    irradiance: Option<TextureCube>,
    prefiltered: Option<TextureCube>,
    brdf_lut: Option<Texture2D>,
}

impl PreProcessEffect {
    pub fn new(
        backend: &mut dyn RenderBackend,
        compiler: &ShaderCompiler,
        samplers: &SamplerStates,
    ) -> Result<Self, EngineError> {
        let mut effect = EffectHelper::new();
        add_shaders(
            &mut effect,
            compiler,
            backend,
            SOURCE,
            &[
                ShaderEntry::new("preprocess.cs_irradiance", "cs_irradiance"),
                ShaderEntry::new("preprocess.cs_prefilter", "cs_prefilter"),
                ShaderEntry::new("preprocess.cs_brdf_lut", "cs_brdf_lut"),
            ],
        )?;
        effect.add_effect_pass("Irradiance", &EffectPassDesc::compute("preprocess.cs_irradiance"))?;
        effect.add_effect_pass("Prefilter", &EffectPassDesc::compute("preprocess.cs_prefilter"))?;
        effect.add_effect_pass("BrdfLut", &EffectPassDesc::compute("preprocess.cs_brdf_lut"))?;
        samplers.bind(&mut effect);
        Ok(Self {
            effect,
            irradiance: None,
            prefiltered: None,
            brdf_lut: None,
        })
    }

    /// Whether [`compute`](Self::compute) has produced all three maps.
    pub fn is_ready(&self) -> bool {
        self.irradiance.is_some() && self.prefiltered.is_some() && self.brdf_lut.is_some()
    }

    /// Records every precomputation dispatch for `environment`, a cube shader-resource view.
    /// Earlier results are replaced.
    pub fn compute(
        &mut self,
        backend: &mut dyn RenderBackend,
        environment: ViewId,
    ) -> Result<(), EngineError> {
        self.release_maps(backend);
        let usage = wgpu::TextureUsages::STORAGE_BINDING;
        let irradiance = TextureCube::new(backend, "ibl_irradiance", IRRADIANCE_SIZE, FORMAT, 1, usage)?;
        let prefiltered = TextureCube::new(
            backend,
            "ibl_prefiltered",
            PREFILTER_SIZE,
            FORMAT,
            PREFILTER_MIPS,
            usage,
        )?;
        let brdf_lut = Texture2D::new(
            backend,
            "ibl_brdf_lut",
            BRDF_LUT_SIZE,
            BRDF_LUT_SIZE,
            FORMAT,
            1,
            usage,
        )?;

        self.effect
            .set_shader_resource_by_name("environment", Some(ResourceView::from(environment)));

        self.effect.set_unordered_access_by_name(
            "output_cube",
            irradiance.mip_array(0).map(ResourceView::from),
            None,
        );
        self.effect
            .dispatch_pass("Irradiance", backend, [IRRADIANCE_SIZE, IRRADIANCE_SIZE, 6]);

        set_uint(&mut self.effect, "sample_count", PREFILTER_SAMPLES);
        for mip in 0..PREFILTER_MIPS {
            let size = (PREFILTER_SIZE >> mip).max(1);
            set_float(
                &mut self.effect,
                "roughness",
                mip as f32 / (PREFILTER_MIPS - 1).max(1) as f32,
            );
            self.effect.set_unordered_access_by_name(
                "output_cube",
                prefiltered.mip_array(mip).map(ResourceView::from),
                None,
            );
            self.effect.dispatch_pass("Prefilter", backend, [size, size, 6]);
        }

        set_uint(&mut self.effect, "sample_count", BRDF_SAMPLES);
        self.effect.set_unordered_access_by_name(
            "brdf_lut",
            brdf_lut.target(0, 0).map(ResourceView::from),
            None,
        );
        self.effect
            .dispatch_pass("BrdfLut", backend, [BRDF_LUT_SIZE, BRDF_LUT_SIZE, 1]);

        // Leave no storage views bound so the maps can be sampled afterwards
        self.effect.set_unordered_access_by_name("output_cube", None, None);
        self.effect.set_unordered_access_by_name("brdf_lut", None, None);
        self.effect.set_shader_resource_by_name("environment", None);

        log::info!(
            "Precomputed IBL maps: irradiance {0}x{0}, prefiltered {1}x{1} with {2} mips, BRDF LUT {3}x{3}",
            IRRADIANCE_SIZE,
            PREFILTER_SIZE,
            PREFILTER_MIPS,
            BRDF_LUT_SIZE
        );
        self.irradiance = Some(irradiance);
        self.prefiltered = Some(prefiltered);
        self.brdf_lut = Some(brdf_lut);
        Ok(())
    }

    pub fn irradiance_srv(&self) -> Option<ViewId> {
        self.irradiance.as_ref().map(|t| t.srv())
    }

    pub fn prefiltered_srv(&self) -> Option<ViewId> {
        self.prefiltered.as_ref().map(|t| t.srv())
    }

    pub fn brdf_lut_srv(&self) -> Option<ViewId> {
        self.brdf_lut.as_ref().map(|t| t.srv())
    }

    pub fn prefilter_mip_count(&self) -> u32 {
        self.prefiltered.as_ref().map_or(0, |t| t.mip_levels())
    }

    fn release_maps(&mut self, backend: &mut dyn RenderBackend) {
        if let Some(mut map) = self.irradiance.take() {
            map.release(backend);
        }
        if let Some(mut map) = self.prefiltered.take() {
            map.release(backend);
        }
        if let Some(mut map) = self.brdf_lut.take() {
            map.release(backend);
        }
    }

    pub fn helper(&mut self) -> &mut EffectHelper {
        &mut self.effect
    }

    pub fn release(&mut self, backend: &mut dyn RenderBackend) {
        self.release_maps(backend);
        self.effect.release(backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Command;
    use crate::effects::test_support::setup;

    #[test]
    fn compute_dispatches_every_face_and_mip() {
        let (mut backend, compiler, samplers) = setup();
        let mut pre = PreProcessEffect::new(&mut backend, &compiler, &samplers).unwrap();
        let env = TextureCube::new(
            &mut backend,
            "env",
            16,
            FORMAT,
            1,
            wgpu::TextureUsages::empty(),
        )
        .unwrap();
        assert!(!pre.is_ready());
        backend.take_commands();

        pre.compute(&mut backend, env.srv()).unwrap();
        assert!(pre.is_ready());
        assert_eq!(pre.prefilter_mip_count(), PREFILTER_MIPS);

        let dispatches: Vec<_> = backend
            .commands()
            .iter()
            .filter_map(|c| match c {
                Command::Dispatch { x, y, z } => Some([*x, *y, *z]),
                _ => None,
            })
            .collect();
        assert_eq!(dispatches.len(), 2 + PREFILTER_MIPS as usize);
        assert_eq!(dispatches[0], [4, 4, 6]);
        assert_eq!(dispatches[1], [16, 16, 6]);
        assert_eq!(dispatches[PREFILTER_MIPS as usize], [1, 1, 6]);
        assert_eq!(*dispatches.last().unwrap(), [32, 32, 1]);
    }

    #[test]
    fn recompute_replaces_the_maps() {
        let (mut backend, compiler, samplers) = setup();
        let mut pre = PreProcessEffect::new(&mut backend, &compiler, &samplers).unwrap();
        let env = TextureCube::new(&mut backend, "env", 8, FORMAT, 1, wgpu::TextureUsages::empty())
            .unwrap();
        pre.compute(&mut backend, env.srv()).unwrap();
        let live = backend.live_textures();
        pre.compute(&mut backend, env.srv()).unwrap();
        assert_eq!(backend.live_textures(), live);
    }
}
