//! Typed GPU texture wrappers.
//!
//! Each wrapper owns a backend texture plus the views the renderer needs from it: one
//! shader-resource view over the whole resource, and one target view per mip and array
//! slice (render target, depth target or storage view, depending on the usage it was
//! created with). Views are created once, up front, so binding never allocates.
//!
//! All wrappers dereference to [`GpuTexture`] for the shared accessors.

use crate::device::{
    RenderBackend, ResourceId, ResourceView, TextureDesc, TextureId, TextureKind, ViewDesc,
    ViewId,
};
use crate::error::EngineError;

/// Depth format used by every depth wrapper.
pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

/// A texture with its whole-resource view and per-slice target views.
#[derive(Debug)]
pub struct GpuTexture {
    texture: TextureId,
    desc: TextureDesc,
    srv: ViewId,
    /// Indexed by `layer * mip_levels + mip`.
    targets: Vec<ViewId>,
    /// Single-layer 2D views over all mips, for array and cube textures.
    layer_srvs: Vec<ViewId>,
    /// Per-mip array views over every layer, for storage writes into cubes.
    mip_arrays: Vec<ViewId>,
}

impl GpuTexture {
    fn create(
        backend: &mut dyn RenderBackend,
        mut desc: TextureDesc,
        srv_dimension: wgpu::TextureViewDimension,
    ) -> Result<Self, EngineError> {
        desc.usage |= wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_SRC
            | wgpu::TextureUsages::COPY_DST;
        let texture = backend.create_texture(&desc)?;
        let srv = match backend.create_view(&ViewDesc {
            texture,
            dimension: srv_dimension,
            base_mip: 0,
            mip_count: desc.mip_levels,
            base_layer: 0,
            layer_count: desc.layers,
        }) {
            Ok(view) => view,
            Err(e) => {
                backend.destroy(ResourceId::Texture(texture));
                return Err(e);
            }
        };

        let mut resource = Self {
            texture,
            srv,
            desc,
            targets: Vec::new(),
            layer_srvs: Vec::new(),
            mip_arrays: Vec::new(),
        };
        if let Err(e) = resource.create_views(backend) {
            resource.release(backend);
            return Err(e);
        }
        Ok(resource)
    }

    fn create_views(&mut self, backend: &mut dyn RenderBackend) -> Result<(), EngineError> {
        let TextureDesc {
            layers,
            mip_levels,
            usage,
            ..
        } = self.desc;

        if usage.intersects(
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::STORAGE_BINDING,
        ) {
            for layer in 0..layers {
                for mip in 0..mip_levels {
                    let view = backend.create_view(&ViewDesc::single(self.texture, mip, layer))?;
                    self.targets.push(view);
                }
            }
        }

        if self.desc.kind != TextureKind::D2 {
            for layer in 0..layers {
                let view = backend.create_view(&ViewDesc {
                    texture: self.texture,
                    dimension: wgpu::TextureViewDimension::D2,
                    base_mip: 0,
                    mip_count: mip_levels,
                    base_layer: layer,
                    layer_count: 1,
                })?;
                self.layer_srvs.push(view);
            }
            if usage.contains(wgpu::TextureUsages::STORAGE_BINDING) {
                for mip in 0..mip_levels {
                    let view = backend.create_view(&ViewDesc {
                        texture: self.texture,
                        dimension: wgpu::TextureViewDimension::D2Array,
                        base_mip: mip,
                        mip_count: 1,
                        base_layer: 0,
                        layer_count: layers,
                    })?;
                    self.mip_arrays.push(view);
                }
            }
        }
        Ok(())
    }

    pub fn texture(&self) -> TextureId {
        self.texture
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn mip_levels(&self) -> u32 {
        self.desc.mip_levels
    }

    pub fn layers(&self) -> u32 {
        self.desc.layers
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        self.desc.format
    }

    /// Shader-resource view over every mip and layer.
    pub fn srv(&self) -> ViewId {
        self.srv
    }

    /// [`srv`](Self::srv) as a bindable resource.
    pub fn resource(&self) -> Option<ResourceView> {
        Some(ResourceView::Texture(self.srv))
    }

    /// Render-target, depth or storage view of one mip of one layer.
    pub fn target(&self, mip: u32, layer: u32) -> Option<ViewId> {
        if mip >= self.desc.mip_levels || layer >= self.desc.layers {
            return None;
        }
        self.targets
            .get((layer * self.desc.mip_levels + mip) as usize)
            .copied()
    }

    /// Target view of mip 0 of layer 0.
    pub fn rtv(&self) -> Option<ViewId> {
        self.target(0, 0)
    }

    /// Shader-resource view of one array slice.
    pub fn layer_srv(&self, layer: u32) -> Option<ViewId> {
        if self.desc.kind == TextureKind::D2 {
            return (layer == 0).then_some(self.srv);
        }
        self.layer_srvs.get(layer as usize).copied()
    }

    /// Storage view of one mip across every layer.
    pub fn mip_array(&self, mip: u32) -> Option<ViewId> {
        self.mip_arrays.get(mip as usize).copied()
    }

    /// Destroys the texture and every view of it.
    pub fn release(&mut self, backend: &mut dyn RenderBackend) {
        for view in self
            .targets
            .drain(..)
            .chain(self.layer_srvs.drain(..))
            .chain(self.mip_arrays.drain(..))
            .chain(std::iter::once(self.srv))
        {
            backend.destroy(ResourceId::View(view));
        }
        backend.destroy(ResourceId::Texture(self.texture));
    }
}

macro_rules! texture_wrapper {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug)]
        pub struct $name(GpuTexture);

        impl std::ops::Deref for $name {
            type Target = GpuTexture;

            fn deref(&self) -> &GpuTexture {
                &self.0
            }
        }

        impl std::ops::DerefMut for $name {
            fn deref_mut(&mut self) -> &mut GpuTexture {
                &mut self.0
            }
        }
    };
}

texture_wrapper!(
    /// A single-sample 2D color texture.
    Texture2D
);
texture_wrapper!(
    /// A multisampled 2D color render target.
    Texture2DMs
);
texture_wrapper!(
    /// A six-face cube texture.
    TextureCube
);
texture_wrapper!(
    /// An array of 2D color textures.
    Texture2DArray
);
texture_wrapper!(
    /// A single-sample depth buffer.
    Depth2D
);
texture_wrapper!(
    /// A multisampled depth buffer.
    Depth2DMs
);
texture_wrapper!(
    /// An array of depth buffers, one per slice.
    Depth2DArray
);

impl Texture2D {
    /// A 2D texture. `usage` adds render-target or storage capability on top of sampling.
    pub fn new(
        backend: &mut dyn RenderBackend,
        label: &str,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
        mip_levels: u32,
        usage: wgpu::TextureUsages,
    ) -> Result<Self, EngineError> {
        let mut desc = TextureDesc::d2(label, width, height, format, usage);
        desc.mip_levels = mip_levels.max(1);
        GpuTexture::create(backend, desc, wgpu::TextureViewDimension::D2).map(Self)
    }

    /// A render target that can also be sampled.
    pub fn render_target(
        backend: &mut dyn RenderBackend,
        label: &str,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
    ) -> Result<Self, EngineError> {
        Self::new(
            backend,
            label,
            width,
            height,
            format,
            1,
            wgpu::TextureUsages::RENDER_ATTACHMENT,
        )
    }

    /// An sRGB texture initialised from tightly packed RGBA8 pixels.
    pub fn from_rgba8(
        backend: &mut dyn RenderBackend,
        label: &str,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<Self, EngineError> {
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            return Err(EngineError::Device(format!(
                "texture '{}' expects {} bytes of pixels, got {}",
                label,
                expected,
                pixels.len()
            )));
        }
        let texture = Self::new(
            backend,
            label,
            width,
            height,
            wgpu::TextureFormat::Rgba8UnormSrgb,
            1,
            wgpu::TextureUsages::empty(),
        )?;
        backend.update_texture(texture.texture(), 0, 0, pixels);
        Ok(texture)
    }
}

impl Texture2DMs {
    pub fn new(
        backend: &mut dyn RenderBackend,
        label: &str,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
        sample_count: u32,
    ) -> Result<Self, EngineError> {
        let mut desc = TextureDesc::d2(
            label,
            width,
            height,
            format,
            wgpu::TextureUsages::RENDER_ATTACHMENT,
        );
        desc.sample_count = sample_count.max(1);
        GpuTexture::create(backend, desc, wgpu::TextureViewDimension::D2).map(Self)
    }

    pub fn sample_count(&self) -> u32 {
        self.desc().sample_count
    }
}

impl TextureCube {
    pub fn new(
        backend: &mut dyn RenderBackend,
        label: &str,
        size: u32,
        format: wgpu::TextureFormat,
        mip_levels: u32,
        usage: wgpu::TextureUsages,
    ) -> Result<Self, EngineError> {
        let desc = TextureDesc {
            label: label.to_string(),
            kind: TextureKind::Cube,
            width: size,
            height: size,
            layers: 6,
            mip_levels: mip_levels.max(1),
            sample_count: 1,
            format,
            usage,
        };
        GpuTexture::create(backend, desc, wgpu::TextureViewDimension::Cube).map(Self)
    }

    /// An sRGB cube from six RGBA8 faces in +X, -X, +Y, -Y, +Z, -Z order.
    pub fn from_faces(
        backend: &mut dyn RenderBackend,
        label: &str,
        size: u32,
        faces: &[Vec<u8>; 6],
    ) -> Result<Self, EngineError> {
        let expected = size as usize * size as usize * 4;
        if let Some(face) = faces.iter().position(|f| f.len() != expected) {
            return Err(EngineError::Device(format!(
                "cube '{}' face {} has {} bytes, expected {}",
                label,
                face,
                faces[face].len(),
                expected
            )));
        }
        let cube = Self::new(
            backend,
            label,
            size,
            wgpu::TextureFormat::Rgba8UnormSrgb,
            1,
            wgpu::TextureUsages::empty(),
        )?;
        for (layer, face) in faces.iter().enumerate() {
            backend.update_texture(cube.texture(), 0, layer as u32, face);
        }
        Ok(cube)
    }

    pub fn size(&self) -> u32 {
        self.width()
    }
}

impl Texture2DArray {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: &mut dyn RenderBackend,
        label: &str,
        width: u32,
        height: u32,
        layers: u32,
        format: wgpu::TextureFormat,
        mip_levels: u32,
        usage: wgpu::TextureUsages,
    ) -> Result<Self, EngineError> {
        let desc = TextureDesc {
            label: label.to_string(),
            kind: TextureKind::D2Array,
            width,
            height,
            layers: layers.max(1),
            mip_levels: mip_levels.max(1),
            sample_count: 1,
            format,
            usage,
        };
        GpuTexture::create(backend, desc, wgpu::TextureViewDimension::D2Array).map(Self)
    }
}

impl Depth2D {
    pub fn new(
        backend: &mut dyn RenderBackend,
        label: &str,
        width: u32,
        height: u32,
    ) -> Result<Self, EngineError> {
        let desc = TextureDesc::d2(
            label,
            width,
            height,
            DEPTH_FORMAT,
            wgpu::TextureUsages::RENDER_ATTACHMENT,
        );
        GpuTexture::create(backend, desc, wgpu::TextureViewDimension::D2).map(Self)
    }

    /// Depth-target view.
    pub fn dsv(&self) -> Option<ViewId> {
        self.target(0, 0)
    }
}

impl Depth2DMs {
    pub fn new(
        backend: &mut dyn RenderBackend,
        label: &str,
        width: u32,
        height: u32,
        sample_count: u32,
    ) -> Result<Self, EngineError> {
        let mut desc = TextureDesc::d2(
            label,
            width,
            height,
            DEPTH_FORMAT,
            wgpu::TextureUsages::RENDER_ATTACHMENT,
        );
        desc.sample_count = sample_count.max(1);
        GpuTexture::create(backend, desc, wgpu::TextureViewDimension::D2).map(Self)
    }

    pub fn dsv(&self) -> Option<ViewId> {
        self.target(0, 0)
    }
}

impl Depth2DArray {
    pub fn new(
        backend: &mut dyn RenderBackend,
        label: &str,
        width: u32,
        height: u32,
        layers: u32,
    ) -> Result<Self, EngineError> {
        let desc = TextureDesc {
            label: label.to_string(),
            kind: TextureKind::D2Array,
            width,
            height,
            layers: layers.max(1),
            mip_levels: 1,
            sample_count: 1,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        };
        GpuTexture::create(backend, desc, wgpu::TextureViewDimension::D2Array).map(Self)
    }

    /// Depth-target view of one slice.
    pub fn dsv(&self, layer: u32) -> Option<ViewId> {
        self.target(0, layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RecordingBackend;

    #[test]
    fn array_views_cover_every_slice() {
        let mut backend = RecordingBackend::new();
        let array = Depth2DArray::new(&mut backend, "cascades", 512, 512, 4).unwrap();
        for layer in 0..4 {
            let view = backend.view_desc(array.dsv(layer).unwrap()).unwrap();
            assert_eq!((view.base_layer, view.layer_count), (layer, 1));
        }
        assert!(array.dsv(4).is_none());
        let srv = backend.view_desc(array.srv()).unwrap();
        assert_eq!(srv.dimension, wgpu::TextureViewDimension::D2Array);
        assert_eq!(srv.layer_count, 4);
    }

    #[test]
    fn cube_storage_gets_per_mip_arrays() {
        let mut backend = RecordingBackend::new();
        let cube = TextureCube::new(
            &mut backend,
            "prefilter",
            64,
            wgpu::TextureFormat::Rgba16Float,
            5,
            wgpu::TextureUsages::STORAGE_BINDING,
        )
        .unwrap();
        let mip3 = backend.view_desc(cube.mip_array(3).unwrap()).unwrap();
        assert_eq!((mip3.base_mip, mip3.layer_count), (3, 6));
        assert!(cube.mip_array(5).is_none());
        assert_eq!(cube.target(4, 5).map(|v| backend.view_desc(v).unwrap().base_mip), Some(4));
    }

    #[test]
    fn sampled_only_textures_have_no_targets() {
        let mut backend = RecordingBackend::new();
        let texture = Texture2D::from_rgba8(&mut backend, "white", 2, 2, &[255; 16]).unwrap();
        assert!(texture.rtv().is_none());
        assert_eq!(texture.layer_srv(0), Some(texture.srv()));
        assert!(Texture2D::from_rgba8(&mut backend, "short", 2, 2, &[0; 3]).is_err());
    }

    #[test]
    fn release_destroys_everything() {
        let mut backend = RecordingBackend::new();
        let mut target =
            Texture2D::render_target(&mut backend, "lit", 8, 8, wgpu::TextureFormat::Rgba16Float)
                .unwrap();
        assert_eq!(backend.live_textures(), 1);
        let rtv = target.rtv().unwrap();
        target.release(&mut backend);
        assert_eq!(backend.live_textures(), 0);
        assert!(backend.view_desc(rtv).is_none());
    }
}
