//! Texture loading and ownership.

use super::{CubeHandle, TextureHandle};
use crate::arena::Arena;
use crate::error::EngineError;
use crate::device::RenderBackend;
use crate::resources::{Texture2D, TextureCube};
use glam::Vec3;
use std::collections::HashMap;
use std::path::Path;

/// Owns 2D textures and cube maps.
///
/// A 1x1 white texture is always present and stands in for materials without an albedo
/// map.
#[derive(Debug)]
pub struct TextureManager {
    textures: Arena<Texture2D>,
    cubes: Arena<TextureCube>,
    by_name: HashMap<String, TextureHandle>,
    white: TextureHandle,
}

impl TextureManager {
    pub fn new(backend: &mut dyn RenderBackend) -> Result<Self, EngineError> {
        let mut textures = Arena::new();
        let white = Texture2D::from_rgba8(backend, "Default White", 1, 1, &[255; 4])?;
        let white = TextureHandle(textures.insert(white));
        Ok(Self {
            textures,
            cubes: Arena::new(),
            by_name: HashMap::new(),
            white,
        })
    }

    /// Loads an image file, or returns the handle of the copy already loaded from `path`.
    pub fn create_from_file(
        &mut self,
        backend: &mut dyn RenderBackend,
        path: impl AsRef<Path>,
    ) -> Result<TextureHandle, EngineError> {
        let path = path.as_ref();
        let name = path.to_string_lossy().into_owned();
        if let Some(&handle) = self.by_name.get(&name) {
            return Ok(handle);
        }
        let image = image::open(path)?.to_rgba8();
        let (width, height) = image.dimensions();
        log::info!("Loaded texture {} ({}x{})", name, width, height);
        self.create_from_rgba(backend, &name, width, height, &image)
    }

    /// Decodes an encoded image (PNG, JPEG, ...) held in memory.
    pub fn create_from_memory(
        &mut self,
        backend: &mut dyn RenderBackend,
        name: &str,
        bytes: &[u8],
    ) -> Result<TextureHandle, EngineError> {
        if let Some(&handle) = self.by_name.get(name) {
            return Ok(handle);
        }
        let image = image::load_from_memory(bytes)?.to_rgba8();
        let (width, height) = image.dimensions();
        self.create_from_rgba(backend, name, width, height, &image)
    }

    /// Uploads tightly packed RGBA8 pixels under `name`.
    pub fn create_from_rgba(
        &mut self,
        backend: &mut dyn RenderBackend,
        name: &str,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<TextureHandle, EngineError> {
        if let Some(&handle) = self.by_name.get(name) {
            return Ok(handle);
        }
        let texture = Texture2D::from_rgba8(backend, name, width, height, pixels)?;
        let handle = TextureHandle(self.textures.insert(texture));
        self.by_name.insert(name.to_string(), handle);
        Ok(handle)
    }

    /// A two-tone checkerboard with `cells` squares per side.
    pub fn create_checkerboard(
        &mut self,
        backend: &mut dyn RenderBackend,
        size: u32,
        cells: u32,
        a: [u8; 4],
        b: [u8; 4],
    ) -> Result<TextureHandle, EngineError> {
        let name = format!("checkerboard:{}:{}:{:?}:{:?}", size, cells, a, b);
        let pixels = checkerboard(size, cells, a, b);
        self.create_from_rgba(backend, &name, size, size, &pixels)
    }

    pub fn get_texture(&self, handle: TextureHandle) -> Option<&Texture2D> {
        self.textures.get(handle.0)
    }

    pub fn find(&self, name: &str) -> Option<TextureHandle> {
        self.by_name.get(name).copied()
    }

    pub fn default_white(&self) -> TextureHandle {
        self.white
    }

    /// A sky cube with a vertical gradient from `horizon` to `zenith` and a darker ground.
    pub fn create_sky_cube(
        &mut self,
        backend: &mut dyn RenderBackend,
        size: u32,
        zenith: Vec3,
        horizon: Vec3,
        ground: Vec3,
    ) -> Result<CubeHandle, EngineError> {
        let faces = sky_faces(size.max(1), zenith, horizon, ground);
        let cube = TextureCube::from_faces(backend, "Sky Cube", size.max(1), &faces)?;
        Ok(CubeHandle(self.cubes.insert(cube)))
    }

    /// Loads a cube from six face images in +X, -X, +Y, -Y, +Z, -Z order.
    pub fn create_cube_from_files(
        &mut self,
        backend: &mut dyn RenderBackend,
        paths: [&Path; 6],
    ) -> Result<CubeHandle, EngineError> {
        let mut size = 0;
        let mut faces: [Vec<u8>; 6] = Default::default();
        for (face, path) in faces.iter_mut().zip(paths) {
            let image = image::open(path)?.to_rgba8();
            let (width, height) = image.dimensions();
            if width != height || (size != 0 && width != size) {
                return Err(EngineError::Device(format!(
                    "cube face {} is {}x{}, expected square faces of one size",
                    path.display(),
                    width,
                    height
                )));
            }
            size = width;
            *face = image.into_raw();
        }
        let cube = TextureCube::from_faces(backend, "Cube Map", size, &faces)?;
        Ok(CubeHandle(self.cubes.insert(cube)))
    }

    pub fn get_cube(&self, handle: CubeHandle) -> Option<&TextureCube> {
        self.cubes.get(handle.0)
    }

    pub fn remove(&mut self, backend: &mut dyn RenderBackend, handle: TextureHandle) -> bool {
        if handle == self.white {
            return false;
        }
        match self.textures.remove(handle.0) {
            Some(mut texture) => {
                self.by_name.retain(|_, h| *h != handle);
                texture.release(backend);
                true
            }
            None => false,
        }
    }

    pub fn release(&mut self, backend: &mut dyn RenderBackend) {
        let handles: Vec<_> = self.textures.iter().map(|(h, _)| h).collect();
        for handle in handles {
            if let Some(mut texture) = self.textures.remove(handle) {
                texture.release(backend);
            }
        }
        let cubes: Vec<_> = self.cubes.iter().map(|(h, _)| h).collect();
        for handle in cubes {
            if let Some(mut cube) = self.cubes.remove(handle) {
                cube.release(backend);
            }
        }
        self.by_name.clear();
    }
}

fn checkerboard(size: u32, cells: u32, a: [u8; 4], b: [u8; 4]) -> Vec<u8> {
    let cell = (size / cells.max(1)).max(1);
    let mut data = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let even = ((x / cell) + (y / cell)) % 2 == 0;
            data.extend_from_slice(if even { &a } else { &b });
        }
    }
    data
}

/// World direction through texel `(u, v)` of cube face `face`, with `u, v` in [-1, 1].
pub fn cube_direction(face: usize, u: f32, v: f32) -> Vec3 {
    match face {
        0 => Vec3::new(1.0, -v, -u),
        1 => Vec3::new(-1.0, -v, u),
        2 => Vec3::new(u, 1.0, v),
        3 => Vec3::new(u, -1.0, -v),
        4 => Vec3::new(u, -v, 1.0),
        _ => Vec3::new(-u, -v, -1.0),
    }
    .normalize()
}

fn sky_faces(size: u32, zenith: Vec3, horizon: Vec3, ground: Vec3) -> [Vec<u8>; 6] {
    let to_byte = |c: f32| (c.clamp(0.0, 1.0) * 255.0 + 0.5) as u8;
    std::array::from_fn(|face| {
        let mut data = Vec::with_capacity((size * size * 4) as usize);
        for y in 0..size {
            for x in 0..size {
                let u = (x as f32 + 0.5) / size as f32 * 2.0 - 1.0;
                let v = (y as f32 + 0.5) / size as f32 * 2.0 - 1.0;
                let up = cube_direction(face, u, v).y;
                let color = if up >= 0.0 {
                    horizon.lerp(zenith, up.sqrt())
                } else {
                    horizon.lerp(ground, (-up * 4.0).min(1.0))
                };
                data.extend_from_slice(&[to_byte(color.x), to_byte(color.y), to_byte(color.z), 255]);
            }
        }
        data
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RecordingBackend;

    #[test]
    fn default_white_always_exists() {
        let mut backend = RecordingBackend::new();
        let mut textures = TextureManager::new(&mut backend).unwrap();
        let white = textures.default_white();
        assert_eq!(textures.get_texture(white).unwrap().width(), 1);
        assert!(!textures.remove(&mut backend, white));
    }

    #[test]
    fn rgba_textures_are_deduplicated_by_name() {
        let mut backend = RecordingBackend::new();
        let mut textures = TextureManager::new(&mut backend).unwrap();
        let a = textures
            .create_checkerboard(&mut backend, 8, 2, [0, 0, 0, 255], [255; 4])
            .unwrap();
        let b = textures
            .create_checkerboard(&mut backend, 8, 2, [0, 0, 0, 255], [255; 4])
            .unwrap();
        assert_eq!(a, b);
        assert!(textures.remove(&mut backend, a));
        assert!(textures.get_texture(a).is_none());
        assert!(textures.find("checkerboard:8:2:[0, 0, 0, 255]:[255, 255, 255, 255]").is_none());
    }

    #[test]
    fn checkerboard_alternates() {
        let data = checkerboard(4, 2, [0; 4], [9; 4]);
        assert_eq!(data[0], 0);
        assert_eq!(data[2 * 4], 9);
        assert_eq!(data[(2 * 4 + 2) * 4], 0);
    }

    #[test]
    fn cube_directions_point_at_faces() {
        assert!(cube_direction(0, 0.0, 0.0).abs_diff_eq(Vec3::X, 1e-6));
        assert!(cube_direction(3, 0.0, 0.0).abs_diff_eq(Vec3::NEG_Y, 1e-6));
        assert!(cube_direction(5, 0.0, 0.0).abs_diff_eq(Vec3::NEG_Z, 1e-6));
    }

    #[test]
    fn sky_cube_is_uploaded_per_face() {
        let mut backend = RecordingBackend::new();
        let mut textures = TextureManager::new(&mut backend).unwrap();
        let sky = textures
            .create_sky_cube(&mut backend, 4, Vec3::new(0.2, 0.4, 0.9), Vec3::ONE, Vec3::splat(0.2))
            .unwrap();
        assert_eq!(textures.get_cube(sky).unwrap().size(), 4);
        let uploads = backend.count(|c| matches!(c, crate::device::Command::UpdateTexture { len: 64, .. }));
        assert_eq!(uploads, 6);
    }
}
