//! Asset managers for models and textures.
//!
//! Both managers own their assets in generation-checked arenas and hand out small `Copy`
//! handles. A handle whose asset has been removed simply stops resolving, so components
//! can hold onto handles without keeping assets alive.
//!
//! Assets loaded from files are de-duplicated by path: loading the same path twice
//! returns the same handle.

pub mod model;
pub mod texture;

use crate::arena::RawHandle;

pub use model::{Material, MeshData, MeshGeometry, Model, ModelManager, Vertex3d};
pub use texture::TextureManager;

/// Handle to a [`Model`] owned by a [`ModelManager`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ModelHandle(pub(crate) RawHandle);

/// Handle to a 2D texture owned by a [`TextureManager`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) RawHandle);

/// Handle to a cube texture owned by a [`TextureManager`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CubeHandle(pub(crate) RawHandle);
