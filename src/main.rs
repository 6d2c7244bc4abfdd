//! Interactive viewer: a lit test scene with orbit controls, picking and debug views.
//!
//! ```text
//! umbra-viewer [config.json] [model.stl]
//! ```
//!
//! Right-drag orbits, the wheel zooms, left-click selects. `T` toggles TAA, `C` cycles the
//! shadow technique, `1`-`7` show a G-buffer channel (`0` turns it off), `F` draws the
//! cascade volumes, `Delete` removes the selection.

use std::sync::Arc;

use glam::{Quat, Vec3, Vec4};
use winit::application::ApplicationHandler;
use winit::event::{MouseButton, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::KeyCode;
use winit::window::{Window, WindowId};

use umbra::assets::{Material, ModelManager, TextureManager};
use umbra::config::{RenderConfig, ShadowType};
use umbra::device::{RenderBackend, WgpuBackend};
use umbra::effects::GBufferDebugMode;
use umbra::input::Input;
use umbra::orbit_camera::OrbitCamera;
use umbra::renderer::{DebugViews, Renderer};
use umbra::scene::{
    DirectionalLightComponent, EditingSystem, SceneGraph, SkyboxComponent, StaticMeshComponent,
    Transform,
};
use umbra::{EngineError, GpuContext};

const SHADOW_TYPES: [ShadowType; 5] = [
    ShadowType::Hard,
    ShadowType::Vsm,
    ShadowType::Esm,
    ShadowType::Evsm2,
    ShadowType::Evsm4,
];

const DEBUG_KEYS: [KeyCode; 7] = [
    KeyCode::Digit1,
    KeyCode::Digit2,
    KeyCode::Digit3,
    KeyCode::Digit4,
    KeyCode::Digit5,
    KeyCode::Digit6,
    KeyCode::Digit7,
];

struct Viewer {
    window: Arc<Window>,
    backend: WgpuBackend,
    renderer: Renderer,
    models: ModelManager,
    textures: TextureManager,
    scene: SceneGraph,
    editing: EditingSystem,
    orbit: OrbitCamera,
    input: Input,
    debug_views: DebugViews,
}

impl Viewer {
    fn new(window: Arc<Window>, config: RenderConfig, model_path: Option<&str>) -> Result<Self, EngineError> {
        let size = window.inner_size();
        let mut backend = WgpuBackend::new(GpuContext::new(window.clone())?);
        let renderer = Renderer::new(&mut backend, config, size.width, size.height)?;
        let mut models = ModelManager::new();
        let mut textures = TextureManager::new(&mut backend)?;
        let scene = build_scene(&mut backend, &mut models, &mut textures, model_path)?;
        Ok(Self {
            window,
            backend,
            renderer,
            models,
            textures,
            scene,
            editing: EditingSystem::new(),
            orbit: OrbitCamera::new().target([0.0, 0.5, 0.0]),
            input: Input::new(),
            debug_views: DebugViews::default(),
        })
    }

    fn handle_keys(&mut self) {
        if self.input.key_pressed(KeyCode::KeyT) {
            let enabled = !self.renderer.config().taa.enabled;
            self.renderer.set_taa_enabled(enabled);
            log::info!("TAA {}", if enabled { "on" } else { "off" });
        }
        if self.input.key_pressed(KeyCode::KeyC) {
            let current = self.renderer.shadow_manager().technique();
            let index = SHADOW_TYPES.iter().position(|&t| t == current).unwrap_or(0);
            let next = SHADOW_TYPES[(index + 1) % SHADOW_TYPES.len()];
            self.renderer.set_shadow_technique(next);
            log::info!("Shadow technique: {:?}", next);
        }
        if self.input.key_pressed(KeyCode::KeyF) {
            self.debug_views.cascade_frusta = !self.debug_views.cascade_frusta;
        }
        if self.input.key_pressed(KeyCode::Digit0) {
            self.debug_views.gbuffer = None;
        }
        for (key, mode) in DEBUG_KEYS.into_iter().zip(GBufferDebugMode::ALL) {
            if self.input.key_pressed(key) {
                self.debug_views.gbuffer = Some(mode);
                log::info!("G-buffer view: {:?}", mode);
            }
        }
        if self.input.key_pressed(KeyCode::Delete) && self.editing.destroy_selected(&mut self.scene) {
            log::info!("Deleted the selected entity");
        }
        self.renderer.set_debug_views(self.debug_views);
    }

    fn redraw(&mut self) -> Result<(), EngineError> {
        self.orbit.update(&self.input);
        self.handle_keys();

        if self.input.mouse_pressed(MouseButton::Left) {
            let cursor = self.input.cursor();
            let x = (cursor.x.max(0.0) as u32).min(self.renderer.width() - 1);
            let y = (cursor.y.max(0.0) as u32).min(self.renderer.height() - 1);
            let picked = self
                .renderer
                .pick_entity_gpu(&mut self.backend, &mut self.editing, x, y);
            if let Some(name) = picked.and_then(|e| {
                self.scene
                    .get_component::<umbra::scene::TagComponent>(e)
                    .map(|tag| tag.name.clone())
            }) {
                log::info!("Selected {}", name);
            }
        }

        let aspect = self.renderer.width() as f32 / self.renderer.height() as f32;
        let camera = self.orbit.camera(aspect);
        self.renderer.render_frame(
            &mut self.backend,
            &mut self.scene,
            &self.models,
            &self.textures,
            &mut self.editing,
            &camera,
        )?;
        self.input.end_frame();
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.backend.resize(width, height);
        if let Err(e) = self.renderer.resize(&mut self.backend, width, height) {
            log::error!("Resize failed: {}", e);
        }
    }

    fn release(&mut self) {
        self.renderer.release(&mut self.backend);
        self.models.release(&mut self.backend);
        self.textures.release(&mut self.backend);
        self.backend.submit();
    }
}

fn build_scene(
    backend: &mut dyn RenderBackend,
    models: &mut ModelManager,
    textures: &mut TextureManager,
    model_path: Option<&str>,
) -> Result<SceneGraph, EngineError> {
    let mut scene = SceneGraph::new();

    let ground = models.create_plane(
        backend,
        20.0,
        Material {
            base_color: Vec4::new(0.6, 0.6, 0.6, 1.0),
            roughness: 0.9,
            ..Material::default()
        },
    )?;
    let entity = scene.create_entity("ground");
    scene.add_component(entity, Transform::new());
    scene.add_component(entity, StaticMeshComponent::new(ground));

    let cube = models.create_cube(
        backend,
        Material {
            base_color: Vec4::new(0.8, 0.2, 0.15, 1.0),
            roughness: 0.4,
            ..Material::default()
        },
    )?;
    for i in 0..5 {
        let angle = i as f32 * std::f32::consts::TAU / 5.0;
        let entity = scene.create_entity(&format!("cube{}", i));
        scene.add_component(
            entity,
            Transform::from_position(Vec3::new(angle.cos() * 3.0, 0.5, angle.sin() * 3.0))
                .rotation(Quat::from_rotation_y(angle)),
        );
        scene.add_component(entity, StaticMeshComponent::new(cube));
    }

    let sphere = models.create_sphere(
        backend,
        Material {
            base_color: Vec4::new(0.95, 0.85, 0.6, 1.0),
            metallic: 1.0,
            roughness: 0.25,
            ..Material::default()
        },
    )?;
    let entity = scene.create_entity("sphere");
    scene.add_component(entity, Transform::from_position(Vec3::new(0.0, 1.0, 0.0)));
    scene.add_component(entity, StaticMeshComponent::new(sphere));

    if let Some(path) = model_path {
        match models.create_from_file(backend, path) {
            Ok(model) => {
                let entity = scene.create_entity(path);
                scene.add_component(entity, Transform::from_position(Vec3::new(0.0, 0.0, -5.0)));
                scene.add_component(entity, StaticMeshComponent::new(model));
            }
            Err(e) => log::error!("Could not load {}: {}", path, e),
        }
    }

    let sun = scene.create_entity("sun");
    scene.add_component(sun, Transform::new().looking_at(Vec3::new(0.4, -1.0, 0.3)));
    scene.add_component(sun, DirectionalLightComponent::default());

    let sky = textures.create_sky_cube(
        backend,
        64,
        Vec3::new(0.15, 0.35, 0.8),
        Vec3::new(0.75, 0.8, 0.9),
        Vec3::new(0.2, 0.18, 0.15),
    )?;
    let entity = scene.create_entity("sky");
    scene.add_component(entity, SkyboxComponent { cube: sky });

    log::info!("Scene built with {} entities", scene.entity_count());
    Ok(scene)
}

#[derive(Default)]
struct App {
    config: RenderConfig,
    model_path: Option<String>,
    viewer: Option<Viewer>,
    failed: bool,
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.viewer.is_some() {
            return;
        }
        let attributes = Window::default_attributes().with_title("Umbra");
        let viewer = event_loop
            .create_window(attributes)
            .map_err(|e| EngineError::Device(format!("failed to create window: {}", e)))
            .and_then(|window| Viewer::new(Arc::new(window), self.config.clone(), self.model_path.as_deref()));
        match viewer {
            Ok(viewer) => {
                viewer.window.request_redraw();
                self.viewer = Some(viewer);
            }
            Err(e) => {
                log::error!("Failed to start: {}", e);
                self.failed = true;
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let Some(viewer) = &mut self.viewer else {
            return;
        };
        viewer.input.handle_event(&event);
        match event {
            WindowEvent::CloseRequested => {
                viewer.release();
                event_loop.exit();
            }
            WindowEvent::Resized(size) => viewer.resize(size.width, size.height),
            WindowEvent::RedrawRequested => {
                if let Err(e) = viewer.redraw() {
                    log::error!("Frame failed: {}", e);
                }
                viewer.window.request_redraw();
            }
            _ => {}
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => RenderConfig::load(&path).unwrap_or_else(|e| {
            log::warn!("Using default config, {} could not be read: {}", path, e);
            RenderConfig::default()
        }),
        None => RenderConfig::default(),
    };

    let event_loop = match EventLoop::new() {
        Ok(event_loop) => event_loop,
        Err(e) => {
            log::error!("Failed to create event loop: {}", e);
            std::process::exit(1);
        }
    };
    event_loop.set_control_flow(ControlFlow::Poll);
    let mut app = App {
        config,
        model_path: args.next(),
        viewer: None,
        failed: false,
    };
    if let Err(e) = event_loop.run_app(&mut app) {
        log::error!("Event loop error: {}", e);
        std::process::exit(1);
    }
    if app.failed {
        std::process::exit(1);
    }
}
