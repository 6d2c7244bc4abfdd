//! Window input state for the viewer.

use std::collections::HashSet;
use std::hash::Hash;

use glam::Vec2;
use winit::event::{ElementState, MouseButton, MouseScrollDelta, WindowEvent};
use winit::keyboard::{KeyCode, PhysicalKey};

/// Held, pressed-this-frame and released-this-frame sets for one kind of button.
#[derive(Debug)]
struct Buttons<T> {
    down: HashSet<T>,
    pressed: HashSet<T>,
    released: HashSet<T>,
}

impl<T> Default for Buttons<T> {
    fn default() -> Self {
        Self {
            down: HashSet::new(),
            pressed: HashSet::new(),
            released: HashSet::new(),
        }
    }
}

impl<T: Copy + Eq + Hash> Buttons<T> {
    fn update(&mut self, button: T, state: ElementState) {
        match state {
            ElementState::Pressed => {
                // Key repeat arrives as further presses.
                if self.down.insert(button) {
                    self.pressed.insert(button);
                }
            }
            ElementState::Released => {
                self.down.remove(&button);
                self.released.insert(button);
            }
        }
    }

    fn end_frame(&mut self) {
        self.pressed.clear();
        self.released.clear();
    }
}

/// Keyboard and mouse state, fed from winit window events.
#[derive(Debug, Default)]
pub struct Input {
    keys: Buttons<KeyCode>,
    mouse: Buttons<MouseButton>,
    cursor: Vec2,
    cursor_delta: Vec2,
    scroll: f32,
}

impl Input {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears per-frame state. Call once after the frame has consumed the input.
    pub fn end_frame(&mut self) {
        self.keys.end_frame();
        self.mouse.end_frame();
        self.cursor_delta = Vec2::ZERO;
        self.scroll = 0.0;
    }

    pub fn handle_event(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::KeyboardInput { event, .. } => {
                if let PhysicalKey::Code(key) = event.physical_key {
                    self.keys.update(key, event.state);
                }
            }
            WindowEvent::MouseInput { state, button, .. } => self.mouse.update(*button, *state),
            WindowEvent::CursorMoved { position, .. } => {
                let cursor = Vec2::new(position.x as f32, position.y as f32);
                self.cursor_delta += cursor - self.cursor;
                self.cursor = cursor;
            }
            WindowEvent::MouseWheel { delta, .. } => {
                self.scroll += match delta {
                    MouseScrollDelta::LineDelta(_, y) => *y,
                    MouseScrollDelta::PixelDelta(pos) => pos.y as f32 / 120.0,
                };
            }
            _ => {}
        }
    }

    pub fn key_down(&self, key: KeyCode) -> bool {
        self.keys.down.contains(&key)
    }

    pub fn key_pressed(&self, key: KeyCode) -> bool {
        self.keys.pressed.contains(&key)
    }

    pub fn mouse_down(&self, button: MouseButton) -> bool {
        self.mouse.down.contains(&button)
    }

    pub fn mouse_pressed(&self, button: MouseButton) -> bool {
        self.mouse.pressed.contains(&button)
    }

    pub fn mouse_released(&self, button: MouseButton) -> bool {
        self.mouse.released.contains(&button)
    }

    /// Cursor position in physical window pixels.
    pub fn cursor(&self) -> Vec2 {
        self.cursor
    }

    pub fn cursor_delta(&self) -> Vec2 {
        self.cursor_delta
    }

    /// Vertical scroll this frame, in lines.
    pub fn scroll(&self) -> f32 {
        self.scroll
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeats_do_not_count_as_new_presses() {
        let mut buttons = Buttons::default();
        buttons.update(KeyCode::KeyT, ElementState::Pressed);
        assert!(buttons.pressed.contains(&KeyCode::KeyT));
        buttons.end_frame();

        buttons.update(KeyCode::KeyT, ElementState::Pressed);
        assert!(buttons.pressed.is_empty());
        assert!(buttons.down.contains(&KeyCode::KeyT));

        buttons.update(KeyCode::KeyT, ElementState::Released);
        assert!(buttons.down.is_empty());
        assert!(buttons.released.contains(&KeyCode::KeyT));
    }
}
