//! CPU-side constant buffers and typed variable access.
//!
//! A [`CBufferData`] mirrors one uniform block: a byte array the size of the reflected
//! block, a dirty flag and the GPU buffer it is flushed into. Variables are views into the
//! byte array; a write only marks the buffer dirty when the bytes actually change, and the
//! GPU copy is refreshed lazily when a pass using the block is applied.

use crate::device::{BufferDesc, BufferId, BufferKind, RenderBackend, ResourceId};
use crate::effect::reflection::UniformMember;
use glam::{Mat4, Vec4};

#[derive(Debug)]
pub struct CBufferData {
    pub name: String,
    pub slot: u32,
    members: Vec<UniformMember>,
    data: Vec<u8>,
    dirty: bool,
    buffer: Option<BufferId>,
}

impl CBufferData {
    pub fn new(name: &str, slot: u32, size: u32, members: Vec<UniformMember>) -> Self {
        Self {
            name: name.to_string(),
            slot,
            members,
            data: vec![0; size as usize],
            dirty: true,
            buffer: None,
        }
    }

    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn members(&self) -> &[UniformMember] {
        &self.members
    }

    /// GPU buffer, once the block has been flushed at least once.
    pub fn buffer(&self) -> Option<BufferId> {
        self.buffer
    }

    /// Merges another shader's view of the same block. The larger size wins and existing
    /// bytes are kept; a grown block gets a new GPU buffer on the next flush.
    pub fn merge(&mut self, size: u32, members: &[UniformMember], backend: &mut dyn RenderBackend) {
        if size > self.size() {
            log::debug!(
                "Constant buffer '{}' grows from {} to {} bytes",
                self.name,
                self.size(),
                size
            );
            self.data.resize(size as usize, 0);
            self.dirty = true;
            self.release(backend);
        }
        for member in members {
            if !self.members.iter().any(|m| m.name == member.name) {
                self.members.push(member.clone());
            }
        }
    }

    /// A variable covering the named member.
    pub fn variable(&mut self, name: &str) -> Option<ConstantBufferVariable<'_>> {
        let member = self.members.iter().find(|m| m.name == name)?;
        let (offset, size) = (member.offset, member.size);
        Some(ConstantBufferVariable {
            cbuffer: self,
            offset,
            size,
        })
    }

    /// A variable covering the whole block.
    pub fn whole(&mut self) -> ConstantBufferVariable<'_> {
        let size = self.size();
        ConstantBufferVariable {
            cbuffer: self,
            offset: 0,
            size,
        }
    }

    /// Uploads the bytes if they changed since the last flush, creating the GPU buffer on
    /// first use.
    pub fn flush(&mut self, backend: &mut dyn RenderBackend) -> Option<BufferId> {
        let buffer = match self.buffer {
            Some(buffer) => buffer,
            None => {
                let desc = BufferDesc {
                    label: self.name.clone(),
                    size: self.data.len().max(16) as u64,
                    kind: BufferKind::Constant,
                };
                match backend.create_buffer(&desc, Some(&self.data)) {
                    Ok(buffer) => {
                        self.buffer = Some(buffer);
                        self.dirty = false;
                        return Some(buffer);
                    }
                    Err(e) => {
                        log::error!("Failed to create constant buffer '{}': {}", self.name, e);
                        return None;
                    }
                }
            }
        };
        if self.dirty {
            backend.update_buffer(buffer, 0, &self.data);
            self.dirty = false;
        }
        Some(buffer)
    }

    pub fn release(&mut self, backend: &mut dyn RenderBackend) {
        if let Some(buffer) = self.buffer.take() {
            backend.destroy(ResourceId::Buffer(buffer));
        }
    }
}

/// A byte window into a [`CBufferData`].
///
/// All setters clamp to the window, so a write can never touch a neighbouring member or
/// run past the end of the block.
pub struct ConstantBufferVariable<'a> {
    cbuffer: &'a mut CBufferData,
    offset: u32,
    size: u32,
}

impl ConstantBufferVariable<'_> {
    pub fn byte_offset(&self) -> u32 {
        self.offset
    }

    pub fn byte_size(&self) -> u32 {
        self.size
    }

    /// Writes `data` at the start of the variable.
    pub fn set_raw(&mut self, data: &[u8]) {
        self.set_raw_at(0, data);
    }

    /// Writes `data` at `byte_offset` within the variable. Bytes equal to the current
    /// contents leave the buffer clean.
    pub fn set_raw_at(&mut self, byte_offset: u32, data: &[u8]) {
        let start = byte_offset.min(self.size);
        let len = (data.len() as u32).min(self.size - start);
        let begin = (self.offset + start) as usize;
        let end = (begin + len as usize).min(self.cbuffer.data.len());
        let len = end.saturating_sub(begin);
        let target = &mut self.cbuffer.data[begin..begin + len];
        if *target != data[..len] {
            target.copy_from_slice(&data[..len]);
            self.cbuffer.dirty = true;
        }
    }

    pub fn get_raw(&self) -> &[u8] {
        let begin = (self.offset as usize).min(self.cbuffer.data.len());
        let end = (begin + self.size as usize).min(self.cbuffer.data.len());
        &self.cbuffer.data[begin..end]
    }

    pub fn set_uint(&mut self, value: u32) {
        self.set_raw(&value.to_le_bytes());
    }

    pub fn set_sint(&mut self, value: i32) {
        self.set_raw(&value.to_le_bytes());
    }

    pub fn set_float(&mut self, value: f32) {
        self.set_raw(&value.to_le_bytes());
    }

    pub fn set_uint_vector(&mut self, values: &[u32]) {
        self.set_raw(bytemuck::cast_slice(values));
    }

    pub fn set_sint_vector(&mut self, values: &[i32]) {
        self.set_raw(bytemuck::cast_slice(values));
    }

    pub fn set_float_vector(&mut self, values: &[f32]) {
        self.set_raw(bytemuck::cast_slice(values));
    }

    pub fn set_vec4(&mut self, value: Vec4) {
        self.set_float_vector(&value.to_array());
    }

    /// Writes a column-major `columns x rows` matrix. Every column starts on a 16-byte
    /// boundary, matching WGSL matrix layout.
    pub fn set_float_matrix(&mut self, columns: u32, rows: u32, values: &[f32]) {
        for column in 0..columns {
            let begin = (column * rows) as usize;
            let Some(data) = values.get(begin..begin + rows as usize) else {
                break;
            };
            self.set_raw_at(column * 16, bytemuck::cast_slice(data));
        }
    }

    pub fn set_mat4(&mut self, value: &Mat4) {
        self.set_float_matrix(4, 4, &value.to_cols_array());
    }

    /// Writes an array of matrices, one per 64 bytes.
    pub fn set_mat4_array(&mut self, values: &[Mat4]) {
        let flat: Vec<f32> = values.iter().flat_map(|m| m.to_cols_array()).collect();
        self.set_raw(bytemuck::cast_slice(&flat));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Command, RecordingBackend};

    fn block() -> CBufferData {
        CBufferData::new(
            "Frame",
            0,
            48,
            vec![
                UniformMember {
                    name: "tint".into(),
                    offset: 0,
                    size: 16,
                },
                UniformMember {
                    name: "rotation".into(),
                    offset: 16,
                    size: 32,
                },
            ],
        )
    }

    #[test]
    fn equal_writes_leave_the_buffer_clean() {
        let mut backend = RecordingBackend::new();
        let mut cb = block();
        cb.flush(&mut backend);
        assert!(!cb.is_dirty());

        let payloads: [&[u8]; 3] = [&[0; 16], &[1, 2, 3, 4], &[9; 16]];
        for payload in payloads {
            cb.variable("tint").unwrap().set_raw(payload);
            cb.flush(&mut backend);
            cb.variable("tint").unwrap().set_raw(payload);
            assert!(!cb.is_dirty(), "second write of {:?} dirtied the buffer", payload);
        }
    }

    #[test]
    fn writes_are_clamped_to_the_variable() {
        let mut cb = block();
        cb.variable("tint").unwrap().set_raw(&[7; 64]);
        assert_eq!(&cb.bytes()[..16], &[7; 16]);
        assert!(cb.bytes()[16..].iter().all(|&b| b == 0));

        let mut whole = cb.whole();
        whole.set_raw_at(40, &[1; 32]);
        assert_eq!(whole.get_raw().len(), 48);
        assert_eq!(&cb.bytes()[40..], &[1; 8]);
    }

    #[test]
    fn matrix_columns_are_padded_to_16_bytes() {
        let mut cb = block();
        cb.variable("rotation")
            .unwrap()
            .set_float_matrix(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let floats: Vec<f32> = cb.bytes()[16..48]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(floats, [1.0, 2.0, 3.0, 0.0, 4.0, 5.0, 6.0, 0.0]);
    }

    #[test]
    fn flush_only_uploads_when_dirty() {
        let mut backend = RecordingBackend::new();
        let mut cb = block();
        let id = cb.flush(&mut backend).unwrap();
        cb.flush(&mut backend);
        assert_eq!(
            backend.count(|c| matches!(c, Command::UpdateBuffer { .. })),
            0
        );

        cb.variable("tint").unwrap().set_float(2.0);
        assert_eq!(cb.flush(&mut backend), Some(id));
        assert_eq!(
            backend.count(|c| matches!(c, Command::UpdateBuffer { .. })),
            1
        );
        assert_eq!(&backend.buffer_contents(id).unwrap()[..4], &2.0f32.to_le_bytes());
    }

    #[test]
    fn merge_keeps_bytes_and_grows() {
        let mut backend = RecordingBackend::new();
        let mut cb = block();
        cb.variable("tint").unwrap().set_uint(5);
        let old = cb.flush(&mut backend).unwrap();
        cb.merge(
            64,
            &[UniformMember {
                name: "extra".into(),
                offset: 48,
                size: 16,
            }],
            &mut backend,
        );
        assert_eq!(cb.size(), 64);
        assert_eq!(&cb.bytes()[..4], &5u32.to_le_bytes());
        assert!(cb.variable("extra").is_some());
        assert_ne!(cb.flush(&mut backend), Some(old));

        cb.merge(16, &[], &mut backend);
        assert_eq!(cb.size(), 64);
    }
}
