// Meshes: immutable vertex + index buffers uploaded through staging

use anyhow::{ensure, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use std::sync::Arc;

use super::buffer::{upload_device_local, GpuBuffer};
use super::command::ImmediateSubmitter;
use super::GraphicsContext;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

/// Per-instance data read through the instance-rate vertex binding.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceData {
    pub model: [[f32; 4]; 4],
    pub color: [f32; 4],
}

pub struct Mesh {
    pub vertex_buffer: GpuBuffer,
    pub index_buffer: GpuBuffer,
    pub vert_count: u32,
    pub index_count: u32,
}

impl Mesh {
    /// Upload vertices and indices into device-local buffers; blocks until done.
    pub fn create_immediate(
        ctx: &Arc<GraphicsContext>,
        submitter: &ImmediateSubmitter,
        vertices: &[Vertex],
        indices: &[u32],
    ) -> Result<Self> {
        ensure!(!vertices.is_empty() && !indices.is_empty(), "Mesh needs vertices and indices");

        let vertex_buffer = upload_device_local(
            ctx,
            submitter,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            bytemuck::cast_slice(vertices),
        )?;
        let index_buffer = upload_device_local(
            ctx,
            submitter,
            vk::BufferUsageFlags::INDEX_BUFFER,
            bytemuck::cast_slice(indices),
        )?;

        log::debug!(
            "Uploaded mesh: {} vertices, {} indices",
            vertices.len(),
            indices.len()
        );

        Ok(Self {
            vertex_buffer,
            index_buffer,
            vert_count: vertices.len() as u32,
            index_count: indices.len() as u32,
        })
    }
}

/// Unit cube centred on the origin: 4 vertices per face so each face keeps
/// its own normal and UVs, counter-clockwise winding seen from outside.
pub fn cube() -> (Vec<Vertex>, Vec<u32>) {
    // (outward normal, tangent along u)
    let faces = [
        (Vec3::X, Vec3::NEG_Z),
        (Vec3::NEG_X, Vec3::Z),
        (Vec3::Y, Vec3::X),
        (Vec3::NEG_Y, Vec3::X),
        (Vec3::Z, Vec3::X),
        (Vec3::NEG_Z, Vec3::NEG_X),
    ];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);

    for (normal, u) in faces {
        let v = normal.cross(u);
        let centre = normal * 0.5;
        let (hu, hv) = (u * 0.5, v * 0.5);
        let base = vertices.len() as u32;

        let corners = [
            (centre - hu - hv, [0.0, 1.0]),
            (centre + hu - hv, [1.0, 1.0]),
            (centre + hu + hv, [1.0, 0.0]),
            (centre - hu + hv, [0.0, 0.0]),
        ];
        for (pos, uv) in corners {
            vertices.push(Vertex {
                pos: pos.to_array(),
                normal: normal.to_array(),
                uv,
            });
        }
        indices.extend([0, 1, 2, 0, 2, 3].map(|i| base + i));
    }

    (vertices, indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_struct_sizes() {
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
        assert_eq!(std::mem::size_of::<InstanceData>(), 80);
    }

    #[test]
    fn cube_counts() {
        let (vertices, indices) = cube();
        assert_eq!(vertices.len(), 24);
        assert_eq!(indices.len(), 36);
        assert!(indices.iter().all(|&i| (i as usize) < vertices.len()));
    }

    #[test]
    fn cube_faces_wind_outward() {
        let (vertices, indices) = cube();
        for tri in indices.chunks(3) {
            let [a, b, c] = [0, 1, 2].map(|k| Vec3::from(vertices[tri[k] as usize].pos));
            let face_normal = (b - a).cross(c - a).normalize();
            let normal = Vec3::from(vertices[tri[0] as usize].normal);
            assert!(face_normal.dot(normal) > 0.99, "triangle {:?} winds inward", tri);
        }
    }

    #[test]
    fn cube_vertices_lie_on_unit_box() {
        let (vertices, _) = cube();
        for v in &vertices {
            assert!(v.pos.iter().all(|c| (c.abs() - 0.5).abs() < 1e-6));
        }
    }
}
