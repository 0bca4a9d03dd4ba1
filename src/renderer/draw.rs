// CPU-side draw list for the indirect pipeline
//
// All queued draws share the indirect mesh, so they collapse into one
// instanced indexed-indirect command. firstInstance stays 0; anything else
// needs the drawIndirectFirstInstance device feature.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

use crate::backend::mesh::InstanceData;

/// Layout-compatible with `VkDrawIndexedIndirectCommand`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct IndirectCommand {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

pub struct DrawQueue {
    instances: Vec<InstanceData>,
    capacity: usize,
    dropped: usize,
}

impl DrawQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            instances: Vec::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Queue one instance; returns false (and counts a drop) when full.
    pub fn push(&mut self, model: Mat4, color: Vec4) -> bool {
        if self.instances.len() == self.capacity {
            self.dropped += 1;
            return false;
        }
        self.instances.push(InstanceData {
            model: model.to_cols_array_2d(),
            color: color.to_array(),
        });
        true
    }

    pub fn instances(&self) -> &[InstanceData] {
        &self.instances
    }

    /// One instanced command covering every queued instance, or none when
    /// the queue is empty.
    pub fn commands(&self, index_count: u32) -> Vec<IndirectCommand> {
        if self.instances.is_empty() || index_count == 0 {
            return Vec::new();
        }
        vec![IndirectCommand {
            index_count,
            instance_count: self.instances.len() as u32,
            first_index: 0,
            vertex_offset: 0,
            first_instance: 0,
        }]
    }

    /// Empty the queue, logging any draws that did not fit.
    pub fn clear(&mut self) {
        if self.dropped > 0 {
            log::warn!(
                "Draw queue full: dropped {} draws (capacity {})",
                self.dropped,
                self.capacity
            );
            self.dropped = 0;
        }
        self.instances.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_matches_vulkan_layout() {
        assert_eq!(std::mem::size_of::<IndirectCommand>(), 20);
    }

    #[test]
    fn queued_instances_share_one_command() {
        let mut queue = DrawQueue::new(4);
        for x in 0..3 {
            assert!(queue.push(Mat4::from_translation(glam::Vec3::X * x as f32), Vec4::ONE));
        }
        let commands = queue.commands(36);
        assert_eq!(
            commands,
            vec![IndirectCommand {
                index_count: 36,
                instance_count: 3,
                first_index: 0,
                vertex_offset: 0,
                first_instance: 0,
            }]
        );
        assert_eq!(queue.instances()[2].model[3][0], 2.0);
    }

    #[test]
    fn first_instance_is_always_zero() {
        let mut queue = DrawQueue::new(64);
        for _ in 0..64 {
            queue.push(Mat4::IDENTITY, Vec4::ONE);
        }
        assert!(queue.commands(6).iter().all(|c| c.first_instance == 0));
    }

    #[test]
    fn nothing_to_draw_gives_no_commands() {
        let mut queue = DrawQueue::new(4);
        assert!(queue.commands(36).is_empty());
        queue.push(Mat4::IDENTITY, Vec4::ONE);
        assert!(queue.commands(0).is_empty());
    }

    #[test]
    fn overflow_is_dropped() {
        let mut queue = DrawQueue::new(1);
        assert!(queue.push(Mat4::IDENTITY, Vec4::ONE));
        assert!(!queue.push(Mat4::IDENTITY, Vec4::ONE));
        assert_eq!(queue.len(), 1);
        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.push(Mat4::IDENTITY, Vec4::ONE));
    }
}
