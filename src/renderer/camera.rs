// Camera and view management

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 1.5, 4.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            fov: std::f32::consts::FRAC_PI_4,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Camera {
    pub fn set_aspect(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.aspect = width as f32 / height as f32;
        }
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    /// Right-handed perspective with Y flipped for Vulkan clip space.
    pub fn projection_matrix(&self) -> Mat4 {
        let mut projection = Mat4::perspective_rh(self.fov, self.aspect, self.near, self.far);
        projection.y_axis.y *= -1.0;
        projection
    }

    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    pub fn uniforms(&self) -> CameraUniforms {
        CameraUniforms::from(self)
    }
}

/// Uniform block bound at set 0, binding 0.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct CameraUniforms {
    pub view: [[f32; 4]; 4],
    pub projection: [[f32; 4]; 4],
    pub position: [f32; 4],
}

impl From<&Camera> for CameraUniforms {
    fn from(camera: &Camera) -> Self {
        Self {
            view: camera.view_matrix().to_cols_array_2d(),
            projection: camera.projection_matrix().to_cols_array_2d(),
            position: camera.position.extend(1.0).to_array(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::Vec4;

    #[test]
    fn target_projects_to_screen_centre() {
        let camera = Camera::default();
        let clip = camera.view_projection_matrix() * camera.target.extend(1.0);
        let ndc = clip / clip.w;
        assert_relative_eq!(ndc.x, 0.0, epsilon = 1e-5);
        assert_relative_eq!(ndc.y, 0.0, epsilon = 1e-5);
        assert!(ndc.z > 0.0 && ndc.z < 1.0);
    }

    #[test]
    fn projection_flips_y_for_vulkan() {
        let camera = Camera {
            position: Vec3::ZERO,
            target: Vec3::NEG_Z,
            ..Camera::default()
        };
        // A point above the view axis lands in the upper half, which is -Y in Vulkan NDC
        let clip = camera.view_projection_matrix() * Vec4::new(0.0, 1.0, -5.0, 1.0);
        assert!(clip.y / clip.w < 0.0);
    }

    #[test]
    fn aspect_ignores_zero_extent() {
        let mut camera = Camera::default();
        camera.set_aspect(1920, 1080);
        assert_relative_eq!(camera.aspect, 1920.0 / 1080.0);
        camera.set_aspect(0, 1080);
        assert_relative_eq!(camera.aspect, 1920.0 / 1080.0);
    }

    #[test]
    fn uniforms_carry_position() {
        let camera = Camera::default();
        let uniforms = camera.uniforms();
        assert_eq!(uniforms.position, [0.0, 1.5, 4.0, 1.0]);
        assert_eq!(std::mem::size_of::<CameraUniforms>(), 144);
    }
}
