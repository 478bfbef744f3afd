//! Scene geometry.

use glam::Vec3;

/// Vertex position as uploaded for the bottom-level build (`R32G32B32_SFLOAT`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
}

impl Vertex {
    /// Create a vertex from its coordinates.
    #[inline]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self {
            position: [x, y, z],
        }
    }

    /// Byte stride between consecutive vertices.
    pub const STRIDE: u64 = std::mem::size_of::<Self>() as u64;
}

/// Indexed triangle list.
#[derive(Clone, Debug, PartialEq)]
pub struct TriangleMesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl TriangleMesh {
    /// The single triangle rendered by the viewer.
    pub fn single_triangle() -> Self {
        Self {
            vertices: vec![
                Vertex::new(1.0, 1.0, 0.0),
                Vertex::new(-1.0, 1.0, 0.0),
                Vertex::new(0.0, -1.0, 0.0),
            ],
            indices: vec![0, 1, 2],
        }
    }

    /// Number of triangles described by the index list.
    pub fn triangle_count(&self) -> u32 {
        (self.indices.len() / 3) as u32
    }

    /// Check that the mesh can be fed to a triangle build.
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.vertices.is_empty() || self.indices.is_empty() {
            return Err("mesh has no geometry".to_string());
        }
        if self.indices.len() % 3 != 0 {
            return Err(format!(
                "index count {} is not a multiple of 3",
                self.indices.len()
            ));
        }
        let vertex_count = self.vertices.len() as u32;
        if let Some(&bad) = self.indices.iter().find(|&&i| i >= vertex_count) {
            return Err(format!(
                "index {bad} out of range for {vertex_count} vertices"
            ));
        }
        Ok(())
    }

    /// Vertex data as raw bytes.
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Index data as raw bytes.
    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }
}

/// Placement of the single instance in the top-level structure.
///
/// Rotation is always identity; only a translation can be applied.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct InstanceTransform {
    pub translation: Vec3,
}

impl InstanceTransform {
    pub const IDENTITY: Self = Self {
        translation: Vec3::ZERO,
    };

    /// Create a translation-only transform.
    #[inline]
    pub const fn from_translation(translation: Vec3) -> Self {
        Self { translation }
    }

    /// Row-major 3x4 matrix as laid out in an instance record.
    pub fn to_row_major_3x4(&self) -> [f32; 12] {
        let t = self.translation;
        [
            1.0, 0.0, 0.0, t.x, //
            0.0, 1.0, 0.0, t.y, //
            0.0, 0.0, 1.0, t.z,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn vertex_stride() {
        assert_eq!(Vertex::STRIDE, 12);
    }

    #[test]
    fn single_triangle_layout() {
        let mesh = TriangleMesh::single_triangle();
        assert_eq!(mesh.vertices[0], Vertex::new(1.0, 1.0, 0.0));
        assert_eq!(mesh.vertices[1], Vertex::new(-1.0, 1.0, 0.0));
        assert_eq!(mesh.vertices[2], Vertex::new(0.0, -1.0, 0.0));
        assert_eq!(mesh.indices, vec![0, 1, 2]);
        assert_eq!(mesh.triangle_count(), 1);
        assert!(mesh.validate().is_ok());
        assert_eq!(mesh.vertex_bytes().len(), 36);
        assert_eq!(mesh.index_bytes().len(), 12);
    }

    #[test]
    fn validate_rejects_bad_meshes() {
        let mut mesh = TriangleMesh::single_triangle();
        mesh.indices.push(0);
        assert!(mesh.validate().is_err());

        let mut mesh = TriangleMesh::single_triangle();
        mesh.indices[2] = 3;
        assert!(mesh.validate().is_err());

        let empty = TriangleMesh {
            vertices: Vec::new(),
            indices: Vec::new(),
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn identity_transform_matrix() {
        let m = InstanceTransform::IDENTITY.to_row_major_3x4();
        assert_eq!(
            m,
            [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]
        );
    }

    #[test]
    fn translation_lands_in_last_column() {
        let m = InstanceTransform::from_translation(Vec3::new(0.5, -2.0, 3.25)).to_row_major_3x4();
        assert_relative_eq!(m[3], 0.5);
        assert_relative_eq!(m[7], -2.0);
        assert_relative_eq!(m[11], 3.25);
        // Rotation block stays identity.
        assert_relative_eq!(m[0], 1.0);
        assert_relative_eq!(m[5], 1.0);
        assert_relative_eq!(m[10], 1.0);
        assert_relative_eq!(m[1], 0.0);
    }
}
