//! Shader stage registry.
//!
//! Loads the three SPIR-V stages of the ray tracing pipeline, one raygen, one
//! miss and one closest-hit, and derives the shader groups from them.

use ash::vk;
use prism_gpu::{GpuError, Result};
use std::ffi::CStr;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Entry point every stage uses.
pub const ENTRY_POINT: &CStr = c"main";

/// Ray tracing stage kinds used by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShaderStageKind {
    Raygen,
    Miss,
    ClosestHit,
}

impl ShaderStageKind {
    /// Every kind, in group order.
    pub const ALL: [Self; 3] = [Self::Raygen, Self::Miss, Self::ClosestHit];

    pub fn stage_flags(self) -> vk::ShaderStageFlags {
        match self {
            Self::Raygen => vk::ShaderStageFlags::RAYGEN_KHR,
            Self::Miss => vk::ShaderStageFlags::MISS_KHR,
            Self::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        }
    }

    /// Compiled file name inside the shader directory.
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Raygen => "raygen.rgen.spv",
            Self::Miss => "miss.rmiss.spv",
            Self::ClosestHit => "closesthit.rchit.spv",
        }
    }
}

/// Check that `kinds` holds exactly one raygen, one miss and one closest-hit stage.
pub fn validate_stage_kinds(kinds: &[ShaderStageKind]) -> Result<()> {
    if kinds.len() != ShaderStageKind::ALL.len() {
        return Err(GpuError::InvalidShaderStages(format!(
            "expected 3 stages, got {}",
            kinds.len()
        )));
    }
    for kind in ShaderStageKind::ALL {
        let count = kinds.iter().filter(|&&k| k == kind).count();
        if count != 1 {
            return Err(GpuError::InvalidShaderStages(format!(
                "expected exactly one {kind:?} stage, got {count}"
            )));
        }
    }
    Ok(())
}

/// Read a SPIR-V binary.
pub fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let shader_load = |source| GpuError::ShaderLoad {
        path: path.to_path_buf(),
        source,
    };
    let bytes = std::fs::read(path).map_err(shader_load)?;
    ash::util::read_spv(&mut Cursor::new(bytes)).map_err(shader_load)
}

/// One shader group per stage, with every unused slot set to `SHADER_UNUSED_KHR`.
///
/// Stage `i` in `kinds` is referenced by group `i`.
pub fn shader_groups(kinds: &[ShaderStageKind]) -> Vec<vk::RayTracingShaderGroupCreateInfoKHR<'static>> {
    kinds
        .iter()
        .enumerate()
        .map(|(index, kind)| {
            let index = index as u32;
            let group = vk::RayTracingShaderGroupCreateInfoKHR::default()
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR);
            match kind {
                ShaderStageKind::Raygen | ShaderStageKind::Miss => group
                    .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                    .general_shader(index),
                ShaderStageKind::ClosestHit => group
                    .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                    .closest_hit_shader(index),
            }
        })
        .collect()
}

/// Paths of the three stages inside `dir`, using the default file names.
pub fn default_stage_paths(dir: &Path) -> Vec<(ShaderStageKind, PathBuf)> {
    ShaderStageKind::ALL
        .iter()
        .map(|&kind| (kind, dir.join(kind.file_name())))
        .collect()
}

struct LoadedStage {
    kind: ShaderStageKind,
    module: vk::ShaderModule,
}

/// Shader modules of the ray tracing pipeline. Modules are destroyed on drop.
pub struct ShaderStageRegistry {
    device: Arc<ash::Device>,
    stages: Vec<LoadedStage>,
}

impl ShaderStageRegistry {
    /// Validate the stage set, then load and create a module for each stage.
    ///
    /// Stages are stored in raygen, miss, closest-hit order regardless of input order.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn load(
        device: Arc<ash::Device>,
        stages: &[(ShaderStageKind, PathBuf)],
    ) -> Result<Self> {
        let kinds: Vec<_> = stages.iter().map(|(kind, _)| *kind).collect();
        validate_stage_kinds(&kinds)?;

        let mut sorted: Vec<_> = stages.iter().collect();
        sorted.sort_by_key(|(kind, _)| *kind);

        let mut registry = Self {
            device,
            stages: Vec::with_capacity(sorted.len()),
        };

        for (kind, path) in sorted {
            info!("Loading shader: {}", path.display());
            let code = load_spirv(path)?;
            let create_info = vk::ShaderModuleCreateInfo::default().code(&code);
            let module = registry.device.create_shader_module(&create_info, None)?;
            registry.stages.push(LoadedStage {
                kind: *kind,
                module,
            });
        }

        Ok(registry)
    }

    /// Load the default stage files from `dir`.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn from_dir(device: Arc<ash::Device>, dir: &Path) -> Result<Self> {
        Self::load(device, &default_stage_paths(dir))
    }

    /// Stage kinds in group order.
    pub fn kinds(&self) -> Vec<ShaderStageKind> {
        self.stages.iter().map(|s| s.kind).collect()
    }

    /// Pipeline stage infos, in group order.
    pub fn stage_infos(&self) -> Vec<vk::PipelineShaderStageCreateInfo<'static>> {
        self.stages
            .iter()
            .map(|s| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(s.kind.stage_flags())
                    .module(s.module)
                    .name(ENTRY_POINT)
            })
            .collect()
    }

    pub fn groups(&self) -> Vec<vk::RayTracingShaderGroupCreateInfoKHR<'static>> {
        shader_groups(&self.kinds())
    }

    pub fn group_count(&self) -> u32 {
        self.stages.len() as u32
    }

    /// Number of groups of the given kind.
    pub fn count(&self, kind: ShaderStageKind) -> u32 {
        self.stages.iter().filter(|s| s.kind == kind).count() as u32
    }
}

impl Drop for ShaderStageRegistry {
    fn drop(&mut self) {
        for stage in &self.stages {
            unsafe { self.device.destroy_shader_module(stage.module, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_gpu::ErrorKind;
    use std::io::Write;

    use ShaderStageKind::{ClosestHit, Miss, Raygen};

    #[test]
    fn accepts_one_of_each_in_any_order() {
        assert!(validate_stage_kinds(&[Raygen, Miss, ClosestHit]).is_ok());
        assert!(validate_stage_kinds(&[ClosestHit, Raygen, Miss]).is_ok());
    }

    #[test]
    fn rejects_wrong_stage_sets() {
        for kinds in [
            &[Raygen, Miss][..],
            &[Raygen, Miss, ClosestHit, Miss][..],
            &[Raygen, Raygen, ClosestHit][..],
            &[][..],
        ] {
            let err = validate_stage_kinds(kinds).unwrap_err();
            assert!(matches!(err, GpuError::InvalidShaderStages(_)), "{kinds:?}");
            assert_eq!(err.kind(), ErrorKind::Configuration);
        }
    }

    #[test]
    fn groups_use_unused_sentinels() {
        let groups = shader_groups(&ShaderStageKind::ALL);
        assert_eq!(groups.len(), 3);

        assert_eq!(groups[0].ty, vk::RayTracingShaderGroupTypeKHR::GENERAL);
        assert_eq!(groups[0].general_shader, 0);
        assert_eq!(groups[0].closest_hit_shader, vk::SHADER_UNUSED_KHR);

        assert_eq!(groups[1].ty, vk::RayTracingShaderGroupTypeKHR::GENERAL);
        assert_eq!(groups[1].general_shader, 1);

        assert_eq!(
            groups[2].ty,
            vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP
        );
        assert_eq!(groups[2].general_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(groups[2].closest_hit_shader, 2);

        for group in &groups {
            assert_eq!(group.any_hit_shader, vk::SHADER_UNUSED_KHR);
            assert_eq!(group.intersection_shader, vk::SHADER_UNUSED_KHR);
        }
    }

    #[test]
    fn default_paths_use_stage_file_names() {
        let paths = default_stage_paths(Path::new("shaders/spv"));
        assert_eq!(paths[0], (Raygen, PathBuf::from("shaders/spv/raygen.rgen.spv")));
        assert_eq!(paths[1], (Miss, PathBuf::from("shaders/spv/miss.rmiss.spv")));
        assert_eq!(
            paths[2],
            (ClosestHit, PathBuf::from("shaders/spv/closesthit.rchit.spv"))
        );
    }

    #[test]
    fn missing_shader_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raygen.rgen.spv");
        let err = load_spirv(&path).unwrap_err();
        match &err {
            GpuError::ShaderLoad { path: p, .. } => assert_eq!(p, &path),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn reads_spirv_words() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let words: [u32; 3] = [0x0723_0203, 0x0001_0000, 0];
        for word in words {
            file.write_all(&word.to_le_bytes()).unwrap();
        }
        assert_eq!(load_spirv(file.path()).unwrap(), words);
    }

    #[test]
    fn malformed_spirv_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        // Not a multiple of four bytes.
        file.write_all(&[1, 2, 3]).unwrap();
        assert!(matches!(
            load_spirv(file.path()),
            Err(GpuError::ShaderLoad { .. })
        ));
    }
}
