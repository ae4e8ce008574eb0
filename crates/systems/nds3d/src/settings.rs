use emu_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Upper bound on software rasterizer workers
pub const MAX_RENDER_THREADS: usize = 32;

/// Renderer configuration, applied between frames with `apply_rendering_settings`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    /// Software rasterizer workers; 0 picks from the available parallelism
    pub thread_count: usize,
    /// GPU multisample count; 0 or 1 disables multisampling
    pub multisample_size: u32,
    pub texture_smoothing: bool,
    pub max_anisotropy: u32,
    pub emulate_shadow_polygon: bool,
    pub emulate_special_zero_alpha_blending: bool,
    pub emulate_depth_equal_tolerance: bool,
    pub emulate_depth_lequal_polygon_facing: bool,
    pub enable_edge_mark: bool,
    pub enable_fog: bool,
    pub enable_textures: bool,
    /// Rasterize zero-area polygons as one-pixel lines
    pub enable_line_hack: bool,
    /// Sample attributes at native pixel centers when upscaled
    pub enable_fragment_sampling_hack: bool,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            thread_count: 0,
            multisample_size: 0,
            texture_smoothing: false,
            max_anisotropy: 1,
            emulate_shadow_polygon: true,
            emulate_special_zero_alpha_blending: true,
            emulate_depth_equal_tolerance: true,
            emulate_depth_lequal_polygon_facing: false,
            enable_edge_mark: true,
            enable_fog: true,
            enable_textures: true,
            enable_line_hack: true,
            enable_fragment_sampling_hack: false,
        }
    }
}

/// What changed between two settings values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsDiff {
    pub thread_count: bool,
    pub multisample: bool,
    pub texture_filtering: bool,
    /// Any toggle that changes the frame plan
    pub emulation: bool,
    pub postprocess: bool,
    pub hacks: bool,
}

impl SettingsDiff {
    pub fn any(&self) -> bool {
        self.thread_count
            || self.multisample
            || self.texture_filtering
            || self.emulation
            || self.postprocess
            || self.hacks
    }
}

impl RenderSettings {
    /// Load settings from a JSON file, falling back to defaults on error
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(settings) => settings,
                Err(e) => {
                    log(LogCategory::Render3D, LogLevel::Warn, || {
                        format!(
                            "Failed to parse {}: {}. Using defaults.",
                            path.display(),
                            e
                        )
                    });
                    Self::default()
                }
            },
            // missing or unreadable file
            Err(_) => Self::default(),
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Worker count to actually use, clamped to 1..=32
    pub fn resolved_thread_count(&self) -> usize {
        let requested = if self.thread_count == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.thread_count
        };
        requested.clamp(1, MAX_RENDER_THREADS)
    }

    pub fn diff(&self, other: &RenderSettings) -> SettingsDiff {
        SettingsDiff {
            thread_count: self.resolved_thread_count() != other.resolved_thread_count(),
            multisample: self.multisample_size != other.multisample_size,
            texture_filtering: self.texture_smoothing != other.texture_smoothing
                || self.max_anisotropy != other.max_anisotropy
                || self.enable_textures != other.enable_textures,
            emulation: self.emulate_shadow_polygon != other.emulate_shadow_polygon
                || self.emulate_special_zero_alpha_blending
                    != other.emulate_special_zero_alpha_blending
                || self.emulate_depth_equal_tolerance != other.emulate_depth_equal_tolerance
                || self.emulate_depth_lequal_polygon_facing
                    != other.emulate_depth_lequal_polygon_facing,
            postprocess: self.enable_edge_mark != other.enable_edge_mark
                || self.enable_fog != other.enable_fog,
            hacks: self.enable_line_hack != other.enable_line_hack
                || self.enable_fragment_sampling_hack != other.enable_fragment_sampling_hack,
        }
    }
}

/// What a backend can do, detected when it is created
///
/// Backends pick between the full multi-pass compositing path and the simplified one from this
/// descriptor instead of from build-time features.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub supports_shaders: bool,
    pub supports_stencil: bool,
    pub supports_fbo: bool,
    pub supports_multisample: bool,
    pub max_samples: u32,
    pub max_workers: usize,
}

impl Capabilities {
    /// Whether the side-channel compositing passes can run
    pub fn supports_multipass(&self) -> bool {
        self.supports_shaders && self.supports_stencil
    }

    pub fn software(max_workers: usize) -> Self {
        Self {
            supports_shaders: true,
            supports_stencil: true,
            supports_fbo: true,
            supports_multisample: false,
            max_samples: 1,
            max_workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = RenderSettings::default();
        assert!(settings.emulate_shadow_polygon);
        assert!(settings.enable_edge_mark);
        assert!(!settings.enable_fragment_sampling_hack);
        assert_eq!(settings.thread_count, 0);
    }

    #[test]
    fn test_settings_serialization() {
        let settings = RenderSettings {
            thread_count: 4,
            enable_fog: false,
            ..Default::default()
        };
        let json = serde_json::to_string(&settings).expect("Failed to serialize");
        let deserialized: RenderSettings =
            serde_json::from_str(&json).expect("Failed to deserialize");
        assert_eq!(deserialized, settings);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let settings: RenderSettings =
            serde_json::from_str(r#"{"thread_count": 2}"#).expect("Failed to deserialize");
        assert_eq!(settings.thread_count, 2);
        assert!(settings.enable_textures);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let settings = RenderSettings::load("/nonexistent/render_settings.json");
        assert_eq!(settings, RenderSettings::default());
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!(
            "emu_nds3d_settings_{}.json",
            std::process::id()
        ));
        let settings = RenderSettings {
            multisample_size: 4,
            ..Default::default()
        };
        settings.save(&path).expect("Failed to save");
        assert_eq!(RenderSettings::load(&path), settings);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_thread_count_clamped() {
        let settings = RenderSettings {
            thread_count: 100,
            ..Default::default()
        };
        assert_eq!(settings.resolved_thread_count(), MAX_RENDER_THREADS);
        assert!(RenderSettings::default().resolved_thread_count() >= 1);
    }

    #[test]
    fn test_diff_only_flags_changed_groups() {
        let a = RenderSettings {
            thread_count: 2,
            ..Default::default()
        };
        assert!(!a.diff(&a.clone()).any());

        let b = RenderSettings {
            emulate_shadow_polygon: false,
            ..a.clone()
        };
        let diff = a.diff(&b);
        assert!(diff.emulation);
        assert!(!diff.thread_count);
        assert!(!diff.postprocess);
    }
}
