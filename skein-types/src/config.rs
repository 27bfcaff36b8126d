//! Configuration of a skein run, loaded from a YAML settings file.

use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("serde_yaml error: {source}")]
    SerdeYaml {
        #[from]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration field `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

fn invalid(field: &'static str, reason: &'static str) -> ConfigError {
    ConfigError::Invalid { field, reason }
}

fn default_fps() -> f64 {
    30.0
}

fn default_n_features() -> usize {
    1000
}

fn default_scale_factor() -> f64 {
    1.2
}

fn default_n_levels() -> usize {
    8
}

fn default_ini_fast_threshold() -> u8 {
    20
}

fn default_min_fast_threshold() -> u8 {
    7
}

/// Camera intrinsics, image geometry and Brown-Conrady distortion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraConfig {
    #[serde(default = "default_fps")]
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    #[serde(default)]
    pub k1: f64,
    #[serde(default)]
    pub k2: f64,
    #[serde(default)]
    pub p1: f64,
    #[serde(default)]
    pub p2: f64,
    #[serde(default)]
    pub k3: f64,
    /// When set, images are assumed already rectified and the distortion
    /// coefficients are ignored.
    #[serde(default)]
    pub fisheye: bool,
}

impl CameraConfig {
    pub fn distortion_vec(&self) -> [f64; 5] {
        if self.fisheye {
            [0.0; 5]
        } else {
            [self.k1, self.k2, self.p1, self.p2, self.k3]
        }
    }
}

/// Parameters handed to the external ORB extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrbConfig {
    #[serde(default = "default_n_features")]
    pub n_features: usize,
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,
    #[serde(default = "default_n_levels")]
    pub n_levels: usize,
    #[serde(default = "default_ini_fast_threshold")]
    pub ini_fast_threshold: u8,
    #[serde(default = "default_min_fast_threshold")]
    pub min_fast_threshold: u8,
}

impl Default for OrbConfig {
    fn default() -> Self {
        Self {
            n_features: default_n_features(),
            scale_factor: default_scale_factor(),
            n_levels: default_n_levels(),
            ini_fast_threshold: default_ini_fast_threshold(),
            min_fast_threshold: default_min_fast_threshold(),
        }
    }
}

/// Keyframe insertion throttling. `max_frames` defaults to the camera fps
/// (one keyframe per second at most, absent other pressure).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackerConfig {
    #[serde(default)]
    pub min_frames: Option<u64>,
    #[serde(default)]
    pub max_frames: Option<u64>,
}

/// Viewer cosmetics. Parsed for compatibility with full settings files; the
/// engine itself never reads them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ViewerConfig {
    #[serde(default)]
    pub keyframe_size: f64,
    #[serde(default)]
    pub keyframe_line_width: f64,
    #[serde(default)]
    pub graph_line_width: f64,
    #[serde(default)]
    pub point_size: f64,
    #[serde(default)]
    pub camera_size: f64,
    #[serde(default)]
    pub camera_line_width: f64,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            keyframe_size: 0.05,
            keyframe_line_width: 1.0,
            graph_line_width: 0.9,
            point_size: 2.0,
            camera_size: 0.08,
            camera_line_width: 3.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlamConfig {
    pub camera: CameraConfig,
    #[serde(default)]
    pub orb: OrbConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub viewer: ViewerConfig,
}

impl SlamConfig {
    /// Frames that must pass between keyframe insertions.
    pub fn min_frames(&self) -> u64 {
        self.tracker.min_frames.unwrap_or(0)
    }

    /// Frames after which a keyframe is inserted regardless of backpressure.
    pub fn max_frames(&self) -> u64 {
        self.tracker
            .max_frames
            .unwrap_or_else(|| self.camera.fps.round().max(1.0) as u64)
    }

    /// Startup validation. Any failure here is fatal: the engine refuses to
    /// start on a corrupt configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.camera;
        if !(c.fps.is_finite() && c.fps > 0.0) {
            return Err(invalid("camera.fps", "must be finite and positive"));
        }
        if c.width == 0 || c.height == 0 {
            return Err(invalid("camera.width/height", "must be non-zero"));
        }
        if !(c.fx.is_finite() && c.fx > 0.0 && c.fy.is_finite() && c.fy > 0.0) {
            return Err(invalid("camera.fx/fy", "focal length must be positive"));
        }
        if !(c.cx.is_finite() && c.cy.is_finite()) {
            return Err(invalid("camera.cx/cy", "principal point must be finite"));
        }
        if self.orb.n_features == 0 {
            return Err(invalid("orb.n_features", "must be non-zero"));
        }
        if !(self.orb.scale_factor > 1.0) {
            return Err(invalid("orb.scale_factor", "must be greater than 1"));
        }
        if self.orb.n_levels < 2 {
            return Err(invalid("orb.n_levels", "need at least 2 pyramid levels"));
        }
        if self.orb.min_fast_threshold > self.orb.ini_fast_threshold {
            return Err(invalid(
                "orb.min_fast_threshold",
                "must not exceed ini_fast_threshold",
            ));
        }
        if let (Some(min), Some(max)) = (self.tracker.min_frames, self.tracker.max_frames) {
            if min > max {
                return Err(invalid("tracker.min_frames", "must not exceed max_frames"));
            }
        }
        Ok(())
    }
}

/// Read and validate a YAML settings file.
pub fn load_config<P: AsRef<std::path::Path>>(path: P) -> Result<SlamConfig, ConfigError> {
    let buf = std::fs::read_to_string(path)?;
    let cfg: SlamConfig = serde_yaml::from_str(&buf)?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
camera:
  width: 640
  height: 480
  fx: 458.654
  fy: 457.296
  cx: 367.215
  cy: 248.375
  k1: -0.28340811
  k2: 0.07395907
  p1: 0.00019359
  p2: 1.76187114e-05
"#;

    #[test]
    fn minimal_settings_parse_with_defaults() {
        let cfg: SlamConfig = serde_yaml::from_str(MINIMAL).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.orb.n_features, 1000);
        assert_eq!(cfg.orb.n_levels, 8);
        assert_eq!(cfg.min_frames(), 0);
        assert_eq!(cfg.max_frames(), 30);
    }

    #[test]
    fn unknown_fields_are_fatal() {
        let with_typo = MINIMAL.replace("k1:", "kk1:");
        assert!(serde_yaml::from_str::<SlamConfig>(&with_typo).is_err());
    }

    #[test]
    fn validation_names_the_bad_field() {
        let mut cfg: SlamConfig = serde_yaml::from_str(MINIMAL).unwrap();
        cfg.camera.fx = -1.0;
        match cfg.validate() {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, "camera.fx/fy"),
            other => panic!("expected Invalid, got {other:?}"),
        }
        cfg.camera.fx = 458.0;
        cfg.orb.scale_factor = 1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn fisheye_flag_zeroes_distortion() {
        let mut cfg: SlamConfig = serde_yaml::from_str(MINIMAL).unwrap();
        assert!(cfg.camera.distortion_vec()[0] != 0.0);
        cfg.camera.fisheye = true;
        assert_eq!(cfg.camera.distortion_vec(), [0.0; 5]);
    }
}
