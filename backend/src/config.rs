use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config/fundus.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub preprocess: PreprocessConfig,
    pub quality: QualityConfig,
    pub explain: ExplainConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_upload_bytes: usize,
    /// Empty means any origin.
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Native,
    Torch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub weights_path: PathBuf,
    pub backend: BackendKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    pub clahe: ClaheConfig,
    /// Sigma of the noise-reduction blur (1.1 matches a 5x5 kernel).
    pub blur_sigma: f32,
    pub unsharp_gain: f32,
    pub roi: RoiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaheConfig {
    pub clip_limit: f32,
    pub tile_grid: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoiConfig {
    pub enabled: bool,
    pub min_confidence: f32,
    pub min_radius_ratio: f32,
    pub max_radius_ratio: f32,
    pub padding_ratio: f32,
    /// Longest side of the downscaled copy the circle search runs on.
    pub working_size: u32,
    pub canny_low: f32,
    pub canny_high: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub blur_threshold: f64,
    pub dark_threshold: f64,
    pub bright_threshold: f64,
    pub low_contrast_threshold: f64,
    pub min_resolution: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplainConfig {
    /// Tried in order, first success wins. Known: `grad-cam`, `pixel-gradient`.
    pub strategies: Vec<String>,
    /// None picks the model's default layer.
    pub gradcam_layer: Option<String>,
    pub overlay_alpha: f32,
    pub contour_alpha: f32,
    pub contour_percentile: f32,
    pub coverage_threshold: f32,
    pub panel_size: u32,
    pub histogram_bins: usize,
    pub fallback_blur_sigma: f32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            max_upload_bytes: 10 * 1024 * 1024,
            cors_origins: vec![
                "http://localhost:5173".to_string(),
                "http://localhost:3000".to_string(),
            ],
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            weights_path: PathBuf::from("models/fundus_cnn.safetensors"),
            backend: BackendKind::Native,
        }
    }
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            clahe: ClaheConfig::default(),
            blur_sigma: 1.1,
            unsharp_gain: 0.5,
            roi: RoiConfig::default(),
        }
    }
}

impl Default for ClaheConfig {
    fn default() -> Self {
        Self {
            clip_limit: 2.0,
            tile_grid: 8,
        }
    }
}

impl Default for RoiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_confidence: 0.45,
            min_radius_ratio: 0.3,
            max_radius_ratio: 0.6,
            padding_ratio: 0.1,
            working_size: 128,
            canny_low: 25.0,
            canny_high: 50.0,
        }
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            blur_threshold: 100.0,
            dark_threshold: 50.0,
            bright_threshold: 200.0,
            low_contrast_threshold: 30.0,
            min_resolution: 224,
        }
    }
}

impl Default for ExplainConfig {
    fn default() -> Self {
        Self {
            strategies: vec!["grad-cam".to_string(), "pixel-gradient".to_string()],
            gradcam_layer: None,
            overlay_alpha: 0.5,
            contour_alpha: 0.3,
            contour_percentile: 0.9,
            coverage_threshold: 0.7,
            panel_size: 320,
            histogram_bins: 50,
            fallback_blur_sigma: 2.5,
        }
    }
}

impl AppConfig {
    /// Reads the YAML file when it exists, otherwise starts from defaults.
    /// Environment overrides are applied afterwards.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let config: AppConfig = serde_yaml::from_str(&config_str)?;
            log::info!("Loaded configuration from {}", path.display());
            config
        } else {
            log::warn!(
                "Config file {} not found, using built-in defaults",
                path.display()
            );
            AppConfig::default()
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(host) = std::env::var("HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("PORT={port}")))?;
        }
        if let Ok(model_path) = std::env::var("MODEL_PATH") {
            self.model.weights_path = PathBuf::from(model_path);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let roi = &self.preprocess.roi;
        if !(0.0 < roi.min_radius_ratio && roi.min_radius_ratio < roi.max_radius_ratio) {
            return Err(ConfigError::Invalid(
                "roi radius ratios must satisfy 0 < min < max".to_string(),
            ));
        }
        if !(0.0 <= roi.canny_low && roi.canny_low <= roi.canny_high) {
            return Err(ConfigError::Invalid(
                "roi canny thresholds must satisfy 0 <= low <= high".to_string(),
            ));
        }
        if roi.working_size < 16 {
            return Err(ConfigError::Invalid(
                "roi.working_size must be at least 16".to_string(),
            ));
        }
        if self.preprocess.clahe.tile_grid == 0 || self.preprocess.clahe.clip_limit <= 0.0 {
            return Err(ConfigError::Invalid(
                "clahe needs a positive tile grid and clip limit".to_string(),
            ));
        }
        let explain = &self.explain;
        if !(0.0..=1.0).contains(&explain.contour_percentile)
            || !(0.0..=1.0).contains(&explain.overlay_alpha)
            || !(0.0..=1.0).contains(&explain.contour_alpha)
        {
            return Err(ConfigError::Invalid(
                "explain alphas and percentile must lie in [0, 1]".to_string(),
            ));
        }
        if explain.panel_size < 32 || explain.histogram_bins == 0 {
            return Err(ConfigError::Invalid(
                "explain.panel_size must be >= 32 and histogram_bins > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = AppConfig::from_yaml(
            r#"
server:
  port: 8081
quality:
  blur_threshold: 80.0
explain:
  strategies: [pixel-gradient]
"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 8081);
        assert_eq!(config.server.max_upload_bytes, 10 * 1024 * 1024);
        assert_eq!(config.quality.blur_threshold, 80.0);
        assert_eq!(config.quality.dark_threshold, 50.0);
        assert_eq!(config.explain.strategies, vec!["pixel-gradient"]);
        assert_eq!(config.preprocess.clahe.tile_grid, 8);
        assert_eq!(config.model.backend, BackendKind::Native);
    }

    #[test]
    fn rejects_inverted_radius_range() {
        let err = AppConfig::from_yaml(
            r#"
preprocess:
  roi:
    min_radius_ratio: 0.7
    max_radius_ratio: 0.6
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_inverted_canny_thresholds() {
        let err = AppConfig::from_yaml(
            r#"
preprocess:
  roi:
    canny_low: 80.0
    canny_high: 20.0
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = AppConfig::load(Path::new("does/not/exist.yaml")).unwrap();
        assert_eq!(config.preprocess.unsharp_gain, 0.5);
    }
}
