use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::IngestSettings;
use crate::matcher::MatchPolicy;

const DEFAULT_DB_PATH: &str = "illegal_vehicles.db";
const DEFAULT_EVIDENCE_DIR: &str = "captures";
const DEFAULT_SOURCE_URL: &str = "stub://road";
const DEFAULT_SOURCE_LABEL: &str = "synthetic";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8799";
const DEFAULT_ANALYSIS_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_ANALYSIS_MODEL: &str = "gpt-4o-mini";
const DEFAULT_ANALYSIS_PROMPT: &str = "This image was captured from a traffic camera because the vehicle in it \
was flagged as overloaded. Describe the vehicle, its cargo and why the load looks unsafe. \
Start with a one-line summary.";
const DEFAULT_CATALOG_ENDPOINT: &str = "https://openapi.its.go.kr:9443/cctvInfo";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub db_path: String,
    pub evidence_dir: PathBuf,
    pub source: SourceSettings,
    pub detection: DetectionSettings,
    pub tracking: TrackingSettings,
    pub matcher: MatcherSettings,
    pub evidence: EvidenceSettings,
    pub analysis: AnalysisSettings,
    pub api: ApiSettings,
    pub catalog: CatalogSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub url: String,
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    /// `stub` or `tract`.
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub confidence_threshold: f32,
    pub violation_classes: Vec<String>,
    /// Label for each model class id.
    pub class_names: Vec<String>,
    pub input_width: u32,
    pub input_height: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackingSettings {
    pub iou_threshold: f32,
    pub max_age: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatcherSettings {
    pub policy: MatchPolicy,
    pub min_score: f32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvidenceSettings {
    pub margin: f32,
    /// 0 or 1 disables enhancement.
    pub upscale_factor: u32,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    /// Analysis is disabled while unset.
    pub endpoint: Option<String>,
    pub model: String,
    pub api_key: Option<String>,
    pub prompt: String,
    pub max_attempts: u32,
    pub yield_ms: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub enabled: bool,
    pub addr: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CatalogSettings {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            evidence_dir: PathBuf::from(DEFAULT_EVIDENCE_DIR),
            source: SourceSettings::default(),
            detection: DetectionSettings::default(),
            tracking: TrackingSettings::default(),
            matcher: MatcherSettings::default(),
            evidence: EvidenceSettings::default(),
            analysis: AnalysisSettings::default(),
            api: ApiSettings::default(),
            catalog: CatalogSettings::default(),
        }
    }
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_SOURCE_URL.to_string(),
            label: DEFAULT_SOURCE_LABEL.to_string(),
            width: 640,
            height: 480,
            target_fps: 10,
        }
    }
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            backend: "stub".to_string(),
            model_path: None,
            confidence_threshold: 0.5,
            violation_classes: vec!["illegal".to_string()],
            class_names: vec!["vehicle".to_string(), "illegal".to_string()],
            input_width: 640,
            input_height: 640,
        }
    }
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            iou_threshold: crate::track::DEFAULT_IOU_THRESHOLD,
            max_age: crate::track::DEFAULT_MAX_AGE,
        }
    }
}

impl Default for MatcherSettings {
    fn default() -> Self {
        Self {
            policy: MatchPolicy::Iou,
            min_score: crate::matcher::DEFAULT_MIN_SCORE,
        }
    }
}

impl Default for EvidenceSettings {
    fn default() -> Self {
        Self {
            margin: crate::evidence::DEFAULT_MARGIN,
            upscale_factor: 4,
            jpeg_quality: crate::evidence::DEFAULT_JPEG_QUALITY,
        }
    }
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: DEFAULT_ANALYSIS_MODEL.to_string(),
            api_key: None,
            prompt: DEFAULT_ANALYSIS_PROMPT.to_string(),
            max_attempts: 3,
            yield_ms: 100,
            timeout_secs: 60,
        }
    }
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: DEFAULT_API_ADDR.to_string(),
        }
    }
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_CATALOG_ENDPOINT.to_string(),
            api_key: None,
            min_x: 126.8,
            max_x: 127.2,
            min_y: 37.4,
            max_y: 37.7,
        }
    }
}

impl SourceSettings {
    pub fn ingest(&self) -> IngestSettings {
        IngestSettings {
            width: self.width,
            height: self.height,
            target_fps: self.target_fps,
        }
    }
}

impl AnalysisSettings {
    pub fn yield_interval(&self) -> Duration {
        Duration::from_millis(self.yield_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl AppConfig {
    /// Read `OVERLOAD_CONFIG` (optional JSON file), apply `OVERLOAD_*` overrides, validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("OVERLOAD_CONFIG").ok();
        let mut cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => read_config_file(Path::new(path))?,
            _ => Self::default(),
        };
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse and validate a JSON document without consulting the environment.
    pub fn from_json(raw: &str) -> Result<Self> {
        let mut cfg: Self =
            serde_json::from_str(raw).map_err(|e| anyhow!("invalid config: {}", e))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_string("OVERLOAD_DB_PATH") {
            self.db_path = v;
        }
        if let Some(v) = env_string("OVERLOAD_EVIDENCE_DIR") {
            self.evidence_dir = PathBuf::from(v);
        }
        if let Some(v) = env_string("OVERLOAD_SOURCE_URL") {
            self.source.url = v;
        }
        if let Some(v) = env_string("OVERLOAD_SOURCE_LABEL") {
            self.source.label = v;
        }
        if let Some(v) = env_parse::<u32>("OVERLOAD_TARGET_FPS")? {
            self.source.target_fps = v;
        }
        if let Some(v) = env_string("OVERLOAD_DETECTOR") {
            self.detection.backend = v;
        }
        if let Some(v) = env_string("OVERLOAD_MODEL_PATH") {
            self.detection.model_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env_parse::<f32>("OVERLOAD_CONFIDENCE")? {
            self.detection.confidence_threshold = v;
        }
        if let Some(v) = env_string("OVERLOAD_VIOLATION_CLASSES") {
            let parsed = split_csv(&v);
            if !parsed.is_empty() {
                self.detection.violation_classes = parsed;
            }
        }
        if let Some(v) = env_string("OVERLOAD_ANALYSIS_ENDPOINT") {
            self.analysis.endpoint = Some(v);
        }
        if let Some(v) = env_string("OVERLOAD_ANALYSIS_MODEL") {
            self.analysis.model = v;
        }
        if let Some(v) = env_string("OVERLOAD_ANALYSIS_API_KEY") {
            self.analysis.api_key = Some(v);
        }
        if let Some(v) = env_string("OVERLOAD_API_ADDR") {
            self.api.addr = v;
            self.api.enabled = true;
        }
        if let Some(v) = env_string("OVERLOAD_CATALOG_API_KEY") {
            self.catalog.api_key = Some(v);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        if self.source.label.trim().is_empty() {
            return Err(anyhow!("source.label must not be empty"));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!("source.width and source.height must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            return Err(anyhow!("detection.confidence_threshold must be within 0..=1"));
        }
        self.detection.violation_classes = self
            .detection
            .violation_classes
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if self.detection.violation_classes.is_empty() {
            return Err(anyhow!("detection.violation_classes must name at least one class"));
        }
        if self.detection.backend == "tract" && self.detection.model_path.is_none() {
            return Err(anyhow!("detection.model_path is required for the tract backend"));
        }
        if !(0.0..=1.0).contains(&self.tracking.iou_threshold) {
            return Err(anyhow!("tracking.iou_threshold must be within 0..=1"));
        }
        if !(0.0..=1.0).contains(&self.matcher.min_score) {
            return Err(anyhow!("matcher.min_score must be within 0..=1"));
        }
        if !(0.0..1.0).contains(&self.evidence.margin) {
            return Err(anyhow!("evidence.margin must be within 0..1"));
        }
        if self.evidence.jpeg_quality == 0 || self.evidence.jpeg_quality > 100 {
            return Err(anyhow!("evidence.jpeg_quality must be within 1..=100"));
        }
        // A key alone selects the hosted chat-completions endpoint.
        if self.analysis.endpoint.is_none() && self.analysis.api_key.is_some() {
            self.analysis.endpoint = Some(DEFAULT_ANALYSIS_ENDPOINT.to_string());
        }
        if self.analysis.max_attempts == 0 {
            return Err(anyhow!("analysis.max_attempts must be greater than zero"));
        }
        if self.api.enabled {
            let addr: SocketAddr = self
                .api
                .addr
                .parse()
                .map_err(|_| anyhow!("api.addr must be an ip:port socket address"))?;
            if !addr.ip().is_loopback() {
                return Err(anyhow!("api.addr must bind to a loopback address"));
            }
        }
        if self.catalog.min_x >= self.catalog.max_x || self.catalog.min_y >= self.catalog.max_y {
            return Err(anyhow!("catalog bounding box is empty"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<AppConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value: {}", key, raw)),
        None => Ok(None),
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() -> Result<()> {
        let cfg = AppConfig::from_json("{}")?;
        assert_eq!(cfg.db_path, DEFAULT_DB_PATH);
        assert_eq!(cfg.source.url, DEFAULT_SOURCE_URL);
        assert_eq!(cfg.detection.confidence_threshold, 0.5);
        assert_eq!(cfg.detection.violation_classes, vec!["illegal"]);
        assert_eq!(cfg.matcher.policy, MatchPolicy::Iou);
        assert_eq!(cfg.evidence.jpeg_quality, 95);
        assert_eq!(cfg.analysis.max_attempts, 3);
        assert!(cfg.analysis.endpoint.is_none());
        assert!(!cfg.api.enabled);
        Ok(())
    }

    #[test]
    fn partial_sections_keep_other_defaults() -> Result<()> {
        let cfg = AppConfig::from_json(
            r#"{"matcher": {"policy": "center_distance"}, "source": {"label": "gate-3"}}"#,
        )?;
        assert_eq!(cfg.matcher.policy, MatchPolicy::CenterDistance);
        assert_eq!(cfg.matcher.min_score, crate::matcher::DEFAULT_MIN_SCORE);
        assert_eq!(cfg.source.label, "gate-3");
        assert_eq!(cfg.source.width, 640);
        Ok(())
    }

    #[test]
    fn api_key_without_endpoint_uses_default_endpoint() -> Result<()> {
        let cfg = AppConfig::from_json(r#"{"analysis": {"api_key": "sk-test"}}"#)?;
        assert_eq!(cfg.analysis.endpoint.as_deref(), Some(DEFAULT_ANALYSIS_ENDPOINT));
        Ok(())
    }

    #[test]
    fn rejects_public_api_bind() {
        let err = AppConfig::from_json(r#"{"api": {"enabled": true, "addr": "0.0.0.0:8799"}}"#)
            .expect_err("public bind must be rejected");
        assert!(err.to_string().contains("loopback"));
    }

    #[test]
    fn rejects_out_of_range_values() {
        for doc in [
            r#"{"detection": {"confidence_threshold": 1.5}}"#,
            r#"{"detection": {"violation_classes": [" "]}}"#,
            r#"{"detection": {"backend": "tract"}}"#,
            r#"{"evidence": {"jpeg_quality": 0}}"#,
            r#"{"analysis": {"max_attempts": 0}}"#,
        ] {
            assert!(AppConfig::from_json(doc).is_err(), "{}", doc);
        }
    }
}
