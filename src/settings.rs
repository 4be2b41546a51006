use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::layout::PageSize;
use crate::task::DEFAULT_EVENT_CAPACITY;

const DEFAULT_SETTINGS_TOML: &str = include_str!("../settings.toml");

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub analysis_timeout: Duration,
    pub block_delay: Duration,
    pub event_capacity: usize,
    pub page: PageSize,
    pub pdf_scale: f32,
    pub jpeg_quality: u8,
    pub model: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            analysis_timeout: Duration::from_secs(120),
            block_delay: Duration::ZERO,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            page: PageSize::A4,
            pdf_scale: 2.0,
            jpeg_quality: 95,
            model: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    pipeline: Option<PipelineSettings>,
    page: Option<PageSettings>,
    preview: Option<PreviewSettings>,
    provider: Option<ProviderSettings>,
}

#[derive(Debug, Default, Deserialize)]
struct PipelineSettings {
    analysis_timeout_secs: Option<u64>,
    block_delay_ms: Option<u64>,
    event_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct PageSettings {
    width_pt: Option<f32>,
    height_pt: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct PreviewSettings {
    pdf_scale: Option<f32>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Default, Deserialize)]
struct ProviderSettings {
    model: Option<String>,
}

pub fn load_settings(extra_path: Option<&Path>) -> Result<Settings> {
    let mut settings = Settings::default();
    ensure_home_settings_file()?;

    let mut ordered_paths = vec![
        PathBuf::from("settings.toml"),
        PathBuf::from("settings.local.toml"),
    ];

    if let Some(home) = home_dir() {
        ordered_paths.push(home.join("settings.toml"));
        ordered_paths.push(home.join("settings.local.toml"));
    }

    if let Some(extra) = extra_path {
        if !extra.exists() {
            return Err(anyhow!("settings file not found: {}", extra.display()));
        }
        ordered_paths.push(extra.to_path_buf());
    }

    for path in ordered_paths {
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read settings: {}", path.display()))?;
            settings
                .merge_toml(&content)
                .with_context(|| format!("failed to parse settings: {}", path.display()))?;
        }
    }

    Ok(settings)
}

impl Settings {
    pub fn merge_toml(&mut self, content: &str) -> Result<()> {
        let parsed: SettingsFile = toml::from_str(content)?;
        self.merge(parsed);
        Ok(())
    }

    fn merge(&mut self, incoming: SettingsFile) {
        if let Some(pipeline) = incoming.pipeline {
            if let Some(secs) = pipeline.analysis_timeout_secs
                && secs > 0
            {
                self.analysis_timeout = Duration::from_secs(secs);
            }
            if let Some(ms) = pipeline.block_delay_ms {
                self.block_delay = Duration::from_millis(ms);
            }
            if let Some(capacity) = pipeline.event_capacity
                && capacity > 0
            {
                self.event_capacity = capacity;
            }
        }
        if let Some(page) = incoming.page {
            if let Some(width) = page.width_pt
                && width > 0.0
            {
                self.page.width_pt = width;
            }
            if let Some(height) = page.height_pt
                && height > 0.0
            {
                self.page.height_pt = height;
            }
        }
        if let Some(preview) = incoming.preview {
            if let Some(scale) = preview.pdf_scale
                && scale > 0.0
            {
                self.pdf_scale = scale;
            }
            if let Some(quality) = preview.jpeg_quality {
                self.jpeg_quality = quality.clamp(1, 100);
            }
        }
        if let Some(provider) = incoming.provider
            && let Some(model) = provider.model
            && !model.trim().is_empty()
        {
            self.model = Some(model);
        }
    }
}

fn ensure_home_settings_file() -> Result<()> {
    let Some(home) = home_dir() else {
        return Ok(());
    };
    fs::create_dir_all(&home)
        .with_context(|| format!("failed to create settings directory: {}", home.display()))?;
    let path = home.join("settings.toml");
    if !path.exists() {
        fs::write(&path, DEFAULT_SETTINGS_TOML)
            .with_context(|| format!("failed to write settings: {}", path.display()))?;
    }
    Ok(())
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().and_then(|home| {
        let home = home.trim();
        if home.is_empty() {
            None
        } else {
            Some(Path::new(home).join(".page-translator"))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::with_temp_home;

    #[test]
    fn bundled_defaults_match_builtin_defaults() {
        let mut settings = Settings::default();
        settings.merge_toml(DEFAULT_SETTINGS_TOML).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn merge_overrides_only_valid_values() {
        let mut settings = Settings::default();
        settings
            .merge_toml(
                r#"
[pipeline]
analysis_timeout_secs = 0
block_delay_ms = 250

[page]
width_pt = 612
height_pt = -1

[preview]
jpeg_quality = 150

[provider]
model = "openai:gpt-4o"
"#,
            )
            .unwrap();
        assert_eq!(settings.analysis_timeout, Duration::from_secs(120));
        assert_eq!(settings.block_delay, Duration::from_millis(250));
        assert_eq!(settings.page.width_pt, 612.0);
        assert_eq!(settings.page.height_pt, 842.0);
        assert_eq!(settings.jpeg_quality, 100);
        assert_eq!(settings.model.as_deref(), Some("openai:gpt-4o"));
    }

    #[test]
    fn extra_settings_path_is_applied_last() {
        with_temp_home(|home| {
            let extra = home.join("extra.toml");
            fs::write(&extra, "[pipeline]\nanalysis_timeout_secs = 7\n").unwrap();
            let settings = load_settings(Some(&extra)).unwrap();
            assert_eq!(settings.analysis_timeout, Duration::from_secs(7));
            assert!(home.join(".page-translator").join("settings.toml").exists());
        });
    }

    #[test]
    fn missing_extra_settings_path_is_an_error() {
        with_temp_home(|home| {
            let err = load_settings(Some(&home.join("missing.toml"))).unwrap_err();
            assert!(err.to_string().contains("settings file not found"));
        });
    }
}
