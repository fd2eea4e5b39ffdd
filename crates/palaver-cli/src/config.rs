use std::path::Path;

use anyhow::{Context, Result};
use palaver_provider::ProviderConfig;
use palaver_schema::{Experiment, ExperimentChannel, ExperimentRoute};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_store_path")]
    pub store_path: String,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub speech_providers: Vec<SpeechConfig>,
    #[serde(default)]
    pub assistant: Option<AssistantConfig>,
    pub experiments: Vec<Experiment>,
    pub channels: Vec<ExperimentChannel>,
    #[serde(default)]
    pub routes: Vec<ExperimentRoute>,
}

fn default_store_path() -> String {
    "palaver.db".into()
}

#[derive(Debug, Deserialize)]
pub struct SpeechConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: SpeechKind,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SpeechKind {
    OpenAI,
    Stub,
}

#[derive(Debug, Deserialize)]
pub struct AssistantConfig {
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for channel in &self.channels {
            if !self.experiments.iter().any(|e| e.id == channel.experiment_id) {
                anyhow::bail!(
                    "channel {} references unknown experiment {}",
                    channel.id,
                    channel.experiment_id
                );
            }
        }
        for experiment in &self.experiments {
            if !self.providers.iter().any(|p| p.id == experiment.llm_provider) {
                anyhow::bail!(
                    "experiment {} references unknown llm provider {}",
                    experiment.id,
                    experiment.llm_provider
                );
            }
            if let Some(voice) = &experiment.voice {
                if !self.speech_providers.iter().any(|s| s.id == voice.provider) {
                    anyhow::bail!(
                        "experiment {} references unknown speech provider {}",
                        experiment.id,
                        voice.provider
                    );
                }
            }
            if experiment.conversational_consent_enabled && experiment.consent_form.is_none() {
                anyhow::bail!(
                    "experiment {} enables conversational consent without a consent form",
                    experiment.id
                );
            }
            if experiment.assistant_id.is_some() && self.assistant.is_none() {
                anyhow::bail!(
                    "experiment {} references an assistant but no assistant credentials are configured",
                    experiment.id
                );
            }
        }
        Ok(())
    }
}
