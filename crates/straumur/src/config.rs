// straumur/src/config.rs

use std::time::Duration;

use serde::{Deserialize, Serialize};
use straumur_decode::{SamplingConfig, YieldPolicy};

use crate::error::{StraumurError, StraumurResult};
use crate::prompt::PromptTemplate;

/// Top-level straumur configuration.
///
/// Loaded from straumur.toml. Every section falls back to its defaults.
///
/// Answers use a nucleus threshold of 0.95 unless the file sets `top_p` in
/// either `[generation]` or `[sampling]`; the generation value wins.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(try_from = "ConfigFile")]
pub struct StraumurConfig {
    /// Engine sampling parameters
    pub sampling: SamplingConfig,

    /// Streamed answer settings
    pub generation: GenerationSection,

    /// WebSocket server
    pub server: ServerSection,

    /// Backend scheduling
    pub backend: BackendSection,
}

impl StraumurConfig {
    /// Sampling parameters used for answers, with the generation section's
    /// nucleus threshold applied.
    pub fn answer_sampling(&self) -> StraumurResult<SamplingConfig> {
        match self.generation.top_p {
            Some(top_p) => Ok(self.sampling.with_top_p(top_p)?),
            None => Ok(self.sampling.clone()),
        }
    }

    pub fn validate(&self) -> StraumurResult<()> {
        self.answer_sampling()?;
        if self.generation.max_steps == 0 {
            return Err(StraumurError::Config(
                "generation.max_steps must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// On-disk layout. `[sampling]` stays a raw table so an explicit `top_p`
/// can be told apart from the engine default.
#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    sampling: Option<toml::Table>,
    #[serde(default)]
    generation: Option<GenerationSection>,
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    backend: BackendSection,
}

impl TryFrom<ConfigFile> for StraumurConfig {
    type Error = toml::de::Error;

    fn try_from(file: ConfigFile) -> Result<Self, Self::Error> {
        let sampling_sets_top_p = file
            .sampling
            .as_ref()
            .is_some_and(|table| table.contains_key("top_p"));
        let sampling = match file.sampling {
            Some(table) => toml::Value::Table(table).try_into()?,
            None => SamplingConfig::default(),
        };

        let mut generation = file.generation.unwrap_or_else(|| GenerationSection {
            top_p: None,
            ..GenerationSection::default()
        });
        if generation.top_p.is_none() && !sampling_sets_top_p {
            generation.top_p = default_answer_top_p();
        }

        Ok(Self {
            sampling,
            generation,
            server: file.server,
            backend: file.backend,
        })
    }
}

// =============================================================================
// Generation
// =============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerationSection {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Repeating block length that ends an answer. 0 disables the check.
    #[serde(default = "default_cycle_window")]
    pub cycle_window: usize,
    #[serde(default)]
    pub template: PromptTemplate,
    /// Nucleus threshold for answers. `None` keeps the sampling section's.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            cycle_window: default_cycle_window(),
            template: PromptTemplate::default(),
            top_p: default_answer_top_p(),
        }
    }
}

fn default_max_steps() -> usize { 2000 }
fn default_cycle_window() -> usize { 10 }
fn default_answer_top_p() -> Option<f32> { Some(0.95) }

// =============================================================================
// Server
// =============================================================================

/// What a connection does with a question that arrives while another is
/// still being answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Answer it after the current one finishes.
    #[default]
    Queue,
    /// Reply with an error and drop it.
    Reject,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub busy_policy: BusyPolicy,
}

impl ServerSection {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            busy_policy: BusyPolicy::default(),
        }
    }
}

fn default_host() -> String { "0.0.0.0".into() }
fn default_port() -> u16 { 5173 }

// =============================================================================
// Backend
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BackendSection {
    /// Pause between decode steps in milliseconds. Unset uses the device default.
    #[serde(default)]
    pub yield_ms: Option<u64>,
}

impl BackendSection {
    pub fn yield_policy(&self) -> Option<YieldPolicy> {
        self.yield_ms
            .map(|ms| YieldPolicy::new(Duration::from_millis(ms)))
    }
}
