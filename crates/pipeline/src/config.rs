//! Generator configuration, built once at startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::backoff::PollPolicy;

/// How the completion tracker learns about job progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingMode {
    /// Poll `/history` and `/queue` with backoff.
    Poll,
    /// Listen on the ComfyUI WebSocket, polling only if it drops.
    Push,
}

impl FromStr for TrackingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "poll" => Ok(TrackingMode::Poll),
            "push" | "websocket" | "ws" => Ok(TrackingMode::Push),
            other => Err(format!("expected 'poll' or 'push', got '{other}'")),
        }
    }
}

/// Errors raised while reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("{var}='{value}' is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Generator configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub comfyui_host: String,
    pub comfyui_port: u16,
    /// Directory persisted images are written to.
    pub output_dir: PathBuf,
    /// Public base URL the output directory is served under, no trailing `/`.
    pub image_base_url: String,
    /// Workflow file stem under `{working_dir}/workflows/`.
    pub workflow_name: String,
    pub working_dir: PathBuf,
    pub tracking: TrackingMode,
    pub poll: PollPolicy,
    /// Overall deadline for one job, measured from submission.
    pub timeout: Duration,
    /// Ask the engine to drop a job whose local wait timed out.
    pub cancel_on_timeout: bool,
    /// Write the prompt to a `.txt` file next to each image.
    pub write_prompt_sidecar: bool,
}

impl GeneratorConfig {
    /// Load configuration from environment variables.
    ///
    /// | Env Var                   | Default        |
    /// |---------------------------|----------------|
    /// | `COMFYUI_HOST`            | required       |
    /// | `COMFYUI_PORT`            | required       |
    /// | `OUTPUT_DIR`              | required       |
    /// | `IMAGE_APP_BASE_URL`      | required       |
    /// | `COMFYUI_WORKFLOW_NAME`   | required       |
    /// | `WORKING_DIR`             | `.`            |
    /// | `COMFYUI_TRACKING`        | `poll`         |
    /// | `POLL_INITIAL_MS`         | `500`          |
    /// | `POLL_MAX_MS`             | `5000`         |
    /// | `POLL_MULTIPLIER`         | `1.5`          |
    /// | `GENERATION_TIMEOUT_SECS` | `600`          |
    /// | `CANCEL_ON_TIMEOUT`       | `false`        |
    /// | `WRITE_PROMPT_SIDECAR`    | `true`         |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let poll = PollPolicy {
            initial_interval: Duration::from_millis(env.parse_or("POLL_INITIAL_MS", 500u64)?),
            max_interval: Duration::from_millis(env.parse_or("POLL_MAX_MS", 5000u64)?),
            multiplier: env.parse_or("POLL_MULTIPLIER", 1.5f64)?,
        };
        poll.validate().map_err(|reason| ConfigError::Invalid {
            var: "POLL_INITIAL_MS/POLL_MAX_MS/POLL_MULTIPLIER",
            value: format!(
                "{}ms..{}ms x{}",
                poll.initial_interval.as_millis(),
                poll.max_interval.as_millis(),
                poll.multiplier
            ),
            reason,
        })?;

        let timeout_secs: u64 = env.parse_or("GENERATION_TIMEOUT_SECS", 600)?;
        if timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "GENERATION_TIMEOUT_SECS",
                value: "0".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        Ok(Self {
            comfyui_host: env.required("COMFYUI_HOST")?,
            comfyui_port: env.required_parse("COMFYUI_PORT")?,
            output_dir: PathBuf::from(env.required("OUTPUT_DIR")?),
            image_base_url: env
                .required("IMAGE_APP_BASE_URL")?
                .trim_end_matches('/')
                .to_string(),
            workflow_name: env.required("COMFYUI_WORKFLOW_NAME")?,
            working_dir: env
                .optional("WORKING_DIR")
                .map_or_else(|| PathBuf::from("."), PathBuf::from),
            tracking: env.parse_or("COMFYUI_TRACKING", TrackingMode::Poll)?,
            poll,
            timeout: Duration::from_secs(timeout_secs),
            cancel_on_timeout: env.flag_or("CANCEL_ON_TIMEOUT", false)?,
            write_prompt_sidecar: env.flag_or("WRITE_PROMPT_SIDECAR", true)?,
        })
    }

    /// Directory holding workflow templates and manifests.
    pub fn workflows_dir(&self) -> PathBuf {
        self.working_dir.join("workflows")
    }
}

// ---- lookup helpers ----

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn optional(&self, var: &'static str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, var: &'static str) -> Result<String, ConfigError> {
        self.optional(var).ok_or(ConfigError::Missing(var))
    }

    fn required_parse<T>(&self, var: &'static str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let value = self.required(var)?;
        parse(var, value)
    }

    fn parse_or<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(var) {
            Some(value) => parse(var, value),
            None => Ok(default),
        }
    }

    fn flag_or(&self, var: &'static str, default: bool) -> Result<bool, ConfigError> {
        let Some(value) = self.optional(var) else {
            return Ok(default);
        };
        match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                var,
                value,
                reason: "expected true or false".to_string(),
            }),
        }
    }
}

fn parse<T>(var: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        reason: e.to_string(),
        value,
    })
}
