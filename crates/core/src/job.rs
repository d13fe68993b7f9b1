use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::design::Design;
use crate::error::{JobError, JobResult};

/// The closed set of jobs the orchestrator runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Flatlay,
    Showcase,
    Runway,
    ApplyChange,
}

/// What kind of file a job produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Extensions accepted in worker "Saved" lines, preferred one first.
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            MediaKind::Image => &["png", "jpg", "jpeg", "webp"],
            MediaKind::Video => &["mp4", "webm", "mov"],
        }
    }

    pub fn default_extension(self) -> &'static str {
        self.extensions()[0]
    }
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Flatlay => "flatlay",
            JobKind::Showcase => "showcase",
            JobKind::Runway => "runway",
            JobKind::ApplyChange => "apply_change",
        }
    }

    /// `None` for jobs that rewrite the design instead of producing media.
    pub fn media(self) -> Option<MediaKind> {
        match self {
            JobKind::Flatlay | JobKind::Showcase => Some(MediaKind::Image),
            JobKind::Runway => Some(MediaKind::Video),
            JobKind::ApplyChange => None,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Model attributes in the fixed schema the generation workers expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelConfig {
    pub gender: String,
    pub age_range: String,
    pub body_type: String,
    pub skin_tone: String,
    pub pose: String,
    pub framing: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            gender: "female".to_string(),
            age_range: "25-32".to_string(),
            body_type: "slim".to_string(),
            skin_tone: "medium-dark".to_string(),
            pose: "standing, natural fashion pose".to_string(),
            framing: "full-body, studio frame, no close-ups".to_string(),
        }
    }
}

impl ModelConfig {
    /// Normalizes a loosely keyed mapping. Both snake_case and camelCase keys
    /// are accepted; blank or missing fields keep their defaults.
    pub fn from_map(raw: &Map<String, Value>) -> Self {
        let mut config = Self::default();
        let pick = |keys: &[&str]| -> Option<String> {
            keys.iter().find_map(|key| match raw.get(*key)? {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(b) => Some(b.to_string()),
                _ => None,
            })
        };

        if let Some(v) = pick(&["gender"]) {
            config.gender = v;
        }
        if let Some(v) = pick(&["age_range", "ageRange"]) {
            config.age_range = v;
        }
        if let Some(v) = pick(&["body_type", "bodyType"]) {
            config.body_type = v;
        }
        if let Some(v) = pick(&["skin_tone", "skinTone"]) {
            config.skin_tone = v;
        }
        if let Some(v) = pick(&["pose"]) {
            config.pose = v;
        }
        if let Some(v) = pick(&["framing"]) {
            config.framing = v;
        }
        config
    }

    pub fn to_json(&self) -> String {
        // Plain string fields cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// A validated flatlay / showcase / runway request.
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub kind: JobKind,
    pub design: Design,
    pub design_id: String,
    pub model_config: Option<ModelConfig>,
    pub reference: Option<String>,
}

impl RenderJob {
    /// Validates a request body before anything touches the filesystem.
    pub fn from_body(kind: JobKind, body: &Value) -> JobResult<Self> {
        if kind == JobKind::ApplyChange {
            return Err(JobError::Validation(
                "apply_change is not a render job".to_string(),
            ));
        }

        let design = design_field(body)?;
        let design_id = design
            .design_id()
            .ok_or_else(|| JobError::Validation("missing design.design_id".to_string()))?;

        let model_config = match body.get("modelConfig").or_else(|| body.get("model_attrs")) {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(ModelConfig::from_map(map)),
            Some(_) => {
                return Err(JobError::Validation(
                    "modelConfig must be an object".to_string(),
                ))
            }
        };

        let reference = body
            .get("reference")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Ok(Self {
            kind,
            design,
            design_id,
            model_config,
            reference,
        })
    }
}

/// A validated apply-change request.
#[derive(Debug, Clone)]
pub struct ChangeJob {
    pub design: Design,
    pub text_change: String,
}

impl ChangeJob {
    pub fn from_body(body: &Value) -> JobResult<Self> {
        let design = design_field(body)?;
        let text_change = body
            .get("textChange")
            .or_else(|| body.get("changeText"))
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| JobError::Validation("missing textChange".to_string()))?
            .to_string();

        Ok(Self {
            design,
            text_change,
        })
    }
}

fn design_field(body: &Value) -> JobResult<Design> {
    match body.get("design") {
        None | Some(Value::Null) => Err(JobError::Validation("missing design".to_string())),
        Some(value) => Design::from_value(value.clone())
            .ok_or_else(|| JobError::Validation("design must be an object".to_string())),
    }
}
