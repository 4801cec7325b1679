use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::ClientError;

/// Closed set of categories the analysis job scores every clip against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Neutral,
    Anger,
    Sadness,
    Frustration,
    Excited,
    Happiness,
}

impl Emotion {
    /// All categories in declaration order.
    pub const ALL: [Emotion; 6] = [
        Emotion::Neutral,
        Emotion::Anger,
        Emotion::Sadness,
        Emotion::Frustration,
        Emotion::Excited,
        Emotion::Happiness,
    ];

    /// Wire name (lowercase).
    pub fn as_str(self) -> &'static str {
        match self {
            Emotion::Neutral => "neutral",
            Emotion::Anger => "anger",
            Emotion::Sadness => "sadness",
            Emotion::Frustration => "frustration",
            Emotion::Excited => "excited",
            Emotion::Happiness => "happiness",
        }
    }

    /// Capitalised name for presentation.
    pub fn display_name(self) -> &'static str {
        match self {
            Emotion::Neutral => "Neutral",
            Emotion::Anger => "Anger",
            Emotion::Sadness => "Sadness",
            Emotion::Frustration => "Frustration",
            Emotion::Excited => "Excited",
            Emotion::Happiness => "Happiness",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Emotion {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let needle = value.trim().to_ascii_lowercase();
        Emotion::ALL
            .into_iter()
            .find(|e| e.as_str() == needle)
            .ok_or_else(|| format!("unknown emotion category `{value}`"))
    }
}

/// Category scores, each in `[0, 1]`.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct EmotionScores(BTreeMap<Emotion, f64>);

impl EmotionScores {
    /// Builds a score map, rejecting values outside `[0, 1]`.
    pub fn try_from_pairs(
        pairs: impl IntoIterator<Item = (Emotion, f64)>,
    ) -> Result<Self, String> {
        let mut map = BTreeMap::new();
        for (emotion, score) in pairs {
            if !score.is_finite() || !(0.0..=1.0).contains(&score) {
                return Err(format!("score for {emotion} out of range: {score}"));
            }
            map.insert(emotion, score);
        }
        Ok(Self(map))
    }

    /// Parses a wire map of category name to score.
    pub(crate) fn from_wire(raw: &BTreeMap<String, f64>) -> Result<Self, String> {
        let mut pairs = Vec::with_capacity(raw.len());
        for (name, score) in raw {
            pairs.push((name.parse::<Emotion>()?, *score));
        }
        Self::try_from_pairs(pairs)
    }

    pub fn get(&self, emotion: Emotion) -> Option<f64> {
        self.0.get(&emotion).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Emotion, f64)> + '_ {
        self.0.iter().map(|(e, s)| (*e, *s))
    }

    /// Highest-scoring category.
    ///
    /// Starts from `(Neutral, 0.0)` and only moves on a strictly greater score,
    /// so an empty or all-zero map reports neutral.
    pub fn dominant(&self) -> (Emotion, f64) {
        let mut best = (Emotion::Neutral, 0.0);
        for (emotion, score) in self.iter() {
            if score > best.1 {
                best = (emotion, score);
            }
        }
        best
    }

    /// Categories sorted by descending score.
    pub fn ranked(&self) -> Vec<(Emotion, f64)> {
        let mut entries: Vec<_> = self.iter().collect();
        entries.sort_by(|a, b| b.1.total_cmp(&a.1));
        entries
    }
}

/// Job-wide summary delivered with the completion event.
pub type Aggregate = EmotionScores;

/// Renderer-only clip metadata carried alongside a result.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ClipMetadata {
    #[serde(default, alias = "start_time", skip_serializing_if = "Option::is_none")]
    pub start: Option<f64>,
    #[serde(default, alias = "end_time", skip_serializing_if = "Option::is_none")]
    pub end: Option<f64>,
    #[serde(default, alias = "transcript", skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, alias = "clip_path", skip_serializing_if = "Option::is_none")]
    pub media: Option<String>,
}

/// One analysed segment of the job.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PartialResult {
    /// 1-based index; equals the frame's `current`.
    pub sequence: u32,
    /// Job-wide segment count reported with this result.
    pub total: u32,
    /// Top category for this segment.
    pub label: Emotion,
    /// Score of the top category.
    pub confidence: f64,
    pub scores: EmotionScores,
    #[serde(default)]
    pub metadata: ClipMetadata,
}

/// Identifies the server-side work a session streams.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct JobHandle {
    /// Location tokens (split folders) the server reads clips from.
    pub locations: Vec<String>,
    /// Optional external id (the uploaded video's id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

impl JobHandle {
    /// Creates a handle for a single location.
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            locations: vec![location.into()],
            external_id: None,
        }
    }

    /// Adds another location token.
    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.locations.push(location.into());
        self
    }

    /// Sets the external id.
    pub fn external_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = Some(id.into());
        self
    }

    /// Checks that every field the server needs is present.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.locations.is_empty() {
            return Err(ClientError::Validation(
                "job handle needs at least one location".into(),
            ));
        }
        if self.locations.iter().any(|l| l.trim().is_empty()) {
            return Err(ClientError::Validation(
                "job handle location must not be empty".into(),
            ));
        }
        if let Some(id) = &self.external_id
            && id.trim().is_empty()
        {
            return Err(ClientError::Validation(
                "job handle external id must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Reads a handle from an upload response (`{split_folder, video_id}`).
    pub fn from_upload_response(body: &serde_json::Value) -> Result<Self, ClientError> {
        let locations = match body.get("split_folder") {
            Some(serde_json::Value::String(s)) => vec![s.clone()],
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(ToOwned::to_owned))
                .collect(),
            _ => {
                return Err(ClientError::protocol_msg(
                    "upload response is missing `split_folder`",
                ));
            }
        };
        let external_id = match body.get("video_id") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        let handle = Self {
            locations,
            external_id,
        };
        handle.validate()?;
        Ok(handle)
    }
}

/// Bearer token supplied by the caller. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Returns the credential if present and non-blank.
pub(crate) fn require_credential(credential: Option<Credential>) -> Result<Credential, ClientError> {
    match credential {
        Some(c) if !c.is_blank() => Ok(c),
        _ => Err(ClientError::Validation(
            "a credential is required; log in first".into(),
        )),
    }
}
