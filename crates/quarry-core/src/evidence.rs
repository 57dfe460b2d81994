use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A distinct angle of inquiry into the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Perspective {
    /// Short name, e.g. "Technical Expert".
    pub name: String,
    /// What this perspective concentrates on.
    pub focus: String,
    /// Seed questions the perspective should answer.
    #[serde(default)]
    pub questions: Vec<String>,
}

impl Perspective {
    /// Creates a perspective.
    pub fn new(name: impl Into<String>, focus: impl Into<String>, questions: Vec<String>) -> Self {
        Self {
            name: name.into(),
            focus: focus.into(),
            questions,
        }
    }
}

/// A retrieved document. The URL is the dedup key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Canonical location.
    pub url: String,
    /// Page or result title.
    #[serde(default)]
    pub title: String,
    /// Short excerpt.
    #[serde(default)]
    pub snippet: String,
    /// Confidence in the source, 0 to 1.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// When the source was retrieved.
    pub retrieved_at: DateTime<Utc>,
}

fn default_confidence() -> f64 {
    0.5
}

impl Source {
    /// Creates a source retrieved now.
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            snippet: String::new(),
            confidence: default_confidence(),
            retrieved_at: Utc::now(),
        }
    }

    /// Sets the snippet.
    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = snippet.into();
        self
    }

    /// Sets the confidence, clamped to 0..=1.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }
}

/// Appends `incoming` to `into`, keeping the first occurrence of each URL.
pub fn merge_sources(into: &mut Vec<Source>, incoming: impl IntoIterator<Item = Source>) {
    for source in incoming {
        if !into.iter().any(|s| s.url == source.url) {
            into.push(source);
        }
    }
}

/// A claim extracted from worker output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// The claim itself.
    pub content: String,
    /// Where the claim came from, if known.
    pub source: Option<Source>,
    /// Confidence, 0 to 1.
    pub confidence: f64,
    /// Other sources stating the same thing.
    #[serde(default)]
    pub corroborated_by: Vec<Source>,
}

impl Fact {
    /// Creates a fact without corroboration.
    pub fn new(content: impl Into<String>, source: Option<Source>, confidence: f64) -> Self {
        Self {
            content: content.into(),
            source,
            confidence: confidence.clamp(0.0, 1.0),
            corroborated_by: Vec::new(),
        }
    }
}

/// How two claims conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContradictionNature {
    /// The claims cannot both be true.
    Direct,
    /// The claims differ in emphasis or interpretation.
    Nuanced,
    /// The claims apply to different conditions or populations.
    Scope,
}

/// Two facts with incompatible claims about the same subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contradiction {
    /// First claim.
    pub claim_a: String,
    /// URL backing the first claim.
    #[serde(default)]
    pub source_a: String,
    /// Second claim.
    pub claim_b: String,
    /// URL backing the second claim.
    #[serde(default)]
    pub source_b: String,
    /// Kind of conflict.
    pub nature: ContradictionNature,
}

/// Why a gap was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GapKind {
    /// A seed question was left unanswered.
    Coverage,
    /// Sources disagree and need a tie-breaker.
    Contradiction,
}

/// Missing or contradictory evidence that triggers a follow-up worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    /// What is missing.
    pub description: String,
    /// Coverage or contradiction.
    pub kind: GapKind,
    /// Priority, 0 to 1.
    pub importance: f64,
    /// Queries the follow-up worker should start from.
    #[serde(default)]
    pub suggested_queries: Vec<String>,
    /// The perspective this gap belongs to, when known.
    #[serde(default)]
    pub perspective: Option<String>,
}

impl Gap {
    /// Lower-cased, whitespace-collapsed description used to compare gaps.
    pub fn normalized(&self) -> String {
        self.description
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_sources_first_wins() {
        let mut sources = vec![Source::new("https://a", "A1")];
        merge_sources(
            &mut sources,
            vec![
                Source::new("https://b", "B"),
                Source::new("https://a", "A2"),
            ],
        );
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].title, "A1");
    }

    #[test]
    fn test_gap_normalized() {
        let gap = Gap {
            description: "  Missing   Cost DATA ".into(),
            kind: GapKind::Coverage,
            importance: 0.7,
            suggested_queries: vec![],
            perspective: None,
        };
        assert_eq!(gap.normalized(), "missing cost data");
    }

    #[test]
    fn test_confidence_clamped() {
        assert_eq!(Source::new("u", "t").with_confidence(3.0).confidence, 1.0);
        assert_eq!(Fact::new("c", None, -1.0).confidence, 0.0);
    }
}
