use crate::cost::CostBreakdown;
use crate::evidence::Contradiction;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// A numbered reference to a deduplicated source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// 1-based id in first-seen order.
    pub id: u32,
    /// Source URL.
    pub url: String,
    /// Source title.
    pub title: String,
}

/// One section of the report, usually one per perspective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    /// Section heading.
    pub heading: String,
    /// Prose with `[n]` citation markers.
    pub content: String,
    /// Citation ids referenced in `content`.
    #[serde(default)]
    pub citations: Vec<u32>,
}

/// The synthesized research report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Report title.
    pub title: String,
    /// Overall summary.
    pub summary: String,
    /// Body sections.
    pub sections: Vec<Section>,
    /// Deduplicated citations.
    pub citations: Vec<Citation>,
    /// Conflicts found during analysis.
    #[serde(default)]
    pub contradictions: Vec<Contradiction>,
    /// Rendered markdown.
    #[serde(default)]
    pub full_content: String,
    /// LLM cost of synthesis.
    #[serde(default)]
    pub cost: CostBreakdown,
}

impl Report {
    /// Looks up a citation by id.
    pub fn citation(&self, id: u32) -> Option<&Citation> {
        self.citations.iter().find(|c| c.id == id)
    }

    /// Renders the report as markdown.
    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# {}\n", self.title);
        let _ = writeln!(out, "## Summary\n\n{}\n", self.summary.trim());
        for section in &self.sections {
            let _ = writeln!(out, "## {}\n\n{}\n", section.heading, section.content.trim());
        }
        if !self.contradictions.is_empty() {
            let _ = writeln!(out, "## Contradictions\n");
            for c in &self.contradictions {
                let _ = writeln!(out, "- {} vs. {} ({:?})", c.claim_a, c.claim_b, c.nature);
            }
            out.push('\n');
        }
        if !self.citations.is_empty() {
            let _ = writeln!(out, "## Sources\n");
            for c in &self.citations {
                let _ = writeln!(out, "[{}] {} - {}", c.id, c.title, c.url);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_markdown() {
        let report = Report {
            title: "Research: rust".into(),
            summary: "Rust is fast [1].".into(),
            sections: vec![Section {
                heading: "Technical Expert".into(),
                content: "Borrow checker [1].".into(),
                citations: vec![1],
            }],
            citations: vec![Citation {
                id: 1,
                url: "https://rust-lang.org".into(),
                title: "Rust".into(),
            }],
            contradictions: vec![],
            full_content: String::new(),
            cost: CostBreakdown::default(),
        };
        let md = report.render_markdown();
        assert!(md.starts_with("# Research: rust"));
        assert!(md.contains("## Technical Expert"));
        assert!(md.contains("[1] Rust - https://rust-lang.org"));
        assert!(!md.contains("## Contradictions"));
        assert_eq!(report.citation(1).map(|c| c.title.as_str()), Some("Rust"));
    }
}
