use crate::planner::Plan;
use quarry_agent::LlmBackend;
use quarry_core::{
    merge_sources, Citation, Contradiction, CostBreakdown, Message, QuarryError, QuarryResult,
    Report, Section, Source, Worker,
};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Heading for gap-fill output that belongs to no perspective.
pub const ADDITIONAL_FINDINGS: &str = "Additional Findings";

/// A finished report with the merged sources and the cost of writing it.
#[derive(Debug, Clone)]
pub struct SynthesisOutcome {
    pub report: Report,
    /// Deduplicated by URL in first-seen order; index + 1 is the citation id.
    pub sources: Vec<Source>,
    pub cost: CostBreakdown,
}

/// Workers contributing to one report section.
struct SectionGroup<'a> {
    heading: String,
    workers: Vec<&'a Worker>,
}

/// Turns completed worker output into a cited report.
pub struct Synthesizer {
    llm: Arc<dyn LlmBackend>,
    citation: Regex,
}

impl Synthesizer {
    pub fn new(llm: Arc<dyn LlmBackend>) -> QuarryResult<Self> {
        let citation =
            Regex::new(r"\[(\d+)\]").map_err(|e| QuarryError::Config(format!("regex: {e}")))?;
        Ok(Self { llm, citation })
    }

    /// Builds the report.
    ///
    /// Each perspective gets a section written from its own workers and their
    /// sources; untagged gap-fill output goes to "Additional Findings". A
    /// section whose LLM call fails falls back to the raw worker output. The
    /// summary call is not optional.
    pub async fn build(
        &self,
        query: &str,
        plan: &Plan,
        workers: &[Worker],
        contradictions: &[Contradiction],
        cancel: &CancellationToken,
    ) -> QuarryResult<SynthesisOutcome> {
        let mut completed: Vec<&Worker> = workers.iter().filter(|w| w.is_complete()).collect();
        if completed.is_empty() {
            return Err(QuarryError::Synthesis(
                "no completed workers to synthesize".into(),
            ));
        }
        completed.sort_by_key(|w| w.sequence);

        let mut sources = Vec::new();
        for w in &completed {
            merge_sources(&mut sources, w.sources.iter().cloned());
        }
        let citations: Vec<Citation> = sources
            .iter()
            .zip(1u32..)
            .map(|(s, id)| Citation {
                id,
                url: s.url.clone(),
                title: if s.title.trim().is_empty() {
                    s.url.clone()
                } else {
                    s.title.clone()
                },
            })
            .collect();

        let mut cost = CostBreakdown::default();
        let mut sections = Vec::new();
        for group in group_by_perspective(plan, &completed) {
            let section = self
                .write_section(query, &group, &citations, cancel, &mut cost)
                .await?;
            sections.push(section);
        }

        let summary = self.summarize(query, &sections, cancel, &mut cost).await?;

        let mut report = Report {
            title: format!("Research: {query}"),
            summary,
            sections,
            citations,
            contradictions: contradictions.to_vec(),
            full_content: String::new(),
            cost,
        };
        report.full_content = report.render_markdown();
        info!(
            sections = report.sections.len(),
            citations = report.citations.len(),
            "Report synthesized"
        );
        Ok(SynthesisOutcome {
            report,
            sources,
            cost,
        })
    }

    async fn write_section(
        &self,
        query: &str,
        group: &SectionGroup<'_>,
        citations: &[Citation],
        cancel: &CancellationToken,
        cost: &mut CostBreakdown,
    ) -> QuarryResult<Section> {
        if cancel.is_cancelled() {
            return Err(QuarryError::cancelled("cancelled during synthesis"));
        }

        let own: Vec<&Citation> = citations
            .iter()
            .filter(|c| {
                group
                    .workers
                    .iter()
                    .any(|w| w.sources.iter().any(|s| s.url == c.url))
            })
            .collect();
        let allowed: BTreeSet<u32> = own.iter().map(|c| c.id).collect();

        let mut findings = String::new();
        for w in &group.workers {
            findings.push_str(&format!("### {}\n{}\n\n", w.objective, w.output.trim()));
        }
        let source_list: String = own
            .iter()
            .map(|c| format!("[{}] {} - {}\n", c.id, c.title, c.url))
            .collect();
        let prompt = format!(
            "Write the section \"{}\" of a research report on \"{query}\".\n\n\
             Findings:\n{findings}\
             Sources:\n{}\n\
             Write clear, factual prose. Cite sources inline with their bracketed number, \
             e.g. [1]. Only cite sources from the list above.",
            group.heading,
            if source_list.is_empty() { "(none)\n" } else { source_list.as_str() },
        );
        let messages = [Message::user(prompt)];

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(QuarryError::cancelled("cancelled during synthesis")),
            r = self.llm.chat(&messages) => r,
        };
        match result {
            Ok(completion) => {
                *cost += completion.cost(self.llm.model_id(), &messages);
                let content = completion.content.trim().to_string();
                let cited = self.cited_ids(&content, &allowed);
                debug!(heading = %group.heading, citations = cited.len(), "Section written");
                Ok(Section {
                    heading: group.heading.clone(),
                    content,
                    citations: cited,
                })
            }
            Err(e) => {
                warn!(heading = %group.heading, error = %e, "Section synthesis failed, using raw findings");
                let content = group
                    .workers
                    .iter()
                    .map(|w| w.output.trim())
                    .filter(|o| !o.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n\n");
                Ok(Section {
                    heading: group.heading.clone(),
                    content,
                    citations: Vec::new(),
                })
            }
        }
    }

    async fn summarize(
        &self,
        query: &str,
        sections: &[Section],
        cancel: &CancellationToken,
        cost: &mut CostBreakdown,
    ) -> QuarryResult<String> {
        if cancel.is_cancelled() {
            return Err(QuarryError::cancelled("cancelled during synthesis"));
        }
        let body: String = sections
            .iter()
            .map(|s| format!("## {}\n{}\n\n", s.heading, s.content))
            .collect();
        let messages = [Message::user(format!(
            "Write an executive summary of this research on \"{query}\" in one or two \
             paragraphs. Keep the bracketed citation numbers that support each claim.\n\n{body}"
        ))];

        let completion = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(QuarryError::cancelled("cancelled during synthesis")),
            r = self.llm.chat(&messages) => r.map_err(|e| QuarryError::Synthesis(format!("summary failed: {e}")))?,
        };
        *cost += completion.cost(self.llm.model_id(), &messages);
        Ok(completion.content.trim().to_string())
    }

    /// Citation ids that appear in `text` and belong to the section, ascending.
    fn cited_ids(&self, text: &str, allowed: &BTreeSet<u32>) -> Vec<u32> {
        let found: BTreeSet<u32> = self
            .citation
            .captures_iter(text)
            .filter_map(|c| c.get(1)?.as_str().parse().ok())
            .filter(|id| allowed.contains(id))
            .collect();
        found.into_iter().collect()
    }
}

/// One group per planned perspective with output, then untagged gap-fill
/// output under [`ADDITIONAL_FINDINGS`].
fn group_by_perspective<'a>(plan: &Plan, completed: &[&'a Worker]) -> Vec<SectionGroup<'a>> {
    let mut groups: Vec<SectionGroup<'a>> = plan
        .perspectives
        .iter()
        .map(|p| SectionGroup {
            heading: p.name.clone(),
            workers: completed
                .iter()
                .copied()
                .filter(|w| w.kind.perspective() == Some(p.name.as_str()))
                .collect(),
        })
        .collect();

    let untagged: Vec<&Worker> = completed
        .iter()
        .copied()
        .filter(|w| match w.kind.perspective() {
            None => true,
            Some(name) => !plan.perspectives.iter().any(|p| p.name == name),
        })
        .collect();
    groups.push(SectionGroup {
        heading: ADDITIONAL_FINDINGS.to_string(),
        workers: untagged,
    });

    groups.retain(|g| !g.workers.is_empty());
    groups
}
