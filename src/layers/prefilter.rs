// Free keyword gate in front of the paid LLM stages
use crate::layers::{Candidate, PaperRecord};

pub struct KeywordFilter {
    keywords: Vec<String>,
    exclude_keywords: Vec<String>,
}

impl KeywordFilter {
    pub fn new(keywords: &[String], exclude_keywords: &[String]) -> Self {
        let normalize = |terms: &[String]| -> Vec<String> {
            terms
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect()
        };
        Self {
            keywords: normalize(keywords),
            exclude_keywords: normalize(exclude_keywords),
        }
    }

    /// Positive terms found in the paper, or `None` when it is rejected.
    pub fn evaluate(&self, paper: &PaperRecord) -> Option<Vec<String>> {
        let text = searchable_text(paper);

        if self.exclude_keywords.iter().any(|k| text.contains(k.as_str())) {
            return None;
        }

        let hits: Vec<String> = self
            .keywords
            .iter()
            .filter(|k| text.contains(k.as_str()))
            .cloned()
            .collect();
        (!hits.is_empty()).then_some(hits)
    }

    pub fn filter_batch(&self, papers: Vec<PaperRecord>) -> Vec<Candidate> {
        papers
            .into_iter()
            .filter_map(|paper| match self.evaluate(&paper) {
                Some(prefilter_hits) => Some(Candidate { paper, prefilter_hits }),
                None => {
                    tracing::debug!("Pre-filter dropped {} ({})", paper.id, paper.title);
                    None
                }
            })
            .collect()
    }
}

fn searchable_text(paper: &PaperRecord) -> String {
    match paper.abstract_or_none() {
        Some(abs) => format!("{}\n{}", paper.title, abs).to_lowercase(),
        None => paper.title.to_lowercase(),
    }
}
