use quick_xml::escape::escape;
use serde::Serialize;
use std::fmt::Write as _;

use crate::layers::{DateWindow, SummarizedCandidate};

const MAX_AUTHORS: usize = 5;

#[derive(Debug, Clone)]
pub struct DigestSettings {
    /// Supports `{date}` and `{count}`.
    pub subject_template: String,
    pub greeting: String,
    pub footer: String,
}

impl Default for DigestSettings {
    fn default() -> Self {
        Self {
            subject_template: "Paper digest: {date} ({count} papers)".to_string(),
            greeting: "Hello, here are today's paper recommendations.".to_string(),
            footer: String::new(),
        }
    }
}

/// One rendered message per run.
#[derive(Debug, Clone, Serialize)]
pub struct Digest {
    pub subject: String,
    pub html: String,
    pub window: DateWindow,
    pub paper_ids: Vec<String>,
}

impl Digest {
    pub fn paper_count(&self) -> usize {
        self.paper_ids.len()
    }
}

pub struct DigestAssembler {
    settings: DigestSettings,
}

impl DigestAssembler {
    pub fn new(settings: DigestSettings) -> Self {
        Self { settings }
    }

    /// Highest score first; ties keep the incoming (retrieval) order.
    pub fn order(mut papers: Vec<SummarizedCandidate>) -> Vec<SummarizedCandidate> {
        papers.sort_by(|a, b| b.score().cmp(&a.score()));
        papers
    }

    pub fn assemble(&self, papers: Vec<SummarizedCandidate>, window: DateWindow) -> Digest {
        let papers = Self::order(papers);
        let date = window.to_string();
        let subject = self
            .settings
            .subject_template
            .replace("{date}", &date)
            .replace("{count}", &papers.len().to_string());

        let html = if papers.is_empty() {
            self.render_empty(&date)
        } else {
            self.render(&papers, &date)
        };

        Digest {
            subject,
            html,
            window,
            paper_ids: papers.iter().map(|p| p.paper().id.clone()).collect(),
        }
    }

    fn render_empty(&self, date: &str) -> String {
        format!(
            "<!DOCTYPE html>\n<html><head><meta charset=\"UTF-8\"></head><body>\n\
             <h2>No Relevant Papers Found</h2>\n<p>Date: {}</p>\n\
             <p>No papers matched your research interests in this window.</p>\n\
             <p>Consider adjusting your research keywords for better results.</p>\n\
             {}</body></html>\n",
            escape(date),
            self.footer_html()
        )
    }

    fn render(&self, papers: &[SummarizedCandidate], date: &str) -> String {
        let mut cards = String::new();
        for (i, item) in papers.iter().enumerate() {
            render_card(&mut cards, i + 1, item);
        }

        format!(
            "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"UTF-8\">\n<style>{}</style>\n</head>\n<body>\n\
             <div class=\"header\"><h1>Paper Digest</h1><p>{}</p></div>\n\
             <div class=\"greeting\">{}</div>\n\
             <div class=\"papers\">\n{}</div>\n\
             {}</body>\n</html>\n",
            STYLE,
            escape(date),
            escape(self.settings.greeting.as_str()),
            cards,
            self.footer_html()
        )
    }

    fn footer_html(&self) -> String {
        if self.settings.footer.trim().is_empty() {
            return String::new();
        }
        format!(
            "<div class=\"footer\">{}</div>\n",
            escape(self.settings.footer.as_str()).replace('\n', "<br>")
        )
    }
}

fn score_color(score: u8) -> &'static str {
    match score {
        4.. => "#4CAF50",
        3 => "#2196F3",
        _ => "#FF9800",
    }
}

fn render_card(out: &mut String, rank: usize, item: &SummarizedCandidate) {
    let paper = item.paper();
    let score = item.score();

    let mut authors = paper
        .authors
        .iter()
        .take(MAX_AUTHORS)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    if paper.authors.len() > MAX_AUTHORS {
        authors.push_str(", et al.");
    }
    let mut meta = Vec::new();
    if let Some(venue) = &paper.venue {
        meta.push(venue.clone());
    }
    if let Some(date) = paper.publication_date {
        meta.push(date.to_string());
    }

    let _ = write!(
        out,
        "<div class=\"paper-card\">\n\
         <div class=\"paper-header\"><span class=\"paper-number\">{rank}</span>\
         <span class=\"score-badge\" style=\"background: {color}\">{score}</span>\
         <h3 class=\"paper-title\"><a href=\"{url}\">{title}</a></h3></div>\n",
        color = score_color(score),
        url = escape(paper.url.as_str()),
        title = escape(paper.title.as_str()),
    );
    if !authors.is_empty() {
        let _ = writeln!(out, "<p class=\"paper-meta\"><strong>{}</strong></p>", escape(authors.as_str()));
    }
    if !meta.is_empty() {
        let _ = writeln!(out, "<p class=\"paper-meta\">{}</p>", escape(meta.join(" · ").as_str()));
    }
    if let Some(reason) = item.scored.reason() {
        let _ = writeln!(out, "<p class=\"reason\">{}</p>", escape(reason));
    }

    out.push_str("<div class=\"summary-section\">\n");
    match (&item.summary, paper.abstract_or_none()) {
        (Some(summary), _) => {
            let _ = writeln!(out, "<p class=\"summary-target\">{}</p>", escape(summary.target.as_str()));
            let _ = writeln!(out, "<p class=\"summary-source\">{}</p>", escape(summary.source.as_str()));
        }
        (None, Some(abs)) => {
            let _ = writeln!(out, "<p class=\"abstract\">{}</p>", escape(abs));
        }
        (None, None) => {
            out.push_str("<p class=\"abstract\">(Abstract not available)</p>\n");
        }
    }
    out.push_str("</div>\n</div>\n");
}

const STYLE: &str = "body { font-family: Arial, sans-serif; line-height: 1.6; color: #333; max-width: 800px; margin: 0 auto; padding: 20px; } \
.header { text-align: center; padding: 20px 0; border-bottom: 2px solid #4CAF50; margin-bottom: 20px; } \
.paper-card { background: #f9f9f9; border-radius: 8px; padding: 20px; margin-bottom: 20px; } \
.paper-header { display: flex; align-items: flex-start; gap: 10px; margin-bottom: 10px; } \
.paper-number { background: #4CAF50; color: white; width: 28px; height: 28px; border-radius: 50%; text-align: center; font-weight: bold; } \
.score-badge { color: white; padding: 4px 10px; border-radius: 12px; font-size: 12px; font-weight: bold; } \
.paper-title { margin: 0; font-size: 16px; } \
.paper-title a { color: #2196F3; text-decoration: none; } \
.paper-meta { margin: 5px 0; font-size: 13px; color: #666; } \
.reason { font-size: 13px; color: #555; } \
.summary-section { margin-top: 15px; padding-top: 15px; border-top: 1px solid #ddd; } \
.summary-target { font-size: 14px; color: #333; margin-bottom: 8px; } \
.summary-source, .abstract { font-size: 12px; color: #888; font-style: italic; } \
.footer { margin-top: 30px; padding-top: 20px; border-top: 1px solid #ddd; font-size: 12px; color: #888; text-align: center; }";
