use crate::layers::PaperRecord;

/// Placeholders a prompt template may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    Title,
    Abstract,
    Authors,
    Venue,
    Date,
    Interests,
}

impl Placeholder {
    pub const ALL: [Placeholder; 6] = [
        Placeholder::Title,
        Placeholder::Abstract,
        Placeholder::Authors,
        Placeholder::Venue,
        Placeholder::Date,
        Placeholder::Interests,
    ];

    pub fn token(self) -> &'static str {
        match self {
            Placeholder::Title => "{title}",
            Placeholder::Abstract => "{abstract}",
            Placeholder::Authors => "{authors}",
            Placeholder::Venue => "{venue}",
            Placeholder::Date => "{date}",
            Placeholder::Interests => "{interests}",
        }
    }
}

/// Values substituted into a template for one paper.
#[derive(Debug, Clone, Default)]
pub struct PromptValues {
    pub title: String,
    pub abstract_text: String,
    pub authors: String,
    pub venue: String,
    pub date: String,
    /// The configured research interests, identical for every paper.
    pub interests: String,
}

impl PromptValues {
    pub fn for_paper(paper: &PaperRecord, interests: &str, max_abstract_chars: usize) -> Self {
        Self {
            title: paper.title.clone(),
            abstract_text: truncate_chars(paper.abstract_or_none().unwrap_or(""), max_abstract_chars),
            authors: paper.authors.join(", "),
            venue: paper.venue.clone().unwrap_or_default(),
            date: paper
                .publication_date
                .map(|d| d.to_string())
                .unwrap_or_default(),
            interests: interests.to_string(),
        }
    }

    fn get(&self, placeholder: Placeholder) -> &str {
        match placeholder {
            Placeholder::Title => &self.title,
            Placeholder::Abstract => &self.abstract_text,
            Placeholder::Authors => &self.authors,
            Placeholder::Venue => &self.venue,
            Placeholder::Date => &self.date,
            Placeholder::Interests => &self.interests,
        }
    }
}

/// Substitute the known placeholders in a single left-to-right pass.
/// Unknown `{...}` sequences and braces inside substituted values are left alone.
pub fn render(template: &str, values: &PromptValues) -> String {
    let mut out = String::with_capacity(template.len() + values.abstract_text.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        match Placeholder::ALL.iter().find(|p| tail.starts_with(p.token())) {
            Some(p) => {
                out.push_str(values.get(*p));
                rest = &tail[p.token().len()..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        text.chars().take(max_chars).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}
