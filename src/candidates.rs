//! Candidate sets: which arms are eligible for one ranking request.
//!
//! The engine only reads [`Candidate::arm`]; every other field is display
//! metadata passed through to the response untouched.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ArmId;

/// Filter criteria for a candidate query.
///
/// Empty fields do not filter. The filter is persisted with every ranking
/// cycle it produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct CandidateFilter {
    /// Topics; an article matches if it matches any of them.
    pub topics: Vec<String>,
    /// Keep only articles published on or after this date.
    pub date_min: Option<NaiveDate>,
    /// Title substrings; an article matches if its title contains any of them.
    pub title_terms: Vec<String>,
}

impl CandidateFilter {
    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_date_min(mut self, date: NaiveDate) -> Self {
        self.date_min = Some(date);
        self
    }

    pub fn with_title_terms<I, S>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.title_terms = terms.into_iter().map(Into::into).collect();
        self
    }

    /// Whether `candidate` passes every non-empty criterion.
    pub fn matches(&self, candidate: &Candidate) -> bool {
        self.matches_topics(candidate)
            && self.matches_date(candidate)
            && self.matches_title(candidate)
    }

    fn matches_topics(&self, candidate: &Candidate) -> bool {
        if self.topics.is_empty() {
            return true;
        }
        let text = candidate
            .topic_text
            .as_deref()
            .map(str::to_lowercase)
            .unwrap_or_default();
        self.topics.iter().any(|want| {
            candidate.topics.iter().any(|have| have == want)
                || (!text.is_empty() && text.contains(&want.to_lowercase()))
        })
    }

    fn matches_date(&self, candidate: &Candidate) -> bool {
        match (self.date_min, candidate.publication_date) {
            (None, _) => true,
            (Some(min), Some(published)) => published >= min,
            (Some(_), None) => false,
        }
    }

    fn matches_title(&self, candidate: &Candidate) -> bool {
        let terms: Vec<String> = self
            .title_terms
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        if terms.is_empty() {
            return true;
        }
        let title = candidate.title.to_lowercase();
        terms.iter().any(|t| title.contains(t.as_str()))
    }
}

/// One eligible arm plus its display metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub arm: ArmId,
    pub title: String,
    pub publication_date: Option<NaiveDate>,
    /// Topic tags.
    #[serde(default)]
    pub topics: Vec<String>,
    /// Free-form topic text searched by substring.
    #[serde(default)]
    pub topic_text: Option<String>,
    /// Opaque passthrough fields (link, source, summary, ...).
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Candidate {
    pub fn new(arm: ArmId, title: impl Into<String>) -> Self {
        Self {
            arm,
            title: title.into(),
            publication_date: None,
            topics: Vec::new(),
            topic_text: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn published(mut self, date: NaiveDate) -> Self {
        self.publication_date = Some(date);
        self
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_topic_text(mut self, text: impl Into<String>) -> Self {
        self.topic_text = Some(text.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Produces the full candidate set for a filter.
///
/// The returned order is the ranking tie-break order: arms with equal scores
/// (notably every cold arm) keep it.
pub trait CandidateProvider {
    fn candidates(&self, filter: &CandidateFilter) -> Result<Vec<Candidate>>;
}

impl<P: CandidateProvider + ?Sized> CandidateProvider for &P {
    fn candidates(&self, filter: &CandidateFilter) -> Result<Vec<Candidate>> {
        (**self).candidates(filter)
    }
}

/// A fixed in-memory catalog, newest first.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    articles: Vec<Candidate>,
}

impl InMemoryCatalog {
    pub fn new(articles: impl IntoIterator<Item = Candidate>) -> Self {
        Self {
            articles: articles.into_iter().collect(),
        }
    }

    pub fn insert(&mut self, candidate: Candidate) {
        self.articles.push(candidate);
    }

    pub fn len(&self) -> usize {
        self.articles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.articles.is_empty()
    }
}

impl CandidateProvider for InMemoryCatalog {
    fn candidates(&self, filter: &CandidateFilter) -> Result<Vec<Candidate>> {
        let mut out: Vec<Candidate> = self
            .articles
            .iter()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        // Newest first; undated articles last; then arm id ascending.
        out.sort_by(|a, b| {
            b.publication_date
                .cmp(&a.publication_date)
                .then_with(|| a.arm.cmp(&b.arm))
        });
        Ok(out)
    }
}
