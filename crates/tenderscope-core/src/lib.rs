//! Core domain model for Tenderscope.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tenderscope-core";

/// Normalized lifecycle status across sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TenderStatus {
    #[default]
    Published,
    Awarded,
    Formalized,
    Annulled,
}

impl TenderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenderStatus::Published => "published",
            TenderStatus::Awarded => "awarded",
            TenderStatus::Formalized => "formalized",
            TenderStatus::Annulled => "annulled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "published" => Some(TenderStatus::Published),
            "awarded" => Some(TenderStatus::Awarded),
            "formalized" => Some(TenderStatus::Formalized),
            "annulled" => Some(TenderStatus::Annulled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentKind {
    TechnicalSpec,
    AdministrativeSpec,
    Annex,
}

/// Attached document reference as published by the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub name: String,
    pub kind: DocumentKind,
    pub url: String,
}

/// Pointer to an additional source reporting the same tender, accumulated
/// when duplicates are merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub source: String,
    pub external_id: String,
    pub url: Option<String>,
}

/// AI enrichment output contract. Absent on a tender until the enrichment
/// collaborator has run for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TenderAnalysis {
    pub adapted_title: Option<String>,
    pub technology_stack: BTreeMap<String, Vec<String>>,
    pub topical_concepts: Vec<String>,
    pub technical_summary: Option<String>,
}

impl TenderAnalysis {
    pub fn is_empty(&self) -> bool {
        self.adapted_title.is_none()
            && self.technology_stack.values().all(|v| v.is_empty())
            && self.topical_concepts.is_empty()
            && self.technical_summary.is_none()
    }
}

/// Common tender record produced by every source adapter.
///
/// `external_id` is unique within a source (`<SOURCE>-<expediente>` or the
/// source-native id) and is the storage identity key. The same real-world
/// tender can still appear under different external ids from different
/// sources; resolving that is the dedup engine's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tender {
    pub external_id: String,
    pub source: String,
    pub expediente: Option<String>,
    pub title: String,
    pub summary: Option<String>,
    pub contracting_body: Option<String>,
    pub contract_type: Option<String>,
    pub procedure: Option<String>,
    pub base_budget: Option<f64>,
    pub estimated_value: Option<f64>,
    pub publication_date: Option<DateTime<Utc>>,
    pub deadline_date: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub execution_location: Option<String>,
    pub nuts_code: Option<String>,
    pub funding_eu: Option<String>,
    pub cpv_codes: Vec<String>,
    pub source_url: Option<String>,
    pub status: TenderStatus,
    pub documents: Vec<DocumentRef>,
    pub extra_sources: Vec<SourceRef>,
    pub analysis: Option<TenderAnalysis>,
    pub analyzed_at: Option<DateTime<Utc>>,
}

impl Tender {
    /// Skeleton record for a given source; adapters fill in what the raw
    /// payload actually carries, everything else stays `None`.
    pub fn new(external_id: impl Into<String>, source: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            source: source.into(),
            expediente: None,
            title: title.into(),
            summary: None,
            contracting_body: None,
            contract_type: None,
            procedure: None,
            base_budget: None,
            estimated_value: None,
            publication_date: None,
            deadline_date: None,
            updated_at: None,
            execution_location: None,
            nuts_code: None,
            funding_eu: None,
            cpv_codes: Vec::new(),
            source_url: None,
            status: TenderStatus::default(),
            documents: Vec::new(),
            extra_sources: Vec::new(),
            analysis: None,
            analyzed_at: None,
        }
    }

    pub fn self_ref(&self) -> SourceRef {
        SourceRef {
            source: self.source.clone(),
            external_id: self.external_id.clone(),
            url: self.source_url.clone(),
        }
    }
}
