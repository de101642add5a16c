//! Source adapter contracts + the PLACSP and Gencat adapters.
//!
//! Each adapter pulls paginated raw records from its platform, maps them into
//! the common [`Tender`] shape and applies a per-source relevance filter.
//! Unknown or malformed source fields map to `None`; a transient fetch error
//! terminates the stream but keeps everything already yielded.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Deserialize;
use tenderscope_core::{DocumentKind, DocumentRef, Tender, TenderStatus};
use tenderscope_storage::HttpFetcher;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "tenderscope-adapters";

pub const PLACSP_SOURCE: &str = "PLACSP";
pub const GENCAT_SOURCE: &str = "GENCAT";

const PLACSP_FEED_URL: &str = "https://contrataciondelsectorpublico.gob.es/sindicacion/sindicacion_643/licitacionesPerfilesContratanteCompleto3.atom";
const GENCAT_API_URL: &str = "https://analisi.transparenciacatalunya.cat/resource/ybgg-dgi6.json";
const GENCAT_PAGE_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] tenderscope_storage::FetchError),
    #[error("malformed feed: {0}")]
    Parse(String),
}

/// Topical in/out-of-scope classifier. Two independent signals, either one
/// is sufficient: a classification-code prefix match, or a case-insensitive
/// keyword hit in the title or summary.
#[derive(Debug, Clone)]
pub struct RelevanceFilter {
    pub code_prefixes: Vec<String>,
    pub keywords: Vec<String>,
}

impl RelevanceFilter {
    pub fn new(code_prefixes: Vec<String>, keywords: Vec<String>) -> Self {
        Self {
            code_prefixes,
            keywords,
        }
    }

    /// ICT filter for PLACSP: CPV prefix families plus Spanish keywords.
    pub fn placsp_defaults() -> Self {
        Self::new(
            ["48", "72", "30200", "32400", "32420", "32500"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            [
                "software",
                "aplicación",
                "aplicacion",
                "sistema informático",
                "sistema informatico",
                "desarrollo",
                "programación",
                "programacion",
                "cloud",
                "ciberseguridad",
                "seguridad informática",
                "base de datos",
                "bases de datos",
                "inteligencia artificial",
                "machine learning",
                "devops",
                "erp",
                "crm",
                "portal",
                "plataforma digital",
                "sitio web",
                "infraestructura ti",
                "transformación digital",
                "virtualización",
                "kubernetes",
                "docker",
                "big data",
                "business intelligence",
                "microservicios",
                "app móvil",
                "licencias",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        )
    }

    /// ICT filter for Gencat: same CPV families, Catalan keywords.
    pub fn gencat_defaults() -> Self {
        Self::new(
            ["48", "72"].iter().map(|s| s.to_string()).collect(),
            [
                "programari",
                "software",
                "aplicació",
                "aplicación",
                "sistema informàtic",
                "sistema informático",
                "desenvolupament",
                "desarrollo",
                "base de dades",
                "base de datos",
                "tecnologia",
                "tecnología",
                "informàtica",
                "informática",
                "digital",
                "web",
                "cloud",
                "ciberseguretat",
                "ciberseguridad",
                "intel·ligència artificial",
                "inteligencia artificial",
                "big data",
                "analítica",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        )
    }

    /// Either signal suffices; no signal means not relevant. Empty codes and
    /// missing text never raise.
    pub fn is_relevant(&self, codes: &[String], title: &str, summary: Option<&str>) -> bool {
        for code in codes {
            if self.code_prefixes.iter().any(|p| code.starts_with(p.as_str())) {
                return true;
            }
        }

        let haystack = match summary {
            Some(summary) => format!("{} {}", title, summary).to_lowercase(),
            None => title.to_lowercase(),
        };
        self.keywords
            .iter()
            .any(|kw| haystack.contains(&kw.to_lowercase()))
    }
}

/// One page of mapped records plus the cursor to the next page, if any.
#[derive(Debug, Clone, Default)]
pub struct FetchedPage {
    pub tenders: Vec<Tender>,
    /// Raw records examined to produce this page, before any filtering.
    pub scanned: usize,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub max_pages: Option<usize>,
    /// Recent-window mode: sources return records newest-first, so the
    /// stream stops at the first record whose update stamp predates this.
    pub recent_cutoff: Option<DateTime<Utc>>,
    pub skip_relevance_filter: bool,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> &'static str;

    fn relevance(&self) -> &RelevanceFilter;

    /// Fetch and map one page. `cursor` is adapter-specific (a next-page URL
    /// for PLACSP, a row offset for Gencat); `None` means the first page.
    /// Adapters may use `opts` to prefilter server-side, but the common
    /// cutoff and relevance handling in `fetch_all` still applies.
    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        cursor: Option<&str>,
        opts: &FetchOptions,
    ) -> Result<FetchedPage, AdapterError>;

    /// Drive pagination until the source is exhausted, a page limit or
    /// recency cutoff is reached, or a transient error ends the stream.
    /// Restartable by calling again with the same options; not resumable.
    async fn fetch_all(&self, http: &HttpFetcher, opts: &FetchOptions) -> Vec<Tender> {
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;
        let mut scanned = 0usize;

        loop {
            let page = match self.fetch_page(http, cursor.as_deref(), opts).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(
                        source = self.source(),
                        error = %err,
                        "pagination terminated by fetch error; keeping partial results"
                    );
                    break;
                }
            };
            pages += 1;
            scanned += page.scanned;

            let mut past_cutoff = false;
            for tender in page.tenders {
                if let (Some(cutoff), Some(updated)) = (opts.recent_cutoff, tender.updated_at) {
                    // Records without a parseable stamp fail open and stay in.
                    if updated < cutoff {
                        debug!(source = self.source(), external_id = %tender.external_id, "recency cutoff reached");
                        past_cutoff = true;
                        break;
                    }
                }
                if !opts.skip_relevance_filter
                    && !self.relevance().is_relevant(
                        &tender.cpv_codes,
                        &tender.title,
                        tender.summary.as_deref(),
                    )
                {
                    continue;
                }
                out.push(tender);
            }

            // An empty page ends the crawl even when the source still
            // advertises a next cursor.
            if past_cutoff || page.scanned == 0 || page.next_cursor.is_none() {
                break;
            }
            if let Some(max) = opts.max_pages {
                if pages >= max {
                    debug!(source = self.source(), max, "page limit reached");
                    break;
                }
            }
            cursor = page.next_cursor;
        }

        info!(
            source = self.source(),
            pages,
            scanned,
            kept = out.len(),
            "fetch complete"
        );
        out
    }
}

fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    // Socrata-style local stamp without offset: 2023-07-18T14:00:00.000
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    None
}

fn parse_f64(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok()
}

fn contract_type_label(code: &str) -> String {
    match code {
        "1" => "Suministros".to_string(),
        "2" => "Servicios".to_string(),
        "3" => "Obras".to_string(),
        "7" => "Administrativo especial".to_string(),
        "8" => "Privado".to_string(),
        "21" => "Concesión de Servicios".to_string(),
        "22" => "Concesión de Obras".to_string(),
        "40" => "Patrimonial".to_string(),
        other => format!("Tipo {other}"),
    }
}

fn placsp_status(code: &str) -> TenderStatus {
    match code {
        "ADJ" => TenderStatus::Awarded,
        "RES" => TenderStatus::Formalized,
        "ANUL" => TenderStatus::Annulled,
        _ => TenderStatus::Published,
    }
}

/// PLACSP (Plataforma de Contratación del Sector Público). ATOM feed of
/// CODICE entries, paginated through `link rel="next"`.
pub struct PlacspAdapter {
    feed_url: String,
    relevance: RelevanceFilter,
}

impl Default for PlacspAdapter {
    fn default() -> Self {
        Self {
            feed_url: PLACSP_FEED_URL.to_string(),
            relevance: RelevanceFilter::placsp_defaults(),
        }
    }
}

impl PlacspAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_feed_url(mut self, url: impl Into<String>) -> Self {
        self.feed_url = url.into();
        self
    }

    pub fn with_relevance(mut self, relevance: RelevanceFilter) -> Self {
        self.relevance = relevance;
        self
    }
}

#[async_trait]
impl SourceAdapter for PlacspAdapter {
    fn source(&self) -> &'static str {
        PLACSP_SOURCE
    }

    fn relevance(&self) -> &RelevanceFilter {
        &self.relevance
    }

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        cursor: Option<&str>,
        _opts: &FetchOptions,
    ) -> Result<FetchedPage, AdapterError> {
        let url = cursor.unwrap_or(self.feed_url.as_str());
        let response = http.fetch_bytes(url).await?;
        parse_placsp_feed(&response.body)
    }
}

#[derive(Debug, Default)]
struct PlacspEntry {
    atom_id: Option<String>,
    link: Option<String>,
    title: Option<String>,
    summary: Option<String>,
    updated: Option<String>,
    expediente: Option<String>,
    status_code: Option<String>,
    contracting_body: Option<String>,
    type_code: Option<String>,
    procedure_code: Option<String>,
    funding_code: Option<String>,
    budget: Option<String>,
    estimated: Option<String>,
    location: Option<String>,
    nuts: Option<String>,
    deadline: Option<String>,
    cpv_codes: Vec<String>,
    documents: Vec<DocumentRef>,
}

impl PlacspEntry {
    fn into_tender(self) -> Option<Tender> {
        let title = self.title?;
        let external_id = match &self.expediente {
            Some(exp) if !exp.is_empty() => format!("{PLACSP_SOURCE}-{exp}"),
            _ => self.atom_id.clone()?,
        };

        let mut tender = Tender::new(external_id, PLACSP_SOURCE, title);
        tender.expediente = self.expediente;
        tender.summary = self.summary;
        tender.contracting_body = self.contracting_body;
        tender.contract_type = self.type_code.as_deref().map(contract_type_label);
        tender.procedure = self.procedure_code;
        tender.funding_eu = self.funding_code.filter(|code| code != "NO-EU");
        tender.base_budget = self.budget.as_deref().and_then(parse_f64);
        tender.estimated_value = self.estimated.as_deref().and_then(parse_f64);
        tender.updated_at = self.updated.as_deref().and_then(parse_datetime);
        tender.publication_date = tender.updated_at;
        tender.deadline_date = self.deadline.as_deref().and_then(parse_datetime);
        tender.execution_location = self.location;
        tender.nuts_code = self.nuts;
        tender.cpv_codes = self.cpv_codes;
        tender.source_url = self.link;
        tender.status = self
            .status_code
            .as_deref()
            .map(placsp_status)
            .unwrap_or_default();
        tender.documents = self.documents;
        Some(tender)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocContext {
    Legal,
    Technical,
    General,
}

#[derive(Debug, Default)]
struct DocBuilder {
    name: Option<String>,
    url: Option<String>,
    type_code: Option<String>,
}

impl DocBuilder {
    fn finish(self, context: DocContext) -> Option<DocumentRef> {
        let url = self.url?;
        let (kind, fallback_name) = match context {
            DocContext::Legal => (
                DocumentKind::AdministrativeSpec,
                "Pliego de Cláusulas Administrativas",
            ),
            DocContext::Technical => (
                DocumentKind::TechnicalSpec,
                "Pliego de Prescripciones Técnicas",
            ),
            DocContext::General => {
                let kind = match self.type_code.as_deref() {
                    Some("1") => DocumentKind::TechnicalSpec,
                    Some("2") => DocumentKind::AdministrativeSpec,
                    _ => DocumentKind::Annex,
                };
                (kind, "Documento Anexo")
            }
        };
        Some(DocumentRef {
            name: self
                .name
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| fallback_name.to_string()),
            kind,
            url,
        })
    }
}

/// Field currently being captured from character data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capture {
    AtomId,
    Title,
    Summary,
    Updated,
    Expediente,
    StatusCode,
    PartyName,
    TypeCode,
    ProcedureCode,
    FundingCode,
    Budget,
    Estimated,
    Location,
    Nuts,
    Deadline,
    Cpv,
    DocName,
    DocUri,
    DocTypeCode,
}

fn attr_value(element: &BytesStart<'_>, name: &str) -> Option<String> {
    element
        .try_get_attribute(name)
        .ok()
        .flatten()
        .and_then(|attr| attr.unescape_value().ok().map(|v| v.into_owned()))
}

/// Event-driven parse of one PLACSP feed page. Namespace prefixes vary
/// between mirrors, so elements are matched by local name with minimal
/// context flags for the ambiguous ones.
fn parse_placsp_feed(xml: &[u8]) -> Result<FetchedPage, AdapterError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut page = FetchedPage::default();
    let mut entry: Option<PlacspEntry> = None;
    let mut capture: Option<Capture> = None;
    let mut in_party = false;
    let mut in_deadline_period = false;
    let mut doc_context: Option<DocContext> = None;
    let mut doc = DocBuilder::default();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                match name.as_ref() {
                    b"entry" => entry = Some(PlacspEntry::default()),
                    b"link" => handle_link(&e, entry.as_mut(), &mut page.next_cursor),
                    b"LocatedContractingParty" => in_party = true,
                    b"TenderSubmissionDeadlinePeriod" => in_deadline_period = true,
                    b"LegalDocumentReference" => {
                        doc_context = Some(DocContext::Legal);
                        doc = DocBuilder::default();
                    }
                    b"TechnicalDocumentReference" => {
                        doc_context = Some(DocContext::Technical);
                        doc = DocBuilder::default();
                    }
                    b"GeneralDocumentDocumentReference" => {
                        doc_context = Some(DocContext::General);
                        doc = DocBuilder::default();
                    }
                    other if entry.is_some() => {
                        capture = capture_for(other, in_party, in_deadline_period, doc_context);
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"link" {
                    handle_link(&e, entry.as_mut(), &mut page.next_cursor);
                }
            }
            Ok(Event::Text(text)) => {
                if let (Some(target), Some(current)) = (capture, entry.as_mut()) {
                    let value = text
                        .unescape()
                        .map_err(|e| AdapterError::Parse(e.to_string()))?
                        .trim()
                        .to_string();
                    if !value.is_empty() {
                        assign_capture(current, &mut doc, target, value);
                    }
                }
            }
            Ok(Event::End(e)) => {
                capture = None;
                match e.local_name().as_ref() {
                    b"entry" => {
                        if let Some(finished) = entry.take() {
                            page.scanned += 1;
                            if let Some(tender) = finished.into_tender() {
                                page.tenders.push(tender);
                            }
                        }
                    }
                    b"LocatedContractingParty" => in_party = false,
                    b"TenderSubmissionDeadlinePeriod" => in_deadline_period = false,
                    b"LegalDocumentReference"
                    | b"TechnicalDocumentReference"
                    | b"GeneralDocumentDocumentReference" => {
                        if let (Some(context), Some(current)) = (doc_context.take(), entry.as_mut())
                        {
                            if let Some(document) = std::mem::take(&mut doc).finish(context) {
                                current.documents.push(document);
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(AdapterError::Parse(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(page)
}

fn handle_link(
    element: &BytesStart<'_>,
    entry: Option<&mut PlacspEntry>,
    next_cursor: &mut Option<String>,
) {
    let rel = attr_value(element, "rel");
    let href = attr_value(element, "href");
    match entry {
        Some(entry) => {
            if entry.link.is_none() {
                entry.link = href;
            }
        }
        None => {
            if rel.as_deref() == Some("next") && next_cursor.is_none() {
                *next_cursor = href;
            }
        }
    }
}

fn capture_for(
    local_name: &[u8],
    in_party: bool,
    in_deadline_period: bool,
    doc_context: Option<DocContext>,
) -> Option<Capture> {
    if doc_context.is_some() {
        return match local_name {
            b"ID" => Some(Capture::DocName),
            b"URI" => Some(Capture::DocUri),
            b"DocumentTypeCode" => Some(Capture::DocTypeCode),
            _ => None,
        };
    }
    match local_name {
        b"id" => Some(Capture::AtomId),
        b"title" => Some(Capture::Title),
        b"summary" => Some(Capture::Summary),
        b"updated" => Some(Capture::Updated),
        b"ContractFolderID" => Some(Capture::Expediente),
        b"ContractFolderStatusCode" => Some(Capture::StatusCode),
        b"Name" if in_party => Some(Capture::PartyName),
        b"TypeCode" => Some(Capture::TypeCode),
        b"ProcedureCode" => Some(Capture::ProcedureCode),
        b"FundingProgramCode" => Some(Capture::FundingCode),
        b"TaxExclusiveAmount" => Some(Capture::Budget),
        b"EstimatedOverallContractAmount" => Some(Capture::Estimated),
        b"CountrySubentity" => Some(Capture::Location),
        b"CountrySubentityCode" => Some(Capture::Nuts),
        b"EndDate" if in_deadline_period => Some(Capture::Deadline),
        b"ItemClassificationCode" => Some(Capture::Cpv),
        _ => None,
    }
}

fn assign_capture(entry: &mut PlacspEntry, doc: &mut DocBuilder, target: Capture, value: String) {
    let slot = match target {
        Capture::AtomId => &mut entry.atom_id,
        Capture::Title => &mut entry.title,
        Capture::Summary => &mut entry.summary,
        Capture::Updated => &mut entry.updated,
        Capture::Expediente => &mut entry.expediente,
        Capture::StatusCode => &mut entry.status_code,
        Capture::PartyName => &mut entry.contracting_body,
        Capture::TypeCode => &mut entry.type_code,
        Capture::ProcedureCode => &mut entry.procedure_code,
        Capture::FundingCode => &mut entry.funding_code,
        Capture::Budget => &mut entry.budget,
        Capture::Estimated => &mut entry.estimated,
        Capture::Location => &mut entry.location,
        Capture::Nuts => &mut entry.nuts,
        Capture::Deadline => &mut entry.deadline,
        Capture::Cpv => {
            if !entry.cpv_codes.contains(&value) {
                entry.cpv_codes.push(value);
            }
            return;
        }
        Capture::DocName => &mut doc.name,
        Capture::DocUri => &mut doc.url,
        Capture::DocTypeCode => &mut doc.type_code,
    };
    // First occurrence wins; repeated elements deeper in the entry must not
    // clobber the value already captured.
    if slot.is_none() {
        *slot = Some(value);
    }
}

/// Gencat (Plataforma de Serveis de Contractació Pública), exposed through
/// the Socrata open-data API. Offset-paginated JSON, newest first.
pub struct GencatAdapter {
    api_url: String,
    relevance: RelevanceFilter,
    page_size: usize,
}

impl Default for GencatAdapter {
    fn default() -> Self {
        Self {
            api_url: GENCAT_API_URL.to_string(),
            relevance: RelevanceFilter::gencat_defaults(),
            page_size: GENCAT_PAGE_SIZE,
        }
    }
}

impl GencatAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    pub fn with_relevance(mut self, relevance: RelevanceFilter) -> Self {
        self.relevance = relevance;
        self
    }

    /// SoQL prefilter: CPV prefix disjunction, narrowed to the recency window
    /// when one is set. Relevance and cutoff still re-apply client-side.
    fn where_clause(&self, opts: &FetchOptions) -> String {
        let cpv = self
            .relevance
            .code_prefixes
            .iter()
            .map(|p| format!("starts_with(codi_cpv, '{p}')"))
            .collect::<Vec<_>>()
            .join(" OR ");
        match opts.recent_cutoff {
            Some(cutoff) => format!(
                "({cpv}) AND data_publicacio_anunci >= '{}'",
                cutoff.format("%Y-%m-%dT00:00:00")
            ),
            None => format!("({cpv})"),
        }
    }

    fn page_url(&self, offset: usize, opts: &FetchOptions) -> Result<String, AdapterError> {
        let limit = self.page_size.to_string();
        let offset = offset.to_string();
        let filter = self.where_clause(opts);
        let url = reqwest::Url::parse_with_params(
            &self.api_url,
            &[
                ("$limit", limit.as_str()),
                ("$offset", offset.as_str()),
                ("$order", "data_publicacio_anunci DESC"),
                ("$where", filter.as_str()),
            ],
        )
        .map_err(|e| AdapterError::Parse(e.to_string()))?;
        Ok(url.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct GencatLink {
    url: Option<String>,
}

/// Raw Socrata row. Everything optional; the dataset is not consistent.
#[derive(Debug, Deserialize)]
struct GencatRecord {
    codi_expedient: Option<String>,
    denominacio: Option<String>,
    objecte_contracte: Option<String>,
    nom_organ: Option<String>,
    tipus_contracte: Option<String>,
    procediment: Option<String>,
    pressupost_licitacio_sense: Option<String>,
    valor_estimat_contracte: Option<String>,
    data_publicacio_anunci: Option<String>,
    termini_presentacio_ofertes: Option<String>,
    codi_cpv: Option<String>,
    lloc_execucio: Option<String>,
    codi_nuts: Option<String>,
    enllac_publicacio: Option<GencatLink>,
    fase_publicacio: Option<String>,
}

fn gencat_status(phase: &str) -> TenderStatus {
    let phase = phase.to_lowercase();
    if phase.contains("adjudicaci") {
        TenderStatus::Awarded
    } else if phase.contains("formalitzaci") {
        TenderStatus::Formalized
    } else if phase.contains("anul") {
        TenderStatus::Annulled
    } else {
        TenderStatus::Published
    }
}

fn map_gencat_record(record: GencatRecord) -> Option<Tender> {
    let expediente = record.codi_expedient.filter(|e| !e.is_empty())?;
    let title = record.denominacio.filter(|t| !t.is_empty())?;

    let mut tender = Tender::new(format!("{GENCAT_SOURCE}-{expediente}"), GENCAT_SOURCE, title);
    tender.expediente = Some(expediente);
    tender.summary = record.objecte_contracte.filter(|s| !s.is_empty());
    tender.contracting_body = record.nom_organ.filter(|s| !s.is_empty());
    tender.contract_type = record.tipus_contracte.filter(|s| !s.is_empty());
    tender.procedure = record.procediment.filter(|s| !s.is_empty());
    tender.base_budget = record
        .pressupost_licitacio_sense
        .as_deref()
        .and_then(parse_f64);
    tender.estimated_value = record.valor_estimat_contracte.as_deref().and_then(parse_f64);
    tender.publication_date = record
        .data_publicacio_anunci
        .as_deref()
        .and_then(parse_datetime);
    tender.updated_at = tender.publication_date;
    tender.deadline_date = record
        .termini_presentacio_ofertes
        .as_deref()
        .and_then(parse_datetime);
    tender.cpv_codes = record
        .codi_cpv
        .filter(|c| !c.is_empty())
        .map(|c| vec![c])
        .unwrap_or_default();
    tender.execution_location = record.lloc_execucio.filter(|s| !s.is_empty());
    tender.nuts_code = record.codi_nuts.filter(|s| !s.is_empty());
    tender.source_url = record.enllac_publicacio.and_then(|l| l.url);
    tender.status = record
        .fase_publicacio
        .as_deref()
        .map(gencat_status)
        .unwrap_or_default();
    Some(tender)
}

#[async_trait]
impl SourceAdapter for GencatAdapter {
    fn source(&self) -> &'static str {
        GENCAT_SOURCE
    }

    fn relevance(&self) -> &RelevanceFilter {
        &self.relevance
    }

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        cursor: Option<&str>,
        opts: &FetchOptions,
    ) -> Result<FetchedPage, AdapterError> {
        let offset: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let url = self.page_url(offset, opts)?;
        let response = http.fetch_bytes(&url).await?;

        let records: Vec<GencatRecord> = serde_json::from_slice(&response.body)
            .map_err(|e| AdapterError::Parse(e.to_string()))?;
        let scanned = records.len();

        let tenders: Vec<Tender> = records.into_iter().filter_map(map_gencat_record).collect();
        let next_cursor = if scanned < self.page_size {
            None
        } else {
            Some((offset + self.page_size).to_string())
        };

        Ok(FetchedPage {
            tenders,
            scanned,
            next_cursor,
        })
    }
}

pub fn adapter_for_source(source: &str) -> Option<Box<dyn SourceAdapter>> {
    match source {
        PLACSP_SOURCE => Some(Box::new(PlacspAdapter::new())),
        GENCAT_SOURCE => Some(Box::new(GencatAdapter::new())),
        _ => None,
    }
}

pub fn default_adapters() -> Vec<Box<dyn SourceAdapter>> {
    vec![
        Box::new(PlacspAdapter::new()),
        Box::new(GencatAdapter::new()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tenderscope_storage::HttpClientConfig;

    const PLACSP_FIXTURE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom"
      xmlns:cac="urn:dgpe:names:draft:codice:schema:xsd:CommonAggregateComponents-2"
      xmlns:cbc="urn:dgpe:names:draft:codice:schema:xsd:CommonBasicComponents-2"
      xmlns:cac-place-ext="urn:dgpe:names:draft:codice-place-ext:schema:xsd:CommonAggregateComponents-2"
      xmlns:cbc-place-ext="urn:dgpe:names:draft:codice-place-ext:schema:xsd:CommonBasicComponents-2">
  <title>Licitaciones</title>
  <link rel="next" href="https://example.test/feed?page=2"/>
  <entry>
    <id>https://example.test/lic/1001</id>
    <link href="https://example.test/lic/1001.html"/>
    <title>Desarrollo de plataforma cloud para gestión tributaria</title>
    <summary>Servicios de desarrollo software y migración cloud.</summary>
    <updated>2024-04-02T09:30:00+02:00</updated>
    <cac-place-ext:ContractFolderStatus>
      <cbc:ContractFolderID>EXP-2024-001</cbc:ContractFolderID>
      <cbc-place-ext:ContractFolderStatusCode>PUB</cbc-place-ext:ContractFolderStatusCode>
      <cac-place-ext:LocatedContractingParty>
        <cac:Party>
          <cac:PartyName><cbc:Name>Agencia Tributaria</cbc:Name></cac:PartyName>
        </cac:Party>
      </cac-place-ext:LocatedContractingParty>
      <cac:ProcurementProject>
        <cbc:TypeCode>2</cbc:TypeCode>
        <cac:RequiredCommodityClassification>
          <cbc:ItemClassificationCode>72267000-4</cbc:ItemClassificationCode>
        </cac:RequiredCommodityClassification>
        <cac:RequiredCommodityClassification>
          <cbc:ItemClassificationCode>72414000-5</cbc:ItemClassificationCode>
        </cac:RequiredCommodityClassification>
        <cac:BudgetAmount>
          <cbc:TaxExclusiveAmount currencyID="EUR">250000.00</cbc:TaxExclusiveAmount>
          <cbc:EstimatedOverallContractAmount currencyID="EUR">300000.00</cbc:EstimatedOverallContractAmount>
        </cac:BudgetAmount>
        <cac:RealizedLocation>
          <cbc:CountrySubentity>Madrid</cbc:CountrySubentity>
          <cbc:CountrySubentityCode>ES300</cbc:CountrySubentityCode>
        </cac:RealizedLocation>
      </cac:ProcurementProject>
      <cac:TenderingTerms>
        <cbc:ProcedureCode>1</cbc:ProcedureCode>
        <cbc:FundingProgramCode>NO-EU</cbc:FundingProgramCode>
        <cac:TenderSubmissionDeadlinePeriod>
          <cbc:EndDate>2024-05-10</cbc:EndDate>
        </cac:TenderSubmissionDeadlinePeriod>
      </cac:TenderingTerms>
      <cac:LegalDocumentReference>
        <cbc:ID>PCAP-EXP-2024-001.pdf</cbc:ID>
        <cbc:URI>https://example.test/docs/pcap.pdf</cbc:URI>
      </cac:LegalDocumentReference>
      <cac:TechnicalDocumentReference>
        <cbc:URI>https://example.test/docs/ppt.pdf</cbc:URI>
      </cac:TechnicalDocumentReference>
      <cac-place-ext:GeneralDocument>
        <cac-place-ext:GeneralDocumentDocumentReference>
          <cbc:ID>Anexo-I.pdf</cbc:ID>
          <cbc:DocumentTypeCode>1</cbc:DocumentTypeCode>
          <cbc:URI>https://example.test/docs/anexo1.pdf</cbc:URI>
        </cac-place-ext:GeneralDocumentDocumentReference>
      </cac-place-ext:GeneralDocument>
    </cac-place-ext:ContractFolderStatus>
  </entry>
  <entry>
    <id>https://example.test/lic/1002</id>
    <link href="https://example.test/lic/1002.html"/>
    <title>Suministro de mobiliario de oficina</title>
    <summary>Sillas y mesas para dependencias municipales.</summary>
    <updated>2024-04-01T12:00:00+02:00</updated>
    <cac-place-ext:ContractFolderStatus>
      <cbc:ContractFolderID>EXP-2024-002</cbc:ContractFolderID>
      <cbc-place-ext:ContractFolderStatusCode>ADJ</cbc-place-ext:ContractFolderStatusCode>
      <cac:ProcurementProject>
        <cbc:TypeCode>1</cbc:TypeCode>
        <cac:RequiredCommodityClassification>
          <cbc:ItemClassificationCode>39130000-2</cbc:ItemClassificationCode>
        </cac:RequiredCommodityClassification>
      </cac:ProcurementProject>
    </cac-place-ext:ContractFolderStatus>
  </entry>
</feed>"#;

    #[test]
    fn placsp_feed_maps_codice_fields() {
        let page = parse_placsp_feed(PLACSP_FIXTURE.as_bytes()).unwrap();
        assert_eq!(page.scanned, 2);
        assert_eq!(page.tenders.len(), 2);
        assert_eq!(
            page.next_cursor.as_deref(),
            Some("https://example.test/feed?page=2")
        );

        let first = &page.tenders[0];
        assert_eq!(first.external_id, "PLACSP-EXP-2024-001");
        assert_eq!(first.expediente.as_deref(), Some("EXP-2024-001"));
        assert_eq!(first.contracting_body.as_deref(), Some("Agencia Tributaria"));
        assert_eq!(first.contract_type.as_deref(), Some("Servicios"));
        assert_eq!(first.base_budget, Some(250_000.0));
        assert_eq!(first.estimated_value, Some(300_000.0));
        assert_eq!(first.cpv_codes, vec!["72267000-4", "72414000-5"]);
        assert_eq!(first.execution_location.as_deref(), Some("Madrid"));
        assert_eq!(first.nuts_code.as_deref(), Some("ES300"));
        assert_eq!(first.status, TenderStatus::Published);
        assert_eq!(first.funding_eu, None);
        assert_eq!(
            first.source_url.as_deref(),
            Some("https://example.test/lic/1001.html")
        );
        assert!(first.updated_at.is_some());
        assert!(first.deadline_date.is_some());

        let second = &page.tenders[1];
        assert_eq!(second.status, TenderStatus::Awarded);
    }

    #[test]
    fn placsp_documents_carry_kind_and_fallback_names() {
        let page = parse_placsp_feed(PLACSP_FIXTURE.as_bytes()).unwrap();
        let docs = &page.tenders[0].documents;
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0].name, "PCAP-EXP-2024-001.pdf");
        assert_eq!(docs[0].kind, DocumentKind::AdministrativeSpec);
        assert_eq!(docs[1].name, "Pliego de Prescripciones Técnicas");
        assert_eq!(docs[1].kind, DocumentKind::TechnicalSpec);
        // General document with type code 1 remaps to the technical spec kind.
        assert_eq!(docs[2].name, "Anexo-I.pdf");
        assert_eq!(docs[2].kind, DocumentKind::TechnicalSpec);
    }

    #[test]
    fn relevance_matches_code_prefix_alone() {
        let filter = RelevanceFilter::new(vec!["72".to_string()], vec![]);
        assert!(filter.is_relevant(&["72100000-6".to_string()], "Obras de pavimentado", None));
        assert!(!filter.is_relevant(&["45000000-7".to_string()], "Obras de pavimentado", None));
        assert!(!filter.is_relevant(&[], "Obras de pavimentado", None));
    }

    #[test]
    fn relevance_matches_keyword_in_summary() {
        let filter = RelevanceFilter::placsp_defaults();
        assert!(filter.is_relevant(
            &[],
            "Contrato de servicios",
            Some("Mantenimiento de la plataforma digital de cita previa"),
        ));
        assert!(!filter.is_relevant(&[], "Obras de jardinería", Some("Poda y riego")));
        // Missing text never raises and yields no signal.
        assert!(!filter.is_relevant(&[], "", None));
    }

    #[test]
    fn gencat_record_maps_to_tender() {
        let raw = r#"{
            "codi_expedient": "GO-2024-77",
            "denominacio": "Manteniment del programari de gestió acadèmica",
            "objecte_contracte": "Serveis de manteniment i evolució del programari",
            "nom_organ": "Universitat de Girona",
            "tipus_contracte": "Serveis",
            "procediment": "Obert",
            "pressupost_licitacio_sense": "95000.50",
            "valor_estimat_contracte": "190001.00",
            "data_publicacio_anunci": "2024-03-18T10:15:00.000",
            "termini_presentacio_ofertes": "2024-04-18T14:00:00.000",
            "codi_cpv": "72267000-4",
            "lloc_execucio": "Girona",
            "codi_nuts": "ES512",
            "enllac_publicacio": {"url": "https://example.test/gencat/77"},
            "fase_publicacio": "Anunci de licitació"
        }"#;
        let record: GencatRecord = serde_json::from_str(raw).unwrap();
        let tender = map_gencat_record(record).unwrap();

        assert_eq!(tender.external_id, "GENCAT-GO-2024-77");
        assert_eq!(tender.source, GENCAT_SOURCE);
        assert_eq!(tender.base_budget, Some(95_000.50));
        assert_eq!(tender.estimated_value, Some(190_001.0));
        assert_eq!(tender.cpv_codes, vec!["72267000-4"]);
        assert_eq!(tender.status, TenderStatus::Published);
        assert_eq!(
            tender.source_url.as_deref(),
            Some("https://example.test/gencat/77")
        );
        assert!(tender.publication_date.is_some());
    }

    #[test]
    fn gencat_page_url_carries_soql_prefilter() {
        let adapter = GencatAdapter::new();
        let opts = FetchOptions {
            recent_cutoff: Some(Utc.with_ymd_and_hms(2024, 4, 14, 12, 0, 0).unwrap()),
            ..FetchOptions::default()
        };
        let url = adapter.page_url(0, &opts).unwrap();
        assert!(url.contains("%24limit=100"));
        assert!(url.contains("%24offset=0"));
        let clause = adapter.where_clause(&opts);
        assert!(clause.contains("starts_with(codi_cpv, '48')"));
        assert!(clause.contains("starts_with(codi_cpv, '72')"));
        assert!(clause.contains("data_publicacio_anunci >= '2024-04-14T00:00:00'"));

        let open = adapter.where_clause(&FetchOptions::default());
        assert!(!open.contains("data_publicacio_anunci"));
    }

    #[test]
    fn gencat_phase_mapping() {
        assert_eq!(gencat_status("Anunci de licitació"), TenderStatus::Published);
        assert_eq!(gencat_status("Adjudicació"), TenderStatus::Awarded);
        assert_eq!(gencat_status("Formalització"), TenderStatus::Formalized);
        assert_eq!(gencat_status("Anul·lació"), TenderStatus::Annulled);
    }

    #[test]
    fn malformed_numbers_and_dates_fail_open_to_none() {
        assert_eq!(parse_f64("12,5"), None);
        assert_eq!(parse_f64(""), None);
        assert_eq!(parse_datetime("mañana"), None);
        assert!(parse_datetime("2024-05-10").is_some());
        assert!(parse_datetime("2024-04-02T09:30:00+02:00").is_some());
        assert!(parse_datetime("2023-07-18T14:00:00.000").is_some());
    }

    /// Scripted adapter used to exercise the default pagination loop.
    struct ScriptedAdapter {
        relevance: RelevanceFilter,
        pages: Vec<Result<FetchedPage, String>>,
    }

    impl ScriptedAdapter {
        fn new(pages: Vec<Result<FetchedPage, String>>) -> Self {
            Self {
                relevance: RelevanceFilter::new(vec![], vec!["software".to_string()]),
                pages,
            }
        }
    }

    #[async_trait]
    impl SourceAdapter for ScriptedAdapter {
        fn source(&self) -> &'static str {
            "SCRIPTED"
        }

        fn relevance(&self) -> &RelevanceFilter {
            &self.relevance
        }

        async fn fetch_page(
            &self,
            _http: &HttpFetcher,
            cursor: Option<&str>,
            _opts: &FetchOptions,
        ) -> Result<FetchedPage, AdapterError> {
            let index: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
            match self.pages.get(index) {
                Some(Ok(page)) => Ok(page.clone()),
                Some(Err(message)) => Err(AdapterError::Parse(message.clone())),
                None => Ok(FetchedPage::default()),
            }
        }
    }

    fn scripted_tender(n: usize, day: u32) -> Tender {
        let mut tender = Tender::new(
            format!("SCRIPTED-{n}"),
            "SCRIPTED",
            format!("Contrato de software {n}"),
        );
        tender.updated_at = Some(Utc.with_ymd_and_hms(2024, 4, day, 12, 0, 0).unwrap());
        tender
    }

    fn http() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn recent_window_stops_at_first_record_outside_cutoff() {
        // Ten records descending by date, one per day from April 20th down;
        // the cutoff leaves records 1-6 inside the window.
        let tenders: Vec<Tender> = (0..10).map(|i| scripted_tender(i + 1, 20 - i as u32)).collect();
        let pages = vec![Ok(FetchedPage {
            scanned: tenders.len(),
            tenders,
            next_cursor: Some("1".to_string()),
        })];
        let adapter = ScriptedAdapter::new(pages);

        let opts = FetchOptions {
            recent_cutoff: Some(Utc.with_ymd_and_hms(2024, 4, 15, 0, 0, 0).unwrap()),
            ..FetchOptions::default()
        };
        let fetched = adapter.fetch_all(&http(), &opts).await;

        let ids: Vec<&str> = fetched.iter().map(|t| t.external_id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "SCRIPTED-1",
                "SCRIPTED-2",
                "SCRIPTED-3",
                "SCRIPTED-4",
                "SCRIPTED-5",
                "SCRIPTED-6"
            ]
        );
    }

    #[tokio::test]
    async fn unparseable_timestamp_fails_open_by_inclusion() {
        let mut no_stamp = scripted_tender(2, 19);
        no_stamp.updated_at = None;
        let pages = vec![Ok(FetchedPage {
            tenders: vec![scripted_tender(1, 20), no_stamp, scripted_tender(3, 18)],
            scanned: 3,
            next_cursor: None,
        })];
        let adapter = ScriptedAdapter::new(pages);

        let opts = FetchOptions {
            recent_cutoff: Some(Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()),
            ..FetchOptions::default()
        };
        let fetched = adapter.fetch_all(&http(), &opts).await;
        assert_eq!(fetched.len(), 3);
    }

    #[tokio::test]
    async fn empty_page_with_next_cursor_ends_the_crawl() {
        let pages = vec![
            Ok(FetchedPage {
                tenders: vec![],
                scanned: 0,
                next_cursor: Some("1".to_string()),
            }),
            Ok(FetchedPage {
                tenders: vec![scripted_tender(1, 20)],
                scanned: 1,
                next_cursor: None,
            }),
        ];
        let adapter = ScriptedAdapter::new(pages);

        let fetched = adapter.fetch_all(&http(), &FetchOptions::default()).await;
        assert!(fetched.is_empty());
    }

    #[tokio::test]
    async fn fetch_error_mid_pagination_keeps_partial_results() {
        let pages = vec![
            Ok(FetchedPage {
                tenders: vec![scripted_tender(1, 20), scripted_tender(2, 19)],
                scanned: 2,
                next_cursor: Some("1".to_string()),
            }),
            Err("connection reset".to_string()),
        ];
        let adapter = ScriptedAdapter::new(pages);

        let fetched = adapter.fetch_all(&http(), &FetchOptions::default()).await;
        assert_eq!(fetched.len(), 2);
    }

    #[tokio::test]
    async fn non_relevant_records_are_dropped_from_the_stream() {
        let mut irrelevant = scripted_tender(2, 19);
        irrelevant.title = "Obras de pavimentado".to_string();
        let pages = vec![Ok(FetchedPage {
            tenders: vec![scripted_tender(1, 20), irrelevant],
            scanned: 2,
            next_cursor: None,
        })];
        let adapter = ScriptedAdapter::new(pages);

        let fetched = adapter.fetch_all(&http(), &FetchOptions::default()).await;
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].external_id, "SCRIPTED-1");
    }

    #[tokio::test]
    async fn page_limit_bounds_the_crawl() {
        let page = |n: usize| {
            Ok(FetchedPage {
                tenders: vec![scripted_tender(n, 20)],
                scanned: 1,
                next_cursor: Some((n).to_string()),
            })
        };
        let adapter = ScriptedAdapter::new(vec![page(1), page(2), page(3)]);

        let opts = FetchOptions {
            max_pages: Some(2),
            ..FetchOptions::default()
        };
        let fetched = adapter.fetch_all(&http(), &opts).await;
        assert_eq!(fetched.len(), 2);
    }
}
