//! Site adapter for the company listing + detail pages: URL building, listing id
//! extraction and best-effort detail parsing.

use std::path::Path;
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use harvest_core::{BatchError, CompanyRecord, PLACEHOLDER};
use harvest_storage::{FetchError, HttpFetcher};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "harvest-adapters";

const LISTING_LINK_SELECTOR: &str = "a.link_tit";
const COMPANY_TITLE_SELECTOR: &str = "h1.tit_company";
const DETAILS_GROUP_SELECTOR: &str = "div.company_details_group";
const SUMMARY_ITEM_SELECTOR: &str = "ul.company_summary li.company_summary_item";
const LOGO_IMG_SELECTOR: &str = "div.box_logo img";

const LABEL_EXECUTIVE: &str = "대표자명";
const LABEL_INDUSTRY: &str = "업종";
const LABEL_ADDRESS: &str = "주소";
const LABEL_HOMEPAGE: &str = "홈페이지";
const LABEL_SALES: &str = "매출액";

static IDENTIFIER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"csn=([^&]+)").expect("valid identifier regex"));

/// Parenthetical groups (and the whitespace after them) plus the corporate suffix.
static COMPANY_NOISE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\([^)]*\)\s*|주식회사\s*").expect("valid company name regex"));

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
}

impl From<AdapterError> for BatchError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Fetch(err) => err.into(),
            other @ AdapterError::Selector { .. } => BatchError::IllegalArgument(other.to_string()),
        }
    }
}

/// Paginated listing of entity identifiers.
#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn fetch_identifiers(&self, page: u32) -> Result<Vec<String>, AdapterError>;
}

/// Per-entity detail page.
#[async_trait]
pub trait DetailSource: Send + Sync {
    async fn fetch_company(&self, identifier: &str) -> Result<CompanyRecord, AdapterError>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// `{page}` is substituted with the 1-based page number.
    pub listing_url_template: String,
    /// `{id}` is substituted with the entity identifier.
    pub detail_url_template: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            listing_url_template: "https://www.saramin.co.kr/zf_user/salaries/total-salary/list?page={page}&order=reg_dt&industry_cd=&company_cd=&rec_status=&group_cd=0&search_company_nm_org=&search_company_nm=&min_salary=1000&max_salary=10000&request_modify_company_nm=".to_string(),
            detail_url_template: "https://www.saramin.co.kr/zf_user/company-info/view?csn={id}"
                .to_string(),
        }
    }
}

impl SiteConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn listing_url(&self, page: u32) -> String {
        self.listing_url_template
            .replace("{page}", &page.to_string())
    }

    pub fn detail_url(&self, identifier: &str) -> String {
        self.detail_url_template.replace("{id}", identifier)
    }
}

/// Live site: both sources backed by one shared fetcher.
#[derive(Debug, Clone)]
pub struct HtmlCompanySite {
    http: Arc<HttpFetcher>,
    config: SiteConfig,
}

impl HtmlCompanySite {
    pub fn new(http: Arc<HttpFetcher>, config: SiteConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl ListingSource for HtmlCompanySite {
    async fn fetch_identifiers(&self, page: u32) -> Result<Vec<String>, AdapterError> {
        let url = self.config.listing_url(page);
        let fetched = self.http.fetch_text(&url).await.inspect_err(|err| {
            warn!(page, error = %err, "listing page fetch failed");
        })?;
        let ids = parse_listing_identifiers(&fetched.body)?;
        info!(page, count = ids.len(), "found company identifiers");
        Ok(ids)
    }
}

#[async_trait]
impl DetailSource for HtmlCompanySite {
    async fn fetch_company(&self, identifier: &str) -> Result<CompanyRecord, AdapterError> {
        let url = self.config.detail_url(identifier);
        let fetched = self.http.fetch_text(&url).await?;
        parse_company_detail(&fetched.body)
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

/// Text content with whitespace runs collapsed, `None` when blank.
fn text_or_none(element: ElementRef<'_>) -> Option<String> {
    let text = element.text().collect::<Vec<_>>().join(" ");
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn select_first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope.select(sel).next().and_then(text_or_none)
}

pub fn extract_identifier(href: &str) -> Option<String> {
    IDENTIFIER_PATTERN
        .captures(href)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Identifiers of every listing entry, in document order. Links without an id are skipped.
pub fn parse_listing_identifiers(html: &str) -> Result<Vec<String>, AdapterError> {
    let document = Html::parse_document(html);
    let links = selector(LISTING_LINK_SELECTOR)?;
    Ok(document
        .select(&links)
        .filter_map(|link| link.value().attr("href"))
        .filter_map(extract_identifier)
        .collect())
}

pub fn clean_company_name(raw: &str) -> String {
    COMPANY_NOISE_PATTERN.replace_all(raw, "").trim().to_string()
}

/// Parse one detail page. Each field is looked up on its own; anything missing stays
/// [`PLACEHOLDER`].
pub fn parse_company_detail(html: &str) -> Result<CompanyRecord, AdapterError> {
    let document = Html::parse_document(html);
    let root = document.root_element();
    let mut record = CompanyRecord::placeholder();

    let title = selector(COMPANY_TITLE_SELECTOR)?;
    match root
        .select(&title)
        .next()
        .and_then(|h1| h1.value().attr("title"))
    {
        Some(raw) => {
            record.company = clean_company_name(raw);
            debug!(company = %record.company, "parsed company name");
        }
        None => warn!("company title element not found"),
    }

    let groups = selector(DETAILS_GROUP_SELECTOR)?;
    let label = selector("dt.tit")?;
    let desc = selector("dd.desc")?;
    let address_line = selector("p.ellipsis")?;
    for group in root.select(&groups) {
        let Some(label_text) = select_first_text(group, &label) else {
            continue;
        };
        let Some(desc_el) = group.select(&desc).next() else {
            continue;
        };
        let slot = match label_text.as_str() {
            LABEL_EXECUTIVE => (&mut record.key_executive, text_or_none(desc_el)),
            LABEL_INDUSTRY => (&mut record.industry, text_or_none(desc_el)),
            LABEL_ADDRESS => (
                &mut record.address,
                select_first_text(desc_el, &address_line),
            ),
            LABEL_HOMEPAGE => (&mut record.homepage, text_or_none(desc_el)),
            _ => continue,
        };
        if let (field, Some(value)) = slot {
            *field = value;
        }
    }

    let summary_items = selector(SUMMARY_ITEM_SELECTOR)?;
    let summary_label = selector("p.company_summary_desc")?;
    let summary_value = selector("strong.company_summary_tit")?;
    for item in root.select(&summary_items) {
        if select_first_text(item, &summary_label).as_deref() == Some(LABEL_SALES) {
            if let Some(sales) = select_first_text(item, &summary_value) {
                record.sales = sales;
            }
        }
    }

    let logo = selector(LOGO_IMG_SELECTOR)?;
    if let Some(src) = root
        .select(&logo)
        .next()
        .and_then(|img| img.value().attr("src"))
        .filter(|src| !src.trim().is_empty())
    {
        record.logo_url = src.trim().to_string();
    }

    if record.company == PLACEHOLDER {
        debug!("detail page parsed without a company name");
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = include_str!("../../../fixtures/listing_page.html");
    const LISTING_EMPTY: &str = include_str!("../../../fixtures/listing_page_empty.html");
    const DETAIL: &str = include_str!("../../../fixtures/company_detail.html");
    const DETAIL_SPARSE: &str = include_str!("../../../fixtures/company_detail_sparse.html");

    #[test]
    fn listing_ids_come_from_link_targets_in_order() {
        let ids = parse_listing_identifiers(LISTING).unwrap();
        assert_eq!(ids, vec!["QUFBQUFB", "1234567890", "ZZ99"]);
    }

    #[test]
    fn empty_listing_page_yields_no_ids() {
        assert!(parse_listing_identifiers(LISTING_EMPTY).unwrap().is_empty());
    }

    #[test]
    fn identifier_pattern_stops_at_next_parameter() {
        assert_eq!(extract_identifier("view?csn=abc&x=1").as_deref(), Some("abc"));
        assert_eq!(extract_identifier("view?x=1"), None);
    }

    #[test]
    fn company_name_cleanup_strips_parentheses_and_suffix() {
        assert_eq!(clean_company_name("(주)피크데이터 (PeakData)"), "피크데이터");
        assert_eq!(clean_company_name("주식회사 바다물산"), "바다물산");
        assert_eq!(clean_company_name("Acme"), "Acme");
    }

    #[test]
    fn full_detail_page_populates_every_extracted_field() {
        let record = parse_company_detail(DETAIL).unwrap();
        assert_eq!(record.company, "피크데이터");
        assert_eq!(record.key_executive, "김 대표");
        assert_eq!(record.industry, "응용 소프트웨어 개발 및 공급업");
        assert_eq!(record.address, "서울 강남구 테헤란로 123");
        assert_eq!(record.homepage, "https://peak.example.co.kr");
        assert_eq!(record.sales, "1,234억 5,600만원");
        assert_eq!(
            record.logo_url,
            "https://pds.saramin.co.kr/company/logo/peak.png"
        );
        assert_eq!(record.email, PLACEHOLDER);
        assert_eq!(record.phone_number, PLACEHOLDER);
        assert_eq!(record.total_funding, PLACEHOLDER);
        assert_eq!(record.id, None);
    }

    #[test]
    fn missing_fields_fall_back_to_placeholder_independently() {
        let record = parse_company_detail(DETAIL_SPARSE).unwrap();
        assert_eq!(record.company, "바다물산");
        assert_eq!(record.industry, "수산물 도매업");
        // address present but without the ellipsis line
        assert_eq!(record.address, PLACEHOLDER);
        assert_eq!(record.key_executive, PLACEHOLDER);
        assert_eq!(record.homepage, PLACEHOLDER);
        assert_eq!(record.sales, PLACEHOLDER);
        assert_eq!(record.logo_url, PLACEHOLDER);
    }

    #[test]
    fn garbage_document_is_all_placeholders() {
        let record = parse_company_detail("<html><body><p>maintenance</p></body></html>").unwrap();
        assert_eq!(record, CompanyRecord::placeholder());
    }

    #[test]
    fn site_config_substitutes_templates_and_reads_yaml_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("site.yaml");
        std::fs::write(
            &path,
            "listing_url_template: \"http://localhost/list?p={page}\"\n",
        )
        .unwrap();
        let config = SiteConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.listing_url(3), "http://localhost/list?p=3");
        assert_eq!(
            config.detail_url("XY"),
            "https://www.saramin.co.kr/zf_user/company-info/view?csn=XY"
        );
    }

    #[test]
    fn selector_failures_are_contract_violations() {
        let err: BatchError = selector("a[[").unwrap_err().into();
        assert_eq!(err.kind(), harvest_core::ErrorKind::IllegalArgument);
    }
}
