use std::sync::Arc;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex_lite::Regex;

use crate::IngestConfig;
use crate::IngestError;
use crate::IngestResult;
use crate::ParseOutput;
use crate::ParsedRow;
use crate::RowError;
use crate::parse_amount_minor;
use crate::parse_date;

/// Extracted statement text plus the provider's per-line confidence in
/// the extraction. Confidences flow into the drift monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrText {
    pub text: String,
    pub line_confidences: Vec<f64>,
}

/// Pluggable OCR backend for scanned statements.
#[async_trait]
pub trait OcrProvider: Send + Sync {
    async fn extract(&self, payload: &[u8]) -> Result<OcrText, String>;
}

/// Pulls text a "PDF" upload already carries: many bank exports are
/// plain text with a pdf extension, and real PDFs often embed the page
/// text uncompressed. Returns `None` when nothing legible is found.
#[must_use]
pub fn embedded_text(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    let printable = text
        .chars()
        .filter(|ch| !ch.is_control() || *ch == '\n')
        .count();
    if printable * 10 < text.chars().count() * 9 {
        return None;
    }
    let body: String = text
        .lines()
        .map(|line| line.trim_matches(|ch: char| ch.is_control()))
        .collect::<Vec<&str>>()
        .join("\n");
    if body.trim().is_empty() { None } else { Some(body) }
}

fn statement_line() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\S+)\s+(.+?)\s+(\(?-?\$?[\d,]+\.?\d*\)?)$").ok())
        .as_ref()
}

/// Scanned/text statement parser: OCR provider first, embedded text as
/// the fallback, then a date–description–amount line grammar.
pub struct PdfStatementParser<'a> {
    config: &'a IngestConfig,
    ocr: Option<Arc<dyn OcrProvider>>,
}

impl<'a> PdfStatementParser<'a> {
    pub fn new(config: &'a IngestConfig, ocr: Option<Arc<dyn OcrProvider>>) -> Self {
        Self { config, ocr }
    }

    pub async fn parse(&self, bytes: &[u8]) -> IngestResult<ParseOutput> {
        let (text, line_confidences) = match &self.ocr {
            Some(provider) => match provider.extract(bytes).await {
                Ok(ocr) => (ocr.text, ocr.line_confidences),
                Err(provider_err) => match embedded_text(bytes) {
                    Some(text) => (text, Vec::new()),
                    None => return Err(IngestError::Ocr(provider_err)),
                },
            },
            None => match embedded_text(bytes) {
                Some(text) => (text, Vec::new()),
                None => {
                    return Err(IngestError::Ocr(
                        "no OCR provider configured and no embedded text present".into(),
                    ));
                }
            },
        };

        let mut rows = Vec::new();
        let mut row_errors = Vec::new();
        let mut ocr_confidences = Vec::new();
        let mut row_index = 0_usize;
        for (line_no, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let Some(captures) = statement_line().and_then(|re| re.captures(trimmed)) else {
                continue;
            };
            let date_raw = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
            let Some(posted_at) = parse_date(date_raw, &self.config.date_formats) else {
                // Header and footer lines fall through the grammar.
                continue;
            };
            let description = captures
                .get(2)
                .map(|m| m.as_str().trim().to_owned())
                .unwrap_or_default();
            let amount_raw = captures.get(3).map(|m| m.as_str()).unwrap_or_default();
            match parse_amount_minor(amount_raw) {
                Ok(amount_minor) => {
                    if let Some(confidence) = line_confidences.get(line_no) {
                        ocr_confidences.push(*confidence);
                    }
                    rows.push(ParsedRow {
                        row_index,
                        posted_at,
                        amount_minor,
                        currency: None,
                        description: description.clone(),
                        counterparty: Some(description),
                        memo: None,
                        mcc: None,
                        source_row_ref: format!("page-line:{}", line_no + 1),
                    });
                    row_index += 1;
                }
                Err(reason) => {
                    row_errors.push(RowError {
                        row: row_index,
                        reason,
                    });
                    row_index += 1;
                }
            }
        }

        if rows.is_empty() && row_errors.is_empty() {
            return Err(IngestError::Empty(
                "no statement lines recognized in document text".into(),
            ));
        }
        Ok(ParseOutput {
            rows,
            row_errors,
            ocr_confidences,
        })
    }
}
