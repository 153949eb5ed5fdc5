use std::collections::HashMap;

use chrono::NaiveDate;

use crate::IngestConfig;
use crate::IngestError;
use crate::IngestResult;
use crate::ParseOutput;
use crate::ParsedRow;
use crate::RowError;
use crate::parse_amount_minor;

/// OFX/QFX statement scanner. The wire format is SGML-ish: one
/// `<TAG>value` per line, `STMTTRN` blocks not always closed.
pub struct OfxStatementParser<'a> {
    #[allow(dead_code)]
    config: &'a IngestConfig,
}

impl<'a> OfxStatementParser<'a> {
    pub fn new(config: &'a IngestConfig) -> Self {
        Self { config }
    }

    pub fn parse(&self, bytes: &[u8]) -> IngestResult<ParseOutput> {
        let text = String::from_utf8_lossy(bytes);
        let mut currency: Option<String> = None;
        let mut current: HashMap<String, String> = HashMap::new();
        let mut in_transaction = false;
        let mut rows = Vec::new();
        let mut row_errors = Vec::new();
        let mut block_index = 0_usize;

        let mut flush = |fields: &mut HashMap<String, String>,
                         block_index: usize,
                         currency: Option<&str>,
                         rows: &mut Vec<ParsedRow>,
                         row_errors: &mut Vec<RowError>| {
            if fields.is_empty() {
                return;
            }
            match build_row(fields, block_index, currency) {
                Ok(row) => rows.push(row),
                Err(reason) => row_errors.push(RowError {
                    row: block_index,
                    reason,
                }),
            }
            fields.clear();
        };

        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.eq_ignore_ascii_case("<STMTTRN>") {
                if in_transaction {
                    flush(&mut current, block_index, currency.as_deref(), &mut rows, &mut row_errors);
                    block_index += 1;
                }
                in_transaction = true;
                continue;
            }
            if trimmed.eq_ignore_ascii_case("</STMTTRN>") {
                if in_transaction {
                    flush(&mut current, block_index, currency.as_deref(), &mut rows, &mut row_errors);
                    block_index += 1;
                }
                in_transaction = false;
                continue;
            }
            if let Some((tag, value)) = split_tag(trimmed) {
                if tag.eq_ignore_ascii_case("CURDEF") {
                    currency = Some(value.to_uppercase());
                } else if in_transaction {
                    current.insert(tag.to_uppercase(), value.to_owned());
                }
            }
        }
        if in_transaction {
            flush(&mut current, block_index, currency.as_deref(), &mut rows, &mut row_errors);
        }

        if rows.is_empty() && row_errors.is_empty() {
            return Err(IngestError::Empty(
                "OFX payload did not contain any STMTTRN blocks".into(),
            ));
        }
        Ok(ParseOutput {
            rows,
            row_errors,
            ocr_confidences: Vec::new(),
        })
    }
}

fn build_row(
    fields: &HashMap<String, String>,
    block_index: usize,
    currency: Option<&str>,
) -> Result<ParsedRow, String> {
    let amount_raw = fields
        .get("TRNAMT")
        .ok_or_else(|| "OFX block missing TRNAMT".to_owned())?;
    let amount_minor = parse_amount_minor(amount_raw)?;
    let date_raw = fields
        .get("DTPOSTED")
        .ok_or_else(|| "OFX block missing DTPOSTED".to_owned())?;
    let posted_at = parse_ofx_date(date_raw)?;
    let description = fields
        .get("NAME")
        .or_else(|| fields.get("MEMO"))
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| "OFX block missing NAME and MEMO".to_owned())?;
    let memo = fields
        .get("MEMO")
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty() && *value != description);
    let fitid = fields
        .get("FITID")
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty());

    Ok(ParsedRow {
        row_index: block_index,
        posted_at,
        amount_minor,
        currency: fields
            .get("CURRENCY")
            .map(|value| value.trim().to_uppercase())
            .filter(|value| !value.is_empty())
            .or_else(|| currency.map(str::to_owned)),
        description: description.clone(),
        counterparty: fields
            .get("NAME")
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty()),
        memo,
        mcc: fields
            .get("SIC")
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty()),
        source_row_ref: match fitid {
            Some(id) => format!("fitid:{id}"),
            None => format!("stmttrn:{block_index}"),
        },
    })
}

fn split_tag(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix('<')?;
    let end = rest.find('>')?;
    let name = &rest[..end];
    if name.starts_with('/') {
        return None;
    }
    let value = rest[end + 1..].trim();
    if value.is_empty() {
        return None;
    }
    Some((name, value))
}

fn parse_ofx_date(raw: &str) -> Result<NaiveDate, String> {
    let digits: String = raw.trim().chars().take_while(char::is_ascii_digit).collect();
    if digits.len() < 8 {
        return Err(format!("invalid OFX date {raw:?}"));
    }
    NaiveDate::parse_from_str(&digits[..8], "%Y%m%d")
        .map_err(|err| format!("invalid OFX date {raw:?}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_stmttrn_blocks() {
        let config = IngestConfig::default();
        let output = OfxStatementParser::new(&config)
            .parse(include_bytes!("../tests/fixtures/sample.ofx"))
            .expect("parse");

        assert_eq!(output.rows.len(), 2);
        let first = &output.rows[0];
        assert_eq!(first.amount_minor, -1245);
        assert_eq!(
            first.posted_at,
            NaiveDate::from_ymd_opt(2025, 10, 15).expect("valid date")
        );
        assert_eq!(first.currency.as_deref(), Some("USD"));
        assert_eq!(first.source_row_ref, "fitid:OFX-100");
        assert_eq!(output.rows[1].amount_minor, 50_000);
    }

    #[test]
    fn missing_amount_is_a_row_error_not_a_batch_failure() {
        let config = IngestConfig::default();
        let payload = "\
<OFX>
<CURDEF>USD
<STMTTRN>
<FITID>A-1
<DTPOSTED>20251001
<NAME>Coffee
<TRNAMT>-4.50
</STMTTRN>
<STMTTRN>
<FITID>A-2
<DTPOSTED>20251002
<NAME>Broken
</STMTTRN>
</OFX>
";
        let output = OfxStatementParser::new(&config)
            .parse(payload.as_bytes())
            .expect("parse");
        assert_eq!(output.rows.len(), 1);
        assert_eq!(output.row_errors.len(), 1);
        assert!(output.row_errors[0].reason.contains("TRNAMT"));
    }

    #[test]
    fn empty_payload_is_an_error() {
        let config = IngestConfig::default();
        assert!(matches!(
            OfxStatementParser::new(&config).parse(b"<OFX></OFX>"),
            Err(IngestError::Empty(_))
        ));
    }

    #[test]
    fn ofx_dates_tolerate_timezone_suffixes() {
        assert_eq!(
            parse_ofx_date("20251015120000[0:GMT]").expect("parse"),
            NaiveDate::from_ymd_opt(2025, 10, 15).expect("valid date")
        );
        assert!(parse_ofx_date("2025").is_err());
    }
}
