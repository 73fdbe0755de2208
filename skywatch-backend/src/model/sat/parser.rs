///! Parsers for the remote catalog formats
///!
///! - element-set text: repeated groups of a title line and two fixed-width
///!   data lines
///! - CCSDS OMM XML: per-object metadata (name, international designator,
///!   epoch) keyed by NORAD catalog number
use chrono::NaiveDateTime;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::error::ParseError;

/// Minimum length of a data line, checksum column included
const DATA_LINE_LEN: usize = 69;

/// Line number, catalog number (columns 3-7) and classification/space
static DATA_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^([12]) ([0-9A-Z ]{5})[A-Z ]").ok());

const OMM_EPOCH_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// One validated element set from the catalog text
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedElementSet {
    pub catalog_id: String,
    pub name: String,
    /// Title, line 1 and line 2 joined with `\n`
    pub element_set: String,
}

/// Result of parsing an element-set document
#[derive(Debug, Default)]
pub struct ElementSetParse {
    pub entries: Vec<ParsedElementSet>,
    /// One entry per run of unparseable lines
    pub errors: Vec<ParseError>,
}

/// Metadata for one object from the OMM document
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogMetadata {
    pub catalog_id: String,
    pub name: String,
    pub international_designator: Option<String>,
    pub epoch: Option<NaiveDateTime>,
}

#[derive(Debug, Default)]
pub struct MetadataParse {
    pub entries: Vec<CatalogMetadata>,
    pub errors: Vec<ParseError>,
}

impl MetadataParse {
    /// Index the entries by catalog id for joining with element sets
    pub fn into_map(self) -> HashMap<String, CatalogMetadata> {
        self.entries
            .into_iter()
            .map(|entry| (entry.catalog_id.clone(), entry))
            .collect()
    }
}

/// Normalize a catalog number to the zero-padded 5-column form used by the
/// element-set lines. Alpha-5 ids are passed through.
pub fn normalize_catalog_id(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.parse::<u32>() {
        Ok(number) => format!("{:05}", number),
        Err(_) => trimmed.to_string(),
    }
}

/// Modulo-10 checksum over the first 68 columns: digits count their value,
/// minus signs count one, everything else zero.
pub fn element_line_checksum(line: &str) -> u32 {
    line.chars()
        .take(DATA_LINE_LEN - 1)
        .map(|c| match c {
            '0'..='9' => c as u32 - '0' as u32,
            '-' => 1,
            _ => 0,
        })
        .sum::<u32>()
        % 10
}

/// Validate one data line and return its catalog number
fn validate_data_line(line: &str, expected: char) -> Result<String, String> {
    if line.chars().count() < DATA_LINE_LEN {
        return Err(format!(
            "line {} is {} characters, expected {}",
            expected,
            line.chars().count(),
            DATA_LINE_LEN
        ));
    }

    let re = DATA_LINE
        .as_ref()
        .ok_or_else(|| "data line pattern failed to compile".to_string())?;
    let caps = re
        .captures(line)
        .ok_or_else(|| format!("line {} has an unexpected layout", expected))?;
    if !caps[1].starts_with(expected) {
        return Err(format!("expected line {}, found line {}", expected, &caps[1]));
    }

    let declared = line
        .chars()
        .nth(DATA_LINE_LEN - 1)
        .and_then(|c| c.to_digit(10))
        .ok_or_else(|| format!("line {} has no checksum digit", expected))?;
    let computed = element_line_checksum(line);
    if declared != computed {
        return Err(format!(
            "line {} checksum mismatch: declared {}, computed {}",
            expected, declared, computed
        ));
    }

    Ok(caps[2].trim().to_string())
}

fn parse_group(title: &str, line1: &str, line2: &str) -> Result<ParsedElementSet, String> {
    let id1 = validate_data_line(line1, '1')?;
    let id2 = validate_data_line(line2, '2')?;
    if id1 != id2 {
        return Err(format!("catalog numbers differ: {} vs {}", id1, id2));
    }

    // 3LE sources prefix the title with "0 "
    let name = title.strip_prefix("0 ").unwrap_or(title).trim();
    if name.is_empty() {
        return Err("empty title line".to_string());
    }

    Ok(ParsedElementSet {
        catalog_id: normalize_catalog_id(&id1),
        name: name.to_string(),
        element_set: format!("{}\n{}\n{}", name, line1, line2),
    })
}

/// Parse a 3-line element-set document
///
/// Malformed groups are skipped: the parser advances one line at a time
/// until it finds a valid group again, so one damaged entry never takes
/// its neighbours with it.
pub fn parse_element_sets(text: &str) -> ElementSetParse {
    let lines: Vec<(usize, &str)> = text
        .lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim_end()))
        .filter(|(_, line)| !line.trim().is_empty())
        .collect();

    let mut result = ElementSetParse::default();
    let mut resyncing = false;
    let mut i = 0;

    while i < lines.len() {
        let (line_no, title) = lines[i];

        let outcome = match (lines.get(i + 1), lines.get(i + 2)) {
            (Some((_, line1)), Some((_, line2))) => parse_group(title.trim(), line1, line2),
            _ => Err("truncated element set".to_string()),
        };

        match outcome {
            Ok(entry) => {
                result.entries.push(entry);
                resyncing = false;
                i += 3;
            }
            Err(reason) => {
                if !resyncing {
                    tracing::debug!("Skipping malformed element set near line {}: {}", line_no, reason);
                    result.errors.push(ParseError::MalformedElementSet {
                        line: line_no,
                        reason,
                    });
                    resyncing = true;
                }
                i += 1;
            }
        }
    }

    result
}

fn selector(css: &str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|e| ParseError::Selector(format!("{}: {:?}", css, e)))
}

fn child_text(element: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    element
        .select(selector)
        .next()
        .map(|node| node.text().collect::<String>().trim().to_string())
        .filter(|text| !text.is_empty())
}

fn parse_omm_epoch(raw: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(raw.trim().trim_end_matches('Z'), OMM_EPOCH_FORMAT)
}

/// Parse a CCSDS OMM XML document (one `<omm>` element per object)
///
/// Entries missing the catalog number or name, or carrying an unparseable
/// epoch, are reported and skipped.
pub fn parse_catalog_xml(xml: &str) -> Result<MetadataParse, ParseError> {
    // The HTML parser lowercases tag names, so OBJECT_NAME becomes object_name
    let document = Html::parse_document(xml);
    let omm = selector("omm")?;
    let object_name = selector("object_name")?;
    let object_id = selector("object_id")?;
    let norad_cat_id = selector("norad_cat_id")?;
    let epoch_tag = selector("epoch")?;

    let mut result = MetadataParse::default();
    for (index, element) in document.select(&omm).enumerate() {
        let malformed = |reason: String| ParseError::MalformedMetadata { index, reason };

        let Some(catalog_id) = child_text(&element, &norad_cat_id) else {
            result.errors.push(malformed("missing NORAD_CAT_ID".to_string()));
            continue;
        };
        let Some(name) = child_text(&element, &object_name) else {
            result
                .errors
                .push(malformed(format!("missing OBJECT_NAME for {}", catalog_id)));
            continue;
        };
        let epoch = match child_text(&element, &epoch_tag).map(|raw| parse_omm_epoch(&raw)) {
            Some(Ok(parsed)) => Some(parsed),
            Some(Err(e)) => {
                result
                    .errors
                    .push(malformed(format!("bad EPOCH for {}: {}", catalog_id, e)));
                continue;
            }
            None => None,
        };

        result.entries.push(CatalogMetadata {
            catalog_id: normalize_catalog_id(&catalog_id),
            name,
            international_designator: child_text(&element, &object_id),
            epoch,
        });
    }

    for error in &result.errors {
        tracing::debug!("Skipping catalog metadata entry: {}", error);
    }
    Ok(result)
}
