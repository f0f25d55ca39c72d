//! Text extraction for uploaded documents.
//!
//! Handlers supply bytes + MIME type; this module returns plain UTF-8
//! text. Textual formats pass through, HTML is tag-stripped, PDFs go
//! through `pdf-extract`, and the OOXML family (docx/pptx/xlsx) is
//! opened as an [`OoxmlPackage`] whose XML parts feed one generic
//! element-text collector ([`element_texts`]):
//!
//! | Format | Parts read | Collected element |
//! |--------|------------|-------------------|
//! | docx | `word/document.xml` | `w:p` paragraphs |
//! | pptx | `ppt/slides/slideN.xml` | `a:p` paragraphs |
//! | xlsx | `xl/sharedStrings.xml` + `xl/worksheets/sheetN.xml` | `si` entries, resolved via cell refs |
//!
//! Extraction never panics: broken input is a permanent error and the
//! document fails cleanly. Decompression is bounded per part and per
//! deck/workbook, so a crafted archive cannot balloon memory.

use std::io::{Cursor, Read};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::MemoryError;

pub const MIME_PLAIN: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_HTML: &str = "text/html";
pub const MIME_JSON: &str = "application/json";
pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Per-part decompression cap.
const MAX_PART_BYTES: u64 = 32 * 1024 * 1024;
/// Slides read from one deck.
const MAX_SLIDES: usize = 256;
/// Worksheets read from one workbook.
const MAX_SHEETS: usize = 64;
/// Shared-string references resolved per worksheet.
const MAX_SHEET_CELLS: usize = 50_000;

/// Map an uploaded file name to a MIME type by extension.
pub fn detect_content_type(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "txt" | "text" | "log" => MIME_PLAIN,
        "md" | "markdown" => MIME_MARKDOWN,
        "htm" | "html" => MIME_HTML,
        "json" => MIME_JSON,
        "pdf" => MIME_PDF,
        "docx" => MIME_DOCX,
        "pptx" => MIME_PPTX,
        "xlsx" => MIME_XLSX,
        _ => "application/octet-stream",
    }
}

/// File extension used for artifact names, derived from the upload name.
pub fn file_extension(file_name: &str) -> &str {
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext,
        _ => "bin",
    }
}

/// Extract plain text from uploaded content.
///
/// Unsupported content types and undecodable inputs are permanent
/// errors: retrying cannot fix them, so the pipeline fails the document.
pub fn extract_text(bytes: &[u8], content_type: &str) -> Result<String, MemoryError> {
    match content_type {
        MIME_PLAIN | MIME_MARKDOWN | MIME_JSON => {
            Ok(String::from_utf8_lossy(bytes).into_owned())
        }
        MIME_HTML => extract_html(bytes),
        MIME_PDF => extract_pdf(bytes),
        MIME_DOCX => extract_docx(bytes),
        MIME_PPTX => extract_pptx(bytes),
        MIME_XLSX => extract_xlsx(bytes),
        other => Err(MemoryError::permanent(format!(
            "unsupported content type: {other}"
        ))),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, MemoryError> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| MemoryError::permanent(format!("PDF extraction failed: {e}")))
}

/// Strip markup from an HTML page, skipping `script` and `style` bodies.
fn extract_html(bytes: &[u8]) -> Result<String, MemoryError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);
    reader.config_mut().check_end_names = false;

    let mut out = String::new();
    let mut skip_depth = 0usize;
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"script" || name.as_ref() == b"style" {
                    skip_depth += 1;
                }
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if (name.as_ref() == b"script" || name.as_ref() == b"style") && skip_depth > 0 {
                    skip_depth -= 1;
                }
            }
            Ok(Event::Text(t)) if skip_depth == 0 => {
                let text = t.unescape().unwrap_or_default();
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    if !out.is_empty() {
                        out.push(' ');
                    }
                    out.push_str(trimmed);
                }
            }
            Ok(Event::Eof) => break,
            // Real-world HTML is rarely well-formed XML; keep what we have.
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn xml_error(e: impl std::fmt::Display) -> MemoryError {
    MemoryError::permanent(format!("OOXML markup error: {e}"))
}

/// An Office Open XML container: a ZIP archive of XML parts.
struct OoxmlPackage<'a> {
    archive: zip::ZipArchive<Cursor<&'a [u8]>>,
}

impl<'a> OoxmlPackage<'a> {
    fn open(bytes: &'a [u8]) -> Result<Self, MemoryError> {
        let archive = zip::ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| MemoryError::permanent(format!("not an OOXML container: {e}")))?;
        Ok(Self { archive })
    }

    /// Read a required part, bounded by [`MAX_PART_BYTES`].
    fn part(&mut self, name: &str) -> Result<Vec<u8>, MemoryError> {
        self.part_if_present(name)?
            .ok_or_else(|| MemoryError::permanent(format!("missing OOXML part '{name}'")))
    }

    /// Read an optional part, bounded by [`MAX_PART_BYTES`].
    fn part_if_present(&mut self, name: &str) -> Result<Option<Vec<u8>>, MemoryError> {
        let entry = match self.archive.by_name(name) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => return Ok(None),
            Err(e) => {
                return Err(MemoryError::permanent(format!(
                    "unreadable OOXML part '{name}': {e}"
                )))
            }
        };

        let mut out = Vec::new();
        entry
            .take(MAX_PART_BYTES + 1)
            .read_to_end(&mut out)
            .map_err(|e| MemoryError::permanent(format!("unreadable OOXML part '{name}': {e}")))?;
        if out.len() as u64 > MAX_PART_BYTES {
            return Err(MemoryError::permanent(format!(
                "OOXML part '{name}' exceeds {MAX_PART_BYTES} bytes"
            )));
        }
        Ok(Some(out))
    }

    /// Names of parts shaped `{prefix}{n}{suffix}`, sorted by `n`.
    fn numbered_parts(&mut self, prefix: &str, suffix: &str) -> Vec<String> {
        let mut numbered: Vec<(u32, String)> = self
            .archive
            .file_names()
            .filter_map(|name| {
                let n: u32 = name.strip_prefix(prefix)?.strip_suffix(suffix)?.parse().ok()?;
                Some((n, name.to_string()))
            })
            .collect();
        numbered.sort();
        numbered.into_iter().map(|(_, name)| name).collect()
    }
}

/// Concatenated character data of every `<element>` occurrence (matched
/// by local name, any namespace prefix), one string per occurrence.
/// Markup nested inside an occurrence is flattened into its string, so
/// a paragraph split across formatting runs comes back whole.
fn element_texts(xml: &[u8], element: &[u8]) -> Result<Vec<String>, MemoryError> {
    let mut reader = Reader::from_reader(xml);

    let mut texts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_error)? {
            Event::Start(e) => {
                if depth > 0 {
                    depth += 1;
                } else if e.local_name().as_ref() == element {
                    depth = 1;
                    current.clear();
                }
            }
            Event::End(_) if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    texts.push(std::mem::take(&mut current));
                }
            }
            Event::Text(t) if depth > 0 => {
                if let Ok(text) = t.unescape() {
                    current.push_str(&text);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(texts)
}

/// Trim blocks, drop empties, join with newlines.
fn join_blocks(blocks: Vec<String>) -> String {
    blocks
        .iter()
        .map(|b| b.trim())
        .filter(|b| !b.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn extract_docx(bytes: &[u8]) -> Result<String, MemoryError> {
    let mut package = OoxmlPackage::open(bytes)?;
    let body = package.part("word/document.xml")?;
    Ok(join_blocks(element_texts(&body, b"p")?))
}

fn extract_pptx(bytes: &[u8]) -> Result<String, MemoryError> {
    let mut package = OoxmlPackage::open(bytes)?;
    let mut slides = Vec::new();
    for name in package
        .numbered_parts("ppt/slides/slide", ".xml")
        .into_iter()
        .take(MAX_SLIDES)
    {
        let slide = package.part(&name)?;
        slides.push(join_blocks(element_texts(&slide, b"p")?));
    }
    Ok(join_blocks(slides))
}

fn extract_xlsx(bytes: &[u8]) -> Result<String, MemoryError> {
    let mut package = OoxmlPackage::open(bytes)?;
    // All-numeric workbooks carry no shared-strings part at all.
    let strings = match package.part_if_present("xl/sharedStrings.xml")? {
        Some(xml) => element_texts(&xml, b"si")?,
        None => Vec::new(),
    };

    let mut sheets = Vec::new();
    for name in package
        .numbered_parts("xl/worksheets/sheet", ".xml")
        .into_iter()
        .take(MAX_SHEETS)
    {
        let sheet = package.part(&name)?;
        let cells: Vec<&str> = shared_string_refs(&sheet, MAX_SHEET_CELLS)?
            .into_iter()
            .filter_map(|i| strings.get(i).map(String::as_str))
            .collect();
        sheets.push(cells.join(" "));
    }
    Ok(join_blocks(sheets))
}

/// Shared-string table indices referenced by a worksheet, in document
/// order, capped at `limit`.
fn shared_string_refs(xml: &[u8], limit: usize) -> Result<Vec<usize>, MemoryError> {
    let mut reader = Reader::from_reader(xml);

    let mut refs = Vec::new();
    let mut in_shared_cell = false;
    let mut in_value = false;
    let mut buf = Vec::new();
    while refs.len() < limit {
        match reader.read_event_into(&mut buf).map_err(xml_error)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"c" => in_shared_cell = cell_holds_shared_string(&e)?,
                b"v" => in_value = true,
                _ => {}
            },
            Event::End(e) => match e.local_name().as_ref() {
                b"c" => in_shared_cell = false,
                b"v" => in_value = false,
                _ => {}
            },
            Event::Text(t) if in_value && in_shared_cell => {
                if let Ok(value) = t.unescape() {
                    if let Ok(index) = value.trim().parse() {
                        refs.push(index);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(refs)
}

/// A cell stores a shared-string reference when its `t` attribute is `s`.
fn cell_holds_shared_string(cell: &BytesStart) -> Result<bool, MemoryError> {
    Ok(cell
        .try_get_attribute("t")
        .map_err(xml_error)?
        .map(|attr| attr.value.as_ref() == b"s")
        .unwrap_or(false))
}
