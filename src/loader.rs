//! Document readers for PDF, DOCX, plain text, Markdown, and CSV.
//!
//! [`load_document`] picks a reader from the file extension and returns a
//! [`Document`] with plain UTF-8 text. Readers never panic on bad input: an
//! unknown extension yields [`Error::UnsupportedFormat`] and a file that
//! cannot be parsed yields [`Error::Extraction`], so ingestion can skip the
//! file and continue.

use std::io::Read;
use std::path::Path;

use crate::error::{Error, Result};
use crate::models::{Document, DocumentFormat};

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Load a single file as a [`Document`].
pub fn load_document(path: &Path) -> Result<Document> {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_default();
    let format =
        DocumentFormat::from_extension(&extension).ok_or_else(|| Error::UnsupportedFormat {
            path: path.to_path_buf(),
            extension: extension.clone(),
        })?;

    let bytes = std::fs::read(path)?;
    let text = extract_text(&bytes, format).map_err(|message| Error::Extraction {
        path: path.to_path_buf(),
        message,
    })?;
    Ok(Document::new(path, format, text))
}

/// Extract plain text from file contents of a known format.
pub fn extract_text(bytes: &[u8], format: DocumentFormat) -> std::result::Result<String, String> {
    match format {
        DocumentFormat::Pdf => extract_pdf(bytes),
        DocumentFormat::Docx => extract_docx(bytes),
        DocumentFormat::Txt | DocumentFormat::Markdown => extract_utf8(bytes),
        DocumentFormat::Csv => extract_csv(bytes),
    }
}

fn extract_utf8(bytes: &[u8]) -> std::result::Result<String, String> {
    let text = std::str::from_utf8(bytes).map_err(|e| format!("invalid UTF-8: {}", e))?;
    Ok(text.strip_prefix('\u{feff}').unwrap_or(text).to_string())
}

fn extract_pdf(bytes: &[u8]) -> std::result::Result<String, String> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| format!("PDF extraction failed: {}", e))
}

fn extract_docx(bytes: &[u8]) -> std::result::Result<String, String> {
    let mut archive =
        zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| e.to_string())?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| "word/document.xml not found".to_string())?;

    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| e.to_string())?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err("word/document.xml exceeds size limit".to_string());
    }
    docx_paragraphs(&xml)
}

/// Collect `<w:t>` runs, one line per `<w:p>` paragraph.
fn docx_paragraphs(xml: &[u8]) -> std::result::Result<String, String> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                current.push_str(&te.unescape().map_err(|e| e.to_string())?);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    if !current.trim().is_empty() {
                        paragraphs.push(std::mem::take(&mut current));
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"tab" => current.push('\t'),
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("DOCX XML error: {}", e)),
            _ => {}
        }
        buf.clear();
    }
    if !current.trim().is_empty() {
        paragraphs.push(current);
    }
    Ok(paragraphs.join("\n"))
}

/// Render each record as `header: value` lines, records separated by a blank line.
fn extract_csv(bytes: &[u8]) -> std::result::Result<String, String> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);
    let headers = reader.headers().map_err(|e| e.to_string())?.clone();

    let mut records = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| e.to_string())?;
        let lines: Vec<String> = record
            .iter()
            .enumerate()
            .filter(|(_, value)| !value.trim().is_empty())
            .map(|(i, value)| match headers.get(i) {
                Some(h) if !h.is_empty() => format!("{}: {}", h, value),
                _ => value.to_string(),
            })
            .collect();
        if !lines.is_empty() {
            records.push(lines.join("\n"));
        }
    }
    Ok(records.join("\n\n"))
}
