//! Document extraction: uploaded bytes + declared type → plain resume text.

use std::io::{Cursor, Read};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;
use tracing::warn;

const DOCX_MIME: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// Upper bound on the decompressed size of `word/document.xml`.
const MAX_DOCX_XML_BYTES: u64 = 32 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("Corrupt document: {0}")]
    CorruptInput(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    Docx,
    PlainText,
}

impl DocumentFormat {
    /// Picks a format from the declared MIME type. Only a generic MIME type
    /// (`application/octet-stream` or none) defers to the filename extension.
    pub fn detect(declared_mime: &str, filename: &str) -> Result<Self, ExtractError> {
        let essence = declared_mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match essence.as_str() {
            "application/pdf" => Ok(DocumentFormat::Pdf),
            DOCX_MIME => Ok(DocumentFormat::Docx),
            "text/plain" | "text/markdown" => Ok(DocumentFormat::PlainText),
            "" | "application/octet-stream" => Self::from_extension(filename),
            other => Err(ExtractError::UnsupportedFormat(other.to_string())),
        }
    }

    fn from_extension(filename: &str) -> Result<Self, ExtractError> {
        let extension = Path::new(filename)
            .extension()
            .and_then(|v| v.to_str())
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "pdf" => Ok(DocumentFormat::Pdf),
            "docx" => Ok(DocumentFormat::Docx),
            "txt" | "md" | "text" => Ok(DocumentFormat::PlainText),
            _ => Err(ExtractError::UnsupportedFormat(format!(
                "unrecognised file type: {filename}"
            ))),
        }
    }
}

/// Bytes + declared MIME type → text. Implementations are synchronous and may be
/// CPU-heavy; async callers run them on the blocking pool.
pub trait DocumentExtractor: Send + Sync {
    fn extract(
        &self,
        bytes: &[u8],
        declared_mime: &str,
        filename: &str,
    ) -> Result<String, ExtractError>;
}

/// Handles PDF, DOCX and plain-text uploads.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileExtractor;

impl DocumentExtractor for FileExtractor {
    fn extract(
        &self,
        bytes: &[u8],
        declared_mime: &str,
        filename: &str,
    ) -> Result<String, ExtractError> {
        let text = match DocumentFormat::detect(declared_mime, filename)? {
            DocumentFormat::Pdf => extract_pdf_text(bytes)?,
            DocumentFormat::Docx => extract_docx_text(bytes)?,
            DocumentFormat::PlainText => String::from_utf8(bytes.to_vec())
                .map_err(|e| ExtractError::CorruptInput(format!("text is not UTF-8: {e}")))?,
        };

        let text = text.trim();
        if text.is_empty() {
            return Err(ExtractError::CorruptInput(format!(
                "{filename} contains no extractable text"
            )));
        }
        Ok(text.to_string())
    }
}

/// pdf-extract panics on some malformed documents (missing `MediaBox`, broken
/// font encodings). A panic is reported as corrupt input like any parse error.
fn extract_pdf_text(data: &[u8]) -> Result<String, ExtractError> {
    match panic::catch_unwind(AssertUnwindSafe(|| pdf_extract::extract_text_from_mem(data))) {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(ExtractError::CorruptInput(format!("PDF: {e}"))),
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown parser failure".to_string());
            warn!("PDF parser panicked: {reason}");
            Err(ExtractError::CorruptInput(format!("PDF could not be parsed ({reason})")))
        }
    }
}

fn corrupt_docx(e: &dyn std::fmt::Display) -> ExtractError {
    ExtractError::CorruptInput(format!("DOCX: {e}"))
}

/// Decompresses `word/document.xml`, refusing anything larger than `limit` bytes.
fn read_document_xml(data: &[u8], limit: u64) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data)).map_err(|e| corrupt_docx(&e))?;
    let document_file = archive
        .by_name("word/document.xml")
        .map_err(|e| corrupt_docx(&e))?;

    let mut xml = String::new();
    document_file
        .take(limit + 1)
        .read_to_string(&mut xml)
        .map_err(|e| corrupt_docx(&e))?;
    if xml.len() as u64 > limit {
        return Err(ExtractError::CorruptInput(format!(
            "DOCX: word/document.xml exceeds {limit} bytes"
        )));
    }
    Ok(xml)
}

/// Reads `word/document.xml` and emits one line per non-empty paragraph.
fn extract_docx_text(data: &[u8]) -> Result<String, ExtractError> {
    let xml = read_document_xml(data, MAX_DOCX_XML_BYTES)?;

    let mut reader = Reader::from_str(&xml);
    let mut current = String::new();
    let mut lines = Vec::new();
    let mut in_paragraph = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"w:p" => {
                in_paragraph = true;
                current.clear();
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"w:p" => {
                if !current.trim().is_empty() {
                    lines.push(current.trim().to_string());
                }
                current.clear();
                in_paragraph = false;
            }
            Ok(Event::Empty(e)) if in_paragraph && e.name().as_ref() == b"w:tab" => {
                current.push('\t');
            }
            Ok(Event::Text(e)) if in_paragraph => {
                let value = e.xml_content().map_err(|e| corrupt_docx(&e))?;
                current.push_str(&value);
            }
            Ok(Event::GeneralRef(e)) if in_paragraph => {
                if let Some(ch) = e.resolve_char_ref().map_err(|e| corrupt_docx(&e))? {
                    current.push(ch);
                } else {
                    let name = e.decode().map_err(|e| corrupt_docx(&e))?;
                    if let Some(resolved) = quick_xml::escape::resolve_xml_entity(&name) {
                        current.push_str(resolved);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(corrupt_docx(&err)),
            _ => {}
        }
    }

    Ok(lines.join("\n"))
}
