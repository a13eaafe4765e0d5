//! Core data models shared by the ingestion, embedding, and query paths.
//!
//! Rows are mapped by hand from `sqlx` rows; the queue events are the JSON
//! envelopes carried on the `document-processing` and `chunk-embedding`
//! topics.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::fmt;
use std::str::FromStr;

/// Document lifecycle: PENDING on upload, PROCESSING while extracting and
/// chunking, then COMPLETED or FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "PENDING",
            ProcessingStatus::Processing => "PROCESSING",
            ProcessingStatus::Completed => "COMPLETED",
            ProcessingStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ProcessingStatus::Pending),
            "PROCESSING" => Ok(ProcessingStatus::Processing),
            "COMPLETED" => Ok(ProcessingStatus::Completed),
            "FAILED" => Ok(ProcessingStatus::Failed),
            other => Err(format!("unknown processing status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DocumentType {
    Pdf,
    Docx,
    Pptx,
    Xlsx,
    Txt,
    Md,
    Html,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Pdf => "PDF",
            DocumentType::Docx => "DOCX",
            DocumentType::Pptx => "PPTX",
            DocumentType::Xlsx => "XLSX",
            DocumentType::Txt => "TXT",
            DocumentType::Md => "MD",
            DocumentType::Html => "HTML",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            DocumentType::Pdf => "pdf",
            DocumentType::Docx => "docx",
            DocumentType::Pptx => "pptx",
            DocumentType::Xlsx => "xlsx",
            DocumentType::Txt => "txt",
            DocumentType::Md => "md",
            DocumentType::Html => "html",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PDF" => Ok(DocumentType::Pdf),
            "DOCX" => Ok(DocumentType::Docx),
            "PPTX" => Ok(DocumentType::Pptx),
            "XLSX" => Ok(DocumentType::Xlsx),
            "TXT" => Ok(DocumentType::Txt),
            "MD" => Ok(DocumentType::Md),
            "HTML" => Ok(DocumentType::Html),
            other => Err(format!("unknown document type: {}", other)),
        }
    }
}

/// An uploaded file and its processing state.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub tenant_id: String,
    pub uploaded_by: String,
    pub filename: String,
    pub original_filename: String,
    pub content_type: String,
    pub file_size: i64,
    pub document_type: DocumentType,
    #[serde(skip)]
    pub file_path: String,
    pub processing_status: ProcessingStatus,
    pub processing_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
    pub chunk_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Column list matching [`Document::from_row`], qualified with alias `d`.
pub const DOCUMENT_COLUMNS: &str = "d.id, d.tenant_id, d.uploaded_by, d.filename, \
     d.original_filename, d.content_type, d.file_size, d.document_type, d.file_path, \
     d.processing_status, d.processing_message, d.extracted_text, d.chunk_count, \
     d.created_at, d.updated_at";

impl Document {
    pub fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("processing_status")?;
        let doc_type: String = row.try_get("document_type")?;
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            uploaded_by: row.try_get("uploaded_by")?,
            filename: row.try_get("filename")?,
            original_filename: row.try_get("original_filename")?,
            content_type: row.try_get("content_type")?,
            file_size: row.try_get("file_size")?,
            document_type: doc_type.parse().map_err(decode_err("document_type"))?,
            file_path: row.try_get("file_path")?,
            processing_status: status.parse().map_err(decode_err("processing_status"))?,
            processing_message: row.try_get("processing_message")?,
            extracted_text: row.try_get("extracted_text")?,
            chunk_count: row.try_get("chunk_count")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// A contiguous, immutable segment of a document's cleaned text.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentChunk {
    pub id: String,
    pub tenant_id: String,
    pub document_id: String,
    pub sequence_number: i64,
    pub content: String,
    pub start_offset: i64,
    pub end_offset: i64,
    pub token_count: i64,
    pub content_hash: String,
    pub embedding_id: Option<String>,
    pub created_at: i64,
}

pub const CHUNK_COLUMNS: &str = "c.id, c.tenant_id, c.document_id, c.sequence_number, \
     c.content, c.start_offset, c.end_offset, c.token_count, c.content_hash, \
     c.embedding_id, c.created_at";

impl DocumentChunk {
    pub fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            document_id: row.try_get("document_id")?,
            sequence_number: row.try_get("sequence_number")?,
            content: row.try_get("content")?,
            start_offset: row.try_get("start_offset")?,
            end_offset: row.try_get("end_offset")?,
            token_count: row.try_get("token_count")?,
            content_hash: row.try_get("content_hash")?,
            embedding_id: row.try_get("embedding_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

fn decode_err(column: &'static str) -> impl Fn(String) -> sqlx::Error {
    move |message| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: message.into(),
    }
}

/// Payload on the `document-processing` topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentProcessingEvent {
    pub document_id: String,
    pub tenant_id: String,
    pub timestamp: i64,
}

/// Payload on the `chunk-embedding` topic. Chunk text travels with the
/// event; everything else is an id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkEmbeddingEvent {
    pub chunk_id: String,
    pub document_id: String,
    pub tenant_id: String,
    pub content: String,
    pub sequence_number: i64,
    pub token_count: i64,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        assert_eq!(
            "COMPLETED".parse::<ProcessingStatus>().unwrap(),
            ProcessingStatus::Completed
        );
        assert!("DONE".parse::<ProcessingStatus>().is_err());
    }

    #[test]
    fn test_chunk_event_json_shape() {
        let event = ChunkEmbeddingEvent {
            chunk_id: "c1".into(),
            document_id: "d1".into(),
            tenant_id: "t1".into(),
            content: "hello".into(),
            sequence_number: 0,
            token_count: 2,
            timestamp: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["chunk_id"], "c1");
        assert_eq!(json["tenant_id"], "t1");
        assert_eq!(json["sequence_number"], 0);
    }
}
