//! Inbound message processing.
//!
//! An external receiver (SMTP bridge, upload endpoint) hands over validated
//! messages; this module stores each supported attachment as a
//! content-addressed document and leaves the documents in STORED for the
//! extraction workers.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::InputError;
use crate::models::DocumentStatus;
use crate::objectstore::ObjectStore;
use crate::store::orders::{DocumentRow, InboundMessageRow};
use crate::store::{new_id, Db};

pub const SUPPORTED_MIME_TYPES: &[&str] = &[
    "text/csv",
    "application/csv",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-excel",
    "application/pdf",
    "text/plain",
];

#[derive(Debug, Clone)]
pub struct Attachment {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub from_email: Option<String>,
    pub to_email: Option<String>,
    pub subject: Option<String>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug)]
pub struct InboundResult {
    pub message_id: String,
    pub document_ids: Vec<String>,
    pub skipped: Vec<(String, String)>,
}

/// Pre-storage file validation.
pub fn validate_attachment(attachment: &Attachment, max_bytes: u64) -> Result<(), InputError> {
    if attachment.file_name.trim().is_empty()
        || attachment.file_name.contains('/')
        || attachment.file_name.contains('\\')
        || attachment.file_name.contains("..")
    {
        return Err(InputError::FilenameInvalid(attachment.file_name.clone()));
    }
    if attachment.bytes.is_empty() {
        return Err(InputError::EmptyFile);
    }
    if attachment.bytes.len() as u64 > max_bytes {
        return Err(InputError::FileTooLarge {
            size: attachment.bytes.len() as u64,
            max: max_bytes,
        });
    }
    let mime = attachment
        .mime_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    if !SUPPORTED_MIME_TYPES.contains(&mime.as_str()) {
        return Err(InputError::UnsupportedMimeType(attachment.mime_type.clone()));
    }
    Ok(())
}

pub struct InboundProcessor {
    db: Db,
    store: Arc<dyn ObjectStore>,
}

impl InboundProcessor {
    pub fn new(db: Db, store: Arc<dyn ObjectStore>) -> Self {
        Self { db, store }
    }

    /// Record the message and store every valid attachment as a document.
    /// Invalid attachments are skipped with a reason; the message fails only
    /// when storage itself fails.
    pub async fn process_message(
        &self,
        tenant_id: &str,
        message: &InboundMessage,
    ) -> Result<InboundResult> {
        let settings = self.db.tenant_settings(tenant_id).await?;
        let message_id = new_id();
        self.db
            .insert_inbound_message(&InboundMessageRow {
                id: message_id.clone(),
                tenant_id: tenant_id.to_string(),
                from_email: message.from_email.clone(),
                to_email: message.to_email.clone(),
                subject: message.subject.clone(),
                status: "RECEIVED".to_string(),
                error: None,
            })
            .await?;

        let mut document_ids = Vec::new();
        let mut skipped = Vec::new();

        for attachment in &message.attachments {
            if let Err(e) = validate_attachment(attachment, settings.max_file_bytes) {
                warn!(
                    tenant_id,
                    file = %attachment.file_name,
                    reason = %e,
                    "skipping unsupported attachment"
                );
                skipped.push((attachment.file_name.clone(), e.to_string()));
                continue;
            }
            let document_id = self
                .store_attachment(tenant_id, &message_id, message.from_email.as_deref(), attachment)
                .await?;
            document_ids.push(document_id);
        }

        let status = if document_ids.is_empty() {
            "NO_DOCUMENTS"
        } else {
            "PROCESSED"
        };
        self.db
            .set_message_status(tenant_id, &message_id, status, None)
            .await?;
        info!(
            tenant_id,
            message_id = %message_id,
            documents = document_ids.len(),
            skipped = skipped.len(),
            "inbound message processed"
        );
        Ok(InboundResult {
            message_id,
            document_ids,
            skipped,
        })
    }

    /// Store a single upload outside any message envelope.
    pub async fn store_upload(
        &self,
        tenant_id: &str,
        attachment: &Attachment,
    ) -> Result<String> {
        let settings = self.db.tenant_settings(tenant_id).await?;
        validate_attachment(attachment, settings.max_file_bytes)?;
        self.store_attachment(tenant_id, "", None, attachment).await
    }

    async fn store_attachment(
        &self,
        tenant_id: &str,
        message_id: &str,
        sender_email: Option<&str>,
        attachment: &Attachment,
    ) -> Result<String> {
        let stored = self
            .store
            .store(
                tenant_id,
                &attachment.file_name,
                &attachment.mime_type,
                &attachment.bytes,
            )
            .await
            .map_err(anyhow::Error::from)?;

        let document_id = new_id();
        let document = DocumentRow {
            id: document_id.clone(),
            tenant_id: tenant_id.to_string(),
            message_id: (!message_id.is_empty()).then(|| message_id.to_string()),
            sha256: stored.sha256.clone(),
            mime_type: attachment.mime_type.clone(),
            size_bytes: attachment.bytes.len() as i64,
            storage_key: stored.key.clone(),
            file_name: attachment.file_name.clone(),
            source: if message_id.is_empty() { "upload" } else { "email" }.to_string(),
            sender_email: sender_email.map(str::to_string),
            status: DocumentStatus::Uploaded,
            error: None,
        };
        self.db.insert_document(&document).await?;
        self.db
            .transition_document(tenant_id, &document_id, DocumentStatus::Stored, None)
            .await?;
        Ok(document_id)
    }
}
