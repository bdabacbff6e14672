//! Translation between stored message records and decrypted messages.

use hearth_crypto::sealing::message;
use hearth_crypto::{
    AttachmentMetadata, CryptoError, EncryptionMetadata, EncryptionPayload, MessageBody,
    MessageType, OpenOutcome, SessionKeyInfo,
};
use serde::{Deserialize, Serialize};

pub const IMAGE_LABEL: &str = "Image";
pub const ENCRYPTED_ATTACHMENT_LABEL: &str = "Encrypted attachment";
pub const ATTACHMENT_LABEL: &str = "Attachment";

/// A message document as stored in the remote message store.
///
/// Sealed records carry `ciphertext`, `nonce`, `salt`, `schemeVersion` and
/// `encryptionTarget`; a record with none of them is legacy plaintext and
/// uses `text` / `attachmentPath` / `mimeType` directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessageRecord {
    pub id: String,
    pub sender_id: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ciphertext: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_target: Option<String>,
    #[serde(default)]
    pub read_by: Vec<String>,
}

impl RawMessageRecord {
    pub fn is_legacy(&self) -> bool {
        self.ciphertext.is_none()
            && self.nonce.is_none()
            && self.salt.is_none()
            && self.scheme_version.is_none()
            && self.encryption_target.is_none()
    }

    /// Explicit type if recognised, otherwise inferred from which plaintext
    /// fields are present.
    pub fn message_type(&self) -> MessageType {
        if let Some(explicit) = self.message_type.as_deref().and_then(MessageType::parse) {
            return explicit;
        }
        if self.attachment_path.is_some() || self.attachment.is_some() {
            let mime = self
                .mime_type
                .as_deref()
                .or(self.attachment.as_ref().map(|a| a.mime_type.as_str()))
                .unwrap_or_default();
            if mime.starts_with("image/") {
                MessageType::Image
            } else {
                MessageType::File
            }
        } else {
            MessageType::Text
        }
    }

    /// Binding context for this record: its own version and target when
    /// stored, else the session's.
    pub fn encryption_metadata(&self, info: &SessionKeyInfo) -> EncryptionMetadata {
        EncryptionMetadata {
            sender_id: self.sender_id.clone(),
            message_type: self.message_type(),
            encryption_target: self
                .encryption_target
                .clone()
                .unwrap_or_else(|| info.encryption_target.clone()),
            scheme_version: self.scheme_version.unwrap_or(info.scheme_version),
            read_by: self.read_by.clone(),
        }
    }

    /// The sealed payload, or `None` if any sealing field is missing.
    pub fn payload(&self, info: &SessionKeyInfo) -> Option<EncryptionPayload> {
        Some(EncryptionPayload {
            ciphertext: self.ciphertext.clone()?,
            nonce: self.nonce.clone()?,
            salt: self.salt.clone()?,
            scheme_version: self.scheme_version.unwrap_or(info.scheme_version),
            encryption_target: self
                .encryption_target
                .clone()
                .unwrap_or_else(|| info.encryption_target.clone()),
        })
    }

    pub fn apply_payload(&mut self, payload: EncryptionPayload) {
        self.ciphertext = Some(payload.ciphertext);
        self.nonce = Some(payload.nonce);
        self.salt = Some(payload.salt);
        self.scheme_version = Some(payload.scheme_version);
        self.encryption_target = Some(payload.encryption_target);
    }

    pub fn apply_update(&mut self, update: ReadReceiptUpdate) {
        self.read_by = update.read_by;
        if let Some(payload) = update.payload {
            self.apply_payload(payload);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    /// Body available: decrypted, or legacy plaintext.
    Readable,
    ResyncRequired,
    Unavailable { code: &'static str },
}

/// A message ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedMessage {
    pub id: String,
    pub sender_id: String,
    pub message_type: MessageType,
    pub body: Option<MessageBody>,
    pub display_text: Option<String>,
    pub status: MessageStatus,
    pub is_encrypted: bool,
    pub read_by: Vec<String>,
    pub attachment: Option<AttachmentMetadata>,
}

/// Human-facing text for a message.
pub fn display_text(message_type: MessageType, body: &MessageBody, encrypted: bool) -> String {
    match message_type {
        MessageType::Text => body.text.clone().unwrap_or_default(),
        t if t.is_media() => IMAGE_LABEL.to_string(),
        _ if encrypted => ENCRYPTED_ATTACHMENT_LABEL.to_string(),
        _ => ATTACHMENT_LABEL.to_string(),
    }
}

/// Map a stored record to a displayable message, opening it if sealed.
pub fn map_record(record: &RawMessageRecord, info: &SessionKeyInfo) -> DecryptedMessage {
    let message_type = record.message_type();
    let mut message = DecryptedMessage {
        id: record.id.clone(),
        sender_id: record.sender_id.clone(),
        message_type,
        body: None,
        display_text: None,
        status: MessageStatus::Readable,
        is_encrypted: !record.is_legacy(),
        read_by: record.read_by.clone(),
        attachment: record.attachment.clone(),
    };

    if record.is_legacy() {
        let body = MessageBody {
            text: record.text.clone(),
            attachment_path: record.attachment_path.clone(),
            mime_type: record.mime_type.clone(),
        };
        message.display_text = Some(display_text(message_type, &body, false));
        message.body = Some(body);
        return message;
    }

    let Some(payload) = record.payload(info) else {
        tracing::warn!(id = %record.id, "sealed record is missing fields");
        message.status = MessageStatus::Unavailable {
            code: CryptoError::MalformedPayload(String::new()).tag(),
        };
        return message;
    };
    match message::open(info, &payload, &record.encryption_metadata(info)) {
        OpenOutcome::Opened(body) => {
            message.display_text = Some(display_text(message_type, &body, true));
            message.body = Some(body);
        }
        OpenOutcome::ResyncRequired => message.status = MessageStatus::ResyncRequired,
        OpenOutcome::Unavailable { code } => message.status = MessageStatus::Unavailable { code },
    }
    message
}

/// New reader list if `reader` has not read the message yet; `None` when
/// nothing would change.
pub fn read_receipt_update(record: &RawMessageRecord, reader: &str) -> Option<Vec<String>> {
    if record.read_by.iter().any(|r| r == reader) {
        return None;
    }
    let mut read_by = record.read_by.clone();
    read_by.push(reader.to_string());
    Some(read_by)
}

/// Fields to write back when a reader is added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReceiptUpdate {
    pub read_by: Vec<String>,
    /// Re-sealed payload; absent for legacy plaintext records.
    pub payload: Option<EncryptionPayload>,
}

/// Add `reader` to a record's readers, re-sealing when the record is sealed.
///
/// Returns `None` when the reader is already present, or when a sealed
/// record cannot be re-sealed (no root key or no opened body): writing the
/// reader list alone would break the record's binding.
pub fn apply_read_receipt(
    record: &RawMessageRecord,
    info: &SessionKeyInfo,
    body: Option<&MessageBody>,
    reader: &str,
) -> Result<Option<ReadReceiptUpdate>, CryptoError> {
    let Some(read_by) = read_receipt_update(record, reader) else {
        return Ok(None);
    };
    if record.is_legacy() {
        return Ok(Some(ReadReceiptUpdate {
            read_by,
            payload: None,
        }));
    }

    let metadata = record.encryption_metadata(info);
    match message::reseal_with_updated_read_receipts(info, body, &metadata, &read_by)? {
        Some(payload) => Ok(Some(ReadReceiptUpdate {
            read_by,
            payload: Some(payload),
        })),
        None => {
            tracing::debug!(id = %record.id, "skipping read receipt: record cannot be re-sealed");
            Ok(None)
        }
    }
}

/// A message about to be sent.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub id: String,
    pub sender_id: String,
    pub message_type: MessageType,
    pub body: MessageBody,
    pub attachment: Option<AttachmentMetadata>,
}

/// Seal an outgoing message into a storable record. The sender starts as
/// the only reader.
pub fn seal_outgoing(
    info: &SessionKeyInfo,
    outgoing: &OutgoingMessage,
) -> Result<RawMessageRecord, CryptoError> {
    let metadata = EncryptionMetadata::for_session(info, &outgoing.sender_id, outgoing.message_type)
        .with_readers(&[outgoing.sender_id.clone()]);
    let payload = message::seal(info, &outgoing.body, &metadata)?;

    let mut record = RawMessageRecord {
        id: outgoing.id.clone(),
        sender_id: outgoing.sender_id.clone(),
        message_type: Some(outgoing.message_type.as_str().to_string()),
        attachment: outgoing.attachment.clone(),
        read_by: metadata.read_by,
        ..RawMessageRecord::default()
    };
    record.apply_payload(payload);
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_crypto::RootKey;

    fn info() -> SessionKeyInfo {
        SessionKeyInfo::for_direct("dm", "alice", "bob", RootKey::from_bytes([2u8; 32]), 1)
    }

    fn outgoing(body: MessageBody, message_type: MessageType) -> OutgoingMessage {
        OutgoingMessage {
            id: "m1".into(),
            sender_id: "alice".into(),
            message_type,
            body,
            attachment: None,
        }
    }

    #[test]
    fn sealed_record_maps_back_to_text() {
        let record = seal_outgoing(&info(), &outgoing(MessageBody::text("hi"), MessageType::Text))
            .unwrap();
        assert!(record.text.is_none());
        assert_eq!(record.read_by, vec!["alice".to_string()]);

        let message = map_record(&record, &info());
        assert_eq!(message.status, MessageStatus::Readable);
        assert!(message.is_encrypted);
        assert_eq!(message.display_text.as_deref(), Some("hi"));
        assert_eq!(message.body, Some(MessageBody::text("hi")));
    }

    #[test]
    fn display_labels_by_type() {
        let image = seal_outgoing(
            &info(),
            &outgoing(MessageBody::attachment("p.jpg", "image/jpeg"), MessageType::Image),
        )
        .unwrap();
        assert_eq!(map_record(&image, &info()).display_text.as_deref(), Some("Image"));

        let file = seal_outgoing(
            &info(),
            &outgoing(MessageBody::attachment("p.pdf", "application/pdf"), MessageType::File),
        )
        .unwrap();
        assert_eq!(
            map_record(&file, &info()).display_text.as_deref(),
            Some("Encrypted attachment")
        );
    }

    #[test]
    fn legacy_record_passes_through() {
        let record = RawMessageRecord {
            id: "old".into(),
            sender_id: "bob".into(),
            text: Some("plain".into()),
            ..RawMessageRecord::default()
        };
        let message = map_record(&record, &SessionKeyInfo::reauth_required("dm", "alice", None));
        assert!(!message.is_encrypted);
        assert_eq!(message.status, MessageStatus::Readable);
        assert_eq!(message.display_text.as_deref(), Some("plain"));
    }

    #[test]
    fn legacy_type_is_inferred() {
        let image = RawMessageRecord {
            attachment_path: Some("a.png".into()),
            mime_type: Some("image/png".into()),
            ..RawMessageRecord::default()
        };
        assert_eq!(image.message_type(), MessageType::Image);

        let file = RawMessageRecord {
            attachment_path: Some("a.zip".into()),
            ..RawMessageRecord::default()
        };
        assert_eq!(file.message_type(), MessageType::File);
        assert_eq!(RawMessageRecord::default().message_type(), MessageType::Text);

        let explicit = RawMessageRecord {
            message_type: Some("image".into()),
            text: Some("caption".into()),
            ..RawMessageRecord::default()
        };
        assert_eq!(explicit.message_type(), MessageType::Image);
    }

    #[test]
    fn no_root_key_maps_to_resync() {
        let record = seal_outgoing(&info(), &outgoing(MessageBody::text("hi"), MessageType::Text))
            .unwrap();
        let stale = SessionKeyInfo::reauth_required("dm", "alice", Some("bob"));
        assert_eq!(map_record(&record, &stale).status, MessageStatus::ResyncRequired);
    }

    #[test]
    fn partial_sealing_fields_are_unavailable() {
        let mut record = seal_outgoing(&info(), &outgoing(MessageBody::text("hi"), MessageType::Text))
            .unwrap();
        record.nonce = None;
        let message = map_record(&record, &info());
        assert_eq!(
            message.status,
            MessageStatus::Unavailable {
                code: "MalformedPayload"
            }
        );
        assert!(message.body.is_none());
    }

    #[test]
    fn tampered_readers_make_message_unavailable() {
        let mut record = seal_outgoing(&info(), &outgoing(MessageBody::text("hi"), MessageType::Text))
            .unwrap();
        record.read_by.push("eve".into());
        assert!(matches!(
            map_record(&record, &info()).status,
            MessageStatus::Unavailable { .. }
        ));
    }

    #[test]
    fn read_receipt_update_skips_existing_reader() {
        let record = RawMessageRecord {
            read_by: vec!["alice".into()],
            ..RawMessageRecord::default()
        };
        assert_eq!(read_receipt_update(&record, "alice"), None);
        assert_eq!(
            read_receipt_update(&record, "bob"),
            Some(vec!["alice".to_string(), "bob".to_string()])
        );
    }

    #[test]
    fn read_receipt_reseals_and_record_still_opens() {
        let info = info();
        let mut record =
            seal_outgoing(&info, &outgoing(MessageBody::text("hi"), MessageType::Text)).unwrap();
        let body = map_record(&record, &info).body;

        let update = apply_read_receipt(&record, &info, body.as_ref(), "bob")
            .unwrap()
            .unwrap();
        let old_salt = record.salt.clone();
        assert!(update.payload.is_some());
        record.apply_update(update);
        assert_ne!(record.salt, old_salt);

        let reopened = map_record(&record, &info);
        assert_eq!(reopened.status, MessageStatus::Readable);
        assert_eq!(reopened.read_by, vec!["alice".to_string(), "bob".to_string()]);

        // Second read by the same user is a no-op.
        assert!(apply_read_receipt(&record, &info, reopened.body.as_ref(), "bob")
            .unwrap()
            .is_none());
    }

    #[test]
    fn read_receipt_without_body_is_skipped_for_sealed_records() {
        let info = info();
        let record =
            seal_outgoing(&info, &outgoing(MessageBody::text("hi"), MessageType::Text)).unwrap();
        assert!(apply_read_receipt(&record, &info, None, "bob").unwrap().is_none());

        let legacy = RawMessageRecord {
            text: Some("plain".into()),
            ..RawMessageRecord::default()
        };
        let update = apply_read_receipt(&legacy, &info, None, "bob").unwrap().unwrap();
        assert_eq!(update.payload, None);
        assert_eq!(update.read_by, vec!["bob".to_string()]);
    }

    #[test]
    fn record_json_uses_wire_names() {
        let record = seal_outgoing(&info(), &outgoing(MessageBody::text("hi"), MessageType::Text))
            .unwrap();
        let json = serde_json::to_value(&record).unwrap();
        for field in [
            "ciphertext",
            "nonce",
            "salt",
            "schemeVersion",
            "encryptionTarget",
            "readBy",
            "senderId",
            "type",
        ] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
        let parsed: RawMessageRecord = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, record);
    }
}
