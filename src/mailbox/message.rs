//! One mail message as an ingestion candidate: lazy attachment discovery,
//! policy validation and on-demand content decoding.

use mail_parser::decoders::base64::base64_decode;
use mail_parser::decoders::quoted_printable::quoted_printable_decode;

use crate::error::{ItemError, MailboxError, MessageError};

use super::{MailStore, TransferEncoding};

const MIN_ATTACHMENT_BYTES: i64 = 50;
const MAX_ATTACHMENT_BYTES: i64 = 1_048_576;

const ALLOWED_MIME_TYPES: &[&str] = &[
    "application/zip",
    "application/gzip",
    "application/x-gzip",
    "text/xml",
];

/// A message picked up from the mailbox. The attachment list is scanned on
/// first use; negative count means not scanned yet.
#[derive(Debug)]
pub struct MailMessage {
    number: u32,
    attachment: Option<MailAttachment>,
    attachment_count: i32,
}

impl MailMessage {
    pub fn new(number: u32) -> Self {
        Self {
            number,
            attachment: None,
            attachment_count: -1,
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn attachment(&mut self) -> Option<&mut MailAttachment> {
        self.attachment.as_mut()
    }

    async fn ensure_attachment<M: MailStore>(
        &mut self,
        store: &mut M,
    ) -> Result<(), MailboxError> {
        if self.attachment_count >= 0 {
            return Ok(());
        }
        let parts = store.scan_parts(self.number).await?;
        let mut count = 0;
        for (index, part) in parts.iter().enumerate() {
            let Some(filename) = &part.filename else {
                continue;
            };
            count += 1;
            if self.attachment.is_none() {
                self.attachment = Some(MailAttachment {
                    filename: filename.clone(),
                    bytes: part.bytes,
                    number: index as u32 + 1,
                    mnumber: self.number,
                    encoding: part.encoding.clone(),
                    content: None,
                    mime_type: None,
                });
            }
        }
        self.attachment_count = count;
        Ok(())
    }

    /// Check the message against the ingestion policy: exactly one
    /// attachment, within size bounds, of an accepted report type.
    pub async fn validate<M: MailStore>(&mut self, store: &mut M) -> Result<(), ItemError> {
        self.ensure_attachment(store).await?;
        if self.attachment_count != 1 {
            return Err(MessageError::AttachmentCount(self.attachment_count).into());
        }

        let attachment = self
            .attachment
            .as_mut()
            .ok_or(MessageError::AttachmentCount(0))?;
        if attachment.bytes < 0 {
            return Err(MessageError::UnknownSize.into());
        }
        if attachment.bytes < MIN_ATTACHMENT_BYTES || attachment.bytes > MAX_ATTACHMENT_BYTES {
            return Err(MessageError::InvalidSize(attachment.bytes).into());
        }
        let mime_type = attachment.mime_type();
        if !ALLOWED_MIME_TYPES.contains(&mime_type) {
            return Err(MessageError::InvalidType(mime_type.to_string()).into());
        }
        Ok(())
    }
}

/// A single attachment part. Content is fetched and decoded once, then
/// served from the cache.
#[derive(Debug)]
pub struct MailAttachment {
    filename: String,
    bytes: i64,
    /// Part number within the message, 1-based.
    number: u32,
    /// Sequence number of the owning message.
    mnumber: u32,
    encoding: TransferEncoding,
    content: Option<Vec<u8>>,
    mime_type: Option<String>,
}

impl MailAttachment {
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// MIME type derived from the filename extension. The part's declared
    /// Content-Type is not trusted for report detection.
    pub fn mime_type(&mut self) -> &str {
        self.mime_type.get_or_insert_with(|| {
            mime_guess::from_path(&self.filename)
                .first_raw()
                .unwrap_or("application/octet-stream")
                .to_string()
        })
    }

    pub async fn content<M: MailStore>(&mut self, store: &mut M) -> Result<&[u8], ItemError> {
        if self.content.is_none() {
            let raw = store.fetch_part(self.mnumber, self.number).await?;
            let decoded = match &self.encoding {
                TransferEncoding::SevenBit
                | TransferEncoding::EightBit
                | TransferEncoding::Binary => raw,
                TransferEncoding::Base64 => {
                    base64_decode(&raw).ok_or(MessageError::Decode)?
                }
                TransferEncoding::QuotedPrintable => {
                    quoted_printable_decode(&raw).ok_or(MessageError::Decode)?
                }
                TransferEncoding::Other(_) => {
                    return Err(MessageError::UnknownEncoding.into());
                }
            };
            self.content = Some(decoded);
        }
        Ok(self.content.as_deref().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::MailPart;
    use crate::mailbox::testing::{FakeMessage, FakeStore};

    fn store_with_parts(parts: Vec<(MailPart, Vec<u8>)>) -> FakeStore {
        let mut store = FakeStore::default();
        store.messages.insert(
            1,
            FakeMessage {
                parts,
                unseen: true,
                ..FakeMessage::default()
            },
        );
        store
    }

    fn xml_part(bytes: i64) -> (MailPart, Vec<u8>) {
        (
            MailPart {
                filename: Some("report.xml".to_string()),
                bytes,
                encoding: TransferEncoding::SevenBit,
            },
            Vec::new(),
        )
    }

    fn assert_message_err(result: Result<(), ItemError>, expected: MessageError) {
        match result {
            Err(ItemError::Message(err)) => assert_eq!(err.to_string(), expected.to_string()),
            other => panic!("expected message error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_wrong_attachment_count() {
        let mut store = store_with_parts(vec![(
            MailPart {
                filename: None,
                bytes: 100,
                encoding: TransferEncoding::SevenBit,
            },
            Vec::new(),
        )]);
        let mut message = MailMessage::new(1);
        assert_message_err(
            message.validate(&mut store).await,
            MessageError::AttachmentCount(0),
        );

        let mut store = store_with_parts(vec![xml_part(100), xml_part(100)]);
        let mut message = MailMessage::new(1);
        assert_message_err(
            message.validate(&mut store).await,
            MessageError::AttachmentCount(2),
        );
    }

    #[tokio::test]
    async fn enforces_size_bounds() {
        for (bytes, ok) in [(49, false), (50, true), (1_048_576, true), (1_048_577, false)] {
            let mut store = store_with_parts(vec![xml_part(bytes)]);
            let mut message = MailMessage::new(1);
            let result = message.validate(&mut store).await;
            assert_eq!(result.is_ok(), ok, "size {bytes}");
        }

        let mut store = store_with_parts(vec![xml_part(-1)]);
        let mut message = MailMessage::new(1);
        assert_message_err(message.validate(&mut store).await, MessageError::UnknownSize);
    }

    #[tokio::test]
    async fn rejects_unexpected_file_types() {
        for filename in ["report.pdf", "report", "report.txt"] {
            let mut store = store_with_parts(vec![(
                MailPart {
                    filename: Some(filename.to_string()),
                    bytes: 100,
                    encoding: TransferEncoding::SevenBit,
                },
                Vec::new(),
            )]);
            let mut message = MailMessage::new(1);
            assert!(
                matches!(
                    message.validate(&mut store).await,
                    Err(ItemError::Message(MessageError::InvalidType(_)))
                ),
                "filename {filename}"
            );
        }
    }

    #[tokio::test]
    async fn accepts_compressed_report_names() {
        for filename in ["r.xml", "r.xml.gz", "r.zip"] {
            let mut store = store_with_parts(vec![(
                MailPart {
                    filename: Some(filename.to_string()),
                    bytes: 100,
                    encoding: TransferEncoding::SevenBit,
                },
                Vec::new(),
            )]);
            let mut message = MailMessage::new(1);
            assert!(message.validate(&mut store).await.is_ok(), "filename {filename}");
        }
    }

    #[tokio::test]
    async fn decodes_base64_once() {
        let payload = b"<feedback>report body goes here, long enough</feedback>";
        let encoded = {
            // RFC 2045 base64 of the payload, with a line break in the middle.
            let table = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
            let mut out = Vec::new();
            for chunk in payload.chunks(3) {
                let b0 = chunk[0] as u32;
                let b1 = chunk.get(1).copied().unwrap_or(0) as u32;
                let b2 = chunk.get(2).copied().unwrap_or(0) as u32;
                let group = (b0 << 16) | (b1 << 8) | b2;
                out.push(table[(group >> 18) as usize & 0x3f]);
                out.push(table[(group >> 12) as usize & 0x3f]);
                out.push(if chunk.len() > 1 { table[(group >> 6) as usize & 0x3f] } else { b'=' });
                out.push(if chunk.len() > 2 { table[group as usize & 0x3f] } else { b'=' });
            }
            out.splice(20..20, *b"\r\n");
            out
        };

        let mut store = store_with_parts(vec![(
            MailPart {
                filename: Some("report.xml".to_string()),
                bytes: encoded.len() as i64,
                encoding: TransferEncoding::Base64,
            },
            encoded,
        )]);
        let mut message = MailMessage::new(1);
        message.validate(&mut store).await.unwrap();

        let attachment = message.attachment().unwrap();
        assert_eq!(attachment.content(&mut store).await.unwrap(), payload);
        assert_eq!(attachment.content(&mut store).await.unwrap(), payload);
        assert_eq!(store.fetch_calls, 1);
    }

    #[tokio::test]
    async fn unknown_transfer_encoding_fails_the_item() {
        let mut store = store_with_parts(vec![(
            MailPart {
                filename: Some("report.xml".to_string()),
                bytes: 100,
                encoding: TransferEncoding::Other("x-uuencode".to_string()),
            },
            b"payload".to_vec(),
        )]);
        let mut message = MailMessage::new(1);
        message.validate(&mut store).await.unwrap();

        let attachment = message.attachment().unwrap();
        assert!(matches!(
            attachment.content(&mut store).await,
            Err(ItemError::Message(MessageError::UnknownEncoding))
        ));
    }
}
