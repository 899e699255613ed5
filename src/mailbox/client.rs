//! IMAP client: connection, mailbox selection, message scanning and
//! disposition operations.

use std::collections::HashSet;
use std::sync::Arc;

use async_imap::types::NameAttribute;
use futures::StreamExt;
use imap_proto::types::{BodyStructure, ContentEncoding, SectionPath};
use mail_parser::decoders::base64::base64_decode;
use mail_parser::decoders::charsets::map::charset_decoder;
use mail_parser::decoders::quoted_printable::quoted_printable_decode;
use tracing::{debug, info, warn};

use crate::config::{Encryption, MailboxConfig};
use crate::error::MailboxError;
use crate::utf7;

use super::{
    ImapSession, ImapStream, MailPart, MailStore, MailboxStatus, MessageOverview, TransferEncoding,
};

pub struct MailboxClient {
    config: MailboxConfig,
    session: Option<ImapSession>,
    delimiter: String,
    selectable: bool,
    no_inferiors: bool,
    /// Child mailboxes already confirmed or created this session.
    ensured: HashSet<String>,
    /// Set after a message got `\Deleted`; cleared by the expunge in
    /// [`MailboxClient::cleanup`].
    expunge: bool,
}

struct PlainAuthenticator {
    username: String,
    password: String,
}

impl async_imap::Authenticator for PlainAuthenticator {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        // SASL PLAIN: authzid NUL authcid NUL password
        format!("\u{0}{}\u{0}{}", self.username, self.password)
    }
}

impl MailboxClient {
    pub fn new(config: MailboxConfig) -> Self {
        Self {
            config,
            session: None,
            delimiter: "/".to_string(),
            selectable: true,
            no_inferiors: false,
            ensured: HashSet::new(),
            expunge: false,
        }
    }

    pub async fn connect(&mut self) -> Result<(), MailboxError> {
        let addr = (self.config.host.as_str(), self.config.effective_port());
        let tcp = tokio::net::TcpStream::connect(addr).await?;

        let client = match self.config.encryption {
            Encryption::Ssl => {
                let tls = self.tls_connect(tcp).await?;
                let mut client = async_imap::Client::new(ImapStream::Tls(Box::new(tls)));
                client
                    .read_response()
                    .await?
                    .ok_or(MailboxError::MissingGreeting)?;
                client
            }
            Encryption::Starttls => {
                let mut plain = async_imap::Client::new(tcp);
                plain
                    .read_response()
                    .await?
                    .ok_or(MailboxError::MissingGreeting)?;
                plain.run_command_and_check_ok("STARTTLS", None).await?;
                let tls = self.tls_connect(plain.into_inner()).await?;
                async_imap::Client::new(ImapStream::Tls(Box::new(tls)))
            }
            Encryption::None => {
                let mut client = async_imap::Client::new(ImapStream::Plain(tcp));
                client
                    .read_response()
                    .await?
                    .ok_or(MailboxError::MissingGreeting)?;
                client
            }
        };

        let session = self.authenticate(client).await?;
        self.session = Some(session);

        if let Err(err) = self.examine_and_select().await {
            self.cleanup().await;
            return Err(err);
        }
        info!(
            host = %self.config.host,
            mailbox = %self.config.mailbox,
            "connected to IMAP server"
        );
        Ok(())
    }

    async fn tls_connect(
        &self,
        tcp: tokio::net::TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<tokio::net::TcpStream>, MailboxError> {
        let config = if self.config.novalidate_cert {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let server_name = rustls::pki_types::ServerName::try_from(self.config.host.clone())
            .map_err(|_| MailboxError::InvalidDnsName(self.config.host.clone()))?;
        Ok(connector.connect(server_name, tcp).await?)
    }

    async fn authenticate(
        &self,
        client: async_imap::Client<ImapStream>,
    ) -> Result<ImapSession, MailboxError> {
        let excluded = |mechanism: &str| {
            self.config
                .auth_exclude
                .iter()
                .any(|name| name.eq_ignore_ascii_case(mechanism))
        };

        if !excluded("LOGIN") {
            client
                .login(&self.config.username, &self.config.password)
                .await
                .map_err(|(err, _client)| MailboxError::Auth(err.to_string()))
        } else if !excluded("PLAIN") {
            let authenticator = PlainAuthenticator {
                username: self.config.username.clone(),
                password: self.config.password.clone(),
            };
            client
                .authenticate("PLAIN", authenticator)
                .await
                .map_err(|(err, _client)| MailboxError::Auth(err.to_string()))
        } else {
            Err(MailboxError::NoAuthMechanism)
        }
    }

    /// Confirm the configured mailbox exists, record its delimiter and
    /// attributes, and select it.
    async fn examine_and_select(&mut self) -> Result<(), MailboxError> {
        let encoded = utf7::encode(&self.config.mailbox);
        let session = self.session()?;

        let names: Vec<_> = session
            .list(Some(""), Some(&encoded))
            .await?
            .collect()
            .await;
        let mut matches = Vec::with_capacity(names.len());
        for name in names {
            matches.push(name?);
        }
        if matches.len() > 1 {
            return Err(MailboxError::Protocol(format!(
                "mailbox name `{}` matches {} entries",
                self.config.mailbox,
                matches.len()
            )));
        }
        let name = matches
            .pop()
            .ok_or_else(|| MailboxError::MailboxNotFound(self.config.mailbox.clone()))?;

        self.delimiter = name.delimiter().unwrap_or("/").to_string();
        self.selectable = !name.attributes().contains(&NameAttribute::NoSelect);
        self.no_inferiors = name.attributes().contains(&NameAttribute::NoInferiors);

        self.session()?.select(&encoded).await?;
        Ok(())
    }

    pub async fn ensure_connection(&mut self) -> Result<(), MailboxError> {
        if self.session.is_none() {
            self.connect().await?;
        }
        Ok(())
    }

    fn session(&mut self) -> Result<&mut ImapSession, MailboxError> {
        self.session.as_mut().ok_or(MailboxError::NotConnected)
    }

    /// Mailbox health check: usable attributes plus message counts.
    pub async fn status(&mut self) -> Result<MailboxStatus, MailboxError> {
        self.ensure_connection().await?;
        if !self.selectable {
            return Err(MailboxError::NotSelectable);
        }
        if self.no_inferiors {
            return Err(MailboxError::NoInferiors);
        }
        debug!("server library exposes no ACL query, skipping the rights check");

        let encoded = utf7::encode(&self.config.mailbox);
        let status = self.session()?.status(&encoded, "(MESSAGES UNSEEN)").await?;
        Ok(MailboxStatus {
            messages: status.exists,
            unseen: status.unseen.unwrap_or(0),
        })
    }

    /// Create (and subscribe to) a child of the selected mailbox when it
    /// does not exist yet. Returns the full encoded name.
    async fn ensure_mailbox(&mut self, child: &str) -> Result<String, MailboxError> {
        let full = format!("{}{}{}", self.config.mailbox, self.delimiter, child);
        let encoded = utf7::encode(&full);
        if self.ensured.contains(&encoded) {
            return Ok(encoded);
        }

        let session = self.session()?;
        let names: Vec<_> = session
            .list(Some(""), Some(&encoded))
            .await?
            .collect()
            .await;
        let mut exists = false;
        for name in names {
            name?;
            exists = true;
        }

        if !exists {
            let session = self.session()?;
            session.create(&encoded).await?;
            if let Err(err) = session.subscribe(&encoded).await {
                warn!(mailbox = %full, "failed to subscribe to created mailbox: {err}");
            }
            info!(mailbox = %full, "created mailbox");
        }
        self.ensured.insert(encoded.clone());
        Ok(encoded)
    }

    async fn store_flags(&mut self, number: u32, flags: &str) -> Result<(), MailboxError> {
        let session = self.session()?;
        let responses: Vec<_> = session
            .store(number.to_string(), flags)
            .await?
            .collect()
            .await;
        for response in responses {
            response?;
        }
        Ok(())
    }

    async fn fetch_one(
        &mut self,
        number: u32,
        query: &str,
    ) -> Result<async_imap::types::Fetch, MailboxError> {
        let session = self.session()?;
        let mut fetches = session.fetch(number.to_string(), query).await?;
        let mut found = None;
        while let Some(fetch) = fetches.next().await {
            found = Some(fetch?);
        }
        found.ok_or_else(|| MailboxError::Protocol(format!("no FETCH response for {number}")))
    }

    async fn try_overview(&mut self, number: u32) -> Result<MessageOverview, MailboxError> {
        self.ensure_connection().await?;
        let fetch = self.fetch_one(number, "(ENVELOPE)").await?;
        let envelope = fetch
            .envelope()
            .ok_or_else(|| MailboxError::Protocol("no ENVELOPE in FETCH response".into()))?;

        let from = envelope.from.as_ref().and_then(|addrs| {
            let addr = addrs.first()?;
            let local = addr.mailbox.as_ref()?;
            let host = addr.host.as_ref()?;
            Some(format!(
                "{}@{}",
                String::from_utf8_lossy(local),
                String::from_utf8_lossy(host)
            ))
        });
        let date = envelope
            .date
            .as_ref()
            .map(|date| String::from_utf8_lossy(date).to_string());
        Ok(MessageOverview { from, date })
    }

    /// Expunge pending deletions and log out. Failures are logged, never
    /// raised; cleanup runs on every exit path.
    pub async fn cleanup(&mut self) {
        if let Some(mut session) = self.session.take() {
            if self.expunge {
                match session.expunge().await {
                    Ok(responses) => {
                        let responses: Vec<_> = responses.collect().await;
                        for response in responses {
                            if let Err(err) = response {
                                warn!("error in expunge response: {err}");
                            }
                        }
                    }
                    Err(err) => warn!("failed to expunge deleted messages: {err}"),
                }
                self.expunge = false;
            }
            session.logout().await.ok();
        }
    }
}

impl MailStore for MailboxClient {
    async fn unseen_sorted(&mut self) -> Result<Vec<u32>, MailboxError> {
        self.ensure_connection().await?;
        let matches = self.session()?.search("UNSEEN").await?;
        let mut numbers: Vec<u32> = matches.into_iter().collect();
        numbers.sort_unstable();
        Ok(numbers)
    }

    async fn scan_parts(&mut self, number: u32) -> Result<Vec<MailPart>, MailboxError> {
        self.ensure_connection().await?;
        let fetch = self.fetch_one(number, "(BODYSTRUCTURE)").await?;
        let structure = fetch
            .bodystructure()
            .ok_or_else(|| MailboxError::Protocol("no BODYSTRUCTURE in FETCH response".into()))?;

        Ok(match structure {
            BodyStructure::Multipart { bodies, .. } => bodies.iter().map(scan_part).collect(),
            single => vec![scan_part(single)],
        })
    }

    async fn fetch_part(&mut self, number: u32, part: u32) -> Result<Vec<u8>, MailboxError> {
        self.ensure_connection().await?;
        let fetch = self
            .fetch_one(number, &format!("(BODY.PEEK[{part}])"))
            .await?;
        fetch
            .section(&SectionPath::Part(vec![part], None))
            .map(|raw| raw.to_vec())
            .ok_or_else(|| {
                MailboxError::Protocol(format!("no body section {part} in FETCH response"))
            })
    }

    async fn set_seen(&mut self, number: u32) -> Result<(), MailboxError> {
        self.ensure_connection().await?;
        self.store_flags(number, "+FLAGS (\\Seen)").await
    }

    async fn move_message(&mut self, number: u32, mailbox: &str) -> Result<(), MailboxError> {
        self.ensure_connection().await?;
        let target = self.ensure_mailbox(mailbox).await?;
        self.session()?.copy(number.to_string(), &target).await?;
        self.store_flags(number, "+FLAGS (\\Deleted)").await?;
        self.expunge = true;
        Ok(())
    }

    async fn delete_message(&mut self, number: u32) -> Result<(), MailboxError> {
        self.ensure_connection().await?;
        self.store_flags(number, "+FLAGS (\\Deleted)").await?;
        self.expunge = true;
        Ok(())
    }

    async fn overview(&mut self, number: u32) -> Option<MessageOverview> {
        match self.try_overview(number).await {
            Ok(overview) => Some(overview),
            Err(err) => {
                debug!("failed to fetch message overview: {err}");
                None
            }
        }
    }

    fn label(&self) -> String {
        self.config.label()
    }
}

fn scan_part(structure: &BodyStructure) -> MailPart {
    match structure {
        BodyStructure::Basic { common, other, .. }
        | BodyStructure::Text { common, other, .. }
        | BodyStructure::Message { common, other, .. } => {
            let from_disposition = common.disposition.as_ref().and_then(|disp| {
                disp.params
                    .as_ref()
                    .and_then(|params| first_param(params, "filename"))
            });
            let from_type = common
                .ty
                .params
                .as_ref()
                .and_then(|params| first_param(params, "name"));

            MailPart {
                filename: from_disposition
                    .or(from_type)
                    .map(|name| decode_header_text(&name)),
                bytes: i64::from(other.octets),
                encoding: scan_encoding(&other.transfer_encoding),
            }
        }
        BodyStructure::Multipart { .. } => MailPart {
            filename: None,
            bytes: -1,
            encoding: TransferEncoding::SevenBit,
        },
    }
}

// The first non-empty occurrence wins when a server repeats a parameter.
fn first_param(
    params: &[(std::borrow::Cow<'_, str>, std::borrow::Cow<'_, str>)],
    key: &str,
) -> Option<String> {
    params
        .iter()
        .find(|(name, value)| name.eq_ignore_ascii_case(key) && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

// Part parameters arrive in raw header form, so non-ASCII filenames show
// up as RFC 2047 encoded words (`=?charset?B|Q?payload?=`). Anything that
// is not a well-formed encoded word stays as written.
fn decode_header_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    let mut last_was_encoded = false;

    while let Some(start) = rest.find("=?") {
        let plain = &rest[..start];
        let tail = &rest[start + 2..];
        match decode_word(tail) {
            Some((text, consumed)) => {
                // Whitespace between two encoded words is not part of the text.
                if !last_was_encoded || !plain.trim().is_empty() {
                    out.push_str(plain);
                }
                out.push_str(&text);
                rest = &tail[consumed..];
                last_was_encoded = true;
            }
            None => {
                out.push_str(plain);
                out.push_str("=?");
                rest = tail;
                last_was_encoded = false;
            }
        }
    }

    out.push_str(rest);
    out
}

fn decode_word(word: &str) -> Option<(String, usize)> {
    let charset_end = word.find('?')?;
    let charset = &word[..charset_end];
    let rest = &word[charset_end + 1..];
    let encoding_end = rest.find('?')?;
    let encoding = &rest[..encoding_end];
    let payload = &rest[encoding_end + 1..];
    let payload_end = payload.find("?=")?;
    let payload = &payload[..payload_end];

    let bytes = match encoding {
        "B" | "b" => base64_decode(payload.as_bytes())?,
        "Q" | "q" => decode_q_word(payload)?,
        _ => return None,
    };
    let text = match charset_decoder(charset.as_bytes()) {
        Some(decoder) => decoder(&bytes),
        None => String::from_utf8_lossy(&bytes).into_owned(),
    };
    Some((text, charset_end + 1 + encoding_end + 1 + payload_end + 2))
}

// Q encoding is quoted-printable with `_` standing in for space.
fn decode_q_word(payload: &str) -> Option<Vec<u8>> {
    quoted_printable_decode(payload.replace('_', " ").as_bytes())
}

fn scan_encoding(encoding: &ContentEncoding) -> TransferEncoding {
    match encoding {
        ContentEncoding::SevenBit => TransferEncoding::SevenBit,
        ContentEncoding::EightBit => TransferEncoding::EightBit,
        ContentEncoding::Binary => TransferEncoding::Binary,
        ContentEncoding::Base64 => TransferEncoding::Base64,
        ContentEncoding::QuotedPrintable => TransferEncoding::QuotedPrintable,
        ContentEncoding::Other(name) => TransferEncoding::Other(name.to_string()),
    }
}

/// Certificate verifier used when `novalidate_cert` is set.
#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use imap_proto::types::{
        BodyContentCommon, BodyContentSinglePart, ContentDisposition, ContentType,
    };

    use super::*;

    fn attachment(filename: &'static str) -> BodyStructure<'static> {
        BodyStructure::Basic {
            common: BodyContentCommon {
                ty: ContentType {
                    ty: Cow::Borrowed("application"),
                    subtype: Cow::Borrowed("octet-stream"),
                    params: None,
                },
                disposition: Some(ContentDisposition {
                    ty: Cow::Borrowed("attachment"),
                    params: Some(vec![(Cow::Borrowed("filename"), Cow::Borrowed(filename))]),
                }),
                language: None,
                location: None,
            },
            other: BodyContentSinglePart {
                id: None,
                md5: None,
                description: None,
                transfer_encoding: ContentEncoding::Base64,
                octets: 512,
            },
            extension: None,
        }
    }

    #[test]
    fn scanned_filenames_lose_their_encoded_word_wrapping() {
        let part = scan_part(&attachment("=?UTF-8?B?cmVwb3J0LnhtbA==?="));
        assert_eq!(part.filename.as_deref(), Some("report.xml"));
    }

    #[test]
    fn plain_filenames_pass_through_untouched() {
        let part = scan_part(&attachment("example.com!report.xml.gz"));
        assert_eq!(part.filename.as_deref(), Some("example.com!report.xml.gz"));
    }

    #[test]
    fn q_encoded_words_map_underscores_to_spaces() {
        assert_eq!(
            decode_header_text("=?utf-8?q?weekly_report=2Exml?="),
            "weekly report.xml"
        );
    }

    #[test]
    fn adjacent_encoded_words_join_without_the_gap() {
        assert_eq!(
            decode_header_text("=?UTF-8?B?cmVwb3J0?= =?UTF-8?B?LnhtbA==?="),
            "report.xml"
        );
    }

    #[test]
    fn latin1_filenames_decode_through_the_charset_map() {
        assert_eq!(
            decode_header_text("=?ISO-8859-1?Q?r=E9sum=E9.xml?="),
            "r\u{e9}sum\u{e9}.xml"
        );
    }

    #[test]
    fn malformed_encoded_words_stay_as_written() {
        assert_eq!(decode_header_text("=?UTF-8?X?abc?="), "=?UTF-8?X?abc?=");
    }
}
