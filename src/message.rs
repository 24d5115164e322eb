//! Minimal message construction and validation.
//!
//! This crate is about delivery, not composition: a [`Message`] carries the
//! envelope addresses, a subject and a plain text body. Date and Message-ID
//! headers are generated at send time from the configured hostname.

use std::time::SystemTime;

use crate::{Address, Error};

/// The most recipients accepted for one send, the minimum an SMTP server
/// must support (RFC 5321 §4.5.3.1.8)
const MAX_RECIPIENTS: usize = 100;

/// An email message: envelope addresses plus subject and body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    from: Address,
    to: Vec<Address>,
    subject: String,
    body: String,
}

impl Message {
    /// Starts building a message
    pub fn builder() -> MessageBuilder {
        MessageBuilder {
            from: None,
            to: Vec::new(),
            subject: String::new(),
            body: String::new(),
        }
    }

    /// The envelope sender
    pub fn from(&self) -> &Address {
        &self.from
    }

    /// The envelope recipients, in the order they were added
    pub fn to(&self) -> &[Address] {
        &self.to
    }

    /// The subject line
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Checks the parts of the message that the builder cannot enforce.
    ///
    /// Runs once per send, before any resolution or network I/O.
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.to.len() > MAX_RECIPIENTS {
            return Err(Error::RecipientLimit(MAX_RECIPIENTS));
        }
        if self.subject.contains(['\r', '\n']) {
            return Err(Error::InvalidHeader("Subject"));
        }
        Ok(())
    }

    /// Renders the complete RFC 5322 message with generated Date and
    /// Message-ID fields. Dot-stuffing is the transport codec's business.
    pub(crate) fn formatted(&self, fields: &FieldGenerator) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(&format!("From: <{}>\r\n", self.from));
        let to_list: Vec<String> = self.to.iter().map(|to| format!("<{to}>")).collect();
        out.push_str(&format!("To: {}\r\n", to_list.join(", ")));
        if !self.subject.is_empty() {
            out.push_str(&format!("Subject: {}\r\n", self.subject));
        }
        out.push_str(&format!("Date: {}\r\n", fields.date()));
        out.push_str(&format!("Message-ID: {}\r\n", fields.message_id()));
        out.push_str("\r\n");
        out.push_str(&normalize_crlf(&self.body));
        out.into_bytes()
    }
}

/// Builder for [`Message`]
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    from: Option<Address>,
    to: Vec<Address>,
    subject: String,
    body: String,
}

impl MessageBuilder {
    /// Sets the envelope sender
    pub fn from(mut self, from: Address) -> Self {
        self.from = Some(from);
        self
    }

    /// Adds one envelope recipient
    pub fn to(mut self, to: Address) -> Self {
        self.to.push(to);
        self
    }

    /// Sets the subject line
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Sets the plain text body
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Builds the message, failing when sender or recipients are missing
    pub fn build(self) -> Result<Message, Error> {
        let from = self.from.ok_or(Error::MissingFrom)?;
        if self.to.is_empty() {
            return Err(Error::MissingTo);
        }
        Ok(Message {
            from,
            to: self.to,
            subject: self.subject,
            body: self.body,
        })
    }
}

/// Rewrites bare LF line endings to CRLF
fn normalize_crlf(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = '\0';
    for c in text.chars() {
        if c == '\n' && last != '\r' {
            out.push('\r');
        }
        out.push(c);
        last = c;
    }
    out
}

/// Generates the per-send Date and Message-ID header fields, seeded with
/// the hostname the mailer greets with
#[derive(Debug, Clone)]
pub(crate) struct FieldGenerator {
    hostname: String,
}

impl FieldGenerator {
    pub(crate) fn new(hostname: impl Into<String>) -> FieldGenerator {
        FieldGenerator {
            hostname: hostname.into(),
        }
    }

    fn date(&self) -> String {
        FieldGenerator::date_at(SystemTime::now())
    }

    fn date_at(time: SystemTime) -> String {
        let mut s = httpdate::fmt_http_date(time);
        if s.ends_with(" GMT") {
            // The httpdate crate always appends ` GMT` to the end of the string,
            // but this is considered an obsolete date format for email
            // https://tools.ietf.org/html/rfc2822#appendix-A.6.2,
            // so we replace `GMT` with `-0000`
            s.truncate(s.len() - "GMT".len());
            s.push_str("-0000");
        }
        s
    }

    fn message_id(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        format!("<{millis:x}.{:08x}@{}>", fastrand::u32(..), self.hostname)
    }
}
