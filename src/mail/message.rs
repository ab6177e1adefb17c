//! Mail message model
//!
//! A mail is a case-insensitive header map plus a body string. Headers that
//! legitimately repeat (`Received`, `Delivered-To`, ...) keep every
//! occurrence in arrival order. Every mail carries a Message-Id; one is
//! synthesized when the source lacks it, since Message-Id is the only
//! identity that survives moves between mailboxes.

use std::collections::HashMap;

use chrono::Utc;
use mail_builder::headers::text::Text;
use mail_builder::MessageBuilder;
use uuid::Uuid;

use super::{MailError, MailResult};

/// Case-insensitive header map preserving insertion order and repeated values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderMap {
    // lowercase name -> position in entries
    index: HashMap<String, usize>,
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value, keeping any values already stored under the name
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let lower = name.to_lowercase();
        match self.index.get(&lower) {
            Some(&position) => self.entries[position].1.push(value.into()),
            None => {
                self.index.insert(lower, self.entries.len());
                self.entries.push((name, vec![value.into()]));
            }
        }
    }

    /// Set a single value, replacing all values stored under the name
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let lower = name.to_lowercase();
        match self.index.get(&lower) {
            Some(&position) => self.entries[position].1 = vec![value.into()],
            None => {
                self.index.insert(lower, self.entries.len());
                self.entries.push((name, vec![value.into()]));
            }
        }
    }

    /// First value stored under the name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.index
            .get(&name.to_lowercase())
            .map(|&position| self.entries[position].1[0].as_str())
    }

    /// All values stored under the name, in arrival order
    pub fn get_all(&self, name: &str) -> Option<&[String]> {
        self.index
            .get(&name.to_lowercase())
            .map(|&position| self.entries[position].1.as_slice())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(&name.to_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One email message
#[derive(Debug, Clone)]
pub struct Mail {
    headers: HeaderMap,
    body: String,
    // cached RFC822 form; built lazily, not refreshed on mutation
    native: Option<Vec<u8>>,
}

impl Mail {
    /// Create a mail from explicit headers and body, synthesizing a
    /// Message-Id if the headers lack one
    pub fn new(headers: HeaderMap, body: impl Into<String>) -> Self {
        let mut mail = Self {
            headers,
            body: body.into(),
            native: None,
        };
        if !mail.headers.contains("Message-Id") {
            mail.headers.set("Message-Id", synthesize_message_id());
        }
        mail
    }

    /// Parse a raw RFC822 message
    ///
    /// All header fields are kept; encoded-word values are decoded and
    /// folded lines unfolded. Repeated fields accumulate in order, so
    /// `Received` trace headers stay complete with the most recent hop
    /// first. A non-multipart body is decoded per its declared charset.
    pub fn from_rfc822(raw: &[u8]) -> MailResult<Self> {
        let parsed = mailparse::parse_mail(raw).map_err(|e| MailError::Parse(e.to_string()))?;

        let mut headers = HeaderMap::new();
        for header in &parsed.headers {
            headers.append(header.get_key(), header.get_value());
        }

        let body = if parsed.subparts.is_empty() {
            parsed
                .get_body()
                .map_err(|e| MailError::Parse(e.to_string()))?
        } else {
            // multipart body extraction is not supported; headers still match
            String::new()
        };

        // Without a Message-Id the original bytes cannot serve as the native
        // form: re-serialization has to carry the synthesized id
        let native = if headers.contains("Message-Id") {
            Some(raw.to_vec())
        } else {
            headers.set("Message-Id", synthesize_message_id());
            None
        };

        Ok(Self {
            headers,
            body,
            native,
        })
    }

    /// First value of a header, case-insensitive
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// All values of a header, case-insensitive
    pub fn get_header_values(&self, name: &str) -> Option<&[String]> {
        self.headers.get_all(name)
    }

    /// The mail's Message-Id, guaranteed present since construction
    pub fn message_id(&self) -> &str {
        self.headers.get("Message-Id").unwrap_or("")
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    /// Merge headers, overwriting same-named keys
    pub fn update_headers(&mut self, headers: &HeaderMap) {
        for (name, values) in headers.iter() {
            let mut values = values.iter();
            if let Some(first) = values.next() {
                self.headers.set(name, first.clone());
            }
            for value in values {
                self.headers.append(name, value.clone());
            }
        }
    }

    pub fn get_body(&self) -> &str {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = body.into();
    }

    /// The RFC822 form of this mail, built and cached on first request
    ///
    /// Header or body mutations after the first build are not reflected;
    /// the cached bytes are returned as-is.
    pub fn native(&mut self) -> MailResult<&[u8]> {
        if self.native.is_none() {
            self.native = Some(self.build_native()?);
        }
        Ok(self.native.as_deref().unwrap_or_default())
    }

    fn build_native(&self) -> MailResult<Vec<u8>> {
        let mut builder = MessageBuilder::new();
        for (name, values) in self.headers.iter() {
            if name.eq_ignore_ascii_case("message-id") {
                continue;
            }
            for value in values {
                builder = builder.header(name.to_string(), Text::new(value.clone()));
            }
        }
        let id = self
            .message_id()
            .trim_start_matches('<')
            .trim_end_matches('>')
            .to_string();
        builder = builder.message_id(id);
        builder = builder.text_body(self.body.clone());
        Ok(builder.write_to_vec()?)
    }
}

/// Globally unique RFC-5322-style Message-Id
fn synthesize_message_id() -> String {
    format!(
        "<{}.{}@mailbroom>",
        Utc::now().timestamp_millis(),
        Uuid::new_v4().simple()
    )
}
