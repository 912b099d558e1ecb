use base64::{engine::general_purpose, Engine as _};
use lazy_static::lazy_static;
use regex::Regex;
use std::borrow::Cow;

lazy_static! {
    static ref HEADER_LINE: Regex = Regex::new(r"^([!-9;-~]+):[ \t]*(.*)$").unwrap();
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("no message on input")]
    Empty,
    #[error("no blank line separating headers from body")]
    MissingSeparator,
}

/// Header fields in the order they were first received.
///
/// A repeated name overwrites the earlier value in place, so the map keeps one
/// value per name like the header blocks the filter was built around.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Exact name match first, then ASCII case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .or_else(|| self.entries.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `Name: value` lines joined with `\n`, used by header rules.
    pub fn serialize(&self) -> String {
        self.entries
            .iter()
            .map(|(n, v)| format!("{n}: {v}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn append_continuation(&mut self, name: &str, text: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| n == name) {
            if entry.1.is_empty() {
                entry.1.push_str(text);
            } else {
                entry.1.push(' ');
                entry.1.push_str(text);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParsedMessage {
    headers: HeaderMap,
    raw_headers: String,
    body: String,
    header_bytes: Vec<u8>,
    body_bytes: Vec<u8>,
    eol: &'static str,
    raw_len: usize,
}

impl ParsedMessage {
    /// Split raw input on the first blank line (LF or CRLF) and parse the
    /// header block. The original bytes are kept for re-emission; the text
    /// views decode invalid UTF-8 lossily and serve inspection only.
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        if raw.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(ParseError::Empty);
        }

        let mut offset = 0;
        let mut separator = None;
        for line in raw.split_inclusive(|&b| b == b'\n') {
            if line == b"\n" || line == b"\r\n" {
                separator = Some((offset, line.len()));
                break;
            }
            offset += line.len();
        }

        let (start, len) = separator.ok_or(ParseError::MissingSeparator)?;
        let header_bytes = raw[..start].to_vec();
        let body_bytes = raw[start + len..].to_vec();
        let raw_headers = String::from_utf8_lossy(&header_bytes).into_owned();
        let body = String::from_utf8_lossy(&body_bytes).into_owned();
        let eol = if len == 2 { "\r\n" } else { "\n" };

        let mut headers = HeaderMap::new();
        let mut last_name: Option<String> = None;
        for line in raw_headers.lines() {
            if let Some(caps) = HEADER_LINE.captures(line) {
                let name = caps[1].to_string();
                headers.insert(name.clone(), caps[2].trim().to_string());
                last_name = Some(name);
            } else if let Some(name) = &last_name {
                let text = line.trim();
                if !text.is_empty() {
                    headers.append_continuation(name, text);
                }
            }
        }

        log::debug!(
            "Parsed message: {} headers, {} body bytes",
            headers.len(),
            body_bytes.len()
        );

        Ok(Self {
            headers,
            raw_headers,
            body,
            header_bytes,
            body_bytes,
            eol,
            raw_len: raw.len(),
        })
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn subject(&self) -> &str {
        self.headers.get("Subject").unwrap_or("")
    }

    pub fn from(&self) -> &str {
        self.headers.get("From").unwrap_or("")
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Body with a base64 transfer encoding undone, for content inspection.
    pub fn decoded_body(&self) -> Cow<'_, str> {
        let is_base64 = self
            .headers
            .get("Content-Transfer-Encoding")
            .map(|v| v.trim().eq_ignore_ascii_case("base64"))
            .unwrap_or(false);
        if !is_base64 {
            return Cow::Borrowed(&self.body);
        }

        let compact: String = self.body.chars().filter(|c| !c.is_whitespace()).collect();
        match general_purpose::STANDARD.decode(compact.as_bytes()) {
            Ok(decoded) => Cow::Owned(String::from_utf8_lossy(&decoded).into_owned()),
            Err(e) => {
                log::debug!("Body declared base64 but failed to decode: {e}");
                Cow::Borrowed(&self.body)
            }
        }
    }

    pub fn raw_headers(&self) -> &str {
        &self.raw_headers
    }

    pub fn eol(&self) -> &'static str {
        self.eol
    }

    pub fn raw_len(&self) -> usize {
        self.raw_len
    }

    pub fn to_outgoing(&self) -> OutgoingMessage {
        OutgoingMessage {
            header_block: self.header_bytes.clone(),
            body: self.body_bytes.clone(),
            eol: self.eol,
        }
    }
}

/// Editable copy of a message as bytes. Untouched header fields and the body
/// keep their original encoding, folding and line endings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    header_block: Vec<u8>,
    body: Vec<u8>,
    eol: &'static str,
}

impl OutgoingMessage {
    pub fn new(headers: &[(&str, &str)], body: &str) -> Self {
        let mut message = Self {
            header_block: Vec::new(),
            body: body.as_bytes().to_vec(),
            eol: "\n",
        };
        for (name, value) in headers {
            message.add_header(name, value);
        }
        message
    }

    pub fn has_header(&self, name: &str) -> bool {
        header_fields(&self.header_block)
            .iter()
            .any(|field| field_name(field).is_some_and(|n| n.eq_ignore_ascii_case(name.as_bytes())))
    }

    fn terminate_block(&mut self) {
        if !self.header_block.is_empty() && !self.header_block.ends_with(b"\n") {
            self.header_block.extend_from_slice(self.eol.as_bytes());
        }
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.terminate_block();
        let line = format!("{name}: {value}{}", self.eol);
        self.header_block.extend_from_slice(line.as_bytes());
    }

    /// Prepend headers ahead of the existing block, e.g. envelope headers.
    pub fn prepend_header(&mut self, name: &str, value: &str) {
        let line = format!("{name}: {value}{}", self.eol);
        self.header_block.splice(0..0, line.into_bytes());
    }

    /// Prefix the subject with `tag` unless it already carries it.
    pub fn tag_subject(&mut self, tag: &str) {
        let eol = self.eol;
        let fields = header_fields(&self.header_block);
        let position = fields
            .iter()
            .position(|field| field_name(field).is_some_and(|n| n.eq_ignore_ascii_case(b"subject")));

        match position {
            Some(index) => {
                let current = unfold_value(fields[index]);
                if current.starts_with(tag) {
                    return;
                }
                let replacement = if current.is_empty() {
                    format!("Subject: {tag}{eol}")
                } else {
                    format!("Subject: {tag} {current}{eol}")
                };
                let mut block = Vec::with_capacity(self.header_block.len() + tag.len() + 1);
                for (i, field) in fields.iter().enumerate() {
                    if i == index {
                        block.extend_from_slice(replacement.as_bytes());
                    } else {
                        block.extend_from_slice(field);
                    }
                }
                self.header_block = block;
            }
            None => self.add_header("Subject", tag),
        }
    }

    /// Append `footer` after the existing body on its own line.
    pub fn append_footer(&mut self, footer: &str) {
        if !self.body.is_empty() && !self.body.ends_with(b"\n") {
            self.body.extend_from_slice(self.eol.as_bytes());
        }
        self.body.extend_from_slice(footer.as_bytes());
        self.body.extend_from_slice(self.eol.as_bytes());
    }

    pub fn body(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn header_block(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.header_block)
    }

    /// The message exactly as it is handed to a backend.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_block.len() + self.body.len() + 2);
        out.extend_from_slice(&self.header_block);
        if !self.header_block.is_empty() && !self.header_block.ends_with(b"\n") {
            out.extend_from_slice(self.eol.as_bytes());
        }
        out.extend_from_slice(self.eol.as_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    /// Lossy text view of `to_bytes`, for logs and inspection.
    pub fn to_message_string(&self) -> String {
        String::from_utf8_lossy(&self.to_bytes()).into_owned()
    }
}

/// Split a raw header block into fields, each with its continuation lines.
fn header_fields(block: &[u8]) -> Vec<&[u8]> {
    let mut fields = Vec::new();
    let mut start = 0;
    let mut offset = 0;
    for line in block.split_inclusive(|&b| b == b'\n') {
        let continuation = line.starts_with(b" ") || line.starts_with(b"\t");
        if !continuation && offset > start {
            fields.push(&block[start..offset]);
            start = offset;
        }
        offset += line.len();
    }
    if offset > start {
        fields.push(&block[start..offset]);
    }
    fields
}

fn field_name(field: &[u8]) -> Option<&[u8]> {
    let colon = field.iter().position(|&b| b == b':')?;
    let name = &field[..colon];
    if name.is_empty() || name.iter().any(u8::is_ascii_whitespace) {
        None
    } else {
        Some(name)
    }
}

fn unfold_value(field: &[u8]) -> String {
    let field = String::from_utf8_lossy(field);
    let value = field.split_once(':').map(|(_, v)| v).unwrap_or("");
    value
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
