use serde::Deserialize;
use std::borrow::Cow;

/// Text encoding used to decode client strings.
///
/// Byte length and character count differ for multi-byte encodings, so
/// readers account for consumed bytes, never for decoded string length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum Charset {
    #[default]
    #[serde(rename = "UTF8", alias = "utf8", alias = "UTF-8")]
    Utf8,
    #[serde(rename = "LATIN1", alias = "latin1", alias = "ISO-8859-1")]
    Latin1,
}

impl Charset {
    /// Resolves a PostgreSQL encoding name such as the `client_encoding`
    /// startup parameter.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().replace(['-', '_'], "").as_str() {
            "UTF8" | "UNICODE" => Some(Charset::Utf8),
            "LATIN1" | "ISO88591" => Some(Charset::Latin1),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Charset::Utf8 => "UTF8",
            Charset::Latin1 => "LATIN1",
        }
    }

    /// Invalid UTF-8 sequences decode to U+FFFD.
    pub fn decode<'a>(self, bytes: &'a [u8]) -> Cow<'a, str> {
        match self {
            Charset::Utf8 => String::from_utf8_lossy(bytes),
            Charset::Latin1 => Cow::Owned(bytes.iter().map(|&b| b as char).collect()),
        }
    }

    /// Characters outside LATIN1 are sent as `?`.
    pub fn encode<'a>(self, text: &'a str) -> Cow<'a, [u8]> {
        match self {
            Charset::Utf8 => Cow::Borrowed(text.as_bytes()),
            Charset::Latin1 => Cow::Owned(
                text.chars()
                    .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                    .collect(),
            ),
        }
    }
}
