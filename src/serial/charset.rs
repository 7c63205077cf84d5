//! Character sets used to turn messages into bytes and back.

use std::borrow::Cow;

use strum::{Display, EnumString, IntoStaticStr};

use crate::error::{Result, SerialError};

const REPLACEMENT_BYTE: u8 = b'?';

/// Text encoding of a connection.
///
/// All supported charsets encode `\n` as the single byte `0x0A` and never
/// produce that byte inside a multi-byte sequence, so framing can split on
/// raw bytes before decoding.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(ascii_case_insensitive)]
pub enum Charset {
   #[default]
   #[strum(to_string = "utf-8", serialize = "utf8")]
   Utf8,
   #[strum(to_string = "us-ascii", serialize = "ascii")]
   Ascii,
   #[strum(to_string = "iso-8859-1", serialize = "latin1", serialize = "latin-1")]
   Latin1,
}

impl Charset {
   /// Looks up a charset by one of its names.
   pub fn from_name(name: &str) -> Result<Self> {
      name
         .trim()
         .parse()
         .map_err(|_| SerialError::UnknownCharset(name.to_string()))
   }

   /// Encodes `text`, replacing characters the charset cannot represent with `?`.
   pub fn encode<'a>(self, text: &'a str) -> Cow<'a, [u8]> {
      match self {
         Self::Utf8 => Cow::Borrowed(text.as_bytes()),
         Self::Ascii if text.is_ascii() => Cow::Borrowed(text.as_bytes()),
         Self::Ascii => Cow::Owned(
            text
               .chars()
               .map(|c| if c.is_ascii() { c as u8 } else { REPLACEMENT_BYTE })
               .collect(),
         ),
         Self::Latin1 => Cow::Owned(
            text
               .chars()
               .map(|c| u8::try_from(u32::from(c)).unwrap_or(REPLACEMENT_BYTE))
               .collect(),
         ),
      }
   }

   /// Decodes `bytes`, replacing malformed input with U+FFFD.
   pub fn decode(self, bytes: &[u8]) -> String {
      match self {
         Self::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
         Self::Ascii => bytes
            .iter()
            .map(|&b| if b.is_ascii() { b as char } else { char::REPLACEMENT_CHARACTER })
            .collect(),
         Self::Latin1 => bytes.iter().map(|&b| b as char).collect(),
      }
   }
}
