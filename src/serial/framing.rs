//! Newline framing of an incoming byte stream.

use super::charset::Charset;

const LINE_FEED: u8 = b'\n';
const CARRIAGE_RETURN: u8 = b'\r';

/// Splits incoming bytes into text lines.
///
/// A line ends at `\n`; one trailing `\r` is stripped as well. Bytes without a
/// delimiter stay buffered indefinitely, there is no size cap.
#[derive(Debug)]
pub struct LineFramer {
   charset: Charset,
   buf: Vec<u8>,
}

impl LineFramer {
   pub const fn new(charset: Charset) -> Self {
      Self {
         charset,
         buf: Vec::new(),
      }
   }

   /// Appends received bytes and returns every line they complete.
   ///
   /// Empty lines are dropped.
   pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
      let mut lines = Vec::new();
      let mut rest = bytes;
      while let Some(pos) = rest.iter().position(|&b| b == LINE_FEED) {
         self.buf.extend_from_slice(&rest[..pos]);
         rest = &rest[pos + 1..];
         if let Some(line) = self.take_line() {
            lines.push(line);
         }
      }
      self.buf.extend_from_slice(rest);
      lines
   }

   /// Drains an unterminated remainder, used once the stream has ended.
   pub fn finish(&mut self) -> Option<String> {
      self.take_line()
   }

   /// Number of bytes waiting for a delimiter.
   pub fn pending(&self) -> usize {
      self.buf.len()
   }

   fn take_line(&mut self) -> Option<String> {
      if self.buf.last() == Some(&CARRIAGE_RETURN) {
         self.buf.pop();
      }
      if self.buf.is_empty() {
         return None;
      }
      let line = self.charset.decode(&self.buf);
      self.buf.clear();
      Some(line)
   }
}
