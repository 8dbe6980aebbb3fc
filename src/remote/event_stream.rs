//! Incremental decoder for `text/event-stream` bodies.
//!
//! Only `data:` fields matter to the push feed; `event:`, `id:`, `retry:`
//! and comment lines are skipped. Chunks are buffered as bytes and a line is
//! decoded only once it is complete, so a character split between chunks
//! survives.

use super::RemoteError;

#[derive(Debug, Default)]
pub struct EventStreamDecoder {
  buffer: Vec<u8>,
  data: Vec<String>,
}

impl EventStreamDecoder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Feed a chunk of the body; returns the data payload of every event it completed.
  pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, RemoteError> {
    self.buffer.extend_from_slice(chunk);

    let mut events = Vec::new();
    while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
      let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
      let line = String::from_utf8(raw)
        .map_err(|e| RemoteError::InvalidResponse(format!("push feed is not UTF-8: {}", e)))?;
      let line = line.trim_end_matches(['\n', '\r']);

      if line.is_empty() {
        if !self.data.is_empty() {
          events.push(self.data.join("\n"));
          self.data.clear();
        }
      } else if let Some(value) = line.strip_prefix("data:") {
        self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
      }
    }
    Ok(events)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_single_event() {
    let mut decoder = EventStreamDecoder::new();
    let events = decoder.push(b"data: [1,2]\n\n").unwrap();
    assert_eq!(events, vec!["[1,2]"]);
  }

  #[test]
  fn test_event_split_across_chunks() {
    let mut decoder = EventStreamDecoder::new();
    assert!(decoder.push(b"data: [1,").unwrap().is_empty());
    assert!(decoder.push(b"2]\n").unwrap().is_empty());
    assert_eq!(decoder.push(b"\n").unwrap(), vec!["[1,2]"]);
  }

  #[test]
  fn test_character_split_across_chunks() {
    let body = "data: [\"Café\"]\n\n".as_bytes();
    // Cut between the two bytes of 'é'
    let cut = body.iter().position(|b| *b == 0xC3).unwrap() + 1;

    let mut decoder = EventStreamDecoder::new();
    assert!(decoder.push(&body[..cut]).unwrap().is_empty());
    assert_eq!(decoder.push(&body[cut..]).unwrap(), vec!["[\"Café\"]"]);
  }

  #[test]
  fn test_invalid_utf8_is_an_error() {
    let mut decoder = EventStreamDecoder::new();
    assert!(matches!(
      decoder.push(b"data: [\"\xff\"]\n\n"),
      Err(RemoteError::InvalidResponse(_))
    ));
  }

  #[test]
  fn test_multiline_data_and_ignored_fields() {
    let mut decoder = EventStreamDecoder::new();
    let events = decoder
      .push(b": keepalive\nevent: snapshot\ndata: [\r\ndata: 1]\r\n\r\n")
      .unwrap();
    assert_eq!(events, vec!["[\n1]"]);
  }

  #[test]
  fn test_blank_lines_without_data_emit_nothing() {
    let mut decoder = EventStreamDecoder::new();
    assert!(decoder.push(b"\n\n: ping\n\n").unwrap().is_empty());
  }
}
