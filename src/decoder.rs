//! Incremental UTF-8 decoding for byte streams that may split a character
//! across chunk boundaries.

const REPLACEMENT: char = '\u{FFFD}';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum DecodeState {
    #[default]
    Empty,
    /// Leading bytes of a sequence that the next chunk should complete.
    Pending { bytes: [u8; 3], len: usize },
}

/// Stateful byte-to-text decoder.
///
/// Invalid sequences decode to U+FFFD instead of failing, the same way a
/// browser `TextDecoder` behaves in its default mode.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    state: DecodeState,
}

impl Utf8Decoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        if chunk.is_empty() {
            return String::new();
        }

        match std::mem::take(&mut self.state) {
            DecodeState::Empty => self.decode_bytes(chunk),
            DecodeState::Pending { bytes, len } => {
                let mut joined = Vec::with_capacity(len + chunk.len());
                joined.extend_from_slice(&bytes[..len]);
                joined.extend_from_slice(chunk);
                self.decode_bytes(&joined)
            }
        }
    }

    /// Ends the stream. A sequence still pending can never complete, so it
    /// decodes to a single replacement character.
    pub fn flush(&mut self) -> String {
        match std::mem::take(&mut self.state) {
            DecodeState::Empty => String::new(),
            DecodeState::Pending { .. } => REPLACEMENT.to_string(),
        }
    }

    fn decode_bytes(&mut self, mut input: &[u8]) -> String {
        let mut out = String::with_capacity(input.len());

        loop {
            match std::str::from_utf8(input) {
                Ok(valid) => {
                    out.push_str(valid);
                    return out;
                }
                Err(err) => {
                    let (valid, rest) = input.split_at(err.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());

                    match err.error_len() {
                        Some(invalid) => {
                            out.push(REPLACEMENT);
                            input = &rest[invalid..];
                        }
                        None => {
                            // Incomplete sequence at the end of the input.
                            let mut bytes = [0u8; 3];
                            bytes[..rest.len()].copy_from_slice(rest);
                            self.state = DecodeState::Pending {
                                bytes,
                                len: rest.len(),
                            };
                            return out;
                        }
                    }
                }
            }
        }
    }
}
