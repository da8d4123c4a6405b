//! Incremental UTF-8 decoding for streamed answer bodies.
//!
//! Network chunks can split a multi-byte character. The decoder holds the
//! incomplete tail until the next chunk arrives; invalid sequences become
//! U+FFFD.

use super::ClientError;

#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `pending + bytes` as forms complete characters.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    // valid_up_to guarantees this prefix is UTF-8
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }

    /// End of input. Fails if a character was left incomplete.
    pub fn finish(&mut self) -> Result<(), ClientError> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            let n = self.pending.len();
            self.pending.clear();
            Err(ClientError::Read(format!(
                "stream ended inside a UTF-8 sequence ({} dangling bytes)",
                n
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_multibyte_character_is_joined() {
        let bytes = "héllo €".as_bytes();
        let mut decoder = Utf8Decoder::new();
        let mut out = String::new();
        for b in bytes {
            out.push_str(&decoder.push(std::slice::from_ref(b)));
        }
        assert_eq!(out, "héllo €");
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn incomplete_tail_fails_on_finish() {
        let euro = "€".as_bytes();
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.push(&euro[..2]), "");
        assert!(matches!(decoder.finish(), Err(ClientError::Read(_))));
    }

    #[test]
    fn invalid_bytes_become_replacement() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.push(b"a\xffb"), "a\u{fffd}b");
    }
}
