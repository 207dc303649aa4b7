use crate::error::ChatError;

/// An invalid byte sequence in the body. `decoded` is the valid text that
/// preceded it in the same chunk.
#[derive(Debug)]
pub struct InvalidUtf8 {
    pub decoded: String,
    pub offset: usize,
}

impl From<InvalidUtf8> for ChatError {
    fn from(err: InvalidUtf8) -> Self {
        ChatError::Decode { offset: err.offset }
    }
}

/// Incremental UTF-8 decoder for a chunked body.
///
/// A chunk boundary may fall inside a multi-byte character; the incomplete
/// tail is held back and completed by the next chunk.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
    offset: usize,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes as much of `chunk` as forms complete characters.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<String, InvalidUtf8> {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let (valid, invalid) = match std::str::from_utf8(&bytes) {
            Ok(_) => (bytes.len(), false),
            Err(err) => (err.valid_up_to(), err.error_len().is_some()),
        };
        let tail = bytes.split_off(valid);
        // `bytes` is now the prefix validated above.
        let decoded = String::from_utf8(bytes).unwrap_or_default();
        self.offset += valid;

        if invalid {
            return Err(InvalidUtf8 {
                decoded,
                offset: self.offset,
            });
        }
        self.pending = tail;
        Ok(decoded)
    }

    /// Ends the stream, returning how many undecoded bytes were discarded.
    pub fn finish(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}
