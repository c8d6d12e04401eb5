//! Incremental decoding of pipe reads.
//!
//! Output is decoded as UTF-8 with `encoding_rs`, which carries multi-byte
//! sequences split across reads. When a fallback encoding is set (GBK for
//! Windows PowerShell by default), the first malformed UTF-8 sequence
//! switches the stream to that encoding for the rest of the run.

use encoding_rs::{CoderResult, Decoder, DecoderResult, Encoding, UTF_8};

/// Streaming decoder for one output pipe.
pub(crate) struct OutputDecoder {
    decoder: Decoder,
    fallback: Option<&'static Encoding>,
}

impl OutputDecoder {
    pub(crate) fn new(fallback: Option<&'static Encoding>) -> Self {
        Self {
            decoder: UTF_8.new_decoder_without_bom_handling(),
            fallback: fallback.filter(|encoding| *encoding != UTF_8),
        }
    }

    /// Feed bytes and return whatever text is complete so far.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        match self.fallback {
            Some(encoding) => self.push_or_switch(bytes, encoding),
            None => self.decode(bytes, false),
        }
    }

    /// Flush at end of stream; a dangling partial sequence becomes U+FFFD.
    pub(crate) fn finish(&mut self) -> String {
        self.decode(&[], true)
    }

    /// The encoding currently used for this stream.
    pub(crate) fn encoding(&self) -> &'static Encoding {
        self.decoder.encoding()
    }

    fn push_or_switch(&mut self, mut bytes: &[u8], encoding: &'static Encoding) -> String {
        let mut out = String::new();
        loop {
            out.reserve(
                self.decoder
                    .max_utf8_buffer_length_without_replacement(bytes.len())
                    .unwrap_or(bytes.len() * 3 + 4),
            );
            let (result, read) =
                self.decoder
                    .decode_to_string_without_replacement(bytes, &mut out, false);
            match result {
                DecoderResult::InputEmpty => return out,
                DecoderResult::OutputFull => bytes = &bytes[read..],
                DecoderResult::Malformed(bad, extra) => {
                    // Bytes of a sequence begun in an earlier read are lost.
                    let start = read.saturating_sub(usize::from(bad) + usize::from(extra));
                    tracing::debug!(encoding = encoding.name(), "output is not UTF-8, switching decoder");
                    self.decoder = encoding.new_decoder_without_bom_handling();
                    self.fallback = None;
                    out.push_str(&self.decode(&bytes[start..], false));
                    return out;
                }
            }
        }
    }

    fn decode(&mut self, mut bytes: &[u8], last: bool) -> String {
        let mut out = String::new();
        loop {
            out.reserve(
                self.decoder
                    .max_utf8_buffer_length(bytes.len())
                    .unwrap_or(bytes.len() * 3 + 4),
            );
            let (result, read, _) = self.decoder.decode_to_string(bytes, &mut out, last);
            bytes = &bytes[read..];
            if let CoderResult::InputEmpty = result {
                return out;
            }
        }
    }
}

impl Default for OutputDecoder {
    fn default() -> Self {
        Self::new(None)
    }
}
