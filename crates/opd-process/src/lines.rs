/// Splits arbitrary chunks into complete lines, holding the trailing partial
/// line until its newline arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns the lines it completed, without terminators.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.partial.push_str(chunk);
        let Some(last_nl) = self.partial.rfind('\n') else {
            return Vec::new();
        };
        let rest = self.partial.split_off(last_nl + 1);
        let complete = std::mem::replace(&mut self.partial, rest);
        complete
            .split('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l))
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Flush whatever is left once the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.partial);
        let rest = rest.trim_end_matches(['\r', '\n']);
        (!rest.is_empty()).then(|| rest.to_string())
    }
}

/// Incremental UTF-8 decoding that never splits a multi-byte char across
/// reads. Invalid sequences decode lossily.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub(crate) fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let keep = match std::str::from_utf8(&self.pending) {
            Ok(_) => 0,
            // Incomplete sequence at the end: hold it back for the next read
            Err(e) if e.error_len().is_none() => self.pending.len() - e.valid_up_to(),
            Err(_) => 0,
        };
        let tail = self.pending.split_off(self.pending.len() - keep);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = tail;
        text
    }

    pub(crate) fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_lines_across_chunks() {
        let mut buf = LineBuffer::new();
        assert!(buf.push("https://my-app-abc.ver").is_empty());
        let lines = buf.push("cel.app\nnext");
        assert_eq!(lines, vec!["https://my-app-abc.vercel.app"]);
        assert_eq!(buf.finish().as_deref(), Some("next"));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn strips_crlf_and_skips_empty() {
        let mut buf = LineBuffer::new();
        let lines = buf.push("a\r\n\r\n\nb\n");
        assert_eq!(lines, vec!["a", "b"]);
    }

    #[test]
    fn decoder_holds_split_multibyte() {
        let mut d = Utf8Decoder::default();
        let bytes = "✓ done".as_bytes();
        assert_eq!(d.decode(&bytes[..2]), "");
        assert_eq!(d.decode(&bytes[2..]), "✓ done");
        assert_eq!(d.finish(), "");
    }

    #[test]
    fn decoder_lossy_on_invalid() {
        let mut d = Utf8Decoder::default();
        let out = d.decode(&[b'a', 0xff, b'b']);
        assert!(out.starts_with('a'));
        assert!(out.ends_with('b'));
    }
}
