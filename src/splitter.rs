//! Document Splitter (SPEC_FULL.md §4.2).
//!
//! Converts a byte stream of one inner XML file into a lazy, non-restartable sequence
//! of `(logical_name, fragment)` pairs, one per `<exchange-document>` element.

use std::io::Read;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::SplitterError;

const START_MARKER: &[u8] = b"<exchange-document ";
const END_MARKER: &[u8] = b"</exchange-document>";

/// Default upper bound on a single buffered scan unit before `OversizedLine` fires.
pub const DEFAULT_MAX_LINE_BYTES: usize = 256 * 1024 * 1024;

const READ_WINDOW: usize = 64 * 1024;

lazy_static! {
    static ref COUNTRY_RE: Regex = Regex::new(r#"country="([^"]*)""#).unwrap();
    static ref DOC_NUMBER_RE: Regex = Regex::new(r#"doc-number="([^"]*)""#).unwrap();
    static ref KIND_RE: Regex = Regex::new(r#"kind="([^"]*)""#).unwrap();
}

/// Reads `raw` in delimiter-bounded chunks, where a delimiter is the first `>` or `\n`
/// byte encountered. Every chunk therefore begins immediately after a tag boundary (or
/// at the start of the stream) and ends at the next one, which guarantees a `<...>`
/// tag — and in particular the `<exch:`/`</exch:` tokens normalised below — is never
/// split across two chunks. That property is what lets namespace normalisation run
/// per-chunk without any cross-chunk buffering trick.
struct ChunkReader<R> {
    reader: R,
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl<R: Read> ChunkReader<R> {
    fn new(reader: R) -> Self {
        ChunkReader {
            reader,
            buf: Vec::new(),
            pos: 0,
            eof: false,
        }
    }

    fn fill(&mut self) -> std::io::Result<()> {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        let mut window = vec![0u8; READ_WINDOW];
        let n = self.reader.read(&mut window)?;
        if n == 0 {
            self.eof = true;
        } else {
            self.buf.extend_from_slice(&window[..n]);
        }
        Ok(())
    }

    /// Returns the next chunk, or `None` at end of stream. `max_bytes` bounds how far
    /// we'll buffer while searching for a delimiter.
    fn next_chunk(&mut self, max_bytes: usize) -> Result<Option<Vec<u8>>, SplitterError> {
        loop {
            if let Some(rel) = self.buf[self.pos..]
                .iter()
                .position(|&b| b == b'\n' || b == b'>')
            {
                let end = self.pos + rel + 1;
                let chunk = self.buf[self.pos..end].to_vec();
                self.pos = end;
                return Ok(Some(chunk));
            }

            if self.eof {
                if self.pos < self.buf.len() {
                    let chunk = self.buf[self.pos..].to_vec();
                    self.pos = self.buf.len();
                    return Ok(Some(chunk));
                }
                return Ok(None);
            }

            if self.buf.len() - self.pos >= max_bytes {
                return Err(SplitterError::OversizedLine { limit: max_bytes });
            }

            self.fill()?;
        }
    }
}

#[derive(Debug)]
enum State {
    Outside,
    Collecting(Vec<u8>),
}

/// Lazily splits one inner XML file into exchange-document fragments.
///
/// Consumes `R` as it is iterated; the sequence is finite and non-restartable, and
/// ends with `None` once the underlying stream is exhausted in the `Outside` state.
/// If the stream ends while a fragment is only partially collected, the iterator
/// yields one final `Err(SplitterError::MalformedStream)` and then stops.
pub struct DocumentSplitter<R> {
    chunks: ChunkReader<R>,
    state: State,
    max_line_bytes: usize,
    done: bool,
}

impl<R: Read> DocumentSplitter<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_line_bytes(reader, DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(reader: R, max_line_bytes: usize) -> Self {
        DocumentSplitter {
            chunks: ChunkReader::new(reader),
            state: State::Outside,
            max_line_bytes,
            done: false,
        }
    }

    fn emit(&self, fragment_bytes: Vec<u8>) -> (String, String) {
        let fragment = String::from_utf8_lossy(&fragment_bytes).into_owned();
        let logical_name = derive_logical_name(&fragment);
        (logical_name, fragment)
    }
}

impl<R: Read> Iterator for DocumentSplitter<R> {
    type Item = Result<(String, String), SplitterError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let raw = match self.chunks.next_chunk(self.max_line_bytes) {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    return match std::mem::replace(&mut self.state, State::Outside) {
                        State::Outside => {
                            self.done = true;
                            None
                        }
                        State::Collecting(_) => {
                            self.done = true;
                            Some(Err(SplitterError::MalformedStream))
                        }
                    };
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            let chunk = normalize_namespace(&raw);

            match &mut self.state {
                State::Outside => {
                    if let Some(start) = find(&chunk, START_MARKER) {
                        let buf = chunk[start..].to_vec();
                        if let Some(end) = find(&buf, END_MARKER) {
                            let fragment_bytes = buf[..end + END_MARKER.len()].to_vec();
                            return Some(Ok(self.emit(fragment_bytes)));
                        }
                        self.state = State::Collecting(buf);
                    }
                    // No marker in this chunk: stay `Outside`, loop for the next one.
                }
                State::Collecting(buf) => {
                    buf.extend_from_slice(&chunk);
                    if let Some(end) = find(buf, END_MARKER) {
                        let fragment_bytes = buf[..end + END_MARKER.len()].to_vec();
                        self.state = State::Outside;
                        return Some(Ok(self.emit(fragment_bytes)));
                    }
                    // Still collecting: loop for the next chunk.
                }
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Replaces `<exch:` with `<` and `</exch:` with `</`. Safe to call per-chunk because
/// `ChunkReader` never splits a tag across chunks (see its doc comment).
fn normalize_namespace(chunk: &[u8]) -> Vec<u8> {
    const OPEN_NS: &[u8] = b"<exch:";
    const CLOSE_NS: &[u8] = b"</exch:";

    let mut out = Vec::with_capacity(chunk.len());
    let mut i = 0;
    while i < chunk.len() {
        if chunk[i..].starts_with(CLOSE_NS) {
            out.extend_from_slice(b"</");
            i += CLOSE_NS.len();
        } else if chunk[i..].starts_with(OPEN_NS) {
            out.push(b'<');
            i += OPEN_NS.len();
        } else {
            out.push(chunk[i]);
            i += 1;
        }
    }
    out
}

/// Derives `{country}-{doc-number}-{kind}.xml` from the opening tag of `fragment`,
/// falling back to `"unknown.xml"` (with a warning) if any attribute is missing.
fn derive_logical_name(fragment: &str) -> String {
    let opening_tag_end = fragment.find('>').unwrap_or(fragment.len());
    let opening_tag = &fragment[..opening_tag_end];

    let country = COUNTRY_RE.captures(opening_tag).map(|c| c[1].to_string());
    let doc_number = DOC_NUMBER_RE.captures(opening_tag).map(|c| c[1].to_string());
    let kind = KIND_RE.captures(opening_tag).map(|c| c[1].to_string());

    match (country, doc_number, kind) {
        (Some(c), Some(d), Some(k)) if !c.is_empty() && !d.is_empty() && !k.is_empty() => {
            format!("{}-{}-{}.xml", c, d, k)
        }
        _ => {
            tracing::warn!(
                opening_tag = %opening_tag,
                "could not derive logical_name, falling back to unknown.xml"
            );
            "unknown.xml".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn split_all(xml: &str) -> Vec<Result<(String, String), String>> {
        DocumentSplitter::new(Cursor::new(xml.as_bytes().to_vec()))
            .map(|r| r.map_err(|e| e.to_string()))
            .collect()
    }

    #[test]
    fn two_records_on_separate_lines() {
        let xml = concat!(
            "<exchange-documents>\n",
            "<exch:exchange-document country=\"EP\" doc-number=\"1234\" kind=\"A1\">x</exch:exchange-document>\n",
            "<exch:exchange-document country=\"US\" doc-number=\"9876543\" kind=\"B2\">y</exch:exchange-document>\n",
            "</exchange-documents>\n",
        );
        let results = split_all(xml);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().0, "EP-1234-A1.xml");
        assert_eq!(results[1].as_ref().unwrap().0, "US-9876543-B2.xml");
        assert!(results[0].as_ref().unwrap().1.starts_with("<exchange-document "));
        assert!(results[0].as_ref().unwrap().1.ends_with("</exchange-document>"));
    }

    #[test]
    fn container_element_does_not_trigger_false_start() {
        let xml = "<exchange-documents total=\"2\">\n\
                   <exch:exchange-document country=\"EP\" doc-number=\"1\" kind=\"A1\">a</exch:exchange-document>\n\
                   <exch:exchange-document country=\"EP\" doc-number=\"2\" kind=\"A1\">b</exch:exchange-document>\n\
                   </exchange-documents>";
        let results = split_all(xml);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn entire_content_on_a_single_line_with_multiple_records() {
        let xml = "<exchange-documents><exch:exchange-document country=\"EP\" doc-number=\"1\" kind=\"A1\">a</exch:exchange-document><exch:exchange-document country=\"US\" doc-number=\"2\" kind=\"B2\">b</exch:exchange-document></exchange-documents>";
        let results = split_all(xml);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().0, "EP-1-A1.xml");
        assert_eq!(results[1].as_ref().unwrap().0, "US-2-B2.xml");
    }

    #[test]
    fn crlf_line_endings_are_handled() {
        let xml = "<exchange-documents>\r\n<exch:exchange-document country=\"EP\" doc-number=\"1\" kind=\"A1\">a</exch:exchange-document>\r\n</exchange-documents>\r\n";
        let results = split_all(xml);
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn opening_tag_alone_on_its_line_then_closed_later() {
        let xml = "<exch:exchange-document country=\"EP\" doc-number=\"1\" kind=\"A1\">\n<more>stuff</more>\n</exch:exchange-document>\n";
        let results = split_all(xml);
        assert_eq!(results.len(), 1);
        let frag = &results[0].as_ref().unwrap().1;
        assert!(frag.starts_with("<exchange-document "));
        assert!(frag.ends_with("</exchange-document>"));
    }

    #[test]
    fn missing_attribute_falls_back_to_unknown() {
        let xml = "<exch:exchange-document country=\"EP\" doc-number=\"1\">a</exch:exchange-document>";
        let results = split_all(xml);
        assert_eq!(results[0].as_ref().unwrap().0, "unknown.xml");
    }

    #[test]
    fn zero_records_yields_empty_sequence() {
        let xml = "<exchange-documents total=\"0\"></exchange-documents>";
        let results = split_all(xml);
        assert!(results.is_empty());
    }

    #[test]
    fn truncated_stream_surfaces_malformed_error() {
        let xml = "<exch:exchange-document country=\"EP\" doc-number=\"1\" kind=\"A1\">unterminated";
        let results = split_all(xml);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    #[test]
    fn fragment_contains_exactly_one_start_marker() {
        let xml = "<exch:exchange-document country=\"EP\" doc-number=\"1\" kind=\"A1\">a</exch:exchange-document>";
        let results = split_all(xml);
        let frag = &results[0].as_ref().unwrap().1;
        assert_eq!(frag.matches("<exchange-document ").count(), 1);
    }

    #[test]
    fn oversized_line_without_any_delimiter_errors() {
        let huge = "a".repeat(100);
        let results: Vec<_> = DocumentSplitter::with_max_line_bytes(Cursor::new(huge.into_bytes()), 10)
            .collect();
        assert!(matches!(
            results.first(),
            Some(Err(SplitterError::OversizedLine { limit: 10 }))
        ));
    }
}
