//! Inner Archive Reader (SPEC_FULL.md §4.3).
//!
//! Enumerates the members of an inner archive (one ZIP nested under an outer
//! delivery archive's `Root/DOC/` prefix) as a lazy sequence of readers.

use std::io::{Cursor, Read};

use crate::error::ArchiveError;

/// The maximum number of bytes an inner archive's *compressed* bytes may occupy once
/// read into memory. `zip::ZipArchive::by_index` takes `&mut self`, so it cannot hand
/// back two overlapping streaming readers; the documented fallback (SPEC_FULL.md
/// §4.3) is to materialise the inner archive's own bytes (not its *decompressed*
/// member contents) once, bounded by this limit. DOCDB inner archives are tens of MB
/// compressed; 512 MiB leaves ample headroom while still bounding worst case memory.
pub const MAX_INNER_ARCHIVE_BYTES: u64 = 512 * 1024 * 1024;

/// Reads an inner archive's compressed bytes fully into memory (bounded by
/// [`MAX_INNER_ARCHIVE_BYTES`]) and exposes its members as a lazy sequence.
///
/// A member's reader borrows `self` and is only valid until the next call to
/// [`InnerArchiveReader::next_entry`] — enforced by the borrow checker, since
/// `zip::read::ZipFile` itself borrows the underlying `ZipArchive` mutably.
pub struct InnerArchiveReader {
    archive: zip::ZipArchive<Cursor<Vec<u8>>>,
    next_index: usize,
}

impl InnerArchiveReader {
    /// Reads `reader` fully (bounded by [`MAX_INNER_ARCHIVE_BYTES`]) and opens it as a
    /// ZIP archive. Returns [`ArchiveError::Corrupt`] if the bytes aren't a valid ZIP.
    pub fn new(mut reader: impl Read) -> Result<Self, ArchiveError> {
        let mut bytes = Vec::new();
        reader
            .by_ref()
            .take(MAX_INNER_ARCHIVE_BYTES)
            .read_to_end(&mut bytes)?;
        let archive = zip::ZipArchive::new(Cursor::new(bytes))?;
        Ok(InnerArchiveReader {
            archive,
            next_index: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.archive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archive.len() == 0
    }

    /// Advances to the next member, returning its name and a reader for its
    /// (decompressed) contents. Returns `None` once every member has been visited.
    pub fn next_entry(
        &mut self,
    ) -> Option<Result<(String, zip::read::ZipFile<'_>), ArchiveError>> {
        if self.next_index >= self.archive.len() {
            return None;
        }
        let index = self.next_index;
        self.next_index += 1;
        match self.archive.by_index(index) {
            Ok(file) => {
                let name = file.name().to_string();
                Some(Ok((name, file)))
            }
            Err(e) => Some(Err(e.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_zip(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(Cursor::new(&mut buf));
            let options =
                zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
            for (name, content) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        buf
    }

    #[test]
    fn enumerates_members_in_order() {
        let zip_bytes = build_zip(&[("a.xml", "A"), ("b.xml", "B")]);
        let mut reader = InnerArchiveReader::new(Cursor::new(zip_bytes)).unwrap();
        assert_eq!(reader.len(), 2);

        let (name, mut file) = reader.next_entry().unwrap().unwrap();
        assert_eq!(name, "a.xml");
        let mut content = String::new();
        file.read_to_string(&mut content).unwrap();
        assert_eq!(content, "A");

        let (name, _) = reader.next_entry().unwrap().unwrap();
        assert_eq!(name, "b.xml");

        assert!(reader.next_entry().is_none());
    }

    #[test]
    fn corrupt_archive_is_reported_as_an_error() {
        let result = InnerArchiveReader::new(Cursor::new(b"not a zip file".to_vec()));
        assert!(result.is_err());
    }
}
