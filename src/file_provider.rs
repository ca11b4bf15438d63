/// A length-known, positionally-readable source for one requested file,
///  already windowed to the requested resume offset.
pub trait SourceFile: Send + 'static {
    /// Remaining bytes from the resume offset to the end of the file.
    fn size(&self) -> u64;

    /// Read into `buf` at `pos` (relative to the resume offset). Returns the
    ///  number of bytes read; 0 means end of stream. Short reads are allowed.
    fn read_at(&mut self, buf: &mut [u8], pos: u64) -> std::io::Result<usize>;
}

pub enum OpenOutcome {
    File(Box<dyn SourceFile>),
    NotFound,
    AccessDenied,
    /// The requested resume offset lies past the end of the file.
    OffsetTooLarge,
}

/// Server-injected resolution of requested file names to readable sources.
///  The protocol engine never touches the filesystem directly.
pub trait FileProvider: Send + Sync + 'static {
    fn open(&self, name: &str, offset: u64) -> OpenOutcome;
}

/// An in-memory provider, used by tests and useful for serving generated
///  content.
#[derive(Default)]
pub struct MemoryFileProvider {
    files: rustc_hash::FxHashMap<String, Vec<u8>>,
}

impl MemoryFileProvider {
    pub fn new() -> MemoryFileProvider {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, content: Vec<u8>) {
        self.files.insert(name.into(), content);
    }
}

struct MemorySource {
    content: Vec<u8>,
}

impl SourceFile for MemorySource {
    fn size(&self) -> u64 {
        self.content.len() as u64
    }

    fn read_at(&mut self, buf: &mut [u8], pos: u64) -> std::io::Result<usize> {
        let pos = pos.min(self.content.len() as u64) as usize;
        let n = (self.content.len() - pos).min(buf.len());
        buf[..n].copy_from_slice(&self.content[pos..pos + n]);
        Ok(n)
    }
}

impl FileProvider for MemoryFileProvider {
    fn open(&self, name: &str, offset: u64) -> OpenOutcome {
        match self.files.get(name) {
            None => OpenOutcome::NotFound,
            Some(content) => {
                if offset > content.len() as u64 {
                    return OpenOutcome::OffsetTooLarge;
                }
                OpenOutcome::File(Box::new(MemorySource {
                    content: content[offset as usize..].to_vec(),
                }))
            }
        }
    }
}
