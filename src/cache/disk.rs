use log::debug;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

/// Append-only spill file with a sequential read cursor.
///
/// The backing file is anonymous and is only created on the first write, so
/// a tunnel that never overflows never touches the filesystem.
pub struct DiskCache {
    dir: Option<PathBuf>,
    file: Option<File>,
    write_pos: u64,
    read_pos: u64,
}

impl DiskCache {
    /// `dir` is where the spill file will live; `None` means the system
    /// temporary directory.
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            file: None,
            write_pos: 0,
            read_pos: 0,
        }
    }

    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let pos = self.write_pos;
        let file = self.file()?;
        file.seek(SeekFrom::Start(pos))?;
        file.write_all(data)?;
        self.write_pos += data.len() as u64;
        Ok(data.len())
    }

    /// Reads the next unread bytes, at most `buf.len()` of them.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.peeksize());
        if n == 0 {
            return Ok(0);
        }
        let pos = self.read_pos;
        let file = self.file()?;
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(&mut buf[..n])?;
        self.read_pos += n as u64;
        Ok(n)
    }

    /// Bytes written but not yet read.
    pub fn peeksize(&self) -> usize {
        (self.write_pos - self.read_pos) as usize
    }

    /// Un-reads the last `n` bytes handed out by `read`.
    pub fn rollback(&mut self, n: usize) {
        self.read_pos = self.read_pos.saturating_sub(n as u64);
    }

    /// Drops all content. The file itself is kept for the next spill.
    pub fn clear(&mut self) {
        if let Some(file) = self.file.as_ref() {
            if let Err(e) = file.set_len(0) {
                debug!("spill file truncate failed: {}", e);
            }
        }
        self.write_pos = 0;
        self.read_pos = 0;
    }

    fn file(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            let file = match self.dir.as_ref() {
                Some(dir) => tempfile::tempfile_in(dir)?,
                None => tempfile::tempfile()?,
            };
            debug!("spill file created in {:?}", self.dir);
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("spill file unavailable"))
    }
}

impl Default for DiskCache {
    fn default() -> Self {
        Self::new(None)
    }
}
