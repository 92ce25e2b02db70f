//! Positioned I/O against an image file
//!
//! Every structure is read or written with one seek followed by one exact
//! read or write of its full length. Short transfers surface as
//! [`CckdError::Io`] and abort the pass.

use crate::error::Result;
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

/// Storage an image can live on
pub trait ImageIo: Read + Write + Seek {
    /// Current physical length
    fn byte_len(&mut self) -> std::io::Result<u64>;

    /// Truncate or extend to `len` bytes
    fn set_byte_len(&mut self, len: u64) -> std::io::Result<()>;

    /// Flush to stable storage
    fn sync(&mut self) -> std::io::Result<()> {
        self.flush()
    }
}

impl ImageIo for File {
    fn byte_len(&mut self) -> std::io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn set_byte_len(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.sync_all()
    }
}

impl ImageIo for Cursor<Vec<u8>> {
    fn byte_len(&mut self) -> std::io::Result<u64> {
        Ok(self.get_ref().len() as u64)
    }

    fn set_byte_len(&mut self, len: u64) -> std::io::Result<()> {
        self.get_mut().resize(len as usize, 0);
        Ok(())
    }
}

impl<T: ImageIo + ?Sized> ImageIo for &mut T {
    fn byte_len(&mut self) -> std::io::Result<u64> {
        (**self).byte_len()
    }

    fn set_byte_len(&mut self, len: u64) -> std::io::Result<()> {
        (**self).set_byte_len(len)
    }

    fn sync(&mut self) -> std::io::Result<()> {
        (**self).sync()
    }
}

/// Offset-addressed access to an image
pub struct ImageFile<F: ImageIo> {
    file: F,
}

impl<F: ImageIo> ImageFile<F> {
    pub fn new(file: F) -> Self {
        ImageFile { file }
    }

    /// Read exactly `len` bytes at `offset`
    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        self.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Read up to `len` bytes at `offset`, stopping early at end of file
    pub fn read_upto(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let end = self.len()?;
        if offset >= end {
            return Ok(Vec::new());
        }
        let len = len.min((end - offset) as usize);
        self.read_at(offset, len)
    }

    /// Write all of `data` at `offset`
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    pub fn len(&mut self) -> Result<u64> {
        Ok(self.file.byte_len()?)
    }

    pub fn set_len(&mut self, len: u64) -> Result<()> {
        self.file.set_byte_len(len)?;
        Ok(())
    }

    /// Sync all writes to disk
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync()?;
        Ok(())
    }

    pub fn into_inner(self) -> F {
        self.file
    }
}
