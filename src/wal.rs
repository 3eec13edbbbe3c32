use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Append-only write-ahead log of serde records.
///
/// Frame layout: `[u32 len][bincode record][u32 crc32]`, little endian.
/// `len` covers the payload only. A torn or corrupt tail ends replay; every
/// frame before it is kept.
pub struct Wal<E> {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    _record: PhantomData<fn(E)>,
}

fn write_frame<E: Serialize>(writer: &mut impl Write, record: &E) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

enum Frame {
    Payload(Vec<u8>),
    /// Clean end of file, torn write, or checksum mismatch.
    End,
}

/// `read_exact` that maps a short read to `Ok(false)`.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut word = [0u8; 4];
    if !fill(reader, &mut word)? {
        return Ok(Frame::End);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(word) as usize];
    if !fill(reader, &mut payload)? || !fill(reader, &mut word)? {
        return Ok(Frame::End);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(Frame::End);
    }
    Ok(Frame::Payload(payload))
}

impl<E: Serialize + DeserializeOwned> Wal<E> {
    /// Open (or create) the log at `path` for appending.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            _record: PhantomData,
        })
    }

    /// Write `records` and fsync them as one unit. On error the file is cut
    /// back to where it stood before the call, so a failed batch leaves
    /// nothing behind for replay to pick up.
    pub fn append_batch<'a>(&mut self, records: impl IntoIterator<Item = &'a E>) -> io::Result<()>
    where
        E: 'a,
    {
        self.writer.flush()?;
        let mark = self.writer.get_ref().metadata()?.len();
        let mut written = 0;
        let result = records
            .into_iter()
            .try_for_each(|record| {
                written += 1;
                write_frame(&mut self.writer, record)
            })
            .and_then(|()| self.flush_sync());
        match result {
            Ok(()) => {
                self.appends_since_compact += written;
                Ok(())
            }
            Err(e) => {
                self.truncate_to(mark)?;
                Err(e)
            }
        }
    }

    #[cfg(test)]
    pub fn append(&mut self, record: &E) -> io::Result<()> {
        self.append_batch(std::iter::once(record))
    }

    fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Drop unwritten buffer contents and cut the file back to `len` bytes.
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the buffer instead of flushing it.
        let _ = stale.into_parts();
        self.writer.get_ref().set_len(len)?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replace the log with `records`: write a synced temp file, then rename it over.
    pub fn rewrite(&mut self, records: &[E]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for record in records {
                write_frame(&mut tmp, record)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        self.flush_sync()?;
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Read every intact record. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<E>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        while let Frame::Payload(payload) = read_frame(&mut reader)? {
            match bincode::deserialize::<E>(&payload) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
        }
        Ok(records)
    }
}
