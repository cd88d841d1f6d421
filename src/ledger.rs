use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use ulid::Ulid;

use crate::model::LedgerRecord;

/// Upper bound on a single frame; a larger length prefix is treated as garbage.
const MAX_RECORD_BYTES: usize = 16 * 1024 * 1024;

/// Encode a single record to [len][bincode][crc32] format.
fn encode_record(writer: &mut impl Write, record: &LedgerRecord) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "ledger record too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Read the next frame. `Ok(None)` at a clean end, a torn tail, or a
/// corrupt frame; nothing after the first bad frame is read.
fn decode_next(reader: &mut impl Read) -> io::Result<Option<LedgerRecord>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_BYTES {
        return Ok(None);
    }

    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let mut crc_buf = [0u8; 4];
    match reader.read_exact(&mut crc_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }

    Ok(bincode::deserialize::<LedgerRecord>(&payload).ok())
}

/// Append-only booking ledger.
///
/// Format per entry: `[u32: len][bincode: LedgerRecord][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn last entry (crash mid-write) is discarded on replay.
/// - Records are never rewritten or removed.
pub struct Ledger {
    writer: BufWriter<File>,
    path: PathBuf,
    appended: u64,
}

impl Ledger {
    /// Open (or create) the ledger file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appended: 0,
        })
    }

    /// Append one record and fsync.
    pub fn append(&mut self, record: &LedgerRecord) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Buffer a record without syncing. Follow with `flush_sync()` to
    /// durably commit the whole batch.
    pub fn append_buffered(&mut self, record: &LedgerRecord) -> io::Result<()> {
        encode_record(&mut self.writer, record)?;
        self.appended += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records appended through this handle since it was opened.
    pub fn appended(&self) -> u64 {
        self.appended
    }

    /// Every intact record on disk, in append order.
    pub fn replay(path: &Path) -> io::Result<Vec<LedgerRecord>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        while let Some(record) = decode_next(&mut reader)? {
            records.push(record);
        }
        Ok(records)
    }

    /// One resource's history, ordered by sequence number.
    pub fn replay_resource(path: &Path, resource_id: Ulid) -> io::Result<Vec<LedgerRecord>> {
        let mut records: Vec<LedgerRecord> = Self::replay(path)?
            .into_iter()
            .filter(|r| r.resource_id == resource_id)
            .collect();
        records.sort_by_key(|r| r.seq);
        Ok(records)
    }
}
