use std::io::{BufRead, Read, Write};
use std::ops::Range;

use anyhow::{bail, Context, Result};
use bincode::{Decode, Encode};

const BINCODE_CONFIG: bincode::config::Configuration = bincode::config::standard();

/// One write observed while recording a workload.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct WriteRecord {
    /// absolute position in the write log
    pub id: usize,
    /// first sector touched by the write
    pub sector: u64,
    /// length in sectors
    pub size: u64,
    /// flush/FUA style ordering point
    pub barrier: bool,
    /// file system metadata write?
    pub metadata: bool,
    /// written bytes, absent for writes without payload (e.g. pure flushes)
    pub data: Option<Vec<u8>>,
}

impl WriteRecord {
    /// Clamped to the end of the address space.
    pub fn sector_end(&self) -> u64 {
        self.sector.saturating_add(self.size)
    }

    /// Half-open sector range touched by this write.
    pub fn range(&self) -> Range<u64> {
        self.sector..self.sector_end()
    }

    pub fn data_len(&self) -> usize {
        self.data.as_ref().map_or(0, Vec::len)
    }

    /// Render the record in the textual log format. An absent buffer is an
    /// empty data field, an empty buffer is `-`.
    pub fn to_text(&self) -> String {
        let flags = match (self.barrier, self.metadata) {
            (false, false) => "-",
            (true, false) => "barrier",
            (false, true) => "meta",
            (true, true) => "barrier|meta",
        };
        format!(
            "write,{},{},{},{}",
            self.sector,
            self.size,
            flags,
            match self.data.as_deref() {
                None => String::new(),
                Some([]) => "-".to_string(),
                Some(data) => hex::encode(data),
            }
        )
    }

    fn decode_from_std_read<R: std::io::Read>(
        src: &mut R,
    ) -> std::result::Result<WriteRecord, bincode::error::DecodeError> {
        bincode::decode_from_std_read(src, BINCODE_CONFIG)
    }

    fn encode_into_std_write<W: std::io::Write>(
        &self,
        dst: &mut W,
    ) -> std::result::Result<usize, bincode::error::EncodeError> {
        bincode::encode_into_std_write(self, dst, BINCODE_CONFIG)
    }
}

/// Ordered write log. Owns every record and its buffer; everything downstream
/// refers to records by their absolute position.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WriteLog {
    records: Vec<WriteRecord>,
}

impl WriteLog {
    pub fn new() -> Self {
        WriteLog {
            records: Vec::new(),
        }
    }

    /// Append a write and return its absolute position.
    pub fn push(
        &mut self,
        sector: u64,
        size: u64,
        barrier: bool,
        metadata: bool,
        data: Option<Vec<u8>>,
    ) -> usize {
        let id = self.records.len();
        self.records.push(WriteRecord {
            id,
            sector,
            size,
            barrier,
            metadata,
            data,
        });
        id
    }

    pub fn get(&self, id: usize) -> Option<&WriteRecord> {
        self.records.get(id)
    }

    pub fn records(&self) -> &[WriteRecord] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, WriteRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Collect parsed records into a log, renumbering them in file order.
    /// Fails on a record whose range runs past the end of the address space.
    pub fn from_records(records: impl Iterator<Item = Result<WriteRecord>>) -> Result<Self> {
        let mut log = WriteLog::new();
        for record in records {
            let record = record?;
            if record.sector.checked_add(record.size).is_none() {
                bail!(
                    "write {}: sector {} + size {} exceeds the address space",
                    log.len(),
                    record.sector,
                    record.size
                );
            }
            log.push(
                record.sector,
                record.size,
                record.barrier,
                record.metadata,
                record.data,
            );
        }
        Ok(log)
    }

    pub fn read_bin<R: BufRead>(file: R) -> Result<Self> {
        Self::from_records(parse_log_file_bin(file))
    }

    pub fn read_text<R: BufRead>(file: R) -> Result<Self> {
        Self::from_records(parse_log_file_text(file))
    }

    /// Write the log in the compressed binary format.
    pub fn write_bin<W: Write>(&self, file: W) -> Result<()> {
        let mut writer = new_log_writer_bin(file);
        for record in &self.records {
            record
                .encode_into_std_write(&mut writer)
                .with_context(|| format!("could not encode write {}", record.id))?;
        }
        writer.flush().context("could not flush write log")?;
        Ok(())
    }
}

impl<'a> IntoIterator for &'a WriteLog {
    type Item = &'a WriteRecord;
    type IntoIter = std::slice::Iter<'a, WriteRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Helper to make filter_map() work with error handling.
fn lift_option<T>(r: Result<Option<T>>) -> Option<Result<T>> {
    match r {
        Ok(None) => None,
        Ok(Some(o)) => Some(Ok(o)),
        Err(e) => Some(Err(e)),
    }
}

pub struct BinLogIterator<R: Read> {
    file: R,
}

impl<R: Read> Iterator for BinLogIterator<R> {
    type Item = Result<WriteRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        use bincode::error::DecodeError;
        match WriteRecord::decode_from_std_read(&mut self.file) {
            Ok(e) => Some(Ok(e)),
            Err(DecodeError::UnexpectedEnd { .. }) => None,
            Err(DecodeError::Io { inner, .. })
                if inner.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                None
            }
            Err(e) => Some(Err(e.into())),
        }
    }
}

pub type LogWriter<W> = snap::write::FrameEncoder<W>;

/// Create a write log writer with compression.
pub fn new_log_writer_bin<W: Write>(file: W) -> LogWriter<W> {
    snap::write::FrameEncoder::new(file)
}

/// Parse a binary write log.
pub fn parse_log_file_bin<R: BufRead>(file: R) -> BinLogIterator<snap::read::FrameDecoder<R>> {
    BinLogIterator {
        file: snap::read::FrameDecoder::new(file),
    }
}

fn parse_flags(flags: &str, lineno: usize) -> Result<(bool, bool)> {
    let mut barrier = false;
    let mut metadata = false;
    if flags == "-" || flags.is_empty() {
        return Ok((barrier, metadata));
    }
    for flag in flags.split('|') {
        match flag {
            "barrier" => barrier = true,
            "meta" => metadata = true,
            other => bail!("line {}: unknown flag {}", lineno, other),
        }
    }
    Ok((barrier, metadata))
}

/// sector, size, barrier, metadata, data
type RecordFields = (u64, u64, bool, bool, Option<Vec<u8>>);

/// Parse a textual write log. Ids are assigned in order of the emitted records.
pub fn parse_log_file_text(file: impl BufRead) -> impl Iterator<Item = Result<WriteRecord>> {
    let mut next_id = 0;
    file.lines().enumerate().filter_map(move |(idx, line)| {
        let lineno = idx + 1;
        let parsed: Result<Option<RecordFields>> = (|| {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return Ok(None);
            }
            let cols: Vec<&str> = line.split(',').collect();
            Ok(match cols[0] {
                "write" => {
                    if cols.len() != 5 {
                        bail!("line {}: wrong number of write arguments", lineno);
                    }
                    let sector = cols[1]
                        .parse::<u64>()
                        .with_context(|| format!("line {}: invalid sector", lineno))?;
                    let size = cols[2]
                        .parse::<u64>()
                        .with_context(|| format!("line {}: invalid size", lineno))?;
                    if sector.checked_add(size).is_none() {
                        bail!("line {}: write runs past the last sector", lineno);
                    }
                    let (barrier, metadata) = parse_flags(cols[3], lineno)?;
                    let data = match cols[4] {
                        "" => None,
                        "-" => Some(Vec::new()),
                        hexdata => Some(
                            hex::decode(hexdata)
                                .with_context(|| format!("line {}: invalid data", lineno))?,
                        ),
                    };
                    Some((sector, size, barrier, metadata, data))
                }
                "barrier" => {
                    if cols.len() != 2 {
                        bail!("line {}: wrong number of barrier arguments", lineno);
                    }
                    let sector = cols[1]
                        .parse::<u64>()
                        .with_context(|| format!("line {}: invalid sector", lineno))?;
                    Some((sector, 0, true, false, None))
                }
                op => {
                    bail!("line {}: unsupported operation {}", lineno, op);
                }
            })
        })();
        lift_option(parsed.map(|fields| {
            fields.map(|(sector, size, barrier, metadata, data)| {
                let id = next_id;
                next_id += 1;
                WriteRecord {
                    id,
                    sector,
                    size,
                    barrier,
                    metadata,
                    data,
                }
            })
        }))
    })
}
