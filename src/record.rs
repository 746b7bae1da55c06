use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::Array3;

use crate::error::{MockError, Result};

const MAGIC: [u8; 8] = *b"LCREC\0\0\x01";
const FORMAT_VERSION: u32 = 1;
const FILE_HEADER_SIZE: usize = 32;
const VERSION_OFFSET: usize = 8;
const RECORD_COUNT_OFFSET: u64 = 12;
// Guards against allocating garbage sizes from a corrupt header.
const MAX_CELLS: usize = 1 << 31;
const MAX_LABEL_LEN: usize = 1 << 16;

/// Index of the matter density parameter within [`LabelVector::parameters`].
const OMEGA_M_INDEX: usize = 1;

/// Simulation parameters attached to a light-cone, passed through untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LabelVector {
    /// WDM, OMm, LX, E0, Tvir, Zeta
    pub parameters: Vec<f32>,
    /// Thomson optical depth
    pub tau: f32,
    /// Global neutral fraction history
    pub xh_history: Vec<f32>,
    /// Redshifts of the neutral fraction history
    pub xh_redshifts: Vec<f32>,
}

impl LabelVector {
    pub fn omega_m(&self) -> Option<f64> {
        self.parameters.get(OMEGA_M_INDEX).map(|&v| v as f64)
    }

    /// Parameters, tau, history and history redshifts as one flat vector.
    pub fn flatten(&self) -> Vec<f32> {
        let mut flat = Vec::with_capacity(
            self.parameters.len() + 1 + self.xh_history.len() + self.xh_redshifts.len(),
        );
        flat.extend_from_slice(&self.parameters);
        flat.push(self.tau);
        flat.extend_from_slice(&self.xh_history);
        flat.extend_from_slice(&self.xh_redshifts);
        flat
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LightconeRecord {
    pub cube: Array3<f64>,
    pub label: LabelVector,
}

fn build_file_header(record_count: u32) -> [u8; FILE_HEADER_SIZE] {
    let mut out = [0u8; FILE_HEADER_SIZE];
    out[..MAGIC.len()].copy_from_slice(&MAGIC);
    out[VERSION_OFFSET..VERSION_OFFSET + 4].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    let count_offset = RECORD_COUNT_OFFSET as usize;
    out[count_offset..count_offset + 4].copy_from_slice(&record_count.to_le_bytes());
    out
}

fn truncated(err: io::Error, what: &str) -> MockError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        MockError::Record(format!("truncated record while reading {what}"))
    } else {
        MockError::Io(err)
    }
}

/// Reads until `buf` is full or the stream ends; returns the bytes read.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn read_len<R: Read>(reader: &mut R, what: &str, limit: usize) -> Result<usize> {
    let value = reader
        .read_u32::<LittleEndian>()
        .map_err(|e| truncated(e, what))? as usize;
    if value > limit {
        return Err(MockError::Record(format!("{what} of {value} exceeds {limit}")));
    }
    Ok(value)
}

fn read_f32s<R: Read>(reader: &mut R, len: usize, what: &str) -> Result<Vec<f32>> {
    let mut values = vec![0f32; len];
    reader
        .read_f32_into::<LittleEndian>(&mut values)
        .map_err(|e| truncated(e, what))?;
    Ok(values)
}

/// Pull-style reader over a light-cone record file.
pub struct RecordReader<R = BufReader<File>> {
    reader: R,
    expected: u32,
    records_read: u32,
}

impl RecordReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }
}

impl<R: Read> RecordReader<R> {
    pub fn from_reader(mut reader: R) -> Result<Self> {
        let mut header = [0u8; FILE_HEADER_SIZE];
        let n = fill(&mut reader, &mut header)?;
        if n < FILE_HEADER_SIZE || header[..MAGIC.len()] != MAGIC {
            return Err(MockError::Record("not a light-cone record file".to_string()));
        }
        let mut field = [0u8; 4];
        field.copy_from_slice(&header[VERSION_OFFSET..VERSION_OFFSET + 4]);
        let version = u32::from_le_bytes(field);
        if version != FORMAT_VERSION {
            return Err(MockError::Record(format!(
                "unsupported record format version {version}"
            )));
        }
        let count_offset = RECORD_COUNT_OFFSET as usize;
        field.copy_from_slice(&header[count_offset..count_offset + 4]);
        Ok(Self {
            reader,
            expected: u32::from_le_bytes(field),
            records_read: 0,
        })
    }

    /// Record count from the header, if the writer was closed properly.
    pub fn expected_records(&self) -> Option<u32> {
        (self.expected > 0).then_some(self.expected)
    }

    /// Next record, or `None` at the end of the stream.
    pub fn next_record(&mut self) -> Result<Option<LightconeRecord>> {
        let mut first = [0u8; 4];
        let n = fill(&mut self.reader, &mut first)?;
        if n == 0 {
            if self.expected > 0 && self.records_read != self.expected {
                return Err(MockError::Record(format!(
                    "header announces {} records, file holds {}",
                    self.expected, self.records_read
                )));
            }
            return Ok(None);
        }
        if n < first.len() {
            return Err(MockError::Record(
                "truncated record while reading cube shape".to_string(),
            ));
        }
        let dx = u32::from_le_bytes(first) as usize;
        let dy = read_len(&mut self.reader, "cube shape", MAX_CELLS)?;
        let dz = read_len(&mut self.reader, "cube shape", MAX_CELLS)?;
        let n_parameters = read_len(&mut self.reader, "parameter count", MAX_LABEL_LEN)?;
        let n_history = read_len(&mut self.reader, "history length", MAX_LABEL_LEN)?;

        let cells = dx
            .checked_mul(dy)
            .and_then(|v| v.checked_mul(dz))
            .filter(|&v| v <= MAX_CELLS)
            .ok_or_else(|| {
                MockError::Record(format!("cube shape ({dx}, {dy}, {dz}) is too large"))
            })?;

        let parameters = read_f32s(&mut self.reader, n_parameters, "parameters")?;
        let tau = self
            .reader
            .read_f32::<LittleEndian>()
            .map_err(|e| truncated(e, "tau"))?;
        let xh_history = read_f32s(&mut self.reader, n_history, "neutral fraction history")?;
        let xh_redshifts = read_f32s(&mut self.reader, n_history, "history redshifts")?;
        let values = read_f32s(&mut self.reader, cells, "cube")?;

        let cube = Array3::from_shape_vec((dx, dy, dz), values.into_iter().map(f64::from).collect())
            .map_err(|e| MockError::Record(format!("cube layout: {e}")))?;
        self.records_read += 1;
        Ok(Some(LightconeRecord {
            cube,
            label: LabelVector {
                parameters,
                tau,
                xh_history,
                xh_redshifts,
            },
        }))
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<LightconeRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Single writer for an output record file.
pub struct RecordWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    records_written: u32,
}

impl RecordWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&build_file_header(0))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            records_written: 0,
        })
    }

    pub fn records_written(&self) -> u32 {
        self.records_written
    }

    /// Appends one record. The record is serialised in full before any byte is written.
    pub fn write(&mut self, cube: &Array3<f64>, label: &LabelVector) -> Result<()> {
        if label.xh_history.len() != label.xh_redshifts.len() {
            return Err(MockError::Record(format!(
                "neutral fraction history has {} values but {} redshifts",
                label.xh_history.len(),
                label.xh_redshifts.len()
            )));
        }
        let (dx, dy, dz) = cube.dim();
        let dim = |v: usize| {
            u32::try_from(v).map_err(|_| MockError::Record(format!("dimension {v} exceeds u32")))
        };

        let mut buf = Vec::with_capacity(
            20 + 4 * (label.flatten().len() + cube.len()),
        );
        buf.write_u32::<LittleEndian>(dim(dx)?)?;
        buf.write_u32::<LittleEndian>(dim(dy)?)?;
        buf.write_u32::<LittleEndian>(dim(dz)?)?;
        buf.write_u32::<LittleEndian>(dim(label.parameters.len())?)?;
        buf.write_u32::<LittleEndian>(dim(label.xh_history.len())?)?;
        for &v in label.flatten().iter() {
            buf.write_f32::<LittleEndian>(v)?;
        }
        for &v in cube.iter() {
            buf.write_f32::<LittleEndian>(v as f32)?;
        }
        self.writer.write_all(&buf)?;
        self.records_written += 1;
        Ok(())
    }

    /// Flushes and stamps the record count into the header.
    pub fn close(mut self) -> Result<PathBuf> {
        self.writer.flush()?;
        {
            let file = self.writer.get_mut();
            file.seek(SeekFrom::Start(RECORD_COUNT_OFFSET))?;
            file.write_all(&self.records_written.to_le_bytes())?;
            file.flush()?;
        }
        Ok(self.path)
    }
}
