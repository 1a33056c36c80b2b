use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::{Array2, ArrayBase, ArrayD, Data, Dimension, IxDyn, ShapeBuilder};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::types::*;

// Constants used throughout the codec
const READ_BUFFER_CAPACITY: usize = 65536; // 64KB buffer
const HEADER_WORD_BYTES: u64 = 4;
const MAX_DIMS: i32 = 50;
const MAX_PREALLOCATED_ELEMENTS: usize = 1 << 20;

/// Reads an MDA header from the start of `reader`.
///
/// The header is three `i32` words (data type code, bytes per entry, number
/// of dimensions) followed by the dimensions. A negative dimension count means
/// the dimensions are stored as `i64`.
pub fn read_header<R: Read>(reader: &mut R) -> Result<MdaHeader> {
    let code = reader.read_i32::<LittleEndian>()?;
    let data_type = MdaDataType::from_code(code)?;

    let bytes_per_entry = reader.read_i32::<LittleEndian>()?;
    if bytes_per_entry as usize != data_type.size() {
        return Err(Error::InvalidHeader(format!(
            "{} bytes per entry does not match data type {:?}",
            bytes_per_entry, data_type
        )));
    }

    let num_dims = reader.read_i32::<LittleEndian>()?;
    let wide_dims = num_dims < 0;
    let num_dims = num_dims.abs();
    if num_dims == 0 || num_dims > MAX_DIMS {
        return Err(Error::InvalidHeader(format!(
            "unsupported number of dimensions: {}",
            num_dims
        )));
    }

    let mut dims = Vec::with_capacity(num_dims as usize);
    for _ in 0..num_dims {
        let dim = if wide_dims {
            reader.read_i64::<LittleEndian>()?
        } else {
            reader.read_i32::<LittleEndian>()? as i64
        };
        if dim < 0 {
            return Err(Error::InvalidHeader(format!("negative dimension {}", dim)));
        }
        dims.push(dim as usize);
    }

    let dim_bytes = if wide_dims { 8 } else { HEADER_WORD_BYTES };
    let header_len = 3 * HEADER_WORD_BYTES + dim_bytes * num_dims as u64;

    let header = MdaHeader {
        data_type,
        bytes_per_entry: bytes_per_entry as usize,
        dims,
        header_len,
    };
    if header.expected_file_len().is_none() {
        return Err(Error::InvalidHeader(format!(
            "dimensions {:?} exceed the addressable file size",
            header.dims
        )));
    }
    Ok(header)
}

/// Lazily reads frames from a `[channels, frames]` MDA signal file.
///
/// MDA data is column-major, so all channels of one frame are contiguous and
/// any range of frames is a single contiguous byte range.
#[derive(Debug)]
pub struct MdaReader {
    path: PathBuf,
    reader: BufReader<File>,
    header: MdaHeader,
    file_len: u64,
}

impl MdaReader {
    /// Opens a signal file and parses its header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::with_capacity(READ_BUFFER_CAPACITY, file);
        let header = read_header(&mut reader)?;

        Ok(MdaReader {
            path,
            reader,
            header,
            file_len,
        })
    }

    pub fn header(&self) -> &MdaHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file holds every element its header declares.
    pub fn is_complete(&self) -> bool {
        self.header
            .expected_file_len()
            .map_or(false, |expected| self.file_len >= expected)
    }

    /// Reads `count` frames starting at `start`.
    ///
    /// Returns an array shaped `[count, channels]` with samples converted to
    /// `f32` without any scaling.
    pub fn read_frames(&mut self, start: usize, count: usize) -> Result<Array2<f32>> {
        let num_channels = self.header.num_channels();
        let num_frames = self.header.num_frames();
        let end = start + count;
        if end > num_frames {
            return Err(Error::FrameRange {
                start,
                end,
                frames: num_frames,
            });
        }

        let frame_bytes = num_channels * self.header.bytes_per_entry;
        let offset = self.header.header_len + (start * frame_bytes) as u64;
        self.reader.seek(SeekFrom::Start(offset))?;

        let mut bytes = vec![0u8; count * frame_bytes];
        self.reader.read_exact(&mut bytes).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::TruncatedData {
                    frame: start,
                    declared: num_frames,
                }
            } else {
                Error::Io(e)
            }
        })?;

        let mut samples = vec![0f32; count * num_channels];
        decode_samples(&bytes, self.header.data_type, &mut samples);

        Array2::from_shape_vec((count, num_channels), samples)
            .map_err(|e| Error::InvalidHeader(e.to_string()))
    }
}

/// Helper function to decode little-endian elements into `f32` samples
fn decode_samples(bytes: &[u8], data_type: MdaDataType, out: &mut [f32]) {
    let size = data_type.size();
    for (value, chunk) in out.iter_mut().zip(bytes.chunks_exact(size)) {
        *value = match data_type {
            MdaDataType::U8 => chunk[0] as f32,
            MdaDataType::F32 => LittleEndian::read_f32(chunk),
            MdaDataType::I16 => LittleEndian::read_i16(chunk) as f32,
            MdaDataType::I32 => LittleEndian::read_i32(chunk) as f32,
            MdaDataType::U16 => LittleEndian::read_u16(chunk) as f32,
            MdaDataType::F64 => LittleEndian::read_f64(chunk) as f32,
            MdaDataType::U32 => LittleEndian::read_u32(chunk) as f32,
        };
    }
}

/// Helper function to read one element as `f64`
fn read_value<R: Read>(reader: &mut R, data_type: MdaDataType) -> io::Result<f64> {
    Ok(match data_type {
        MdaDataType::U8 => reader.read_u8()? as f64,
        MdaDataType::F32 => reader.read_f32::<LittleEndian>()? as f64,
        MdaDataType::I16 => reader.read_i16::<LittleEndian>()? as f64,
        MdaDataType::I32 => reader.read_i32::<LittleEndian>()? as f64,
        MdaDataType::U16 => reader.read_u16::<LittleEndian>()? as f64,
        MdaDataType::F64 => reader.read_f64::<LittleEndian>()?,
        MdaDataType::U32 => reader.read_u32::<LittleEndian>()? as f64,
    })
}

/// Loads a whole MDA file as an `f64` array with the file's dimensions.
///
/// A file shorter than its header declares is rejected before any data is
/// read.
pub fn read_mda<P: AsRef<Path>>(path: P) -> Result<ArrayD<f64>> {
    let file = File::open(path.as_ref())?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::with_capacity(READ_BUFFER_CAPACITY, file);
    let header = read_header(&mut reader)?;

    let expected = header.expected_file_len().unwrap_or(u64::MAX);
    if file_len < expected {
        let frame_bytes = (header.num_channels() * header.bytes_per_entry).max(1) as u64;
        let available = file_len.saturating_sub(header.header_len) / frame_bytes;
        return Err(Error::TruncatedData {
            frame: usize::try_from(available).unwrap_or(usize::MAX),
            declared: header.num_frames(),
        });
    }

    read_mda_body(&mut reader, &header)
}

/// Reads a whole MDA array from any reader.
pub fn read_mda_from<R: Read>(reader: &mut R) -> Result<ArrayD<f64>> {
    let header = read_header(reader)?;
    read_mda_body(reader, &header)
}

/// Helper function to read the elements that follow a parsed header
fn read_mda_body<R: Read>(reader: &mut R, header: &MdaHeader) -> Result<ArrayD<f64>> {
    let num_elements = header.num_elements().ok_or_else(|| {
        Error::InvalidHeader(format!("dimensions {:?} overflow", header.dims))
    })?;

    // The header alone cannot be trusted to size the buffer
    let mut data = Vec::with_capacity(num_elements.min(MAX_PREALLOCATED_ELEMENTS));
    for i in 0..num_elements {
        let value = read_value(reader, header.data_type).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::TruncatedData {
                    frame: i / header.num_channels().max(1),
                    declared: header.num_frames(),
                }
            } else {
                Error::Io(e)
            }
        })?;
        data.push(value);
    }

    ArrayD::from_shape_vec(IxDyn(&header.dims).f(), data)
        .map_err(|e| Error::InvalidHeader(e.to_string()))
}

/// Element types that can be written to an MDA file.
pub trait MdaElement: Copy {
    const DATA_TYPE: MdaDataType;

    fn write_to<W: Write>(self, writer: &mut W) -> io::Result<()>;
}

impl MdaElement for f32 {
    const DATA_TYPE: MdaDataType = MdaDataType::F32;

    fn write_to<W: Write>(self, writer: &mut W) -> io::Result<()> {
        writer.write_f32::<LittleEndian>(self)
    }
}

impl MdaElement for f64 {
    const DATA_TYPE: MdaDataType = MdaDataType::F64;

    fn write_to<W: Write>(self, writer: &mut W) -> io::Result<()> {
        writer.write_f64::<LittleEndian>(self)
    }
}

impl MdaElement for i16 {
    const DATA_TYPE: MdaDataType = MdaDataType::I16;

    fn write_to<W: Write>(self, writer: &mut W) -> io::Result<()> {
        writer.write_i16::<LittleEndian>(self)
    }
}

impl MdaElement for i32 {
    const DATA_TYPE: MdaDataType = MdaDataType::I32;

    fn write_to<W: Write>(self, writer: &mut W) -> io::Result<()> {
        writer.write_i32::<LittleEndian>(self)
    }
}

/// Writes an array to an MDA file, column-major.
pub fn write_mda<P, S, D, T>(path: P, array: &ArrayBase<S, D>) -> Result<()>
where
    P: AsRef<Path>,
    S: Data<Elem = T>,
    D: Dimension,
    T: MdaElement,
{
    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);
    write_mda_to(&mut writer, array)?;
    writer.flush()?;
    Ok(())
}

/// Writes an array in MDA format to any writer.
pub fn write_mda_to<W, S, D, T>(writer: &mut W, array: &ArrayBase<S, D>) -> Result<()>
where
    W: Write,
    S: Data<Elem = T>,
    D: Dimension,
    T: MdaElement,
{
    let shape = array.shape();
    writer.write_i32::<LittleEndian>(T::DATA_TYPE.code())?;
    writer.write_i32::<LittleEndian>(T::DATA_TYPE.size() as i32)?;
    writer.write_i32::<LittleEndian>(shape.len() as i32)?;
    for &dim in shape {
        writer.write_i32::<LittleEndian>(dim as i32)?;
    }

    // Reversing the axes turns logical iteration order into column-major order
    for &value in array.t().iter() {
        value.write_to(writer)?;
    }

    Ok(())
}
