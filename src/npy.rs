//! Minimal NumPy `.npy` (format 1.0) writer for the Phy and waveform folders,
//! with a row reader for the `<f4` waveform files it writes.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::{ArrayBase, ArrayD, Data, Dimension, IxDyn};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::types::{Error, Result};

const NPY_MAGIC: &[u8] = b"\x93NUMPY";
const NPY_VERSION: [u8; 2] = [1, 0];
const HEADER_ALIGNMENT: usize = 64;
const READ_BUFFER_CAPACITY: usize = 65536;

/// Element types with a NumPy dtype descriptor.
pub trait NpyElement: Copy {
    /// Little-endian dtype string, e.g. `<f4`
    const DESCR: &'static str;

    fn write_to<W: Write>(self, writer: &mut W) -> io::Result<()>;
}

impl NpyElement for f32 {
    const DESCR: &'static str = "<f4";

    fn write_to<W: Write>(self, writer: &mut W) -> io::Result<()> {
        writer.write_f32::<LittleEndian>(self)
    }
}

impl NpyElement for f64 {
    const DESCR: &'static str = "<f8";

    fn write_to<W: Write>(self, writer: &mut W) -> io::Result<()> {
        writer.write_f64::<LittleEndian>(self)
    }
}

impl NpyElement for i32 {
    const DESCR: &'static str = "<i4";

    fn write_to<W: Write>(self, writer: &mut W) -> io::Result<()> {
        writer.write_i32::<LittleEndian>(self)
    }
}

impl NpyElement for i64 {
    const DESCR: &'static str = "<i8";

    fn write_to<W: Write>(self, writer: &mut W) -> io::Result<()> {
        writer.write_i64::<LittleEndian>(self)
    }
}

/// Formats a shape as a Python tuple literal.
fn shape_literal(shape: &[usize]) -> String {
    match shape {
        [] => "()".to_string(),
        [n] => format!("({},)", n),
        _ => {
            let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
            format!("({})", dims.join(", "))
        }
    }
}

/// Builds the padded header dictionary, newline included.
fn header_text(descr: &str, shape: &[usize]) -> String {
    let mut text = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        descr,
        shape_literal(shape)
    );

    // magic + version + u16 length + text + '\n' must land on the alignment
    let preamble = NPY_MAGIC.len() + NPY_VERSION.len() + 2;
    let unpadded = preamble + text.len() + 1;
    let padding = (HEADER_ALIGNMENT - unpadded % HEADER_ALIGNMENT) % HEADER_ALIGNMENT;
    text.extend(std::iter::repeat(' ').take(padding));
    text.push('\n');
    text
}

/// Writes the preamble and header for an array of `shape`.
///
/// Returns the offset at which the C-order data starts, so callers can fill
/// the data section out of order.
pub fn write_header<W: Write>(writer: &mut W, descr: &str, shape: &[usize]) -> io::Result<u64> {
    let header = header_text(descr, shape);
    writer.write_all(NPY_MAGIC)?;
    writer.write_all(&NPY_VERSION)?;
    writer.write_u16::<LittleEndian>(header.len() as u16)?;
    writer.write_all(header.as_bytes())?;
    Ok((NPY_MAGIC.len() + NPY_VERSION.len() + 2 + header.len()) as u64)
}

/// Writes an array in `.npy` format (C order) to any writer.
pub fn write_npy_to<W, S, D, T>(writer: &mut W, array: &ArrayBase<S, D>) -> Result<()>
where
    W: Write,
    S: Data<Elem = T>,
    D: Dimension,
    T: NpyElement,
{
    write_header(writer, T::DESCR, array.shape())?;

    for &value in array.iter() {
        value.write_to(writer)?;
    }

    Ok(())
}

/// Writes an array to a `.npy` file.
pub fn write_npy<P, S, D, T>(path: P, array: &ArrayBase<S, D>) -> Result<()>
where
    P: AsRef<Path>,
    S: Data<Elem = T>,
    D: Dimension,
    T: NpyElement,
{
    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);
    write_npy_to(&mut writer, array)?;
    writer.flush()?;
    Ok(())
}

/// Sequential reader over the rows of a `<f4` C-order `.npy` file.
///
/// A row is one index along the first axis.
#[derive(Debug)]
pub struct NpyReader {
    path: PathBuf,
    reader: BufReader<File>,
    shape: Vec<usize>,
    row_len: usize,
    rows_read: usize,
}

impl NpyReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mut reader = BufReader::with_capacity(READ_BUFFER_CAPACITY, file);
        let shape = read_header(&mut reader)
            .map_err(|e| Error::InvalidNpy(format!("{}: {}", path.display(), e)))?;

        let row_len = shape
            .iter()
            .skip(1)
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| Error::InvalidNpy(format!("{}: shape overflows", path.display())))?;

        Ok(NpyReader {
            path,
            reader,
            shape,
            row_len,
            rows_read: 0,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Rows along the first axis; a scalar counts as one row.
    pub fn num_rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    /// Elements per row.
    pub fn row_len(&self) -> usize {
        self.row_len
    }

    /// Reads the next row into `out`, which must hold `row_len()` values.
    ///
    /// Returns `false` once every row has been read.
    pub fn read_row(&mut self, out: &mut [f32]) -> Result<bool> {
        if out.len() != self.row_len {
            return Err(Error::InvalidNpy(format!(
                "row buffer of {} values for rows of {}",
                out.len(),
                self.row_len
            )));
        }
        if self.rows_read >= self.num_rows() {
            return Ok(false);
        }

        self.reader
            .read_f32_into::<LittleEndian>(out)
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => Error::InvalidNpy(format!(
                    "{} ends at row {} of {}",
                    self.path.display(),
                    self.rows_read,
                    self.num_rows()
                )),
                _ => Error::Io(e),
            })?;
        self.rows_read += 1;
        Ok(true)
    }
}

/// Helper function to parse the preamble and header dictionary into a shape
fn read_header<R: Read>(reader: &mut R) -> std::result::Result<Vec<usize>, String> {
    let mut magic = [0u8; 6];
    reader.read_exact(&mut magic).map_err(|e| e.to_string())?;
    if magic != NPY_MAGIC {
        return Err("not an .npy file".to_string());
    }
    let mut version = [0u8; 2];
    reader.read_exact(&mut version).map_err(|e| e.to_string())?;
    if version[0] != NPY_VERSION[0] {
        return Err(format!("unsupported format version {}.{}", version[0], version[1]));
    }

    let header_len = reader
        .read_u16::<LittleEndian>()
        .map_err(|e| e.to_string())? as usize;
    let mut text = vec![0u8; header_len];
    reader.read_exact(&mut text).map_err(|e| e.to_string())?;
    let text = String::from_utf8_lossy(&text);

    let descr = dict_value(&text, "descr")
        .map(|value| value.trim_matches('\''))
        .ok_or("header has no descr")?;
    if descr != <f32 as NpyElement>::DESCR {
        return Err(format!("unsupported dtype {}", descr));
    }
    if dict_value(&text, "fortran_order") != Some("False") {
        return Err("only C-order arrays are supported".to_string());
    }

    let shape = dict_value(&text, "shape").ok_or("header has no shape")?;
    shape
        .trim_start_matches('(')
        .trim_end_matches(')')
        .split(',')
        .map(str::trim)
        .filter(|dim| !dim.is_empty())
        .map(|dim| dim.parse::<usize>().map_err(|e| format!("shape {}: {}", shape, e)))
        .collect()
}

/// Raw text of one key of the header dictionary.
fn dict_value<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    let pattern = format!("'{}':", key);
    let rest = text[text.find(&pattern)? + pattern.len()..].trim_start();
    let end = if rest.starts_with('(') {
        rest.find(')')? + 1
    } else {
        rest.find(|c| c == ',' || c == '}')?
    };
    Some(rest[..end].trim())
}

/// Reads a whole `<f4` `.npy` file.
pub fn read_npy_f32<P: AsRef<Path>>(path: P) -> Result<ArrayD<f32>> {
    let mut reader = NpyReader::open(path)?;
    let shape = reader.shape().to_vec();
    let mut row = vec![0f32; reader.row_len()];
    let mut data = Vec::with_capacity(reader.num_rows() * reader.row_len());
    while reader.read_row(&mut row)? {
        data.extend_from_slice(&row);
    }
    ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|e| Error::InvalidNpy(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{ByteOrder, LittleEndian};
    use ndarray::{arr1, arr2, Array3};

    #[test]
    fn header_is_aligned_and_terminated() {
        let mut bytes = Vec::new();
        write_npy_to(&mut bytes, &arr2(&[[1.0f32, 2.0], [3.0, 4.0]])).unwrap();

        let header_len = LittleEndian::read_u16(&bytes[8..10]) as usize;
        let data_start = 10 + header_len;
        assert_eq!(data_start % HEADER_ALIGNMENT, 0);
        assert_eq!(bytes[data_start - 1], b'\n');
        assert_eq!(bytes.len(), data_start + 4 * 4);

        let header = std::str::from_utf8(&bytes[10..data_start]).unwrap();
        assert!(header.contains("'descr': '<f4'"));
        assert!(header.contains("'shape': (2, 2)"));
    }

    #[test]
    fn one_dimensional_shape_has_trailing_comma() {
        assert_eq!(shape_literal(&[7]), "(7,)");
        assert_eq!(shape_literal(&[]), "()");
        assert_eq!(shape_literal(&[3, 4, 5]), "(3, 4, 5)");
    }

    #[test]
    fn data_follows_logical_order() {
        let mut bytes = Vec::new();
        let array = arr2(&[[1i64, 2], [3, 4]]);
        write_npy_to(&mut bytes, &array.t()).unwrap();

        let data_start = bytes.len() - 4 * 8;
        let second = LittleEndian::read_i64(&bytes[data_start + 8..data_start + 16]);
        assert_eq!(second, 3);
    }

    #[test]
    fn integer_descriptor() {
        let mut bytes = Vec::new();
        write_npy_to(&mut bytes, &arr1(&[1i32, 2, 3])).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("'descr': '<i4'"));
        assert!(text.contains("'shape': (3,)"));
    }

    #[test]
    fn rows_are_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waveforms_3.npy");
        let array = Array3::from_shape_fn((3, 2, 2), |(i, j, k)| (i * 100 + j * 10 + k) as f32);
        write_npy(&path, &array).unwrap();

        let mut reader = NpyReader::open(&path).unwrap();
        assert_eq!(reader.shape(), &[3, 2, 2]);
        assert_eq!(reader.row_len(), 4);

        let mut row = vec![0f32; 4];
        assert!(reader.read_row(&mut row).unwrap());
        assert!(reader.read_row(&mut row).unwrap());
        assert_eq!(row, vec![100.0, 101.0, 110.0, 111.0]);
        assert!(reader.read_row(&mut row).unwrap());
        assert!(!reader.read_row(&mut row).unwrap());

        assert_eq!(read_npy_f32(&path).unwrap(), array.into_dyn());
    }

    #[test]
    fn other_dtypes_are_not_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spike_times.npy");
        write_npy(&path, &arr1(&[1i64, 2])).unwrap();

        assert!(matches!(NpyReader::open(&path), Err(Error::InvalidNpy(_))));
    }

    #[test]
    fn short_data_section_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waveforms_1.npy");
        let mut bytes = Vec::new();
        write_header(&mut bytes, "<f4", &[2, 3]).unwrap();
        bytes.extend_from_slice(&[0u8; 12]);
        std::fs::write(&path, &bytes).unwrap();

        let mut reader = NpyReader::open(&path).unwrap();
        let mut row = vec![0f32; 3];
        assert!(reader.read_row(&mut row).unwrap());
        assert!(matches!(reader.read_row(&mut row), Err(Error::InvalidNpy(_))));
    }
}
