use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Upper bound for any var-int prefixed blob; anything bigger is treated as a garbled prefix.
pub const MAX_BLOB_LENGTH: usize = 256 * 1024 * 1024;

/// Strings are prefixed with an unsigned 16-bit byte count.
pub const MAX_UTF_LENGTH: usize = u16::MAX as usize;

fn invalid_data<T: Into<Box<dyn std::error::Error + Send + Sync>>>(error: T) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, error)
}

pub struct DataOutput<W: Write> {
    fp: W,
}

impl<W: Write> DataOutput<W> {
    pub fn new(fp: W) -> Self {
        DataOutput { fp }
    }

    pub fn inner(&self) -> &W {
        &self.fp
    }

    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.fp
    }

    pub fn into_inner(self) -> W {
        self.fp
    }

    pub fn write_u8(&mut self, value: u8) -> io::Result<()> {
        self.fp.write_u8(value)
    }

    pub fn write_bool(&mut self, value: bool) -> io::Result<()> {
        self.fp.write_u8(value as u8)
    }

    pub fn write_u16(&mut self, value: u16) -> io::Result<()> {
        self.fp.write_u16::<BigEndian>(value)
    }

    pub fn write_i64(&mut self, value: i64) -> io::Result<()> {
        self.fp.write_i64::<BigEndian>(value)
    }

    pub fn write_utf(&mut self, value: &str) -> io::Result<()> {
        let bytes = value.as_bytes();
        if bytes.len() > MAX_UTF_LENGTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("string of {} bytes is too long", bytes.len()),
            ));
        }

        self.write_u16(bytes.len() as u16)?;
        self.fp.write_all(bytes)
    }

    /// Seven bits per byte, lowest group first; the high bit marks a continuation.
    pub fn write_var_int(&mut self, mut value: u32) -> io::Result<()> {
        while value & !0x7F != 0 {
            self.fp.write_u8(0x80 | (value & 0x7F) as u8)?;
            value >>= 7;
        }

        self.fp.write_u8(value as u8)
    }

    pub fn write_bool_array(&mut self, values: &[bool]) -> io::Result<()> {
        self.write_var_int(values.len() as u32)?;

        let mut buffer = 0_u8;
        let mut buffer_size = 0;
        for &value in values {
            if value {
                buffer |= 1 << buffer_size;
            }

            buffer_size += 1;
            if buffer_size == 8 {
                self.fp.write_u8(buffer)?;
                buffer = 0;
                buffer_size = 0;
            }
        }

        if buffer_size > 0 {
            self.fp.write_u8(buffer)?;
        }

        Ok(())
    }

    pub fn write_blob(&mut self, bytes: &[u8]) -> io::Result<()> {
        if bytes.len() > MAX_BLOB_LENGTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("blob of {} bytes is too long", bytes.len()),
            ));
        }

        self.write_var_int(bytes.len() as u32)?;
        self.fp.write_all(bytes)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.fp.flush()
    }
}

pub struct DataInput<R: Read> {
    fp: R,
}

impl<R: Read> DataInput<R> {
    pub fn new(fp: R) -> Self {
        DataInput { fp }
    }

    pub fn inner(&self) -> &R {
        &self.fp
    }

    pub fn into_inner(self) -> R {
        self.fp
    }

    /// Reads the next record tag; `None` means the stream ended cleanly between records.
    pub fn read_tag(&mut self) -> io::Result<Option<u8>> {
        let mut tag = [0];
        loop {
            match self.fp.read(&mut tag) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(tag[0])),
                Err(ref error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error),
            }
        }
    }

    pub fn read_u8(&mut self) -> io::Result<u8> {
        self.fp.read_u8()
    }

    pub fn read_bool(&mut self) -> io::Result<bool> {
        Ok(self.fp.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> io::Result<u16> {
        self.fp.read_u16::<BigEndian>()
    }

    pub fn read_i64(&mut self) -> io::Result<i64> {
        self.fp.read_i64::<BigEndian>()
    }

    /// Reads exactly `length` bytes.
    ///
    /// A transport may hand out the payload in arbitrarily small pieces, so this keeps
    /// accumulating at the current offset until the whole run has arrived.
    pub fn read_fully(&mut self, length: usize) -> io::Result<Vec<u8>> {
        let mut buffer = vec![0; length];
        let mut offset = 0;
        while offset < length {
            match self.fp.read(&mut buffer[offset..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("stream ended after {} of {} bytes", offset, length),
                    ));
                }
                Ok(count) => offset += count,
                Err(ref error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error),
            }
        }

        Ok(buffer)
    }

    pub fn read_utf(&mut self) -> io::Result<String> {
        let length = self.read_u16()? as usize;
        let bytes = self.read_fully(length)?;
        String::from_utf8(bytes).map_err(invalid_data)
    }

    pub fn read_var_int(&mut self) -> io::Result<u32> {
        let mut value = 0_u32;
        let mut shift = 0;
        loop {
            let byte = self.fp.read_u8()?;
            if shift > 28 {
                return Err(invalid_data("var-int is too long"));
            }

            value |= ((byte & 0x7F) as u32) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }

            shift += 7;
        }
    }

    fn read_length(&mut self) -> io::Result<usize> {
        let length = self.read_var_int()? as usize;
        if length > MAX_BLOB_LENGTH {
            return Err(invalid_data(format!(
                "declared length of {} bytes exceeds the limit",
                length
            )));
        }

        Ok(length)
    }

    pub fn read_bool_array(&mut self) -> io::Result<Vec<bool>> {
        let length = self.read_length()?;
        let packed = self.read_fully((length + 7) / 8)?;
        let values = (0..length)
            .map(|index| packed[index / 8] & (1 << (index % 8)) != 0)
            .collect();

        Ok(values)
    }

    pub fn read_blob(&mut self) -> io::Result<Vec<u8>> {
        let length = self.read_length()?;
        self.read_fully(length)
    }
}
