use std::io::{Read, Result, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

/// Reads one length-prefixed DNS message from a stream
///
/// A stream that ends before the whole message arrived yields an
/// `UnexpectedEof` error.
pub fn read_packet<R: Read>(stream: &mut R) -> Result<Vec<u8>> {
    let len = stream.read_u16::<BigEndian>()?;
    let mut data = vec![0; len as usize];
    stream.read_exact(&mut data)?;

    Ok(data)
}

/// Writes `data` preceded by its length as a 16 bit big endian number
pub fn write_packet<W: Write>(stream: &mut W, data: &[u8]) -> Result<()> {
    stream.write_u16::<BigEndian>(data.len() as u16)?;
    stream.write_all(data)?;
    stream.flush()
}
