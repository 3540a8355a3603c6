//! buffers for use when writing and reading dns packets

use std::collections::BTreeMap;

use derive_more::{Display, Error};

/// Longest label allowed in a domain name
pub const MAX_LABEL_LEN: usize = 63;

/// Longest domain name allowed in its wire form, including the root label
pub const MAX_NAME_LEN: usize = 255;

/// Pointers are 14 bits wide, so only labels written below this offset can be referenced
const MAX_POINTER_OFFSET: usize = 0x3FFF;

#[derive(Debug, Display, Error, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    #[display(fmt = "unexpected end of buffer")]
    EndOfBuffer,
    #[display(fmt = "compression pointer does not point backwards")]
    BadPointer,
    #[display(fmt = "unsupported label type")]
    BadLabel,
    #[display(fmt = "label longer than 63 bytes")]
    LabelTooLong,
    #[display(fmt = "domain name longer than 255 bytes")]
    NameTooLong,
    #[display(fmt = "malformed escape sequence")]
    BadEscape,
}

type Result<T> = std::result::Result<T, BufferError>;

pub trait PacketBuffer {
    fn read(&mut self) -> Result<u8>;
    fn get(&mut self, pos: usize) -> Result<u8>;
    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]>;
    fn write(&mut self, val: u8) -> Result<()>;
    fn set(&mut self, pos: usize, val: u8) -> Result<()>;
    fn pos(&self) -> usize;
    fn seek(&mut self, pos: usize) -> Result<()>;
    fn step(&mut self, steps: usize) -> Result<()>;
    fn find_label(&self, label: &str) -> Option<usize>;
    fn save_label(&mut self, label: &str, pos: usize);

    fn write_u8(&mut self, val: u8) -> Result<()> {
        self.write(val)?;

        Ok(())
    }

    fn set_u16(&mut self, pos: usize, val: u16) -> Result<()> {
        self.set(pos, (val >> 8) as u8)?;
        self.set(pos + 1, (val & 0xFF) as u8)?;

        Ok(())
    }

    fn write_u16(&mut self, val: u16) -> Result<()> {
        self.write((val >> 8) as u8)?;
        self.write((val & 0xFF) as u8)?;

        Ok(())
    }

    fn write_u32(&mut self, val: u32) -> Result<()> {
        self.write(((val >> 24) & 0xFF) as u8)?;
        self.write(((val >> 16) & 0xFF) as u8)?;
        self.write(((val >> 8) & 0xFF) as u8)?;
        self.write((val & 0xFF) as u8)?;

        Ok(())
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        for b in data {
            self.write(*b)?;
        }

        Ok(())
    }

    /// Writes a domain name, replacing the longest suffix already present in
    /// the buffer with a compression pointer
    fn write_qname(&mut self, qname: &str) -> Result<()> {
        self.write_name(qname, true)
    }

    /// Writes a domain name without compression, as required for the
    /// rdata of SRV and NAPTR records
    fn write_qname_plain(&mut self, qname: &str) -> Result<()> {
        self.write_name(qname, false)
    }

    fn write_name(&mut self, qname: &str, compress: bool) -> Result<()> {
        let labels = name_labels(qname)?;
        if labels.is_empty() {
            return self.write_u8(0);
        }

        let wire_len = labels.iter().map(|x| x.len() + 1).sum::<usize>() + 1;
        if wire_len > MAX_NAME_LEN {
            return Err(BufferError::NameTooLong);
        }

        // Suffixes are looked up in their canonical escaped form, so that
        // "a" and "\097" share a pointer
        let escaped = labels
            .iter()
            .map(|label| {
                let mut text = String::new();
                escape_label(label, &mut text);
                text
            })
            .collect::<Vec<String>>();

        for (i, label) in labels.iter().enumerate() {
            if compress {
                let search_lbl = escaped[i..].join(".");
                if let Some(prev_pos) = self.find_label(&search_lbl) {
                    let jump_inst = (prev_pos as u16) | 0xC000;
                    return self.write_u16(jump_inst);
                }

                let pos = self.pos();
                if pos <= MAX_POINTER_OFFSET {
                    self.save_label(&search_lbl, pos);
                }
            }

            self.write_u8(label.len() as u8)?;
            self.write_bytes(label)?;
        }

        self.write_u8(0)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let res = ((self.read()? as u16) << 8) | (self.read()? as u16);

        Ok(res)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let res = ((self.read()? as u32) << 24)
            | ((self.read()? as u32) << 16)
            | ((self.read()? as u32) << 8)
            | (self.read()? as u32);

        Ok(res)
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let pos = self.pos();
        let data = self.get_range(pos, len)?.to_vec();
        self.step(len)?;

        Ok(data)
    }

    fn read_qname(&mut self, outstr: &mut String) -> Result<()> {
        let mut pos = self.pos();
        let mut jumped = false;

        // Every jump has to land strictly below the previous one, which rules
        // out forward, self-referencing and looping pointers.
        let mut limit = pos;
        let mut wire_len = 0;

        let mut delim = "";
        loop {
            let len = self.get(pos)?;

            match len & 0xC0 {
                // A two byte sequence, where the two highest bits of the first
                // byte are set, is an offset relative to the start of the buffer.
                0xC0 => {
                    // The shared buffer position is only moved past the first
                    // pointer, later jumps don't touch it.
                    if !jumped {
                        self.seek(pos + 2)?;
                    }

                    let b2 = self.get(pos + 1)? as usize;
                    let offset = (((len as usize) & 0x3F) << 8) | b2;
                    if offset >= limit {
                        return Err(BufferError::BadPointer);
                    }

                    limit = offset;
                    pos = offset;
                    jumped = true;
                    continue;
                }
                0x00 => {}
                _ => return Err(BufferError::BadLabel),
            }

            pos += 1;
            wire_len += len as usize + 1;
            if wire_len > MAX_NAME_LEN {
                return Err(BufferError::NameTooLong);
            }

            // Names are terminated by an empty label of length 0
            if len == 0 {
                break;
            }

            outstr.push_str(delim);

            let str_buffer = self.get_range(pos, len as usize)?;
            escape_label(str_buffer, outstr);

            delim = ".";

            pos += len as usize;
        }

        if !jumped {
            self.seek(pos)?;
        }

        Ok(())
    }
}

/// Appends a label in presentation form: dots and backslashes are escaped
/// with a backslash, anything outside printable ASCII becomes `\DDD`
pub fn escape_label(label: &[u8], out: &mut String) {
    escape(label, b".\\", false, out)
}

/// Appends a character string in presentation form, for use inside quotes
pub fn escape_text(data: &[u8], out: &mut String) {
    escape(data, b"\"\\", true, out)
}

fn escape(data: &[u8], special: &[u8], allow_space: bool, out: &mut String) {
    for &b in data {
        if special.contains(&b) {
            out.push('\\');
            out.push(b as char);
        } else if (0x21..=0x7E).contains(&b) || (allow_space && b == b' ') {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\{:03}", b));
        }
    }
}

/// Turns presentation form back into raw bytes, the reverse of `escape_label`
/// and `escape_text`
pub fn unescape(text: &str) -> Result<Vec<u8>> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }

        let next = *bytes.get(i + 1).ok_or(BufferError::BadEscape)?;
        if next.is_ascii_digit() {
            let digits = bytes.get(i + 1..i + 4).ok_or(BufferError::BadEscape)?;
            if !digits.iter().all(u8::is_ascii_digit) {
                return Err(BufferError::BadEscape);
            }
            let value = digits.iter().fold(0u16, |acc, d| acc * 10 + (d - b'0') as u16);
            if value > 0xFF {
                return Err(BufferError::BadEscape);
            }
            out.push(value as u8);
            i += 4;
        } else {
            out.push(next);
            i += 2;
        }
    }

    Ok(out)
}

/// Splits a name in presentation form into raw labels
///
/// Only unescaped dots separate labels. A single trailing dot marks the name
/// as absolute and is dropped; "" and "." are the root. Every label is checked
/// against the label length limit, empty labels are rejected.
pub fn name_labels(name: &str) -> Result<Vec<Vec<u8>>> {
    if name.is_empty() || name == "." {
        return Ok(Vec::new());
    }

    let bytes = name.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'.' => {
                parts.push(&name[start..i]);
                start = i + 1;
                i += 1;
            }
            _ => i += 1,
        }
    }
    if start < bytes.len() {
        parts.push(&name[start..]);
    }

    let mut labels = Vec::with_capacity(parts.len());
    for part in parts {
        let label = unescape(part)?;
        if label.is_empty() {
            return Err(BufferError::BadLabel);
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(BufferError::LabelTooLong);
        }
        labels.push(label);
    }

    Ok(labels)
}

#[derive(Default)]
pub struct VectorPacketBuffer {
    pub buffer: Vec<u8>,
    pub pos: usize,
    pub label_lookup: BTreeMap<String, usize>,
}

impl VectorPacketBuffer {
    pub fn new() -> VectorPacketBuffer {
        VectorPacketBuffer {
            buffer: Vec::new(),
            pos: 0,
            label_lookup: BTreeMap::new(),
        }
    }

    /// Wraps received bytes for reading
    pub fn from_bytes(data: &[u8]) -> VectorPacketBuffer {
        VectorPacketBuffer {
            buffer: data.to_vec(),
            pos: 0,
            label_lookup: BTreeMap::new(),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }
}

impl PacketBuffer for VectorPacketBuffer {
    fn find_label(&self, label: &str) -> Option<usize> {
        self.label_lookup.get(label).cloned()
    }

    fn save_label(&mut self, label: &str, pos: usize) {
        self.label_lookup.insert(label.to_string(), pos);
    }

    fn read(&mut self) -> Result<u8> {
        let res = *self.buffer.get(self.pos).ok_or(BufferError::EndOfBuffer)?;
        self.pos += 1;

        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        self.buffer.get(pos).cloned().ok_or(BufferError::EndOfBuffer)
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        self.buffer.get(start..start + len).ok_or(BufferError::EndOfBuffer)
    }

    fn write(&mut self, val: u8) -> Result<()> {
        if self.pos < self.buffer.len() {
            self.buffer[self.pos] = val;
        } else {
            self.buffer.push(val);
        }
        self.pos += 1;

        Ok(())
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()> {
        let slot = self.buffer.get_mut(pos).ok_or(BufferError::EndOfBuffer)?;
        *slot = val;

        Ok(())
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        self.pos = pos;

        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        if self.pos + steps > self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        self.pos += steps;

        Ok(())
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_qname() {
        let mut buffer = VectorPacketBuffer::new();

        let instr1 = "a.google.com".to_string();
        let instr2 = "b.google.com".to_string();

        // First write the standard string
        buffer.write_qname(&instr1).unwrap();

        // Then we set up a slight variation with relies on a jump back to the data of
        // the first name
        let crafted_data = [0x01, b'b', 0xC0, 0x02];
        for b in &crafted_data {
            buffer.write_u8(*b).unwrap();
        }

        // Reset the buffer position for reading
        buffer.pos = 0;

        let mut outstr1 = String::new();
        buffer.read_qname(&mut outstr1).unwrap();
        assert_eq!(instr1, outstr1);

        let mut outstr2 = String::new();
        buffer.read_qname(&mut outstr2).unwrap();
        assert_eq!(instr2, outstr2);

        // Make sure we're now at the end of the buffer
        assert_eq!(buffer.pos, buffer.buffer.len());
    }

    #[test]
    fn test_write_qname() {
        let mut buffer = VectorPacketBuffer::new();

        buffer.write_qname("ns1.google.com").unwrap();
        buffer.write_qname("ns2.google.com").unwrap();

        // 16 bytes for the first name, then "ns2" and a pointer to "google.com"
        assert_eq!(22, buffer.pos());

        buffer.seek(0).unwrap();

        let mut str1 = String::new();
        buffer.read_qname(&mut str1).unwrap();
        assert_eq!("ns1.google.com", str1);

        let mut str2 = String::new();
        buffer.read_qname(&mut str2).unwrap();
        assert_eq!("ns2.google.com", str2);
    }

    #[test]
    fn test_plain_qname_is_not_compressed() {
        let mut buffer = VectorPacketBuffer::new();

        buffer.write_qname("mail.example.org").unwrap();
        buffer.write_qname_plain("mail.example.org").unwrap();

        assert_eq!(36, buffer.pos());
        assert!(!buffer.as_slice().iter().any(|b| b & 0xC0 == 0xC0));
    }

    #[test]
    fn test_root_name() {
        let mut buffer = VectorPacketBuffer::new();
        buffer.write_qname("").unwrap();
        buffer.write_qname(".").unwrap();
        assert_eq!(vec![0, 0], buffer.buffer);

        buffer.seek(0).unwrap();
        let mut name = String::new();
        buffer.read_qname(&mut name).unwrap();
        assert_eq!("", name);
        assert_eq!(1, buffer.pos());
    }

    #[test]
    fn test_self_pointer_is_rejected() {
        let mut buffer = VectorPacketBuffer::from_bytes(&[0x01, b'a', 0xC0, 0x02]);
        buffer.seek(2).unwrap();

        let mut name = String::new();
        assert_eq!(Err(BufferError::BadPointer), buffer.read_qname(&mut name));
    }

    #[test]
    fn test_forward_pointer_is_rejected() {
        let mut buffer = VectorPacketBuffer::from_bytes(&[0xC0, 0x02, 0x01, b'a', 0x00]);

        let mut name = String::new();
        assert_eq!(Err(BufferError::BadPointer), buffer.read_qname(&mut name));
    }

    #[test]
    fn test_pointer_loop_is_rejected() {
        // Offset 0 points to 2, which points back to 0
        let mut buffer = VectorPacketBuffer::from_bytes(&[0xC0, 0x02, 0xC0, 0x00, 0xC0, 0x02]);
        buffer.seek(4).unwrap();

        let mut name = String::new();
        assert_eq!(Err(BufferError::BadPointer), buffer.read_qname(&mut name));
    }

    #[test]
    fn test_truncated_name() {
        let mut buffer = VectorPacketBuffer::from_bytes(&[0x05, b'a', b'b']);

        let mut name = String::new();
        assert_eq!(Err(BufferError::EndOfBuffer), buffer.read_qname(&mut name));
    }

    #[test]
    fn test_reserved_label_type() {
        let mut buffer = VectorPacketBuffer::from_bytes(&[0x41, b'a', 0x00]);

        let mut name = String::new();
        assert_eq!(Err(BufferError::BadLabel), buffer.read_qname(&mut name));
    }

    #[test]
    fn test_name_length_limits() {
        let mut buffer = VectorPacketBuffer::new();
        let long_label = "a".repeat(64);
        assert_eq!(Err(BufferError::LabelTooLong), buffer.write_qname(&long_label));

        let label = "a".repeat(63);
        let long_name = vec![label.as_str(); 4].join(".");
        assert_eq!(Err(BufferError::NameTooLong), buffer.write_qname(&long_name));

        // 128 one-byte labels need 257 bytes on the wire
        let mut data = Vec::new();
        for _ in 0..128 {
            data.push(1);
            data.push(b'x');
        }
        data.push(0);
        let mut buffer = VectorPacketBuffer::from_bytes(&data);
        let mut name = String::new();
        assert_eq!(Err(BufferError::NameTooLong), buffer.read_qname(&mut name));
    }

    #[test]
    fn test_label_with_dot() {
        // A single label "a.b" followed by "org"
        let data = [3, b'a', b'.', b'b', 3, b'o', b'r', b'g', 0];
        let mut buffer = VectorPacketBuffer::from_bytes(&data);

        let mut name = String::new();
        buffer.read_qname(&mut name).unwrap();
        assert_eq!("a\\.b.org", name);

        let mut out = VectorPacketBuffer::new();
        out.write_qname(&name).unwrap();
        assert_eq!(data.to_vec(), out.buffer);
    }

    #[test]
    fn test_binary_label() {
        let data = [4, 0x00, b' ', 0xFF, b'\\', 3, b'c', b'o', b'm', 0];
        let mut buffer = VectorPacketBuffer::from_bytes(&data);

        let mut name = String::new();
        buffer.read_qname(&mut name).unwrap();
        assert_eq!("\\000\\032\\255\\\\.com", name);

        let mut out = VectorPacketBuffer::new();
        out.write_qname(&name).unwrap();
        assert_eq!(data.to_vec(), out.buffer);
    }

    #[test]
    fn test_escaped_names_share_pointers() {
        let mut buffer = VectorPacketBuffer::new();
        buffer.write_qname("www.example.org").unwrap();
        buffer.write_qname("mail.\\101xample.org").unwrap();

        // "mail" plus a pointer to "example.org"
        assert_eq!(17 + 7, buffer.pos());
    }

    #[test]
    fn test_unescape() {
        assert_eq!(b"a.b".to_vec(), unescape("a\\.b").unwrap());
        assert_eq!(vec![0, 255, b'x'], unescape("\\000\\255x").unwrap());
        assert_eq!(Err(BufferError::BadEscape), unescape("abc\\"));
        assert_eq!(Err(BufferError::BadEscape), unescape("\\25"));
        assert_eq!(Err(BufferError::BadEscape), unescape("\\256"));

        let mut text = String::new();
        escape_text(&[b'h', b'i', b' ', b'"', 0xFE], &mut text);
        assert_eq!("hi \\\"\\254", text);
        assert_eq!(vec![b'h', b'i', b' ', b'"', 0xFE], unescape(&text).unwrap());
    }

    #[test]
    fn test_name_labels() {
        assert!(name_labels("").unwrap().is_empty());
        assert!(name_labels(".").unwrap().is_empty());
        assert_eq!(vec![b"a.b".to_vec(), b"org".to_vec()], name_labels("a\\.b.org.").unwrap());
        assert_eq!(vec![b"org.".to_vec()], name_labels("org\\.").unwrap());
        assert_eq!(Err(BufferError::BadLabel), name_labels("a..b"));
        assert_eq!(Err(BufferError::BadLabel), name_labels(".a"));
    }
}
