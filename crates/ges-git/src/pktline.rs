//! Git pkt-line framing, write side only.
//!
//! Each line is prefixed with a 4-character hex length that counts the
//! prefix itself, or is the flush packet "0000". The gateway writes the
//! service announcement itself; everything else on the wire belongs to the
//! backend and passes through untouched.

use crate::{GitError, Result};
use std::io::Write;

/// Largest payload a single pkt-line may carry (65520 minus the prefix).
pub const MAX_PKT_DATA_LEN: usize = 65516;

/// A pkt-line packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// Data line with content.
    Data(Vec<u8>),
    /// Flush packet (0000).
    Flush,
}

impl PktLine {
    /// Encodes the packet to bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::Data(data) => {
                if data.len() > MAX_PKT_DATA_LEN {
                    return Err(GitError::InvalidPktLine(format!(
                        "payload of {} bytes exceeds {}",
                        data.len(),
                        MAX_PKT_DATA_LEN
                    )));
                }
                let mut framed = format!("{:04x}", data.len() + 4).into_bytes();
                framed.extend_from_slice(data);
                Ok(framed)
            }
            Self::Flush => Ok(b"0000".to_vec()),
        }
    }
}

/// Writes pkt-lines to any [`Write`] sink.
pub struct PktLineWriter<W> {
    writer: W,
}

impl<W: Write> PktLineWriter<W> {
    /// Wraps `writer`.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes a packet.
    pub fn write(&mut self, pkt: &PktLine) -> Result<()> {
        self.writer.write_all(&pkt.encode()?)?;
        Ok(())
    }

    /// Writes a text line, adding the trailing newline if missing.
    pub fn write_line(&mut self, line: &str) -> Result<()> {
        let mut data = line.as_bytes().to_vec();
        if !line.ends_with('\n') {
            data.push(b'\n');
        }
        self.write(&PktLine::Data(data))
    }

    /// Writes a flush packet.
    pub fn flush_pkt(&mut self) -> Result<()> {
        self.write(&PktLine::Flush)
    }

    /// Returns the sink.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_data_and_flush() {
        assert_eq!(
            PktLine::Data(b"hello\n".to_vec()).encode().unwrap(),
            b"000ahello\n"
        );
        assert_eq!(PktLine::Data(Vec::new()).encode().unwrap(), b"0004");
        assert_eq!(PktLine::Flush.encode().unwrap(), b"0000");
    }

    #[test]
    fn rejects_oversized_payload() {
        let pkt = PktLine::Data(vec![b'x'; MAX_PKT_DATA_LEN + 1]);
        assert!(matches!(pkt.encode(), Err(GitError::InvalidPktLine(_))));

        let max = PktLine::Data(vec![b'x'; MAX_PKT_DATA_LEN]).encode().unwrap();
        assert_eq!(&max[..4], b"fff0");
    }

    #[test]
    fn write_line_terminates_lines() {
        let mut writer = PktLineWriter::new(Vec::new());
        writer.write_line("hello").unwrap();
        writer.write_line("world\n").unwrap();
        writer.flush_pkt().unwrap();
        assert_eq!(writer.into_inner(), b"000ahello\n000aworld\n0000");
    }

    #[test]
    fn write_errors_surface() {
        struct Full;
        impl Write for Full {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::ErrorKind::WriteZero.into())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let mut writer = PktLineWriter::new(Full);
        assert!(matches!(writer.flush_pkt(), Err(GitError::Io(_))));
    }
}
