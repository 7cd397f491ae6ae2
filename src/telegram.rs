// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use log::trace;
use std::{fmt, io, time::Duration};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Marker byte repeated four times at the start of every telegram.
pub const STX: u8 = 0x02;

/// Length of the telegram header (marker + length field) in bytes/octets.
pub const HEADER_LEN: usize = 8;

/// Default TCP port for the binary dialect.
pub const DEFAULT_PORT: u16 = 2112;

/// Largest length field accepted from a telegram header.
pub const MAX_TELEGRAM_LEN: usize = 1 << 20;

/// CoLa-B protocol error types.
#[derive(Debug)]
pub enum Error {
    /// I/O error outside of a request/acknowledgement exchange
    Io(io::Error),
    /// Trailing checksum byte does not match the XOR of the telegram body
    ChecksumMismatch { expected: u8, actual: u8 },
    /// Command string could not be split into prefix, name and payload
    MalformedCommand(String),
    /// Header did not start with four marker bytes
    CorruptHeader([u8; 4]),
    /// Stream closed before the announced telegram length arrived
    IncompleteTelegram { received: usize, expected: usize },
    /// Header announced a telegram longer than `MAX_TELEGRAM_LEN`
    TelegramTooLong(usize),
    /// Device answered, but not to the request that was sent
    UnexpectedAcknowledgement {
        expected: (String, String),
        actual: (String, String),
    },
    /// No acknowledgement before the timeout, the device most likely does not
    /// speak the binary dialect on this port
    DialectNotAcknowledged { command: String, timeout: Duration },
    /// Socket failure during a request/acknowledgement exchange
    Transport(io::Error),
    /// Peer closed the connection while an acknowledgement was pending
    Disconnected,
    /// No connection is open
    NoSocket,
    /// Payload ended before the named field could be read
    UnexpectedEndOfSlice(usize),
    /// Device refused the access level change
    AccessDenied(u8),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) | Error::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {}", err),
            Error::ChecksumMismatch { expected, actual } => write!(
                f,
                "checksum mismatch: expected 0x{:02X} but got 0x{:02X}",
                expected, actual
            ),
            Error::MalformedCommand(err) => write!(f, "malformed command: {}", err),
            Error::CorruptHeader(header) => write!(f, "corrupt header: {:02X?}", header),
            Error::IncompleteTelegram { received, expected } => {
                write!(f, "incomplete telegram [{}/{}]", received, expected)
            }
            Error::TelegramTooLong(len) => write!(
                f,
                "telegram length {} exceeds {} bytes",
                len, MAX_TELEGRAM_LEN
            ),
            Error::UnexpectedAcknowledgement { expected, actual } => write!(
                f,
                "unexpected acknowledgement: expected {} {} but got {} {}",
                expected.0, expected.1, actual.0, actual.1
            ),
            Error::DialectNotAcknowledged { command, timeout } => write!(
                f,
                "{} not acknowledged within {:?}, device may not support CoLa-B on this port",
                command, timeout
            ),
            Error::Transport(err) => write!(f, "transport error: {}", err),
            Error::Disconnected => write!(f, "connection closed by device"),
            Error::NoSocket => write!(f, "no socket"),
            Error::UnexpectedEndOfSlice(offset) => {
                write!(f, "unexpected end of slice: {}", offset)
            }
            Error::AccessDenied(level) => write!(f, "access level {} denied", level),
        }
    }
}

/// The four command classes of the protocol.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommandKind {
    /// Read a variable
    Read,
    /// Write a variable
    Write,
    /// Invoke a method
    Method,
    /// Subscribe to or unsubscribe from an event
    Event,
}

impl CommandKind {
    /// Returns the prefix used for requests of this kind.
    pub fn request(&self) -> &'static str {
        match self {
            CommandKind::Read => "sRN",
            CommandKind::Write => "sWN",
            CommandKind::Method => "sMN",
            CommandKind::Event => "sEN",
        }
    }

    /// Returns the prefix the device uses to acknowledge requests of this kind.
    pub fn acknowledgement(&self) -> &'static str {
        match self {
            CommandKind::Read => "sRA",
            CommandKind::Write => "sWA",
            CommandKind::Method => "sAN",
            CommandKind::Event => "sEA",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CommandKind::Read => write!(f, "read"),
            CommandKind::Write => write!(f, "write"),
            CommandKind::Method => write!(f, "method"),
            CommandKind::Event => write!(f, "event"),
        }
    }
}

/// XOR-fold of all bytes in the slice.
#[inline]
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}

/// Big-endian argument builder for write and method telegrams.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Arguments {
    data: Vec<u8>,
}

impl Arguments {
    /// Creates an empty argument list.
    pub fn new() -> Arguments {
        Arguments::default()
    }

    /// Appends a big-endian `u8`.
    pub fn u8(mut self, value: u8) -> Arguments {
        self.data.push(value);
        self
    }

    /// Appends a big-endian `u16`.
    pub fn u16(mut self, value: u16) -> Arguments {
        self.data.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Appends a big-endian `u32`.
    pub fn u32(mut self, value: u32) -> Arguments {
        self.data.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Appends a big-endian `i32`.
    pub fn i32(mut self, value: i32) -> Arguments {
        self.data.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Appends raw bytes.
    pub fn bytes(mut self, value: &[u8]) -> Arguments {
        self.data.extend_from_slice(value);
        self
    }

    /// Appends a string prefixed with its 16-bit length.
    pub fn string(self, value: &str) -> Arguments {
        self.u16(value.len() as u16).bytes(value.as_bytes())
    }

    /// Encoded arguments.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for Arguments {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// Telegram encoder which reuses a single scratch buffer between calls.
#[derive(Debug, Default)]
pub struct TelegramWriter {
    buf: Vec<u8>,
}

impl TelegramWriter {
    /// Creates a writer with an empty scratch buffer.
    pub fn new() -> TelegramWriter {
        TelegramWriter::default()
    }

    /// Encodes a request telegram for the given command kind.
    pub fn encode(&mut self, kind: CommandKind, name: &str, args: &[u8]) -> &[u8] {
        self.encode_prefix(kind.request(), name, args)
    }

    /// Encodes a telegram with an explicit prefix, allowing acknowledgements
    /// to be written as well as requests.
    pub fn encode_prefix(&mut self, prefix: &str, name: &str, args: &[u8]) -> &[u8] {
        self.buf.clear();
        self.buf.extend_from_slice(&[STX, STX, STX, STX, 0, 0, 0, 0]);
        self.buf.extend_from_slice(prefix.as_bytes());
        self.buf.push(b' ');
        self.buf.extend_from_slice(name.as_bytes());
        if !args.is_empty() {
            self.buf.push(b' ');
            self.buf.extend_from_slice(args);
        }

        let len = (self.buf.len() - HEADER_LEN) as u32;
        self.buf[4..HEADER_LEN].copy_from_slice(&len.to_be_bytes());
        let crc = checksum(&self.buf[HEADER_LEN..]);
        self.buf.push(crc);

        trace!("encode: {:02X?}", self.buf);
        &self.buf
    }
}

/// A decoded telegram.  Holds the bytes following the header, including the
/// trailing checksum, and the offsets of the command fields within them.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Telegram {
    data: Vec<u8>,
    prefix_end: usize,
    name_end: usize,
}

impl Telegram {
    /// Decodes the bytes following the header.  The last byte must be the
    /// checksum of all prior bytes.
    pub fn decode(data: Vec<u8>) -> Result<Telegram, Error> {
        let (actual, body) = match data.split_last() {
            Some((crc, body)) => (*crc, body),
            None => return Err(Error::UnexpectedEndOfSlice(0)),
        };

        let expected = checksum(body);
        if expected != actual {
            return Err(Error::ChecksumMismatch { expected, actual });
        }

        let prefix_end = match body.iter().position(|b| *b == b' ') {
            Some(pos) => pos,
            None => {
                return Err(Error::MalformedCommand(format!(
                    "no space in command {:02X?}",
                    body
                )))
            }
        };

        let name_end = body[prefix_end + 1..]
            .iter()
            .position(|b| *b == b' ')
            .map(|pos| prefix_end + 1 + pos)
            .unwrap_or(body.len());

        for field in [&body[..prefix_end], &body[prefix_end + 1..name_end]] {
            if field.is_empty() || !field.is_ascii() {
                return Err(Error::MalformedCommand(format!(
                    "invalid command field {:02X?}",
                    field
                )));
            }
        }

        Ok(Telegram {
            data,
            prefix_end,
            name_end,
        })
    }

    /// Returns the command prefix, such as `sRA`.
    #[inline]
    pub fn prefix(&self) -> &str {
        // Validated as ASCII by decode.
        std::str::from_utf8(&self.data[..self.prefix_end]).unwrap_or_default()
    }

    /// Returns the command name, such as `LMDscandata`.
    #[inline]
    pub fn name(&self) -> &str {
        std::str::from_utf8(&self.data[self.prefix_end + 1..self.name_end]).unwrap_or_default()
    }

    /// Returns the bytes following the command name and its separating space,
    /// excluding the checksum.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        let end = self.data.len() - 1;
        if self.name_end >= end {
            &[]
        } else {
            &self.data[self.name_end + 1..end]
        }
    }

    /// Returns the trailing checksum byte.
    #[inline]
    pub fn checksum(&self) -> u8 {
        self.data[self.data.len() - 1]
    }

    /// Returns the telegram bytes following the header.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Display for Telegram {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} [{} bytes]",
            self.prefix(),
            self.name(),
            self.payload().len()
        )
    }
}

/// Reads into `buf` until it is full, returning how many bytes arrived before
/// the stream closed.
async fn fill<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut received = 0;
    while received < buf.len() {
        match reader.read(&mut buf[received..]).await? {
            0 => break,
            n => received += n,
        }
    }
    Ok(received)
}

/// Reads one complete telegram from the stream.  Returns `Ok(None)` when the
/// stream is closed cleanly before a new telegram begins.
pub async fn read_telegram<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Telegram>, Error> {
    let mut header = [0u8; HEADER_LEN];

    match fill(reader, &mut header).await? {
        0 => return Ok(None),
        HEADER_LEN => (),
        received => {
            return Err(Error::IncompleteTelegram {
                received,
                expected: HEADER_LEN,
            })
        }
    }

    let marker = [header[0], header[1], header[2], header[3]];
    if marker != [STX; 4] {
        return Err(Error::CorruptHeader(marker));
    }

    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_TELEGRAM_LEN {
        return Err(Error::TelegramTooLong(len));
    }

    // The checksum trails the length accounted for in the header.
    let expected = len + 1;
    let mut buf = vec![0u8; expected];

    let received = fill(reader, &mut buf).await?;
    if received != expected {
        return Err(Error::IncompleteTelegram { received, expected });
    }

    trace!("read: {:02X?} {:02X?}", header, buf);
    Telegram::decode(buf).map(Some)
}
