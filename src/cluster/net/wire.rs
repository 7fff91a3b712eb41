//! Fixed-size binary records.
//!
//! Every record has a known length and is written in one piece, little-endian:
//!
//! | record        | bytes | layout                                     |
//! |---------------|-------|--------------------------------------------|
//! | `Discovery`   | 4     | magic `u32`                                |
//! | `SpeedReport` | 4     | speed `i32`                                |
//! | `WireTask`    | 32    | base, step_width `f64`; start, count `u64` |
//! | `PartialSum`  | 8     | sum `f64`                                  |
//!
//! A stream that ends before a whole record arrives is a lost connection.

use std::io;

use arrayref::array_ref;
use byteorder::{ByteOrder, LittleEndian};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::Error;

pub trait Record: Sized {
    const LEN: usize;

    fn encode(&self, buf: &mut [u8]);

    fn decode(buf: &[u8]) -> Self;

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::LEN];
        self.encode(&mut buf);
        buf
    }

    /// `None` unless `buf` is exactly one record long.
    fn from_bytes(buf: &[u8]) -> Option<Self> {
        (buf.len() == Self::LEN).then(|| Self::decode(buf))
    }
}

/// The starter's "looking for work" datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Discovery {
    pub magic: u32,
}

impl Record for Discovery {
    const LEN: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(buf, self.magic);
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            magic: LittleEndian::read_u32(buf),
        }
    }
}

/// A worker's relative compute speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeedReport {
    pub speed: i32,
}

impl Record for SpeedReport {
    const LEN: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_i32(buf, self.speed);
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            speed: LittleEndian::read_i32(buf),
        }
    }
}

/// A worker's share of the integration. No processor ids: the worker splits
/// it again over its own cores.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WireTask {
    pub base: f64,
    pub step_width: f64,
    pub start_step: u64,
    pub step_count: u64,
}

impl WireTask {
    /// Lower bound of this share.
    pub fn lower_bound(&self) -> f64 {
        self.base + self.start_step as f64 * self.step_width
    }

    /// Upper bound of this share.
    pub fn upper_bound(&self) -> f64 {
        let end = self.start_step.saturating_add(self.step_count);
        self.base + end as f64 * self.step_width
    }
}

impl Record for WireTask {
    const LEN: usize = 32;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_f64(&mut buf[0..8], self.base);
        LittleEndian::write_f64(&mut buf[8..16], self.step_width);
        LittleEndian::write_u64(&mut buf[16..24], self.start_step);
        LittleEndian::write_u64(&mut buf[24..32], self.step_count);
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            base: LittleEndian::read_f64(array_ref![buf, 0, 8]),
            step_width: LittleEndian::read_f64(array_ref![buf, 8, 8]),
            start_step: LittleEndian::read_u64(array_ref![buf, 16, 8]),
            step_count: LittleEndian::read_u64(array_ref![buf, 24, 8]),
        }
    }
}

/// A worker's result for its share.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartialSum {
    pub sum: f64,
}

impl Record for PartialSum {
    const LEN: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_f64(buf, self.sum);
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            sum: LittleEndian::read_f64(buf),
        }
    }
}

/// Reads whole records off a stream.
pub struct RecordReader<R>(R);

impl<R: AsyncRead + Unpin> RecordReader<R> {
    pub fn new(stream: R) -> Self {
        Self(stream)
    }

    pub async fn receive<T: Record>(&mut self) -> Result<T, Error> {
        let mut buf = vec![0u8; T::LEN];
        match self.0.read_exact(&mut buf).await {
            Ok(_) => Ok(T::decode(&buf)),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(Error::ConnectionLost)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn into_inner(self) -> R {
        self.0
    }
}

/// Writes whole records to a stream.
pub struct RecordWriter<W>(W);

impl<W: AsyncWrite + Unpin> RecordWriter<W> {
    pub fn new(stream: W) -> Self {
        Self(stream)
    }

    pub async fn send<T: Record>(&mut self, record: &T) -> Result<(), Error> {
        let buf = record.to_bytes();
        self.0.write_all(&buf).await.map_err(|e| match e.kind() {
            io::ErrorKind::WriteZero => Error::ConnectionLost,
            _ => e.into(),
        })?;
        self.0.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.0
    }
}
