//! filter: streaming byte transforms and the wrappers that stack them
//! onto sinks and sources.
//!
//! A Filter moves bytes from a caller-supplied input slice to a
//! caller-supplied output slice and reports (consumed, produced). It may
//! consume less than offered; the caller resubmits the rest. `finish` drains
//! tail state into the output and is called until it reports 0.
//!
//! Wrappers:
//! - WriteFilter<W>: PioWriteFlush -> PioWriteFlush (write path, strict tail);
//! - ReadFilter<R>:  PioRead -> PioRead (read path);
//! - copy_with_filters(dest, src, filters) for one-shot streaming.
//!
//! Each wrapper owns one bounded buffer; nesting wrappers builds a chain.

pub mod gz;
pub mod zero_tail;
pub mod zstd;

use log::debug;

use crate::consts::DEFAULT_BUF_SIZE;
use crate::error::{PioError, PioResult};
use crate::pio::{write_all, PioRead, PioWriteFlush};

pub use gz::{GzCompress, GzDecompress};
pub use zero_tail::CutZeroTail;
pub use self::zstd::{ZstdCompress, ZstdDecompress};

/// Result of one transform step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Transformed {
    pub consumed: usize,
    pub produced: usize,
}

pub trait Filter: Send {
    fn transform(&mut self, input: &[u8], output: &mut [u8]) -> PioResult<Transformed>;

    /// Flush tail state into output; returns bytes produced, 0 when done.
    fn finish(&mut self, output: &mut [u8]) -> PioResult<usize>;

    /// Write-side wrappers call this: a truncated input stream must fail.
    fn forbid_truncated_tail(&mut self) {}
}

impl<F: Filter + ?Sized> Filter for Box<F> {
    fn transform(&mut self, input: &[u8], output: &mut [u8]) -> PioResult<Transformed> {
        (**self).transform(input, output)
    }

    fn finish(&mut self, output: &mut [u8]) -> PioResult<usize> {
        (**self).finish(output)
    }

    fn forbid_truncated_tail(&mut self) {
        (**self).forbid_truncated_tail()
    }
}

/// Compression selector used by the CLI and the config layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressAlg {
    None,
    Gzip,
    Zstd,
}

impl std::str::FromStr for CompressAlg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(CompressAlg::None),
            "gzip" | "gz" | "zlib" => Ok(CompressAlg::Gzip),
            "zstd" => Ok(CompressAlg::Zstd),
            other => Err(format!("unknown compression algorithm '{}'", other)),
        }
    }
}

impl CompressAlg {
    pub fn compressor(self, level: u32) -> PioResult<Option<Box<dyn Filter>>> {
        Ok(match self {
            CompressAlg::None => None,
            CompressAlg::Gzip => Some(Box::new(GzCompress::new(level))),
            CompressAlg::Zstd => Some(Box::new(ZstdCompress::new(level as i32)?)),
        })
    }

    pub fn decompressor(self, ignore_truncate: bool) -> PioResult<Option<Box<dyn Filter>>> {
        Ok(match self {
            CompressAlg::None => None,
            CompressAlg::Gzip => Some(Box::new(GzDecompress::new(ignore_truncate))),
            CompressAlg::Zstd => Some(Box::new(ZstdDecompress::new(ignore_truncate)?)),
        })
    }
}

// ---------------- write side ----------------

pub struct WriteFilter<W: PioWriteFlush> {
    inner: W,
    filter: Box<dyn Filter>,
    buf: Vec<u8>,
    finished: bool,
}

impl<W: PioWriteFlush> WriteFilter<W> {
    pub fn new(inner: W, filter: Box<dyn Filter>) -> Self {
        Self::with_capacity(inner, filter, DEFAULT_BUF_SIZE)
    }

    pub fn with_capacity(inner: W, mut filter: Box<dyn Filter>, buf_size: usize) -> Self {
        filter.forbid_truncated_tail();
        Self {
            inner,
            filter,
            buf: vec![0u8; buf_size.max(64)],
            finished: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: PioWriteFlush> PioWriteFlush for WriteFilter<W> {
    fn pio_write(&mut self, data: &[u8]) -> PioResult<usize> {
        if self.finished {
            return Err(PioError::Filter("write after finish".into()));
        }
        let mut rest = data;
        while !rest.is_empty() {
            let t = self.filter.transform(rest, &mut self.buf)?;
            if t.produced > 0 {
                write_all(&mut self.inner, &self.buf[..t.produced])?;
            }
            if t.consumed == 0 && t.produced == 0 {
                return Err(PioError::Filter("filter made no progress".into()));
            }
            rest = &rest[t.consumed..];
        }
        Ok(data.len())
    }

    fn pio_write_finish(&mut self) -> PioResult<()> {
        if !self.finished {
            loop {
                let n = self.filter.finish(&mut self.buf)?;
                if n == 0 {
                    break;
                }
                write_all(&mut self.inner, &self.buf[..n])?;
            }
            self.finished = true;
        }
        self.inner.pio_write_finish()
    }
}

// ---------------- read side ----------------

pub struct ReadFilter<R: PioRead> {
    inner: R,
    filter: Box<dyn Filter>,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    eof: bool,
    finished: bool,
}

impl<R: PioRead> ReadFilter<R> {
    pub fn new(inner: R, filter: Box<dyn Filter>) -> Self {
        Self::with_capacity(inner, filter, DEFAULT_BUF_SIZE)
    }

    pub fn with_capacity(inner: R, filter: Box<dyn Filter>, buf_size: usize) -> Self {
        Self {
            inner,
            filter,
            buf: vec![0u8; buf_size.max(64)],
            start: 0,
            end: 0,
            eof: false,
            finished: false,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn fill(&mut self) -> PioResult<()> {
        let n = self.inner.pio_read(&mut self.buf[self.end..])?;
        if n == 0 {
            self.eof = true;
        } else {
            self.end += n;
        }
        Ok(())
    }

    fn compact(&mut self) {
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
    }
}

impl<R: PioRead> PioRead for ReadFilter<R> {
    fn pio_read(&mut self, out: &mut [u8]) -> PioResult<usize> {
        if out.is_empty() || self.finished {
            return Ok(0);
        }
        loop {
            if self.start == self.end && !self.eof {
                self.start = 0;
                self.end = 0;
                self.fill()?;
                continue;
            }
            if self.start < self.end {
                let t = self.filter.transform(&self.buf[self.start..self.end], out)?;
                self.start += t.consumed;
                if t.produced > 0 {
                    return Ok(t.produced);
                }
                if t.consumed > 0 {
                    continue;
                }
                if !self.eof {
                    self.compact();
                    if self.end == self.buf.len() {
                        return Err(PioError::Filter("filter stalled on a full input buffer".into()));
                    }
                    self.fill()?;
                    continue;
                }
            }
            let n = self.filter.finish(out)?;
            if n == 0 {
                self.finished = true;
            }
            return Ok(n);
        }
    }
}

// ---------------- copy ----------------

/// Stream src into dest through `filters` (applied in order on the write
/// path). Returns bytes read from src. dest is finished on success; on error
/// nothing written so far is undone.
pub fn copy_with_filters<D, S>(dest: D, src: &mut S, filters: Vec<Box<dyn Filter>>) -> PioResult<u64>
where
    D: PioWriteFlush,
    S: PioRead + ?Sized,
{
    copy_with_filters_buf(dest, src, filters, DEFAULT_BUF_SIZE)
}

pub fn copy_with_filters_buf<D, S>(
    dest: D,
    src: &mut S,
    filters: Vec<Box<dyn Filter>>,
    buf_size: usize,
) -> PioResult<u64>
where
    D: PioWriteFlush,
    S: PioRead + ?Sized,
{
    // Innermost wrapper sits next to dest; the first filter sees the raw data.
    let mut sink: Box<dyn PioWriteFlush + '_> = Box::new(dest);
    let depth = filters.len();
    for f in filters.into_iter().rev() {
        sink = Box::new(WriteFilter::with_capacity(sink, f, buf_size));
    }

    let mut buf = vec![0u8; buf_size.max(64)];
    let mut total = 0u64;
    loop {
        let n = src.pio_read(&mut buf)?;
        if n == 0 {
            break;
        }
        write_all(&mut sink, &buf[..n])?;
        total += n as u64;
    }
    sink.pio_write_finish()?;
    debug!("copy: {} bytes through {} filter(s)", total, depth);
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Doubles every byte; output-bound so small buffers force partial consumption.
    struct Doubler;

    impl Filter for Doubler {
        fn transform(&mut self, input: &[u8], output: &mut [u8]) -> PioResult<Transformed> {
            let n = input.len().min(output.len() / 2);
            for (i, &b) in input[..n].iter().enumerate() {
                output[2 * i] = b;
                output[2 * i + 1] = b;
            }
            Ok(Transformed { consumed: n, produced: 2 * n })
        }

        fn finish(&mut self, _output: &mut [u8]) -> PioResult<usize> {
            Ok(0)
        }
    }

    #[test]
    fn write_wrapper_resubmits_remainder() {
        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let mut w = WriteFilter::with_capacity(Vec::new(), Box::new(Doubler), 64);
        assert_eq!(w.pio_write(&data).unwrap(), data.len());
        w.pio_write_finish().unwrap();
        let out = w.into_inner();
        assert_eq!(out.len(), 2000);
        assert!(out.chunks(2).zip(&data).all(|(p, &b)| p == [b, b]));
    }

    #[test]
    fn read_wrapper_and_copy_compose() {
        let data = vec![7u8; 300];
        let src: &[u8] = &data;
        let mut r = ReadFilter::with_capacity(src, Box::new(Doubler), 64);
        let mut out = Vec::new();
        let n = copy_with_filters_buf(&mut out, &mut r, vec![Box::new(Doubler)], 64).unwrap();
        assert_eq!(n, 600);
        assert_eq!(out.len(), 1200);
    }

    #[test]
    fn compress_alg_parsing() {
        assert_eq!("gzip".parse::<CompressAlg>().unwrap(), CompressAlg::Gzip);
        assert_eq!("none".parse::<CompressAlg>().unwrap(), CompressAlg::None);
        assert!("lz4".parse::<CompressAlg>().is_err());
    }
}
