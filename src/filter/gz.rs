//! gzip filters: RFC 1952 framing around a raw deflate stream.
//!
//! Compressor emits a fixed 10-byte header (no name, mtime 0, OS unix),
//! raw deflate, then CRC32 + ISIZE (little-endian).
//! Decompressor accepts FEXTRA/FNAME/FCOMMENT/FHCRC headers, verifies the
//! trailer, and ignores bytes after the first member.

use byteorder::{ByteOrder, LittleEndian};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use log::warn;

use super::{Filter, Transformed};
use crate::error::{PioError, PioResult};

const GZ_MAGIC: [u8; 2] = [0x1f, 0x8b];
const GZ_DEFLATE: u8 = 8;
const GZ_HEADER: [u8; 10] = [0x1f, 0x8b, GZ_DEFLATE, 0, 0, 0, 0, 0, 0, 3];

const FHCRC: u8 = 0x02;
const FEXTRA: u8 = 0x04;
const FNAME: u8 = 0x08;
const FCOMMENT: u8 = 0x10;

/// Headers longer than this are rejected.
const MAX_HEADER: usize = 64 * 1024;

fn emit(src: &[u8], pos: &mut usize, out: &mut [u8]) -> usize {
    let n = (src.len() - *pos).min(out.len());
    out[..n].copy_from_slice(&src[*pos..*pos + n]);
    *pos += n;
    n
}

// ---------------- compress ----------------

pub struct GzCompress {
    deflate: Compress,
    crc: crc32fast::Hasher,
    size: u32,
    header_pos: usize,
    deflate_done: bool,
    trailer: [u8; 8],
    trailer_pos: usize,
}

impl GzCompress {
    pub fn new(level: u32) -> Self {
        Self {
            deflate: Compress::new(Compression::new(level.min(9)), false),
            crc: crc32fast::Hasher::new(),
            size: 0,
            header_pos: 0,
            deflate_done: false,
            trailer: [0u8; 8],
            trailer_pos: 8,
        }
    }
}

impl Filter for GzCompress {
    fn transform(&mut self, input: &[u8], output: &mut [u8]) -> PioResult<Transformed> {
        let mut produced = emit(&GZ_HEADER, &mut self.header_pos, output);
        if self.header_pos < GZ_HEADER.len() {
            return Ok(Transformed { consumed: 0, produced });
        }

        let before_in = self.deflate.total_in();
        let before_out = self.deflate.total_out();
        self.deflate
            .compress(input, &mut output[produced..], FlushCompress::None)
            .map_err(|e| PioError::Filter(format!("deflate: {e}")))?;
        let consumed = (self.deflate.total_in() - before_in) as usize;
        produced += (self.deflate.total_out() - before_out) as usize;

        self.crc.update(&input[..consumed]);
        self.size = self.size.wrapping_add(consumed as u32);
        Ok(Transformed { consumed, produced })
    }

    fn finish(&mut self, output: &mut [u8]) -> PioResult<usize> {
        let mut produced = emit(&GZ_HEADER, &mut self.header_pos, output);

        while !self.deflate_done && produced < output.len() {
            let before_out = self.deflate.total_out();
            let status = self
                .deflate
                .compress(&[], &mut output[produced..], FlushCompress::Finish)
                .map_err(|e| PioError::Filter(format!("deflate: {e}")))?;
            produced += (self.deflate.total_out() - before_out) as usize;
            if status == Status::StreamEnd {
                self.deflate_done = true;
                let crc = self.crc.clone().finalize();
                LittleEndian::write_u32(&mut self.trailer[0..4], crc);
                LittleEndian::write_u32(&mut self.trailer[4..8], self.size);
                self.trailer_pos = 0;
            }
        }

        if self.deflate_done {
            produced += emit(&self.trailer, &mut self.trailer_pos, &mut output[produced..]);
        }
        Ok(produced)
    }
}

// ---------------- decompress ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GzState {
    Header,
    Body,
    Trailer,
    Done,
}

pub struct GzDecompress {
    inflate: Decompress,
    state: GzState,
    header: Vec<u8>,
    trailer: Vec<u8>,
    crc: crc32fast::Hasher,
    size: u32,
    ignore_truncate: bool,
}

impl GzDecompress {
    pub fn new(ignore_truncate: bool) -> Self {
        Self {
            inflate: Decompress::new(false),
            state: GzState::Header,
            header: Vec::with_capacity(GZ_HEADER.len()),
            trailer: Vec::with_capacity(8),
            crc: crc32fast::Hasher::new(),
            size: 0,
            ignore_truncate,
        }
    }

    fn inflate_step(&mut self, input: &[u8], output: &mut [u8], flush: FlushDecompress) -> PioResult<(usize, usize)> {
        let before_in = self.inflate.total_in();
        let before_out = self.inflate.total_out();
        let status = self
            .inflate
            .decompress(input, output, flush)
            .map_err(|e| PioError::Filter(format!("inflate: {e}")))?;
        let consumed = (self.inflate.total_in() - before_in) as usize;
        let produced = (self.inflate.total_out() - before_out) as usize;
        self.crc.update(&output[..produced]);
        self.size = self.size.wrapping_add(produced as u32);
        if status == Status::StreamEnd {
            self.state = GzState::Trailer;
        }
        Ok((consumed, produced))
    }

    fn check_trailer(&self) -> PioResult<()> {
        let crc = LittleEndian::read_u32(&self.trailer[0..4]);
        let size = LittleEndian::read_u32(&self.trailer[4..8]);
        let actual = self.crc.clone().finalize();
        if crc != actual {
            return Err(PioError::Filter(format!(
                "gzip CRC mismatch: stored {crc:#010x}, calculated {actual:#010x}"
            )));
        }
        if size != self.size {
            return Err(PioError::Filter(format!(
                "gzip length mismatch: stored {size}, decoded {}",
                self.size
            )));
        }
        Ok(())
    }
}

/// Length of a complete gzip header at the start of `buf`, None if more bytes are needed.
fn gzip_header_len(buf: &[u8]) -> PioResult<Option<usize>> {
    if buf.len() < 10 {
        if buf.len() >= 2 && buf[..2] != GZ_MAGIC {
            return Err(PioError::Filter("not a gzip stream".into()));
        }
        return Ok(None);
    }
    if buf[..2] != GZ_MAGIC || buf[2] != GZ_DEFLATE {
        return Err(PioError::Filter("not a gzip stream".into()));
    }
    let flags = buf[3];
    let mut pos = 10;

    if flags & FEXTRA != 0 {
        if buf.len() < pos + 2 {
            return Ok(None);
        }
        pos += 2 + LittleEndian::read_u16(&buf[pos..pos + 2]) as usize;
    }
    for flag in [FNAME, FCOMMENT] {
        if flags & flag != 0 {
            match buf.get(pos..).and_then(|rest| rest.iter().position(|&b| b == 0)) {
                Some(nul) => pos += nul + 1,
                None => return Ok(None),
            }
        }
    }
    if flags & FHCRC != 0 {
        pos += 2;
    }
    if buf.len() < pos {
        return Ok(None);
    }
    Ok(Some(pos))
}

impl Filter for GzDecompress {
    fn transform(&mut self, input: &[u8], output: &mut [u8]) -> PioResult<Transformed> {
        let mut consumed = 0usize;
        let mut produced = 0usize;

        loop {
            match self.state {
                GzState::Header => {
                    if consumed == input.len() {
                        break;
                    }
                    let before = self.header.len();
                    self.header.extend_from_slice(&input[consumed..]);
                    match gzip_header_len(&self.header)? {
                        Some(len) => {
                            consumed += len - before;
                            self.header.truncate(len);
                            self.state = GzState::Body;
                        }
                        None => {
                            if self.header.len() > MAX_HEADER {
                                return Err(PioError::Filter("gzip header too long".into()));
                            }
                            consumed = input.len();
                        }
                    }
                }
                GzState::Body => {
                    if produced == output.len() {
                        break;
                    }
                    let (c, p) =
                        self.inflate_step(&input[consumed..], &mut output[produced..], FlushDecompress::None)?;
                    consumed += c;
                    produced += p;
                    if c == 0 && p == 0 && self.state == GzState::Body {
                        break;
                    }
                }
                GzState::Trailer => {
                    let need = 8 - self.trailer.len();
                    let take = need.min(input.len() - consumed);
                    self.trailer.extend_from_slice(&input[consumed..consumed + take]);
                    consumed += take;
                    if self.trailer.len() < 8 {
                        break;
                    }
                    self.check_trailer()?;
                    self.state = GzState::Done;
                }
                GzState::Done => {
                    consumed = input.len();
                    break;
                }
            }
        }
        Ok(Transformed { consumed, produced })
    }

    fn finish(&mut self, output: &mut [u8]) -> PioResult<usize> {
        if self.state == GzState::Body {
            match self.inflate_step(&[], output, FlushDecompress::Finish) {
                Ok((_, produced)) if produced > 0 => return Ok(produced),
                Ok(_) => {}
                Err(e) if self.ignore_truncate => {
                    warn!("gzip stream cut short ({}), ignoring", e);
                    self.state = GzState::Done;
                    return Ok(0);
                }
                Err(e) => return Err(e),
            }
        }
        match self.state {
            GzState::Done => Ok(0),
            // Empty input is an empty stream.
            GzState::Header if self.header.is_empty() => Ok(0),
            state => {
                if self.ignore_truncate {
                    warn!("gzip stream truncated in {:?} state, ignoring", state);
                    self.state = GzState::Done;
                    Ok(0)
                } else {
                    Err(PioError::Filter(format!("gzip stream truncated in {:?} state", state)))
                }
            }
        }
    }

    fn forbid_truncated_tail(&mut self) {
        self.ignore_truncate = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn run(filter: &mut dyn Filter, input: &[u8], out_chunk: usize) -> PioResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; out_chunk];
        let mut rest = input;
        while !rest.is_empty() {
            let t = filter.transform(rest, &mut buf)?;
            out.extend_from_slice(&buf[..t.produced]);
            rest = &rest[t.consumed..];
            if t.consumed == 0 && t.produced == 0 {
                break;
            }
        }
        loop {
            let n = filter.finish(&mut buf)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok(out)
    }

    #[test]
    fn output_is_readable_by_flate2_gz_decoder() {
        let data = b"hello hello hello hello gzip".repeat(50);
        let gz = run(&mut GzCompress::new(6), &data, 17).unwrap();
        let mut back = Vec::new();
        flate2::read::GzDecoder::new(&gz[..]).read_to_end(&mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn decodes_header_with_name_and_detects_truncation() {
        let data = b"named member".to_vec();
        let mut enc = flate2::GzBuilder::new()
            .filename("x.txt")
            .write(Vec::new(), flate2::Compression::default());
        std::io::Write::write_all(&mut enc, &data).unwrap();
        let gz = enc.finish().unwrap();

        assert_eq!(run(&mut GzDecompress::new(false), &gz, 3).unwrap(), data);

        let cut = &gz[..gz.len() - 4];
        assert!(run(&mut GzDecompress::new(false), cut, 64).is_err());
        assert_eq!(run(&mut GzDecompress::new(true), cut, 64).unwrap(), data);
    }
}
