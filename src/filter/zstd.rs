//! zstd filters over the raw streaming context (`zstd::stream::raw`).

use log::warn;
use zstd::stream::raw::{Decoder, Encoder, InBuffer, Operation, OutBuffer};

use super::{Filter, Transformed};
use crate::error::{PioError, PioResult};

fn zstd_err(what: &str, e: std::io::Error) -> PioError {
    PioError::Filter(format!("zstd {what}: {e}"))
}

pub struct ZstdCompress {
    ctx: Encoder<'static>,
    done: bool,
}

impl ZstdCompress {
    pub fn new(level: i32) -> PioResult<Self> {
        Ok(Self {
            ctx: Encoder::new(level).map_err(|e| zstd_err("init", e))?,
            done: false,
        })
    }
}

impl Filter for ZstdCompress {
    fn transform(&mut self, input: &[u8], output: &mut [u8]) -> PioResult<Transformed> {
        let mut src = InBuffer::around(input);
        let mut dst = OutBuffer::around(output);
        self.ctx.run(&mut src, &mut dst).map_err(|e| zstd_err("compress", e))?;
        Ok(Transformed {
            consumed: src.pos(),
            produced: dst.pos(),
        })
    }

    fn finish(&mut self, output: &mut [u8]) -> PioResult<usize> {
        if self.done {
            return Ok(0);
        }
        let mut dst = OutBuffer::around(output);
        let remaining = self.ctx.finish(&mut dst, false).map_err(|e| zstd_err("finish", e))?;
        if remaining == 0 {
            self.done = true;
        }
        Ok(dst.pos())
    }
}

pub struct ZstdDecompress {
    ctx: Decoder<'static>,
    /// No partial frame is pending.
    frame_done: bool,
    ignore_truncate: bool,
}

impl ZstdDecompress {
    pub fn new(ignore_truncate: bool) -> PioResult<Self> {
        Ok(Self {
            ctx: Decoder::new().map_err(|e| zstd_err("init", e))?,
            frame_done: true,
            ignore_truncate,
        })
    }
}

impl Filter for ZstdDecompress {
    fn transform(&mut self, input: &[u8], output: &mut [u8]) -> PioResult<Transformed> {
        let mut src = InBuffer::around(input);
        let mut dst = OutBuffer::around(output);
        let hint = self.ctx.run(&mut src, &mut dst).map_err(|e| zstd_err("decompress", e))?;
        if hint == 0 {
            self.frame_done = true;
        } else if src.pos() > 0 {
            self.frame_done = false;
        }
        Ok(Transformed {
            consumed: src.pos(),
            produced: dst.pos(),
        })
    }

    fn finish(&mut self, output: &mut [u8]) -> PioResult<usize> {
        if !self.frame_done {
            // Drain output the context is still holding.
            let mut src = InBuffer::around(&[]);
            let mut dst = OutBuffer::around(output);
            let hint = self.ctx.run(&mut src, &mut dst).map_err(|e| zstd_err("decompress", e))?;
            if hint == 0 {
                self.frame_done = true;
            }
            if dst.pos() > 0 {
                return Ok(dst.pos());
            }
        }
        if self.frame_done {
            return Ok(0);
        }
        if self.ignore_truncate {
            warn!("zstd stream truncated, ignoring");
            self.frame_done = true;
            return Ok(0);
        }
        Err(PioError::Filter("zstd stream truncated".into()))
    }

    fn forbid_truncated_tail(&mut self) {
        self.ignore_truncate = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_is_readable_by_bulk_api() {
        let data = b"zstd streaming frame ".repeat(100);
        let mut c = ZstdCompress::new(3).unwrap();
        let mut out = vec![0u8; 64 * 1024];
        let t = c.transform(&data, &mut out).unwrap();
        assert_eq!(t.consumed, data.len());
        let mut len = t.produced;
        loop {
            let n = c.finish(&mut out[len..]).unwrap();
            if n == 0 {
                break;
            }
            len += n;
        }
        let back = zstd::bulk::decompress(&out[..len], data.len()).unwrap();
        assert_eq!(back, data);
    }
}
