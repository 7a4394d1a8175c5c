//! CutZeroTail: passes bytes through but drops a trailing run of zero bytes.
//!
//! Zero runs are held back as a counter and released only when a non-zero
//! byte follows; whatever is still held at finish() is discarded.

use super::{Filter, Transformed};
use crate::error::PioResult;

#[derive(Debug, Default)]
pub struct CutZeroTail {
    held_zeros: u64,
}

impl CutZeroTail {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Filter for CutZeroTail {
    fn transform(&mut self, input: &[u8], output: &mut [u8]) -> PioResult<Transformed> {
        let mut i = 0usize;
        let mut o = 0usize;

        while i < input.len() {
            let rest = &input[i..];
            if rest[0] == 0 {
                let run = rest.iter().take_while(|&&b| b == 0).count();
                self.held_zeros += run as u64;
                i += run;
                continue;
            }
            if self.held_zeros > 0 {
                let n = (self.held_zeros.min((output.len() - o) as u64)) as usize;
                output[o..o + n].fill(0);
                o += n;
                self.held_zeros -= n as u64;
                if self.held_zeros > 0 {
                    break;
                }
            }
            let run = rest.iter().take_while(|&&b| b != 0).count().min(output.len() - o);
            if run == 0 {
                break;
            }
            output[o..o + run].copy_from_slice(&rest[..run]);
            o += run;
            i += run;
        }

        Ok(Transformed { consumed: i, produced: o })
    }

    fn finish(&mut self, _output: &mut [u8]) -> PioResult<usize> {
        self.held_zeros = 0;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::WriteFilter;
    use crate::pio::PioWriteFlush;

    #[test]
    fn inner_zeros_survive_tail_is_cut() {
        let mut w = WriteFilter::with_capacity(Vec::new(), Box::new(CutZeroTail::new()), 64);
        let mut data = vec![1u8, 0, 0, 2];
        data.extend(std::iter::repeat(0).take(500));
        data.push(3);
        data.extend(std::iter::repeat(0).take(700));
        w.pio_write(&data[..10]).unwrap();
        w.pio_write(&data[10..]).unwrap();
        w.pio_write_finish().unwrap();
        let out = w.into_inner();
        assert_eq!(out.len(), 505);
        assert_eq!(out[..], data[..505]);
    }
}
