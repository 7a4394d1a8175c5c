//! util: small shared helpers.
//!
//! Contains:
//! - version parsing/formatting (server "13.4" -> 130400, program "2.5.11" -> 20511);
//! - LSN formatting/parsing in the "%X/%X" form;
//! - command-line option tokenizer for the remote transport (`split_options`);
//! - env helpers used by the config layer.

use anyhow::{anyhow, Result};
use log::warn;

use crate::consts::MAX_CMDLINE_OPTIONS;

/// Parse "major.minor" server version into major * 10000 + minor * 100.
/// Unknown formats yield 0 with a warning.
pub fn parse_server_version(server_version: &str) -> u32 {
    let mut it = server_version.trim().splitn(3, '.');
    let major = it.next().and_then(|s| leading_number(s));
    let minor = it.next().and_then(|s| leading_number(s));
    match (major, minor) {
        (Some(major), Some(minor)) => major * 10000 + minor * 100,
        _ => {
            warn!("Unknown server version format {}", server_version);
            0
        }
    }
}

/// Parse "major.minor.micro" program version into major * 10000 + minor * 100 + micro.
pub fn parse_program_version(program_version: &str) -> u32 {
    let s = program_version.trim();
    if s.is_empty() {
        return 0;
    }
    let parts: Vec<Option<u32>> = s.splitn(3, '.').map(leading_number).collect();
    match parts.as_slice() {
        [Some(major), Some(minor), Some(micro)] => major * 10000 + minor * 100 + micro,
        _ => {
            warn!("Unknown program version format {}", program_version);
            0
        }
    }
}

/// Inverse of `parse_program_version`: 20511 -> "2.5.11".
pub fn program_version_str(num: u32) -> String {
    format!("{}.{}.{}", num / 10000, (num / 100) % 100, num % 100)
}

fn leading_number(s: &str) -> Option<u32> {
    let digits: &str = {
        let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        &s[..end]
    };
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

/// Format an LSN as "%X/%X".
#[inline]
pub fn fmt_lsn(lsn: u64) -> String {
    format!("{:X}/{:X}", (lsn >> 32) as u32, lsn as u32)
}

/// Parse an LSN in "%X/%X" form.
pub fn parse_lsn(s: &str) -> Result<u64> {
    let (hi, lo) = s
        .trim()
        .split_once('/')
        .ok_or_else(|| anyhow!("invalid LSN '{}': expected X/X", s))?;
    let hi = u32::from_str_radix(hi, 16).map_err(|e| anyhow!("invalid LSN '{}': {}", s, e))?;
    let lo = u32::from_str_radix(lo, 16).map_err(|e| anyhow!("invalid LSN '{}': {}", s, e))?;
    Ok(((hi as u64) << 32) | lo as u64)
}

/// Split free-form transport options on spaces, honouring single and double
/// quotes. Quote characters are stripped; a doubled quote inside a quoted run
/// stands for a literal quote. Empty tokens are skipped.
pub fn split_options(options: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut has_token = false;
    let mut in_quote: Option<char> = None;
    let mut chars = options.chars().peekable();

    while let Some(c) = chars.next() {
        match in_quote {
            Some(q) if c == q => {
                if chars.peek() == Some(&q) {
                    chars.next();
                    cur.push(q);
                } else {
                    in_quote = None;
                }
            }
            Some(_) => cur.push(c),
            None => match c {
                '\'' | '"' => {
                    in_quote = Some(c);
                    has_token = true;
                }
                ' ' => {
                    if has_token {
                        out.push(std::mem::take(&mut cur));
                        has_token = false;
                    }
                }
                _ => {
                    cur.push(c);
                    has_token = true;
                }
            },
        }
        if out.len() >= MAX_CMDLINE_OPTIONS {
            return Err(anyhow!("Too many options"));
        }
    }
    if in_quote.is_some() {
        return Err(anyhow!("unterminated quote in options: {}", options));
    }
    if has_token {
        out.push(cur);
    }
    if out.len() >= MAX_CMDLINE_OPTIONS {
        return Err(anyhow!("Too many options"));
    }
    Ok(out)
}

/// Read a non-empty, trimmed env var.
pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_version_parsing() {
        assert_eq!(parse_server_version("13.4"), 130400);
        assert_eq!(parse_server_version("9.6.24"), 90600);
        assert_eq!(parse_server_version("16beta1"), 0);
        assert_eq!(parse_server_version("garbage"), 0);
    }

    #[test]
    fn program_version_parsing() {
        assert_eq!(parse_program_version("2.5.11"), 20511);
        assert_eq!(parse_program_version(""), 0);
        assert_eq!(parse_program_version("2.5"), 0);
        assert_eq!(program_version_str(20511), "2.5.11");
        assert_eq!(program_version_str(parse_program_version("2.6.3")), "2.6.3");
    }

    #[test]
    fn lsn_format_and_parse() {
        let lsn = (0x1Au64 << 32) | 0x2B00_0028;
        assert_eq!(fmt_lsn(lsn), "1A/2B000028");
        assert_eq!(parse_lsn("1A/2B000028").unwrap(), lsn);
        assert_eq!(fmt_lsn(0), "0/0");
        assert!(parse_lsn("nonsense").is_err());
    }

    #[test]
    fn split_options_respects_quotes() {
        let got = split_options("-o 'ProxyCommand ssh -W %h:%p jump'  -v").unwrap();
        assert_eq!(got, vec!["-o", "ProxyCommand ssh -W %h:%p jump", "-v"]);

        let got = split_options(r#"-o "User=it""s""#).unwrap();
        assert_eq!(got, vec!["-o", "User=it\"s"]);

        assert!(split_options("").unwrap().is_empty());
        assert!(split_options("-o 'open").is_err());
    }

    #[test]
    fn split_options_limits_count() {
        let many = vec!["-v"; MAX_CMDLINE_OPTIONS + 1].join(" ");
        assert!(split_options(&many).is_err());
    }
}
