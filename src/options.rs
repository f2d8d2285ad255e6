use std::time::Duration;

use thiserror::Error;

use crate::protocol::{DEFAULT_BLOCK_SIZE, MAX_BLKSIZE, MIN_BLKSIZE};

pub const OPT_BLKSIZE: &str = "blksize";
pub const OPT_TIMEOUT: &str = "timeout";
pub const OPT_TSIZE: &str = "tsize";
pub const OPT_WINDOWSIZE: &str = "windowsize";

/// Retransmit / expiry interval when the client does not negotiate one
/// (RFC 2349).
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// One block in flight unless the client negotiates a window (RFC 7440).
pub const DEFAULT_WINDOW_SIZE: u16 = 1;

/// Ceiling applied to negotiated windows. RFC 7440 suggests staying at or
/// below 8 so a full window never overruns the OS send buffer.
pub const MAX_WINDOW_SIZE: u16 = 8;

/// A recognized option carried a value that fails to parse or falls outside
/// its RFC bounds. Surfaced to the client as wire ERROR 8; unknown option
/// names never produce this (RFC 2347 says to ignore them).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("bad option {name}={value}")]
pub struct OptionError {
    pub name: String,
    pub value: String,
}

/// Options in force for one transfer, fixed by the first exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedOptions {
    pub block_size: usize,
    pub timeout: Duration,
    pub transfer_size: Option<u64>,
    pub window_size: u16,
}

impl Default for NegotiatedOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            transfer_size: None,
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }
}

/// Which side of the transfer the peer requested; windowsize only applies
/// when the server is the data sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
}

/// Compute the options for a transfer from what the client offered.
///
/// Returns the negotiated set together with the OACK option list (accepted
/// options only, lowercase names, final values). An empty list means no OACK
/// is sent and the transfer starts with plain DATA/ACK. Options whose
/// accepted value matches the default are omitted since they change nothing.
///
/// `tsize_reply` is the file length for a read request; write requests pass
/// `None` and the client's advertised size is echoed back.
pub fn negotiate(
    offered: &[(String, String)],
    kind: RequestKind,
    tsize_reply: Option<u64>,
) -> Result<(NegotiatedOptions, Vec<(String, String)>), OptionError> {
    let mut negotiated = NegotiatedOptions::default();
    let mut acked: Vec<(String, String)> = Vec::new();

    let mut push = |name: &str, value: String| {
        // A client may repeat an option; the last occurrence wins.
        if let Some(slot) = acked.iter_mut().find(|(n, _)| n.as_str() == name) {
            slot.1 = value;
        } else {
            acked.push((name.to_string(), value));
        }
    };

    for (name, value) in offered {
        match name.as_str() {
            OPT_BLKSIZE => {
                let size = parse_bounded(name, value, MIN_BLKSIZE as u64, MAX_BLKSIZE as u64)?;
                negotiated.block_size = size as usize;
                if negotiated.block_size != DEFAULT_BLOCK_SIZE {
                    push(OPT_BLKSIZE, size.to_string());
                }
            }
            OPT_TIMEOUT => {
                let secs = parse_bounded(name, value, 1, 255)?;
                negotiated.timeout = Duration::from_secs(secs);
                if secs != DEFAULT_TIMEOUT_SECS {
                    push(OPT_TIMEOUT, secs.to_string());
                }
            }
            OPT_TSIZE => {
                let advertised = parse_u64(name, value)?;
                let reply = match tsize_reply {
                    Some(size) => size,
                    None => advertised,
                };
                negotiated.transfer_size = Some(reply);
                push(OPT_TSIZE, reply.to_string());
            }
            OPT_WINDOWSIZE => {
                let window = parse_bounded(name, value, 1, u16::MAX as u64)? as u16;
                if kind == RequestKind::Read {
                    negotiated.window_size = window.min(MAX_WINDOW_SIZE);
                    if negotiated.window_size != DEFAULT_WINDOW_SIZE {
                        push(OPT_WINDOWSIZE, negotiated.window_size.to_string());
                    }
                }
                // Write transfers are acknowledged block-by-block, which is
                // the windowsize=1 protocol; leaving the option out of the
                // OACK keeps the client at the default.
            }
            // Unknown options are silently ignored (RFC 2347).
            _ => {}
        }
    }

    Ok((negotiated, acked))
}

fn parse_u64(name: &str, value: &str) -> Result<u64, OptionError> {
    value.parse::<u64>().map_err(|_| OptionError {
        name: name.to_string(),
        value: value.to_string(),
    })
}

fn parse_bounded(name: &str, value: &str, min: u64, max: u64) -> Result<u64, OptionError> {
    let parsed = parse_u64(name, value)?;
    if (min..=max).contains(&parsed) {
        Ok(parsed)
    } else {
        Err(OptionError {
            name: name.to_string(),
            value: value.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn no_options_means_no_oack() {
        let (negotiated, acked) = negotiate(&[], RequestKind::Read, Some(100)).unwrap();
        assert_eq!(negotiated, NegotiatedOptions::default());
        assert!(acked.is_empty());
    }

    #[test]
    fn blksize_and_tsize_for_read() {
        let offered = opts(&[("blksize", "1024"), ("tsize", "0")]);
        let (negotiated, acked) = negotiate(&offered, RequestKind::Read, Some(5000)).unwrap();
        assert_eq!(negotiated.block_size, 1024);
        assert_eq!(negotiated.transfer_size, Some(5000));
        assert_eq!(
            acked,
            opts(&[("blksize", "1024"), ("tsize", "5000")])
        );
    }

    #[test]
    fn tsize_echoed_on_write() {
        let offered = opts(&[("tsize", "8192")]);
        let (negotiated, acked) = negotiate(&offered, RequestKind::Write, None).unwrap();
        assert_eq!(negotiated.transfer_size, Some(8192));
        assert_eq!(acked, opts(&[("tsize", "8192")]));
    }

    #[test]
    fn default_values_are_omitted_from_oack() {
        let offered = opts(&[("blksize", "512"), ("timeout", "5"), ("windowsize", "1")]);
        let (negotiated, acked) = negotiate(&offered, RequestKind::Read, Some(10)).unwrap();
        assert_eq!(negotiated, NegotiatedOptions::default());
        assert!(acked.is_empty());
    }

    #[test]
    fn windowsize_is_clamped() {
        let offered = opts(&[("windowsize", "64")]);
        let (negotiated, acked) = negotiate(&offered, RequestKind::Read, Some(10)).unwrap();
        assert_eq!(negotiated.window_size, 8);
        assert_eq!(acked, opts(&[("windowsize", "8")]));
    }

    #[test]
    fn windowsize_ignored_for_write() {
        let offered = opts(&[("windowsize", "4")]);
        let (negotiated, acked) = negotiate(&offered, RequestKind::Write, None).unwrap();
        assert_eq!(negotiated.window_size, 1);
        assert!(acked.is_empty());
    }

    #[test]
    fn timeout_within_bounds() {
        let offered = opts(&[("timeout", "1")]);
        let (negotiated, acked) = negotiate(&offered, RequestKind::Read, Some(10)).unwrap();
        assert_eq!(negotiated.timeout, Duration::from_secs(1));
        assert_eq!(acked, opts(&[("timeout", "1")]));
    }

    #[test]
    fn out_of_bounds_values_are_rejected() {
        for (name, value) in [
            ("blksize", "7"),
            ("blksize", "65465"),
            ("timeout", "0"),
            ("timeout", "256"),
            ("windowsize", "0"),
            ("windowsize", "65536"),
        ] {
            let offered = opts(&[(name, value)]);
            let err = negotiate(&offered, RequestKind::Read, Some(10)).unwrap_err();
            assert_eq!(err.name, name);
        }
    }

    #[test]
    fn unparsable_values_are_rejected() {
        let offered = opts(&[("blksize", "big")]);
        assert!(negotiate(&offered, RequestKind::Read, Some(10)).is_err());
        let offered = opts(&[("tsize", "-1")]);
        assert!(negotiate(&offered, RequestKind::Write, None).is_err());
    }

    #[test]
    fn unknown_options_are_ignored() {
        let offered = opts(&[("utimeout", "100"), ("blksize", "2048")]);
        let (negotiated, acked) = negotiate(&offered, RequestKind::Read, Some(10)).unwrap();
        assert_eq!(negotiated.block_size, 2048);
        assert_eq!(acked, opts(&[("blksize", "2048")]));
    }

    #[test]
    fn repeated_option_last_wins() {
        let offered = opts(&[("blksize", "1024"), ("blksize", "2048")]);
        let (negotiated, acked) = negotiate(&offered, RequestKind::Read, Some(10)).unwrap();
        assert_eq!(negotiated.block_size, 2048);
        assert_eq!(acked, opts(&[("blksize", "2048")]));
    }
}
