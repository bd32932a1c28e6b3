//! Text rendering for bytes and regions.

use std::fmt::Write;

use seqdb_atlas::{RegionInfo, RegionOrigin};

const ROW: usize = 16;

/// Classic offset / hex / ASCII dump. `base` is the file offset of `bytes[0]`.
pub fn hex_dump(bytes: &[u8], base: u64) -> String {
    let mut out = String::new();

    for (row, chunk) in bytes.chunks(ROW).enumerate() {
        let offset = base + (row * ROW) as u64;
        let _ = write!(out, "{offset:010x}  ");

        for i in 0..ROW {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, "{b:02x} ");
                }
                None => out.push_str("   "),
            }
            if i == ROW / 2 - 1 {
                out.push(' ');
            }
        }

        out.push_str(" |");
        out.extend(chunk.iter().map(|b| {
            if b.is_ascii_graphic() || *b == b' ' {
                *b as char
            } else {
                '.'
            }
        }));
        out.push_str("|\n");
    }

    out
}

/// One-line summary of a region for the layout listing
pub fn describe_region(region: &RegionInfo) -> String {
    let origin = match region.origin {
        RegionOrigin::Mapped => "mmap",
        RegionOrigin::Owned => "read",
    };
    format!(
        "{} {} [{}, {}) {} bytes, refs {}, clock {}, penalty {} ({origin})",
        region.id,
        region.path.display(),
        region.begin,
        region.end,
        region.end - region.begin,
        region.refs,
        region.clock,
        region.penalty,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_dump_layout() {
        let dump = hex_dump(b"ACGT\x00acgtNNNNNNNN-tail", 0x100);
        let lines: Vec<&str> = dump.lines().collect();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0000000100  41 43 47 54 00"));
        assert!(lines[0].ends_with("|ACGT.acgtNNNNNNN|"));
        assert!(lines[1].starts_with("0000000110  4e 2d"));
        assert!(lines[1].ends_with("|N-tail|"));
    }

    #[test]
    fn test_hex_dump_empty() {
        assert_eq!(hex_dump(&[], 0), "");
    }
}
