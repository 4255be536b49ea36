// src/version.rs

//! Package version comparison
//!
//! Versions follow the `[epoch,]version[_revision]` shape of ports-style
//! package names. The comparator is total and deterministic: epochs dominate,
//! then the dotted version text chunk by chunk, then the numeric revision.
//! It backs the `vercmp` SQL scalar function registered by the storage
//! engine, so both the formula engine and free-form queries share it.

use std::cmp::Ordering;

/// A version string split into its comparable parts
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedVersion<'a> {
    epoch: u64,
    body: &'a str,
    revision: u64,
}

fn split(raw: &str) -> ParsedVersion<'_> {
    let (epoch, rest) = match raw.split_once(',') {
        Some((e, r)) => (e.parse::<u64>().unwrap_or(0), r),
        None => (0, raw),
    };
    let (body, revision) = match rest.rsplit_once('_') {
        Some((b, r)) => (b, r.parse::<u64>().unwrap_or(0)),
        None => (rest, 0),
    };
    ParsedVersion {
        epoch,
        body,
        revision,
    }
}

/// One maximal run of digits or of letters within a version body
#[derive(Debug, Clone, PartialEq, Eq)]
enum Chunk<'a> {
    Number(u64),
    Text(&'a str),
}

/// Pre-release markers rank below a bare version: `1.0.rc1 < 1.0`
fn prerelease_rank(text: &str) -> Option<u8> {
    match text.to_ascii_lowercase().as_str() {
        "alpha" | "a" => Some(0),
        "beta" | "b" => Some(1),
        "pre" => Some(2),
        "rc" => Some(3),
        _ => None,
    }
}

fn chunks(body: &str) -> Vec<Chunk<'_>> {
    let mut out = Vec::new();
    let bytes = body.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            // Overlong runs saturate rather than wrap
            let num = body[start..i].parse::<u64>().unwrap_or(u64::MAX);
            out.push(Chunk::Number(num));
        } else if c.is_ascii_alphabetic() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_alphabetic() {
                i += 1;
            }
            out.push(Chunk::Text(&body[start..i]));
        } else {
            // separators: '.', '+', and anything else
            i += 1;
        }
    }
    out
}

fn compare_chunks(a: Option<&Chunk<'_>>, b: Option<&Chunk<'_>>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (Some(Chunk::Text(t)), None) => {
            if prerelease_rank(t).is_some() {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (None, Some(Chunk::Text(t))) => {
            if prerelease_rank(t).is_some() {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (Some(Chunk::Number(x)), Some(Chunk::Number(y))) => x.cmp(y),
        // A number sorts after letters at the same position: 1.0.1 > 1.0.rc1
        (Some(Chunk::Number(_)), Some(Chunk::Text(_))) => Ordering::Greater,
        (Some(Chunk::Text(_)), Some(Chunk::Number(_))) => Ordering::Less,
        (Some(Chunk::Text(x)), Some(Chunk::Text(y))) => {
            match (prerelease_rank(x), prerelease_rank(y)) {
                (Some(rx), Some(ry)) => rx.cmp(&ry),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => x.cmp(y),
            }
        }
    }
}

/// Three-way comparison of two package version strings
pub fn compare(a: &str, b: &str) -> Ordering {
    let pa = split(a);
    let pb = split(b);

    match pa.epoch.cmp(&pb.epoch) {
        Ordering::Equal => {}
        other => return other,
    }

    let ca = chunks(pa.body);
    let cb = chunks(pb.body);
    let len = ca.len().max(cb.len());
    for i in 0..len {
        match compare_chunks(ca.get(i), cb.get(i)) {
            Ordering::Equal => {}
            other => return other,
        }
    }

    pa.revision.cmp(&pb.revision)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lt(a: &str, b: &str) {
        assert_eq!(compare(a, b), Ordering::Less, "{} < {}", a, b);
        assert_eq!(compare(b, a), Ordering::Greater, "{} > {}", b, a);
    }

    fn eq(a: &str, b: &str) {
        assert_eq!(compare(a, b), Ordering::Equal, "{} == {}", a, b);
    }

    #[test]
    fn test_numeric_ordering() {
        lt("1.0", "1.1");
        lt("1.9", "1.10");
        lt("0.99", "1.0");
        eq("1.0", "1.0");
    }

    #[test]
    fn test_revision_breaks_ties() {
        lt("1.0", "1.0_1");
        lt("1.0_1", "1.0_2");
        eq("1.0_0", "1.0");
    }

    #[test]
    fn test_epoch_dominates() {
        lt("1,0.9", "2,0.1");
        lt("9.9", "1,0.1");
    }

    #[test]
    fn test_prerelease_below_release() {
        lt("1.0.rc1", "1.0");
        lt("1.0.alpha2", "1.0.beta1");
        lt("1.0.beta1", "1.0.rc1");
        lt("1.0.rc2", "1.0.1");
    }

    #[test]
    fn test_letter_suffixes() {
        lt("1.0a", "1.0b");
        lt("1.0", "1.0p1");
    }

    #[test]
    fn test_separator_insensitive() {
        eq("1.0.1", "1.0-1");
        eq("1+0", "1.0");
    }

    #[test]
    fn test_overlong_numbers_do_not_panic() {
        lt("1.0", "1.99999999999999999999999999");
    }
}
