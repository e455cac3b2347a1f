//! Byte-pair subword encoder. Merges are consumed from a prebuilt codes
//! file (one `left right` rule per line, best rank first); learning merges
//! is out of scope.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

use crate::binio;
use crate::error::{Error, Result};

/// Applies ranked merge rules to a token and reports the segmentations it
/// passed through, coarsest first.
#[derive(Debug, Default)]
pub struct BpeEncoder {
    /// `(left, right) -> rank`, lower rank merges first.
    codes: HashMap<(String, String), u32>,
}

impl BpeEncoder {
    pub fn new() -> Self {
        BpeEncoder::default()
    }

    pub fn from_codes_file(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            Error::config(format!("cannot open BPE codes file {}: {e}", path.display()))
        })?;
        let mut codes = HashMap::new();
        for (rank, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            let mut parts = line.split_whitespace();
            let (left, right) = match (parts.next(), parts.next()) {
                (Some(l), Some(r)) => (l.to_string(), r.to_string()),
                _ => {
                    return Err(Error::format(format!(
                        "malformed BPE code on line {}: {line:?}",
                        rank + 1
                    )))
                }
            };
            codes.entry((left, right)).or_insert(rank as u32);
        }
        Ok(BpeEncoder { codes })
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Segmentation variants of `token`, most merged first, at most
    /// `max_variants` of them. The first variant is the final encoding; the
    /// following ones step back one merge each, giving progressively finer
    /// subword splits.
    pub fn apply(&self, token: &str, max_variants: usize) -> Vec<Vec<String>> {
        let mut seg: Vec<String> = token.chars().map(|c| c.to_string()).collect();
        let mut snapshots = vec![seg.clone()];

        while seg.len() > 1 {
            let mut best: Option<(u32, usize)> = None;
            for i in 0..seg.len() - 1 {
                // the pair key borrows would need a scratch tuple; two-field lookup instead
                if let Some(&rank) = self.lookup(&seg[i], &seg[i + 1]) {
                    if best.map_or(true, |(r, _)| rank < r) {
                        best = Some((rank, i));
                    }
                }
            }
            let Some((_, at)) = best else { break };

            // merge every occurrence of the chosen pair, left to right
            let (left, right) = (seg[at].clone(), seg[at + 1].clone());
            let mut merged = Vec::with_capacity(seg.len());
            let mut i = 0;
            while i < seg.len() {
                if i + 1 < seg.len() && seg[i] == left && seg[i + 1] == right {
                    merged.push(format!("{}{}", left, right));
                    i += 2;
                } else {
                    merged.push(seg[i].clone());
                    i += 1;
                }
            }
            seg = merged;
            snapshots.push(seg.clone());
        }

        snapshots.reverse();
        snapshots.truncate(max_variants.max(1));
        snapshots
    }

    fn lookup(&self, left: &str, right: &str) -> Option<&u32> {
        // HashMap<(String, String)> cannot be probed with two &str without
        // building the key; tokens are short so this stays cheap
        self.codes.get(&(left.to_string(), right.to_string()))
    }

    pub fn save<W: Write>(&self, out: &mut W) -> Result<()> {
        binio::write_u32(out, self.codes.len() as u32)?;
        let mut rules: Vec<(&(String, String), &u32)> = self.codes.iter().collect();
        rules.sort_by_key(|(_, &rank)| rank);
        for ((left, right), &rank) in rules {
            binio::write_cstr(out, left)?;
            binio::write_cstr(out, right)?;
            binio::write_u32(out, rank)?;
        }
        Ok(())
    }

    pub fn load<R: Read>(inp: &mut R) -> Result<Self> {
        let count = binio::read_u32(inp)?;
        let mut codes = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let left = binio::read_cstr(inp)?;
            let right = binio::read_cstr(inp)?;
            let rank = binio::read_u32(inp)?;
            codes.insert((left, right), rank);
        }
        Ok(BpeEncoder { codes })
    }
}

/// Unique subword strings of character length at least `minn`, in
/// first-seen order across the ranked variants.
pub fn uniq_subwords(variants: &[Vec<String>], minn: usize) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for variant in variants {
        for sub in variant {
            if sub.chars().count() >= minn && seen.insert(sub.clone()) {
                out.push(sub.clone());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encoder(rules: &[(&str, &str)]) -> BpeEncoder {
        let mut codes = HashMap::new();
        for (rank, (l, r)) in rules.iter().enumerate() {
            codes.insert((l.to_string(), r.to_string()), rank as u32);
        }
        BpeEncoder { codes }
    }

    #[test]
    fn merges_follow_rank_order() {
        let enc = encoder(&[("a", "b"), ("ab", "c")]);
        let variants = enc.apply("abc", 10);
        // coarsest first: abc, then ab+c, then a+b+c
        assert_eq!(variants[0], vec!["abc"]);
        assert_eq!(variants[1], vec!["ab", "c"]);
        assert_eq!(variants[2], vec!["a", "b", "c"]);
    }

    #[test]
    fn variant_count_is_bounded() {
        let enc = encoder(&[("a", "b"), ("ab", "c")]);
        let variants = enc.apply("abc", 2);
        assert_eq!(variants.len(), 2);
        assert_eq!(variants[0], vec!["abc"]);
    }

    #[test]
    fn merge_applies_to_every_occurrence() {
        let enc = encoder(&[("a", "a")]);
        let variants = enc.apply("aaaa", 1);
        assert_eq!(variants[0], vec!["aa", "aa"]);
    }

    #[test]
    fn uniq_subwords_filters_short() {
        let enc = encoder(&[("a", "b"), ("ab", "c")]);
        let variants = enc.apply("abc", 10);
        let subs = uniq_subwords(&variants, 2);
        assert_eq!(subs, vec!["abc".to_string(), "ab".to_string()]);
    }

    #[test]
    fn unknown_pairs_leave_chars() {
        let enc = encoder(&[("x", "y")]);
        let variants = enc.apply("ab", 5);
        assert_eq!(variants, vec![vec!["a".to_string(), "b".to_string()]]);
    }

    #[test]
    fn save_load_round_trip() {
        let enc = encoder(&[("a", "b"), ("b", "c")]);
        let mut buf = Vec::new();
        enc.save(&mut buf).unwrap();
        let loaded = BpeEncoder::load(&mut Cursor::new(buf)).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.apply("ab", 1), enc.apply("ab", 1));
    }
}
