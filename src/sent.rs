//! In-memory shape of one corpus record: a target sentence plus parallel
//! other-language sentences, each holding words, phrases, concepts and a
//! dependency tree encoded as per-token parent offsets.

use std::borrow::Cow;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Deserialize;

/// Largest number of component words a phrase may reference.
pub const MAX_PHRASE_SIZE: usize = 10;

/// Bit widths of the packed `CompactWord` fields. Offsets that do not fit
/// are stored as 0 ("no neighbour"), never wrapped.
pub const SYNT_REL_BITS: u32 = 5;
pub const PARENT_OFFS_BITS: u32 = 8;
pub const AUX_OFFS_BITS: u32 = 6;

const SYNT_REL_SHIFT: u32 = 1;
const PARENT_OFFS_SHIFT: u32 = SYNT_REL_SHIFT + SYNT_REL_BITS;
const FIRST_CHILD_SHIFT: u32 = PARENT_OFFS_SHIFT + PARENT_OFFS_BITS;
const PREV_SIBLING_SHIFT: u32 = FIRST_CHILD_SHIFT + AUX_OFFS_BITS;
const NEXT_SIBLING_SHIFT: u32 = PREV_SIBLING_SHIFT + AUX_OFFS_BITS;

/// One token of a parsed sentence, packed into 32 bits of tree structure
/// plus the resolved vocabulary id (`-1` when out of vocabulary or
/// discarded by subsampling).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactWord {
    bits: u32,
    pub num: i32,
}

fn field_mask(width: u32) -> u32 {
    (1u32 << width) - 1
}

fn get_signed(bits: u32, shift: u32, width: u32) -> i32 {
    let raw = (bits >> shift) & field_mask(width);
    // sign-extend the `width`-bit field
    ((raw as i32) << (32 - width)) >> (32 - width)
}

fn set_signed(bits: &mut u32, shift: u32, width: u32, v: i32) {
    let clipped = offs_to_bits(v, width);
    *bits &= !(field_mask(width) << shift);
    *bits |= ((clipped as u32) & field_mask(width)) << shift;
}

/// Saturating offset compaction: a value outside the representable range
/// of a `width`-bit signed field becomes 0.
pub fn offs_to_bits(v: i32, width: u32) -> i32 {
    let max = (1i32 << (width - 1)) - 1;
    if v.abs() <= max {
        v
    } else {
        0
    }
}

impl CompactWord {
    pub fn is_phrase(&self) -> bool {
        self.bits & 1 != 0
    }

    pub fn set_is_phrase(&mut self, v: bool) {
        self.bits = (self.bits & !1) | (v as u32);
    }

    pub fn synt_rel(&self) -> u8 {
        ((self.bits >> SYNT_REL_SHIFT) & field_mask(SYNT_REL_BITS)) as u8
    }

    /// Relations beyond the field width collapse onto the last value; the
    /// compaction is lossy on purpose.
    pub fn set_synt_rel(&mut self, rel: u32) {
        let clipped = rel.min(field_mask(SYNT_REL_BITS));
        self.bits &= !(field_mask(SYNT_REL_BITS) << SYNT_REL_SHIFT);
        self.bits |= clipped << SYNT_REL_SHIFT;
    }

    pub fn parent_offs(&self) -> i32 {
        get_signed(self.bits, PARENT_OFFS_SHIFT, PARENT_OFFS_BITS)
    }

    pub fn set_parent_offs(&mut self, v: i32) {
        set_signed(&mut self.bits, PARENT_OFFS_SHIFT, PARENT_OFFS_BITS, v);
    }

    pub fn first_child_offs(&self) -> i32 {
        get_signed(self.bits, FIRST_CHILD_SHIFT, AUX_OFFS_BITS)
    }

    pub fn set_first_child_offs(&mut self, v: i32) {
        set_signed(&mut self.bits, FIRST_CHILD_SHIFT, AUX_OFFS_BITS, v);
    }

    pub fn prev_sibling_offs(&self) -> i32 {
        get_signed(self.bits, PREV_SIBLING_SHIFT, AUX_OFFS_BITS)
    }

    pub fn set_prev_sibling_offs(&mut self, v: i32) {
        set_signed(&mut self.bits, PREV_SIBLING_SHIFT, AUX_OFFS_BITS, v);
    }

    pub fn next_sibling_offs(&self) -> i32 {
        get_signed(self.bits, NEXT_SIBLING_SHIFT, AUX_OFFS_BITS)
    }

    pub fn set_next_sibling_offs(&mut self, v: i32) {
        set_signed(&mut self.bits, NEXT_SIBLING_SHIFT, AUX_OFFS_BITS, v);
    }
}

// ---------------------------------------------------------------------
// Rich line model: strings borrowed from the parsed buffer.

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Word<'a> {
    /// Surface form.
    #[serde(rename = "w", borrow)]
    pub surface: Cow<'a, str>,
    /// Stable id; the surface form doubles as the id when absent.
    #[serde(rename = "i", borrow, default)]
    pub id: Option<Cow<'a, str>>,
    #[serde(rename = "p", default)]
    pub pos_tag: u8,
    #[serde(rename = "l", default)]
    pub parent_offs: i16,
    #[serde(rename = "n", default)]
    pub synt_rel: u8,
}

impl<'a> Word<'a> {
    pub fn word_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.surface)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Phrase<'a> {
    #[serde(rename = "w", borrow)]
    pub surface: Cow<'a, str>,
    #[serde(rename = "i", borrow, default)]
    pub id: Option<Cow<'a, str>>,
    #[serde(rename = "p", default)]
    pub pos_tag: u8,
    #[serde(rename = "l", default)]
    pub parent_offs: i16,
    #[serde(rename = "n", default)]
    pub synt_rel: u8,
    /// Positions of the component words in the sentence's word array.
    #[serde(rename = "C", default)]
    pub components: Vec<i16>,
}

impl<'a> Phrase<'a> {
    pub fn word_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.surface)
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Sent<'a> {
    #[serde(borrow, default)]
    pub words: Vec<Word<'a>>,
    #[serde(borrow, default)]
    pub phrases: Vec<Phrase<'a>>,
    #[serde(borrow, default)]
    pub concepts: Vec<Cow<'a, str>>,
    #[serde(default)]
    pub origin: u8,
    #[serde(default)]
    pub words_mapping: Vec<i16>,
    #[serde(default)]
    pub phrases_mapping: Vec<i16>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Line<'a> {
    #[serde(borrow, default)]
    pub target: Sent<'a>,
    #[serde(borrow, default)]
    pub other_langs: Vec<Sent<'a>>,
}

// ---------------------------------------------------------------------
// Compact line model: ids only, reusable across lines.

#[derive(Debug, Default)]
pub struct CompactSent {
    pub words: Vec<CompactWord>,
    pub phrases: Vec<CompactWord>,
    pub concepts: Vec<i32>,
}

impl CompactSent {
    pub fn reset(&mut self) {
        self.words.clear();
        self.phrases.clear();
        self.concepts.clear();
    }
}

#[derive(Debug, Default)]
pub struct OtherCompactSent {
    pub sent: CompactSent,
    /// Position of the aligned target token per index, `-1` when unaligned.
    pub mapping_to_target_words: Vec<i16>,
    pub mapping_to_target_phrases: Vec<i16>,
}

impl OtherCompactSent {
    pub fn reset(&mut self) {
        self.sent.reset();
        self.mapping_to_target_words.clear();
        self.mapping_to_target_phrases.clear();
    }
}

#[derive(Debug, Default)]
pub struct CompactLine {
    pub target: CompactSent,
    pub other_langs: Vec<OtherCompactSent>,
}

impl CompactLine {
    pub fn reset(&mut self) {
        self.target.reset();
        self.other_langs.clear();
    }
}

fn compute_offs(head_pos: usize, dep_pos: usize) -> i32 {
    offs_to_bits(head_pos as i32 - dep_pos as i32, AUX_OFFS_BITS)
}

/// Derive first-child and sibling links from the parent offsets. Siblings
/// are chained in sentence order; a head's `first_child_offs` points at its
/// leftmost dependent.
pub fn make_aux_offs(words: &mut [CompactWord]) {
    for i in 0..words.len() {
        let mut prev_sibling_pos: Option<usize> = None;
        for j in 0..words.len() {
            let parent = j as i32 + words[j].parent_offs();
            if i == j || parent != i as i32 {
                continue;
            }
            if words[i].first_child_offs() == 0 {
                let offs = compute_offs(j, i);
                words[i].set_first_child_offs(offs);
            }
            if let Some(prev) = prev_sibling_pos {
                let back = compute_offs(prev, j);
                words[j].set_prev_sibling_offs(back);
                let fwd = compute_offs(j, prev);
                words[prev].set_next_sibling_offs(fwd);
            }
            prev_sibling_pos = Some(j);
        }
    }
}

pub fn make_aux_offs_line(line: &mut CompactLine) {
    make_aux_offs(&mut line.target.words);
    make_aux_offs(&mut line.target.phrases);
    for os in &mut line.other_langs {
        make_aux_offs(&mut os.sent.words);
        make_aux_offs(&mut os.sent.phrases);
    }
}

fn fill_mapping(mapping: &mut Vec<i16>, other_len: usize, target_len: usize, rng: &mut StdRng) {
    mapping.clear();
    mapping.resize(other_len, -1);
    let n = other_len.min(target_len);
    let mut perm: Vec<i16> = (0..n as i16).collect();
    perm.shuffle(rng);
    mapping[..n].copy_from_slice(&perm);
}

/// When the corpus carries no alignments, pair the first
/// `min(|other|, |target|)` positions in random order. Noise, but it still
/// couples the spaces of the two languages.
pub fn fill_other_mapping_randomly(line: &mut CompactLine, rng: &mut StdRng) {
    let target_words = line.target.words.len();
    let target_phrases = line.target.phrases.len();
    for os in &mut line.other_langs {
        fill_mapping(
            &mut os.mapping_to_target_words,
            os.sent.words.len(),
            target_words,
            rng,
        );
        fill_mapping(
            &mut os.mapping_to_target_phrases,
            os.sent.phrases.len(),
            target_phrases,
            rng,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn packed_fields_are_independent() {
        let mut w = CompactWord::default();
        w.set_is_phrase(true);
        w.set_synt_rel(17);
        w.set_parent_offs(-3);
        w.set_first_child_offs(5);
        w.set_prev_sibling_offs(-1);
        w.set_next_sibling_offs(2);
        assert!(w.is_phrase());
        assert_eq!(w.synt_rel(), 17);
        assert_eq!(w.parent_offs(), -3);
        assert_eq!(w.first_child_offs(), 5);
        assert_eq!(w.prev_sibling_offs(), -1);
        assert_eq!(w.next_sibling_offs(), 2);
    }

    #[test]
    fn offsets_saturate_to_zero() {
        let mut w = CompactWord::default();
        w.set_parent_offs(200);
        assert_eq!(w.parent_offs(), 0);
        w.set_parent_offs(-127);
        assert_eq!(w.parent_offs(), -127);
        w.set_parent_offs(-128);
        assert_eq!(w.parent_offs(), 0);
        w.set_first_child_offs(32);
        assert_eq!(w.first_child_offs(), 0);
        w.set_first_child_offs(31);
        assert_eq!(w.first_child_offs(), 31);
    }

    #[test]
    fn synt_rel_clips_to_field_max() {
        let mut w = CompactWord::default();
        w.set_synt_rel(40);
        assert_eq!(w.synt_rel(), 31);
    }

    fn word_with_parent(offs: i32) -> CompactWord {
        let mut w = CompactWord::default();
        w.set_parent_offs(offs);
        w
    }

    #[test]
    fn aux_offsets_link_children_and_siblings() {
        // 0 <- 1, 0 <- 2, 0 <- 3 (root at 0)
        let mut words = vec![
            word_with_parent(0),
            word_with_parent(-1),
            word_with_parent(-2),
            word_with_parent(-3),
        ];
        make_aux_offs(&mut words);

        assert_eq!(words[0].first_child_offs(), 1);
        assert_eq!(words[1].next_sibling_offs(), 1);
        assert_eq!(words[2].prev_sibling_offs(), -1);
        assert_eq!(words[2].next_sibling_offs(), 1);
        assert_eq!(words[3].prev_sibling_offs(), -1);
        assert_eq!(words[3].next_sibling_offs(), 0);

        // walking parent then first child then siblings reaches each dependent
        for i in 1..words.len() {
            let head = (i as i32 + words[i].parent_offs()) as usize;
            assert_ne!(words[head].first_child_offs(), 0);
            let mut pos = head as i32 + words[head].first_child_offs();
            let mut found = false;
            loop {
                if pos == i as i32 {
                    found = true;
                    break;
                }
                let next = words[pos as usize].next_sibling_offs();
                if next == 0 {
                    break;
                }
                pos += next;
            }
            assert!(found, "dependent {i} unreachable from head {head}");
        }
    }

    #[test]
    fn random_mapping_is_a_permutation() {
        let mut line = CompactLine::default();
        line.target.words = vec![CompactWord::default(); 5];
        let mut os = OtherCompactSent::default();
        os.sent.words = vec![CompactWord::default(); 7];
        line.other_langs.push(os);

        let mut rng = StdRng::seed_from_u64(11);
        fill_other_mapping_randomly(&mut line, &mut rng);

        let mapping = &line.other_langs[0].mapping_to_target_words;
        assert_eq!(mapping.len(), 7);
        let mut seen: Vec<i16> = mapping[..5].to_vec();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(&mapping[5..], &[-1, -1]);
    }
}
