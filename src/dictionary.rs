//! The multi-type hashed vocabulary: words keyed by `(string, POS)`,
//! plus labels, phrases, knowledge-base concepts and BPE subwords, all in
//! one open-addressed table so an id is a row in the embedding matrices.

use std::collections::HashMap;
use std::io::{BufRead, Read, Write};

use rand::rngs::StdRng;
use rand::Rng;
use tracing::{debug, info};

use crate::args::{Args, ModelName};
use crate::binio;
use crate::bpe::{uniq_subwords, BpeEncoder};
use crate::error::{Error, Result};
use crate::parser::{self, Resolve};
use crate::real;
use crate::sent::{
    fill_other_mapping_randomly, make_aux_offs_line, CompactLine, CompactSent, Line, Phrase,
    Sent, Word,
};

pub const EOS: &str = "</s>";
pub const BOW: &str = "<";
pub const EOW: &str = ">";

/// Upper bound on the open-addressed index. The table is flat by design:
/// probing it is the innermost operation of both parsing and training.
pub const MAX_VOCAB_SIZE: usize = 150_000_000;
const MAX_LINE_SIZE: i32 = 1024;
const MAX_LOAD_FACTOR: f64 = 0.75;
const NGRAM_HASH_MULTIPLIER: u64 = 116_049_371;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum EntryKind {
    Word = 1,
    Label = 2,
    Phrase = 4,
    KbConcept = 8,
    Subword = 16,
}

impl EntryKind {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(EntryKind::Word),
            2 => Ok(EntryKind::Label),
            4 => Ok(EntryKind::Phrase),
            8 => Ok(EntryKind::KbConcept),
            16 => Ok(EntryKind::Subword),
            _ => Err(Error::format(format!("unknown entry kind {v}"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EntryKind::Word => "word",
            EntryKind::Label => "label",
            EntryKind::Phrase => "phrase",
            EntryKind::KbConcept => "concept",
            EntryKind::Subword => "subword",
        }
    }
}

/// A set of entry kinds, so lookups can say "a word or a phrase".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindSet(pub u8);

impl KindSet {
    pub const ALL: KindSet = KindSet(255);

    pub fn contains(self, kind: EntryKind) -> bool {
        self.0 & kind as u8 != 0
    }
}

impl From<EntryKind> for KindSet {
    fn from(kind: EntryKind) -> Self {
        KindSet(kind as u8)
    }
}

impl std::ops::BitOr for EntryKind {
    type Output = KindSet;

    fn bitor(self, rhs: EntryKind) -> KindSet {
        KindSet(self as u8 | rhs as u8)
    }
}

impl std::ops::BitOr<EntryKind> for KindSet {
    type Output = KindSet;

    fn bitor(self, rhs: EntryKind) -> KindSet {
        KindSet(self.0 | rhs as u8)
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    /// Stable id string the entry is keyed by.
    pub word: String,
    /// Surface form, kept only in memory for subword extraction.
    pub surface: String,
    pub pos_tag: u8,
    pub count: i64,
    pub kind: EntryKind,
    /// Feature ids used when this entry is an input: the entry itself
    /// first, then its subwords (or component words for phrases).
    pub subwords: Vec<i32>,
    /// Persisted hashes of the subwords / components; ids are rebuilt from
    /// these at load time.
    pub hashes: Vec<u32>,
}

/// 32-bit FNV-1a with each byte sign-extended before the XOR, matching the
/// historical signed-char hashing of previously released models.
pub fn hash(word: &str) -> u32 {
    let mut h: u32 = 2_166_136_261;
    for &b in word.as_bytes() {
        h ^= b as i8 as i32 as u32;
        h = h.wrapping_mul(16_777_619);
    }
    h
}

pub fn hash_pos(word: &str, pos_tag: u8) -> u32 {
    let mut h = hash(word);
    if pos_tag > 0 {
        h ^= (pos_tag as u32) << 6;
        h = h.wrapping_mul(16_777_619);
    }
    h
}

pub struct Dictionary {
    args: Args,
    word2int: Vec<i32>,
    words: Vec<Entry>,
    pdiscard: Vec<real>,
    size: i32,
    nwords: i32,
    nlabels: i32,
    nsubwords: i32,
    nphrases: i32,
    nkbconcepts: i32,
    ntokens: i64,
    pruneidx_size: i64,
    pruneidx: HashMap<i32, i32>,
    encoder: BpeEncoder,
}

impl Dictionary {
    pub fn new(args: Args) -> Result<Self> {
        let encoder = if args.bpe_codes_path.as_os_str().is_empty() {
            BpeEncoder::new()
        } else {
            BpeEncoder::from_codes_file(&args.bpe_codes_path)?
        };
        Ok(Self::with_buckets(args, encoder, MAX_VOCAB_SIZE))
    }

    /// The bucket count is parameterizable so tests need not allocate the
    /// full production table; semantics are unchanged.
    pub fn with_buckets(args: Args, encoder: BpeEncoder, nbuckets: usize) -> Self {
        Dictionary {
            args,
            word2int: vec![-1; nbuckets],
            words: Vec::new(),
            pdiscard: Vec::new(),
            size: 0,
            nwords: 0,
            nlabels: 0,
            nsubwords: 0,
            nphrases: 0,
            nkbconcepts: 0,
            ntokens: 0,
            pruneidx_size: -1,
            pruneidx: HashMap::new(),
            encoder,
        }
    }

    pub fn size(&self) -> i32 {
        self.size
    }

    pub fn size_of(&self, kinds: KindSet) -> i32 {
        let mut sz = 0;
        if kinds.contains(EntryKind::Word) {
            sz += self.nwords;
        }
        if kinds.contains(EntryKind::Phrase) {
            sz += self.nphrases;
        }
        if kinds.contains(EntryKind::Label) {
            sz += self.nlabels;
        }
        if kinds.contains(EntryKind::KbConcept) {
            sz += self.nkbconcepts;
        }
        if kinds.contains(EntryKind::Subword) {
            sz += self.nsubwords;
        }
        sz
    }

    pub fn nwords(&self) -> i32 {
        self.nwords
    }

    pub fn nlabels(&self) -> i32 {
        self.nlabels
    }

    pub fn ntokens(&self) -> i64 {
        self.ntokens
    }

    pub fn is_pruned(&self) -> bool {
        self.pruneidx_size >= 0
    }

    // -----------------------------------------------------------------
    // Lookup

    /// Linear probe for `(word, pos, kind in kinds)`. Returns the bucket
    /// holding the entry, or the empty bucket where it would be inserted.
    fn find(&self, word: &str, pos_tag: u8, kinds: KindSet) -> usize {
        self.find_hashed(word, hash_pos(word, pos_tag), pos_tag, kinds)
    }

    fn find_hashed(&self, word: &str, h: u32, pos_tag: u8, kinds: KindSet) -> usize {
        let nbuckets = self.word2int.len();
        let mut bucket = h as usize % nbuckets;
        loop {
            let id = self.word2int[bucket];
            if id == -1 {
                return bucket;
            }
            let e = &self.words[id as usize];
            let matches = if word.is_empty() {
                hash_pos(&e.word, e.pos_tag) == h && kinds.contains(e.kind)
            } else {
                e.word == word && e.pos_tag == pos_tag && kinds.contains(e.kind)
            };
            if matches {
                return bucket;
            }
            bucket = (bucket + 1) % nbuckets;
        }
    }

    fn find_by_hash(&self, h: u32, kinds: KindSet) -> usize {
        self.find_hashed("", h, 0, kinds)
    }

    pub fn get_id(&self, word: &str, pos_tag: u8, kinds: KindSet) -> i32 {
        self.word2int[self.find(word, pos_tag, kinds)]
    }

    pub fn get_kind(&self, id: i32) -> EntryKind {
        self.words[id as usize].kind
    }

    fn kind_of_token(&self, token: &str) -> EntryKind {
        if token.starts_with(&self.args.label) {
            EntryKind::Label
        } else {
            EntryKind::Word
        }
    }

    pub fn get_word(&self, id: i32) -> &str {
        &self.words[id as usize].word
    }

    pub fn get_pos(&self, id: i32) -> u8 {
        self.words[id as usize].pos_tag
    }

    pub fn get_label(&self, lid: i32) -> Result<&str> {
        if lid < 0 || lid >= self.nlabels {
            return Err(Error::runtime(format!(
                "label id is out of range [0, {}]",
                self.nlabels
            )));
        }
        Ok(&self.words[(lid + self.nwords) as usize].word)
    }

    pub fn get_subwords(&self, id: i32) -> &[i32] {
        &self.words[id as usize].subwords
    }

    /// Feature ids for an arbitrary query string: the entry's own features
    /// when it is known, else whatever of its BPE subwords are in the
    /// vocabulary.
    pub fn subwords_of(&self, word: &str, pos_tag: u8) -> Vec<i32> {
        let id = self.get_id(word, pos_tag, KindSet::ALL);
        if id >= 0 {
            return self.words[id as usize].subwords.clone();
        }
        let mut ngrams = Vec::new();
        if word != EOS {
            self.compute_subwords(word, &mut ngrams);
        }
        ngrams
    }

    pub fn subwords_with_strings(&self, word: &str) -> (Vec<i32>, Vec<String>) {
        let mut ngrams = Vec::new();
        let mut substrings = Vec::new();
        let id = self.get_id(word, 0, KindSet::ALL);
        if id >= 0 {
            ngrams.push(id);
            substrings.push(self.words[id as usize].word.clone());
        }
        if word != EOS {
            for sub in self.extract_subwords(word) {
                let bucket = self.find(&sub, 0, EntryKind::Subword.into());
                if self.word2int[bucket] >= 0 {
                    ngrams.push(self.word2int[bucket]);
                    substrings.push(sub);
                }
            }
        }
        (ngrams, substrings)
    }

    fn extract_subwords(&self, s: &str) -> Vec<String> {
        let variants = self.encoder.apply(s, self.args.max_bpe_vars.max(1) as usize);
        uniq_subwords(&variants, self.args.minn.max(0) as usize)
    }

    fn compute_subwords(&self, word: &str, ngrams: &mut Vec<i32>) {
        for sub in self.extract_subwords(word) {
            let bucket = self.find(&sub, 0, EntryKind::Subword.into());
            if self.word2int[bucket] >= 0 {
                ngrams.push(self.word2int[bucket]);
            }
        }
    }

    // -----------------------------------------------------------------
    // Construction

    fn insert(&mut self, bucket: usize, entry: Entry) -> i32 {
        let id = self.size;
        self.words.push(entry);
        self.word2int[bucket] = id;
        self.size += 1;
        id
    }

    /// Insert-or-increment a bare token; the kind comes from the label
    /// prefix. Used by the pretrained-vector and supervised text paths.
    pub fn add(&mut self, token: &str) {
        let kind = self.kind_of_token(token);
        let bucket = self.find(token, 0, kind.into());
        self.ntokens += 1;
        if self.word2int[bucket] == -1 {
            self.insert(
                bucket,
                Entry {
                    word: token.to_string(),
                    surface: token.to_string(),
                    pos_tag: 0,
                    count: 1,
                    kind,
                    subwords: Vec::new(),
                    hashes: Vec::new(),
                },
            );
        } else {
            self.words[self.word2int[bucket] as usize].count += 1;
        }
    }

    pub fn add_word(&mut self, w: &Word<'_>) {
        let word_id = w.word_id();
        let h = hash_pos(word_id, w.pos_tag);
        let bucket = self.find_hashed(word_id, h, w.pos_tag, EntryKind::Word.into());
        self.ntokens += 1;
        if self.word2int[bucket] == -1 {
            self.insert(
                bucket,
                Entry {
                    word: word_id.to_string(),
                    surface: w.surface.to_string(),
                    pos_tag: w.pos_tag,
                    count: 1,
                    kind: EntryKind::Word,
                    subwords: Vec::new(),
                    hashes: Vec::new(),
                },
            );
        } else {
            self.words[self.word2int[bucket] as usize].count += 1;
        }
    }

    /// Phrases also record the hash and current id of each component word
    /// so the phrase stays decomposable after reload.
    pub fn add_phrase(&mut self, p: &Phrase<'_>, words: &[Word<'_>]) -> Result<()> {
        if p.components.len() > self.args.max_phrase_size as usize {
            return Err(Error::format(format!(
                "phrase {:?} has {} components, at most {} allowed",
                p.word_id(),
                p.components.len(),
                self.args.max_phrase_size
            )));
        }
        let word_id = p.word_id();
        let h = hash(word_id);
        let bucket = self.find_hashed(word_id, h, 0, EntryKind::Phrase.into());
        self.ntokens += 1;
        if self.word2int[bucket] == -1 {
            let mut hashes = Vec::with_capacity(p.components.len());
            let mut subwords = Vec::with_capacity(p.components.len());
            for &c in &p.components {
                let w = words.get(c as usize).ok_or_else(|| {
                    Error::format(format!(
                        "phrase {:?} references word position {c} outside the sentence",
                        word_id
                    ))
                })?;
                let wh = hash_pos(w.word_id(), w.pos_tag);
                hashes.push(wh);
                let wb = self.find_hashed(w.word_id(), wh, w.pos_tag, EntryKind::Word.into());
                subwords.push(self.word2int[wb]);
            }
            self.insert(
                bucket,
                Entry {
                    word: word_id.to_string(),
                    surface: p.surface.to_string(),
                    pos_tag: 0,
                    count: 1,
                    kind: EntryKind::Phrase,
                    subwords,
                    hashes,
                },
            );
        } else {
            self.words[self.word2int[bucket] as usize].count += 1;
        }
        Ok(())
    }

    pub fn add_concept(&mut self, concept: &str) {
        let h = hash(concept);
        let bucket = self.find_hashed(concept, h, 0, EntryKind::KbConcept.into());
        if self.word2int[bucket] == -1 {
            self.insert(
                bucket,
                Entry {
                    word: concept.to_string(),
                    surface: concept.to_string(),
                    pos_tag: 0,
                    count: 1,
                    kind: EntryKind::KbConcept,
                    subwords: Vec::new(),
                    hashes: Vec::new(),
                },
            );
        } else {
            self.words[self.word2int[bucket] as usize].count += 1;
        }
    }

    fn add_subword(&mut self, subword: &str) -> (u32, i32) {
        let h = hash(subword);
        let bucket = self.find_hashed(subword, h, 0, EntryKind::Subword.into());
        let id = if self.word2int[bucket] == -1 {
            self.nsubwords += 1;
            self.insert(
                bucket,
                Entry {
                    word: subword.to_string(),
                    surface: subword.to_string(),
                    pos_tag: 0,
                    count: 1,
                    kind: EntryKind::Subword,
                    subwords: Vec::new(),
                    hashes: Vec::new(),
                },
            )
        } else {
            let id = self.word2int[bucket];
            self.words[id as usize].count += 1;
            id
        };
        (h, id)
    }

    pub fn add_sent(&mut self, sent: &Sent<'_>) -> Result<()> {
        for w in &sent.words {
            self.add_word(w);
            if self.ntokens % 1_000_000 == 0 && self.args.verbose > 1 {
                debug!("read {}M tokens", self.ntokens / 1_000_000);
            }
        }
        for p in &sent.phrases {
            if p.components.is_empty() {
                continue;
            }
            self.add_phrase(p, &sent.words)?;
        }
        for c in &sent.concepts {
            self.add_concept(c);
        }
        Ok(())
    }

    pub fn add_line(&mut self, line: &Line<'_>) -> Result<()> {
        self.add_sent(&line.target)?;
        for os in &line.other_langs {
            self.add_sent(os)?;
        }
        Ok(())
    }

    fn over_load_factor(&self) -> bool {
        self.size as f64 > MAX_LOAD_FACTOR * self.word2int.len() as f64
    }

    /// Stream a JSON corpus, then threshold, build subwords and the
    /// discard table. The dictionary is frozen afterwards.
    pub fn read_from_file<R: BufRead>(&mut self, reader: R) -> Result<()> {
        let mut min_threshold: i64 = 1;
        for (lineno, json) in reader.lines().enumerate() {
            let json = json?;
            if json.trim().is_empty() {
                continue;
            }
            let line = parser::parse_line(&json)
                .map_err(|e| Error::format(format!("line {}: {e}", lineno + 1)))?;
            self.add_line(&line)
                .map_err(|e| Error::format(format!("line {}: {e}", lineno + 1)))?;
            if self.over_load_factor() {
                min_threshold += 1;
                self.threshold(min_threshold, min_threshold);
            }
        }
        self.threshold(self.args.min_count, self.args.min_count_label);
        info!(nwords = self.nwords, "thresholded vocabulary");

        self.init_subwords()?;
        self.init_table_discard();
        if self.args.verbose > 0 {
            info!(
                tokens = self.ntokens,
                words = self.nwords,
                labels = self.nlabels,
                phrases = self.nphrases,
                concepts = self.nkbconcepts,
                subwords = self.nsubwords,
                "dictionary ready"
            );
        }
        if self.size == 0 {
            return Err(Error::config(
                "empty vocabulary; try a smaller -minCount value".to_string(),
            ));
        }
        Ok(())
    }

    fn rebuild_index(&mut self) {
        self.word2int.fill(-1);
        self.size = 0;
        self.nwords = 0;
        self.nlabels = 0;
        self.nsubwords = 0;
        self.nphrases = 0;
        self.nkbconcepts = 0;
        for i in 0..self.words.len() {
            let e = &self.words[i];
            let bucket = self.find(&e.word, e.pos_tag, e.kind.into());
            self.word2int[bucket] = self.size;
            self.size += 1;
            match self.words[i].kind {
                EntryKind::Word => self.nwords += 1,
                EntryKind::Label => self.nlabels += 1,
                EntryKind::Subword => self.nsubwords += 1,
                EntryKind::Phrase => self.nphrases += 1,
                EntryKind::KbConcept => self.nkbconcepts += 1,
            }
        }
    }

    /// Sort entries by kind then descending count and drop the rare ones:
    /// non-labels below `t`, labels below `tl`.
    pub fn threshold(&mut self, t: i64, tl: i64) {
        debug!(word_cnt = t, label_cnt = tl, "thresholding dictionary");
        self.words
            .sort_by_key(|e| (e.kind, std::cmp::Reverse(e.count)));
        self.words.retain(|e| {
            if e.kind == EntryKind::Label {
                e.count >= tl
            } else {
                e.count >= t
            }
        });
        self.words.shrink_to_fit();
        self.rebuild_index();
    }

    /// Keep probability for frequent-token subsampling, defined for words
    /// and phrases; every other kind is always kept.
    pub fn init_table_discard(&mut self) {
        self.pdiscard.clear();
        self.pdiscard.resize(self.size as usize, 1.0);
        for (i, e) in self.words.iter().enumerate() {
            if e.kind == EntryKind::Word || e.kind == EntryKind::Phrase {
                let f = e.count as f64 / self.ntokens as f64;
                let p = (self.args.t / f).sqrt() + self.args.t / f;
                self.pdiscard[i] = p.min(1.0) as real;
            }
        }
    }

    pub fn discard(&self, id: i32, rand: real) -> bool {
        debug_assert!(id >= 0);
        if self.args.model == ModelName::Sup {
            return false;
        }
        rand > self.pdiscard.get(id as usize).copied().unwrap_or(1.0)
    }

    pub fn pdiscard(&self, id: i32) -> real {
        self.pdiscard.get(id as usize).copied().unwrap_or(1.0)
    }

    /// Run the BPE encoder over every word's surface and register the
    /// subwords as vocabulary entries; each word's feature list becomes
    /// `[itself, subword...]`. Phrase component ids are refreshed from
    /// their hashes afterwards, since thresholding renumbered the words
    /// recorded at parse time.
    pub fn init_subwords(&mut self) -> Result<()> {
        let sz = self.size;
        for i in 0..sz {
            if self.words[i as usize].kind != EntryKind::Word {
                continue;
            }
            self.words[i as usize].subwords.clear();
            self.words[i as usize].subwords.push(i);
            if self.words[i as usize].surface == EOS {
                continue;
            }
            let surface = self.words[i as usize].surface.clone();
            for sub in self.extract_subwords(&surface) {
                let (h, id) = self.add_subword(&sub);
                self.words[i as usize].subwords.push(id);
                self.words[i as usize].hashes.push(h);
                if self.over_load_factor() {
                    return Err(Error::runtime(
                        "vocabulary table overflow while building subwords".to_string(),
                    ));
                }
            }
        }
        // phrases, concepts and the fresh subword entries get the same
        // feature lists a reload would give them
        for i in 0..self.size {
            match self.words[i as usize].kind {
                EntryKind::Phrase => {
                    let hashes = std::mem::take(&mut self.words[i as usize].hashes);
                    let mut subwords = Vec::with_capacity(hashes.len() + 1);
                    subwords.push(i);
                    for &h in &hashes {
                        let bucket = self.find_by_hash(h, EntryKind::Word.into());
                        let id = self.word2int[bucket];
                        if id != -1 {
                            subwords.push(id);
                        }
                    }
                    self.words[i as usize].hashes = hashes;
                    self.words[i as usize].subwords = subwords;
                }
                EntryKind::KbConcept | EntryKind::Subword => {
                    self.words[i as usize].subwords = vec![i];
                }
                EntryKind::Word | EntryKind::Label => {}
            }
        }
        Ok(())
    }

    /// Rebuild the feature lists from the persisted hashes; runs on every
    /// load instead of re-applying the encoder.
    pub fn init_subwords_pos(&mut self) {
        for i in 0..self.size {
            if self.words[i as usize].kind == EntryKind::Label {
                continue;
            }
            let find_kind = if self.words[i as usize].kind == EntryKind::Phrase {
                EntryKind::Word
            } else {
                EntryKind::Subword
            };
            let hashes = std::mem::take(&mut self.words[i as usize].hashes);
            let mut subwords = Vec::with_capacity(hashes.len() + 1);
            subwords.push(i);
            for &h in &hashes {
                let bucket = self.find_by_hash(h, find_kind.into());
                let id = self.word2int[bucket];
                if id != -1 {
                    subwords.push(id);
                }
            }
            self.words[i as usize].hashes = hashes;
            self.words[i as usize].subwords = subwords;
        }
    }

    /// Char-bracketed subword rebuild used after pruning.
    fn init_ngrams(&mut self) {
        for i in 0..self.size {
            self.words[i as usize].subwords.clear();
            self.words[i as usize].subwords.push(i);
            if self.words[i as usize].word == EOS {
                continue;
            }
            let bracketed = format!("{BOW}{}{EOW}", self.words[i as usize].word);
            let mut ngrams = Vec::new();
            self.compute_subwords(&bracketed, &mut ngrams);
            self.words[i as usize].subwords.extend(ngrams);
        }
    }

    pub fn get_counts(&self, kinds: KindSet) -> Vec<i64> {
        self.words
            .iter()
            .filter(|e| kinds.contains(e.kind))
            .map(|e| e.count)
            .collect()
    }

    // -----------------------------------------------------------------
    // Line reading

    /// Parse one JSON record into a compact line, derive tree links, fill
    /// missing alignments, then subsample. Returns the number of
    /// in-vocabulary tokens seen.
    pub fn get_line_compact(
        &self,
        json: &str,
        line: &mut CompactLine,
        rng: &mut StdRng,
    ) -> Result<i32> {
        parser::parse_compact_line(json, self, line)?;
        make_aux_offs_line(line);
        if !line.other_langs.is_empty()
            && line.other_langs[0].mapping_to_target_words.is_empty()
        {
            fill_other_mapping_randomly(line, rng);
        }

        let mut ntokens = 0;
        let mut finish = |sent: &mut CompactSent, rng: &mut StdRng| {
            for w in &mut sent.words {
                if w.num >= 0 {
                    ntokens += 1;
                    if self.discard(w.num, rng.gen::<f64>() as real) {
                        w.num = -1;
                    }
                }
            }
            for p in &mut sent.phrases {
                if p.is_phrase() && p.num >= 0 {
                    ntokens += 1;
                    if self.discard(p.num, rng.gen::<f64>() as real) {
                        p.num = -1;
                    }
                }
            }
        };
        finish(&mut line.target, rng);
        for os in &mut line.other_langs {
            finish(&mut os.sent, rng);
        }
        Ok(ntokens)
    }

    /// Plain-text line as subsampled word ids, for the bag-of-words
    /// training path.
    pub fn get_line_words(
        &self,
        text: &str,
        words: &mut Vec<i32>,
        rng: &mut StdRng,
    ) -> i32 {
        let mut ntokens = 0;
        words.clear();
        for token in text.split_whitespace().chain(std::iter::once(EOS)) {
            let wid = self.get_id(token, 0, KindSet::ALL);
            if wid < 0 {
                continue;
            }
            ntokens += 1;
            if self.get_kind(wid) == EntryKind::Word && !self.discard(wid, rng.gen::<f64>() as real)
            {
                words.push(wid);
            }
            if ntokens > MAX_LINE_SIZE {
                break;
            }
        }
        ntokens
    }

    /// Supervised text line: whitespace tokens plus a terminating EOS,
    /// split into word features (with n-gram buckets) and label ids.
    pub fn get_line_labels(
        &self,
        text: &str,
        words: &mut Vec<i32>,
        labels: &mut Vec<i32>,
    ) -> i32 {
        let mut word_hashes = Vec::new();
        let mut ntokens = 0;
        words.clear();
        labels.clear();
        for token in text.split_whitespace().chain(std::iter::once(EOS)) {
            let h = hash(token);
            let bucket = self.find_hashed(token, h, 0, KindSet::ALL);
            let wid = self.word2int[bucket];
            let kind = if wid < 0 {
                self.kind_of_token(token)
            } else {
                self.get_kind(wid)
            };
            ntokens += 1;
            if kind == EntryKind::Word {
                self.add_features(words, token, wid);
                word_hashes.push(h);
            } else if kind == EntryKind::Label && wid >= 0 {
                labels.push(wid - self.nwords);
            }
        }
        self.add_word_ngrams(words, &word_hashes, self.args.word_ngrams);
        ntokens
    }

    fn add_features(&self, line: &mut Vec<i32>, token: &str, wid: i32) {
        if wid < 0 {
            if token != EOS {
                let bracketed = format!("{BOW}{token}{EOW}");
                self.compute_subwords(&bracketed, line);
            }
        } else if self.args.maxn <= 0 {
            line.push(wid);
        } else {
            line.extend_from_slice(self.get_subwords(wid));
        }
    }

    fn add_word_ngrams(&self, line: &mut Vec<i32>, hashes: &[u32], n: i32) {
        for i in 0..hashes.len() {
            let mut h = hashes[i] as u64;
            for j in i + 1..hashes.len().min(i + n.max(0) as usize) {
                h = h
                    .wrapping_mul(NGRAM_HASH_MULTIPLIER)
                    .wrapping_add(hashes[j] as u64);
                self.push_hash(line, (h % self.args.bucket as u64) as i32);
            }
        }
    }

    fn push_hash(&self, hashes: &mut Vec<i32>, mut id: i32) {
        if self.pruneidx_size == 0 || id < 0 {
            return;
        }
        if self.pruneidx_size > 0 {
            match self.pruneidx.get(&id) {
                Some(&mapped) => id = mapped,
                None => return,
            }
        }
        hashes.push(self.nwords + id);
    }

    // -----------------------------------------------------------------
    // Pruning

    /// Keep only the listed word ids (labels always survive) and remap
    /// n-gram bucket ids into a compact table.
    pub fn prune(&mut self, idx: &mut Vec<i32>) {
        let mut word_ids = Vec::new();
        let mut ngrams = Vec::new();
        for &i in idx.iter() {
            if i < self.nwords {
                word_ids.push(i);
            } else {
                ngrams.push(i);
            }
        }
        word_ids.sort_unstable();

        if !ngrams.is_empty() {
            for (j, &ngram) in ngrams.iter().enumerate() {
                self.pruneidx.insert(ngram - self.nwords, j as i32);
            }
        }
        self.pruneidx_size = self.pruneidx.len() as i64;

        idx.clear();
        idx.extend_from_slice(&word_ids);
        idx.extend_from_slice(&ngrams);

        self.word2int.fill(-1);
        let mut j = 0;
        let mut keep = 0usize;
        for i in 0..self.words.len() {
            let is_label = self.words[i].kind == EntryKind::Label;
            let listed = j < word_ids.len() && word_ids[j] == i as i32;
            if listed {
                j += 1;
            }
            if is_label || listed {
                self.words.swap(keep, i);
                let e = &self.words[keep];
                let bucket = self.find(&e.word, e.pos_tag, e.kind.into());
                self.word2int[bucket] = keep as i32;
                keep += 1;
            }
        }
        self.nwords = word_ids.len() as i32;
        self.size = self.nwords + self.nlabels;
        self.nphrases = 0;
        self.nkbconcepts = 0;
        self.nsubwords = 0;
        self.words.truncate(self.size as usize);
        self.init_ngrams();
    }

    // -----------------------------------------------------------------
    // Serialization

    pub fn save<W: Write>(&self, out: &mut W) -> Result<()> {
        binio::write_i32(out, self.size)?;
        binio::write_i32(out, self.nwords)?;
        binio::write_i32(out, self.nlabels)?;
        binio::write_i32(out, self.nsubwords)?;
        binio::write_i32(out, self.nphrases)?;
        binio::write_i32(out, self.nkbconcepts)?;
        binio::write_i64(out, self.ntokens)?;
        binio::write_i64(out, self.pruneidx_size)?;
        for e in &self.words {
            binio::write_cstr(out, &e.word)?;
            binio::write_u8(out, e.pos_tag)?;
            binio::write_u16(out, e.hashes.len() as u16)?;
            for &h in &e.hashes {
                binio::write_u32(out, h)?;
            }
            binio::write_i64(out, e.count)?;
            binio::write_u8(out, e.kind as u8)?;
        }
        for (&k, &v) in &self.pruneidx {
            binio::write_i32(out, k)?;
            binio::write_i32(out, v)?;
        }
        self.encoder.save(out)?;
        Ok(())
    }

    pub fn load<R: Read>(args: Args, inp: &mut R) -> Result<Self> {
        Self::load_with_buckets(args, inp, MAX_VOCAB_SIZE)
    }

    pub fn load_with_buckets<R: Read>(args: Args, inp: &mut R, nbuckets: usize) -> Result<Self> {
        let mut dict = Dictionary::with_buckets(args, BpeEncoder::new(), nbuckets);
        dict.size = binio::read_i32(inp)?;
        dict.nwords = binio::read_i32(inp)?;
        dict.nlabels = binio::read_i32(inp)?;
        dict.nsubwords = binio::read_i32(inp)?;
        dict.nphrases = binio::read_i32(inp)?;
        dict.nkbconcepts = binio::read_i32(inp)?;
        dict.ntokens = binio::read_i64(inp)?;
        dict.pruneidx_size = binio::read_i64(inp)?;
        dict.words.reserve(dict.size.max(0) as usize);
        for _ in 0..dict.size {
            let word = binio::read_cstr(inp)?;
            let pos_tag = binio::read_u8(inp)?;
            let nhashes = binio::read_u16(inp)?;
            let mut hashes = Vec::with_capacity(nhashes as usize);
            for _ in 0..nhashes {
                hashes.push(binio::read_u32(inp)?);
            }
            let count = binio::read_i64(inp)?;
            let kind = EntryKind::from_u8(binio::read_u8(inp)?)?;
            dict.words.push(Entry {
                word,
                surface: String::new(),
                pos_tag,
                count,
                kind,
                subwords: Vec::new(),
                hashes,
            });
        }
        for _ in 0..dict.pruneidx_size.max(0) {
            let first = binio::read_i32(inp)?;
            let second = binio::read_i32(inp)?;
            dict.pruneidx.insert(first, second);
        }
        dict.encoder = BpeEncoder::load(inp)?;

        dict.init_table_discard();
        for i in 0..dict.size {
            let e = &dict.words[i as usize];
            let bucket = dict.find(&e.word, e.pos_tag, e.kind.into());
            dict.word2int[bucket] = i;
        }
        dict.init_subwords_pos();
        info!(
            words = dict.nwords,
            phrases = dict.nphrases,
            concepts = dict.nkbconcepts,
            subwords = dict.nsubwords,
            tokens = dict.ntokens,
            "loaded dictionary"
        );
        Ok(dict)
    }

    pub fn dump<W: Write>(&self, out: &mut W) -> Result<()> {
        writeln!(out, "{}", self.words.len())?;
        for (num, e) in self.words.iter().enumerate() {
            let h = hash_pos(&e.word, e.pos_tag);
            let join = |v: &mut dyn Iterator<Item = String>| v.collect::<Vec<_>>().join(",");
            writeln!(
                out,
                "# {num} {}: {} postag={} h={h} cnt={} sub_hashes={} sub_nums={}",
                e.kind.name(),
                e.word,
                e.pos_tag,
                e.count,
                join(&mut e.hashes.iter().map(|h| h.to_string())),
                join(&mut e.subwords.iter().map(|s| s.to_string())),
            )?;
        }
        Ok(())
    }
}

/// Compact parsing resolves through the dictionary itself.
impl Resolve for Dictionary {
    fn word_id(&self, id: &str, pos_tag: u8) -> i32 {
        self.get_id(id, pos_tag, EntryKind::Word.into())
    }

    fn phrase_id(&self, id: &str) -> i32 {
        self.get_id(id, 0, EntryKind::Phrase.into())
    }

    fn concept_id(&self, concept: &str) -> i32 {
        self.get_id(concept, 0, EntryKind::KbConcept.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::io::Cursor;

    pub(crate) const TEST_BUCKETS: usize = 1 << 14;

    fn small_dict(args: Args) -> Dictionary {
        Dictionary::with_buckets(args, BpeEncoder::new(), TEST_BUCKETS)
    }

    fn corpus_line(words: &[(&str, u8)]) -> String {
        let words: Vec<String> = words
            .iter()
            .map(|(w, p)| format!(r#"{{"w": "{w}", "p": {p}}}"#))
            .collect();
        format!(r#"{{"target": {{"words": [{}]}}}}"#, words.join(","))
    }

    fn read_corpus(dict: &mut Dictionary, lines: &[String]) {
        let corpus = lines.join("\n");
        dict.read_from_file(Cursor::new(corpus)).unwrap();
    }

    #[test]
    fn hash_matches_historical_constants() {
        assert_eq!(hash("abc"), 0x1a47e90b);
        assert_eq!(hash("the"), 3020861980);
        // POS tag mixes into the hash only when non-zero
        assert_eq!(hash_pos("the", 0), hash("the"));
        assert_eq!(hash_pos("the", 2), 253963156);
    }

    #[test]
    fn kinds_disambiguate_identical_strings() {
        let mut d = small_dict(Args::default());
        let json = r#"{"target": {"words": [{"w": "bank", "p": 2}], "concepts": ["bank"]}}"#;
        let line = parser::parse_line(json).unwrap();
        d.add_line(&line).unwrap();
        d.rebuild_index();

        let word_id = d.get_id("bank", 2, EntryKind::Word.into());
        let concept_id = d.get_id("bank", 0, EntryKind::KbConcept.into());
        assert!(word_id >= 0);
        assert!(concept_id >= 0);
        assert_ne!(word_id, concept_id);
        assert_eq!(d.get_id("bank", 2, EntryKind::KbConcept.into()), -1);
    }

    #[test]
    fn thresholding_keeps_frequent_words_in_count_order() {
        let mut args = Args::default();
        args.min_count = 3;
        let mut d = small_dict(args);

        let counts = [("alpha", 10), ("beta", 9), ("gamma", 2), ("delta", 1), ("eps", 1)];
        let mut lines = Vec::new();
        for (w, c) in counts {
            for _ in 0..c {
                lines.push(corpus_line(&[(w, 1)]));
            }
        }
        read_corpus(&mut d, &lines);

        assert_eq!(d.nwords(), 2);
        assert_eq!(d.ntokens(), 23);
        assert_eq!(d.get_word(0), "alpha");
        assert_eq!(d.get_word(1), "beta");
        let w0 = d.get_id("alpha", 1, EntryKind::Word.into());
        assert_eq!(w0, 0);
    }

    #[test]
    fn per_kind_counts_sum_to_size() {
        let mut args = Args::default();
        args.min_count = 1;
        let mut d = small_dict(args);
        let json = r#"{"target": {"words": [{"w": "dog", "p": 2}, {"w": "barks", "p": 1}],
            "phrases": [{"w": "dog barks", "i": "dog_barks", "C": [0, 1]}],
            "concepts": ["Q144"]}}"#
            .replace('\n', " ");
        read_corpus(&mut d, &[json]);

        let total = d.size_of(KindSet::ALL);
        assert_eq!(total, d.size());
        assert_eq!(
            d.nwords + d.nlabels + d.nsubwords + d.nphrases + d.nkbconcepts,
            d.size()
        );
        assert_eq!(d.nphrases, 1);
        assert_eq!(d.nkbconcepts, 1);
    }

    #[test]
    fn find_resolves_every_entry() {
        let mut args = Args::default();
        args.min_count = 1;
        let mut d = small_dict(args);
        read_corpus(
            &mut d,
            &[
                corpus_line(&[("dog", 2), ("barks", 1)]),
                corpus_line(&[("dog", 2), ("dog", 3)]),
            ],
        );
        for id in 0..d.size() {
            let e = &d.words[id as usize];
            assert_eq!(d.get_id(&e.word, e.pos_tag, e.kind.into()), id);
        }
    }

    #[test]
    fn discard_probability_matches_formula() {
        let mut args = Args::default();
        args.min_count = 1;
        let mut d = small_dict(args);
        // "hot" appears 10 times out of 1000 tokens: f = 0.01
        let mut lines = Vec::new();
        for _ in 0..10 {
            lines.push(corpus_line(&[("hot", 1)]));
        }
        for i in 0..990 {
            let w = format!("w{i}");
            lines.push(corpus_line(&[(w.as_str(), 1)]));
        }
        read_corpus(&mut d, &lines);
        assert_eq!(d.ntokens(), 1000);

        let id = d.get_id("hot", 1, EntryKind::Word.into());
        assert!(id >= 0);
        let p = d.pdiscard(id);
        let expected = (1e-4f64 / 0.01).sqrt() + 1e-4 / 0.01;
        assert!((p as f64 - expected).abs() < 1e-6, "pdiscard {p}");
        for i in 0..d.size() {
            let p = d.pdiscard(i);
            assert!((0.0..=1.0).contains(&p));
        }

        // sampled keep rate stays within 1% of the mean
        let mut rng = StdRng::seed_from_u64(5);
        let n = 1_000_000;
        let kept = (0..n)
            .filter(|_| !d.discard(id, rng.gen::<f64>() as real))
            .count();
        let rate = kept as f64 / n as f64;
        assert!((rate - expected).abs() < 0.01, "keep rate {rate}");
    }

    #[test]
    fn save_load_round_trips_through_dump() {
        let mut args = Args::default();
        args.min_count = 1;
        let mut d = small_dict(args.clone());
        let json = r#"{"target": {"words": [{"w": "dog", "p": 2}, {"w": "cat", "p": 2}],
            "phrases": [{"w": "dog cat", "i": "dog_cat", "C": [0, 1]}],
            "concepts": ["Q1"]}}"#
            .replace('\n', " ");
        read_corpus(&mut d, &[json.clone(), json]);

        let mut buf = Vec::new();
        d.save(&mut buf).unwrap();
        let loaded =
            Dictionary::load_with_buckets(args, &mut Cursor::new(buf), TEST_BUCKETS).unwrap();

        let mut dump_a = Vec::new();
        let mut dump_b = Vec::new();
        d.dump(&mut dump_a).unwrap();
        loaded.dump(&mut dump_b).unwrap();
        assert_eq!(dump_a, dump_b);
        assert!(!loaded.is_pruned());
    }

    #[test]
    fn phrase_components_resolve_after_reload() {
        let mut args = Args::default();
        args.min_count = 1;
        let mut d = small_dict(args.clone());
        let json = r#"{"target": {"words": [{"w": "new", "p": 3}, {"w": "york", "p": 2}],
            "phrases": [{"w": "new york", "i": "new_york", "C": [0, 1]}]}}"#
            .replace('\n', " ");
        read_corpus(&mut d, &[json]);

        let mut buf = Vec::new();
        d.save(&mut buf).unwrap();
        let loaded =
            Dictionary::load_with_buckets(args, &mut Cursor::new(buf), TEST_BUCKETS).unwrap();

        let pid = loaded.get_id("new_york", 0, EntryKind::Phrase.into());
        assert!(pid >= 0);
        let subs = loaded.get_subwords(pid);
        assert_eq!(subs[0], pid);
        // both component words are wired back in
        let w0 = loaded.get_id("new", 3, EntryKind::Word.into());
        let w1 = loaded.get_id("york", 2, EntryKind::Word.into());
        assert!(subs.contains(&w0));
        assert!(subs.contains(&w1));
    }

    #[test]
    fn compact_line_subsamples_and_counts_tokens() {
        let mut args = Args::default();
        args.min_count = 1;
        args.t = 1e-4;
        let mut d = small_dict(args);
        read_corpus(&mut d, &[corpus_line(&[("dog", 2), ("barks", 1)])]);

        let mut line = CompactLine::default();
        let mut rng = StdRng::seed_from_u64(1);
        let n = d
            .get_line_compact(
                r#"{"target": {"words": [{"w": "dog", "p": 2}, {"w": "barks", "p": 1}, {"w": "oov", "p": 1}]}}"#,
                &mut line,
                &mut rng,
            )
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(line.target.words[2].num, -1);
    }

    #[test]
    fn prune_keeps_listed_words_and_all_labels() {
        let mut d = small_dict(Args::default());
        for _ in 0..3 {
            d.add("alpha");
        }
        for _ in 0..2 {
            d.add("beta");
        }
        d.add("gamma");
        d.add("__label__x");
        d.threshold(1, 0);
        assert_eq!(d.nwords(), 3);
        assert_eq!(d.nlabels(), 1);

        let mut keep = vec![0, 2];
        d.prune(&mut keep);

        assert!(d.is_pruned());
        assert_eq!(d.nwords(), 2);
        assert_eq!(d.size(), 3);
        assert_eq!(d.get_id("alpha", 0, EntryKind::Word.into()), 0);
        assert_eq!(d.get_id("gamma", 0, EntryKind::Word.into()), 1);
        assert_eq!(d.get_id("beta", 0, EntryKind::Word.into()), -1);
        assert_eq!(d.get_label(0).unwrap(), "__label__x");
    }

    #[test]
    fn empty_corpus_is_a_configuration_error() {
        let mut d = small_dict(Args::default());
        let err = d.read_from_file(Cursor::new("")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn malformed_json_reports_line_number() {
        let mut d = small_dict(Args::default());
        let err = d
            .read_from_file(Cursor::new("{\"target\": {\"words\": []}}\nnot json"))
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("line 2"), "{msg}");
    }
}
