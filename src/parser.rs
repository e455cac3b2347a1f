//! Streaming JSON parsing of corpus records.
//!
//! One record per line: `{"target": sent, "other_langs": [sent, ...]}`.
//! Rich mode materializes a [`Line`] whose strings borrow from the input
//! buffer. Compact mode never builds strings at all: word ids are resolved
//! to vocabulary numbers through a [`Resolve`] callback while the record is
//! being visited, and only packed [`CompactWord`]s are stored.

use std::borrow::Cow;
use std::fmt;

use serde::de::{self, DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::sent::{
    offs_to_bits, CompactLine, CompactSent, CompactWord, Line, OtherCompactSent,
    PARENT_OFFS_BITS,
};

const SENT_SIZE_HINT: usize = 50;

/// Id resolution used by compact parsing. Words are keyed by
/// `(id, pos_tag)`, phrases and concepts by their id string alone.
pub trait Resolve {
    fn word_id(&self, id: &str, pos_tag: u8) -> i32;
    fn phrase_id(&self, id: &str) -> i32;
    fn concept_id(&self, concept: &str) -> i32;
}

fn snippet(json: &str) -> &str {
    match json.char_indices().nth(60) {
        Some((i, _)) => &json[..i],
        None => json,
    }
}

fn parse_error(e: serde_json::Error, json: &str) -> Error {
    Error::format(format!("{e}; record starts {:?}", snippet(json)))
}

/// Parse one record keeping string slices into `json`.
pub fn parse_line(json: &str) -> Result<Line<'_>> {
    let mut de = serde_json::Deserializer::from_str(json);
    let line = Line::deserialize(&mut de).map_err(|e| parse_error(e, json))?;
    de.end().map_err(|e| parse_error(e, json))?;
    Ok(line)
}

/// Parse one record into the reusable compact buffers of `line`.
pub fn parse_compact_line<R: Resolve>(
    json: &str,
    resolver: &R,
    line: &mut CompactLine,
) -> Result<()> {
    line.reset();
    let mut de = serde_json::Deserializer::from_str(json);
    CompactLineSeed { resolver, line }
        .deserialize(&mut de)
        .map_err(|e| parse_error(e, json))?;
    de.end().map_err(|e| parse_error(e, json))?;
    Ok(())
}

/// A JSON string that stays borrowed unless it contains escapes.
struct JsonStr<'de>(Cow<'de, str>);

impl<'de> Deserialize<'de> for JsonStr<'de> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct V;
        impl<'de> Visitor<'de> for V {
            type Value = JsonStr<'de>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a string")
            }

            fn visit_borrowed_str<E: de::Error>(self, v: &'de str) -> std::result::Result<Self::Value, E> {
                Ok(JsonStr(Cow::Borrowed(v)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
                Ok(JsonStr(Cow::Owned(v.to_owned())))
            }

            fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Self::Value, E> {
                Ok(JsonStr(Cow::Owned(v)))
            }
        }
        deserializer.deserialize_str(V)
    }
}

struct CompactLineSeed<'s, R> {
    resolver: &'s R,
    line: &'s mut CompactLine,
}

impl<'de, 's, R: Resolve> DeserializeSeed<'de> for CompactLineSeed<'s, R> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, d: D) -> std::result::Result<(), D::Error> {
        d.deserialize_map(self)
    }
}

impl<'de, 's, R: Resolve> Visitor<'de> for CompactLineSeed<'s, R> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a line object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<(), A::Error> {
        while let Some(key) = map.next_key::<JsonStr>()? {
            match key.0.as_ref() {
                "target" => map.next_value_seed(CompactSentSeed {
                    resolver: self.resolver,
                    sent: &mut self.line.target,
                    mappings: None,
                })?,
                "other_langs" => map.next_value_seed(OtherLangsSeed {
                    resolver: self.resolver,
                    others: &mut self.line.other_langs,
                })?,
                k => return Err(de::Error::custom(format!("unknown line key: {k}"))),
            }
        }
        Ok(())
    }
}

struct OtherLangsSeed<'s, R> {
    resolver: &'s R,
    others: &'s mut Vec<OtherCompactSent>,
}

impl<'de, 's, R: Resolve> DeserializeSeed<'de> for OtherLangsSeed<'s, R> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, d: D) -> std::result::Result<(), D::Error> {
        d.deserialize_seq(self)
    }
}

impl<'de, 's, R: Resolve> Visitor<'de> for OtherLangsSeed<'s, R> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "an array of sentence objects")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<(), A::Error> {
        loop {
            self.others.push(OtherCompactSent::default());
            let os = self.others.last_mut().expect("just pushed");
            let seed = CompactSentSeed {
                resolver: self.resolver,
                sent: &mut os.sent,
                mappings: Some((
                    &mut os.mapping_to_target_words,
                    &mut os.mapping_to_target_phrases,
                )),
            };
            if seq.next_element_seed(seed)?.is_none() {
                self.others.pop();
                return Ok(());
            }
        }
    }
}

struct CompactSentSeed<'s, R> {
    resolver: &'s R,
    sent: &'s mut CompactSent,
    /// Word and phrase alignment targets; `None` on the target sentence,
    /// where mapping keys are invalid.
    mappings: Option<(&'s mut Vec<i16>, &'s mut Vec<i16>)>,
}

impl<'de, 's, R: Resolve> DeserializeSeed<'de> for CompactSentSeed<'s, R> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, d: D) -> std::result::Result<(), D::Error> {
        d.deserialize_map(self)
    }
}

impl<'de, 's, R: Resolve> Visitor<'de> for CompactSentSeed<'s, R> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a sentence object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<(), A::Error> {
        let CompactSentSeed {
            resolver,
            sent,
            mut mappings,
        } = self;
        while let Some(key) = map.next_key::<JsonStr>()? {
            match key.0.as_ref() {
                "words" => map.next_value_seed(WordArraySeed {
                    resolver,
                    words: &mut sent.words,
                    phrase_slot: false,
                })?,
                "phrases" => map.next_value_seed(WordArraySeed {
                    resolver,
                    words: &mut sent.phrases,
                    phrase_slot: true,
                })?,
                "concepts" => map.next_value_seed(ConceptsSeed {
                    resolver,
                    out: &mut sent.concepts,
                })?,
                "origin" => {
                    // language tag; the compact form has no use for it
                    map.next_value::<u64>()?;
                }
                "words_mapping" => match mappings.as_mut() {
                    Some((words_mapping, _)) => {
                        map.next_value_seed(MappingSeed { out: words_mapping })?
                    }
                    None => {
                        return Err(de::Error::custom(
                            "words_mapping is only valid on other-language sentences",
                        ))
                    }
                },
                "phrases_mapping" => match mappings.as_mut() {
                    Some((_, phrases_mapping)) => {
                        map.next_value_seed(MappingSeed { out: phrases_mapping })?
                    }
                    None => {
                        return Err(de::Error::custom(
                            "phrases_mapping is only valid on other-language sentences",
                        ))
                    }
                },
                k => return Err(de::Error::custom(format!("unknown sent key: {k}"))),
            }
        }
        Ok(())
    }
}

struct WordArraySeed<'s, R> {
    resolver: &'s R,
    words: &'s mut Vec<CompactWord>,
    phrase_slot: bool,
}

impl<'de, 's, R: Resolve> DeserializeSeed<'de> for WordArraySeed<'s, R> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, d: D) -> std::result::Result<(), D::Error> {
        d.deserialize_seq(self)
    }
}

impl<'de, 's, R: Resolve> Visitor<'de> for WordArraySeed<'s, R> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "an array of word objects")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<(), A::Error> {
        self.words.reserve(seq.size_hint().unwrap_or(SENT_SIZE_HINT));
        while let Some(word) = seq.next_element_seed(CompactWordSeed {
            resolver: self.resolver,
            phrase_slot: self.phrase_slot,
        })? {
            self.words.push(word);
        }
        Ok(())
    }
}

struct CompactWordSeed<'s, R> {
    resolver: &'s R,
    phrase_slot: bool,
}

impl<'de, 's, R: Resolve> DeserializeSeed<'de> for CompactWordSeed<'s, R> {
    type Value = CompactWord;

    fn deserialize<D: Deserializer<'de>>(self, d: D) -> std::result::Result<CompactWord, D::Error> {
        d.deserialize_map(self)
    }
}

impl<'de, 's, R: Resolve> Visitor<'de> for CompactWordSeed<'s, R> {
    type Value = CompactWord;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a word object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<CompactWord, A::Error> {
        let mut surface: Option<JsonStr<'de>> = None;
        let mut id: Option<JsonStr<'de>> = None;
        let mut pos_tag: u8 = 0;
        let mut parent_offs: i64 = 0;
        let mut synt_rel: u64 = 0;
        let mut has_components = false;

        while let Some(key) = map.next_key::<JsonStr>()? {
            match key.0.as_ref() {
                "w" => surface = Some(map.next_value()?),
                "i" => id = Some(map.next_value()?),
                "p" => pos_tag = map.next_value()?,
                "l" => parent_offs = map.next_value()?,
                "n" => synt_rel = map.next_value()?,
                "C" => {
                    has_components = true;
                    map.next_value::<IgnoredAny>()?;
                }
                k => return Err(de::Error::custom(format!("unknown word key: {k}"))),
            }
        }

        let surface = surface.ok_or_else(|| de::Error::custom("word object missing 'w'"))?;
        let word_id = id.as_ref().map(|s| s.0.as_ref()).unwrap_or(surface.0.as_ref());

        let mut word = CompactWord::default();
        word.set_is_phrase(has_components);
        word.set_synt_rel(synt_rel.min(u32::MAX as u64) as u32);
        let clamped = parent_offs.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        word.set_parent_offs(offs_to_bits(clamped, PARENT_OFFS_BITS));
        word.num = if self.phrase_slot {
            self.resolver.phrase_id(word_id)
        } else {
            self.resolver.word_id(word_id, pos_tag)
        };
        Ok(word)
    }
}

struct ConceptsSeed<'s, R> {
    resolver: &'s R,
    out: &'s mut Vec<i32>,
}

impl<'de, 's, R: Resolve> DeserializeSeed<'de> for ConceptsSeed<'s, R> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, d: D) -> std::result::Result<(), D::Error> {
        d.deserialize_seq(self)
    }
}

impl<'de, 's, R: Resolve> Visitor<'de> for ConceptsSeed<'s, R> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "an array of concept strings")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<(), A::Error> {
        while let Some(concept) = seq.next_element::<JsonStr>()? {
            let num = self.resolver.concept_id(concept.0.as_ref());
            if num >= 0 {
                self.out.push(num);
            }
        }
        Ok(())
    }
}

struct MappingSeed<'s> {
    out: &'s mut Vec<i16>,
}

impl<'de, 's> DeserializeSeed<'de> for MappingSeed<'s> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, d: D) -> std::result::Result<(), D::Error> {
        d.deserialize_seq(self)
    }
}

impl<'de, 's> Visitor<'de> for MappingSeed<'s> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "an array of target positions")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<(), A::Error> {
        while let Some(v) = seq.next_element::<i64>()? {
            let v = i16::try_from(v)
                .map_err(|_| de::Error::custom(format!("alignment position {v} out of range")))?;
            self.out.push(v);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubResolver;

    impl Resolve for StubResolver {
        fn word_id(&self, id: &str, pos_tag: u8) -> i32 {
            match (id, pos_tag) {
                ("perro", 2) => 7,
                ("dog", 2) => 3,
                ("barks", 1) => 4,
                _ => -1,
            }
        }

        fn phrase_id(&self, id: &str) -> i32 {
            if id == "big_dog" {
                9
            } else {
                -1
            }
        }

        fn concept_id(&self, concept: &str) -> i32 {
            if concept == "Q144" {
                11
            } else {
                -1
            }
        }
    }

    const RECORD: &str = r#"{
      "target": {
        "words": [
          {"w": "dog", "p": 2, "l": 1, "n": 1},
          {"w": "barks", "p": 1, "l": 0, "n": 0}
        ],
        "phrases": [
          {"w": "big dog", "i": "big_dog", "l": 0, "C": [0, 1]}
        ],
        "concepts": ["Q144"],
        "origin": 1
      },
      "other_langs": [
        {
          "words": [{"w": "perro", "p": 2, "l": 0, "n": 0}],
          "origin": 3,
          "words_mapping": [0],
          "phrases_mapping": []
        }
      ]
    }"#;

    #[test]
    fn rich_parse_keeps_structure() {
        let line = parse_line(RECORD).unwrap();
        assert_eq!(line.target.words.len(), 2);
        assert_eq!(line.target.words[0].surface, "dog");
        assert_eq!(line.target.words[0].word_id(), "dog");
        assert_eq!(line.target.words[1].parent_offs, 0);
        assert_eq!(line.target.phrases[0].word_id(), "big_dog");
        assert_eq!(line.target.phrases[0].components, vec![0, 1]);
        assert_eq!(line.target.concepts, vec!["Q144"]);
        assert_eq!(line.target.origin, 1);
        assert_eq!(line.other_langs.len(), 1);
        assert_eq!(line.other_langs[0].words_mapping, vec![0]);
    }

    #[test]
    fn rich_parse_rejects_unknown_keys() {
        let err = parse_line(r#"{"target": {"words": [{"w": "a", "x": 1}]}}"#).unwrap_err();
        assert!(err.to_string().contains("unknown field"), "{err}");
        let err = parse_line(r#"{"bogus": 1}"#).unwrap_err();
        assert!(err.to_string().contains("unknown field"), "{err}");
    }

    #[test]
    fn compact_parse_resolves_ids() {
        let mut line = CompactLine::default();
        parse_compact_line(RECORD, &StubResolver, &mut line).unwrap();

        assert_eq!(line.target.words[0].num, 3);
        assert_eq!(line.target.words[1].num, 4);
        assert_eq!(line.target.words[0].parent_offs(), 1);
        assert_eq!(line.target.words[0].synt_rel(), 1);
        assert!(line.target.phrases[0].is_phrase());
        assert_eq!(line.target.phrases[0].num, 9);
        assert_eq!(line.target.concepts, vec![11]);
        assert_eq!(line.other_langs[0].sent.words[0].num, 7);
        assert_eq!(line.other_langs[0].mapping_to_target_words, vec![0]);
        assert!(line.other_langs[0].mapping_to_target_phrases.is_empty());
    }

    #[test]
    fn compact_parse_saturates_offsets_and_clips_relations() {
        let mut line = CompactLine::default();
        let json = r#"{"target": {"words": [{"w": "dog", "p": 1, "l": 200, "n": 40}]}}"#;
        parse_compact_line(json, &StubResolver, &mut line).unwrap();
        let w = &line.target.words[0];
        assert_eq!(w.parent_offs(), 0);
        assert_eq!(w.synt_rel(), 31);
        assert_eq!(w.num, -1);
    }

    #[test]
    fn compact_parse_rejects_unknown_and_misplaced_keys() {
        let mut line = CompactLine::default();
        let err =
            parse_compact_line(r#"{"target": {"words": [{"q": 1}]}}"#, &StubResolver, &mut line)
                .unwrap_err();
        assert!(err.to_string().contains("unknown word key"), "{err}");

        let err = parse_compact_line(
            r#"{"target": {"words_mapping": [0]}}"#,
            &StubResolver,
            &mut line,
        )
        .unwrap_err();
        assert!(err.to_string().contains("only valid"), "{err}");
    }

    #[test]
    fn compact_word_id_falls_back_to_surface() {
        let mut line = CompactLine::default();
        parse_compact_line(
            r#"{"target": {"words": [{"w": "barks", "p": 1}]}}"#,
            &StubResolver,
            &mut line,
        )
        .unwrap();
        assert_eq!(line.target.words[0].num, 4);
    }

    #[test]
    fn buffers_are_reusable() {
        let mut line = CompactLine::default();
        parse_compact_line(RECORD, &StubResolver, &mut line).unwrap();
        parse_compact_line(r#"{"target": {"words": []}}"#, &StubResolver, &mut line).unwrap();
        assert!(line.target.words.is_empty());
        assert!(line.other_langs.is_empty());
    }
}
