//! Universal Dependencies v2 relation labels as they appear in the corpus
//! annotation (`n` field of a word object).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyntRel {
    Root = 0,
    Nsubj = 1,
    Obj = 2,
    Obl = 3,
    Advmod = 4,
    Amod = 5,
    Nmod = 6,
    Case = 7,
    Acl = 8,
    Advcl = 9,
    Appos = 10,
    Aux = 11,
    Cc = 12,
    Ccomp = 13,
    Clf = 14,
    Compound = 15,
    Conj = 16,
    Cop = 17,
    Csubj = 18,
    Dep = 19,
    Det = 20,
    Discourse = 21,
    Dislocated = 22,
    Expl = 23,
    Fixed = 24,
    Flat = 25,
    Goeswith = 26,
    Iobj = 27,
    List = 28,
    Mark = 29,
    Nummod = 30,
    Orphan = 31,
}

/// AMOD / ADVMOD / DISCOURSE dependents carry little distributional signal
/// for their heads and are skipped when gathering syntactic contexts.
pub fn is_modifier(rel: u8) -> bool {
    rel == SyntRel::Amod as u8 || rel == SyntRel::Advmod as u8 || rel == SyntRel::Discourse as u8
}

/// Clausal edges bound the ancestor walk: contexts do not cross into a
/// different clause.
pub fn is_clausal(rel: u8) -> bool {
    rel == SyntRel::Acl as u8 || rel == SyntRel::Advcl as u8
}
