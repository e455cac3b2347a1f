//! Training and quantization hyperparameters, with the binary header
//! encoding used inside model files.

use std::io::{Read, Write};
use std::path::PathBuf;

use crate::binio;
use crate::error::{Error, Result};
use crate::sent::MAX_PHRASE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelName {
    Cbow,
    Sg,
    Sup,
    SyntaxSg,
    HybridSg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossName {
    Hs,
    Ns,
    Softmax,
    Ova,
}

impl ModelName {
    fn to_i32(self) -> i32 {
        match self {
            ModelName::Cbow => 1,
            ModelName::Sg => 2,
            ModelName::Sup => 3,
            ModelName::SyntaxSg => 4,
            ModelName::HybridSg => 5,
        }
    }

    fn from_i32(v: i32) -> Result<Self> {
        match v {
            1 => Ok(ModelName::Cbow),
            2 => Ok(ModelName::Sg),
            3 => Ok(ModelName::Sup),
            4 => Ok(ModelName::SyntaxSg),
            5 => Ok(ModelName::HybridSg),
            _ => Err(Error::format(format!("unknown model id {v}"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ModelName::Cbow => "cbow",
            ModelName::Sg => "sg",
            ModelName::Sup => "sup",
            ModelName::SyntaxSg => "syntax_sg",
            ModelName::HybridSg => "hybrid_sg",
        }
    }
}

impl LossName {
    fn to_i32(self) -> i32 {
        match self {
            LossName::Hs => 1,
            LossName::Ns => 2,
            LossName::Softmax => 3,
            LossName::Ova => 4,
        }
    }

    fn from_i32(v: i32) -> Result<Self> {
        match v {
            1 => Ok(LossName::Hs),
            2 => Ok(LossName::Ns),
            3 => Ok(LossName::Softmax),
            4 => Ok(LossName::Ova),
            _ => Err(Error::format(format!("unknown loss id {v}"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LossName::Hs => "hs",
            LossName::Ns => "ns",
            LossName::Softmax => "softmax",
            LossName::Ova => "one-vs-all",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "hs" => Ok(LossName::Hs),
            "ns" => Ok(LossName::Ns),
            "softmax" => Ok(LossName::Softmax),
            "ova" | "one-vs-all" => Ok(LossName::Ova),
            _ => Err(Error::config(format!("unknown loss: {s}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Args {
    pub input: PathBuf,
    pub output: PathBuf,
    pub dic_path: PathBuf,
    pub bpe_codes_path: PathBuf,
    pub pretrained_vectors: Option<PathBuf>,

    pub model: ModelName,
    pub loss: LossName,
    pub dim: i32,
    pub lr: f64,
    pub lr_update_rate: i64,
    pub ws: i32,
    pub epoch: i32,
    pub min_count: i64,
    pub min_count_label: i64,
    pub neg: i32,
    pub word_ngrams: i32,
    pub bucket: i32,
    pub minn: i32,
    pub maxn: i32,
    pub thread: i32,
    pub t: f64,
    pub label: String,
    pub verbose: i32,
    pub save_output: bool,
    pub seed: i32,
    pub add_sent_feats: i32,
    pub max_bpe_vars: i32,
    pub max_phrase_size: i32,

    // quantization
    pub qout: bool,
    pub qnorm: bool,
    pub cutoff: i64,
    pub retrain: bool,
    pub dsub: i32,
}

impl Default for Args {
    fn default() -> Self {
        Args {
            input: PathBuf::new(),
            output: PathBuf::new(),
            dic_path: PathBuf::new(),
            bpe_codes_path: PathBuf::new(),
            pretrained_vectors: None,
            model: ModelName::Sg,
            loss: LossName::Ns,
            dim: 100,
            lr: 0.05,
            lr_update_rate: 100,
            ws: 5,
            epoch: 5,
            min_count: 5,
            min_count_label: 0,
            neg: 5,
            word_ngrams: 1,
            bucket: 2_000_000,
            minn: 3,
            maxn: 6,
            thread: 12,
            t: 1e-4,
            label: "__label__".to_string(),
            verbose: 2,
            save_output: false,
            seed: 0,
            add_sent_feats: 0,
            max_bpe_vars: 3,
            max_phrase_size: MAX_PHRASE_SIZE as i32,
            qout: false,
            qnorm: false,
            cutoff: 0,
            retrain: false,
            dsub: 2,
        }
    }
}

impl Args {
    /// Fixed-order header fields. Only hyperparameters needed to
    /// reconstruct a model are persisted; paths and run-control flags are
    /// not.
    pub fn save<W: Write>(&self, out: &mut W) -> Result<()> {
        binio::write_i32(out, self.dim)?;
        binio::write_i32(out, self.ws)?;
        binio::write_i32(out, self.epoch)?;
        binio::write_i64(out, self.min_count)?;
        binio::write_i32(out, self.neg)?;
        binio::write_i32(out, self.word_ngrams)?;
        binio::write_i32(out, self.loss.to_i32())?;
        binio::write_i32(out, self.model.to_i32())?;
        binio::write_i32(out, self.bucket)?;
        binio::write_i32(out, self.minn)?;
        binio::write_i32(out, self.maxn)?;
        binio::write_i64(out, self.lr_update_rate)?;
        binio::write_f64(out, self.t)?;
        binio::write_i32(out, self.add_sent_feats)?;
        binio::write_i32(out, self.max_bpe_vars)?;
        binio::write_i32(out, self.max_phrase_size)?;
        binio::write_cstr(out, &self.label)?;
        Ok(())
    }

    pub fn load<R: Read>(&mut self, inp: &mut R) -> Result<()> {
        self.dim = binio::read_i32(inp)?;
        self.ws = binio::read_i32(inp)?;
        self.epoch = binio::read_i32(inp)?;
        self.min_count = binio::read_i64(inp)?;
        self.neg = binio::read_i32(inp)?;
        self.word_ngrams = binio::read_i32(inp)?;
        self.loss = LossName::from_i32(binio::read_i32(inp)?)?;
        self.model = ModelName::from_i32(binio::read_i32(inp)?)?;
        self.bucket = binio::read_i32(inp)?;
        self.minn = binio::read_i32(inp)?;
        self.maxn = binio::read_i32(inp)?;
        self.lr_update_rate = binio::read_i64(inp)?;
        self.t = binio::read_f64(inp)?;
        self.add_sent_feats = binio::read_i32(inp)?;
        self.max_bpe_vars = binio::read_i32(inp)?;
        self.max_phrase_size = binio::read_i32(inp)?;
        self.label = binio::read_cstr(inp)?;
        Ok(())
    }

    pub fn dump<W: Write>(&self, out: &mut W) -> Result<()> {
        writeln!(out, "dim {}", self.dim)?;
        writeln!(out, "ws {}", self.ws)?;
        writeln!(out, "epoch {}", self.epoch)?;
        writeln!(out, "minCount {}", self.min_count)?;
        writeln!(out, "neg {}", self.neg)?;
        writeln!(out, "wordNgrams {}", self.word_ngrams)?;
        writeln!(out, "loss {}", self.loss.name())?;
        writeln!(out, "model {}", self.model.name())?;
        writeln!(out, "bucket {}", self.bucket)?;
        writeln!(out, "minn {}", self.minn)?;
        writeln!(out, "maxn {}", self.maxn)?;
        writeln!(out, "lrUpdateRate {}", self.lr_update_rate)?;
        writeln!(out, "t {}", self.t)?;
        writeln!(out, "addSentFeats {}", self.add_sent_feats)?;
        writeln!(out, "maxBpeVars {}", self.max_bpe_vars)?;
        writeln!(out, "maxPhraseSize {}", self.max_phrase_size)?;
        writeln!(out, "label {}", self.label)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn header_round_trip() {
        let mut a = Args::default();
        a.model = ModelName::SyntaxSg;
        a.loss = LossName::Hs;
        a.dim = 17;
        a.t = 5e-5;
        a.add_sent_feats = 4;
        a.label = "__lbl__".to_string();

        let mut buf = Vec::new();
        a.save(&mut buf).unwrap();

        let mut b = Args::default();
        b.load(&mut Cursor::new(buf)).unwrap();
        assert_eq!(b.model, ModelName::SyntaxSg);
        assert_eq!(b.loss, LossName::Hs);
        assert_eq!(b.dim, 17);
        assert_eq!(b.t, 5e-5);
        assert_eq!(b.add_sent_feats, 4);
        assert_eq!(b.label, "__lbl__");
        assert_eq!(b.max_phrase_size, MAX_PHRASE_SIZE as i32);
    }
}
