//! The top-level service: trains the model over worker threads, persists
//! and reloads the binary model format, answers nearest-neighbour, analogy
//! and vector queries, and drives quantization.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ordered_float::OrderedFloat;
use rand::Rng;
use tracing::info;

use crate::args::{Args, LossName, ModelName};
use crate::binio;
use crate::dictionary::{Dictionary, EntryKind, KindSet, EOS, MAX_VOCAB_SIZE};
use crate::error::{Error, Result};
use crate::loss::{
    HierarchicalSoftmaxLoss, Loss, NegativeSamplingLoss, OneVsAllLoss, Predictions, SoftmaxLoss,
};
use crate::matrix::{DenseMatrix, Matrix, Real};
use crate::model::{Model, State};
use crate::pq::QuantMatrix;
use crate::real;
use crate::sent::{CompactLine, CompactWord};
use crate::syntax::{is_clausal, is_modifier};
use crate::vector::Vector;

pub const MODEL_MAGIC: i32 = 793_712_314;
pub const MODEL_VERSION: i32 = 12;

/// `(progress, loss, words/sec/thread, lr, eta_seconds)`, invoked from
/// worker threads every 64 lines.
pub type ProgressCallback<'a> = &'a (dyn Fn(f32, f32, f64, f64, i64) + Sync);

pub struct Embedder {
    args: Args,
    dict: Arc<Dictionary>,
    input: Arc<Matrix>,
    output: Arc<Matrix>,
    model: Model,
    quant: bool,
    version: i32,
    token_count: AtomicI64,
    avg_loss: Real,
    start: Instant,
    word_vectors: Option<DenseMatrix>,
    train_error: Mutex<Option<Error>>,
    failed: AtomicBool,
}

impl std::fmt::Debug for Embedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embedder").finish_non_exhaustive()
    }
}

impl Embedder {
    // -----------------------------------------------------------------
    // Construction

    fn create_loss(args: &Args, dict: &Dictionary, wo: Arc<Matrix>) -> Box<dyn Loss> {
        let counts = if args.model == ModelName::Sup {
            dict.get_counts(EntryKind::Label.into())
        } else {
            dict.get_counts(EntryKind::Word | EntryKind::Phrase)
        };
        match args.loss {
            LossName::Hs => Box::new(HierarchicalSoftmaxLoss::new(wo, &counts)),
            LossName::Ns => Box::new(NegativeSamplingLoss::new(wo, args.neg, &counts)),
            LossName::Softmax => Box::new(SoftmaxLoss::new(wo)),
            LossName::Ova => Box::new(OneVsAllLoss::new(wo)),
        }
    }

    fn build_model(args: &Args, dict: &Dictionary, wi: Arc<Matrix>, wo: Arc<Matrix>) -> Model {
        let loss = Self::create_loss(args, dict, wo.clone());
        Model::new(wi, wo, loss, args.model == ModelName::Sup)
    }

    /// Build matrices, load the prebuilt dictionary and run the training
    /// threads to completion.
    pub fn train(args: &Args, callback: Option<ProgressCallback<'_>>) -> Result<Self> {
        Self::train_with_buckets(args, callback, MAX_VOCAB_SIZE)
    }

    pub fn train_with_buckets(
        args: &Args,
        callback: Option<ProgressCallback<'_>>,
        nbuckets: usize,
    ) -> Result<Self> {
        let args = args.clone();
        let dict_file = File::open(&args.dic_path).map_err(|e| {
            Error::config(format!(
                "{} cannot be opened for training: {e}",
                args.dic_path.display()
            ))
        })?;
        let mut dict =
            Dictionary::load_with_buckets(args.clone(), &mut BufReader::new(dict_file), nbuckets)?;

        if args.input.as_os_str() == "-" {
            // manage expectations
            return Err(Error::config("cannot use stdin for training".to_string()));
        }
        File::open(&args.input).map_err(|e| {
            Error::config(format!(
                "{} cannot be opened for training: {e}",
                args.input.display()
            ))
        })?;

        let input = match &args.pretrained_vectors {
            Some(path) => Self::input_matrix_from_file(path.as_path(), &mut dict, &args)?,
            None => {
                let m = DenseMatrix::new(dict.size() as usize, args.dim as usize);
                m.uniform(
                    1.0 / args.dim as real,
                    args.thread.max(1) as usize,
                    args.seed,
                );
                info!(rows = m.rows(), dim = m.cols(), "created input matrix");
                m
            }
        };
        let output_rows = if args.model == ModelName::Sup {
            dict.nlabels()
        } else {
            dict.size_of(EntryKind::Word | EntryKind::Phrase)
        };
        info!(rows = output_rows, dim = args.dim, "created output matrix");
        let output = DenseMatrix::new(output_rows as usize, args.dim as usize);

        let dict = Arc::new(dict);
        let input = Arc::new(Matrix::Dense(input));
        let output = Arc::new(Matrix::Dense(output));
        let model = Self::build_model(&args, &dict, input.clone(), output.clone());
        let mut embedder = Embedder {
            args,
            dict,
            input,
            output,
            model,
            quant: false,
            version: MODEL_VERSION,
            token_count: AtomicI64::new(0),
            avg_loss: Real::default(),
            start: Instant::now(),
            word_vectors: None,
            train_error: Mutex::new(None),
            failed: AtomicBool::new(false),
        };
        embedder.start_threads(callback)?;
        Ok(embedder)
    }

    fn input_matrix_from_file(
        path: &Path,
        dict: &mut Dictionary,
        args: &Args,
    ) -> Result<DenseMatrix> {
        let file = File::open(path).map_err(|e| {
            Error::config(format!("{} cannot be opened for loading: {e}", path.display()))
        })?;
        let mut reader = BufReader::new(file);
        let mut header = String::new();
        reader.read_line(&mut header)?;
        let mut fields = header.split_whitespace();
        let parse_err = || Error::format(format!("invalid vector file {}", path.display()));
        let n: usize = fields.next().ok_or_else(parse_err)?.parse().map_err(|_| parse_err())?;
        let dim: usize = fields.next().ok_or_else(parse_err)?.parse().map_err(|_| parse_err())?;
        if dim != args.dim as usize {
            return Err(Error::config(format!(
                "dimension of pretrained vectors ({dim}) does not match dimension ({})",
                args.dim
            )));
        }

        let mut words = Vec::with_capacity(n);
        let mut rows = vec![0.0 as real; n * dim];
        let mut line = String::new();
        for i in 0..n {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Err(parse_err());
            }
            let mut fields = line.split_whitespace();
            let word = fields.next().ok_or_else(parse_err)?.to_string();
            for j in 0..dim {
                rows[i * dim + j] = fields
                    .next()
                    .ok_or_else(parse_err)?
                    .parse()
                    .map_err(|_| parse_err())?;
            }
            dict.add(&word);
            words.push(word);
        }

        dict.threshold(1, 0);
        dict.init_table_discard();
        let input = DenseMatrix::new(dict.size() as usize, dim);
        input.uniform(1.0 / dim as real, args.thread.max(1) as usize, args.seed);
        for (i, word) in words.iter().enumerate() {
            let idx = dict.get_id(word, 0, KindSet::ALL);
            if idx < 0 || idx >= dict.nwords() {
                continue;
            }
            for j in 0..dim {
                input.set_at(idx as usize, j, rows[i * dim + j]);
            }
        }
        Ok(input)
    }

    // -----------------------------------------------------------------
    // Training loop

    fn keep_training(&self, ntokens: i64) -> bool {
        self.token_count.load(Ordering::Relaxed) < self.args.epoch as i64 * ntokens
            && !self.failed.load(Ordering::Acquire)
    }

    /// Stop training from another thread: workers finish their current
    /// line and exit, and the driver rethrows the cancellation.
    pub fn abort(&self) {
        let mut slot = self.train_error.lock().expect("train error lock");
        if slot.is_none() {
            *slot = Some(Error::Cancelled);
        }
        self.failed.store(true, Ordering::Release);
    }

    fn progress_info(&self, progress: f64) -> (f64, f64, i64) {
        let t = self.start.elapsed().as_secs_f64();
        let lr = self.args.lr * (1.0 - progress);
        let mut wst = 0.0;
        let mut eta = 2_592_000; // a month, until progress exists
        if progress > 0.0 && t >= 0.0 {
            eta = (t * (1.0 - progress) / progress) as i64;
            wst = self.token_count.load(Ordering::Relaxed) as f64 / t / self.args.thread as f64;
        }
        (wst, lr, eta)
    }

    fn print_info(&self, progress: f64, loss: real) {
        let (wst, lr, eta) = self.progress_info(progress);
        eprint!(
            "Progress: {:5.1}% words/sec/thread: {:7.0} lr: {:9.6} avg.loss: {:9.6} ETA: {}",
            progress * 100.0,
            wst,
            lr,
            loss,
            format_eta(eta)
        );
        let _ = std::io::stderr().flush();
    }

    fn start_threads(&mut self, callback: Option<ProgressCallback<'_>>) -> Result<()> {
        self.start = Instant::now();
        self.token_count.store(0, Ordering::Relaxed);
        self.avg_loss.set(-1.0);
        *self.train_error.lock().expect("train error lock") = None;
        self.failed.store(false, Ordering::Release);

        let ntokens = self.dict.ntokens();
        let this: &Embedder = self;
        thread::scope(|s| {
            if this.args.thread > 1 {
                for i in 0..this.args.thread {
                    s.spawn(move || this.worker(i, callback));
                }
                // driver: periodic progress print until workers drain
                while this.keep_training(ntokens) {
                    thread::sleep(Duration::from_millis(100));
                    if this.avg_loss.get() >= 0.0 && this.args.verbose > 1 {
                        let progress = this.token_count.load(Ordering::Relaxed) as f64
                            / (this.args.epoch as i64 * ntokens) as f64;
                        eprint!("\r");
                        this.print_info(progress, this.avg_loss.get());
                    }
                }
            } else {
                this.worker(0, callback);
            }
        });

        if let Some(e) = self.train_error.lock().expect("train error lock").take() {
            return Err(e);
        }
        if self.args.verbose > 0 {
            eprint!("\r");
            self.print_info(1.0, self.avg_loss.get());
            eprintln!();
        }
        Ok(())
    }

    fn worker(&self, thread_id: i32, callback: Option<ProgressCallback<'_>>) {
        if let Err(e) = self.train_thread(thread_id, callback) {
            let mut slot = self.train_error.lock().expect("train error lock");
            if slot.is_none() {
                *slot = Some(e);
            }
            self.failed.store(true, Ordering::Release);
        }
    }

    fn train_thread(&self, thread_id: i32, callback: Option<ProgressCallback<'_>>) -> Result<()> {
        let file = File::open(&self.args.input)?;
        let size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let seek_pos = thread_id as u64 * size / self.args.thread.max(1) as u64;
        reader.seek(SeekFrom::Start(seek_pos))?;
        if seek_pos > 0 {
            let mut skipped = String::new();
            reader.read_line(&mut skipped)?;
        }

        let mut state = State::new(
            self.args.dim as usize,
            self.model.output_rows(),
            (thread_id + self.args.seed) as u64,
        );
        let ntokens = self.dict.ntokens();
        let mut local_token_count: i64 = 0;
        let mut json = String::new();
        let mut line = CompactLine::default();
        let mut targets: Vec<i32> = Vec::new();
        let mut words: Vec<i32> = Vec::new();
        let mut labels: Vec<i32> = Vec::new();
        let mut bow: Vec<i32> = Vec::new();
        let mut callback_counter: u64 = 0;

        while self.keep_training(ntokens) {
            let progress = self.token_count.load(Ordering::Relaxed) as f64
                / (self.args.epoch as i64 * ntokens) as f64;
            if let Some(cb) = callback {
                if callback_counter % 64 == 0 {
                    let (wst, lr, eta) = self.progress_info(progress);
                    cb(progress as f32, self.avg_loss.get(), wst, lr, eta);
                }
                callback_counter += 1;
            }
            let lr = (self.args.lr * (1.0 - progress)) as real;

            match self.args.model {
                ModelName::Sg => {
                    next_line(&mut reader, &mut json)?;
                    local_token_count +=
                        self.dict.get_line_compact(&json, &mut line, &mut state.rng)? as i64;
                    self.skipgram(&mut state, lr, &line, &mut targets)?;
                }
                ModelName::SyntaxSg => {
                    next_line(&mut reader, &mut json)?;
                    local_token_count +=
                        self.dict.get_line_compact(&json, &mut line, &mut state.rng)? as i64;
                    self.syntax_skipgram(&mut state, lr, &line, &mut targets)?;
                }
                ModelName::HybridSg => {
                    next_line(&mut reader, &mut json)?;
                    local_token_count +=
                        self.dict.get_line_compact(&json, &mut line, &mut state.rng)? as i64;
                    self.skipgram(&mut state, lr, &line, &mut targets)?;
                    self.syntax_skipgram(&mut state, lr, &line, &mut targets)?;
                }
                ModelName::Cbow => {
                    next_line(&mut reader, &mut json)?;
                    local_token_count +=
                        self.dict.get_line_words(&json, &mut words, &mut state.rng) as i64;
                    self.cbow(&mut state, lr, &words, &mut bow)?;
                }
                ModelName::Sup => {
                    next_line(&mut reader, &mut json)?;
                    local_token_count +=
                        self.dict.get_line_labels(&json, &mut words, &mut labels) as i64;
                    self.supervised(&mut state, lr, &words, &labels)?;
                }
            }

            if local_token_count > self.args.lr_update_rate {
                self.token_count
                    .fetch_add(local_token_count, Ordering::Relaxed);
                local_token_count = 0;
                if thread_id == 0 && self.args.verbose > 1 {
                    self.avg_loss.set(state.loss());
                }
            }
        }
        if thread_id == 0 {
            self.avg_loss.set(state.loss());
        }
        Ok(())
    }

    fn supervised(
        &self,
        state: &mut State,
        lr: real,
        line: &[i32],
        labels: &[i32],
    ) -> Result<()> {
        if labels.is_empty() || line.is_empty() {
            return Ok(());
        }
        if self.args.loss == LossName::Ova {
            // every label is a positive; the kernel ignores the index
            self.model.update(line, labels, 0, lr, state)
        } else {
            let i = state.rng.gen_range(0..labels.len());
            self.model.update(line, labels, i, lr, state)
        }
    }

    fn cbow(&self, state: &mut State, lr: real, line: &[i32], bow: &mut Vec<i32>) -> Result<()> {
        for w in 0..line.len() {
            let boundary = state.rng.gen_range(1..=self.args.ws) as i64;
            bow.clear();
            for c in -boundary..=boundary {
                let pos = w as i64 + c;
                if c != 0 && pos >= 0 && (pos as usize) < line.len() {
                    bow.extend_from_slice(self.dict.get_subwords(line[pos as usize]));
                }
            }
            self.model.update(bow, line, w, lr, state)?;
        }
        Ok(())
    }

    fn skipgram(
        &self,
        state: &mut State,
        lr: real,
        line: &CompactLine,
        targets: &mut Vec<i32>,
    ) -> Result<()> {
        self.update_on_words(state, lr, &line.target.words, targets)?;
        for os in &line.other_langs {
            self.update_on_words(state, lr, &os.sent.words, targets)?;
            self.map_other_to_target(
                state,
                lr,
                &line.target.words,
                &os.sent.words,
                &os.mapping_to_target_words,
                targets,
            )?;
        }
        Ok(())
    }

    fn update_on_words(
        &self,
        state: &mut State,
        lr: real,
        words: &[CompactWord],
        targets: &mut Vec<i32>,
    ) -> Result<()> {
        targets.clear();
        targets.extend(words.iter().map(|w| w.num));
        for w in 0..words.len() {
            if words[w].num < 0 {
                continue;
            }
            let feats = self.dict.get_subwords(words[w].num);
            let boundary = state.rng.gen_range(1..=self.args.ws) as i64;
            for c in -boundary..=boundary {
                let pos = w as i64 + c;
                if c != 0 && pos >= 0 && (pos as usize) < words.len() {
                    self.model.update(feats, targets, pos as usize, lr, state)?;
                }
            }
        }
        Ok(())
    }

    /// Aligned pairs train the other-language word against the target
    /// word's window, tying the two spaces together.
    fn map_other_to_target(
        &self,
        state: &mut State,
        lr: real,
        target_words: &[CompactWord],
        other_words: &[CompactWord],
        mapping: &[i16],
        targets: &mut Vec<i32>,
    ) -> Result<()> {
        targets.clear();
        targets.extend(target_words.iter().map(|w| w.num));
        for (i, ow) in other_words.iter().enumerate() {
            if ow.num == -1 {
                continue;
            }
            let target_pos = mapping.get(i).copied().unwrap_or(-1);
            if target_pos < 0 {
                continue;
            }
            let tp = target_pos as usize;
            if tp >= target_words.len() || target_words[tp].num == -1 {
                continue;
            }
            let feats = self.dict.get_subwords(ow.num);
            let boundary = state.rng.gen_range(1..=self.args.ws) as i64;
            for c in -boundary..=boundary {
                let pos = tp as i64 + c;
                if pos >= 0 && (pos as usize) < target_words.len() {
                    self.model.update(feats, targets, pos as usize, lr, state)?;
                }
            }
        }
        Ok(())
    }

    fn syntax_skipgram(
        &self,
        state: &mut State,
        lr: real,
        line: &CompactLine,
        targets: &mut Vec<i32>,
    ) -> Result<()> {
        self.update_words_syntax(state, lr, &line.target.words, &line.target.concepts, targets)?;
        self.update_phrases_syntax(
            state,
            lr,
            &line.target.phrases,
            &line.target.concepts,
            targets,
        )?;
        for os in &line.other_langs {
            self.update_words_syntax(state, lr, &os.sent.words, &os.sent.concepts, targets)?;
            self.map_other_syntax(
                state,
                lr,
                &line.target.words,
                &os.sent.words,
                &os.mapping_to_target_words,
                &os.sent.concepts,
                targets,
            )?;
            self.update_phrases_syntax(state, lr, &os.sent.phrases, &os.sent.concepts, targets)?;
            self.map_other_syntax(
                state,
                lr,
                &line.target.phrases,
                &os.sent.phrases,
                &os.mapping_to_target_phrases,
                &os.sent.concepts,
                targets,
            )?;
        }
        Ok(())
    }

    /// Token features, with the sentence concepts mixed in for
    /// `add_sent_feats` of every 10 draws.
    fn combine_feats<'a>(
        &self,
        state: &mut State,
        feats: &'a [i32],
        sent_feats: &[i32],
    ) -> std::borrow::Cow<'a, [i32]> {
        if sent_feats.is_empty() {
            return std::borrow::Cow::Borrowed(feats);
        }
        let n = state.rng.gen_range(1..=10);
        if n <= self.args.add_sent_feats {
            let mut combined = Vec::with_capacity(feats.len() + sent_feats.len());
            combined.extend_from_slice(feats);
            combined.extend_from_slice(sent_feats);
            std::borrow::Cow::Owned(combined)
        } else {
            std::borrow::Cow::Borrowed(feats)
        }
    }

    fn update_words_syntax(
        &self,
        state: &mut State,
        lr: real,
        words: &[CompactWord],
        sent_feats: &[i32],
        targets: &mut Vec<i32>,
    ) -> Result<()> {
        targets.clear();
        targets.extend(words.iter().map(|w| w.num));
        for w in 0..words.len() {
            if words[w].num == -1 {
                continue;
            }
            let feats =
                self.combine_feats(state, self.dict.get_subwords(words[w].num), sent_feats);
            let mut update =
                |pos: usize, state: &mut State| self.model.update(&feats, targets, pos, lr, state);
            for_each_sibling(words, w, state, &mut update)?;
            for_each_child(words, w, state, &mut update)?;
            for_each_head(words, w, state, &mut update)?;
        }
        Ok(())
    }

    fn update_phrases_syntax(
        &self,
        state: &mut State,
        lr: real,
        phrases: &[CompactWord],
        sent_feats: &[i32],
        targets: &mut Vec<i32>,
    ) -> Result<()> {
        targets.clear();
        targets.extend(phrases.iter().map(|w| w.num));
        for w in 0..phrases.len() {
            if !phrases[w].is_phrase() || phrases[w].num == -1 {
                continue;
            }
            let feats =
                self.combine_feats(state, self.dict.get_subwords(phrases[w].num), sent_feats);
            {
                let mut update = |pos: usize, state: &mut State| {
                    self.model.update(&feats, targets, pos, lr, state)
                };
                for_each_sibling(phrases, w, state, &mut update)?;
                for_each_child(phrases, w, state, &mut update)?;
                for_each_head(phrases, w, state, &mut update)?;
            }
            // the phrase also predicts itself from its component bag
            if feats.len() > 1 {
                self.model.update(&feats[1..], targets, w, lr, state)?;
            }
        }
        Ok(())
    }

    fn map_other_syntax(
        &self,
        state: &mut State,
        lr: real,
        target_words: &[CompactWord],
        other_words: &[CompactWord],
        mapping: &[i16],
        sent_feats: &[i32],
        targets: &mut Vec<i32>,
    ) -> Result<()> {
        targets.clear();
        targets.extend(target_words.iter().map(|w| w.num));
        for (i, ow) in other_words.iter().enumerate() {
            if ow.num == -1 {
                continue;
            }
            let target_pos = mapping.get(i).copied().unwrap_or(-1);
            if target_pos < 0 {
                continue;
            }
            let tp = target_pos as usize;
            if tp >= target_words.len() || target_words[tp].num == -1 {
                continue;
            }
            let feats = self.combine_feats(state, self.dict.get_subwords(ow.num), sent_feats);
            let mut update =
                |pos: usize, state: &mut State| self.model.update(&feats, targets, pos, lr, state);
            update(tp, state)?;
            for_each_sibling(target_words, tp, state, &mut update)?;
            for_each_child(target_words, tp, state, &mut update)?;
            for_each_head(target_words, tp, state, &mut update)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Persistence

    pub fn save_model(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| {
            Error::config(format!("{} cannot be opened for saving: {e}", path.display()))
        })?;
        let mut out = BufWriter::new(file);
        binio::write_i32(&mut out, MODEL_MAGIC)?;
        binio::write_i32(&mut out, MODEL_VERSION)?;
        self.args.save(&mut out)?;
        self.dict.save(&mut out)?;
        binio::write_bool(&mut out, self.quant)?;
        self.input.save(&mut out)?;
        binio::write_bool(&mut out, self.args.qout)?;
        self.output.save(&mut out)?;
        out.flush()?;
        Ok(())
    }

    pub fn load_model(path: &Path) -> Result<Self> {
        Self::load_model_with_buckets(path, MAX_VOCAB_SIZE)
    }

    pub fn load_model_with_buckets(path: &Path, nbuckets: usize) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            Error::config(format!("{} cannot be opened for loading: {e}", path.display()))
        })?;
        let mut inp = BufReader::new(file);
        Self::load_model_from(&mut inp, nbuckets)
            .map_err(|e| Error::format(format!("{}: {e}", path.display())))
    }

    fn load_model_from<R: Read>(inp: &mut R, nbuckets: usize) -> Result<Self> {
        let magic = binio::read_i32(inp)?;
        if magic != MODEL_MAGIC {
            return Err(Error::format("wrong file format".to_string()));
        }
        let version = binio::read_i32(inp)?;
        if version > MODEL_VERSION {
            return Err(Error::format(format!(
                "unsupported model version {version} (newest known is {MODEL_VERSION})"
            )));
        }
        let mut args = Args::default();
        args.load(inp)?;
        if version == 11 && args.model == ModelName::Sup {
            // old supervised models do not use char ngrams
            args.maxn = 0;
        }
        let dict = Dictionary::load_with_buckets(args.clone(), inp, nbuckets)?;

        let quant_input = binio::read_bool(inp)?;
        let input = if quant_input {
            Matrix::Quant(QuantMatrix::load(inp)?)
        } else {
            Matrix::Dense(DenseMatrix::load(inp)?)
        };
        if !quant_input && dict.is_pruned() {
            return Err(Error::format(
                "invalid model file: pruned dictionary with a dense input matrix".to_string(),
            ));
        }
        args.qout = binio::read_bool(inp)?;
        let output = if quant_input && args.qout {
            Matrix::Quant(QuantMatrix::load(inp)?)
        } else {
            Matrix::Dense(DenseMatrix::load(inp)?)
        };

        let dict = Arc::new(dict);
        let input = Arc::new(input);
        let output = Arc::new(output);
        let model = Self::build_model(&args, &dict, input.clone(), output.clone());
        Ok(Embedder {
            args,
            dict,
            input,
            output,
            model,
            quant: quant_input,
            version,
            token_count: AtomicI64::new(0),
            avg_loss: Real::default(),
            start: Instant::now(),
            word_vectors: None,
            train_error: Mutex::new(None),
            failed: AtomicBool::new(false),
        })
    }

    /// Text vector dump: `size dim` header, then one row per entry.
    pub fn save_vectors(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| {
            Error::config(format!(
                "{} cannot be opened for saving vectors: {e}",
                path.display()
            ))
        })?;
        let mut out = BufWriter::new(file);
        writeln!(out, "{} {}", self.dict.size(), self.args.dim)?;
        let mut vec = Vector::new(self.args.dim as usize);
        for i in 0..self.dict.size() {
            self.word_vector_by_id(&mut vec, i)?;
            writeln!(out, "{} {}", self.dict.get_word(i), vec)?;
        }
        out.flush()?;
        Ok(())
    }

    pub fn save_output(&self, path: &Path) -> Result<()> {
        if self.quant {
            return Err(Error::runtime(
                "saving the output matrix is not supported for quantized models".to_string(),
            ));
        }
        let file = File::create(path).map_err(|e| {
            Error::config(format!(
                "{} cannot be opened for saving vectors: {e}",
                path.display()
            ))
        })?;
        let mut out = BufWriter::new(file);
        let n = self.output.rows();
        writeln!(out, "{} {}", n, self.args.dim)?;
        let mut vec = Vector::new(self.args.dim as usize);
        for i in 0..n {
            let word = if self.args.model == ModelName::Sup {
                self.dict.get_label(i as i32)?
            } else {
                self.dict.get_word(i as i32)
            };
            vec.zero();
            vec.add_row(&self.output, i)?;
            writeln!(out, "{} {}", word, vec)?;
        }
        out.flush()?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Queries

    pub fn dimension(&self) -> i32 {
        self.args.dim
    }

    pub fn is_quant(&self) -> bool {
        self.quant
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    pub fn dictionary(&self) -> &Dictionary {
        &self.dict
    }

    pub fn input_matrix(&self) -> Result<&DenseMatrix> {
        self.input.as_dense()
    }

    pub fn output_matrix(&self) -> Result<&DenseMatrix> {
        self.output.as_dense()
    }

    fn word_vector_from(&self, vec: &mut Vector, ngrams: &[i32]) -> Result<bool> {
        if ngrams.is_empty() {
            return Ok(false);
        }
        vec.zero();
        for &id in ngrams {
            vec.add_row(&self.input, id as usize)?;
        }
        vec.mul(1.0 / ngrams.len() as real);
        Ok(true)
    }

    pub fn word_vector(&self, vec: &mut Vector, word: &str, pos_tag: u8) -> Result<bool> {
        let ngrams = self.dict.subwords_of(word, pos_tag);
        self.word_vector_from(vec, &ngrams)
    }

    pub fn word_vector_by_id(&self, vec: &mut Vector, id: i32) -> Result<bool> {
        vec.zero();
        let ngrams = self.dict.get_subwords(id);
        self.word_vector_from(vec, ngrams)
    }

    pub fn sentence_vector(&self, line: &str, svec: &mut Vector) -> Result<()> {
        svec.zero();
        if self.args.model == ModelName::Sup {
            let mut words = Vec::new();
            let mut labels = Vec::new();
            self.dict.get_line_labels(line, &mut words, &mut labels);
            for &id in &words {
                svec.add_row(&self.input, id as usize)?;
            }
            if !words.is_empty() {
                svec.mul(1.0 / words.len() as real);
            }
        } else {
            let mut vec = Vector::new(self.args.dim as usize);
            let mut count = 0;
            for word in line.split_whitespace() {
                if self.word_vector(&mut vec, word, 0)? {
                    let norm = vec.norm();
                    if norm > 0.0 {
                        vec.mul(1.0 / norm);
                        svec.add_vector(&vec);
                        count += 1;
                    }
                }
            }
            if count > 0 {
                svec.mul(1.0 / count as real);
            }
        }
        Ok(())
    }

    pub fn ngram_vectors(&self, word: &str) -> Result<Vec<(String, Vector)>> {
        let (ngrams, substrings) = self.dict.subwords_with_strings(word);
        let mut result = Vec::with_capacity(ngrams.len());
        for (id, sub) in ngrams.into_iter().zip(substrings) {
            let mut vec = Vector::new(self.args.dim as usize);
            if id >= 0 {
                vec.add_row(&self.input, id as usize)?;
            }
            result.push((sub, vec));
        }
        Ok(result)
    }

    fn ensure_word_vectors(&mut self) -> Result<()> {
        if self.word_vectors.is_some() {
            return Ok(());
        }
        let wv = DenseMatrix::new(self.dict.size() as usize, self.args.dim as usize);
        let mut vec = Vector::new(self.args.dim as usize);
        for i in 0..self.dict.size() {
            if self.word_vector_by_id(&mut vec, i)? {
                let norm = vec.norm();
                if norm > 0.0 {
                    for j in 0..vec.size() {
                        wv.set_at(i as usize, j, vec[j] / norm);
                    }
                }
            }
        }
        self.word_vectors = Some(wv);
        Ok(())
    }

    fn nn_search(
        dict: &Dictionary,
        wv: &DenseMatrix,
        query: &Vector,
        k: usize,
        ban: &HashSet<String>,
        allowed: KindSet,
    ) -> Result<Vec<(real, String)>> {
        let mut qnorm = query.norm();
        if qnorm.abs() < 1e-8 {
            qnorm = 1.0;
        }
        let mut heap: BinaryHeap<Reverse<(OrderedFloat<real>, i32)>> =
            BinaryHeap::with_capacity(k + 1);
        for i in 0..dict.size() {
            if !allowed.contains(dict.get_kind(i)) {
                continue;
            }
            if ban.contains(dict.get_word(i)) {
                continue;
            }
            let similarity = wv.dot_row(query, i as usize)? / qnorm;
            if heap.len() == k {
                if let Some(&Reverse((worst, _))) = heap.peek() {
                    if similarity < worst.0 {
                        continue;
                    }
                }
            }
            heap.push(Reverse((OrderedFloat(similarity), i)));
            if heap.len() > k {
                heap.pop();
            }
        }
        let mut out: Vec<(real, String)> = heap
            .into_iter()
            .map(|Reverse((s, i))| {
                let label = format!(
                    "{} {}_{}",
                    dict.get_kind(i) as u8,
                    dict.get_word(i),
                    dict.get_pos(i)
                );
                (s.0, label)
            })
            .collect();
        out.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(out)
    }

    pub fn nearest_neighbors(
        &mut self,
        word: &str,
        pos_tag: u8,
        k: usize,
        allowed: KindSet,
    ) -> Result<Vec<(real, String)>> {
        let mut query = Vector::new(self.args.dim as usize);
        self.word_vector(&mut query, word, pos_tag)?;
        self.ensure_word_vectors()?;
        let wv = self.word_vectors.as_ref().expect("vectors just built");
        let mut ban = HashSet::new();
        ban.insert(word.to_string());
        Self::nn_search(&self.dict, wv, &query, k, &ban, allowed)
    }

    /// `A - B + C` in the normalized space.
    pub fn analogies(
        &mut self,
        k: usize,
        word_a: &str,
        word_b: &str,
        word_c: &str,
    ) -> Result<Vec<(real, String)>> {
        let dim = self.args.dim as usize;
        let mut query = Vector::new(dim);
        let mut buffer = Vector::new(dim);
        self.word_vector(&mut buffer, word_a, 0)?;
        query.add_vector_scaled(&buffer, 1.0 / (buffer.norm() + 1e-8));
        self.word_vector(&mut buffer, word_b, 0)?;
        query.add_vector_scaled(&buffer, -1.0 / (buffer.norm() + 1e-8));
        self.word_vector(&mut buffer, word_c, 0)?;
        query.add_vector_scaled(&buffer, 1.0 / (buffer.norm() + 1e-8));

        self.ensure_word_vectors()?;
        let wv = self.word_vectors.as_ref().expect("vectors just built");
        let ban: HashSet<String> = [word_a, word_b, word_c]
            .iter()
            .map(|s| s.to_string())
            .collect();
        Self::nn_search(&self.dict, wv, &query, k, &ban, KindSet::ALL)
    }

    /// Cosine similarity, or `None` when either word is out of vocabulary.
    pub fn compare_words(
        &self,
        word1: &str,
        pos_tag1: u8,
        word2: &str,
        pos_tag2: u8,
    ) -> Result<Option<real>> {
        let dim = self.args.dim as usize;
        let mut query = Vector::new(dim);
        if !self.word_vector(&mut query, word1, pos_tag1)? {
            return Ok(None);
        }
        let mut other = Vector::new(dim);
        if !self.word_vector(&mut other, word2, pos_tag2)? {
            return Ok(None);
        }
        let mut dot = 0.0;
        for i in 0..dim {
            dot += query[i] * other[i];
        }
        Ok(Some(dot / query.norm() / other.norm()))
    }

    pub fn predict_ids(&self, k: i32, words: &[i32], threshold: real) -> Result<Predictions> {
        if words.is_empty() {
            return Ok(Predictions::new());
        }
        if self.args.model != ModelName::Sup {
            return Err(Error::config(
                "model needs to be supervised for prediction".to_string(),
            ));
        }
        let mut state = State::new(self.args.dim as usize, self.dict.nlabels() as usize, 0);
        let mut heap = Predictions::new();
        self.model.predict(words, k, threshold, &mut heap, &mut state)?;
        Ok(heap)
    }

    /// Predictions as `(probability, label)` pairs for one text line.
    pub fn predict_line(
        &self,
        text: &str,
        k: i32,
        threshold: real,
    ) -> Result<Vec<(real, String)>> {
        let mut words = Vec::new();
        let mut labels = Vec::new();
        self.dict.get_line_labels(text, &mut words, &mut labels);
        let predictions = self.predict_ids(k, &words, threshold)?;
        predictions
            .into_iter()
            .map(|(log_prob, id)| Ok((log_prob.exp(), self.dict.get_label(id)?.to_string())))
            .collect()
    }

    pub fn test<R: BufRead>(
        &self,
        reader: R,
        k: i32,
        threshold: real,
        meter: &mut crate::meter::Meter,
    ) -> Result<()> {
        let mut words = Vec::new();
        let mut labels = Vec::new();
        for line in reader.lines() {
            let line = line?;
            self.dict.get_line_labels(&line, &mut words, &mut labels);
            if !labels.is_empty() && !words.is_empty() {
                let predictions = self.predict_ids(k, &words, threshold)?;
                meter.log(&labels, &predictions);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Quantization

    fn select_embeddings(&self, cutoff: usize) -> Result<Vec<i32>> {
        let input = self.input.as_dense()?;
        let mut norms = Vector::new(input.rows());
        input.l2_norm_rows(&mut norms);
        let eosid = self.dict.get_id(EOS, 0, KindSet::ALL);
        let mut idx: Vec<i32> = (0..input.rows() as i32).collect();
        idx.sort_by(|&i1, &i2| {
            use std::cmp::Ordering::*;
            if i1 == eosid {
                Less
            } else if i2 == eosid {
                Greater
            } else {
                norms[i2 as usize]
                    .partial_cmp(&norms[i1 as usize])
                    .unwrap_or(Equal)
            }
        });
        idx.truncate(cutoff);
        Ok(idx)
    }

    /// Replace the dense matrices with product-quantized ones, optionally
    /// after pruning to the `cutoff` strongest rows and retraining.
    pub fn quantize(&mut self, qargs: &Args, callback: Option<ProgressCallback<'_>>) -> Result<()> {
        if self.args.model != ModelName::Sup {
            return Err(Error::runtime(
                "for now only supervised models can be quantized".to_string(),
            ));
        }
        self.args.input = qargs.input.clone();
        self.args.output = qargs.output.clone();
        self.args.qout = qargs.qout;

        if qargs.cutoff > 0 && (qargs.cutoff as usize) < self.input.rows() {
            let mut idx = self.select_embeddings(qargs.cutoff as usize)?;
            let dict = Arc::get_mut(&mut self.dict)
                .ok_or_else(|| Error::runtime("dictionary is shared during quantize".to_string()))?;
            dict.prune(&mut idx);

            let dim = self.args.dim as usize;
            let old = self.input.as_dense()?;
            let reduced = DenseMatrix::new(idx.len(), dim);
            for (i, &row) in idx.iter().enumerate() {
                for j in 0..dim {
                    reduced.set_at(i, j, old.at(row as usize, j));
                }
            }
            self.input = Arc::new(Matrix::Dense(reduced));
            if qargs.retrain {
                self.args.epoch = qargs.epoch;
                self.args.lr = qargs.lr;
                self.args.thread = qargs.thread;
                self.args.verbose = qargs.verbose;
                self.model =
                    Self::build_model(&self.args, &self.dict, self.input.clone(), self.output.clone());
                self.start_threads(callback)?;
            }
        }

        let quantized = QuantMatrix::quantize(
            self.input.as_dense()?,
            qargs.dsub.max(1) as usize,
            qargs.qnorm,
        )?;
        self.input = Arc::new(Matrix::Quant(quantized));
        if self.args.qout {
            let qout = QuantMatrix::quantize(self.output.as_dense()?, 2, qargs.qnorm)?;
            self.output = Arc::new(Matrix::Quant(qout));
        }
        self.quant = true;
        self.model = Self::build_model(&self.args, &self.dict, self.input.clone(), self.output.clone());
        self.word_vectors = None;
        Ok(())
    }
}

fn format_eta(mut secs: i64) -> String {
    let hours = secs / 3600;
    secs -= hours * 3600;
    let minutes = secs / 60;
    secs -= minutes * 60;
    format!("{hours}h{minutes}m{secs}s")
}

/// Read the next corpus line, wrapping around at end of file so every
/// thread sees `epoch * ntokens` worth of data regardless of its slice.
fn next_line(reader: &mut BufReader<File>, buf: &mut String) -> Result<()> {
    let mut rewinds = 0;
    loop {
        buf.clear();
        if reader.read_line(buf)? == 0 {
            rewinds += 1;
            if rewinds > 1 {
                return Err(Error::config(
                    "no usable lines in the training corpus".to_string(),
                ));
            }
            reader.rewind()?;
            continue;
        }
        if !buf.trim().is_empty() {
            return Ok(());
        }
    }
}

// ---------------------------------------------------------------------
// Dependency-tree walks shared by the syntactic update rules. All offsets
// come from parsed input, so every step is bounds-checked.

fn for_each_child<F>(
    words: &[CompactWord],
    head_pos: usize,
    state: &mut State,
    f: &mut F,
) -> Result<()>
where
    F: FnMut(usize, &mut State) -> Result<()>,
{
    if words[head_pos].first_child_offs() == 0 {
        return Ok(());
    }
    let mut child_pos = head_pos as i64 + words[head_pos].first_child_offs() as i64;
    for _ in 0..words.len() {
        if child_pos < 0 || child_pos as usize >= words.len() {
            break;
        }
        let child = words[child_pos as usize];
        if !is_modifier(child.synt_rel()) && child.num != -1 {
            f(child_pos as usize, state)?;
        }
        if child.next_sibling_offs() == 0 {
            break;
        }
        child_pos += child.next_sibling_offs() as i64;
    }
    Ok(())
}

fn for_each_sibling<F>(
    words: &[CompactWord],
    word_pos: usize,
    state: &mut State,
    f: &mut F,
) -> Result<()>
where
    F: FnMut(usize, &mut State) -> Result<()>,
{
    // rewind to the leftmost sibling, then sweep right
    let mut pos = word_pos;
    for _ in 0..words.len() {
        let prev = words[pos].prev_sibling_offs();
        if prev == 0 {
            break;
        }
        let p = pos as i64 + prev as i64;
        if p < 0 || p as usize >= words.len() {
            break;
        }
        pos = p as usize;
    }
    for _ in 0..words.len() {
        let sibling = words[pos];
        if !is_modifier(sibling.synt_rel()) && pos != word_pos && sibling.num != -1 {
            f(pos, state)?;
        }
        if sibling.next_sibling_offs() == 0 {
            break;
        }
        let p = pos as i64 + sibling.next_sibling_offs() as i64;
        if p < 0 || p as usize >= words.len() {
            break;
        }
        pos = p as usize;
    }
    Ok(())
}

fn for_each_head<F>(
    words: &[CompactWord],
    word_pos: usize,
    state: &mut State,
    f: &mut F,
) -> Result<()>
where
    F: FnMut(usize, &mut State) -> Result<()>,
{
    let mut pos = word_pos;
    for _ in 0..words.len() {
        let word = words[pos];
        let parent = pos as i64 + word.parent_offs() as i64;
        if parent < 0 || parent as usize >= words.len() {
            break;
        }
        let parent_pos = parent as usize;
        if words[parent_pos].num != -1 && parent_pos != pos {
            f(parent_pos, state)?;
        }
        // the walk stops at the root or after crossing a clausal or
        // modifier edge
        if words[parent_pos].parent_offs() == 0
            || is_clausal(word.synt_rel())
            || is_modifier(word.synt_rel())
        {
            break;
        }
        pos = parent_pos;
    }
    Ok(())
}
