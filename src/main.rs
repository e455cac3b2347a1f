use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use polyvec::args::{Args, LossName, ModelName};
use polyvec::dictionary::Dictionary;
use polyvec::meter::Meter;
use polyvec::vector::Vector;
use polyvec::{Embedder, KindSet};

#[derive(Parser)]
#[command(
    name = "polyvec",
    version,
    about = "Word, phrase and concept embeddings from annotated multilingual corpora"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct TrainOpts {
    /// Training corpus (one JSON record per line, or labeled text for
    /// supervised models)
    #[arg(long = "input", default_value = "")]
    input: PathBuf,

    /// Output prefix; the model goes to <output>.bin, vectors to
    /// <output>.vec
    #[arg(long = "output", default_value = "")]
    output: PathBuf,

    /// Prebuilt dictionary produced by create_dict
    #[arg(long = "dicPath", default_value = "")]
    dic_path: PathBuf,

    /// BPE merge rules used for subword extraction
    #[arg(long = "bpeCodesPath", default_value = "")]
    bpe_codes_path: PathBuf,

    /// Override the model chosen by the subcommand
    #[arg(long = "model")]
    model: Option<String>,

    #[arg(long = "dim", default_value_t = 100)]
    dim: i32,

    /// Learning rate; defaults to 0.1 for supervised and 0.05 otherwise
    #[arg(long = "lr")]
    lr: Option<f64>,

    #[arg(long = "lrUpdateRate", default_value_t = 100)]
    lr_update_rate: i64,

    #[arg(long = "ws", default_value_t = 5)]
    ws: i32,

    #[arg(long = "epoch", default_value_t = 5)]
    epoch: i32,

    #[arg(long = "minCount", default_value_t = 5)]
    min_count: i64,

    #[arg(long = "minCountLabel", default_value_t = 0)]
    min_count_label: i64,

    #[arg(long = "neg", default_value_t = 5)]
    neg: i32,

    #[arg(long = "wordNgrams", default_value_t = 1)]
    word_ngrams: i32,

    /// ns, hs, softmax or ova
    #[arg(long = "loss", default_value = "ns")]
    loss: String,

    #[arg(long = "bucket", default_value_t = 2_000_000)]
    bucket: i32,

    #[arg(long = "minn", default_value_t = 3)]
    minn: i32,

    #[arg(long = "maxn", default_value_t = 6)]
    maxn: i32,

    #[arg(long = "thread", default_value_t = 12)]
    thread: i32,

    /// Subsampling threshold
    #[arg(long = "t", default_value_t = 1e-4)]
    t: f64,

    #[arg(long = "label", default_value = "__label__")]
    label: String,

    #[arg(long = "verbose", default_value_t = 2)]
    verbose: i32,

    #[arg(long = "pretrainedVectors")]
    pretrained_vectors: Option<PathBuf>,

    #[arg(long = "saveOutput")]
    save_output: bool,

    #[arg(long = "seed", default_value_t = 0)]
    seed: i32,

    /// Chance in tenths of mixing sentence concepts into token features
    #[arg(long = "addSentFeats", default_value_t = 0)]
    add_sent_feats: i32,

    #[arg(long = "maxBpeVars", default_value_t = 3)]
    max_bpe_vars: i32,

    #[arg(long = "qout")]
    qout: bool,

    #[arg(long = "qnorm")]
    qnorm: bool,

    #[arg(long = "cutoff", default_value_t = 0)]
    cutoff: i64,

    #[arg(long = "retrain")]
    retrain: bool,

    #[arg(long = "dsub", default_value_t = 2)]
    dsub: i32,
}

impl TrainOpts {
    fn to_args(&self, model: ModelName) -> Result<Args> {
        let model = match self.model.as_deref() {
            None => model,
            Some("cbow") => ModelName::Cbow,
            Some("sg") | Some("skipgram") => ModelName::Sg,
            Some("sup") | Some("supervised") => ModelName::Sup,
            Some("syntax_sg") | Some("syntax_skipgram") => ModelName::SyntaxSg,
            Some("hybrid_sg") | Some("hybrid_skipgram") => ModelName::HybridSg,
            Some(other) => anyhow::bail!("unknown model: {other}"),
        };
        let mut args = Args::default();
        args.input = self.input.clone();
        args.output = self.output.clone();
        args.dic_path = self.dic_path.clone();
        args.bpe_codes_path = self.bpe_codes_path.clone();
        args.pretrained_vectors = self.pretrained_vectors.clone();
        args.model = model;
        args.loss = LossName::parse(&self.loss)?;
        args.dim = self.dim;
        args.lr = self.lr.unwrap_or(if model == ModelName::Sup { 0.1 } else { 0.05 });
        args.lr_update_rate = self.lr_update_rate;
        args.ws = self.ws;
        args.epoch = self.epoch;
        args.min_count = self.min_count;
        args.min_count_label = self.min_count_label;
        args.neg = self.neg;
        args.word_ngrams = self.word_ngrams;
        args.bucket = self.bucket;
        args.minn = self.minn;
        args.maxn = self.maxn;
        args.thread = self.thread;
        args.t = self.t;
        args.label = self.label.clone();
        args.verbose = self.verbose;
        args.save_output = self.save_output;
        args.seed = self.seed;
        args.add_sent_feats = self.add_sent_feats;
        args.max_bpe_vars = self.max_bpe_vars;
        args.qout = self.qout;
        args.qnorm = self.qnorm;
        args.cutoff = self.cutoff;
        args.retrain = self.retrain;
        args.dsub = self.dsub;
        Ok(args)
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum DumpOption {
    Args,
    Dict,
    Input,
    Output,
}

#[derive(Subcommand)]
enum Command {
    /// Train a supervised classifier
    Supervised(TrainOpts),
    /// Train a skipgram model
    Skipgram(TrainOpts),
    /// Train a syntax-skipgram model
    #[command(name = "syntax_skipgram")]
    SyntaxSkipgram(TrainOpts),
    /// Train a classic skipgram model that also uses syntactic context
    #[command(name = "hybrid_skipgram")]
    HybridSkipgram(TrainOpts),
    /// Train a cbow model
    Cbow(TrainOpts),
    /// Quantize a model to reduce memory usage
    Quantize(TrainOpts),
    /// Evaluate a supervised classifier
    Test {
        model: PathBuf,
        /// Test data file, or - for stdin
        test_data: PathBuf,
        #[arg(default_value_t = 1)]
        k: i32,
        #[arg(default_value_t = 0.0)]
        threshold: f32,
    },
    /// Print per-label precision and recall scores
    #[command(name = "test-label")]
    TestLabel {
        model: PathBuf,
        test_data: PathBuf,
        #[arg(default_value_t = 1)]
        k: i32,
        #[arg(default_value_t = 0.0)]
        threshold: f32,
    },
    /// Predict most likely labels
    Predict {
        model: PathBuf,
        test_data: PathBuf,
        #[arg(default_value_t = 1)]
        k: i32,
        #[arg(default_value_t = 0.0)]
        threshold: f32,
    },
    /// Predict most likely labels with probabilities
    #[command(name = "predict-prob")]
    PredictProb {
        model: PathBuf,
        test_data: PathBuf,
        #[arg(default_value_t = 1)]
        k: i32,
        #[arg(default_value_t = 0.0)]
        threshold: f32,
    },
    /// Print word vectors for words on stdin
    #[command(name = "print-word-vectors")]
    PrintWordVectors { model: PathBuf },
    /// Print sentence vectors for lines on stdin
    #[command(name = "print-sentence-vectors")]
    PrintSentenceVectors { model: PathBuf },
    /// Print subword vectors of a word
    #[command(name = "print-ngrams")]
    PrintNgrams { model: PathBuf, word: String },
    /// Query nearest neighbors interactively
    Nn {
        model: PathBuf,
        #[arg(default_value_t = 10)]
        k: usize,
        /// Entry-kind bitmask to search (word=1 label=2 phrase=4
        /// concept=8 subword=16)
        #[arg(default_value_t = 255)]
        allowed_types: u8,
    },
    /// Query analogies (A - B + C) interactively
    Analogies {
        model: PathBuf,
        #[arg(default_value_t = 10)]
        k: usize,
    },
    /// Dump arguments, dictionary or matrices as text
    Dump {
        model: PathBuf,
        #[arg(value_enum)]
        option: DumpOption,
    },
    /// Build a dictionary from a corpus and save it
    #[command(name = "create_dict")]
    CreateDict(TrainOpts),
    /// Print a saved dictionary as text
    #[command(name = "dump_dict")]
    DumpDict { dict: PathBuf },
    /// Score word pairs from a CSV file
    Compare {
        model: PathBuf,
        input: PathBuf,
        output: PathBuf,
        #[arg(long = "no-pos-tag")]
        no_pos_tag: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_target(false)
        .init();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Supervised(opts) => train(&opts, ModelName::Sup),
        Command::Skipgram(opts) => train(&opts, ModelName::Sg),
        Command::SyntaxSkipgram(opts) => train(&opts, ModelName::SyntaxSg),
        Command::HybridSkipgram(opts) => train(&opts, ModelName::HybridSg),
        Command::Cbow(opts) => train(&opts, ModelName::Cbow),
        Command::Quantize(opts) => quantize(&opts),
        Command::Test {
            model,
            test_data,
            k,
            threshold,
        } => test(&model, &test_data, k, threshold, false),
        Command::TestLabel {
            model,
            test_data,
            k,
            threshold,
        } => test(&model, &test_data, k, threshold, true),
        Command::Predict {
            model,
            test_data,
            k,
            threshold,
        } => predict(&model, &test_data, k, threshold, false),
        Command::PredictProb {
            model,
            test_data,
            k,
            threshold,
        } => predict(&model, &test_data, k, threshold, true),
        Command::PrintWordVectors { model } => print_word_vectors(&model),
        Command::PrintSentenceVectors { model } => print_sentence_vectors(&model),
        Command::PrintNgrams { model, word } => print_ngrams(&model, &word),
        Command::Nn {
            model,
            k,
            allowed_types,
        } => nn(&model, k, KindSet(allowed_types)),
        Command::Analogies { model, k } => analogies(&model, k),
        Command::Dump { model, option } => dump(&model, option),
        Command::CreateDict(opts) => create_dict(&opts),
        Command::DumpDict { dict } => dump_dict(&dict),
        Command::Compare {
            model,
            input,
            output,
            no_pos_tag,
        } => compare(&model, &input, &output, no_pos_tag),
    }
}

fn with_extension(prefix: &Path, ext: &str) -> PathBuf {
    let mut path = prefix.as_os_str().to_owned();
    path.push(ext);
    PathBuf::from(path)
}

fn train(opts: &TrainOpts, model: ModelName) -> Result<()> {
    let args = opts.to_args(model)?;
    let model_path = with_extension(&args.output, ".bin");
    // fail before hours of training, not after
    File::create(&model_path)
        .with_context(|| format!("{} cannot be opened for saving", model_path.display()))?;

    let embedder = Embedder::train(&args, None)?;
    embedder.save_model(&model_path)?;
    embedder.save_vectors(&with_extension(&args.output, ".vec"))?;
    if args.save_output {
        embedder.save_output(&with_extension(&args.output, ".output"))?;
    }
    Ok(())
}

fn quantize(opts: &TrainOpts) -> Result<()> {
    let qargs = opts.to_args(ModelName::Sup)?;
    let mut embedder = Embedder::load_model(&with_extension(&qargs.output, ".bin"))?;
    embedder.quantize(&qargs, None)?;
    embedder.save_model(&with_extension(&qargs.output, ".ftz"))?;
    Ok(())
}

fn open_input(path: &Path) -> Result<Box<dyn BufRead>> {
    if path.as_os_str() == "-" {
        Ok(Box::new(BufReader::new(io::stdin())))
    } else {
        let file =
            File::open(path).with_context(|| format!("{} cannot be opened", path.display()))?;
        Ok(Box::new(BufReader::new(file)))
    }
}

fn write_metric(name: &str, value: f64) {
    print!("{name} : ");
    if value.is_finite() {
        print!("{value:.6}");
    } else {
        print!("--------");
    }
    print!("  ");
}

fn test(model: &Path, test_data: &Path, k: i32, threshold: f32, per_label: bool) -> Result<()> {
    let embedder = Embedder::load_model(model)?;
    let mut meter = Meter::new();
    embedder.test(open_input(test_data)?, k, threshold, &mut meter)?;

    if per_label {
        let dict = embedder.dictionary();
        for label_id in 0..dict.nlabels() {
            write_metric("F1-Score", meter.label_f1(label_id));
            write_metric("Precision", meter.label_precision(label_id));
            write_metric("Recall", meter.label_recall(label_id));
            println!(" {}", dict.get_label(label_id)?);
        }
    }
    let mut stdout = io::stdout().lock();
    meter.write_general_metrics(&mut stdout, k)?;
    Ok(())
}

fn print_predictions(predictions: &[(f32, String)], print_prob: bool, multiline: bool) {
    let mut first = true;
    for (prob, label) in predictions {
        if !first && !multiline {
            print!(" ");
        }
        first = false;
        print!("{label}");
        if print_prob {
            print!(" {prob}");
        }
        if multiline {
            println!();
        }
    }
    if !multiline {
        println!();
    }
}

fn predict(model: &Path, test_data: &Path, k: i32, threshold: f32, print_prob: bool) -> Result<()> {
    let embedder = Embedder::load_model(model)?;
    for line in open_input(test_data)?.lines() {
        let line = line?;
        let predictions = embedder.predict_line(&line, k, threshold)?;
        print_predictions(&predictions, print_prob, false);
    }
    Ok(())
}

fn print_word_vectors(model: &Path) -> Result<()> {
    let embedder = Embedder::load_model(model)?;
    let mut vec = Vector::new(embedder.dimension() as usize);
    for line in io::stdin().lock().lines() {
        let line = line?;
        for word in line.split_whitespace() {
            embedder.word_vector(&mut vec, word, 0)?;
            println!("{word} {vec}");
        }
    }
    Ok(())
}

fn print_sentence_vectors(model: &Path) -> Result<()> {
    let embedder = Embedder::load_model(model)?;
    let mut svec = Vector::new(embedder.dimension() as usize);
    for line in io::stdin().lock().lines() {
        let line = line?;
        embedder.sentence_vector(&line, &mut svec)?;
        println!("{svec}");
    }
    Ok(())
}

fn print_ngrams(model: &Path, word: &str) -> Result<()> {
    let embedder = Embedder::load_model(model)?;
    for (ngram, vec) in embedder.ngram_vectors(word)? {
        println!("{ngram} {vec}");
    }
    Ok(())
}

fn nn(model: &Path, k: usize, allowed: KindSet) -> Result<()> {
    let mut embedder = Embedder::load_model(model)?;
    print!("Query word? ");
    io::stdout().flush()?;
    for line in io::stdin().lock().lines() {
        let line = line?;
        for word in line.split_whitespace() {
            let neighbors = embedder.nearest_neighbors(word, 0, k, allowed)?;
            print_predictions(&neighbors, true, true);
        }
        print!("Query word? ");
        io::stdout().flush()?;
    }
    Ok(())
}

fn analogies(model: &Path, k: usize) -> Result<()> {
    let mut embedder = Embedder::load_model(model)?;
    print!("Query triplet (A - B + C)? ");
    io::stdout().flush()?;
    for line in io::stdin().lock().lines() {
        let line = line?;
        let mut words = line.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some(a), Some(b), Some(c)) => {
                let results = embedder.analogies(k, a, b, c)?;
                print_predictions(&results, true, true);
            }
            _ => eprintln!("expected three words"),
        }
        print!("Query triplet (A - B + C)? ");
        io::stdout().flush()?;
    }
    Ok(())
}

fn dump(model: &Path, option: DumpOption) -> Result<()> {
    let embedder = Embedder::load_model(model)?;
    let mut stdout = io::stdout().lock();
    match option {
        DumpOption::Args => embedder.args().dump(&mut stdout)?,
        DumpOption::Dict => embedder.dictionary().dump(&mut stdout)?,
        DumpOption::Input => {
            if embedder.is_quant() {
                eprintln!("Not supported for quantized models.");
            } else {
                embedder.input_matrix()?.dump(&mut stdout)?;
            }
        }
        DumpOption::Output => {
            if embedder.is_quant() {
                eprintln!("Not supported for quantized models.");
            } else {
                embedder.output_matrix()?.dump(&mut stdout)?;
            }
        }
    }
    Ok(())
}

fn create_dict(opts: &TrainOpts) -> Result<()> {
    let args = opts.to_args(ModelName::Sg)?;
    let input = File::open(&args.input)
        .with_context(|| format!("failed to open {}", args.input.display()))?;
    let mut dict = Dictionary::new(args.clone())?;
    dict.read_from_file(BufReader::new(input))?;

    let out = File::create(&args.output)
        .with_context(|| format!("{} cannot be opened for saving dict", args.output.display()))?;
    let mut out = io::BufWriter::new(out);
    dict.save(&mut out)?;
    out.flush()?;
    Ok(())
}

fn dump_dict(path: &Path) -> Result<()> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let dict = Dictionary::load(Args::default(), &mut BufReader::new(file))?;
    let mut stdout = io::stdout().lock();
    dict.dump(&mut stdout)?;
    Ok(())
}

fn compare(model: &Path, input: &Path, output: &Path, no_pos_tag: bool) -> Result<()> {
    let embedder = Embedder::load_model(model)?;
    let reader = BufReader::new(
        File::open(input).with_context(|| format!("failed to open {}", input.display()))?,
    );
    let mut out = io::BufWriter::new(
        File::create(output).with_context(|| format!("failed to open {}", output.display()))?,
    );

    let mut oov_count = 0u32;
    // skip the header line
    for line in reader.lines().skip(1) {
        let line = line?;
        let parts: Vec<&str> = line.split(',').collect();
        anyhow::ensure!(parts.len() == 5, "expected 5 comma-separated fields: {line}");
        let pos_tag = if no_pos_tag {
            0
        } else {
            match parts[3] {
                "nouns" => 2,
                "verbs" => 1,
                "adjectives" => 3,
                "adverbs" => 13,
                other => anyhow::bail!("unknown pos_tag {other}"),
            }
        };
        let sim = match embedder.compare_words(parts[1], pos_tag, parts[2], pos_tag)? {
            Some(sim) => sim,
            None => {
                oov_count += 1;
                0.0
            }
        };
        writeln!(out, "{},{},{},{}", parts[0], parts[1], parts[2], sim)?;
    }
    out.flush()?;
    println!("Count of OOV word pairs {oov_count}");
    Ok(())
}
