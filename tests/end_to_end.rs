//! Full-pipeline tests: build a dictionary from a small annotated corpus,
//! train, persist, reload and query. Bucket counts are kept small so the
//! flat vocabulary table stays test-sized.

use std::fs;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use polyvec::args::{Args, LossName, ModelName};
use polyvec::bpe::BpeEncoder;
use polyvec::dictionary::Dictionary;
use polyvec::meter::Meter;
use polyvec::vector::Vector;
use polyvec::{Embedder, KindSet};

const BUCKETS: usize = 1 << 14;

fn corpus() -> String {
    let mut lines = Vec::new();
    let records = [
        r#"{"target": {"words": [{"w": "the", "p": 1}, {"w": "dog", "p": 2, "l": -1, "n": 1}, {"w": "barks", "p": 3, "l": 0, "n": 0}], "phrases": [{"w": "the dog", "i": "the_dog", "l": 0, "C": [0, 1]}], "concepts": ["Q144"]}, "other_langs": [{"words": [{"w": "perro", "p": 2, "l": 0, "n": 0}], "origin": 2, "words_mapping": [1], "phrases_mapping": []}]}"#,
        r#"{"target": {"words": [{"w": "the", "p": 1}, {"w": "cat", "p": 2, "l": -1, "n": 1}, {"w": "sleeps", "p": 3, "l": 0, "n": 0}], "phrases": [{"w": "the cat", "i": "the_cat", "l": 0, "C": [0, 1]}], "concepts": ["Q146"]}}"#,
        r#"{"target": {"words": [{"w": "dog", "p": 2, "l": 1, "n": 1}, {"w": "sleeps", "p": 3, "l": 0, "n": 0}]}}"#,
        r#"{"target": {"words": [{"w": "cat", "p": 2, "l": 1, "n": 1}, {"w": "barks", "p": 3, "l": 0, "n": 0}]}}"#,
        r#"{"target": {"words": [{"w": "dog"}, {"w": "barks"}]}}"#,
        r#"{"target": {"words": [{"w": "cat"}, {"w": "sleeps"}]}}"#,
    ];
    for _ in 0..4 {
        for r in records {
            lines.push(r.to_string());
        }
    }
    lines.join("\n") + "\n"
}

fn base_args(dir: &Path, model: ModelName) -> Args {
    let mut args = Args::default();
    args.model = model;
    args.input = dir.join("corpus.jsonl");
    args.dic_path = dir.join("dict.bin");
    args.output = dir.join("model");
    args.dim = 4;
    args.ws = 2;
    args.epoch = 4;
    args.min_count = 1;
    args.neg = 2;
    args.thread = 1;
    args.verbose = 0;
    args.seed = 7;
    args.t = 1.0; // tiny corpus, keep every token
    args.lr_update_rate = 10;
    args
}

fn build_dict(dir: &Path, args: &Args) {
    fs::write(dir.join("corpus.jsonl"), corpus()).unwrap();
    let mut dict = Dictionary::with_buckets(args.clone(), BpeEncoder::new(), BUCKETS);
    dict.read_from_file(BufReader::new(fs::File::open(dir.join("corpus.jsonl")).unwrap()))
        .unwrap();
    let mut out = Vec::new();
    dict.save(&mut out).unwrap();
    fs::write(dir.join("dict.bin"), out).unwrap();
}

fn train(args: &Args) -> Embedder {
    Embedder::train_with_buckets(args, None, BUCKETS).unwrap()
}

#[test]
fn skipgram_trains_and_round_trips() {
    let dir = TempDir::new().unwrap();
    let args = base_args(dir.path(), ModelName::Sg);
    build_dict(dir.path(), &args);

    let embedder = train(&args);
    let model_path = dir.path().join("model.bin");
    embedder.save_model(&model_path).unwrap();

    let loaded = Embedder::load_model_with_buckets(&model_path, BUCKETS).unwrap();
    assert_eq!(loaded.version(), 12);
    assert!(!loaded.is_quant());

    // dictionary and vectors survive the round trip byte for byte
    let mut dump_a = Vec::new();
    let mut dump_b = Vec::new();
    embedder.dictionary().dump(&mut dump_a).unwrap();
    loaded.dictionary().dump(&mut dump_b).unwrap();
    assert_eq!(dump_a, dump_b);

    let vec_a = dir.path().join("a.vec");
    let vec_b = dir.path().join("b.vec");
    embedder.save_vectors(&vec_a).unwrap();
    loaded.save_vectors(&vec_b).unwrap();
    assert_eq!(fs::read(vec_a).unwrap(), fs::read(vec_b).unwrap());
}

#[test]
fn training_is_deterministic_for_a_fixed_seed() {
    let dir = TempDir::new().unwrap();
    let args = base_args(dir.path(), ModelName::Sg);
    build_dict(dir.path(), &args);

    let a = train(&args);
    let b = train(&args);
    let vec_a = dir.path().join("a.vec");
    let vec_b = dir.path().join("b.vec");
    a.save_vectors(&vec_a).unwrap();
    b.save_vectors(&vec_b).unwrap();
    assert_eq!(fs::read(vec_a).unwrap(), fs::read(vec_b).unwrap());
}

#[test]
fn syntax_skipgram_trains_with_concept_features() {
    let dir = TempDir::new().unwrap();
    let mut args = base_args(dir.path(), ModelName::SyntaxSg);
    args.add_sent_feats = 5;
    build_dict(dir.path(), &args);

    let mut embedder = train(&args);
    let neighbors = embedder
        .nearest_neighbors("dog", 2, 3, KindSet::ALL)
        .unwrap();
    assert_eq!(neighbors.len(), 3);
    // similarities are cosines
    for (sim, _) in &neighbors {
        assert!(*sim <= 1.001 && *sim >= -1.001);
    }
}

#[test]
fn hybrid_skipgram_trains() {
    let dir = TempDir::new().unwrap();
    let args = base_args(dir.path(), ModelName::HybridSg);
    build_dict(dir.path(), &args);
    let embedder = train(&args);

    let sim = embedder.compare_words("dog", 2, "cat", 2).unwrap();
    assert!(sim.is_some());
    assert!(embedder.compare_words("dog", 2, "unicorn", 2).unwrap().is_none());
}

#[test]
fn analogy_queries_return_ranked_results() {
    let dir = TempDir::new().unwrap();
    let args = base_args(dir.path(), ModelName::Sg);
    build_dict(dir.path(), &args);
    let mut embedder = train(&args);

    let results = embedder.analogies(2, "dog", "barks", "sleeps").unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0].0 >= results[1].0);
}

#[test]
fn kind_filter_restricts_neighbor_search() {
    let dir = TempDir::new().unwrap();
    let args = base_args(dir.path(), ModelName::Sg);
    build_dict(dir.path(), &args);
    let mut embedder = train(&args);

    let phrases_only = embedder
        .nearest_neighbors("dog", 2, 10, polyvec::EntryKind::Phrase.into())
        .unwrap();
    assert!(!phrases_only.is_empty());
    for (_, label) in &phrases_only {
        assert!(label.starts_with("4 "), "not a phrase: {label}");
    }
}

fn supervised_corpus(dir: &Path) -> PathBuf {
    let path = dir.join("sup.txt");
    let mut f = fs::File::create(&path).unwrap();
    for _ in 0..20 {
        writeln!(f, "__label__pos good fine nice").unwrap();
        writeln!(f, "__label__neg bad awful poor").unwrap();
    }
    path
}

fn supervised_args(dir: &Path) -> Args {
    let mut args = Args::default();
    args.model = ModelName::Sup;
    args.loss = LossName::Softmax;
    args.input = supervised_corpus(dir);
    args.dic_path = dir.join("sup-dict.bin");
    args.output = dir.join("sup-model");
    args.dim = 4;
    args.epoch = 8;
    args.lr = 0.5;
    args.min_count = 1;
    args.thread = 1;
    args.verbose = 0;
    args.maxn = 0;
    args.word_ngrams = 1;
    args.lr_update_rate = 10;
    args
}

fn build_supervised_dict(dir: &Path, args: &Args) {
    // the dictionary builder streams JSON; labeled text is ingested
    // through the token API instead
    let mut dict = Dictionary::with_buckets(args.clone(), BpeEncoder::new(), BUCKETS);
    let text = fs::read_to_string(&args.input).unwrap();
    for line in text.lines() {
        for token in line.split_whitespace() {
            dict.add(token);
        }
        dict.add("</s>");
    }
    dict.threshold(args.min_count, args.min_count_label);
    dict.init_table_discard();
    let mut out = Vec::new();
    dict.save(&mut out).unwrap();
    fs::write(&args.dic_path, out).unwrap();
}

#[test]
fn supervised_training_predicts_labels() {
    let dir = TempDir::new().unwrap();
    let args = supervised_args(dir.path());
    build_supervised_dict(dir.path(), &args);

    let embedder = train(&args);
    let predictions = embedder.predict_line("good fine", 1, 0.0).unwrap();
    assert_eq!(predictions.len(), 1);
    assert_eq!(predictions[0].1, "__label__pos");
    assert!(predictions[0].0 > 0.5);

    let mut meter = Meter::new();
    embedder
        .test(
            BufReader::new(fs::File::open(&args.input).unwrap()),
            1,
            0.0,
            &mut meter,
        )
        .unwrap();
    assert_eq!(meter.nexamples(), 40);
    assert!(meter.precision() > 0.9);
}

#[test]
fn quantization_preserves_predictions() {
    let dir = TempDir::new().unwrap();
    let args = supervised_args(dir.path());
    build_supervised_dict(dir.path(), &args);
    let mut embedder = train(&args);

    let before = embedder.predict_line("good fine", 1, 0.0).unwrap();

    let mut qargs = args.clone();
    qargs.dsub = 2;
    qargs.qnorm = true;
    embedder.quantize(&qargs, None).unwrap();
    assert!(embedder.is_quant());
    assert!(embedder.output_matrix().is_ok(), "qout off keeps output dense");

    let after = embedder.predict_line("good fine", 1, 0.0).unwrap();
    assert_eq!(before[0].1, after[0].1);

    // quantized models persist and reload
    let path = dir.path().join("sup-model.ftz");
    embedder.save_model(&path).unwrap();
    let loaded = Embedder::load_model_with_buckets(&path, BUCKETS).unwrap();
    assert!(loaded.is_quant());
    let reloaded = loaded.predict_line("good fine", 1, 0.0).unwrap();
    assert_eq!(reloaded[0].1, after[0].1);
    assert!(loaded.input_matrix().is_err(), "quantized input cannot be exported");
}

#[test]
fn non_supervised_models_refuse_to_quantize() {
    let dir = TempDir::new().unwrap();
    let args = base_args(dir.path(), ModelName::Sg);
    build_dict(dir.path(), &args);
    let mut embedder = train(&args);
    assert!(embedder.quantize(&args.clone(), None).is_err());
}

#[test]
fn wrong_magic_is_a_format_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bogus.bin");
    fs::write(&path, [0u8; 64]).unwrap();
    let err = Embedder::load_model_with_buckets(&path, BUCKETS).unwrap_err();
    assert!(err.to_string().contains("wrong file format"), "{err}");
}

#[test]
fn newer_versions_are_rejected_and_v11_supervised_drops_maxn() {
    let dir = TempDir::new().unwrap();
    let mut args = supervised_args(dir.path());
    args.maxn = 6;
    build_supervised_dict(dir.path(), &args);
    let embedder = train(&args);
    let path = dir.path().join("sup-model.bin");
    embedder.save_model(&path).unwrap();

    // version too new
    let mut bytes = fs::read(&path).unwrap();
    bytes[4..8].copy_from_slice(&13i32.to_le_bytes());
    let newer = dir.path().join("newer.bin");
    fs::write(&newer, &bytes).unwrap();
    assert!(Embedder::load_model_with_buckets(&newer, BUCKETS).is_err());

    // version 11 supervised: char ngrams did not exist yet
    bytes[4..8].copy_from_slice(&11i32.to_le_bytes());
    let older = dir.path().join("older.bin");
    fs::write(&older, &bytes).unwrap();
    let loaded = Embedder::load_model_with_buckets(&older, BUCKETS).unwrap();
    assert_eq!(loaded.version(), 11);
    assert_eq!(loaded.args().maxn, 0);
}

#[test]
fn sentence_vectors_average_known_words() {
    let dir = TempDir::new().unwrap();
    let args = base_args(dir.path(), ModelName::Sg);
    build_dict(dir.path(), &args);
    let embedder = train(&args);

    let mut svec = Vector::new(4);
    embedder.sentence_vector("dog cat", &mut svec).unwrap();
    let norm = svec.norm();
    assert!(norm > 0.0);

    let mut empty = Vector::new(4);
    embedder.sentence_vector("unicorn", &mut empty).unwrap();
    assert_eq!(empty.norm(), 0.0);
}
