//! Loading of pronunciation lexicons for training. These are files like CMU dict where each line
//! is a word followed by the phonemes it's pronounced with:
//!
//! ```text
//! ;;; comments start with a configurable prefix
//! RECORD(1)  R EH1 K ER0 D
//! RECORD(2)  R IH0 K AO1 R D
//! ```
//!
//! Words with multiple pronunciations get a `(n)` suffix and vowels carry stress digits. The
//! model we train doesn't predict stress and doesn't care about homograph numbering, so both are
//! stripped by default. What's left is mapped into the vocabulary index space. Anything the
//! vocabulary doesn't know about becomes `<unk>` and is collected into a report, this is mainly so
//! you can spot a vocabulary that doesn't cover your dictionary before spending hours training.
use crate::config::{DatasetConfig, G2pConfig};
use crate::vocab::*;
use anyhow::{ensure, Context};
use candle_core::{Device, Tensor};
use once_cell::sync::OnceCell;
use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;
use tracing::{info, warn};
use unicode_segmentation::UnicodeSegmentation;

/// Removes a trailing `(n)` homograph marker or trailing stress digits. Runs of these are removed
/// together so `AB1(2)` becomes `AB` and stripping a second time never changes anything.
pub fn strip_digits(x: &str) -> String {
    static DIGIT_REGEX: OnceCell<Regex> = OnceCell::new();
    let digit_regex = DIGIT_REGEX.get_or_init(|| Regex::new(r"(?:\(\d+\)|\d+)+$").unwrap());

    digit_regex.replace(x, "").into_owned()
}

/// A single line of the lexicon once parsed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub word: String,
    pub pronunciation: Vec<String>,
}

impl Entry {
    /// Splits the word into the units fed into the encoder. Extended grapheme clusters are used so
    /// a letter with a combining accent stays one input symbol.
    pub fn graphemes(&self) -> impl Iterator<Item = &str> {
        self.word.graphemes(true)
    }
}

/// Parses the lexicon, one entry is created for every line with a word and at least one phoneme.
/// Blank lines, comments and lines with a single field are skipped without complaint.
pub fn load_dict(reader: impl BufRead, config: &DatasetConfig) -> io::Result<Vec<Entry>> {
    let mut entries = vec![];
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty()
            || (!config.comment_prefix.is_empty() && line.starts_with(&config.comment_prefix))
        {
            continue;
        }

        let mut parts = line.split_whitespace();
        let (word, first_phone) = match (parts.next(), parts.next()) {
            (Some(w), Some(p)) => (w, p),
            _ => continue,
        };

        let word = if config.remove_word_digits {
            strip_digits(word)
        } else {
            word.to_string()
        };
        let pronunciation = std::iter::once(first_phone)
            .chain(parts)
            .map(|p| {
                if config.remove_phoneme_digits {
                    strip_digits(p)
                } else {
                    p.to_string()
                }
            })
            .collect();

        entries.push(Entry {
            word,
            pronunciation,
        });
    }
    Ok(entries)
}

/// Which symbols in the lexicon the vocabularies don't cover.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageReport {
    pub graphemes: Vec<String>,
    pub ignored_graphemes: BTreeSet<String>,
    pub phonemes: Vec<String>,
    pub ignored_phonemes: BTreeSet<String>,
}

impl CoverageReport {
    fn new(graphemes: &Vocabulary, phonemes: &Vocabulary, entries: &[Entry]) -> Self {
        let mut ignored_graphemes = BTreeSet::new();
        let mut ignored_phonemes = BTreeSet::new();
        for entry in entries {
            for g in entry.graphemes().filter(|g| !graphemes.contains(g)) {
                ignored_graphemes.insert(g.to_string());
            }
            for p in entry.pronunciation.iter().filter(|p| !phonemes.contains(p)) {
                ignored_phonemes.insert(p.clone());
            }
        }
        Self {
            graphemes: graphemes.symbols().to_vec(),
            ignored_graphemes,
            phonemes: phonemes.symbols().to_vec(),
            ignored_phonemes,
        }
    }

    fn log(&self) {
        info!("graphemes: {}", self.graphemes.join(", "));
        info!("phonemes: {}", self.phonemes.join(", "));
        if !self.ignored_graphemes.is_empty() {
            warn!(
                "ignored graphemes: {}",
                self.ignored_graphemes
                    .iter()
                    .map(|x| x.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        if !self.ignored_phonemes.is_empty() {
            warn!(
                "ignored phonemes: {}",
                self.ignored_phonemes
                    .iter()
                    .map(|x| x.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
    }
}

/// Indexes into the dataset for the training and validation partitions
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub valid: Vec<usize>,
}

/// The lexicon with its vocabularies, entries can be fetched as index sequences.
#[derive(Clone, Debug)]
pub struct Dataset {
    graphemes: Vocabulary,
    phonemes: Vocabulary,
    entries: Vec<Entry>,
    report: CoverageReport,
}

impl Dataset {
    pub fn open(path: impl AsRef<Path>, config: &G2pConfig) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path)
            .with_context(|| format!("opening lexicon {}", path.display()))?;
        Self::from_reader(io::BufReader::new(file), config)
    }

    /// Builds the dataset from any reader, handy to test with in-memory lexicons. Fails if either
    /// vocabulary breaks the reserved symbol convention.
    pub fn from_reader(reader: impl BufRead, config: &G2pConfig) -> anyhow::Result<Self> {
        let graphemes = Vocabulary::new(config.encoder.graphemes.clone())
            .context("invalid grapheme vocabulary")?;
        let phonemes = Vocabulary::new(config.decoder.phonemes.clone())
            .context("invalid phoneme vocabulary")?;

        let mut entries = load_dict(reader, &config.dataset)?;
        // A word made only of digits strips down to nothing, there's no input to align against
        let before = entries.len();
        entries.retain(|x| !x.word.is_empty());
        if entries.len() != before {
            warn!("Dropped {} entries with empty words", before - entries.len());
        }

        let report = CoverageReport::new(&graphemes, &phonemes, &entries);
        report.log();
        info!("Loaded {} lexicon entries", entries.len());

        Ok(Self {
            graphemes,
            phonemes,
            entries,
            report,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn report(&self) -> &CoverageReport {
        &self.report
    }

    pub fn graphemes(&self) -> &Vocabulary {
        &self.graphemes
    }

    pub fn phonemes(&self) -> &Vocabulary {
        &self.phonemes
    }

    pub fn encode_word(&self, word: &str) -> Vec<u32> {
        word.graphemes(true)
            .map(|g| self.graphemes.index_or_unk(g))
            .collect()
    }

    pub fn encode_pronunciation(&self, pronunciation: &[String]) -> Vec<u32> {
        pronunciation
            .iter()
            .map(|p| self.phonemes.index_or_unk(p))
            .collect()
    }

    /// Gets the grapheme and phoneme indexes of an entry
    pub fn get(&self, idx: usize) -> Option<(Vec<u32>, Vec<u32>)> {
        self.entries.get(idx).map(|entry| {
            (
                self.encode_word(&entry.word),
                self.encode_pronunciation(&entry.pronunciation),
            )
        })
    }

    /// Randomly holds out a tenth of the entries for validation.
    pub fn split(&self, rng: &mut impl Rng) -> Split {
        let mut indexes = (0..self.len()).collect::<Vec<_>>();
        indexes.shuffle(rng);
        let train = indexes.split_off(self.len() / 10);
        Split {
            train,
            valid: indexes,
        }
    }

    /// Collates the given entries into a padded batch.
    pub fn batch(&self, indexes: &[usize], device: &Device) -> anyhow::Result<Batch> {
        let items = indexes
            .iter()
            .map(|i| self.get(*i).with_context(|| format!("no entry {}", i)))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Batch::collate(items, device)
    }
}

/// Entries padded to a common length. The true lengths are kept because the transducer loss
/// needs them to know where each lattice really ends.
#[derive(Debug)]
pub struct Batch {
    /// Grapheme indexes `[batch, max_src_len]`
    pub src: Tensor,
    /// Phoneme indexes `[batch, max_tgt_len]`, not prefixed with `<bos>`
    pub tgt: Tensor,
    pub src_lengths: Vec<usize>,
    pub tgt_lengths: Vec<usize>,
    /// Unpadded targets
    pub targets: Vec<Vec<u32>>,
}

impl Batch {
    pub fn collate(items: Vec<(Vec<u32>, Vec<u32>)>, device: &Device) -> anyhow::Result<Self> {
        ensure!(!items.is_empty(), "can't collate an empty batch");
        let src_lengths = items.iter().map(|(s, _)| s.len()).collect::<Vec<_>>();
        let tgt_lengths = items.iter().map(|(_, t)| t.len()).collect::<Vec<_>>();
        let max_src = src_lengths.iter().copied().max().unwrap_or(0);
        let max_tgt = tgt_lengths.iter().copied().max().unwrap_or(0);
        ensure!(max_src > 0, "batch has no graphemes");

        let (sources, targets): (Vec<_>, Vec<_>) = items.into_iter().unzip();
        let src = Tensor::from_vec(pad(&sources, max_src), (sources.len(), max_src), device)?;
        let tgt = Tensor::from_vec(pad(&targets, max_tgt), (targets.len(), max_tgt), device)?;

        Ok(Self {
            src,
            tgt,
            src_lengths,
            tgt_lengths,
            targets,
        })
    }

    pub fn len(&self) -> usize {
        self.src_lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.src_lengths.is_empty()
    }

    /// Teacher forced decoder input, the targets shifted right by a `<bos>` column.
    pub fn decoder_input(&self) -> candle_core::Result<Tensor> {
        let bos = Tensor::full(BOS_IDX, (self.len(), 1), self.tgt.device())?;
        Tensor::cat(&[&bos, &self.tgt], 1)
    }
}

fn pad(seqs: &[Vec<u32>], len: usize) -> Vec<u32> {
    let mut data = Vec::with_capacity(seqs.len() * len);
    for seq in seqs {
        data.extend_from_slice(seq);
        data.resize(data.len() + len - seq.len(), PAD_IDX);
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tiny;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn parse(text: &str, config: &DatasetConfig) -> Vec<Entry> {
        load_dict(io::Cursor::new(text), config).unwrap()
    }

    #[test]
    fn homograph_and_stress_removed() {
        let entries = parse("RECORD(1) R EH K ER D", &DatasetConfig::default());
        assert_eq!(
            entries,
            vec![Entry {
                word: "RECORD".to_string(),
                pronunciation: ["R", "EH", "K", "ER", "D"].map(String::from).to_vec(),
            }]
        );

        let entries = parse("RECORD(2)  R IH0 K AO1 R D", &DatasetConfig::default());
        assert_eq!(entries[0].word, "RECORD");
        assert_eq!(entries[0].pronunciation, ["R", "IH", "K", "AO", "R", "D"]);
    }

    #[test]
    fn digits_kept_when_disabled() {
        let config = DatasetConfig {
            remove_word_digits: false,
            remove_phoneme_digits: false,
            ..Default::default()
        };
        let entries = parse("RECORD(2)  R IH0 K AO1 R D", &config);
        assert_eq!(entries[0].word, "RECORD(2)");
        assert_eq!(entries[0].pronunciation, ["R", "IH0", "K", "AO1", "R", "D"]);

        let config = DatasetConfig {
            remove_word_digits: false,
            ..Default::default()
        };
        let entries = parse("RECORD(2)  R IH0 K AO1 R D", &config);
        assert_eq!(entries[0].word, "RECORD(2)");
        assert_eq!(entries[0].pronunciation, ["R", "IH", "K", "AO", "R", "D"]);
    }

    #[test]
    fn skipped_lines() {
        let text = ";;; a comment\n\n   \nLONELY\nCAB  K AE1 B\n# not a comment by default\n";
        let entries = parse(text, &DatasetConfig::default());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].word, "CAB");
        assert_eq!(entries[1].word, "#");

        let config = DatasetConfig {
            comment_prefix: "#".to_string(),
            ..Default::default()
        };
        let entries = parse(text, &config);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].word, ";;;");
        assert_eq!(entries[1].word, "CAB");
    }

    #[test]
    fn fields_map_to_entry() {
        let lines = [
            ("A  AH0", "A", vec!["AH"]),
            ("ABBE\tAE1 B IY0", "ABBE", vec!["AE", "B", "IY"]),
            ("  DOG(3)   D AO1 G  ", "DOG", vec!["D", "AO", "G"]),
            ("X-RAY EH1 K S R EY2", "X-RAY", vec!["EH", "K", "S", "R", "EY"]),
        ];
        for (line, word, pron) in lines {
            let entries = parse(line, &DatasetConfig::default());
            assert_eq!(entries.len(), 1, "{}", line);
            assert_eq!(entries[0].word, word);
            assert_eq!(entries[0].pronunciation, pron);
        }
    }

    #[test]
    fn stripping_is_idempotent() {
        let inputs = [
            "RECORD(1)",
            "AH0",
            "AB1(2)",
            "X(1)2",
            "NO_DIGITS",
            "4EVER",
            "(12)",
            "",
            "ER12",
        ];
        for input in inputs {
            let once = strip_digits(input);
            assert_eq!(strip_digits(&once), once, "{}", input);
        }
        assert_eq!(strip_digits("AB1(2)"), "AB");
        assert_eq!(strip_digits("4EVER"), "4EVER");
    }

    #[test]
    fn unknown_graphemes_reported() {
        let config = tiny();
        let dataset = Dataset::from_reader(io::Cursor::new("CAZ  K AH Q\nBAD  B AH D\n"), &config)
            .unwrap();
        assert_eq!(dataset.len(), 2);

        let (src, tgt) = dataset.get(0).unwrap();
        // <unk> <pad> <bos> <eos> A B C D E
        assert_eq!(src, vec![6, 4, UNK_IDX]);
        // <unk> <pad> <bos> <eos> AH B K D
        assert_eq!(tgt, vec![6, 4, UNK_IDX]);

        let report = dataset.report();
        assert_eq!(report.ignored_graphemes, BTreeSet::from(["Z".to_string()]));
        assert_eq!(report.ignored_phonemes, BTreeSet::from(["Q".to_string()]));
    }

    #[test]
    fn bad_vocabulary_rejected() {
        let mut config = tiny();
        config.encoder.graphemes.swap(0, 1);
        assert!(Dataset::from_reader(io::Cursor::new("CAB  K AE B"), &config).is_err());

        let mut config = tiny();
        config.decoder.phonemes.truncate(4);
        assert!(Dataset::from_reader(io::Cursor::new("CAB  K AE B"), &config).is_err());
    }

    #[test]
    fn batches_padded() {
        let config = tiny();
        let dataset =
            Dataset::from_reader(io::Cursor::new("AB  AH B\nCABE  K AH B\n"), &config).unwrap();
        let batch = dataset.batch(&[0, 1], &Device::Cpu).unwrap();

        assert_eq!(batch.src_lengths, vec![2, 4]);
        assert_eq!(batch.tgt_lengths, vec![2, 3]);
        assert_eq!(batch.src.dims(), &[2, 4]);
        assert_eq!(
            batch.src.to_vec2::<u32>().unwrap(),
            vec![vec![4, 5, PAD_IDX, PAD_IDX], vec![6, 4, 5, 8]]
        );
        assert_eq!(
            batch.decoder_input().unwrap().to_vec2::<u32>().unwrap(),
            vec![vec![BOS_IDX, 4, 5, PAD_IDX], vec![BOS_IDX, 6, 4, 5]]
        );
        assert_eq!(batch.targets, vec![vec![4, 5], vec![6, 4, 5]]);
    }

    #[test]
    fn split_is_seeded() {
        let config = tiny();
        let text = (0..35).map(|_| "AB  AH B\n").collect::<String>();
        let dataset = Dataset::from_reader(io::Cursor::new(text), &config).unwrap();

        let a = dataset.split(&mut StdRng::seed_from_u64(3));
        let b = dataset.split(&mut StdRng::seed_from_u64(3));
        assert_eq!(a, b);
        assert_eq!(a.valid.len(), 3);
        assert_eq!(a.train.len(), 32);

        let mut all = a.train.iter().chain(a.valid.iter()).copied().collect::<Vec<_>>();
        all.sort_unstable();
        assert_eq!(all, (0..35).collect::<Vec<_>>());
    }
}
