// src/vocab.rs - per-language token <-> id maps with reserved ids
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::Tokenization;
use crate::error::{NmtError, Result};

pub const PAD_TOKEN: &str = "_PAD";
pub const GO_TOKEN: &str = "_GO";
pub const EOS_TOKEN: &str = "_EOS";
pub const UNK_TOKEN: &str = "_UNK";

pub const PAD_ID: i64 = 0;
pub const GO_ID: i64 = 1;
pub const EOS_ID: i64 = 2;
pub const UNK_ID: i64 = 3;

pub const NUM_RESERVED: usize = 4;

/// Split a raw corpus line into tokens.
pub fn tokenize(line: &str, mode: Tokenization) -> Vec<String> {
    match mode {
        Tokenization::Words => line.split_whitespace().map(String::from).collect(),
        Tokenization::Characters => line
            .trim_end_matches(['\n', '\r'])
            .chars()
            .map(String::from)
            .collect(),
    }
}

/// Single language vocabulary
#[derive(Clone, Debug)]
pub struct Vocabulary {
    word2idx: HashMap<String, i64>,
    idx2word: Vec<String>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::from_words(Vec::new())
    }
}

impl Vocabulary {
    /// Reserved tokens always occupy ids 0..4, whatever `words` holds.
    pub fn from_words(words: Vec<String>) -> Self {
        let mut idx2word: Vec<String> = [PAD_TOKEN, GO_TOKEN, EOS_TOKEN, UNK_TOKEN]
            .iter()
            .map(|s| s.to_string())
            .collect();
        idx2word.extend(
            words
                .into_iter()
                .filter(|w| ![PAD_TOKEN, GO_TOKEN, EOS_TOKEN, UNK_TOKEN].contains(&w.as_str())),
        );
        let word2idx = idx2word
            .iter()
            .enumerate()
            .map(|(i, w)| (w.clone(), i as i64))
            .collect();
        Self { word2idx, idx2word }
    }

    /// Build from tokenized sentences, most frequent first. Ties keep
    /// first-appearance order.
    pub fn fit<'a, I>(sentences: I, max_vocab_size: usize) -> Self
    where
        I: IntoIterator<Item = &'a [String]>,
    {
        let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
        for sentence in sentences {
            for word in sentence {
                let next = counts.len();
                counts.entry(word.as_str()).or_insert((0, next)).0 += 1;
            }
        }

        let mut word_freq: Vec<_> = counts.into_iter().collect();
        word_freq.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));

        let max_words = max_vocab_size.saturating_sub(NUM_RESERVED);
        let words = word_freq
            .into_iter()
            .take(max_words)
            .map(|(w, _)| w.to_string())
            .collect();
        Self::from_words(words)
    }

    pub fn len(&self) -> usize {
        self.idx2word.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idx2word.is_empty()
    }

    pub fn id(&self, word: &str) -> i64 {
        self.word2idx.get(word).copied().unwrap_or(UNK_ID)
    }

    /// Ids at or above `limit` are treated as unknown.
    pub fn encode(&self, tokens: &[String], limit: i64) -> Vec<i64> {
        tokens
            .iter()
            .map(|t| match self.id(t) {
                id if id < limit => id,
                _ => UNK_ID,
            })
            .collect()
    }

    pub fn word(&self, id: i64) -> &str {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.idx2word.get(i))
            .map(String::as_str)
            .unwrap_or(UNK_TOKEN)
    }

    pub fn decode(&self, ids: &[i64]) -> Vec<String> {
        ids.iter().map(|&id| self.word(id).to_string()).collect()
    }
}

#[derive(Serialize, Deserialize)]
struct VocabFile {
    src: Vec<String>,
    tgt: Vec<String>,
}

/// Source/target vocabularies, stored together as one JSON file.
#[derive(Clone, Debug, Default)]
pub struct Vocabularies {
    pub src: Vocabulary,
    pub tgt: Vocabulary,
}

impl Vocabularies {
    pub fn build(pairs: &[(Vec<String>, Vec<String>)], max_src: usize, max_tgt: usize) -> Self {
        let (src, tgt) = rayon::join(
            || Vocabulary::fit(pairs.iter().map(|(s, _)| s.as_slice()), max_src),
            || Vocabulary::fit(pairs.iter().map(|(_, t)| t.as_slice()), max_tgt),
        );
        Self { src, tgt }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = VocabFile {
            src: self.src.idx2word[NUM_RESERVED..].to_vec(),
            tgt: self.tgt.idx2word[NUM_RESERVED..].to_vec(),
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| NmtError::io(parent, e))?;
        }
        let json = serde_json::to_string(&file)?;
        fs::write(path, json).map_err(|e| NmtError::io(path, e))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| NmtError::io(path, e))?;
        let file: VocabFile = serde_json::from_str(&raw)?;
        Ok(Self {
            src: Vocabulary::from_words(file.src),
            tgt: Vocabulary::from_words(file.tgt),
        })
    }

    /// Map tokenized pairs to ids; ids beyond the model's vocab become UNK.
    pub fn encode_pairs(
        &self,
        pairs: &[(Vec<String>, Vec<String>)],
        src_limit: i64,
        tgt_limit: i64,
    ) -> Vec<(Vec<i64>, Vec<i64>)> {
        pairs
            .par_iter()
            .map(|(s, t)| (self.src.encode(s, src_limit), self.tgt.encode(t, tgt_limit)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(s: &str) -> Vec<String> {
        tokenize(s, Tokenization::Words)
    }

    #[test]
    fn reserved_ids_are_fixed() {
        let vocab = Vocabulary::fit([words("a b").as_slice()], 10);
        assert_eq!(vocab.id(PAD_TOKEN), PAD_ID);
        assert_eq!(vocab.id(GO_TOKEN), GO_ID);
        assert_eq!(vocab.id(EOS_TOKEN), EOS_ID);
        assert_eq!(vocab.id(UNK_TOKEN), UNK_ID);
        assert_eq!(vocab.id("a"), 4);
        assert_eq!(vocab.id("b"), 5);
    }

    #[test]
    fn frequency_order_and_cap() {
        let s1 = words("x y y z z z");
        let vocab = Vocabulary::fit([s1.as_slice()], NUM_RESERVED + 2);
        assert_eq!(vocab.len(), NUM_RESERVED + 2);
        assert_eq!(vocab.word(4), "z");
        assert_eq!(vocab.word(5), "y");
        assert_eq!(vocab.id("x"), UNK_ID);
    }

    #[test]
    fn missing_tokens_map_to_unk() {
        let vocab = Vocabulary::fit([words("a b").as_slice()], 10);
        assert_eq!(vocab.encode(&words("a c b"), 10), vec![4, UNK_ID, 5]);
        assert_eq!(vocab.encode(&words("a b"), 5), vec![4, UNK_ID]);
        assert_eq!(vocab.word(99), UNK_TOKEN);
    }

    #[test]
    fn character_tokenization_keeps_spaces() {
        assert_eq!(tokenize("ab c\n", Tokenization::Characters), vec!["a", "b", " ", "c"]);
    }

    #[test]
    fn save_and_load_keep_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.json");
        let pairs = vec![(words("le chat"), words("the cat"))];
        let vocabs = Vocabularies::build(&pairs, 100, 100);
        vocabs.save(&path).unwrap();

        let loaded = Vocabularies::load(&path).unwrap();
        assert_eq!(loaded.src.id("chat"), vocabs.src.id("chat"));
        assert_eq!(loaded.tgt.id("cat"), vocabs.tgt.id("cat"));
        assert_eq!(loaded.tgt.len(), vocabs.tgt.len());
    }
}
