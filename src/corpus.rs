// src/corpus.rs - line aligned parallel text
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use rayon::prelude::*;

use crate::buckets::IdPair;
use crate::config::Tokenization;
use crate::error::{NmtError, Result};
use crate::vocab::{tokenize, Vocabularies};

/// Source/target corpus. Line `i` of one file translates line `i` of the
/// other; lines are kept raw and tokenized on demand.
pub struct ParallelCorpus {
    lines: Vec<(String, String)>,
    tokenization: Tokenization,
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path).map_err(|e| NmtError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let mut lines = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf).map_err(|e| NmtError::io(path, e))?;
        if n == 0 {
            break;
        }
        lines.push(String::from_utf8_lossy(&buf).trim_end_matches(['\n', '\r']).to_string());
    }
    Ok(lines)
}

impl ParallelCorpus {
    pub fn open(source: &Path, target: &Path, tokenization: Tokenization) -> Result<Self> {
        let src = read_lines(source)?;
        let tgt = read_lines(target)?;
        if src.len() != tgt.len() {
            tracing::warn!(
                src_lines = src.len(),
                tgt_lines = tgt.len(),
                "parallel files differ in length, extra lines ignored"
            );
        }
        Ok(Self::from_lines(src.into_iter().zip(tgt).collect(), tokenization))
    }

    pub fn from_lines(lines: Vec<(String, String)>, tokenization: Tokenization) -> Self {
        Self { lines, tokenization }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn tokenization(&self) -> Tokenization {
        self.tokenization
    }

    /// Tokenized pairs for lines `start..start + count`, clipped to the corpus.
    pub fn tokenized(&self, start: usize, count: usize) -> Vec<(Vec<String>, Vec<String>)> {
        let end = start.saturating_add(count).min(self.lines.len());
        let start = start.min(end);
        self.lines[start..end]
            .par_iter()
            .map(|(s, t)| (tokenize(s, self.tokenization), tokenize(t, self.tokenization)))
            .collect()
    }

    /// Id pairs for lines `start..start + count`; ids at or above the
    /// limits become UNK.
    pub fn pairs(&self, vocabs: &Vocabularies, start: usize, count: usize, src_limit: i64, tgt_limit: i64) -> Vec<IdPair> {
        vocabs.encode_pairs(&self.tokenized(start, count), src_limit, tgt_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_aligned_files_and_slices() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("text.fr");
        let tgt = dir.path().join("text.en");
        writeln!(File::create(&src).unwrap(), "le chat\r\nun chien\nbonjour").unwrap();
        writeln!(File::create(&tgt).unwrap(), "the cat\na dog\nhello").unwrap();

        let corpus = ParallelCorpus::open(&src, &tgt, Tokenization::Words).unwrap();
        assert_eq!(corpus.len(), 3);
        assert_eq!(corpus.tokenized(0, 1)[0].0, vec!["le", "chat"]);

        let dev = corpus.tokenized(1, 10);
        assert_eq!(dev.len(), 2);
        assert_eq!(dev[0].1, vec!["a", "dog"]);
        assert!(corpus.tokenized(5, 2).is_empty());
    }

    #[test]
    fn pairs_map_rare_words_to_unk() {
        let corpus = ParallelCorpus::from_lines(
            vec![("a a b".into(), "x y".into()), ("a c".into(), "y".into())],
            Tokenization::Words,
        );
        let vocabs = Vocabularies::build(&corpus.tokenized(0, 2), 100, 100);
        // a=4, b=5, c=6; a limit of 5 keeps only `a`
        let ids = corpus.pairs(&vocabs, 0, 2, 5, 100);
        assert_eq!(ids[0].0, vec![4, 4, crate::vocab::UNK_ID]);
        assert_eq!(ids[1].0, vec![4, crate::vocab::UNK_ID]);
        assert_eq!(ids[1].1, vec![vocabs.tgt.id("y")]);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = ParallelCorpus::open(Path::new("/nope/a"), Path::new("/nope/b"), Tokenization::Words);
        assert!(matches!(err, Err(NmtError::Io { .. })));
    }
}
