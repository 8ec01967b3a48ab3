//! Word and phoneme error rates for evaluating a model against the lexicon.
use serde::{Deserialize, Serialize};

/// Levenshtein distance between two token sequences
pub fn edit_distance<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    let mut row = (0..=b.len()).collect::<Vec<_>>();
    for (i, x) in a.iter().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, y) in b.iter().enumerate() {
            let substitution = diagonal + usize::from(x != y);
            diagonal = row[j + 1];
            row[j + 1] = substitution.min(row[j] + 1).min(diagonal + 1);
        }
    }
    row[b.len()]
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRates {
    pub words: usize,
    /// Words where the prediction differs at all from the reference
    pub word_errors: usize,
    /// Phonemes in the references
    pub phonemes: usize,
    /// Sum of the edit distances
    pub phoneme_errors: usize,
}

impl ErrorRates {
    /// Adds a word to the tally and returns the edit distance of its prediction
    pub fn observe<T: PartialEq>(&mut self, reference: &[T], predicted: &[T]) -> usize {
        let distance = edit_distance(reference, predicted);
        self.words += 1;
        self.phonemes += reference.len();
        if distance > 0 {
            self.word_errors += 1;
            self.phoneme_errors += distance;
        }
        distance
    }

    pub fn wer(&self) -> f64 {
        ratio(self.word_errors, self.words)
    }

    pub fn per(&self) -> f64 {
        ratio(self.phoneme_errors, self.phonemes)
    }
}

fn ratio(errors: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        errors as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distances() {
        assert_eq!(edit_distance::<u32>(&[], &[]), 0);
        assert_eq!(edit_distance(&["K", "AE", "T"], &["K", "AE", "T"]), 0);
        assert_eq!(edit_distance(&["K", "AE", "T"], &["K", "AH", "T"]), 1);
        assert_eq!(edit_distance(&["K", "AE", "T"], &[]), 3);
        assert_eq!(edit_distance(&[], &["K"]), 1);
        assert_eq!(edit_distance(&["K", "AE", "T", "S"], &["AE", "T"]), 2);
        assert_eq!(edit_distance(&[1, 2, 3, 4], &[2, 1, 3, 5, 4]), 3);
    }

    #[test]
    fn rates() {
        let mut rates = ErrorRates::default();
        assert_eq!(rates.wer(), 0.0);

        assert_eq!(rates.observe(&["R", "EH", "K", "ER", "D"], &["R", "EH", "K", "ER", "D"]), 0);
        assert_eq!(rates.observe(&["K", "AE", "T"], &["K", "AH", "T", "S"]), 2);
        assert_eq!(rates.words, 2);
        assert_eq!(rates.phonemes, 8);
        assert_eq!(rates.wer(), 0.5);
        assert_eq!(rates.per(), 0.25);
    }
}
