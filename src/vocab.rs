//! Phoneme inventory the CTC head predicts over.
//!
//! The order is part of the artifact contract: the aligner in the app maps
//! logit column `i` to `PHONEME_LABELS[i]`.

use crate::contract::VOCAB_SIZE;

pub const BLANK_INDEX: usize = 0;
pub const BLANK: &str = "<blank>";
pub const SPACE: &str = " ";

/// Korean consonant jamo (compatibility block).
const CONSONANTS: [&str; 19] = [
    "ㄱ", "ㄲ", "ㄴ", "ㄷ", "ㄸ", "ㄹ", "ㅁ", "ㅂ", "ㅃ", "ㅅ", "ㅆ", "ㅇ", "ㅈ", "ㅉ", "ㅊ", "ㅋ",
    "ㅌ", "ㅍ", "ㅎ",
];

/// Korean vowel jamo (compatibility block).
const VOWELS: [&str; 21] = [
    "ㅏ", "ㅐ", "ㅑ", "ㅒ", "ㅓ", "ㅔ", "ㅕ", "ㅖ", "ㅗ", "ㅘ", "ㅙ", "ㅚ", "ㅛ", "ㅜ", "ㅝ", "ㅞ",
    "ㅟ", "ㅠ", "ㅡ", "ㅢ", "ㅣ",
];

const ARPABET: [&str; 39] = [
    "AA", "AE", "AH", "AO", "AW", "AY", "B", "CH", "D", "DH", "EH", "ER", "EY", "F", "G", "HH",
    "IH", "IY", "JH", "K", "L", "M", "N", "NG", "OW", "OY", "P", "R", "S", "SH", "T", "TH", "UH",
    "UW", "V", "W", "Y", "Z", "ZH",
];

/// Ordered labels: blank, consonants, vowels, ARPAbet, space.
pub fn phoneme_labels() -> Vec<String> {
    let mut labels = Vec::with_capacity(VOCAB_SIZE);
    labels.push(BLANK.to_string());
    labels.extend(CONSONANTS.iter().map(|s| s.to_string()));
    labels.extend(VOWELS.iter().map(|s| s.to_string()));
    labels.extend(ARPABET.iter().map(|s| s.to_string()));
    labels.push(SPACE.to_string());
    labels
}
