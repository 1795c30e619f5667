use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    English,
    Chinese,
}

fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

/// Chinese when CJK ideographs make up at least half of the letters,
/// English otherwise (including text with no letters at all).
pub fn detect_language(text: &str) -> Language {
    let (cjk, latin) = text.chars().fold((0usize, 0usize), |(cjk, latin), c| {
        if is_cjk(c) {
            (cjk + 1, latin)
        } else if c.is_ascii_alphabetic() {
            (cjk, latin + 1)
        } else {
            (cjk, latin)
        }
    });

    let total = cjk + latin;
    if total > 0 && cjk * 2 >= total {
        Language::Chinese
    } else {
        Language::English
    }
}
