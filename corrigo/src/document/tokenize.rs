//! Plain-text fallback tokenizer.
//!
//! Proper linguistic tokenization is the job of the external tokenizer; this
//! fallback handles inputs that arrive as plain text anyway. Blank lines
//! separate paragraphs, sentence-terminal punctuation closes sentences, and
//! every token is classed so unit filters have something to work with.
use std::path::PathBuf;

use crate::document::{Document, Paragraph, Sentence, Word};

/// Environment variable whose value is prepended to the tokenizer
/// configuration search path.
pub const DATADIR_ENV: &str = "CORRIGO_DATADIR";

const SYSTEM_DATA_DIRS: &[&str] = &[
    "/usr/local/share/corrigo",
    "/usr/share/corrigo",
    "/etc/corrigo",
];

/// Directories searched for external tokenizer configuration files, the
/// environment override first.
pub fn config_search_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(prefix) = std::env::var(DATADIR_ENV) {
        if !prefix.is_empty() {
            dirs.push(PathBuf::from(prefix));
        }
    }
    dirs.extend(SYSTEM_DATA_DIRS.iter().map(PathBuf::from));
    dirs
}

/// Locate a tokenizer configuration by name across the search path.
pub fn find_tokenizer_config(name: &str) -> Option<PathBuf> {
    config_search_dirs()
        .into_iter()
        .map(|d| d.join(name))
        .find(|p| p.exists())
}

/// Tokenize plain text into a document tree with stable dotted ids.
pub fn tokenize(doc_id: &str, text: &str) -> Document {
    let mut doc = Document::new(doc_id);

    for (pi, para_text) in text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .enumerate()
    {
        let para_id = format!("{}.p.{}", doc_id, pi + 1);
        let mut paragraph = Paragraph {
            id: para_id.clone(),
            sentences: Vec::new(),
        };

        let mut sentence_words: Vec<String> = Vec::new();
        let mut si = 0usize;
        for token in para_text.split_whitespace() {
            for piece in split_token(token) {
                let terminal = is_sentence_terminal(&piece);
                sentence_words.push(piece);
                if terminal {
                    si += 1;
                    paragraph
                        .sentences
                        .push(build_sentence(&para_id, si, std::mem::take(&mut sentence_words)));
                }
            }
        }
        if !sentence_words.is_empty() {
            si += 1;
            paragraph
                .sentences
                .push(build_sentence(&para_id, si, sentence_words));
        }

        if !paragraph.sentences.is_empty() {
            doc.paragraphs.push(paragraph);
        }
    }

    doc
}

fn build_sentence(para_id: &str, index: usize, words: Vec<String>) -> Sentence {
    let sent_id = format!("{}.s.{}", para_id, index);
    let words = words
        .into_iter()
        .enumerate()
        .map(|(wi, text)| Word {
            id: format!("{}.w.{}", sent_id, wi + 1),
            class: Some(classify(&text).into()),
            text,
            corrections: Vec::new(),
            flags: Vec::new(),
        })
        .collect();
    Sentence {
        id: sent_id,
        words,
        edits: Vec::new(),
    }
}

/// Detach trailing sentence punctuation from a whitespace token, so
/// `bad.` becomes `bad` and `.`.
fn split_token(token: &str) -> Vec<String> {
    let trailing: String = token
        .chars()
        .rev()
        .take_while(|c| matches!(c, '.' | '!' | '?' | ',' | ';' | ':'))
        .collect::<String>()
        .chars()
        .rev()
        .collect();
    if trailing.is_empty() || trailing.len() == token.len() {
        return vec![token.to_string()];
    }
    let head = &token[..token.len() - trailing.len()];
    let mut parts = vec![head.to_string()];
    for c in trailing.chars() {
        parts.push(c.to_string());
    }
    parts
}

fn is_sentence_terminal(token: &str) -> bool {
    matches!(token, "." | "!" | "?")
}

fn classify(token: &str) -> &'static str {
    if token.chars().all(|c| c.is_ascii_digit()) {
        "NUMBER"
    } else if token.chars().all(|c| c.is_ascii_punctuation()) {
        "PUNCTUATION"
    } else {
        "WORD"
    }
}
