//! The in-memory annotated document tree.
//!
//! The on-disk annotated-document format proper is handled elsewhere; the
//! pipeline only depends on this model: a tree of typed structure elements
//! with stable dotted identifiers, in-order traversal per element type, and
//! a small set of structured edits applied through the edit-query
//! interpreter in [`query`]. The original text is never rewritten; every
//! edit only attaches a suggestion for correction.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use crate::{Error, Unit, UnitType};

pub mod query;
pub mod tokenize;

/// Annotator type recorded on every machine-generated correction.
pub const ANNOTATOR_AUTO: &str = "auto";

/// Root of the document tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable document identifier; element ids are derived from it
    pub id: String,
    /// Document language, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Caller-supplied metadata, merged over whatever the input carried
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Correction sets declared by modules during `init`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub declarations: Vec<Declaration>,
    /// Paragraphs in document order
    #[serde(default)]
    pub paragraphs: Vec<Paragraph>,
}

/// Record of a module having declared its correction set on the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Declaration {
    /// The correction set
    pub set: String,
    /// The declaring annotator
    pub annotator: String,
}

/// A paragraph element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paragraph {
    /// Stable identifier, `<doc>.p.<n>`
    pub id: String,
    /// Sentences in document order
    #[serde(default)]
    pub sentences: Vec<Sentence>,
}

/// A sentence element. Span-anchored corrections (merges, insertions) attach
/// here; word-anchored corrections live on the words themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sentence {
    /// Stable identifier, `<doc>.p.<n>.s.<n>`
    pub id: String,
    /// Words in document order
    #[serde(default)]
    pub words: Vec<Word>,
    /// Corrections anchored on a span or pivot rather than a single word
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edits: Vec<SpanEdit>,
}

/// A word (token) element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    /// Stable identifier, `<doc>.p.<n>.s.<n>.w.<n>`
    pub id: String,
    /// The original token text; never rewritten by the pipeline
    pub text: String,
    /// Token class assigned by the tokenizer (WORD, NUMBER, PUNCTUATION, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    /// Accumulated corrections targeting this word
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub corrections: Vec<Correction>,
    /// Error-detection markers without a concrete suggestion
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<ErrorFlag>,
}

/// An error-detection marker: a module flagged the element as suspect
/// without suggesting a replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFlag {
    /// Correction set of the flagging module
    pub set: String,
    /// Error class
    pub class: String,
    /// Flagging annotator
    pub annotator: String,
}

/// Container holding one or more alternative suggestions for an original
/// span. The original text is preserved under `current`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    /// Correction set
    pub set: String,
    /// Correction class (e.g. `nonworderror`, `confusible`, `spliterror`)
    pub class: String,
    /// Producing annotator
    pub annotator: String,
    /// Always [`ANNOTATOR_AUTO`] for pipeline-produced corrections
    pub annotator_type: String,
    /// Creation timestamp
    pub datetime: DateTime<Utc>,
    /// Original text(s) of the corrected span, in order
    pub current: Vec<String>,
    /// Alternative suggestions, best first by module convention
    pub suggestions: Vec<Suggestion>,
}

/// One alternative suggestion inside a [`Correction`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    /// Replacement words, in order. Empty means "delete the target".
    pub words: Vec<String>,
    /// Confidence in `[0, 1]`, when the module provides one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// For deletions: merge the freed position with the neighboring
    /// structure element (sentence-terminal punctuation case)
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub merge: bool,
    /// For insertions: the inserted word should split the sentence
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub split_sentence: bool,
}

impl Suggestion {
    /// Plain-text suggestion with optional confidence.
    pub fn text(text: impl Into<String>, confidence: Option<f64>) -> Self {
        Suggestion {
            words: vec![text.into()],
            confidence,
            merge: false,
            split_sentence: false,
        }
    }

    /// Joined text of the suggested words.
    pub fn joined(&self) -> String {
        self.words.join(" ")
    }
}

/// Where a sentence-level correction anchors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanAnchor {
    /// An ordered span of adjacent word ids (merge)
    Span(Vec<String>),
    /// Insertion point before the named pivot word
    Before(String),
    /// Insertion point after the named pivot word
    After(String),
}

/// A correction anchored on a span or pivot within a sentence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEdit {
    /// The anchor within the owning sentence
    pub anchor: SpanAnchor,
    /// The attached correction
    pub correction: Correction,
}

/// Flattened view of one correction for reporting: the word index within its
/// sentence, the original text, and the suggestions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionSummary {
    /// Word index within the owning sentence (0-based)
    pub index: usize,
    /// Original text of the corrected span
    pub text: String,
    /// `(suggestion, confidence)` pairs
    pub suggestions: Vec<SummarySuggestion>,
    /// Producing annotator
    pub annotator: String,
}

/// One suggestion inside a [`CorrectionSummary`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarySuggestion {
    /// Suggested replacement text
    pub suggestion: String,
    /// Confidence, when provided
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl Document {
    /// Empty document with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Document {
            id: id.into(),
            language: None,
            metadata: BTreeMap::new(),
            declarations: Vec::new(),
            paragraphs: Vec::new(),
        }
    }

    /// Declare a correction set for an annotator. Idempotent.
    pub fn declare(&mut self, set: &str, annotator: &str) {
        let exists = self
            .declarations
            .iter()
            .any(|d| d.set == set && d.annotator == annotator);
        if !exists {
            self.declarations.push(Declaration {
                set: set.into(),
                annotator: annotator.into(),
            });
        }
    }

    /// Whether the set is declared for the annotator.
    pub fn declared(&self, set: &str, annotator: &str) -> bool {
        self.declarations
            .iter()
            .any(|d| d.set == set && d.annotator == annotator)
    }

    /// Paragraphs in document order.
    pub fn iter_paragraphs(&self) -> impl Iterator<Item = &Paragraph> {
        self.paragraphs.iter()
    }

    /// Sentences in document order.
    pub fn iter_sentences(&self) -> impl Iterator<Item = &Sentence> {
        self.paragraphs.iter().flat_map(|p| p.sentences.iter())
    }

    /// Words in document order.
    pub fn iter_words(&self) -> impl Iterator<Item = &Word> {
        self.iter_sentences().flat_map(|s| s.words.iter())
    }

    /// Word lookup by id.
    pub fn word(&self, id: &str) -> Option<&Word> {
        self.iter_words().find(|w| w.id == id)
    }

    /// Mutable word lookup by id.
    pub fn word_mut(&mut self, id: &str) -> Option<&mut Word> {
        self.paragraphs
            .iter_mut()
            .flat_map(|p| p.sentences.iter_mut())
            .flat_map(|s| s.words.iter_mut())
            .find(|w| w.id == id)
    }

    /// The sentence containing the named word.
    pub fn sentence_of_word(&self, word_id: &str) -> Option<&Sentence> {
        self.iter_sentences()
            .find(|s| s.words.iter().any(|w| w.id == word_id))
    }

    /// Mutable access to the sentence containing the named word.
    pub fn sentence_of_word_mut(&mut self, word_id: &str) -> Option<&mut Sentence> {
        self.paragraphs
            .iter_mut()
            .flat_map(|p| p.sentences.iter_mut())
            .find(|s| s.words.iter().any(|w| w.id == word_id))
    }

    /// Generic element lookup by id.
    pub fn unit(&self, id: &str) -> Option<Unit<'_>> {
        if self.id == id {
            return Some(Unit::Document(self));
        }
        for p in &self.paragraphs {
            if p.id == id {
                return Some(Unit::Paragraph(p));
            }
            for s in &p.sentences {
                if s.id == id {
                    return Some(Unit::Sentence(s));
                }
                for w in &s.words {
                    if w.id == id {
                        return Some(Unit::Word(w));
                    }
                }
            }
        }
        None
    }

    /// All units of one type, in document order.
    pub fn units_of_type(&self, unit_type: UnitType) -> Vec<Unit<'_>> {
        match unit_type {
            UnitType::Document => vec![Unit::Document(self)],
            UnitType::Paragraph => self.iter_paragraphs().map(Unit::Paragraph).collect(),
            UnitType::Sentence => self.iter_sentences().map(Unit::Sentence).collect(),
            UnitType::Word => self.iter_words().map(Unit::Word).collect(),
        }
    }

    /// Plain text of the whole document.
    pub fn text(&self) -> String {
        self.paragraphs
            .iter()
            .map(|p| p.text())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Total number of corrections attached anywhere in the tree.
    pub fn correction_count(&self) -> usize {
        self.iter_words().map(|w| w.corrections.len()).sum::<usize>()
            + self.iter_sentences().map(|s| s.edits.len()).sum::<usize>()
    }

    /// Flatten every correction to `(index, text, suggestions, annotator)`
    /// records, word-indexed within the owning sentence.
    pub fn corrections_summary(&self) -> Vec<CorrectionSummary> {
        let mut out = Vec::new();
        for sentence in self.iter_sentences() {
            for (index, word) in sentence.words.iter().enumerate() {
                for c in &word.corrections {
                    out.push(CorrectionSummary {
                        index,
                        text: c.current.join(" "),
                        suggestions: summarize(&c.suggestions),
                        annotator: c.annotator.clone(),
                    });
                }
            }
            for edit in &sentence.edits {
                let anchor_id = match &edit.anchor {
                    SpanAnchor::Span(ids) => ids.first(),
                    SpanAnchor::Before(id) | SpanAnchor::After(id) => Some(id),
                };
                let index = anchor_id
                    .and_then(|id| sentence.words.iter().position(|w| &w.id == id))
                    .unwrap_or(0);
                out.push(CorrectionSummary {
                    index,
                    text: edit.correction.current.join(" "),
                    suggestions: summarize(&edit.correction.suggestions),
                    annotator: edit.correction.annotator.clone(),
                });
            }
        }
        out
    }

    /// Parse a document from its JSON form.
    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize the document to pretty-printed JSON.
    pub fn to_json_string(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load a document from disk. A `.json` file is parsed as the structured
    /// form; anything else is treated as plain text and tokenized.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path).map_err(|source| Error::DocumentIo {
            path: path.display().to_string(),
            source,
        })?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "json")
            .unwrap_or(false);
        if is_json {
            Self::from_json_str(&raw)
        } else {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "untitled".into());
            Ok(tokenize::tokenize(&stem, &raw))
        }
    }

    /// Write the document to disk as JSON.
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let json = self.to_json_string()?;
        std::fs::write(path, json).map_err(|source| Error::DocumentIo {
            path: path.display().to_string(),
            source,
        })
    }

    /// Compact XML rendering of the tree, for the `--dump-xml` surface.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "<?xml version=\"1.0\" encoding=\"utf-8\"?>");
        let _ = writeln!(out, "<document id={}>", xml_attr(&self.id));
        for d in &self.declarations {
            let _ = writeln!(
                out,
                "  <declaration set={} annotator={}/>",
                xml_attr(&d.set),
                xml_attr(&d.annotator)
            );
        }
        for p in &self.paragraphs {
            let _ = writeln!(out, "  <paragraph id={}>", xml_attr(&p.id));
            for s in &p.sentences {
                let _ = writeln!(out, "    <sentence id={}>", xml_attr(&s.id));
                for w in &s.words {
                    if w.corrections.is_empty() && w.flags.is_empty() {
                        let _ = writeln!(
                            out,
                            "      <word id={}>{}</word>",
                            xml_attr(&w.id),
                            xml_text(&w.text)
                        );
                        continue;
                    }
                    let _ = writeln!(out, "      <word id={}>", xml_attr(&w.id));
                    let _ = writeln!(out, "        <text>{}</text>", xml_text(&w.text));
                    for c in &w.corrections {
                        write_correction_xml(&mut out, c, 8);
                    }
                    for f in &w.flags {
                        let _ = writeln!(
                            out,
                            "        <errordetection set={} class={} annotator={}/>",
                            xml_attr(&f.set),
                            xml_attr(&f.class),
                            xml_attr(&f.annotator)
                        );
                    }
                    let _ = writeln!(out, "      </word>");
                }
                for e in &s.edits {
                    let anchor = match &e.anchor {
                        SpanAnchor::Span(ids) => format!("span={}", xml_attr(&ids.join(" "))),
                        SpanAnchor::Before(id) => format!("before={}", xml_attr(id)),
                        SpanAnchor::After(id) => format!("after={}", xml_attr(id)),
                    };
                    let _ = writeln!(out, "      <edit {}>", anchor);
                    write_correction_xml(&mut out, &e.correction, 8);
                    let _ = writeln!(out, "      </edit>");
                }
                let _ = writeln!(out, "    </sentence>");
            }
            let _ = writeln!(out, "  </paragraph>");
        }
        let _ = writeln!(out, "</document>");
        out
    }
}

fn summarize(suggestions: &[Suggestion]) -> Vec<SummarySuggestion> {
    suggestions
        .iter()
        .map(|s| SummarySuggestion {
            suggestion: s.joined(),
            confidence: s.confidence,
        })
        .collect()
}

fn write_correction_xml(out: &mut String, c: &Correction, indent: usize) {
    let pad = " ".repeat(indent);
    let _ = writeln!(
        out,
        "{pad}<correction set={} class={} annotator={} annotatortype={} datetime={}>",
        xml_attr(&c.set),
        xml_attr(&c.class),
        xml_attr(&c.annotator),
        xml_attr(&c.annotator_type),
        xml_attr(&c.datetime.to_rfc3339()),
    );
    let _ = writeln!(out, "{pad}  <current>{}</current>", xml_text(&c.current.join(" ")));
    for s in &c.suggestions {
        let conf = s
            .confidence
            .map(|v| format!(" confidence=\"{}\"", v))
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "{pad}  <suggestion{conf}>{}</suggestion>",
            xml_text(&s.joined())
        );
    }
    let _ = writeln!(out, "{pad}</correction>");
}

fn xml_text(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn xml_attr(value: &str) -> String {
    format!("\"{}\"", xml_text(value).replace('"', "&quot;"))
}

impl Paragraph {
    /// Plain text of the paragraph.
    pub fn text(&self) -> String {
        self.sentences
            .iter()
            .map(|s| s.text())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Sentence {
    /// Plain text of the sentence, words joined by single spaces.
    pub fn text(&self) -> String {
        self.words
            .iter()
            .map(|w| w.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Position of the named word within this sentence.
    pub fn word_index(&self, word_id: &str) -> Option<usize> {
        self.words.iter().position(|w| w.id == word_id)
    }
}
