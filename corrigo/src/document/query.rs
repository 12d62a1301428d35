//! The edit-query language and its interpreter.
//!
//! Modules express every desired document change as an [`EditQuery`]: a
//! structured mutation bound to a target element id, carrying the module's
//! set/class/annotator. Queries have a canonical textual form
//! (`Display`/`FromStr`) whose string values are double-quoted with
//! backslash escaping, and are applied sequentially by the consumer through
//! [`apply`]. Each primitive only attaches a suggestion for correction; the
//! original text is preserved.
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::document::{
    Correction, Document, ErrorFlag, SpanAnchor, SpanEdit, Suggestion, ANNOTATOR_AUTO,
};
use crate::Error;

/// Correction set, class, and annotator stamped on everything a query
/// attaches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMeta {
    /// Correction set
    pub set: String,
    /// Correction class
    pub class: String,
    /// Producing annotator
    pub annotator: String,
}

/// Insertion side relative to the pivot word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InsertPosition {
    /// Insert before the pivot
    Before,
    /// Insert after the pivot
    After,
}

/// The mutation primitives modules may request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EditAction {
    /// Attach one or more `(text, confidence?)` suggestions to a target
    Suggest {
        /// Target element id
        target: String,
        /// Alternative suggestion texts with optional confidence
        suggestions: Vec<(String, Option<f64>)>,
    },
    /// Attach an error-detection marker without a concrete suggestion
    Flag {
        /// Target element id
        target: String,
    },
    /// Replace one word with an ordered list of new words; alternatives
    /// accumulate inside one Correction
    Split {
        /// Target word id
        target: String,
        /// Alternative `([new_words], confidence?)` splits
        alternatives: Vec<(Vec<String>, Option<f64>)>,
    },
    /// Replace an ordered span of adjacent words with one new word
    Merge {
        /// Adjacent word ids, in document order
        span: Vec<String>,
        /// The replacement word
        replacement: String,
        /// Optional confidence
        confidence: Option<f64>,
    },
    /// Suggest removing the target word
    Delete {
        /// Target word id
        target: String,
        /// Merge the freed position with the neighboring structure element
        merge: bool,
    },
    /// Suggest inserting a new word next to the pivot
    Insert {
        /// Pivot word id
        pivot: String,
        /// Which side of the pivot
        position: InsertPosition,
        /// The inserted word
        text: String,
        /// Optional confidence
        confidence: Option<f64>,
        /// Whether the insertion should split the sentence
        split_sentence: bool,
    },
}

/// A complete edit query: action plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditQuery {
    /// The requested mutation
    pub action: EditAction,
    /// Set/class/annotator stamped on the attached correction
    pub meta: QueryMeta,
}

impl EditQuery {
    /// Convenience constructor.
    pub fn new(action: EditAction, meta: QueryMeta) -> Self {
        EditQuery { action, meta }
    }
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

fn write_confidence(f: &mut fmt::Formatter, confidence: Option<f64>) -> fmt::Result {
    match confidence {
        Some(c) => write!(f, "@{}", c),
        None => Ok(()),
    }
}

impl fmt::Display for EditQuery {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.action {
            EditAction::Suggest {
                target,
                suggestions,
            } => {
                write!(f, "SUGGEST {}", target)?;
                for (text, conf) in suggestions {
                    write!(f, " {}", quote(text))?;
                    write_confidence(f, *conf)?;
                }
            }
            EditAction::Flag { target } => {
                write!(f, "FLAG {}", target)?;
            }
            EditAction::Split {
                target,
                alternatives,
            } => {
                write!(f, "SPLIT {}", target)?;
                for (words, conf) in alternatives {
                    let quoted: Vec<String> = words.iter().map(|w| quote(w)).collect();
                    write!(f, " [{}]", quoted.join(" "))?;
                    write_confidence(f, *conf)?;
                }
            }
            EditAction::Merge {
                span,
                replacement,
                confidence,
            } => {
                write!(f, "MERGE {} {}", span.join(" "), quote(replacement))?;
                write_confidence(f, *confidence)?;
            }
            EditAction::Delete { target, merge } => {
                write!(f, "DELETE {}", target)?;
                if *merge {
                    write!(f, " MERGENEXT")?;
                }
            }
            EditAction::Insert {
                pivot,
                position,
                text,
                confidence,
                split_sentence,
            } => {
                let side = match position {
                    InsertPosition::Before => "BEFORE",
                    InsertPosition::After => "AFTER",
                };
                write!(f, "INSERT {} {} {}", side, pivot, quote(text))?;
                write_confidence(f, *confidence)?;
                if *split_sentence {
                    write!(f, " SPLITSENTENCE")?;
                }
            }
        }
        write!(
            f,
            " SET {} CLASS {} ANNOTATOR {}",
            quote(&self.meta.set),
            quote(&self.meta.class),
            quote(&self.meta.annotator)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Quoted(String),
    LBracket,
    RBracket,
    At,
}

fn lex(input: &str) -> Result<Vec<Token>, Error> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                let _ = chars.next();
            }
            '[' => {
                let _ = chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                let _ = chars.next();
                tokens.push(Token::RBracket);
            }
            '@' => {
                let _ = chars.next();
                tokens.push(Token::At);
            }
            '"' => {
                let _ = chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => match chars.next() {
                            Some(escaped @ ('"' | '\\')) => value.push(escaped),
                            Some(other) => {
                                return Err(Error::QueryError(format!(
                                    "invalid escape sequence '\\{}'",
                                    other
                                )))
                            }
                            None => break,
                        },
                        '"' => {
                            closed = true;
                            break;
                        }
                        _ => value.push(c),
                    }
                }
                if !closed {
                    return Err(Error::QueryError("unterminated string literal".into()));
                }
                tokens.push(Token::Quoted(value));
            }
            _ => {
                let mut value = String::new();
                while let Some(&c) = chars.peek() {
                    if c == ' ' || c == '\t' || c == '[' || c == ']' || c == '@' || c == '"' {
                        break;
                    }
                    value.push(c);
                    let _ = chars.next();
                }
                tokens.push(Token::Ident(value));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: std::vec::IntoIter<Token>,
    peeked: Option<Token>,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Parser {
            tokens: tokens.into_iter(),
            peeked: None,
        }
    }

    fn next(&mut self) -> Option<Token> {
        self.peeked.take().or_else(|| self.tokens.next())
    }

    fn peek(&mut self) -> Option<&Token> {
        if self.peeked.is_none() {
            self.peeked = self.tokens.next();
        }
        self.peeked.as_ref()
    }

    fn ident(&mut self, what: &str) -> Result<String, Error> {
        match self.next() {
            Some(Token::Ident(v)) => Ok(v),
            other => Err(Error::QueryError(format!(
                "expected {}, found {:?}",
                what, other
            ))),
        }
    }

    fn quoted(&mut self, what: &str) -> Result<String, Error> {
        match self.next() {
            Some(Token::Quoted(v)) => Ok(v),
            other => Err(Error::QueryError(format!(
                "expected quoted {}, found {:?}",
                what, other
            ))),
        }
    }

    fn keyword(&mut self, kw: &str) -> Result<(), Error> {
        match self.next() {
            Some(Token::Ident(v)) if v == kw => Ok(()),
            other => Err(Error::QueryError(format!(
                "expected keyword {}, found {:?}",
                kw, other
            ))),
        }
    }

    /// Optional `@<float>` suffix.
    fn confidence(&mut self) -> Result<Option<f64>, Error> {
        if matches!(self.peek(), Some(Token::At)) {
            let _ = self.next();
            let raw = self.ident("confidence value")?;
            let value = raw
                .parse::<f64>()
                .map_err(|_| Error::QueryError(format!("bad confidence value {:?}", raw)))?;
            Ok(Some(value))
        } else {
            Ok(None)
        }
    }

    fn at_meta(&mut self) -> bool {
        matches!(self.peek(), Some(Token::Ident(v)) if v == "SET")
    }

    fn meta(&mut self) -> Result<QueryMeta, Error> {
        self.keyword("SET")?;
        let set = self.quoted("set")?;
        self.keyword("CLASS")?;
        let class = self.quoted("class")?;
        self.keyword("ANNOTATOR")?;
        let annotator = self.quoted("annotator")?;
        if let Some(t) = self.next() {
            return Err(Error::QueryError(format!("trailing token {:?}", t)));
        }
        Ok(QueryMeta {
            set,
            class,
            annotator,
        })
    }
}

impl FromStr for EditQuery {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Error> {
        let mut p = Parser::new(lex(input)?);
        let verb = p.ident("query verb")?;
        let action = match verb.as_str() {
            "SUGGEST" => {
                let target = p.ident("target id")?;
                let mut suggestions = Vec::new();
                while matches!(p.peek(), Some(Token::Quoted(_))) {
                    let text = p.quoted("suggestion")?;
                    let conf = p.confidence()?;
                    suggestions.push((text, conf));
                }
                if suggestions.is_empty() {
                    return Err(Error::QueryError("SUGGEST requires at least one suggestion".into()));
                }
                EditAction::Suggest {
                    target,
                    suggestions,
                }
            }
            "FLAG" => EditAction::Flag {
                target: p.ident("target id")?,
            },
            "SPLIT" => {
                let target = p.ident("target id")?;
                let mut alternatives = Vec::new();
                while matches!(p.peek(), Some(Token::LBracket)) {
                    let _ = p.next();
                    let mut words = Vec::new();
                    loop {
                        match p.next() {
                            Some(Token::Quoted(w)) => words.push(w),
                            Some(Token::RBracket) => break,
                            other => {
                                return Err(Error::QueryError(format!(
                                    "expected quoted word or ']', found {:?}",
                                    other
                                )))
                            }
                        }
                    }
                    if words.is_empty() {
                        return Err(Error::QueryError("empty split alternative".into()));
                    }
                    let conf = p.confidence()?;
                    alternatives.push((words, conf));
                }
                if alternatives.is_empty() {
                    return Err(Error::QueryError("SPLIT requires at least one alternative".into()));
                }
                EditAction::Split {
                    target,
                    alternatives,
                }
            }
            "MERGE" => {
                let mut span = Vec::new();
                let replacement = loop {
                    match p.peek() {
                        Some(Token::Ident(_)) => span.push(p.ident("span word id")?),
                        Some(Token::Quoted(_)) => break p.quoted("replacement")?,
                        other => {
                            return Err(Error::QueryError(format!(
                                "expected word id or replacement, found {:?}",
                                other
                            )))
                        }
                    }
                };
                let confidence = p.confidence()?;
                EditAction::Merge {
                    span,
                    replacement,
                    confidence,
                }
            }
            "DELETE" => {
                let target = p.ident("target id")?;
                let merge = if !p.at_meta() {
                    p.keyword("MERGENEXT")?;
                    true
                } else {
                    false
                };
                EditAction::Delete { target, merge }
            }
            "INSERT" => {
                let side = p.ident("BEFORE or AFTER")?;
                let position = match side.as_str() {
                    "BEFORE" => InsertPosition::Before,
                    "AFTER" => InsertPosition::After,
                    _ => {
                        return Err(Error::QueryError(format!(
                            "expected BEFORE or AFTER, found {:?}",
                            side
                        )))
                    }
                };
                let pivot = p.ident("pivot id")?;
                let text = p.quoted("inserted word")?;
                let confidence = p.confidence()?;
                let split_sentence = if !p.at_meta() {
                    p.keyword("SPLITSENTENCE")?;
                    true
                } else {
                    false
                };
                EditAction::Insert {
                    pivot,
                    position,
                    text,
                    confidence,
                    split_sentence,
                }
            }
            _ => {
                return Err(Error::QueryError(format!("unknown query verb {:?}", verb)));
            }
        };
        let meta = p.meta()?;
        Ok(EditQuery { action, meta })
    }
}

fn correction(meta: &QueryMeta, current: Vec<String>, suggestions: Vec<Suggestion>) -> Correction {
    Correction {
        set: meta.set.clone(),
        class: meta.class.clone(),
        annotator: meta.annotator.clone(),
        annotator_type: ANNOTATOR_AUTO.into(),
        datetime: Utc::now(),
        current,
        suggestions,
    }
}

/// Execute one edit query against the document. Repeated queries targeting
/// the same element accumulate; a bad target id or malformed span is a
/// [`Error::QueryError`] and leaves the document untouched.
pub fn apply(doc: &mut Document, query: &EditQuery) -> Result<(), Error> {
    let meta = &query.meta;
    match &query.action {
        EditAction::Suggest {
            target,
            suggestions,
        } => {
            let word = doc
                .word_mut(target)
                .ok_or_else(|| Error::QueryError(format!("unknown target id {:?}", target)))?;
            let current = vec![word.text.clone()];
            let suggestions = suggestions
                .iter()
                .map(|(text, conf)| Suggestion::text(text.clone(), *conf))
                .collect();
            word.corrections.push(correction(meta, current, suggestions));
        }
        EditAction::Flag { target } => {
            let word = doc
                .word_mut(target)
                .ok_or_else(|| Error::QueryError(format!("unknown target id {:?}", target)))?;
            word.flags.push(ErrorFlag {
                set: meta.set.clone(),
                class: meta.class.clone(),
                annotator: meta.annotator.clone(),
            });
        }
        EditAction::Split {
            target,
            alternatives,
        } => {
            let word = doc
                .word_mut(target)
                .ok_or_else(|| Error::QueryError(format!("unknown target id {:?}", target)))?;
            let current = vec![word.text.clone()];
            let suggestions = alternatives
                .iter()
                .map(|(words, conf)| Suggestion {
                    words: words.clone(),
                    confidence: *conf,
                    merge: false,
                    split_sentence: false,
                })
                .collect();
            word.corrections.push(correction(meta, current, suggestions));
        }
        EditAction::Merge {
            span,
            replacement,
            confidence,
        } => {
            if span.len() < 2 {
                return Err(Error::QueryError(
                    "MERGE requires a span of at least two words".into(),
                ));
            }
            let first = &span[0];
            let sentence = doc.sentence_of_word_mut(first).ok_or_else(|| {
                Error::QueryError(format!("unknown target id {:?}", first))
            })?;
            let indices: Vec<usize> = span
                .iter()
                .map(|id| {
                    sentence
                        .word_index(id)
                        .ok_or_else(|| Error::QueryError(format!("span word {:?} not in sentence", id)))
                })
                .collect::<Result<_, _>>()?;
            for pair in indices.windows(2) {
                if pair[1] != pair[0] + 1 {
                    return Err(Error::QueryError(
                        "MERGE span words must be adjacent and ordered".into(),
                    ));
                }
            }
            let current = indices
                .iter()
                .map(|&i| sentence.words[i].text.clone())
                .collect();
            sentence.edits.push(SpanEdit {
                anchor: SpanAnchor::Span(span.clone()),
                correction: correction(
                    meta,
                    current,
                    vec![Suggestion::text(replacement.clone(), *confidence)],
                ),
            });
        }
        EditAction::Delete { target, merge } => {
            let word = doc
                .word_mut(target)
                .ok_or_else(|| Error::QueryError(format!("unknown target id {:?}", target)))?;
            let current = vec![word.text.clone()];
            word.corrections.push(correction(
                meta,
                current,
                vec![Suggestion {
                    words: Vec::new(),
                    confidence: None,
                    merge: *merge,
                    split_sentence: false,
                }],
            ));
        }
        EditAction::Insert {
            pivot,
            position,
            text,
            confidence,
            split_sentence,
        } => {
            let sentence = doc.sentence_of_word_mut(pivot).ok_or_else(|| {
                Error::QueryError(format!("unknown target id {:?}", pivot))
            })?;
            let anchor = match position {
                InsertPosition::Before => SpanAnchor::Before(pivot.clone()),
                InsertPosition::After => SpanAnchor::After(pivot.clone()),
            };
            sentence.edits.push(SpanEdit {
                anchor,
                correction: correction(
                    meta,
                    Vec::new(),
                    vec![Suggestion {
                        words: vec![text.clone()],
                        confidence: *confidence,
                        merge: false,
                        split_sentence: *split_sentence,
                    }],
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::tokenize::tokenize;

    fn meta() -> QueryMeta {
        QueryMeta {
            set: "spellingcorrection".into(),
            class: "nonworderror".into(),
            annotator: "errorlist".into(),
        }
    }

    fn doc() -> Document {
        tokenize("untitled", "the speling is bad")
    }

    #[test]
    fn suggest_round_trip() {
        let q = EditQuery::new(
            EditAction::Suggest {
                target: "untitled.p.1.s.1.w.2".into(),
                suggestions: vec![("spelling".into(), Some(0.9)), ("spellings".into(), None)],
            },
            meta(),
        );
        let text = q.to_string();
        let back: EditQuery = text.parse().unwrap();
        assert_eq!(q, back);
    }

    #[test]
    fn embedded_quotes_survive_round_trip() {
        let q = EditQuery::new(
            EditAction::Suggest {
                target: "untitled.p.1.s.1.w.2".into(),
                suggestions: vec![("say \"hi\"".into(), None), ("back\\slash".into(), Some(0.5))],
            },
            meta(),
        );
        let text = q.to_string();
        let back: EditQuery = text.parse().unwrap();
        assert_eq!(q, back);
    }

    #[test]
    fn split_and_merge_round_trip() {
        let q = EditQuery::new(
            EditAction::Split {
                target: "untitled.p.1.s.1.w.2".into(),
                alternatives: vec![
                    (vec!["mis".into(), "takes".into()], Some(0.9)),
                    (vec!["mi".into(), "stakes".into()], None),
                ],
            },
            meta(),
        );
        let back: EditQuery = q.to_string().parse().unwrap();
        assert_eq!(q, back);

        let q = EditQuery::new(
            EditAction::Merge {
                span: vec!["untitled.p.1.s.1.w.1".into(), "untitled.p.1.s.1.w.2".into()],
                replacement: "thespeling".into(),
                confidence: Some(0.8),
            },
            meta(),
        );
        let back: EditQuery = q.to_string().parse().unwrap();
        assert_eq!(q, back);
    }

    #[test]
    fn delete_and_insert_round_trip() {
        let q = EditQuery::new(
            EditAction::Delete {
                target: "untitled.p.1.s.1.w.4".into(),
                merge: true,
            },
            meta(),
        );
        let back: EditQuery = q.to_string().parse().unwrap();
        assert_eq!(q, back);

        let q = EditQuery::new(
            EditAction::Insert {
                pivot: "untitled.p.1.s.1.w.2".into(),
                position: InsertPosition::After,
                text: "very".into(),
                confidence: Some(0.4),
                split_sentence: true,
            },
            meta(),
        );
        let back: EditQuery = q.to_string().parse().unwrap();
        assert_eq!(q, back);
    }

    #[test]
    fn apply_suggest_accumulates() {
        let mut d = doc();
        let q = EditQuery::new(
            EditAction::Suggest {
                target: "untitled.p.1.s.1.w.2".into(),
                suggestions: vec![("spelling".into(), None)],
            },
            meta(),
        );
        apply(&mut d, &q).unwrap();
        apply(&mut d, &q).unwrap();
        let word = d.word("untitled.p.1.s.1.w.2").unwrap();
        assert_eq!(word.corrections.len(), 2);
        assert_eq!(word.text, "speling");
        assert_eq!(word.corrections[0].current, vec!["speling"]);
        assert_eq!(word.corrections[0].suggestions[0].joined(), "spelling");
        assert_eq!(word.corrections[0].annotator_type, ANNOTATOR_AUTO);
    }

    #[test]
    fn apply_split_preserves_current() {
        let mut d = tokenize("untitled", "there are mistakess here");
        let q = EditQuery::new(
            EditAction::Split {
                target: "untitled.p.1.s.1.w.3".into(),
                alternatives: vec![(vec!["mis".into(), "takes".into()], Some(0.9))],
            },
            QueryMeta {
                set: "spellingcorrection".into(),
                class: "spliterror".into(),
                annotator: "splitter".into(),
            },
        );
        apply(&mut d, &q).unwrap();
        let word = d.word("untitled.p.1.s.1.w.3").unwrap();
        let c = &word.corrections[0];
        assert_eq!(c.class, "spliterror");
        assert_eq!(c.current, vec!["mistakess"]);
        assert_eq!(c.suggestions[0].words, vec!["mis", "takes"]);
        assert_eq!(c.suggestions[0].confidence, Some(0.9));
    }

    #[test]
    fn apply_merge_requires_adjacency() {
        let mut d = doc();
        let q = EditQuery::new(
            EditAction::Merge {
                span: vec!["untitled.p.1.s.1.w.1".into(), "untitled.p.1.s.1.w.3".into()],
                replacement: "theis".into(),
                confidence: None,
            },
            meta(),
        );
        assert!(matches!(apply(&mut d, &q), Err(Error::QueryError(_))));
        assert_eq!(d.correction_count(), 0);

        let q = EditQuery::new(
            EditAction::Merge {
                span: vec!["untitled.p.1.s.1.w.1".into(), "untitled.p.1.s.1.w.2".into()],
                replacement: "thespeling".into(),
                confidence: None,
            },
            meta(),
        );
        apply(&mut d, &q).unwrap();
        let sentence = d.sentence_of_word("untitled.p.1.s.1.w.1").unwrap();
        assert_eq!(sentence.edits.len(), 1);
        assert_eq!(sentence.edits[0].correction.current, vec!["the", "speling"]);
    }

    #[test]
    fn apply_unknown_target_is_query_error() {
        let mut d = doc();
        let q = EditQuery::new(
            EditAction::Flag {
                target: "untitled.p.9.s.9.w.9".into(),
            },
            meta(),
        );
        assert!(matches!(apply(&mut d, &q), Err(Error::QueryError(_))));
    }

    #[test]
    fn apply_delete_attaches_empty_suggestion() {
        let mut d = doc();
        let q = EditQuery::new(
            EditAction::Delete {
                target: "untitled.p.1.s.1.w.4".into(),
                merge: false,
            },
            meta(),
        );
        apply(&mut d, &q).unwrap();
        let word = d.word("untitled.p.1.s.1.w.4").unwrap();
        assert!(word.corrections[0].suggestions[0].words.is_empty());
    }

    #[test]
    fn malformed_query_strings_are_rejected() {
        assert!("SUGGEST".parse::<EditQuery>().is_err());
        assert!("NONSENSE x".parse::<EditQuery>().is_err());
        assert!("SUGGEST id \"unterminated".parse::<EditQuery>().is_err());
        assert!("SUGGEST id \"text\"".parse::<EditQuery>().is_err());
    }
}
