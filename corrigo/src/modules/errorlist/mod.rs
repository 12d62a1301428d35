//! Word-level error list: exact lookup of known misspellings.
//!
//! Model files are TSV with `wrong<TAB>correct` pairs (the delimiter is
//! configurable; `reversedformat` swaps the columns). A wrong form that
//! occurs on several lines accumulates all its corrections as alternative
//! suggestions.
use async_trait::async_trait;
use corrigo_macros::corrigo_registration_func;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::{register_module, ConfigSpec, ModuleContext};
use crate::document::query::{EditAction, QueryMeta};
use crate::{Document, EditQuery, Error, Module, Parameters, Unit, UnitType};

const DEFAULT_CLASS: &str = "nonworderror";

fn default_delimiter() -> String {
    "\t".into()
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorListSettings {
    #[serde(default = "default_delimiter")]
    delimiter: String,
    /// Reversed format has (correct, wrong) pairs rather than (wrong, correct)
    #[serde(default)]
    reversedformat: bool,
}

impl Default for ErrorListSettings {
    fn default() -> Self {
        ErrorListSettings {
            delimiter: default_delimiter(),
            reversedformat: false,
        }
    }
}

/// The error-list module. The list itself lives in whichever process calls
/// `load`: the master for local runs, the server for remote ones.
pub struct ErrorList {
    meta: QueryMeta,
    models: Vec<PathBuf>,
    settings: ErrorListSettings,
    errors: FxHashMap<String, Vec<String>>,
}

impl ErrorList {
    fn from_context(ctx: ModuleContext) -> Result<Self, Error> {
        let settings: ErrorListSettings = if ctx.settings.is_null() {
            ErrorListSettings::default()
        } else {
            serde_yaml::from_value(ctx.settings.clone())?
        };
        Ok(ErrorList {
            meta: QueryMeta {
                set: ctx.set_or_default(),
                class: ctx.class_or(DEFAULT_CLASS),
                annotator: ctx.annotator.clone(),
            },
            models: ctx.models,
            settings,
            errors: FxHashMap::default(),
        })
    }

    fn insert_line(&mut self, file: &Path, line: &str) -> Result<(), Error> {
        if line.is_empty() {
            return Ok(());
        }
        let fields: Vec<&str> = line.split(self.settings.delimiter.as_str()).collect();
        if fields.len() != 2 {
            return Err(Error::InvalidModel(format!(
                "syntax error in {}, expected two items, got {}",
                file.display(),
                fields.len()
            )));
        }
        let (wrong, correct) = if self.settings.reversedformat {
            (fields[1], fields[0])
        } else {
            (fields[0], fields[1])
        };
        self.errors
            .entry(wrong.to_string())
            .or_default()
            .push(correct.to_string());
        Ok(())
    }
}

#[async_trait]
impl Module for ErrorList {
    fn unit_type(&self) -> UnitType {
        UnitType::Word
    }

    fn init(&self, doc: &mut Document) -> Result<(), Error> {
        doc.declare(&self.meta.set, &self.meta.annotator);
        Ok(())
    }

    fn prepare_input(
        &self,
        unit: &Unit,
        _parameters: &Parameters,
    ) -> Result<Option<Value>, Error> {
        Ok(unit.word().map(|w| json!(w.text)))
    }

    async fn load(&mut self) -> Result<(), Error> {
        if self.models.is_empty() {
            return Err(Error::InvalidModel(
                "specify one or more models to load".into(),
            ));
        }
        for file in self.models.clone() {
            info!(model = %file.display(), "loading error list");
            let content =
                tokio::fs::read_to_string(&file)
                    .await
                    .map_err(|e| Error::InvalidModel(format!(
                        "missing expected model file {}: {}",
                        file.display(),
                        e
                    )))?;
            for line in content.lines() {
                self.insert_line(&file, line)?;
            }
        }
        debug!(entries = self.errors.len(), "error list loaded");
        Ok(())
    }

    async fn run(&self, payload: Value) -> Result<Option<Value>, Error> {
        let word = payload
            .as_str()
            .ok_or_else(|| Error::ModuleRunError("expected string payload".into()))?;
        Ok(self.errors.get(word).map(|suggestions| json!(suggestions)))
    }

    fn process_output(
        &self,
        output: Value,
        _payload: Value,
        unit_id: &str,
        _parameters: &Parameters,
    ) -> Result<Vec<EditQuery>, Error> {
        let suggestions: Vec<String> = serde_json::from_value(output)?;
        if suggestions.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![EditQuery::new(
            EditAction::Suggest {
                target: unit_id.into(),
                suggestions: suggestions.into_iter().map(|s| (s, None)).collect(),
            },
            self.meta.clone(),
        )])
    }
}

#[corrigo_registration_func]
fn create_errorlist(ctx: ModuleContext) -> Result<Box<dyn Module>, Error> {
    Ok(Box::new(ErrorList::from_context(ctx)?))
}

pub(super) fn register_errorlist() -> Result<(), Error> {
    let config = "type: object
properties:
  delimiter:
    type: string
  reversedformat:
    type: boolean
additionalProperties: false";
    let conf_spec = ConfigSpec::from_schema(config)?;

    register_module("errorlist".into(), conf_spec, create_errorlist)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    fn context(models: Vec<PathBuf>, settings: &str) -> ModuleContext {
        ModuleContext {
            id: "errlist".into(),
            set: None,
            class: None,
            annotator: "errlist".into(),
            models,
            sources: vec![],
            settings: serde_yaml::from_str(settings).unwrap(),
        }
    }

    fn model_file(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[tokio::test]
    async fn lookup_hits_and_misses() {
        let model = model_file("speling\tspelling\nteh\tthe\n");
        let mut module =
            ErrorList::from_context(context(vec![model.path().into()], "{}")).unwrap();
        module.load().await.unwrap();

        let hit = module.run(json!("speling")).await.unwrap();
        assert_eq!(hit, Some(json!(["spelling"])));
        let miss = module.run(json!("spelling")).await.unwrap();
        assert_eq!(miss, None);
    }

    #[tokio::test]
    async fn repeated_wrongs_accumulate() {
        let model = model_file("thier\ttheir\nthier\tthere\n");
        let mut module =
            ErrorList::from_context(context(vec![model.path().into()], "{}")).unwrap();
        module.load().await.unwrap();
        let hit = module.run(json!("thier")).await.unwrap();
        assert_eq!(hit, Some(json!(["their", "there"])));
    }

    #[tokio::test]
    async fn reversed_format_swaps_columns() {
        let model = model_file("spelling\tspeling\n");
        let mut module = ErrorList::from_context(context(
            vec![model.path().into()],
            "reversedformat: true",
        ))
        .unwrap();
        module.load().await.unwrap();
        let hit = module.run(json!("speling")).await.unwrap();
        assert_eq!(hit, Some(json!(["spelling"])));
    }

    #[tokio::test]
    async fn malformed_line_is_rejected() {
        let model = model_file("onlyonefield\n");
        let mut module =
            ErrorList::from_context(context(vec![model.path().into()], "{}")).unwrap();
        assert!(matches!(
            module.load().await,
            Err(Error::InvalidModel(_))
        ));
    }

    #[tokio::test]
    async fn missing_model_is_rejected() {
        let mut module = ErrorList::from_context(context(
            vec![PathBuf::from("/nonexistent/errors.tsv")],
            "{}",
        ))
        .unwrap();
        assert!(matches!(module.load().await, Err(Error::InvalidModel(_))));

        let mut empty = ErrorList::from_context(context(vec![], "{}")).unwrap();
        assert!(matches!(empty.load().await, Err(Error::InvalidModel(_))));
    }

    #[test]
    fn output_becomes_suggest_query() {
        let module = ErrorList::from_context(context(vec![], "{}")).unwrap();
        let queries = module
            .process_output(
                json!(["spelling"]),
                json!("speling"),
                "untitled.p.1.s.1.w.2",
                &Parameters::new(),
            )
            .unwrap();
        assert_eq!(queries.len(), 1);
        match &queries[0].action {
            EditAction::Suggest {
                target,
                suggestions,
            } => {
                assert_eq!(target, "untitled.p.1.s.1.w.2");
                assert_eq!(suggestions, &vec![("spelling".to_string(), None)]);
            }
            other => panic!("expected Suggest, got {:?}", other),
        }
        assert_eq!(queries[0].meta.class, "nonworderror");
        assert_eq!(queries[0].meta.set, "spellingcorrection");
    }

    #[test]
    fn register_module_entry() {
        let _ = register_errorlist();
    }
}
