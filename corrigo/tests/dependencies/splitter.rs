//! Mock split module: proposes word splits from a fixed table.
use async_trait::async_trait;
use corrigo::config::{register_module, ConfigSpec, ModuleContext};
use corrigo::document::query::{EditAction, QueryMeta};
use corrigo::{Document, EditQuery, Error, Module, Parameters, Unit, UnitType};
use corrigo_macros::corrigo_registration_func;
use serde_json::{json, Value};

pub struct Splitter {
    meta: QueryMeta,
}

#[async_trait]
impl Module for Splitter {
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

    async fn run(&self, payload: Value) -> Result<Option<Value>, Error> {
        let word = payload
            .as_str()
            .ok_or_else(|| Error::ModuleRunError("expected string payload".into()))?;
        match word {
            "mistakess" => Ok(Some(json!([{ "words": ["mis", "takes"], "confidence": 0.9 }]))),
            _ => Ok(None),
        }
    }

    fn process_output(
        &self,
        output: Value,
        _payload: Value,
        unit_id: &str,
        _parameters: &Parameters,
    ) -> Result<Vec<EditQuery>, Error> {
        #[derive(serde::Deserialize)]
        struct Alt {
            words: Vec<String>,
            confidence: Option<f64>,
        }
        let alternatives: Vec<Alt> = serde_json::from_value(output)?;
        Ok(vec![EditQuery::new(
            EditAction::Split {
                target: unit_id.into(),
                alternatives: alternatives
                    .into_iter()
                    .map(|a| (a.words, a.confidence))
                    .collect(),
            },
            self.meta.clone(),
        )])
    }
}

#[corrigo_registration_func]
fn create_splitter(ctx: ModuleContext) -> Result<Box<dyn Module>, Error> {
    Ok(Box::new(Splitter {
        meta: QueryMeta {
            set: ctx.set_or_default(),
            class: ctx.class_or("spliterror"),
            annotator: ctx.annotator.clone(),
        },
    }))
}

pub fn register_splitter() -> Result<(), Error> {
    let conf_spec = ConfigSpec::from_schema("type: object")?;
    register_module("splitter".into(), conf_spec, create_splitter)
}
