//! Mock context-confusible module: one fixed confusible pair with a
//! confidence, configured through settings.
use async_trait::async_trait;
use corrigo::config::{register_module, ConfigSpec, ModuleContext};
use corrigo::document::query::{EditAction, QueryMeta};
use corrigo::{Document, EditQuery, Error, Module, Parameters, Unit, UnitType};
use corrigo_macros::corrigo_registration_func;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
struct ConfusibleSettings {
    from: String,
    to: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    0.75
}

pub struct Confusible {
    meta: QueryMeta,
    from: String,
    to: String,
    confidence: f64,
}

#[async_trait]
impl Module for Confusible {
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
        if word == self.from {
            Ok(Some(json!(self.to)))
        } else {
            Ok(None)
        }
    }

    fn process_output(
        &self,
        output: Value,
        _payload: Value,
        unit_id: &str,
        _parameters: &Parameters,
    ) -> Result<Vec<EditQuery>, Error> {
        let suggestion: String = serde_json::from_value(output)?;
        Ok(vec![EditQuery::new(
            EditAction::Suggest {
                target: unit_id.into(),
                suggestions: vec![(suggestion, Some(self.confidence))],
            },
            self.meta.clone(),
        )])
    }
}

#[corrigo_registration_func]
fn create_confusible(ctx: ModuleContext) -> Result<Box<dyn Module>, Error> {
    let settings: ConfusibleSettings = serde_yaml::from_value(ctx.settings.clone())
        .map_err(|e| Error::ConfigFailedValidation(format!("{e}")))?;
    Ok(Box::new(Confusible {
        meta: QueryMeta {
            set: ctx.set_or_default(),
            class: ctx.class_or("confusible"),
            annotator: ctx.annotator.clone(),
        },
        from: settings.from,
        to: settings.to,
        confidence: settings.confidence,
    }))
}

pub fn register_confusible() -> Result<(), Error> {
    let config = "type: object
properties:
  from:
    type: string
  to:
    type: string
  confidence:
    type: number
required: [from, to]";
    let conf_spec = ConfigSpec::from_schema(config)?;
    register_module("confusible".into(), conf_spec, create_confusible)
}
