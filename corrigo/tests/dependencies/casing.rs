//! Mock word module suggesting the uppercased form of any lowercase word.
use async_trait::async_trait;
use corrigo::config::{register_module, ConfigSpec, ModuleContext};
use corrigo::document::query::{EditAction, QueryMeta};
use corrigo::{Document, EditQuery, Error, Module, Parameters, Unit, UnitType};
use corrigo_macros::corrigo_registration_func;
use serde_json::{json, Value};

pub struct Casing {
    meta: QueryMeta,
}

#[async_trait]
impl Module for Casing {
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
        if word.chars().any(|c| c.is_lowercase()) {
            Ok(Some(json!(word.to_uppercase())))
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
                suggestions: vec![(suggestion, None)],
            },
            self.meta.clone(),
        )])
    }
}

#[corrigo_registration_func]
fn create_casing(ctx: ModuleContext) -> Result<Box<dyn Module>, Error> {
    Ok(Box::new(Casing {
        meta: QueryMeta {
            set: ctx.set_or_default(),
            class: ctx.class_or("capitalizationerror"),
            annotator: ctx.annotator.clone(),
        },
    }))
}

pub fn register_casing() -> Result<(), Error> {
    let conf_spec = ConfigSpec::from_schema("type: object")?;
    register_module("casing".into(), conf_spec, create_casing)
}
