//! No-op module: accepts its configured unit type and suggests nothing.
//! Useful for wiring smoke tests and as the smallest module skeleton.
use async_trait::async_trait;
use corrigo_macros::corrigo_registration_func;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::{register_module, ConfigSpec, ModuleContext};
use crate::{Document, EditQuery, Error, Module, Parameters, Unit, UnitType};

#[derive(Debug, Clone, Deserialize)]
struct DummySettings {
    #[serde(default = "default_unit")]
    unit: UnitType,
}

fn default_unit() -> UnitType {
    UnitType::Word
}

/// The dummy module.
pub struct Dummy {
    unit: UnitType,
}

impl Dummy {
    fn from_context(ctx: ModuleContext) -> Result<Self, Error> {
        let settings: DummySettings = if ctx.settings.is_null() {
            DummySettings {
                unit: default_unit(),
            }
        } else {
            serde_yaml::from_value(ctx.settings.clone())?
        };
        Ok(Dummy {
            unit: settings.unit,
        })
    }
}

#[async_trait]
impl Module for Dummy {
    fn unit_type(&self) -> UnitType {
        self.unit
    }

    fn init(&self, _doc: &mut Document) -> Result<(), Error> {
        Ok(())
    }

    fn prepare_input(
        &self,
        unit: &Unit,
        _parameters: &Parameters,
    ) -> Result<Option<Value>, Error> {
        Ok(Some(json!(unit.id())))
    }

    async fn run(&self, _payload: Value) -> Result<Option<Value>, Error> {
        Ok(None)
    }

    fn process_output(
        &self,
        _output: Value,
        _payload: Value,
        _unit_id: &str,
        _parameters: &Parameters,
    ) -> Result<Vec<EditQuery>, Error> {
        Ok(Vec::new())
    }
}

#[corrigo_registration_func]
fn create_dummy(ctx: ModuleContext) -> Result<Box<dyn Module>, Error> {
    Ok(Box::new(Dummy::from_context(ctx)?))
}

pub(super) fn register_dummy() -> Result<(), Error> {
    let config = "type: object
properties:
  unit:
    type: string
    enum: [document, paragraph, sentence, word]
additionalProperties: false";
    let conf_spec = ConfigSpec::from_schema(config)?;

    register_module("dummy".into(), conf_spec, create_dummy)
}

#[cfg(test)]
mod test {
    use super::*;

    fn context(settings: &str) -> ModuleContext {
        ModuleContext {
            id: "dummy".into(),
            set: None,
            class: None,
            annotator: "dummy".into(),
            models: vec![],
            sources: vec![],
            settings: serde_yaml::from_str(settings).unwrap(),
        }
    }

    #[test]
    fn configurable_unit_type() {
        let module = Dummy::from_context(context("{}")).unwrap();
        assert_eq!(module.unit_type(), UnitType::Word);
        let module = Dummy::from_context(context("unit: sentence")).unwrap();
        assert_eq!(module.unit_type(), UnitType::Sentence);
    }

    #[tokio::test]
    async fn run_yields_nothing() {
        let module = Dummy::from_context(context("{}")).unwrap();
        assert_eq!(module.run(json!("anything")).await.unwrap(), None);
    }
}
