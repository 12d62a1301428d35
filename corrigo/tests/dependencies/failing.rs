//! Mock module whose `run` always fails, for containment tests.
use async_trait::async_trait;
use corrigo::config::{register_module, ConfigSpec, ModuleContext};
use corrigo::{Document, EditQuery, Error, Module, Parameters, Unit, UnitType};
use corrigo_macros::corrigo_registration_func;
use serde_json::{json, Value};

pub struct Failing;

#[async_trait]
impl Module for Failing {
    fn unit_type(&self) -> UnitType {
        UnitType::Word
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
        Err(Error::ModuleRunError("deliberate failure".into()))
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
fn create_failing(_ctx: ModuleContext) -> Result<Box<dyn Module>, Error> {
    Ok(Box::new(Failing))
}

pub fn register_failing() -> Result<(), Error> {
    let conf_spec = ConfigSpec::from_schema("type: object")?;
    register_module("failing".into(), conf_spec, create_failing)
}
