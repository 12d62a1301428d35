//! Mock module pair for dependency-barrier tests: `ordered_first` records
//! its first applied result in a shared flag; `ordered_second` counts a
//! violation whenever its `run` starts before that flag is set.
use async_trait::async_trait;
use corrigo::config::{register_module, ConfigSpec, ModuleContext};
use corrigo::document::query::QueryMeta;
use corrigo::{Document, EditQuery, Error, Module, Parameters, Unit, UnitType};
use corrigo_macros::corrigo_registration_func;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub static FIRST_COMPLETED: AtomicBool = AtomicBool::new(false);
pub static SECOND_RAN: AtomicUsize = AtomicUsize::new(0);
pub static ORDER_VIOLATIONS: AtomicUsize = AtomicUsize::new(0);

pub fn reset_order_state() {
    FIRST_COMPLETED.store(false, Ordering::SeqCst);
    SECOND_RAN.store(0, Ordering::SeqCst);
    ORDER_VIOLATIONS.store(0, Ordering::SeqCst);
}

pub struct First {
    meta: QueryMeta,
}

#[async_trait]
impl Module for First {
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
        Ok(Some(payload))
    }

    fn process_output(
        &self,
        _output: Value,
        _payload: Value,
        _unit_id: &str,
        _parameters: &Parameters,
    ) -> Result<Vec<EditQuery>, Error> {
        FIRST_COMPLETED.store(true, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

pub struct Second;

#[async_trait]
impl Module for Second {
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
        Ok(unit.word().map(|w| json!(w.text)))
    }

    async fn run(&self, _payload: Value) -> Result<Option<Value>, Error> {
        let _ = SECOND_RAN.fetch_add(1, Ordering::SeqCst);
        if !FIRST_COMPLETED.load(Ordering::SeqCst) {
            let _ = ORDER_VIOLATIONS.fetch_add(1, Ordering::SeqCst);
        }
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
fn create_first(ctx: ModuleContext) -> Result<Box<dyn Module>, Error> {
    Ok(Box::new(First {
        meta: QueryMeta {
            set: ctx.set_or_default(),
            class: ctx.class_or("correction"),
            annotator: ctx.annotator.clone(),
        },
    }))
}

#[corrigo_registration_func]
fn create_second(_ctx: ModuleContext) -> Result<Box<dyn Module>, Error> {
    Ok(Box::new(Second))
}

pub fn register_ordered() -> Result<(), Error> {
    register_module(
        "ordered_first".into(),
        ConfigSpec::from_schema("type: object")?,
        create_first,
    )?;
    register_module(
        "ordered_second".into(),
        ConfigSpec::from_schema("type: object")?,
        create_second,
    )
}
