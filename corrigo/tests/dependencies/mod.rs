#![allow(dead_code)]
use std::sync::Once;

pub mod casing;
pub mod confusible;
pub mod failing;
pub mod ordered;
pub mod splitter;

static REGISTER: Once = Once::new();

/// Register every mock module exactly once per test binary.
pub fn register_mock_modules() {
    REGISTER.call_once(|| {
        casing::register_casing().unwrap();
        confusible::register_confusible().unwrap();
        failing::register_failing().unwrap();
        ordered::register_ordered().unwrap();
        splitter::register_splitter().unwrap();
    });
}
