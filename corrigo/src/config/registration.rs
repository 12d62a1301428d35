use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, error};

use super::{Callback, ConfigSpec, RegisteredModule};
use crate::Error;

static REGISTRY: Lazy<Mutex<HashMap<String, RegisteredModule>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Registers a module implementation under a selector name. Configurations
/// pick implementations by this name through their `module:` field; the
/// registry is populated once at program start (a compile-time catalog, not
/// dynamic loading).
///
/// ```compile_fail
/// use corrigo::config::{register_module, ConfigSpec};
///
/// let conf_spec = ConfigSpec::from_schema("type: object").unwrap();
/// register_module("dummy".into(), conf_spec, |ctx| {
///     Ok(Box::new(Dummy::from_context(ctx)?))
/// }).unwrap();
/// ```
pub fn register_module(name: String, format: ConfigSpec, creator: Callback) -> Result<(), Error> {
    let r = RegisteredModule { creator, format };

    match REGISTRY.lock() {
        Ok(mut lock) => {
            if lock.insert(name.clone(), r).is_some() {
                error!(name = name.clone(), "module is already registered");
                return Err(Error::DuplicateRegisteredName(name));
            };
            debug!(name = name.clone(), "module registered");
        }
        Err(_) => {
            error!(kind = "unable to secure write lock", "InternalServerError");
            return Err(Error::UnableToSecureLock);
        }
    };

    Ok(())
}

/// Look up a registered module implementation by selector name.
pub(crate) fn get_registered(name: &str) -> Result<RegisteredModule, Error> {
    match REGISTRY.lock() {
        Ok(lock) => {
            if let Some(item) = lock.get(name) {
                return Ok(item.clone());
            }
        }
        Err(_) => return Err(Error::UnableToSecureLock),
    };
    Err(Error::ModuleNotRegistered(name.into()))
}
