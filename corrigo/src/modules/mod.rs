//! Built-in correction modules. Each submodule registers itself under a
//! selector name that configurations reference through `module:`.
use crate::Error;

pub mod dummy;
pub mod errorlist;

pub(crate) fn register_modules() -> Result<(), Error> {
    errorlist::register_errorlist()?;
    dummy::register_dummy()?;
    Ok(())
}
