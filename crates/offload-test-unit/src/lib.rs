//! Code unit library for end-to-end tests.
//!
//! The unit greets its first argument. Loaded as a preload module first,
//! its hook sets the greeting; `OFFLOAD_TEST_UNIT_PRELOAD=fail` makes the
//! hook refuse instead.

use std::sync::OnceLock;

use offload_core::{ErrorValue, Rejection, Value};

/// Set by the preload hook.
static GREETING: OnceLock<String> = OnceLock::new();

pub const PRELOAD_ENV: &str = "OFFLOAD_TEST_UNIT_PRELOAD";

pub fn greet(args: Vec<Value>) -> Result<Value, Rejection> {
    match args.first().and_then(Value::as_str) {
        Some("fail") => Err(Rejection::Error(
            ErrorValue::new("Failure!").with_field("code", 404),
        )),
        Some("reject-data") => Err(Rejection::data(args[1..].to_vec())),
        Some("panic") => panic!("unit exploded"),
        name => {
            let greeting = GREETING.get().map(String::as_str).unwrap_or("Hi");
            Ok(Value::from(format!("{}, {}!", greeting, name.unwrap_or("world"))))
        }
    }
}

pub fn preload() -> Result<(), ErrorValue> {
    if std::env::var(PRELOAD_ENV).as_deref() == Ok("fail") {
        return Err(ErrorValue::new("preload refused").with_field("code", 7));
    }
    let _ = GREETING.set("Hello".to_string());
    Ok(())
}

offload_core::export_unit!(greet, preload = preload);
