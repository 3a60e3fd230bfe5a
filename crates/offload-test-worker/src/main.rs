//! Fixture worker with code units linked in, for end-to-end tests.
//!
//! Behaves like `offload-worker` but resolves targets against a static
//! registry instead of loading libraries.

use std::process::ExitCode;
use std::sync::OnceLock;
use std::time::Duration;

use clap::Parser;
use offload_core::logging;
use offload_core::worker::{self, UnitRegistry, WorkerArgs};
use offload_core::{ErrorValue, Rejection, Value};

static GREETING: OnceLock<String> = OnceLock::new();

fn first(args: Vec<Value>) -> Value {
    args.into_iter().next().unwrap_or_default()
}

fn fixtures() -> UnitRegistry {
    UnitRegistry::new()
        .sync_unit("basic", |_| Ok(Value::from("Hello, world!")))
        .unit("return", |args| async move { Ok(first(args)) })
        .unit("delayed", |args| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(first(args))
        })
        .sync_unit("arguments", |args| Ok(Value::Array(args)))
        .unit("reject-data", |args| async move { Err(Rejection::Data(first(args))) })
        .unit("reject-error", |_| async {
            tokio::task::yield_now().await;
            Err(Rejection::Error(
                ErrorValue::new("Failure!").with_field("code", 404),
            ))
        })
        .sync_unit("throw-error", |_| {
            Err(Rejection::Error(ErrorValue::new("Failure!")))
        })
        .sync_unit("panic", |_| panic!("Failure!"))
        .sync_unit("env", |args| {
            let vars = args
                .iter()
                .filter_map(Value::as_str)
                .map(|name| (name.to_string(), Value::from(std::env::var(name).ok())))
                .collect();
            Ok(Value::Object(vars))
        })
        .factory("module-error", || {
            Err(ErrorValue::new("Throwing during module exec"))
        })
        .sync_unit("exit-early", |_| std::process::exit(0))
        .sync_unit("exit-bad", |_| std::process::exit(2))
        .sync_unit("abort", |_| std::process::abort())
        .unit("callback", |args| async move {
            let Some(callback) = args.first().and_then(Value::as_callback).cloned() else {
                return Err(Rejection::Error(ErrorValue::new("expected a callback")));
            };
            callback
                .call(vec![Value::from("DATA!")])
                .await
                .map_err(Rejection::from)
        })
        .sync_unit("too-deep", |_| {
            let depth = offload_core::rpc::codec::MAX_DEPTH + 1;
            Ok((0..depth).fold(Value::Null, |inner, _| Value::from(vec![inner])))
        })
        .sync_unit("greeting", |args| {
            let greeting = GREETING.get().ok_or_else(|| {
                Rejection::Error(ErrorValue::new("greeting-hook was not preloaded"))
            })?;
            let name = args.first().and_then(Value::as_str).unwrap_or("world");
            Ok(Value::from(format!("{}, {}!", greeting, name)))
        })
        .preload_hook("greeting-hook", || {
            let _ = GREETING.set("Hello".to_string());
            Ok(())
        })
        .preload_hook("failing-hook", || Err(ErrorValue::new("hook refused to load")))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    let args = WorkerArgs::parse();
    logging::init();
    tracing::debug!("Fixture worker starting for '{}'", args.target);

    let code = worker::run(&args, fixtures()).await?;
    Ok(ExitCode::from(code as u8))
}
