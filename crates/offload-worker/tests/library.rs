//! Invocations of a shared-library unit through the real worker binary.

use std::path::{Path, PathBuf};

use offload_core::{InvokeError, Invoker, InvokerOptions, Value, create_invoker};

const WORKER: &str = env!("CARGO_BIN_EXE_offload-worker");

/// The `offload-test-unit` cdylib, built alongside the worker.
fn unit_library() -> String {
    let name = format!(
        "{}offload_test_unit{}",
        std::env::consts::DLL_PREFIX,
        std::env::consts::DLL_SUFFIX
    );
    let target_dir = Path::new(WORKER).parent().unwrap();
    [target_dir.to_path_buf(), target_dir.join("deps")]
        .into_iter()
        .map(|dir| dir.join(&name))
        .find(|path| path.exists())
        .map(PathBuf::into_os_string)
        .and_then(|path| path.into_string().ok())
        .unwrap_or_else(|| panic!("{} was not built next to {}", name, WORKER))
}

fn options() -> InvokerOptions {
    InvokerOptions::default().with_executable(WORKER)
}

fn invoker(options: InvokerOptions) -> Invoker {
    create_invoker(unit_library(), options)
}

async fn failure(options: InvokerOptions, args: Vec<Value>) -> InvokeError {
    match invoker(options).invoke(args).await {
        Ok(value) => panic!("expected a failure, got {:?}", value),
        Err(error) => error,
    }
}

#[tokio::test]
async fn test_library_unit_resolves() {
    let value = invoker(options()).invoke(vec![Value::from("Ada")]).await.unwrap();
    assert_eq!(value, Value::from("Hi, Ada!"));
}

#[tokio::test]
async fn test_preload_hook_runs_before_the_unit() {
    let value = invoker(options().with_preload(unit_library()))
        .invoke(vec![Value::from("Ada")])
        .await
        .unwrap();
    assert_eq!(value, Value::from("Hello, Ada!"));
}

#[tokio::test]
async fn test_refusing_preload_hook_fails_the_worker() {
    let options = options()
        .with_preload(unit_library())
        .with_env("OFFLOAD_TEST_UNIT_PRELOAD", "fail");
    let error = failure(options, vec![Value::from("Ada")]).await;
    assert_eq!(error.exit_status().and_then(|s| s.code()), Some(1), "{}", error);
}

#[tokio::test]
async fn test_library_rejections_keep_their_shape() {
    let error = failure(options(), vec![Value::from("fail")]).await;
    let error = error.error_value().expect("error rejection");
    assert_eq!(error.message(), "Failure!");
    assert_eq!(error.field("code").and_then(Value::as_i64), Some(404));
    assert!(error.stack().contains(&format!("at {}", unit_library())));

    let payload = Value::object([("reason", Value::from("nope"))]);
    let error = failure(options(), vec![Value::from("reject-data"), payload.clone()]).await;
    assert_eq!(error.data(), Some(&Value::from(vec![payload])));
}

#[tokio::test]
async fn test_library_panic_is_a_rejection() {
    let error = failure(options(), vec![Value::from("panic")]).await;
    let error = error.error_value().expect("error rejection");
    assert_eq!(error.message(), "unit panicked: unit exploded");
}

#[tokio::test]
async fn test_missing_library_is_module_not_found() {
    let invoker = create_invoker("/nonexistent/libunit.so", options());
    let error = invoker.invoke(vec![]).await.unwrap_err();
    assert!(error.is_module_not_found());
    assert_eq!(error.to_string(), "Cannot find module '/nonexistent/libunit.so'");
}
