//! Demonstration helper used by the sample manifest and the integration
//! tests. Runs with whatever rights the broker spawned it with.

use anyhow::Result;
use elevate_contracts::{ActionReply, ArgumentMap};
use elevate_helper::{HelperContext, HelperRuntime, handler_fn};
use serde_json::Value;
use std::time::Duration;

const HELPER_ID: &str = "org.elevate.demo";

/// Helper-defined error codes, reported with helper origin.
const ERR_MISSING_ARGUMENT: i32 = 10;
const ERR_IO: i32 = 11;

fn string_arg<'a>(arguments: &'a ArgumentMap, key: &str) -> Option<&'a str> {
    arguments.get(key).and_then(Value::as_str)
}

async fn read_file(_ctx: HelperContext, arguments: ArgumentMap) -> ActionReply {
    let Some(path) = string_arg(&arguments, "path") else {
        return ActionReply::helper_error(ERR_MISSING_ARGUMENT).with_description("missing 'path'");
    };
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => ActionReply::success().with_data("contents", contents),
        Err(err) => ActionReply::helper_error(ERR_IO).with_description(err.to_string()),
    }
}

async fn write_file(ctx: HelperContext, arguments: ArgumentMap) -> ActionReply {
    let (Some(path), Some(contents)) = (
        string_arg(&arguments, "path"),
        string_arg(&arguments, "contents"),
    ) else {
        return ActionReply::helper_error(ERR_MISSING_ARGUMENT)
            .with_description("'path' and 'contents' are required");
    };
    ctx.progress_step(0);
    if let Err(err) = tokio::fs::write(path, contents).await {
        return ActionReply::helper_error(ERR_IO).with_description(err.to_string());
    }
    ctx.progress_step(100);
    ActionReply::success()
        .with_data("bytes", contents.len() as u64)
        .with_data("written_for", ctx.caller_uid().map(Value::from).unwrap_or(Value::Null))
}

async fn count(ctx: HelperContext, arguments: ArgumentMap) -> ActionReply {
    let steps = arguments.get("steps").and_then(Value::as_u64).unwrap_or(10);
    let delay = arguments.get("delay_ms").and_then(Value::as_u64).unwrap_or(100);

    for step in 1..=steps {
        tokio::select! {
            _ = ctx.stopped() => {
                return ActionReply::user_cancelled().with_data("reached", step - 1);
            }
            _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
        }
        let mut data = ArgumentMap::new();
        data.insert("step".to_string(), Value::from(step));
        ctx.progress_data(data);
        ctx.progress_step((step * 100 / steps.max(1)) as u32);
    }
    ActionReply::success().with_data("reached", steps)
}

#[tokio::main]
async fn main() -> Result<()> {
    let runtime = HelperRuntime::builder(HELPER_ID)
        .action("org.elevate.demo.read", handler_fn(read_file))
        .action("org.elevate.demo.write", handler_fn(write_file))
        .action("org.elevate.demo.count", handler_fn(count))
        .max_concurrent(4)
        .build();
    elevate_helper::helper_main(runtime).await?;
    Ok(())
}
