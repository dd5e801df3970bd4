//! Tasks every server registers.

use robe_shared::TaskError;
use serde_json::Value;

use super::{TaskContext, TaskRegistry};

pub fn register_builtin_tasks(registry: &TaskRegistry) {
    registry.register("ping", false, |_| Ok::<_, TaskError>("pong"));

    registry.register("echo", false, |ctx: TaskContext| {
        Ok::<_, TaskError>(Value::Object(ctx.args))
    });

    registry.register("whoami", true, |ctx: TaskContext| {
        ctx.user_id
            .ok_or_else(|| TaskError::unauthorized("no verified user"))
    });
}
