use serde_json::json;

use evl_core::types::EventPayload;
use evl_server::{AggregateDefinition, CommandContext, HandlerError};

/// The canonical test aggregate: `CreateUser` on a fresh stream, `Rename`
/// on an existing one.
pub fn user_aggregate() -> AggregateDefinition {
    AggregateDefinition::new("User")
        .command("CreateUser", |ctx: &CommandContext| {
            if !ctx.is_new_stream() {
                return Err(HandlerError::new("user already exists"));
            }
            Ok(vec![EventPayload::new("UserCreated", ctx.payload.clone())])
        })
        .command("Rename", |ctx: &CommandContext| {
            if ctx.is_new_stream() {
                return Err(HandlerError::new("user does not exist"));
            }
            Ok(vec![EventPayload::new("UserRenamed", ctx.payload.clone())])
        })
        .command("Touch", |_ctx: &CommandContext| Ok(vec![]))
}

/// An aggregate that appends one `Incremented` event per command, carrying
/// the resulting count.
pub fn counter_aggregate() -> AggregateDefinition {
    AggregateDefinition::new("Counter").command("Increment", |ctx: &CommandContext| {
        let count = ctx.prior.len() as u64 + 1;
        Ok(vec![EventPayload::new("Incremented", json!({ "count": count }))])
    })
}

/// An aggregate whose single command always raises a domain error.
pub fn failing_aggregate() -> AggregateDefinition {
    AggregateDefinition::new("Broken").command("AlwaysFail", |_ctx: &CommandContext| {
        Err(HandlerError::new("this command never succeeds"))
    })
}
