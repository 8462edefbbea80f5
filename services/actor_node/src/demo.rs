//! Demo actors served with `--demo`, handy for poking a node by hand

use messaging_actors::{Actor, ActorContext};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct Greet {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Line {
    pub text: String,
}

pub fn actors() -> Vec<Actor> {
    vec![
        Actor::blocking("demo.echo", |_ctx: &ActorContext, text: String| Ok(text)),
        Actor::blocking("demo.log", |ctx: &ActorContext, line: Line| {
            info!(src = %ctx.message().src, src_node = %ctx.message().src_node, "{}", line.text);
            Ok(())
        }),
        Actor::cooperative("demo.greet", |ctx: ActorContext, greet: Greet| async move {
            let text: String = ctx.ask("demo.echo", &format!("hello {}", greet.name)).await?;
            ctx.tell("demo.log", &Line { text: text.clone() })?;
            Ok(text)
        }),
    ]
}
