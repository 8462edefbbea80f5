//! Actor Table
//!
//! Explicit registration of the actors a node hosts: name → typed handler.
//! Handlers declare their parameter type; content is decoded from JSON
//! before the handler runs and the return value is encoded back to JSON.
//!
//! Blocking handlers run on worker threads and may block freely.
//! Cooperative handlers are futures polled on the tokio runtime.

use crate::context::ActorContext;
use crate::error::{ActorError, Result};
use anyhow::Context as _;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use types::names::{is_valid_actor_name, module_of};
use types::ActorMessage;

/// Shortest interval accepted for timer actors
pub const MIN_TIMER_INTERVAL: Duration = Duration::from_secs(1);

/// Which worker pool runs an actor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    Blocking,
    Cooperative,
}

pub type BlockingFn = dyn Fn(&ActorContext, &ActorMessage) -> anyhow::Result<Vec<u8>> + Send + Sync;
pub type CooperativeFn =
    dyn Fn(ActorContext, ActorMessage) -> BoxFuture<'static, anyhow::Result<Vec<u8>>> + Send + Sync;

#[derive(Clone)]
pub enum ActorHandler {
    Blocking(Arc<BlockingFn>),
    Cooperative(Arc<CooperativeFn>),
}

/// One registered actor
#[derive(Clone)]
pub struct Actor {
    pub name: String,
    pub module: String,
    pub handler: ActorHandler,
    pub timer: Option<Duration>,
    /// Declared parameter type, for logs and health
    pub param_type: &'static str,
}

impl fmt::Debug for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Actor")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("timer", &self.timer)
            .field("param_type", &self.param_type)
            .finish()
    }
}

fn decode_params<P: DeserializeOwned>(name: &str, message: &ActorMessage) -> anyhow::Result<P> {
    message.decode_content::<P>().with_context(|| {
        format!(
            "invalid content for {}, expected {}",
            name,
            std::any::type_name::<P>()
        )
    })
}

impl Actor {
    /// Actor run on the blocking worker pool
    pub fn blocking<P, R, F>(name: impl Into<String>, handler: F) -> Self
    where
        P: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(&ActorContext, P) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        let name = name.into();
        let actor_name = name.clone();
        let handler: Arc<BlockingFn> = Arc::new(move |ctx: &ActorContext, message: &ActorMessage| {
            let params = decode_params::<P>(&actor_name, message)?;
            let result = handler(ctx, params)?;
            Ok(serde_json::to_vec(&result)?)
        });
        Self::with_handler(name, ActorHandler::Blocking(handler), std::any::type_name::<P>())
    }

    /// Actor run as a future on the cooperative workers
    pub fn cooperative<P, R, F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(ActorContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let name = name.into();
        let actor_name = name.clone();
        let handler: Arc<CooperativeFn> = Arc::new(move |ctx: ActorContext, message: ActorMessage| {
            match decode_params::<P>(&actor_name, &message) {
                Ok(params) => {
                    let fut = handler(ctx, params);
                    async move {
                        let result = fut.await?;
                        Ok(serde_json::to_vec(&result)?)
                    }
                    .boxed()
                }
                Err(e) => futures::future::ready(Err(e)).boxed(),
            }
        });
        Self::with_handler(name, ActorHandler::Cooperative(handler), std::any::type_name::<P>())
    }

    fn with_handler(name: String, handler: ActorHandler, param_type: &'static str) -> Self {
        Self {
            module: module_of(&name).to_string(),
            name,
            handler,
            timer: None,
            param_type,
        }
    }

    /// Have the node send this actor a message every `interval`
    pub fn with_timer(mut self, interval: Duration) -> Self {
        self.timer = Some(interval);
        self
    }

    pub fn kind(&self) -> ActorKind {
        match self.handler {
            ActorHandler::Blocking(_) => ActorKind::Blocking,
            ActorHandler::Cooperative(_) => ActorKind::Cooperative,
        }
    }
}

/// Actors hosted by one node, keyed by name
#[derive(Debug, Clone, Default)]
pub struct ActorTable {
    actors: BTreeMap<String, Actor>,
}

impl ActorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, actor: Actor) -> Result<()> {
        if !is_valid_actor_name(&actor.name) {
            return Err(ActorError::registration(format!(
                "invalid actor name {:?}, expected module.name",
                actor.name
            )));
        }
        if self.actors.contains_key(&actor.name) {
            return Err(ActorError::registration(format!(
                "actor {} registered twice",
                actor.name
            )));
        }
        if let Some(interval) = actor.timer {
            if interval < MIN_TIMER_INTERVAL {
                return Err(ActorError::registration(format!(
                    "timer of {} is {:?}, at least {:?} required",
                    actor.name, interval, MIN_TIMER_INTERVAL
                )));
            }
        }
        debug!(actor = %actor.name, kind = ?actor.kind(), param_type = actor.param_type, "Actor registered");
        self.actors.insert(actor.name.clone(), actor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Actor> {
        self.actors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Actor> {
        self.actors.values()
    }

    pub fn modules(&self) -> BTreeSet<String> {
        self.actors.values().map(|a| a.module.clone()).collect()
    }

    /// `(name, interval)` of every timer actor
    pub fn timers(&self) -> Vec<(String, Duration)> {
        self.actors
            .values()
            .filter_map(|a| a.timer.map(|t| (a.name.clone(), t)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Echo {
        text: String,
    }

    fn echo() -> Actor {
        Actor::blocking("demo.echo", |_ctx: &ActorContext, params: Echo| Ok(params.text))
    }

    #[test]
    fn test_register_validates() {
        let mut table = ActorTable::new();
        table.register(echo()).unwrap();
        assert_eq!(table.modules(), BTreeSet::from(["demo".to_string()]));

        let err = table.register(echo()).unwrap_err();
        assert_eq!(err.category(), "registration");

        let bad_name = Actor::blocking("Demo", |_ctx: &ActorContext, _: ()| Ok(()));
        assert!(table.register(bad_name).is_err());

        let fast = Actor::cooperative("demo.tick", |_ctx: ActorContext, _: ()| async { Ok(()) })
            .with_timer(Duration::from_millis(200));
        assert!(table.register(fast).is_err());

        let slow = Actor::cooperative("demo.tick", |_ctx: ActorContext, _: ()| async { Ok(()) })
            .with_timer(Duration::from_secs(5));
        table.register(slow).unwrap();
        assert_eq!(
            table.timers(),
            vec![("demo.tick".to_string(), Duration::from_secs(5))]
        );
        assert_eq!(table.get("demo.tick").unwrap().kind(), ActorKind::Cooperative);
        assert_eq!(table.get("demo.echo").unwrap().kind(), ActorKind::Blocking);
    }
}
