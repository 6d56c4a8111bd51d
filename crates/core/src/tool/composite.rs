use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value};
use toolchat_model::ToolDescriptor;

use super::{Error, ToolOutcome, ToolRegistry};

struct Member {
    prefix: Option<String>,
    registry: Arc<dyn ToolRegistry>,
}

#[derive(Clone)]
struct Route {
    member: usize,
    name: String,
}

/// Merges several registries into one.
///
/// A registry can be mounted under a prefix, in which case its tools are
/// exposed as `{prefix}_{name}`. Calls are routed with the table built by
/// the latest [`list_tools`](ToolRegistry::list_tools), so tools must be
/// listed before they can be invoked. When two members expose the same
/// name, the one added first wins.
#[derive(Default)]
pub struct CompositeRegistry {
    members: Vec<Member>,
    routes: RwLock<HashMap<String, Route>>,
}

impl CompositeRegistry {
    /// Creates an empty composite.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a registry whose tools keep their names.
    pub fn add<R: ToolRegistry + 'static>(&mut self, registry: R) {
        self.members.push(Member {
            prefix: None,
            registry: Arc::new(registry),
        });
    }

    /// Adds a registry whose tools are exposed as `{prefix}_{name}`.
    pub fn mount<S: Into<String>, R: ToolRegistry + 'static>(
        &mut self,
        prefix: S,
        registry: R,
    ) {
        self.members.push(Member {
            prefix: Some(prefix.into()),
            registry: Arc::new(registry),
        });
    }

    /// Adds an already shared registry, optionally under a prefix.
    pub fn add_shared(
        &mut self,
        prefix: Option<String>,
        registry: Arc<dyn ToolRegistry>,
    ) {
        self.members.push(Member { prefix, registry });
    }

    /// Returns the number of member registries.
    #[inline]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns `true` if there are no members.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[async_trait]
impl ToolRegistry for CompositeRegistry {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, Error> {
        let mut routes = HashMap::new();
        let mut descriptors = vec![];
        for (idx, member) in self.members.iter().enumerate() {
            let tools = member.registry.list_tools().await?;
            for mut tool in tools {
                let exposed = match &member.prefix {
                    Some(prefix) => format!("{prefix}_{}", tool.name),
                    None => tool.name.clone(),
                };
                if routes.contains_key(&exposed) {
                    warn!("duplicated tool `{exposed}`, keeping the first one");
                    continue;
                }
                routes.insert(
                    exposed.clone(),
                    Route {
                        member: idx,
                        name: std::mem::replace(&mut tool.name, exposed),
                    },
                );
                descriptors.push(tool);
            }
        }
        debug!("routing {} tools across {} registries", routes.len(), self.members.len());

        let mut table = self.routes.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *table = routes;
        Ok(descriptors)
    }

    async fn invoke(&self, name: &str, arguments: Map<String, Value>) -> ToolOutcome {
        let route = {
            let table = self.routes.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            table.get(name).cloned()
        };
        let Some(route) = route else {
            warn!("no route for tool: {name}");
            return Err(Error::not_found(name));
        };
        let member = &self.members[route.member];
        member.registry.invoke(&route.name, arguments).await
    }
}

impl Debug for CompositeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefixes: Vec<_> = self.members.iter().map(|m| m.prefix.as_deref()).collect();
        f.debug_struct("CompositeRegistry")
            .field("members", &prefixes)
            .finish_non_exhaustive()
    }
}
