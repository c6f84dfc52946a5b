//! Explicitly registered command tree.
//!
//! Commands are registered by fully qualified dotted name through a
//! [`CommandTreeBuilder`]. Nested namespaces are built with
//! [`CommandTreeBuilder::namespace`], which prefixes every command registered
//! inside it. Names starting with `_` are private and rejected.
//!
//! ```ignore
//! let tree = CommandTree::builder()
//!     .namespace("stage", |stage| {
//!         stage.command("get_x", "Current x position.", ParamSpec::new(), |_| Ok(json!(12.5)));
//!     })
//!     .build()?;
//! assert!(tree.lookup("stage.get_x").is_some());
//! ```

use crate::error::{AppResult, ScopeError};
use crate::messaging::InterruptFlag;
use crate::rpc::describe::{BoundArgs, CommandDescriptor, ParamSpec};
use crate::rpc::DESCRIBE;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

type Handler = Arc<dyn Fn(&CallContext) -> anyhow::Result<Value> + Send + Sync>;

/// What a handler sees of the call it is serving.
pub struct CallContext {
    args: BoundArgs,
    interrupt: InterruptFlag,
}

impl CallContext {
    /// Context for one call.
    pub fn new(args: BoundArgs, interrupt: InterruptFlag) -> Self {
        Self { args, interrupt }
    }

    /// Deserialize a bound parameter.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> AppResult<T> {
        self.args.get(name)
    }

    /// Arguments bound against the command's parameters.
    pub fn args(&self) -> &BoundArgs {
        &self.args
    }

    /// Whether a client has asked to interrupt this call.
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_set()
    }

    /// The flag raised by an interrupt, for handing to blocking waits.
    pub fn interrupt(&self) -> &InterruptFlag {
        &self.interrupt
    }

    /// Bail out with [`ScopeError::Interrupted`] if an interrupt arrived.
    /// Long-running handlers call this between steps.
    pub fn check_interrupted(&self) -> AppResult<()> {
        if self.is_interrupted() {
            Err(ScopeError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// A registered command.
pub struct Command {
    descriptor: CommandDescriptor,
    handler: Handler,
}

impl Command {
    /// Name, docstring and parameters.
    pub fn descriptor(&self) -> &CommandDescriptor {
        &self.descriptor
    }

    /// Parameter layout.
    pub fn params(&self) -> &ParamSpec {
        &self.descriptor.params
    }

    /// Runs the handler.
    pub fn call(&self, context: &CallContext) -> anyhow::Result<Value> {
        (self.handler)(context)
    }
}

/// Immutable set of commands served by an [`RpcServer`](crate::rpc::RpcServer).
#[derive(Default)]
pub struct CommandTree {
    commands: BTreeMap<String, Command>,
}

impl std::fmt::Debug for CommandTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.commands.keys()).finish()
    }
}

impl CommandTree {
    /// Starts an empty builder.
    pub fn builder() -> CommandTreeBuilder {
        CommandTreeBuilder::default()
    }

    /// Command registered under `name`.
    pub fn lookup(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    /// Every command, ordered by name.
    pub fn descriptors(&self) -> Vec<CommandDescriptor> {
        self.commands
            .values()
            .map(|command| command.descriptor.clone())
            .collect()
    }

    /// Command names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    /// Number of commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether the tree has no commands.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Collects commands; errors are reported together by [`build`](Self::build).
#[derive(Default)]
pub struct CommandTreeBuilder {
    prefix: String,
    commands: BTreeMap<String, Command>,
    errors: Vec<String>,
}

impl CommandTreeBuilder {
    /// Register a command returning a JSON value.
    pub fn command<F>(&mut self, name: &str, doc: &str, params: ParamSpec, handler: F) -> &mut Self
    where
        F: Fn(&CallContext) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.insert(name, doc, params, Arc::new(handler));
        self
    }

    /// Register a command returning any serializable type.
    ///
    /// A return value that fails to serialize becomes a
    /// [`ScopeError::Serialization`], reported to the client as such.
    pub fn typed_command<F, T>(&mut self, name: &str, doc: &str, params: ParamSpec, handler: F) -> &mut Self
    where
        F: Fn(&CallContext) -> anyhow::Result<T> + Send + Sync + 'static,
        T: Serialize,
    {
        let wrapped = move |context: &CallContext| -> anyhow::Result<Value> {
            let retval = handler(context)?;
            serde_json::to_value(retval).map_err(|e| anyhow::Error::new(ScopeError::Serialization(e)))
        };
        self.insert(name, doc, params, Arc::new(wrapped));
        self
    }

    /// Register commands under `name.`.
    pub fn namespace<F>(&mut self, name: &str, build: F) -> &mut Self
    where
        F: FnOnce(&mut CommandTreeBuilder),
    {
        if let Err(e) = validate_segment(name) {
            self.errors.push(e);
            return self;
        }
        let mut child = CommandTreeBuilder {
            prefix: self.qualify(name),
            ..CommandTreeBuilder::default()
        };
        build(&mut child);
        self.errors.append(&mut child.errors);
        for (name, command) in child.commands {
            if self.commands.contains_key(&name) {
                self.errors.push(format!("command '{name}' registered twice"));
            } else {
                self.commands.insert(name, command);
            }
        }
        self
    }

    /// Finishes the tree, reporting every invalid or duplicate registration.
    pub fn build(&mut self) -> AppResult<CommandTree> {
        if !self.errors.is_empty() {
            return Err(ScopeError::Configuration(format!(
                "invalid command tree: {}",
                self.errors.join("; ")
            )));
        }
        Ok(CommandTree {
            commands: std::mem::take(&mut self.commands),
        })
    }

    fn qualify(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.prefix, name)
        }
    }

    fn insert(&mut self, name: &str, doc: &str, params: ParamSpec, handler: Handler) {
        if let Err(e) = validate_segment(name) {
            self.errors.push(e);
            return;
        }
        let qualified = self.qualify(name);
        if let Err(e) = params.check() {
            self.errors.push(format!("command '{qualified}': {e}"));
            return;
        }
        if self.commands.contains_key(&qualified) {
            self.errors
                .push(format!("command '{qualified}' registered twice"));
            return;
        }
        let descriptor = CommandDescriptor {
            name: qualified.clone(),
            doc: doc.to_string(),
            params,
        };
        self.commands
            .insert(qualified, Command { descriptor, handler });
    }
}

fn validate_segment(name: &str) -> Result<(), String> {
    if name.is_empty() || name.contains('.') {
        return Err(format!("'{name}' is not a valid name segment"));
    }
    if name.starts_with('_') || name == DESCRIBE {
        return Err(format!("'{name}' is private"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_names_are_qualified() {
        let tree = CommandTree::builder()
            .command("ping", "", ParamSpec::new(), |_| Ok(json!("pong")))
            .namespace("scope", |scope| {
                scope.namespace("stage", |stage| {
                    stage.command("get_x", "Current x.", ParamSpec::new(), |_| Ok(json!(1.5)));
                });
            })
            .build()
            .unwrap();
        let names: Vec<_> = tree.names().collect();
        assert_eq!(names, vec!["ping", "scope.stage.get_x"]);
        let command = tree.lookup("scope.stage.get_x").unwrap();
        assert_eq!(command.descriptor().doc, "Current x.");
    }

    #[test]
    fn test_invalid_registrations_reported_together() {
        let err = CommandTree::builder()
            .command("_hidden", "", ParamSpec::new(), |_| Ok(Value::Null))
            .command("dup", "", ParamSpec::new(), |_| Ok(Value::Null))
            .command("dup", "", ParamSpec::new(), |_| Ok(Value::Null))
            .command(
                "bad",
                "",
                ParamSpec::new().arg_default("a", json!(1)).arg("b"),
                |_| Ok(Value::Null),
            )
            .build()
            .unwrap_err()
            .to_string();
        assert!(err.contains("'_hidden' is private"));
        assert!(err.contains("'dup' registered twice"));
        assert!(err.contains("command 'bad'"));
    }

    #[test]
    fn test_typed_command_serializes() {
        let tree = CommandTree::builder()
            .typed_command("pair", "", ParamSpec::new(), |_| Ok((1, "two")))
            .build()
            .unwrap();
        let context = CallContext::new(BoundArgs::default(), InterruptFlag::default());
        let value = tree.lookup("pair").unwrap().call(&context).unwrap();
        assert_eq!(value, json!([1, "two"]));
    }

    #[test]
    fn test_context_interrupt() {
        let flag = InterruptFlag::default();
        let context = CallContext::new(BoundArgs::default(), flag.clone());
        assert!(context.check_interrupted().is_ok());
        flag.set();
        assert!(matches!(
            context.check_interrupted(),
            Err(ScopeError::Interrupted)
        ));
    }
}
