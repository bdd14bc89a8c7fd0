//! Object registry: which server-side objects are reachable over IPC.
//!
//! Collaborators build an [`IpcObject`] with a table of commands, each with
//! a declared argument signature and a synchronous handler, and register it
//! under an [`ObjectId`]. The registry only holds a shared reference; the
//! creating subsystem keeps ownership and may unregister at any time.
//!
//! One registry is created by the daemon and shared by every server.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use super::error::{CommandError, IpcError, Result};
use super::ids::{command, ObjectId, COMMAND_END, MAX_ARGS, OBJECT_END};
use super::value::{TypedValue, ValueType};

/// Synchronous command handler.
pub type Handler =
    Arc<dyn Fn(&CommandArgs) -> std::result::Result<TypedValue, CommandError> + Send + Sync>;

/// Decoded arguments handed to a handler.
///
/// Always `MAX_ARGS` slots; slots beyond the command's signature hold
/// `TypedValue::None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandArgs {
    values: [TypedValue; MAX_ARGS],
}

impl CommandArgs {
    /// Build from decoded values. Extra values beyond `MAX_ARGS` are dropped.
    pub fn new(values: impl IntoIterator<Item = TypedValue>) -> Self {
        let mut args = Self::default();
        for (slot, value) in args.values.iter_mut().zip(values) {
            *slot = value;
        }
        args
    }

    /// Raw value in slot `index` (`None` when out of range).
    pub fn get(&self, index: usize) -> &TypedValue {
        static NONE: TypedValue = TypedValue::None;
        self.values.get(index).unwrap_or(&NONE)
    }

    /// `UInt32` in slot `index`.
    pub fn u32(&self, index: usize) -> std::result::Result<u32, CommandError> {
        self.get(index)
            .as_u32()
            .ok_or_else(|| type_error(index, "uint32"))
    }

    /// `Int32` in slot `index`.
    pub fn i32(&self, index: usize) -> std::result::Result<i32, CommandError> {
        self.get(index)
            .as_i32()
            .ok_or_else(|| type_error(index, "int32"))
    }

    /// `String` in slot `index`.
    pub fn str(&self, index: usize) -> std::result::Result<&str, CommandError> {
        self.get(index)
            .as_str()
            .ok_or_else(|| type_error(index, "string"))
    }

    /// `Binary` in slot `index`.
    pub fn binary(&self, index: usize) -> std::result::Result<&[u8], CommandError> {
        self.get(index)
            .as_binary()
            .ok_or_else(|| type_error(index, "binary"))
    }

    /// `List` in slot `index`.
    pub fn list(&self, index: usize) -> std::result::Result<&[TypedValue], CommandError> {
        self.get(index)
            .as_list()
            .ok_or_else(|| type_error(index, "list"))
    }

    /// `Dict` in slot `index`.
    pub fn dict(
        &self,
        index: usize,
    ) -> std::result::Result<&BTreeMap<String, TypedValue>, CommandError> {
        self.get(index)
            .as_dict()
            .ok_or_else(|| type_error(index, "dict"))
    }
}

fn type_error(index: usize, expected: &str) -> CommandError {
    CommandError::new(format!("argument {index} is not a {expected}"))
}

/// One remotely callable command.
#[derive(Clone)]
pub struct Command {
    signature: Vec<ValueType>,
    handler: Handler,
}

impl Command {
    /// Declared argument types, in order.
    pub fn signature(&self) -> &[ValueType] {
        &self.signature
    }

    /// Run the handler.
    pub fn call(&self, args: &CommandArgs) -> std::result::Result<TypedValue, CommandError> {
        (self.handler)(args)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

/// A named, independently addressable object exposing a command table.
#[derive(Debug)]
pub struct IpcObject {
    name: String,
    commands: BTreeMap<u32, Command>,
}

impl IpcObject {
    /// Start building an object.
    pub fn builder(name: impl Into<String>) -> IpcObjectBuilder {
        IpcObjectBuilder {
            name: name.into(),
            commands: BTreeMap::new(),
            error: None,
        }
    }

    /// Object name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a command.
    pub fn command(&self, command_id: u32) -> Option<&Command> {
        self.commands.get(&command_id)
    }

    /// Ids of every command in the table.
    pub fn command_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.commands.keys().copied()
    }
}

/// Builder for [`IpcObject`]; validation errors surface from [`build`](Self::build).
pub struct IpcObjectBuilder {
    name: String,
    commands: BTreeMap<u32, Command>,
    error: Option<IpcError>,
}

impl fmt::Debug for IpcObjectBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcObjectBuilder")
            .field("name", &self.name)
            .field("commands", &self.commands.len())
            .finish_non_exhaustive()
    }
}

impl IpcObjectBuilder {
    /// Add a command with its argument signature and handler.
    ///
    /// The signature may hold at most `MAX_ARGS` types and must not contain
    /// `ValueType::None`; `command_id` must be above the reserved
    /// REPLY/ERROR ids, below `COMMAND_END` and unique within the object.
    pub fn command<F>(mut self, command_id: u32, signature: &[ValueType], handler: F) -> Self
    where
        F: Fn(&CommandArgs) -> std::result::Result<TypedValue, CommandError>
            + Send
            + Sync
            + 'static,
    {
        if self.error.is_some() {
            return self;
        }
        let problem = if command_id <= command::ERROR {
            Some(format!("command id {command_id} is reserved for replies"))
        } else if command_id >= COMMAND_END {
            Some(format!("command id {command_id} >= {COMMAND_END}"))
        } else if signature.len() > MAX_ARGS {
            Some(format!(
                "command {command_id} declares {} arguments (max {MAX_ARGS})",
                signature.len()
            ))
        } else if signature.contains(&ValueType::None) {
            Some(format!("command {command_id} declares a None argument"))
        } else if self.commands.contains_key(&command_id) {
            Some(format!("command {command_id} defined twice"))
        } else {
            None
        };

        match problem {
            Some(msg) => self.error = Some(IpcError::InvalidCommand(format!("{}: {msg}", self.name))),
            None => {
                self.commands.insert(
                    command_id,
                    Command {
                        signature: signature.to_vec(),
                        handler: Arc::new(handler),
                    },
                );
            }
        }
        self
    }

    /// Finish building.
    pub fn build(self) -> Result<IpcObject> {
        if let Some(err) = self.error {
            return Err(err);
        }
        Ok(IpcObject {
            name: self.name,
            commands: self.commands,
        })
    }
}

/// Table of registered objects, indexed by object id.
#[derive(Debug)]
pub struct ObjectRegistry {
    objects: RwLock<Vec<Option<Arc<IpcObject>>>>,
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(vec![None; OBJECT_END as usize]),
        }
    }

    /// Expose `object` under `id`.
    ///
    /// Registering over an occupied slot replaces the previous object (a
    /// caller bug, logged as a warning).
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::ReservedObject`] for the control object id.
    pub fn register(&self, id: ObjectId, object: Arc<IpcObject>) -> Result<()> {
        if id == ObjectId::Signal {
            return Err(IpcError::ReservedObject(id.as_u32()));
        }
        let mut objects = self.objects.write().expect("object registry lock poisoned");
        if let Some(previous) = objects[id.index()].replace(Arc::clone(&object)) {
            log::warn!(
                "[Ipc] Object {id} re-registered ('{}' replaced by '{}')",
                previous.name(),
                object.name()
            );
        } else {
            log::debug!("[Ipc] Registered object {id} as '{}'", object.name());
        }
        Ok(())
    }

    /// Remove whatever is registered under `id`.
    pub fn unregister(&self, id: ObjectId) -> Option<Arc<IpcObject>> {
        let mut objects = self.objects.write().expect("object registry lock poisoned");
        let removed = objects[id.index()].take();
        if removed.is_some() {
            log::debug!("[Ipc] Unregistered object {id}");
        }
        removed
    }

    /// Resolve a raw object id from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::UnknownObject`] if the id is out of range or
    /// nothing is registered there.
    pub fn lookup(&self, raw_id: u32) -> Result<Arc<IpcObject>> {
        let id = ObjectId::try_from(raw_id).map_err(IpcError::UnknownObject)?;
        let objects = self.objects.read().expect("object registry lock poisoned");
        objects[id.index()]
            .clone()
            .ok_or(IpcError::UnknownObject(raw_id))
    }

    /// `true` if an object is registered under `id`.
    pub fn is_registered(&self, id: ObjectId) -> bool {
        let objects = self.objects.read().expect("object registry lock poisoned");
        objects[id.index()].is_some()
    }
}
