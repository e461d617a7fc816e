// Library registration: the single host-facing operation the core
// exposes is "register host function (name, arity descriptor,
// callable)". Modules group registrations under a named table.

use crate::lua_value::{Arity, HostFn, LuaValue};
use crate::lua_vm::{LuaResult, LuaVM};

/// Functions that create a value when the module loads
pub type ValueInitializer = fn(&mut LuaVM) -> LuaValue;

pub enum LibraryEntry {
    Function(Arity, HostFn),
    Value(ValueInitializer),
}

/// A library module containing functions and values
pub struct LibraryModule {
    pub name: &'static str,
    pub entries: Vec<(&'static str, LibraryEntry)>,
}

impl LibraryModule {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Vec::new(),
        }
    }

    pub fn with_function(mut self, name: &'static str, arity: Arity, func: HostFn) -> Self {
        self.entries.push((name, LibraryEntry::Function(arity, func)));
        self
    }

    pub fn with_value(mut self, name: &'static str, value_init: ValueInitializer) -> Self {
        self.entries.push((name, LibraryEntry::Value(value_init)));
        self
    }
}

/// Builder for library modules. Entries default to fully variadic
/// arity; use `with_function` for a stricter descriptor.
#[macro_export]
macro_rules! lib_module {
    ($name:expr, {
        $($item_name:expr => $item:expr),* $(,)?
    }) => {{
        let mut module = $crate::lib_registry::LibraryModule::new($name);
        $(
            module.entries.push((
                $item_name,
                $crate::lib_registry::LibraryEntry::Function(
                    $crate::lua_value::Arity::at_least(0),
                    $item,
                ),
            ));
        )*
        module
    }};
}

/// Registry of library modules, loaded into a VM in insertion order
pub struct LibraryRegistry {
    modules: Vec<LibraryModule>,
}

impl LibraryRegistry {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
        }
    }

    pub fn register(&mut self, module: LibraryModule) {
        self.modules.push(module);
    }

    /// Load all registered modules. The pseudo-module `_G` publishes its
    /// entries directly as globals; any other module gets a table.
    pub fn load_all(&self, vm: &mut LuaVM) -> LuaResult<()> {
        for module in &self.modules {
            self.load_module(vm, module)?;
        }
        Ok(())
    }

    fn load_module(&self, vm: &mut LuaVM, module: &LibraryModule) -> LuaResult<()> {
        if module.name == "_G" {
            for (name, entry) in &module.entries {
                let value = match entry {
                    LibraryEntry::Function(arity, func) => vm.make_host_fn(name, *arity, *func),
                    LibraryEntry::Value(init) => init(vm),
                };
                vm.set_global(name, value);
            }
            return Ok(());
        }
        let table = LuaValue::new_table();
        for (name, entry) in &module.entries {
            let qualified = format!("{}.{}", module.name, name);
            let value = match entry {
                LibraryEntry::Function(arity, func) => vm.make_host_fn(&qualified, *arity, *func),
                LibraryEntry::Value(init) => init(vm),
            };
            let key = vm.create_string(name);
            if let LuaValue::Table(t) = &table {
                let _ = t.borrow_mut().set(key, value);
            }
        }
        vm.set_global(module.name, table);
        Ok(())
    }
}

impl Default for LibraryRegistry {
    fn default() -> Self {
        Self::new()
    }
}
