//! Module environments.
//!
//! Each activation owns one [`ModuleEnv`]: the macros visible to it, the
//! library it inherited from its callers, and the export sections it is
//! building up.  A child environment starts as a *copy* of the parent's
//! visible names; nothing is shared, so a macro rebinding a name never
//! reaches back into its caller except through the explicit export merge.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::macros::Macro;
use super::value::Value;

/// Module that macro activations export into by default.
pub const DEFAULT_EXPORT_MODULE: &str = "exports";

/// One exported name.
#[derive(Debug, Clone)]
pub enum ModuleItem {
    Macro(Arc<Macro>),
    Value(Value),
}

/// Name → item within one module.
pub type ModuleSection = BTreeMap<String, ModuleItem>;

/// Module name → section.
pub type Library = BTreeMap<String, ModuleSection>;

#[derive(Debug, Clone, Default)]
pub struct ModuleEnv {
    /// Target of `export`.  Empty at the root, where exporting is an error.
    pub default_name: String,
    /// Macros defined in (or copied into) this activation.
    pub macros: HashMap<String, Arc<Macro>>,
    /// Names made available by callers and by merged exports.
    pub inherited: Library,
    /// What this activation has exported so far.
    pub exports: Library,
}

impl ModuleEnv {
    /// Environment for a new activation started from this one.
    pub fn child(&self) -> Self {
        Self {
            default_name: String::new(),
            macros: self.macros.clone(),
            inherited: self.inherited.clone(),
            exports: Library::new(),
        }
    }

    /// Put `item` into the default export module.  Fails at the root.
    pub fn export(&mut self, name: &str, item: ModuleItem) -> bool {
        if self.default_name.is_empty() {
            return false;
        }
        self.exports
            .entry(self.default_name.clone())
            .or_default()
            .insert(name.to_owned(), item);
        true
    }

    /// Copy of one export section.
    pub fn export_section(&self, module: &str) -> ModuleSection {
        self.exports.get(module).cloned().unwrap_or_default()
    }

    /// Merge `entries` into the inherited library under `module`; later
    /// entries overwrite earlier ones.
    pub fn inherit(&mut self, module: &str, entries: &ModuleSection) {
        let section = self.inherited.entry(module.to_owned()).or_default();
        for (name, item) in entries {
            section.insert(name.clone(), item.clone());
        }
    }

    /// Re-export merged entries into this activation's own export section.
    pub fn reexport(&mut self, module: &str, entries: &ModuleSection) {
        let section = self.exports.entry(module.to_owned()).or_default();
        for (name, item) in entries {
            section.insert(name.clone(), item.clone());
        }
    }

    /// Resolve a macro name: local definitions first, then the inherited
    /// library with the default export module ahead of the others.
    pub fn lookup_macro(&self, name: &str) -> Option<Arc<Macro>> {
        if let Some(m) = self.macros.get(name) {
            return Some(Arc::clone(m));
        }
        let preferred = self.inherited.get(DEFAULT_EXPORT_MODULE).into_iter();
        let others = self
            .inherited
            .iter()
            .filter(|(module, _)| module.as_str() != DEFAULT_EXPORT_MODULE)
            .map(|(_, section)| section);
        preferred.chain(others).find_map(|section| match section.get(name) {
            Some(ModuleItem::Macro(m)) => Some(Arc::clone(m)),
            _ => None,
        })
    }

    /// An inherited item by module and name.
    pub fn inherited_item(&self, module: &str, name: &str) -> Option<&ModuleItem> {
        self.inherited.get(module)?.get(name)
    }
}
