//! Process-wide persistent scope for `execute` requests.
//!
//! Guest code never runs under the session lock. It runs against a
//! [`SessionSnapshot`], and only the names it bound or changed are merged back,
//! so concurrent requests only conflict on names they both write.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use rhai::{AST, Dynamic, Scope};
use serde_json::Value;

use crate::value::to_json;

/// Per-call alias for the caller's context object.
pub const CONTEXT_VAR: &str = "context";
/// Per-call handle onto the callback gateway.
pub const HOST_VAR: &str = "host";
/// Fallback result slot for statement-style code.
pub const RESULT_VAR: &str = "__result__";

/// Names that are rebuilt for every call and never persisted.
pub const RESERVED_NAMES: [&str; 2] = [CONTEXT_VAR, HOST_VAR];

pub type SharedSession = Arc<Mutex<Session>>;

/// Variables and functions that survive across executions.
pub struct Session {
    globals: IndexMap<String, Dynamic>,
    functions: AST,
}

impl Session {
    pub fn new() -> Self {
        Self {
            globals: IndexMap::new(),
            functions: AST::empty(),
        }
    }

    pub fn shared() -> SharedSession {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn get(&self, name: &str) -> Option<&Dynamic> {
        self.globals.get(name)
    }

    pub fn get_json(&self, name: &str) -> Option<Value> {
        self.globals.get(name).map(to_json)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.globals.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.globals.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.globals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.globals.is_empty()
    }

    pub fn function_count(&self) -> usize {
        self.functions.iter_functions().count()
    }

    /// Accumulated function definitions.
    pub fn functions(&self) -> &AST {
        &self.functions
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            globals: self.globals.clone(),
            functions: self.functions.clone(),
        }
    }

    /// Write back every name in `scope` that is new or differs from `base`.
    ///
    /// Per-call names are skipped. Later entries shadow earlier ones with the
    /// same name. Returns how many globals were written.
    pub fn merge(&mut self, base: &SessionSnapshot, scope: &Scope) -> usize {
        let mut latest: IndexMap<&str, Dynamic> = IndexMap::new();
        for (name, _is_constant, value) in scope.iter() {
            if RESERVED_NAMES.contains(&name) || name == RESULT_VAR {
                continue;
            }
            latest.insert(name, value);
        }

        let mut written = 0;
        for (name, value) in latest {
            let unchanged = base
                .globals
                .get(name)
                .is_some_and(|old| to_json(old) == to_json(&value));
            if !unchanged {
                self.globals.insert(name.to_string(), value);
                written += 1;
            }
        }
        written
    }

    /// Keep the function definitions of a successfully run script.
    pub fn absorb_functions(&mut self, ast: &AST) {
        self.functions.combine(ast.clone_functions_only());
    }

    pub fn clear(&mut self) {
        self.globals.clear();
        self.functions = AST::empty();
    }
}

/// Copy of the session taken before running guest code.
#[derive(Clone)]
pub struct SessionSnapshot {
    globals: IndexMap<String, Dynamic>,
    functions: AST,
}

impl SessionSnapshot {
    /// A fresh scope holding a copy of every global.
    pub fn scope(&self) -> Scope<'static> {
        let mut scope = Scope::new();
        for (name, value) in &self.globals {
            scope.push_dynamic(name.clone(), value.clone());
        }
        scope
    }

    pub fn functions(&self) -> &AST {
        &self.functions
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("globals", &self.globals.keys().collect::<Vec<_>>())
            .field("functions", &self.function_count())
            .finish()
    }
}
