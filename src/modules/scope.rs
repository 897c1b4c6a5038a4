//! Lexical scopes and the destructor obligations they carry.

use crate::compiler::value::Value;
use crate::compiler::LabelId;
use crate::types::{FunctionId, TypeId};
use std::collections::HashMap;

/// What a name resolves to inside a scope
#[derive(Debug, Clone)]
pub enum Symbol {
    /// A local or global value
    Value(Value),
    /// A type name
    Type(TypeId),
    /// An imported module alias
    Module(u32),
    /// An overload set
    Functions(Vec<FunctionId>),
}

/// What kind of region a scope represents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Module root
    Root,
    /// Function body; return statements look here
    Function {
        /// Declared return type
        return_type: TypeId,
        /// Class the function is a method of, if any
        this_type: Option<TypeId>,
    },
    /// Loop body; break/continue bind here
    Loop {
        /// Jump target for `continue`
        continue_label: LabelId,
        /// Jump target for `break`
        break_label: LabelId,
    },
    /// Switch body; break binds here
    Switch {
        /// Jump target for `break`
        break_label: LabelId,
    },
    /// `try` body; throw unwinds to its catch label
    Try,
    /// Plain block
    Block,
}

/// One lexical scope
#[derive(Debug)]
pub struct Scope {
    /// Region kind
    pub kind: ScopeKind,
    symbols: HashMap<String, Symbol>,
    /// Values whose destructors run on scope exit, in insertion order
    pub live_values: Vec<Value>,
}

impl Scope {
    fn new(kind: ScopeKind) -> Self {
        Scope {
            kind,
            symbols: HashMap::new(),
            live_values: Vec::new(),
        }
    }
}

/// The scope stack for one function-or-module compile.
#[derive(Debug)]
pub struct ScopeManager {
    stack: Vec<Scope>,
}

impl ScopeManager {
    /// Creates a manager holding only the root scope.
    pub fn new() -> Self {
        ScopeManager {
            stack: vec![Scope::new(ScopeKind::Root)],
        }
    }

    /// Enters a scope.
    pub fn push(&mut self, kind: ScopeKind) {
        self.stack.push(Scope::new(kind));
    }

    /// Leaves the innermost scope, returning it so the caller can emit
    /// destructor calls for its live values in reverse insertion order.
    pub fn pop(&mut self) -> Scope {
        debug_assert!(self.stack.len() > 1, "root scope must remain");
        self.stack.pop().unwrap_or_else(|| Scope::new(ScopeKind::Block))
    }

    /// Depth of the stack, root included.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Declares a symbol in the innermost scope. Returns false when the
    /// name already exists there.
    pub fn declare(&mut self, name: impl Into<String>, symbol: Symbol) -> bool {
        let name = name.into();
        let scope = self.stack.last_mut().expect("stack is never empty");
        if scope.symbols.contains_key(&name) {
            return false;
        }
        scope.symbols.insert(name, symbol);
        true
    }

    /// Replaces or inserts a symbol in the innermost scope.
    pub fn redeclare(&mut self, name: impl Into<String>, symbol: Symbol) {
        let scope = self.stack.last_mut().expect("stack is never empty");
        scope.symbols.insert(name.into(), symbol);
    }

    /// Records a live value for destruction at scope exit.
    pub fn track_live(&mut self, value: Value) {
        self.stack
            .last_mut()
            .expect("stack is never empty")
            .live_values
            .push(value);
    }

    /// Resolves a name, innermost scope first.
    pub fn resolve(&self, name: &str) -> Option<&Symbol> {
        self.stack.iter().rev().find_map(|s| s.symbols.get(name))
    }

    /// Resolves a name in the innermost scope only.
    pub fn resolve_local(&self, name: &str) -> Option<&Symbol> {
        self.stack.last().and_then(|s| s.symbols.get(name))
    }

    /// The innermost enclosing function scope.
    pub fn enclosing_function(&self) -> Option<(TypeId, Option<TypeId>)> {
        self.stack.iter().rev().find_map(|s| match s.kind {
            ScopeKind::Function {
                return_type,
                this_type,
            } => Some((return_type, this_type)),
            _ => None,
        })
    }

    /// The innermost enclosing class (`this` type).
    pub fn enclosing_class(&self) -> Option<TypeId> {
        self.enclosing_function().and_then(|(_, this)| this)
    }

    /// The innermost loop, for `continue`.
    pub fn innermost_loop(&self) -> Option<(LabelId, LabelId)> {
        self.stack.iter().rev().find_map(|s| match s.kind {
            ScopeKind::Loop {
                continue_label,
                break_label,
            } => Some((continue_label, break_label)),
            _ => None,
        })
    }

    /// The innermost break target (loop or switch).
    pub fn innermost_break_target(&self) -> Option<LabelId> {
        self.stack.iter().rev().find_map(|s| match s.kind {
            ScopeKind::Loop { break_label, .. } => Some(break_label),
            ScopeKind::Switch { break_label } => Some(break_label),
            _ => None,
        })
    }

    /// Live values of every scope a jump to the innermost `target_match`
    /// scope would exit, innermost first. Used by break/continue/return
    /// to emit destructors for everything they jump out of.
    pub fn live_values_through(
        &self,
        mut until: impl FnMut(&ScopeKind) -> bool,
    ) -> Vec<&Value> {
        let mut out = Vec::new();
        for scope in self.stack.iter().rev() {
            for v in scope.live_values.iter().rev() {
                out.push(v);
            }
            if until(&scope.kind) {
                break;
            }
        }
        out
    }

    /// Live values of every scope on the stack, innermost first (used by
    /// `return`).
    pub fn all_live_values(&self) -> Vec<&Value> {
        self.live_values_through(|k| matches!(k, ScopeKind::Function { .. }))
    }
}

impl Default for ScopeManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::Operand;
    use crate::source::SourceSpan;

    fn value(name: &str) -> Value {
        Value::lvalue(Operand::reg(0, 1), 1, name, SourceSpan::default())
    }

    #[test]
    fn test_resolution_inner_shadows_outer() {
        let mut scopes = ScopeManager::new();
        scopes.declare("x", Symbol::Type(1));
        scopes.push(ScopeKind::Block);
        scopes.declare("x", Symbol::Type(2));
        match scopes.resolve("x") {
            Some(Symbol::Type(2)) => {}
            other => panic!("unexpected {:?}", other),
        }
        scopes.pop();
        match scopes.resolve("x") {
            Some(Symbol::Type(1)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_in_same_scope_rejected() {
        let mut scopes = ScopeManager::new();
        assert!(scopes.declare("x", Symbol::Type(1)));
        assert!(!scopes.declare("x", Symbol::Type(2)));
    }

    #[test]
    fn test_live_values_reverse_order() {
        let mut scopes = ScopeManager::new();
        scopes.push(ScopeKind::Function {
            return_type: 0,
            this_type: None,
        });
        scopes.track_live(value("a"));
        scopes.push(ScopeKind::Block);
        scopes.track_live(value("b"));
        scopes.track_live(value("c"));

        let names: Vec<&str> = scopes
            .all_live_values()
            .iter()
            .map(|v| v.name.as_deref().unwrap())
            .collect();
        assert_eq!(names, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_break_destructor_set_stops_at_loop() {
        let mut scopes = ScopeManager::new();
        scopes.push(ScopeKind::Function {
            return_type: 0,
            this_type: None,
        });
        scopes.track_live(value("outer"));
        scopes.push(ScopeKind::Loop {
            continue_label: 0,
            break_label: 1,
        });
        scopes.track_live(value("loop_local"));
        scopes.push(ScopeKind::Block);
        scopes.track_live(value("inner"));

        let names: Vec<&str> = scopes
            .live_values_through(|k| matches!(k, ScopeKind::Loop { .. }))
            .iter()
            .map(|v| v.name.as_deref().unwrap())
            .collect();
        assert_eq!(names, vec!["inner", "loop_local"]);
    }

    #[test]
    fn test_enclosing_queries() {
        let mut scopes = ScopeManager::new();
        assert!(scopes.enclosing_function().is_none());
        scopes.push(ScopeKind::Function {
            return_type: 42,
            this_type: Some(7),
        });
        scopes.push(ScopeKind::Loop {
            continue_label: 5,
            break_label: 6,
        });
        assert_eq!(scopes.enclosing_function(), Some((42, Some(7))));
        assert_eq!(scopes.enclosing_class(), Some(7));
        assert_eq!(scopes.innermost_loop(), Some((5, 6)));
        assert_eq!(scopes.innermost_break_target(), Some(6));
    }
}
