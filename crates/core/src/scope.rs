//! Dynamic scope frames.
//!
//! Scopes form the call stack: a linked chain of frames, each with its own
//! shadow map, exception-handler stack, and optional return position. The
//! machine owns the innermost frame by value; entering a scope boxes the
//! previous frame as the parent.

use std::collections::HashMap;
use std::fmt;

use crate::references::{FunctionCall, FunctionReference, LocationReference};

/// How an exception handler decides whether it matches a raised code.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerSelector {
    /// Matches every raised code.
    Universal,
    /// Matches a single code exactly.
    Code(f64),
    /// Matches when the discriminator function returns `true` for the code.
    Discriminator(FunctionReference),
}

/// A pushed exception handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionHandler {
    pub id: String,
    pub selector: HandlerSelector,
    pub handler: FunctionReference,
}

/// One frame of the dynamic scope chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeFrame {
    id: String,
    parent: Option<Box<ScopeFrame>>,
    shadows: HashMap<String, LocationReference>,
    call: Option<FunctionCall>,
    handlers: Vec<ExceptionHandler>,
    return_pc: Option<usize>,
    is_exception_frame: bool,
    capture_return: bool,
}

impl ScopeFrame {
    /// The root scope of a program; it has no parent.
    pub fn root(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent: None,
            shadows: HashMap::new(),
            call: None,
            handlers: Vec::new(),
            return_pc: None,
            is_exception_frame: false,
            capture_return: false,
        }
    }

    /// Enter a plain child scope, consuming this frame as the parent.
    pub fn child(self, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent: Some(Box::new(self)),
            shadows: HashMap::new(),
            call: None,
            handlers: Vec::new(),
            return_pc: None,
            is_exception_frame: false,
            capture_return: false,
        }
    }

    /// Enter a call scope, recording the call being performed.
    pub fn child_for_call(self, id: impl Into<String>, call: FunctionCall) -> Self {
        let mut frame = self.child(id);
        frame.call = Some(call);
        frame
    }

    /// Pop this frame, returning the parent (or `None` at the root).
    pub fn exit(self) -> Option<ScopeFrame> {
        self.parent.map(|p| *p)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent(&self) -> Option<&ScopeFrame> {
        self.parent.as_deref()
    }

    /// The nearest call on the stack, walking parent links.
    pub fn call(&self) -> Option<&FunctionCall> {
        match &self.call {
            Some(call) => Some(call),
            None => self.parent.as_ref().and_then(|p| p.call()),
        }
    }

    /// Mutable access to the nearest call on the stack.
    pub fn call_mut(&mut self) -> Option<&mut FunctionCall> {
        if self.call.is_some() {
            return self.call.as_mut();
        }
        self.parent.as_mut().and_then(|p| p.call_mut())
    }

    /// The call entered for exactly this frame, if any.
    pub fn own_call(&self) -> Option<&FunctionCall> {
        self.call.as_ref()
    }

    /// Shadow a location in this frame: lookups of the nominal name resolve
    /// to a frame-unique backing location without touching the parent's
    /// binding.
    pub fn shadow(&mut self, location: &LocationReference) {
        let backing = location.renamed(format!("{}@{}", location.name(), self.id));
        self.shadows.insert(location.fq_name(), backing);
    }

    /// Resolve a nominal location to its dynamically-scoped backing
    /// location. Walks parent links; unshadowed locations resolve to
    /// themselves.
    pub fn resolve(&self, location: &LocationReference) -> LocationReference {
        let key = location.fq_name();
        let mut frame = Some(self);
        while let Some(f) = frame {
            if let Some(backing) = f.shadows.get(&key) {
                return backing.clone();
            }
            frame = f.parent.as_deref();
        }
        location.clone()
    }

    /// True if this frame (not an ancestor) shadows the location.
    pub fn shadows_locally(&self, location: &LocationReference) -> bool {
        self.shadows.contains_key(&location.fq_name())
    }

    pub fn shadowed_locations(&self) -> impl Iterator<Item = &LocationReference> {
        self.shadows.values()
    }

    /// The shadow table as (nominal fq-name, backing location) pairs.
    pub fn shadow_entries(&self) -> impl Iterator<Item = (&String, &LocationReference)> {
        self.shadows.iter()
    }

    /// Restore a shadow entry verbatim (used when rebuilding a frame from
    /// its serialized form).
    pub fn restore_shadow(&mut self, key: impl Into<String>, backing: LocationReference) {
        self.shadows.insert(key.into(), backing);
    }

    /// Record the call this frame was entered for.
    pub fn set_own_call(&mut self, call: FunctionCall) {
        self.call = Some(call);
    }

    /// Attach a rebuilt parent chain beneath this frame.
    pub fn attach_parent(&mut self, parent: ScopeFrame) {
        self.parent = Some(Box::new(parent));
    }

    // --- exception handlers ---

    /// Push a handler onto this frame's stack; the caller supplies a unique
    /// id used for later removal.
    pub fn push_handler(
        &mut self,
        id: impl Into<String>,
        selector: HandlerSelector,
        handler: FunctionReference,
    ) -> String {
        let id = id.into();
        self.handlers.push(ExceptionHandler {
            id: id.clone(),
            selector,
            handler,
        });
        id
    }

    /// Remove a handler by id, searching the whole chain.
    pub fn pop_handler(&mut self, id: &str) -> bool {
        if let Some(pos) = self.handlers.iter().position(|h| h.id == id) {
            self.handlers.remove(pos);
            return true;
        }
        match self.parent.as_mut() {
            Some(parent) => parent.pop_handler(id),
            None => false,
        }
    }

    /// This frame's handlers, most recently pushed first.
    pub fn handlers(&self) -> impl Iterator<Item = &ExceptionHandler> {
        self.handlers.iter().rev()
    }

    pub fn set_handlers(&mut self, handlers: Vec<ExceptionHandler>) {
        self.handlers = handlers;
    }

    pub fn handlers_in_push_order(&self) -> &[ExceptionHandler] {
        &self.handlers
    }

    // --- return bookkeeping ---

    pub fn set_return_pc(&mut self, pc: usize) {
        self.return_pc = Some(pc);
    }

    pub fn return_pc(&self) -> Option<usize> {
        self.return_pc
    }

    pub fn clear_return_pc(&mut self) {
        self.return_pc = None;
    }

    /// Find the innermost frame holding a return position, clear it, and
    /// return the position. Fails with `None` if the call stack is empty.
    pub fn take_return_pc(&mut self) -> Option<usize> {
        if let Some(pc) = self.return_pc.take() {
            return Some(pc);
        }
        self.parent.as_mut().and_then(|p| p.take_return_pc())
    }

    /// True if any frame in the chain still records a return position.
    pub fn has_return_pc(&self) -> bool {
        self.return_pc.is_some() || self.parent.as_ref().is_some_and(|p| p.has_return_pc())
    }

    pub fn set_is_exception_frame(&mut self, value: bool) {
        self.is_exception_frame = value;
    }

    pub fn is_exception_frame(&self) -> bool {
        self.is_exception_frame
    }

    pub fn set_capture_return(&mut self, value: bool) {
        self.capture_return = value;
    }

    pub fn capture_return(&self) -> bool {
        self.capture_return
    }

    /// Depth of this chain, root inclusive.
    pub fn depth(&self) -> usize {
        1 + self.parent.as_ref().map_or(0, |p| p.depth())
    }
}

impl fmt::Display for ScopeFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ScopeFrame<id: {}, depth: {}, #shadows: {}>",
            self.id,
            self.depth(),
            self.shadows.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::references::{Affinity, FunctionBackend};
    use crate::types::Type;

    fn loc(name: &str) -> LocationReference {
        LocationReference::new(Affinity::Local, name)
    }

    fn handler_fn() -> FunctionReference {
        FunctionReference::new(FunctionBackend::Inline, "h", vec![Type::Number], Type::Void)
    }

    #[test]
    fn shadowing_does_not_touch_parent_binding() {
        let mut root = ScopeFrame::root("root");
        root.shadow(&loc("x"));
        let root_backing = root.resolve(&loc("x"));

        let mut child = root.child("child");
        child.shadow(&loc("x"));
        let child_backing = child.resolve(&loc("x"));
        assert_ne!(root_backing.name(), child_backing.name());

        let root = child.exit().expect("parent");
        assert_eq!(root.resolve(&loc("x")).name(), root_backing.name());
    }

    #[test]
    fn resolution_walks_to_innermost_ancestor() {
        let mut root = ScopeFrame::root("root");
        root.shadow(&loc("x"));
        let expected = root.resolve(&loc("x"));

        let grandchild = root.child("a").child("b");
        assert_eq!(grandchild.resolve(&loc("x")).name(), expected.name());
        // Unshadowed names resolve to themselves.
        assert_eq!(grandchild.resolve(&loc("y")).name(), "y");
    }

    #[test]
    fn take_return_pc_finds_innermost() {
        let mut root = ScopeFrame::root("root");
        root.set_return_pc(10);
        let mut child = root.child("call");
        child.set_return_pc(20);
        let mut inner = child.child("plain");

        assert_eq!(inner.take_return_pc(), Some(20));
        assert_eq!(inner.take_return_pc(), Some(10));
        assert_eq!(inner.take_return_pc(), None);
        assert!(!inner.has_return_pc());
    }

    #[test]
    fn nearest_call_walks_parents() {
        let root = ScopeFrame::root("root");
        let call = FunctionCall::new(FunctionBackend::Inline, "f", vec![], Type::Void);
        let call_scope = root.child_for_call("call", call);
        let inner = call_scope.child("inner");
        assert_eq!(inner.call().map(|c| c.name()), Some("f"));
        assert!(inner.own_call().is_none());
    }

    #[test]
    fn handlers_pop_by_id_across_chain() {
        let mut root = ScopeFrame::root("root");
        root.push_handler("h1", HandlerSelector::Universal, handler_fn());
        let mut child = root.child("child");
        child.push_handler("h2", HandlerSelector::Code(42.0), handler_fn());

        assert!(child.pop_handler("h1"));
        assert!(!child.pop_handler("h1"));
        assert_eq!(child.handlers().count(), 1);
    }
}
