//! Runtime value variants.
//!
//! A [`Reference`] is anything an instruction operand can resolve to at
//! runtime. References are immutable values by contract; the container
//! variants (enumerations, maps, objects, return-value maps) are
//! shared-identity cells whose contents mutate but whose identity is
//! preserved across clones.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{SviError, SviResult};
use crate::types::{ObjectType, Type};

/// The storage class of a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Affinity {
    /// Node-private storage.
    Local,
    /// Cluster-wide storage.
    Shared,
    /// An entry in the function table.
    Function,
    /// An intrinsic singleton (primitive types).
    Primitive,
    /// An object property name.
    ObjectProp,
}

impl Affinity {
    /// The single-letter prefix used in SVI text (`l:`, `s:`, ...).
    pub fn prefix(self) -> &'static str {
        match self {
            Affinity::Local => "l",
            Affinity::Shared => "s",
            Affinity::Function => "f",
            Affinity::Primitive => "p",
            Affinity::ObjectProp => "o",
        }
    }

    /// Parse an affinity from its SVI prefix letter.
    pub fn from_prefix(c: char) -> Option<Affinity> {
        match c {
            'l' => Some(Affinity::Local),
            's' => Some(Affinity::Shared),
            'f' => Some(Affinity::Function),
            'p' => Some(Affinity::Primitive),
            'o' => Some(Affinity::ObjectProp),
            _ => None,
        }
    }
}

impl fmt::Display for Affinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A named storage location.
///
/// Two locations are the same place iff their affinity and name match; the
/// declared type is bookkeeping, not identity.
#[derive(Debug, Clone)]
pub struct LocationReference {
    affinity: Affinity,
    name: String,
    declared: Option<Type>,
}

impl LocationReference {
    pub fn new(affinity: Affinity, name: impl Into<String>) -> Self {
        Self {
            affinity,
            name: name.into(),
            declared: None,
        }
    }

    pub fn affinity(&self) -> Affinity {
        self.affinity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The affinity-prefixed name, e.g. `l:my_var`.
    pub fn fq_name(&self) -> String {
        format!("{}:{}", self.affinity.prefix(), self.name)
    }

    /// The declared type, or `Ambiguous` if never typified.
    pub fn declared_type(&self) -> Type {
        self.declared.clone().unwrap_or(Type::Ambiguous)
    }

    pub fn has_declared_type(&self) -> bool {
        self.declared.is_some()
    }

    pub fn set_declared_type(&mut self, ty: Type) {
        self.declared = Some(ty);
    }

    /// A copy of this location renamed for a dynamic scope.
    pub fn renamed(&self, name: impl Into<String>) -> LocationReference {
        LocationReference {
            affinity: self.affinity,
            name: name.into(),
            declared: self.declared.clone(),
        }
    }
}

impl PartialEq for LocationReference {
    fn eq(&self, other: &Self) -> bool {
        self.affinity == other.affinity && self.name == other.name
    }
}

impl fmt::Display for LocationReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Location<{}>", self.fq_name())
    }
}

/// Which machinery executes a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionBackend {
    /// A function defined by `beginfn` in the loaded program.
    Inline,
    /// A native function supplied by a provider plug-in.
    Provider,
    /// A function built into the runtime itself (e.g. fabric tunneling).
    Intrinsic,
}

impl FunctionBackend {
    pub fn name(self) -> &'static str {
        match self {
            FunctionBackend::Inline => "INLINE",
            FunctionBackend::Provider => "PROVIDER",
            FunctionBackend::Intrinsic => "INTRINSIC",
        }
    }

    pub fn from_index(i: u64) -> Option<FunctionBackend> {
        match i {
            0 => Some(FunctionBackend::Inline),
            1 => Some(FunctionBackend::Provider),
            2 => Some(FunctionBackend::Intrinsic),
            _ => None,
        }
    }

    pub fn index(self) -> u64 {
        match self {
            FunctionBackend::Inline => 0,
            FunctionBackend::Provider => 1,
            FunctionBackend::Intrinsic => 2,
        }
    }
}

/// A callable, possibly partially applied.
///
/// The reference is self-describing: it records which backend owns the
/// function, the full formal parameter list, and the arguments applied so
/// far, so it can cross the wire and be re-bound on another node.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionReference {
    backend: FunctionBackend,
    name: String,
    formals: Vec<Type>,
    returns: Type,
    applied: Vec<Reference>,
}

impl FunctionReference {
    pub fn new(
        backend: FunctionBackend,
        name: impl Into<String>,
        formals: Vec<Type>,
        returns: Type,
    ) -> Self {
        Self {
            backend,
            name: name.into(),
            formals,
            returns,
            applied: Vec::new(),
        }
    }

    pub fn backend(&self) -> FunctionBackend {
        self.backend
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn formals(&self) -> &[Type] {
        &self.formals
    }

    pub fn returns(&self) -> &Type {
        &self.returns
    }

    pub fn applied(&self) -> &[Reference] {
        &self.applied
    }

    /// Formal parameter types not yet bound by currying.
    pub fn remaining(&self) -> &[Type] {
        &self.formals[self.applied.len()..]
    }

    /// The lambda type of the callable in its current (curried) state.
    pub fn fn_type(&self) -> Type {
        Type::lambda(self.remaining(), self.returns.clone())
    }

    /// Bind the next formal parameter, validating the argument's type.
    pub fn curry(&self, arg: Reference) -> SviResult<FunctionReference> {
        let Some(expected) = self.remaining().first() else {
            return Err(SviError::ArityExceeded {
                name: self.name.clone(),
                arity: self.formals.len(),
            });
        };

        let actual = arg.type_of();
        if !actual.is_assignable_to(expected) {
            return Err(SviError::type_mismatch(
                expected.to_string(),
                actual.to_string(),
                format!("curry f:{}", self.name),
            ));
        }

        let mut next = self.clone();
        next.applied.push(arg);
        Ok(next)
    }

    /// Build the call record for a fully applied function.
    pub fn to_call(&self) -> SviResult<FunctionCall> {
        if self.applied.len() < self.formals.len() {
            return Err(SviError::MissingArguments {
                name: self.name.clone(),
                missing: self.formals.len() - self.applied.len(),
            });
        }

        let vector = self
            .formals
            .iter()
            .cloned()
            .zip(self.applied.iter().cloned())
            .collect();

        Ok(FunctionCall::new(
            self.backend,
            self.name.clone(),
            vector,
            self.returns.clone(),
        ))
    }
}

impl fmt::Display for FunctionReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Function<f:{}, applied: {}/{}>",
            self.name,
            self.applied.len(),
            self.formals.len()
        )
    }
}

/// A concrete invocation: a function with every formal bound.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    backend: FunctionBackend,
    name: String,
    vector: Vec<(Type, Reference)>,
    returns: Type,
    returned: Option<Reference>,
}

impl FunctionCall {
    pub fn new(
        backend: FunctionBackend,
        name: impl Into<String>,
        vector: Vec<(Type, Reference)>,
        returns: Type,
    ) -> Self {
        Self {
            backend,
            name: name.into(),
            vector,
            returns,
            returned: None,
        }
    }

    pub fn backend(&self) -> FunctionBackend {
        self.backend
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vector(&self) -> &[(Type, Reference)] {
        &self.vector
    }

    pub fn returns(&self) -> &Type {
        &self.returns
    }

    /// The captured return value, once the call has produced one.
    pub fn returned(&self) -> Option<&Reference> {
        self.returned.as_ref()
    }

    pub fn set_returned(&mut self, value: Reference) {
        self.returned = Some(value);
    }
}

impl fmt::Display for FunctionCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Call<f:{}, #args: {}>", self.name, self.vector.len())
    }
}

/// An ordered, mutable collection with shared identity.
#[derive(Debug, Clone)]
pub struct EnumerationHandle {
    inner_type: Type,
    items: Arc<RwLock<Vec<Reference>>>,
}

impl EnumerationHandle {
    pub fn new(inner_type: Type) -> Self {
        Self {
            inner_type,
            items: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn inner_type(&self) -> &Type {
        &self.inner_type
    }

    pub fn append(&self, value: Reference) {
        self.items.write().push(value);
    }

    pub fn prepend(&self, value: Reference) {
        self.items.write().insert(0, value);
    }

    pub fn length(&self) -> usize {
        self.items.read().len()
    }

    pub fn get(&self, index: usize) -> SviResult<Reference> {
        let items = self.items.read();
        items.get(index).cloned().ok_or(SviError::EnumOutOfBounds {
            index,
            length: items.len(),
        })
    }

    pub fn set(&self, index: usize, value: Reference) -> SviResult<()> {
        let mut items = self.items.write();
        let length = items.len();
        match items.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(SviError::EnumOutOfBounds { index, length }),
        }
    }

    /// Append every item of `other` to this enumeration.
    pub fn concat(&self, other: &EnumerationHandle) {
        let tail: Vec<Reference> = other.items.read().clone();
        self.items.write().extend(tail);
    }

    /// A snapshot of the current items.
    pub fn snapshot(&self) -> Vec<Reference> {
        self.items.read().clone()
    }

    /// An independent copy with the same contents.
    pub fn deep_copy(&self) -> EnumerationHandle {
        let copy = EnumerationHandle::new(self.inner_type.clone());
        *copy.items.write() = self.items.read().clone();
        copy
    }

    /// True if both handles refer to the same underlying cell.
    pub fn same_identity(&self, other: &EnumerationHandle) -> bool {
        Arc::ptr_eq(&self.items, &other.items)
    }
}

impl PartialEq for EnumerationHandle {
    fn eq(&self, other: &Self) -> bool {
        if self.same_identity(other) {
            return true;
        }
        *self.items.read() == *other.items.read()
    }
}

/// A string-keyed, mutable mapping with shared identity.
///
/// Keys iterate in sorted order so `mapkeys` is deterministic.
#[derive(Debug, Clone)]
pub struct MapHandle {
    inner_type: Type,
    items: Arc<RwLock<std::collections::BTreeMap<String, Reference>>>,
}

impl MapHandle {
    pub fn new(inner_type: Type) -> Self {
        Self {
            inner_type,
            items: Arc::new(RwLock::new(std::collections::BTreeMap::new())),
        }
    }

    pub fn inner_type(&self) -> &Type {
        &self.inner_type
    }

    pub fn set(&self, key: impl Into<String>, value: Reference) {
        self.items.write().insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> SviResult<Reference> {
        self.items
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| SviError::MapMissingKey {
                key: key.to_string(),
            })
    }

    pub fn has(&self, key: &str) -> bool {
        self.items.read().contains_key(key)
    }

    pub fn length(&self) -> usize {
        self.items.read().len()
    }

    /// The keys as an enumeration of strings.
    pub fn keys(&self) -> EnumerationHandle {
        let keys = EnumerationHandle::new(Type::String);
        for key in self.items.read().keys() {
            keys.append(Reference::StringVal(key.clone()));
        }
        keys
    }

    pub fn entries(&self) -> Vec<(String, Reference)> {
        self.items
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn deep_copy(&self) -> MapHandle {
        let copy = MapHandle::new(self.inner_type.clone());
        *copy.items.write() = self.items.read().clone();
        copy
    }
}

impl PartialEq for MapHandle {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.items, &other.items) {
            return true;
        }
        *self.items.read() == *other.items.read()
    }
}

/// An instance of an object type.
#[derive(Debug, Clone)]
pub struct ObjectHandle {
    otype: ObjectType,
    properties: Arc<RwLock<indexmap::IndexMap<String, Reference>>>,
}

impl ObjectHandle {
    pub fn new(otype: ObjectType) -> Self {
        Self {
            otype,
            properties: Arc::new(RwLock::new(indexmap::IndexMap::new())),
        }
    }

    pub fn otype(&self) -> &ObjectType {
        &self.otype
    }

    /// Set a property, validating against the declared property type.
    pub fn set_property(&self, name: &str, value: Reference) -> SviResult<()> {
        let declared = self.otype.property(name)?;
        let actual = value.type_of();
        if !actual.is_assignable_to(&declared) {
            return Err(SviError::type_mismatch(
                declared.to_string(),
                actual.to_string(),
                format!("objset o:{name}"),
            ));
        }
        self.properties.write().insert(name.to_string(), value);
        Ok(())
    }

    pub fn get_property(&self, name: &str) -> SviResult<Reference> {
        // Validate the property exists on the type even if unset.
        self.otype.property(name)?;
        self.properties
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SviError::MissingProperty {
                property: name.to_string(),
            })
    }

    pub fn property_values(&self) -> Vec<(String, Reference)> {
        self.properties
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn deep_copy(&self) -> ObjectHandle {
        let copy = ObjectHandle::new(self.otype.clone());
        *copy.properties.write() = self.properties.read().clone();
        copy
    }
}

impl PartialEq for ObjectHandle {
    fn eq(&self, other: &Self) -> bool {
        self.otype == other.otype && *self.properties.read() == *other.properties.read()
    }
}

/// Return values of deferred jobs, keyed by job id or collection index.
#[derive(Debug, Clone, Default)]
pub struct ReturnValueMapHandle {
    items: Arc<RwLock<std::collections::BTreeMap<u64, Reference>>>,
}

impl ReturnValueMapHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: u64, value: Reference) {
        self.items.write().insert(key, value);
    }

    pub fn get(&self, key: u64) -> Option<Reference> {
        self.items.read().get(&key).cloned()
    }

    pub fn has(&self, key: u64) -> bool {
        self.items.read().contains_key(&key)
    }

    pub fn length(&self) -> usize {
        self.items.read().len()
    }

    pub fn entries(&self) -> Vec<(u64, Reference)> {
        self.items
            .read()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }
}

impl PartialEq for ReturnValueMapHandle {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.items, &other.items) {
            return true;
        }
        *self.items.read() == *other.items.read()
    }
}

/// A handle to an ordered pipe, bound to a live stream by id at use.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamHandle {
    id: String,
    inner_type: Type,
}

impl StreamHandle {
    pub fn new(id: impl Into<String>, inner_type: Type) -> Self {
        Self {
            id: id.into(),
            inner_type,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn inner_type(&self) -> &Type {
        &self.inner_type
    }
}

/// How a published resource may be accessed from other nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceCategory {
    /// Operations are forwarded to the owning node.
    Tunneled,
    /// The resource can be cloned locally on any node.
    Replicated,
    /// Only the owning node may touch it.
    Exclusive,
}

impl ResourceCategory {
    pub fn from_index(i: u64) -> Option<ResourceCategory> {
        match i {
            0 => Some(ResourceCategory::Tunneled),
            1 => Some(ResourceCategory::Replicated),
            2 => Some(ResourceCategory::Exclusive),
            _ => None,
        }
    }

    pub fn index(self) -> u64 {
        match self {
            ResourceCategory::Tunneled => 0,
            ResourceCategory::Replicated => 1,
            ResourceCategory::Exclusive => 2,
        }
    }
}

/// A handle to a published distributed resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceHandle {
    id: String,
    owner: String,
    name: String,
    inner_type: Type,
    category: ResourceCategory,
}

impl ResourceHandle {
    pub fn new(
        id: impl Into<String>,
        owner: impl Into<String>,
        name: impl Into<String>,
        inner_type: Type,
        category: ResourceCategory,
    ) -> Self {
        Self {
            id: id.into(),
            owner: owner.into(),
            name: name.into(),
            inner_type,
            category,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inner_type(&self) -> &Type {
        &self.inner_type
    }

    pub fn category(&self) -> ResourceCategory {
        self.category
    }
}

/// Discriminant of a [`Reference`], used as its wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceTag {
    Location,
    Type,
    OType,
    Object,
    String,
    Number,
    Boolean,
    Function,
    Stream,
    Resource,
    Enumeration,
    Map,
    Void,
    ContextId,
    JobId,
    ReturnValueMap,
}

impl ReferenceTag {
    pub fn name(self) -> &'static str {
        match self {
            ReferenceTag::Location => "LOCATION",
            ReferenceTag::Type => "TYPE",
            ReferenceTag::OType => "OTYPE",
            ReferenceTag::Object => "OBJECT",
            ReferenceTag::String => "STRING",
            ReferenceTag::Number => "NUMBER",
            ReferenceTag::Boolean => "BOOLEAN",
            ReferenceTag::Function => "FUNCTION",
            ReferenceTag::Stream => "STREAM",
            ReferenceTag::Resource => "RESOURCE",
            ReferenceTag::Enumeration => "ENUMERATION",
            ReferenceTag::Map => "MAP",
            ReferenceTag::Void => "VOID",
            ReferenceTag::ContextId => "CONTEXT_ID",
            ReferenceTag::JobId => "JOB_ID",
            ReferenceTag::ReturnValueMap => "RETURN_VALUE_MAP",
        }
    }
}

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Reference {
    Location(LocationReference),
    /// A type literal.
    TypeRef(Type),
    /// An open or finalized object type under construction.
    OType(ObjectType),
    Object(ObjectHandle),
    StringVal(String),
    Number(f64),
    Boolean(bool),
    Function(FunctionReference),
    Stream(StreamHandle),
    Resource(ResourceHandle),
    Enumeration(EnumerationHandle),
    Map(MapHandle),
    Void,
    /// A queue context identifier.
    ContextId(String),
    /// A deferred job identifier.
    JobId(u64),
    ReturnValueMap(ReturnValueMapHandle),
}

impl Reference {
    pub fn tag(&self) -> ReferenceTag {
        match self {
            Reference::Location(_) => ReferenceTag::Location,
            Reference::TypeRef(_) => ReferenceTag::Type,
            Reference::OType(_) => ReferenceTag::OType,
            Reference::Object(_) => ReferenceTag::Object,
            Reference::StringVal(_) => ReferenceTag::String,
            Reference::Number(_) => ReferenceTag::Number,
            Reference::Boolean(_) => ReferenceTag::Boolean,
            Reference::Function(_) => ReferenceTag::Function,
            Reference::Stream(_) => ReferenceTag::Stream,
            Reference::Resource(_) => ReferenceTag::Resource,
            Reference::Enumeration(_) => ReferenceTag::Enumeration,
            Reference::Map(_) => ReferenceTag::Map,
            Reference::Void => ReferenceTag::Void,
            Reference::ContextId(_) => ReferenceTag::ContextId,
            Reference::JobId(_) => ReferenceTag::JobId,
            Reference::ReturnValueMap(_) => ReferenceTag::ReturnValueMap,
        }
    }

    /// The type of the value this reference holds.
    pub fn type_of(&self) -> Type {
        match self {
            Reference::Location(loc) => loc.declared_type(),
            Reference::TypeRef(_) => Type::Type,
            Reference::OType(_) => Type::Type,
            Reference::Object(obj) => Type::Object(obj.otype().clone()),
            Reference::StringVal(_) => Type::String,
            Reference::Number(_) => Type::Number,
            Reference::Boolean(_) => Type::Boolean,
            Reference::Function(f) => f.fn_type(),
            Reference::Stream(s) => Type::Stream(Box::new(s.inner_type().clone())),
            Reference::Resource(r) => Type::Resource(Box::new(r.inner_type().clone())),
            Reference::Enumeration(e) => Type::Enumerable(Box::new(e.inner_type().clone())),
            Reference::Map(m) => Type::Map(Box::new(m.inner_type().clone())),
            Reference::Void => Type::Void,
            Reference::ContextId(_) => Type::Opaque("CONTEXT_ID".to_string()),
            Reference::JobId(_) => Type::Opaque("JOB_ID".to_string()),
            Reference::ReturnValueMap(_) => Type::Opaque("RETURN_VALUE_MAP".to_string()),
        }
    }

    /// Truthiness for conditional calls: `true` booleans only.
    pub fn is_truthy(&self) -> bool {
        matches!(self, Reference::Boolean(true))
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Location(loc) => loc.fmt(f),
            Reference::TypeRef(t) => write!(f, "Type<{t}>"),
            Reference::OType(t) => write!(f, "OType<{t}>"),
            Reference::Object(o) => write!(f, "Object<{}>", o.otype()),
            Reference::StringVal(s) => f.write_str(s),
            Reference::Number(n) => {
                // Whole numbers print without a trailing `.0`.
                if n.fract() == 0.0 && n.is_finite() {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{n}")
                }
            }
            Reference::Boolean(b) => write!(f, "{b}"),
            Reference::Function(func) => func.fmt(f),
            Reference::Stream(s) => write!(f, "Stream<{}>", s.id()),
            Reference::Resource(r) => write!(f, "Resource<{}>", r.id()),
            Reference::Enumeration(e) => write!(f, "Enumeration<#items: {}>", e.length()),
            Reference::Map(m) => write!(f, "Map<#keys: {}>", m.length()),
            Reference::Void => f.write_str("Void<>"),
            Reference::ContextId(id) => write!(f, "ContextId<{id}>"),
            Reference::JobId(id) => write!(f, "JobId<{id}>"),
            Reference::ReturnValueMap(m) => write!(f, "ReturnValueMap<#keys: {}>", m.length()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_identity_ignores_type() {
        let mut a = LocationReference::new(Affinity::Local, "x");
        let b = LocationReference::new(Affinity::Local, "x");
        a.set_declared_type(Type::Number);
        assert_eq!(a, b);
        assert_ne!(a, LocationReference::new(Affinity::Shared, "x"));
        assert_eq!(a.fq_name(), "l:x");
    }

    #[test]
    fn curry_validates_and_advances() {
        let f = FunctionReference::new(
            FunctionBackend::Inline,
            "add",
            vec![Type::Number, Type::Number],
            Type::Number,
        );

        assert!(f.to_call().is_err());
        let f = f.curry(Reference::Number(1.0)).unwrap();
        assert!(f.curry(Reference::StringVal("no".into())).is_err());
        let f = f.curry(Reference::Number(2.0)).unwrap();

        let call = f.to_call().unwrap();
        assert_eq!(call.vector().len(), 2);
        assert!(f.curry(Reference::Number(3.0)).is_err());
    }

    #[test]
    fn fn_type_shrinks_with_currying() {
        let f = FunctionReference::new(
            FunctionBackend::Inline,
            "inc",
            vec![Type::Number],
            Type::Number,
        );
        assert_eq!(
            f.fn_type(),
            Type::Lambda1(Box::new(Type::Number), Box::new(Type::Number))
        );
        let applied = f.curry(Reference::Number(1.0)).unwrap();
        assert_eq!(applied.fn_type(), Type::Lambda0(Box::new(Type::Number)));
    }

    #[test]
    fn enumeration_shares_identity_across_clones() {
        let e = EnumerationHandle::new(Type::Number);
        let alias = e.clone();
        e.append(Reference::Number(1.0));
        assert_eq!(alias.length(), 1);
        assert!(alias.same_identity(&e));

        let copy = e.deep_copy();
        e.append(Reference::Number(2.0));
        assert_eq!(copy.length(), 1);
        assert!(!copy.same_identity(&e));
    }

    #[test]
    fn enumeration_bounds_errors() {
        let e = EnumerationHandle::new(Type::Number);
        e.append(Reference::Number(1.0));
        assert!(e.get(0).is_ok());
        assert_eq!(
            e.get(3),
            Err(SviError::EnumOutOfBounds {
                index: 3,
                length: 1
            })
        );
        assert!(e.set(1, Reference::Number(9.0)).is_err());
    }

    #[test]
    fn map_keys_are_sorted() {
        let m = MapHandle::new(Type::Number);
        m.set("b", Reference::Number(2.0));
        m.set("a", Reference::Number(1.0));
        let keys = m.keys();
        assert_eq!(keys.get(0).unwrap(), Reference::StringVal("a".into()));
        assert_eq!(keys.get(1).unwrap(), Reference::StringVal("b".into()));
        assert!(m.get("missing").is_err());
    }

    #[test]
    fn object_property_type_enforced() {
        let mut t = ObjectType::new();
        t.define_property("x", Type::Number).unwrap();
        t.finalize();

        let obj = ObjectHandle::new(t);
        assert!(obj.set_property("x", Reference::Number(1.0)).is_ok());
        assert!(obj
            .set_property("x", Reference::StringVal("no".into()))
            .is_err());
        assert!(obj.set_property("y", Reference::Number(1.0)).is_err());
    }

    #[test]
    fn number_display_drops_integral_fraction() {
        assert_eq!(Reference::Number(5.0).to_string(), "5");
        assert_eq!(Reference::Number(2.5).to_string(), "2.5");
    }

    #[test]
    fn structural_equality() {
        let a = EnumerationHandle::new(Type::Number);
        let b = EnumerationHandle::new(Type::Number);
        a.append(Reference::Number(1.0));
        b.append(Reference::Number(1.0));
        assert_eq!(Reference::Enumeration(a), Reference::Enumeration(b));
    }
}
