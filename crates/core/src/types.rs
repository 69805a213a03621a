//! The structural type lattice.
//!
//! Every runtime value carries one of these types. Assignability is
//! structural with `Ambiguous` at the top and `Contradiction` at the bottom;
//! `Opaque` types are nominal (compared by name) and object types are
//! structural records with an optional parent chain.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;

use crate::error::{SviError, SviResult};

/// The intrinsic kind of a type, independent of any inner types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    String,
    Number,
    Boolean,
    Error,
    Void,
    Unit,
    Type,
    Map,
    Enumerable,
    Stream,
    Lambda0,
    Lambda1,
    Resource,
    Ambiguous,
    Opaque,
    Object,
    This,
    Contradiction,
}

impl Intrinsic {
    /// The canonical upper-case name, as it appears in SVI text and wire tags.
    pub fn name(self) -> &'static str {
        match self {
            Intrinsic::String => "STRING",
            Intrinsic::Number => "NUMBER",
            Intrinsic::Boolean => "BOOLEAN",
            Intrinsic::Error => "ERROR",
            Intrinsic::Void => "VOID",
            Intrinsic::Unit => "UNIT",
            Intrinsic::Type => "TYPE",
            Intrinsic::Map => "MAP",
            Intrinsic::Enumerable => "ENUMERABLE",
            Intrinsic::Stream => "STREAM",
            Intrinsic::Lambda0 => "LAMBDA0",
            Intrinsic::Lambda1 => "LAMBDA1",
            Intrinsic::Resource => "RESOURCE",
            Intrinsic::Ambiguous => "AMBIGUOUS",
            Intrinsic::Opaque => "OPAQUE",
            Intrinsic::Object => "OBJECT",
            Intrinsic::This => "THIS",
            Intrinsic::Contradiction => "CONTRADICTION",
        }
    }
}

impl fmt::Display for Intrinsic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A type in the SVI lattice.
///
/// Primitive variants behave as interned singletons: constructing
/// `Type::Number` twice yields values that compare equal and carry no state.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    String,
    Number,
    Boolean,
    Error,
    Void,
    Unit,
    /// The type of type values themselves.
    Type,
    Map(Box<Type>),
    Enumerable(Box<Type>),
    Stream(Box<Type>),
    /// A zero-argument callable yielding the inner type.
    Lambda0(Box<Type>),
    /// A one-argument callable; multi-argument functions are nested
    /// `Lambda1`s in curried form.
    Lambda1(Box<Type>, Box<Type>),
    Resource(Box<Type>),
    /// The top of the lattice: anything is assignable to it.
    Ambiguous,
    /// A nominal type, compared by name.
    Opaque(String),
    /// A structural record type.
    Object(ObjectType),
    /// Self-reference placeholder inside an object type's own properties.
    This,
    /// The bottom of the lattice; never a valid runtime type.
    Contradiction,
}

impl Type {
    /// The intrinsic kind of this type.
    pub fn intrinsic(&self) -> Intrinsic {
        match self {
            Type::String => Intrinsic::String,
            Type::Number => Intrinsic::Number,
            Type::Boolean => Intrinsic::Boolean,
            Type::Error => Intrinsic::Error,
            Type::Void => Intrinsic::Void,
            Type::Unit => Intrinsic::Unit,
            Type::Type => Intrinsic::Type,
            Type::Map(_) => Intrinsic::Map,
            Type::Enumerable(_) => Intrinsic::Enumerable,
            Type::Stream(_) => Intrinsic::Stream,
            Type::Lambda0(_) => Intrinsic::Lambda0,
            Type::Lambda1(_, _) => Intrinsic::Lambda1,
            Type::Resource(_) => Intrinsic::Resource,
            Type::Ambiguous => Intrinsic::Ambiguous,
            Type::Opaque(_) => Intrinsic::Opaque,
            Type::Object(_) => Intrinsic::Object,
            Type::This => Intrinsic::This,
            Type::Contradiction => Intrinsic::Contradiction,
        }
    }

    /// True for the stateless intrinsic kinds.
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Type::String
                | Type::Number
                | Type::Boolean
                | Type::Error
                | Type::Void
                | Type::Unit
                | Type::Type
        )
    }

    /// Look up the primitive type for an intrinsic, if one exists.
    pub fn primitive_of(intrinsic: Intrinsic) -> Option<Type> {
        match intrinsic {
            Intrinsic::String => Some(Type::String),
            Intrinsic::Number => Some(Type::Number),
            Intrinsic::Boolean => Some(Type::Boolean),
            Intrinsic::Error => Some(Type::Error),
            Intrinsic::Void => Some(Type::Void),
            Intrinsic::Unit => Some(Type::Unit),
            Intrinsic::Type => Some(Type::Type),
            _ => None,
        }
    }

    /// True for callables.
    pub fn is_callable(&self) -> bool {
        matches!(self, Type::Lambda0(_) | Type::Lambda1(_, _))
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Type::Ambiguous)
    }

    /// Build a curried lambda type from a parameter list and return type.
    pub fn lambda(params: &[Type], returns: Type) -> Type {
        if params.is_empty() {
            return Type::Lambda0(Box::new(returns));
        }

        let mut ty = returns;
        for param in params.iter().rev() {
            ty = Type::Lambda1(Box::new(param.clone()), Box::new(ty));
        }
        ty
    }

    /// Flatten a curried lambda type into its parameter list.
    pub fn lambda_params(&self) -> Vec<&Type> {
        let mut params = Vec::new();
        let mut cursor = self;
        while let Type::Lambda1(param, returns) = cursor {
            params.push(param.as_ref());
            cursor = returns.as_ref();
        }
        params
    }

    /// The final return type of a callable, or the type itself.
    pub fn lambda_returns(&self) -> &Type {
        let mut cursor = self;
        loop {
            match cursor {
                Type::Lambda0(returns) => cursor = returns.as_ref(),
                Type::Lambda1(_, returns) => cursor = returns.as_ref(),
                other => return other,
            }
        }
    }

    /// Structural assignability: `self ≤ other`.
    ///
    /// `Ambiguous` accepts everything. Lambda parameters are checked
    /// covariantly, matching the observed semantics of the IR (not the
    /// textbook contravariant rule).
    pub fn is_assignable_to(&self, other: &Type) -> bool {
        if other.is_ambiguous() {
            return true;
        }

        match (self, other) {
            (a, b) if a.is_primitive() => b.is_primitive() && a.intrinsic() == b.intrinsic(),
            (Type::Map(a), Type::Map(b)) => a.is_assignable_to(b),
            (Type::Enumerable(a), Type::Enumerable(b)) => a.is_assignable_to(b),
            (Type::Stream(a), Type::Stream(b)) => a.is_assignable_to(b),
            (Type::Resource(a), Type::Resource(b)) => a.is_assignable_to(b),
            (Type::Lambda0(ra), Type::Lambda0(rb)) => ra.is_assignable_to(rb),
            (Type::Lambda1(pa, ra), Type::Lambda1(pb, rb)) => {
                ra.is_assignable_to(rb) && pa.is_assignable_to(pb)
            }
            (Type::Opaque(a), Type::Opaque(b)) => a == b,
            (Type::Object(a), Type::Object(b)) => a.is_assignable_to(b),
            (Type::This, Type::This) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Map(v) => write!(f, "MAP<{v}>"),
            Type::Enumerable(v) => write!(f, "ENUMERABLE<{v}>"),
            Type::Stream(v) => write!(f, "STREAM<{v}>"),
            Type::Resource(v) => write!(f, "RESOURCE<{v}>"),
            Type::Lambda0(r) => write!(f, ":: {r}"),
            Type::Lambda1(p, r) => write!(f, "{p} :: {r}"),
            Type::Opaque(name) => write!(f, "OPAQUE<{name}>"),
            Type::Object(o) => write!(f, "{o}"),
            other => f.write_str(other.intrinsic().name()),
        }
    }
}

static NEXT_OBJECT_TYPE_ID: AtomicU64 = AtomicU64::new(1);

/// A structural record type: an ordered set of named, typed properties.
///
/// Recursive shapes never form strong cycles: a property whose type is the
/// enclosing object type is stored as [`Type::This`] and interpreted against
/// the enclosing type wherever properties are checked.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectType {
    id: u64,
    parent: Option<u64>,
    properties: IndexMap<String, Type>,
    finalized: bool,
}

impl ObjectType {
    /// Create a fresh, open object type with no properties.
    pub fn new() -> Self {
        Self {
            id: NEXT_OBJECT_TYPE_ID.fetch_add(1, Ordering::Relaxed),
            parent: None,
            properties: IndexMap::new(),
            finalized: false,
        }
    }

    /// Rebuild an object type from serialized parts.
    pub fn from_parts(
        id: u64,
        parent: Option<u64>,
        properties: IndexMap<String, Type>,
        finalized: bool,
    ) -> Self {
        // Keep the id allocator ahead of any id produced elsewhere.
        NEXT_OBJECT_TYPE_ID.fetch_max(id + 1, Ordering::Relaxed);
        Self {
            id,
            parent,
            properties,
            finalized,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn parent(&self) -> Option<u64> {
        self.parent
    }

    pub fn is_final(&self) -> bool {
        self.finalized
    }

    pub fn properties(&self) -> &IndexMap<String, Type> {
        &self.properties
    }

    /// Declare or replace a property.
    pub fn define_property(&mut self, name: &str, ty: Type) -> SviResult<()> {
        if self.finalized {
            return Err(SviError::ObjectTypeFinalized {
                context: format!("define property `{name}`"),
            });
        }
        self.properties.insert(name.to_string(), ty);
        Ok(())
    }

    /// Remove a property.
    pub fn delete_property(&mut self, name: &str) -> SviResult<()> {
        if self.finalized {
            return Err(SviError::ObjectTypeFinalized {
                context: format!("delete property `{name}`"),
            });
        }
        if self.properties.shift_remove(name).is_none() {
            return Err(SviError::MissingProperty {
                property: name.to_string(),
            });
        }
        Ok(())
    }

    /// Look up a property's declared type, with `This` resolved to this
    /// object type.
    pub fn property(&self, name: &str) -> SviResult<Type> {
        let ty = self
            .properties
            .get(name)
            .ok_or_else(|| SviError::MissingProperty {
                property: name.to_string(),
            })?;
        Ok(self.resolve_this(ty))
    }

    /// Substitute `This` with this object type.
    pub fn resolve_this(&self, ty: &Type) -> Type {
        match ty {
            Type::This => Type::Object(self.clone_without_self_nesting()),
            Type::Map(v) => Type::Map(Box::new(self.resolve_this(v))),
            Type::Enumerable(v) => Type::Enumerable(Box::new(self.resolve_this(v))),
            Type::Stream(v) => Type::Stream(Box::new(self.resolve_this(v))),
            Type::Resource(v) => Type::Resource(Box::new(self.resolve_this(v))),
            Type::Lambda0(r) => Type::Lambda0(Box::new(self.resolve_this(r))),
            Type::Lambda1(p, r) => Type::Lambda1(
                Box::new(self.resolve_this(p)),
                Box::new(self.resolve_this(r)),
            ),
            other => other.clone(),
        }
    }

    // The resolved form keeps `This` inside its own property table, so the
    // substitution cannot recurse forever.
    fn clone_without_self_nesting(&self) -> ObjectType {
        self.clone()
    }

    /// Freeze the shape. Further structural changes fail.
    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    /// Open a child type inheriting this type's properties.
    pub fn subset(&self) -> ObjectType {
        Self {
            id: NEXT_OBJECT_TYPE_ID.fetch_add(1, Ordering::Relaxed),
            parent: Some(self.id),
            properties: self.properties.clone(),
            finalized: false,
        }
    }

    /// True if `other` is this type or an ancestor of it.
    pub fn inherits_from(&self, other: &ObjectType) -> bool {
        self.id == other.id || self.parent == Some(other.id)
    }

    /// Structural subset check: every property `other` declares must exist
    /// here with an assignable type. Self-references match by enclosing id.
    pub fn is_assignable_to(&self, other: &ObjectType) -> bool {
        if self.inherits_from(other) {
            return true;
        }

        other.properties.iter().all(|(name, expected)| {
            self.properties.get(name).is_some_and(|actual| {
                match (actual, expected) {
                    // A self-reference is assignable to the target's
                    // self-reference, or to the target itself.
                    (Type::This, Type::This) => true,
                    (Type::This, Type::Object(o)) => self.id == o.id || self.parent == Some(o.id),
                    _ => actual.is_assignable_to(expected),
                }
            })
        })
    }
}

impl Default for ObjectType {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OBJECT<#{}", self.id)?;
        if self.finalized {
            write!(f, ", final")?;
        }
        write!(f, ", #props: {}>", self.properties.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_compare_by_intrinsic() {
        assert!(Type::Number.is_assignable_to(&Type::Number));
        assert!(!Type::Number.is_assignable_to(&Type::String));
        assert!(!Type::Number.is_assignable_to(&Type::Map(Box::new(Type::Number))));
    }

    #[test]
    fn ambiguous_is_top() {
        assert!(Type::Number.is_assignable_to(&Type::Ambiguous));
        assert!(Type::Map(Box::new(Type::String)).is_assignable_to(&Type::Ambiguous));
        assert!(Type::Ambiguous.is_assignable_to(&Type::Ambiguous));
    }

    #[test]
    fn containers_are_covariant() {
        let num_map = Type::Map(Box::new(Type::Number));
        let any_map = Type::Map(Box::new(Type::Ambiguous));
        assert!(num_map.is_assignable_to(&any_map));
        assert!(!any_map.is_assignable_to(&num_map));
    }

    #[test]
    fn lambda_params_are_covariant() {
        // Deliberately preserved: parameters check covariantly, so a
        // narrower parameter is accepted where a wider one is declared.
        let narrow = Type::Lambda1(Box::new(Type::Number), Box::new(Type::Void));
        let wide = Type::Lambda1(Box::new(Type::Ambiguous), Box::new(Type::Void));
        assert!(narrow.is_assignable_to(&wide));
        assert!(!wide.is_assignable_to(&narrow));
    }

    #[test]
    fn lambda_construction_round_trips() {
        let ty = Type::lambda(&[Type::Number, Type::String], Type::Boolean);
        let params = ty.lambda_params();
        assert_eq!(params, vec![&Type::Number, &Type::String]);
        assert_eq!(ty.lambda_returns(), &Type::Boolean);

        let nullary = Type::lambda(&[], Type::Void);
        assert_eq!(nullary, Type::Lambda0(Box::new(Type::Void)));
    }

    #[test]
    fn opaque_is_nominal() {
        let a = Type::Opaque("FILE".into());
        let b = Type::Opaque("FILE".into());
        let c = Type::Opaque("SOCKET".into());
        assert!(a.is_assignable_to(&b));
        assert!(!a.is_assignable_to(&c));
    }

    #[test]
    fn object_subset_assignability() {
        let mut point = ObjectType::new();
        point.define_property("x", Type::Number).unwrap();
        point.define_property("y", Type::Number).unwrap();

        let mut labeled = ObjectType::new();
        labeled.define_property("x", Type::Number).unwrap();
        labeled.define_property("y", Type::Number).unwrap();
        labeled.define_property("label", Type::String).unwrap();

        // More properties is assignable to fewer, not vice versa.
        assert!(labeled.is_assignable_to(&point));
        assert!(!point.is_assignable_to(&labeled));
    }

    #[test]
    fn object_parent_chain() {
        let mut base = ObjectType::new();
        base.define_property("id", Type::Number).unwrap();
        base.finalize();

        let child = base.subset();
        assert!(child.is_assignable_to(&base));
        assert!(child.properties().contains_key("id"));
        assert!(!child.is_final());
    }

    #[test]
    fn finalized_object_rejects_changes() {
        let mut t = ObjectType::new();
        t.define_property("x", Type::Number).unwrap();
        t.finalize();
        assert!(t.define_property("y", Type::Number).is_err());
        assert!(t.delete_property("x").is_err());
    }

    #[test]
    fn this_resolves_to_enclosing_type() {
        let mut node = ObjectType::new();
        node.define_property("value", Type::Number).unwrap();
        node.define_property("next", Type::This).unwrap();
        node.finalize();

        let next = node.property("next").unwrap();
        match next {
            Type::Object(o) => assert_eq!(o.id(), node.id()),
            other => panic!("expected object type, got {other}"),
        }
    }
}
