//! Link resolution and method selection.
//!
//! Resolution turns a symbolic constant-pool entry into a concrete member
//! once and caches it in the entry's slot; only successes are cached, so a
//! failed resolution is retried (and fails again) on the next execution.
//! Selection picks the body to run for a resolved method given the
//! receiver's runtime class.

use std::sync::Arc;

use crate::error::VmError;

use super::bootstrap::names;
use super::class::{
    AccessFlags, Class, ClassId, Constant, FieldInfo, MemberRef, Method, ResolvedField,
};
use super::exception::GuestError;
use super::registry::ClassRegistry;

/// Why a link step failed: a guest-visible linkage error or a malformed
/// constant pool.
#[derive(Debug)]
pub enum LinkError {
    Guest(GuestError),
    Fatal(VmError),
}

impl From<GuestError> for LinkError {
    fn from(e: GuestError) -> Self {
        LinkError::Guest(e)
    }
}

impl From<VmError> for LinkError {
    fn from(e: VmError) -> Self {
        LinkError::Fatal(e)
    }
}

pub type LinkResult<T> = Result<T, LinkError>;

fn dotted(name: &str) -> String {
    name.replace('/', ".")
}

fn bad_constant(class: &Class, index: u16, expected: &'static str) -> LinkError {
    LinkError::Fatal(VmError::BadConstant {
        class: class.name.clone(),
        index,
        expected,
    })
}

fn no_such_method(member: &MemberRef) -> LinkError {
    GuestError::new(
        names::NO_SUCH_METHOD,
        format!("{}.{}{}", dotted(&member.class), member.name, member.descriptor),
    )
    .into()
}

/// Resolves constant-pool entries of one registry.
pub struct Resolver<'a> {
    registry: &'a ClassRegistry,
}

impl<'a> Resolver<'a> {
    pub fn new(registry: &'a ClassRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &'a ClassRegistry {
        self.registry
    }

    /// `#index` of `class`'s pool as a class reference.
    pub fn resolve_class(&self, class: &Class, index: u16) -> LinkResult<Arc<Class>> {
        let Some(Constant::Class { name, resolved }) = class.constants.get(index) else {
            return Err(bad_constant(class, index, "class"));
        };
        if let Some(id) = resolved.get() {
            return Ok(self.registry.get(*id)?);
        }
        let target = self.registry.load(name)?;
        let _ = resolved.set(target.id);
        Ok(target)
    }

    pub fn resolve_field(&self, class: &Class, index: u16) -> LinkResult<ResolvedField> {
        let Some(Constant::Field { member, resolved }) = class.constants.get(index) else {
            return Err(bad_constant(class, index, "field reference"));
        };
        if let Some(field) = resolved.get() {
            return Ok(field.clone());
        }

        let owner = self.registry.load(&member.class)?;
        let Some((declaring, info)) =
            self.find_field(owner.id, &member.name, &member.descriptor)?
        else {
            return Err(GuestError::new(names::NO_SUCH_FIELD, member.name.clone()).into());
        };
        let is_static = info.is_static();
        let field = ResolvedField {
            class: declaring,
            name: info.name,
            kind: info.kind,
            offset: info.offset,
            is_static,
        };
        tracing::trace!(field = %member, offset = field.offset, "resolved field");
        let _ = resolved.set(field.clone());
        Ok(field)
    }

    /// Field lookup: the class itself, then its superinterfaces, then its
    /// superclass recursively.
    fn find_field(
        &self,
        class: ClassId,
        name: &str,
        descriptor: &str,
    ) -> Result<Option<(ClassId, FieldInfo)>, VmError> {
        let c = self.registry.get(class)?;
        if let Some(info) = c.declared_field(name, descriptor) {
            return Ok(Some((class, info.clone())));
        }
        for iface in &c.interfaces {
            if let Some(found) = self.find_field(*iface, name, descriptor)? {
                return Ok(Some(found));
            }
        }
        match c.super_class {
            Some(sup) => self.find_field(sup, name, descriptor),
            None => Ok(None),
        }
    }

    /// Method or interface-method reference `#index` of `class`'s pool.
    pub fn resolve_method(&self, class: &Class, index: u16) -> LinkResult<Arc<Method>> {
        let Some(Constant::Method {
            member,
            interface,
            resolved,
        }) = class.constants.get(index)
        else {
            return Err(bad_constant(class, index, "method reference"));
        };
        if let Some(method) = resolved.get() {
            return Ok(Arc::clone(method));
        }

        let owner = self.registry.load(&member.class)?;
        let method = self.lookup_method(&owner, member, *interface)?;
        tracing::trace!(method = %member, "resolved method");
        let _ = resolved.set(Arc::clone(&method));
        Ok(method)
    }

    /// Resolve `member` against `owner`. Interface references must name an
    /// interface and class references a class.
    pub fn lookup_method(
        &self,
        owner: &Arc<Class>,
        member: &MemberRef,
        interface: bool,
    ) -> LinkResult<Arc<Method>> {
        if owner.is_interface() != interface {
            let expected = if interface { "interface" } else { "class" };
            return Err(GuestError::new(
                names::INCOMPATIBLE_CLASS_CHANGE,
                format!(
                    "found {} {}, but {} was expected",
                    if owner.is_interface() { "interface" } else { "class" },
                    owner.java_name(),
                    expected
                ),
            )
            .into());
        }

        let (name, descriptor) = (member.name.as_str(), member.descriptor.as_str());

        // The class and its superclasses; for interfaces, the interface
        // then Object.
        let mut current = Some(owner.id);
        while let Some(id) = current {
            let c = self.registry.get(id)?;
            if let Some(m) = c.declared_method(name, descriptor)
                && (!interface
                    || id == owner.id
                    || (m.flags.contains(AccessFlags::PUBLIC) && !m.is_static()))
            {
                return Ok(Arc::clone(m));
            }
            current = c.super_class;
        }

        // Superinterfaces: a maximally specific match wins, any match will do.
        let candidates = self.interface_candidates(owner.id, name, descriptor)?;
        let maximal = self.maximally_specific(candidates)?;
        maximal
            .iter()
            .find(|m| !m.is_abstract())
            .or_else(|| maximal.first())
            .cloned()
            .ok_or_else(|| no_such_method(member))
    }

    /// Methods named `name` + `descriptor` declared by any superinterface of
    /// `class`, excluding static and private ones.
    fn interface_candidates(
        &self,
        class: ClassId,
        name: &str,
        descriptor: &str,
    ) -> Result<Vec<Arc<Method>>, VmError> {
        let mut found = Vec::new();
        for iface in self.registry.all_interfaces(class)? {
            let c = self.registry.get(iface)?;
            if let Some(m) = c.declared_method(name, descriptor)
                && !m.is_static()
                && !m.is_private()
            {
                found.push(Arc::clone(m));
            }
        }
        Ok(found)
    }

    /// Drop every candidate whose declaring interface is a superinterface
    /// of another candidate's.
    fn maximally_specific(
        &self,
        candidates: Vec<Arc<Method>>,
    ) -> Result<Vec<Arc<Method>>, VmError> {
        let mut maximal = Vec::with_capacity(candidates.len());
        for m in &candidates {
            let mut shadowed = false;
            for other in &candidates {
                if other.class != m.class && self.registry.is_assignable(other.class, m.class)? {
                    shadowed = true;
                    break;
                }
            }
            if !shadowed {
                maximal.push(Arc::clone(m));
            }
        }
        Ok(maximal)
    }

    /// Method selection for `invokevirtual`.
    pub fn select_virtual(
        &self,
        receiver: ClassId,
        resolved: &Arc<Method>,
    ) -> LinkResult<Arc<Method>> {
        if resolved.is_private() {
            return Ok(Arc::clone(resolved));
        }
        self.select_from(receiver, resolved)
    }

    /// Method selection for `invokeinterface`. The receiver must implement
    /// the resolved method's interface.
    pub fn select_interface(
        &self,
        receiver: ClassId,
        resolved: &Arc<Method>,
    ) -> LinkResult<Arc<Method>> {
        if !self.registry.is_assignable(receiver, resolved.class)? {
            let receiver = self.registry.get(receiver)?;
            return Err(GuestError::new(
                names::INCOMPATIBLE_CLASS_CHANGE,
                format!(
                    "class {} does not implement the requested interface {}",
                    receiver.java_name(),
                    dotted(&resolved.class_name)
                ),
            )
            .into());
        }
        if resolved.is_private() {
            return Ok(Arc::clone(resolved));
        }
        self.select_from(receiver, resolved)
    }

    /// Method selection for `invokespecial` from `current`. Calls naming a
    /// superclass of the caller look up from the caller's direct superclass;
    /// constructors and private methods run as resolved.
    pub fn select_special(
        &self,
        current: &Class,
        resolved: &Arc<Method>,
    ) -> LinkResult<Arc<Method>> {
        let referenced = self.registry.get(resolved.class)?;
        let super_call = !resolved.is_initializer()
            && !resolved.is_private()
            && !referenced.is_interface()
            && referenced.id != current.id
            && self.registry.is_subclass(current.id, referenced.id)?;

        let method = match (super_call, current.super_class) {
            (true, Some(sup)) => self.select_from(sup, resolved)?,
            _ => Arc::clone(resolved),
        };
        if method.is_abstract() {
            return Err(GuestError::new(names::ABSTRACT_METHOD, method.qualified_name()).into());
        }
        Ok(method)
    }

    /// Walk the superclass chain from `start`, then fall back to the
    /// maximally specific default method. Ambiguous defaults always raise.
    fn select_from(&self, start: ClassId, resolved: &Method) -> LinkResult<Arc<Method>> {
        let (name, descriptor) = (resolved.name.as_str(), resolved.descriptor.as_str());

        let mut current = Some(start);
        while let Some(id) = current {
            let c = self.registry.get(id)?;
            if let Some(m) = c.declared_method(name, descriptor)
                && !m.is_static()
                && !m.is_private()
            {
                if m.is_abstract() {
                    return Err(GuestError::new(names::ABSTRACT_METHOD, m.qualified_name()).into());
                }
                return Ok(Arc::clone(m));
            }
            current = c.super_class;
        }

        let candidates = self.interface_candidates(start, name, descriptor)?;
        let defaults: Vec<Arc<Method>> = self
            .maximally_specific(candidates)?
            .into_iter()
            .filter(|m| !m.is_abstract())
            .collect();
        match defaults.as_slice() {
            [one] => Ok(Arc::clone(one)),
            [] => {
                let class = self.registry.get(start)?;
                Err(GuestError::new(
                    names::ABSTRACT_METHOD,
                    format!("{}.{}{}", class.java_name(), name, descriptor),
                )
                .into())
            }
            many => {
                let listed: Vec<String> = many.iter().map(|m| m.qualified_name()).collect();
                Err(GuestError::new(
                    names::INCOMPATIBLE_CLASS_CHANGE,
                    format!("conflicting default methods: {}", listed.join(" ")),
                )
                .into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::class::{AccessFlags, ClassDef, ConstantDef, FieldDef, Flag, MethodDef};
    use crate::vm::ops::Instruction;
    use crate::vm::registry::testing::*;

    fn body(name: &str, flags: &[Flag]) -> MethodDef {
        MethodDef {
            name: name.to_string(),
            descriptor: "()I".to_string(),
            flags: AccessFlags::from(flags.to_vec()),
            max_stack: 1,
            max_locals: 1,
            code: vec![Instruction::Iconst(1), Instruction::Ireturn],
            ..Default::default()
        }
    }

    fn abstract_method(name: &str) -> MethodDef {
        MethodDef {
            name: name.to_string(),
            descriptor: "()I".to_string(),
            flags: AccessFlags::from(vec![Flag::Public, Flag::Abstract]),
            ..Default::default()
        }
    }

    fn with_methods(mut def: ClassDef, methods: Vec<MethodDef>) -> ClassDef {
        def.methods = methods;
        def
    }

    fn caller(constants: Vec<ConstantDef>) -> ClassDef {
        let mut def = class_def("demo/Caller", None, &[]);
        def.constants = constants;
        def
    }

    fn methodref(class: &str, name: &str) -> ConstantDef {
        ConstantDef::Methodref(class.to_string(), name.to_string(), "()I".to_string())
    }

    fn imethodref(class: &str, name: &str) -> ConstantDef {
        ConstantDef::InterfaceMethodref(class.to_string(), name.to_string(), "()I".to_string())
    }

    #[test]
    fn test_virtual_selection_prefers_override() {
        let reg = registry(vec![
            with_methods(class_def("demo/Base", None, &[]), vec![body("f", &[Flag::Public])]),
            with_methods(
                class_def("demo/Derived", Some("demo/Base"), &[]),
                vec![body("f", &[Flag::Public])],
            ),
            caller(vec![methodref("demo/Base", "f")]),
        ]);
        let resolver = Resolver::new(&reg);
        let calling = reg.load("demo/Caller").unwrap();
        let resolved = resolver.resolve_method(&calling, 1).unwrap();
        assert_eq!(resolved.class_name, "demo/Base");

        let derived = reg.load("demo/Derived").unwrap();
        let base = reg.lookup("demo/Base").unwrap();
        assert_eq!(
            resolver.select_virtual(derived.id, &resolved).unwrap().class_name,
            "demo/Derived"
        );
        assert_eq!(
            resolver.select_virtual(base.id, &resolved).unwrap().class_name,
            "demo/Base"
        );
    }

    #[test]
    fn test_resolution_is_cached_and_failures_are_not() {
        let reg = registry(vec![
            with_methods(class_def("demo/Base", None, &[]), vec![body("f", &[Flag::Public])]),
            caller(vec![methodref("demo/Base", "f"), methodref("demo/Base", "g")]),
        ]);
        let resolver = Resolver::new(&reg);
        let calling = reg.load("demo/Caller").unwrap();
        let a = resolver.resolve_method(&calling, 1).unwrap();
        let b = resolver.resolve_method(&calling, 1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        for _ in 0..2 {
            match resolver.resolve_method(&calling, 2) {
                Err(LinkError::Guest(e)) => {
                    assert_eq!(e.class, names::NO_SUCH_METHOD);
                    assert_eq!(e.message.as_deref(), Some("demo.Base.g()I"));
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(matches!(
            resolver.resolve_method(&calling, 9),
            Err(LinkError::Fatal(VmError::BadConstant { index: 9, .. }))
        ));
    }

    #[test]
    fn test_conflicting_defaults_raise() {
        let reg = registry(vec![
            with_methods(iface_def("demo/A", &[]), vec![body("m", &[Flag::Public])]),
            with_methods(iface_def("demo/B", &[]), vec![body("m", &[Flag::Public])]),
            class_def("demo/C", None, &["demo/A", "demo/B"]),
            caller(vec![imethodref("demo/A", "m"), methodref("demo/C", "m")]),
        ]);
        let resolver = Resolver::new(&reg);
        let calling = reg.load("demo/Caller").unwrap();
        let c = reg.load("demo/C").unwrap();

        let via_interface = resolver.resolve_method(&calling, 1).unwrap();
        match resolver.select_interface(c.id, &via_interface) {
            Err(LinkError::Guest(e)) => assert_eq!(e.class, names::INCOMPATIBLE_CLASS_CHANGE),
            other => panic!("unexpected {:?}", other),
        }

        let via_class = resolver.resolve_method(&calling, 2).unwrap();
        match resolver.select_virtual(c.id, &via_class) {
            Err(LinkError::Guest(e)) => assert_eq!(e.class, names::INCOMPATIBLE_CLASS_CHANGE),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_more_specific_default_wins() {
        let reg = registry(vec![
            with_methods(iface_def("demo/A", &[]), vec![body("m", &[Flag::Public])]),
            with_methods(iface_def("demo/B", &["demo/A"]), vec![body("m", &[Flag::Public])]),
            class_def("demo/C", None, &["demo/A", "demo/B"]),
            caller(vec![imethodref("demo/A", "m")]),
        ]);
        let resolver = Resolver::new(&reg);
        let calling = reg.load("demo/Caller").unwrap();
        let c = reg.load("demo/C").unwrap();
        let resolved = resolver.resolve_method(&calling, 1).unwrap();
        assert_eq!(
            resolver.select_interface(c.id, &resolved).unwrap().class_name,
            "demo/B"
        );
    }

    #[test]
    fn test_abstract_selection() {
        let reg = registry(vec![
            with_methods(iface_def("demo/A", &[]), vec![abstract_method("m")]),
            class_def("demo/C", None, &["demo/A"]),
            class_def("demo/Other", None, &[]),
            caller(vec![imethodref("demo/A", "m")]),
        ]);
        let resolver = Resolver::new(&reg);
        let calling = reg.load("demo/Caller").unwrap();
        let resolved = resolver.resolve_method(&calling, 1).unwrap();

        let c = reg.load("demo/C").unwrap();
        match resolver.select_interface(c.id, &resolved) {
            Err(LinkError::Guest(e)) => assert_eq!(e.class, names::ABSTRACT_METHOD),
            other => panic!("unexpected {:?}", other),
        }
        let other = reg.load("demo/Other").unwrap();
        match resolver.select_interface(other.id, &resolved) {
            Err(LinkError::Guest(e)) => assert_eq!(e.class, names::INCOMPATIBLE_CLASS_CHANGE),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_interface_reference_kind_mismatch() {
        let reg = registry(vec![
            with_methods(class_def("demo/Base", None, &[]), vec![body("f", &[Flag::Public])]),
            caller(vec![imethodref("demo/Base", "f")]),
        ]);
        let resolver = Resolver::new(&reg);
        let calling = reg.load("demo/Caller").unwrap();
        match resolver.resolve_method(&calling, 1) {
            Err(LinkError::Guest(e)) => assert_eq!(e.class, names::INCOMPATIBLE_CLASS_CHANGE),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_special_super_call() {
        let mut derived = with_methods(
            class_def("demo/Derived", Some("demo/Mid"), &[]),
            vec![body("f", &[Flag::Public])],
        );
        derived.constants = vec![methodref("demo/Base", "f")];
        let reg = registry(vec![
            with_methods(class_def("demo/Base", None, &[]), vec![body("f", &[Flag::Public])]),
            with_methods(
                class_def("demo/Mid", Some("demo/Base"), &[]),
                vec![body("f", &[Flag::Public])],
            ),
            derived,
        ]);
        let resolver = Resolver::new(&reg);
        let derived = reg.load("demo/Derived").unwrap();
        let resolved = resolver.resolve_method(&derived, 1).unwrap();
        // super.f() from Derived lands in Mid, the nearest superclass body
        assert_eq!(
            resolver.select_special(&derived, &resolved).unwrap().class_name,
            "demo/Mid"
        );
    }

    #[test]
    fn test_field_resolution_walks_supers() {
        let mut base = class_def("demo/Base", None, &[]);
        base.fields = vec![
            FieldDef {
                name: "x".to_string(),
                descriptor: "I".to_string(),
                flags: AccessFlags::default(),
            },
            FieldDef {
                name: "y".to_string(),
                descriptor: "J".to_string(),
                flags: AccessFlags::default(),
            },
        ];
        let mut derived = class_def("demo/Derived", Some("demo/Base"), &[]);
        derived.constants = vec![
            ConstantDef::Fieldref("demo/Derived".into(), "y".into(), "J".into()),
            ConstantDef::Fieldref("demo/Derived".into(), "z".into(), "J".into()),
        ];
        let reg = registry(vec![base, derived]);
        let resolver = Resolver::new(&reg);
        let derived = reg.load("demo/Derived").unwrap();
        let field = resolver.resolve_field(&derived, 1).unwrap();
        assert_eq!(field.offset, 1);
        assert_eq!(field.class, reg.lookup("demo/Base").unwrap().id);
        assert!(!field.is_static);
        match resolver.resolve_field(&derived, 2) {
            Err(LinkError::Guest(e)) => assert_eq!(e.class, names::NO_SUCH_FIELD),
            other => panic!("unexpected {:?}", other),
        }
    }
}
