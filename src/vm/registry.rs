//! Class registry: lazy loading, linking and the subtype relation.
//!
//! Classes live in an arena indexed by [`ClassId`]; nothing is ever
//! unloaded, so ids and method slots stay valid for the life of the VM.
//! Loading is serialized by one re-entrant lock. Superclasses and
//! interfaces are loaded recursively under it, and a name that shows up
//! again while its own load is in progress is a circularity.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, ReentrantMutex, RwLock};

use crate::error::VmError;

use super::bootstrap::{BootstrapLoader, names};
use super::class::{
    AccessFlags, ArrayComponent, Class, ClassDef, ClassId, ConstantPool, FieldInfo, InitBarrier,
    Method,
};
use super::descriptor::{FieldKind, FieldType};
use super::exception::GuestError;
use super::value::Value;
use super::verifier::Verifier;

/// Source of class definitions, consulted by name on first use.
pub trait ClassLoader: Send + Sync {
    fn find_class(&self, name: &str) -> Option<ClassDef>;
}

pub struct ClassRegistry {
    /// Consulted in order; the bootstrap loader always comes first.
    loaders: Vec<Box<dyn ClassLoader>>,
    verify: bool,
    classes: RwLock<Vec<Arc<Class>>>,
    by_name: RwLock<HashMap<String, ClassId>>,
    /// Names whose load is in progress on the thread holding the lock.
    loading: ReentrantMutex<RefCell<HashSet<String>>>,
}

fn dotted(name: &str) -> String {
    name.replace('/', ".")
}

impl ClassRegistry {
    /// A registry serving only the bootstrap classes.
    pub fn new(verify: bool) -> Self {
        Self {
            loaders: vec![Box::new(BootstrapLoader::new())],
            verify,
            classes: RwLock::new(Vec::new()),
            by_name: RwLock::new(HashMap::new()),
            loading: ReentrantMutex::new(RefCell::new(HashSet::new())),
        }
    }

    /// Append a loader, consulted after every loader already present.
    pub fn with_loader(mut self, loader: Box<dyn ClassLoader>) -> Self {
        self.loaders.push(loader);
        self
    }

    pub fn get(&self, id: ClassId) -> Result<Arc<Class>, VmError> {
        self.classes
            .read()
            .get(id.index())
            .cloned()
            .ok_or(VmError::UnknownClass(id.0))
    }

    /// An already loaded class. Never triggers loading.
    pub fn lookup(&self, name: &str) -> Option<Arc<Class>> {
        let id = *self.by_name.read().get(name)?;
        self.classes.read().get(id.index()).cloned()
    }

    pub fn len(&self) -> usize {
        self.classes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every loaded class, in load order.
    pub fn classes(&self) -> Vec<Arc<Class>> {
        self.classes.read().clone()
    }

    /// Load and link `name` (an internal name or an array descriptor).
    pub fn load(&self, name: &str) -> Result<Arc<Class>, GuestError> {
        if let Some(class) = self.lookup(name) {
            return Ok(class);
        }

        let guard = self.loading.lock();
        // Another thread may have finished it while we waited.
        if let Some(class) = self.lookup(name) {
            return Ok(class);
        }
        if !guard.borrow_mut().insert(name.to_string()) {
            return Err(GuestError::new(names::CLASS_CIRCULARITY, dotted(name)));
        }

        let result = if name.starts_with('[') {
            self.define_array(name)
        } else {
            match self.loaders.iter().find_map(|l| l.find_class(name)) {
                Some(def) => self.define(def),
                None => Err(GuestError::new(names::NO_CLASS_DEF_FOUND, dotted(name))),
            }
        };

        guard.borrow_mut().remove(name);
        result
    }

    /// Array class with the given component type.
    pub fn array_of(&self, component: &FieldType) -> Result<Arc<Class>, GuestError> {
        self.load(&format!("[{}", component))
    }

    fn define(&self, def: ClassDef) -> Result<Arc<Class>, GuestError> {
        if self.verify {
            Verifier::new()
                .verify_class(&def)
                .map_err(|e| GuestError::new(names::VERIFY, e.to_string()))?;
        }

        let super_class = match (&def.super_class, def.name.as_str()) {
            (_, names::OBJECT) => None,
            (Some(name), _) => Some(self.load(name)?),
            (None, _) => Some(self.load(names::OBJECT)?),
        };
        if let Some(sup) = &super_class
            && sup.is_interface()
        {
            return Err(GuestError::new(
                names::INCOMPATIBLE_CLASS_CHANGE,
                format!(
                    "class {} has interface {} as super class",
                    dotted(&def.name),
                    sup.java_name()
                ),
            ));
        }

        let mut interfaces = Vec::with_capacity(def.interfaces.len());
        for name in &def.interfaces {
            let iface = self.load(name)?;
            if !iface.is_interface() {
                return Err(GuestError::new(
                    names::INCOMPATIBLE_CLASS_CHANGE,
                    format!(
                        "class {} can not implement {}, because it is not an interface",
                        dotted(&def.name),
                        iface.java_name()
                    ),
                ));
            }
            interfaces.push(iface.id);
        }

        let format_error = |message: String| GuestError::new(names::CLASS_FORMAT, message);

        let mut layout: Vec<FieldKind> = super_class
            .as_ref()
            .map(|s| s.layout.clone())
            .unwrap_or_default();
        let mut statics = Vec::new();
        let mut fields = Vec::with_capacity(def.fields.len());
        for field in def.fields {
            let kind = FieldType::parse(&field.descriptor)
                .map_err(|e| format_error(format!("{}.{}: {}", def.name, field.name, e)))?
                .kind();
            let offset = if field.flags.contains(AccessFlags::STATIC) {
                statics.push(Value::default_for(kind));
                statics.len() - 1
            } else {
                layout.push(kind);
                layout.len() - 1
            };
            fields.push(FieldInfo {
                name: field.name,
                descriptor: field.descriptor,
                kind,
                flags: field.flags,
                offset,
            });
        }

        // Loads are serialized, so the next arena index is ours.
        let id = ClassId(self.classes.read().len() as u32);
        let mut methods = Vec::with_capacity(def.methods.len());
        for (slot, method) in def.methods.into_iter().enumerate() {
            let name = method.name.clone();
            let method = Method::new(id, &def.name, slot, method)
                .map_err(|e| format_error(format!("{}.{}: {}", def.name, name, e)))?;
            methods.push(Arc::new(method));
        }

        let class = Class {
            id,
            name: def.name,
            flags: def.flags,
            super_class: super_class.map(|s| s.id),
            interfaces,
            source_file: def.source_file,
            methods,
            fields,
            layout,
            statics: Mutex::new(statics),
            constants: ConstantPool::new(def.constants),
            bootstrap_methods: def.bootstrap_methods,
            component: None,
            init: InitBarrier::new(),
            mirror: OnceLock::new(),
        };
        Ok(self.insert(class))
    }

    fn define_array(&self, name: &str) -> Result<Arc<Class>, GuestError> {
        let not_found = || GuestError::new(names::NO_CLASS_DEF_FOUND, dotted(name));
        let Ok(FieldType::Array(component)) = FieldType::parse(name) else {
            return Err(not_found());
        };
        let component_class = match component.class_name() {
            Some(component_name) => Some(self.load(&component_name)?.id),
            None => None,
        };

        let object = self.load(names::OBJECT)?;
        let cloneable = self.load(names::CLONEABLE)?;
        let serializable = self.load(names::SERIALIZABLE)?;

        let id = ClassId(self.classes.read().len() as u32);
        let class = Class {
            id,
            name: name.to_string(),
            flags: AccessFlags(AccessFlags::PUBLIC | AccessFlags::FINAL | AccessFlags::ABSTRACT),
            super_class: Some(object.id),
            interfaces: vec![cloneable.id, serializable.id],
            source_file: None,
            methods: Vec::new(),
            fields: Vec::new(),
            layout: Vec::new(),
            statics: Mutex::new(Vec::new()),
            constants: ConstantPool::default(),
            bootstrap_methods: Vec::new(),
            component: Some(ArrayComponent {
                ty: *component,
                class: component_class,
            }),
            init: InitBarrier::new(),
            mirror: OnceLock::new(),
        };
        Ok(self.insert(class))
    }

    fn insert(&self, class: Class) -> Arc<Class> {
        let class = Arc::new(class);
        tracing::debug!(class = %class.name, id = class.id.0, "loaded class");
        self.by_name.write().insert(class.name.clone(), class.id);
        self.classes.write().push(Arc::clone(&class));
        class
    }

    /// Whether `class` is `ancestor` or one of its subclasses, following
    /// superclasses only.
    pub fn is_subclass(&self, class: ClassId, ancestor: ClassId) -> Result<bool, VmError> {
        let mut current = Some(class);
        while let Some(id) = current {
            if id == ancestor {
                return Ok(true);
            }
            current = self.get(id)?.super_class;
        }
        Ok(false)
    }

    /// Every interface `class` implements, directly or through superclasses
    /// and superinterfaces. Each appears once, nearest first.
    pub fn all_interfaces(&self, class: ClassId) -> Result<Vec<ClassId>, VmError> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut pending: Vec<ClassId> = Vec::new();

        let mut current = Some(class);
        while let Some(id) = current {
            let c = self.get(id)?;
            pending.extend(c.interfaces.iter().rev());
            while let Some(iface) = pending.pop() {
                if seen.insert(iface) {
                    out.push(iface);
                    pending.extend(self.get(iface)?.interfaces.iter().rev());
                }
            }
            current = c.super_class;
        }
        Ok(out)
    }

    /// The subtype relation used by `checkcast`, `instanceof`, `aastore`
    /// and handler matching.
    pub fn is_assignable(&self, from: ClassId, to: ClassId) -> Result<bool, VmError> {
        if from == to {
            return Ok(true);
        }
        let source = self.get(from)?;
        let target = self.get(to)?;

        if let (Some(sc), Some(tc)) = (&source.component, &target.component) {
            return match (sc.class, tc.class) {
                (Some(s), Some(t)) => self.is_assignable(s, t),
                _ => Ok(sc.ty == tc.ty),
            };
        }
        if target.is_interface() {
            return Ok(self.all_interfaces(from)?.contains(&to));
        }
        if source.is_interface() {
            // Interfaces are only assignable to Object among classes.
            return Ok(target.name == names::OBJECT);
        }
        self.is_subclass(from, to)
    }

    /// Assignability by target name. A target that was never loaded cannot
    /// have instances, so nothing is assignable to it.
    pub fn is_assignable_to_name(&self, from: ClassId, to: &str) -> Result<bool, VmError> {
        match self.lookup(to) {
            Some(target) => self.is_assignable(from, target.id),
            None => Ok(false),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::vm::class::{FieldDef, Flag, MethodDef};
    use crate::vm::ops::Instruction;

    #[test]
    fn test_layout_includes_superclass_fields() {
        let mut base = class_def("demo/Base", None, &[]);
        base.fields = vec![
            FieldDef {
                name: "x".to_string(),
                descriptor: "I".to_string(),
                flags: AccessFlags::default(),
            },
            FieldDef {
                name: "count".to_string(),
                descriptor: "J".to_string(),
                flags: AccessFlags::from(vec![Flag::Static]),
            },
        ];
        let mut derived = class_def("demo/Derived", Some("demo/Base"), &[]);
        derived.fields = vec![FieldDef {
            name: "y".to_string(),
            descriptor: "D".to_string(),
            flags: AccessFlags::default(),
        }];
        let reg = registry(vec![base, derived]);

        let derived = reg.load("demo/Derived").unwrap();
        assert_eq!(derived.layout, vec![FieldKind::Int, FieldKind::Double]);
        assert_eq!(derived.declared_field("y", "D").unwrap().offset, 1);

        let base = reg.lookup("demo/Base").unwrap();
        assert_eq!(base.declared_field("count", "J").unwrap().offset, 0);
        assert_eq!(*base.statics.lock(), vec![Value::Long(0)]);
        assert_eq!(derived.super_class, Some(base.id));
    }

    #[test]
    fn test_missing_class() {
        let reg = registry(vec![class_def("demo/A", Some("demo/Missing"), &[])]);
        let err = reg.load("demo/A").unwrap_err();
        assert_eq!(err.class, names::NO_CLASS_DEF_FOUND);
        assert_eq!(err.message.as_deref(), Some("demo.Missing"));
        assert!(reg.lookup("demo/A").is_none());
    }

    #[test]
    fn test_circularity() {
        let reg = registry(vec![
            class_def("demo/A", Some("demo/B"), &[]),
            class_def("demo/B", Some("demo/A"), &[]),
        ]);
        assert_eq!(
            reg.load("demo/A").unwrap_err().class,
            names::CLASS_CIRCULARITY
        );
    }

    #[test]
    fn test_interface_as_super_class() {
        let reg = registry(vec![
            iface_def("demo/I", &[]),
            class_def("demo/A", Some("demo/I"), &[]),
            class_def("demo/B", None, &["demo/A"]),
        ]);
        assert_eq!(
            reg.load("demo/A").unwrap_err().class,
            names::INCOMPATIBLE_CLASS_CHANGE
        );
        assert_eq!(
            reg.load("demo/B").unwrap_err().class,
            names::INCOMPATIBLE_CLASS_CHANGE
        );
    }

    #[test]
    fn test_verification_rejects_bad_code() {
        let mut def = class_def("demo/Bad", None, &[]);
        def.methods = vec![MethodDef {
            name: "f".to_string(),
            descriptor: "()V".to_string(),
            flags: AccessFlags::from(vec![Flag::Static]),
            code: vec![Instruction::Pop, Instruction::Return],
            ..Default::default()
        }];
        let reg = registry(vec![def.clone()]);
        assert_eq!(reg.load("demo/Bad").unwrap_err().class, names::VERIFY);

        let lenient = ClassRegistry::new(false).with_loader(Box::new(MapLoader::new(vec![def])));
        assert!(lenient.load("demo/Bad").is_ok());
    }

    #[test]
    fn test_assignability() {
        let reg = registry(vec![
            iface_def("demo/Shape", &[]),
            iface_def("demo/Solid", &["demo/Shape"]),
            class_def("demo/Base", None, &["demo/Solid"]),
            class_def("demo/Derived", Some("demo/Base"), &[]),
        ]);
        let derived = reg.load("demo/Derived").unwrap().id;
        let base = reg.lookup("demo/Base").unwrap().id;
        let shape = reg.lookup("demo/Shape").unwrap().id;
        let object = reg.lookup(names::OBJECT).unwrap().id;

        assert!(reg.is_assignable(derived, base).unwrap());
        assert!(reg.is_assignable(derived, shape).unwrap());
        assert!(reg.is_assignable(derived, object).unwrap());
        assert!(!reg.is_assignable(base, derived).unwrap());
        assert!(reg.is_assignable(shape, object).unwrap());
        assert!(!reg.is_assignable_to_name(derived, "demo/NeverLoaded").unwrap());
    }

    #[test]
    fn test_array_classes() {
        let reg = registry(vec![
            class_def("demo/Base", None, &[]),
            class_def("demo/Derived", Some("demo/Base"), &[]),
        ]);
        let derived_array = reg.load("[Ldemo/Derived;").unwrap();
        let base_array = reg.load("[Ldemo/Base;").unwrap();
        let int_array = reg.array_of(&FieldType::Int).unwrap();
        let object = reg.lookup(names::OBJECT).unwrap();
        let cloneable = reg.lookup(names::CLONEABLE).unwrap();

        assert_eq!(int_array.name, "[I");
        assert!(int_array.is_array());
        assert_eq!(
            derived_array.component.as_ref().unwrap().class,
            reg.lookup("demo/Derived").map(|c| c.id)
        );

        assert!(reg.is_assignable(derived_array.id, base_array.id).unwrap());
        assert!(!reg.is_assignable(base_array.id, derived_array.id).unwrap());
        assert!(reg.is_assignable(int_array.id, object.id).unwrap());
        assert!(reg.is_assignable(int_array.id, cloneable.id).unwrap());
        assert!(!reg.is_assignable(int_array.id, base_array.id).unwrap());

        let long_array = reg.load("[J").unwrap();
        assert!(!reg.is_assignable(int_array.id, long_array.id).unwrap());
        assert!(reg.load("[Q").is_err());
    }

    #[test]
    fn test_all_interfaces_is_transitive() {
        let reg = registry(vec![
            iface_def("demo/A", &[]),
            iface_def("demo/B", &["demo/A"]),
            class_def("demo/Base", None, &["demo/B"]),
            class_def("demo/Derived", Some("demo/Base"), &["demo/A"]),
        ]);
        let derived = reg.load("demo/Derived").unwrap().id;
        let a = reg.lookup("demo/A").unwrap().id;
        let b = reg.lookup("demo/B").unwrap().id;
        let all = reg.all_interfaces(derived).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains(&a) && all.contains(&b));
    }

    #[test]
    fn test_concurrent_loads_yield_one_class() {
        let reg = Arc::new(registry(vec![class_def("demo/A", None, &[])]));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || reg.load("demo/A").unwrap().id)
            })
            .collect();
        let ids: HashSet<ClassId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ids.len(), 1);
    }
}
