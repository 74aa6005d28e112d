use std::fmt;

use parking_lot::RwLock;

use crate::error::VmError;

use super::class::ClassId;
use super::descriptor::FieldKind;
use super::value::Value;

// =============================================================================
// ObjectRef - opaque handle to a guest object
// =============================================================================

/// Handle to an object owned by a [`MemoryManager`].
///
/// The engine never looks behind a handle; every read and write goes through
/// the manager.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(u32);

impl ObjectRef {
    pub fn from_index(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({})", self.0)
    }
}

/// Allocation refused because the configured object limit was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("heap limit of {limit} objects reached")]
pub struct HeapExhausted {
    pub limit: usize,
}

// =============================================================================
// MemoryManager - the contract between the interpreter and object storage
// =============================================================================

/// Object storage used by the interpreter.
///
/// Field access is by offset into the class's instance layout; element
/// access is by index. Callers null-check and bounds-check before calling,
/// so an out-of-range offset or index here is an engine fault.
pub trait MemoryManager: Send + Sync {
    /// Allocate an instance whose fields start at their zero values.
    fn allocate_instance(
        &self,
        class: ClassId,
        layout: &[FieldKind],
    ) -> Result<ObjectRef, HeapExhausted>;

    /// Allocate an array of `length` zero-valued elements.
    fn allocate_array(
        &self,
        class: ClassId,
        kind: FieldKind,
        length: usize,
    ) -> Result<ObjectRef, HeapExhausted>;

    fn class_of(&self, obj: ObjectRef) -> Result<ClassId, VmError>;

    fn read_field(&self, obj: ObjectRef, offset: usize) -> Result<Value, VmError>;

    /// Store into a field, narrowing sub-int kinds.
    fn write_field(
        &self,
        obj: ObjectRef,
        offset: usize,
        kind: FieldKind,
        value: Value,
    ) -> Result<(), VmError>;

    fn array_length(&self, obj: ObjectRef) -> Result<usize, VmError>;

    fn array_kind(&self, obj: ObjectRef) -> Result<FieldKind, VmError>;

    fn read_element(&self, obj: ObjectRef, index: usize) -> Result<Value, VmError>;

    /// Store into an element, narrowing to the array's element kind.
    fn write_element(&self, obj: ObjectRef, index: usize, value: Value) -> Result<(), VmError>;

    /// Number of live objects.
    fn object_count(&self) -> usize;

    /// Copy out every element of an array.
    fn array_elements(&self, obj: ObjectRef) -> Result<Vec<Value>, VmError> {
        let len = self.array_length(obj)?;
        (0..len).map(|i| self.read_element(obj, i)).collect()
    }
}

// =============================================================================
// Heap - default MemoryManager
// =============================================================================

#[derive(Debug, Clone)]
pub enum HeapObject {
    Instance {
        class: ClassId,
        fields: Vec<Value>,
    },
    Array {
        class: ClassId,
        kind: FieldKind,
        elements: Vec<Value>,
    },
}

impl HeapObject {
    pub fn class(&self) -> ClassId {
        match self {
            HeapObject::Instance { class, .. } | HeapObject::Array { class, .. } => *class,
        }
    }
}

/// Arena heap: objects live in a vector and are never reclaimed.
pub struct Heap {
    objects: RwLock<Vec<HeapObject>>,
    /// Maximum number of objects (None = unlimited).
    limit: Option<usize>,
}

impl Heap {
    pub fn new() -> Self {
        Self::with_limit(None)
    }

    pub fn with_limit(limit: Option<usize>) -> Self {
        Self {
            objects: RwLock::new(Vec::new()),
            limit,
        }
    }

    fn insert(&self, object: HeapObject) -> Result<ObjectRef, HeapExhausted> {
        let mut objects = self.objects.write();
        if let Some(limit) = self.limit
            && objects.len() >= limit
        {
            return Err(HeapExhausted { limit });
        }
        let index = objects.len() as u32;
        objects.push(object);
        Ok(ObjectRef(index))
    }

    /// Run `f` on the object behind `obj`.
    fn with_object<T>(
        &self,
        obj: ObjectRef,
        f: impl FnOnce(&HeapObject) -> Result<T, VmError>,
    ) -> Result<T, VmError> {
        let objects = self.objects.read();
        let object = objects
            .get(obj.0 as usize)
            .ok_or(VmError::DanglingReference(obj.0))?;
        f(object)
    }

    fn with_object_mut<T>(
        &self,
        obj: ObjectRef,
        f: impl FnOnce(&mut HeapObject) -> Result<T, VmError>,
    ) -> Result<T, VmError> {
        let mut objects = self.objects.write();
        let object = objects
            .get_mut(obj.0 as usize)
            .ok_or(VmError::DanglingReference(obj.0))?;
        f(object)
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryManager for Heap {
    fn allocate_instance(
        &self,
        class: ClassId,
        layout: &[FieldKind],
    ) -> Result<ObjectRef, HeapExhausted> {
        let fields = layout.iter().map(|k| Value::default_for(*k)).collect();
        self.insert(HeapObject::Instance { class, fields })
    }

    fn allocate_array(
        &self,
        class: ClassId,
        kind: FieldKind,
        length: usize,
    ) -> Result<ObjectRef, HeapExhausted> {
        self.insert(HeapObject::Array {
            class,
            kind,
            elements: vec![Value::default_for(kind); length],
        })
    }

    fn class_of(&self, obj: ObjectRef) -> Result<ClassId, VmError> {
        self.with_object(obj, |o| Ok(o.class()))
    }

    fn read_field(&self, obj: ObjectRef, offset: usize) -> Result<Value, VmError> {
        self.with_object(obj, |o| match o {
            HeapObject::Instance { fields, .. } => {
                fields.get(offset).copied().ok_or(VmError::FieldOffset {
                    object: obj.0,
                    offset,
                })
            }
            HeapObject::Array { .. } => Err(VmError::NotAnInstance(obj.0)),
        })
    }

    fn write_field(
        &self,
        obj: ObjectRef,
        offset: usize,
        kind: FieldKind,
        value: Value,
    ) -> Result<(), VmError> {
        self.with_object_mut(obj, |o| match o {
            HeapObject::Instance { fields, .. } => {
                let slot = fields.get_mut(offset).ok_or(VmError::FieldOffset {
                    object: obj.0,
                    offset,
                })?;
                *slot = kind.narrow(value);
                Ok(())
            }
            HeapObject::Array { .. } => Err(VmError::NotAnInstance(obj.0)),
        })
    }

    fn array_length(&self, obj: ObjectRef) -> Result<usize, VmError> {
        self.with_object(obj, |o| match o {
            HeapObject::Array { elements, .. } => Ok(elements.len()),
            HeapObject::Instance { .. } => Err(VmError::NotAnArray(obj.0)),
        })
    }

    fn array_kind(&self, obj: ObjectRef) -> Result<FieldKind, VmError> {
        self.with_object(obj, |o| match o {
            HeapObject::Array { kind, .. } => Ok(*kind),
            HeapObject::Instance { .. } => Err(VmError::NotAnArray(obj.0)),
        })
    }

    fn read_element(&self, obj: ObjectRef, index: usize) -> Result<Value, VmError> {
        self.with_object(obj, |o| match o {
            HeapObject::Array { elements, .. } => {
                elements.get(index).copied().ok_or(VmError::ElementIndex {
                    object: obj.0,
                    index,
                })
            }
            HeapObject::Instance { .. } => Err(VmError::NotAnArray(obj.0)),
        })
    }

    fn write_element(&self, obj: ObjectRef, index: usize, value: Value) -> Result<(), VmError> {
        self.with_object_mut(obj, |o| match o {
            HeapObject::Array { kind, elements, .. } => {
                let slot = elements.get_mut(index).ok_or(VmError::ElementIndex {
                    object: obj.0,
                    index,
                })?;
                *slot = kind.narrow(value);
                Ok(())
            }
            HeapObject::Instance { .. } => Err(VmError::NotAnArray(obj.0)),
        })
    }

    fn object_count(&self) -> usize {
        self.objects.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLASS: ClassId = ClassId(3);

    #[test]
    fn test_alloc_instance_zeroes_fields() {
        let heap = Heap::new();
        let r = heap
            .allocate_instance(CLASS, &[FieldKind::Int, FieldKind::Double, FieldKind::Reference])
            .unwrap();
        assert_eq!(heap.class_of(r).unwrap(), CLASS);
        assert_eq!(heap.read_field(r, 0).unwrap(), Value::Int(0));
        assert_eq!(heap.read_field(r, 1).unwrap(), Value::Double(0.0));
        assert!(heap.read_field(r, 2).unwrap().is_null());
        assert!(matches!(
            heap.read_field(r, 3),
            Err(VmError::FieldOffset { offset: 3, .. })
        ));
    }

    #[test]
    fn test_write_field_narrows() {
        let heap = Heap::new();
        let r = heap.allocate_instance(CLASS, &[FieldKind::Byte]).unwrap();
        heap.write_field(r, 0, FieldKind::Byte, Value::Int(0x1ff))
            .unwrap();
        assert_eq!(heap.read_field(r, 0).unwrap(), Value::Int(-1));
    }

    #[test]
    fn test_arrays() {
        let heap = Heap::new();
        let a = heap.allocate_array(CLASS, FieldKind::Char, 3).unwrap();
        assert_eq!(heap.array_length(a).unwrap(), 3);
        assert_eq!(heap.array_kind(a).unwrap(), FieldKind::Char);
        heap.write_element(a, 1, Value::Int(-1)).unwrap();
        assert_eq!(heap.read_element(a, 1).unwrap(), Value::Int(0xffff));
        assert_eq!(
            heap.array_elements(a).unwrap(),
            vec![Value::Int(0), Value::Int(0xffff), Value::Int(0)]
        );
        assert!(matches!(
            heap.read_element(a, 3),
            Err(VmError::ElementIndex { index: 3, .. })
        ));
    }

    #[test]
    fn test_kind_confusion_is_an_engine_fault() {
        let heap = Heap::new();
        let obj = heap.allocate_instance(CLASS, &[]).unwrap();
        let arr = heap.allocate_array(CLASS, FieldKind::Int, 0).unwrap();
        assert!(matches!(heap.array_length(obj), Err(VmError::NotAnArray(_))));
        assert!(matches!(heap.read_field(arr, 0), Err(VmError::NotAnInstance(_))));
        assert!(matches!(
            heap.class_of(ObjectRef::from_index(99)),
            Err(VmError::DanglingReference(99))
        ));
    }

    #[test]
    fn test_heap_limit() {
        let heap = Heap::with_limit(Some(2));
        heap.allocate_instance(CLASS, &[]).unwrap();
        heap.allocate_array(CLASS, FieldKind::Int, 4).unwrap();
        assert_eq!(
            heap.allocate_instance(CLASS, &[]),
            Err(HeapExhausted { limit: 2 })
        );
        assert_eq!(heap.object_count(), 2);
    }
}
