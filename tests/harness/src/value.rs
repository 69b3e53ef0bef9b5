//! Values and the object heap.

use rustc_hash::FxHashMap;
use serde_json::{Value as Json, json};
use tripwire_engine::{FunctionId, ObjectRef};

/// A JavaScript value, reduced to what the tests need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Value {
    /// `undefined`
    #[default]
    Undefined,
    /// A boolean.
    Bool(bool),
    /// A small integer.
    Smi(i32),
    /// A heap object.
    Object(ObjectRef),
}

impl Value {
    /// The object this value refers to, if any.
    #[must_use]
    pub const fn as_object(self) -> Option<ObjectRef> {
        match self {
            Self::Object(object) => Some(object),
            _ => None,
        }
    }

    /// JavaScript truthiness.
    #[must_use]
    pub const fn is_truthy(self) -> bool {
        match self {
            Self::Undefined => false,
            Self::Bool(b) => b,
            Self::Smi(n) => n != 0,
            Self::Object(_) => true,
        }
    }

    /// The value as reported by the evaluator.
    #[must_use]
    pub fn to_json(self) -> Json {
        match self {
            Self::Undefined => Json::Null,
            Self::Bool(b) => Json::Bool(b),
            Self::Smi(n) => json!(n),
            Self::Object(object) => json!({ "objectId": object.address() }),
        }
    }

    pub(crate) fn relocate(&mut self, moved: &FxHashMap<ObjectRef, ObjectRef>) {
        if let Self::Object(object) = self
            && let Some(to) = moved.get(&*object)
        {
            *object = *to;
        }
    }
}

/// Saved state of a suspended generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GeneratorState {
    pub(crate) function: FunctionId,
    pub(crate) closure: ObjectRef,
    pub(crate) registers: Vec<Value>,
    pub(crate) resume_offset: u32,
    pub(crate) done: bool,
}

/// A heap object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HeapObject {
    Plain(FxHashMap<String, Value>),
    Closure {
        function: FunctionId,
        context: Option<ObjectRef>,
    },
    Context(Vec<Value>),
    Generator(GeneratorState),
    Promise {
        silent: bool,
        has_reject_handler: bool,
        marked: bool,
    },
}

impl HeapObject {
    fn relocate(&mut self, moved: &FxHashMap<ObjectRef, ObjectRef>) {
        let relocate_ref = |object: &mut ObjectRef| {
            if let Some(to) = moved.get(&*object) {
                *object = *to;
            }
        };
        match self {
            Self::Plain(properties) => properties.values_mut().for_each(|v| v.relocate(moved)),
            Self::Closure { context, .. } => {
                if let Some(context) = context {
                    relocate_ref(context);
                }
            }
            Self::Context(slots) => slots.iter_mut().for_each(|v| v.relocate(moved)),
            Self::Generator(state) => {
                relocate_ref(&mut state.closure);
                state.registers.iter_mut().for_each(|v| v.relocate(moved));
            }
            Self::Promise { .. } => {}
        }
    }
}

/// The object heap. Addresses are 8 byte aligned and never reused.
#[derive(Debug)]
pub(crate) struct Heap {
    objects: FxHashMap<ObjectRef, HeapObject>,
    next_address: u64,
}

impl Default for Heap {
    fn default() -> Self {
        Self {
            objects: FxHashMap::default(),
            next_address: 8,
        }
    }
}

impl Heap {
    fn next_ref(&mut self) -> ObjectRef {
        let Some(object) = ObjectRef::new(self.next_address) else {
            unreachable!("addresses start above zero");
        };
        self.next_address += 8;
        object
    }

    pub(crate) fn allocate(&mut self, object: HeapObject) -> ObjectRef {
        let reference = self.next_ref();
        self.objects.insert(reference, object);
        reference
    }

    pub(crate) fn get(&self, object: ObjectRef) -> Option<&HeapObject> {
        self.objects.get(&object)
    }

    pub(crate) fn get_mut(&mut self, object: ObjectRef) -> Option<&mut HeapObject> {
        self.objects.get_mut(&object)
    }

    /// Moves every object to a fresh address, returning the old-to-new mapping.
    pub(crate) fn compact(&mut self) -> FxHashMap<ObjectRef, ObjectRef> {
        let mut old: Vec<_> = self.objects.keys().copied().collect();
        old.sort_unstable();
        let moved: FxHashMap<_, _> = old.into_iter().map(|from| (from, self.next_ref())).collect();
        let objects = std::mem::take(&mut self.objects);
        self.objects = objects
            .into_iter()
            .map(|(from, mut object)| {
                object.relocate(&moved);
                (moved[&from], object)
            })
            .collect();
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compaction_rewrites_interior_references() {
        let mut heap = Heap::default();
        let inner = heap.allocate(HeapObject::Plain(FxHashMap::default()));
        let mut properties = FxHashMap::default();
        properties.insert("inner".to_owned(), Value::Object(inner));
        let outer = heap.allocate(HeapObject::Plain(properties));

        let moved = heap.compact();
        assert!(heap.get(outer).is_none());
        let Some(HeapObject::Plain(properties)) = heap.get(moved[&outer]) else {
            panic!("outer object lost");
        };
        assert_eq!(properties["inner"], Value::Object(moved[&inner]));
    }
}
