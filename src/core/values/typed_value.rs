use std::any::{Any, TypeId};
use std::fmt;

use crate::core::errors::ContextError;

/// Object-safe view of a payload that can copy itself.
trait ValueData: Any + Send + Sync {
    fn clone_box(&self) -> Box<dyn ValueData>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Any + Send + Sync + Clone> ValueData for T {
    fn clone_box(&self) -> Box<dyn ValueData> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Type-erased but type-safe container for cached, ported and modal values.
///
/// The framework never looks inside a `TypedValue`; it only clones it and
/// checks its concrete type when a caller extracts it.
pub struct TypedValue {
    data: Box<dyn ValueData>,
    type_name: &'static str,
    type_id: TypeId,
}

impl TypedValue {
    /// Create a new typed value
    pub fn new<T: Send + Sync + Clone + 'static>(value: T) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            data: Box::new(value),
        }
    }

    /// Get a reference to the contained value
    pub fn get<T: 'static>(&self) -> Result<&T, ContextError> {
        self.data
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| self.mismatch::<T>())
    }

    /// Get a mutable reference to the contained value
    pub fn get_mut<T: 'static>(&mut self) -> Result<&mut T, ContextError> {
        let found = self.type_name;
        self.data
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or(ContextError::TypeMismatch {
                expected: std::any::type_name::<T>(),
                found,
            })
    }

    /// Consume the typed value and return the contained value
    pub fn into_inner<T: 'static>(self) -> Result<T, ContextError> {
        if !self.is_type::<T>() {
            return Err(self.mismatch::<T>());
        }
        let found = self.type_name;
        self.data
            .into_any()
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| ContextError::TypeMismatch {
                expected: std::any::type_name::<T>(),
                found,
            })
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Check if the contained value is of type T
    pub fn is_type<T: 'static>(&self) -> bool {
        TypeId::of::<T>() == self.type_id
    }

    fn mismatch<T: 'static>(&self) -> ContextError {
        ContextError::TypeMismatch {
            expected: std::any::type_name::<T>(),
            found: self.type_name,
        }
    }
}

impl Clone for TypedValue {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone_box(),
            type_name: self.type_name,
            type_id: self.type_id,
        }
    }
}

impl fmt::Debug for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedValue")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_checks_type() {
        let value = TypedValue::new(42i32);
        assert_eq!(*value.get::<i32>().unwrap(), 42);
        assert!(value.is_type::<i32>());

        let err = value.get::<f64>().unwrap_err();
        assert_eq!(
            err,
            ContextError::TypeMismatch {
                expected: "f64",
                found: "i32",
            }
        );
    }

    #[test]
    fn test_clone_is_deep() {
        let mut original = TypedValue::new(vec![1, 2, 3]);
        let copy = original.clone();
        original.get_mut::<Vec<i32>>().unwrap().push(4);

        assert_eq!(copy.get::<Vec<i32>>().unwrap(), &vec![1, 2, 3]);
        assert_eq!(original.into_inner::<Vec<i32>>().unwrap(), vec![1, 2, 3, 4]);
    }
}
