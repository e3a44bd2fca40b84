//! # Attributes
//!
//! Units may expose typed values for introspection. A value is identified by an
//! [`AttributeDescriptor<T>`], a (type, name) pair. Reads go through a
//! [`Reference`](crate::Reference) and always run on the general scheduler; the
//! caller gets an [`AttributeFuture`] back immediately.

use std::any::{Any, TypeId};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::AttributeError;
use crate::scheduler::wait_for_reply;

/// A type-erased attribute value as produced by a unit accessor.
pub type AttributeValue = Box<dyn Any + Send>;

/// Typed key for one attribute.
pub struct AttributeDescriptor<T> {
    name: Cow<'static, str>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> AttributeDescriptor<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            _marker: PhantomData,
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> AttributeKey {
        AttributeKey {
            name: self.name.clone(),
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Boxes a value for this attribute.
    pub fn value(&self, value: T) -> AttributeValue
    where
        T: Send,
    {
        Box::new(value)
    }
}

impl<T> Clone for AttributeDescriptor<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for AttributeDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeDescriptor")
            .field("name", &self.name)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> PartialEq for AttributeDescriptor<T> {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl<T> Eq for AttributeDescriptor<T> {}

/// Type-erased form of an [`AttributeDescriptor`]. Equal when both the value type
/// and the name are equal.
#[derive(Clone)]
pub struct AttributeKey {
    name: Cow<'static, str>,
    type_id: TypeId,
    type_name: &'static str,
}

impl AttributeKey {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn matches<T: 'static>(&self, descriptor: &AttributeDescriptor<T>) -> bool {
        self.type_id == TypeId::of::<T>() && self.name == descriptor.name
    }
}

impl PartialEq for AttributeKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.name == other.name
    }
}

impl Eq for AttributeKey {}

impl Hash for AttributeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        self.name.hash(state);
    }
}

impl fmt::Debug for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.type_name)
    }
}

impl<T: 'static> From<&AttributeDescriptor<T>> for AttributeKey {
    fn from(descriptor: &AttributeDescriptor<T>) -> Self {
        descriptor.key()
    }
}

/// Result of a bulk attribute read.
#[derive(Default)]
pub struct AttributeMap {
    values: HashMap<AttributeKey, AttributeValue>,
}

impl AttributeMap {
    pub fn get<T: Clone + 'static>(&self, descriptor: &AttributeDescriptor<T>) -> Option<T> {
        self.values
            .get(&descriptor.key())
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    pub fn contains<T: 'static>(&self, descriptor: &AttributeDescriptor<T>) -> bool {
        self.values.contains_key(&descriptor.key())
    }

    pub fn keys(&self) -> impl Iterator<Item = &AttributeKey> {
        self.values.keys()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<HashMap<AttributeKey, AttributeValue>> for AttributeMap {
    fn from(values: HashMap<AttributeKey, AttributeValue>) -> Self {
        Self { values }
    }
}

impl fmt::Debug for AttributeMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

/// Pending result of an attribute read.
///
/// `.await` it from async code or call [`wait`](Self::wait) from synchronous code,
/// unit hooks included.
/// Resolves to [`AttributeError::Unavailable`] when the read can no longer run,
/// for example because the unit is gone or the scheduler was shut down.
pub struct AttributeFuture<T> {
    name: String,
    rx: oneshot::Receiver<Result<T, AttributeError>>,
}

impl<T> AttributeFuture<T> {
    pub(crate) fn channel(
        name: impl Into<String>,
    ) -> (oneshot::Sender<Result<T, AttributeError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                name: name.into(),
                rx,
            },
        )
    }

    /// Already-resolved failure.
    pub(crate) fn unavailable(name: impl Into<String>) -> Self {
        let name = name.into();
        let (tx, future) = Self::channel(name.clone());
        let _ = tx.send(Err(AttributeError::Unavailable { name }));
        future
    }

    /// Blocks the current thread until the read completes.
    ///
    /// Works on plain threads and on pool threads, so a unit may read a peer's
    /// attribute from inside `on_message`. Inside a current-thread runtime use
    /// `.await` instead.
    pub fn wait(self) -> Result<T, AttributeError> {
        let name = self.name;
        wait_for_reply(self.rx).unwrap_or(Err(AttributeError::Unavailable { name }))
    }
}

impl<T> Future for AttributeFuture<T> {
    type Output = Result<T, AttributeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(AttributeError::Unavailable {
                name: self.name.clone(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> fmt::Debug for AttributeFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeFuture")
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COUNT: AttributeDescriptor<i64> = AttributeDescriptor::new("count");

    #[test]
    fn keys_compare_by_type_and_name() {
        let as_text: AttributeDescriptor<String> = AttributeDescriptor::new("count");
        assert_eq!(COUNT.key(), AttributeDescriptor::<i64>::named("count").key());
        assert_ne!(COUNT.key(), as_text.key());
        assert!(COUNT.key().matches(&COUNT));
        assert!(!as_text.key().matches(&COUNT));
    }

    #[test]
    fn map_downcasts_by_descriptor() {
        let mut values = HashMap::new();
        values.insert(COUNT.key(), COUNT.value(7));
        let map = AttributeMap::from(values);

        assert_eq!(map.get(&COUNT), Some(7));
        assert!(map.contains(&COUNT));
        assert_eq!(map.get(&AttributeDescriptor::<i64>::new("other")), None);
    }

    #[tokio::test]
    async fn dropped_sender_resolves_unavailable() {
        let (tx, future) = AttributeFuture::<i64>::channel("count");
        drop(tx);
        assert_eq!(
            future.await,
            Err(AttributeError::Unavailable {
                name: "count".into()
            })
        );
    }
}
