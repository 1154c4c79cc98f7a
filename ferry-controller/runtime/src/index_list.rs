use kubert::index::IndexNamespacedResource;
use parking_lot::RwLock;
use std::sync::Arc;

/// Fans a single watch out to several indexes. Updates reach indexes in the
/// order they were added.
pub(crate) struct IndexList<A, T = A> {
    index: Arc<RwLock<A>>,
    tail: Option<T>,
}

impl<A, T, R> IndexNamespacedResource<R> for IndexList<A, T>
where
    A: IndexNamespacedResource<R>,
    T: IndexNamespacedResource<R>,
    R: Clone,
{
    fn apply(&mut self, resource: R) {
        if let Some(tail) = &mut self.tail {
            tail.apply(resource.clone());
        }
        self.index.write().apply(resource);
    }

    fn delete(&mut self, namespace: String, name: String) {
        if let Some(tail) = &mut self.tail {
            tail.delete(namespace.clone(), name.clone());
        }
        self.index.write().delete(namespace, name);
    }
}

impl<A> IndexList<A> {
    pub(crate) fn new(index: Arc<RwLock<A>>) -> Self {
        Self { index, tail: None }
    }
}

impl<A, T> IndexList<A, T> {
    pub(crate) fn push<B>(self, index: Arc<RwLock<B>>) -> IndexList<B, IndexList<A, T>> {
        IndexList {
            index,
            tail: Some(self),
        }
    }

    pub(crate) fn shared(self) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(self))
    }
}
