use crate::{DeferredResult, Operation};

/// Anything that accepts operations and hands back their results.
///
/// Implemented by [`Lane`](crate::Lane), which executes immediately, and by
/// [`ThrottledDispatcher`](crate::ThrottledDispatcher), which queues and
/// paces. The [`RepeatScheduler`](crate::RepeatScheduler) works on top of
/// either.
pub trait Requester: Send + Sync {
    /// Submit a single operation.
    ///
    /// Returns `None` if the operation was rejected at submission time. The
    /// reason has then been logged or delivered to the operation's callback.
    fn request(&self, operation: Operation) -> Option<DeferredResult>;

    /// Submit every operation in order, returning their results in the same
    /// order. Rejected operations yield `None` at their position.
    fn request_all(&self, operations: &[Operation]) -> Vec<Option<DeferredResult>> {
        operations
            .iter()
            .map(|operation| self.request(operation.clone()))
            .collect()
    }
}

impl<R: Requester + ?Sized> Requester for std::sync::Arc<R> {
    fn request(&self, operation: Operation) -> Option<DeferredResult> {
        (**self).request(operation)
    }

    fn request_all(&self, operations: &[Operation]) -> Vec<Option<DeferredResult>> {
        (**self).request_all(operations)
    }
}
