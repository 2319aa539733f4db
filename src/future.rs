use crate::device::error::DeviceLost;
use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};
use parking_lot::Mutex;
use std::{fmt::{self, Debug}, sync::Arc};

pub trait BlockableFuture: Future {
    fn block(self) -> Self::Output;
}

impl<T> BlockableFuture for T
where
    T: Future,
{
    fn block(self) -> Self::Output {
        blocker::block(self)
    }
}

#[derive(Default)]
struct CompletionState {
    result: Option<Result<(), DeviceLost>>,
    waker: Option<Waker>,
}

/** Resolves when a submission completed.

Resolves to [`DeviceLost`] if the submission failed to execute or was dropped by its queue.
*/
pub struct Completion {
    state: Arc<Mutex<CompletionState>>,
}

impl Completion {
    pub(crate) fn new(device: usize) -> (Self, CompletionSignal) {
        let state = Arc::new(Mutex::new(CompletionState::default()));
        let signal = CompletionSignal {
            state: Some(state.clone()),
            device,
        };
        (Self { state }, signal)
    }
    /// Whether the submission completed.
    pub fn is_complete(&self) -> bool {
        self.state.lock().result.is_some()
    }
}

impl Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Completion")
            .field("result", &state.result)
            .finish()
    }
}

impl Future for Completion {
    type Output = Result<(), DeviceLost>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let mut state = self.state.lock();
        if let Some(result) = state.result.as_ref() {
            Poll::Ready(result.clone())
        } else {
            state.waker.replace(cx.waker().clone());
            Poll::Pending
        }
    }
}

/// Completes a [`Completion`].
pub(crate) struct CompletionSignal {
    state: Option<Arc<Mutex<CompletionState>>>,
    device: usize,
}

impl CompletionSignal {
    pub(crate) fn complete(mut self, result: Result<(), DeviceLost>) {
        self.resolve(result);
    }
    fn resolve(&mut self, result: Result<(), DeviceLost>) {
        if let Some(state) = self.state.take() {
            let waker = {
                let mut state = state.lock();
                state.result.replace(result);
                state.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }
}

impl Drop for CompletionSignal {
    fn drop(&mut self) {
        let device = self.device;
        self.resolve(Err(DeviceLost {
            device,
            reason: "submission dropped".to_string(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn completion_from_thread() {
        let (completion, signal) = Completion::new(0);
        assert!(!completion.is_complete());
        let handle = thread::spawn(move || signal.complete(Ok(())));
        completion.block().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn dropped_signal_is_lost() {
        let (completion, signal) = Completion::new(3);
        drop(signal);
        assert!(completion.is_complete());
        let lost = completion.block().unwrap_err();
        assert_eq!(lost.device(), 3);
    }

    #[test]
    fn completion_debug() {
        let (completion, signal) = Completion::new(1);
        assert_eq!(format!("{completion:?}"), "Completion { result: None }");
        signal.complete(Ok(()));
        assert_eq!(format!("{completion:?}"), "Completion { result: Some(Ok(())) }");
    }
}
