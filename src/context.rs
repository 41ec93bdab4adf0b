// Copyright 2020 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Serial execution contexts.
//!
//! The coordinator owns three of these: one serializing every mutation of
//! outbound state, one serializing all inbound session work and one that
//! delivers host-visible notifications. Work submitted to a context runs in
//! submission order; a submitted future must complete before the next one is
//! polled, so state owned by a context needs no further locking.

use std::{future::Future, pin::Pin};

use tokio::sync::{mpsc, oneshot};

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send>>;

enum Command {
    Task(BoxedTask),
    Shutdown,
}

/// Marker error for work submitted after `close()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ContextClosed;

/// A handle to a task queue that executes submitted futures one at a time.
#[derive(Clone, Debug)]
pub(crate) struct SerialContext {
    sender: mpsc::UnboundedSender<Command>,
}

impl SerialContext {
    /// Spawn a new context with the given name on the current tokio runtime.
    pub fn new(name: &'static str) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(command) = receiver.recv().await {
                match command {
                    Command::Task(task) => task.await,
                    Command::Shutdown => break,
                }
            }
            tracing::trace!(context = name, "Serial context terminated");
        });

        Self { sender }
    }

    /// Run a future on this context and hand its output back.
    pub async fn run<F, T>(&self, future: F) -> Result<T, ContextClosed>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        let task = Box::pin(async move {
            let _ = sender.send(future.await);
        });

        self.sender
            .send(Command::Task(task))
            .map_err(|_| ContextClosed)?;

        receiver.await.map_err(|_| ContextClosed)
    }

    /// Submit a future without waiting for it to finish.
    pub fn post<F>(&self, future: F) -> Result<(), ContextClosed>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.sender
            .send(Command::Task(Box::pin(future)))
            .map_err(|_| ContextClosed)
    }

    /// Stop the context once all previously submitted work has run.
    ///
    /// Work submitted after this point is rejected.
    pub fn close(&self) {
        let _ = self.sender.send(Command::Shutdown);
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::SerialContext;

    #[tokio::test]
    async fn tasks_run_in_submission_order() {
        let context = SerialContext::new("test");
        let counter = Arc::new(AtomicUsize::new(0));

        let mut results = Vec::new();

        for i in 0..32usize {
            let counter = counter.clone();
            results.push(context.run(async move {
                let seen = counter.fetch_add(1, Ordering::SeqCst);
                (i, seen)
            }));
        }

        for (i, result) in results.into_iter().enumerate() {
            let (submitted, observed) = result.await.unwrap();
            assert_eq!(submitted, i);
            assert_eq!(observed, i);
        }
    }

    #[tokio::test]
    async fn closed_context_rejects_work() {
        let context = SerialContext::new("test");

        context.run(async {}).await.unwrap();
        context.close();

        // Give the drainer a chance to observe the shutdown.
        tokio::task::yield_now().await;

        assert!(context.run(async {}).await.is_err());
    }
}
