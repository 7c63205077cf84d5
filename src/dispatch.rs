//! Delivery policies for message interface callbacks.
//!
//! A [`Dispatcher`] decides on which execution context listener callbacks
//! run. [`Inline`] runs them on the background task that produced the event;
//! [`QueuedDispatcher`] queues them for a host loop (a UI thread, the main
//! task of a CLI) to drain.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use tokio::{sync::Notify, time};

/// A unit of callback work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Policy deciding where callback jobs run.
pub trait Dispatcher: Send + Sync {
   /// Hands a job to the delivery context.
   fn dispatch(&self, job: Job);
}

/// Type alias for a shared dispatcher.
pub type DispatcherRef = Arc<dyn Dispatcher>;

/// Runs jobs immediately on the calling task.
#[derive(Debug, Default, Clone, Copy)]
pub struct Inline;

impl Dispatcher for Inline {
   fn dispatch(&self, job: Job) {
      job();
   }
}

/// Queues jobs until the owner drains them.
pub struct QueuedDispatcher {
   queue: SegQueue<Job>,
   notifier: Notify,
}

impl QueuedDispatcher {
   pub fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   /// Number of queued jobs.
   pub fn len(&self) -> usize {
      self.queue.len()
   }

   pub fn is_empty(&self) -> bool {
      self.queue.is_empty()
   }

   /// Runs every job queued so far and returns how many ran.
   pub fn run_pending(&self) -> usize {
      let mut ran = 0;
      while let Some(job) = self.queue.pop() {
         job();
         ran += 1;
      }
      ran
   }

   /// Waits for the next job.
   ///
   /// Returns `None` once every other handle to the dispatcher is gone and the
   /// queue is drained.
   pub async fn recv(self: &Arc<Self>) -> Option<Job> {
      loop {
         if let Some(job) = self.queue.pop() {
            return Some(job);
         }
         let notify = self.notifier.notified();
         if let Some(job) = self.queue.pop() {
            return Some(job);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   /// Runs jobs as they arrive until the dispatcher is orphaned.
   pub async fn run(self: Arc<Self>) {
      while let Some(job) = self.recv().await {
         job();
      }
   }
}

impl Dispatcher for QueuedDispatcher {
   fn dispatch(&self, job: Job) {
      self.queue.push(job);
      self.notifier.notify_waiters();
   }
}
