//! # Lock-free SPMC work pipe with writer-side stealing
//!
//! A fixed-capacity, bounded **single-producer / multi-consumer** pipe for
//! handing small work items from one writer thread to many consumer
//! threads without kernel-mediated synchronization.
//!
//! The writer pushes at the head and, unlike a plain SPMC queue, may
//! *steal its own work back* from the head, reclaiming the most recently
//! pushed item no consumer has claimed yet. Consumers take items from the
//! tail. This shape suits task schedulers: the scheduling thread can
//! recover pending work on shutdown or run its freshest task itself
//! instead of waiting for a consumer.
//!
//! # Features
//!
//! * **Lock-free** bounded SPMC pipe with per-slot claim CAS
//! * **Writer-side front pop** (steal-own-work) alongside consumer tail steals
//! * **Explicit memory orderings** on every atomic, no blanket `SeqCst`
//! * **Cache-friendly** layout (`CachePadded` slots and counters)
//! * Zero allocations after construction, no blocking anywhere
//! * Compile-time power-of-two capacity
//!
//! # Non-blocking behavior
//!
//! Every operation either succeeds or returns immediately: `push` hands
//! the value back when the ring has lapped the slowest consumer, `steal`
//! and `pop` return `None` on an empty (or fully claimed) pipe. Callers
//! choose their own retry policy: spin, yield, or back off. A failed
//! operation is indistinguishable from a race lost to another consumer,
//! and both are answered the same way, by polling again.
//!
//! # Ordering
//!
//! Per slot, a published value is handed to exactly one taker; the claim
//! CAS is the serialization point and the ownership handoff. Across slots
//! there is **no total order**: concurrent stealers may deliver a
//! later-published item before an earlier one whose slot is momentarily
//! claimed. What the pipe guarantees is conservation: the multiset
//! delivered equals the multiset pushed, less the writer's own front pops
//! and whatever is still in the pipe.
//!
//! # Quick example
//!
//! ```
//! use task_pipe::pipe;
//!
//! let (worker, stealer) = pipe::<u64, 512>();
//!
//! worker.push(1).unwrap();
//! worker.push(2).unwrap();
//!
//! // The worker takes back its freshest item from the head...
//! assert_eq!(worker.pop(), Some(2));
//! // ...while stealers drain from the tail.
//! assert_eq!(stealer.steal(), Some(1));
//! ```

mod pipe;
mod utils;

pub use pipe::{Stealer, Worker, pipe};
#[cfg(unix)]
pub use utils::mono_time_ns;
pub use utils::Samples;
