//! Application layer of the server engine.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the domain
//! (pure rules, here in `ws-core`) and the infrastructure (sockets, tasks,
//! timers).  Code here decides *what* happens in response to an event and
//! contains no network I/O.
//!
//! # Sub-modules
//!
//! - **`dispatcher`** – Holds the host's callbacks and routes connection
//!   events (open, message, close) to them, applying the close-notification
//!   policy.

pub mod dispatcher;
