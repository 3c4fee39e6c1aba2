//! The request/response pipeline: one dispatcher draining the request
//! queue, one writer draining the response queue. FIFO queues plus the
//! single dispatcher give every client responses in request order.

pub mod dispatcher;
pub mod writer;

pub use dispatcher::{Dispatcher, RequestQueueItem};
pub use writer::ResponseWriter;
