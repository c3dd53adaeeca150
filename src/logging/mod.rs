//! Batching log shipment to the common-logging collector.
//!
//! Records flow `Logger::log` → [`transformer`] → [`batch_queue`] → subscriber
//! task → [`transport`]. Shutdown paths call `Logger::flush_immediate` to push
//! out whatever is still buffered.

pub mod batch_queue;
pub mod forward;
pub mod logger;
pub mod memory_queue;
pub mod mutex;
pub mod transformer;
pub mod transport;

pub use batch_queue::{BatchQueue, BatchQueueConfig, FlushOptions};
pub use forward::{ForwardLayer, spawn_forwarder};
pub use logger::Logger;
pub use transformer::{LogOptions, Transformer, TransformerConfig};
pub use transport::{HttpTransport, HttpTransportConfig, StdoutTransport, Transport};
