//! Prometheus metrics for the store layer.
//!
//! # Example
//!
//! ```ignore
//! use dispatchq::metrics::{init_metrics, export_metrics};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! // ... run store operations ...
//! println!("{}", export_metrics());
//! ```

pub mod prometheus;

pub use self::prometheus::{
    export_metrics, init_metrics, record_connection, record_link_state, record_lock,
    record_reconnect_attempt,
};
