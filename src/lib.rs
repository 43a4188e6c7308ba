//! # cxcapture
//!
//! A raw sample capture and streaming stack for CX2388x family PCI ADC
//! hardware, built for RF archival workflows where every sample counts
//! and sustained multi-MB/s throughput must not stutter.
//!
//! ## Crate Structure
//!
//! - **`ring`**: the magic-wrap SPSC ring buffer, with its backing pages
//!   mapped twice so reads and writes cross the wrap without branching.
//! - **`device`**: the DMA ring engine (register programming, RISC
//!   program synthesis, interrupt/DPC pipeline), plus a behavioural chip
//!   simulation that executes the synthesized program in-process.
//! - **`reader`**: the reader pipeline: per-handle stream cursors over
//!   the DMA ring, capture lifecycle tied to reader count, and the
//!   control-code surface.
//! - **`server`**: the HTTP capture server: producer threads draining
//!   sources into magic rings, streaming endpoints, and the CAS-guarded
//!   capture state machine.
//! - **`store`**: per-device persistent tuning values.
//! - **`leveladj`**: input level calibration over the control surface.
//! - **`config`** / **`logging`** / **`error`**: settings, tracing setup
//!   and the shared error type.

pub mod config;
pub mod device;
pub mod error;
pub mod leveladj;
pub mod logging;
pub mod reader;
pub mod ring;
pub mod server;
pub mod store;

pub use config::Settings;
pub use error::{CxError, Result};
pub use ring::MagicRingBuffer;
