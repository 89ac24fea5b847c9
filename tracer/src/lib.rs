//! Kprobe Tracer Userspace Library
//!
//! Provides reusable components for attaching kprobes and delivering their
//! events: probe descriptors, the event channel, attachment management,
//! record decoding and the delivery loop.

pub mod attach;
pub mod channel;
pub mod collector;
pub mod config;
pub mod decoder;
pub mod delivery;
pub mod descriptor;
pub mod events;
pub mod exporter;
pub mod loader;
pub mod output;
pub mod types;

pub use attach::{AttachError, AttachmentHandle, AttachmentManager, ChannelConfig, KernelLinker};
pub use channel::{ChannelError, EventChannel, RawRecord};
pub use collector::StatsCollector;
pub use decoder::{decode, DecodeError, DecodedEvent, FieldValue};
pub use delivery::{Delivery, DeliveryConfig, DeliveryLoop, FatalError, LoopState, LossOrigin};
pub use descriptor::{FieldSpec, FieldType, ProbeDescriptor, RecordSchema};
pub use events::FeedPump;
pub use exporter::{ExporterType, JsonExporter, PrometheusExporter, StatsExporter};
pub use loader::AyaLinker;
pub use types::*;
