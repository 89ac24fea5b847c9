//! Delivery rendering
//!
//! Text lines for humans, one JSON object per line for tools.

use crate::delivery::Delivery;
use clap::ValueEnum;
use serde_json::{json, Value};
use std::io::{self, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writes one line per delivery
pub struct DeliveryPrinter<W: Write> {
    out: W,
    format: OutputFormat,
}

impl<W: Write> DeliveryPrinter<W> {
    pub fn new(out: W, format: OutputFormat) -> Self {
        Self { out, format }
    }

    pub fn print(&mut self, delivery: &Delivery) -> io::Result<()> {
        match self.format {
            OutputFormat::Text => writeln!(self.out, "{}", render_text(delivery)),
            OutputFormat::Json => writeln!(self.out, "{}", render_json(delivery)),
        }
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

pub fn render_text(delivery: &Delivery) -> String {
    match delivery {
        Delivery::Event(event) => {
            let mut line = format!(
                "{} {:>8}",
                event.captured_at.format("%H:%M:%S%.6f"),
                event.sequence
            );
            for field in &event.fields {
                line.push_str(&format!(" {}={}", field.name, field.value));
            }
            line
        }
        Delivery::Malformed { sequence, error } => {
            format!("{:>24} !! malformed: {}", sequence, error)
        }
        Delivery::Gap { lost, origin } => {
            format!("{:>24} !! {} records lost ({:?})", "-", lost, origin)
        }
    }
}

pub fn render_json(delivery: &Delivery) -> Value {
    match delivery {
        Delivery::Event(event) => {
            let fields: serde_json::Map<String, Value> = event
                .fields
                .iter()
                .map(|field| (field.name.clone(), json!(field.value)))
                .collect();
            json!({
                "kind": "event",
                "sequence": event.sequence,
                "captured_at": event.captured_at.to_rfc3339(),
                "fields": fields,
            })
        }
        Delivery::Malformed { sequence, error } => json!({
            "kind": "malformed",
            "sequence": sequence,
            "error": error.to_string(),
        }),
        Delivery::Gap { lost, origin } => json!({
            "kind": "gap",
            "lost": lost,
            "origin": origin,
        }),
    }
}
