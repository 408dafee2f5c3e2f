//! JSON control envelope: `{"type": string, "data": object}`.
//!
//! Envelopes travel as text messages next to binary frames. Parsing keeps the
//! type as a string; turning it into something typed is the router's job, so
//! that unknown types survive long enough to be logged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A control envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default = "empty_object")]
	pub data: Value,
}

fn empty_object() -> Value {
	Value::Object(Map::new())
}

impl Envelope {
	/// Builds an envelope from any serializable payload.
	pub fn new<D: Serialize>(kind: impl Into<String>, data: D) -> serde_json::Result<Self> {
		Ok(Self {
			kind: kind.into(),
			data: serde_json::to_value(data)?,
		})
	}

	/// Terminal resize notice.
	pub fn resize(cols: u16, rows: u16) -> Self {
		let mut data = Map::new();
		data.insert("cols".into(), cols.into());
		data.insert("rows".into(), rows.into());
		Self {
			kind: "resize".into(),
			data: Value::Object(data),
		}
	}

	/// Disconnect notice sent before a client-initiated close.
	pub fn disconnect(reason: &str) -> Self {
		let mut data = Map::new();
		data.insert("reason".into(), reason.into());
		Self {
			kind: "disconnect".into(),
			data: Value::Object(data),
		}
	}

	pub fn parse(text: &str) -> serde_json::Result<Self> {
		serde_json::from_str(text)
	}

	pub fn to_json(&self) -> serde_json::Result<String> {
		serde_json::to_string(self)
	}
}
