//! Tool-call accumulator.
//!
//! Vendors that stream tool calls send the arguments as partial JSON text
//! keyed by a call index. Each index owns one [`CallSlot`], which moves
//! `Idle -> Accumulating -> Complete` through [`CallSlot::apply`]. Vendors
//! that deliver calls whole skip straight to `Complete`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::llm::StreamEvent;
use super::message::ToolCall;

/// Host hook invoked on every tool-call status transition.
pub type ToolEventCallback = Arc<dyn Fn(&ToolCall) + Send + Sync>;

/// State of one streamed call index.
#[derive(Debug, Clone, Default)]
pub enum CallSlot {
    #[default]
    Idle,
    Accumulating { call: ToolCall, buffer: String },
    Complete(ToolCall),
}

/// Input to a slot transition.
#[derive(Debug)]
pub enum SlotInput {
    /// One fragment. `id`/`name` are set on the first fragment only for most
    /// vendors; `arguments` is partial JSON text.
    Fragment {
        id: String,
        name: Option<String>,
        arguments: Option<String>,
    },
    /// The vendor closed the block.
    Close,
}

/// What a transition did, so the owner can report it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotChange {
    Created,
    Updated,
    Closed,
    Ignored,
}

impl CallSlot {
    /// Explicit transition function.
    pub fn apply(self, input: SlotInput) -> (CallSlot, SlotChange) {
        match (self, input) {
            (CallSlot::Idle, SlotInput::Fragment { id, name, arguments }) => {
                let call = ToolCall::pending(id, name.unwrap_or_default());
                let buffer = arguments.unwrap_or_default();
                (CallSlot::Accumulating { call, buffer }, SlotChange::Created)
            }
            (CallSlot::Accumulating { mut call, mut buffer }, SlotInput::Fragment { name, arguments, .. }) => {
                if call.name.is_empty() {
                    if let Some(name) = name {
                        call.name = name;
                    }
                }
                if let Some(fragment) = arguments {
                    buffer.push_str(&fragment);
                }
                (CallSlot::Accumulating { call, buffer }, SlotChange::Updated)
            }
            (CallSlot::Accumulating { mut call, buffer }, SlotInput::Close) => {
                call.args = parse_arguments(&call.name, &buffer);
                call.raw_args = buffer;
                (CallSlot::Complete(call), SlotChange::Closed)
            }
            // Closing a text block, or fragments after the close.
            (slot, _) => (slot, SlotChange::Ignored),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, CallSlot::Complete(_))
    }
}

/// Parse the final buffer. Anything that is not a JSON object becomes `{}`.
fn parse_arguments(name: &str, buffer: &str) -> Value {
    if buffer.trim().is_empty() {
        return Value::Object(Map::new());
    }
    match serde_json::from_str::<Value>(buffer) {
        Ok(value @ Value::Object(_)) => value,
        Ok(other) => {
            warn!("Arguments for {} are not an object ({}); using {{}}", name, other);
            Value::Object(Map::new())
        }
        Err(e) => {
            warn!("Arguments for {} are not valid JSON ({}); using {{}}", name, e);
            Value::Object(Map::new())
        }
    }
}

/// Reassembles one round's tool calls from decoded stream events.
#[derive(Default)]
pub struct ToolCallAccumulator {
    /// Slots in declaration order.
    slots: Vec<CallSlot>,
    /// Vendor call index -> position in `slots`.
    by_index: HashMap<usize, usize>,
    used_ids: HashSet<String>,
    on_event: Option<ToolEventCallback>,
}

impl ToolCallAccumulator {
    pub fn new(on_event: Option<ToolEventCallback>) -> Self {
        Self {
            on_event,
            ..Self::default()
        }
    }

    /// Feed one decoded event. Text deltas are ignored.
    pub fn observe(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => self.fragment(*index, id.clone(), name.clone(), arguments.clone()),
            StreamEvent::ToolCallEnd { index } => self.close(*index),
            StreamEvent::ToolCallComplete { id, name, arguments } => {
                self.complete_atomic(id.clone(), name.clone(), arguments.clone());
            }
            // A terminal reason code closes everything still open.
            StreamEvent::Finish { .. } => self.close_all(),
            StreamEvent::TextDelta(_) => {}
        }
    }

    fn fragment(&mut self, index: usize, id: Option<String>, name: Option<String>, arguments: Option<String>) {
        let pos = match self.by_index.get(&index) {
            Some(pos) => *pos,
            None => {
                self.slots.push(CallSlot::Idle);
                let pos = self.slots.len() - 1;
                self.by_index.insert(index, pos);
                pos
            }
        };
        let id = if matches!(self.slots[pos], CallSlot::Idle) {
            self.unique_id(id)
        } else {
            String::new()
        };
        self.transition(pos, SlotInput::Fragment { id, name, arguments });
    }

    fn close(&mut self, index: usize) {
        if let Some(pos) = self.by_index.get(&index).copied() {
            self.transition(pos, SlotInput::Close);
        }
    }

    /// Close every accumulating slot (end of stream or terminal reason).
    pub fn close_all(&mut self) {
        for pos in 0..self.slots.len() {
            if matches!(self.slots[pos], CallSlot::Accumulating { .. }) {
                self.transition(pos, SlotInput::Close);
            }
        }
    }

    /// Register a call delivered whole.
    pub fn complete_atomic(&mut self, id: Option<String>, name: String, arguments: Value) {
        let mut call = ToolCall::pending(self.unique_id(id), name);
        call.raw_args = arguments.to_string();
        call.args = match arguments {
            Value::Object(_) => arguments,
            _ => Value::Object(Map::new()),
        };
        debug!("Tool call {} ({}) delivered complete", call.id, call.name);
        self.notify(&call);
        self.slots.push(CallSlot::Complete(call));
    }

    fn transition(&mut self, pos: usize, input: SlotInput) {
        let slot = std::mem::take(&mut self.slots[pos]);
        let (slot, change) = slot.apply(input);
        match (&slot, change) {
            (CallSlot::Accumulating { call, .. }, SlotChange::Created) => {
                debug!("Tool call {} ({}) started streaming", call.id, call.name);
                self.notify(call);
            }
            (CallSlot::Complete(call), SlotChange::Closed) => {
                debug!("Tool call {} ({}) closed: {}", call.id, call.name, call.raw_args);
            }
            _ => {}
        }
        self.slots[pos] = slot;
    }

    fn notify(&self, call: &ToolCall) {
        if let Some(cb) = &self.on_event {
            cb(call);
        }
    }

    /// Keep the vendor id when it is fresh, otherwise mint one.
    fn unique_id(&mut self, id: Option<String>) -> String {
        let id = match id.filter(|id| !id.is_empty() && !self.used_ids.contains(id)) {
            Some(id) => id,
            None => {
                let mut n = self.used_ids.len();
                while self.used_ids.contains(&format!("call_{}", n)) {
                    n += 1;
                }
                format!("call_{}", n)
            }
        };
        self.used_ids.insert(id.clone());
        id
    }

    /// Fail every call still streaming, e.g. when the round is cut short.
    pub fn abandon_open(&mut self, reason: &str) -> Vec<ToolCall> {
        let mut abandoned = Vec::new();
        for slot in self.slots.iter_mut() {
            if !matches!(slot, CallSlot::Accumulating { .. }) {
                continue;
            }
            if let CallSlot::Accumulating { mut call, buffer } = std::mem::take(slot) {
                call.raw_args = buffer;
                call.fail(reason, None);
                if let Some(cb) = &self.on_event {
                    cb(&call);
                }
                abandoned.push(call);
            }
        }
        abandoned
    }

    /// Completed calls in declaration order.
    pub fn into_completed(self) -> Vec<ToolCall> {
        self.slots
            .into_iter()
            .filter_map(|slot| match slot {
                CallSlot::Complete(call) => Some(call),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::llm::openai;
    use crate::agent::message::ToolStatus;
    use bytes::Bytes;
    use futures_util::stream::{self, StreamExt};
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn delta(index: usize, id: Option<&str>, name: Option<&str>, args: Option<&str>) -> StreamEvent {
        StreamEvent::ToolCallDelta {
            index,
            id: id.map(str::to_string),
            name: name.map(str::to_string),
            arguments: args.map(str::to_string),
        }
    }

    fn accumulate(events: &[StreamEvent]) -> Vec<ToolCall> {
        let mut acc = ToolCallAccumulator::new(None);
        for e in events {
            acc.observe(e);
        }
        acc.close_all();
        acc.into_completed()
    }

    #[test]
    fn test_slot_transitions() {
        let (slot, change) = CallSlot::Idle.apply(SlotInput::Close);
        assert_eq!(change, SlotChange::Ignored);

        let (slot, change) = slot.apply(SlotInput::Fragment {
            id: "a".to_string(),
            name: Some("read_file".to_string()),
            arguments: Some("{\"pa".to_string()),
        });
        assert_eq!(change, SlotChange::Created);

        let (slot, change) = slot.apply(SlotInput::Fragment {
            id: String::new(),
            name: None,
            arguments: Some("th\":\"x\"}".to_string()),
        });
        assert_eq!(change, SlotChange::Updated);

        let (slot, change) = slot.apply(SlotInput::Close);
        assert_eq!(change, SlotChange::Closed);
        let CallSlot::Complete(call) = &slot else {
            panic!("expected complete slot");
        };
        assert_eq!(call.args, json!({"path": "x"}));

        let (slot, change) = slot.apply(SlotInput::Fragment {
            id: String::new(),
            name: None,
            arguments: Some("late".to_string()),
        });
        assert_eq!(change, SlotChange::Ignored);
        assert!(slot.is_complete());
    }

    #[test]
    fn test_interleaved_indices_keep_separate_buffers() {
        let calls = accumulate(&[
            delta(0, Some("a"), Some("read_file"), Some("{\"path\":")),
            delta(1, Some("b"), Some("list_files"), Some("{\"dir\":")),
            delta(0, None, None, Some("\"x.md\"}")),
            delta(1, None, None, Some("\"notes\"}")),
            StreamEvent::Finish { reason: Some("tool_calls".to_string()) },
        ]);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].args, json!({"path": "x.md"}));
        assert_eq!(calls[1].args, json!({"dir": "notes"}));
    }

    #[test]
    fn test_bad_json_falls_back_to_empty_object() {
        let calls = accumulate(&[
            delta(0, Some("a"), Some("read_file"), Some("{\"path\": \"x")),
            StreamEvent::ToolCallEnd { index: 0 },
        ]);
        assert_eq!(calls[0].args, json!({}));
        assert_eq!(calls[0].raw_args, "{\"path\": \"x");
        assert_eq!(calls[0].status, ToolStatus::Pending);
    }

    #[test]
    fn test_ids_unique_within_round() {
        let calls = accumulate(&[
            delta(0, None, Some("read_file"), Some("{}")),
            delta(1, Some("dup"), Some("read_file"), Some("{}")),
            delta(2, Some("dup"), Some("read_file"), Some("{}")),
            StreamEvent::ToolCallComplete {
                id: None,
                name: "list_files".to_string(),
                arguments: json!({}),
            },
        ]);
        let ids: HashSet<_> = calls.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids.len(), 4);
        assert_eq!(calls[1].id, "dup");
    }

    #[test]
    fn test_callback_fires_on_creation() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: ToolEventCallback = Arc::new(move |call: &ToolCall| {
            sink.lock().unwrap().push((call.name.clone(), call.status));
        });
        let mut acc = ToolCallAccumulator::new(Some(cb));
        acc.observe(&delta(0, Some("a"), Some("read_file"), Some("{")));
        acc.observe(&delta(0, None, None, Some("}")));
        acc.observe(&StreamEvent::ToolCallComplete {
            id: Some("b".to_string()),
            name: "list_files".to_string(),
            arguments: json!({}),
        });
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("read_file".to_string(), ToolStatus::Pending),
                ("list_files".to_string(), ToolStatus::Pending),
            ]
        );
    }

    #[test]
    fn test_abandon_open_keeps_closed_calls() {
        let mut acc = ToolCallAccumulator::new(None);
        acc.observe(&delta(0, Some("a"), Some("read_file"), Some("{\"path\":\"a.md\"}")));
        acc.observe(&StreamEvent::ToolCallEnd { index: 0 });
        acc.observe(&delta(1, Some("b"), Some("read_file"), Some("{\"pa")));
        let abandoned = acc.abandon_open("round timed out");
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].status, ToolStatus::Error);
        let calls = acc.into_completed();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "a");
    }

    fn pieces(text: &str, cuts: &[usize]) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let mut bounds: Vec<usize> = cuts.iter().map(|c| c % (chars.len() + 1)).collect();
        bounds.push(0);
        bounds.push(chars.len());
        bounds.sort_unstable();
        bounds.dedup();
        bounds
            .windows(2)
            .map(|w| chars[w[0]..w[1]].iter().collect())
            .collect()
    }

    proptest! {
        #[test]
        fn prop_fragmentation_invariance(
            path in "[a-zA-Z0-9 _./é-]{0,24}",
            limit in 0u32..1000,
            cuts in proptest::collection::vec(0usize..200, 0..12),
        ) {
            let args = json!({"path": path, "limit": limit, "nested": {"tags": ["a", "b"]}}).to_string();

            let whole = accumulate(&[delta(0, Some("c"), Some("read_file"), Some(&args))]);

            let mut events = vec![delta(0, Some("c"), Some("read_file"), None)];
            for piece in pieces(&args, &cuts) {
                events.push(delta(0, None, None, Some(&piece)));
            }
            let split = accumulate(&events);

            prop_assert_eq!(&whole[0].args, &split[0].args);
            prop_assert_eq!(&split[0].raw_args, &args);
        }

        #[test]
        fn prop_wire_rechunking_invariance(
            cuts in proptest::collection::vec(0usize..400, 0..16),
        ) {
            let args = r#"{"path":"notes/weekly review.md","lines":[1,2,3]}"#;
            let mut wire = String::new();
            for (i, piece) in pieces(args, &[7, 19, 33]).iter().enumerate() {
                let tool_call = if i == 0 {
                    json!({"index": 0, "id": "call_x", "type": "function", "function": {"name": "read_file", "arguments": piece}})
                } else {
                    json!({"index": 0, "function": {"arguments": piece}})
                };
                let chunk = json!({"choices": [{"index": 0, "delta": {"tool_calls": [tool_call]}}]});
                wire.push_str(&format!("data: {}\n\n", chunk));
            }
            wire.push_str("data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n");
            wire.push_str("data: [DONE]\n\n");

            let bytes = wire.into_bytes();
            let mut bounds: Vec<usize> = cuts.iter().map(|c| c % (bytes.len() + 1)).collect();
            bounds.push(0);
            bounds.push(bytes.len());
            bounds.sort_unstable();
            bounds.dedup();
            let chunks: Vec<Result<Bytes, std::io::Error>> = bounds
                .windows(2)
                .map(|w| Ok(Bytes::copy_from_slice(&bytes[w[0]..w[1]])))
                .collect();

            let events: Vec<StreamEvent> = tokio_test::block_on(async {
                openai::decode_stream(stream::iter(chunks), false)
                    .filter_map(|e| async move { e.ok() })
                    .collect()
                    .await
            });
            let calls = accumulate(&events);
            prop_assert_eq!(calls.len(), 1);
            prop_assert_eq!(calls[0].id.as_str(), "call_x");
            prop_assert_eq!(&calls[0].args, &json!({"path": "notes/weekly review.md", "lines": [1, 2, 3]}));
        }
    }
}
