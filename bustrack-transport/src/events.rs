use anyhow::{anyhow, bail};
use bustrack_logic::{LocationRecord, prelude::*};
use serde::Deserialize;
use serde_json::{Map, Value};

/// A single dispatched event from a `text/event-stream` body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEvent {
    pub event: String,
    pub data: String,
}

/// Incrementally splits an event stream into [ServerEvent]s. Chunks can end anywhere, even in
/// the middle of a UTF-8 sequence.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl EventStreamDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ServerEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut dispatched = Vec::new();

        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line = self.buffer.drain(..=end).collect::<Vec<_>>();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.feed_line(&line) {
                dispatched.push(event);
            }
        }

        dispatched
    }

    fn feed_line(&mut self, line: &str) -> Option<ServerEvent> {
        if line.is_empty() {
            return self.dispatch();
        }

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = line
            .split_once(':')
            .map(|(field, value)| (field, value.strip_prefix(' ').unwrap_or(value)))
            .unwrap_or((line, ""));

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }

        None
    }

    fn dispatch(&mut self) -> Option<ServerEvent> {
        let event = self.event.take();
        if self.data.is_empty() && event.is_none() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(ServerEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

#[derive(Deserialize)]
struct PathPayload {
    path: String,
    data: Value,
}

/// Events the realtime database sends to a REST listener
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseEvent {
    /// Replace whatever is at `path` (relative to the listened key)
    Put { path: String, data: Value },
    /// Merge the children in `data` into `path`
    Patch { path: String, data: Value },
    KeepAlive,
    /// The database stopped this listener, usually security rules
    Cancel(String),
    /// The auth token expired or was revoked
    AuthRevoked(String),
}

impl TryFrom<ServerEvent> for DatabaseEvent {
    type Error = anyhow::Error;

    fn try_from(value: ServerEvent) -> Result<Self, Self::Error> {
        let parse_payload = |data: &str| {
            serde_json::from_str::<PathPayload>(data)
                .with_context(|| format!("Malformed {} payload", value.event))
        };

        match value.event.as_str() {
            "put" => {
                let PathPayload { path, data } = parse_payload(&value.data)?;
                Ok(Self::Put { path, data })
            }
            "patch" => {
                let PathPayload { path, data } = parse_payload(&value.data)?;
                Ok(Self::Patch { path, data })
            }
            "keep-alive" => Ok(Self::KeepAlive),
            "cancel" => Ok(Self::Cancel(describe(&value.data))),
            "auth_revoked" => Ok(Self::AuthRevoked(describe(&value.data))),
            other => bail!("Unknown database event \"{other}\""),
        }
    }
}

/// Cancel reasons come through as JSON strings or null
fn describe(data: &str) -> String {
    match serde_json::from_str::<Value>(data) {
        Ok(Value::String(why)) => why,
        Ok(Value::Null) => "No reason given".to_string(),
        _ => data.trim().to_string(),
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Drop null children and collapse empty objects to null, the database never stores either
fn normalize(value: &mut Value) {
    if let Value::Object(map) = value {
        for child in map.values_mut() {
            normalize(child);
        }
        map.retain(|_, child| !child.is_null());
        if map.is_empty() {
            *value = Value::Null;
        }
    }
}

/// Local mirror of the data under a listened key, kept up to date from [DatabaseEvent]s
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot(Value);

impl Snapshot {
    #[cfg(test)]
    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn put(&mut self, path: &str, data: Value) {
        let segments = segments(path);

        let Some((last, parents)) = segments.split_last() else {
            self.0 = data;
            normalize(&mut self.0);
            return;
        };

        let mut node = &mut self.0;
        for segment in parents {
            node = object_mut(node)
                .entry(segment.to_string())
                .or_insert(Value::Null);
        }
        object_mut(node).insert(last.to_string(), data);

        normalize(&mut self.0);
    }

    pub fn patch(&mut self, path: &str, data: Value) -> Result {
        let Value::Object(children) = data else {
            return Err(anyhow!("Patch data must be an object"));
        };

        let base = segments(path).join("/");
        for (child, value) in children {
            self.put(&format!("{base}/{child}"), value);
        }

        Ok(())
    }

    /// The snapshot as a location, `None` when nothing is stored
    pub fn record(&self) -> Result<Option<LocationRecord>> {
        if self.0.is_null() {
            return Ok(None);
        }
        serde_json::from_value(self.0.clone())
            .map(Some)
            .context("Stored value is not a location record")
    }
}

fn object_mut(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}
