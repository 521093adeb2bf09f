/*
 * Copyright (C) 2025 The Rbdvol Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Structured logging for the daemon.
//!
//! Entries are built from the vocabulary this plugin deals in: an image
//! coordinate (`pool`/`image`), the raw name a request carried, a kernel
//! device, a mountpoint, the runtime's client id, an error. Free-form fields
//! cover the rest. Each entry renders as one text line or one JSON object
//! (chosen at startup); DEBUG and INFO go to stdout, WARN and ERROR to
//! stderr.

use std::borrow::Cow;
use std::fmt;
#[cfg(not(test))]
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(test)]
use std::sync::{Mutex, OnceLock};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

static JSON_LOGS: AtomicBool = AtomicBool::new(false);

pub fn set_log_format(format: LogFormat) {
    JSON_LOGS.store(format == LogFormat::Json, Ordering::Relaxed);
}

fn json_logs() -> bool {
    JSON_LOGS.load(Ordering::Relaxed)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Stream {
    Stdout,
    Stderr,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    // A supervisor reads stderr for trouble; chatter stays on stdout.
    fn stream(self) -> Stream {
        match self {
            LogLevel::Debug | LogLevel::Info => Stream::Stdout,
            LogLevel::Warn | LogLevel::Error => Stream::Stderr,
        }
    }
}

pub fn debug(component: &'static str, message: impl Into<String>) -> Entry {
    Entry::new(LogLevel::Debug, component, message)
}

pub fn info(component: &'static str, message: impl Into<String>) -> Entry {
    Entry::new(LogLevel::Info, component, message)
}

pub fn warn(component: &'static str, message: impl Into<String>) -> Entry {
    Entry::new(LogLevel::Warn, component, message)
}

pub fn error(component: &'static str, message: impl Into<String>) -> Entry {
    Entry::new(LogLevel::Error, component, message)
}

/// One log entry under construction.
#[must_use = "an entry is only written once emit() is called"]
pub struct Entry {
    level: LogLevel,
    component: &'static str,
    message: String,
    fields: Vec<(&'static str, String)>,
}

impl Entry {
    fn new(level: LogLevel, component: &'static str, message: impl Into<String>) -> Self {
        Entry {
            level,
            component,
            message: message.into(),
            fields: Vec::new(),
        }
    }

    /// The image coordinate most entries revolve around.
    pub fn volume(self, pool: &str, image: &str) -> Self {
        self.field("pool", pool).field("image", image)
    }

    /// The volume name exactly as the runtime sent it, pre-parsing.
    pub fn name(self, name: &str) -> Self {
        self.field("name", name)
    }

    pub fn device(self, device: &str) -> Self {
        self.field("device", device)
    }

    pub fn mountpoint(self, mountpoint: &Path) -> Self {
        self.field("mountpoint", mountpoint.display().to_string())
    }

    /// The per-container id the runtime supplied on Mount/Unmount.
    pub fn client(self, client_id: &str) -> Self {
        self.field("client_id", client_id)
    }

    pub fn err<E: fmt::Display + ?Sized>(self, error: &E) -> Self {
        self.field("error", error.to_string())
    }

    pub fn field(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.fields.push((key, value.into()));
        self
    }

    pub fn emit(self) {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let line = if json_logs() {
            self.render_json(&timestamp)
        } else {
            self.render_text(&timestamp)
        };
        write_line(self.level.stream(), &line);
    }

    fn render_text(&self, timestamp: &str) -> String {
        let mut line = format!(
            "{timestamp} {:<5} {}: {}",
            self.level.as_str(),
            self.component,
            self.message
        );
        for (key, value) in &self.fields {
            line.push(' ');
            line.push_str(key);
            line.push('=');
            line.push_str(&quote(value));
        }
        line
    }

    fn render_json(&self, timestamp: &str) -> String {
        let mut payload = Map::new();
        payload.insert("ts".to_string(), Value::String(timestamp.to_string()));
        payload.insert(
            "level".to_string(),
            Value::String(self.level.as_str().to_string()),
        );
        payload.insert(
            "component".to_string(),
            Value::String(self.component.to_string()),
        );
        payload.insert("msg".to_string(), Value::String(self.message.clone()));
        for (key, value) in &self.fields {
            payload.insert((*key).to_string(), Value::String(value.clone()));
        }
        Value::Object(payload).to_string()
    }
}

/// Quotes a value whenever it would break the `key=value` layout. Empty
/// values are quoted too, so a bare `key=` never appears.
fn quote(value: &str) -> Cow<'_, str> {
    let plain = !value.is_empty()
        && !value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\\' | '='));
    if plain {
        return Cow::Borrowed(value);
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for ch in value.chars() {
        match ch {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            _ => quoted.push(ch),
        }
    }
    quoted.push('"');
    Cow::Owned(quoted)
}

#[cfg(not(test))]
fn write_line(stream: Stream, line: &str) {
    let result = match stream {
        Stream::Stdout => {
            let mut stdout = io::stdout().lock();
            writeln!(stdout, "{}", line)
        }
        Stream::Stderr => {
            let mut stderr = io::stderr().lock();
            writeln!(stderr, "{}", line)
        }
    };

    if result.is_err() {
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "rbdvol: dropped log line: {}", line);
    }
}

#[cfg(test)]
fn write_line(stream: Stream, line: &str) {
    captured().lock().unwrap().push((stream, line.to_string()));
}

#[cfg(test)]
fn captured() -> &'static Mutex<Vec<(Stream, String)>> {
    static STORE: OnceLock<Mutex<Vec<(Stream, String)>>> = OnceLock::new();
    STORE.get_or_init(|| Mutex::new(Vec::new()))
}

#[cfg(test)]
fn take_captured() -> Vec<(Stream, String)> {
    captured().lock().unwrap().drain(..).collect()
}
