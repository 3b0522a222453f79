//! Streaming JSON input
//!
//! [`stream_objects`] reads a sequence of top-level JSON values from a byte slice and
//! hands every object to a callback as soon as its closing brace is read, children
//! before parents, together with the chain of containers still being read around it.
//! Objects the callback consumes are dropped instead of being attached to their parent,
//! so a FeatureCollection never holds more than the feature being read.
//!
//! Nesting depth is unlimited: the stack grows on demand while reading.

use crate::attribute::check_utf8;
use serde::de::{self, DeserializeSeed, MapAccess, SeqAccess, Visitor};
use serde_json::{Deserializer, Map, Number, Value};
use std::cell::Cell;
use std::fmt;
use std::io::{self, Read};
use std::ops::Range;
use std::str::FromStr;

/// Key under which serde_json hands an arbitrary-precision number to a visitor
const NUMBER_TOKEN: &str = "$serde_json::private::Number";

/// A JSON container whose members are still being read
#[derive(Debug, Clone, PartialEq)]
pub enum Container {
    Object {
        /// Members read so far, without consumed objects
        members: Map<String, Value>,
        /// Key of the member being read
        key: Option<String>,
    },
    Array(Vec<Value>),
}

impl Container {
    pub fn is_array(&self) -> bool {
        matches!(self, Container::Array(_))
    }

    /// Key of the object member being read
    pub fn current_key(&self) -> Option<&str> {
        match self {
            Container::Object { key, .. } => key.as_deref(),
            Container::Array(_) => None,
        }
    }

    /// Whether the object has `key`, counting the member being read
    pub fn has_key(&self, key: &str) -> bool {
        match self {
            Container::Object { members, .. } => {
                self.current_key() == Some(key) || members.contains_key(key)
            }
            Container::Array(_) => false,
        }
    }
}

/// How a stream of values ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamEnd {
    /// Last line read, or the line of the error
    pub line: u64,
    /// Syntax error that stopped the stream before the end of input
    pub error: Option<String>,
    /// Description of the invalid UTF-8 on the line of the error, if that caused it
    pub invalid_utf8: Option<String>,
    /// Key of the `properties` member being read when the error occurred
    pub attribute: Option<String>,
}

/// Read every top-level value of `source`, whose first byte is on line `first_line`
///
/// `on_object` receives each completed object, its enclosing containers (outermost
/// first, so the last one is the direct parent) and the line of its closing brace. It
/// returns whether it consumed the object. Objects completed before a syntax error have
/// already been handed over when the error is reported in the returned [`StreamEnd`].
/// An error from `on_object` stops reading and is returned as is.
pub fn stream_objects<F>(source: &[u8], first_line: u64, on_object: F) -> crate::Result<StreamEnd>
where
    F: FnMut(&Value, &[Container], u64) -> crate::Result<bool>,
{
    let line = Cell::new(first_line);
    let mut de = Deserializer::from_reader(LineCounter {
        bytes: source,
        line: &line,
    });
    de.disable_recursion_limit();

    let mut walker = Walker {
        on_object,
        stack: Vec::new(),
        line: &line,
        aborted: None,
    };

    loop {
        if de.end().is_ok() {
            return Ok(StreamEnd {
                line: line.get(),
                ..StreamEnd::default()
            });
        }

        walker.stack.clear();
        let result = Node { walker: &mut walker }.deserialize(serde_stacker::Deserializer::new(&mut de));
        if let Some(err) = walker.aborted.take() {
            return Err(err);
        }
        if let Err(err) = result {
            return Ok(StreamEnd {
                line: first_line + (err.line() as u64).saturating_sub(1),
                error: Some(err.to_string()),
                invalid_utf8: nth_line(source, err.line()).and_then(check_utf8),
                attribute: attribute_key(&walker.stack),
            });
        }
    }
}

/// Attribute whose value was being read, from the containers open at an error
fn attribute_key(stack: &[Container]) -> Option<String> {
    stack.windows(2).find_map(|pair| match pair {
        [parent, properties] if parent.current_key() == Some("properties") && !properties.is_array() => {
            properties.current_key().map(str::to_string)
        }
        _ => None,
    })
}

/// Byte source that keeps count of the newlines read through it
struct LineCounter<'a> {
    bytes: &'a [u8],
    line: &'a Cell<u64>,
}

impl Read for LineCounter<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.bytes.read(buf)?;
        self.line.set(self.line.get() + count_lines(&buf[..n]));
        Ok(n)
    }
}

struct Walker<'l, F> {
    on_object: F,
    stack: Vec<Container>,
    line: &'l Cell<u64>,
    /// Error returned by `on_object`, which ends the stream
    aborted: Option<crate::IngestError>,
}

impl<F> Walker<'_, F>
where
    F: FnMut(&Value, &[Container], u64) -> crate::Result<bool>,
{
    fn complete<E: de::Error>(&mut self, members: Map<String, Value>) -> Result<Option<Value>, E> {
        let object = Value::Object(members);
        match (self.on_object)(&object, &self.stack, self.line.get()) {
            Ok(true) => Ok(None),
            Ok(false) => Ok(Some(object)),
            Err(err) => {
                self.aborted = Some(err);
                Err(E::custom("reading stopped"))
            }
        }
    }
}

/// One value of the input, `None` once consumed
struct Node<'w, 'l, F> {
    walker: &'w mut Walker<'l, F>,
}

impl<'de, F> DeserializeSeed<'de> for Node<'_, '_, F>
where
    F: FnMut(&Value, &[Container], u64) -> crate::Result<bool>,
{
    type Value = Option<Value>;

    fn deserialize<D: de::Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de, F> Visitor<'de> for Node<'_, '_, F>
where
    F: FnMut(&Value, &[Container], u64) -> crate::Result<bool>,
{
    type Value = Option<Value>;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("any JSON value")
    }

    fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E> {
        Ok(Some(Value::Bool(v)))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
        Ok(Some(Value::from(v)))
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
        Ok(Some(Value::from(v)))
    }

    fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E> {
        Ok(Some(Number::from_f64(v).map_or(Value::Null, Value::Number)))
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> {
        Ok(Some(Value::String(v.to_owned())))
    }

    fn visit_string<E>(self, v: String) -> Result<Self::Value, E> {
        Ok(Some(Value::String(v)))
    }

    fn visit_unit<E>(self) -> Result<Self::Value, E> {
        Ok(Some(Value::Null))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let walker = self.walker;
        walker.stack.push(Container::Array(Vec::new()));

        while let Some(item) = seq.next_element_seed(Node { walker: &mut *walker })? {
            if let (Some(item), Some(Container::Array(items))) = (item, walker.stack.last_mut()) {
                items.push(item);
            }
        }

        match walker.stack.pop() {
            Some(Container::Array(items)) => Ok(Some(Value::Array(items))),
            _ => Ok(None),
        }
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let walker = self.walker;
        let Some(first) = map.next_key::<String>()? else {
            return walker.complete(Map::new());
        };
        if first == NUMBER_TOKEN {
            let text: String = map.next_value()?;
            let number = Number::from_str(&text).map_err(de::Error::custom)?;
            return Ok(Some(Value::Number(number)));
        }

        walker.stack.push(Container::Object {
            members: Map::new(),
            key: Some(first),
        });
        loop {
            let member = map.next_value_seed(Node { walker: &mut *walker })?;
            if let Some(Container::Object { members, key }) = walker.stack.last_mut()
                && let (Some(key), Some(member)) = (key.take(), member)
            {
                members.insert(key, member);
            }

            let Some(next) = map.next_key::<String>()? else {
                break;
            };
            if let Some(Container::Object { key, .. }) = walker.stack.last_mut() {
                *key = Some(next);
            }
        }

        match walker.stack.pop() {
            Some(Container::Object { members, .. }) => walker.complete(members),
            _ => Ok(None),
        }
    }
}

/// The 1-based `line` of `bytes`, without its newline
fn nth_line(bytes: &[u8], line: usize) -> Option<&[u8]> {
    bytes.split(|&b| b == b'\n').nth(line.checked_sub(1)?)
}

fn count_lines(bytes: &[u8]) -> u64 {
    bytes.iter().filter(|&&b| b == b'\n').count() as u64
}

/// Part of an input buffer processed by one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSpan {
    pub range: Range<usize>,
    /// Line number of the first byte of the span
    pub first_line: u64,
}

/// Split line-delimited input into at most `count` spans that end at newlines
///
/// Only valid for input where no JSON value spans a line break.
pub fn split_segments(input: &[u8], count: usize) -> Vec<InputSpan> {
    let count = count.max(1);
    let mut spans = Vec::with_capacity(count);
    let mut start = 0;
    let mut first_line = 1;

    for i in 1..=count {
        if start >= input.len() {
            break;
        }

        let mut end = if i == count {
            input.len()
        } else {
            (input.len() * i / count).max(start)
        };
        if end < input.len() {
            end = input[end..]
                .iter()
                .position(|&b| b == b'\n')
                .map_or(input.len(), |p| end + p + 1);
        }

        spans.push(InputSpan {
            range: start..end,
            first_line,
        });
        first_line += count_lines(&input[start..end]);
        start = end;
    }

    spans
}
