// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Buffered outputs that receive chunks as typed events instead of raw bytes.

use std::{borrow::Cow, io, sync::Arc};

use outflow_core::{
    ArrayEventStream, Chunk, ChunkWriter, ConfigContext, ConfigError, EmitError, EventStream,
    EventTime, PluginConfig, Record, SharedEventStream, WriteError,
};

use crate::{BufferedOutput, BufferedPlugin};

/// A sink that consumes chunks as event streams.
pub trait ObjectPlugin: Send + Sync + 'static {
    /// The registered type name.
    fn plugin_type(&self) -> &str;

    /// Read plugin-specific parameters.
    fn configure(
        &mut self,
        _conf: &PluginConfig,
        _ctx: &ConfigContext,
    ) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Called before the flush workers start.
    fn start(&self) -> io::Result<()> {
        Ok(())
    }

    /// Called after the flush workers have stopped.
    fn shutdown(&self) {}

    /// Write the events of one chunk. `tag` is the tag every event in the chunk was emitted
    /// with.
    fn write_objects(&self, tag: &str, events: &ChunkEventView<'_>) -> Result<(), WriteError>;
}

/// Adapts an [`ObjectPlugin`] to [`BufferedPlugin`]: streams are buffered per tag in their
/// JSON-lines serialization and handed back as [`ChunkEventView`]s.
#[derive(Debug, Default)]
pub struct ObjectFormat<P>(P);

impl<P> ObjectFormat<P> {
    /// Wrap a plugin.
    pub fn new(plugin: P) -> Self {
        Self(plugin)
    }

    /// The wrapped plugin.
    pub fn get_ref(&self) -> &P {
        &self.0
    }
}

/// A [`BufferedOutput`] that hands its sink typed events.
pub type ObjectBufferedOutput<P> = BufferedOutput<ObjectFormat<P>>;

impl<P: ObjectPlugin> ObjectBufferedOutput<P> {
    /// Wrap an object plugin.
    pub fn object(plugin: P) -> Self {
        BufferedOutput::new(ObjectFormat::new(plugin))
    }
}

impl<P: ObjectPlugin> ChunkWriter for ObjectFormat<P> {
    fn write(&self, chunk: &dyn Chunk) -> Result<(), WriteError> {
        let view = ChunkEventView::new(chunk)?;
        self.0.write_objects(chunk.key(), &view)
    }
}

impl<P: ObjectPlugin> BufferedPlugin for ObjectFormat<P> {
    fn plugin_type(&self) -> &str {
        self.0.plugin_type()
    }

    fn configure(&mut self, conf: &PluginConfig, ctx: &ConfigContext) -> Result<(), ConfigError> {
        self.0.configure(conf, ctx)
    }

    fn start(&self) -> io::Result<()> {
        self.0.start()
    }

    fn shutdown(&self) {
        self.0.shutdown()
    }

    fn format(
        &self,
        _tag: &str,
        time: EventTime,
        record: &Record,
        out: &mut Vec<u8>,
    ) -> Result<(), EmitError> {
        serde_json::to_writer(&mut *out, &(time, record)).map_err(EmitError::format)?;
        out.push(b'\n');
        Ok(())
    }

    fn format_stream(
        &self,
        _tag: &str,
        stream: &dyn EventStream,
        out: &mut Vec<u8>,
    ) -> Result<(), EmitError> {
        out.extend(stream.to_json_stream().map_err(EmitError::format)?);
        Ok(())
    }

    fn buffer_key<'a>(&self, tag: &'a str) -> &'a str {
        tag
    }
}

/// The events of a buffered chunk.
///
/// The chunk is validated once when the view is created; iteration parses lazily and can be
/// repeated. [`EventStream::to_json_stream`] returns the chunk bytes unchanged.
#[derive(Debug, Clone, Copy)]
pub struct ChunkEventView<'a> {
    key: &'a str,
    data: &'a [u8],
    len: usize,
}

impl<'a> ChunkEventView<'a> {
    /// Validate a chunk written by [`ObjectFormat`].
    pub fn new(chunk: &'a dyn Chunk) -> Result<Self, WriteError> {
        Self::from_parts(chunk.key(), chunk.data())
    }

    /// Validate JSON-lines `[time, record]` data.
    pub fn from_parts(key: &'a str, data: &'a [u8]) -> Result<Self, WriteError> {
        let mut len = 0;
        for event in parse(data) {
            event?;
            len += 1;
        }
        Ok(Self { key, data, len })
    }

    /// The buffer key of the chunk, which is the tag of its events.
    pub fn key(&self) -> &'a str {
        self.key
    }

    /// Iterate over the events.
    pub fn iter(&self) -> impl Iterator<Item = (EventTime, Record)> + 'a {
        parse(self.data).filter_map(Result::ok)
    }

    /// Share the events as an owned stream, e.g. to route them elsewhere.
    pub fn to_shared(&self) -> SharedEventStream {
        Arc::new(self.iter().collect::<ArrayEventStream>())
    }
}

fn parse(data: &[u8]) -> impl Iterator<Item = Result<(EventTime, Record), serde_json::Error>> + '_ {
    serde_json::Deserializer::from_slice(data).into_iter::<(EventTime, Record)>()
}

impl EventStream for ChunkEventView<'_> {
    fn events(&self) -> Box<dyn Iterator<Item = (EventTime, Cow<'_, Record>)> + '_> {
        Box::new(self.iter().map(|(time, record)| (time, Cow::Owned(record))))
    }

    fn len(&self) -> usize {
        self.len
    }

    fn dup(&self) -> SharedEventStream {
        self.to_shared()
    }

    fn to_json_stream(&self) -> Result<Vec<u8>, serde_json::Error> {
        Ok(self.data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use outflow_core::record;
    use serde_json::json;

    use super::*;

    #[test]
    fn view_parses_json_lines() {
        let stream = ArrayEventStream::new(vec![
            (1, record(json!({"a": 1}))),
            (2, record(json!({"b": [1, 2]}))),
        ]);
        let data = stream.to_json_stream().unwrap();
        let view = ChunkEventView::from_parts("app", &data).unwrap();
        assert_eq!(view.key(), "app");
        assert_eq!(EventStream::len(&view), 2);
        let events: Vec<_> = view.iter().collect();
        assert_eq!(events, stream.events().map(|(t, r)| (t, r.into_owned())).collect::<Vec<_>>());
        // repeatable
        assert_eq!(view.iter().count(), 2);
        assert_eq!(view.to_json_stream().unwrap(), data);
        assert_eq!(view.dup().len(), 2);
    }

    #[test]
    fn view_rejects_garbage() {
        let err = ChunkEventView::from_parts("app", b"[1,{}]\nnot json\n").unwrap_err();
        assert!(err.error_class().contains("serde_json"), "{}", err.error_class());
    }
}
