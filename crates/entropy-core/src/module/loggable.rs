// # Loggable Capability
//
// Optional module capability: stream logs of a resource as a lazy
// sequence of `{data, labels}` chunks. Dropping the stream cancels it.

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_stream::Stream;

use super::ModuleContext;
use crate::error::Result;
use crate::resource::Resource;

/// One unit of streamed log output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogChunk {
    pub data: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl LogChunk {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Label selector; a chunk matches when every pair is present on it
pub type LogFilter = BTreeMap<String, String>;

/// Stream of log chunks; an `Err` item terminates the stream
pub type LogStream = Pin<Box<dyn Stream<Item = Result<LogChunk>> + Send + 'static>>;

/// Trait for modules that can stream logs
#[async_trait]
pub trait Loggable: Send + Sync {
    /// Open a log stream for `resource`
    ///
    /// Must not block until logs are produced; the stream yields them
    /// lazily and stops when dropped.
    async fn log(
        &self,
        ctx: &ModuleContext,
        resource: &Resource,
        filter: &LogFilter,
    ) -> Result<LogStream>;
}

/// Whether `chunk` carries every label pair in `filter`
pub fn matches_filter(chunk: &LogChunk, filter: &LogFilter) -> bool {
    filter
        .iter()
        .all(|(k, v)| chunk.labels.get(k).is_some_and(|actual| actual == v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    fn chunk(data: &str, level: &str) -> LogChunk {
        LogChunk::new(data).with_label("level", level)
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(matches_filter(&chunk("a", "info"), &LogFilter::new()));
        assert!(matches_filter(&LogChunk::new("unlabelled"), &LogFilter::new()));
    }

    #[test]
    fn test_filter_needs_every_label() {
        let mut filter = LogFilter::new();
        filter.insert("level".into(), "warn".into());
        assert!(matches_filter(&chunk("a", "warn"), &filter));
        assert!(!matches_filter(&chunk("a", "info"), &filter));

        filter.insert("pod".into(), "web-0".into());
        assert!(!matches_filter(&chunk("a", "warn"), &filter));
        assert!(matches_filter(&chunk("a", "warn").with_label("pod", "web-0"), &filter));
    }

    #[test]
    fn test_stream_stops_at_first_error() {
        let items: Vec<Result<LogChunk>> = vec![
            Ok(chunk("one", "info")),
            Err(crate::error::Error::internal("source went away")),
            Ok(chunk("two", "info")),
        ];
        let stream: LogStream = Box::pin(tokio_stream::iter(items));

        let seen = tokio_test::block_on(async {
            let mut stream = stream;
            let mut seen = Vec::new();
            while let Some(Ok(chunk)) = stream.next().await {
                seen.push(chunk.data);
            }
            seen
        });
        assert_eq!(seen, vec!["one".to_string()]);
    }
}
