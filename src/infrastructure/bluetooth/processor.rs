//! Payload processors
//!
//! The session hands every received value to a [`PayloadProcessor`] as raw
//! bytes. Device-specific decoding lives behind this trait.

use crate::domain::models::NotificationEvent;
use crate::infrastructure::bluetooth::protocol;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub trait PayloadProcessor: Send {
    fn process(&mut self, event: &NotificationEvent);
}

/// Decodes payloads as UTF-8 text and logs them
#[derive(Debug, Default)]
pub struct Utf8LogProcessor;

impl PayloadProcessor for Utf8LogProcessor {
    fn process(&mut self, event: &NotificationEvent) {
        let text = protocol::decode_text(&event.payload);
        debug!(
            characteristic = %event.characteristic_uuid,
            origin = ?event.origin,
            "Processing data: {}",
            text
        );
    }
}

/// Keeps decoded text lines, shared with whoever holds a clone
#[derive(Debug, Clone, Default)]
pub struct TextCollector {
    lines: Arc<Mutex<Vec<String>>>,
}

impl TextCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl PayloadProcessor for TextCollector {
    fn process(&mut self, event: &NotificationEvent) {
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(protocol::decode_text(&event.payload));
    }
}

impl<F> PayloadProcessor for F
where
    F: FnMut(&NotificationEvent) + Send,
{
    fn process(&mut self, event: &NotificationEvent) {
        self(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::DataOrigin;

    #[test]
    fn test_text_collector_shares_lines() {
        let collector = TextCollector::new();
        let mut processor: Box<dyn PayloadProcessor> = Box::new(collector.clone());

        processor.process(&NotificationEvent::new(
            protocol::TARGET_CHAR_UUID,
            b"23.5,60".to_vec(),
            DataOrigin::Notify,
        ));

        assert_eq!(collector.lines(), vec!["23.5,60".to_string()]);
    }

    #[test]
    fn test_closure_processor() {
        let mut total = 0usize;
        {
            let mut processor = |event: &NotificationEvent| total += event.payload.len();
            processor.process(&NotificationEvent::new(
                protocol::TARGET_CHAR_UUID,
                vec![1, 2, 3],
                DataOrigin::Read,
            ));
        }
        assert_eq!(total, 3);
    }
}
