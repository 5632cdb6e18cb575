//! Server-sent event decoding for streamed REST responses.

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;

use super::restful::ClientError;

/// Pull `data:` payloads out of an event-stream body, stopping at `[DONE]`.
/// An event shaped `{"error": ...}` ends the stream with that error.
pub(crate) fn decode_events<T, S, B, E>(body: S) -> BoxStream<'static, Result<T, ClientError>>
where
    T: DeserializeOwned + Send + 'static,
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let events = async_stream::try_stream! {
        // Bytes, not text: a chunk may end inside a multi-byte character.
        let mut buffer: Vec<u8> = Vec::new();
        futures::pin_mut!(body);

        while let Some(chunk_result) = body.next().await {
            let chunk = chunk_result
                .map_err(|e| ClientError::Runtime(format!("stream read error: {}", e)))?;
            buffer.extend_from_slice(chunk.as_ref());

            while let Some(newline_pos) = buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = buffer.drain(..=newline_pos).collect();
                let line = std::str::from_utf8(&raw)
                    .map_err(|e| ClientError::Runtime(format!("stream event is not UTF-8: {}", e)))?
                    .trim();

                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    return;
                }

                let value: serde_json::Value = serde_json::from_str(data)
                    .map_err(|e| ClientError::Runtime(format!("malformed stream event: {}", e)))?;
                if let Some(err) = value.get("error") {
                    Err::<(), _>(ClientError::from_error_body(err))?;
                }
                let item: T = serde_json::from_value(value)
                    .map_err(|e| ClientError::Runtime(format!("unexpected stream event: {}", e)))?;
                yield item;
            }
        }
    };
    events.boxed()
}
