//! Shared HTTP plumbing for the network backends.

use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::time::Duration;

use super::{BackendError, ToolSpec};

/// Build a client with a connect timeout. Per-request timeouts are set on
/// each call.
pub(crate) fn build_client(connect_timeout: Duration) -> Result<reqwest::Client, BackendError> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| BackendError::NotConfigured(format!("HTTP client: {}", e)))
}

/// Map a transport error. Connection failures mean the backend is unreachable.
pub(crate) fn map_transport_error(error: reqwest::Error, timeout: Duration) -> BackendError {
    if error.is_timeout() {
        BackendError::Timeout(timeout)
    } else if error.is_connect() || error.is_request() {
        BackendError::Unavailable(error.to_string())
    } else {
        BackendError::generation(error.to_string())
    }
}

/// Map a non-success status to an error.
pub(crate) fn map_status(status: u16, retry_after: Option<Duration>, body: &str) -> BackendError {
    match status {
        429 => BackendError::RateLimited { retry_after },
        401 | 403 => BackendError::NotConfigured(format!("authentication failed ({})", status)),
        502..=504 => BackendError::Unavailable(format!("HTTP {}: {}", status, snippet(body))),
        _ => BackendError::generation(format!("HTTP {}: {}", status, snippet(body))),
    }
}

pub(crate) fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Function-tool definition in the shape both Ollama and OpenAI accept.
pub(crate) fn tool_definition(tool: &ToolSpec) -> serde_json::Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

/// Split a byte stream into trimmed, non-empty text lines.
///
/// A trailing line without a newline is emitted when the stream ends. The
/// first transport error ends the stream after being yielded.
pub(crate) fn lines<S, B, E>(bytes: S) -> BoxStream<'static, Result<String, BackendError>>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = (bytes.boxed(), Vec::<u8>::new(), false);
    stream::unfold(state, |(mut bytes, mut buf, mut finished)| async move {
        loop {
            if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line).trim().to_string();
                if text.is_empty() {
                    continue;
                }
                return Some((Ok(text), (bytes, buf, finished)));
            }

            if finished {
                let text = String::from_utf8_lossy(&buf).trim().to_string();
                buf.clear();
                if text.is_empty() {
                    return None;
                }
                return Some((Ok(text), (bytes, buf, finished)));
            }

            match bytes.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    buf.clear();
                    let error = BackendError::generation(format!("stream interrupted: {}", e));
                    return Some((Err(error), (bytes, buf, true)));
                }
                None => finished = true,
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn chunks(parts: &[&str]) -> Vec<Result<Vec<u8>, String>> {
        parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect()
    }

    #[tokio::test]
    async fn test_lines_across_chunk_boundaries() {
        let source = stream::iter(chunks(&["{\"a\":", "1}\n\n{\"b\"", ":2}\n", "tail"]));
        let collected: Vec<String> = lines(source).try_collect().await.unwrap();
        assert_eq!(collected, vec!["{\"a\":1}", "{\"b\":2}", "tail"]);
    }

    #[tokio::test]
    async fn test_lines_stop_after_error() {
        let source = stream::iter(vec![
            Ok(b"one\n".to_vec()),
            Err("reset by peer".to_string()),
            Ok(b"two\n".to_vec()),
        ]);
        let items: Vec<_> = lines(source).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Ok("one".to_string()));
        assert!(matches!(items[1], Err(BackendError::Generation { .. })));
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            map_status(429, Some(Duration::from_secs(2)), ""),
            BackendError::RateLimited { retry_after: Some(_) }
        ));
        assert!(matches!(map_status(401, None, ""), BackendError::NotConfigured(_)));
        assert!(matches!(map_status(503, None, ""), BackendError::Unavailable(_)));
        assert!(matches!(map_status(400, None, "bad"), BackendError::Generation { .. }));
    }
}
