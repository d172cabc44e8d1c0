//! S3-compatible object streaming.
//!
//! The range header is forwarded untouched; the store resolves it and its
//! response decides the status and window reported in the stream header.
//! Only the wait for the response header is bounded by the timeout.

use crate::config::S3Config;
use crate::error::{AppError, Result};
use crate::stream::{StreamHeader, write_framed, write_header_only};
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region, retry::RetryConfig},
    error::{DisplayErrorContext, SdkError},
    operation::get_object::{GetObjectError, GetObjectOutput},
    primitives::ByteStream,
};
use std::time::Duration;
use tokio::io::AsyncWrite;

/// Build an S3 client from validated configuration.
pub fn build_client(config: &S3Config) -> Result<Client> {
    let credentials = config.credentials()?;
    let credentials = Credentials::new(
        credentials.access_key,
        credentials.secret_key,
        None,
        None,
        "ebook-bridge-config",
    );

    let mut builder = aws_sdk_s3::Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .credentials_provider(credentials)
        .region(Region::new(config.region.clone()))
        .retry_config(RetryConfig::standard().with_max_attempts(config.max_attempts.max(1)))
        // Path-style addressing works with MinIO, Backblaze and friends.
        .force_path_style(true);
    if let Some(endpoint) = &config.endpoint {
        builder = builder.endpoint_url(endpoint);
    }

    Ok(Client::from_conf(builder.build()))
}

/// An opened object: its header and, unless unsatisfiable, its body.
pub struct RemoteObject {
    /// Header to emit before the body.
    pub header: StreamHeader,
    /// Body bytes; `None` when the store answered 416.
    pub body: Option<ByteStream>,
}

/// Streams objects out of one bucket.
#[derive(Debug, Clone)]
pub struct S3Streamer {
    client: Client,
    bucket: String,
    timeout: Duration,
}

impl S3Streamer {
    /// Create a streamer; missing bucket or credentials is a configuration error.
    pub fn from_config(config: &S3Config) -> Result<Self> {
        let bucket = config.credentials()?.bucket;
        Ok(Self {
            client: build_client(config)?,
            bucket,
            timeout: config.timeout(),
        })
    }

    /// Override the header timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Issue the signed GET and wait (bounded) for the response header.
    pub async fn open(&self, key: &str, range: Option<&str>) -> Result<RemoteObject> {
        let mut request = self.client.get_object().bucket(&self.bucket).key(key);
        if let Some(range) = range {
            request = request.range(range);
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| {
                tracing::warn!(key = %key, timeout = ?self.timeout, "S3 request timed out");
                AppError::Timeout(self.timeout)
            })?;

        match response {
            Ok(output) => {
                let header = header_from_output(&output)?;
                Ok(RemoteObject {
                    header,
                    body: Some(output.body),
                })
            }
            Err(err) => self.classify(key, err),
        }
    }

    /// Write the header line and the object body to `out`.
    pub async fn stream_to<W>(
        &self,
        key: &str,
        range: Option<&str>,
        out: &mut W,
    ) -> Result<StreamHeader>
    where
        W: AsyncWrite + Unpin,
    {
        let RemoteObject { header, body } = self.open(key, range).await?;

        match body {
            Some(body) => {
                let sent = write_framed(&header, body.into_async_read(), out).await?;
                tracing::debug!(key = %key, status = header.status, bytes = sent, "Streamed object");
            }
            None => write_header_only(&header, out).await?,
        }

        Ok(header)
    }

    fn classify(&self, key: &str, err: SdkError<GetObjectError>) -> Result<RemoteObject> {
        match &err {
            SdkError::TimeoutError(_) => Err(AppError::Timeout(self.timeout)),
            SdkError::ServiceError(service) => {
                let status = service.raw().status().as_u16();
                if service.err().is_no_such_key() || status == 404 {
                    return Err(AppError::NotFound(format!("Object not found: {}", key)));
                }
                if status == 416 {
                    let content_range = service
                        .raw()
                        .headers()
                        .get("content-range")
                        .map(String::from);
                    return Ok(RemoteObject {
                        header: StreamHeader {
                            content_type: "application/octet-stream".to_string(),
                            content_length: 0,
                            status: 416,
                            range_start: None,
                            range_end: None,
                            content_range,
                            accept_ranges: Some("bytes".to_string()),
                        },
                        body: None,
                    });
                }
                Err(AppError::StreamFailed(format!(
                    "S3 returned {}: {}",
                    status,
                    DisplayErrorContext(&err)
                )))
            }
            _ => Err(AppError::StreamFailed(
                DisplayErrorContext(&err).to_string(),
            )),
        }
    }
}

fn header_from_output(output: &GetObjectOutput) -> Result<StreamHeader> {
    let content_length = output
        .content_length()
        .and_then(|len| u64::try_from(len).ok())
        .ok_or_else(|| AppError::HeaderParse("response has no Content-Length".to_string()))?;

    let (status, range_start, range_end) = match output.content_range() {
        Some(value) => {
            let (start, end) = parse_content_range(value)
                .ok_or_else(|| AppError::HeaderParse(format!("Content-Range: {}", value)))?;
            (206, Some(start), Some(end))
        }
        None => (200, None, None),
    };

    Ok(StreamHeader {
        content_type: output
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string(),
        content_length,
        status,
        range_start,
        range_end,
        content_range: output.content_range().map(String::from),
        accept_ranges: Some(output.accept_ranges().unwrap_or("bytes").to_string()),
    })
}

/// Parse `bytes <start>-<end>/<total|*>`.
fn parse_content_range(value: &str) -> Option<(u64, u64)> {
    let spec = value.trim().strip_prefix("bytes ")?;
    let (window, _total) = spec.split_once('/')?;
    let (start, end) = window.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = end.trim().parse().ok()?;
    (start <= end).then_some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_config(endpoint: String) -> S3Config {
        S3Config {
            bucket: Some("books".to_string()),
            access_key: Some("key".to_string()),
            secret_key: Some("secret".to_string()),
            endpoint: Some(endpoint),
            max_attempts: 1,
            ..S3Config::default()
        }
    }

    /// Serve one canned HTTP response and return the endpoint URL.
    async fn answer_once(response: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn split_frame(out: &[u8]) -> (StreamHeader, &[u8]) {
        let newline = out.iter().position(|b| *b == b'\n').unwrap();
        let header = serde_json::from_slice(&out[..newline]).unwrap();
        (header, &out[newline + 1..])
    }

    #[tokio::test]
    async fn partial_response_is_framed_with_store_window() {
        let endpoint = answer_once(
            "HTTP/1.1 206 Partial Content\r\n\
             Content-Type: application/pdf\r\n\
             Content-Length: 4\r\n\
             Content-Range: bytes 2-5/10\r\n\
             Accept-Ranges: bytes\r\n\
             Connection: close\r\n\r\n\
             cdef"
                .to_string(),
        )
        .await;
        let streamer = S3Streamer::from_config(&test_config(endpoint)).unwrap();

        let mut out = Vec::new();
        let header = streamer
            .stream_to("book.pdf", Some("bytes=2-5"), &mut out)
            .await
            .unwrap();

        assert_eq!(header.status, 206);
        assert_eq!(header.content_length, 4);
        assert_eq!((header.range_start, header.range_end), (Some(2), Some(5)));
        assert_eq!(header.content_range.as_deref(), Some("bytes 2-5/10"));
        assert_eq!(header.content_type, "application/pdf");

        let (written, body) = split_frame(&out);
        assert_eq!(written, header);
        assert_eq!(body, b"cdef");
    }

    #[tokio::test]
    async fn unsatisfiable_range_is_header_only() {
        let error = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                     <Error><Code>InvalidRange</Code>\
                     <Message>The requested range is not satisfiable</Message></Error>";
        let endpoint = answer_once(format!(
            "HTTP/1.1 416 Requested Range Not Satisfiable\r\n\
             Content-Type: application/xml\r\n\
             Content-Range: bytes */10\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n{}",
            error.len(),
            error
        ))
        .await;
        let streamer = S3Streamer::from_config(&test_config(endpoint)).unwrap();

        let mut out = Vec::new();
        let header = streamer
            .stream_to("book.pdf", Some("bytes=20-30"), &mut out)
            .await
            .unwrap();

        assert_eq!(header.status, 416);
        assert_eq!(header.content_length, 0);
        assert_eq!(header.content_range.as_deref(), Some("bytes */10"));

        let (written, body) = split_frame(&out);
        assert_eq!(written, header);
        assert!(body.is_empty());
    }

    #[test]
    fn content_range_parsing() {
        assert_eq!(parse_content_range("bytes 0-99/1000"), Some((0, 99)));
        assert_eq!(parse_content_range("bytes 500-699/*"), Some((500, 699)));
        assert_eq!(parse_content_range("bytes */1000"), None);
        assert_eq!(parse_content_range("bytes 9-1/10"), None);
        assert_eq!(parse_content_range("items 0-1/2"), None);
    }

    #[test]
    fn missing_credentials_fail_before_any_request() {
        let config = S3Config {
            bucket: Some("books".to_string()),
            ..S3Config::default()
        };
        let err = S3Streamer::from_config(&config).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[tokio::test]
    async fn silent_endpoint_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let holder = tokio::spawn(async move {
            // Accept and never answer.
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let streamer = S3Streamer::from_config(&test_config(format!("http://{}", addr)))
            .unwrap()
            .with_timeout(Duration::from_millis(300));

        let mut out = Vec::new();
        let err = streamer
            .stream_to("book.pdf", Some("bytes=0-9"), &mut out)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Timeout(_)), "got {err}");
        assert_eq!(err.status_code(), 504);
        assert!(out.is_empty());
        holder.abort();
    }

    #[tokio::test]
    async fn refused_connection_is_not_a_timeout() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let streamer = S3Streamer::from_config(&test_config(format!("http://{}", addr)))
            .unwrap()
            .with_timeout(Duration::from_secs(10));

        let mut out = Vec::new();
        let err = streamer.stream_to("book.pdf", None, &mut out).await.unwrap_err();

        assert!(matches!(err, AppError::StreamFailed(_)), "got {err}");
        assert_eq!(err.status_code(), 502);
        assert!(out.is_empty());
    }
}
