use std::io;
use bytes::Bytes;
use futures::{future, stream, Stream, StreamExt};
use uuid::Uuid;
use super::progress_stream::TransferStream;

pub const OCTET_STREAM: &str = "application/octet-stream";

/// Single-part `multipart/form-data` body whose length is known before the
/// first byte is sent.
///
/// Layout: `preamble | file bytes | epilogue`, where the preamble carries the
/// opening boundary and part headers.
pub struct MultipartEncoder<S> {
    boundary: String,
    preamble: Bytes,
    epilogue: Bytes,
    source_len: u64,
    source: TransferStream<S>,
}

impl<S> MultipartEncoder<S>
where
    S: Stream<Item = io::Result<Bytes>> + Send + Sync + 'static,
{
    /// `source_len` must be the exact number of bytes `source` yields.
    pub fn new(
        field_name: &str,
        file_name: &str,
        content_type: &str,
        source: TransferStream<S>,
        source_len: u64,
    ) -> Self {
        let boundary = format!("uplift-{}", Uuid::new_v4().simple());
        Self::with_boundary(boundary, field_name, file_name, content_type, source, source_len)
    }

    pub fn with_boundary(
        boundary: impl Into<String>,
        field_name: &str,
        file_name: &str,
        content_type: &str,
        source: TransferStream<S>,
        source_len: u64,
    ) -> Self {
        let boundary = boundary.into();
        let preamble = format!(
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
            boundary,
            escape_quoted(field_name),
            escape_quoted(file_name),
            content_type,
        );
        let epilogue = format!("\r\n--{}--\r\n", boundary);

        Self {
            boundary,
            preamble: Bytes::from(preamble),
            epilogue: Bytes::from(epilogue),
            source_len,
            source,
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Value for the request's `Content-Type` header.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Exact body length: header overhead + file size + closing boundary.
    pub fn content_length(&self) -> u64 {
        self.preamble.len() as u64 + self.source_len + self.epilogue.len() as u64
    }

    pub fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> + Send + Sync + 'static {
        let Self { preamble, epilogue, source, .. } = self;

        stream::once(future::ready(Ok(preamble)))
            .chain(source)
            .chain(stream::once(future::ready(Ok(epilogue))))
    }

    pub fn into_body(self) -> reqwest::Body {
        reqwest::Body::wrap_stream(self.into_stream())
    }
}

// 与浏览器一致：引号和换行做百分号编码
fn escape_quoted(value: &str) -> String {
    value
        .replace('"', "%22")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn source(data: &'static [u8]) -> TransferStream<impl Stream<Item = io::Result<Bytes>> + Send + Sync + 'static> {
        let chunks: Vec<io::Result<Bytes>> = data
            .chunks(4)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        TransferStream::new(stream::iter(chunks), Box::new(|_| {}))
    }

    async fn collect(encoder: MultipartEncoder<impl Stream<Item = io::Result<Bytes>> + Send + Sync + 'static>) -> Vec<u8> {
        encoder
            .into_stream()
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_body_layout() {
        let encoder = MultipartEncoder::with_boundary("XYZ", "file", "a.txt", OCTET_STREAM, source(b"hello world"), 11);
        assert_eq!(encoder.content_type(), "multipart/form-data; boundary=XYZ");

        let declared = encoder.content_length();
        let body = collect(encoder).await;

        let expected = "--XYZ\r\n\
            Content-Disposition: form-data; name=\"file\"; filename=\"a.txt\"\r\n\
            Content-Type: application/octet-stream\r\n\
            \r\n\
            hello world\r\n\
            --XYZ--\r\n";
        assert_eq!(String::from_utf8(body.clone()).unwrap(), expected);
        assert_eq!(declared, body.len() as u64);
    }

    #[tokio::test]
    async fn test_length_is_exact_for_empty_file() {
        let encoder = MultipartEncoder::new("file", "empty.bin", OCTET_STREAM, source(b""), 0);
        let declared = encoder.content_length();
        let body = collect(encoder).await;

        assert_eq!(declared, body.len() as u64);
    }

    #[tokio::test]
    async fn test_filename_is_escaped() {
        let encoder = MultipartEncoder::with_boundary("B", "file", "we\"ird\r\n.txt", OCTET_STREAM, source(b"x"), 1);
        let declared = encoder.content_length();
        let body = String::from_utf8(collect(encoder).await).unwrap();

        assert!(body.contains("filename=\"we%22ird%0D%0A.txt\""));
        assert_eq!(declared, body.len() as u64);
    }

    #[test]
    fn test_boundaries_are_unique() {
        let a = MultipartEncoder::new("file", "a", OCTET_STREAM, source(b""), 0);
        let b = MultipartEncoder::new("file", "a", OCTET_STREAM, source(b""), 0);
        assert_ne!(a.boundary(), b.boundary());
    }
}
