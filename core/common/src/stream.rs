//! Constructors for [`ByteStream`].

use futures::{stream, StreamExt};
use std::path::Path;
use tokio_util::io::ReaderStream;

use crate::hash::ByteStream;
use crate::{Error, Result};

/// Stream a file from disk in reader-sized chunks.
///
/// # Errors
/// - File cannot be opened
pub async fn file_stream(path: impl AsRef<Path>) -> Result<ByteStream> {
    let file = tokio::fs::File::open(path.as_ref()).await?;
    let stream = ReaderStream::new(file).map(|chunk| chunk.map(|b| b.to_vec()).map_err(Error::from));
    Ok(Box::pin(stream))
}

/// Stream an in-memory buffer as one chunk.
pub fn bytes_stream(data: Vec<u8>) -> ByteStream {
    Box::pin(stream::once(async move { Ok(data) }))
}

/// Drain a stream into memory.
pub async fn collect(mut stream: ByteStream) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    while let Some(chunk) = stream.next().await {
        data.extend_from_slice(&chunk?);
    }
    Ok(data)
}
