use std::fmt;
use std::path::Path;

use bytes::Bytes;
use skiff_proto::{ControlFrame, TransferHeader};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use super::{DataChannel, FlowConfig, TransportError};

/// A file queued for sending: header metadata plus a byte source that must
/// yield exactly `size` bytes.
pub struct OutgoingFile {
    pub name: String,
    pub mime: String,
    pub size: u64,
    reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl OutgoingFile {
    pub fn new(
        name: impl Into<String>,
        mime: impl Into<String>,
        size: u64,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            mime: mime.into(),
            size,
            reader: Box::new(reader),
        }
    }

    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        let name = name.into();
        let bytes = bytes.into();
        let mime = guess_mime(&name);
        let size = bytes.len() as u64;
        Self::new(name, mime, size, std::io::Cursor::new(bytes))
    }

    pub async fn from_path(path: &Path) -> Result<Self, TransportError> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let mime = guess_mime(&name);
        Ok(Self::new(name, mime, size, file))
    }

    pub fn header(&self) -> TransferHeader {
        TransferHeader {
            name: self.name.clone(),
            size: self.size,
            mime: self.mime.clone(),
        }
    }
}

impl fmt::Debug for OutgoingFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingFile")
            .field("name", &self.name)
            .field("mime", &self.mime)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Best-effort MIME type from a file extension.
pub fn guess_mime(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

/// Stream `file` over `channel`: one header text frame, then binary chunks of
/// at most `flow.chunk_size` bytes. Before every chunk the sender checks the
/// channel's buffered amount and, at or above the high-water mark, suspends
/// until the low-buffer signal fires. Returns once the channel has flushed
/// every buffered byte, with the number of payload bytes sent, which always
/// equals `file.size` on success.
pub async fn send_file(
    channel: &dyn DataChannel,
    mut file: OutgoingFile,
    flow: &FlowConfig,
) -> Result<u64, TransportError> {
    let flow = flow.normalized();
    if !channel.is_open() {
        return Err(TransportError::ChannelClosed);
    }
    channel.set_low_threshold(flow.low_water_mark).await;

    let header = ControlFrame::Header(file.header()).encode()?;
    channel.send_text(header).await?;
    debug!(
        target = "skiff::transport::sender",
        name = %file.name,
        size = file.size,
        chunk = flow.chunk_size,
        "transfer started"
    );

    let mut offset: u64 = 0;
    let mut chunks: u64 = 0;
    while offset < file.size {
        loop {
            let buffered = channel.buffered_amount().await;
            if buffered < flow.high_water_mark || buffered <= flow.low_water_mark {
                break;
            }
            trace!(
                target = "skiff::transport::sender",
                buffered,
                high = flow.high_water_mark,
                "buffer full; waiting for low signal"
            );
            channel.wait_buffered_low().await?;
        }

        let want = (file.size - offset).min(flow.chunk_size as u64) as usize;
        let chunk = read_chunk(&mut file.reader, want).await?;
        if chunk.len() < want {
            return Err(TransportError::ShortRead {
                expected: file.size,
                read: offset + chunk.len() as u64,
            });
        }
        channel.send_binary(chunk).await?;
        offset += want as u64;
        chunks += 1;
        trace!(
            target = "skiff::transport::sender",
            offset,
            size = file.size,
            "chunk sent"
        );
    }

    flush(channel).await?;
    debug!(
        target = "skiff::transport::sender",
        name = %file.name,
        bytes = offset,
        chunks,
        "transfer finished"
    );
    Ok(offset)
}

/// Suspend until the channel buffers nothing. Closing a peer connection
/// discards whatever is still buffered, so a transfer is only done once this
/// returns.
pub async fn flush(channel: &dyn DataChannel) -> Result<(), TransportError> {
    channel.set_low_threshold(0).await;
    loop {
        if !channel.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        let buffered = channel.buffered_amount().await;
        if buffered == 0 {
            return Ok(());
        }
        trace!(
            target = "skiff::transport::sender",
            buffered,
            "waiting for channel to flush"
        );
        channel.wait_buffered_low().await?;
    }
}

/// Read up to `want` bytes, stopping early only at end of input.
async fn read_chunk<R>(reader: &mut R, want: usize) -> Result<Bytes, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; want];
    let mut filled = 0;
    while filled < want {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(Bytes::from(buf))
}
