//! Pipeline driver: envelope, then the declared stream decoder.
//!
//! The envelope names the stream format once, so the decoder is a tagged
//! variant chosen up front rather than a trait object; the inner packet
//! loops run without dynamic dispatch.

use super::envelope::{read_envelope, StreamFormat};
use super::ps::PsDecoder;
use super::ts::TsDecoder;
use super::DecodeOptions;
use crate::error::{Result, TivoError};
use bytes::Bytes;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// The stream decoder selected by the envelope flags.
enum StreamDecoder<R, W> {
    /// MPEG Program Stream path
    Program(PsDecoder<R, W>),
    /// MPEG Transport Stream path
    Transport(TsDecoder<R, W>),
}

impl<R: AsyncRead + Unpin + Send, W: AsyncWrite + Unpin + Send> StreamDecoder<R, W> {
    async fn process(&mut self) -> Result<()> {
        match self {
            StreamDecoder::Program(decoder) => decoder.process().await,
            StreamDecoder::Transport(decoder) => decoder.process().await,
        }
    }
}

/// Consumes `input` fully, writing the decrypted MPEG stream to `output`.
///
/// The outer envelope is read and validated first; the remaining bytes are
/// handed to the Program Stream or Transport Stream decoder the envelope
/// declares. Blocks until the input is exhausted.
pub async fn decode<R, W>(mut input: R, output: W, mak: &str, options: DecodeOptions) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let envelope = read_envelope(&mut input, mak).await?;
    debug!(
        "envelope: {:?}, {} chunks, mpeg offset {:#x}",
        envelope.format(),
        envelope.chunks.len(),
        envelope.header.mpeg_offset
    );

    let mpeg_offset = envelope.header.mpeg_offset as u64;
    if mpeg_offset < envelope.consumed {
        return Err(TivoError::Envelope(format!(
            "mpeg offset {:#x} lies inside the chunk table",
            mpeg_offset
        )));
    }
    if !skip_bytes(&mut input, mpeg_offset - envelope.consumed).await? {
        warn!("input ended before the declared mpeg offset");
        return Ok(());
    }

    let mut decoder = match envelope.format() {
        StreamFormat::Program => {
            StreamDecoder::Program(PsDecoder::new(input, output, &envelope.media_key))
        }
        StreamFormat::Transport => StreamDecoder::Transport(TsDecoder::new(
            input,
            output,
            &envelope.media_key,
            options.compatibility_mode,
        )),
    };
    decoder.process().await
}

/// Runs envelope processing only and returns the decrypted metadata chunk
/// payloads in file order. The MPEG payload is not touched.
pub async fn decode_metadata<R>(mut input: R, mak: &str) -> Result<Vec<Bytes>>
where
    R: AsyncRead + Unpin + Send,
{
    let envelope = read_envelope(&mut input, mak).await?;
    Ok(envelope.chunks.into_iter().map(|chunk| chunk.data).collect())
}

/// Discards `count` bytes from the reader. Returns false if the input
/// ended first.
async fn skip_bytes<R: AsyncRead + Unpin>(reader: &mut R, mut count: u64) -> Result<bool> {
    let mut scratch = [0u8; 4096];
    while count > 0 {
        let want = scratch.len().min(count as usize);
        let n = reader.read(&mut scratch[..want]).await?;
        if n == 0 {
            return Ok(false);
        }
        count -= n as u64;
    }
    Ok(true)
}
