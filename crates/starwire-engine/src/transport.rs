/*!
 * Newline-delimited JSON transport.
 *
 * Each record travels as one JSON object on one line. Lines that do not
 * decode are logged and dropped; the stream carries on with the next line.
 */
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use starwire_devices::protocol::{self, Message};

use crate::error::{Error, Result};
use crate::reactor::Reactor;

/// Reads records from a line stream
#[derive(Debug)]
pub struct LineReader<R> {
    lines: Lines<BufReader<R>>,
    dropped: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Wrap a byte stream
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            dropped: 0,
        }
    }

    /// Next valid record, or `None` at end of stream
    pub async fn next_message(&mut self) -> Result<Option<Message>> {
        while let Some(line) = self.lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match protocol::decode(&line) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => {
                    self.dropped += 1;
                    warn!("Dropping malformed record: {}", e);
                }
            }
        }
        Ok(None)
    }

    /// Number of malformed lines dropped so far
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

/// Writes records as lines
#[derive(Debug)]
pub struct LineWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    /// Wrap a byte sink
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one record and flush
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        let mut line = protocol::encode(message)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Give back the underlying sink
    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Forward decoded records from `reader` into `inbound` until the stream ends
/// or `cancel` fires
pub async fn pump_in<R: AsyncRead + Unpin>(
    reader: R,
    inbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut reader = LineReader::new(reader);
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = reader.next_message() => next?,
        };
        match next {
            Some(message) => {
                if inbound.send(message).await.is_err() {
                    debug!("Reactor gone, stopping input");
                    break;
                }
            }
            None => {
                info!("Input closed");
                break;
            }
        }
    }
    Ok(())
}

/// Write every record from `outbound` to `writer` until the channel closes
pub async fn pump_out<W: AsyncWrite + Unpin>(mut outbound: mpsc::Receiver<Message>, writer: W) -> Result<()> {
    let mut writer = LineWriter::new(writer);
    while let Some(message) = outbound.recv().await {
        writer.send(&message).await?;
    }
    Ok(())
}

/// Run `reactor` over a byte stream pair
///
/// `outbound` must be the receiving end of the channel the reactor was
/// created with. Returns when the input ends or the reactor stops.
pub async fn serve<R, W>(reactor: Reactor, outbound: mpsc::Receiver<Message>, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (inbound_tx, inbound_rx) = mpsc::channel(256);
    let cancel = reactor.shutdown_token();

    let input = tokio::spawn(pump_in(reader, inbound_tx, cancel.clone()));
    let output = tokio::spawn(pump_out(outbound, writer));

    let result = reactor.run(inbound_rx).await;
    cancel.cancel();

    match input.await {
        Ok(Err(e)) => warn!("Input failed: {}", e),
        Err(e) => warn!("Input task failed: {}", e),
        Ok(Ok(())) => {}
    }
    output
        .await
        .map_err(|e| Error::transport(format!("output task failed: {}", e)))??;
    result
}

/// Run `reactor` over standard input and output, the usual driver setup
pub async fn serve_stdio(reactor: Reactor, outbound: mpsc::Receiver<Message>) -> Result<()> {
    serve(reactor, outbound, tokio::io::stdin(), tokio::io::stdout()).await
}
