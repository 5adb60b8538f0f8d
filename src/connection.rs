use crate::protocol::{Decoded, FrameError, Operation, Response, WavinCodec};
use futures::FutureExt as _;
use futures::{SinkExt as _, StreamExt as _};
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, trace};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open {1:?} for reading and writing")]
    OpenDevice(#[source] std::io::Error, PathBuf),
    #[error("could not send out the request")]
    Send(#[source] std::io::Error),
    #[error("could not read data from the serial link")]
    Receive(#[source] std::io::Error),
    #[error("no response within {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("response frame failed validation")]
    Frame(#[source] FrameError),
    #[error("response does not answer the request ({0})")]
    ResponseMismatch(&'static str),
    #[error("the serial link was closed")]
    LinkClosed,
}

impl Error {
    /// Transient bus conditions worth another attempt within the same tick.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Frame(_) | Error::ResponseMismatch(_),
        )
    }
}

/// Connection parameters shared by every command that talks to the bus.
#[derive(clap::Parser, Clone)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Path to the serial device node wired to the controller.
    #[arg(long, short = 'd')]
    pub device: PathBuf,

    /// If a complete, valid response isn't received in this amount of time,
    /// consider the request failed.
    ///
    /// Partial frames keep accumulating until the deadline; the bus is slow
    /// and responses regularly arrive in more than one read.
    #[arg(long, default_value = "1s")]
    pub receive_timeout: humantime::Duration,

    /// How many additional attempts a transient failure (timeout, corrupt
    /// frame) is worth before the operation is given up for this cycle.
    #[arg(long, default_value_t = 2)]
    pub retries: u8,
}

/// Combined read/write/send bound for the boxed serial link. A trait object
/// cannot list two non-auto traits directly, so a subtrait stands in.
pub trait SerialIo: AsyncRead + AsyncWrite + Send {}
impl<T: AsyncRead + AsyncWrite + Send + ?Sized> SerialIo for T {}

pub type SerialLink = Pin<Box<dyn SerialIo>>;

/// The sole owner of the physical link.
///
/// The bus is half-duplex with at most one request in flight; `execute`
/// takes `&mut self` so the single-outstanding-transaction invariant is the
/// borrow checker's problem rather than a runtime discipline.
pub struct Connection {
    io: Framed<SerialLink, WavinCodec>,
    receive_timeout: Duration,
    retries: u8,
}

impl Connection {
    pub async fn open(args: &Args) -> Result<Connection, Error> {
        let device = tokio::fs::File::options()
            .read(true)
            .write(true)
            .create(false)
            .open(&args.device)
            .await
            .map_err(|e| Error::OpenDevice(e, args.device.clone()))?;
        Ok(Self::from_link(Box::pin(device), *args.receive_timeout, args.retries))
    }

    pub fn from_link(link: SerialLink, receive_timeout: Duration, retries: u8) -> Connection {
        Connection {
            io: Framed::new(link, WavinCodec {}),
            receive_timeout,
            retries,
        }
    }

    /// Execute one operation: send the frame, wait for a complete
    /// checksum-valid response or the deadline.
    pub async fn execute(&mut self, operation: &Operation) -> Result<Response, Error> {
        // A response that arrives after its deadline would otherwise be
        // attributed to the next request.
        while let Some(stale) = self.io.next().now_or_never().flatten() {
            let stale = stale.map_err(Error::Receive)?;
            debug!(message = "discarding a frame from an abandoned exchange", frame = ?stale);
        }
        trace!(message = "executing", ?operation);
        self.io.send(operation).await.map_err(Error::Send)?;
        let deadline = tokio::time::sleep(self.receive_timeout);
        let mut deadline = std::pin::pin!(deadline);
        loop {
            tokio::select! {
                frame = self.io.next() => match frame {
                    None => return Err(Error::LinkClosed),
                    Some(Err(e)) => return Err(Error::Receive(e)),
                    Some(Ok(Decoded::Corrupt(e))) => return Err(Error::Frame(e)),
                    Some(Ok(Decoded::Valid(response))) => {
                        return check_answers(operation, response);
                    }
                },
                _ = deadline.as_mut() => return Err(Error::Timeout(self.receive_timeout)),
            }
        }
    }

    /// [`Self::execute`] with the configured number of retries for transient
    /// failures. Never loops beyond the retry budget; the scheduler decides
    /// what happens to the operation after that.
    pub async fn execute_retrying(&mut self, operation: &Operation) -> Result<Response, Error> {
        let mut attempts_left = self.retries;
        loop {
            match self.execute(operation).await {
                Err(error) if error.is_retryable() && attempts_left > 0 => {
                    attempts_left -= 1;
                    debug!(
                        message = "retrying after a transient bus error",
                        error = &error as &dyn std::error::Error,
                        attempts_left,
                    );
                }
                other => return other,
            }
        }
    }
}

/// A checksum-valid frame can still answer a different question than the one
/// we asked; half-duplex buses echo surprises under load.
fn check_answers(operation: &Operation, response: Response) -> Result<Response, Error> {
    match (operation, &response) {
        (Operation::ReadRegisters { count, .. }, Response::Registers(values)) => {
            if values.len() != usize::from(*count) {
                return Err(Error::ResponseMismatch("register count differs"));
            }
        }
        (Operation::ReadRegisters { .. }, Response::WriteAck { .. }) => {
            return Err(Error::ResponseMismatch("write acknowledgement for a read"));
        }
        (operation, Response::WriteAck { function_code }) => {
            if *function_code != operation.function_code() {
                return Err(Error::ResponseMismatch("acknowledgement for a different write"));
            }
        }
        (_, Response::Registers(_)) => {
            return Err(Error::ResponseMismatch("register payload for a write"));
        }
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{crc16, DEVICE_ADDRESS, FC_READ, FC_WRITE};
    use crate::registers::Category;
    use tokio::io::AsyncReadExt as _;
    use tokio::io::AsyncWriteExt as _;

    fn test_connection(retries: u8) -> (Connection, tokio::io::DuplexStream) {
        let (engine_side, device_side) = tokio::io::duplex(256);
        let connection =
            Connection::from_link(Box::pin(engine_side), Duration::from_millis(100), retries);
        (connection, device_side)
    }

    fn read_response(words: &[u16]) -> Vec<u8> {
        let payload: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
        let mut frame = vec![DEVICE_ADDRESS, FC_READ, payload.len() as u8];
        frame.extend_from_slice(&payload);
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    fn write_ack() -> Vec<u8> {
        let mut frame = vec![DEVICE_ADDRESS, FC_WRITE, 0];
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    const READ_TWO: Operation = Operation::ReadRegisters {
        category: Category::Packed,
        page: 0,
        index: 0,
        count: 2,
    };

    #[tokio::test(start_paused = true)]
    async fn one_exchange_round_trips() {
        let (mut connection, mut device) = test_connection(0);
        let exchange = tokio::spawn(async move {
            let mut request = vec![0u8; 8];
            device.read_exact(&mut request).await.unwrap();
            assert_eq!(&request[..6], &[DEVICE_ADDRESS, FC_READ, 0x02, 0, 0, 2]);
            device.write_all(&read_response(&[215, 180])).await.unwrap();
            device
        });
        let response = connection.execute(&READ_TWO).await.unwrap();
        assert_eq!(response, Response::Registers(vec![215, 180]));
        exchange.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn responses_accumulate_across_partial_reads() {
        let (mut connection, mut device) = test_connection(0);
        let exchange = tokio::spawn(async move {
            let mut request = vec![0u8; 8];
            device.read_exact(&mut request).await.unwrap();
            let frame = read_response(&[215, 180]);
            for byte in frame {
                device.write_all(&[byte]).await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            device
        });
        let response = connection.execute(&READ_TWO).await.unwrap();
        assert_eq!(response, Response::Registers(vec![215, 180]));
        exchange.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out() {
        let (mut connection, _device) = test_connection(0);
        let error = connection.execute(&READ_TWO).await.unwrap_err();
        assert!(matches!(error, Error::Timeout(_)));
        assert!(error.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_response_is_a_retryable_error() {
        let (mut connection, mut device) = test_connection(0);
        let exchange = tokio::spawn(async move {
            let mut request = vec![0u8; 8];
            device.read_exact(&mut request).await.unwrap();
            let mut frame = read_response(&[215, 180]);
            *frame.last_mut().unwrap() ^= 0xFF;
            device.write_all(&frame).await.unwrap();
            device
        });
        let error = connection.execute(&READ_TWO).await.unwrap_err();
        assert!(matches!(error, Error::Frame(FrameError::ChecksumMismatch { .. })));
        assert!(error.is_retryable());
        exchange.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retrying_recovers_from_one_bad_frame() {
        let (mut connection, mut device) = test_connection(2);
        let exchange = tokio::spawn(async move {
            let mut request = vec![0u8; 8];
            device.read_exact(&mut request).await.unwrap();
            let mut bad = read_response(&[215, 180]);
            *bad.last_mut().unwrap() ^= 0xFF;
            device.write_all(&bad).await.unwrap();
            device.read_exact(&mut request).await.unwrap();
            device.write_all(&read_response(&[215, 180])).await.unwrap();
            device
        });
        let response = connection.execute_retrying(&READ_TWO).await.unwrap();
        assert_eq!(response, Response::Registers(vec![215, 180]));
        exchange.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_answers_are_rejected() {
        let (mut connection, mut device) = test_connection(0);
        let exchange = tokio::spawn(async move {
            let mut request = vec![0u8; 8];
            device.read_exact(&mut request).await.unwrap();
            device.write_all(&write_ack()).await.unwrap();
            device
        });
        let error = connection.execute(&READ_TWO).await.unwrap_err();
        assert!(matches!(error, Error::ResponseMismatch(_)));
        exchange.await.unwrap();
    }
}
