use defmt::*;
use embassy_net::tcp::{self, TcpSocket};
use embassy_net::Stack;
use embassy_time::Duration;
use embedded_io_async::Write;
use heapless::String;

use psfb_controller::api_server::{format_sse, route_request, submit_commands, Route};
use psfb_controller::app_state::JSON_BUF_LEN;
use psfb_controller::event_bits::EVT_STATE_CHANGED;
use psfb_controller::stm32_board::{SseChannel, SSE_MAX_CLIENTS};

use crate::{COMMANDS, EVENT_BITS};

/// One command connection next to the event stream clients
pub const HTTP_WORKERS: usize = SSE_MAX_CLIENTS + 1;
const HTTP_PORT: u16 = 80;
const REQUEST_MAX: usize = 512;
/// Event and data field names around the payload
const SSE_FRAME_LEN: usize = JSON_BUF_LEN + 64;

const RESPONSE_OK: &[u8] = b"HTTP/1.0 200 OK\r\n\
Content-Type: text/plain\r\n\
Access-Control-Allow-Origin: *\r\n\r\nOK\n";
const RESPONSE_EVENTS: &[u8] = b"HTTP/1.0 200 OK\r\n\
Content-Type: text/event-stream\r\n\
Cache-Control: no-cache\r\n\
Access-Control-Allow-Origin: *\r\n\r\n";
const RESPONSE_NOT_FOUND: &[u8] = b"HTTP/1.0 404 Not Found\r\n\r\n";
const RESPONSE_BAD_REQUEST: &[u8] = b"HTTP/1.0 400 Bad Request\r\n\r\n";
const RESPONSE_BUSY: &[u8] = b"HTTP/1.0 503 Service Unavailable\r\n\r\n";

#[derive(Debug, Format)]
enum HttpError {
    Tcp(tcp::Error),
    Closed,
    BadRequest,
    Frame,
}

impl From<tcp::Error> for HttpError {
    fn from(e: tcp::Error) -> Self {
        HttpError::Tcp(e)
    }
}

#[embassy_executor::task(pool_size = HTTP_WORKERS)]
pub async fn http_task(stack: Stack<'static>, events: &'static SseChannel) {
    let mut rx_buf = [0u8; 512];
    let mut tx_buf = [0u8; 2048];
    let mut request = [0u8; REQUEST_MAX];
    loop {
        let mut socket = TcpSocket::new(stack, &mut rx_buf, &mut tx_buf);
        if let Err(e) = socket.accept(HTTP_PORT).await {
            warn!("HTTP: accept failed: {:?}", e);
            continue;
        }
        socket.set_timeout(Some(Duration::from_secs(10)));
        match serve(&mut socket, &mut request, events).await {
            Ok(()) => {}
            Err(HttpError::BadRequest) => {
                let _ = socket.write_all(RESPONSE_BAD_REQUEST).await;
            }
            Err(e) => debug!("HTTP: connection closed: {:?}", e),
        }
        socket.close();
        let _ = socket.flush().await;
    }
}

async fn serve(
    socket: &mut TcpSocket<'_>,
    buf: &mut [u8],
    events: &'static SseChannel,
) -> Result<(), HttpError> {
    let len = read_request_line(socket, buf).await?;
    let line = core::str::from_utf8(&buf[..len]).map_err(|_| HttpError::BadRequest)?;
    match route_request(line) {
        Route::Command(query) => {
            let queued = submit_commands(query, &COMMANDS, &EVENT_BITS).await;
            debug!("HTTP: {} commands queued", queued);
            socket.write_all(RESPONSE_OK).await?;
        }
        Route::Events => {
            let Ok(mut subscriber) = events.subscriber() else {
                warn!("HTTP: event stream clients exhausted");
                socket.write_all(RESPONSE_BUSY).await?;
                return Ok(());
            };
            socket.write_all(RESPONSE_EVENTS).await?;
            socket.flush().await?;
            // The client starts with a full snapshot
            EVENT_BITS.raise(EVT_STATE_CHANGED);
            // Idle streams stay open, heartbeats arrive every slow tick
            socket.set_timeout(None);
            let mut frame: String<SSE_FRAME_LEN> = String::new();
            loop {
                let msg = subscriber.next_message_pure().await;
                format_sse(&mut frame, msg.event, &msg.data).map_err(|_| HttpError::Frame)?;
                socket.write_all(frame.as_bytes()).await?;
                socket.flush().await?;
            }
        }
        Route::NotFound => socket.write_all(RESPONSE_NOT_FOUND).await?,
    }
    Ok(())
}

/// Reads until the end of the first request line and returns its length.
async fn read_request_line(socket: &mut TcpSocket<'_>, buf: &mut [u8]) -> Result<usize, HttpError> {
    let mut len = 0;
    loop {
        if let Some(end) = buf[..len].windows(2).position(|w| w == b"\r\n") {
            return Ok(end);
        }
        if len == buf.len() {
            return Err(HttpError::BadRequest);
        }
        let n = socket.read(&mut buf[len..]).await?;
        if n == 0 {
            return Err(HttpError::Closed);
        }
        len += n;
    }
}
