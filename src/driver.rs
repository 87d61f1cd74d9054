//! Runs a session over a transport: one read loop, one write loop and the
//! keepalive timer, all on the current task. Use from a `LocalSet` or a
//! current-thread runtime; the session is not `Send`.

use crate::session::SessionHandle;
use crate::transport::{TransportRead, TransportWrite};
use crate::types::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Drives `session` until it has drained and flushed what it could.
/// Returns the error the session closed with, if any.
pub async fn run<T>(session: SessionHandle, transport: T) -> Result<(), Error>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, writer) = tokio::io::split(transport);
    run_split(session, reader, writer).await
}

pub async fn run_split<R, W>(session: SessionHandle, reader: R, writer: W) -> Result<(), Error>
where
    R: TransportRead,
    W: TransportWrite,
{
    tokio::join!(
        read_loop(&session, reader),
        write_loop(&session, writer),
        keepalive_loop(&session),
    );

    match session.error_on_close() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn read_loop<R: TransportRead>(session: &SessionHandle, mut reader: R) {
    let (buffer_size, yield_after_bytes, yield_after_duration, mut closed) = {
        let inner = session.session();
        let config = inner.config();
        (
            config.read_buffer_size.max(1),
            config.yield_after_bytes_read,
            config.yield_after_duration,
            inner.closed_signal(),
        )
    };
    let mut buf = vec![0u8; buffer_size];
    let mut bytes_since_yield = 0usize;
    let mut slice_start = Instant::now();

    loop {
        if *closed.borrow() {
            break;
        }
        let result = tokio::select! {
            result = TransportRead::read(&mut reader, &mut buf) => result,
            _ = closed.wait_for(|closed| *closed) => break,
        };

        {
            let mut inner = session.inner().borrow_mut();
            match result {
                Ok(0) => {
                    inner.on_read_eof();
                    break;
                }
                Ok(n) => {
                    trace!(endpoint = %inner.endpoint(), bytes = n, "read");
                    inner.on_bytes_read(&buf[..n]);
                    bytes_since_yield += n;
                }
                Err(err) => {
                    inner.on_read_error(err);
                    break;
                }
            }
        }

        // Bounded read cycles: give other tasks a turn on a chatty session.
        if bytes_since_yield > yield_after_bytes || slice_start.elapsed() > yield_after_duration {
            tokio::task::yield_now().await;
            bytes_since_yield = 0;
            slice_start = Instant::now();
        }
    }
    debug!(endpoint = %session.session().endpoint(), "read loop finished");
}

async fn write_loop<W: TransportWrite>(session: &SessionHandle, mut writer: W) {
    let (notify, mut closed) = {
        let inner = session.session();
        (inner.write_notify(), inner.closed_signal())
    };

    loop {
        let next = session.inner().borrow_mut().produce_write();
        match next {
            Some(buffer) => {
                let result = TransportWrite::write(&mut writer, &buffer).await;
                let failed = result.is_err();
                session.inner().borrow_mut().on_write_complete(result);
                if failed {
                    break;
                }
            }
            None => {
                if session.session().is_finished() {
                    break;
                }
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = closed.wait_for(|closed| *closed) => {}
                }
            }
        }
    }

    let _ = TransportWrite::shutdown(&mut writer).await;
    debug!(endpoint = %session.session().endpoint(), "write loop finished");
}

async fn keepalive_loop(session: &SessionHandle) {
    let (notify, mut closed) = {
        let inner = session.session();
        (inner.keepalive_notify(), inner.closed_signal())
    };

    loop {
        if *closed.borrow() {
            break;
        }
        let deadline = session.session().next_keepalive_deadline();
        match deadline {
            Some(deadline) => tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    session.inner().borrow_mut().on_keepalive_timer();
                }
                _ = notify.notified() => {}
                _ = closed.wait_for(|closed| *closed) => break,
            },
            None => tokio::select! {
                _ = notify.notified() => {}
                _ = closed.wait_for(|closed| *closed) => break,
            },
        }
    }
}
