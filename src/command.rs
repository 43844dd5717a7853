//! Line-framed command parsing and dispatch.
//!
//! Consumes complete LF-terminated commands out of a connection's
//! `in_buf`, drives the `SequenceFactory`, and appends formatted
//! responses to `out_buf`. Partial trailing input (no LF yet) is left
//! buffered for the next read.

use crate::connection::ConnectionState;

/// Drains every complete command currently buffered in `conn.in_buf`.
pub fn process(conn: &mut ConnectionState) {
    while let Some(lf) = conn.in_buf.iter().position(|&b| b == b'\n') {
        let line = conn.in_buf.split_to(lf + 1);
        // LF excluded; a preceding CR (if the client sent CRLF) is
        // retained as part of the command text.
        let cmd = &line[..lf];
        dispatch(conn, cmd);
    }
}

fn dispatch(conn: &mut ConnectionState, cmd: &[u8]) {
    if cmd.starts_with(b"seq") {
        let text = String::from_utf8_lossy(cmd);
        match conn.factory.create(&text) {
            Ok(()) => conn.out_buf.extend_from_slice(b"OK\r\n"),
            Err(err) => {
                conn.out_buf.extend_from_slice(b"ERR: ");
                conn.out_buf.extend_from_slice(err.to_string().as_bytes());
                conn.out_buf.extend_from_slice(b"\r\n");
            }
        }
    } else if cmd.starts_with(b"export seq") {
        let row = conn.factory.row();
        conn.out_buf.extend_from_slice(row.as_bytes());
        conn.out_buf.extend_from_slice(b"\r\n");
        conn.export_seq = true;
    } else {
        conn.out_buf.extend_from_slice(b"ERR: Unknown command\r\n");
    }
    conn.ready_write = true;
}
