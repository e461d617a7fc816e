// Editor-facing debug controller for luax: a line-delimited JSON
// request/response channel plus an event channel, served over standard
// streams or TCP. The VM runs on its own thread; this crate only talks
// to the shared DebugHub.

pub mod protocol;
pub mod session;
pub mod transport;

pub use session::{DebugSession, SessionConfig};
pub use transport::Transport;

use std::io;

/// Serve one debug session over the given transport. Returns when the
/// client disconnects or sends `terminate`.
pub fn serve(transport: Transport, config: SessionConfig) -> io::Result<()> {
    let channel = transport.open()?;
    let (mut reader, out, writer) = channel.split();
    let session = DebugSession::new(out.clone(), config);
    session.apply_cli_breakpoints();

    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "transport read failed");
                break;
            }
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match protocol::parse_request(trimmed) {
            Ok(request) => {
                let (response, quit) = session.handle(&request);
                if let Some(response) = response {
                    let _ = out.send(response);
                }
                if quit {
                    break;
                }
            }
            Err(message) => {
                let _ = out.send(protocol::response_err(
                    &None,
                    protocol::INVALID_PARAMS,
                    &message,
                ));
            }
        }
    }
    session.shutdown();
    drop(out);
    writer.join();
    Ok(())
}
